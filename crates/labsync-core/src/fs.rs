use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// The filesystem surface the matcher and the catalog need. A satellite
/// mounted as a local path uses [`LocalFs`]; other backends only have to
/// provide these calls.
pub trait FileSystem: Send + Sync {
    fn is_dir(&self, path: &Path) -> io::Result<bool>;

    /// Names of the entries in `path`.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    fn join(&self, base: &Path, name: &str) -> PathBuf {
        base.join(name)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Resolve `path` against the location root.
    fn real_path(&self, path: &Path) -> PathBuf;

    fn is_mounted(&self) -> bool;

    /// Try to mount the location. Returns `Ok(false)` when the backend has
    /// no way of doing so.
    fn mount(&self) -> io::Result<bool> {
        Ok(false)
    }
}

/// A location on the local disk (or anything mounted into it).
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
    mount_command: Option<Vec<String>>,
}

impl LocalFs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize_path(root.as_ref()),
            mount_command: None,
        }
    }

    pub fn with_mount_command(mut self, command: Option<Vec<String>>) -> Self {
        self.mount_command = command.filter(|argv| !argv.is_empty());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSystem for LocalFs {
    fn is_dir(&self, path: &Path) -> io::Result<bool> {
        fs::metadata(self.real_path(path)).map(|m| m.is_dir())
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let dir = self.real_path(path);
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            match entry {
                Ok(entry) => names.push(entry.file_name().to_string_lossy().into_owned()),
                Err(err) => warn!("Error reading entry in directory {}: {}", dir.display(), err),
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.real_path(from), self.real_path(to))
    }

    fn real_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&self.root.join(path))
        }
    }

    /// An empty root is taken as "not mounted"; there is no portable way to
    /// tell an empty mount point from an empty share.
    fn is_mounted(&self) -> bool {
        match fs::read_dir(&self.root) {
            Ok(mut entries) => entries.next().is_some(),
            Err(err) => {
                debug!("Cannot list {}: {}", self.root.display(), err);
                false
            }
        }
    }

    fn mount(&self) -> io::Result<bool> {
        let Some(argv) = &self.mount_command else {
            warn!("No mount command configured for {}", self.root.display());
            return Ok(false);
        };
        let status = Command::new(&argv[0]).args(&argv[1..]).status()?;
        info!("Mount command {:?} exited with {}", argv, status);
        Ok(status.success())
    }
}

/// Lexically normalize a path: drop `.` components, resolve `..` against
/// the preceding component and strip trailing separators.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Last path component as a string, empty when there is none.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
