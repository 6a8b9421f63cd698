use crate::error::Error;
use crate::fs::{base_name, FileSystem};
use crate::scheme::{FolderScheme, GroupDict, LevelMatch, LevelPatterns};
use ahash::AHashSet;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Decides whether a directory entry is visited at all.
pub type EntryFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Folds the match of one level into the accumulator inherited from the
/// ancestor levels.
pub trait MatchCombiner {
    type Output: Clone;

    fn init(&self) -> Self::Output;

    fn combine(&self, previous: &Self::Output, level_match: &LevelMatch) -> Self::Output;
}

/// Keeps every level's match under its level name.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerLevel;

impl MatchCombiner for PerLevel {
    type Output = BTreeMap<String, LevelMatch>;

    fn init(&self) -> Self::Output {
        BTreeMap::new()
    }

    fn combine(&self, previous: &Self::Output, level_match: &LevelMatch) -> Self::Output {
        let mut next = previous.clone();
        next.insert(level_match.level.clone(), level_match.clone());
        next
    }
}

/// Flattens all named groups into one map. Deeper levels overwrite
/// same-named groups of shallower ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct Merged;

impl MatchCombiner for Merged {
    type Output = GroupDict;

    fn init(&self) -> Self::Output {
        GroupDict::new()
    }

    fn combine(&self, previous: &Self::Output, level_match: &LevelMatch) -> Self::Output {
        let mut next = previous.clone();
        next.extend(
            level_match
                .groups
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        next
    }
}

/// Level matches in scheme order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchList;

impl MatchCombiner for MatchList {
    type Output = Vec<LevelMatch>;

    fn init(&self) -> Self::Output {
        Vec::new()
    }

    fn combine(&self, previous: &Self::Output, level_match: &LevelMatch) -> Self::Output {
        let mut next = previous.clone();
        next.push(level_match.clone());
        next
    }
}

/// The default filter: directories whose name (or full path) is not in
/// `ignore_dirs`. Entries that cannot be inspected are logged and rejected.
pub fn dir_filter(fs: Arc<dyn FileSystem>, ignore_dirs: &[String]) -> EntryFilter {
    let ignored: AHashSet<String> = ignore_dirs.iter().cloned().collect();
    Arc::new(move |path: &Path| {
        if ignored.contains(&base_name(path)) || ignored.contains(&*path.to_string_lossy()) {
            trace!("Ignoring {}", path.display());
            return false;
        }
        match fs.is_dir(path) {
            Ok(is_dir) => is_dir,
            Err(err) => {
                warn!("Cannot inspect {}, skipping: {}", path.display(), err);
                false
            }
        }
    })
}

/// Walks a tree one scheme level at a time.
///
/// All patterns are checked when the matcher is created; the walk itself
/// only starts when the iterator returned by [`SchemeMatcher::matches`] is
/// advanced.
pub struct SchemeMatcher {
    fs: Arc<dyn FileSystem>,
    scheme: FolderScheme,
    patterns: LevelPatterns,
    filter: EntryFilter,
}

impl SchemeMatcher {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        scheme: &FolderScheme,
        patterns: &LevelPatterns,
        terminal_level: Option<&str>,
    ) -> Result<Self, Error> {
        let scheme = match terminal_level {
            Some(level) => scheme.up_to(level)?,
            None => scheme.clone(),
        };
        if scheme.is_empty() {
            return Err(Error::EmptyScheme);
        }
        patterns.require(&scheme)?;
        let filter = dir_filter(Arc::clone(&fs), &[]);
        Ok(Self {
            fs,
            scheme,
            patterns: patterns.clone(),
            filter,
        })
    }

    pub fn with_filter(mut self, filter: EntryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn scheme(&self) -> &FolderScheme {
        &self.scheme
    }

    /// Lazily yields `(path, accumulated match)` for every entry at the
    /// deepest scheme level, depth first.
    pub fn matches<C: MatchCombiner>(&self, base: &Path, combiner: C) -> SchemeMatches<'_, C> {
        debug!(
            "Matching {} with scheme {}",
            base.display(),
            self.scheme
        );
        let root = Frame {
            dir: base.to_path_buf(),
            depth: 0,
            acc: combiner.init(),
            entries: None,
        };
        SchemeMatches {
            matcher: self,
            combiner,
            stack: vec![root],
        }
    }

    pub fn merged(&self, base: &Path) -> SchemeMatches<'_, Merged> {
        self.matches(base, Merged)
    }

    fn list(&self, dir: &Path) -> Vec<String> {
        match self.fs.list_dir(dir) {
            Ok(names) => names,
            Err(err) => {
                warn!("Cannot list {}, skipping: {}", dir.display(), err);
                Vec::new()
            }
        }
    }
}

struct Frame<T> {
    dir: PathBuf,
    depth: usize,
    acc: T,
    entries: Option<std::vec::IntoIter<String>>,
}

/// Iterator over the terminal-level matches of one walk. Re-invoke
/// [`SchemeMatcher::matches`] to walk again.
pub struct SchemeMatches<'m, C: MatchCombiner> {
    matcher: &'m SchemeMatcher,
    combiner: C,
    stack: Vec<Frame<C::Output>>,
}

impl<C: MatchCombiner> Iterator for SchemeMatches<'_, C> {
    type Item = (PathBuf, C::Output);

    fn next(&mut self) -> Option<Self::Item> {
        let matcher = self.matcher;
        let levels = matcher.scheme.levels();
        loop {
            let frame = self.stack.last_mut()?;
            if frame.entries.is_none() {
                frame.entries = Some(matcher.list(&frame.dir).into_iter());
            }
            let Some(name) = frame.entries.as_mut().and_then(Iterator::next) else {
                self.stack.pop();
                continue;
            };

            let path = matcher.fs.join(&frame.dir, &name);
            if !(matcher.filter)(&path) {
                continue;
            }
            let level = &levels[frame.depth];
            let Some(level_match) = matcher.patterns.match_name(level, &name) else {
                trace!("'{}' does not match level '{}'", name, level);
                continue;
            };

            let acc = self.combiner.combine(&frame.acc, &level_match);
            let depth = frame.depth + 1;
            if depth == levels.len() {
                return Some((path, acc));
            }
            self.stack.push(Frame {
                dir: path,
                depth,
                acc,
                entries: None,
            });
        }
    }
}
