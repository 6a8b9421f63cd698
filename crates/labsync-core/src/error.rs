use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("No pattern configured for scheme level '{0}'")]
    MissingLevelPattern(String),

    #[error("Invalid pattern for scheme level '{level}': {source}")]
    InvalidPattern {
        level: String,
        #[source]
        source: regex::Error,
    },

    #[error("Folder scheme is empty")]
    EmptyScheme,

    #[error("Level '{level}' is not part of folder scheme '{scheme}'")]
    UnknownLevel { level: String, scheme: String },

    #[error("Invalid file exclude pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Location '{location}' has folder scheme '{scheme}' without a 'subentry' or 'experiment' level")]
    UnsupportedScheme { location: String, scheme: String },

    #[error("Unknown satellite location '{0}'")]
    UnknownLocation(String),

    #[error("Cannot rename '{}' to '{to}': parent directory does not match", .from.display())]
    RenameOutsideParent { from: PathBuf, to: String },

    #[error("'{}' is not present in the catalog", .0.display())]
    NotInCatalog(PathBuf),

    #[error("Renaming '{}' to '{}' failed: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Location '{0}' is not mounted")]
    NotMounted(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Configuration-class errors are detected before any traversal starts
    /// and are the only ones that abort a run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::MissingLevelPattern(_)
                | Error::InvalidPattern { .. }
                | Error::EmptyScheme
                | Error::UnknownLevel { .. }
                | Error::InvalidGlob { .. }
                | Error::UnsupportedScheme { .. }
                | Error::UnknownLocation(_)
        )
    }
}
