use std::path::PathBuf;
use thiserror::Error;

/// Errors the engine turns into status report items at its boundary.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed patch {path}, line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{0} is not valid UTF-8")]
    Encoding(PathBuf),

    #[error("destination {0} is locked by another process")]
    Locked(String),

    #[error("invalid write journal {path}: {message}")]
    Journal { path: PathBuf, message: String },
}

impl PatchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PatchError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;
