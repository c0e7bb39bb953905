use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("blank line")]
    Blank,

    #[error("line is not valid JSON: {0}")]
    Json(String),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("message record has no recognised role")]
    MissingRole,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("session file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read session file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReadError {
    pub fn from_io(path: &std::path::Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("sessions directory does not exist: {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to list sessions directory {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}
