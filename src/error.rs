//! Error types for the sync engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed direction/mode token or other caller input. Raised before any I/O.
    #[error("invalid {field}: {value}")]
    Validation { field: &'static str, value: String },

    /// Read, write or hash failure on a single file.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure outside the per-file loop that aborts the run.
    #[error("run aborted: {message}")]
    RunLevel { message: String },

    /// Snapshot document could not be read, decoded or written.
    #[error("snapshot persistence: {message}")]
    Persistence { message: String },

    /// Configuration file is unreadable or holds invalid values.
    #[error("config error: {message}")]
    Config { message: String },

    /// A delta violates the invariants required to apply it.
    #[error("invalid delta for {path}: {message}")]
    InvalidDelta { path: String, message: String },
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(field: &'static str, value: impl Into<String>) -> Self {
        SyncError::Validation {
            field,
            value: value.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        SyncError::Persistence {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config {
            message: message.into(),
        }
    }

    /// True for errors scoped to one file: the run records them and moves on.
    pub fn is_per_file(&self) -> bool {
        matches!(self, SyncError::Io { .. } | SyncError::InvalidDelta { .. })
    }
}

/// Extension for attaching a path to `std::io::Result`.
pub trait IoContext<T> {
    fn with_path(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| SyncError::io(path, e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message() {
        let err = SyncError::validation("direction", "sideways");
        assert_eq!(err.to_string(), "invalid direction: sideways");
        assert!(!err.is_per_file());
    }

    #[test]
    fn test_io_error_carries_path() {
        let err: Result<()> = Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            .with_path(std::path::Path::new("/tmp/x.bin"));
        let err = err.unwrap_err();
        assert!(err.is_per_file());
        assert!(err.to_string().contains("/tmp/x.bin"));
    }
}
