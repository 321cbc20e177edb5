use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Source database unreadable at {path}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("Snapshot copy failed: {reason}")]
    CopyFailed { reason: String },

    #[error("Failed to write archive {path}: {reason}")]
    ArchiveWriteFailed { path: PathBuf, reason: String },

    #[error("Failed to read asset file {path}: {reason}")]
    AssetReadFailed { path: PathBuf, reason: String },

    #[error("Archive verification failed: {0}")]
    VerificationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackupError {
    pub fn source_unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        BackupError::SourceUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn copy_failed(reason: impl ToString) -> Self {
        BackupError::CopyFailed {
            reason: reason.to_string(),
        }
    }

    pub fn archive_write_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        BackupError::ArchiveWriteFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn asset_read_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        BackupError::AssetReadFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
