use thiserror::Error;

use crate::snapshot::SnapshotError;

/// Failures while encoding or decoding the archive container.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("archive header is malformed: {0}")]
    Header(String),
    #[error("chunk {index} failed authentication")]
    Authentication { index: u32 },
    #[error("archive is truncated or has trailing data: {0}")]
    Framing(String),
    #[error("container is malformed: {0}")]
    Container(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of archive storage and the write pipeline.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive not found: {0}")]
    NotFound(String),
    #[error("invalid archive id `{0}`")]
    InvalidId(String),
    /// Raised before anything is written.
    #[error("insufficient space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("encryption failure: {0}")]
    EncryptionFailure(String),
    #[error("archive write cancelled")]
    Cancelled,
    #[error("manifest for {id} is unreadable: {reason}")]
    Manifest { id: String, reason: String },
    #[error("archive storage failure: {0}")]
    Storage(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Format(FormatError),
}

impl From<FormatError> for ArchiveError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Cancelled => ArchiveError::Cancelled,
            FormatError::Encrypt(reason) => ArchiveError::EncryptionFailure(reason),
            other => ArchiveError::Format(other),
        }
    }
}

pub(crate) fn storage_err<E: ToString>(err: E) -> ArchiveError {
    ArchiveError::Storage(err.to_string())
}
