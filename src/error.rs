use std::fmt;

use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("content rejected: {0}")]
    ContentRejected(Rejection),

    #[error("content too large: {actual} bytes exceeds limit of {limit} bytes")]
    TooLarge { actual: u64, limit: u64 },

    #[error(transparent)]
    Storage(#[from] StorageFailure),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("derivation {name} failed: {cause}")]
    Derivation { name: String, cause: String },

    #[error("integrity check failed: {0}")]
    Integrity(IntegrityError),

    #[error("{operation} timed out")]
    TimedOut { operation: String },

    #[error("{operation} is not supported by backend {backend}")]
    NotSupported { operation: String, backend: String },

    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("job dispatch failed: {0}")]
    Dispatch(#[source] anyhow::Error),
}

impl MediaError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn derivation(name: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::Derivation {
            name: name.into(),
            cause: cause.to_string(),
        }
    }

    pub fn repository(err: impl Into<anyhow::Error>) -> Self {
        Self::Repository(err.into())
    }
}

impl From<sqlx::Error> for MediaError {
    fn from(err: sqlx::Error) -> Self {
        Self::Repository(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The effective type is not in the collection's accepted list.
    NotAccepted { mime: String, collection: String },
    /// Sniffed content disagrees with the declared type.
    Mismatch { detected: String, declared: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAccepted { mime, collection } => {
                write!(f, "{} is not accepted by collection {}", mime, collection)
            }
            Self::Mismatch { detected, declared } => {
                write!(f, "detected {} but declared {}", detected, declared)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Put,
    Get,
    Delete,
    Exists,
    Url,
    PresignUpload,
}

impl StorageOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Delete => "delete",
            Self::Exists => "exists",
            Self::Url => "url",
            Self::PresignUpload => "presigned_upload_url",
        }
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("storage {operation} on backend {backend} failed: {cause}")]
pub struct StorageFailure {
    pub operation: StorageOp,
    pub backend: String,
    #[source]
    pub cause: anyhow::Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    MissingChecksum,
    Mismatch { expected: String, actual: String },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingChecksum => f.write_str("no checksum recorded"),
            Self::Mismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {}, got {}", expected, actual)
            }
        }
    }
}
