use thiserror::Error;

use crate::ident::{ArtifactId, TransferCode};

/// Result type for relay operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Registry client failures, classified by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The artifact is not (or not yet) visible.
    #[error("artifact not found: {0}")]
    NotFound(ArtifactId),
    /// Network or consistency error, worth retrying.
    #[error("transient registry error: {0}")]
    Transient(String),
    /// Authentication, permission or conflict error, never retried.
    #[error("registry error: {0}")]
    Fatal(String),
}

impl RegistryError {
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
            RegistryError::Transient(err.to_string())
        } else {
            RegistryError::Fatal(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid transfer code: {0:?}")]
    InvalidCode(String),
    #[error("invalid artifact id: {0}")]
    InvalidArtifactId(String),
    #[error("too many chunks: index {0} does not fit the version scheme")]
    TooManyChunks(usize),
    #[error("transfer {0} not found")]
    NotFound(TransferCode),
    #[error("incomplete transfer: chunk {0} never resolved")]
    MissingChunk(usize),
    #[error("unexpected chunk index {0}")]
    InvalidChunkIndex(usize),
    #[error("incomplete manifest: {0}")]
    IncompleteManifest(String),
    #[error("chunk {index} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { index: usize, expected: String, actual: String },
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("file too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },
    #[error("no free transfer code after {0} draws")]
    CodeExhausted(usize),
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: RegistryError },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("transfer {code} abandoned after {retries} attempts")]
    Abandoned { code: TransferCode, retries: u32 },
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
