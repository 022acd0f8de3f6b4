//! Error types for the product store and the dataset synchronizer.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record '{code}': {reason}")]
    InvalidRecord { code: String, reason: String },

    #[error("Another import is already in progress")]
    ImportInProgress,
}

/// A single dataset line that could not be decoded. Absorbed and counted,
/// never propagated on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct RecordDecodeError {
    pub line: u64,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote version marker unreachable or malformed. Callers usually treat
    /// this as "no update available".
    #[error("Version check failed: {0}")]
    VersionCheckFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Dataset looks corrupt: {skipped} of {total} lines failed to decode")]
    CorruptDataset { skipped: u64, total: u64 },

    #[error("Store transaction failed after {committed} records: {source}")]
    StoreTransactionFailed {
        committed: u64,
        #[source]
        source: StoreError,
    },

    #[error("A sync is already running")]
    AlreadyRunning,

    #[error("Sync cancelled after {committed} records")]
    Cancelled { committed: u64 },
}

impl SyncError {
    /// Worth retrying later without operator intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionCheckFailed(_) | Self::DownloadFailed(_) | Self::AlreadyRunning
        )
    }
}
