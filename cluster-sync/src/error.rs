use thiserror::Error;
use tokensync::directory::DirectoryError;
use tokensync::store::StoreError;
use tokensync::tokens::TokenError;

/// Outcome of a failed reconcile.
///
/// `Skip` is final: the input can never sync as it stands and retrying
/// would only repeat the same warning. `Retry` is requeued with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("skipped: {0}")]
    Skip(String),

    #[error("retrying: {0}")]
    Retry(String),
}

impl SyncError {
    pub fn is_retry(&self) -> bool {
        matches!(self, SyncError::Retry(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Retry(e.to_string())
    }
}

impl From<DirectoryError> for SyncError {
    fn from(e: DirectoryError) -> Self {
        SyncError::Retry(e.to_string())
    }
}

impl From<TokenError> for SyncError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Corrupt { .. } => SyncError::Skip(e.to_string()),
            other => SyncError::Retry(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Skip(format!("encoding shadow: {}", e))
    }
}
