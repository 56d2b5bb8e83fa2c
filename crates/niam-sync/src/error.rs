use thiserror::Error;
use uuid::Uuid;

use niam_types::error::{RemoteError, ValidationError};

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced to the caller of a user-initiated action.
///
/// Background failures are logged and retried instead; they never reach here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("not allowed: {0}")]
    Authorization(String),
    #[error("remote store error: {0}")]
    Remote(RemoteError),
    #[error("no visible message with id {0}")]
    NotFound(Uuid),
    #[error("engine is shut down")]
    Closed,
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Rejected(reason) => SyncError::Authorization(reason),
            other => SyncError::Remote(other),
        }
    }
}
