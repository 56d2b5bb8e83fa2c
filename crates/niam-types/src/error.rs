use thiserror::Error;

/// Rejections raised before anything reaches the remote store or the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("message too long ({len} characters, max {max})")]
    TooLong { len: usize, max: usize },
    #[error("disallowed character U+{0:04X} in message")]
    DisallowedCodePoint(u32),
    #[error("unknown room '{0}'")]
    UnknownRoom(String),
    #[error("unknown role '{0}'")]
    UnknownRole(String),
    #[error("malformed {entity} record: {reason}")]
    MalformedRecord { entity: &'static str, reason: String },
}

impl ValidationError {
    pub fn malformed(entity: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            entity,
            reason: reason.into(),
        }
    }
}

/// Failures reported by a [`crate::remote::RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network, timeout or storage failure on a single read or write.
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// The remote side refused the write.
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("no {entity} record with id {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}
