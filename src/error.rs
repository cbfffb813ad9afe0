//! Typed error taxonomy for the runtime.
//!
//! Each plane gets its own enum so callers pattern-match on what they can
//! actually act on, but every variant maps back to the single behavioral
//! taxonomy from the error-handling design (`ErrorKind`) so that frame
//! translation, RPC status translation, and metrics/log translation share one
//! source of truth instead of three parallel `match`es drifting apart.

use thiserror::Error;

/// Behavioral error taxonomy, independent of which plane raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Unauthenticated,
    Forbidden,
    RateLimited,
    Retryable,
    Fatal,
}

impl ErrorKind {
    /// Whether the client may retry with the same `client_message_id`.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sender is not an active member of the chat")]
    NotAMember,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("durable store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("event log publish failed: {0}")]
    Publish(#[from] crate::eventlog::EventLogError),
    #[error("ingest pipeline deadline exceeded")]
    DeadlineExceeded,
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::NotAMember => ErrorKind::Forbidden,
            IngestError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            IngestError::Store(_) | IngestError::Publish(_) | IngestError::DeadlineExceeded => {
                ErrorKind::Retryable
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("missing bearer credential")]
    Unauthenticated,
    #[error("token expired")]
    TokenExpired,
    #[error("token revoked")]
    Revoked,
    #[error("connection rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("registry unavailable")]
    ServiceUnavailable,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("content outside 1-4096 byte bound")]
    InvalidContent,
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Unauthenticated | ConnectionError::TokenExpired | ConnectionError::Revoked => {
                ErrorKind::Unauthenticated
            }
            ConnectionError::RateLimited { .. } => ErrorKind::RateLimited,
            ConnectionError::ServiceUnavailable => ErrorKind::Retryable,
            ConnectionError::MalformedFrame(_) | ConnectionError::InvalidContent => ErrorKind::InvalidArgument,
        }
    }

    /// Wire error code for the `error` frame (§6.1).
    pub fn wire_code(&self) -> &'static str {
        match self {
            ConnectionError::Unauthenticated => "unauthenticated",
            ConnectionError::TokenExpired => "token_expired",
            ConnectionError::Revoked => "revoked",
            ConnectionError::RateLimited { .. } => "rate_limited",
            ConnectionError::ServiceUnavailable => "service_unavailable",
            ConnectionError::MalformedFrame(_) => "invalid_argument",
            ConnectionError::InvalidContent => "invalid_argument",
        }
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("registry lookup failed: {0}")]
    Registry(#[from] crate::registry::RegistryError),
    #[error("durable store lookup failed: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("event schema unparseable: {0}")]
    PoisonEvent(String),
}

impl FanoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FanoutError::Registry(_) | FanoutError::Store(_) => ErrorKind::Retryable,
            FanoutError::PoisonEvent(_) => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("durable store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("invalid page size: {0}")]
    InvalidPageSize(u32),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Store(_) => ErrorKind::Retryable,
            SyncError::InvalidPageSize(_) => ErrorKind::InvalidArgument,
        }
    }
}
