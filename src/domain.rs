//! Opaque, validated identifier types used at every API surface in this crate.
//!
//! Raw `String`/`i64` never cross a component boundary; construction either
//! succeeds or fails with [`DomainError`]. This mirrors nothing in the teacher
//! codebase directly (it passes bare `String`/`i64` throughout `models.rs`) —
//! it is the one place this core is stricter than its source material.

use std::fmt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("empty identifier")]
    Empty,
    #[error("identifier exceeds max length of {max}")]
    TooLong { max: usize },
    #[error("invalid uuid: {0}")]
    InvalidUuid(#[from] uuid::Error),
    #[error("content must be 1-4096 UTF-8 bytes, got {0}")]
    InvalidContentLength(usize),
}

macro_rules! opaque_string_id {
    ($name:ident, $max_len:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
                let raw = raw.into();
                if raw.is_empty() {
                    return Err(DomainError::Empty);
                }
                if raw.len() > $max_len {
                    return Err(DomainError::TooLong { max: $max_len });
                }
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_string_id!(ChatId, 128);
opaque_string_id!(UserId, 256);
opaque_string_id!(DeviceId, 128);
opaque_string_id!(SessionId, 128);
opaque_string_id!(ConnectionId, 64);
opaque_string_id!(GatewayId, 128);

/// Server-assigned identifier for a persisted [`crate::ingest::PersistedMessage`].
///
/// Opaque to the client; the reference codebase uses a `uuid`/`ulid` string
/// for this same role (`db.rs::create_message`'s `row_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        Ok(Self(Uuid::parse_str(raw)?))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied identifier for the *logical* message; the idempotency key.
/// Spec §6.1 requires a v4 UUID on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClientMessageId(Uuid);

impl ClientMessageId {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        Ok(Self(Uuid::parse_str(raw)?))
    }
}

impl fmt::Display for ClientMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-chat monotonic unsigned sequence number assigned by Ingest Step 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message body as it crosses the wire and is persisted. 1-4096 UTF-8 bytes per §6.1.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Content(String);

impl Content {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        let len = raw.len();
        if len == 0 || len > 4096 {
            return Err(DomainError::InvalidContentLength(len));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_chat_id() {
        assert!(matches!(ChatId::new(""), Err(DomainError::Empty)));
    }

    #[test]
    fn rejects_oversized_chat_id() {
        let long = "a".repeat(129);
        assert!(matches!(ChatId::new(long), Err(DomainError::TooLong { .. })));
    }

    #[test]
    fn content_bounds() {
        assert!(Content::new("").is_err());
        assert!(Content::new("hi").is_ok());
        assert!(Content::new("a".repeat(4096)).is_ok());
        assert!(Content::new("a".repeat(4097)).is_err());
    }

    #[test]
    fn sequence_next_is_monotonic() {
        let s = Sequence::ZERO;
        assert_eq!(s.next(), Sequence(1));
        assert_eq!(s.next().next(), Sequence(2));
    }

    #[test]
    fn client_message_id_roundtrips() {
        let raw = "550e8400-e29b-41d4-a716-446655440000";
        let id = ClientMessageId::parse(raw).unwrap();
        assert_eq!(id.to_string(), raw);
    }
}
