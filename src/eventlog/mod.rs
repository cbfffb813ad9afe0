//! Event log adapter contract (spec §4.5, "Event log").
//!
//! Required properties: per-key ordered FIFO, durable-once-acknowledged
//! producer protocol, consumer-group offset management with explicit commit,
//! deterministic partitioning by producer-supplied key. The trait shape
//! mirrors the reference codebase's `fanout::MailboxBackend` adapter pattern
//! (a trait selected by a factory, not a concrete product type wired in
//! directly).

pub mod kafka;

use async_trait::async_trait;
use thiserror::Error;
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, ClientMessageId, MessageId, Sequence, UserId};

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("consumer error: {0}")]
    ConsumerError(String),
    #[error("event schema unparseable: {0}")]
    Unparseable(String),
}

/// §6.3 event envelope. Key = `chat_id`, so all events for a chat land on the
/// same partition and preserve order through the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePersisted {
    pub schema_version: u32,
    pub chat_id: ChatId,
    pub sequence: Sequence,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub server_timestamp: chrono::DateTime<chrono::Utc>,
    pub content: String,
}

impl MessagePersisted {
    pub const SCHEMA_VERSION: u32 = 1;
}

/// A consumed event plus the means to commit its offset once processing
/// completes. §4.3 step 3: offset commit follows processing regardless of
/// delivery success — it never depends on whether this handle is dropped
/// early, only on `commit` being called by the Fanout worker's loop body.
pub struct ConsumedEvent {
    pub payload: Result<MessagePersisted, EventLogError>,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Step 5 of Ingest: publish keyed by `chat_id`. A failure is retryable;
    /// the Message is already durably committed by the caller.
    async fn publish(&self, event: &MessagePersisted) -> Result<(), EventLogError>;

    /// Block until the next event is available for this consumer group.
    async fn poll(&self) -> Result<ConsumedEvent, EventLogError>;

    /// Commit the offset for a previously polled event.
    async fn commit(&self, partition: i32, offset: i64) -> Result<(), EventLogError>;

    /// Cheap liveness check for the health endpoint; default no-op.
    async fn ping(&self) -> Result<(), EventLogError> {
        Ok(())
    }
}

/// The documented partitioner (§6.3, §4.3): FNV-1a over the chat id's raw
/// UTF-8 bytes, reduced into `partition_count`. Test vectors below must be
/// asserted so that a differing partitioner implementation is caught rather
/// than silently reordering events for a chat.
pub fn partition_for_key(chat_id: &ChatId, partition_count: u32) -> u32 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in chat_id.as_str().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % partition_count as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    // (P7) fixed vector table (FNV-1a, precomputed independently of this
    // module): a differing partitioner implementation fails here instead of
    // silently reordering events for a chat.
    #[test]
    fn partitioner_matches_vector_table() {
        let cases: &[(&str, u32, u32)] = &[
            ("chat-alpha", 8, 2),
            ("chat-beta", 8, 0),
            ("chat-gamma", 16, 11),
        ];

        for (raw, count, expected) in cases {
            let chat_id = ChatId::new(*raw).unwrap();
            assert_eq!(partition_for_key(&chat_id, *count), *expected);
        }
    }

    #[test]
    fn same_chat_id_always_same_partition() {
        let chat_id = ChatId::new("stable-chat").unwrap();
        let first = partition_for_key(&chat_id, 12);
        for _ in 0..100 {
            assert_eq!(partition_for_key(&chat_id, 12), first);
        }
    }
}
