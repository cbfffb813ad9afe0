//! Durable store adapter contract (spec §4.5, "Durable store (authoritative)").
//!
//! Any implementation satisfying this trait is admissible; the rest of the
//! core never depends on Postgres-specific types. The method set is the
//! generic operation list from §4.5 specialized to this core's entities,
//! following the reference codebase's convention of one function per access
//! pattern (`db.rs`) rather than a raw generic key-value interface.

pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ChatId, ClientMessageId, MessageId, Sequence, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

/// A persisted `Message` row (§3).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PersistedMessage {
    pub chat_id: ChatId,
    pub sequence: Sequence,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub client_message_id: ClientMessageId,
    pub content: String,
    pub server_timestamp: chrono::DateTime<chrono::Utc>,
}

/// Result of the Step-4 transactional write (§4.2).
pub enum WriteOutcome {
    /// This call's Step-3 sequence was the one materialized.
    Written(PersistedMessage),
    /// A concurrent retry already holds the `IdempotencyKey`; the allocated
    /// sequence becomes a permanent gap (§4.2 Step 4, §8 gap tolerance).
    AlreadyExists(PersistedMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Active,
    Inactive,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Step 1 — strong-consistency point read of `IdempotencyKey(chat_id, client_message_id)`.
    async fn find_by_client_message_id(
        &self,
        chat_id: &ChatId,
        client_message_id: &ClientMessageId,
    ) -> Result<Option<PersistedMessage>, StoreError>;

    /// Step 2 — strong-consistency point read of `ChatMembership(chat_id, user_id)`.
    async fn membership_status(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> Result<Option<MembershipStatus>, StoreError>;

    /// Step 3 — atomic increment on `ChatCounter(chat_id).NextSequence`, returning
    /// the pre-increment value as the allocated sequence (ADR-003: a dedicated
    /// counter row, not a `MAX(seq)+1` scan).
    async fn allocate_sequence(&self, chat_id: &ChatId) -> Result<Sequence, StoreError>;

    /// Step 4 — transactional write of `Message` (unconditional, sequence unique
    /// by construction) + `IdempotencyKey` (conditional "not exists"). On
    /// condition failure, returns the existing row instead of erroring: the
    /// caller treats `AlreadyExists` as success per §4.2.
    #[allow(clippy::too_many_arguments)]
    async fn write_message(
        &self,
        chat_id: &ChatId,
        sequence: Sequence,
        sender_id: &UserId,
        client_message_id: &ClientMessageId,
        content: &str,
    ) -> Result<WriteOutcome, StoreError>;

    /// §4.4 Sync — range query ordered ascending by sequence, cursor-paginated.
    async fn messages_since(
        &self,
        chat_id: &ChatId,
        from_sequence: Sequence,
        page_size: u32,
    ) -> Result<Vec<PersistedMessage>, StoreError>;

    /// All active members of a chat (Fanout recipient resolution, §4.3 step 1).
    async fn active_members(&self, chat_id: &ChatId) -> Result<Vec<UserId>, StoreError>;

    /// Read `DeliveryWatermark(user_id, chat_id)`, or `Sequence::ZERO` if none exists.
    async fn watermark(&self, user_id: &UserId, chat_id: &ChatId) -> Result<Sequence, StoreError>;

    /// Advance `DeliveryWatermark(user_id, chat_id)` with max-wins semantics
    /// (never regress). Called identically from the Gateway's `ack` handler and
    /// the Fanout worker (ADR-002) so the invariant has exactly one code path.
    async fn advance_watermark(
        &self,
        user_id: &UserId,
        chat_id: &ChatId,
        sequence: Sequence,
    ) -> Result<(), StoreError>;

    /// Cheap liveness check for the health endpoint. Default is a no-op so
    /// test fakes don't need to implement it; real adapters override with an
    /// actual round trip.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
