//! Sync — gap recovery on reconnect (spec §4.4).
//!
//! Grounded on the reference `handlers/get_messages.rs` cursor-pagination
//! shape (bounded page size, ascending order, explicit `next_cursor`),
//! generalized from its REST response type to the `sync_response` frame.

use crate::domain::{ChatId, Sequence};
use crate::error::SyncError;
use crate::store::{DurableStore, PersistedMessage};

/// Upper bound enforced regardless of what the client requests, mirroring the
/// reference's page-size clamp in the same handler.
pub const MAX_PAGE_SIZE: u32 = 500;
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub messages: Vec<PersistedMessage>,
    /// Present when the page was truncated at `page_size`; the caller should
    /// issue another `sync_request` with `from_sequence` set to this cursor.
    pub next_cursor: Option<Sequence>,
}

pub async fn sync(
    store: &dyn DurableStore,
    chat_id: &ChatId,
    from_sequence: Sequence,
    page_size: u32,
) -> Result<SyncResponse, SyncError> {
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(SyncError::InvalidPageSize(page_size));
    }

    // Request one extra row to detect truncation without a second round trip.
    let mut messages = store.messages_since(chat_id, from_sequence, page_size + 1).await?;

    let next_cursor = if messages.len() > page_size as usize {
        messages.truncate(page_size as usize);
        messages.last().map(|m| m.sequence)
    } else {
        None
    };

    Ok(SyncResponse { messages, next_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClientMessageId, MessageId, UserId};
    use crate::store::{MembershipStatus, StoreError, WriteOutcome};
    use async_trait::async_trait;

    struct FakeStore {
        messages: Vec<PersistedMessage>,
    }

    #[async_trait]
    impl DurableStore for FakeStore {
        async fn find_by_client_message_id(
            &self,
            _chat_id: &ChatId,
            _client_message_id: &ClientMessageId,
        ) -> Result<Option<PersistedMessage>, StoreError> {
            Ok(None)
        }
        async fn membership_status(
            &self,
            _chat_id: &ChatId,
            _user_id: &UserId,
        ) -> Result<Option<MembershipStatus>, StoreError> {
            Ok(Some(MembershipStatus::Active))
        }
        async fn allocate_sequence(&self, _chat_id: &ChatId) -> Result<Sequence, StoreError> {
            unimplemented!()
        }
        async fn write_message(
            &self,
            _chat_id: &ChatId,
            _sequence: Sequence,
            _sender_id: &UserId,
            _client_message_id: &ClientMessageId,
            _content: &str,
        ) -> Result<WriteOutcome, StoreError> {
            unimplemented!()
        }
        async fn messages_since(
            &self,
            chat_id: &ChatId,
            from_sequence: Sequence,
            page_size: u32,
        ) -> Result<Vec<PersistedMessage>, StoreError> {
            Ok(self
                .messages
                .iter()
                .filter(|m| &m.chat_id == chat_id && m.sequence > from_sequence)
                .take(page_size as usize)
                .cloned()
                .collect())
        }
        async fn active_members(&self, _chat_id: &ChatId) -> Result<Vec<UserId>, StoreError> {
            Ok(vec![])
        }
        async fn watermark(&self, _user_id: &UserId, _chat_id: &ChatId) -> Result<Sequence, StoreError> {
            Ok(Sequence::ZERO)
        }
        async fn advance_watermark(
            &self,
            _user_id: &UserId,
            _chat_id: &ChatId,
            _sequence: Sequence,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn message(chat_id: &str, sequence: u64) -> PersistedMessage {
        PersistedMessage {
            chat_id: ChatId::new(chat_id).unwrap(),
            sequence: Sequence(sequence),
            message_id: MessageId::generate(),
            sender_id: UserId::new("alice").unwrap(),
            client_message_id: ClientMessageId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            content: "hi".to_string(),
            server_timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn returns_messages_in_order_with_no_cursor_when_page_not_full() {
        let store = FakeStore { messages: vec![message("c1", 3), message("c1", 4), message("c1", 5), message("c1", 6)] };
        let chat_id = ChatId::new("c1").unwrap();

        let response = sync(&store, &chat_id, Sequence(2), 100).await.unwrap();

        let sequences: Vec<u64> = response.messages.iter().map(|m| m.sequence.0).collect();
        assert_eq!(sequences, vec![3, 4, 5, 6]);
        assert_eq!(response.next_cursor, None);
    }

    #[tokio::test]
    async fn truncates_and_returns_cursor_when_more_remain() {
        let store = FakeStore {
            messages: (1..=10).map(|s| message("c1", s)).collect(),
        };
        let chat_id = ChatId::new("c1").unwrap();

        let response = sync(&store, &chat_id, Sequence::ZERO, 5).await.unwrap();

        assert_eq!(response.messages.len(), 5);
        assert_eq!(response.next_cursor, Some(Sequence(5)));
    }

    #[tokio::test]
    async fn rejects_zero_page_size() {
        let store = FakeStore { messages: vec![] };
        let chat_id = ChatId::new("c1").unwrap();
        let err = sync(&store, &chat_id, Sequence::ZERO, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPageSize(0)));
    }

    #[tokio::test]
    async fn rejects_oversized_page_size() {
        let store = FakeStore { messages: vec![] };
        let chat_id = ChatId::new("c1").unwrap();
        let err = sync(&store, &chat_id, Sequence::ZERO, MAX_PAGE_SIZE + 1).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPageSize(_)));
    }
}
