//! Ingest — the 5-step persistence pipeline (spec §4.2).
//!
//! Sole authority for writing Messages and publishing `MessagePersisted`
//! events. Grounded end to end on `handlers/send_message.rs::handle_persistent`
//! (idempotency pre-checks inside a transaction, sequence allocation, the
//! conditional write, and a fanout step explicitly decoupled from the response
//! path) and `db.rs::create_message`'s unique-violation recovery, adapted to
//! the dedicated-counter sequence convention (ADR-003) and to publishing
//! through an `EventLog` adapter instead of emitting directly to an in-process
//! broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::{ChatId, ClientMessageId, MessageId, Sequence, UserId};
use crate::error::IngestError;
use crate::eventlog::{EventLog, MessagePersisted};
use crate::store::{DurableStore, MembershipStatus, WriteOutcome};

#[derive(Debug, Clone)]
pub struct PersistMessageRequest {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub client_message_id: ClientMessageId,
    pub content: String,
    pub client_timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistMessageResponse {
    pub message_id: MessageId,
    pub sequence: Sequence,
    pub server_timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct Ingest<S, L> {
    store: Arc<S>,
    event_log: Arc<L>,
    pipeline_deadline: Duration,
}

impl<S, L> Ingest<S, L>
where
    S: DurableStore + 'static,
    L: EventLog + 'static,
{
    pub fn new(store: Arc<S>, event_log: Arc<L>, pipeline_deadline: Duration) -> Self {
        Self { store, event_log, pipeline_deadline }
    }

    pub async fn persist_message(
        &self,
        request: PersistMessageRequest,
    ) -> Result<PersistMessageResponse, IngestError> {
        tokio::time::timeout(self.pipeline_deadline, self.persist_message_inner(request))
            .await
            .unwrap_or(Err(IngestError::DeadlineExceeded))
    }

    async fn persist_message_inner(
        &self,
        request: PersistMessageRequest,
    ) -> Result<PersistMessageResponse, IngestError> {
        // Step 1 — idempotency probe. Retry-safety leg: a client retrying the
        // same logical message after a dropped ack converges here instead of
        // writing a second Message.
        if let Some(existing) = self
            .store
            .find_by_client_message_id(&request.chat_id, &request.client_message_id)
            .await?
        {
            return Ok(PersistMessageResponse {
                message_id: existing.message_id,
                sequence: existing.sequence,
                server_timestamp: existing.server_timestamp,
            });
        }

        // Step 2 — membership check. Fail-closed: a lookup error is NOT treated
        // as "allow" here, it propagates as Store(..) which IngestError::kind()
        // maps to Retryable, not Forbidden -- the caller must not construe a
        // transient lookup failure as proof of authorization either way.
        match self.store.membership_status(&request.chat_id, &request.sender_id).await? {
            Some(MembershipStatus::Active) => {}
            _ => {
                metrics::counter!("ingest_rejections_total", 1);
                return Err(IngestError::NotAMember);
            }
        }

        // Step 3 — sequence allocation (linearizable per ChatID).
        let sequence = self.store.allocate_sequence(&request.chat_id).await?;

        // Step 4 — transactional write. A losing idempotency race abandons
        // `sequence` permanently (§8 gap tolerance) and returns the winner's
        // identity instead, which still counts as success.
        let persisted = match self
            .store
            .write_message(
                &request.chat_id,
                sequence,
                &request.sender_id,
                &request.client_message_id,
                &request.content,
            )
            .await?
        {
            WriteOutcome::Written(msg) => msg,
            WriteOutcome::AlreadyExists(msg) => {
                info!(
                    chat_id = %request.chat_id,
                    allocated = %sequence,
                    actual = %msg.sequence,
                    "idempotency race lost this allocation, returning winner"
                );
                return Ok(PersistMessageResponse {
                    message_id: msg.message_id,
                    sequence: msg.sequence,
                    server_timestamp: msg.server_timestamp,
                });
            }
        };

        let response = PersistMessageResponse {
            message_id: persisted.message_id,
            sequence: persisted.sequence,
            server_timestamp: persisted.server_timestamp,
        };

        // ADR-001: "ACK = Durability" -- the response above is already
        // determined by the durable commit in Step 4. Step 5 runs from here but
        // its outcome never gates what the caller receives; a publish failure
        // is logged and surfaced back to metrics, not to the ack.
        let event = MessagePersisted {
            schema_version: MessagePersisted::SCHEMA_VERSION,
            chat_id: persisted.chat_id.clone(),
            sequence: persisted.sequence,
            message_id: persisted.message_id,
            sender_id: persisted.sender_id.clone(),
            server_timestamp: persisted.server_timestamp,
            content: persisted.content.clone(),
        };

        if let Err(e) = self.event_log.publish(&event).await {
            warn!(
                chat_id = %persisted.chat_id,
                sequence = %persisted.sequence,
                error = %e,
                "event publish failed; message is durably committed, publish will be retried by the client's ack-less retry path"
            );
            metrics::counter!("ingest_publish_failures_total", 1);
        }

        metrics::counter!("ingest_messages_persisted_total", 1);

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::EventLogError;
    use crate::store::{PersistedMessage, StoreError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStore {
        counters: Mutex<std::collections::HashMap<String, u64>>,
        messages: Mutex<Vec<PersistedMessage>>,
        members: Mutex<std::collections::HashSet<(String, String)>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                counters: Mutex::new(Default::default()),
                messages: Mutex::new(Vec::new()),
                members: Mutex::new(Default::default()),
            }
        }

        fn add_member(&self, chat_id: &str, user_id: &str) {
            self.members.lock().unwrap().insert((chat_id.to_string(), user_id.to_string()));
        }
    }

    #[async_trait]
    impl DurableStore for FakeStore {
        async fn find_by_client_message_id(
            &self,
            chat_id: &ChatId,
            client_message_id: &ClientMessageId,
        ) -> Result<Option<PersistedMessage>, StoreError> {
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .find(|m| &m.chat_id == chat_id && &m.client_message_id == client_message_id)
                .cloned())
        }

        async fn membership_status(
            &self,
            chat_id: &ChatId,
            user_id: &UserId,
        ) -> Result<Option<MembershipStatus>, StoreError> {
            let key = (chat_id.as_str().to_string(), user_id.as_str().to_string());
            Ok(if self.members.lock().unwrap().contains(&key) {
                Some(MembershipStatus::Active)
            } else {
                None
            })
        }

        async fn allocate_sequence(&self, chat_id: &ChatId) -> Result<Sequence, StoreError> {
            let mut counters = self.counters.lock().unwrap();
            let next = counters.entry(chat_id.as_str().to_string()).or_insert(1);
            let allocated = *next;
            *next += 1;
            Ok(Sequence(allocated))
        }

        async fn write_message(
            &self,
            chat_id: &ChatId,
            sequence: Sequence,
            sender_id: &UserId,
            client_message_id: &ClientMessageId,
            content: &str,
        ) -> Result<WriteOutcome, StoreError> {
            let mut messages = self.messages.lock().unwrap();
            if let Some(existing) = messages
                .iter()
                .find(|m| &m.chat_id == chat_id && &m.client_message_id == client_message_id)
            {
                return Ok(WriteOutcome::AlreadyExists(existing.clone()));
            }
            let msg = PersistedMessage {
                chat_id: chat_id.clone(),
                sequence,
                message_id: MessageId::generate(),
                sender_id: sender_id.clone(),
                client_message_id: *client_message_id,
                content: content.to_string(),
                server_timestamp: chrono::Utc::now(),
            };
            messages.push(msg.clone());
            Ok(WriteOutcome::Written(msg))
        }

        async fn messages_since(
            &self,
            chat_id: &ChatId,
            from_sequence: Sequence,
            page_size: u32,
        ) -> Result<Vec<PersistedMessage>, StoreError> {
            Ok(self
                .messages
                .lock()
                .unwrap()
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

    struct FakeEventLog;

    #[async_trait]
    impl EventLog for FakeEventLog {
        async fn publish(&self, _event: &MessagePersisted) -> Result<(), EventLogError> {
            Ok(())
        }
        async fn poll(&self) -> Result<crate::eventlog::ConsumedEvent, EventLogError> {
            unimplemented!()
        }
        async fn commit(&self, _partition: i32, _offset: i64) -> Result<(), EventLogError> {
            Ok(())
        }
    }

    fn ingest() -> (Ingest<FakeStore, FakeEventLog>, Arc<FakeStore>) {
        let store = Arc::new(FakeStore::new());
        let log = Arc::new(FakeEventLog);
        (Ingest::new(store.clone(), log, Duration::from_secs(5)), store)
    }

    #[tokio::test]
    async fn rejects_non_member() {
        let (ingest, _store) = ingest();
        let req = PersistMessageRequest {
            chat_id: ChatId::new("c1").unwrap(),
            sender_id: UserId::new("alice").unwrap(),
            client_message_id: ClientMessageId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            content: "hi".to_string(),
            client_timestamp: chrono::Utc::now(),
        };
        let err = ingest.persist_message(req).await.unwrap_err();
        assert!(matches!(err, IngestError::NotAMember));
    }

    #[tokio::test]
    async fn assigns_sequential_sequences_per_chat() {
        let (ingest, store) = ingest();
        store.add_member("c1", "alice");

        let mk = |cmid: &str| PersistMessageRequest {
            chat_id: ChatId::new("c1").unwrap(),
            sender_id: UserId::new("alice").unwrap(),
            client_message_id: ClientMessageId::parse(cmid).unwrap(),
            content: "hi".to_string(),
            client_timestamp: chrono::Utc::now(),
        };

        let r1 = ingest.persist_message(mk("550e8400-e29b-41d4-a716-446655440001")).await.unwrap();
        let r2 = ingest.persist_message(mk("550e8400-e29b-41d4-a716-446655440002")).await.unwrap();

        assert_eq!(r1.sequence, Sequence(1));
        assert_eq!(r2.sequence, Sequence(2));
    }

    #[tokio::test]
    async fn retrying_same_client_message_id_is_idempotent() {
        let (ingest, store) = ingest();
        store.add_member("c1", "alice");

        let cmid = "550e8400-e29b-41d4-a716-446655440003";
        let mk = || PersistMessageRequest {
            chat_id: ChatId::new("c1").unwrap(),
            sender_id: UserId::new("alice").unwrap(),
            client_message_id: ClientMessageId::parse(cmid).unwrap(),
            content: "hi".to_string(),
            client_timestamp: chrono::Utc::now(),
        };

        let r1 = ingest.persist_message(mk()).await.unwrap();
        let r2 = ingest.persist_message(mk()).await.unwrap();

        assert_eq!(r1.sequence, r2.sequence);
        assert_eq!(r1.message_id, r2.message_id);
    }
}
