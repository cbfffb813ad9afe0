//! Fanout — best-effort delivery of persisted messages to live connections
//! (spec §4.3).
//!
//! Grounded on the reference `fanout/mod.rs` consumer-loop shape (poll,
//! resolve recipients, dispatch, commit) generalized from its in-process
//! mailbox lookup to the `Registry` adapter, and on `cache.rs`'s moka
//! membership-cache pattern for avoiding a `DurableStore` round trip per event
//! per recipient.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{error, warn};

use crate::domain::{ChatId, UserId};
use crate::error::FanoutError;
use crate::eventlog::{ConsumedEvent, EventLog, MessagePersisted};
use crate::registry::{ConnectionRecord, Registry};
use crate::store::DurableStore;

/// A single outbound delivery attempt. The Connection Gateway owns the actual
/// transport; Fanout only needs a narrow sink it can push frames through
/// without depending on the gateway's internal session map.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Attempt delivery to one live connection. `Ok(true)` means the frame was
    /// accepted onto that connection's outbound queue (not that the peer has
    /// read it — delivery remains best-effort per §4.3). `Ok(false)` means the
    /// connection is gone or its queue is full and the slow-consumer path has
    /// already taken over; Fanout does not retry within this poll cycle.
    async fn dispatch(&self, connection: &ConnectionRecord, event: &MessagePersisted) -> Result<bool, FanoutError>;
}

pub struct Fanout<S, L, R, D> {
    store: Arc<S>,
    event_log: Arc<L>,
    registry: Arc<R>,
    dispatcher: Arc<D>,
    members_cache: Cache<String, Arc<Vec<UserId>>>,
    retry_budget: u32,
}

impl<S, L, R, D> Fanout<S, L, R, D>
where
    S: DurableStore + 'static,
    L: EventLog + 'static,
    R: Registry + 'static,
    D: Dispatcher + 'static,
{
    pub fn new(
        store: Arc<S>,
        event_log: Arc<L>,
        registry: Arc<R>,
        dispatcher: Arc<D>,
        members_cache_ttl: Duration,
        retry_budget: u32,
    ) -> Self {
        let members_cache = Cache::builder().time_to_live(members_cache_ttl).max_capacity(10_000).build();
        Self { store, event_log, registry, dispatcher, members_cache, retry_budget }
    }

    /// Runs the poll/resolve/dispatch/commit loop forever. Intended to be
    /// spawned as its own task (one or more per process); a poison event that
    /// exhausts its retry budget is logged and skipped rather than blocking
    /// the partition permanently (§4.3, "Non-goals: no guaranteed delivery").
    pub async fn run(&self) {
        loop {
            let consumed = match self.event_log.poll().await {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "event log poll failed, backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            self.process_one(consumed).await;
        }
    }

    async fn process_one(&self, consumed: ConsumedEvent) {
        let ConsumedEvent { payload, partition, offset } = consumed;

        let event = match payload {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, partition, offset, "poison event, skipping after logging");
                self.commit(partition, offset).await;
                return;
            }
        };

        let mut attempt = 0;
        loop {
            match self.deliver(&event).await {
                Ok(()) => break,
                Err(e) if attempt < self.retry_budget => {
                    attempt += 1;
                    warn!(
                        chat_id = %event.chat_id,
                        sequence = %event.sequence,
                        attempt,
                        error = %e,
                        "fanout delivery attempt failed, retrying within budget"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => {
                    error!(
                        chat_id = %event.chat_id,
                        sequence = %event.sequence,
                        error = %e,
                        "fanout retry budget exhausted, dropping delivery for this event (best-effort)"
                    );
                    metrics::counter!("fanout_delivery_exhausted_total", 1);
                    break;
                }
            }
        }

        // Offset commit happens unconditionally once we stop retrying, success
        // or not -- §4.3 step 3, "offset commit follows processing regardless
        // of delivery outcome."
        self.commit(partition, offset).await;
    }

    async fn deliver(&self, event: &MessagePersisted) -> Result<(), FanoutError> {
        let members = self.members_for(&event.chat_id).await?;

        for user_id in members.iter() {
            let connections = self.registry.connections_for_user(user_id).await?;
            if connections.is_empty() {
                continue; // offline; they catch up via Sync on reconnect
            }

            let mut delivered_any = false;
            for connection in &connections {
                match self.dispatcher.dispatch(connection, event).await {
                    Ok(true) => delivered_any = true,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            connection_id = %connection.connection_id,
                            error = %e,
                            "dispatch error for one connection, continuing to the rest of the user's connections"
                        );
                    }
                }
            }

            // §4.3 step 4: advance unconditionally on delivery, same code path
            // the Gateway's `ack` frame handler uses (ADR-002). A user who
            // never saw the event on any live connection does not advance --
            // they'll recover it through Sync.
            if delivered_any {
                metrics::counter!("fanout_deliveries_total", 1);
                self.store.advance_watermark(user_id, &event.chat_id, event.sequence).await?;
            }
        }

        Ok(())
    }

    async fn members_for(&self, chat_id: &ChatId) -> Result<Arc<Vec<UserId>>, FanoutError> {
        if let Some(cached) = self.members_cache.get(chat_id.as_str()).await {
            return Ok(cached);
        }

        let members = self.store.active_members(chat_id).await?;
        let members = Arc::new(members);
        self.members_cache.insert(chat_id.as_str().to_string(), members.clone()).await;
        Ok(members)
    }

    async fn commit(&self, partition: i32, offset: i64) {
        if let Err(e) = self.event_log.commit(partition, offset).await {
            error!(partition, offset, error = %e, "offset commit failed");
        }
    }
}
