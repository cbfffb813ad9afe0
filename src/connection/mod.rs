//! Connection Gateway (spec §4.1): socket upgrade, auth gate, session state
//! machine, heartbeat, and the bounded outbound queue with slow-consumer
//! handling.
//!
//! The task-group shape — one reader task, one writer task, one heartbeat
//! task raced with `tokio::select!`, the first to exit aborts the rest — is
//! carried over from `realtime/websocket.rs::handle_socket` directly. Ticket
//! verification pre-upgrade generalizes into this module's bearer-token
//! Accept step.

pub mod frame;
pub mod tracker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{self, ConnectionRateLimiter, RevocationOracle, TokenValidator};
use crate::domain::{ChatId, ClientMessageId, ConnectionId, GatewayId, Sequence, UserId};
use crate::error::{ConnectionError, FanoutError};
use crate::eventlog::{EventLog, MessagePersisted};
use crate::fanout::Dispatcher;
use crate::ingest::{Ingest, PersistMessageRequest};
use crate::registry::{ConnectionRecord, Registry};
use crate::store::DurableStore;
use crate::sync;

use frame::{ClientFrame, ClosingReason, ServerFrame};
use tracker::{ConnectionTracker, LocalConnectionMap};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Bearer token, accepted here as a fallback for clients that cannot set
    /// a header on the upgrade request (§4.1: "header preferred, query
    /// fallback").
    pub token: Option<String>,
    pub device_id: String,
}

pub struct Gateway<S, L, R> {
    pub store: Arc<S>,
    pub ingest: Arc<Ingest<S, L>>,
    pub registry: Arc<R>,
    pub validator: Arc<TokenValidator>,
    pub revocation: Arc<dyn RevocationOracle>,
    pub rate_limiter: Arc<ConnectionRateLimiter<R>>,
    pub tracker: Arc<ConnectionTracker>,
    pub local_connections: LocalConnectionMap,
    pub gateway_id: GatewayId,
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    pub outbound_queue_capacity: usize,
}

impl<S, L, R> Gateway<S, L, R>
where
    S: DurableStore + 'static,
    L: EventLog + 'static,
    R: Registry + 'static,
{
    fn connection_ttl(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    fn extract_bearer(headers: &HeaderMap, query: &ConnectQuery) -> Option<String> {
        if let Some(header) = headers.get(axum::http::header::AUTHORIZATION) {
            if let Ok(s) = header.to_str() {
                if let Some(token) = s.strip_prefix("Bearer ") {
                    return Some(token.to_string());
                }
            }
        }
        query.token.clone()
    }

    /// The Accept operation (§4.1): auth gate, per-user rate limit and
    /// connection cap, atomic Registry registration. Returns the session
    /// identity to carry into `handle_socket` on success.
    async fn accept(&self, headers: &HeaderMap, query: &ConnectQuery) -> Result<(auth::AuthenticatedSession, ConnectionId), ConnectionError> {
        match self.accept_inner(headers, query).await {
            Ok(ok) => {
                metrics::counter!("connection_gateway_accepts_total", 1);
                metrics::increment_gauge!("connection_gateway_active_connections", 1.0);
                Ok(ok)
            }
            Err(e) => {
                metrics::counter!("connection_gateway_rejections_total", 1);
                Err(e)
            }
        }
    }

    async fn accept_inner(&self, headers: &HeaderMap, query: &ConnectQuery) -> Result<(auth::AuthenticatedSession, ConnectionId), ConnectionError> {
        let token = Self::extract_bearer(headers, query).ok_or(ConnectionError::Unauthenticated)?;
        let session = auth::authenticate(&self.validator, self.revocation.as_ref(), &token).await?;

        self.rate_limiter.check(&session.user_id).await?;

        if !self.tracker.try_acquire(&session.user_id) {
            return Err(ConnectionError::RateLimited { retry_after_secs: 60 });
        }

        let connection_id = ConnectionId::new(uuid::Uuid::new_v4().to_string()).map_err(|_| ConnectionError::Unauthenticated)?;

        let record = ConnectionRecord {
            connection_id: connection_id.clone(),
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            gateway_id: self.gateway_id.clone(),
        };

        if let Err(e) = self.registry.register_connection(&record, self.connection_ttl()).await {
            self.tracker.release(&session.user_id);
            warn!(error = %e, "registry unavailable during accept");
            return Err(ConnectionError::ServiceUnavailable);
        }

        Ok((session, connection_id))
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, session: auth::AuthenticatedSession, connection_id: ConnectionId) {
        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(self.outbound_queue_capacity);
        let slow_consumer = self.local_connections.insert(&connection_id, outbound_tx.clone());

        let established = ServerFrame::ConnectionEstablished {
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
            connection_id: connection_id.as_str().to_string(),
        };
        if send_frame(&mut sink, &established).await.is_err() {
            self.cleanup(&session, &connection_id).await;
            return;
        }

        let pong_seen = Arc::new(AtomicBool::new(true));

        let mut writer_task = {
            let pong_seen = pong_seen.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = outbound_rx.recv() => {
                            let Some(frame) = frame else { break };
                            if matches!(frame, ServerFrame::Ping) {
                                pong_seen.store(false, Ordering::SeqCst);
                            }
                            if send_frame(&mut sink, &frame).await.is_err() {
                                break;
                            }
                        }
                        _ = slow_consumer.notified() => {
                            metrics::counter!("connection_gateway_slow_consumer_total", 1);
                            let _ = send_frame(&mut sink, &ServerFrame::ConnectionClosing { reason: ClosingReason::SlowConsumer }).await;
                            break;
                        }
                    }
                }
            })
        };

        let gateway = self.clone();
        let connection_id_reader = connection_id.clone();
        let user_id_reader = session.user_id.clone();
        let outbound_tx_reader = outbound_tx.clone();
        let pong_seen_reader = pong_seen.clone();
        let mut reader_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Close(_) => break,
                    Message::Text(text) => {
                        gateway
                            .handle_client_frame(&text, &connection_id_reader, &user_id_reader, &outbound_tx_reader, &pong_seen_reader)
                            .await;
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
                }
            }
        });

        let heartbeat_interval = self.heartbeat_interval;
        let heartbeat_grace = self.heartbeat_grace;
        let outbound_tx_heartbeat = outbound_tx.clone();
        let pong_seen_heartbeat = pong_seen.clone();
        let mut heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                if !pong_seen_heartbeat.load(Ordering::SeqCst) {
                    debug!("heartbeat missed, closing connection");
                    break;
                }
                if outbound_tx_heartbeat.send(ServerFrame::Ping).await.is_err() {
                    break;
                }
                tokio::time::sleep(heartbeat_grace).await;
            }
        });

        tokio::select! {
            _ = &mut writer_task => { reader_task.abort(); heartbeat_task.abort(); }
            _ = &mut reader_task => { writer_task.abort(); heartbeat_task.abort(); }
            _ = &mut heartbeat_task => { writer_task.abort(); reader_task.abort(); }
        }

        self.cleanup(&session, &connection_id).await;
    }

    async fn cleanup(&self, session: &auth::AuthenticatedSession, connection_id: &ConnectionId) {
        self.local_connections.remove(connection_id);
        self.tracker.release(&session.user_id);
        metrics::decrement_gauge!("connection_gateway_active_connections", 1.0);
        if let Err(e) = self.registry.deregister_connection(connection_id, &session.user_id, &self.gateway_id).await {
            warn!(error = %e, "registry deregister failed on close, TTL will reap");
        }
        info!(connection_id = %connection_id, "connection closed");
    }

    async fn handle_client_frame(
        &self,
        text: &str,
        connection_id: &ConnectionId,
        user_id: &UserId,
        outbound: &mpsc::Sender<ServerFrame>,
        pong_seen: &Arc<AtomicBool>,
    ) {
        let client_frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                // §6.1: unknown/malformed frame types are logged and ignored,
                // never a reason to close the connection. The raw frame may
                // carry message content, so only its redacted digest is logged.
                warn!(
                    connection_id = %connection_id,
                    error = %e,
                    frame_digest = %crate::crypto::redact_for_log(text),
                    "ignoring unparseable inbound frame"
                );
                return;
            }
        };

        match client_frame {
            ClientFrame::SendMessage { request_id, chat_id, client_message_id, content, client_timestamp } => {
                self.handle_send_message(request_id, chat_id, client_message_id, content, client_timestamp, user_id, outbound).await;
            }
            ClientFrame::Ack { chat_id, sequence } => {
                self.handle_ack(chat_id, sequence, user_id).await;
            }
            ClientFrame::SyncRequest { request_id, chat_id, from_sequence, page_size } => {
                self.handle_sync_request(request_id, chat_id, from_sequence, page_size, outbound).await;
            }
            ClientFrame::Pong => {
                pong_seen.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn handle_send_message(
        &self,
        request_id: String,
        chat_id: String,
        client_message_id: String,
        content: String,
        client_timestamp: chrono::DateTime<chrono::Utc>,
        sender_id: &UserId,
        outbound: &mpsc::Sender<ServerFrame>,
    ) {
        let (chat_id, client_message_id) = match (ChatId::new(chat_id), ClientMessageId::parse(&client_message_id)) {
            (Ok(c), Ok(m)) => (c, m),
            _ => {
                let _ = outbound
                    .send(ServerFrame::Error {
                        request_id: Some(request_id),
                        code: "invalid_argument".to_string(),
                        message: "malformed chat_id or client_message_id".to_string(),
                        retryable: false,
                    })
                    .await;
                return;
            }
        };

        if content.is_empty() || content.len() > 4096 {
            let _ = outbound
                .send(ServerFrame::Error {
                    request_id: Some(request_id),
                    code: "invalid_argument".to_string(),
                    message: "content must be 1-4096 bytes".to_string(),
                    retryable: false,
                })
                .await;
            return;
        }

        let result = self
            .ingest
            .persist_message(PersistMessageRequest {
                chat_id,
                sender_id: sender_id.clone(),
                client_message_id,
                content,
                client_timestamp,
            })
            .await;

        match result {
            Ok(response) => {
                let _ = outbound
                    .send(ServerFrame::SendMessageAck {
                        request_id,
                        sequence: response.sequence.0,
                        message_id: response.message_id.to_string(),
                        server_timestamp: response.server_timestamp,
                    })
                    .await;
            }
            Err(e) => {
                let kind = e.kind();
                let _ = outbound
                    .send(ServerFrame::Error {
                        request_id: Some(request_id),
                        code: wire_code_for_ingest_error(&e),
                        message: e.to_string(),
                        retryable: kind.retryable(),
                    })
                    .await;
            }
        }
    }

    async fn handle_ack(&self, chat_id: String, sequence: u64, user_id: &UserId) {
        let Ok(chat_id) = ChatId::new(chat_id) else { return };
        // Gateway's ack handler and Fanout's per-delivery bookkeeping share
        // this exact call (ADR-002); both enforce max-wins at the store.
        if let Err(e) = self.store.advance_watermark(user_id, &chat_id, Sequence(sequence)).await {
            warn!(error = %e, "failed to advance watermark from client ack");
        }
    }

    async fn handle_sync_request(&self, request_id: String, chat_id: String, from_sequence: u64, page_size: Option<u32>, outbound: &mpsc::Sender<ServerFrame>) {
        let Ok(chat_id) = ChatId::new(chat_id.clone()) else { return };
        let page_size = page_size.unwrap_or(sync::DEFAULT_PAGE_SIZE);
        metrics::counter!("sync_requests_total", 1);

        match sync::sync(self.store.as_ref(), &chat_id, Sequence(from_sequence), page_size).await {
            Ok(response) => {
                metrics::histogram!("sync_page_size", response.messages.len() as f64);
                let _ = outbound
                    .send(ServerFrame::SyncResponse {
                        request_id,
                        chat_id: chat_id.as_str().to_string(),
                        messages: response.messages.iter().map(frame::SyncMessage::from).collect(),
                        next_cursor: response.next_cursor.map(|s| s.0),
                    })
                    .await;
            }
            Err(e) => {
                let _ = outbound
                    .send(ServerFrame::Error {
                        request_id: Some(request_id),
                        code: "retryable".to_string(),
                        message: e.to_string(),
                        retryable: e.kind().retryable(),
                    })
                    .await;
            }
        }
    }
}

/// Fanout's delivery sink: the RPC described in §6.2 realized in-process.
/// Fanout already resolved a `ConnectionRecord` (and with it, which gateway
/// process owns the connection) via the `Registry`; a record whose
/// `gateway_id` isn't ours means the connection lives on a peer process and
/// nothing here can deliver to it directly.
#[async_trait::async_trait]
impl<S, L, R> Dispatcher for Gateway<S, L, R>
where
    S: DurableStore + 'static,
    L: EventLog + 'static,
    R: Registry + 'static,
{
    async fn dispatch(&self, connection: &ConnectionRecord, event: &MessagePersisted) -> Result<bool, FanoutError> {
        if connection.gateway_id != self.gateway_id {
            return Ok(false);
        }

        let frame = ServerFrame::message_from(
            &event.chat_id,
            event.sequence,
            event.message_id,
            &event.sender_id,
            &event.content,
            event.server_timestamp,
        );

        // `Ok(false)` here means either the connection hung up already, or
        // `try_send` hit a full queue and fired the connection's slow-consumer
        // notify — its writer task pushes `ConnectionClosing{SlowConsumer}`
        // and tears the session down on its own, no action needed here.
        Ok(self.local_connections.try_send(&connection.connection_id, frame))
    }
}

async fn send_frame(sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin), frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(text.into())).await
}

fn wire_code_for_ingest_error(e: &crate::error::IngestError) -> String {
    use crate::error::IngestError;
    match e {
        IngestError::NotAMember => "not_a_member".to_string(),
        IngestError::InvalidArgument(_) => "invalid_argument".to_string(),
        IngestError::Store(_) | IngestError::Publish(_) | IngestError::DeadlineExceeded => "retryable".to_string(),
    }
}

/// Axum handler: upgrades the socket after the Accept checks pass, rejecting
/// with a taxonomized status before any Registry write otherwise (§4.1).
pub async fn ws_upgrade_handler<S, L, R>(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway<S, L, R>>>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    ConnectInfo(_peer): ConnectInfo<SocketAddr>,
) -> Result<Response, StatusCode>
where
    S: DurableStore + 'static,
    L: EventLog + 'static,
    R: Registry + 'static,
{
    let (session, connection_id) = gateway.accept(&headers, &query).await.map_err(|e| match e.kind() {
        crate::error::ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        crate::error::ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        crate::error::ErrorKind::Retryable => StatusCode::SERVICE_UNAVAILABLE,
        crate::error::ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    })?;

    info!(connection_id = %connection_id, "connection accepted");

    Ok(ws.on_upgrade(move |socket| async move {
        gateway.handle_socket(socket, session, connection_id).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_reason_serializes_to_expected_wire_strings() {
        let json = serde_json::to_value(ClosingReason::HeartbeatLost).unwrap();
        assert_eq!(json, "heartbeat_lost");
        let json = serde_json::to_value(ClosingReason::ServerShutdown).unwrap();
        assert_eq!(json, "server_shutdown");
    }
}
