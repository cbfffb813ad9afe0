//! Client-facing frame protocol (spec §6.1): JSON over the WebSocket duplex.
//!
//! Generalizes the reference's `MessageHeader`/`ClientMessage` tagged framing
//! (`realtime/websocket.rs`) from a DAG-CBOR header+payload pair to a single
//! internally-tagged JSON value per frame, since §6.1 is explicit that the
//! wire format here is JSON.

use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, ClientMessageId, MessageId, Sequence, UserId};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "send_message")]
    SendMessage {
        request_id: String,
        chat_id: String,
        client_message_id: String,
        content: String,
        client_timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "ack")]
    Ack { chat_id: String, sequence: u64 },
    #[serde(rename = "sync_request")]
    SyncRequest {
        request_id: String,
        chat_id: String,
        from_sequence: u64,
        page_size: Option<u32>,
    },
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingReason {
    ServerShutdown,
    HeartbeatLost,
    TokenExpired,
    SlowConsumer,
    Revoked,
    Kicked,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connection_established")]
    ConnectionEstablished { heartbeat_interval_ms: u64, connection_id: String },
    #[serde(rename = "connection_closing")]
    ConnectionClosing { reason: ClosingReason },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "send_message_ack")]
    SendMessageAck {
        request_id: String,
        sequence: u64,
        message_id: String,
        server_timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "message")]
    Message {
        chat_id: String,
        sequence: u64,
        message_id: String,
        sender_id: String,
        content: String,
        server_timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "sync_response")]
    SyncResponse {
        request_id: String,
        chat_id: String,
        messages: Vec<SyncMessage>,
        next_cursor: Option<u64>,
    },
    #[serde(rename = "error")]
    Error {
        request_id: Option<String>,
        code: String,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncMessage {
    pub chat_id: String,
    pub sequence: u64,
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
    pub server_timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&crate::store::PersistedMessage> for SyncMessage {
    fn from(m: &crate::store::PersistedMessage) -> Self {
        Self {
            chat_id: m.chat_id.as_str().to_string(),
            sequence: m.sequence.0,
            message_id: m.message_id.to_string(),
            sender_id: m.sender_id.as_str().to_string(),
            content: m.content.clone(),
            server_timestamp: m.server_timestamp,
        }
    }
}

impl ServerFrame {
    pub fn message_from(chat_id: &ChatId, sequence: Sequence, message_id: MessageId, sender_id: &UserId, content: &str, server_timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        ServerFrame::Message {
            chat_id: chat_id.as_str().to_string(),
            sequence: sequence.0,
            message_id: message_id.to_string(),
            sender_id: sender_id.as_str().to_string(),
            content: content.to_string(),
            server_timestamp,
        }
    }
}

/// Parsed and validated `send_message` body, after frame-schema checks but
/// before Ingest.
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub request_id: String,
    pub chat_id: ChatId,
    pub client_message_id: ClientMessageId,
    pub content: String,
    pub client_timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_message_frame() {
        let json = r#"{"type":"send_message","request_id":"r1","chat_id":"c1","client_message_id":"550e8400-e29b-41d4-a716-446655440000","content":"hi","client_timestamp":"2026-01-01T00:00:00Z"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, ClientFrame::SendMessage { .. }));
    }

    #[test]
    fn unknown_frame_type_fails_to_parse_and_is_logged_not_fatal() {
        // §6.1: unknown inbound frame types must be logged and ignored, not
        // treated as a protocol violation that closes the connection. The
        // Gateway's read loop is responsible for catching this Err and
        // continuing rather than propagating it.
        let json = r#"{"type":"future_frame_type","foo":"bar"}"#;
        let result: Result<ClientFrame, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn serializes_error_frame_with_wire_shape() {
        let frame = ServerFrame::Error {
            request_id: Some("r1".to_string()),
            code: "not_a_member".to_string(),
            message: "sender is not an active member of the chat".to_string(),
            retryable: false,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "not_a_member");
        assert_eq!(json["retryable"], false);
    }
}
