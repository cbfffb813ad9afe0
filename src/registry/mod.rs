//! Ephemeral registry adapter contract (spec §4.5, "Ephemeral registry").
//!
//! Required operations: SET-with-TTL, atomic multi-key updates scriptable
//! server-side, set membership add/remove, existence check, key-pattern
//! iteration for a bounded prefix. Generalizes the reference codebase's
//! process-local `realtime::websocket::ConnectionTracker` (a `DashMap` of
//! per-user atomic counts) into a store shared across Gateway processes, since
//! §3's `UserConnections`/`GatewayConnections` indices must be visible to any
//! Fanout worker, not just the process that accepted the connection.

pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{ConnectionId, DeviceId, GatewayId, SessionId, UserId};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub gateway_id: GatewayId,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Atomically register a `Connection` record and add it to both the
    /// `UserConnections` and `GatewayConnections` indices, all with the same
    /// TTL (§4.1 Accept: "atomically registers Connection, adds to
    /// UserConnections and GatewayConnections with TTL"). Implementations
    /// realize this as a single server-side script so a crash mid-registration
    /// cannot leave an index pointing at a connection record that doesn't exist.
    async fn register_connection(
        &self,
        record: &ConnectionRecord,
        ttl: Duration,
    ) -> Result<(), RegistryError>;

    /// Refresh the TTL on an existing connection record (heartbeat). Does not
    /// recreate index membership; a missing record means the next heartbeat
    /// should fall through to `register_connection` instead.
    async fn refresh_heartbeat(&self, connection_id: &ConnectionId, ttl: Duration) -> Result<bool, RegistryError>;

    /// Remove the connection record and both index memberships atomically.
    async fn deregister_connection(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
        gateway_id: &GatewayId,
    ) -> Result<(), RegistryError>;

    /// All live connections for a user (Fanout §4.3 step 2).
    async fn connections_for_user(&self, user_id: &UserId) -> Result<Vec<ConnectionRecord>, RegistryError>;

    /// Connection count for a user, for the per-user connection cap (§4.1,
    /// reference's `MAX_CONNECTIONS_PER_USER`).
    async fn connection_count_for_user(&self, user_id: &UserId) -> Result<usize, RegistryError>;

    /// Every connection hosted by a given gateway process, drawn from the
    /// `GatewayConnections` index (§3) — used for targeted drain, e.g. during
    /// a rolling deploy where one gateway's connections must be closed without
    /// touching any other process's.
    async fn connections_for_gateway(&self, gateway_id: &GatewayId) -> Result<Vec<ConnectionId>, RegistryError>;

    /// `RevokedSessionMarker` existence check — the revocation oracle backing
    /// store. Any error here must be treated as "revoked" by the *caller*
    /// (fail-closed, §7); this trait only reports what it observed.
    async fn is_revoked(&self, session_id: &SessionId) -> Result<bool, RegistryError>;

    async fn mark_revoked(&self, session_id: &SessionId, ttl: Duration) -> Result<(), RegistryError>;

    /// Atomic increment-and-get on a window-scoped `RateCounter`, with the
    /// window as the key's TTL (set only on first increment in the window).
    async fn incr_rate_counter(&self, key: &str, window: Duration) -> Result<u64, RegistryError>;

    /// Cheap liveness check for the health endpoint; default no-op.
    async fn ping(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}
