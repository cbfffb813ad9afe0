//! Liveness/readiness endpoints.
//!
//! Grounded on `health.rs`'s three-tier `CheckStatus`/`HealthResponse`
//! pattern, generalized from "database + actor system" to this runtime's
//! three adapters: durable store, event log, registry.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::eventlog::EventLog;
use crate::registry::Registry;
use crate::store::DurableStore;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    durable_store: CheckStatus,
    event_log: CheckStatus,
    registry: CheckStatus,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

impl From<bool> for CheckStatus {
    fn from(ok: bool) -> Self {
        if ok {
            CheckStatus::Healthy
        } else {
            CheckStatus::Unhealthy
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: HealthChecks,
}

/// Liveness probe: is the process running at all. Never touches a backend.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn run_checks<S, L, R>(store: &S, event_log: &L, registry: &R) -> HealthChecks
where
    S: DurableStore,
    L: EventLog,
    R: Registry,
{
    let (store_ok, log_ok, registry_ok) =
        tokio::join!(store.ping(), event_log.ping(), registry.ping());

    HealthChecks {
        durable_store: store_ok.is_ok().into(),
        event_log: log_ok.is_ok().into(),
        registry: registry_ok.is_ok().into(),
    }
}

/// Readiness probe: are all three adapters reachable. 503 if any is down.
pub async fn readiness<S, L, R>(
    State(store): State<Arc<S>>,
    State(event_log): State<Arc<L>>,
    State(registry): State<Arc<R>>,
) -> (StatusCode, Json<ReadinessResponse>)
where
    S: DurableStore,
    L: EventLog,
    R: Registry,
{
    let checks = run_checks(store.as_ref(), event_log.as_ref(), registry.as_ref()).await;
    let ready = checks.durable_store == CheckStatus::Healthy
        && checks.event_log == CheckStatus::Healthy
        && checks.registry == CheckStatus::Healthy;

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(ReadinessResponse { ready, checks }))
}

/// Detailed health endpoint — same checks as readiness, plus version/timestamp.
pub async fn health<S, L, R>(
    State(store): State<Arc<S>>,
    State(event_log): State<Arc<L>>,
    State(registry): State<Arc<R>>,
) -> (StatusCode, Json<HealthResponse>)
where
    S: DurableStore,
    L: EventLog,
    R: Registry,
{
    let checks = run_checks(store.as_ref(), event_log.as_ref(), registry.as_ref()).await;
    let overall_healthy = checks.durable_store == CheckStatus::Healthy
        && checks.event_log == CheckStatus::Healthy
        && checks.registry == CheckStatus::Healthy;

    let status = if overall_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
