use axum::{
    extract::{FromRef, State},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatcore::auth::{ConnectionRateLimiter, HttpIdentityOracle, KeyDistributionOracle, RevocationOracle, TokenValidator};
use chatcore::config::Config;
use chatcore::connection::frame::{ClosingReason, ServerFrame};
use chatcore::connection::tracker::{ConnectionTracker, LocalConnectionMap};
use chatcore::connection::{ws_upgrade_handler, Gateway};
use chatcore::domain::GatewayId;
use chatcore::eventlog::kafka::KafkaEventLog;
use chatcore::fanout::Fanout;
use chatcore::health;
use chatcore::ingest::Ingest;
use chatcore::metrics::{self, MetricsRecorder};
use chatcore::middleware;
use chatcore::registry::redis::RedisRegistry;
use chatcore::store::postgres::PostgresStore;

type Store = PostgresStore;
type Log = KafkaEventLog;
type Reg = RedisRegistry;
type GatewayT = Gateway<Store, Log, Reg>;

#[derive(Clone, FromRef)]
struct AppState {
    store: Arc<Store>,
    event_log: Arc<Log>,
    registry: Arc<Reg>,
    gateway: Arc<GatewayT>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    ip_limiter: Arc<middleware::rate_limit::RateLimiter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting connection gateway / ingest / fanout runtime");

    let metrics_recorder = MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();

    let store = Arc::new(
        PostgresStore::connect(
            &config.database_url,
            config.db_max_connections,
            config.db_min_connections,
            config.db_acquire_timeout,
        )
        .await?,
    );
    tracing::info!("durable store connected");

    let event_log = Arc::new(KafkaEventLog::new(
        &config.kafka_brokers,
        &config.kafka_topic,
        &config.kafka_consumer_group,
    )?);
    tracing::info!("event log connected");

    let registry = Arc::new(RedisRegistry::new(&config.redis_url)?);
    tracing::info!("registry connected");

    let identity_oracle = Arc::new(HttpIdentityOracle::new(config.identity_service_url.clone()));
    let key_oracle: Arc<dyn KeyDistributionOracle> = identity_oracle.clone();
    let revocation_oracle: Arc<dyn RevocationOracle> = identity_oracle;

    let validator = Arc::new(TokenValidator::new(key_oracle, config.key_set_unknown_kid_cooldown));
    validator.spawn_background_refresh(config.key_set_refresh_interval);
    tracing::info!("token validator started, background key refresh running");

    let rate_limiter = Arc::new(ConnectionRateLimiter::new(
        registry.clone(),
        config.connection_rate_limit_per_minute as u64,
        Duration::from_secs(60),
    ));

    let ingest = Arc::new(Ingest::new(store.clone(), event_log.clone(), config.ingest_pipeline_deadline));

    let gateway_id = GatewayId::new(
        std::env::var("GATEWAY_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
    )
    .expect("generated gateway id fits the opaque-id length bound");

    let gateway = Arc::new(Gateway {
        store: store.clone(),
        ingest,
        registry: registry.clone(),
        validator,
        revocation: revocation_oracle,
        rate_limiter,
        tracker: Arc::new(ConnectionTracker::new(config.max_connections_per_user)),
        local_connections: LocalConnectionMap::new(),
        gateway_id,
        heartbeat_interval: config.heartbeat_interval,
        heartbeat_grace: config.heartbeat_grace,
        outbound_queue_capacity: config.outbound_queue_capacity,
    });

    let fanout = Fanout::new(
        store.clone(),
        event_log.clone(),
        registry.clone(),
        gateway.clone(),
        config.membership_cache_ttl,
        config.fanout_retry_budget,
    );
    let fanout_handle = tokio::spawn(async move {
        fanout.run().await;
    });
    tracing::info!("fanout worker started");

    let ip_limiter = Arc::new(middleware::rate_limit::from_per_minute(config.ip_rate_limit_per_minute));

    let state = AppState {
        store: store.clone(),
        event_log: event_log.clone(),
        registry: registry.clone(),
        gateway: gateway.clone(),
        metrics_handle: metrics_handle.clone(),
        ip_limiter: ip_limiter.clone(),
    };

    let metrics_router = if config.enable_metrics {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        .route("/health", get(health::health::<Store, Log, Reg>))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness::<Store, Log, Reg>))
        .route("/connect", get(ws_upgrade_handler::<Store, Log, Reg>))
        .merge(metrics_router)
        .layer(axum::middleware::from_fn(middleware::logging::log_requests_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), ip_rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from((
        config.bind_addr.parse::<std::net::IpAddr>().unwrap_or([0, 0, 0, 0].into()),
        config.port,
    ));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(gateway.clone(), config.shutdown_grace))
        .await?;

    // Stop the Fanout consumer last so any in-flight poll/dispatch has a
    // chance to commit its offset before the process exits (§5 step 5/6).
    fanout_handle.abort();

    Ok(())
}

/// Applies the IP-based backstop limiter ahead of the per-user limiter the
/// Gateway's own Accept step already runs; unauthenticated abuse against the
/// upgrade endpoint never even reaches the bearer-token check.
async fn ip_rate_limit_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    let ip = middleware::rate_limit::extract_client_ip(request.headers());
    match state.ip_limiter.check(&ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            [(axum::http::header::RETRY_AFTER, retry_after_secs.to_string())],
        )
            .into_response(),
    }
}

/// Waits for SIGTERM/Ctrl-C, then runs the shutdown discipline's
/// connection-facing half (§5 steps 1-2): every locally-hosted connection
/// gets a `connection_closing{server_shutdown}` frame and a bounded grace
/// period to flush its own acks before the listener actually stops.
async fn shutdown_signal(gateway: Arc<GatewayT>, grace: Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining connections");
    gateway
        .local_connections
        .broadcast(ServerFrame::ConnectionClosing { reason: ClosingReason::ServerShutdown });
    tokio::time::sleep(grace).await;
}
