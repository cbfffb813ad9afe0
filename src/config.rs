//! Process configuration, loaded once at startup from the environment.
//!
//! Follows the reference codebase's `db::DbConfig`/`middleware::rate_limit::RateLimiter`
//! convention: every field has an explicit default, env vars override it, and
//! parse failures of a *provided* value are fatal rather than silently ignored
//! (a malformed `DATABASE_URL` must not fall back to a default that points
//! nowhere useful).

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            panic!("env var {key} set to an unparseable value: {raw:?}")
        }),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout: Duration,

    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_consumer_group: String,

    pub redis_url: String,

    pub identity_service_url: String,
    pub ingest_pipeline_deadline: Duration,

    pub bind_addr: String,
    pub port: u16,

    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    pub outbound_queue_capacity: usize,
    pub max_connections_per_user: usize,

    pub membership_cache_ttl: Duration,
    pub key_set_refresh_interval: Duration,
    pub key_set_unknown_kid_cooldown: Duration,

    pub ip_rate_limit_per_minute: u32,
    pub connection_rate_limit_per_minute: u32,

    pub fanout_retry_budget: u32,
    pub shutdown_grace: Duration,

    pub enable_metrics: bool,
}

impl Config {
    /// Load from the environment, calling `dotenvy::dotenv()` first so a local
    /// `.env` file (if present) populates `std::env` the same way the
    /// reference's `main.rs` does.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/chatcore".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            db_min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            db_acquire_timeout: Duration::from_secs(env_or("DB_ACQUIRE_TIMEOUT_SECS", 30)),

            kafka_brokers: env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
            kafka_topic: env::var("KAFKA_TOPIC").unwrap_or_else(|_| "message-persisted".to_string()),
            kafka_consumer_group: env::var("KAFKA_CONSUMER_GROUP")
                .unwrap_or_else(|_| "fanout-worker".to_string()),

            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            identity_service_url: env::var("IDENTITY_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:4000".to_string()),
            ingest_pipeline_deadline: Duration::from_millis(env_or("INGEST_PIPELINE_DEADLINE_MS", 2_000)),

            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080),

            heartbeat_interval: Duration::from_millis(env_or("HEARTBEAT_INTERVAL_MS", 30_000)),
            heartbeat_grace: Duration::from_millis(env_or("HEARTBEAT_GRACE_MS", 30_000)),
            outbound_queue_capacity: env_or("OUTBOUND_QUEUE_CAPACITY", 256),
            max_connections_per_user: env_or("MAX_CONNECTIONS_PER_USER", 5),

            membership_cache_ttl: Duration::from_secs(env_or("MEMBERSHIP_CACHE_TTL_SECS", 300)),
            key_set_refresh_interval: Duration::from_secs(env_or("KEY_SET_REFRESH_INTERVAL_SECS", 300)),
            key_set_unknown_kid_cooldown: Duration::from_secs(env_or(
                "KEY_SET_UNKNOWN_KID_COOLDOWN_SECS",
                30,
            )),

            ip_rate_limit_per_minute: env_or("IP_RATE_LIMIT_PER_MINUTE", 60),
            connection_rate_limit_per_minute: env_or("CONNECTION_RATE_LIMIT_PER_MINUTE", 20),

            fanout_retry_budget: env_or("FANOUT_RETRY_BUDGET", 3),
            shutdown_grace: Duration::from_secs(env_or("SHUTDOWN_GRACE_SECS", 10)),

            enable_metrics: env::var("ENABLE_METRICS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        env::remove_var("CHATCORE_TEST_UNSET_VALUE");
        let v: u32 = env_or("CHATCORE_TEST_UNSET_VALUE", 42);
        assert_eq!(v, 42);
    }
}
