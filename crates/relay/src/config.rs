//! Relay configuration loaded from environment variables.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use messaging::ConsumerConfig;

use crate::ConfigError;

/// Relay configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `REDIS_URL`: queue backend (default: `"redis://127.0.0.1:6379"`)
/// - `QUEUE_NAME`: queue to consume (default: `"bookings"`)
/// - `DEAD_LETTER_QUEUE`: where poison messages go (default: `"<queue>.dead-letter"`)
/// - `VISIBILITY_TIMEOUT_SECS`: lease of a received message (default: `30`)
/// - `MAX_DELIVERY_COUNT`: deliveries before dead-lettering (default: `5`)
/// - `WORKERS`: concurrent consumer tasks (default: `2`)
/// - `METRICS_ADDR`: Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `DATABASE_URL`: outbox store; the outbox relay runs only when set
/// - `OUTBOX_POLL_INTERVAL_MS`: pause between outbox scans (default: `500`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub queue_name: String,
    pub dead_letter_queue: String,
    pub visibility_timeout: Duration,
    pub max_delivery_count: u32,
    pub workers: usize,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub database_url: Option<String>,
    pub outbox_poll_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let queue_name = lookup("QUEUE_NAME").unwrap_or(defaults.queue_name);
        let dead_letter_queue =
            lookup("DEAD_LETTER_QUEUE").unwrap_or_else(|| dead_letter_queue_for(&queue_name));
        if dead_letter_queue == queue_name {
            return Err(ConfigError::Invalid {
                key: "DEAD_LETTER_QUEUE",
                value: dead_letter_queue,
                reason: "must differ from QUEUE_NAME".to_string(),
            });
        }

        let workers = parse(&lookup, "WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKERS",
                value: workers.to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        let visibility_secs = parse(
            &lookup,
            "VISIBILITY_TIMEOUT_SECS",
            defaults.visibility_timeout.as_secs(),
        )?;
        if visibility_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "VISIBILITY_TIMEOUT_SECS",
                value: visibility_secs.to_string(),
                reason: "a received message must stay hidden for at least one second".to_string(),
            });
        }

        let poll_interval_ms = parse(
            &lookup,
            "OUTBOX_POLL_INTERVAL_MS",
            defaults.outbox_poll_interval.as_millis() as u64,
        )?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "OUTBOX_POLL_INTERVAL_MS",
                value: poll_interval_ms.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_name,
            dead_letter_queue,
            visibility_timeout: Duration::from_secs(visibility_secs),
            max_delivery_count: parse(&lookup, "MAX_DELIVERY_COUNT", defaults.max_delivery_count)?,
            workers,
            metrics_addr: parse(&lookup, "METRICS_ADDR", defaults.metrics_addr)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            outbox_poll_interval: Duration::from_millis(poll_interval_ms),
        })
    }

    /// Settings shared by every consumer worker.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::new(self.queue_name.clone())
            .with_visibility_timeout(self.visibility_timeout)
            .with_max_delivery_count(self.max_delivery_count)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: "bookings".to_string(),
            dead_letter_queue: dead_letter_queue_for("bookings"),
            visibility_timeout: Duration::from_secs(30),
            max_delivery_count: 5,
            workers: 2,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_level: "info".to_string(),
            database_url: None,
            outbox_poll_interval: Duration::from_millis(500),
        }
    }
}

fn dead_letter_queue_for(queue: &str) -> String {
    format!("{queue}.dead-letter")
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(error) => Err(ConfigError::Invalid {
                key,
                reason: error.to_string(),
                value,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.queue_name, "bookings");
        assert_eq!(config.dead_letter_queue, "bookings.dead-letter");
        assert_eq!(config.visibility_timeout, Duration::from_secs(30));
        assert_eq!(config.max_delivery_count, 5);
        assert_eq!(config.workers, 2);
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.database_url, None);
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_dead_letter_queue_follows_queue_name() {
        let config = load(&[("QUEUE_NAME", "payments")]).unwrap();
        assert_eq!(config.dead_letter_queue, "payments.dead-letter");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("REDIS_URL", "redis://queue:6380"),
            ("DEAD_LETTER_QUEUE", "graveyard"),
            ("VISIBILITY_TIMEOUT_SECS", "5"),
            ("MAX_DELIVERY_COUNT", " 3 "),
            ("WORKERS", "8"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
            ("RUST_LOG", "relay=debug"),
            ("DATABASE_URL", "postgres://relay@db/bookings"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
        ])
        .unwrap();

        assert_eq!(config.redis_url, "redis://queue:6380");
        assert_eq!(config.dead_letter_queue, "graveyard");
        assert_eq!(config.visibility_timeout, Duration::from_secs(5));
        assert_eq!(config.max_delivery_count, 3);
        assert_eq!(config.workers, 8);
        assert_eq!(config.metrics_addr.port(), 9100);
        assert_eq!(config.log_level, "relay=debug");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://relay@db/bookings")
        );
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_unparsable_number_is_rejected() {
        let error = load(&[("MAX_DELIVERY_COUNT", "many")]).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid { key: "MAX_DELIVERY_COUNT", .. }
        ));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let error = load(&[("WORKERS", "0")]).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { key: "WORKERS", .. }));
    }

    #[test]
    fn test_zero_visibility_timeout_is_rejected() {
        let error = load(&[("VISIBILITY_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid { key: "VISIBILITY_TIMEOUT_SECS", .. }
        ));
    }

    #[test]
    fn test_zero_outbox_poll_interval_is_rejected() {
        let error = load(&[("OUTBOX_POLL_INTERVAL_MS", "0")]).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid { key: "OUTBOX_POLL_INTERVAL_MS", .. }
        ));
    }

    #[test]
    fn test_blank_database_url_disables_outbox() {
        let config = load(&[("DATABASE_URL", "  ")]).unwrap();
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn test_dead_letter_queue_must_differ() {
        let error = load(&[("QUEUE_NAME", "q"), ("DEAD_LETTER_QUEUE", "q")]).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid { key: "DEAD_LETTER_QUEUE", .. }
        ));
    }

    #[test]
    fn test_consumer_config() {
        let config = load(&[("VISIBILITY_TIMEOUT_SECS", "12"), ("MAX_DELIVERY_COUNT", "2")])
            .unwrap()
            .consumer_config();
        assert_eq!(config.queue, "bookings");
        assert_eq!(config.visibility_timeout, Duration::from_secs(12));
        assert_eq!(config.max_delivery_count, 2);
    }
}
