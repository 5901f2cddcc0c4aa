//! Slotway Configuration
//!
//! Centralized runtime settings with environment variable overrides. Every
//! duration and batch size used by the dispatch loops and migration tasks is
//! defined here.

use crate::store::keys;
use std::time::Duration;

/// Router dispatch loop settings.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// Inbound bus the router consumes (env: SLOTWAY_ROUTE_INPUT_BUS)
    pub input_bus: String,
    /// Maximum messages read per iteration (env: SLOTWAY_ROUTE_MAX_FETCH)
    pub max_fetch: usize,
    /// Bounded wait of an empty bus read (env: SLOTWAY_POLL_TIMEOUT_MS)
    pub poll_timeout: Duration,
    /// Pause after a retryable failure before the next iteration
    pub retry_delay: Duration,
    /// Minimum spacing of repeated error logs of the same kind
    pub error_log_interval: Duration,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            input_bus: "route-in".to_string(),
            max_fetch: 5000,
            poll_timeout: Duration::from_millis(100),
            retry_delay: Duration::from_millis(100),
            error_log_interval: Duration::from_secs(5),
        }
    }
}

/// Migration coordinator and task settings.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Coordinator and participant polling cadence (env: SLOTWAY_MIGRATION_POLL_MS)
    pub poll_interval: Duration,
    /// Entities read per output scan page
    pub scan_page_size: usize,
    /// Pending entities that force an input `batch_save` (env: SLOTWAY_MIGRATION_BATCH_SIZE)
    pub batch_size: usize,
    /// Messages read per input iteration
    pub max_fetch: usize,
    /// Received counts must stay unchanged this long before cutover
    /// (env: SLOTWAY_MIGRATION_QUIET_MS)
    pub quiet_period: Duration,
    /// Pause after a retryable task failure
    pub retry_delay: Duration,
    pub error_log_interval: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            scan_page_size: 1000,
            batch_size: 5000,
            max_fetch: 5000,
            quiet_period: Duration::from_secs(2),
            retry_delay: Duration::from_millis(100),
            error_log_interval: Duration::from_secs(5),
        }
    }
}

/// Metadata store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,
    /// Key prefix for every record (env: SLOTWAY_KEY_PREFIX)
    pub key_prefix: String,

    // Etcd backoff settings
    /// Initial interval for etcd connection retry
    pub etcd_backoff_initial: Duration,
    /// Maximum interval for etcd connection retry
    pub etcd_backoff_max: Duration,
    /// Maximum elapsed time for etcd connection retries
    pub etcd_backoff_max_elapsed: Duration,
    /// Multiplier for etcd backoff
    pub etcd_backoff_multiplier: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            key_prefix: keys::DEFAULT_PREFIX.to_string(),
            etcd_backoff_initial: Duration::from_secs(1),
            etcd_backoff_max: Duration::from_secs(10),
            etcd_backoff_max_elapsed: Duration::from_secs(60),
            etcd_backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SlotwayConfig {
    pub route: RouteConfig,
    pub migration: MigrationConfig,
    pub store: StoreConfig,
    /// Services known besides those in the slot table; plans may only target
    /// known services (env: SLOTWAY_SERVICES, comma-separated)
    pub services: Vec<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse::<T>().ok())
}

impl SlotwayConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bus) = std::env::var("SLOTWAY_ROUTE_INPUT_BUS") {
            config.route.input_bus = bus;
        }
        if let Some(max_fetch) = env_parse::<usize>("SLOTWAY_ROUTE_MAX_FETCH") {
            config.route.max_fetch = max_fetch.max(1);
        }
        if let Some(ms) = env_parse::<u64>("SLOTWAY_POLL_TIMEOUT_MS") {
            config.route.poll_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("SLOTWAY_MIGRATION_POLL_MS") {
            config.migration.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>("SLOTWAY_MIGRATION_BATCH_SIZE") {
            config.migration.batch_size = size.max(1);
        }
        if let Some(ms) = env_parse::<u64>("SLOTWAY_MIGRATION_QUIET_MS") {
            config.migration.quiet_period = Duration::from_millis(ms);
        }

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.store.etcd_endpoints = endpoints.split(',').map(String::from).collect();
        }
        if let Ok(prefix) = std::env::var("SLOTWAY_KEY_PREFIX") {
            config.store.key_prefix = prefix;
        }
        if let Ok(services) = std::env::var("SLOTWAY_SERVICES") {
            config.services = services
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SlotwayConfig::default();
        assert_eq!(config.route.input_bus, "route-in");
        assert_eq!(config.route.max_fetch, 5000);
        assert_eq!(config.route.error_log_interval, Duration::from_secs(5));
        assert_eq!(config.migration.batch_size, 5000);
        assert_eq!(config.store.key_prefix, "/slotway");
        assert!(config.services.is_empty());
    }
}
