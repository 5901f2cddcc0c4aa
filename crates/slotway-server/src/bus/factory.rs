//! Bus implementation registry.
//!
//! Migration plans name their bus by implementation identifier plus a
//! [`BusConfig`]; the factory resolves the identifier to a provider and opens
//! the configured channel.

use super::memory::MemoryMessageBus;
use super::MessageBus;
use async_trait::async_trait;
use slotway_core::{BusConfig, BusError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Implementation identifier of the in-memory bus.
pub const MEMORY_BUS: &str = "memory";

/// Option key overriding the memory bus poll timeout, in milliseconds.
const POLL_TIMEOUT_OPTION: &str = "poll_timeout_ms";

/// Opens channels of one bus implementation.
#[async_trait]
pub trait BusProvider: Send + Sync {
    /// Implementation identifier, e.g. `memory`
    fn kind(&self) -> &str;

    async fn open(&self, config: &BusConfig) -> Result<Arc<dyn MessageBus>, BusError>;

    /// Drop a channel that is no longer needed.
    async fn release(&self, name: &str) -> Result<(), BusError>;
}

/// Provider for [`MemoryMessageBus`] channels.
///
/// Opening the same channel name twice yields the same queue, so a writer and
/// a reader configured with one name talk to each other.
pub struct MemoryBusProvider {
    poll_timeout: Duration,
    channels: Mutex<HashMap<String, Arc<MemoryMessageBus>>>,
}

impl MemoryBusProvider {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            poll_timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Concrete handle to a channel, creating it when missing.
    pub fn channel(&self, name: &str, poll_timeout: Duration) -> Arc<MemoryMessageBus> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryMessageBus::new(name, poll_timeout)))
            .clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

#[async_trait]
impl BusProvider for MemoryBusProvider {
    fn kind(&self) -> &str {
        MEMORY_BUS
    }

    async fn open(&self, config: &BusConfig) -> Result<Arc<dyn MessageBus>, BusError> {
        if config.name.is_empty() {
            return Err(BusError::InvalidConfig("channel name is empty".to_string()));
        }
        let poll_timeout = match config.options.get(POLL_TIMEOUT_OPTION) {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| BusError::InvalidConfig(format!("{POLL_TIMEOUT_OPTION}: {e}")))?,
            None => self.poll_timeout,
        };
        let bus = self.channel(&config.name, poll_timeout);
        bus.open().await?;
        debug!(bus = %config.name, "Opened memory bus channel");
        Ok(bus)
    }

    async fn release(&self, name: &str) -> Result<(), BusError> {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(bus) = removed {
            bus.close().await?;
        }
        Ok(())
    }
}

/// Registry of bus providers keyed by implementation identifier.
#[derive(Default)]
pub struct BusFactory {
    providers: RwLock<HashMap<String, Arc<dyn BusProvider>>>,
}

impl BusFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the memory provider registered.
    pub fn with_memory(poll_timeout: Duration) -> Self {
        let factory = Self::new();
        factory.register(Arc::new(MemoryBusProvider::new(poll_timeout)));
        factory
    }

    pub fn register(&self, provider: Arc<dyn BusProvider>) {
        let kind = provider.kind().to_string();
        info!(kind = %kind, "Registered message bus implementation");
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, provider);
    }

    pub fn provider(&self, kind: &str) -> Result<Arc<dyn BusProvider>, BusError> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
            .ok_or_else(|| BusError::UnknownImplementation(kind.to_string()))
    }

    pub async fn open(&self, kind: &str, config: &BusConfig) -> Result<Arc<dyn MessageBus>, BusError> {
        self.provider(kind)?.open(config).await
    }

    pub async fn release(&self, kind: &str, name: &str) -> Result<(), BusError> {
        self.provider(kind)?.release(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotway_core::{BusMessage, EventMessage};

    #[tokio::test]
    async fn test_same_name_shares_queue() {
        let factory = BusFactory::with_memory(Duration::from_millis(10));
        let writer = factory.open(MEMORY_BUS, &BusConfig::named("migration.c")).await.unwrap();
        let reader = factory.open(MEMORY_BUS, &BusConfig::named("migration.c")).await.unwrap();

        writer
            .write(BusMessage::Event(EventMessage::new("x")))
            .await
            .unwrap();
        assert_eq!(reader.read(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_implementation() {
        let factory = BusFactory::with_memory(Duration::from_millis(10));
        let err = factory
            .open("kafka", &BusConfig::named("migration"))
            .await
            .err()
            .unwrap();
        assert_eq!(err, BusError::UnknownImplementation("kafka".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let factory = BusFactory::with_memory(Duration::from_millis(10));
        assert!(matches!(
            factory.open(MEMORY_BUS, &BusConfig::named("")).await,
            Err(BusError::InvalidConfig(_))
        ));

        let mut config = BusConfig::named("migration");
        config.options.insert(POLL_TIMEOUT_OPTION.to_string(), "soon".to_string());
        assert!(matches!(
            factory.open(MEMORY_BUS, &config).await,
            Err(BusError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_release_closes_channel() {
        let provider = MemoryBusProvider::new(Duration::from_millis(10));
        let bus = provider.open(&BusConfig::named("migration.b")).await.unwrap();
        assert!(provider.contains("migration.b"));
        provider.release("migration.b").await.unwrap();
        assert!(!provider.contains("migration.b"));
        assert!(!bus.is_open());
    }
}
