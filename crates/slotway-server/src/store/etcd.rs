//! etcd backed metadata store.
//!
//! Each record sits next to a small guard key holding its version (slot table)
//! or revision (migration record) as decimal text. Writes are transactions
//! that compare the guard against the value the writer read and update guard
//! and record together.

use super::MetaStore;
use crate::config::StoreConfig;
use anyhow::anyhow;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp};
use serde::Serialize;
use slotway_core::{MigrationRecord, Result, RouteError, SlotTable};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Key layout below the configured prefix.
pub mod keys {
    pub const DEFAULT_PREFIX: &str = "/slotway";
    pub const SLOTS_VERSION: &str = "/slots/version";
    pub const SLOTS_TABLE: &str = "/slots/table";
    pub const MIGRATION_REVISION: &str = "/migration/revision";
    pub const MIGRATION_RECORD: &str = "/migration/record";

    /// Join a prefix and a key suffix without doubling the separator.
    pub fn join(prefix: &str, suffix: &str) -> String {
        format!("{}{}", prefix.trim_end_matches('/'), suffix)
    }
}

fn store_error(e: impl std::fmt::Display) -> RouteError {
    RouteError::Store(e.to_string())
}

fn encode(value: &impl Serialize) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(store_error)
}

pub struct EtcdMetaStore {
    client: Arc<RwLock<Client>>,
    prefix: String,
}

impl EtcdMetaStore {
    pub fn new(client: Arc<RwLock<Client>>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// Connect with exponential backoff.
    pub async fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        let backoff = ExponentialBackoff {
            initial_interval: config.etcd_backoff_initial,
            max_interval: config.etcd_backoff_max,
            max_elapsed_time: Some(config.etcd_backoff_max_elapsed),
            multiplier: config.etcd_backoff_multiplier,
            ..Default::default()
        };
        let endpoints = config.etcd_endpoints.clone();

        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to connect to etcd after retries: {:?}", e))?;

        info!(endpoints = ?config.etcd_endpoints, prefix = %config.key_prefix, "Connected to etcd");
        Ok(Self::new(Arc::new(RwLock::new(client)), config.key_prefix.clone()))
    }

    fn key(&self, suffix: &str) -> String {
        keys::join(&self.prefix, suffix)
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await.map_err(store_error)?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_counter(&self, key: &str) -> Result<u64> {
        match self.get_value(key).await? {
            Some(raw) => std::str::from_utf8(&raw)
                .map_err(store_error)?
                .parse::<u64>()
                .map_err(store_error),
            None => Ok(0),
        }
    }

    /// Apply `writes` if the guard key still holds `expected` (0 = absent).
    async fn guarded_put(&self, guard_key: &str, expected: u64, writes: Vec<(String, Vec<u8>)>) -> Result<bool> {
        let compare = if expected == 0 {
            Compare::create_revision(guard_key, CompareOp::Equal, 0)
        } else {
            Compare::value(guard_key, CompareOp::Equal, expected.to_string())
        };
        let ops = writes
            .into_iter()
            .map(|(key, value)| TxnOp::put(key, value, None))
            .collect::<Vec<_>>();
        let txn = Txn::new().when(vec![compare]).and_then(ops);

        let mut client = self.client.write().await;
        let resp = client.txn(txn).await.map_err(store_error)?;
        Ok(resp.succeeded())
    }
}

#[async_trait]
impl MetaStore for EtcdMetaStore {
    async fn load_slot_table(&self) -> Result<Option<SlotTable>> {
        match self.get_value(&self.key(keys::SLOTS_TABLE)).await? {
            Some(raw) => serde_json::from_slice(&raw).map(Some).map_err(store_error),
            None => Ok(None),
        }
    }

    async fn slot_table_version(&self) -> Result<u64> {
        self.get_counter(&self.key(keys::SLOTS_VERSION)).await
    }

    async fn insert_slot_table(&self, table: &SlotTable) -> Result<()> {
        let version_key = self.key(keys::SLOTS_VERSION);
        let writes = vec![
            (version_key.clone(), table.version.to_string().into_bytes()),
            (self.key(keys::SLOTS_TABLE), encode(table)?),
        ];
        if self.guarded_put(&version_key, 0, writes).await? {
            debug!(version = table.version, "Slot table inserted");
            Ok(())
        } else {
            Err(RouteError::AlreadyAllocated)
        }
    }

    async fn replace_slot_table(&self, expected_version: u64, table: &SlotTable) -> Result<()> {
        let version_key = self.key(keys::SLOTS_VERSION);
        if table.version <= expected_version {
            return Err(RouteError::VersionConflict {
                expected: expected_version,
                found: table.version,
            });
        }
        let writes = vec![
            (version_key.clone(), table.version.to_string().into_bytes()),
            (self.key(keys::SLOTS_TABLE), encode(table)?),
        ];
        if self.guarded_put(&version_key, expected_version, writes).await? {
            debug!(from = expected_version, to = table.version, "Slot table replaced");
            Ok(())
        } else {
            let found = self.slot_table_version().await?;
            Err(RouteError::VersionConflict {
                expected: expected_version,
                found,
            })
        }
    }

    async fn load_migration(&self) -> Result<Option<MigrationRecord>> {
        match self.get_value(&self.key(keys::MIGRATION_RECORD)).await? {
            Some(raw) => serde_json::from_slice(&raw).map(Some).map_err(store_error),
            None => Ok(None),
        }
    }

    async fn migration_revision(&self) -> Result<u64> {
        self.get_counter(&self.key(keys::MIGRATION_REVISION)).await
    }

    async fn create_migration(&self, record: &MigrationRecord) -> Result<MigrationRecord> {
        if let Some(existing) = self.load_migration().await? {
            if !existing.state.is_terminal() {
                return Err(RouteError::AlreadyExist);
            }
        }
        let previous = self.migration_revision().await?;
        let mut stored = record.clone();
        stored.revision = previous + 1;

        let revision_key = self.key(keys::MIGRATION_REVISION);
        let writes = vec![
            (revision_key.clone(), stored.revision.to_string().into_bytes()),
            (self.key(keys::MIGRATION_RECORD), encode(&stored)?),
        ];
        if self.guarded_put(&revision_key, previous, writes).await? {
            Ok(stored)
        } else {
            Err(RouteError::AlreadyExist)
        }
    }

    async fn save_migration(&self, record: &MigrationRecord) -> Result<MigrationRecord> {
        if record.revision == 0 {
            return Err(RouteError::NotFound);
        }
        let mut stored = record.clone();
        stored.revision = record.revision + 1;

        let revision_key = self.key(keys::MIGRATION_REVISION);
        let writes = vec![
            (revision_key.clone(), stored.revision.to_string().into_bytes()),
            (self.key(keys::MIGRATION_RECORD), encode(&stored)?),
        ];
        if self.guarded_put(&revision_key, record.revision, writes).await? {
            Ok(stored)
        } else {
            match self.migration_revision().await? {
                0 => Err(RouteError::NotFound),
                found => Err(RouteError::VersionConflict {
                    expected: record.revision,
                    found,
                }),
            }
        }
    }

    /// Remove the record and move the revision guard forward, so caches keyed
    /// on the revision notice the removal and a later plan gets a fresh
    /// revision.
    async fn delete_migration(&self) -> Result<()> {
        let revision_key = self.key(keys::MIGRATION_REVISION);
        let current = self.migration_revision().await?;
        if current == 0 {
            return Ok(());
        }
        let txn = Txn::new()
            .when(vec![Compare::value(
                revision_key.as_str(),
                CompareOp::Equal,
                current.to_string(),
            )])
            .and_then(vec![
                TxnOp::put(revision_key.as_str(), (current + 1).to_string(), None),
                TxnOp::delete(self.key(keys::MIGRATION_RECORD), None),
            ]);
        let succeeded = {
            let mut client = self.client.write().await;
            client.txn(txn).await.map_err(store_error)?.succeeded()
        };
        if succeeded {
            Ok(())
        } else {
            Err(RouteError::VersionConflict {
                expected: current,
                found: self.migration_revision().await?,
            })
        }
    }
}
