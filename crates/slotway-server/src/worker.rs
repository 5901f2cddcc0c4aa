//! Service Worker
//!
//! Consumes one service's bus behind its [`OwnershipGate`] and hands the
//! messages the service may process to a [`MessageHandler`].
//!
//! Each iteration refreshes the gate, drains whatever the gate releases from
//! the parking bus, then reads one bounded batch from the service bus. A
//! batch is acknowledged only after the gate placed its forwarded and parked
//! share and the handler applied the rest.

use crate::bus::MessageBus;
use crate::config::RouteConfig;
use crate::entity::EntityStore;
use crate::migration::OwnershipGate;
use crate::observability::ErrorLogLimiter;
use async_trait::async_trait;
use serde_json::json;
use slotway_core::{BusMessage, Result, RouteError, StatefulEntity};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Applies the messages a service owns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, messages: Vec<BusMessage>) -> Result<()>;
}

/// Handler keeping one entity per key: routed events and control commands
/// create or update it, `RemoveEntity` drops it.
pub struct EntityRecorder {
    entities: Arc<dyn EntityStore>,
}

impl EntityRecorder {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }

    async fn upsert(&self, key: String, payload: serde_json::Value) -> Result<()> {
        let entity = match self.entities.get(&key).await? {
            Some(existing) => existing.updated(payload),
            None => StatefulEntity::new(key, payload),
        };
        self.entities.save(entity).await
    }
}

#[async_trait]
impl MessageHandler for EntityRecorder {
    async fn handle(&self, messages: Vec<BusMessage>) -> Result<()> {
        for message in messages {
            match message {
                BusMessage::Routed { key, event, .. } => {
                    let payload = serde_json::to_value(&event).map_err(|e| RouteError::EntityStore(e.to_string()))?;
                    self.upsert(key, payload).await?;
                }
                BusMessage::ThreadControl { key, command } => {
                    self.upsert(key, json!({ "control": command })).await?;
                }
                BusMessage::RemoveEntity { key } => {
                    self.entities.remove(&[key]).await?;
                }
                other => debug!(kind = other.kind(), "Ignoring message on service bus"),
            }
        }
        Ok(())
    }
}

pub struct ServiceWorker {
    config: RouteConfig,
    input: Arc<dyn MessageBus>,
    gate: Arc<OwnershipGate>,
    handler: Arc<dyn MessageHandler>,
    limiter: ErrorLogLimiter,
}

impl ServiceWorker {
    pub fn new(
        config: RouteConfig,
        input: Arc<dyn MessageBus>,
        gate: Arc<OwnershipGate>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let limiter = ErrorLogLimiter::new(config.error_log_interval);
        Self {
            config,
            input,
            gate,
            handler,
            limiter,
        }
    }

    /// Consume until `stop` flips to true or a non retryable error occurs.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!(service = %self.gate.service(), bus = %self.input.name(), "Service worker started");
        let result = loop {
            if *stop.borrow_and_update() {
                break Ok(());
            }
            let step = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                step = self.step() => step,
            };
            if let Err(e) = step {
                if let Err(fatal) = self.retry_later(&e).await {
                    break Err(fatal);
                }
            }
        };
        match &result {
            Ok(()) => info!(service = %self.gate.service(), "Service worker stopped"),
            Err(e) => error!(service = %self.gate.service(), code = e.code(), error = %e, "Service worker failed"),
        }
        result
    }

    async fn step(&mut self) -> Result<()> {
        self.gate.refresh().await?;

        while let Some(released) = self.gate.release_parked(self.config.max_fetch).await? {
            if !released.is_empty() {
                self.handler.handle(released).await?;
            }
            self.gate.ack_parked().await?;
        }

        let batch = self.input.read(self.config.max_fetch).await?;
        if batch.is_empty() {
            return Ok(());
        }
        let local = self.gate.admit(batch).await?;
        if !local.is_empty() {
            self.handler.handle(local).await?;
        }
        self.input.ack().await?;
        Ok(())
    }

    async fn retry_later(&mut self, error: &RouteError) -> Result<()> {
        if !error.is_retryable() {
            return Err(error.clone());
        }
        if let Some(suppressed) = self.limiter.admit("worker_step") {
            warn!(
                service = %self.gate.service(),
                error = %error,
                suppressed = suppressed,
                "Service worker iteration failed, retrying"
            );
        }
        tokio::time::sleep(self.config.retry_delay).await;
        Ok(())
    }
}

/// Control handle of a spawned worker.
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.task
            .await
            .map_err(|e| RouteError::Coordinator(format!("service worker task ended abnormally: {e}")))?
    }
}

pub fn spawn_service_worker(worker: ServiceWorker) -> WorkerHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(worker.run(stop_rx));
    WorkerHandle { stop, task }
}
