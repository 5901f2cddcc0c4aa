//! Route dispatch loop.
//!
//! Each iteration refreshes the slot table if its version moved, reads one
//! bounded batch from the route-in bus, groups the batch per owning service
//! and acknowledges it only after every destination accepted its share.

use super::{resolve_key, KeyingStrategy, ServiceDirectory};
use crate::bus::{BusRegistry, MessageBus};
use crate::config::RouteConfig;
use crate::observability::{events, metrics, ErrorLogLimiter};
use crate::slots::SlotsManager;
use futures::future::try_join_all;
use serde::Serialize;
use slotway_core::{BusMessage, Result, RouteError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteStatus {
    Init,
    Running,
    Paused,
    Stopped,
}

/// Control handle of a running [`MessageRoute`].
#[derive(Clone)]
pub struct RouteHandle {
    status: Arc<watch::Sender<RouteStatus>>,
    exited: Arc<AtomicBool>,
}

impl RouteHandle {
    fn new() -> Self {
        let (status, _) = watch::channel(RouteStatus::Init);
        Self {
            status: Arc::new(status),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status(&self) -> RouteStatus {
        *self.status.borrow()
    }

    /// Request the loop to exit after the batch in hand.
    pub fn stop(&self) {
        self.status.send_replace(RouteStatus::Stopped);
    }

    /// Suspend reading; returns false if the route is already paused or stopped.
    pub fn pause(&self) -> bool {
        self.status.send_if_modified(|status| match status {
            RouteStatus::Init | RouteStatus::Running => {
                *status = RouteStatus::Paused;
                true
            }
            _ => false,
        })
    }

    /// Resume a paused route.
    pub fn rerun(&self) -> bool {
        self.status.send_if_modified(|status| match status {
            RouteStatus::Paused => {
                *status = RouteStatus::Running;
                true
            }
            _ => false,
        })
    }

    pub fn is_paused(&self) -> bool {
        self.status() == RouteStatus::Paused
    }

    /// True once the dispatch loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

pub struct MessageRoute {
    config: RouteConfig,
    input: Arc<dyn MessageBus>,
    slots: Arc<SlotsManager>,
    directory: Arc<ServiceDirectory>,
    buses: Arc<BusRegistry>,
    strategies: Vec<Arc<dyn KeyingStrategy>>,
    handle: RouteHandle,
    limiter: ErrorLogLimiter,
    routed: u64,
}

impl MessageRoute {
    pub fn new(
        config: RouteConfig,
        input: Arc<dyn MessageBus>,
        slots: Arc<SlotsManager>,
        directory: Arc<ServiceDirectory>,
        buses: Arc<BusRegistry>,
        strategies: Vec<Arc<dyn KeyingStrategy>>,
    ) -> Self {
        let limiter = ErrorLogLimiter::new(config.error_log_interval);
        Self {
            config,
            input,
            slots,
            directory,
            buses,
            strategies,
            handle: RouteHandle::new(),
            limiter,
            routed: 0,
        }
    }

    pub fn handle(&self) -> RouteHandle {
        self.handle.clone()
    }

    /// Run the dispatch loop until stopped or a fatal error occurs.
    pub async fn dispatch(mut self) -> Result<()> {
        let mut status = self.handle.status.subscribe();
        self.handle.status.send_if_modified(|s| {
            if *s == RouteStatus::Init {
                *s = RouteStatus::Running;
                true
            } else {
                false
            }
        });
        info!(
            input_bus = %self.input.name(),
            strategies = self.strategies.len(),
            "Message route started"
        );

        let result = self.run(&mut status).await;

        self.handle.status.send_replace(RouteStatus::Stopped);
        self.handle.exited.store(true, Ordering::SeqCst);
        match &result {
            Ok(()) => events::route_stopped(self.input.name(), self.routed),
            Err(e) => error!(
                input_bus = %self.input.name(),
                code = e.code(),
                error = %e,
                "Message route failed"
            ),
        }
        result
    }

    async fn run(&mut self, status: &mut watch::Receiver<RouteStatus>) -> Result<()> {
        loop {
            let current = *status.borrow_and_update();
            match current {
                RouteStatus::Stopped => return Ok(()),
                RouteStatus::Paused => {
                    debug!("Message route paused");
                    let _ = status.changed().await;
                    continue;
                }
                RouteStatus::Init | RouteStatus::Running => {}
            }

            if let Err(e) = self.slots.refresh_if_stale().await {
                self.retry_later("slot_refresh", &e).await?;
                continue;
            }
            if self.slots.table().is_none() {
                if self.limiter.admit("not_allocated").is_some() {
                    warn!("Slots not allocated yet, holding inbound messages");
                }
                tokio::time::sleep(self.config.poll_timeout).await;
                continue;
            }

            let read = tokio::select! {
                _ = status.changed() => continue,
                read = self.input.read(self.config.max_fetch) => read,
            };
            let batch = match read {
                Ok(batch) => batch,
                Err(e) => {
                    self.retry_later("read", &e.into()).await?;
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            match self.forward(batch).await {
                Ok(count) => self.routed += count,
                Err(e) => {
                    metrics::record_ack_failure();
                    self.retry_later("forward", &e).await?;
                }
            }
        }
    }

    /// Forward one batch grouped by owning service, then acknowledge it.
    async fn forward(&mut self, batch: Vec<BusMessage>) -> Result<u64> {
        let mut outbound: BTreeMap<String, Vec<BusMessage>> = BTreeMap::new();
        for message in batch {
            let Some((key, message)) = self.bind(message) else {
                continue;
            };
            let service = self
                .slots
                .get_service_by_key(&key)
                .ok_or(RouteError::NotAllocated)?;
            outbound.entry(service).or_default().push(message);
        }

        // Every destination resolves before the first write.
        let mut targets = Vec::with_capacity(outbound.len());
        for (service, messages) in outbound {
            let bus = self.resolve_bus(&service)?;
            targets.push((service, bus, messages));
        }

        let writes = targets.into_iter().map(|(service, bus, messages)| async move {
            let count = messages.len();
            bus.write_batch(messages).await?;
            metrics::record_routed(&service, count);
            Ok::<u64, RouteError>(count as u64)
        });
        let forwarded = try_join_all(writes).await?.into_iter().sum();
        self.input.ack().await?;
        Ok(forwarded)
    }

    /// Attach the routing key; events are wrapped with the matching strategy.
    fn bind(&self, message: BusMessage) -> Option<(String, BusMessage)> {
        match message {
            BusMessage::Event(event) => match resolve_key(&self.strategies, &event) {
                Some((strategy, key)) => Some((key.clone(), BusMessage::Routed { strategy, key, event })),
                None => {
                    events::message_dropped("event", "no keying strategy matched");
                    metrics::record_dropped("no_strategy");
                    None
                }
            },
            other => match other.routing_key().map(str::to_string) {
                Some(key) => Some((key, other)),
                None => {
                    events::message_dropped(other.kind(), "message carries no routing key");
                    metrics::record_dropped("no_key");
                    None
                }
            },
        }
    }

    fn resolve_bus(&self, service: &str) -> Result<Arc<dyn MessageBus>> {
        let name = self
            .directory
            .bus_of(service)
            .ok_or_else(|| RouteError::UnknownService(service.to_string()))?;
        Ok(self.buses.require(&name)?)
    }

    /// Back off after a retryable failure; anything else ends the loop.
    async fn retry_later(&mut self, kind: &'static str, error: &RouteError) -> Result<()> {
        if !error.is_retryable() {
            return Err(error.clone());
        }
        if let Some(suppressed) = self.limiter.admit(kind) {
            warn!(
                kind = kind,
                error = %error,
                suppressed = suppressed,
                "Message route iteration failed, retrying"
            );
        }
        tokio::time::sleep(self.config.retry_delay).await;
        Ok(())
    }
}

/// Spawn the dispatch loop as a background task.
pub fn spawn_message_route(route: MessageRoute) -> (RouteHandle, JoinHandle<Result<()>>) {
    let handle = route.handle();
    let task = tokio::spawn(route.dispatch());
    (handle, task)
}
