//! Reconciliation scheduling
//!
//! The scheduler decides when to reconcile, the reconciler decides how.
//! Work is prompted two ways: registry change events name a namespace
//! directly, and a periodic sweep catches anything an event missed by
//! reconciling namespaces whose last successful pass is older than the
//! reconcile period.
//!
//! All scheduled work is gated on the registry having been ready at least
//! once, so a controller that starts before its registry does not spin
//! against a dead endpoint. The gate only latches startup: after it opens,
//! every sweep and event reconcile re-checks live readiness and defers
//! while the registry is away.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::reconciler::Reconciler;
use crate::registry::{Endpoint, Registry, RegistryEvent, ResourceRef};
use crate::{Result, RESOURCE_KIND_SERVICE};

/// What prompted a namespace reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A registry change event named the namespace
    Event,
    /// The periodic sweep found the namespace stale
    Period,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Event => f.write_str("event"),
            Trigger::Period => f.write_str("period"),
        }
    }
}

/// Drives the reconciler from registry events and a staleness sweep
pub struct Scheduler {
    registry: Arc<dyn Registry>,
    reconciler: Arc<dyn Reconciler>,
    /// Last successful reconcile per namespace. Failed passes leave the
    /// stamp untouched so the next sweep retries them.
    last_reconciled: DashMap<String, Instant>,
    ready_tx: watch::Sender<bool>,
    reconcile_period: Duration,
    check_interval: Duration,
    error_backoff: Duration,
}

impl Scheduler {
    /// Build a scheduler; intervals come from `config`
    pub fn new(
        registry: Arc<dyn Registry>,
        reconciler: Arc<dyn Reconciler>,
        config: &Config,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            registry,
            reconciler,
            last_reconciled: DashMap::new(),
            ready_tx,
            reconcile_period: config.reconcile_period(),
            check_interval: config.check_interval(),
            error_backoff: config.error_backoff(),
        }
    }

    /// Spawn the scheduler's tasks. The returned receiver yields the first
    /// fatal error; resolve it to shut the process down.
    ///
    /// The event subscription is taken before this returns, so an event
    /// published any time after `start` cannot land on an empty channel
    /// and be discarded.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> oneshot::Receiver<Error> {
        let (fatal_tx, fatal_rx) = oneshot::channel();

        let events = self.registry.subscribe();
        let scheduler = Arc::clone(self);
        let events_cancel = cancel.clone();
        tokio::spawn(async move { scheduler.dispatch_events(events, events_cancel).await });

        let scheduler = Arc::clone(self);
        tokio::spawn(scheduler.run(cancel.clone(), fatal_tx));

        fatal_rx
    }

    /// Whether the registry has been seen ready at least once
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    async fn dispatch_events(
        &self,
        mut events: broadcast::Receiver<RegistryEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(RegistryEvent::StorageChanged { endpoints }) => {
                    self.on_storage_changed(&endpoints).await;
                }
                Ok(RegistryEvent::ConfigurationChanged { resource }) => {
                    self.on_configuration_changed(&resource).await;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged, registry events dropped");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn on_storage_changed(&self, endpoints: &[Endpoint]) {
        // first contact from the registry doubles as the readiness probe
        if !self.is_ready() && self.registry.ready().await {
            info!("registry is ready, releasing scheduled work");
            self.ready_tx.send_replace(true);
        }
        self.reconciler.propagate_storage_endpoints(endpoints).await;
    }

    async fn on_configuration_changed(&self, resource: &ResourceRef) {
        if resource.kind != RESOURCE_KIND_SERVICE {
            return;
        }
        if !self.is_ready() {
            return;
        }
        // deferred, not failed: the namespace stays unstamped, so the next
        // sweep picks it up once the registry is back
        if !self.registry.ready().await {
            warn!(
                namespace = %resource.namespace,
                "registry is not ready, deferring event reconcile"
            );
            return;
        }
        self.reconcile_namespace(&resource.namespace, Trigger::Event)
            .await;
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken, fatal_tx: oneshot::Sender<Error>) {
        let mut ready = self.ready_tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = ready.wait_for(|ready| *ready) => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let reconciler = Arc::clone(&self.reconciler);
        let monitor_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = reconciler.monitor_cluster(monitor_cancel).await {
                error!(%error, "cluster monitor failed");
                let _ = fatal_tx.send(error);
            }
        });

        self.reconcile_loop(cancel).await;
    }

    async fn reconcile_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            // live readiness, not the startup latch: an outage after
            // startup suspends sweeping until the registry answers again
            if !self.registry.ready().await {
                warn!("registry is not ready, deferring sweep");
                if !self.sleep_or_cancel(self.error_backoff, &cancel).await {
                    return;
                }
                continue;
            }
            let pause = match self.sweep_namespaces().await {
                Ok(()) => self.check_interval,
                Err(error) => {
                    error!(%error, "namespace sweep failed");
                    self.error_backoff
                }
            };
            if !self.sleep_or_cancel(pause, &cancel).await {
                return;
            }
        }
    }

    async fn sweep_namespaces(&self) -> Result<()> {
        info!(period_secs = self.reconcile_period.as_secs(), "sweeping namespaces for staleness");
        let namespaces = self.registry.get_namespaces().await?;
        for namespace in &namespaces {
            if self.needs_reconcile(namespace) {
                self.reconcile_namespace(namespace, Trigger::Period).await;
            }
        }
        Ok(())
    }

    fn needs_reconcile(&self, namespace: &str) -> bool {
        self.last_reconciled
            .get(namespace)
            .map_or(true, |stamp| stamp.elapsed() >= self.reconcile_period)
    }

    async fn reconcile_namespace(&self, namespace: &str, trigger: Trigger) {
        info!(namespace = %namespace, %trigger, "reconciling namespace");
        match self.reconciler.reconcile_namespace(namespace).await {
            Ok(()) => {
                self.last_reconciled
                    .insert(namespace.to_string(), Instant::now());
            }
            Err(error) => {
                error!(namespace = %namespace, %trigger, %error, "namespace reconcile failed");
            }
        }
    }

    /// Returns false when cancelled during the pause
    async fn sleep_or_cancel(&self, pause: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(pause) => true,
        }
    }
}
