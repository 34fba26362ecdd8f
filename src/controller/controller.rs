//! Controller construction, the work queue and the sync handler
//!
//! Watch events on Canary resources are translated into deduplicated work
//! items; a configurable number of workers drain the queue into
//! [`Controller::sync_handler`], which validates the spec, initializes the
//! status, manages the deletion finalizer and stores the object into the
//! in-memory canaries map consumed by the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::analysis::RateLimiter;
use super::clock::Clock;
use super::events::EventRecorder;
use super::scheduler::CanaryJob;
use super::validation::verify_canary;
use super::webhook::HookClient;
use crate::client::{CanaryClient, ClientError};
use crate::crd::{Canary, CanaryPhase, DetailedCondition};
use crate::metrics::MetricProviderFactory;
use crate::notifier::{Notifier, NotifierFactory};
use crate::router::RouterTable;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::SharedMetrics;
use crate::workload::{WorkloadError, WorkloadTable};

/// Finalizer token guarding revert-on-deletion canaries
pub const FINALIZER: &str = "finalizer.silta.io";

/// Concurrent alert deliveries before alerts are dropped
const ALERT_DISPATCH_PERMITS: usize = 32;

/// Metric queries per second across all canaries
const METRIC_QUERIES_PER_SECOND: f64 = 10.0;

/// Errors surfaced by the sync handler
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid work queue key: {0}")]
    InvalidKey(String),

    #[error("invalid canary spec: {0}")]
    Validation(String),

    #[error("no workload controller registered for kind {0}")]
    UnsupportedKind(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Workload(#[from] WorkloadError),
}

/// Controller-wide settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Router family used when a canary does not declare `spec.provider`
    pub mesh_provider: String,

    /// Interval of the scheduler tick reconciling the jobs map
    pub schedule_window: std::time::Duration,

    /// Controller-wide event webhook; empty disables mirroring
    pub event_webhook: String,

    /// Cluster name attached to alerts; empty omits the field
    pub cluster_name: String,

    /// Reject cross-namespace metric template and alert provider references
    pub no_cross_namespace_refs: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mesh_provider: "kubernetes".to_string(),
            schedule_window: std::time::Duration::from_secs(10),
            event_webhook: String::new(),
            cluster_name: String::new(),
            no_cross_namespace_refs: false,
        }
    }
}

/// Cluster-facing collaborators injected at construction
///
/// All handles are immutable after construction; the scheduler never builds
/// collaborators on its own.
pub struct Collaborators {
    pub workloads: WorkloadTable,
    pub routers: RouterTable,
    pub metric_factory: Arc<dyn MetricProviderFactory>,
    /// Process-wide notifier used when a canary declares no alert routing
    pub notifier: Option<Arc<dyn Notifier>>,
    pub notifier_factory: Arc<dyn NotifierFactory>,
    pub hook_client: Arc<dyn HookClient>,
    pub event_recorder: Arc<dyn EventRecorder>,
}

/// The canary scheduler
pub struct Controller {
    pub(crate) client: Arc<dyn CanaryClient>,
    kube: Option<kube::Client>,
    pub(crate) workloads: WorkloadTable,
    pub(crate) routers: RouterTable,
    pub(crate) metric_factory: Arc<dyn MetricProviderFactory>,
    pub(crate) notifier: Option<Arc<dyn Notifier>>,
    pub(crate) notifier_factory: Arc<dyn NotifierFactory>,
    pub(crate) hook_client: Arc<dyn HookClient>,
    pub(crate) event_recorder: Arc<dyn EventRecorder>,
    pub(crate) metrics: SharedMetrics,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ControllerConfig,

    /// Synced canaries keyed by `<name>.<namespace>`; written by the sync
    /// handler and the delete event handler, read by the scheduler
    pub(crate) canaries: DashMap<String, Canary>,

    /// Per-canary jobs; touched only by the scheduler tick
    pub(crate) jobs: StdMutex<HashMap<String, CanaryJob>>,

    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    pending: DashSet<String>,

    /// Process-wide token bucket for metric provider calls
    pub(crate) rate_limiter: RateLimiter,

    /// Bounded pool for fire-and-forget alert deliveries
    pub(crate) alert_permits: Arc<Semaphore>,
}

impl Controller {
    /// Build a controller around the injected collaborators.
    ///
    /// The result is typically wrapped in an `Arc` and handed to
    /// [`Controller::run`]; tests drive [`Controller::sync_handler`] and the
    /// advance loop directly.
    pub fn new(
        client: Arc<dyn CanaryClient>,
        collaborators: Collaborators,
        config: ControllerConfig,
        metrics: SharedMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            client,
            kube: None,
            workloads: collaborators.workloads,
            routers: collaborators.routers,
            metric_factory: collaborators.metric_factory,
            notifier: collaborators.notifier,
            notifier_factory: collaborators.notifier_factory,
            hook_client: collaborators.hook_client,
            event_recorder: collaborators.event_recorder,
            metrics,
            clock,
            config,
            canaries: DashMap::new(),
            jobs: StdMutex::new(HashMap::new()),
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            pending: DashSet::new(),
            rate_limiter: RateLimiter::new(METRIC_QUERIES_PER_SECOND, 10),
            alert_permits: Arc::new(Semaphore::new(ALERT_DISPATCH_PERMITS)),
        }
    }

    /// Attach a kube client so `run` can watch Canary resources.
    ///
    /// Without it the work queue is fed only through [`Controller::enqueue`].
    pub fn with_watcher(mut self, kube: kube::Client) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Run the operator: the watch-driven enqueuer, `threadiness` queue
    /// workers and the scheduler tick, until the shutdown signal fires.
    pub async fn run(self: &Arc<Self>, threadiness: usize, mut shutdown: ShutdownSignal) {
        info!("Starting operator");

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if let Some(kube) = self.kube.clone() {
            let ctrl = self.clone();
            let signal = shutdown.clone();
            handles.push(tokio::spawn(async move {
                ctrl.run_watcher(kube, signal).await;
            }));
        }

        for _ in 0..threadiness.max(1) {
            let ctrl = self.clone();
            let signal = shutdown.clone();
            handles.push(tokio::spawn(async move {
                ctrl.run_worker(signal).await;
            }));
        }

        info!("Started operator workers");

        let mut ticker = tokio::time::interval(self.config.schedule_window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.schedule_canaries().await,
                _ = shutdown.wait() => break,
            }
        }

        info!("Shutting down operator workers");
        self.stop_all_jobs();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Queue a canary for syncing; duplicate keys collapse until drained
    pub fn enqueue(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        if self.pending.insert(key.clone()) {
            // Receiver closed means we are shutting down; nothing to do
            let _ = self.queue_tx.send(key);
        }
    }

    async fn run_worker(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        loop {
            let key = {
                let mut queue = self.queue_rx.lock().await;
                tokio::select! {
                    _ = shutdown.wait() => return,
                    key = queue.recv() => match key {
                        Some(key) => key,
                        None => return,
                    },
                }
            };
            self.pending.remove(&key);
            if let Err(e) = self.sync_handler(&key).await {
                warn!(key = %key, error = %e, "Error syncing canary");
            }
        }
    }

    async fn run_watcher(self: Arc<Self>, kube: kube::Client, mut shutdown: ShutdownSignal) {
        let api: Api<Canary> = Api::all(kube);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_watch_event(event).await,
                    Some(Err(e)) => warn!(error = %e, "Canary watch error"),
                    None => break,
                },
            }
        }
    }

    async fn handle_watch_event(&self, event: watcher::Event<Canary>) {
        match event {
            watcher::Event::Apply(canary) | watcher::Event::InitApply(canary) => {
                self.observe_canary(canary).await;
            }
            watcher::Event::Delete(canary) => {
                info!(canary = %canary.qualified_name(), "Deleting canary from cache");
                self.canaries.remove(&canary.qualified_name());
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Translate an applied object into work, comparing against the cached
    /// copy to skip status-only updates.
    async fn observe_canary(&self, canary: Canary) {
        let Some(name) = canary.metadata.name.clone() else {
            return;
        };
        let Some(namespace) = canary.metadata.namespace.clone() else {
            return;
        };

        let previous = self
            .canaries
            .get(&canary.qualified_name())
            .map(|entry| entry.value().clone());

        match previous {
            None => self.enqueue(&namespace, &name),
            Some(old) => {
                if old.spec != canary.spec {
                    debug!(canary = %canary.qualified_name(), "Spec diff detected");

                    // Renaming the generated service leaves the old routes behind
                    if old.spec.service.name.is_some()
                        && old.spec.service.name != canary.spec.service.name
                    {
                        warn!(
                            canary = %canary.qualified_name(),
                            new = canary.spec.service.name.as_deref().unwrap_or_default(),
                            old = old.spec.service.name.as_deref().unwrap_or_default(),
                            "The service name changed, remove the old service objects \
                             to avoid routing conflicts"
                        );
                    }

                    self.enqueue(&namespace, &name);
                } else if (canary.is_marked_for_deletion() && has_finalizer(&canary))
                    || (!has_finalizer(&canary) && canary.spec.revert_on_deletion)
                {
                    // Deletion needs finalizing, or the finalizer is missing
                    self.enqueue(&namespace, &name);
                }

                if old.spec.revert_on_deletion && !canary.spec.revert_on_deletion {
                    info!(canary = %canary.qualified_name(), "Opting out, deleting finalizers");
                    if let Err(e) = self.client.remove_finalizer(&canary, FINALIZER).await {
                        warn!(
                            canary = %canary.qualified_name(),
                            error = %e,
                            "Failed to remove finalizers"
                        );
                    }
                }
            }
        }
    }

    /// Sync one canary from the work queue: validate, finalize deletions,
    /// initialize status, store into the canaries map, manage the finalizer.
    pub async fn sync_handler(&self, key: &str) -> Result<(), SyncError> {
        let (namespace, name) = key
            .split_once('/')
            .ok_or_else(|| SyncError::InvalidKey(key.to_string()))?;

        let canary = match self.client.get_canary(namespace, name).await {
            Ok(canary) => canary,
            Err(e) if e.is_not_found() => {
                warn!(key = %key, "Canary in work queue no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.apply_validation(&canary).await?;

        // Finalize if the canary was marked for deletion and revert is desired
        if canary.spec.revert_on_deletion && canary.is_marked_for_deletion() {
            if !has_finalizer(&canary) {
                info!(canary = %canary.qualified_name(), "Canary has been finalized");
                return Ok(());
            }

            if canary.status_or_default().phase != CanaryPhase::Terminated {
                self.finalize(&canary).await?;
            }

            self.client.remove_finalizer(&canary, FINALIZER).await?;
            self.record_event_info(
                &canary,
                &format!("Terminated canary {}", canary.qualified_name()),
            )
            .await;
            info!(canary = %canary.qualified_name(), "Canary marked for deletion processed");
            return Ok(());
        }

        // Set the initial status conditions for new canaries
        if canary
            .status
            .as_ref()
            .map(|s| s.conditions.is_none())
            .unwrap_or(true)
        {
            self.set_phase_initializing(&canary).await?;
        }

        self.canaries
            .insert(canary.qualified_name(), canary.clone());

        if canary.spec.revert_on_deletion && !has_finalizer(&canary) {
            self.client.add_finalizer(&canary, FINALIZER).await?;
        }

        info!(key = %key, "Synced canary");
        Ok(())
    }

    /// Run validation and maintain the `Valid` condition.
    async fn apply_validation(&self, canary: &Canary) -> Result<(), SyncError> {
        let now = self.clock.now();
        match verify_canary(canary, self.config.no_cross_namespace_refs) {
            Ok(()) => {
                // Heal a previously recorded validation failure
                let was_invalid = canary
                    .status_or_default()
                    .condition(crate::crd::status::CONDITION_VALID)
                    .map(|c| c.status == "False")
                    .unwrap_or(false);
                if was_invalid {
                    let mut updated = canary.clone();
                    let mut status = updated.status_or_default();
                    status.set_condition(DetailedCondition::valid(Vec::new(), Vec::new(), now));
                    updated.status = Some(status);
                    if let Err(e) = self.client.update_status(&updated).await {
                        warn!(
                            canary = %canary.qualified_name(),
                            error = %e,
                            "Failed to clear validation condition"
                        );
                    }
                }
                Ok(())
            }
            Err(errors) => {
                let message = errors.join("; ");
                self.record_event_warning(canary, &format!("Invalid canary spec: {message}"))
                    .await;

                let mut updated = canary.clone();
                let mut status = updated.status_or_default();
                status.set_condition(DetailedCondition::valid(errors, Vec::new(), now));
                updated.status = Some(status);
                if let Err(e) = self.client.update_status(&updated).await {
                    warn!(
                        canary = %canary.qualified_name(),
                        error = %e,
                        "Failed to record validation condition"
                    );
                }
                Err(SyncError::Validation(message))
            }
        }
    }

    /// Stamp `Initializing` with a fresh `Promoted` condition on first sight.
    async fn set_phase_initializing(&self, canary: &Canary) -> Result<(), SyncError> {
        let now = self.clock.now();
        let mut updated = canary.clone();
        let mut status = updated.status_or_default();
        status.phase = CanaryPhase::Initializing;
        status.last_transition_time = Some(now.to_rfc3339());
        status.set_condition(DetailedCondition::promoted(CanaryPhase::Initializing, now));
        updated.status = Some(status);
        self.client.update_status(&updated).await?;
        Ok(())
    }

    /// Revert the primary, scale the canary down and mark the object
    /// `Terminated` so the finalizer can be removed.
    async fn finalize(&self, canary: &Canary) -> Result<(), SyncError> {
        let workload = self
            .workloads
            .controller_for(&canary.spec.target_ref)
            .ok_or_else(|| SyncError::UnsupportedKind(canary.spec.target_ref.kind.clone()))?;

        let mut updated = canary.clone();
        let mut status = updated.status_or_default();
        status.phase = CanaryPhase::Terminating;
        status.last_transition_time = Some(self.clock.now().to_rfc3339());
        updated.status = Some(status);
        let mut updated = self.client.update_status(&updated).await?;

        // Route everything back to the primary before touching the workload
        let provider = updated
            .spec
            .provider
            .clone()
            .unwrap_or_else(|| self.config.mesh_provider.clone());
        if let Some(mesh_router) = self.routers.mesh_router(&provider) {
            if let Err(e) = mesh_router
                .set_routes(&updated, super::strategy::TOTAL_WEIGHT, 0, false)
                .await
            {
                warn!(
                    canary = %updated.qualified_name(),
                    error = %e,
                    "Failed to revert routing during finalization"
                );
            }
        }

        workload.finalize(&updated).await?;
        workload.scale_to_zero(&updated).await?;

        let mut status = updated.status_or_default();
        status.phase = CanaryPhase::Terminated;
        status.canary_weight = 0;
        status.last_transition_time = Some(self.clock.now().to_rfc3339());
        updated.status = Some(status);
        self.client.update_status(&updated).await?;

        info!(canary = %canary.qualified_name(), "Finalization complete");
        Ok(())
    }
}

/// Whether the object carries the silta finalizer token
pub(crate) fn has_finalizer(canary: &Canary) -> bool {
    canary
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|t| t == FINALIZER))
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;

