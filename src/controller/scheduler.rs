//! Scheduler root: per-canary jobs
//!
//! A periodic tick synchronises the canaries map with the jobs map: new
//! canaries get a job firing at their declared analysis interval (capped at
//! 30s), interval changes replace the job, vanished canaries have their jobs
//! stopped. Each job independently drives the advance loop for one canary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::Controller;
use crate::crd::Canary;

/// Upper bound for the job tick; longer analysis intervals are throttled
/// inside the advance loop instead, so revision changes are still noticed
/// promptly.
const MAX_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Tick period for a declared analysis interval
fn tick_interval(analysis_interval: Duration) -> Duration {
    analysis_interval.min(MAX_TICK_INTERVAL)
}

/// One scheduled canary: a ticker task plus its stop signal
pub(crate) struct CanaryJob {
    pub(crate) analysis_interval: Duration,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CanaryJob {
    pub(crate) fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for CanaryJob {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.handle.abort();
    }
}

impl Controller {
    /// Synchronise the jobs map with the canaries map.
    ///
    /// Called on every scheduler window tick:
    /// 1. ensure a job exists per canary, recreating it when the declared
    ///    interval changed;
    /// 2. stop jobs whose canaries vanished;
    /// 3. flag multiple canaries sharing one target;
    /// 4. refresh the per-namespace totals gauge.
    pub(crate) async fn schedule_canaries(self: &Arc<Self>) {
        let mut current: HashMap<String, String> = HashMap::new();
        let mut stats: HashMap<String, i64> = HashMap::new();

        let snapshot: Vec<(String, Canary)> = self
            .canaries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, canary) in &snapshot {
            let namespace = canary.metadata.namespace.clone().unwrap_or_default();
            current.insert(
                key.clone(),
                format!("{}.{}", canary.spec.target_ref.name, namespace),
            );
            *stats.entry(namespace).or_insert(0) += 1;

            let analysis_interval = canary.analysis_interval();
            enum Action {
                Keep,
                Create,
                Replace,
            }
            let action = {
                let jobs = self.jobs.lock().expect("jobs lock poisoned");
                match jobs.get(key) {
                    Some(job) if job.analysis_interval == analysis_interval => Action::Keep,
                    Some(_) => Action::Replace,
                    None => Action::Create,
                }
            };

            match action {
                Action::Keep => {}
                Action::Replace => {
                    debug!(canary = %key, "Analysis interval changed, replacing job");
                    if let Some(job) = self.jobs.lock().expect("jobs lock poisoned").remove(key) {
                        job.stop();
                    }
                    let job = self.spawn_job(canary, analysis_interval);
                    self.jobs
                        .lock()
                        .expect("jobs lock poisoned")
                        .insert(key.clone(), job);
                }
                Action::Create => {
                    // Seed the gauges so dashboards see the canary before its
                    // first tick fires
                    self.record_canary_metrics(canary).await;
                    let job = self.spawn_job(canary, analysis_interval);
                    self.jobs
                        .lock()
                        .expect("jobs lock poisoned")
                        .insert(key.clone(), job);
                }
            }
        }

        // Stop jobs whose canaries vanished from the map
        let stale: Vec<String> = {
            let jobs = self.jobs.lock().expect("jobs lock poisoned");
            jobs.keys()
                .filter(|key| !current.contains_key(*key))
                .cloned()
                .collect()
        };
        for key in stale {
            if let Some(job) = self.jobs.lock().expect("jobs lock poisoned").remove(&key) {
                job.stop();
            }
        }

        // Multiple canaries guarding one target fight over routing
        for (canary_key, target) in &current {
            for (other_key, other_target) in &current {
                if canary_key != other_key && target == other_target {
                    error!(
                        canary = %canary_key,
                        "Bad things will happen! Found more than one canary \
                         with the same target {target}"
                    );
                }
            }
        }

        for (namespace, count) in stats {
            self.metrics.set_total(&namespace, count);
        }
    }

    fn spawn_job(self: &Arc<Self>, canary: &Canary, analysis_interval: Duration) -> CanaryJob {
        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let period = tick_interval(analysis_interval);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; consume it so ticks
            // land one full period apart from job creation
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(ctrl) = weak.upgrade() else { break };
                        ctrl.advance_canary(&name, &namespace).await;
                    }
                }
            }
        });

        CanaryJob {
            analysis_interval,
            stop: stop_tx,
            handle,
        }
    }

    pub(crate) fn stop_all_jobs(&self) {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        for (_, job) in jobs.drain() {
            job.stop();
        }
    }

    /// Refresh status and weight gauges for a canary outside its tick.
    async fn record_canary_metrics(&self, canary: &Canary) {
        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let canary = match self.client.get_canary(&namespace, &name).await {
            Ok(c) => c,
            Err(e) => {
                error!(canary = %format!("{name}.{namespace}"), error = %e, "Canary not found");
                return;
            }
        };

        self.metrics
            .set_status(&canary, canary.status_or_default().phase);

        let provider = canary
            .spec
            .provider
            .clone()
            .unwrap_or_else(|| self.config.mesh_provider.clone());
        let Some(mesh_router) = self.routers.mesh_router(&provider) else {
            return;
        };
        match mesh_router.get_routes(&canary).await {
            Ok(routes) => {
                self.metrics
                    .set_weight(&canary, routes.primary_weight, routes.canary_weight);
            }
            Err(e) => {
                self.record_event_warning(&canary, &format!("{e}")).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_interval_is_capped() {
        assert_eq!(
            tick_interval(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        assert_eq!(
            tick_interval(Duration::from_secs(300)),
            Duration::from_secs(30)
        );
    }
}
