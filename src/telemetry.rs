//! Controller metrics registry
//!
//! Records the observable state of every canary run: phase, routed weights,
//! analysis values, tick durations and per-namespace totals. The embedding
//! binary serves [`ControllerMetrics::registry`] from its metrics endpoint.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
};

use crate::crd::{Canary, CanaryPhase};

/// Shared handle to the controller metrics
pub type SharedMetrics = Arc<ControllerMetrics>;

/// Numeric encoding of a canary phase for the status gauge
fn phase_code(phase: CanaryPhase) -> i64 {
    match phase {
        CanaryPhase::Unset | CanaryPhase::Initializing | CanaryPhase::Initialized => 0,
        CanaryPhase::Progressing
        | CanaryPhase::Waiting
        | CanaryPhase::WaitingPromotion
        | CanaryPhase::Promoting
        | CanaryPhase::Finalising => 1,
        CanaryPhase::Succeeded => 2,
        CanaryPhase::Failed => 3,
        CanaryPhase::Terminating | CanaryPhase::Terminated => 4,
    }
}

/// Prometheus metrics owned by one controller instance
pub struct ControllerMetrics {
    registry: Registry,
    status: IntGaugeVec,
    primary_weight: IntGaugeVec,
    canary_weight: IntGaugeVec,
    analysis_value: GaugeVec,
    analysis_duration: HistogramVec,
    total: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let status = IntGaugeVec::new(
            Opts::new(
                "silta_canary_status",
                "Canary phase: 0 bootstrap, 1 in progress, 2 succeeded, 3 failed, 4 terminating",
            ),
            &["name", "namespace"],
        )?;
        let primary_weight = IntGaugeVec::new(
            Opts::new(
                "silta_canary_primary_weight",
                "Traffic percentage routed to the primary",
            ),
            &["workload", "namespace"],
        )?;
        let canary_weight = IntGaugeVec::new(
            Opts::new(
                "silta_canary_weight",
                "Traffic percentage routed to the canary",
            ),
            &["workload", "namespace"],
        )?;
        let analysis_value = GaugeVec::new(
            Opts::new(
                "silta_canary_metric_analysis",
                "Last observed value per analysis metric",
            ),
            &["name", "namespace", "metric"],
        )?;
        let analysis_duration = HistogramVec::new(
            HistogramOpts::new(
                "silta_canary_duration_seconds",
                "Per-tick scheduling duration",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["name", "namespace"],
        )?;
        let total = IntGaugeVec::new(
            Opts::new("silta_canary_total", "Canaries per namespace"),
            &["namespace"],
        )?;

        registry.register(Box::new(status.clone()))?;
        registry.register(Box::new(primary_weight.clone()))?;
        registry.register(Box::new(canary_weight.clone()))?;
        registry.register(Box::new(analysis_value.clone()))?;
        registry.register(Box::new(analysis_duration.clone()))?;
        registry.register(Box::new(total.clone()))?;

        Ok(Self {
            registry,
            status,
            primary_weight,
            canary_weight,
            analysis_value,
            analysis_duration,
            total,
        })
    }

    /// Registry to expose from a metrics endpoint
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_status(&self, canary: &Canary, phase: CanaryPhase) {
        let name = canary.metadata.name.as_deref().unwrap_or_default();
        let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
        self.status
            .with_label_values(&[name, namespace])
            .set(phase_code(phase));
    }

    pub fn set_weight(&self, canary: &Canary, primary: i32, canary_weight: i32) {
        let workload = canary.spec.target_ref.name.as_str();
        let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
        self.primary_weight
            .with_label_values(&[workload, namespace])
            .set(i64::from(primary));
        self.canary_weight
            .with_label_values(&[workload, namespace])
            .set(i64::from(canary_weight));
    }

    pub fn set_analysis(&self, canary: &Canary, metric: &str, value: f64) {
        let name = canary.metadata.name.as_deref().unwrap_or_default();
        let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
        self.analysis_value
            .with_label_values(&[name, namespace, metric])
            .set(value);
    }

    pub fn record_duration(&self, canary: &Canary, elapsed: Duration) {
        let name = canary.metadata.name.as_deref().unwrap_or_default();
        let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
        self.analysis_duration
            .with_label_values(&[name, namespace])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_total(&self, namespace: &str, count: i64) {
        self.total.with_label_values(&[namespace]).set(count);
    }
}

/// Create the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CanarySpec, CanaryService, TargetReference};

    fn canary() -> Canary {
        let mut c = Canary::new(
            "podinfo",
            CanarySpec {
                target_ref: TargetReference {
                    api_version: Some("apps/v1".into()),
                    kind: "Deployment".into(),
                    name: "podinfo".into(),
                },
                provider: None,
                metrics_server: None,
                ingress_ref: None,
                route_ref: None,
                service: CanaryService::default(),
                analysis: None,
                skip_analysis: false,
                suspend: false,
                revert_on_deletion: false,
                progress_deadline_seconds: None,
            },
        );
        c.metadata.namespace = Some("test".into());
        c
    }

    #[test]
    fn test_metrics_register_and_record() {
        let metrics = create_metrics().expect("registry");
        let canary = canary();

        metrics.set_status(&canary, CanaryPhase::Progressing);
        metrics.set_weight(&canary, 80, 20);
        metrics.set_analysis(&canary, "request-success-rate", 99.1);
        metrics.record_duration(&canary, Duration::from_millis(120));
        metrics.set_total("test", 1);

        let families = metrics.registry().gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"silta_canary_status"));
        assert!(names.contains(&"silta_canary_weight"));
        assert!(names.contains(&"silta_canary_total"));
    }

    #[test]
    fn test_phase_codes() {
        assert_eq!(phase_code(CanaryPhase::Initialized), 0);
        assert_eq!(phase_code(CanaryPhase::Progressing), 1);
        assert_eq!(phase_code(CanaryPhase::Succeeded), 2);
        assert_eq!(phase_code(CanaryPhase::Failed), 3);
    }
}
