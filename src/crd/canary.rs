//! Canary Custom Resource Definition
//!
//! A Canary points at a target workload and declares how its releases are
//! rolled out: the traffic-shifting strategy, the metrics and webhooks that
//! gate each step, and the alerting wired to the run.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::parse_duration;
use super::status::CanaryStatus;
use crate::hash::compute_hash;

/// Router family used when the canary does not declare `spec.provider`
/// and no traffic shifting is possible (pod-level round robin only).
pub const KUBERNETES_PROVIDER: &str = "kubernetes";

/// Prefix of the app-mesh router family. These providers must have their
/// mesh objects reconciled before the primary workload exists, otherwise
/// pods come up without the sidecar proxy.
pub const APP_MESH_PROVIDER_PREFIX: &str = "appmesh";

/// Provider name for Knative Serving targets.
pub const KNATIVE_PROVIDER: &str = "knative";

/// Canary is the declarative description of a guarded rollout.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "silta.io",
    version = "v1beta1",
    kind = "Canary",
    namespaced,
    status = "CanaryStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.canaryWeight"}"#,
    printcolumn = r#"{"name":"FailedChecks", "type":"integer", "jsonPath":".status.failedChecks"}"#,
    printcolumn = r#"{"name":"LastTransitionTime", "type":"string", "jsonPath":".status.lastTransitionTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanarySpec {
    /// Reference to the workload being guarded
    pub target_ref: TargetReference,

    /// Router family, overrides the controller-wide mesh provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Observer address override for the builtin metric names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_server: Option<String>,

    /// Ingress referenced by metric query templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_ref: Option<TargetReference>,

    /// Route referenced by metric query templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_ref: Option<TargetReference>,

    /// Service exposure of the target workload
    #[serde(default)]
    pub service: CanaryService,

    /// Analysis policy driving the rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<CanaryAnalysis>,

    /// Promote new revisions without running analysis
    #[serde(default)]
    pub skip_analysis: bool,

    /// Pause all scheduling for this canary
    #[serde(default)]
    pub suspend: bool,

    /// Revert the primary to the last promoted template when the Canary is deleted
    #[serde(default)]
    pub revert_on_deletion: bool,

    /// Seconds a workload may fail to progress before the run is rolled back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i64>,
}

/// Kind+name reference to an object in the canary's namespace
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    /// API version of the referent (e.g. "apps/v1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the referent (Deployment, DaemonSet, StatefulSet, Service)
    #[serde(default)]
    pub kind: String,

    /// Name of the referent
    pub name: String,
}

impl TargetReference {
    /// A `Service` target under the Knative Serving API group is a Knative
    /// Service, not a plain cluster Service.
    pub fn is_knative_service(&self) -> bool {
        self.kind == "Service"
            && self
                .api_version
                .as_deref()
                .is_some_and(|v| v.starts_with("serving.knative.dev"))
    }
}

/// Reference that may cross namespaces (metric templates, alert providers)
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceRef {
    /// Name of the referent
    pub name: String,

    /// Namespace of the referent; defaults to the canary's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Service exposure of the target workload
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryService {
    /// Explicit apex service name; defaults to the target name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Container port routed by the generated services
    #[serde(default = "default_service_port")]
    pub port: i32,

    /// Discover additional container ports from the pod spec
    #[serde(default)]
    pub port_discovery: bool,
}

impl Default for CanaryService {
    fn default() -> Self {
        Self {
            name: None,
            port: default_service_port(),
            port_discovery: false,
        }
    }
}

fn default_service_port() -> i32 {
    80
}

/// Analysis policy: how traffic moves and what gates each move
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryAnalysis {
    /// Schedule interval between steps (duration string, default "60s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Max failed metric checks before rollback (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i32>,

    /// Max traffic percentage routed to canary during progressive analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_weight: Option<i32>,

    /// Single traffic increment per step; mutually exclusive with stepWeights
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_weight: Option<i32>,

    /// Explicit ordered list of canary weights, one per step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_weights: Option<Vec<i32>>,

    /// Traffic increment per tick while restoring the primary after promotion;
    /// zero means one-shot restoration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_weight_promotion: Option<i32>,

    /// Number of checks for blue/green and A/B runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<i32>,

    /// Mirror requests to the canary before shifting real traffic
    #[serde(default)]
    pub mirror: bool,

    /// Request predicates routed to the canary during A/B analysis
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<HttpMatchRequest>,

    /// Cookie-based session stickiness for the canary route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<SessionAffinity>,

    /// Metrics evaluated every interval
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<CanaryMetric>,

    /// Webhooks invoked during the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<CanaryWebhook>,

    /// Alert routing for run events
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<CanaryAlert>,
}

/// Request predicate for A/B routing
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatchRequest {
    /// Header name to matcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, StringMatch>>,

    /// Source workload labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_labels: Option<BTreeMap<String, String>>,
}

/// Single string matcher; exactly one field is expected to be set
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StringMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Cookie-based session stickiness
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionAffinity {
    /// Cookie stamped on responses served by the canary
    pub cookie_name: String,

    /// Cookie max age in seconds (default 24h)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i32>,

    /// Cookie stamped on responses served by the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_cookie_name: Option<String>,
}

/// Metric evaluated against thresholds every analysis interval
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryMetric {
    /// Metric name; "request-success-rate" and "request-duration" are builtin
    pub name: String,

    /// Query time range (duration string, default "1m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Bare max threshold; superseded by thresholdRange when both are set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,

    /// Accepted value range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_range: Option<ThresholdRange>,

    /// Look-back window for the change-rate check (duration string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_window: Option<String>,

    /// Accepted relative change vs the value one historyWindow ago
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_threshold_range: Option<ThresholdRange>,

    /// Reference to a MetricTemplate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<CrossNamespaceRef>,

    /// Extra variables exposed to the query template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_variables: Option<BTreeMap<String, String>>,

    /// Inline query executed by the builtin observer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Open or half-open accepted value range
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Webhook invoked during the canary run
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryWebhook {
    /// Hook category; decides how the result gates the run
    #[serde(default, rename = "type")]
    pub hook_type: HookType,

    /// Display name used in events
    pub name: String,

    /// Endpoint receiving the POST
    pub url: String,

    /// Request deadline (duration string, default "10s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Transport-level retries before the hook counts as failed
    #[serde(default)]
    pub retries: i32,

    /// Suppress the alert normally fired when this hook halts the run
    #[serde(default)]
    pub mute_alert: bool,

    /// Extra payload metadata; well-known keys are not overwritten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Hook categories; see the decision table in the scheduler
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum HookType {
    /// Gate entering `Progressing`; failure parks the canary in `Waiting`
    #[serde(rename = "confirm-rollout")]
    ConfirmRollout,

    /// Runs once before traffic starts shifting; failure counts a failed check
    #[serde(rename = "pre-rollout")]
    PreRollout,

    /// Runs with the metric checks on every analysis tick
    #[default]
    #[serde(rename = "rollout")]
    Rollout,

    /// Gate each progressive traffic increase
    #[serde(rename = "confirm-traffic-increase")]
    ConfirmTrafficIncrease,

    /// Gate promotion; failure parks the canary in `WaitingPromotion`
    #[serde(rename = "confirm-promotion")]
    ConfirmPromotion,

    /// Informational, fired after finalization or rollback
    #[serde(rename = "post-rollout")]
    PostRollout,

    /// A 2xx answer triggers an immediate rollback
    #[serde(rename = "rollback")]
    Rollback,

    /// A 2xx answer finalizes the run as a success without analysis
    #[serde(rename = "skip")]
    Skip,

    /// Operator-supplied weight/pause commands
    #[serde(rename = "manual-traffic-control")]
    ManualTrafficControl,

    /// Mirrors controller events to an external system
    #[serde(rename = "event")]
    Event,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfirmRollout => "confirm-rollout",
            Self::PreRollout => "pre-rollout",
            Self::Rollout => "rollout",
            Self::ConfirmTrafficIncrease => "confirm-traffic-increase",
            Self::ConfirmPromotion => "confirm-promotion",
            Self::PostRollout => "post-rollout",
            Self::Rollback => "rollback",
            Self::Skip => "skip",
            Self::ManualTrafficControl => "manual-traffic-control",
            Self::Event => "event",
        }
    }
}

/// Alert routing entry
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryAlert {
    /// Display name
    pub name: String,

    /// Minimum severity delivered to this provider
    #[serde(default)]
    pub severity: AlertSeverity,

    /// Reference to an AlertProvider
    pub provider_ref: CrossNamespaceRef,
}

/// Severity attached to alerts and used for alert routing
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    #[default]
    Info,
    Warn,
    Error,
    Success,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

const DEFAULT_ANALYSIS_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PROGRESS_DEADLINE_SECONDS: i64 = 600;

fn empty_analysis() -> &'static CanaryAnalysis {
    static EMPTY: OnceLock<CanaryAnalysis> = OnceLock::new();
    EMPTY.get_or_init(CanaryAnalysis::default)
}

impl Canary {
    /// `<name>.<namespace>` key used in the canaries map and in log fields
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            self.metadata.name.as_deref().unwrap_or_default(),
            self.metadata.namespace.as_deref().unwrap_or_default()
        )
    }

    /// The analysis block, or an empty default when the spec omits it
    pub fn analysis(&self) -> &CanaryAnalysis {
        self.spec.analysis.as_ref().unwrap_or_else(|| empty_analysis())
    }

    /// Declared analysis interval, defaulting to 60s
    pub fn analysis_interval(&self) -> Duration {
        self.analysis()
            .interval
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_ANALYSIS_INTERVAL)
    }

    /// Max failed checks before rollback, minimum 1
    pub fn analysis_threshold(&self) -> i32 {
        match self.analysis().threshold {
            Some(t) if t > 0 => t,
            _ => 1,
        }
    }

    /// Progress deadline in seconds, defaulting to 600
    pub fn progress_deadline_seconds(&self) -> i64 {
        self.spec
            .progress_deadline_seconds
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS)
    }

    pub fn skip_analysis(&self) -> bool {
        self.spec.skip_analysis
    }

    /// Apex service name: explicit `service.name` or the target name
    pub fn service_name(&self) -> &str {
        self.spec
            .service
            .name
            .as_deref()
            .unwrap_or(&self.spec.target_ref.name)
    }

    /// Content hash identifying this canary run, sent to hooks and notifiers
    pub fn canary_checksum(&self) -> String {
        let applied = self
            .status
            .as_ref()
            .map(|s| s.last_applied_spec.as_str())
            .unwrap_or_default();
        compute_hash(&(&self.spec.target_ref, applied)).unwrap_or_default()
    }

    /// Whether the object carries a deletion timestamp
    pub fn is_marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Effective status, defaulting to an empty one for fresh objects
    pub fn status_or_default(&self) -> CanaryStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_canary(analysis: Option<CanaryAnalysis>) -> Canary {
        Canary::new(
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
                analysis,
                skip_analysis: false,
                suspend: false,
                revert_on_deletion: false,
                progress_deadline_seconds: None,
            },
        )
    }

    #[test]
    fn test_analysis_defaults() {
        let canary = minimal_canary(None);
        assert_eq!(canary.analysis_interval(), Duration::from_secs(60));
        assert_eq!(canary.analysis_threshold(), 1);
        assert_eq!(canary.progress_deadline_seconds(), 600);
        assert!(canary.analysis().webhooks.is_empty());
    }

    #[test]
    fn test_analysis_interval_parses_spec_value() {
        let canary = minimal_canary(Some(CanaryAnalysis {
            interval: Some("2m".into()),
            threshold: Some(5),
            ..Default::default()
        }));
        assert_eq!(canary.analysis_interval(), Duration::from_secs(120));
        assert_eq!(canary.analysis_threshold(), 5);
    }

    #[test]
    fn test_service_name_prefers_explicit_name() {
        let mut canary = minimal_canary(None);
        assert_eq!(canary.service_name(), "podinfo");
        canary.spec.service.name = Some("podinfo-svc".into());
        assert_eq!(canary.service_name(), "podinfo-svc");
    }

    #[test]
    fn test_knative_target_detection() {
        let mut target = TargetReference {
            api_version: Some("serving.knative.dev/v1".into()),
            kind: "Service".into(),
            name: "podinfo".into(),
        };
        assert!(target.is_knative_service());
        target.api_version = None;
        assert!(!target.is_knative_service());
    }

    #[test]
    fn test_hook_type_wire_names() {
        let hook: HookType = serde_json::from_str("\"confirm-promotion\"").unwrap();
        assert_eq!(hook, HookType::ConfirmPromotion);
        assert_eq!(
            serde_json::to_string(&HookType::ManualTrafficControl).unwrap(),
            "\"manual-traffic-control\""
        );
    }

    #[test]
    fn test_checksum_stable_for_same_target() {
        let a = minimal_canary(None);
        let b = minimal_canary(None);
        assert_eq!(a.canary_checksum(), b.canary_checksum());
    }
}
