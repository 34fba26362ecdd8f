//! Workload controller seam
//!
//! One controller per target kind owns everything that touches the workload
//! manifests: primary creation, scaling, template promotion, readiness
//! checks, revision/config drift detection and status persistence. The
//! scheduler only ever talks to this trait; dispatch over kinds goes through
//! an explicit table keyed by the closed [`WorkloadKind`] sum.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::{Canary, CanaryPhase, CanaryStatus, TargetReference};

/// Closed set of supported target kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    Service,
    KnativeService,
}

impl WorkloadKind {
    /// Resolve the kind guarding a target reference
    pub fn from_target(target: &TargetReference) -> Option<Self> {
        match target.kind.as_str() {
            "Deployment" => Some(Self::Deployment),
            "DaemonSet" => Some(Self::DaemonSet),
            "StatefulSet" => Some(Self::StatefulSet),
            "Service" if target.is_knative_service() => Some(Self::KnativeService),
            "Service" => Some(Self::Service),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::Service => "Service",
            Self::KnativeService => "KnativeService",
        }
    }
}

/// Errors surfaced by workload controllers
///
/// Retriability drives the scheduler: a retriable error halts the current
/// tick and is retried on the next one, a non-retriable error (the progress
/// deadline was exhausted) rolls the run back.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// The workload stopped making progress within its deadline
    #[error("progress deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Operation failed with explicit retriability
    #[error("{message}")]
    Operation { message: String, retriable: bool },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl WorkloadError {
    /// Retriable failure: halt this tick, try again next tick
    pub fn retriable(msg: impl Into<String>) -> Self {
        Self::Operation {
            message: msg.into(),
            retriable: true,
        }
    }

    /// Permanent failure: the scheduler rolls the run back
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Operation {
            message: msg.into(),
            retriable: false,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            Self::DeadlineExceeded(_) => false,
            Self::Operation { retriable, .. } => *retriable,
            Self::Kube(err) => {
                // 4xx means the request itself is wrong, retrying won't help
                !matches!(err, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
        }
    }
}

/// Label metadata of the guarded workload, consumed by routers and queries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadMetadata {
    /// Selector label key (e.g. "app")
    pub label_selector: String,

    /// Selector label value for the target
    pub label_value: String,

    /// Named container ports discovered on the pod spec
    pub ports: BTreeMap<String, i32>,

    /// Full label set of the target, surfaced to notifier transports
    pub labels: BTreeMap<String, String>,
}

/// Operations the scheduler requires from a workload controller
///
/// Contract notes, enforced by the scheduler's tests against fakes:
/// - `sync_status` persists the given status, stamps `lastTransitionTime`
///   and refreshes `lastAppliedSpec`/`trackedConfigs` from the live target.
/// - `set_status_phase(Succeeded)` also stamps `lastPromotedSpec` with the
///   current `lastAppliedSpec`, keeping the promoted hash monotonic.
/// - `has_target_changed` must not report a change when the template hash
///   equals `lastPromotedSpec` (manual rollback to a promoted revision).
#[async_trait]
pub trait WorkloadController: Send + Sync {
    /// Create or refresh the primary copy of the target
    async fn initialize(&self, canary: &Canary) -> Result<(), WorkloadError>;

    /// Copy the canary template (and tracked configs) onto the primary
    async fn promote(&self, canary: &Canary) -> Result<(), WorkloadError>;

    /// Readiness of the primary copy
    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), WorkloadError>;

    /// Readiness of the canary copy
    async fn is_canary_ready(&self, canary: &Canary) -> Result<(), WorkloadError>;

    /// Scale the canary copy to zero replicas
    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), WorkloadError>;

    /// Restore the canary copy to its declared replica count
    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), WorkloadError>;

    /// Whether the target template hash differs from `lastAppliedSpec`
    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, WorkloadError>;

    /// Whether any tracked config/secret hash differs from `trackedConfigs`
    async fn have_dependencies_changed(&self, canary: &Canary) -> Result<bool, WorkloadError>;

    /// Persist a full status (see contract notes above)
    async fn sync_status(&self, canary: &Canary, status: &CanaryStatus)
        -> Result<(), WorkloadError>;

    /// Persist a phase change only
    async fn set_status_phase(&self, canary: &Canary, phase: CanaryPhase)
        -> Result<(), WorkloadError>;

    /// Persist a canary weight change only
    async fn set_status_weight(&self, canary: &Canary, weight: i32) -> Result<(), WorkloadError>;

    /// Persist an iteration counter change only
    async fn set_status_iterations(
        &self,
        canary: &Canary,
        iterations: i32,
    ) -> Result<(), WorkloadError>;

    /// Persist a failed-check counter change only
    async fn set_status_failed_checks(
        &self,
        canary: &Canary,
        failed_checks: i32,
    ) -> Result<(), WorkloadError>;

    /// Selector and label metadata of the target
    async fn get_metadata(&self, canary: &Canary) -> Result<WorkloadMetadata, WorkloadError>;

    /// Restore the primary template before the Canary object is reaped
    async fn finalize(&self, canary: &Canary) -> Result<(), WorkloadError>;
}

/// Explicit kind-to-controller dispatch table
///
/// Controllers are immutable after construction; variants hold shared
/// handles, never factories.
#[derive(Clone, Default)]
pub struct WorkloadTable {
    entries: HashMap<WorkloadKind, Arc<dyn WorkloadController>>,
}

impl WorkloadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the controller for a kind, replacing any previous entry
    pub fn with_kind(mut self, kind: WorkloadKind, controller: Arc<dyn WorkloadController>) -> Self {
        self.entries.insert(kind, controller);
        self
    }

    /// Controller guarding the given target, if its kind is supported
    pub fn controller_for(&self, target: &TargetReference) -> Option<Arc<dyn WorkloadController>> {
        WorkloadKind::from_target(target)
            .and_then(|kind| self.entries.get(&kind))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_resolution() {
        let deployment = TargetReference {
            api_version: Some("apps/v1".into()),
            kind: "Deployment".into(),
            name: "podinfo".into(),
        };
        assert_eq!(
            WorkloadKind::from_target(&deployment),
            Some(WorkloadKind::Deployment)
        );

        let knative = TargetReference {
            api_version: Some("serving.knative.dev/v1".into()),
            kind: "Service".into(),
            name: "podinfo".into(),
        };
        assert_eq!(
            WorkloadKind::from_target(&knative),
            Some(WorkloadKind::KnativeService)
        );

        let plain_service = TargetReference {
            api_version: None,
            kind: "Service".into(),
            name: "podinfo".into(),
        };
        assert_eq!(
            WorkloadKind::from_target(&plain_service),
            Some(WorkloadKind::Service)
        );

        let job = TargetReference {
            api_version: Some("batch/v1".into()),
            kind: "Job".into(),
            name: "podinfo".into(),
        };
        assert_eq!(WorkloadKind::from_target(&job), None);
    }

    #[test]
    fn test_error_retriability() {
        assert!(!WorkloadError::DeadlineExceeded("no progress".into()).is_retriable());
        assert!(WorkloadError::retriable("rollout in flight").is_retriable());
        assert!(!WorkloadError::permanent("selector mismatch").is_retriable());
    }
}
