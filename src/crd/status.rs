//! Canary status types: phase, conditions and manual-control state

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle phase of a canary run
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CanaryPhase {
    /// Fresh object, no phase recorded yet (serialized as the empty string)
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Primary and routing objects are being created
    Initializing,
    /// Bootstrap finished, waiting for a new revision
    Initialized,
    /// Analysis is running, traffic is shifting
    Progressing,
    /// Parked by a confirm-rollout gate or a manual pause
    Waiting,
    /// Parked by a confirm-promotion gate
    WaitingPromotion,
    /// Canary template copied to primary, traffic returning to primary
    Promoting,
    /// Traffic restored, canary workload being scaled down
    Finalising,
    /// Run finished, canary promoted
    Succeeded,
    /// Run rolled back
    Failed,
    /// Deletion in progress, primary being reverted
    Terminating,
    /// Deletion finalizer work finished
    Terminated,
}

impl CanaryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Initializing => "Initializing",
            Self::Initialized => "Initialized",
            Self::Progressing => "Progressing",
            Self::Waiting => "Waiting",
            Self::WaitingPromotion => "WaitingPromotion",
            Self::Promoting => "Promoting",
            Self::Finalising => "Finalising",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
        }
    }

    /// Phases during which a run is underway and every tick must advance it
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Progressing
                | Self::Waiting
                | Self::WaitingPromotion
                | Self::Promoting
                | Self::Finalising
        )
    }
}

impl std::fmt::Display for CanaryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-supplied traffic override, delivered by a manual-traffic-control hook
///
/// `timestamp` orders commands; it must be a lexicographically sortable
/// instant (RFC3339). A command whose timestamp is not newer than
/// `lastAppliedManualTimestamp` is re-applied idempotently but never recorded
/// as new.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualState {
    /// Canary traffic percentage to pin, 0..=100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,

    /// Halt automatic progression while true
    #[serde(default)]
    pub paused: bool,

    /// Command issue instant; empty means "no manual control"
    #[serde(default)]
    pub timestamp: String,
}

/// Condition with categorized sub-conditions
///
/// `Valid` is the only positive-polarity type: `status: "False"` plus entries
/// in `errors` means the spec cannot enter Progressing. All other types
/// follow the usual negative-polarity platform convention.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetailedCondition {
    /// Condition type (Promoted, Valid)
    #[serde(rename = "type")]
    pub condition_type: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    /// Last time this condition was refreshed (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    /// Last time the status field flipped (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Blocking problems, each rendered as its own sub-condition message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Non-blocking problems
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub const CONDITION_PROMOTED: &str = "Promoted";
pub const CONDITION_VALID: &str = "Valid";

impl DetailedCondition {
    /// The `Promoted` condition mirroring the phase of the current run
    pub fn promoted(phase: CanaryPhase, now: DateTime<Utc>) -> Self {
        let (status, reason) = match phase {
            CanaryPhase::Succeeded => ("True", "Succeeded"),
            CanaryPhase::Failed => ("False", "Failed"),
            other => ("Unknown", other.as_str()),
        };
        let reason = if reason.is_empty() { "Initializing" } else { reason };
        Self {
            condition_type: CONDITION_PROMOTED.to_string(),
            status: status.to_string(),
            last_update_time: Some(now.to_rfc3339()),
            last_transition_time: Some(now.to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(format!("Canary is {}", phase_progress_word(phase))),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// A `Valid` condition carrying categorized validation output
    pub fn valid(errors: Vec<String>, warnings: Vec<String>, now: DateTime<Utc>) -> Self {
        let ok = errors.is_empty();
        Self {
            condition_type: CONDITION_VALID.to_string(),
            status: if ok { "True" } else { "False" }.to_string(),
            last_update_time: Some(now.to_rfc3339()),
            last_transition_time: Some(now.to_rfc3339()),
            reason: Some(if ok { "Accepted" } else { "ValidationError" }.to_string()),
            message: Some(if ok {
                "Canary spec accepted".to_string()
            } else {
                errors.join("; ")
            }),
            errors,
            warnings,
        }
    }
}

fn phase_progress_word(phase: CanaryPhase) -> &'static str {
    match phase {
        CanaryPhase::Succeeded => "finished",
        CanaryPhase::Failed => "rolled back",
        CanaryPhase::Unset | CanaryPhase::Initializing => "being initialized",
        _ => "in progress",
    }
}

/// Persisted state of a canary run; the only storage this controller uses
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: CanaryPhase,

    /// Traffic percentage currently routed to the canary
    #[serde(default)]
    pub canary_weight: i32,

    /// Consecutive failed analysis checks in the current run
    #[serde(default)]
    pub failed_checks: i32,

    /// Completed blue/green or A/B iterations in the current run
    #[serde(default)]
    pub iterations: i32,

    /// Content hash of the last observed target template
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_applied_spec: String,

    /// Content hash of the last template successfully promoted to primary
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_promoted_spec: String,

    /// Build identifier of the target workload, surfaced in hook payloads
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_build_id: String,

    /// Content hashes of tracked config/secret dependencies, keyed by ref
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_configs: Option<BTreeMap<String, String>>,

    /// When the current run started (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start_time: Option<String>,

    /// When the status last changed (RFC3339); throttles analysis ticks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Conditions (Promoted, Valid)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<DetailedCondition>>,

    /// Active manual-control command, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_state: Option<ManualState>,

    /// Timestamp of the newest manual command ever applied
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_applied_manual_timestamp: String,
}

impl CanaryStatus {
    /// Status carrying only a phase; used when resetting a run
    pub fn with_phase(phase: CanaryPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Parse `lastTransitionTime`, tolerating a missing or garbled value
    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        self.last_transition_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Parse `lastStartTime`, tolerating a missing or garbled value
    pub fn last_start(&self) -> Option<DateTime<Utc>> {
        self.last_start_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Replace or insert a condition by type
    pub fn set_condition(&mut self, condition: DetailedCondition) {
        let conditions = self.conditions.get_or_insert_with(Vec::new);
        match conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                // Preserve the transition time when the status did not flip
                let transition = if existing.status == condition.status {
                    existing.last_transition_time.clone()
                } else {
                    condition.last_transition_time.clone()
                };
                *existing = DetailedCondition {
                    last_transition_time: transition,
                    ..condition
                };
            }
            None => conditions.push(condition),
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&DetailedCondition> {
        self.conditions
            .as_ref()
            .and_then(|c| c.iter().find(|c| c.condition_type == condition_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_unset_as_empty_string() {
        assert_eq!(serde_json::to_string(&CanaryPhase::Unset).unwrap(), "\"\"");
        let parsed: CanaryPhase = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, CanaryPhase::Unset);
    }

    #[test]
    fn test_active_phases() {
        assert!(CanaryPhase::Progressing.is_active());
        assert!(CanaryPhase::Finalising.is_active());
        assert!(!CanaryPhase::Initialized.is_active());
        assert!(!CanaryPhase::Failed.is_active());
    }

    #[test]
    fn test_promoted_condition_tracks_phase() {
        let now = Utc::now();
        let c = DetailedCondition::promoted(CanaryPhase::Succeeded, now);
        assert_eq!(c.status, "True");
        let c = DetailedCondition::promoted(CanaryPhase::Failed, now);
        assert_eq!(c.status, "False");
        let c = DetailedCondition::promoted(CanaryPhase::Progressing, now);
        assert_eq!(c.status, "Unknown");
    }

    #[test]
    fn test_valid_condition_carries_errors() {
        let now = Utc::now();
        let c = DetailedCondition::valid(
            vec!["cross-namespace ref blocked".into()],
            vec!["deprecated field".into()],
            now,
        );
        assert_eq!(c.status, "False");
        assert_eq!(c.errors.len(), 1);
        assert_eq!(c.warnings.len(), 1);

        let ok = DetailedCondition::valid(Vec::new(), Vec::new(), now);
        assert_eq!(ok.status, "True");
    }

    #[test]
    fn test_set_condition_replaces_by_type() {
        let now = Utc::now();
        let mut status = CanaryStatus::default();
        status.set_condition(DetailedCondition::promoted(CanaryPhase::Progressing, now));
        status.set_condition(DetailedCondition::promoted(CanaryPhase::Succeeded, now));
        let conditions = status.conditions.as_ref().unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn test_status_json_uses_camel_case() {
        let status = CanaryStatus {
            phase: CanaryPhase::Progressing,
            canary_weight: 20,
            failed_checks: 1,
            last_applied_spec: "abc".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["canaryWeight"], 20);
        assert_eq!(v["failedChecks"], 1);
        assert_eq!(v["lastAppliedSpec"], "abc");
        assert_eq!(v["phase"], "Progressing");
    }
}
