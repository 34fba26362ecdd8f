use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::controller::testing::{progressive_analysis, test_canary, Fixture};
use crate::controller::FINALIZER;
use crate::crd::status::{CONDITION_PROMOTED, CONDITION_VALID};
use crate::crd::{CanaryPhase, SessionAffinity};

/// Story: syncing a fresh canary stamps Initializing with conditions and
/// stores it into the canaries map
#[tokio::test]
async fn story_sync_initializes_new_canary() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));

    fixture.ctrl.sync_handler("test/podinfo").await.unwrap();

    assert!(fixture.ctrl.canaries.contains_key("podinfo.test"));
    let status = fixture.cluster.status();
    assert_eq!(status.phase, CanaryPhase::Initializing);
    let promoted = status.condition(CONDITION_PROMOTED).expect("condition");
    assert_eq!(promoted.status, "Unknown");
}

/// Story: an unknown work queue key is rejected, a vanished canary is not
#[tokio::test]
async fn story_sync_handles_bad_keys() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));

    assert!(fixture.ctrl.sync_handler("no-slash").await.is_err());
    // Vanished object: logged, not an error (nothing to retry against)
    assert!(fixture.ctrl.sync_handler("test/ghost").await.is_ok());
    assert!(!fixture.ctrl.canaries.contains_key("ghost.test"));
}

/// Story: validation failures surface as a Valid=False condition with
/// categorized errors and block the sync
#[tokio::test]
async fn story_sync_records_validation_condition() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.cluster.mutate_canary(|c| {
        if let Some(analysis) = c.spec.analysis.as_mut() {
            analysis.session_affinity = Some(SessionAffinity {
                cookie_name: "shared".into(),
                max_age: None,
                primary_cookie_name: Some("shared".into()),
            });
        }
    });

    let err = fixture.ctrl.sync_handler("test/podinfo").await.unwrap_err();
    assert!(err.to_string().contains("cookie name"));
    let status = fixture.cluster.status();
    let valid = status.condition(CONDITION_VALID).expect("condition");
    assert_eq!(valid.status, "False");
    assert_eq!(valid.errors.len(), 1);
    assert!(!fixture.ctrl.canaries.contains_key("podinfo.test"));

    // Fixing the spec heals the condition
    fixture.cluster.mutate_canary(|c| {
        if let Some(analysis) = c.spec.analysis.as_mut() {
            analysis.session_affinity = None;
        }
    });
    fixture.ctrl.sync_handler("test/podinfo").await.unwrap();
    let status = fixture.cluster.status();
    assert_eq!(status.condition(CONDITION_VALID).unwrap().status, "True");
    assert!(fixture.ctrl.canaries.contains_key("podinfo.test"));
}

/// Story: revertOnDeletion adds the finalizer token on sync
#[tokio::test]
async fn story_sync_adds_finalizer() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture
        .cluster
        .mutate_canary(|c| c.spec.revert_on_deletion = true);

    fixture.ctrl.sync_handler("test/podinfo").await.unwrap();

    let canary = fixture.cluster.canary();
    assert!(canary
        .metadata
        .finalizers
        .unwrap_or_default()
        .iter()
        .any(|f| f == FINALIZER));
}

/// Story: a deleted revert-on-deletion canary is finalized (primary
/// reverted, canary down, phase Terminated) and the finalizer removed
#[tokio::test]
async fn story_deletion_finalizes_and_reverts() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));

    // A previously promoted canary marked for deletion
    fixture.cluster.mutate_canary(|c| {
        c.spec.revert_on_deletion = true;
        c.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let mut status = c.status_or_default();
        status.phase = CanaryPhase::Succeeded;
        status.last_applied_spec = "rev-1".into();
        status.last_promoted_spec = "rev-1".into();
        c.status = Some(status);
    });

    fixture.ctrl.sync_handler("test/podinfo").await.unwrap();

    let canary = fixture.cluster.canary();
    assert_eq!(canary.status_or_default().phase, CanaryPhase::Terminated);
    assert!(canary
        .metadata
        .finalizers
        .unwrap_or_default()
        .is_empty());
    assert_eq!(fixture.workload.canary_replicas(), 0);
    assert_eq!(fixture.routes().canary_weight, 0);
}

/// Story: a canary already terminated is not finalized twice
#[tokio::test]
async fn story_terminated_canary_only_drops_finalizer() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.cluster.mutate_canary(|c| {
        c.spec.revert_on_deletion = true;
        c.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let mut status = c.status_or_default();
        status.phase = CanaryPhase::Terminated;
        c.status = Some(status);
    });

    fixture.ctrl.sync_handler("test/podinfo").await.unwrap();

    let canary = fixture.cluster.canary();
    assert_eq!(canary.status_or_default().phase, CanaryPhase::Terminated);
    assert!(canary.metadata.finalizers.unwrap_or_default().is_empty());
}

/// Story: enqueue deduplicates keys until the queue drains
#[tokio::test]
async fn test_enqueue_deduplicates() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.ctrl.enqueue("test", "podinfo");
    fixture.ctrl.enqueue("test", "podinfo");
    fixture.ctrl.enqueue("test", "podinfo");
    // Only one pending marker regardless of how many times it was queued
    assert_eq!(fixture.ctrl.pending.len(), 1);
    assert!(fixture.ctrl.pending.contains("test/podinfo"));
}
