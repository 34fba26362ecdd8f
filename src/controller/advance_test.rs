use crate::controller::testing::{
    progressive_analysis, test_canary, Fixture, Readiness,
};
use crate::crd::{CanaryAnalysis, CanaryPhase, CanaryWebhook, HookType};
use crate::router::Routes;
use crate::crd::AlertSeverity;
use std::sync::atomic::Ordering;

/// Let spawned fire-and-forget alert tasks run to completion
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn post_rollout_hook() -> CanaryWebhook {
    CanaryWebhook {
        hook_type: HookType::PostRollout,
        name: "notify-deploy".into(),
        url: "http://hooks.test/post-rollout".into(),
        ..Default::default()
    }
}

// =========================================================================
// Initialization
// =========================================================================

/// Story: a fresh canary bootstraps the primary, routes all traffic to it
/// and converges without phase churn on unchanged targets
#[tokio::test]
async fn story_initialization_converges() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));

    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Initialized);
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 100,
            canary_weight: 0,
            mirrored: false
        }
    );
    // The canary copy is scaled down once the primary serves the traffic
    assert_eq!(fixture.workload.canary_replicas(), 0);

    // Idempotence: further ticks on a stable target change nothing
    for _ in 0..3 {
        fixture.tick().await;
        assert_eq!(fixture.phase(), CanaryPhase::Initialized);
        assert_eq!(fixture.routes().canary_weight, 0);
    }
}

/// Story: a suspended canary is left alone entirely
#[tokio::test]
async fn story_suspended_canary_is_skipped() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.tick().await;

    fixture.cluster.mutate_canary(|c| c.spec.suspend = true);
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;

    // No transition despite the new revision
    assert_eq!(fixture.phase(), CanaryPhase::Initialized);
}

// =========================================================================
// Progressive promotion
// =========================================================================

/// Story: a new revision progresses in weight steps and is promoted once
/// the max weight is reached
#[tokio::test]
async fn story_progressive_promotion() {
    let mut analysis = progressive_analysis();
    analysis.webhooks.push(post_rollout_hook());
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");

    // Transition tick: scale up, enter Progressing
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);
    assert_eq!(fixture.workload.canary_replicas(), 1);

    // Five steps of 10% up to maxWeight 50
    for expected in [10, 20, 30, 40, 50] {
        fixture.tick().await;
        assert_eq!(fixture.routes().canary_weight, expected);
        assert_eq!(fixture.cluster.status().canary_weight, expected);
    }

    // Promotion, one-shot traffic restore, finalization
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Promoting);
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Finalising);
    assert_eq!(fixture.routes().canary_weight, 0);
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Succeeded);
    settle().await;

    // Final state: all traffic on primary, canary down, template promoted
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 100,
            canary_weight: 0,
            mirrored: false
        }
    );
    assert_eq!(fixture.workload.canary_replicas(), 0);
    assert_eq!(fixture.workload.primary_template(), "rev-2");
    assert_eq!(fixture.cluster.status().last_promoted_spec, "rev-2");

    // Post-rollout hook fired exactly once, with the final phase
    let calls = fixture.hooks.calls_to("http://hooks.test/post-rollout");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].phase, CanaryPhase::Succeeded);

    // Success alert fired
    assert!(fixture
        .notifier
        .severities()
        .contains(&AlertSeverity::Success));

    // The run narrated itself through events
    let messages = fixture.events.messages();
    assert!(messages.iter().any(|m| m.contains("New revision detected")));
    assert!(messages
        .iter()
        .any(|m| m.contains("Promotion completed! Scaling down podinfo.test")));

    // A stable Succeeded canary stays put
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Succeeded);
}

/// Story: the promoted hash is monotonic; reverting the spec to the
/// promoted revision does not start a new run
#[tokio::test]
async fn story_manual_rollback_to_promoted_revision_is_inert() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    for _ in 0..10 {
        fixture.tick().await;
    }
    assert_eq!(fixture.phase(), CanaryPhase::Succeeded);

    // "Reverting" to the promoted revision: no new run
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Succeeded);
}

// =========================================================================
// Rollback
// =========================================================================

/// Story: failed metric checks accumulate and trip the threshold into a
/// rollback
#[tokio::test]
async fn story_rollback_on_failed_checks() {
    let mut analysis = progressive_analysis();
    analysis.threshold = Some(2);
    analysis.webhooks.push(post_rollout_hook());
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);

    // Request duration far above the declared max of 500
    fixture.observer.set_duration(5_000.0);

    // First step happens with no traffic to measure yet
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 10);

    // Two failing analysis ticks reach the threshold
    fixture.tick().await;
    assert_eq!(fixture.cluster.status().failed_checks, 1);
    assert_eq!(fixture.routes().canary_weight, 10);
    fixture.tick().await;
    assert_eq!(fixture.cluster.status().failed_checks, 2);

    // Threshold tripped: roll back
    fixture.tick().await;
    settle().await;
    assert_eq!(fixture.phase(), CanaryPhase::Failed);
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 100,
            canary_weight: 0,
            mirrored: false
        }
    );
    assert_eq!(fixture.workload.canary_replicas(), 0);
    assert_eq!(fixture.cluster.status().canary_weight, 0);

    // The primary still runs the old template
    assert_eq!(fixture.workload.primary_template(), "rev-1");

    // Error alert and post-rollout hook with the Failed phase
    assert!(fixture.notifier.severities().contains(&AlertSeverity::Error));
    let calls = fixture.hooks.calls_to("http://hooks.test/post-rollout");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].phase, CanaryPhase::Failed);
}

/// Story: a canary that stopped progressing (deadline exceeded) is rolled
/// back without counting failed checks
#[tokio::test]
async fn story_rollback_on_progress_deadline() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 10);

    fixture
        .workload
        .set_canary_ready(Readiness::Permanent("no progress for 600s".into()));
    fixture.tick().await;
    settle().await;

    assert_eq!(fixture.phase(), CanaryPhase::Failed);
    assert_eq!(fixture.routes().canary_weight, 0);
    assert!(fixture.notifier.severities().contains(&AlertSeverity::Error));
}

// =========================================================================
// Revision watchdog
// =========================================================================

/// Story: a revision change mid-run resets the analysis from scratch
#[tokio::test]
async fn story_revision_change_restarts_analysis() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    for _ in 0..3 {
        fixture.tick().await;
    }
    assert_eq!(fixture.routes().canary_weight, 30);
    fixture
        .cluster
        .mutate_canary(|c| {
            let mut status = c.status_or_default();
            status.failed_checks = 1;
            c.status = Some(status);
        });

    // Another release lands mid-run
    fixture.workload.set_template_hash("rev-3");
    fixture.tick().await;
    settle().await;

    let status = fixture.cluster.status();
    assert_eq!(status.phase, CanaryPhase::Progressing);
    assert_eq!(status.canary_weight, 0);
    assert_eq!(status.iterations, 0);
    assert_eq!(status.failed_checks, 0);
    assert_eq!(fixture.routes().canary_weight, 0);
    assert!(status.last_start_time.is_some());

    // Warn alert announced the restart
    assert!(fixture.notifier.severities().contains(&AlertSeverity::Warn));

    // The run then progresses against the new revision
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 10);
}

/// Story: tracked config drift triggers a run just like a template change
#[tokio::test]
async fn story_config_change_starts_run() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Initialized);

    fixture.workload.set_config_hash("cfg-2");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);
}

// =========================================================================
// Blue/green
// =========================================================================

/// Story: blue/green holds traffic on primary for the declared iterations,
/// flips, then promotes
#[tokio::test]
async fn story_blue_green_iterations() {
    let analysis = CanaryAnalysis {
        interval: Some("1m".into()),
        threshold: Some(10),
        iterations: Some(2),
        ..Default::default()
    };
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);

    // Two iterations with traffic held on primary
    fixture.tick().await;
    assert_eq!(fixture.cluster.status().iterations, 1);
    assert_eq!(fixture.routes().canary_weight, 0);
    fixture.tick().await;
    assert_eq!(fixture.cluster.status().iterations, 2);
    assert_eq!(fixture.routes().canary_weight, 0);

    // Flip: all traffic to the canary
    fixture.tick().await;
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 0,
            canary_weight: 100,
            mirrored: false
        }
    );
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);

    // Promote, restore, finalize
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Promoting);
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Finalising);
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Succeeded);
    assert_eq!(fixture.routes().canary_weight, 0);

    // Iterations never exceeded the declared count
    assert!(fixture.cluster.status().iterations <= 2);
}

// =========================================================================
// Mirroring
// =========================================================================

/// Story: with mirroring, the first step duplicates requests without
/// shifting real traffic, the second shifts the first weight step
#[tokio::test]
async fn story_mirror_step_then_shift() {
    let mut analysis = progressive_analysis();
    analysis.mirror = true;
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;

    // First step: mirror only
    fixture.tick().await;
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 100,
            canary_weight: 0,
            mirrored: true
        }
    );

    // Second step: stop mirroring, shift the first weight step
    fixture.tick().await;
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 90,
            canary_weight: 10,
            mirrored: false
        }
    );

    // Progression continues normally from there
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 20);
    assert!(!fixture.routes().mirrored);
}

// =========================================================================
// Gates
// =========================================================================

/// Story: a failing confirm-rollout gate parks the canary in Waiting; it
/// enters Progressing once the gate opens
#[tokio::test]
async fn story_confirm_rollout_gate() {
    let mut analysis = progressive_analysis();
    analysis.webhooks.push(CanaryWebhook {
        hook_type: HookType::ConfirmRollout,
        name: "change-freeze".into(),
        url: "http://gate.test/rollout".into(),
        ..Default::default()
    });
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.hooks.fail("http://gate.test/rollout", 403, "freeze");
    fixture.workload.set_template_hash("rev-2");

    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Waiting);
    // The canary is not scaled up while parked
    assert_eq!(fixture.workload.canary_replicas(), 0);

    // Still parked on the next tick
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Waiting);

    // Gate opens: the run starts
    fixture.hooks.respond("http://gate.test/rollout", b"");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);
    assert_eq!(fixture.workload.canary_replicas(), 1);
}

/// Story: a failing confirm-promotion gate parks the canary in
/// WaitingPromotion and promotion happens once it opens
#[tokio::test]
async fn story_confirm_promotion_gate() {
    let mut analysis = progressive_analysis();
    analysis.webhooks.push(CanaryWebhook {
        hook_type: HookType::ConfirmPromotion,
        name: "release-manager".into(),
        url: "http://gate.test/promotion".into(),
        ..Default::default()
    });
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    for _ in 0..5 {
        fixture.tick().await;
    }
    assert_eq!(fixture.routes().canary_weight, 50);

    // Gate refuses: no promotion
    fixture.hooks.fail("http://gate.test/promotion", 403, "not yet");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::WaitingPromotion);
    assert_eq!(fixture.workload.promote_calls.load(Ordering::SeqCst), 0);

    // Gate opens: promotion proceeds
    fixture.hooks.respond("http://gate.test/promotion", b"");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Promoting);
    assert_eq!(fixture.workload.promote_calls.load(Ordering::SeqCst), 1);
}

/// Story: a rollback hook answering 2xx rolls the run back immediately
#[tokio::test]
async fn story_rollback_hook_triggers_rollback() {
    let mut analysis = progressive_analysis();
    analysis.webhooks.push(CanaryWebhook {
        hook_type: HookType::Rollback,
        name: "abort-button".into(),
        url: "http://gate.test/rollback".into(),
        ..Default::default()
    });
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    // The rollback endpoint answers 404 while unarmed
    fixture.hooks.fail("http://gate.test/rollback", 404, "");
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 10);

    // Operator presses the button
    fixture.hooks.respond("http://gate.test/rollback", b"");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Failed);
    assert_eq!(fixture.routes().canary_weight, 0);
}

/// Story: a skip hook finalizes the run as a success without analysis
#[tokio::test]
async fn story_skip_hook_promotes_immediately() {
    let mut analysis = progressive_analysis();
    analysis.webhooks.push(CanaryWebhook {
        hook_type: HookType::Skip,
        name: "fast-lane".into(),
        url: "http://gate.test/skip".into(),
        ..Default::default()
    });
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.hooks.fail("http://gate.test/skip", 404, "");
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);

    fixture.hooks.respond("http://gate.test/skip", b"");
    fixture.tick().await;

    assert_eq!(fixture.phase(), CanaryPhase::Succeeded);
    assert_eq!(fixture.workload.primary_template(), "rev-2");
    assert_eq!(fixture.routes().canary_weight, 0);
    assert_eq!(fixture.workload.canary_replicas(), 0);
}

/// Story: spec.skipAnalysis promotes a new revision without any analysis
#[tokio::test]
async fn story_skip_analysis_flag() {
    let fixture = Fixture::new(test_canary(progressive_analysis()));
    fixture.tick().await;

    fixture.cluster.mutate_canary(|c| c.spec.skip_analysis = true);
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Progressing);

    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Succeeded);
    assert_eq!(fixture.workload.primary_template(), "rev-2");
}

// =========================================================================
// Weight arithmetic boundaries
// =========================================================================

#[tokio::test]
async fn test_next_step_weight_with_overflow_list() {
    let mut analysis = progressive_analysis();
    analysis.step_weight = None;
    analysis.max_weight = None;
    analysis.step_weights = Some(vec![1, 2, 10, 200]);
    let fixture = Fixture::new(test_canary(analysis));
    let canary = fixture.cluster.canary();

    assert_eq!(fixture.ctrl.next_step_weight(&canary, 0), 1);
    assert_eq!(fixture.ctrl.next_step_weight(&canary, 1), 1);
    assert_eq!(fixture.ctrl.next_step_weight(&canary, 2), 8);
    assert_eq!(fixture.ctrl.next_step_weight(&canary, 10), 90);
    // Nothing left to shift forces promotion with a step of one
    assert_eq!(fixture.ctrl.next_step_weight(&canary, 100), 1);

    // The overflow list caps the max weight at the total
    assert_eq!(fixture.ctrl.max_weight(&canary), 100);
}

#[tokio::test]
async fn test_next_step_weight_with_plain_list() {
    let mut analysis = progressive_analysis();
    analysis.step_weight = None;
    analysis.max_weight = None;
    analysis.step_weights = Some(vec![10, 30, 50]);
    let fixture = Fixture::new(test_canary(analysis));
    let canary = fixture.cluster.canary();

    assert_eq!(fixture.ctrl.next_step_weight(&canary, 0), 10);
    assert_eq!(fixture.ctrl.next_step_weight(&canary, 10), 20);
    // Off-list weights fall through to the remaining distance
    assert_eq!(fixture.ctrl.next_step_weight(&canary, 20), 80);

    assert_eq!(fixture.ctrl.max_weight(&canary), 50);
}

#[tokio::test]
async fn test_max_weight_from_step_list() {
    let mut analysis = progressive_analysis();
    analysis.step_weight = None;
    analysis.max_weight = None;
    analysis.step_weights = Some(vec![1, 2, 10, 80]);
    let fixture = Fixture::new(test_canary(analysis));
    let canary = fixture.cluster.canary();
    assert_eq!(fixture.ctrl.max_weight(&canary), 80);
}

#[tokio::test]
async fn test_max_weight_defaults_to_total() {
    let mut analysis = progressive_analysis();
    analysis.max_weight = None;
    let fixture = Fixture::new(test_canary(analysis));
    let canary = fixture.cluster.canary();
    assert_eq!(fixture.ctrl.max_weight(&canary), 100);
}

/// Story: an overflow step list promotes once the full traffic is shifted
#[tokio::test]
async fn story_overflow_step_list_promotes_at_total_weight() {
    let mut analysis = progressive_analysis();
    analysis.step_weight = None;
    analysis.max_weight = None;
    analysis.step_weights = Some(vec![40, 80, 200]);
    let fixture = Fixture::new(test_canary(analysis));

    fixture.tick().await;
    fixture.workload.set_template_hash("rev-2");
    fixture.tick().await;

    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 40);
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 80);
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 100);

    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Promoting);
}

// =========================================================================
// Manual traffic control
// =========================================================================

fn manual_hook() -> CanaryWebhook {
    CanaryWebhook {
        hook_type: HookType::ManualTrafficControl,
        name: "traffic-desk".into(),
        url: "http://gate.test/manual".into(),
        ..Default::default()
    }
}

fn manual_fixture() -> Fixture {
    let mut analysis = progressive_analysis();
    analysis.webhooks.push(manual_hook());
    let fixture = Fixture::new(test_canary(analysis));
    fixture
}

/// Story: a manual pause pins the weight and parks the run in Waiting
#[tokio::test]
async fn story_manual_pause_preserves_weight() {
    let fixture = manual_fixture();
    fixture.tick().await;
    fixture.seed_progressing(22);

    fixture.hooks.respond(
        "http://gate.test/manual",
        br#"{"weight": 22, "paused": true, "timestamp": "2024-03-01T13:00:00Z"}"#,
    );

    fixture.tick().await;
    let status = fixture.cluster.status();
    assert_eq!(status.phase, CanaryPhase::Waiting);
    assert_eq!(status.canary_weight, 22);
    assert_eq!(status.last_applied_manual_timestamp, "2024-03-01T13:00:00Z");
    assert!(status.manual_state.as_ref().unwrap().paused);
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 78,
            canary_weight: 22,
            mirrored: false
        }
    );

    // The same command on the next tick changes nothing
    fixture.tick().await;
    let again = fixture.cluster.status();
    assert_eq!(again.phase, CanaryPhase::Waiting);
    assert_eq!(again.canary_weight, 22);
    assert_eq!(again.last_applied_manual_timestamp, "2024-03-01T13:00:00Z");
    assert_eq!(fixture.routes().canary_weight, 22);
}

/// Story: a weightless resume keeps the pinned weight, never resets to zero
#[tokio::test]
async fn story_manual_resume_keeps_weight() {
    let fixture = manual_fixture();
    fixture.tick().await;
    fixture.seed_progressing(22);

    fixture.hooks.respond(
        "http://gate.test/manual",
        br#"{"weight": 22, "paused": true, "timestamp": "2024-03-01T13:00:00Z"}"#,
    );
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Waiting);

    // Resume without a weight
    fixture.hooks.respond(
        "http://gate.test/manual",
        br#"{"paused": false, "timestamp": "2024-03-01T13:05:00Z"}"#,
    );
    fixture.tick().await;

    let status = fixture.cluster.status();
    assert_eq!(status.phase, CanaryPhase::Progressing);
    assert_eq!(status.canary_weight, 22);
    assert_eq!(status.last_applied_manual_timestamp, "2024-03-01T13:05:00Z");
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 78,
            canary_weight: 22,
            mirrored: false
        }
    );
}

/// Story: re-issuing an already-applied command heals a drifted router
#[tokio::test]
async fn story_manual_reapply_heals_drifted_router() {
    let fixture = manual_fixture();
    fixture.tick().await;
    fixture.seed_progressing(22);

    fixture.hooks.respond(
        "http://gate.test/manual",
        br#"{"weight": 22, "paused": true, "timestamp": "2024-03-01T13:00:00Z"}"#,
    );
    fixture.tick().await;
    assert_eq!(fixture.routes().canary_weight, 22);

    // Something reset the routes behind the controller's back
    fixture.mesh.drift(Routes {
        primary_weight: 100,
        canary_weight: 0,
        mirrored: false,
    });

    // The unchanged command is re-applied idempotently
    fixture.tick().await;
    assert_eq!(
        fixture.routes(),
        Routes {
            primary_weight: 78,
            canary_weight: 22,
            mirrored: false
        }
    );
    let status = fixture.cluster.status();
    // Not recorded as a new command
    assert_eq!(status.last_applied_manual_timestamp, "2024-03-01T13:00:00Z");
}

/// Story: an empty answer clears the override and resumes automatic
/// progression from the pinned weight
#[tokio::test]
async fn story_manual_cleared_resumes_automatic() {
    let fixture = manual_fixture();
    fixture.tick().await;
    fixture.seed_progressing(22);

    fixture.hooks.respond(
        "http://gate.test/manual",
        br#"{"weight": 22, "paused": true, "timestamp": "2024-03-01T13:00:00Z"}"#,
    );
    fixture.tick().await;
    assert_eq!(fixture.phase(), CanaryPhase::Waiting);

    fixture.hooks.respond("http://gate.test/manual", b"");
    fixture.tick().await;

    let status = fixture.cluster.status();
    assert_eq!(status.phase, CanaryPhase::Progressing);
    assert!(status.manual_state.is_none());
    assert!(status.last_applied_manual_timestamp.is_empty());
    // The pinned weight survives the clear
    assert_eq!(status.canary_weight, 22);
    assert_eq!(fixture.routes().canary_weight, 22);
}

/// Story: manual timestamps are monotonic; a stale command is never
/// recorded over a newer one
#[tokio::test]
async fn story_manual_timestamp_is_monotonic() {
    let fixture = manual_fixture();
    fixture.tick().await;
    fixture.seed_progressing(22);

    fixture.hooks.respond(
        "http://gate.test/manual",
        br#"{"weight": 22, "paused": false, "timestamp": "2024-03-01T13:05:00Z"}"#,
    );
    fixture.tick().await;
    assert_eq!(
        fixture.cluster.status().last_applied_manual_timestamp,
        "2024-03-01T13:05:00Z"
    );

    // An older command arrives late; applied but not recorded
    fixture.hooks.respond(
        "http://gate.test/manual",
        br#"{"weight": 22, "paused": false, "timestamp": "2024-03-01T13:00:00Z"}"#,
    );
    fixture.tick().await;
    assert_eq!(
        fixture.cluster.status().last_applied_manual_timestamp,
        "2024-03-01T13:05:00Z"
    );
}
