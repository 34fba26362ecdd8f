//! Hook runners: one decision rule per hook category
//!
//! Every runner iterates the declared webhooks of its category, invokes them
//! through the hook client and maps success/failure onto the category's
//! go/stop/skip/rollback/manual decision.

use tracing::debug;

use super::webhook::{build_payload, parse_manual_state, WebhookError, DEFAULT_HOOK_TIMEOUT};
use super::Controller;
use crate::crd::{parse_duration, Canary, CanaryPhase, CanaryWebhook, HookType, ManualState};
use crate::workload::WorkloadController;

/// Outcome of polling the manual-traffic-control hooks
pub(crate) enum ManualCommand {
    /// No hook answered; leave any stored manual state untouched
    Unavailable,
    /// A hook answered with no command; stored manual state is dropped
    Cleared,
    /// A hook delivered a command
    Command(ManualState),
}

impl Controller {
    pub(crate) async fn call_hook(
        &self,
        canary: &Canary,
        phase: CanaryPhase,
        hook: &CanaryWebhook,
    ) -> Result<Vec<u8>, WebhookError> {
        let payload = build_payload(canary, phase, hook, self.clock.now());
        let timeout = hook
            .timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_HOOK_TIMEOUT);
        self.hook_client
            .call(&hook.url, &payload, timeout, hook.retries)
            .await
    }

    /// Gate entering `Progressing`. A failing hook parks the canary in
    /// `Waiting` until the gate opens.
    pub(crate) async fn run_confirm_rollout_hooks(
        &self,
        canary: &Canary,
        workload: &dyn WorkloadController,
    ) -> bool {
        let phase = canary.status_or_default().phase;
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::ConfirmRollout {
                continue;
            }
            match self.call_hook(canary, phase, hook).await {
                Ok(_) => {
                    self.record_event_info(
                        canary,
                        &format!("Confirm-rollout check {} passed", hook.name),
                    )
                    .await;
                }
                Err(_) => {
                    if phase != CanaryPhase::Waiting {
                        if let Err(e) = workload
                            .set_status_phase(canary, CanaryPhase::Waiting)
                            .await
                        {
                            self.record_event_error(canary, &format!("{e}")).await;
                        }
                        let message = format!(
                            "Halt {} advancement waiting for approval {}",
                            canary.qualified_name(),
                            hook.name
                        );
                        self.record_event_warning(canary, &message).await;
                        if !hook.mute_alert {
                            self.alert(canary, &message, false, crate::crd::AlertSeverity::Warn)
                                .await;
                        }
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Gate each progressive traffic increase
    pub(crate) async fn run_confirm_traffic_increase_hooks(&self, canary: &Canary) -> bool {
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::ConfirmTrafficIncrease {
                continue;
            }
            match self.call_hook(canary, CanaryPhase::Progressing, hook).await {
                Ok(_) => {
                    self.record_event_info(
                        canary,
                        &format!("Confirm-traffic-increase check {} passed", hook.name),
                    )
                    .await;
                }
                Err(_) => {
                    let message = format!(
                        "Halt {} advancement waiting for traffic increase approval {}",
                        canary.qualified_name(),
                        hook.name
                    );
                    self.record_event_warning(canary, &message).await;
                    if !hook.mute_alert {
                        self.alert(canary, &message, false, crate::crd::AlertSeverity::Warn)
                            .await;
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Gate promotion. A failing hook parks the canary in `WaitingPromotion`
    /// and re-arms the final iteration so the analysis keeps running.
    pub(crate) async fn run_confirm_promotion_hooks(
        &self,
        canary: &Canary,
        workload: &dyn WorkloadController,
    ) -> bool {
        let phase = canary.status_or_default().phase;
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::ConfirmPromotion {
                continue;
            }
            match self.call_hook(canary, CanaryPhase::Progressing, hook).await {
                Ok(_) => {
                    self.record_event_info(
                        canary,
                        &format!("Confirm-promotion check {} passed", hook.name),
                    )
                    .await;
                }
                Err(_) => {
                    if phase != CanaryPhase::WaitingPromotion {
                        if let Err(e) = workload
                            .set_status_phase(canary, CanaryPhase::WaitingPromotion)
                            .await
                        {
                            self.record_event_error(canary, &format!("{e}")).await;
                        }
                        let message = format!(
                            "Halt {} advancement waiting for promotion approval {}",
                            canary.qualified_name(),
                            hook.name
                        );
                        self.record_event_warning(canary, &message).await;
                        if !hook.mute_alert {
                            self.alert(canary, &message, false, crate::crd::AlertSeverity::Warn)
                                .await;
                        }
                    } else {
                        let iterations = (canary.analysis().iterations.unwrap_or(0) - 1).max(0);
                        if let Err(e) = workload.set_status_iterations(canary, iterations).await {
                            self.record_event_warning(canary, &format!("{e}")).await;
                        }
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Runs once before traffic starts shifting
    pub(crate) async fn run_pre_rollout_hooks(&self, canary: &Canary) -> bool {
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::PreRollout {
                continue;
            }
            match self.call_hook(canary, CanaryPhase::Progressing, hook).await {
                Ok(_) => {
                    self.record_event_info(
                        canary,
                        &format!("Pre-rollout check {} passed", hook.name),
                    )
                    .await;
                }
                Err(e) => {
                    self.record_event_warning(
                        canary,
                        &format!(
                            "Halt {} advancement pre-rollout check {} failed {e}",
                            canary.qualified_name(),
                            hook.name
                        ),
                    )
                    .await;
                    return false;
                }
            }
        }
        true
    }

    /// Informational hooks fired after finalization or rollback
    pub(crate) async fn run_post_rollout_hooks(&self, canary: &Canary, phase: CanaryPhase) -> bool {
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::PostRollout {
                continue;
            }
            match self.call_hook(canary, phase, hook).await {
                Ok(_) => {
                    self.record_event_info(
                        canary,
                        &format!("Post-rollout check {} passed", hook.name),
                    )
                    .await;
                }
                Err(e) => {
                    self.record_event_warning(
                        canary,
                        &format!("Post-rollout hook {} failed {e}", hook.name),
                    )
                    .await;
                    return false;
                }
            }
        }
        true
    }

    /// A 2xx answer from any rollback hook triggers an immediate rollback
    pub(crate) async fn run_rollback_hooks(&self, canary: &Canary, phase: CanaryPhase) -> bool {
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::Rollback {
                continue;
            }
            match self.call_hook(canary, phase, hook).await {
                Ok(_) => {
                    self.record_event_warning(
                        canary,
                        &format!("Rollback check {} passed", hook.name),
                    )
                    .await;
                    return true;
                }
                Err(_) => {
                    self.record_event_info(
                        canary,
                        &format!("Rollback hook {} not signaling a rollback", hook.name),
                    )
                    .await;
                }
            }
        }
        false
    }

    /// A 2xx answer from any skip hook finalizes the run as a success
    pub(crate) async fn run_skip_hooks(&self, canary: &Canary, phase: CanaryPhase) -> bool {
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::Skip {
                continue;
            }
            match self.call_hook(canary, phase, hook).await {
                Ok(_) => {
                    self.record_event_warning(
                        canary,
                        &format!("Skip canary check {} passed", hook.name),
                    )
                    .await;
                    return true;
                }
                Err(_) => {
                    self.record_event_info(
                        canary,
                        &format!("Skip hook {} not signaling a skip", hook.name),
                    )
                    .await;
                }
            }
        }
        false
    }

    /// Poll the manual-traffic-control hooks for an operator command.
    ///
    /// The first hook that answers decides; hook failures are ignored so a
    /// flapping control endpoint cannot wipe the stored override.
    pub(crate) async fn run_manual_traffic_control_hooks(&self, canary: &Canary) -> ManualCommand {
        let phase = canary.status_or_default().phase;
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::ManualTrafficControl {
                continue;
            }
            match self.call_hook(canary, phase, hook).await {
                Ok(body) => {
                    return match parse_manual_state(&body) {
                        Some(state) => ManualCommand::Command(state),
                        None => ManualCommand::Cleared,
                    };
                }
                Err(e) => {
                    debug!(
                        canary = %canary.qualified_name(),
                        hook = %hook.name,
                        error = %e,
                        "Manual control hook unavailable"
                    );
                }
            }
        }
        ManualCommand::Unavailable
    }

    /// Whether any manual-traffic-control hooks are declared
    pub(crate) fn has_manual_hooks(&self, canary: &Canary) -> bool {
        canary
            .analysis()
            .webhooks
            .iter()
            .any(|w| w.hook_type == HookType::ManualTrafficControl)
    }
}
