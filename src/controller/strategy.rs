//! Traffic-shifting strategies
//!
//! Weight arithmetic plus the per-mode handlers dispatched at the end of an
//! advance tick: progressive weight increase (with optional mirroring),
//! blue/green iterations, A/B iterations and the post-promotion shift that
//! returns traffic to the primary.

use tracing::info;

use super::Controller;
use crate::crd::canary::KUBERNETES_PROVIDER;
use crate::crd::{Canary, CanaryPhase};
use crate::router::MeshRouter;
use crate::workload::WorkloadController;

/// Total routable traffic. The routers split this between primary and
/// canary; no field on the Canary resource varies it.
pub(crate) const TOTAL_WEIGHT: i32 = 100;

impl Controller {
    /// Weight at which progressive analysis stops and promotion starts
    pub(crate) fn max_weight(&self, canary: &Canary) -> i32 {
        let analysis = canary.analysis();
        if let Some(last) = analysis
            .step_weights
            .as_ref()
            .and_then(|steps| steps.last().copied())
        {
            return TOTAL_WEIGHT.min(last);
        }
        match analysis.max_weight {
            Some(weight) if weight > 0 => weight,
            _ => TOTAL_WEIGHT,
        }
    }

    /// The increment to add to the canary side on the next progressive step
    pub(crate) fn next_step_weight(&self, canary: &Canary, canary_weight: i32) -> i32 {
        let analysis = canary.analysis();
        let step_weight = analysis.step_weight.unwrap_or(0);
        let steps = analysis
            .step_weights
            .as_deref()
            .unwrap_or(&[]);

        if step_weight > 0 || steps.is_empty() {
            return step_weight;
        }

        let max_step = TOTAL_WEIGHT - canary_weight;

        // Nothing left to shift: any non-zero step moves the canary into
        // promotion, same as the last step of a stepWeight progression
        if max_step == 0 {
            return 1;
        }

        if canary_weight == 0 {
            return max_step.min(steps[0]);
        }

        // Find the current step and return the difference to the next one
        for window in steps.windows(2) {
            if window[0] == canary_weight {
                return max_step.min(window[1] - canary_weight);
            }
        }

        max_step
    }

    /// Progressive strategy: step the weight split or start promotion
    pub(crate) async fn run_canary(
        &self,
        canary: &Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
        mirrored: bool,
        canary_weight: i32,
        primary_weight: i32,
        max_weight: i32,
    ) {
        let analysis = canary.analysis();

        let mut should_promote = canary_weight >= max_weight;

        // A step list may deliberately overflow the total weight; promotion
        // then triggers once the full traffic is on the canary
        if let Some(last) = analysis
            .step_weights
            .as_ref()
            .and_then(|steps| steps.last().copied())
        {
            if last > TOTAL_WEIGHT && canary_weight >= TOTAL_WEIGHT {
                should_promote = true;
            }
        }
        if canary_weight >= TOTAL_WEIGHT {
            should_promote = true;
        }

        if !should_promote {
            let step = self.next_step_weight(canary, canary_weight);
            let mut mirrored = mirrored;
            let mut primary_weight = primary_weight;
            let mut canary_weight = canary_weight;

            if analysis.mirror && canary_weight == 0 {
                // One full tick of mirroring before real traffic shifts:
                // requests go to both copies, responses come from primary
                if !mirrored {
                    mirrored = true;
                    primary_weight = TOTAL_WEIGHT;
                    canary_weight = 0;
                } else {
                    mirrored = false;
                    primary_weight = TOTAL_WEIGHT - step;
                    canary_weight = step;
                }
                info!(
                    canary = %canary.qualified_name(),
                    "Mirror step {primary_weight}/{canary_weight}/{mirrored}"
                );
            } else {
                primary_weight = (primary_weight - step).max(0);
                canary_weight = (canary_weight + step).min(TOTAL_WEIGHT);
            }

            if let Err(e) = mesh_router
                .set_routes(canary, primary_weight, canary_weight, mirrored)
                .await
            {
                self.record_event_warning(canary, &format!("{e}")).await;
                return;
            }
            if let Err(e) = workload.set_status_weight(canary, canary_weight).await {
                self.record_event_warning(canary, &format!("{e}")).await;
                return;
            }

            self.metrics.set_weight(canary, primary_weight, canary_weight);
            self.record_event_info(
                canary,
                &format!(
                    "Advance {} canary weight {canary_weight}",
                    canary.qualified_name()
                ),
            )
            .await;
            return;
        }

        // Max weight reached: promotion gate, then copy the template over
        if !self.run_confirm_promotion_hooks(canary, workload).await {
            return;
        }

        let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
        self.record_event_info(
            canary,
            &format!(
                "Copying {target}.{namespace} template spec to {target}-primary.{namespace}",
                target = canary.spec.target_ref.name
            ),
        )
        .await;
        if let Err(e) = workload.promote(canary).await {
            self.record_event_warning(canary, &format!("{e}")).await;
            return;
        }

        if let Err(e) = workload
            .set_status_phase(canary, CanaryPhase::Promoting)
            .await
        {
            self.record_event_warning(canary, &format!("{e}")).await;
            return;
        }
        self.record_event_info(
            canary,
            &format!(
                "Promoting {}.{namespace} to primary",
                canary.spec.target_ref.name
            ),
        )
        .await;
    }

    /// A/B strategy: route the matched subset for the declared iterations
    pub(crate) async fn run_ab(
        &self,
        canary: &Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
    ) {
        let iterations = canary.analysis().iterations.unwrap_or(0);
        let status_iterations = canary.status_or_default().iterations;

        // Route matched traffic to the canary and count the iteration
        if iterations > status_iterations {
            if let Err(e) = mesh_router.set_routes(canary, 0, TOTAL_WEIGHT, false).await {
                self.record_event_warning(canary, &format!("{e}")).await;
                return;
            }
            self.metrics.set_weight(canary, 0, TOTAL_WEIGHT);

            if let Err(e) = workload
                .set_status_iterations(canary, status_iterations + 1)
                .await
            {
                self.record_event_warning(canary, &format!("{e}")).await;
                return;
            }
            self.record_event_info(
                canary,
                &format!(
                    "Advance {} canary iteration {}/{}",
                    canary.qualified_name(),
                    status_iterations + 1,
                    iterations
                ),
            )
            .await;
            return;
        }

        if !self.run_confirm_promotion_hooks(canary, workload).await {
            return;
        }

        if iterations == status_iterations {
            self.promote_template(canary, workload).await;
        }
    }

    /// Blue/green strategy: hold traffic on primary for the declared
    /// iterations, flip everything to the canary, then promote.
    pub(crate) async fn run_blue_green(
        &self,
        canary: &Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
        provider: &str,
        mirrored: bool,
        canary_weight: i32,
    ) {
        let analysis = canary.analysis();
        let iterations = analysis.iterations.unwrap_or(0);
        let status_iterations = canary.status_or_default().iterations;

        if iterations > status_iterations {
            // Mirror for the whole test when requested and traffic can shift
            if provider != KUBERNETES_PROVIDER && analysis.mirror && !mirrored {
                if let Err(e) = mesh_router
                    .set_routes(canary, TOTAL_WEIGHT, 0, true)
                    .await
                {
                    self.record_event_warning(canary, &format!("{e}")).await;
                }
                info!(canary = %canary.qualified_name(), "Start traffic mirroring");
            }
            if let Err(e) = workload
                .set_status_iterations(canary, status_iterations + 1)
                .await
            {
                self.record_event_warning(canary, &format!("{e}")).await;
                return;
            }
            self.record_event_info(
                canary,
                &format!(
                    "Advance {} canary iteration {}/{}",
                    canary.qualified_name(),
                    status_iterations + 1,
                    iterations
                ),
            )
            .await;
            return;
        }

        if !self.run_confirm_promotion_hooks(canary, workload).await {
            return;
        }

        if iterations == status_iterations {
            // No routes exist on the kubernetes provider, promote directly
            if provider == KUBERNETES_PROVIDER {
                self.promote_template(canary, workload).await;
                return;
            }

            // Iterations served but traffic still on primary: flip it. The
            // router-reported weight remembers the flip across ticks.
            if canary_weight < TOTAL_WEIGHT {
                if analysis.mirror {
                    self.record_event_info(
                        canary,
                        "Stop traffic mirroring and route all traffic to canary",
                    )
                    .await;
                } else {
                    self.record_event_info(canary, "Routing all traffic to canary")
                        .await;
                }
                if let Err(e) = mesh_router.set_routes(canary, 0, TOTAL_WEIGHT, false).await {
                    self.record_event_warning(canary, &format!("{e}")).await;
                    return;
                }
                self.metrics.set_weight(canary, 0, TOTAL_WEIGHT);
                return;
            }

            // Canary served a full interval with all traffic: promote
            self.promote_template(canary, workload).await;
        }
    }

    /// Post-promotion shift: return traffic to the (now updated) primary
    pub(crate) async fn run_promotion_traffic_shift(
        &self,
        canary: &Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
        provider: &str,
        canary_weight: i32,
        primary_weight: i32,
    ) {
        // No traffic shifting is possible for the kubernetes provider
        if provider == KUBERNETES_PROVIDER {
            if let Err(e) = workload
                .set_status_phase(canary, CanaryPhase::Finalising)
                .await
            {
                self.record_event_warning(canary, &format!("{e}")).await;
            }
            return;
        }

        let step = canary.analysis().step_weight_promotion.unwrap_or(0);

        // One-shot restoration when no promotion step is declared
        if step == 0 {
            self.record_event_info(canary, "Routing all traffic to primary")
                .await;
            if let Err(e) = mesh_router
                .set_routes(canary, TOTAL_WEIGHT, 0, false)
                .await
            {
                self.record_event_warning(canary, &format!("{e}")).await;
                return;
            }
            self.metrics.set_weight(canary, TOTAL_WEIGHT, 0);
            if let Err(e) = workload
                .set_status_phase(canary, CanaryPhase::Finalising)
                .await
            {
                self.record_event_warning(canary, &format!("{e}")).await;
            } else {
                self.record_event_info(
                    canary,
                    &format!(
                        "Promotion completed! Routing all traffic to primary. {}",
                        canary.qualified_name()
                    ),
                )
                .await;
            }
            return;
        }

        // Increment the primary weight until it owns all traffic again
        if canary_weight > 0 {
            let primary_weight = (primary_weight + step).min(TOTAL_WEIGHT);
            let canary_weight = (canary_weight - step).max(0);

            if let Err(e) = mesh_router
                .set_routes(canary, primary_weight, canary_weight, false)
                .await
            {
                self.record_event_warning(canary, &format!("{e}")).await;
                return;
            }
            self.metrics.set_weight(canary, primary_weight, canary_weight);
            self.record_event_info(
                canary,
                &format!(
                    "Advance {} primary weight {primary_weight}",
                    canary.qualified_name()
                ),
            )
            .await;

            if primary_weight == TOTAL_WEIGHT {
                if let Err(e) = workload
                    .set_status_phase(canary, CanaryPhase::Finalising)
                    .await
                {
                    self.record_event_warning(canary, &format!("{e}")).await;
                } else {
                    self.record_event_info(
                        canary,
                        &format!(
                            "Promotion completed! Routing all traffic to primary. {}",
                            canary.qualified_name()
                        ),
                    )
                    .await;
                }
            } else if let Err(e) = workload.set_status_weight(canary, canary_weight).await {
                self.record_event_warning(canary, &format!("{e}")).await;
            } else {
                self.record_event_info(
                    canary,
                    &format!(
                        "Advance {} canary weight {canary_weight}",
                        canary.qualified_name()
                    ),
                )
                .await;
            }
        }
    }

    /// Copy the canary template onto the primary and enter `Promoting`
    async fn promote_template(&self, canary: &Canary, workload: &dyn WorkloadController) {
        let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
        self.record_event_info(
            canary,
            &format!(
                "Copying {target}.{namespace} template spec to {target}-primary.{namespace}",
                target = canary.spec.target_ref.name
            ),
        )
        .await;
        if let Err(e) = workload.promote(canary).await {
            self.record_event_warning(canary, &format!("{e}")).await;
            return;
        }
        if let Err(e) = workload
            .set_status_phase(canary, CanaryPhase::Promoting)
            .await
        {
            self.record_event_warning(canary, &format!("{e}")).await;
            return;
        }
        self.record_event_info(
            canary,
            &format!(
                "Promoting {}.{namespace} to primary",
                canary.spec.target_ref.name
            ),
        )
        .await;
    }
}
