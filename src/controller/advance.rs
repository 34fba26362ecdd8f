//! The per-tick reconciler
//!
//! `advance_canary` drives one canary through its state machine: bootstrap
//! the primary and routing, detect new revisions, run the gates and the
//! analysis, dispatch the traffic-shifting strategy and finish with a
//! promotion or a rollback. Any failure surfaces as an event and the tick
//! ends; the next tick retries from the observed cluster state.

use std::time::Instant;

use tracing::{debug, error, info};

use super::analysis::AnalysisFailure;
use super::strategy::TOTAL_WEIGHT;
use super::Controller;
use crate::crd::canary::KUBERNETES_PROVIDER;
use crate::crd::{Canary, CanaryPhase, CanaryStatus};
use crate::router::{is_app_mesh, MeshRouter, Routes};
use crate::workload::WorkloadController;

impl Controller {
    /// One scheduling tick for one canary.
    pub async fn advance_canary(&self, name: &str, namespace: &str) {
        let begin = Instant::now();

        let mut cd = match self.client.get_canary(namespace, name).await {
            Ok(canary) => canary,
            Err(e) => {
                error!(
                    canary = %format!("{name}.{namespace}"),
                    error = %e,
                    "Canary not found"
                );
                return;
            }
        };

        if cd.spec.suspend {
            let message = "skipping canary run as object is suspended";
            debug!(canary = %cd.qualified_name(), "{message}");
            self.record_event_info(&cd, message).await;
            return;
        }

        // The canary's provider overrides the controller-wide one
        let provider = cd
            .spec
            .provider
            .clone()
            .unwrap_or_else(|| self.config.mesh_provider.clone());

        let Some(workload) = self.workloads.controller_for(&cd.spec.target_ref) else {
            self.record_event_warning(
                &cd,
                &format!(
                    "no workload controller registered for kind {}",
                    cd.spec.target_ref.kind
                ),
            )
            .await;
            return;
        };

        if let Err(e) = workload.get_metadata(&cd).await {
            self.record_event_warning(&cd, &format!("{e}")).await;
            return;
        }

        // Reconcile the generated services before anything else
        let service_router = self.routers.service_router();
        if let Err(e) = service_router.initialize(&cd).await {
            self.record_event_warning(&cd, &format!("{e}")).await;
            return;
        }

        let bootstrap_phase = matches!(
            cd.status_or_default().phase,
            CanaryPhase::Unset | CanaryPhase::Initializing
        );

        // Surface unreachable metric backends before the first run starts
        if !cd.skip_analysis() && bootstrap_phase {
            if let Err(e) = self.check_metric_provider_availability(&cd).await {
                self.record_event_error(&cd, &format!("Error checking metric providers: {e}"))
                    .await;
            }
        }

        let Some(mesh_router) = self.routers.mesh_router(&provider) else {
            self.record_event_warning(
                &cd,
                &format!("no mesh router registered for provider {provider}"),
            )
            .await;
            return;
        };

        // App-mesh objects must exist before the primary workload, otherwise
        // its pods come up without the sidecar proxy
        if is_app_mesh(&provider) {
            if let Err(e) = mesh_router.reconcile(&cd).await {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }
        }

        // Create or refresh the primary workload
        if let Err(e) = workload.initialize(&cd).await {
            self.record_event_warning(&cd, &format!("{e}")).await;
            if !e.is_retriable() {
                let message = format!(
                    "Rolling back {}: progress deadline exceeded, primary workload \
                     initialization failed: {e}",
                    cd.qualified_name()
                );
                self.record_event_warning(&cd, &message).await;
                self.alert(&cd, &message, false, crate::crd::AlertSeverity::Error)
                    .await;
                self.rollback(&cd, workload.as_ref(), mesh_router.as_ref())
                    .await;
            }
            return;
        }

        // Point the apex service at the primary
        if let Err(e) = service_router.reconcile(&cd).await {
            self.record_event_warning(&cd, &format!("{e}")).await;
            return;
        }

        // Scale the canary down once the primary serves the traffic
        if bootstrap_phase {
            info!(
                canary = %cd.qualified_name(),
                "Scaling down {} {}.{namespace}",
                cd.spec.target_ref.kind,
                cd.spec.target_ref.name
            );
            if let Err(e) = workload.scale_to_zero(&cd).await {
                self.record_event_warning(
                    &cd,
                    &format!(
                        "scaling down canary {} {}.{namespace} failed: {e}",
                        cd.spec.target_ref.kind, cd.spec.target_ref.name
                    ),
                )
                .await;
                return;
            }
        }

        // Take over existing routes after the primary is ready so the
        // switch is zero-downtime
        if !is_app_mesh(&provider) {
            if let Err(e) = mesh_router.reconcile(&cd).await {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }
        }

        if let Err(e) = self.set_phase_initialized(&mut cd, workload.as_ref()).await {
            self.record_event_warning(&cd, &e).await;
            return;
        }

        // Anything to do this tick?
        let should_advance = match self.should_advance(&cd, workload.as_ref()).await {
            Ok(advance) => advance,
            Err(e) => {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }
        };
        if !should_advance {
            self.metrics.set_status(&cd, cd.status_or_default().phase);
            return;
        }

        let max_weight = self.max_weight(&cd);

        if !cd.skip_analysis() {
            if let Err(e) = workload.is_primary_ready(&cd).await {
                self.record_event_warning(
                    &cd,
                    &format!("Primary workload readiness check failed: {e}"),
                )
                .await;
                if !e.is_retriable() {
                    let message = format!(
                        "Rolling back {}: progress deadline exceeded, primary workload \
                         is not ready: {e}",
                        cd.qualified_name()
                    );
                    self.record_event_warning(&cd, &message).await;
                    self.alert(&cd, &message, false, crate::crd::AlertSeverity::Error)
                        .await;
                    self.rollback(&cd, workload.as_ref(), mesh_router.as_ref())
                        .await;
                }
                return;
            }
        }

        // Observed routing state drives this tick's decisions
        let routes = match mesh_router.get_routes(&cd).await {
            Ok(routes) => routes,
            Err(e) => {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }
        };
        let Routes {
            primary_weight,
            canary_weight,
            mirrored,
        } = routes;
        self.metrics.set_weight(&cd, primary_weight, canary_weight);

        // Start a new run on revision change, or keep going
        if !self
            .check_canary_status(&mut cd, workload.as_ref(), should_advance)
            .await
        {
            return;
        }

        // Restart the analysis when the revision changed mid-run
        if self
            .has_canary_revision_changed(&cd, workload.as_ref())
            .await
        {
            info!(
                canary = %cd.qualified_name(),
                "Canary revision changed during analysis, restarting analysis"
            );
            if let Err(e) = mesh_router.set_routes(&cd, TOTAL_WEIGHT, 0, false).await {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }

            let status = CanaryStatus {
                phase: CanaryPhase::Progressing,
                last_start_time: Some(self.clock.now().to_rfc3339()),
                ..Default::default()
            };
            if let Err(e) = workload.sync_status(&cd, &status).await {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }
            if let Err(e) = self.reload_canary(&mut cd).await {
                error!(canary = %cd.qualified_name(), error = %e, "Canary reload failed");
                return;
            }
            let message = format!(
                "New revision detected! Restarting analysis for {}.{namespace}",
                cd.spec.target_ref.name
            );
            self.record_event_warning(&cd, &message).await;
            self.alert(&cd, &message, true, crate::crd::AlertSeverity::Warn)
                .await;
            return;
        }

        // Canary workload readiness
        if let Err(e) = workload.is_canary_ready(&cd).await {
            self.record_event_warning(&cd, &format!("Error checking canary workload status: {e}"))
                .await;
            if !e.is_retriable() {
                let message = format!(
                    "Rolling back {}: canary progress deadline exceeded: {e}",
                    cd.qualified_name()
                );
                self.record_event_warning(&cd, &message).await;
                self.alert(&cd, &message, false, crate::crd::AlertSeverity::Error)
                    .await;
                self.rollback(&cd, workload.as_ref(), mesh_router.as_ref())
                    .await;
            }
            return;
        }

        // Operator opted out of analysis, or a skip hook fired
        if self
            .should_skip_analysis(&cd, workload.as_ref(), mesh_router.as_ref())
            .await
        {
            return;
        }

        let phase = cd.status_or_default().phase;

        // Manual rollback webhook
        if matches!(
            phase,
            CanaryPhase::Progressing | CanaryPhase::Waiting | CanaryPhase::WaitingPromotion
        ) && self.run_rollback_hooks(&cd, phase).await
        {
            let message = format!("Rolling back {} manual webhook invoked", cd.qualified_name());
            self.record_event_warning(&cd, &message).await;
            self.alert(&cd, &message, false, crate::crd::AlertSeverity::Warn)
                .await;
            self.rollback(&cd, workload.as_ref(), mesh_router.as_ref())
                .await;
            return;
        }

        // Route traffic back to primary if the analysis already succeeded
        if phase == CanaryPhase::Promoting {
            self.run_promotion_traffic_shift(
                &cd,
                workload.as_ref(),
                mesh_router.as_ref(),
                &provider,
                canary_weight,
                primary_weight,
            )
            .await;
            return;
        }

        // Scale the canary down once all traffic is restored
        if phase == CanaryPhase::Finalising {
            if let Err(e) = workload.scale_to_zero(&cd).await {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }
            if let Err(e) = workload
                .set_status_phase(&cd, CanaryPhase::Succeeded)
                .await
            {
                self.record_event_warning(&cd, &format!("{e}")).await;
                return;
            }
            self.metrics.set_status(&cd, CanaryPhase::Succeeded);
            self.run_post_rollout_hooks(&cd, CanaryPhase::Succeeded).await;
            self.record_event_info(
                &cd,
                &format!(
                    "Promotion completed! Scaling down {}.{namespace}",
                    cd.spec.target_ref.name
                ),
            )
            .await;
            self.alert(
                &cd,
                "Canary analysis completed successfully, promotion finished.",
                false,
                crate::crd::AlertSeverity::Success,
            )
            .await;
            return;
        }

        // Give up after too many failed checks
        if matches!(phase, CanaryPhase::Progressing | CanaryPhase::WaitingPromotion)
            && cd.status_or_default().failed_checks >= cd.analysis_threshold()
        {
            self.rollback(&cd, workload.as_ref(), mesh_router.as_ref())
                .await;
            return;
        }

        self.advance_analysis(
            &mut cd,
            workload.as_ref(),
            mesh_router.as_ref(),
            &provider,
            mirrored,
            canary_weight,
            primary_weight,
            max_weight,
        )
        .await;

        self.metrics.record_duration(&cd, begin.elapsed());
    }

    /// The gated half of the tick: manual control, webhooks and metrics,
    /// interval throttling and the strategy dispatch.
    #[allow(clippy::too_many_arguments)]
    async fn advance_analysis(
        &self,
        cd: &mut Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
        provider: &str,
        mirrored: bool,
        canary_weight: i32,
        primary_weight: i32,
        max_weight: i32,
    ) {
        // Operator override first: it may pin weights or pause the run
        if self.has_manual_hooks(cd) {
            match self
                .handle_manual_control(cd, workload, mesh_router, canary_weight)
                .await
            {
                Ok(false) => {}
                Ok(true) => return,
                Err(e) => {
                    self.record_event_warning(cd, &format!("Failed to handle manual control: {e}"))
                        .await;
                    return;
                }
            }
        }

        let status = cd.status_or_default();
        let analysis = cd.analysis();

        // With no traffic routed or mirrored to the canary yet there is
        // nothing to measure; run the pre-rollout gates instead
        if canary_weight == 0 && status.iterations == 0 && !(analysis.mirror && mirrored) {
            self.record_event_info(
                cd,
                &format!(
                    "Starting canary analysis for {}.{}",
                    cd.spec.target_ref.name,
                    cd.metadata.namespace.as_deref().unwrap_or_default()
                ),
            )
            .await;

            if !self.run_pre_rollout_hooks(cd).await {
                match workload
                    .set_status_failed_checks(cd, status.failed_checks + 1)
                    .await
                {
                    Ok(()) => {
                        self.record_event_info(cd, "Pre-rollout webhooks error").await;
                    }
                    Err(e) => self.record_event_warning(cd, &format!("{e}")).await,
                }
                return;
            }
        } else {
            match self.run_analysis(cd).await {
                Ok(()) => {}
                Err(AnalysisFailure::Skip) => {
                    if self.should_skip_analysis(cd, workload, mesh_router).await {
                        return;
                    }
                    self.halt_with_failed_check(cd, workload, "skipping analysis requested")
                        .await;
                    return;
                }
                Err(AnalysisFailure::TooManyRequests) | Err(AnalysisFailure::NoValues) => {
                    // Transient or observational; never a failed check
                    return;
                }
                Err(AnalysisFailure::Failed(message)) => {
                    self.halt_with_failed_check(cd, workload, &message).await;
                    return;
                }
            }
        }

        // The kubernetes provider cannot shape traffic: A/B matching is
        // meaningless and progressive weights degrade to iterations
        let mut match_conditions = analysis.match_conditions.len();
        let mut iterations = analysis.iterations.unwrap_or(0);
        if provider == KUBERNETES_PROVIDER {
            if match_conditions > 0 {
                self.record_event_warning(
                    cd,
                    "A/B testing is not supported when using the kubernetes provider",
                )
                .await;
                match_conditions = 0;
            }
            if iterations < 1 {
                self.record_event_warning(
                    cd,
                    "Progressive traffic shifting is not supported when using the \
                     kubernetes provider, defaulting to iterations: 10",
                )
                .await;
                iterations = 10;
            }
        }

        // Throttle: traffic moves at the declared analysis interval even
        // though the job may tick faster
        if let Some(last_transition) = cd.status_or_default().last_transition() {
            let interval = chrono::Duration::from_std(cd.analysis_interval())
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            if self.clock.now() < last_transition + interval {
                return;
            }
        }

        // Strategy dispatch
        if match_conditions > 0 && iterations > 0 {
            self.run_ab(cd, workload, mesh_router).await;
            return;
        }

        if iterations > 0 {
            self.run_blue_green(cd, workload, mesh_router, provider, mirrored, canary_weight)
                .await;
            return;
        }

        if self.next_step_weight(cd, canary_weight) > 0 {
            // Gate each real traffic increase; mirrored steps and promotion
            // phases are not increases
            let phase = cd.status_or_default().phase;
            if !mirrored
                && !matches!(
                    phase,
                    CanaryPhase::Promoting | CanaryPhase::WaitingPromotion | CanaryPhase::Finalising
                )
                && !self.run_confirm_traffic_increase_hooks(cd).await
            {
                return;
            }
            self.run_canary(
                cd,
                workload,
                mesh_router,
                mirrored,
                canary_weight,
                primary_weight,
                max_weight,
            )
            .await;
        }
    }

    async fn halt_with_failed_check(
        &self,
        cd: &Canary,
        workload: &dyn WorkloadController,
        message: &str,
    ) {
        let failed_checks = cd.status_or_default().failed_checks;
        match workload
            .set_status_failed_checks(cd, failed_checks + 1)
            .await
        {
            Ok(()) => {
                self.record_event_warning(cd, &format!("Analysis failed: {message}"))
                    .await;
            }
            Err(e) => self.record_event_warning(cd, &format!("{e}")).await,
        }
    }

    /// Move a freshly bootstrapped canary to `Initialized`
    async fn set_phase_initialized(
        &self,
        cd: &mut Canary,
        workload: &dyn WorkloadController,
    ) -> Result<(), String> {
        if !matches!(
            cd.status_or_default().phase,
            CanaryPhase::Unset | CanaryPhase::Initializing
        ) {
            return Ok(());
        }

        workload
            .sync_status(cd, &CanaryStatus::with_phase(CanaryPhase::Initialized))
            .await
            .map_err(|e| format!("failed to sync canary {} status: {e}", cd.qualified_name()))?;

        // Pick up the template hashes the sync stamped; they feed the
        // revision checks later this tick
        self.reload_canary(cd)
            .await
            .map_err(|e| format!("failed to get canary {}: {e}", cd.qualified_name()))?;

        self.metrics.set_status(cd, CanaryPhase::Initialized);
        self.record_event_info(
            cd,
            &format!("Initialization done! {}", cd.qualified_name()),
        )
        .await;
        self.alert(
            cd,
            &format!(
                "New {} detected, initialization completed! {}",
                cd.spec.target_ref.kind,
                cd.qualified_name()
            ),
            true,
            crate::crd::AlertSeverity::Success,
        )
        .await;
        Ok(())
    }

    /// Whether this tick has anything to advance: an active run, or a
    /// revision/config change waiting to start one.
    async fn should_advance(
        &self,
        cd: &Canary,
        workload: &dyn WorkloadController,
    ) -> Result<bool, crate::workload::WorkloadError> {
        let status = cd.status_or_default();
        if status.phase.is_active() {
            return Ok(true);
        }

        // Keep lastAppliedSpec fresh on failed canaries so reverting the
        // spec to the promoted revision does not retrigger a run
        if status.phase == CanaryPhase::Failed {
            if let Err(e) = workload.sync_status(cd, &status).await {
                self.record_event_warning(cd, &format!("Failed to sync canary status: {e}"))
                    .await;
                return Err(e);
            }
        }

        if workload.has_target_changed(cd).await? {
            return Ok(true);
        }
        workload.have_dependencies_changed(cd).await
    }

    /// Decide whether the analysis continues this tick; when a new revision
    /// waits, scale the canary up and enter `Progressing`.
    ///
    /// Returns false when the tick is done (the transition itself consumed
    /// it). `Waiting` continues only under an active manual override; the
    /// plain `Waiting` produced by a confirm-rollout gate re-enters through
    /// the gate below.
    async fn check_canary_status(
        &self,
        cd: &mut Canary,
        workload: &dyn WorkloadController,
        should_advance: bool,
    ) -> bool {
        let status = cd.status_or_default();
        self.metrics.set_status(cd, status.phase);

        if matches!(
            status.phase,
            CanaryPhase::Progressing
                | CanaryPhase::WaitingPromotion
                | CanaryPhase::Promoting
                | CanaryPhase::Finalising
        ) || (status.phase == CanaryPhase::Waiting && status.manual_state.is_some())
        {
            return true;
        }

        if let Err(e) = self.reload_canary(cd).await {
            error!(canary = %cd.qualified_name(), error = %e, "Failed to get canary");
            return false;
        }

        if should_advance {
            if !self.run_confirm_rollout_hooks(cd, workload).await {
                return false;
            }

            let message = format!(
                "New revision detected! Scaling up {}.{}",
                cd.spec.target_ref.name,
                cd.metadata.namespace.as_deref().unwrap_or_default()
            );
            info!(canary = %cd.qualified_name(), "{message}");

            if let Err(e) = workload.scale_from_zero(cd).await {
                self.record_event_error(cd, &format!("{e}")).await;
                return false;
            }

            let status = CanaryStatus {
                phase: CanaryPhase::Progressing,
                last_start_time: Some(self.clock.now().to_rfc3339()),
                ..Default::default()
            };
            if let Err(e) = workload.sync_status(cd, &status).await {
                error!(canary = %cd.qualified_name(), error = %e, "Failed to update canary status");
                return false;
            }
            self.metrics.set_status(cd, CanaryPhase::Progressing);

            if let Err(e) = self.reload_canary(cd).await {
                error!(canary = %cd.qualified_name(), error = %e, "Failed to get canary");
                return false;
            }

            self.record_event_info(cd, &message).await;
            self.alert(
                cd,
                &format!(
                    "New revision detected, progressing canary analysis! Scaling up {}.{}",
                    cd.spec.target_ref.name,
                    cd.metadata.namespace.as_deref().unwrap_or_default()
                ),
                true,
                crate::crd::AlertSeverity::Info,
            )
            .await;
        }
        false
    }

    /// Whether the target or a tracked config changed while a run is active
    async fn has_canary_revision_changed(
        &self,
        cd: &Canary,
        workload: &dyn WorkloadController,
    ) -> bool {
        if !matches!(
            cd.status_or_default().phase,
            CanaryPhase::Progressing | CanaryPhase::WaitingPromotion
        ) {
            return false;
        }
        if workload.has_target_changed(cd).await.unwrap_or(false) {
            return true;
        }
        workload
            .have_dependencies_changed(cd)
            .await
            .unwrap_or(false)
    }

    /// Finalize the run as a success without analysis when the operator
    /// opted out or a skip hook fired.
    async fn should_skip_analysis(
        &self,
        cd: &Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
    ) -> bool {
        let skip_flag = cd.skip_analysis();
        let skip_hook = self
            .run_skip_hooks(cd, cd.status_or_default().phase)
            .await;
        if skip_hook {
            let message = format!("Skip canary {} manual webhook invoked", cd.qualified_name());
            self.record_event_warning(cd, &message).await;
            self.alert(cd, &message, false, crate::crd::AlertSeverity::Warn)
                .await;
        }
        if !skip_flag && !skip_hook {
            return false;
        }

        self.record_event_warning(
            cd,
            &format!("Skipping analysis for {}", cd.qualified_name()),
        )
        .await;

        if let Err(e) = mesh_router.set_routes(cd, TOTAL_WEIGHT, 0, false).await {
            self.record_event_warning(cd, &format!("{e}")).await;
            return true;
        }
        self.metrics.set_weight(cd, TOTAL_WEIGHT, 0);

        let namespace = cd.metadata.namespace.as_deref().unwrap_or_default();
        self.record_event_info(
            cd,
            &format!(
                "Copying {target}.{namespace} template spec to {target}-primary.{namespace}",
                target = cd.spec.target_ref.name
            ),
        )
        .await;
        if let Err(e) = workload.promote(cd).await {
            self.record_event_warning(cd, &format!("{e}")).await;
            return true;
        }

        if let Err(e) = workload.scale_to_zero(cd).await {
            self.record_event_warning(cd, &format!("{e}")).await;
            return true;
        }

        if let Err(e) = workload.set_status_phase(cd, CanaryPhase::Succeeded).await {
            self.record_event_warning(cd, &format!("{e}")).await;
            return true;
        }

        self.metrics.set_status(cd, CanaryPhase::Succeeded);
        self.record_event_info(
            cd,
            &format!(
                "Promotion completed! Canary analysis was skipped for {}.{namespace}",
                cd.spec.target_ref.name
            ),
        )
        .await;
        self.alert(
            cd,
            "Canary analysis was skipped, promotion finished.",
            false,
            crate::crd::AlertSeverity::Success,
        )
        .await;

        true
    }

    /// Restore all traffic to the primary, scale the canary down and mark
    /// the run `Failed`.
    pub(crate) async fn rollback(
        &self,
        cd: &Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
    ) {
        let status = cd.status_or_default();
        if status.failed_checks >= cd.analysis_threshold() {
            let message = format!(
                "Rolling back {}: failed checks threshold reached {}",
                cd.qualified_name(),
                status.failed_checks
            );
            self.record_event_warning(cd, &message).await;
            self.alert(cd, &message, false, crate::crd::AlertSeverity::Error)
                .await;
        }

        if let Err(e) = mesh_router.set_routes(cd, TOTAL_WEIGHT, 0, false).await {
            self.record_event_warning(cd, &format!("{e}")).await;
            return;
        }
        self.metrics.set_weight(cd, TOTAL_WEIGHT, 0);

        self.record_event_warning(
            cd,
            &format!("Canary failed! Scaling down {}", cd.qualified_name()),
        )
        .await;

        if let Err(e) = workload.scale_to_zero(cd).await {
            self.record_event_warning(cd, &format!("{e}")).await;
            return;
        }

        let failed = CanaryStatus {
            phase: CanaryPhase::Failed,
            canary_weight: 0,
            ..Default::default()
        };
        if let Err(e) = workload.sync_status(cd, &failed).await {
            error!(
                canary = %cd.qualified_name(),
                error = %e,
                "Failed to mark canary as failed"
            );
            return;
        }
        self.record_event_info(
            cd,
            &format!(
                "Canary failed. Scaled down {}.{}",
                cd.spec.target_ref.name,
                cd.metadata.namespace.as_deref().unwrap_or_default()
            ),
        )
        .await;

        self.metrics.set_status(cd, CanaryPhase::Failed);
        self.run_post_rollout_hooks(cd, CanaryPhase::Failed).await;
    }

    async fn reload_canary(&self, cd: &mut Canary) -> Result<(), crate::client::ClientError> {
        let namespace = cd.metadata.namespace.clone().unwrap_or_default();
        let name = cd.metadata.name.clone().unwrap_or_default();
        *cd = self.client.get_canary(&namespace, &name).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "advance_test.rs"]
mod tests;
