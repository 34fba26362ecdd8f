//! Manual traffic control
//!
//! Operators can pin a weight and pause/resume a run through a
//! manual-traffic-control hook. Commands are ordered by timestamp: a newer
//! timestamp is recorded and applied, an already-recorded one is re-applied
//! idempotently (the router may have drifted under a failed SetRoutes), and
//! an empty answer clears the override and resumes automatic progression.

use thiserror::Error;

use super::hooks::ManualCommand;
use super::strategy::TOTAL_WEIGHT;
use super::Controller;
use crate::client::ClientError;
use crate::crd::{Canary, CanaryPhase};
use crate::router::{MeshRouter, RouterError};
use crate::workload::{WorkloadController, WorkloadError};

#[derive(Debug, Error)]
pub(crate) enum ManualControlError {
    #[error("invalid manual weight {0}, must be between 0 and 100")]
    InvalidWeight(i32),

    #[error("failed to set manual traffic weight: {0}")]
    Routing(#[from] RouterError),

    #[error("failed to sync status for manual control: {0}")]
    Status(#[from] WorkloadError),

    #[error("failed to reload canary: {0}")]
    Reload(#[from] ClientError),
}

impl Controller {
    /// Apply the current manual command, if any.
    ///
    /// Returns `Ok(true)` when automatic progression must pause this tick.
    /// `router_canary_weight` is the split reported by the mesh router at the
    /// start of the tick; re-application compares against it so a drifted
    /// router is healed even when the stored status already matches.
    pub(crate) async fn handle_manual_control(
        &self,
        canary: &mut Canary,
        workload: &dyn WorkloadController,
        mesh_router: &dyn MeshRouter,
        router_canary_weight: i32,
    ) -> Result<bool, ManualControlError> {
        let command = self.run_manual_traffic_control_hooks(canary).await;
        let mut status = canary.status_or_default();

        match command {
            ManualCommand::Unavailable => Ok(false),

            ManualCommand::Cleared => {
                if status.manual_state.is_some() {
                    status.manual_state = None;
                    status.last_applied_manual_timestamp = String::new();
                    // A cleared override resumes the run where it paused
                    if status.phase == CanaryPhase::Waiting {
                        status.phase = CanaryPhase::Progressing;
                    }
                    workload.sync_status(canary, &status).await?;
                    self.reload(canary).await?;
                    self.record_event_info(
                        canary,
                        "Manual control deactivated, resuming automatic progression",
                    )
                    .await;
                }
                Ok(false)
            }

            ManualCommand::Command(state) => {
                if state.timestamp > status.last_applied_manual_timestamp {
                    // New command: validate, apply, record
                    self.record_event_info(
                        canary,
                        &format!("New manual control command received at {}", state.timestamp),
                    )
                    .await;

                    if let Some(weight) = state.weight {
                        if !(0..=TOTAL_WEIGHT).contains(&weight) {
                            return Err(ManualControlError::InvalidWeight(weight));
                        }
                        if status.canary_weight != weight || router_canary_weight != weight {
                            mesh_router
                                .set_routes(canary, TOTAL_WEIGHT - weight, weight, false)
                                .await?;
                            self.metrics
                                .set_weight(canary, TOTAL_WEIGHT - weight, weight);
                            status.canary_weight = weight;
                            self.record_event_info(
                                canary,
                                &format!("Manual weight set to {weight}%"),
                            )
                            .await;
                        }
                    }

                    status.last_applied_manual_timestamp = state.timestamp.clone();
                    if state.paused {
                        status.phase = CanaryPhase::Waiting;
                    } else if status.phase == CanaryPhase::Waiting {
                        status.phase = CanaryPhase::Progressing;
                    }
                    let paused = state.paused;
                    status.manual_state = Some(state);
                    workload.sync_status(canary, &status).await?;
                    self.reload(canary).await?;

                    return Ok(paused);
                }

                // Already-recorded command: re-apply idempotently
                if let Some(weight) = state.weight {
                    if (0..=TOTAL_WEIGHT).contains(&weight) && router_canary_weight != weight {
                        mesh_router
                            .set_routes(canary, TOTAL_WEIGHT - weight, weight, false)
                            .await?;
                        self.metrics
                            .set_weight(canary, TOTAL_WEIGHT - weight, weight);
                        status.canary_weight = weight;
                        workload.sync_status(canary, &status).await?;
                        self.reload(canary).await?;
                        self.record_event_info(canary, &format!("Manual weight set to {weight}%"))
                            .await;
                        status = canary.status_or_default();
                    }
                } else if let Some(stored) = status.manual_state.as_mut() {
                    // Weightless re-issue may still toggle the pause flag
                    if stored.paused != state.paused {
                        stored.paused = state.paused;
                        workload.sync_status(canary, &status).await?;
                        self.reload(canary).await?;
                        status = canary.status_or_default();
                    }
                }

                let paused = status
                    .manual_state
                    .as_ref()
                    .map(|m| m.paused)
                    .unwrap_or(false);
                if paused {
                    return Ok(true);
                }

                // Resuming: keep the pinned weight, never restart from zero
                if status.phase == CanaryPhase::Waiting {
                    let weight = status.canary_weight;
                    mesh_router
                        .set_routes(canary, TOTAL_WEIGHT - weight, weight, false)
                        .await?;
                    self.metrics
                        .set_weight(canary, TOTAL_WEIGHT - weight, weight);
                    self.record_event_info(
                        canary,
                        &format!("Resuming from manual pause with weight {weight}%"),
                    )
                    .await;

                    status.phase = CanaryPhase::Progressing;
                    if let Some(stored) = status.manual_state.as_mut() {
                        stored.paused = false;
                    }
                    workload.sync_status(canary, &status).await?;
                    self.reload(canary).await?;
                }

                Ok(false)
            }
        }
    }

    async fn reload(&self, canary: &mut Canary) -> Result<(), ClientError> {
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let name = canary.metadata.name.clone().unwrap_or_default();
        *canary = self.client.get_canary(&namespace, &name).await?;
        Ok(())
    }
}
