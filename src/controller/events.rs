//! Event recording and alert fan-out
//!
//! Every noteworthy decision is surfaced three ways:
//! - a structured log line,
//! - a Kubernetes `Synced` event on the Canary resource,
//! - a mirror to declared `event` hooks (or the controller-wide event
//!   webhook).
//!
//! Alerts additionally route through the notifier seam, either the
//! process-wide notifier or per-canary AlertProvider references filtered by
//! severity. Deliveries are fire-and-forget through a bounded permit pool so
//! an alert storm cannot pile up unbounded tasks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use tracing::{error, info, warn};

use super::webhook::{build_event_payload, EVENT_HOOK_TIMEOUT};
use super::Controller;
use crate::crd::{AlertSeverity, Canary, CanaryWebhook, HookType};
use crate::notifier::{AlertField, Notifier, NotifierEndpoint};

/// Kubernetes event type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Seam for publishing Kubernetes Events on Canary resources
///
/// Implementations are fire-and-forget: failures are logged, never returned.
/// A failed event must never break a scheduling tick.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, canary: &Canary, kind: EventKind, message: &str);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    /// The controller name appears as the reporting component on events.
    pub fn new(client: kube::Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, canary: &Canary, kind: EventKind, message: &str) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: "Synced".to_string(),
            note: Some(message.to_string()),
            action: "Advance".to_string(),
            secondary: None,
        };
        let reference: ObjectReference = canary.object_ref(&());
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(
                canary = %canary.qualified_name(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

impl Controller {
    pub(crate) async fn record_event_info(&self, canary: &Canary, message: &str) {
        info!(canary = %canary.qualified_name(), "{message}");
        self.event_recorder
            .record(canary, EventKind::Normal, message)
            .await;
        self.send_event_to_webhook(canary, EventKind::Normal, message)
            .await;
    }

    pub(crate) async fn record_event_warning(&self, canary: &Canary, message: &str) {
        warn!(canary = %canary.qualified_name(), "{message}");
        self.event_recorder
            .record(canary, EventKind::Warning, message)
            .await;
        self.send_event_to_webhook(canary, EventKind::Warning, message)
            .await;
    }

    pub(crate) async fn record_event_error(&self, canary: &Canary, message: &str) {
        error!(canary = %canary.qualified_name(), "{message}");
        self.event_recorder
            .record(canary, EventKind::Warning, message)
            .await;
        self.send_event_to_webhook(canary, EventKind::Warning, message)
            .await;
    }

    /// Mirror an event to declared `event` hooks, or to the controller-wide
    /// event webhook when the canary declares none.
    async fn send_event_to_webhook(&self, canary: &Canary, kind: EventKind, message: &str) {
        let mut overridden = false;
        for hook in &canary.analysis().webhooks {
            if hook.hook_type == HookType::Event {
                overridden = true;
                self.post_event_hook(canary, hook, kind, message).await;
            }
        }

        if !overridden && !self.config.event_webhook.is_empty() {
            let hook = CanaryWebhook {
                hook_type: HookType::Event,
                name: "events".to_string(),
                url: self.config.event_webhook.clone(),
                ..Default::default()
            };
            self.post_event_hook(canary, &hook, kind, message).await;
        }
    }

    async fn post_event_hook(
        &self,
        canary: &Canary,
        hook: &CanaryWebhook,
        kind: EventKind,
        message: &str,
    ) {
        let payload = build_event_payload(canary, hook, message, kind.as_str(), self.clock.now());
        if let Err(e) = self
            .hook_client
            .call(&hook.url, &payload, EVENT_HOOK_TIMEOUT, hook.retries)
            .await
        {
            warn!(
                canary = %canary.qualified_name(),
                hook = %hook.name,
                error = %e,
                "Error sending event to webhook"
            );
        }
    }

    /// Deliver an alert through the configured channels.
    ///
    /// With no per-canary alert entries the process-wide notifier is used;
    /// otherwise every entry whose subscribed severity matches receives the
    /// alert through its resolved AlertProvider.
    pub(crate) async fn alert(
        &self,
        canary: &Canary,
        message: &str,
        include_metadata: bool,
        severity: AlertSeverity,
    ) {
        let mut fields = Vec::new();
        if !self.config.cluster_name.is_empty() {
            fields.push(AlertField::new("Cluster", self.config.cluster_name.clone()));
        }
        if include_metadata {
            fields.extend(alert_metadata(canary));
        }

        // Gate-hook driven runs are correlated by checksum
        let canary_id = if canary
            .analysis()
            .webhooks
            .iter()
            .any(|w| matches!(w.hook_type, HookType::Skip | HookType::Rollback))
        {
            canary.canary_checksum()
        } else {
            String::new()
        };

        let alerts = canary.analysis().alerts.clone();
        if alerts.is_empty() {
            if let Some(notifier) = &self.notifier {
                self.dispatch_alert(
                    notifier.clone(),
                    canary,
                    message,
                    fields,
                    severity,
                    canary_id,
                );
            }
            return;
        }

        for alert in &alerts {
            if !crate::notifier::severity_matches(alert.severity, severity) {
                continue;
            }

            let provider_namespace = alert
                .provider_ref
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .or_else(|| canary.metadata.namespace.clone())
                .unwrap_or_default();

            let provider = match self
                .client
                .get_alert_provider(&provider_namespace, &alert.provider_ref.name)
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    error!(
                        canary = %canary.qualified_name(),
                        provider = %alert.provider_ref.name,
                        error = %e,
                        "Alert provider lookup failed"
                    );
                    continue;
                }
            };

            let mut endpoint = NotifierEndpoint {
                url: provider.spec.address.clone(),
                token: String::new(),
                proxy: provider.spec.proxy.clone().unwrap_or_default(),
                username: provider
                    .spec
                    .username
                    .clone()
                    .unwrap_or_else(|| "silta".to_string()),
                channel: provider
                    .spec
                    .channel
                    .clone()
                    .unwrap_or_else(|| "general".to_string()),
            };

            // The secret may override the address and add a bearer token
            if let Some(secret_ref) = &provider.spec.secret_ref {
                match self
                    .client
                    .get_secret(&provider_namespace, &secret_ref.name)
                    .await
                {
                    Ok(secret) => {
                        match secret.get("address") {
                            Some(address) => {
                                endpoint.url = String::from_utf8_lossy(address).into_owned();
                            }
                            None => {
                                error!(
                                    canary = %canary.qualified_name(),
                                    provider = %alert.provider_ref.name,
                                    "Alert provider secret does not contain an address"
                                );
                                continue;
                            }
                        }
                        if let Some(token) = secret.get("token") {
                            endpoint.token = String::from_utf8_lossy(token).into_owned();
                        }
                    }
                    Err(e) => {
                        error!(
                            canary = %canary.qualified_name(),
                            provider = %alert.provider_ref.name,
                            error = %e,
                            "Alert provider secret lookup failed"
                        );
                        continue;
                    }
                }
            }

            let notifier = match self
                .notifier_factory
                .notifier(&provider.spec.provider_type, endpoint)
            {
                Ok(n) => n,
                Err(e) => {
                    error!(
                        canary = %canary.qualified_name(),
                        provider = %alert.provider_ref.name,
                        error = %e,
                        "Notifier construction failed"
                    );
                    continue;
                }
            };

            self.dispatch_alert(
                notifier,
                canary,
                message,
                fields.clone(),
                severity,
                canary_id.clone(),
            );
        }
    }

    /// Fire-and-forget delivery bounded by the alert permit pool.
    fn dispatch_alert(
        &self,
        notifier: std::sync::Arc<dyn Notifier>,
        canary: &Canary,
        message: &str,
        fields: Vec<AlertField>,
        severity: AlertSeverity,
        canary_id: String,
    ) {
        let permit = match self.alert_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    canary = %canary.qualified_name(),
                    "Alert dropped: dispatch pool saturated"
                );
                return;
            }
        };

        let name = canary.metadata.name.clone().unwrap_or_default();
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let message = message.to_string();
        let qualified = canary.qualified_name();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = notifier
                .post(&name, &namespace, &message, &fields, severity, &canary_id)
                .await
            {
                error!(canary = %qualified, error = %e, "Alert can't be sent");
            }
        });
    }
}

/// Run metadata attached to alerts when requested
fn alert_metadata(canary: &Canary) -> Vec<AlertField> {
    let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
    let analysis = canary.analysis();

    let mut fields = vec![
        AlertField::new(
            "Target",
            format!(
                "{}/{}.{}",
                canary.spec.target_ref.kind, canary.spec.target_ref.name, namespace
            ),
        ),
        AlertField::new(
            "Failed checks threshold",
            canary.analysis_threshold().to_string(),
        ),
        AlertField::new(
            "Progress deadline",
            format!("{}s", canary.progress_deadline_seconds()),
        ),
    ];

    if analysis.step_weight.unwrap_or(0) > 0 {
        fields.push(AlertField::new(
            "Traffic routing",
            format!(
                "Weight step: {} max: {} interval: {}",
                analysis.step_weight.unwrap_or(0),
                analysis.max_weight.unwrap_or(0),
                analysis.interval.as_deref().unwrap_or("60s")
            ),
        ));
    } else if let Some(steps) = analysis.step_weights.as_ref().filter(|s| !s.is_empty()) {
        let steps = steps
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(",");
        fields.push(AlertField::new(
            "Traffic routing",
            format!(
                "Weight steps: {} max: {}",
                steps,
                analysis.max_weight.unwrap_or(0)
            ),
        ));
    } else if !analysis.match_conditions.is_empty() {
        fields.push(AlertField::new("Traffic routing", "A/B Testing"));
    } else if analysis.iterations.unwrap_or(0) > 0 {
        fields.push(AlertField::new("Traffic routing", "Blue/Green"));
    }

    fields
}
