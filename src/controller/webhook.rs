//! Hook client: typed payloads POSTed to external gate endpoints
//!
//! Every hook receives the same JSON envelope (snake_case on the wire) with a
//! string-map `metadata` carrying the well-known run fields plus any
//! user-declared metadata. A response status above 202 is a failure whose
//! body is the error text; transport errors and 5xx answers are retried up
//! to the hook's declared retry budget.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::crd::{Canary, CanaryPhase, CanaryWebhook, HookType, ManualState};

/// Default request deadline for gate hooks
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request deadline for event-only hooks
pub const EVENT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire envelope delivered to every hook
#[derive(Serialize, Clone, Debug)]
pub struct CanaryWebhookPayload {
    pub name: String,
    pub namespace: String,
    pub phase: CanaryPhase,
    pub checksum: String,
    pub build_id: String,
    #[serde(rename = "type")]
    pub hook_type: HookType,
    pub failed_checks: i32,
    pub canary_weight: i32,
    pub iterations: i32,
    /// Seconds until the progress deadline expires
    pub remaining_time: i64,
    pub metadata: BTreeMap<String, String>,
}

/// Errors surfaced by hook invocations
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Request could not be delivered after all retries
    #[error("webhook request failed: {0}")]
    Transport(String),

    /// Endpoint answered with a status above 202; the body is the error text
    #[error("{body}")]
    Status { code: u16, body: String },

    #[error("webhook payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Transport seam for hook invocations
///
/// Production uses [`HttpHookClient`]; tests script responses per URL.
#[async_trait]
pub trait HookClient: Send + Sync {
    /// POST the payload; success is HTTP status <= 202, body is returned
    async fn call(
        &self,
        url: &str,
        payload: &CanaryWebhookPayload,
        timeout: Duration,
        retries: i32,
    ) -> Result<Vec<u8>, WebhookError>;
}

/// Production hook client over a shared reqwest connection pool
#[derive(Clone, Default)]
pub struct HttpHookClient {
    client: reqwest::Client,
}

impl HttpHookClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HookClient for HttpHookClient {
    async fn call(
        &self,
        url: &str,
        payload: &CanaryWebhookPayload,
        timeout: Duration,
        retries: i32,
    ) -> Result<Vec<u8>, WebhookError> {
        let body = serde_json::to_vec(payload)?;
        let attempts = retries.max(0) as u32 + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
            }

            let response = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .timeout(timeout)
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let bytes = response
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .unwrap_or_default();

                    if status <= 202 {
                        return Ok(bytes);
                    }

                    let error = WebhookError::Status {
                        code: status,
                        body: String::from_utf8_lossy(&bytes).into_owned(),
                    };
                    // Server-side failures may be transient, client errors are not
                    if status >= 500 && attempt + 1 < attempts {
                        debug!(url, status, attempt, "Webhook failed, retrying");
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
                Err(e) => {
                    debug!(url, attempt, error = %e, "Webhook transport error");
                    last_error = Some(WebhookError::Transport(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| WebhookError::Transport("no attempts made".into())))
    }
}

/// Build the payload for a gate hook invocation
pub fn build_payload(
    canary: &Canary,
    phase: CanaryPhase,
    hook: &CanaryWebhook,
    now: DateTime<Utc>,
) -> CanaryWebhookPayload {
    let status = canary.status_or_default();

    let mut metadata = BTreeMap::from([
        ("timestamp".to_string(), now.timestamp_millis().to_string()),
        ("phase".to_string(), status.phase.as_str().to_string()),
        ("failedChecks".to_string(), status.failed_checks.to_string()),
        ("canaryWeight".to_string(), status.canary_weight.to_string()),
        ("iterations".to_string(), status.iterations.to_string()),
        ("lastBuildId".to_string(), status.last_build_id.clone()),
        (
            "lastAppliedSpec".to_string(),
            status.last_applied_spec.clone(),
        ),
        (
            "lastPromotedSpec".to_string(),
            status.last_promoted_spec.clone(),
        ),
    ]);

    // User metadata augments the payload but never overwrites run fields
    if let Some(user) = &hook.metadata {
        for (key, value) in user {
            metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    CanaryWebhookPayload {
        name: canary.metadata.name.clone().unwrap_or_default(),
        namespace: canary.metadata.namespace.clone().unwrap_or_default(),
        phase,
        checksum: canary.canary_checksum(),
        build_id: status.last_build_id.clone(),
        hook_type: hook.hook_type,
        failed_checks: status.failed_checks,
        canary_weight: status.canary_weight,
        iterations: status.iterations,
        remaining_time: remaining_time_seconds(canary, now),
        metadata,
    }
}

/// Build the payload for an event mirror, with message/type metadata attached
pub fn build_event_payload(
    canary: &Canary,
    hook: &CanaryWebhook,
    message: &str,
    event_type: &str,
    now: DateTime<Utc>,
) -> CanaryWebhookPayload {
    let status = canary.status_or_default();
    let mut payload = build_payload(canary, status.phase, hook, now);
    payload
        .metadata
        .insert("eventMessage".to_string(), message.to_string());
    payload
        .metadata
        .insert("eventType".to_string(), event_type.to_string());
    payload
}

/// Seconds until the progress deadline expires, clamped at zero
fn remaining_time_seconds(canary: &Canary, now: DateTime<Utc>) -> i64 {
    let deadline = canary.progress_deadline_seconds();
    let elapsed = canary
        .status_or_default()
        .last_transition()
        .map(|t| now.signed_duration_since(t).num_seconds())
        .unwrap_or(0);
    (deadline - elapsed).max(0)
}

/// Parse a manual-traffic-control response body
///
/// An empty body or a command without a timestamp means "no manual control"
/// and clears any stored state. Garbage is treated the same, loudly.
pub fn parse_manual_state(body: &[u8]) -> Option<ManualState> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice::<ManualState>(body) {
        Ok(state) if !state.timestamp.is_empty() => Some(state),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "Discarding unparseable manual control response");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CanaryService, CanarySpec, CanaryStatus, TargetReference};

    fn canary() -> Canary {
        let mut canary = Canary::new(
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
                analysis: None,
                skip_analysis: false,
                suspend: false,
                revert_on_deletion: false,
                progress_deadline_seconds: None,
            },
        );
        canary.metadata.namespace = Some("test".into());
        canary.status = Some(CanaryStatus {
            phase: CanaryPhase::Progressing,
            canary_weight: 20,
            failed_checks: 1,
            iterations: 3,
            last_applied_spec: "aaaa".into(),
            last_promoted_spec: "bbbb".into(),
            last_build_id: "build-7".into(),
            ..Default::default()
        });
        canary
    }

    fn hook() -> CanaryWebhook {
        CanaryWebhook {
            hook_type: HookType::ConfirmPromotion,
            name: "gate".into(),
            url: "http://gate/approve".into(),
            timeout: None,
            retries: 0,
            mute_alert: false,
            metadata: Some(BTreeMap::from([
                ("team".to_string(), "platform".to_string()),
                // May not shadow the well-known key
                ("phase".to_string(), "spoofed".to_string()),
            ])),
        }
    }

    #[test]
    fn test_payload_wire_shape() {
        let now = Utc::now();
        let payload = build_payload(&canary(), CanaryPhase::Progressing, &hook(), now);
        let v = serde_json::to_value(&payload).unwrap();

        assert_eq!(v["name"], "podinfo");
        assert_eq!(v["namespace"], "test");
        assert_eq!(v["phase"], "Progressing");
        assert_eq!(v["type"], "confirm-promotion");
        assert_eq!(v["failed_checks"], 1);
        assert_eq!(v["canary_weight"], 20);
        assert_eq!(v["iterations"], 3);
        assert_eq!(v["build_id"], "build-7");
        assert!(v["remaining_time"].is_i64());
        assert!(v["checksum"].is_string());

        let metadata = v["metadata"].as_object().unwrap();
        assert_eq!(metadata["phase"], "Progressing");
        assert_eq!(metadata["failedChecks"], "1");
        assert_eq!(metadata["canaryWeight"], "20");
        assert_eq!(metadata["iterations"], "3");
        assert_eq!(metadata["lastBuildId"], "build-7");
        assert_eq!(metadata["lastAppliedSpec"], "aaaa");
        assert_eq!(metadata["lastPromotedSpec"], "bbbb");
        // User metadata is merged but never overwrites well-known keys
        assert_eq!(metadata["team"], "platform");
        assert!(metadata.contains_key("timestamp"));
    }

    #[test]
    fn test_event_payload_carries_message() {
        let now = Utc::now();
        let payload = build_event_payload(&canary(), &hook(), "promotion completed", "Normal", now);
        assert_eq!(
            payload.metadata.get("eventMessage").map(String::as_str),
            Some("promotion completed")
        );
        assert_eq!(
            payload.metadata.get("eventType").map(String::as_str),
            Some("Normal")
        );
    }

    #[test]
    fn test_remaining_time_counts_down_from_deadline() {
        let mut canary = canary();
        let now = Utc::now();
        canary.status.as_mut().unwrap().last_transition_time =
            Some((now - chrono::Duration::seconds(100)).to_rfc3339());

        let payload = build_payload(&canary, CanaryPhase::Progressing, &hook(), now);
        assert_eq!(payload.remaining_time, 500);

        // Past the deadline clamps at zero
        canary.status.as_mut().unwrap().last_transition_time =
            Some((now - chrono::Duration::seconds(9000)).to_rfc3339());
        let payload = build_payload(&canary, CanaryPhase::Progressing, &hook(), now);
        assert_eq!(payload.remaining_time, 0);
    }

    #[test]
    fn test_parse_manual_state() {
        let state = parse_manual_state(br#"{"weight": 30, "paused": true, "timestamp": "t1"}"#)
            .expect("valid command");
        assert_eq!(state.weight, Some(30));
        assert!(state.paused);
        assert_eq!(state.timestamp, "t1");

        // Missing weight is a valid pause/resume-only command
        let state = parse_manual_state(br#"{"paused": false, "timestamp": "t2"}"#).unwrap();
        assert_eq!(state.weight, None);

        // Empty body, missing timestamp and garbage all clear manual control
        assert!(parse_manual_state(b"").is_none());
        assert!(parse_manual_state(br#"{"paused": true}"#).is_none());
        assert!(parse_manual_state(b"not json").is_none());
    }
}
