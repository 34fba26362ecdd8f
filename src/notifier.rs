//! Alert notifier seam
//!
//! Transports (chat webhooks, incident tools) live outside this crate; the
//! scheduler formats one flat alert shape and routes it by severity, either
//! through the process-wide notifier or through per-canary alert providers
//! resolved at dispatch time.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::AlertSeverity;

/// Structured key/value detail attached to an alert
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertField {
    pub name: String,
    pub value: String,
}

impl AlertField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Errors surfaced by notifier transports
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("unsupported notifier type: {0}")]
    UnsupportedType(String),

    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Alert delivery transport
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one alert; `canary_id` correlates gate-hook driven runs
    async fn post(
        &self,
        name: &str,
        namespace: &str,
        message: &str,
        fields: &[AlertField],
        severity: AlertSeverity,
        canary_id: &str,
    ) -> Result<(), NotifierError>;
}

/// Endpoint resolved from an AlertProvider and its secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifierEndpoint {
    pub url: String,
    pub token: String,
    pub proxy: String,
    pub username: String,
    pub channel: String,
}

/// Builds transports for AlertProvider types
pub trait NotifierFactory: Send + Sync {
    fn notifier(
        &self,
        provider_type: &str,
        endpoint: NotifierEndpoint,
    ) -> Result<Arc<dyn Notifier>, NotifierError>;
}

/// Whether an alert of `severity` should be delivered to a provider
/// subscribed at `subscribed` severity.
///
/// `info` subscriptions receive everything; `warn` subscriptions also
/// receive errors; otherwise severities must match exactly.
pub fn severity_matches(subscribed: AlertSeverity, severity: AlertSeverity) -> bool {
    if subscribed == AlertSeverity::Info {
        return true;
    }
    if severity == subscribed {
        return true;
    }
    severity == AlertSeverity::Error && subscribed == AlertSeverity::Warn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_subscription_receives_everything() {
        for severity in [
            AlertSeverity::Info,
            AlertSeverity::Warn,
            AlertSeverity::Error,
            AlertSeverity::Success,
        ] {
            assert!(severity_matches(AlertSeverity::Info, severity));
        }
    }

    #[test]
    fn test_warn_subscription_escalates_errors() {
        assert!(severity_matches(AlertSeverity::Warn, AlertSeverity::Warn));
        assert!(severity_matches(AlertSeverity::Warn, AlertSeverity::Error));
        assert!(!severity_matches(AlertSeverity::Warn, AlertSeverity::Info));
        assert!(!severity_matches(AlertSeverity::Warn, AlertSeverity::Success));
    }

    #[test]
    fn test_exact_match_otherwise() {
        assert!(severity_matches(AlertSeverity::Error, AlertSeverity::Error));
        assert!(!severity_matches(AlertSeverity::Error, AlertSeverity::Warn));
        assert!(severity_matches(
            AlertSeverity::Success,
            AlertSeverity::Success
        ));
    }
}
