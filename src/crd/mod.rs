//! Custom resource definitions for SILTA
//!
//! Three resources under the `silta.io` group:
//! - [`Canary`](canary::Canary) - the declarative description of a guarded rollout
//! - [`MetricTemplate`](metric_template::MetricTemplate) - a provider-typed metric query
//! - [`AlertProvider`](alert_provider::AlertProvider) - an alert delivery endpoint

pub mod alert_provider;
pub mod canary;
pub mod status;

pub mod metric_template;

pub use alert_provider::{AlertProvider, AlertProviderSpec};
pub use canary::{
    AlertSeverity, Canary, CanaryAlert, CanaryAnalysis, CanaryMetric, CanaryService, CanarySpec,
    CanaryWebhook, CrossNamespaceRef, HookType, HttpMatchRequest, SessionAffinity, StringMatch,
    TargetReference, ThresholdRange,
};
pub use metric_template::{MetricTemplate, MetricTemplateProvider, MetricTemplateSpec};
pub use status::{CanaryPhase, CanaryStatus, DetailedCondition, ManualState};

use std::time::Duration;

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Interval, timeout and history-window fields on the custom resources are
/// duration strings; this is the one parser for all of them.
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 24h = 1440m)
/// - "2h" → 2 hours (max 1 week = 168h)
///
/// # Validation Rules
/// - Zero duration is rejected (minimum 1s)
/// - Seconds limited to 24h (86400s) - use hours for longer durations
/// - Minutes limited to 24h (1440m) - use hours for longer durations
/// - Hours limited to 1 week (168h) - prevents typos like "999999h"
///
/// # Returns
/// Some(Duration) if parse successful and within limits, None if invalid or out of range
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();

    if duration_str.is_empty() {
        return None;
    }

    // Get the last character (unit)
    let unit = duration_str.chars().last()?;

    // Get the numeric part
    let number_str = &duration_str[..duration_str.len() - 1];
    let number: u64 = number_str.parse().ok()?;

    // Reject zero duration
    if number == 0 {
        return None;
    }

    // Validate and convert based on unit
    match unit {
        's' => {
            // Seconds: max 24h (86400s)
            if number <= 86400 {
                Some(Duration::from_secs(number))
            } else {
                None // Reject: use hours for durations > 24h
            }
        }
        'm' => {
            // Minutes: max 24h (1440m)
            if number <= 1440 {
                number.checked_mul(60).map(Duration::from_secs)
            } else {
                None // Reject: use hours for durations > 24h
            }
        }
        'h' => {
            // Hours: max 1 week (168h)
            if number <= 168 {
                number.checked_mul(3600).map(Duration::from_secs)
            } else {
                None // Reject: likely a typo (e.g., "8760h" = 1 year)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("0s"), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("tens"), None);
        assert_eq!(parse_duration("999999h"), None);
    }

    #[test]
    fn test_parse_duration_trims_whitespace() {
        assert_eq!(parse_duration(" 45s "), Some(Duration::from_secs(45)));
    }
}
