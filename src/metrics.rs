//! Metric provider seam and query rendering
//!
//! Providers execute provider-typed queries; the scheduler renders the query
//! template against the canary's routing model, feeds it through the
//! process-wide rate limiter and maps the sentinel error kinds onto
//! advancement policy (see the analysis module).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::{Canary, MetricTemplateProvider};

/// Builtin metric evaluated by the default observer family
pub const BUILTIN_REQUEST_SUCCESS_RATE: &str = "request-success-rate";

/// Builtin metric evaluated by the default observer family
pub const BUILTIN_REQUEST_DURATION: &str = "request-duration";

/// Whether a metric name resolves through the builtin observer
pub fn is_builtin_metric(name: &str) -> bool {
    name == BUILTIN_REQUEST_SUCCESS_RATE || name == BUILTIN_REQUEST_DURATION
}

/// Sentinel error kinds; each one propagates a distinct advancement policy
#[derive(Debug, Error)]
pub enum MetricError {
    /// Provider asked for the whole analysis to be skipped (promote as success)
    #[error("skipping analysis")]
    SkipAnalysis,

    /// Provider is rate limiting; halt this tick without a failed check
    #[error("too many requests")]
    TooManyRequests,

    /// Query executed but returned no samples; halt without a failed check
    #[error("no values found for query")]
    NoValuesFound,

    /// Change-rate check asked for history the provider does not keep
    #[error("historical window not configured")]
    HistoricalWindowNotConfigured,

    /// Anything else; counts as a failed check
    #[error("metric query failed: {0}")]
    Query(String),
}

/// Provider executing metric queries
#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Run the query for the current time range and return the latest value
    async fn execute_current_query(&self, query: &str) -> Result<f64, MetricError>;

    /// Retrieve the metric value from a historical time window
    async fn get_previous_metric_value(&self, query: &str) -> Result<f64, MetricError>;

    /// Whether the provider API is reachable
    async fn is_online(&self) -> Result<bool, MetricError>;
}

/// Observer family answering the builtin metric names
///
/// Builtin metrics have no user-supplied query; the observer derives the
/// provider-specific query from the routing model. Inline `query` metrics go
/// through `raw_query` after template rendering.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Percentage of non-5xx requests served by the canary workload
    async fn request_success_rate(&self, model: &MetricTemplateModel) -> Result<f64, MetricError>;

    /// P99 request duration of the canary workload, in milliseconds
    async fn request_duration(&self, model: &MetricTemplateModel) -> Result<f64, MetricError>;

    /// Execute a rendered inline query
    async fn raw_query(&self, query: &str) -> Result<f64, MetricError>;

    /// Whether the observer backend is reachable
    async fn is_online(&self) -> Result<bool, MetricError>;
}

/// Materializes providers from metric template declarations
#[async_trait]
pub trait MetricProviderFactory: Send + Sync {
    /// Build a provider from a template's provider block plus credentials
    async fn provider(
        &self,
        metric_interval: &str,
        history_window: &str,
        provider: &MetricTemplateProvider,
        credentials: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Arc<dyn MetricProvider>, MetricError>;

    /// The default observer used by the builtin metric names;
    /// `metrics_server` overrides the controller-wide observer address
    fn builtin_observer(
        &self,
        metrics_server: Option<&str>,
    ) -> Result<Arc<dyn Observer>, MetricError>;
}

/// Model a metric query template is rendered against
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricTemplateModel {
    pub name: String,
    pub namespace: String,
    pub target: String,
    pub service: String,
    pub ingress: String,
    pub route: String,
    pub interval: String,
    pub variables: BTreeMap<String, String>,
}

impl MetricTemplateModel {
    /// Build the model for a canary; service/ingress/route fall back to the
    /// target name when the spec does not name them explicitly.
    pub fn from_canary(
        canary: &Canary,
        interval: &str,
        variables: Option<&BTreeMap<String, String>>,
    ) -> Self {
        let target = canary.spec.target_ref.name.clone();
        let ingress = canary
            .spec
            .ingress_ref
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| target.clone());
        let route = canary
            .spec
            .route_ref
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| target.clone());
        Self {
            name: canary.metadata.name.clone().unwrap_or_default(),
            namespace: canary.metadata.namespace.clone().unwrap_or_default(),
            service: canary.service_name().to_string(),
            ingress,
            route,
            target,
            interval: interval.to_string(),
            variables: variables.cloned().unwrap_or_default(),
        }
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(&self.name),
            "namespace" => Some(&self.namespace),
            "target" => Some(&self.target),
            "service" => Some(&self.service),
            "ingress" => Some(&self.ingress),
            "route" => Some(&self.route),
            "interval" => Some(&self.interval),
            _ => key
                .strip_prefix("variables.")
                .and_then(|v| self.variables.get(v))
                .map(String::as_str),
        }
    }
}

/// Substitute `{{ key }}` placeholders in a query template.
///
/// Unknown keys fail the render; a bad template must halt analysis rather
/// than send a half-substituted query to the provider.
pub fn render_query(template: &str, model: &MetricTemplateModel) -> Result<String, MetricError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            MetricError::Query(format!("unterminated placeholder in query: {template}"))
        })?;
        let key = after[..end].trim();
        let value = model
            .lookup(key)
            .ok_or_else(|| MetricError::Query(format!("unknown template variable: {key}")))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> MetricTemplateModel {
        MetricTemplateModel {
            name: "podinfo".into(),
            namespace: "test".into(),
            target: "podinfo".into(),
            service: "podinfo-svc".into(),
            ingress: "podinfo".into(),
            route: "podinfo".into(),
            interval: "1m".into(),
            variables: BTreeMap::from([("env".to_string(), "prod".to_string())]),
        }
    }

    #[test]
    fn test_render_substitutes_model_fields() {
        let query = render_query(
            r#"sum(rate(http_requests_total{namespace="{{ namespace }}",service="{{ service }}"}[{{ interval }}]))"#,
            &model(),
        )
        .unwrap();
        assert_eq!(
            query,
            r#"sum(rate(http_requests_total{namespace="test",service="podinfo-svc"}[1m]))"#
        );
    }

    #[test]
    fn test_render_substitutes_variables() {
        let query = render_query("up{env=\"{{ variables.env }}\"}", &model()).unwrap();
        assert_eq!(query, "up{env=\"prod\"}");
    }

    #[test]
    fn test_render_accepts_tight_braces() {
        let query = render_query("up{ns=\"{{namespace}}\"}", &model()).unwrap();
        assert_eq!(query, "up{ns=\"test\"}");
    }

    #[test]
    fn test_render_rejects_unknown_key() {
        let err = render_query("up{x=\"{{ nope }}\"}", &model()).unwrap_err();
        assert!(matches!(err, MetricError::Query(_)));
    }

    #[test]
    fn test_render_rejects_unterminated_placeholder() {
        let err = render_query("up{x=\"{{ namespace \"}", &model()).unwrap_err();
        assert!(matches!(err, MetricError::Query(_)));
    }

    #[test]
    fn test_builtin_names() {
        assert!(is_builtin_metric("request-success-rate"));
        assert!(is_builtin_metric("request-duration"));
        assert!(!is_builtin_metric("error-rate"));
    }
}
