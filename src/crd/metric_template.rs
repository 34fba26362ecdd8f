//! MetricTemplate Custom Resource Definition
//!
//! A MetricTemplate binds a provider endpoint to a query template. Canary
//! metrics reference templates by name (optionally across namespaces) and the
//! scheduler renders the query against the canary's routing model before
//! handing it to the provider.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::canary::CrossNamespaceRef;

/// MetricTemplate describes a provider-typed metric query.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "silta.io",
    version = "v1beta1",
    kind = "MetricTemplate",
    namespaced,
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.provider.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetricTemplateSpec {
    /// Provider executing the query
    pub provider: MetricTemplateProvider,

    /// Query template; `{{ name }}`, `{{ namespace }}`, `{{ target }}`,
    /// `{{ service }}`, `{{ ingress }}`, `{{ route }}`, `{{ interval }}` and
    /// `{{ variables.<key> }}` are substituted before execution
    pub query: String,
}

/// Provider endpoint of a metric template
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricTemplateProvider {
    /// Provider family (prometheus, datadog, ...)
    #[serde(rename = "type")]
    pub provider_type: String,

    /// API address; providers fall back to their well-known default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    /// Secret holding provider credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<CrossNamespaceRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_wire_name() {
        let spec: MetricTemplateSpec = serde_json::from_value(serde_json::json!({
            "provider": {"type": "prometheus", "address": "http://prometheus:9090"},
            "query": "sum(rate(http_requests_total{namespace=\"{{ namespace }}\"}[{{ interval }}]))"
        }))
        .unwrap();
        assert_eq!(spec.provider.provider_type, "prometheus");
        assert!(spec.provider.secret_ref.is_none());
    }
}
