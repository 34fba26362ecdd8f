//! AlertProvider Custom Resource Definition
//!
//! An AlertProvider names an alert delivery endpoint. Canary alerts reference
//! providers by name; the scheduler resolves the endpoint (secrets may
//! override the address and add a bearer token) and hands it to the injected
//! notifier factory.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::canary::CrossNamespaceRef;

/// AlertProvider describes where alerts for a canary are delivered.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "silta.io",
    version = "v1beta1",
    kind = "AlertProvider",
    namespaced,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AlertProviderSpec {
    /// Transport family (slack, msteams, rocket, webhook, ...)
    #[serde(rename = "type")]
    pub provider_type: String,

    /// Hook address; may be overridden by the secret's `address` key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    /// Optional HTTP(S) proxy for delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Bot username shown by chat transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Channel targeted by chat transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Secret with `address` and/or `token` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<CrossNamespaceRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_minimal_spec() {
        let spec: AlertProviderSpec = serde_json::from_value(serde_json::json!({
            "type": "slack",
            "address": "https://hooks.slack.com/services/x"
        }))
        .unwrap();
        assert_eq!(spec.provider_type, "slack");
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["type"], "slack");
        assert!(v.get("proxy").is_none());
    }
}
