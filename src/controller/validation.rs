//! Canary spec validation
//!
//! Validates runtime constraints that cannot be enforced via CRD schema.
//! A canary failing validation never enters `Progressing`; the problems are
//! surfaced as a `Valid: False` condition with categorized errors.

use crate::crd::canary::KNATIVE_PROVIDER;
use crate::crd::Canary;

/// Validate a Canary spec
///
/// # Validation Rules
/// - Cross-namespace references to metric templates and alert providers are
///   rejected when the controller forbids them
/// - Knative Service targets require the knative provider, and vice versa
/// - Session affinity cookie names for primary and canary must differ
///
/// # Returns
/// * `Ok(())` - Validation passed
/// * `Err(errors)` - One message per blocking problem
pub fn verify_canary(canary: &Canary, no_cross_namespace_refs: bool) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let namespace = canary.metadata.namespace.as_deref().unwrap_or_default();
    let analysis = canary.analysis();

    if no_cross_namespace_refs {
        for metric in &analysis.metrics {
            if let Some(template_ref) = &metric.template_ref {
                if let Some(ref_namespace) = template_ref.namespace.as_deref() {
                    if !ref_namespace.is_empty() && ref_namespace != namespace {
                        errors.push(format!(
                            "can't access metric template {}.{}, cross-namespace references are blocked",
                            template_ref.name, ref_namespace
                        ));
                    }
                }
            }
        }
        for alert in &analysis.alerts {
            if let Some(ref_namespace) = alert.provider_ref.namespace.as_deref() {
                if !ref_namespace.is_empty() && ref_namespace != namespace {
                    errors.push(format!(
                        "can't access alert provider {}.{}, cross-namespace references are blocked",
                        alert.provider_ref.name, ref_namespace
                    ));
                }
            }
        }
    }

    let provider_is_knative = canary.spec.provider.as_deref() == Some(KNATIVE_PROVIDER);
    if canary.spec.target_ref.is_knative_service() != provider_is_knative {
        if canary.spec.target_ref.is_knative_service() {
            errors.push(format!(
                "can't use {} provider with Knative Service as target",
                canary.spec.provider.as_deref().unwrap_or_default()
            ));
        } else {
            errors.push(format!(
                "can't use {}/{} as target if provider is set to knative",
                canary
                    .spec
                    .target_ref
                    .api_version
                    .as_deref()
                    .unwrap_or_default(),
                canary.spec.target_ref.kind
            ));
        }
    }

    if let Some(affinity) = &analysis.session_affinity {
        if affinity.primary_cookie_name.as_deref() == Some(affinity.cookie_name.as_str()) {
            errors.push(
                "can't use the same cookie name for both primary and canary; \
                 please update them to be different"
                    .to_string(),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
