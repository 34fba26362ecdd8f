//! Typed platform access for the scheduler
//!
//! The scheduler reads canaries, metric templates, alert providers and
//! secrets, and writes canary status and finalizers. Everything goes through
//! the [`CanaryClient`] trait so the advance loop can run against an
//! in-memory cluster in tests; [`KubeCanaryClient`] is the production
//! implementation.
//!
//! Status writes are optimistic: the object is re-read and replaced under
//! its resource version, with a bounded retry on conflict.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::debug;

use crate::crd::{AlertProvider, Canary, MetricTemplate};

const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF_MS: u64 = 100;

/// Errors surfaced by platform access
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("object missing metadata: {0}")]
    MissingMetadata(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClientError {
    /// Whether the underlying API answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

/// Platform operations required by the scheduler
#[async_trait]
pub trait CanaryClient: Send + Sync {
    async fn get_canary(&self, namespace: &str, name: &str) -> Result<Canary, ClientError>;

    /// Persist `canary.status` under optimistic concurrency; returns the
    /// stored object
    async fn update_status(&self, canary: &Canary) -> Result<Canary, ClientError>;

    async fn add_finalizer(&self, canary: &Canary, token: &str) -> Result<(), ClientError>;

    async fn remove_finalizer(&self, canary: &Canary, token: &str) -> Result<(), ClientError>;

    async fn get_metric_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MetricTemplate, ClientError>;

    async fn get_alert_provider(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AlertProvider, ClientError>;

    /// Decoded data of a secret
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClientError>;
}

/// Production implementation backed by a kube client
#[derive(Clone)]
pub struct KubeCanaryClient {
    client: Client,
}

impl KubeCanaryClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn canaries(&self, namespace: &str) -> Api<Canary> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn keys(canary: &Canary) -> Result<(String, String), ClientError> {
        let namespace = canary
            .metadata
            .namespace
            .clone()
            .ok_or(ClientError::MissingMetadata("namespace"))?;
        let name = canary
            .metadata
            .name
            .clone()
            .ok_or(ClientError::MissingMetadata("name"))?;
        Ok((namespace, name))
    }
}

#[async_trait]
impl CanaryClient for KubeCanaryClient {
    async fn get_canary(&self, namespace: &str, name: &str) -> Result<Canary, ClientError> {
        Ok(self.canaries(namespace).get(name).await?)
    }

    async fn update_status(&self, canary: &Canary) -> Result<Canary, ClientError> {
        let (namespace, name) = Self::keys(canary)?;
        let api = self.canaries(&namespace);

        let mut attempt = 0;
        loop {
            attempt += 1;
            // Re-read to pick up the current resource version, then replace
            // the status subresource under it.
            let mut latest = api.get(&name).await?;
            latest.status = canary.status.clone();
            let payload = serde_json::to_vec(&latest)?;

            match api
                .replace_status(&name, &PostParams::default(), payload)
                .await
            {
                Ok(stored) => return Ok(stored),
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt <= CONFLICT_RETRIES => {
                    debug!(
                        canary = %format!("{}.{}", name, namespace),
                        attempt,
                        "Status update conflicted, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        CONFLICT_BACKOFF_MS * u64::from(attempt),
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn add_finalizer(&self, canary: &Canary, token: &str) -> Result<(), ClientError> {
        let (namespace, name) = Self::keys(canary)?;
        let api = self.canaries(&namespace);

        let latest = api.get(&name).await?;
        let mut finalizers = latest.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == token) {
            return Ok(());
        }
        finalizers.push(token.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, canary: &Canary, token: &str) -> Result<(), ClientError> {
        let (namespace, name) = Self::keys(canary)?;
        let api = self.canaries(&namespace);

        let latest = api.get(&name).await?;
        let Some(mut finalizers) = latest.metadata.finalizers else {
            return Ok(());
        };
        if !finalizers.iter().any(|f| f == token) {
            return Ok(());
        }
        finalizers.retain(|f| f != token);

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_metric_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MetricTemplate, ClientError> {
        let api: Api<MetricTemplate> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_alert_provider(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AlertProvider, ClientError> {
        let api: Api<AlertProvider> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClientError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}
