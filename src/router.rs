//! Traffic router seams
//!
//! Two router families cooperate on every canary:
//! - the [`ServiceRouter`] owns the generated cluster services (apex,
//!   primary, canary) and the apex pod selector;
//! - a [`MeshRouter`] translates "primary weight N, canary weight M,
//!   mirrored" into provider-specific route objects.
//!
//! The scheduler never builds route objects itself; it picks a mesh router
//! from the table using the canary's provider string and drives it through
//! this interface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::canary::APP_MESH_PROVIDER_PREFIX;
use crate::crd::Canary;

/// Routing state reported by a mesh router
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Routes {
    pub primary_weight: i32,
    pub canary_weight: i32,
    pub mirrored: bool,
}

/// Errors surfaced by routers
#[derive(Debug, Error)]
pub enum RouterError {
    /// Route object conflicted with a concurrent writer; safe to retry
    #[error("route conflict: {0}")]
    Conflict(String),

    /// Route installation or update failed
    #[error("{0}")]
    Failed(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Router for the generated cluster services
#[async_trait]
pub trait ServiceRouter: Send + Sync {
    /// Create the apex/primary/canary services for the target
    async fn initialize(&self, canary: &Canary) -> Result<(), RouterError>;

    /// Point the apex service selector at the primary workload
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError>;
}

/// Router for provider-specific traffic splitting
#[async_trait]
pub trait MeshRouter: Send + Sync {
    /// Idempotently install the provider route objects
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError>;

    /// Apply a weight split; `mirrored` duplicates requests to the canary
    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<(), RouterError>;

    /// Read back the currently applied split
    async fn get_routes(&self, canary: &Canary) -> Result<Routes, RouterError>;
}

/// Family root of a provider string: "appmesh:v1beta2" -> "appmesh"
pub fn provider_family(provider: &str) -> &str {
    provider.split(':').next().unwrap_or(provider)
}

/// App-mesh providers need their mesh objects reconciled before the primary
/// workload exists, otherwise pods start without the sidecar proxy.
pub fn is_app_mesh(provider: &str) -> bool {
    provider.starts_with(APP_MESH_PROVIDER_PREFIX)
}

/// Explicit provider-to-router dispatch table
#[derive(Clone)]
pub struct RouterTable {
    service: Arc<dyn ServiceRouter>,
    meshes: HashMap<String, Arc<dyn MeshRouter>>,
}

impl RouterTable {
    pub fn new(service: Arc<dyn ServiceRouter>) -> Self {
        Self {
            service,
            meshes: HashMap::new(),
        }
    }

    /// Register a mesh router under a provider family name
    pub fn with_mesh(mut self, family: impl Into<String>, router: Arc<dyn MeshRouter>) -> Self {
        self.meshes.insert(family.into(), router);
        self
    }

    pub fn service_router(&self) -> Arc<dyn ServiceRouter> {
        self.service.clone()
    }

    /// Mesh router for a provider string, matching on the family root
    pub fn mesh_router(&self, provider: &str) -> Option<Arc<dyn MeshRouter>> {
        self.meshes
            .get(provider)
            .or_else(|| self.meshes.get(provider_family(provider)))
            .cloned()
    }
}
