//! SILTA - progressive delivery canary scheduler for Kubernetes
//!
//! SILTA drives a guarded workload through a canary release: it detects new
//! revisions, shifts live traffic between the stable *primary* and the
//! *canary* copy according to the declared strategy (progressive weights,
//! blue/green, A/B, mirroring), gates every move on external webhooks and
//! metric analysis, and either promotes the canary template onto the primary
//! or rolls back.
//!
//! This crate is the scheduler core. Everything that touches a concrete
//! cluster surface is a trait seam injected at construction:
//!
//! - [`workload::WorkloadController`] creates/promotes/scales the workload copies
//! - [`router::MeshRouter`] / [`router::ServiceRouter`] install routes and shift weights
//! - [`metrics::MetricProvider`] executes provider-typed metric queries
//! - [`notifier::Notifier`] delivers alerts
//!
//! The embedding binary builds the collaborator tables for its providers and
//! calls [`controller::Controller::run`] with a worker count and a
//! [`shutdown::ShutdownSignal`].

pub mod client;
pub mod controller;
pub mod crd;
pub mod hash;
pub mod metrics;
pub mod notifier;
pub mod router;
pub mod shutdown;
pub mod telemetry;
pub mod workload;

pub use controller::{Controller, ControllerConfig};
