//! Gantry - cluster controller for registry-declared services
//!
//! Gantry keeps a cluster's running workloads in sync with a declarative
//! service registry held by an external control plane. For every service
//! record it manages a workload deployment, a paired load-balancer
//! deployment and (optionally) an image pull-secret, watches the resulting
//! pods, and propagates their live endpoints back to the registry and out
//! to every load-balancer replica.
//!
//! # Modules
//!
//! - [`registry`] - data model and the registry/control-plane client
//! - [`resources`] - generated-resource naming, labels and manifest builders
//! - [`cluster`] - cluster API access (deployments, secrets, pods, watches)
//! - [`reconciler`] - namespace diff/convergence and pod endpoint derivation
//! - [`broadcast`] - fan-out of endpoint updates to load-balancer replicas
//! - [`scheduler`] - event-driven and periodic reconcile triggers
//! - [`api`] - small admin HTTP surface (health, manual reconcile)
//! - [`config`] - process configuration
//! - [`error`] - error types
//! - [`retry`] - backoff helper for reconnect loops

#![deny(missing_docs)]

pub mod api;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod retry;
pub mod scheduler;

pub use config::Config;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Ownership labels
// =============================================================================
// Every resource Gantry generates carries these three labels. They are the
// selector for "resources we own" and the key for mapping a pod event back
// to its originating service, so their values must stay stable across
// releases.

/// Label carrying the registry namespace a resource was generated from
pub const LABEL_NAMESPACE: &str = "gantry.dev/namespace";

/// Label carrying the generated resource's type (`service` | `loadbalancer`)
pub const LABEL_TYPE: &str = "gantry.dev/type";

/// Label carrying the originating service's name
pub const LABEL_NAME: &str = "gantry.dev/name";

/// Type label value for workload deployments and their pods
pub const TYPE_SERVICE: &str = "service";

/// Type label value for load-balancer deployments and their pods
pub const TYPE_LOAD_BALANCER: &str = "loadbalancer";

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "gantry-controller";

/// Resource type in configuration-changed events that triggers reconciliation
pub const RESOURCE_KIND_SERVICE: &str = "service";
