//! Data model and client interface for the service registry
//!
//! The registry (an external control plane) owns the desired state: which
//! services exist, what they run, and where their load balancers are
//! reachable. This module defines the records exchanged with it, the
//! [`Registry`] trait every consumer depends on, and the change events the
//! registry pushes at us.
//!
//! The registry connection is an explicitly constructed object handed to
//! the scheduler and reconciler at construction time; nothing in this crate
//! reaches for a process-wide singleton.

mod http;

pub use http::HttpRegistry;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::Result;

/// A service as declared in the registry.
///
/// Owned and mutated by registry clients other than this controller; we
/// only observe it. The environment is an ordered map so generated
/// manifests come out byte-identical for identical records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    /// Container image reference
    pub image: String,
    /// Launch arguments for the container
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Environment variables, unique keys
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Desired workload replica count
    pub replicas: i32,
    /// Optional image pull-credentials blob (dockerconfigjson payload)
    #[serde(default)]
    pub pull_secrets: Option<String>,
}

impl ServiceRecord {
    /// Pull credentials, treating an empty blob the same as an absent one
    pub fn pull_secrets(&self) -> Option<&str> {
        self.pull_secrets.as_deref().filter(|blob| !blob.is_empty())
    }
}

/// Stable (namespace, name) identity of a service.
///
/// All generated resource names derive deterministically from this pair,
/// which is what lets a later reconcile pass recognize resources it
/// created earlier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    /// Registry namespace the service lives in
    pub namespace: String,
    /// Service name, unique within its namespace
    pub name: String,
}

impl NamespacedName {
    /// Build an identity from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A (host, port) network address.
///
/// Endpoints are always derived from live pods or delivered by the
/// registry; this controller never stores them authoritatively.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Build an endpoint from host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resource descriptor carried by configuration-changed events
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource type; only `"service"` triggers reconciliation
    #[serde(rename = "type")]
    pub kind: String,
    /// Registry namespace of the changed resource
    pub namespace: String,
    /// Name of the changed resource
    pub name: String,
}

/// Change events pushed by the registry.
///
/// `StorageChanged` means the registry's own endpoint set moved (it carries
/// the full current list, not a delta). `ConfigurationChanged` means a
/// declared resource was added, updated or removed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// The registry's endpoint set changed
    StorageChanged {
        /// Current full registry endpoint list
        endpoints: Vec<Endpoint>,
    },
    /// A declared resource changed
    ConfigurationChanged {
        /// Identity of the changed resource
        resource: ResourceRef,
    },
}

/// Client interface to the registry/control plane.
///
/// Subscriptions are broadcast receivers: dropping the receiver is the
/// unregister, and the transport pushes events from its own task so a slow
/// consumer can never stall delivery to the rest.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    /// Whether the registry is currently able to answer queries
    async fn ready(&self) -> bool;

    /// All namespaces known to the registry
    async fn get_namespaces(&self) -> Result<Vec<String>>;

    /// Names of the services declared in one namespace
    async fn get_services_in_namespace(&self, namespace: &str) -> Result<Vec<String>>;

    /// Full record for one service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord>;

    /// Replace the stored load-balancer endpoint set for one service
    async fn set_service_lb_endpoints(
        &self,
        namespace: &str,
        name: &str,
        endpoints: &[Endpoint],
    ) -> Result<()>;

    /// Subscribe to registry change events
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}
