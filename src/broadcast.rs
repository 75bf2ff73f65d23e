//! Endpoint fan-out to load-balancer replicas
//!
//! Every load-balancer replica exposes a small control API that accepts
//! full replacements of its endpoint sets. [`LoadBalancerFleet`] delivers
//! one instruction to every replica independently: a failing target never
//! blocks the others, and failures are aggregated into a single
//! [`Error::Broadcast`] naming each one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
#[cfg(test)]
use mockall::automock;
use reqwest::Url;

use crate::config::Config;
use crate::error::Error;
use crate::registry::Endpoint;
use crate::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Control API of a single load-balancer replica.
///
/// Both operations are idempotent, last-write-wins replacements of the
/// target's whole endpoint set. Errors name the target they came from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// Replace the target's upstream service endpoint set
    async fn set_endpoints(&self, endpoints: &[Endpoint]) -> Result<()>;

    /// Replace the target's storage endpoint set
    async fn set_storage_endpoints(&self, endpoints: &[Endpoint]) -> Result<()>;
}

/// Factory producing a [`LoadBalancerClient`] per target endpoint
#[cfg_attr(test, automock)]
pub trait LoadBalancerConnector: Send + Sync {
    /// Build a client for one target
    fn connect(&self, target: &Endpoint) -> Result<Arc<dyn LoadBalancerClient>>;
}

/// Connector building JSON-over-HTTP clients that share one pooled
/// `reqwest` client
pub struct HttpLoadBalancerConnector {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpLoadBalancerConnector {
    /// Build a connector using the configured per-request timeout
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::internal("load_balancer_connector", e))?;
        Ok(Self {
            http,
            request_timeout: config.request_timeout(),
        })
    }
}

impl LoadBalancerConnector for HttpLoadBalancerConnector {
    fn connect(&self, target: &Endpoint) -> Result<Arc<dyn LoadBalancerClient>> {
        let base = Url::parse(&format!("http://{target}"))
            .map_err(|e| Error::load_balancer(target.to_string(), e))?;
        Ok(Arc::new(HttpLoadBalancerClient {
            http: self.http.clone(),
            base,
            target: target.to_string(),
            request_timeout: self.request_timeout,
        }))
    }
}

struct HttpLoadBalancerClient {
    http: reqwest::Client,
    base: Url,
    target: String,
    request_timeout: Duration,
}

impl HttpLoadBalancerClient {
    async fn put(&self, path: &str, endpoints: &[Endpoint]) -> Result<()> {
        let url = self
            .base
            .join(path)
            .map_err(|e| Error::load_balancer(self.target.as_str(), e))?;
        self.http
            .put(url)
            .timeout(self.request_timeout)
            .json(&endpoints)
            .send()
            .await
            .map_err(|e| Error::load_balancer(self.target.as_str(), e))?
            .error_for_status()
            .map_err(|e| Error::load_balancer(self.target.as_str(), e))?;
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerClient for HttpLoadBalancerClient {
    async fn set_endpoints(&self, endpoints: &[Endpoint]) -> Result<()> {
        self.put("/api/v1/endpoints", endpoints).await
    }

    async fn set_storage_endpoints(&self, endpoints: &[Endpoint]) -> Result<()> {
        self.put("/api/v1/storage-endpoints", endpoints).await
    }
}

/// The reachable load-balancer replicas for one broadcast
pub struct LoadBalancerFleet {
    targets: Vec<Arc<dyn LoadBalancerClient>>,
}

impl LoadBalancerFleet {
    /// Connect to every target.
    ///
    /// Targets that fail to connect are dropped from the fleet and their
    /// failures returned as a separate aggregate, so a partially reachable
    /// fleet still broadcasts to whoever is left.
    pub fn connect(
        connector: &dyn LoadBalancerConnector,
        endpoints: &[Endpoint],
    ) -> (Self, Option<Error>) {
        let mut targets = Vec::with_capacity(endpoints.len());
        let mut failures = Vec::new();
        for endpoint in endpoints {
            match connector.connect(endpoint) {
                Ok(client) => targets.push(client),
                Err(error) => failures.push(error.to_string()),
            }
        }
        let error = (!failures.is_empty()).then(|| Error::broadcast(failures));
        (Self { targets }, error)
    }

    /// Number of reachable targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no targets are reachable
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Replace the upstream service endpoint set on every target
    pub async fn set_endpoints(&self, endpoints: &[Endpoint]) -> Result<()> {
        let results = join_all(
            self.targets
                .iter()
                .map(|client| client.set_endpoints(endpoints)),
        )
        .await;
        merge_failures(results)
    }

    /// Replace the storage endpoint set on every target
    pub async fn set_storage_endpoints(&self, endpoints: &[Endpoint]) -> Result<()> {
        let results = join_all(
            self.targets
                .iter()
                .map(|client| client.set_storage_endpoints(endpoints)),
        )
        .await;
        merge_failures(results)
    }
}

fn merge_failures(results: Vec<Result<()>>) -> Result<()> {
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|result| result.err().map(|e| e.to_string()))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::broadcast(failures))
    }
}
