//! Kubernetes cluster access
//!
//! [`ClusterClient`] is the seam between the reconciler and the apiserver:
//! a narrow trait covering exactly the resource operations this controller
//! performs, mockable in tests. [`ClusterClientImpl`] is the production
//! implementation wrapping a [`kube::Client`], with all writes scoped to
//! the single control namespace.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::ready;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::ObjectMeta;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::runtime::WatchStreamExt;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::error::Error;
use crate::resources::pod_watch_selector;
use crate::{Result, FIELD_MANAGER};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// A pod change delivered by the watch
#[derive(Clone, Debug)]
pub enum PodEvent {
    /// Pod created or modified; watch restarts replay the current set
    /// through this variant as well
    Apply(Pod),
    /// Pod deleted
    Delete(Pod),
}

/// Cluster operations used by the reconciler
///
/// Everything is scoped to the control namespace the implementation was
/// built with; callers pass label selectors, not namespaces.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Ensure a namespace exists, creating it if it doesn't
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// List deployments matching a label selector
    async fn list_deployments(&self, selector: &str) -> Result<Vec<Deployment>>;

    /// Create a deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Update a deployment in place via server-side apply
    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Delete a deployment by name
    async fn delete_deployment(&self, name: &str) -> Result<()>;

    /// Create a secret
    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    /// Update a secret in place via server-side apply
    async fn update_secret(&self, secret: &Secret) -> Result<()>;

    /// Delete a secret by name
    async fn delete_secret(&self, name: &str) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    /// Open a watch over every pod carrying our name label.
    ///
    /// The stream reconnects internally with backoff and never ends on
    /// transient apiserver failures; individual errors are surfaced as
    /// `Err` items.
    fn pod_event_stream(&self) -> BoxStream<'static, Result<PodEvent>>;
}

/// Production client bound to one control namespace
pub struct ClusterClientImpl {
    client: Client,
    namespace: String,
}

impl ClusterClientImpl {
    /// Wrap a kube client, scoping all namespaced operations to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterClient for ClusterClientImpl {
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());

        match api.get(name).await {
            Ok(_) => {
                debug!(namespace = %name, "namespace already exists");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns).await?;
        info!(namespace = %name, "created namespace");
        Ok(())
    }

    async fn list_deployments(&self, selector: &str) -> Result<Vec<Deployment>> {
        let list = self
            .deployments()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.deployments()
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("update_deployment", "deployment has no name"))?;
        self.deployments()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(deployment),
            )
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.deployments()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        self.secrets().create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn update_secret(&self, secret: &Secret) -> Result<()> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("update_secret", "secret has no name"))?;
        self.secrets()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(secret),
            )
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.secrets().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    fn pod_event_stream(&self) -> BoxStream<'static, Result<PodEvent>> {
        let config = watcher::Config::default().labels(&pod_watch_selector());
        watcher(self.pods(), config)
            .default_backoff()
            .filter_map(|event| {
                ready(match event {
                    Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                        Some(Ok(PodEvent::Apply(pod)))
                    }
                    Ok(Event::Delete(pod)) => Some(Ok(PodEvent::Delete(pod))),
                    // watch restart markers, nothing to do per pod
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => Some(Err(e.into())),
                })
            })
            .boxed()
    }
}

/// Create a kube client, preferring an explicit kubeconfig over the
/// inferred in-cluster or environment config
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal("create_client", format!("failed to read kubeconfig: {e}"))
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal("create_client", format!("failed to load kubeconfig: {e}"))
                })?
        }
        None => kube::Config::infer().await.map_err(|e| {
            Error::internal("create_client", format!("failed to infer config: {e}"))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::internal("create_client", format!("failed to create client: {e}")))
}
