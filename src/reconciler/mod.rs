//! Desired-state reconciliation
//!
//! [`ClusterReconciler`] converges the cluster to the registry's desired
//! service set: one workload deployment, one load-balancer deployment,
//! and optionally one pull-secret per service, all in a single control
//! namespace. The [`Reconciler`] trait is the seam the scheduler consumes,
//! so tests can substitute a mock backend.

mod pods;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::broadcast::LoadBalancerConnector;
use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::registry::{Endpoint, NamespacedName, Registry};
use crate::resources::{
    build_load_balancer_deployment, build_pull_secret, build_workload_deployment,
    identity_from_labels, load_balancer_name, pull_secret_name, service_resource_selector,
    workload_name,
};
use crate::Result;

/// Reconciliation operations consumed by the scheduler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Converge one namespace's cluster resources to the registry's
    /// desired service set
    async fn reconcile_namespace(&self, namespace: &str) -> Result<()>;

    /// Push a storage endpoint set to every load-balancer pod.
    ///
    /// Best-effort: failures are logged, never escalated, and corrected
    /// by the next registry notification or periodic pass.
    async fn propagate_storage_endpoints(&self, endpoints: &[Endpoint]);

    /// Watch pods and re-derive endpoints until cancelled.
    ///
    /// Returns `Ok` only on cancellation; an `Err` is fatal to the
    /// whole process.
    async fn monitor_cluster(&self, cancel: CancellationToken) -> Result<()>;
}

/// Production reconciler working against a real cluster and registry
pub struct ClusterReconciler {
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<dyn Registry>,
    connector: Arc<dyn LoadBalancerConnector>,
    control_namespace: String,
    load_balancer_image: String,
    http_port: u16,
    lb_control_port: u16,
}

impl ClusterReconciler {
    /// Build a reconciler over the given cluster, registry and connector
    /// handles; namespace, image and ports come from `config`
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<dyn Registry>,
        connector: Arc<dyn LoadBalancerConnector>,
        config: &Config,
    ) -> Self {
        Self {
            cluster,
            registry,
            connector,
            control_namespace: config.control_namespace.clone(),
            load_balancer_image: config.load_balancer_image.clone(),
            http_port: config.http_port,
            lb_control_port: config.lb_control_port,
        }
    }

    /// Verify cluster access and make sure the control namespace exists.
    ///
    /// Failure here is fatal at startup.
    pub async fn check_and_setup(&self) -> Result<()> {
        self.cluster.ensure_namespace(&self.control_namespace).await
    }

    /// Create or update one service's resources, in dependency order:
    /// pull-secret first (when the record carries credentials), then the
    /// workload deployment, then its load balancer. A failed step logs and
    /// abandons this service until the next pass.
    async fn apply_service(&self, id: &NamespacedName, pre_existing: bool) {
        let record = match self.registry.get_service(&id.namespace, &id.name).await {
            Ok(record) => record,
            Err(error) => {
                warn!(service = %id, %error, "skipping service, record fetch failed");
                return;
            }
        };

        if let Some(credentials) = record.pull_secrets() {
            let secret = build_pull_secret(id, &self.control_namespace, credentials);
            let result = if pre_existing {
                self.cluster.update_secret(&secret).await
            } else {
                self.cluster.create_secret(&secret).await
            };
            if let Err(error) = result {
                warn!(service = %id, pre_existing, %error, "could not apply pull-secret");
                return;
            }
        }

        let workload =
            build_workload_deployment(id, &record, &self.control_namespace, self.http_port);
        if let Err(error) = self.apply_deployment(&workload, pre_existing).await {
            warn!(service = %id, pre_existing, %error, "could not apply workload deployment");
            return;
        }

        let load_balancer = build_load_balancer_deployment(
            id,
            &self.control_namespace,
            &self.load_balancer_image,
            self.http_port,
            self.lb_control_port,
        );
        if let Err(error) = self.apply_deployment(&load_balancer, pre_existing).await {
            warn!(service = %id, pre_existing, %error, "could not apply load-balancer deployment");
        }
    }

    async fn apply_deployment(&self, deployment: &Deployment, pre_existing: bool) -> Result<()> {
        if pre_existing {
            self.cluster.update_deployment(deployment).await
        } else {
            self.cluster.create_deployment(deployment).await
        }
    }

    /// Delete an orphan's workload deployment, its load balancer, and,
    /// best-effort, its pull-secret.
    async fn delete_orphan(&self, listed_name: &str, deployment: &Deployment) {
        // ownership is recovered from labels, never re-derived from the
        // generated name
        let Some(id) = identity_from_labels(deployment.metadata.labels.as_ref()) else {
            warn!(
                deployment = %listed_name,
                "orphan is missing ownership labels, leaving it in place"
            );
            return;
        };

        if let Err(error) = self.cluster.delete_deployment(listed_name).await {
            warn!(service = %id, deployment = %listed_name, %error, "could not delete orphan workload");
        }
        if let Err(error) = self.cluster.delete_deployment(&load_balancer_name(&id)).await {
            warn!(service = %id, %error, "could not delete orphan load balancer");
        }
        // absence of the pull-secret is the common case, not worth a log line
        let _ = self.cluster.delete_secret(&pull_secret_name(&id)).await;
    }
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    #[instrument(skip(self), fields(namespace = %namespace))]
    async fn reconcile_namespace(&self, namespace: &str) -> Result<()> {
        // both registry and cluster listings are fail-fast: without them we
        // cannot know what exists, and guessing risks deleting live resources
        let desired = self.registry.get_services_in_namespace(namespace).await?;
        let listed = self
            .cluster
            .list_deployments(&service_resource_selector(namespace))
            .await?;

        let mut existing: HashMap<String, Deployment> = HashMap::new();
        for deployment in listed {
            if let Some(name) = deployment.metadata.name.clone() {
                existing.insert(name, deployment);
            }
        }
        let mut seen: HashMap<String, bool> =
            existing.keys().map(|name| (name.clone(), false)).collect();

        for name in &desired {
            let id = NamespacedName::new(namespace, name);
            let workload = workload_name(&id);
            let pre_existing = seen.contains_key(&workload);
            seen.insert(workload, true);

            // one service's failure never blocks its siblings
            self.apply_service(&id, pre_existing).await;
        }

        for (name, handled) in &seen {
            if *handled {
                continue;
            }
            if let Some(deployment) = existing.get(name) {
                self.delete_orphan(name, deployment).await;
            }
        }

        Ok(())
    }

    async fn propagate_storage_endpoints(&self, endpoints: &[Endpoint]) {
        self.propagate_storage(endpoints).await;
    }

    async fn monitor_cluster(&self, cancel: CancellationToken) -> Result<()> {
        self.run_monitor(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::MockLoadBalancerConnector;
    use crate::cluster::MockClusterClient;
    use crate::registry::{MockRegistry, ServiceRecord};
    use mockall::predicate::eq;

    fn record() -> ServiceRecord {
        ServiceRecord {
            image: "registry.example.com/team-a/checkout:1.4".to_string(),
            replicas: 2,
            ..Default::default()
        }
    }

    fn reconciler(cluster: MockClusterClient, registry: MockRegistry) -> ClusterReconciler {
        ClusterReconciler::new(
            Arc::new(cluster),
            Arc::new(registry),
            Arc::new(MockLoadBalancerConnector::new()),
            &Config::for_testing(),
        )
    }

    fn workload_for(namespace: &str, name: &str) -> Deployment {
        build_workload_deployment(
            &NamespacedName::new(namespace, name),
            &record(),
            "gantry-services",
            8080,
        )
    }

    // =========================================================================
    // Story: Idempotence
    // =========================================================================

    #[tokio::test]
    async fn second_pass_with_unchanged_set_only_updates() {
        let mut registry = MockRegistry::new();
        registry
            .expect_get_services_in_namespace()
            .with(eq("team-a"))
            .times(2)
            .returning(|_| Ok(vec!["checkout".to_string()]));
        registry
            .expect_get_service()
            .with(eq("team-a"), eq("checkout"))
            .times(2)
            .returning(|_, _| Ok(record()));

        let mut cluster = MockClusterClient::new();
        // first pass sees an empty namespace, second pass sees the workload
        cluster
            .expect_list_deployments()
            .times(1)
            .returning(|_| Ok(vec![]));
        cluster
            .expect_list_deployments()
            .times(1)
            .returning(|_| Ok(vec![workload_for("team-a", "checkout")]));
        // creates happen exactly once, updates exactly once, deletes never
        cluster
            .expect_create_deployment()
            .times(2)
            .returning(|_| Ok(()));
        cluster
            .expect_update_deployment()
            .times(2)
            .returning(|_| Ok(()));

        let reconciler = reconciler(cluster, registry);

        reconciler.reconcile_namespace("team-a").await.unwrap();
        reconciler.reconcile_namespace("team-a").await.unwrap();
    }

    // =========================================================================
    // Story: Convergence After Removal
    // =========================================================================

    #[tokio::test]
    async fn removed_service_resources_are_deleted() {
        let mut registry = MockRegistry::new();
        registry
            .expect_get_services_in_namespace()
            .returning(|_| Ok(vec!["checkout".to_string()]));
        registry.expect_get_service().returning(|_, _| Ok(record()));

        let mut cluster = MockClusterClient::new();
        cluster.expect_list_deployments().returning(|_| {
            Ok(vec![
                workload_for("team-a", "checkout"),
                workload_for("team-a", "billing"),
            ])
        });
        // checkout survives as updates
        cluster
            .expect_update_deployment()
            .times(2)
            .returning(|_| Ok(()));
        // billing's workload and load balancer go, secret best-effort
        cluster
            .expect_delete_deployment()
            .with(eq("svc-team-a-billing"))
            .times(1)
            .returning(|_| Ok(()));
        cluster
            .expect_delete_deployment()
            .with(eq("svclb-team-a-billing"))
            .times(1)
            .returning(|_| Ok(()));
        cluster
            .expect_delete_secret()
            .with(eq("svc-team-a-billing-pullsecret"))
            .times(1)
            .returning(|_| Err(crate::error::Error::internal("delete_secret", "not found")));

        let reconciler = reconciler(cluster, registry);
        reconciler.reconcile_namespace("team-a").await.unwrap();
    }

    // =========================================================================
    // Story: Ownership Boundary
    // =========================================================================

    #[tokio::test]
    async fn unlabelled_resources_are_never_touched() {
        let mut registry = MockRegistry::new();
        registry
            .expect_get_services_in_namespace()
            .returning(|_| Ok(vec![]));

        let mut cluster = MockClusterClient::new();
        // listing always goes through the ownership selector
        cluster
            .expect_list_deployments()
            .with(eq("gantry.dev/type=service,gantry.dev/namespace=team-a"))
            .times(1)
            .returning(|_| {
                let mut stripped = workload_for("team-a", "rogue");
                stripped.metadata.labels = None;
                Ok(vec![stripped])
            });
        // no deletes: the orphan has no ownership labels, so it is left alone

        let reconciler = reconciler(cluster, registry);
        reconciler.reconcile_namespace("team-a").await.unwrap();
    }

    // =========================================================================
    // Story: Per-Service Isolation
    // =========================================================================

    #[tokio::test]
    async fn failing_service_does_not_block_siblings() {
        let mut registry = MockRegistry::new();
        registry
            .expect_get_services_in_namespace()
            .returning(|_| Ok(vec!["billing".to_string(), "checkout".to_string()]));
        registry
            .expect_get_service()
            .with(eq("team-a"), eq("billing"))
            .returning(|_, _| Err(crate::error::Error::registry("get_service", "no such record")));
        registry
            .expect_get_service()
            .with(eq("team-a"), eq("checkout"))
            .returning(|_, _| Ok(record()));

        let mut cluster = MockClusterClient::new();
        cluster.expect_list_deployments().returning(|_| Ok(vec![]));
        // only checkout's pair is created
        cluster
            .expect_create_deployment()
            .times(2)
            .returning(|_| Ok(()));

        let reconciler = reconciler(cluster, registry);
        reconciler.reconcile_namespace("team-a").await.unwrap();
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_pass() {
        let mut registry = MockRegistry::new();
        registry
            .expect_get_services_in_namespace()
            .returning(|_| Err(crate::error::Error::registry("get_services", "unavailable")));

        let reconciler = reconciler(MockClusterClient::new(), registry);
        assert!(reconciler.reconcile_namespace("team-a").await.is_err());
    }

    // =========================================================================
    // Story: Pull-Secret Ordering
    // =========================================================================

    #[tokio::test]
    async fn pull_secret_failure_skips_the_service_entirely() {
        let mut with_credentials = record();
        with_credentials.pull_secrets = Some(r#"{"auths":{}}"#.to_string());

        let mut registry = MockRegistry::new();
        registry
            .expect_get_services_in_namespace()
            .returning(|_| Ok(vec!["checkout".to_string()]));
        registry
            .expect_get_service()
            .returning(move |_, _| Ok(with_credentials.clone()));

        let mut cluster = MockClusterClient::new();
        cluster.expect_list_deployments().returning(|_| Ok(vec![]));
        cluster
            .expect_create_secret()
            .times(1)
            .returning(|_| Err(crate::error::Error::internal("create_secret", "denied")));
        // no deployment calls follow the failed secret

        let reconciler = reconciler(cluster, registry);
        reconciler.reconcile_namespace("team-a").await.unwrap();
    }
}
