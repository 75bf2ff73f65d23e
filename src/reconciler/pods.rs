//! Pod-driven endpoint reconciliation
//!
//! Endpoints are always derived from live pods at the moment of use.
//! A pod counts only while it is ready, carries an IP, and is not being
//! torn down, so scale-ups, crashes and deletions all converge through
//! the same path.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::LoadBalancerFleet;
use crate::cluster::PodEvent;
use crate::error::Error;
use crate::registry::{Endpoint, NamespacedName};
use crate::resources::{load_balancer_pod_selector, pod_selector};
use crate::{Result, LABEL_NAME, LABEL_NAMESPACE, TYPE_LOAD_BALANCER, TYPE_SERVICE};

use super::ClusterReconciler;

impl ClusterReconciler {
    /// Re-derive one service's endpoints from its live pods: the
    /// load-balancer set is written to the registry, the workload set is
    /// pushed to that service's load balancers.
    #[instrument(
        skip(self, service_name),
        fields(namespace = %namespace, service = %service_name)
    )]
    pub async fn reconcile_pods(&self, namespace: &str, service_name: &str) -> Result<()> {
        let id = NamespacedName::new(namespace, service_name);

        let lb_endpoints = self
            .running_pod_endpoints(&id, TYPE_LOAD_BALANCER, self.lb_control_port)
            .await?;
        self.registry
            .set_service_lb_endpoints(namespace, service_name, &lb_endpoints)
            .await?;

        let workload_endpoints = self
            .running_pod_endpoints(&id, TYPE_SERVICE, self.http_port)
            .await?;

        let (fleet, connect_error) =
            LoadBalancerFleet::connect(self.connector.as_ref(), &lb_endpoints);
        if let Some(error) = connect_error {
            warn!(service = %id, %error, "some load balancers are unreachable");
        }

        debug!(
            service = %id,
            targets = fleet.len(),
            endpoints = workload_endpoints.len(),
            "pushing workload endpoints"
        );
        if let Err(error) = fleet.set_endpoints(&workload_endpoints).await {
            warn!(service = %id, %error, "could not push endpoints to load balancers");
            return Err(error);
        }
        Ok(())
    }

    /// Push the registry's storage endpoint set to every load-balancer pod
    /// in the cluster, whichever service each belongs to.
    #[instrument(skip(self, endpoints), fields(endpoints = endpoints.len()))]
    pub(super) async fn propagate_storage(&self, endpoints: &[Endpoint]) {
        let pods = match self.cluster.list_pods(&load_balancer_pod_selector()).await {
            Ok(pods) => pods,
            Err(error) => {
                warn!(%error, "could not list load-balancer pods");
                return;
            }
        };
        let targets: Vec<Endpoint> = pods
            .iter()
            .filter_map(|pod| pod_endpoint(pod, self.lb_control_port))
            .collect();

        let (fleet, connect_error) = LoadBalancerFleet::connect(self.connector.as_ref(), &targets);
        if let Some(error) = connect_error {
            warn!(%error, "some load balancers are unreachable");
        }

        info!(
            targets = fleet.len(),
            endpoints = endpoints.len(),
            "propagating storage endpoints to load balancers"
        );
        if let Err(error) = fleet.set_storage_endpoints(endpoints).await {
            warn!(%error, "could not propagate storage endpoints");
        }
    }

    /// Consume the pod watch until cancelled. The stream reconnects with
    /// backoff internally, so running dry is a fatal condition.
    pub(super) async fn run_monitor(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = self.cluster.pod_event_stream();
        info!("watching pods");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.next() => event,
            };
            match event {
                Some(Ok(PodEvent::Apply(pod))) | Some(Ok(PodEvent::Delete(pod))) => {
                    self.process_pod(&pod).await;
                }
                Some(Err(error)) => {
                    warn!(%error, "pod watch error");
                }
                None => {
                    return Err(Error::internal("monitor_cluster", "pod event stream ended"));
                }
            }
        }
    }

    /// React to one pod event by re-deriving its service's endpoints.
    /// Pods without both ownership labels are not ours and are ignored.
    async fn process_pod(&self, pod: &Pod) {
        let Some(labels) = pod.metadata.labels.as_ref() else {
            return;
        };
        let Some(service_name) = labels.get(LABEL_NAME) else {
            return;
        };
        let Some(namespace) = labels.get(LABEL_NAMESPACE) else {
            return;
        };

        if let Err(error) = self.reconcile_pods(namespace, service_name).await {
            warn!(
                namespace = %namespace,
                service = %service_name,
                pod = %pod.name_any(),
                %error,
                "error reconciling pods"
            );
        }
    }

    async fn running_pod_endpoints(
        &self,
        id: &NamespacedName,
        type_label: &str,
        port: u16,
    ) -> Result<Vec<Endpoint>> {
        let pods = self.cluster.list_pods(&pod_selector(id, type_label)).await?;
        Ok(pods.iter().filter_map(|pod| pod_endpoint(pod, port)).collect())
    }
}

/// The endpoint a pod contributes, if it should receive traffic at all
fn pod_endpoint(pod: &Pod, port: u16) -> Option<Endpoint> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }
    if !is_pod_ready(pod) {
        return None;
    }
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
    if ip.is_empty() {
        return None;
    }
    Some(Endpoint::new(ip, port))
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{
        LoadBalancerClient, MockLoadBalancerClient, MockLoadBalancerConnector,
    };
    use crate::cluster::MockClusterClient;
    use crate::config::Config;
    use crate::registry::MockRegistry;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn pod(ip: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{ip}")),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn reconciler(
        cluster: MockClusterClient,
        registry: MockRegistry,
        connector: MockLoadBalancerConnector,
    ) -> ClusterReconciler {
        ClusterReconciler::new(
            Arc::new(cluster),
            Arc::new(registry),
            Arc::new(connector),
            &Config::for_testing(),
        )
    }

    // =========================================================================
    // Story: Which Pods Count
    // =========================================================================

    #[test]
    fn unready_pod_is_excluded() {
        assert_eq!(pod_endpoint(&pod("10.9.0.5", false), 8080), None);
    }

    #[test]
    fn terminating_pod_is_excluded() {
        let mut terminating = pod("10.9.0.5", true);
        terminating.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        assert_eq!(pod_endpoint(&terminating, 8080), None);
    }

    #[test]
    fn pod_without_an_ip_is_excluded() {
        let mut no_ip = pod("10.9.0.5", true);
        no_ip.status.as_mut().unwrap().pod_ip = None;
        assert_eq!(pod_endpoint(&no_ip, 8080), None);

        let mut empty_ip = pod("10.9.0.5", true);
        empty_ip.status.as_mut().unwrap().pod_ip = Some(String::new());
        assert_eq!(pod_endpoint(&empty_ip, 8080), None);
    }

    #[test]
    fn ready_pod_contributes_its_ip_at_the_given_port() {
        assert_eq!(
            pod_endpoint(&pod("10.9.0.5", true), 8081),
            Some(Endpoint::new("10.9.0.5", 8081))
        );
    }

    // =========================================================================
    // Story: Endpoint Propagation
    // =========================================================================

    #[tokio::test]
    async fn lb_endpoints_go_to_the_registry_and_workload_endpoints_to_the_lbs() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_pods()
            .withf(|selector| selector.contains("type=loadbalancer"))
            .times(1)
            .returning(|_| Ok(vec![pod("10.9.0.1", true)]));
        cluster
            .expect_list_pods()
            .withf(|selector| selector.contains("type=service"))
            .times(1)
            .returning(|_| Ok(vec![pod("10.9.0.5", true), pod("10.9.0.6", false)]));

        let mut registry = MockRegistry::new();
        registry
            .expect_set_service_lb_endpoints()
            .withf(|namespace, name, endpoints| {
                namespace == "team-a"
                    && name == "checkout"
                    && endpoints == [Endpoint::new("10.9.0.1", 8081)]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut client = MockLoadBalancerClient::new();
        client
            .expect_set_endpoints()
            .withf(|endpoints| endpoints == [Endpoint::new("10.9.0.5", 8080)])
            .times(1)
            .returning(|_| Ok(()));
        let client: Arc<dyn LoadBalancerClient> = Arc::new(client);
        let mut connector = MockLoadBalancerConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(move |_| Ok(client.clone()));

        let reconciler = reconciler(cluster, registry, connector);
        reconciler.reconcile_pods("team-a", "checkout").await.unwrap();
    }

    #[tokio::test]
    async fn registry_write_failure_surfaces() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_pods()
            .times(1)
            .returning(|_| Ok(vec![pod("10.9.0.1", true)]));

        let mut registry = MockRegistry::new();
        registry
            .expect_set_service_lb_endpoints()
            .returning(|_, _, _| Err(Error::registry("set_service_lb_endpoints", "boom")));

        let reconciler = reconciler(cluster, registry, MockLoadBalancerConnector::new());
        assert!(reconciler.reconcile_pods("team-a", "checkout").await.is_err());
    }

    // =========================================================================
    // Story: Foreign Pods
    // =========================================================================

    #[tokio::test]
    async fn pod_without_ownership_labels_is_ignored() {
        // no expectations at all: any call into the mocks panics
        let reconciler = reconciler(
            MockClusterClient::new(),
            MockRegistry::new(),
            MockLoadBalancerConnector::new(),
        );

        let unlabelled = pod("10.9.0.5", true);
        reconciler.process_pod(&unlabelled).await;

        let mut half_labelled = pod("10.9.0.5", true);
        half_labelled.metadata.labels = Some(BTreeMap::from([(
            crate::LABEL_NAME.to_string(),
            "checkout".to_string(),
        )]));
        reconciler.process_pod(&half_labelled).await;
    }

    // =========================================================================
    // Story: Storage Propagation Is Best-Effort
    // =========================================================================

    #[tokio::test]
    async fn storage_propagation_swallows_listing_failures() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_pods()
            .returning(|_| Err(Error::internal("list_pods", "api server down")));

        let reconciler = reconciler(cluster, MockRegistry::new(), MockLoadBalancerConnector::new());
        reconciler
            .propagate_storage(&[Endpoint::new("10.0.0.7", 7770)])
            .await;
    }

    #[tokio::test]
    async fn storage_endpoints_reach_every_load_balancer_pod() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_pods()
            .withf(|selector| selector == "gantry.dev/type=loadbalancer")
            .times(1)
            .returning(|_| Ok(vec![pod("10.9.0.1", true), pod("10.9.0.2", true)]));

        let storage = [Endpoint::new("10.0.0.7", 7770)];
        let mut connector = MockLoadBalancerConnector::new();
        connector.expect_connect().times(2).returning(move |_| {
            let mut client = MockLoadBalancerClient::new();
            client
                .expect_set_storage_endpoints()
                .withf(|endpoints| endpoints == [Endpoint::new("10.0.0.7", 7770)])
                .times(1)
                .returning(|_| Ok(()));
            let client: Arc<dyn LoadBalancerClient> = Arc::new(client);
            Ok(client)
        });

        let reconciler = reconciler(cluster, MockRegistry::new(), connector);
        reconciler.propagate_storage(&storage).await;
    }
}
