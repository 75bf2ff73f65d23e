//! Generated cluster resources
//!
//! Everything this controller creates in the cluster is derived here:
//! deterministic names from a [`NamespacedName`], the three ownership
//! labels, the selectors built from them, and the builders for the
//! workload deployment, its load-balancer deployment, and the pull-secret.
//!
//! Determinism matters: a later reconcile pass recognizes resources it
//! created earlier purely by recomputing these names and selectors.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;

use crate::registry::{NamespacedName, ServiceRecord};
use crate::{LABEL_NAME, LABEL_NAMESPACE, LABEL_TYPE, TYPE_LOAD_BALANCER, TYPE_SERVICE};

/// Container name used for the service's own workload
pub const APP_CONTAINER: &str = "app-container";

/// Container name used for the load-balancer replicas
pub const LB_CONTAINER: &str = "lb-container";

/// Port name for serving traffic, on both workload and load-balancer pods
pub const HTTP_PORT_NAME: &str = "http-port";

/// Port name for the load balancer's control API
pub const CONTROL_PORT_NAME: &str = "control-port";

/// Load balancers always run a fixed pair of replicas
const LB_REPLICAS: i32 = 2;

/// Name of the workload deployment for a service
pub fn workload_name(id: &NamespacedName) -> String {
    format!("svc-{}-{}", id.namespace, id.name)
}

/// Name of the load-balancer deployment paired with a service
pub fn load_balancer_name(id: &NamespacedName) -> String {
    format!("svclb-{}-{}", id.namespace, id.name)
}

/// Name of the image pull-secret for a service
pub fn pull_secret_name(id: &NamespacedName) -> String {
    format!("svc-{}-{}-pullsecret", id.namespace, id.name)
}

/// The three ownership labels stamped on every generated resource
pub fn ownership_labels(id: &NamespacedName, type_label: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAMESPACE.to_string(), id.namespace.clone()),
        (LABEL_TYPE.to_string(), type_label.to_string()),
        (LABEL_NAME.to_string(), id.name.clone()),
    ])
}

/// Selector matching every resource this controller generated for a
/// registry namespace
pub fn service_resource_selector(namespace: &str) -> String {
    format!("{LABEL_TYPE}={TYPE_SERVICE},{LABEL_NAMESPACE}={namespace}")
}

/// Selector matching the pods of one service's workload or load balancer
pub fn pod_selector(id: &NamespacedName, type_label: &str) -> String {
    format!(
        "{LABEL_TYPE}={type_label},{LABEL_NAMESPACE}={},{LABEL_NAME}={}",
        id.namespace, id.name
    )
}

/// Selector matching every load-balancer pod we manage, across namespaces
pub fn load_balancer_pod_selector() -> String {
    format!("{LABEL_TYPE}={TYPE_LOAD_BALANCER}")
}

/// Selector for the pod watch: presence of the name label marks a pod
/// as one of ours
pub fn pod_watch_selector() -> String {
    LABEL_NAME.to_string()
}

/// Recover the owning service identity from a resource's labels.
///
/// Returns `None` when either ownership label is missing, which callers
/// treat as "not ours, leave it alone".
pub fn identity_from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<NamespacedName> {
    let labels = labels?;
    Some(NamespacedName::new(
        labels.get(LABEL_NAMESPACE)?,
        labels.get(LABEL_NAME)?,
    ))
}

/// Build the deployment running a service's own containers.
///
/// Replicas, image, arguments, and environment all come from the registry
/// record; the pull-secret reference is added only when the record carries
/// credentials.
pub fn build_workload_deployment(
    id: &NamespacedName,
    record: &ServiceRecord,
    namespace: &str,
    http_port: u16,
) -> Deployment {
    let labels = ownership_labels(id, TYPE_SERVICE);
    let env: Vec<EnvVar> = record
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name(id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(record.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: APP_CONTAINER.to_string(),
                        image: Some(record.image.clone()),
                        args: (!record.arguments.is_empty()).then(|| record.arguments.clone()),
                        env: (!env.is_empty()).then_some(env),
                        ports: Some(vec![ContainerPort {
                            name: Some(HTTP_PORT_NAME.to_string()),
                            container_port: i32::from(http_port),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    image_pull_secrets: record.pull_secrets().map(|_| {
                        vec![LocalObjectReference {
                            name: pull_secret_name(id),
                        }]
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the load-balancer deployment paired with a service.
///
/// The load balancer learns its own ports through the `PORT` and
/// `HTTP_PORT` environment variables.
pub fn build_load_balancer_deployment(
    id: &NamespacedName,
    namespace: &str,
    image: &str,
    http_port: u16,
    control_port: u16,
) -> Deployment {
    let labels = ownership_labels(id, TYPE_LOAD_BALANCER);

    Deployment {
        metadata: ObjectMeta {
            name: Some(load_balancer_name(id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(LB_REPLICAS),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: LB_CONTAINER.to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some(HTTP_PORT_NAME.to_string()),
                                container_port: i32::from(http_port),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some(CONTROL_PORT_NAME.to_string()),
                                container_port: i32::from(control_port),
                                ..Default::default()
                            },
                        ]),
                        env: Some(vec![
                            EnvVar {
                                name: "PORT".to_string(),
                                value: Some(control_port.to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "HTTP_PORT".to_string(),
                                value: Some(http_port.to_string()),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the docker-config pull-secret for a service's credentials blob
pub fn build_pull_secret(id: &NamespacedName, namespace: &str, credentials: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(pull_secret_name(id)),
            namespace: Some(namespace.to_string()),
            labels: Some(ownership_labels(id, TYPE_SERVICE)),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(credentials.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}
