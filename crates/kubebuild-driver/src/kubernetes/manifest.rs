//! Builder deployment manifest and status derivation

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ExecAction, Node as KubeNode, Pod, PodSpec, PodTemplateSpec, Probe, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use kubebuild_common::kube_utils::pod_phase;
use kubebuild_common::BUILDER_LABEL_KEY;

use crate::driver::{DriverStatus, Node, Platform};

/// Name of the buildkitd container in builder pods
pub const BUILDKITD_CONTAINER: &str = "buildkitd";

const LABEL_OS: &str = "kubernetes.io/os";
const LABEL_ARCH: &str = "kubernetes.io/arch";

/// Labels identifying the pods of builder `name`
pub fn builder_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(BUILDER_LABEL_KEY.to_string(), name.to_string())])
}

/// Deployment running `replicas` buildkitd pods for builder `name`
pub fn builder_deployment(name: &str, namespace: &str, image: &str, replicas: i32) -> Deployment {
    let labels = builder_labels(name);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
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
                        name: BUILDKITD_CONTAINER.to_string(),
                        image: Some(image.to_string()),
                        readiness_probe: Some(Probe {
                            exec: Some(ExecAction {
                                command: Some(vec![
                                    "buildctl".to_string(),
                                    "debug".to_string(),
                                    "workers".to_string(),
                                ]),
                            }),
                            ..Default::default()
                        }),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
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

/// Derive the driver status from the builder deployment, if it exists.
pub fn derive_status(deployment: Option<&Deployment>) -> DriverStatus {
    let Some(deployment) = deployment else {
        return DriverStatus::Inactive;
    };
    if deployment.metadata.deletion_timestamp.is_some() {
        return DriverStatus::Stopping;
    }

    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    if ready >= 1 {
        DriverStatus::Running
    } else if desired == 0 {
        DriverStatus::Stopped
    } else {
        DriverStatus::Starting
    }
}

/// Platform of a cluster node from its well-known labels
pub fn node_platform(node: &KubeNode) -> Option<Platform> {
    let labels = node.metadata.labels.as_ref()?;
    Some(Platform {
        os: labels.get(LABEL_OS)?.clone(),
        architecture: labels.get(LABEL_ARCH)?.clone(),
        variant: None,
    })
}

/// Describe a builder pod as a build endpoint.
///
/// Platforms come from the cluster node hosting the pod, when known.
pub fn endpoint_from_pod(pod: &Pod, nodes: &[KubeNode]) -> Node {
    let host = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    let platforms = host
        .and_then(|host| {
            nodes
                .iter()
                .find(|n| n.metadata.name.as_deref() == Some(host))
        })
        .and_then(node_platform)
        .into_iter()
        .collect();

    Node {
        name: pod.metadata.name.clone().unwrap_or_default(),
        status: pod_phase(pod).to_lowercase(),
        platforms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn deployment(desired: i32, ready: Option<i32>) -> Deployment {
        let mut d = builder_deployment("buildkit", "builds", "moby/buildkit", desired);
        d.status = Some(DeploymentStatus {
            ready_replicas: ready,
            ..Default::default()
        });
        d
    }

    #[test]
    fn no_deployment_is_inactive() {
        assert_eq!(derive_status(None), DriverStatus::Inactive);
    }

    #[test]
    fn ready_replicas_mean_running() {
        assert_eq!(
            derive_status(Some(&deployment(1, Some(1)))),
            DriverStatus::Running
        );
        assert_eq!(
            derive_status(Some(&deployment(3, Some(1)))),
            DriverStatus::Running
        );
    }

    #[test]
    fn unready_deployment_is_starting() {
        assert_eq!(
            derive_status(Some(&deployment(2, None))),
            DriverStatus::Starting
        );
        assert_eq!(
            derive_status(Some(&deployment(2, Some(0)))),
            DriverStatus::Starting
        );
    }

    #[test]
    fn scaled_to_zero_is_stopped() {
        assert_eq!(
            derive_status(Some(&deployment(0, None))),
            DriverStatus::Stopped
        );
    }

    #[test]
    fn deleting_deployment_is_stopping() {
        let mut d = deployment(1, Some(1));
        d.metadata.deletion_timestamp = Some(Time(Default::default()));
        assert_eq!(derive_status(Some(&d)), DriverStatus::Stopping);
    }

    #[test]
    fn deployment_selects_its_own_pods() {
        let d = builder_deployment("buildkit", "builds", "moby/buildkit:v0.16", 2);
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.selector.match_labels, Some(builder_labels("buildkit")));
        assert_eq!(
            spec.template.metadata.unwrap().labels,
            Some(builder_labels("buildkit"))
        );
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, BUILDKITD_CONTAINER);
        assert_eq!(container.image.as_deref(), Some("moby/buildkit:v0.16"));
    }

    #[test]
    fn endpoint_platform_comes_from_hosting_node() {
        let node = KubeNode {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_OS.to_string(), "linux".to_string()),
                    (LABEL_ARCH.to_string(), "arm64".to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("buildkit-abc".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let endpoint = endpoint_from_pod(&pod, &[node]);
        assert_eq!(endpoint.name, "buildkit-abc");
        assert_eq!(endpoint.status, "unknown");
        assert_eq!(endpoint.platforms[0].to_string(), "linux/arm64");

        assert!(endpoint_from_pod(&pod, &[]).platforms.is_empty());
    }
}
