//! Kubernetes object templates for environment and proxy resources

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::environment::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_HIVE};
use crate::render::{ProxyConfig, PROXY_CONFIG_KEY};

use super::{EndpointSpec, WorkloadSpec};

/// Name of the container inside every environment pod
pub const ENVIRONMENT_CONTAINER_NAME: &str = "code-server";

/// Mount path of the per-environment scratch volume
pub const WORKSPACE_MOUNT_PATH: &str = "/home/coder/project";

/// Name of the nginx container in the proxy pod
pub const PROXY_CONTAINER_NAME: &str = "nginx";

/// Where nginx reads its main configuration file
pub const PROXY_CONFIG_PATH: &str = "/etc/nginx/nginx.conf";

/// Pod-template annotation carrying the digest of the mounted proxy config
pub const CONFIG_DIGEST_ANNOTATION: &str = "hive.dev/config-digest";

const WORKSPACE_VOLUME: &str = "workspace";
const PROXY_CONFIG_VOLUME: &str = "proxy-config";

/// Labels for the shared proxy objects
pub fn proxy_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), name.to_string()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_HIVE.to_string(),
        ),
    ])
}

fn proxy_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

/// Selector matching only the pods of one environment
fn environment_selector(spec_labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    spec_labels
        .iter()
        .filter(|(k, _)| k.as_str() != LABEL_MANAGED_BY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Deployment running one environment's image
pub fn environment_deployment(spec: &WorkloadSpec) -> Deployment {
    let labels = spec.id.labels();
    let selector = environment_selector(&labels);

    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: ENVIRONMENT_CONTAINER_NAME.to_string(),
                        image: Some(spec.image.clone()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: spec.container_port as i32,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: WORKSPACE_VOLUME.to_string(),
                            mount_path: WORKSPACE_MOUNT_PATH.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: WORKSPACE_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service in front of one environment's pods
pub fn environment_service(spec: &EndpointSpec) -> Service {
    let labels = spec.id.labels();
    let selector = environment_selector(&labels);

    Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: spec.port as i32,
                target_port: Some(IntOrString::Int(spec.target_port as i32)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ConfigMap holding the rendered proxy configuration
pub fn proxy_config_map(name: &str, config: &ProxyConfig) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(proxy_labels(name)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            PROXY_CONFIG_KEY.to_string(),
            config.as_str().to_string(),
        )])),
        ..Default::default()
    }
}

/// nginx Deployment mounting the proxy ConfigMap.
///
/// `config_digest` lands on the pod template, so a changed config rolls the
/// proxy pods.
pub fn proxy_deployment(
    name: &str,
    image: &str,
    listen_port: u16,
    config_digest: &str,
) -> Deployment {
    let labels = proxy_labels(name);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(proxy_selector(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(digest_annotation(config_digest)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: PROXY_CONTAINER_NAME.to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: listen_port as i32,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: PROXY_CONFIG_VOLUME.to_string(),
                            mount_path: PROXY_CONFIG_PATH.to_string(),
                            sub_path: Some(PROXY_CONFIG_KEY.to_string()),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: PROXY_CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod-template annotations for a given config digest
pub fn digest_annotation(config_digest: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        CONFIG_DIGEST_ANNOTATION.to_string(),
        config_digest.to_string(),
    )])
}

/// Service exposing the proxy, typically a LoadBalancer
pub fn proxy_service(name: &str, service_type: &str, listen_port: u16) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(proxy_labels(name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(proxy_selector(name)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: listen_port as i32,
                target_port: Some(IntOrString::Int(listen_port as i32)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Address a Service can be reached on, if one has been assigned.
///
/// LoadBalancer Services report their first ingress IP or hostname; anything
/// else reports its ClusterIP. Headless Services never have an address.
pub fn endpoint_address_of(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;

    if spec.type_.as_deref() == Some("LoadBalancer") {
        return service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
            .filter(|a| !a.is_empty());
    }

    spec.cluster_ip
        .as_ref()
        .filter(|ip| !ip.is_empty() && ip.as_str() != "None")
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvironmentDescriptor, EnvironmentId, LABEL_APP};
    use crate::store::{DEFAULT_CONTAINER_PORT, DEFAULT_ENDPOINT_PORT};
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn id() -> EnvironmentId {
        EnvironmentId::new("cs101", "hw1", "abc123").unwrap()
    }

    fn workload() -> WorkloadSpec {
        let descriptor = EnvironmentDescriptor::with_replicas(id(), "img:v1", 2).unwrap();
        WorkloadSpec::for_environment(&descriptor, DEFAULT_CONTAINER_PORT)
    }

    #[test]
    fn environment_deployment_runs_the_image() {
        let deployment = environment_deployment(&workload());

        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("hive-cs101-hw1-abc123")
        );
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));

        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, ENVIRONMENT_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("img:v1"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
        assert!(pod.volumes.unwrap()[0].empty_dir.is_some());
    }

    #[test]
    fn selector_matches_pod_labels() {
        let deployment = environment_deployment(&workload());
        let spec = deployment.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();

        for (k, v) in &selector {
            assert_eq!(pod_labels.get(k), Some(v), "pod missing selector label {k}");
        }
        assert_eq!(
            selector.get(LABEL_APP).map(String::as_str),
            Some("hive-environment")
        );
    }

    #[test]
    fn environment_service_targets_container_port() {
        let endpoint =
            EndpointSpec::for_environment(&id(), DEFAULT_ENDPOINT_PORT, DEFAULT_CONTAINER_PORT);
        let service = environment_service(&endpoint);
        let spec = service.spec.unwrap();

        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn proxy_objects_share_the_proxy_name() {
        let config = ProxyConfig::new("events {}\n");
        let cm = proxy_config_map("master-router", &config);
        assert_eq!(
            cm.data.unwrap().get(PROXY_CONFIG_KEY).map(String::as_str),
            Some("events {}\n")
        );

        let deployment = proxy_deployment("master-router", "nginx:latest", 80, &config.digest());
        let template = deployment.spec.unwrap().template;
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(
            annotations.get(CONFIG_DIGEST_ANNOTATION),
            Some(&config.digest())
        );

        let pod = template.spec.unwrap();
        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, PROXY_CONFIG_PATH);
        assert_eq!(mount.sub_path.as_deref(), Some(PROXY_CONFIG_KEY));
        assert_eq!(
            pod.volumes.unwrap()[0].config_map.as_ref().unwrap().name,
            "master-router"
        );

        let service = proxy_service("master-router", "LoadBalancer", 80);
        assert_eq!(
            service.spec.unwrap().selector.unwrap().get("app").map(String::as_str),
            Some("master-router")
        );
    }

    fn service(
        type_: &str,
        cluster_ip: Option<&str>,
        ingress: Vec<LoadBalancerIngress>,
    ) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                cluster_ip: cluster_ip.map(str::to_string),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(ingress),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cluster_ip_services_report_their_cluster_ip() {
        let svc = service("ClusterIP", Some("10.0.0.5"), vec![]);
        assert_eq!(endpoint_address_of(&svc), Some("10.0.0.5".to_string()));

        let headless = service("ClusterIP", Some("None"), vec![]);
        assert_eq!(endpoint_address_of(&headless), None);

        let unassigned = service("ClusterIP", None, vec![]);
        assert_eq!(endpoint_address_of(&unassigned), None);
    }

    #[test]
    fn load_balancers_wait_for_ingress() {
        let pending = service("LoadBalancer", Some("10.0.0.9"), vec![]);
        assert_eq!(endpoint_address_of(&pending), None);

        let by_ip = service(
            "LoadBalancer",
            Some("10.0.0.9"),
            vec![LoadBalancerIngress {
                ip: Some("203.0.113.10".to_string()),
                ..Default::default()
            }],
        );
        assert_eq!(endpoint_address_of(&by_ip), Some("203.0.113.10".to_string()));

        let by_hostname = service(
            "LoadBalancer",
            None,
            vec![LoadBalancerIngress {
                hostname: Some("lb.example.com".to_string()),
                ..Default::default()
            }],
        );
        assert_eq!(
            endpoint_address_of(&by_hostname),
            Some("lb.example.com".to_string())
        );
    }
}
