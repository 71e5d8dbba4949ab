//! kube-rs backed [`ResourceStore`]
//!
//! Environments map onto a Deployment plus a ClusterIP Service sharing the
//! environment's resource name. The routing resource is a ConfigMap holding
//! the nginx config, mounted by an nginx Deployment behind a Service, all
//! named after the proxy. Proxy objects are written with server-side apply so
//! re-provisioning after a restart converges instead of conflicting.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::resources::{
    endpoint_address_of, environment_deployment, environment_service, proxy_config_map,
    proxy_deployment, proxy_service,
};
use super::{
    EndpointSpec, EnvironmentRecord, HandleOwner, ResourceKind, ResourceStore, WorkloadSpec,
};
use crate::environment::{EnvironmentId, LABEL_APP, LABEL_APP_ENVIRONMENT};
use crate::render::ProxyConfig;
use crate::Error;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "hive-provisioner";

/// Default connection timeout for the kube client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read timeout for the kube client
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path.
///
/// Without a path the config is inferred (in-cluster service account, then
/// `$KUBECONFIG`, then `~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to infer config: {}", e),
            )
        })?,
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to create client: {}", e),
        )
    })
}

/// How the shared proxy is deployed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxySettings {
    /// nginx image reference
    pub image: String,
    /// Service type exposing the proxy (`LoadBalancer`, `NodePort`, ...)
    pub service_type: String,
    /// Port nginx listens on and the Service exposes
    pub listen_port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            image: "nginx:latest".to_string(),
            service_type: "LoadBalancer".to_string(),
            listen_port: 80,
        }
    }
}

/// Production store over one namespace of a Kubernetes cluster
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
    namespace: String,
    proxy: ProxySettings,
}

impl KubeResourceStore {
    /// Store scoped to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>, proxy: ProxySettings) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            proxy,
        }
    }

    /// Namespace every resource is created in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Server-side apply the proxy ConfigMap and Deployment
    async fn apply_proxy_config(&self, name: &str, config: &ProxyConfig) -> Result<(), Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let cm = proxy_config_map(name, config);
        self.config_maps()
            .patch(name, &params, &Patch::Apply(&cm))
            .await?;

        let deployment = proxy_deployment(
            name,
            &self.proxy.image,
            self.proxy.listen_port,
            &config.digest(),
        );
        self.deployments()
            .patch(name, &params, &Patch::Apply(&deployment))
            .await?;
        Ok(())
    }
}

/// Delete by name, mapping 404 to [`Error::ResourceNotFound`]
async fn delete_named<K>(api: &Api<K>, kind: ResourceKind, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::resource_not_found(kind, name)),
        Err(e) => Err(e.into()),
    }
}

/// Ownership from the labels of whichever resource holds a handle
fn owner_of(labels: Option<Option<BTreeMap<String, String>>>) -> HandleOwner {
    match labels {
        None => HandleOwner::Vacant,
        Some(labels) => labels
            .as_ref()
            .and_then(EnvironmentId::from_labels)
            .map_or(HandleOwner::Foreign, HandleOwner::Environment),
    }
}

/// Rebuild an environment record from a labelled Deployment
fn record_of(deployment: &Deployment) -> Option<EnvironmentRecord> {
    let id = EnvironmentId::from_labels(deployment.metadata.labels.as_ref()?)?;
    let spec = deployment.spec.as_ref();
    let image = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);

    Some(EnvironmentRecord {
        id,
        image,
        replicas,
    })
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String, Error> {
        let deployment = environment_deployment(spec);
        self.deployments()
            .create(&PostParams::default(), &deployment)
            .await?;
        debug!(workload = %spec.name, namespace = %self.namespace, "deployment created");
        Ok(spec.name.clone())
    }

    async fn delete_workload(&self, name: &str) -> Result<(), Error> {
        delete_named(&self.deployments(), ResourceKind::Compute, name).await
    }

    async fn workload_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.deployments().get_opt(name).await?.is_some())
    }

    async fn handle_owner(&self, name: &str) -> Result<HandleOwner, Error> {
        let labels = match self.deployments().get_opt(name).await? {
            Some(deployment) => Some(deployment.metadata.labels),
            None => self
                .services()
                .get_opt(name)
                .await?
                .map(|service| service.metadata.labels),
        };
        Ok(owner_of(labels))
    }

    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<String, Error> {
        let service = environment_service(spec);
        self.services()
            .create(&PostParams::default(), &service)
            .await?;
        debug!(endpoint = %spec.name, namespace = %self.namespace, "service created");
        Ok(spec.name.clone())
    }

    async fn delete_endpoint(&self, name: &str) -> Result<(), Error> {
        delete_named(&self.services(), ResourceKind::Network, name).await
    }

    async fn endpoint_address(&self, name: &str) -> Result<Option<String>, Error> {
        match self.services().get_opt(name).await? {
            Some(service) => Ok(endpoint_address_of(&service)),
            None => Err(Error::resource_not_found(ResourceKind::Network, name)),
        }
    }

    async fn create_routing_resource(
        &self,
        name: &str,
        config: &ProxyConfig,
    ) -> Result<String, Error> {
        self.apply_proxy_config(name, config).await?;

        let service = proxy_service(name, &self.proxy.service_type, self.proxy.listen_port);
        self.services()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&service),
            )
            .await?;

        info!(
            proxy = %name,
            namespace = %self.namespace,
            digest = %config.digest(),
            "proxy resources applied"
        );
        Ok(name.to_string())
    }

    async fn update_routing_resource(
        &self,
        name: &str,
        config: &ProxyConfig,
    ) -> Result<(), Error> {
        if self.config_maps().get_opt(name).await?.is_none() {
            return Err(Error::resource_not_found(ResourceKind::Routing, name));
        }
        self.apply_proxy_config(name, config).await?;
        debug!(proxy = %name, digest = %config.digest(), "proxy config updated");
        Ok(())
    }

    async fn delete_routing_resource(&self, name: &str) -> Result<(), Error> {
        let results = [
            delete_named(&self.services(), ResourceKind::Routing, name).await,
            delete_named(&self.deployments(), ResourceKind::Routing, name).await,
            delete_named(&self.config_maps(), ResourceKind::Routing, name).await,
        ];

        let mut missing = 0;
        for result in results {
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => missing += 1,
                Err(e) => return Err(e),
            }
        }

        if missing == 3 {
            return Err(Error::resource_not_found(ResourceKind::Routing, name));
        }
        Ok(())
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentRecord>, Error> {
        let selector = format!("{}={}", LABEL_APP, LABEL_APP_ENVIRONMENT);
        let deployments = self
            .deployments()
            .list(&ListParams::default().labels(&selector))
            .await?;

        let records: Vec<EnvironmentRecord> =
            deployments.items.iter().filter_map(record_of).collect();
        debug!(
            found = deployments.items.len(),
            environments = records.len(),
            "listed environment deployments"
        );
        Ok(records)
    }
}
