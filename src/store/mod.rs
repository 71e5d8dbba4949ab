//! Cluster resource store abstraction
//!
//! The provisioner never talks to the cluster directly: every create, delete,
//! and lookup goes through [`ResourceStore`]. Production uses
//! [`cluster::KubeResourceStore`]; tests substitute a mock or an in-memory fake.

pub mod cluster;
pub mod resources;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::environment::{EnvironmentDescriptor, EnvironmentId};
use crate::render::ProxyConfig;
use crate::Error;

/// Port the environment container listens on (code-server)
pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// Port exposed by each environment's network endpoint
pub const DEFAULT_ENDPOINT_PORT: u16 = 80;

/// The kinds of cluster resource the provisioner manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Running container(s) of an environment
    Compute,
    /// Resolvable address in front of the compute workload
    Network,
    /// Shared proxy configuration
    Routing,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Compute => "compute",
            Self::Network => "network",
            Self::Routing => "routing",
        };
        f.write_str(s)
    }
}

/// Desired state of an environment's compute workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// Resource handle
    pub name: String,
    /// Owning environment
    pub id: EnvironmentId,
    /// Container image reference
    pub image: String,
    /// Desired replica count
    pub replicas: i32,
    /// Port the container listens on
    pub container_port: u16,
}

impl WorkloadSpec {
    /// Workload for the given environment
    pub fn for_environment(descriptor: &EnvironmentDescriptor, container_port: u16) -> Self {
        Self {
            name: descriptor.id.resource_name(),
            id: descriptor.id.clone(),
            image: descriptor.image.clone(),
            replicas: descriptor.replicas,
            container_port,
        }
    }
}

/// Desired state of an environment's network endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSpec {
    /// Resource handle
    pub name: String,
    /// Owning environment
    pub id: EnvironmentId,
    /// Port exposed by the endpoint
    pub port: u16,
    /// Container port traffic is forwarded to
    pub target_port: u16,
}

impl EndpointSpec {
    /// Endpoint for the given environment
    pub fn for_environment(id: &EnvironmentId, port: u16, target_port: u16) -> Self {
        Self {
            name: id.resource_name(),
            id: id.clone(),
            port,
            target_port,
        }
    }
}

/// An environment rediscovered from the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentRecord {
    /// Identity recovered from resource labels
    pub id: EnvironmentId,
    /// Image the workload runs
    pub image: String,
    /// Replica count of the workload
    pub replicas: i32,
}

/// Who holds an environment handle in the cluster.
///
/// Distinct identities can normalise to the same handle (`a-b/c/d` and
/// `a/b-c/d` both become `hive-a-b-c-d`), so the identity labels on the
/// resources decide ownership, not the name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOwner {
    /// No workload or endpoint carries the handle
    Vacant,
    /// Resources carry the labels of this environment
    Environment(EnvironmentId),
    /// Resources exist but carry no environment identity
    Foreign,
}

impl HandleOwner {
    /// Whether the handle may be created or deleted on behalf of `id`
    pub fn permits(&self, id: &EnvironmentId) -> bool {
        match self {
            Self::Vacant => true,
            Self::Environment(owner) => owner == id,
            Self::Foreign => false,
        }
    }
}

impl fmt::Display for HandleOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vacant => f.write_str("nobody"),
            Self::Environment(id) => write!(f, "environment {id}"),
            Self::Foreign => f.write_str("an unmanaged resource"),
        }
    }
}

/// Create/get/update/delete capability set over cluster resources.
///
/// Deletes and lookups of a missing resource return
/// [`Error::ResourceNotFound`]; callers on delete paths treat that as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create a compute workload, returning its handle
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String, Error>;

    /// Delete a compute workload
    async fn delete_workload(&self, name: &str) -> Result<(), Error>;

    /// Whether a compute workload exists
    async fn workload_exists(&self, name: &str) -> Result<bool, Error>;

    /// Owner recorded in the labels of the workload (or, failing that, the
    /// endpoint) named `name`
    async fn handle_owner(&self, name: &str) -> Result<HandleOwner, Error>;

    /// Create a network endpoint, returning its handle
    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<String, Error>;

    /// Delete a network endpoint
    async fn delete_endpoint(&self, name: &str) -> Result<(), Error>;

    /// Address assigned to a network endpoint, `None` while not ready
    async fn endpoint_address(&self, name: &str) -> Result<Option<String>, Error>;

    /// Create the shared routing resource with an initial config
    async fn create_routing_resource(
        &self,
        name: &str,
        config: &ProxyConfig,
    ) -> Result<String, Error>;

    /// Replace the config held by the routing resource
    async fn update_routing_resource(&self, name: &str, config: &ProxyConfig)
        -> Result<(), Error>;

    /// Delete the shared routing resource
    async fn delete_routing_resource(&self, name: &str) -> Result<(), Error>;

    /// Every environment whose workload currently exists
    async fn list_environments(&self) -> Result<Vec<EnvironmentRecord>, Error>;
}
