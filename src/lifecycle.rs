//! Environment lifecycle coordinator
//!
//! Creates and tears down the compute workload and network endpoint of each
//! environment, and registers its route with the [`RoutingTable`].
//!
//! Creation is a short saga: a failed endpoint create compensates by deleting
//! the workload created just before it. Route registration is an overlay; if
//! it fails the environment stays up and the caller gets
//! [`Error::RouteRegistrationFailed`]. Deletion is best-effort and never
//! stops at the first failure.
//!
//! Distinct identities may normalise to one resource handle, so both paths
//! consult the identity labels on the handle first: create refuses a handle
//! that is already held, and delete leaves another identity's resources alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::environment::{Environment, EnvironmentDescriptor, EnvironmentId, EnvironmentStatus};
use crate::error::DeleteFailure;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::routing::RoutingTable;
use crate::store::{
    EndpointSpec, HandleOwner, ResourceKind, ResourceStore, WorkloadSpec, DEFAULT_CONTAINER_PORT,
    DEFAULT_ENDPOINT_PORT,
};
use crate::waiter::ReadinessWaiter;
use crate::Error;

/// Ports used when templating environment resources
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Port the environment container listens on
    pub container_port: u16,
    /// Port exposed by the environment endpoint
    pub endpoint_port: u16,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            container_port: DEFAULT_CONTAINER_PORT,
            endpoint_port: DEFAULT_ENDPOINT_PORT,
        }
    }
}

/// Orchestrates environment create/delete over the store and routing table
pub struct EnvironmentCoordinator {
    store: Arc<dyn ResourceStore>,
    routing: Arc<RoutingTable>,
    waiter: ReadinessWaiter,
    config: LifecycleConfig,
    environments: DashMap<EnvironmentId, Environment>,
    locks: DashMap<EnvironmentId, Arc<Mutex<()>>>,
    proxy_address: OnceCell<String>,
    shutdown: CancellationToken,
}

impl EnvironmentCoordinator {
    /// Create a coordinator. Call [`EnvironmentCoordinator::start`] before serving.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        routing: Arc<RoutingTable>,
        waiter: ReadinessWaiter,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            routing,
            waiter,
            config,
            environments: DashMap::new(),
            locks: DashMap::new(),
            proxy_address: OnceCell::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// The routing table this coordinator registers routes with
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Token cancelled on shutdown; every address wait derives from it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight address waits
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// A tracked environment, if known
    pub fn environment(&self, id: &EnvironmentId) -> Option<Environment> {
        self.environments.get(id).map(|e| e.value().clone())
    }

    /// All tracked environments, ordered by identity
    pub fn environments(&self) -> Vec<Environment> {
        let mut all: Vec<Environment> = self
            .environments
            .iter()
            .map(|e| e.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Rebuild state from the cluster and provision the routing resource.
    ///
    /// Lists existing environments, resolves each endpoint address without
    /// waiting, and seeds the routing resource with the resulting routes.
    /// Provisioning is retried per `retry`. Returns the number of environments
    /// found.
    #[instrument(skip(self, retry))]
    pub async fn start(&self, retry: &RetryConfig) -> Result<usize, Error> {
        let records = retry_with_backoff(retry, "list_environments", || {
            self.store.list_environments()
        })
        .await?;

        let mut routes = BTreeMap::new();
        for record in &records {
            let name = record.id.resource_name();
            let address = match self.store.endpoint_address(&name).await {
                Ok(address) => address,
                Err(e) => {
                    warn!(
                        environment = %record.id,
                        error = %e,
                        "could not resolve endpoint during startup"
                    );
                    None
                }
            };

            if let Some(address) = &address {
                routes.insert(record.id.route_key(), address.clone());
            }

            let status = if address.is_some() {
                EnvironmentStatus::Ready
            } else {
                EnvironmentStatus::Pending
            };
            self.environments.insert(
                record.id.clone(),
                Environment {
                    id: record.id.clone(),
                    image: record.image.clone(),
                    replicas: record.replicas,
                    status,
                    backend_address: address,
                },
            );
        }

        retry_with_backoff(retry, "provision_routing_resource", || {
            self.routing.provision(routes.clone())
        })
        .await?;

        info!(
            environments = records.len(),
            routes = routes.len(),
            "startup reconciliation complete"
        );
        Ok(records.len())
    }

    /// Create an environment's workload and endpoint, then route to it.
    #[instrument(skip(self, descriptor), fields(environment = %descriptor.id))]
    pub async fn create_environment(
        &self,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<Environment, Error> {
        let lock = self.identity_lock(&descriptor.id);
        let _guard = lock.lock().await;

        let id = &descriptor.id;
        let name = id.resource_name();

        // A held handle is refused before the registry entry is written.
        let owner = self
            .store
            .handle_owner(&name)
            .await
            .map_err(|e| Error::resource_create_failed(ResourceKind::Compute, &name, &e))?;
        if owner != HandleOwner::Vacant {
            warn!(workload = %name, owner = %owner, "environment handle already held");
            return Err(Error::conflict(&name, &owner));
        }

        self.environments
            .insert(id.clone(), Environment::pending(descriptor));

        let workload = WorkloadSpec::for_environment(descriptor, self.config.container_port);
        if let Err(e) = self.store.create_workload(&workload).await {
            error!(error = %e, "failed to create compute workload");
            self.set_status(id, EnvironmentStatus::Failed);
            return Err(Error::resource_create_failed(ResourceKind::Compute, &name, &e));
        }
        info!(workload = %name, "compute workload created");

        let endpoint = EndpointSpec::for_environment(
            id,
            self.config.endpoint_port,
            self.config.container_port,
        );
        if let Err(e) = self.store.create_endpoint(&endpoint).await {
            error!(error = %e, "failed to create network endpoint, removing workload");
            match self.store.delete_workload(&name).await {
                Ok(()) => info!(workload = %name, "compensated: compute workload removed"),
                Err(ce) if ce.is_not_found() => {}
                Err(ce) => warn!(
                    workload = %name,
                    error = %ce,
                    "compensating delete failed, workload may be orphaned"
                ),
            }
            self.set_status(id, EnvironmentStatus::Failed);
            return Err(Error::resource_create_failed(ResourceKind::Network, &name, &e));
        }
        info!(endpoint = %name, "network endpoint created");

        // Workload and endpoint exist: the environment is usable from here on.
        self.set_status(id, EnvironmentStatus::Ready);

        let key = id.route_key();
        let address = match self.register_route(&name, &key).await {
            Ok(address) => address,
            Err(e) => {
                warn!(
                    route = %key,
                    error = %e,
                    "route registration failed, environment left running"
                );
                return Err(Error::RouteRegistrationFailed {
                    key,
                    source: Box::new(e),
                });
            }
        };

        let environment = {
            let mut entry = self
                .environments
                .entry(id.clone())
                .or_insert_with(|| Environment::pending(descriptor));
            entry.status = EnvironmentStatus::Ready;
            entry.backend_address = Some(address);
            entry.clone()
        };
        info!(route = %key, "environment ready");
        Ok(environment)
    }

    async fn register_route(&self, name: &str, key: &str) -> Result<String, Error> {
        let cancel = self.shutdown.child_token();
        let address = self.waiter.wait_for_address(name, &cancel).await?;
        self.routing.add_route(key, &address).await?;
        Ok(address)
    }

    /// Remove an environment's route, endpoint, and workload.
    ///
    /// Every step runs even if an earlier one fails; failures are reported
    /// together as [`Error::PartialDeleteFailure`]. Resources that are already
    /// gone count as deleted, so repeating the call succeeds.
    #[instrument(skip(self, id), fields(environment = %id))]
    pub async fn delete_environment(&self, id: &EnvironmentId) -> Result<(), Error> {
        let lock = self.identity_lock(id);
        let result = {
            let _guard = lock.lock().await;
            self.delete_locked(id).await
        };

        if result.is_ok() {
            drop(lock);
            self.release_identity_lock(id);
        }
        result
    }

    async fn delete_locked(&self, id: &EnvironmentId) -> Result<(), Error> {
        let name = id.resource_name();
        self.set_status(id, EnvironmentStatus::Deleting);
        let mut failures = Vec::new();

        // Stop routing before the backend starts disappearing.
        if let Err(e) = self.routing.remove_route(&id.route_key()).await {
            failures.push(DeleteFailure {
                kind: ResourceKind::Routing,
                message: e.to_string(),
            });
        }

        match self.store.handle_owner(&name).await {
            Ok(owner) if owner.permits(id) => {
                self.delete_resources(&name, &mut failures).await;
            }
            Ok(owner) => {
                // The handle belongs to another identity: ours is already gone.
                info!(
                    workload = %name,
                    owner = %owner,
                    "handle held elsewhere, resources left alone"
                );
            }
            Err(e) => {
                for kind in [ResourceKind::Network, ResourceKind::Compute] {
                    failures.push(DeleteFailure {
                        kind,
                        message: format!("could not verify ownership: {e}"),
                    });
                }
            }
        }

        if failures.is_empty() {
            self.environments.remove(id);
            info!("environment deleted");
            return Ok(());
        }

        for failure in &failures {
            error!(kind = %failure.kind, error = %failure.message, "failed to delete sub-resource");
        }
        self.set_status(id, EnvironmentStatus::Failed);
        Err(Error::PartialDeleteFailure { name, failures })
    }

    async fn delete_resources(&self, name: &str, failures: &mut Vec<DeleteFailure>) {
        match self.store.delete_endpoint(name).await {
            Ok(()) => info!(endpoint = %name, "network endpoint deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => failures.push(DeleteFailure {
                kind: ResourceKind::Network,
                message: e.to_string(),
            }),
        }

        match self.store.delete_workload(name).await {
            Ok(()) => info!(workload = %name, "compute workload deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => failures.push(DeleteFailure {
                kind: ResourceKind::Compute,
                message: e.to_string(),
            }),
        }
    }

    /// Externally reachable address of the shared proxy.
    ///
    /// Waits for the proxy endpoint once; later calls return the cached value.
    pub async fn proxy_address(&self) -> Result<String, Error> {
        self.proxy_address
            .get_or_try_init(|| async {
                let cancel = self.shutdown.child_token();
                self.waiter
                    .wait_for_address(self.routing.resource_name(), &cancel)
                    .await
            })
            .await
            .cloned()
    }

    fn identity_lock(&self, id: &EnvironmentId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the identity's lock once nobody else holds or awaits it
    fn release_identity_lock(&self, id: &EnvironmentId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn set_status(&self, id: &EnvironmentId, status: EnvironmentStatus) {
        if let Some(mut entry) = self.environments.get_mut(id) {
            entry.status = status;
        }
    }
}
