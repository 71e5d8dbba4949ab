//! In-memory [`ResourceStore`] for scenario tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hive::environment::{EnvironmentDescriptor, EnvironmentId};
use hive::lifecycle::{EnvironmentCoordinator, LifecycleConfig};
use hive::render::{ConfigRenderer, ProxyConfig, RenderSettings};
use hive::routing::RoutingTable;
use hive::store::{
    EndpointSpec, EnvironmentRecord, HandleOwner, ResourceKind, ResourceStore, WorkloadSpec,
};
use hive::waiter::{ReadinessWaiter, WaiterConfig};
use hive::Error;

/// Proxy resource name used throughout the scenarios
pub const PROXY: &str = "master-router";

/// Address the fake assigns to the proxy endpoint
pub const PROXY_ADDRESS: &str = "203.0.113.10";

#[derive(Default)]
struct State {
    workloads: BTreeMap<String, WorkloadSpec>,
    endpoints: BTreeMap<String, EndpointSpec>,
    preset_addresses: HashMap<String, String>,
    addresses: HashMap<String, String>,
    routing: BTreeMap<String, ProxyConfig>,
    applies: Vec<ProxyConfig>,
    next_address: usize,
}

/// Cluster stand-in that keeps every resource in memory
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
    fail_endpoint_create: AtomicBool,
    applying: AtomicBool,
    overlapped: AtomicBool,
    proxy_lookups: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Address the endpoint `name` reports once created
    pub fn preset_address(&self, name: &str, address: &str) {
        self.lock()
            .preset_addresses
            .insert(name.to_string(), address.to_string());
    }

    pub fn fail_endpoint_creates(&self, fail: bool) {
        self.fail_endpoint_create.store(fail, Ordering::SeqCst);
    }

    /// Config currently held by the routing resource
    pub fn routing_config(&self, name: &str) -> Option<ProxyConfig> {
        self.lock().routing.get(name).cloned()
    }

    /// Every config written to a routing resource, oldest first
    pub fn applies(&self) -> Vec<ProxyConfig> {
        self.lock().applies.clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// True if two routing writes were ever in flight at once
    pub fn saw_overlapping_applies(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn proxy_lookups(&self) -> usize {
        self.proxy_lookups.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    async fn write_routing(&self, name: &str, config: &ProxyConfig) {
        if self.applying.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        // Give any concurrent writer the chance to interleave.
        tokio::task::yield_now().await;
        {
            let mut state = self.lock();
            state.routing.insert(name.to_string(), config.clone());
            state.applies.push(config.clone());
        }
        self.applying.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String, Error> {
        let mut state = self.lock();
        if state.workloads.contains_key(&spec.name) {
            return Err(Error::internal(format!("deployment {} already exists", spec.name)));
        }
        state.workloads.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn delete_workload(&self, name: &str) -> Result<(), Error> {
        match self.lock().workloads.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::resource_not_found(ResourceKind::Compute, name)),
        }
    }

    async fn workload_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.lock().workloads.contains_key(name))
    }

    async fn handle_owner(&self, name: &str) -> Result<HandleOwner, Error> {
        let state = self.lock();
        let owner = state
            .workloads
            .get(name)
            .map(|w| w.id.clone())
            .or_else(|| state.endpoints.get(name).map(|e| e.id.clone()));
        Ok(owner.map_or(HandleOwner::Vacant, HandleOwner::Environment))
    }

    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<String, Error> {
        if self.fail_endpoint_create.load(Ordering::SeqCst) {
            return Err(Error::internal("service quota exceeded"));
        }
        let mut state = self.lock();
        let address = match state.preset_addresses.get(&spec.name) {
            Some(address) => address.clone(),
            None => {
                state.next_address += 1;
                let n = state.next_address;
                format!("10.0.{}.{}", n / 250, n % 250 + 1)
            }
        };
        state.addresses.insert(spec.name.clone(), address);
        state.endpoints.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn delete_endpoint(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        state.addresses.remove(name);
        match state.endpoints.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::resource_not_found(ResourceKind::Network, name)),
        }
    }

    async fn endpoint_address(&self, name: &str) -> Result<Option<String>, Error> {
        let state = self.lock();
        if state.routing.contains_key(name) {
            self.proxy_lookups.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(PROXY_ADDRESS.to_string()));
        }
        if !state.endpoints.contains_key(name) {
            return Err(Error::resource_not_found(ResourceKind::Network, name));
        }
        Ok(state.addresses.get(name).cloned())
    }

    async fn create_routing_resource(
        &self,
        name: &str,
        config: &ProxyConfig,
    ) -> Result<String, Error> {
        self.write_routing(name, config).await;
        Ok(name.to_string())
    }

    async fn update_routing_resource(
        &self,
        name: &str,
        config: &ProxyConfig,
    ) -> Result<(), Error> {
        if !self.lock().routing.contains_key(name) {
            return Err(Error::resource_not_found(ResourceKind::Routing, name));
        }
        self.write_routing(name, config).await;
        Ok(())
    }

    async fn delete_routing_resource(&self, name: &str) -> Result<(), Error> {
        match self.lock().routing.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::resource_not_found(ResourceKind::Routing, name)),
        }
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentRecord>, Error> {
        Ok(self
            .lock()
            .workloads
            .values()
            .map(|w| EnvironmentRecord {
                id: w.id.clone(),
                image: w.image.clone(),
                replicas: w.replicas,
            })
            .collect())
    }
}

pub fn waiter_config() -> WaiterConfig {
    WaiterConfig {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(200),
    }
}

pub fn routing_table(store: &Arc<FakeStore>) -> Arc<RoutingTable> {
    let store: Arc<dyn ResourceStore> = store.clone();
    let renderer = ConfigRenderer::new(RenderSettings::default()).unwrap();
    Arc::new(RoutingTable::new(store, renderer, PROXY))
}

pub fn coordinator(store: &Arc<FakeStore>) -> EnvironmentCoordinator {
    let dyn_store: Arc<dyn ResourceStore> = store.clone();
    EnvironmentCoordinator::new(
        dyn_store.clone(),
        routing_table(store),
        ReadinessWaiter::new(dyn_store, waiter_config()),
        LifecycleConfig::default(),
    )
}

pub fn descriptor(course: &str, assignment: &str, student: &str) -> EnvironmentDescriptor {
    let id = EnvironmentId::new(course, assignment, student).unwrap();
    EnvironmentDescriptor::new(id, "img:v1").unwrap()
}
