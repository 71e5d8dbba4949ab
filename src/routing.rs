//! Routing table manager
//!
//! [`RoutingTable`] owns the authoritative route-key → backend-address map for
//! one routing resource. The whole sequence of mutating the map, rendering the
//! config, and applying it to the routing resource runs under one async
//! mutex. The routing resource has no optimistic-concurrency guard, so two
//! interleaved applies would otherwise lose an update on the cluster side.
//!
//! Only one `RoutingTable` may own a given routing resource. There is no
//! cross-process coordination.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::render::{ConfigRenderer, ProxyConfig};
use crate::store::ResourceStore;
use crate::Error;

/// Upper bound on route key length
pub const MAX_ROUTE_KEY_LEN: usize = 253;

/// Read-only view of the routing table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    /// Route key → backend address, ordered by key
    pub routes: BTreeMap<String, String>,
    /// Incremented on every change to `routes`
    pub version: u64,
}

/// Check a route key and backend address before they enter the table.
///
/// Keys are `/`-separated segments of `[a-z0-9-]`. Backends are an IP address
/// or a DNS hostname. Anything else could break out of the rendered
/// `location` block.
pub fn validate_route(key: &str, backend: &str) -> Result<(), Error> {
    if key.is_empty() || key.len() > MAX_ROUTE_KEY_LEN {
        return Err(Error::invalid_route(
            key,
            backend,
            format!("key must be 1-{MAX_ROUTE_KEY_LEN} characters"),
        ));
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            return Err(Error::invalid_route(key, backend, "key has an empty segment"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::invalid_route(
                key,
                backend,
                format!("key segment '{segment}' contains invalid characters"),
            ));
        }
    }

    if backend.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if is_hostname(backend) {
        return Ok(());
    }
    Err(Error::invalid_route(
        key,
        backend,
        "backend is neither an IP address nor a hostname",
    ))
}

fn is_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

struct TableState {
    routes: BTreeMap<String, String>,
    version: u64,
    /// Digest of the config last confirmed on the routing resource
    applied: Option<String>,
}

/// Single owner of a routing resource and its route map
pub struct RoutingTable {
    store: Arc<dyn ResourceStore>,
    renderer: ConfigRenderer,
    resource_name: String,
    state: Mutex<TableState>,
    published: watch::Sender<RoutingSnapshot>,
}

impl RoutingTable {
    /// Create an empty table for the named routing resource
    pub fn new(
        store: Arc<dyn ResourceStore>,
        renderer: ConfigRenderer,
        resource_name: impl Into<String>,
    ) -> Self {
        let (published, _) = watch::channel(RoutingSnapshot::default());
        Self {
            store,
            renderer,
            resource_name: resource_name.into(),
            state: Mutex::new(TableState {
                routes: BTreeMap::new(),
                version: 0,
                applied: None,
            }),
            published,
        }
    }

    /// Name of the routing resource this table owns
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Current table contents
    pub fn snapshot(&self) -> RoutingSnapshot {
        self.published.borrow().clone()
    }

    /// Receive every new snapshot as mutations land
    pub fn subscribe(&self) -> watch::Receiver<RoutingSnapshot> {
        self.published.subscribe()
    }

    /// Render the current snapshot without applying it
    pub fn render_current(&self) -> Result<ProxyConfig, Error> {
        self.renderer.render(&self.snapshot())
    }

    /// Create the routing resource seeded with `initial` routes.
    ///
    /// Used once at startup with the routes rebuilt from existing
    /// environments. Invalid entries are skipped with a warning rather than
    /// failing startup.
    pub async fn provision(&self, initial: BTreeMap<String, String>) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        let routes: BTreeMap<String, String> = initial
            .into_iter()
            .filter(|(key, backend)| match validate_route(key, backend) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "skipping invalid route during provisioning");
                    false
                }
            })
            .collect();

        if routes != state.routes {
            state.routes = routes;
            state.version += 1;
            self.publish(&state);
        }

        let config = self.renderer.render(&Self::view(&state))?;
        match self
            .store
            .create_routing_resource(&self.resource_name, &config)
            .await
        {
            Ok(_) => {
                state.applied = Some(config.digest());
                info!(
                    resource = %self.resource_name,
                    routes = state.routes.len(),
                    version = state.version,
                    "routing resource provisioned"
                );
                Ok(())
            }
            Err(e) => {
                state.applied = None;
                Err(Error::ApplyFailed {
                    version: state.version,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Insert or overwrite a route, then apply the new config.
    ///
    /// Returns only after the routing resource holds the new config. On
    /// [`Error::ApplyFailed`] the in-memory table keeps the route; the next
    /// mutation re-applies.
    pub async fn add_route(&self, key: &str, backend: &str) -> Result<(), Error> {
        validate_route(key, backend)?;

        let mut state = self.state.lock().await;
        let changed = state.routes.get(key).map(String::as_str) != Some(backend);
        if changed {
            state.routes.insert(key.to_string(), backend.to_string());
        }
        debug!(route = %key, backend = %backend, changed, "adding route");
        self.commit(&mut state, changed).await
    }

    /// Remove a route if present, then apply the new config.
    ///
    /// Removing an absent key is not an error.
    pub async fn remove_route(&self, key: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let changed = state.routes.remove(key).is_some();
        debug!(route = %key, changed, "removing route");
        self.commit(&mut state, changed).await
    }

    /// Delete the routing resource. A missing resource is not an error.
    pub async fn teardown(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        match self.store.delete_routing_resource(&self.resource_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(resource = %self.resource_name, "routing resource already absent");
            }
            Err(e) => return Err(e),
        }
        state.applied = None;
        info!(resource = %self.resource_name, "routing resource deleted");
        Ok(())
    }

    /// Render and apply under the caller's lock.
    async fn commit(&self, state: &mut TableState, changed: bool) -> Result<(), Error> {
        if changed {
            state.version += 1;
            self.publish(state);
        }

        let config = self.renderer.render(&Self::view(state))?;
        let digest = config.digest();
        if state.applied.as_deref() == Some(digest.as_str()) {
            debug!(version = state.version, "routing config unchanged, skipping apply");
            return Ok(());
        }

        match self
            .store
            .update_routing_resource(&self.resource_name, &config)
            .await
        {
            Ok(()) => {
                state.applied = Some(digest);
                info!(
                    resource = %self.resource_name,
                    version = state.version,
                    routes = state.routes.len(),
                    "routing config applied"
                );
                Ok(())
            }
            Err(e) => {
                // The resource may hold anything now; force the next commit to apply.
                state.applied = None;
                warn!(
                    resource = %self.resource_name,
                    version = state.version,
                    error = %e,
                    "failed to apply routing config"
                );
                Err(Error::ApplyFailed {
                    version: state.version,
                    message: e.to_string(),
                })
            }
        }
    }

    fn view(state: &TableState) -> RoutingSnapshot {
        RoutingSnapshot {
            routes: state.routes.clone(),
            version: state.version,
        }
    }

    fn publish(&self, state: &TableState) {
        self.published.send_replace(Self::view(state));
    }
}
