//! Bounded, cancellable wait for an externally assigned endpoint address
//!
//! Polls [`ResourceStore::endpoint_address`] at a fixed interval until an
//! address appears, the deadline passes, or the caller's cancellation token
//! fires. Time comes from `tokio::time`, so tests drive it with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::store::ResourceStore;
use crate::Error;

/// Default time between address polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default total time to wait for an address
pub const DEFAULT_ADDRESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling parameters for [`ReadinessWaiter`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaiterConfig {
    /// Time between polls
    pub poll_interval: Duration,
    /// Total time before giving up
    pub timeout: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_ADDRESS_TIMEOUT,
        }
    }
}

/// Waits for network endpoints to report an address
#[derive(Clone)]
pub struct ReadinessWaiter {
    store: Arc<dyn ResourceStore>,
    config: WaiterConfig,
}

impl ReadinessWaiter {
    /// Create a waiter over the given store
    pub fn new(store: Arc<dyn ResourceStore>, config: WaiterConfig) -> Self {
        Self { store, config }
    }

    /// Polling parameters in use
    pub fn config(&self) -> &WaiterConfig {
        &self.config
    }

    /// Wait up to the configured timeout for `name` to report an address
    pub async fn wait_for_address(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        self.wait_until(name, Instant::now() + self.config.timeout, cancel)
            .await
    }

    /// Wait until `deadline` for `name` to report an address.
    ///
    /// A final poll happens exactly at the deadline; if it still finds no
    /// address the wait returns [`Error::Timeout`]. Store errors (including
    /// the endpoint not existing yet) count as "not ready" and keep polling.
    pub async fn wait_until(
        &self,
        name: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    name: name.to_string(),
                });
            }

            match self.store.endpoint_address(name).await {
                Ok(Some(address)) => {
                    debug!(
                        endpoint = %name,
                        address = %address,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "endpoint address assigned"
                    );
                    return Ok(address);
                }
                Ok(None) => trace!(endpoint = %name, "endpoint address not assigned yet"),
                Err(e) => trace!(endpoint = %name, error = %e, "endpoint lookup failed, retrying"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    name: name.to_string(),
                    waited: now - start,
                });
            }

            let wake = (now + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { name: name.to_string() });
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
