//! Command-line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::lifecycle::LifecycleConfig;
use crate::render::RenderSettings;
use crate::retry::RetryConfig;
use crate::store::cluster::ProxySettings;
use crate::waiter::WaiterConfig;

/// Where the provisioner's resources live
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ClusterArgs {
    /// Namespace for environments and the shared proxy
    #[arg(long, env = "HIVE_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Path to a kubeconfig (inferred when unset)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Name of the shared proxy's ConfigMap, Deployment, and Service
    #[arg(long, env = "HIVE_PROXY_NAME", default_value = "master-router")]
    pub proxy_name: String,
}

/// Options for `hive serve`
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ServeArgs {
    /// Cluster connection
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// HTTP API listen address
    #[arg(long, env = "HIVE_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// nginx image for the shared proxy
    #[arg(long, env = "HIVE_PROXY_IMAGE", default_value = "nginx:latest")]
    pub proxy_image: String,

    /// Service type exposing the shared proxy
    #[arg(long, env = "HIVE_PROXY_SERVICE_TYPE", default_value = "LoadBalancer")]
    pub proxy_service_type: String,

    /// Port the shared proxy listens on
    #[arg(long, env = "HIVE_PROXY_PORT", default_value_t = 80)]
    pub proxy_port: u16,

    /// Port environment containers listen on
    #[arg(long, env = "HIVE_CONTAINER_PORT", default_value_t = 8080)]
    pub container_port: u16,

    /// Port environment endpoints expose
    #[arg(long, env = "HIVE_ENDPOINT_PORT", default_value_t = 80)]
    pub endpoint_port: u16,

    /// Milliseconds between endpoint address polls
    #[arg(long, env = "HIVE_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Seconds to wait for an endpoint address
    #[arg(long, env = "HIVE_ADDRESS_TIMEOUT_SECS", default_value_t = 30)]
    pub address_timeout_secs: u64,

    /// Attempts at listing environments and provisioning the proxy on startup
    #[arg(long, env = "HIVE_STARTUP_ATTEMPTS", default_value_t = 5)]
    pub startup_attempts: u32,
}

impl ServeArgs {
    /// Address polling parameters
    pub fn waiter_config(&self) -> WaiterConfig {
        WaiterConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            timeout: Duration::from_secs(self.address_timeout_secs),
        }
    }

    /// Proxy config render settings
    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            listen_port: self.proxy_port,
            upstream_port: self.endpoint_port,
            ..Default::default()
        }
    }

    /// Environment resource ports
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            container_port: self.container_port,
            endpoint_port: self.endpoint_port,
        }
    }

    /// Shared proxy deployment
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            image: self.proxy_image.clone(),
            service_type: self.proxy_service_type.clone(),
            listen_port: self.proxy_port,
        }
    }

    /// Startup retry budget
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.startup_attempts)
    }
}
