//! Proxy configuration rendering
//!
//! [`ConfigRenderer::render`] is a pure function of a routing snapshot over the
//! `templates/nginx.conf.j2` template: routes are emitted in key order, so
//! equal tables always render byte-identical nginx configuration regardless
//! of the order routes were added in.

use std::fmt;

use minijinja::{context, Environment};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::routing::RoutingSnapshot;
use crate::Error;

/// Key under which the rendered config is stored in the routing resource
pub const PROXY_CONFIG_KEY: &str = "nginx.conf";

/// Rendered proxy configuration text
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyConfig(String);

impl ProxyConfig {
    /// Wrap already-rendered configuration text
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The configuration text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the configuration text
    pub fn into_string(self) -> String {
        self.0
    }

    /// Truncated SHA-256 of the text (16 hex chars), stable across releases
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.0.as_bytes());
        hash[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Number of `location` blocks, one per route
    pub fn location_count(&self) -> usize {
        self.0
            .lines()
            .filter(|line| line.trim_start().starts_with("location /"))
            .count()
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// IPv6 literals need brackets in an nginx upstream URL
fn upstream_host(backend: &str) -> String {
    if backend.contains(':') {
        format!("[{backend}]")
    } else {
        backend.to_string()
    }
}

/// nginx template loaded at compile time
const NGINX_TEMPLATE: &str = include_str!("../templates/nginx.conf.j2");

/// Template name; the `.conf` suffix keeps auto-escaping off
const NGINX_TEMPLATE_NAME: &str = "nginx.conf";

/// Tunables of the rendered proxy configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderSettings {
    /// Port the proxy listens on
    pub listen_port: u16,
    /// Port every backend is reached on
    pub upstream_port: u16,
    /// Maximum request body accepted by the proxy
    pub client_max_body_size: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            listen_port: 80,
            upstream_port: crate::store::DEFAULT_ENDPOINT_PORT,
            client_max_body_size: "10m".to_string(),
        }
    }
}

#[derive(Serialize)]
struct RouteEntry<'a> {
    key: &'a str,
    host: String,
}

/// Renders routing snapshots into nginx configuration
#[derive(Clone, Debug)]
pub struct ConfigRenderer {
    settings: RenderSettings,
    env: Environment<'static>,
}

impl ConfigRenderer {
    /// Compile the nginx template for the given settings.
    ///
    /// The template is checked here with an empty table, so a broken
    /// template fails at startup rather than on the first route change.
    pub fn new(settings: RenderSettings) -> Result<Self, Error> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);
        env.add_template(NGINX_TEMPLATE_NAME, NGINX_TEMPLATE)
            .map_err(|e| {
                Error::internal_with_context("render", format!("invalid nginx template: {e}"))
            })?;

        let renderer = Self { settings, env };
        renderer.render(&RoutingSnapshot::default())?;
        Ok(renderer)
    }

    /// Settings the renderer was built with
    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Render a snapshot into proxy configuration text
    pub fn render(&self, snapshot: &RoutingSnapshot) -> Result<ProxyConfig, Error> {
        // BTreeMap iteration is the fixed lexicographic order.
        let routes: Vec<RouteEntry<'_>> = snapshot
            .routes
            .iter()
            .map(|(key, backend)| RouteEntry {
                key,
                host: upstream_host(backend),
            })
            .collect();

        let text = self
            .env
            .get_template(NGINX_TEMPLATE_NAME)
            .and_then(|template| {
                template.render(context! {
                    listen_port => self.settings.listen_port,
                    upstream_port => self.settings.upstream_port,
                    client_max_body_size => &self.settings.client_max_body_size,
                    routes => routes,
                })
            })
            .map_err(|e| {
                Error::internal_with_context(
                    "render",
                    format!("failed to render nginx config: {e}"),
                )
            })?;

        Ok(ProxyConfig(text))
    }
}
