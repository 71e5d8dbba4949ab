//! Hive - per-student course environment provisioner
//!
//! Hive creates an isolated environment (a Deployment plus a Service) for each
//! student of a course assignment and publishes every environment under one
//! shared nginx reverse proxy at `/{course}/{assignment}/{student}/`.
//!
//! # Architecture
//!
//! - The [`lifecycle::EnvironmentCoordinator`] runs create/delete for each
//!   environment, compensating on partial creation failure.
//! - The [`routing::RoutingTable`] is the single writer of the proxy config:
//!   every route change re-renders the full config and applies it before
//!   returning.
//! - All cluster access goes through [`store::ResourceStore`], so the core is
//!   tested against mocks and in-memory fakes.
//!
//! # Modules
//!
//! - [`environment`] - Identity tuple, naming, and lifecycle status
//! - [`store`] - Cluster resource store trait and the kube-rs implementation
//! - [`render`] - nginx config rendering
//! - [`routing`] - Route table manager
//! - [`waiter`] - Bounded wait for endpoint addresses
//! - [`lifecycle`] - Environment create/delete orchestration
//! - [`retry`] - Startup retry with backoff
//! - [`config`] - CLI and environment configuration
//! - [`api`] - HTTP API
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod api;
pub mod config;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod render;
pub mod retry;
pub mod routing;
pub mod store;
pub mod waiter;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
