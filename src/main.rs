//! Hive binary

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hive::config::{ClusterArgs, ServeArgs};
use hive::lifecycle::EnvironmentCoordinator;
use hive::render::{ConfigRenderer, RenderSettings};
use hive::routing::RoutingTable;
use hive::store::cluster::{create_client, KubeResourceStore, ProxySettings};
use hive::store::ResourceStore;
use hive::waiter::ReadinessWaiter;

/// Hive - per-student course environments behind one shared proxy
#[derive(Parser, Debug)]
#[command(name = "hive", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile existing environments, provision the proxy, and serve the API
    Serve(ServeArgs),

    /// Delete the shared proxy's ConfigMap, Deployment, and Service
    Teardown(ClusterArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client's TLS stack needs a process-wide crypto provider.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Teardown(args) => run_teardown(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let client = create_client(args.cluster.kubeconfig.as_deref()).await?;
    let store: Arc<dyn ResourceStore> = Arc::new(KubeResourceStore::new(
        client,
        &args.cluster.namespace,
        args.proxy_settings(),
    ));

    let routing = Arc::new(RoutingTable::new(
        store.clone(),
        ConfigRenderer::new(args.render_settings())?,
        &args.cluster.proxy_name,
    ));
    let waiter = ReadinessWaiter::new(store.clone(), args.waiter_config());
    let coordinator = Arc::new(EnvironmentCoordinator::new(
        store,
        routing,
        waiter,
        args.lifecycle_config(),
    ));

    let found = coordinator.start(&args.retry_config()).await?;
    tracing::info!(
        namespace = %args.cluster.namespace,
        proxy = %args.cluster.proxy_name,
        environments = found,
        "reconciled existing environments"
    );

    let listener = TcpListener::bind(args.listen)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", args.listen, e))?;
    tracing::info!(addr = %args.listen, "HTTP API listening");

    let shutdown = coordinator.clone();
    axum::serve(listener, hive::api::router(coordinator))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
            shutdown.shutdown();
        })
        .await?;

    Ok(())
}

async fn run_teardown(args: ClusterArgs) -> anyhow::Result<()> {
    let client = create_client(args.kubeconfig.as_deref()).await?;
    let store: Arc<dyn ResourceStore> = Arc::new(KubeResourceStore::new(
        client,
        &args.namespace,
        ProxySettings::default(),
    ));

    let routing = RoutingTable::new(
        store,
        ConfigRenderer::new(RenderSettings::default())?,
        &args.proxy_name,
    );
    routing.teardown().await?;
    tracing::info!(
        namespace = %args.namespace,
        proxy = %args.proxy_name,
        "shared proxy removed"
    );
    Ok(())
}
