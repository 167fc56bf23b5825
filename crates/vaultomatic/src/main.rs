//! Vaultomatic
//!
//! Automatic unsealer for Vault running on Kubernetes.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use vaultomatic::{
    api,
    config::{KeyCacheConfig, Settings},
    discovery::{Discovery, KubePodWatcher},
    keys::{EtcdKeyStore, KeyCache},
    observability::{init_metrics, init_tracing, TracingConfig},
    vault::HttpVaultConnector,
};

#[derive(Parser)]
#[command(name = "vaultomatic")]
#[command(about = "Automatically unseal Vault pods from keys held in etcd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the unsealer
    Run(Settings),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(settings) => run(settings).await,
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    init_tracing(&TracingConfig::from_env());
    info!("Starting vaultomatic");

    let metrics_state =
        init_metrics().map_err(|e| anyhow!("failed to initialize metrics: {e}"))?;

    let store = EtcdKeyStore::connect(&settings.etcd()).await?;
    info!(key = store.key(), "Connected to etcd");
    let keys = KeyCache::new(Arc::new(store), KeyCacheConfig::default());

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    info!("Connected to Kubernetes");

    let discovery_config = settings.discovery();
    let watcher = KubePodWatcher::new(
        client,
        &discovery_config.namespace,
        &discovery_config.selector,
        discovery_config.watch_timeout_secs,
    );
    let connector = HttpVaultConnector::new(discovery_config.supervisor.request_timeout)?;
    let discovery = Discovery::spawn(
        watcher,
        keys.clone(),
        Arc::new(connector),
        discovery_config,
    );

    let state = api::AppState {
        keys,
        fleet: discovery.status_handle(),
        metrics_state: Some(metrics_state),
    };
    let app = api::create_router(state);

    info!(bind_addr = %settings.bind_addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        })
        .await?;

    info!("HTTP server stopped, stopping discovery");
    discovery.stop().await;
    info!("Shutdown complete");

    Ok(())
}
