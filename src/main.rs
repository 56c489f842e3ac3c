//! bundle-agent: polls bundle services and activates bundles into a local store
//!
//! Configuration is a TOML file (`--config`); the store directory can be
//! overridden with `--data-dir`. Stops cleanly on Ctrl-C, after in-flight
//! activations have committed or rolled back.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bundle_agent::api::{self, ApiState};
use bundle_agent::download::HttpTransport;
use bundle_agent::status::Snapshot;
use bundle_agent::storage::{DiskOptions, DiskStore, Store};
use bundle_agent::{ActivationEngine, Config, Orchestrator, StatusRegistry};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "bundle-agent")]
#[command(about = "Polls configuration bundles and activates them into a partitioned store")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "BUNDLE_AGENT_CONFIG", default_value = "bundle-agent.toml")]
    config: PathBuf,

    /// Store directory (overrides config file)
    #[arg(short, long, env = "BUNDLE_AGENT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bundle_agent=info".into());
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting bundle-agent");
    info!("Config file: {}", cli.config.display());

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = cli.data_dir {
        config.store.dir = dir;
    }

    info!("Store dir: {}", config.store.dir.display());
    info!("Bundles: {}", config.bundles.len());

    let store = DiskStore::open(DiskOptions::new(&config.store.dir, config.partitions()?))?;
    let store: Arc<dyn Store> = Arc::new(store);
    let engine = Arc::new(ActivationEngine::new(store.clone())?);
    let registry = Arc::new(StatusRegistry::new());

    for name in engine.active_bundles() {
        if !config.bundles.contains_key(&name) {
            info!(bundle = %name, "Bundle no longer configured, removing its content");
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || engine.deactivate(&name)).await??;
        }
    }

    registry.register_listener("log", |snapshot: &Snapshot| -> anyhow::Result<()> {
        for status in snapshot.values() {
            tracing::debug!(bundle = %status.name, state = ?status.state, "Bundle status");
        }
        Ok(())
    });

    let mut orchestrator = Orchestrator::new(engine, registry.clone());
    for (name, bundle) in &config.bundles {
        let service = config
            .services
            .get(&bundle.service)
            .ok_or_else(|| anyhow::anyhow!("bundle {}: unknown service {}", name, bundle.service))?;
        let transport = Arc::new(HttpTransport::new(&service.url, &service.headers)?);
        orchestrator.start_bundle(config.poller(name)?, transport);
    }

    let (api_shutdown, api_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let api_task = match config.api.listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("Status API listening on http://{}", addr);
            let state = ApiState {
                registry: registry.clone(),
                store: store.clone(),
            };
            Some(tokio::spawn(api::serve(listener, state, async move {
                let _ = api_shutdown_rx.await;
            })))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    orchestrator.stop().await;
    let _ = api_shutdown.send(());
    if let Some(task) = api_task {
        if let Err(e) = task.await? {
            error!(error = %e, "Status API failed");
        }
    }

    info!("bundle-agent stopped");
    Ok(())
}
