use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use capsules_sandbox_exec::{ContainerEngine, DockerCli};
use clap::Parser;
use coderoom_runtime::build_room_service;
use coderoom_runtime::server::docsync::{DocSyncEngine, RelaySyncEngine};
use coderoom_runtime::server::{create_app, serve};
use config_loader::ConfigManager;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coderoom", version, about = "Collaborative code rooms with sandboxed runs")]
struct Cli {
    /// JSON config file (overrides CONFIG_PATH)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Listen address, overriding configuration and environment
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut manager = ConfigManager::new();
    if let Some(path) = cli.config {
        manager = manager.with_config_path(path);
    }
    let mut config = manager.load().context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind.to_string();
    }
    let addr = config.socket_addr()?;

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCli::new(config.sandbox.runtime.clone()));
    let rooms = build_room_service(engine, &config.sandbox);
    let registry = Arc::clone(rooms.registry());
    let doc_sync: Arc<dyn DocSyncEngine> = Arc::new(RelaySyncEngine::new());
    let app = create_app(rooms, doc_sync, &config.server.cors_origins);

    info!(
        image = %config.sandbox.image,
        timeout_secs = config.sandbox.timeout_secs,
        runtime = %config.sandbox.runtime,
        "sandbox configured"
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    serve(listener, app, shutdown_signal()).await?;

    registry.shutdown();
    info!("coderoom stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutdown signal received");
}
