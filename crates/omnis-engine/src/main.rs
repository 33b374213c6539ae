//! omnis-engined - Privileged installer engine service

use anyhow::{Context, Result};
use clap::Parser;
use omnis_engine::engine::null_event_sink;
use omnis_engine::{Dispatcher, Engine, EngineConfig, IpcServer, SecurityValidator, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// omnis-engined - Privileged installer engine service
#[derive(Parser, Debug)]
#[command(name = "omnis-engined")]
#[command(about = "Privileged installer engine serving the omnis IPC socket")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the listening socket path
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; --verbose wins over OMNIS_LOG.
    omnis_core::logging::init(args.verbose.then_some(tracing::Level::DEBUG));

    info!("Omnis engine starting...");

    let mut config =
        EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let validator = Arc::new(SecurityValidator::new(
        config.validator_limits(),
        config.allowed_roots.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new());
    let server = IpcServer::new(
        ServerConfig::from(&config),
        validator.clone(),
        dispatcher.clone(),
    );

    // The engine starts without a job backend; orchestration layers attach
    // one through Engine::with_backend when embedding this crate. The event
    // sink is swapped for the server's once the server exists.
    let mut engine = Engine::new(&config, validator, null_event_sink());
    engine = engine.with_event_sink(server.event_sink());
    engine.register_handlers(&dispatcher);
    let shutdown = engine.shutdown_token();

    server.start().await.context("Failed to start IPC server")?;
    info!("Omnis engine ready on {}", config.socket_path.display());

    // Run until a signal or a SHUTDOWN command arrives.
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = sigterm() => {
            info!("Received SIGTERM");
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown command accepted");
        }
    }

    server.stop().await.context("Failed to stop IPC server")?;
    info!("Omnis engine shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn sigterm() {
    let Ok(mut signal) =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    else {
        // No SIGTERM handler; fall back to the other exit paths.
        std::future::pending::<()>().await;
        return;
    };
    signal.recv().await;
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
