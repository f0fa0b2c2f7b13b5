//! modserve server binary entry point
//!
//! Starts the module host: loads the module listing, brings the supervisor
//! up, and serves the worker-facing queue protocol over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:32168, ./modules.json)
//! cargo run -p modserve-server
//!
//! # Start with a config file and custom address
//! MODSERVE_CONFIG=modserve.toml MODSERVE_BIND_ADDRESS="0.0.0.0:32168" \
//!     cargo run -p modserve-server
//!
//! # With logging
//! RUST_LOG=debug cargo run -p modserve-server
//! ```
//!
//! # Environment Variables
//!
//! - `MODSERVE_CONFIG`: Path to a TOML config file (optional)
//! - `MODSERVE_BIND_ADDRESS`: Server bind address (default: `127.0.0.1:32168`)
//! - `MODSERVE_MODULES_FILE`: Path to the module listing file
//! - `RUST_LOG`: Logging level (default: `info`)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use modserve_core::{Orchestrator, ServerConfig};
use modserve_http::HttpServer;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        modules_file = %config.modules_file.display(),
        "modserve server starting"
    );

    // Create tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("modserve-http")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let orchestrator =
            Arc::new(Orchestrator::from_config(config).context("failed to load module registry")?);

        let server = HttpServer::new(
            orchestrator.config(),
            orchestrator.broker(),
            orchestrator.supervisor(),
            orchestrator.shutdown_token(),
        );

        // Bring the modules up in the background while the listener opens;
        // the orchestrator's settle delay keeps launches behind the front
        // end either way.
        let startup = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = startup.startup().await {
                error!("Module startup failed: {e}");
            }
        });

        // First ctrl-c starts the bounded shutdown.
        let shutdown = orchestrator.shutdown_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });

        info!("HTTP server ready - listening for workers and callers");
        server.serve().await.map_err(|e| {
            error!("Server error: {e}");
            anyhow::anyhow!(e)
        })?;

        orchestrator.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })?;

    info!("modserve server shutdown complete");
    Ok(())
}

/// Loads the config file (if any) and applies environment overrides.
fn load_config() -> anyhow::Result<ServerConfig> {
    let mut config = match std::env::var("MODSERVE_CONFIG") {
        Ok(path) => ServerConfig::load(std::path::Path::new(&path))
            .with_context(|| format!("failed to load config from {path}"))?,
        Err(_) => ServerConfig::default(),
    };

    if let Ok(bind_address) = std::env::var("MODSERVE_BIND_ADDRESS") {
        config.bind_address = bind_address;
    }
    if let Ok(modules_file) = std::env::var("MODSERVE_MODULES_FILE") {
        config.modules_file = PathBuf::from(modules_file);
    }

    Ok(config)
}
