//! Composition root
//!
//! Builds the registry, broker, and supervisor from one configuration,
//! brings every valid module up in order at startup, and tears everything
//! down inside a bounded grace window at shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::QueueBroker;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::registry::ModuleRegistry;
use crate::supervisor::{ModuleState, ModuleSupervisor};

/// Extra time on top of the per-module stop grace before shutdown gives up
/// waiting and lets the host process exit.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

/// Wires the registry, broker, and supervisor together and owns the
/// process-wide shutdown token.
pub struct Orchestrator {
    config: Arc<ServerConfig>,
    registry: Arc<ModuleRegistry>,
    broker: Arc<QueueBroker>,
    supervisor: ModuleSupervisor,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Builds the component graph from a config and a pre-loaded registry.
    pub fn new(config: ServerConfig, registry: ModuleRegistry) -> Self {
        let config = Arc::new(config);
        let broker = Arc::new(QueueBroker::new(config.queue.clone()));
        let shutdown = CancellationToken::new();
        let supervisor = ModuleSupervisor::new(config.clone(), broker.clone(), shutdown.clone());

        Self {
            config,
            registry: Arc::new(registry),
            broker,
            supervisor,
            shutdown,
        }
    }

    /// Builds the component graph, loading the registry from the module
    /// listing file named by the config.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let registry = ModuleRegistry::load(&config.modules_file)?;
        Ok(Self::new(config, registry))
    }

    /// The shared queue broker.
    pub fn broker(&self) -> Arc<QueueBroker> {
        self.broker.clone()
    }

    /// The module supervisor.
    pub fn supervisor(&self) -> ModuleSupervisor {
        self.supervisor.clone()
    }

    /// The server configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    /// The module registry.
    pub fn registry(&self) -> Arc<ModuleRegistry> {
        self.registry.clone()
    }

    /// Token cancelled when shutdown begins; every long-poll and watcher
    /// hangs off it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Brings the system up.
    ///
    /// Registers every valid module first - creating its queue whether or
    /// not it will be launched, so externally run workers can attach - then,
    /// if launching is enabled, waits the settle delay and starts every
    /// `Enabled` module, skipping any a worker already brought to `Started`.
    pub async fn startup(&self) -> Result<()> {
        info!(
            modules = self.registry.len(),
            platform = self.registry.platform(),
            "Starting module host"
        );

        for descriptor in self.registry.iter() {
            self.supervisor.register(descriptor);
        }

        if !self.config.launch.launch_modules {
            warn!("Skipping background module startup (launch-modules = false)");
            return Ok(());
        }

        // Let the front end come up before the backend analysis services.
        let settle = self.config.launch.pre_launch_delay();
        if !settle.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }

        for descriptor in self.registry.iter() {
            if self.shutdown.is_cancelled() {
                break;
            }
            let module_id = &descriptor.module_id;
            match self.supervisor.state(module_id) {
                Some(ModuleState::Enabled) => {
                    if let Err(e) = self.supervisor.start(module_id).await {
                        error!(%module_id, error = %e, "Module failed to start");
                    }
                }
                Some(ModuleState::Started) => {
                    info!(%module_id, "Module already running, skipping launch");
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Tears the system down: cancels the shutdown token and stops every
    /// running module concurrently, bounded by the stop grace period plus a
    /// small margin.
    pub async fn shutdown(&self) {
        info!("Module host shutting down");
        self.shutdown.cancel();

        let grace = self.config.launch.stop_grace_period();
        let stop_all = self.supervisor.stop_all(grace);
        if tokio::time::timeout(grace + SHUTDOWN_MARGIN, stop_all)
            .await
            .is_err()
        {
            warn!("Shutdown grace window elapsed with modules still stopping");
        }

        info!("Module host stopped");
    }
}
