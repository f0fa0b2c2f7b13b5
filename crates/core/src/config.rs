//! Server configuration
//!
//! One [`ServerConfig`] is built at startup (TOML file plus environment
//! overrides applied by the binary) and passed explicitly into the broker,
//! supervisor, and orchestrator constructors. Nothing reads configuration
//! from globals after that.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:32168";

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub bind_address: String,

    /// Path to the module listing file read at startup
    pub modules_file: PathBuf,

    /// Server version advertised to module compatibility checks
    pub server_version: String,

    /// Queue processing settings
    pub queue: QueueSettings,

    /// Module launch/supervision settings
    pub launch: LaunchSettings,

    /// Environment variables applied to every spawned worker process
    pub environment: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            modules_file: PathBuf::from("modules.json"),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            queue: QueueSettings::default(),
            launch: LaunchSettings::default(),
            environment: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
    }
}

/// Queue processing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueSettings {
    /// Max time a front-end caller waits for a worker response, in seconds
    pub response_timeout_secs: u64,

    /// Max time a worker's long-poll dequeue is held open, in seconds
    pub command_dequeue_timeout_secs: u64,

    /// Max number of requests a single queue buffers
    pub max_queue_length: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            response_timeout_secs: 60,
            command_dequeue_timeout_secs: 10,
            max_queue_length: 32,
        }
    }
}

impl QueueSettings {
    /// Caller-wait timeout as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Worker long-poll timeout as a [`Duration`].
    pub fn command_dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.command_dequeue_timeout_secs)
    }
}

/// Module launch and supervision settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LaunchSettings {
    /// Whether the supervisor launches worker processes at all.
    ///
    /// Queues are created either way so externally started workers (e.g. a
    /// module under a debugger) can still attach.
    pub launch_modules: bool,

    /// Settle delay before launching the first module, in seconds
    pub pre_launch_delay_secs: u64,

    /// Grace period after spawn before a quiet module is considered Started,
    /// in seconds
    pub post_start_pause_secs: u64,

    /// Grace period for a stopping worker before it is force-killed, in
    /// seconds
    pub stop_grace_period_secs: u64,

    /// Max automatic restarts after a crash before the module is parked
    pub max_restarts: u32,

    /// Base delay of the crash-restart exponential back-off, in milliseconds
    pub restart_backoff_base_ms: u64,

    /// Cap on the crash-restart back-off delay, in seconds
    pub restart_backoff_max_secs: u64,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            launch_modules: true,
            pre_launch_delay_secs: 3,
            post_start_pause_secs: 3,
            stop_grace_period_secs: 10,
            max_restarts: 5,
            restart_backoff_base_ms: 500,
            restart_backoff_max_secs: 30,
        }
    }
}

impl LaunchSettings {
    /// Settle delay as a [`Duration`].
    pub fn pre_launch_delay(&self) -> Duration {
        Duration::from_secs(self.pre_launch_delay_secs)
    }

    /// Post-spawn promotion pause as a [`Duration`].
    pub fn post_start_pause(&self) -> Duration {
        Duration::from_secs(self.post_start_pause_secs)
    }

    /// Stop grace period as a [`Duration`].
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }
}
