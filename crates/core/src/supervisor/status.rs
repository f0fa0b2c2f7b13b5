//! Module lifecycle states and status snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a module's worker process.
///
/// ```text
/// NotAvailable                      (platform/version unsupported)
/// NotEnabled ──► Enabled ──► Starting ──► Started ──► Stopping ──► Stopped
///                               ▲             │
///                               └── Crashed ◄─┘   (bounded auto-restart)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    /// Platform or server-version constraints fail; never launchable
    NotAvailable,
    /// Available but auto-start is disabled
    NotEnabled,
    /// Queued to launch when the orchestrator starts modules
    Enabled,
    /// Process spawned, liveness not yet confirmed
    Starting,
    /// Worker confirmed alive (first poll, or the post-start grace elapsed)
    Started,
    /// A controlled stop is in progress
    Stopping,
    /// Not running
    Stopped,
    /// The process exited without an explicit stop request
    Crashed,
}

impl ModuleState {
    /// Whether a process is live (or being brought up) in this state.
    pub fn is_running(&self) -> bool {
        matches!(self, ModuleState::Starting | ModuleState::Started)
    }

    /// Whether `start` may proceed from this state.
    ///
    /// `Starting`/`Started` are handled as no-ops before this check;
    /// `NotAvailable` and `Stopping` reject a launch outright.
    pub fn is_startable(&self) -> bool {
        matches!(
            self,
            ModuleState::NotEnabled
                | ModuleState::Enabled
                | ModuleState::Stopped
                | ModuleState::Crashed
        )
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModuleState::NotAvailable => "NotAvailable",
            ModuleState::NotEnabled => "NotEnabled",
            ModuleState::Enabled => "Enabled",
            ModuleState::Starting => "Starting",
            ModuleState::Started => "Started",
            ModuleState::Stopping => "Stopping",
            ModuleState::Stopped => "Stopped",
            ModuleState::Crashed => "Crashed",
        };
        f.write_str(name)
    }
}

/// Snapshot of one module's process, as reported to status consumers.
///
/// Mutated exclusively by the supervisor; readers receive clones, never a
/// live reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    /// The module id
    pub module_id: String,

    /// Display name of the module
    pub name: String,

    /// The queue this module's workers poll
    pub queue: String,

    /// Module version, if the descriptor carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Current lifecycle state
    pub state: ModuleState,

    /// OS process id while running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// When the process was last started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When a worker for this module last polled or posted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,

    /// Crash-triggered restarts since the server started
    pub restart_count: u32,

    /// Exit code of the most recent process exit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,

    /// Results posted by this module's workers
    pub request_count: u64,

    /// Set when auto-restart gave up; the module needs manual intervention
    pub restarts_exhausted: bool,

    /// Free-form status reported by the worker (execution provider, device
    /// ids, …). Stored, never interpreted.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub status_data: Map<String, Value>,
}

impl ProcessStatus {
    /// Creates a fresh status row in the given initial state.
    pub fn new(
        module_id: impl Into<String>,
        name: impl Into<String>,
        queue: impl Into<String>,
        version: Option<String>,
        state: ModuleState,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            name: name.into(),
            queue: queue.into(),
            version,
            state,
            pid: None,
            started_at: None,
            last_seen: None,
            restart_count: 0,
            last_exit_code: None,
            request_count: 0,
            restarts_exhausted: false,
            status_data: Map::new(),
        }
    }
}
