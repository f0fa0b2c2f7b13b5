//! Module process supervisor
//!
//! Drives the lifecycle state machine of each module's worker process:
//! decides whether a module can run at all, spawns/stops/restarts the OS
//! process with environment injection, watches for crashes, auto-restarts
//! with bounded back-off, and exposes status snapshots.
//!
//! The supervisor is the sole owner of process handles; no other component
//! may hold or signal a child process. Status readers always receive
//! snapshot clones, never live references.

mod backoff;
mod status;

pub use backoff::RestartBackoff;
pub use status::{ModuleState, ProcessStatus};

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::QueueBroker;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::payload::{QueuedRequest, RequestPayload};
use crate::registry::{ModuleDescriptor, ModuleLaunch};

/// Interval at which process watchers and stop-waits poll for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to one spawned worker process.
///
/// `stop_requested` distinguishes a controlled stop from a crash when the
/// watcher observes the exit.
#[derive(Clone)]
struct ProcessHandle {
    pid: Option<u32>,
    child: Arc<Mutex<Option<Child>>>,
    stop_requested: Arc<AtomicBool>,
}

struct Inner {
    config: Arc<ServerConfig>,
    broker: Arc<QueueBroker>,
    backoff: RestartBackoff,
    platform: String,
    descriptors: RwLock<HashMap<String, ModuleDescriptor>>,
    statuses: RwLock<HashMap<String, ProcessStatus>>,
    processes: Mutex<HashMap<String, ProcessHandle>>,
    shutdown: CancellationToken,
}

/// Supervises the worker processes behind every registered module.
#[derive(Clone)]
pub struct ModuleSupervisor {
    inner: Arc<Inner>,
}

impl ModuleSupervisor {
    /// Creates a supervisor for the current platform.
    pub fn new(
        config: Arc<ServerConfig>,
        broker: Arc<QueueBroker>,
        shutdown: CancellationToken,
    ) -> Self {
        let platform = crate::registry::current_platform();
        Self::with_platform(config, broker, platform, shutdown)
    }

    /// As [`ModuleSupervisor::new`] with an explicit platform string.
    pub fn with_platform(
        config: Arc<ServerConfig>,
        broker: Arc<QueueBroker>,
        platform: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let backoff = RestartBackoff::new(
            Duration::from_millis(config.launch.restart_backoff_base_ms),
            Duration::from_secs(config.launch.restart_backoff_max_secs),
            config.launch.max_restarts,
        );

        Self {
            inner: Arc::new(Inner {
                config,
                broker,
                backoff,
                platform: platform.into(),
                descriptors: RwLock::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
                processes: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Computes a module's state before any process exists: `NotAvailable`
    /// when platform/version constraints fail, otherwise `Enabled` iff
    /// auto-start is on.
    pub fn initial_state(
        descriptor: &ModuleDescriptor,
        platform: &str,
        server_version: &str,
    ) -> ModuleState {
        if !descriptor.is_available(platform, server_version) {
            ModuleState::NotAvailable
        } else if descriptor.auto_start {
            ModuleState::Enabled
        } else {
            ModuleState::NotEnabled
        }
    }

    /// Registers a module: creates its queue and a status row in the
    /// computed initial state. The queue is created whether or not the
    /// module will be launched, so externally started workers can attach.
    /// Re-registering an id is a no-op.
    pub fn register(&self, descriptor: &ModuleDescriptor) {
        let queue = descriptor.queue_name();
        self.inner.broker.create_queue(&queue);

        let state = Self::initial_state(
            descriptor,
            &self.inner.platform,
            &self.inner.config.server_version,
        );

        let mut statuses = self.inner.statuses.write();
        statuses
            .entry(descriptor.module_id.clone())
            .or_insert_with(|| {
                ProcessStatus::new(
                    descriptor.module_id.clone(),
                    descriptor.display_name().to_string(),
                    queue,
                    descriptor.version.clone(),
                    state,
                )
            });
        drop(statuses);

        self.inner
            .descriptors
            .write()
            .entry(descriptor.module_id.clone())
            .or_insert_with(|| descriptor.clone());
    }

    /// Removes a module's status row and descriptor. Refused while a
    /// process is running.
    pub async fn unregister(&self, module_id: &str) -> bool {
        if self.inner.processes.lock().await.contains_key(module_id) {
            return false;
        }
        self.inner.descriptors.write().remove(module_id);
        self.inner.statuses.write().remove(module_id).is_some()
    }

    /// Current state of a module, if registered.
    pub fn state(&self, module_id: &str) -> Option<ModuleState> {
        self.inner.statuses.read().get(module_id).map(|s| s.state)
    }

    /// Snapshot of one module's status.
    pub fn status(&self, module_id: &str) -> Option<ProcessStatus> {
        self.inner.statuses.read().get(module_id).cloned()
    }

    /// Snapshot of every module's status, ordered by module id.
    pub fn statuses(&self) -> Vec<ProcessStatus> {
        let mut all: Vec<ProcessStatus> = self.inner.statuses.read().values().cloned().collect();
        all.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        all
    }

    /// Starts a module's worker process.
    ///
    /// No-op (success) when already `Starting`/`Started`; rejected when the
    /// module is `NotAvailable` or mid-stop. A refused OS spawn leaves the
    /// module `Stopped` and returns [`Error::LaunchFailure`].
    pub async fn start(&self, module_id: &str) -> Result<()> {
        let descriptor = self
            .inner
            .descriptors
            .read()
            .get(module_id)
            .cloned()
            .ok_or_else(|| Error::ModuleNotFound(module_id.to_string()))?;

        let Some(launch) = descriptor.launch.clone() else {
            return Err(Error::Config(format!(
                "module '{module_id}' has no launch settings"
            )));
        };

        // Gate and claim in one critical section so two concurrent starts
        // cannot both spawn.
        enum Claim {
            Claimed,
            AlreadyRunning,
            Blocked(ModuleState),
        }
        let mut claim = Claim::AlreadyRunning;
        let known = self.with_status(module_id, |status| {
            claim = match status.state {
                ModuleState::Starting | ModuleState::Started => Claim::AlreadyRunning,
                state if !state.is_startable() => Claim::Blocked(state),
                _ => {
                    status.state = ModuleState::Starting;
                    Claim::Claimed
                }
            };
        });
        if !known {
            return Err(Error::ModuleNotFound(module_id.to_string()));
        }
        match claim {
            Claim::AlreadyRunning => return Ok(()),
            Claim::Blocked(state) => {
                return Err(Error::ModuleNotStartable {
                    module: module_id.to_string(),
                    state,
                })
            }
            Claim::Claimed => {}
        }

        let mut command = Command::new(&launch.command);
        command
            .args(&launch.args)
            .envs(self.build_environment(&descriptor, &launch))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &launch.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(%module_id, command = %launch.command, error = %e, "Unable to start module");
                self.with_status(module_id, |status| {
                    status.state = ModuleState::Stopped;
                    status.pid = None;
                });
                return Err(Error::LaunchFailure {
                    module: module_id.to_string(),
                    source: e,
                });
            }
        };

        let pid = child.id();
        pump_output(module_id, &mut child);

        self.with_status(module_id, |status| {
            status.pid = pid;
            status.started_at = Some(Utc::now());
            status.last_exit_code = None;
            status.restarts_exhausted = false;
        });

        let handle = ProcessHandle {
            pid,
            child: Arc::new(Mutex::new(Some(child))),
            stop_requested: Arc::new(AtomicBool::new(false)),
        };
        self.inner
            .processes
            .lock()
            .await
            .insert(module_id.to_string(), handle.clone());

        info!(%module_id, ?pid, "Module process spawned");

        let post_start_pause = Duration::from_secs(
            launch
                .post_start_pause_secs
                .unwrap_or(self.inner.config.launch.post_start_pause_secs),
        );
        let supervisor = self.clone();
        let watched = module_id.to_string();
        tokio::spawn(async move {
            supervisor.watch_process(watched, handle, post_start_pause).await;
        });

        Ok(())
    }

    /// Stops a module's worker process.
    ///
    /// Posts a best-effort `quit` command onto the module's queue, requests
    /// graceful termination (SIGTERM on unix), waits up to `grace`, then
    /// force-kills. Success when the module is not running at all.
    pub async fn stop(&self, module_id: &str, grace: Duration) -> Result<()> {
        if !self.inner.statuses.read().contains_key(module_id) {
            return Err(Error::ModuleNotFound(module_id.to_string()));
        }

        let handle = self.inner.processes.lock().await.get(module_id).cloned();
        let Some(handle) = handle else {
            // A crashed module may have a restart pending; an explicit stop
            // parks it instead (the watcher re-checks the state).
            self.with_status(module_id, |status| {
                if status.state == ModuleState::Crashed {
                    status.state = ModuleState::Stopped;
                }
            });
            debug!(%module_id, "Not in the process list, nothing to stop");
            return Ok(());
        };

        handle.stop_requested.store(true, Ordering::SeqCst);
        self.transition(module_id, ModuleState::Stopping);
        self.post_quit(module_id);

        info!(%module_id, pid = ?handle.pid, "Requesting module shutdown");
        request_termination(&handle).await;

        let deadline = Instant::now() + grace;
        let mut last_exit_code = None;
        let exited = loop {
            {
                let mut guard = handle.child.lock().await;
                match guard.as_mut() {
                    // Watcher already reaped the child.
                    None => break true,
                    Some(child) => {
                        if let Ok(Some(exit)) = child.try_wait() {
                            last_exit_code = exit.code();
                            guard.take();
                            break true;
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                break false;
            }
            sleep(EXIT_POLL_INTERVAL).await;
        };

        if !exited {
            warn!(%module_id, "Module did not terminate gracefully, forcing kill");
            let mut guard = handle.child.lock().await;
            if let Some(mut child) = guard.take() {
                if let Err(e) = child.kill().await {
                    warn!(%module_id, error = %e, "Error force-killing module");
                }
            }
        }

        self.remove_process_entry(module_id, &handle).await;
        self.with_status(module_id, |status| {
            status.state = ModuleState::Stopped;
            status.pid = None;
            if let Some(code) = last_exit_code {
                status.last_exit_code = Some(code);
            }
        });

        info!(%module_id, "Module stopped");
        Ok(())
    }

    /// Stops and then starts a module; used when configuration changes need
    /// a live module to pick up new settings.
    pub async fn restart(&self, module_id: &str, grace: Duration) -> Result<()> {
        self.stop(module_id, grace).await?;
        self.start(module_id).await
    }

    /// Stops every running module concurrently.
    pub async fn stop_all(&self, grace: Duration) {
        let module_ids: Vec<String> = {
            let processes = self.inner.processes.lock().await;
            processes.keys().cloned().collect()
        };
        if module_ids.is_empty() {
            return;
        }

        info!(count = module_ids.len(), "Stopping all module processes");
        let stops = module_ids.into_iter().map(|module_id| {
            let supervisor = self.clone();
            async move {
                if let Err(e) = supervisor.stop(&module_id, grace).await {
                    warn!(%module_id, error = %e, "Error stopping module");
                }
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Records that a worker for this module polled or posted just now.
    ///
    /// The first poll confirms liveness, promoting the module to `Started`
    /// - including modules launched externally (e.g. under a debugger).
    pub fn worker_seen(&self, module_id: &str) -> bool {
        self.with_status(module_id, |status| {
            if !matches!(status.state, ModuleState::Stopping | ModuleState::Started) {
                status.state = ModuleState::Started;
            }
            if status.started_at.is_none() {
                status.started_at = Some(Utc::now());
            }
            status.last_seen = Some(Utc::now());
        })
    }

    /// Bumps the module's processed-request counter.
    pub fn record_result(&self, module_id: &str) -> bool {
        self.with_status(module_id, |status| {
            status.request_count += 1;
        })
    }

    /// Replaces the free-form status bag a worker reported.
    pub fn update_status_data(
        &self,
        module_id: &str,
        status_data: serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        self.with_status(module_id, |status| {
            status.status_data = status_data;
        })
    }

    /// Stores the execution provider / GPU hints a worker passed on its
    /// poll. First writer wins; the values are never interpreted here.
    pub fn note_inference_device(
        &self,
        module_id: &str,
        execution_provider: &str,
        can_use_gpu: Option<bool>,
    ) -> bool {
        self.with_status(module_id, |status| {
            status
                .status_data
                .entry("executionProvider".to_string())
                .or_insert_with(|| execution_provider.into());
            if let Some(gpu) = can_use_gpu {
                status
                    .status_data
                    .entry("canUseGPU".to_string())
                    .or_insert_with(|| gpu.into());
            }
        })
    }

    /// Watches a spawned process until it exits.
    ///
    /// Promotes `Starting`→`Started` once the post-start pause elapses with
    /// the process still alive. An exit without a stop request transitions
    /// to `Crashed` and schedules a backed-off restart until retries are
    /// exhausted.
    async fn watch_process(
        &self,
        module_id: String,
        handle: ProcessHandle,
        post_start_pause: Duration,
    ) {
        let spawned = Instant::now();
        let mut promoted = false;

        let exit_code = loop {
            sleep(EXIT_POLL_INTERVAL).await;

            {
                let mut guard = handle.child.lock().await;
                match guard.as_mut() {
                    // stop() took ownership and reaped the child.
                    None => return,
                    Some(child) => match child.try_wait() {
                        Ok(Some(exit)) => {
                            guard.take();
                            break exit.code();
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(%module_id, error = %e, "Error polling module process");
                        }
                    },
                }
            }

            if !promoted && spawned.elapsed() >= post_start_pause {
                promoted = true;
                self.with_status(&module_id, |status| {
                    if status.state == ModuleState::Starting {
                        status.state = ModuleState::Started;
                    }
                });
            }
        };

        self.remove_process_entry(&module_id, &handle).await;

        if handle.stop_requested.load(Ordering::SeqCst) {
            self.with_status(&module_id, |status| {
                status.state = ModuleState::Stopped;
                status.pid = None;
                status.last_exit_code = exit_code;
            });
            return;
        }

        // Unexpected exit: crash bookkeeping + bounded auto-restart.
        let mut attempt = 0;
        self.with_status(&module_id, |status| {
            status.state = ModuleState::Crashed;
            status.pid = None;
            status.last_exit_code = exit_code;
            status.restart_count += 1;
            attempt = status.restart_count;
        });
        error!(%module_id, ?exit_code, attempt, "Module process exited unexpectedly");

        if self.inner.shutdown.is_cancelled() {
            self.with_status(&module_id, |status| {
                status.state = ModuleState::Stopped;
            });
            return;
        }

        match self.inner.backoff.delay_for_attempt(attempt.saturating_sub(1)) {
            Some(delay) => {
                warn!(%module_id, attempt, ?delay, "Scheduling module restart");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.inner.shutdown.cancelled() => return,
                }
                // An explicit stop during the back-off parks the module.
                if self.state(&module_id) != Some(ModuleState::Crashed) {
                    return;
                }
                // Box the recursive call as an explicit `Send` future to
                // break the auto-trait inference cycle between `start` and
                // `watch_process` (each awaits/spawns the other). The
                // coercion lives in a submodule so it is outside `start`'s
                // opaque-type defining scope.
                if let Err(e) = recursion::boxed_start(self, &module_id).await {
                    error!(%module_id, error = %e, "Module restart failed");
                }
            }
            None => {
                self.with_status(&module_id, |status| {
                    status.state = ModuleState::Stopped;
                    status.restarts_exhausted = true;
                });
                error!(
                    %module_id,
                    restarts = attempt,
                    "Module is crash-looping; auto-restart suspended until an explicit start"
                );
            }
        }
    }

    /// Builds the environment injected into a worker process: the server's
    /// global pairs first (they win), then the standard worker variables.
    fn build_environment(
        &self,
        descriptor: &ModuleDescriptor,
        launch: &ModuleLaunch,
    ) -> HashMap<String, String> {
        let config = &self.inner.config;
        let mut env: HashMap<String, String> = config
            .environment
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v.clone()))
            .collect();

        let port = config
            .bind_address
            .rsplit(':')
            .next()
            .unwrap_or("32168")
            .to_string();

        env.entry("PORT".into()).or_insert(port);
        env.entry("MODULE_ID".into())
            .or_insert_with(|| descriptor.module_id.clone());
        env.entry("MODULE_QUEUE".into())
            .or_insert_with(|| descriptor.queue_name());
        env.entry("MODULE_TASKS".into())
            .or_insert_with(|| launch.parallelism.unwrap_or(0).to_string());
        env.entry("MODULE_ENABLE_GPU".into())
            .or_insert_with(|| launch.enable_gpu.to_string());
        env.entry("MODULE_SERVER_LAUNCHED".into())
            .or_insert_with(|| "true".into());
        if let Some(mb) = launch.required_mb {
            env.entry("MODULE_REQUIRED_MB".into())
                .or_insert_with(|| mb.to_string());
        }

        env
    }

    /// Fire-and-forget `quit` command onto the module's queue, giving a
    /// polling worker the chance to wrap up before signals arrive.
    fn post_quit(&self, module_id: &str) {
        let Some(queue) = self
            .inner
            .statuses
            .read()
            .get(module_id)
            .map(|s| s.queue.clone())
        else {
            return;
        };

        let mut payload = RequestPayload::new("quit");
        payload.set_value("moduleId", module_id);
        let request = QueuedRequest::new("quit", payload);

        let broker = self.inner.broker.clone();
        let module_id = module_id.to_string();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            if let Err(e) = broker
                .enqueue(&queue, request, Duration::from_secs(1), &cancel)
                .await
            {
                debug!(%module_id, error = %e, "Quit command not acknowledged");
            }
        });
    }

    fn transition(&self, module_id: &str, state: ModuleState) {
        self.with_status(module_id, |status| {
            status.state = state;
        });
    }

    fn with_status<F: FnOnce(&mut ProcessStatus)>(&self, module_id: &str, f: F) -> bool {
        let mut statuses = self.inner.statuses.write();
        match statuses.get_mut(module_id) {
            Some(status) => {
                f(status);
                true
            }
            None => false,
        }
    }

    /// Removes the process-table entry iff it still refers to this handle;
    /// a restart may already have installed a fresh one.
    async fn remove_process_entry(&self, module_id: &str, handle: &ProcessHandle) {
        let mut processes = self.inner.processes.lock().await;
        if let Some(current) = processes.get(module_id) {
            if Arc::ptr_eq(&current.child, &handle.child) {
                processes.remove(module_id);
            }
        }
    }
}

/// Boxes the mutually-recursive `ModuleSupervisor::start` future as an
/// explicit `Send` trait object. Kept in its own submodule so the coercion
/// happens outside `start`'s opaque-type defining scope, breaking the
/// `start` ⇄ `watch_process` auto-trait inference cycle.
mod recursion {
    use super::*;

    pub(super) fn boxed_start<'a>(
        supervisor: &'a ModuleSupervisor,
        module_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(supervisor.start(module_id))
    }
}

/// Asks the process to terminate gracefully: SIGTERM where available,
/// otherwise the kill signal starts the shutdown.
async fn request_termination(handle: &ProcessHandle) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = handle.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            return;
        }
    }

    let mut guard = handle.child.lock().await;
    if let Some(child) = guard.as_mut() {
        let _ = child.start_kill();
    }
}

/// Forwards the worker's stdout/stderr into the server log, line by line.
fn pump_output(module_id: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let module_id = module_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(module = %module_id, "{line}");
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let module_id = module_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(module = %module_id, "{line}");
            }
        });
    }
}
