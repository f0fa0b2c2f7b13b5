//! Supervisor lifecycle tests
//!
//! Drives real worker processes (/bin/sh scripts) through the state
//! machine: launch, liveness promotion, crash detection with bounded
//! auto-restart, graceful stop with force-kill, and environment injection.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use modserve_core::broker::QueueBroker;
use modserve_core::registry::{ModuleDescriptor, ModuleLaunch};
use modserve_core::supervisor::{ModuleState, ModuleSupervisor, ProcessStatus};
use modserve_core::{Error, ServerConfig};

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.launch.post_start_pause_secs = 0;
    config.launch.stop_grace_period_secs = 2;
    config.launch.max_restarts = 1;
    config.launch.restart_backoff_base_ms = 50;
    config.launch.restart_backoff_max_secs = 1;
    config
}

fn build_supervisor(config: ServerConfig) -> (ModuleSupervisor, Arc<QueueBroker>, CancellationToken) {
    let config = Arc::new(config);
    let broker = Arc::new(QueueBroker::new(config.queue.clone()));
    let shutdown = CancellationToken::new();
    let supervisor =
        ModuleSupervisor::with_platform(config, broker.clone(), "linux", shutdown.clone());
    (supervisor, broker, shutdown)
}

fn sh_module(module_id: &str, script: &str) -> ModuleDescriptor {
    ModuleDescriptor {
        module_id: module_id.into(),
        auto_start: true,
        platforms: vec!["all".into()],
        launch: Some(ModuleLaunch {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            ..ModuleLaunch::default()
        }),
        ..ModuleDescriptor::default()
    }
}

/// Polls the module's status until the predicate holds or the deadline
/// passes; panics with the last snapshot on expiry.
async fn wait_for(
    supervisor: &ModuleSupervisor,
    module_id: &str,
    what: &str,
    timeout: Duration,
    predicate: impl Fn(&ProcessStatus) -> bool,
) -> ProcessStatus {
    let deadline = Instant::now() + timeout;
    loop {
        let status = supervisor
            .status(module_id)
            .expect("module should be registered");
        if predicate(&status) {
            return status;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}; last status: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Scenario: unsupported platform means NotAvailable, and a start attempt
/// is rejected without spawning anything.
#[tokio::test]
async fn unavailable_module_is_rejected_without_spawning() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    let mut module = sh_module("winonly", "sleep 30");
    module.platforms = vec!["windows".into()];
    supervisor.register(&module);

    assert_eq!(supervisor.state("winonly"), Some(ModuleState::NotAvailable));

    let err = supervisor.start("winonly").await.unwrap_err();
    assert!(matches!(
        err,
        Error::ModuleNotStartable {
            state: ModuleState::NotAvailable,
            ..
        }
    ));

    let status = supervisor.status("winonly").unwrap();
    assert_eq!(status.pid, None);
    assert_eq!(status.started_at, None);
}

/// A refused spawn is a LaunchFailure and leaves the module Stopped.
#[tokio::test]
async fn launch_failure_leaves_module_stopped() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    let mut module = sh_module("ghost", "true");
    module.launch.as_mut().unwrap().command = "/nonexistent/worker-binary".into();
    supervisor.register(&module);

    let err = supervisor.start("ghost").await.unwrap_err();
    assert!(matches!(err, Error::LaunchFailure { .. }));
    assert_eq!(supervisor.state("ghost"), Some(ModuleState::Stopped));
}

/// Starting an already-running module is a successful no-op.
#[tokio::test]
async fn start_is_idempotent_while_running() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    supervisor.register(&sh_module("steady", "sleep 30"));
    supervisor.start("steady").await.unwrap();

    let status = wait_for(&supervisor, "steady", "launch", Duration::from_secs(5), |s| {
        s.state.is_running()
    })
    .await;
    let pid = status.pid.expect("running module should have a pid");

    supervisor.start("steady").await.unwrap();
    assert_eq!(supervisor.status("steady").unwrap().pid, Some(pid), "no second spawn");

    supervisor.stop("steady", Duration::from_secs(2)).await.unwrap();
}

/// Scenario: a crashing worker transitions to Crashed, restarts with
/// back-off, and is parked Stopped once retries are exhausted.
#[tokio::test]
async fn crash_increments_restart_count_and_backs_off() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    supervisor.register(&sh_module("flaky", "exit 3"));
    supervisor.start("flaky").await.unwrap();

    // max_restarts = 1: initial crash restarts once, the second crash parks
    // the module.
    let status = wait_for(
        &supervisor,
        "flaky",
        "crash-loop parking",
        Duration::from_secs(10),
        |s| s.state == ModuleState::Stopped && s.restarts_exhausted,
    )
    .await;

    assert!(status.restart_count >= 2);
    assert_eq!(status.last_exit_code, Some(3));
    assert_eq!(status.pid, None);

    // An explicit start clears the parked flag and tries again.
    supervisor.start("flaky").await.unwrap();
    let status = wait_for(
        &supervisor,
        "flaky",
        "crash after explicit start",
        Duration::from_secs(5),
        |s| s.state == ModuleState::Crashed || s.restarts_exhausted,
    )
    .await;
    assert!(status.restart_count >= 3);
}

/// Scenario: a worker that ignores graceful shutdown is force-killed at
/// roughly the grace period and ends up Stopped.
#[tokio::test]
async fn stubborn_worker_is_force_killed_after_grace() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    supervisor.register(&sh_module("stubborn", "trap '' TERM; sleep 30"));
    supervisor.start("stubborn").await.unwrap();
    wait_for(&supervisor, "stubborn", "launch", Duration::from_secs(5), |s| {
        s.state.is_running()
    })
    .await;

    let started = Instant::now();
    supervisor
        .stop("stubborn", Duration::from_secs(2))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "grace period honoured: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "force-kill happened promptly: {elapsed:?}");
    assert_eq!(supervisor.state("stubborn"), Some(ModuleState::Stopped));
}

/// A cooperative worker exits within the grace period without being killed,
/// and the controlled exit is not booked as a crash.
#[tokio::test]
async fn graceful_stop_is_not_a_crash() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    supervisor.register(&sh_module("polite", "sleep 30"));
    supervisor.start("polite").await.unwrap();
    wait_for(&supervisor, "polite", "launch", Duration::from_secs(5), |s| {
        s.state.is_running()
    })
    .await;

    let started = Instant::now();
    supervisor.stop("polite", Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2), "SIGTERM should end sh quickly");

    // Give the watcher a beat; the stop must not be reinterpreted.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = supervisor.status("polite").unwrap();
    assert_eq!(status.state, ModuleState::Stopped);
    assert_eq!(status.restart_count, 0);
}

/// Stopping a module with no process is a successful no-op.
#[tokio::test]
async fn stop_without_process_succeeds() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    let mut module = sh_module("idle", "sleep 30");
    module.auto_start = false;
    supervisor.register(&module);

    supervisor.stop("idle", Duration::from_secs(1)).await.unwrap();
    assert_eq!(supervisor.state("idle"), Some(ModuleState::NotEnabled));
}

/// The first worker poll confirms liveness, including for workers the
/// supervisor did not launch itself.
#[tokio::test]
async fn worker_poll_promotes_to_started() {
    let (supervisor, _broker, _shutdown) = build_supervisor(test_config());

    let mut module = sh_module("external", "sleep 30");
    module.auto_start = false;
    supervisor.register(&module);
    assert_eq!(supervisor.state("external"), Some(ModuleState::NotEnabled));

    assert!(supervisor.worker_seen("external"));
    let status = supervisor.status("external").unwrap();
    assert_eq!(status.state, ModuleState::Started);
    assert!(status.last_seen.is_some());

    assert!(supervisor.record_result("external"));
    assert_eq!(supervisor.status("external").unwrap().request_count, 1);
}

/// The spawned process receives the documented environment, with global
/// config pairs taking precedence over the defaults.
#[tokio::test]
async fn worker_environment_is_injected() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.txt");

    let mut config = test_config();
    config.environment.insert("EXTRA_FLAG".into(), "42".into());

    let (supervisor, _broker, _shutdown) = build_supervisor(config);
    let script = format!(
        "printf '%s|%s|%s|%s' \"$MODULE_ID\" \"$MODULE_QUEUE\" \"$MODULE_SERVER_LAUNCHED\" \"$EXTRA_FLAG\" > {}; sleep 30",
        out.display()
    );
    supervisor.register(&sh_module("envcheck", &script));
    supervisor.start("envcheck").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let contents = loop {
        if let Ok(text) = std::fs::read_to_string(&out) {
            if !text.is_empty() {
                break text;
            }
        }
        assert!(Instant::now() < deadline, "worker never wrote its environment");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(contents, "envcheck|envcheck_queue|true|42");
    supervisor.stop("envcheck", Duration::from_secs(2)).await.unwrap();
}

/// stop() offers a quit command through the module's queue before
/// signalling, so a polling worker can wrap up cleanly.
#[tokio::test]
async fn stop_posts_a_quit_command() {
    let (supervisor, broker, _shutdown) = build_supervisor(test_config());

    supervisor.register(&sh_module("quitter", "sleep 30"));
    supervisor.start("quitter").await.unwrap();
    wait_for(&supervisor, "quitter", "launch", Duration::from_secs(5), |s| {
        s.state.is_running()
    })
    .await;

    let poll_broker = broker.clone();
    let poller = tokio::spawn(async move {
        poll_broker
            .dequeue("quitter_queue", Duration::from_secs(3), &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.stop("quitter", Duration::from_secs(2)).await.unwrap();

    let polled = poller.await.unwrap().unwrap();
    let quit = polled.expect("the quit command should reach a polling worker");
    assert_eq!(quit.reqtype, "quit");
    assert_eq!(quit.payload.get_value("moduleId"), Some("quitter"));
}
