#![cfg(unix)]

use daemon_harness::{
    ConfiguredDaemon, DaemonSpec, DaemonState, HarnessConfig, PlatformProcessManagerFactory,
    ReadinessError, StopStrategy, SupervisionConfig, start_until_interrupted, supervise,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .try_init();
}

/// A shell daemon that journals start/stop to `log`, prints one marker on
/// stdout and one on stderr, and exits cleanly on SIGTERM
fn sh_daemon(name: &str, log: &Path, data_dir: &Path) -> DaemonSpec {
    let log = log.display();
    let script = format!(
        "echo 'start {name}' >> {log}; \
         trap \"echo 'stop {name}' >> {log}; exit 0\" TERM; \
         touch started.flag; \
         echo $$ > pid; \
         echo '{name} opening wallet'; \
         echo '{name} rpc listening' >&2; \
         while :; do sleep 0.1; done"
    );
    DaemonSpec {
        name: name.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        env: HashMap::new(),
        data_dir: data_dir.to_path_buf(),
        ready_markers: vec![format!("{name} opening"), format!("{name} rpc listening")],
        stop: StopStrategy::Terminate,
        supervision: None,
    }
}

fn journal(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn pid_in(data_dir: &Path) -> i32 {
    std::fs::read_to_string(data_dir.join("pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

fn is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn harness(daemons: Vec<DaemonSpec>, supervision: SupervisionConfig) -> HarnessConfig {
    HarnessConfig {
        name: "regtest".to_string(),
        supervision,
        rollback_on_failure: true,
        daemons,
    }
}

#[tokio::test]
async fn test_daemons_start_in_order_and_stop_in_reverse() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let log = root.path().join("order.log");
    let config = harness(
        vec![
            sh_daemon("seednode", &log, &root.path().join("seednode")),
            sh_daemon("alice", &log, &root.path().join("alice")),
        ],
        SupervisionConfig::new()
            .with_startup_timeout(Duration::from_secs(10))
            .with_shutdown_timeout(Duration::from_secs(10)),
    );

    let mut coordinator = config
        .into_coordinator(
            PlatformProcessManagerFactory::create_process_manager(),
            &CancellationToken::new(),
        )
        .unwrap();

    coordinator.start().await.unwrap();
    // Working directory is the data directory
    assert!(root.path().join("seednode/started.flag").exists());
    assert!(root.path().join("alice/started.flag").exists());

    coordinator.shutdown().await.unwrap();
    assert_eq!(
        journal(&log),
        vec!["start seednode", "start alice", "stop alice", "stop seednode"]
    );

    // Data directories are left for inspection
    assert!(root.path().join("seednode").is_dir());
    assert!(root.path().join("alice").is_dir());
}

#[tokio::test]
async fn test_early_exit_fails_startup_and_rolls_back() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let log = root.path().join("order.log");
    let broken = DaemonSpec {
        name: "broken".to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "echo 'config file missing' >&2; exit 1".to_string()],
        env: HashMap::new(),
        data_dir: root.path().join("broken"),
        ready_markers: vec!["Done loading".to_string()],
        stop: StopStrategy::Terminate,
        supervision: None,
    };
    let config = harness(
        vec![sh_daemon("seednode", &log, &root.path().join("seednode")), broken],
        SupervisionConfig::new().with_startup_timeout(Duration::from_secs(10)),
    );

    let mut coordinator = config
        .into_coordinator(
            PlatformProcessManagerFactory::create_process_manager(),
            &CancellationToken::new(),
        )
        .unwrap();

    let err = coordinator.start().await.unwrap_err();
    assert!(err.is_startup_failure());
    assert!(err.process().unwrap().starts_with("sh -c"));
    assert_eq!(
        err.readiness_error(),
        Some(&ReadinessError::StreamClosed {
            missing: vec!["Done loading".to_string()]
        })
    );
    assert_eq!(journal(&log), vec!["start seednode", "stop seednode"]);
}

#[tokio::test]
async fn test_missing_executable_is_a_startup_failure() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let spec = DaemonSpec {
        name: "ghost".to_string(),
        command: "/nonexistent/ghostd".to_string(),
        args: vec!["-regtest".to_string()],
        env: HashMap::new(),
        data_dir: root.path().join("ghost"),
        ready_markers: vec!["ready".to_string()],
        stop: StopStrategy::Terminate,
        supervision: None,
    };

    let mut daemon = supervise(ConfiguredDaemon::new(spec), root.path().join("ghost"));
    let err = daemon.start().await.unwrap_err();

    assert!(err.is_startup_failure());
    assert_eq!(err.process(), Some("/nonexistent/ghostd -regtest"));
    assert_eq!(daemon.state(), DaemonState::Failed);
    // The data directory is created before the spawn attempt
    assert!(root.path().join("ghost").is_dir());
}

#[tokio::test]
async fn test_startup_timeout_kills_silent_daemon() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("silent");
    let spec = DaemonSpec {
        name: "silent".to_string(),
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "echo $$ > pid; echo 'warming up'; while :; do sleep 0.1; done".to_string(),
        ],
        env: HashMap::new(),
        data_dir: data_dir.clone(),
        ready_markers: vec!["Done loading".to_string()],
        stop: StopStrategy::Terminate,
        supervision: None,
    };

    let mut daemon = supervise(ConfiguredDaemon::new(spec), &data_dir).with_config(
        SupervisionConfig::new().with_startup_timeout(Duration::from_millis(500)),
    );
    let err = daemon.start().await.unwrap_err();

    assert!(matches!(
        err.readiness_error(),
        Some(ReadinessError::TimedOut { timeout_ms: 500, .. })
    ));
    assert_eq!(daemon.state(), DaemonState::Failed);

    let pid = pid_in(&data_dir);
    assert!(!is_alive(pid), "daemon {pid} should have been killed");
}

#[tokio::test]
async fn test_environment_is_added_with_data_dir_substitution() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("electrumx");
    let spec = DaemonSpec {
        name: "electrumx".to_string(),
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "echo \"db=$DB_DIRECTORY path=${PATH:+set}\"; while :; do sleep 0.1; done".to_string(),
        ],
        env: HashMap::from([("DB_DIRECTORY".to_string(), "{dataDir}/db".to_string())]),
        data_dir: data_dir.clone(),
        ready_markers: vec![format!("db={}/db path=set", data_dir.display())],
        stop: StopStrategy::Terminate,
        supervision: None,
    };

    let mut daemon = supervise(ConfiguredDaemon::new(spec), &data_dir)
        .with_config(SupervisionConfig::new().with_startup_timeout(Duration::from_secs(10)));
    daemon.start().await.unwrap();
    assert_eq!(daemon.state(), DaemonState::Running);

    daemon.shutdown().await.unwrap();
    assert_eq!(daemon.state(), DaemonState::Stopped);
}

#[tokio::test]
async fn test_failed_stop_command_leaves_daemon_running() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let log = root.path().join("order.log");
    let mut spec = sh_daemon("bitcoind", &log, &root.path().join("bitcoind"));
    spec.stop = StopStrategy::Command {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "echo 'error: no rpc credentials' >&2; exit 1".to_string()],
    };

    let mut daemon = supervise(ConfiguredDaemon::new(spec), root.path().join("bitcoind"))
        .with_config(SupervisionConfig::new().with_startup_timeout(Duration::from_secs(10)));
    daemon.start().await.unwrap();

    let err = daemon.shutdown().await.unwrap_err();
    assert!(!err.is_shutdown_failure());
    assert!(err.to_string().contains("no rpc credentials"));
    assert_eq!(daemon.state(), DaemonState::Running);
    assert!(daemon.pid().is_some());
}

#[tokio::test]
async fn test_stop_command_receives_data_dir() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("bitcoind");
    let spec = DaemonSpec {
        name: "bitcoind".to_string(),
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "echo 'init message: Done loading'; \
             while [ ! -f stop.request ]; do sleep 0.1; done; \
             echo 'Shutdown: done'"
                .to_string(),
        ],
        env: HashMap::new(),
        data_dir: data_dir.clone(),
        ready_markers: vec!["init message: Done loading".to_string()],
        stop: StopStrategy::Command {
            command: "touch".to_string(),
            args: vec!["{dataDir}/stop.request".to_string()],
        },
        supervision: None,
    };

    let mut daemon = supervise(ConfiguredDaemon::new(spec), &data_dir).with_config(
        SupervisionConfig::new()
            .with_startup_timeout(Duration::from_secs(10))
            .with_shutdown_timeout(Duration::from_secs(10)),
    );
    daemon.start().await.unwrap();
    daemon.shutdown().await.unwrap();

    assert!(data_dir.join("stop.request").exists());
    assert_eq!(daemon.state(), DaemonState::Stopped);
}

#[tokio::test]
async fn test_interrupt_during_startup_kills_daemon_ignoring_sigterm() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let log = root.path().join("order.log");
    let stubborn = DaemonSpec {
        name: "stubborn".to_string(),
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "trap '' TERM; echo $$ > pid; echo 'loading blocks'; while :; do sleep 0.1; done"
                .to_string(),
        ],
        env: HashMap::new(),
        data_dir: root.path().join("stubborn"),
        ready_markers: vec!["Done loading".to_string()],
        stop: StopStrategy::Terminate,
        supervision: None,
    };
    let config = harness(
        vec![sh_daemon("seednode", &log, &root.path().join("seednode")), stubborn],
        SupervisionConfig::new(),
    );

    let token = CancellationToken::new();
    let mut coordinator = config
        .into_coordinator(PlatformProcessManagerFactory::create_process_manager(), &token)
        .unwrap();

    let err = start_until_interrupted(
        &mut coordinator,
        &token,
        tokio::time::sleep(Duration::from_millis(500)),
    )
    .await
    .unwrap_err();

    assert!(err.is_startup_failure());
    assert_eq!(err.readiness_error(), Some(&ReadinessError::Interrupted));
    assert!(token.is_cancelled());

    // Both the half-started daemon and the rolled back one are gone on return
    let stubborn_pid = pid_in(&root.path().join("stubborn"));
    let seednode_pid = pid_in(&root.path().join("seednode"));
    assert!(!is_alive(stubborn_pid), "daemon {stubborn_pid} outlived the interrupt");
    assert!(!is_alive(seednode_pid), "daemon {seednode_pid} outlived the rollback");
    assert_eq!(journal(&log)[0], "start seednode");
}

#[tokio::test]
async fn test_start_until_interrupted_without_interrupt() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let log = root.path().join("order.log");
    let config = harness(
        vec![sh_daemon("seednode", &log, &root.path().join("seednode"))],
        SupervisionConfig::new().with_startup_timeout(Duration::from_secs(10)),
    );

    let token = CancellationToken::new();
    let mut coordinator = config
        .into_coordinator(PlatformProcessManagerFactory::create_process_manager(), &token)
        .unwrap();

    start_until_interrupted(&mut coordinator, &token, std::future::pending::<()>())
        .await
        .unwrap();
    assert!(!token.is_cancelled());

    coordinator.shutdown().await.unwrap();
    assert_eq!(journal(&log), vec!["start seednode", "stop seednode"]);
}
