use crate::config::{ProcessConfig, SupervisionConfig};
use crate::coordinator::Supervised;
use crate::error::{HarnessError, ReadinessError};
use crate::process::{ProcessHandle, ProcessId, ProcessManager, TerminationResult};
use crate::readiness::{MarkerMatcher, wait_for_markers};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Hooks a concrete daemon supplies to [`Daemon`]
#[async_trait]
pub trait DaemonProcess: Send + Sync {
    /// Launch description for this daemon, given its data directory
    fn create_process_config(&self, data_dir: &Path) -> anyhow::Result<ProcessConfig>;

    /// Substrings that must all appear in the combined output before the daemon counts as ready
    fn startup_log_markers(&self) -> HashSet<String>;

    /// Ask the daemon to exit; must not wait for the exit itself
    async fn invoke_stop_rpc_call(&self, ctx: &StopContext) -> anyhow::Result<()>;
}

/// What a stop hook gets to know about the running process
#[derive(Debug, Clone)]
pub struct StopContext {
    pub pid: Option<ProcessId>,
    pub command: String,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Drives one [`DaemonProcess`] through a single process lifetime
///
/// Owns the data directory and the OS process handle. The handle is present only
/// between a successful `start` and a completed `shutdown`.
pub struct Daemon<D> {
    daemon: D,
    data_dir: PathBuf,
    process_manager: Arc<dyn ProcessManager>,
    config: SupervisionConfig,
    process: Option<Box<dyn ProcessHandle>>,
    command: Option<String>,
    state: DaemonState,
    cancellation_token: CancellationToken,
}

impl<D: DaemonProcess> Daemon<D> {
    pub fn new(
        daemon: D,
        data_dir: impl Into<PathBuf>,
        process_manager: Arc<dyn ProcessManager>,
    ) -> Self {
        Self {
            daemon,
            data_dir: data_dir.into(),
            process_manager,
            config: SupervisionConfig::default(),
            process: None,
            command: None,
            state: DaemonState::NotStarted,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: SupervisionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a caller-owned token, e.g. a child of a harness-wide token
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.process.as_ref().and_then(|p| p.get_pid())
    }

    /// Triggering it interrupts a pending readiness scan or exit wait
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Launch the daemon and wait until every startup marker was seen
    pub async fn start(&mut self) -> Result<(), HarnessError> {
        if self.state != DaemonState::NotStarted {
            return Err(HarnessError::InvalidState(format!(
                "cannot start {} in state {:?}",
                self.label(),
                self.state
            )));
        }
        self.config
            .validate()
            .map_err(|e| HarnessError::ConfigurationError(e.to_string()))?;

        self.state = DaemonState::Starting;
        match self.launch().await {
            Ok(handle) => {
                info!("{} is ready (PID: {:?})", self.label(), handle.get_pid());
                self.process = Some(handle);
                self.state = DaemonState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = DaemonState::Failed;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<Box<dyn ProcessHandle>, HarnessError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", self.data_dir.display()))
            .map_err(|e| HarnessError::startup_failure(None, e))?;

        let process_config = self
            .daemon
            .create_process_config(&self.data_dir)
            .map_err(|e| HarnessError::startup_failure(None, e))?;
        let command = process_config.display_command();
        self.command = Some(command.clone());

        info!("Starting {command}");
        let mut handle = self
            .process_manager
            .spawn_process(&process_config, Some(&self.data_dir))
            .await
            .map_err(|e| HarnessError::startup_failure(Some(&command), e))?;

        let readiness = match handle.take_output() {
            Some(mut lines) => {
                let mut matcher = MarkerMatcher::new(self.daemon.startup_log_markers());
                wait_for_markers(
                    &mut lines,
                    &mut matcher,
                    self.config.startup_timeout(),
                    &self.cancellation_token,
                )
                .await
            }
            None => Err(ReadinessError::StreamClosed {
                missing: sorted(self.daemon.startup_log_markers()),
            }),
        };

        if let Err(cause) = readiness {
            warn!("{command} did not become ready: {cause}");
            self.discard(handle.as_mut()).await;
            return Err(HarnessError::startup_failure(Some(&command), cause));
        }

        Ok(handle)
    }

    /// Send the stop request and wait for the process to exit
    pub async fn shutdown(&mut self) -> Result<(), HarnessError> {
        if self.state != DaemonState::Running {
            return Err(HarnessError::InvalidState(format!(
                "cannot shut down {} in state {:?}",
                self.label(),
                self.state
            )));
        }
        let label = self.label();
        let Some(handle) = self.process.as_mut() else {
            return Err(HarnessError::InvalidState(format!(
                "{label} is running without a process handle"
            )));
        };

        let ctx = StopContext {
            pid: handle.get_pid(),
            command: label.clone(),
            data_dir: self.data_dir.clone(),
        };
        info!("Stopping {label}");
        self.daemon
            .invoke_stop_rpc_call(&ctx)
            .await
            .map_err(|e| HarnessError::stop_request_failed(Some(&label), e))?;

        self.state = DaemonState::Stopping;
        let timeout = self.config.shutdown_timeout();
        let waited = tokio::select! {
            biased;
            result = self.process_manager.wait_for_exit(handle.as_mut(), timeout) => result,
            _ = self.cancellation_token.cancelled() => Err(anyhow!("interrupted while waiting for exit")),
        };

        match waited {
            Ok(status) => {
                if status.success() {
                    info!("{label} exited cleanly");
                } else {
                    warn!("{label} exited with {status:?}");
                }
                self.process = None;
                self.state = DaemonState::Stopped;
                Ok(())
            }
            Err(cause) => {
                if self.config.force_kill_on_timeout {
                    if let Some(mut handle) = self.process.take() {
                        self.discard(handle.as_mut()).await;
                    }
                    self.state = DaemonState::Stopped;
                } else {
                    self.state = DaemonState::Running;
                }
                Err(HarnessError::shutdown_failure(Some(&label), cause))
            }
        }
    }

    async fn discard(&self, handle: &mut dyn ProcessHandle) {
        match self.process_manager.terminate_completely(handle).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            other => warn!("Failed to terminate {}: {other:?}", self.label()),
        }
        // Reap so the PID does not linger as a zombie
        if let Err(e) = self
            .process_manager
            .wait_for_exit(handle, Some(REAP_TIMEOUT))
            .await
        {
            warn!("{} was not reaped after termination: {e}", self.label());
        }
    }

    fn label(&self) -> String {
        self.command
            .clone()
            .unwrap_or_else(|| crate::error::UNKNOWN_PROCESS.to_string())
    }
}

#[async_trait]
impl<D: DaemonProcess> Supervised for Daemon<D> {
    fn name(&self) -> String {
        self.label()
    }

    async fn start(&mut self) -> Result<(), HarnessError> {
        Daemon::start(self).await
    }

    async fn shutdown(&mut self) -> Result<(), HarnessError> {
        Daemon::shutdown(self).await
    }
}

fn sorted(markers: HashSet<String>) -> Vec<String> {
    let mut markers: Vec<String> = markers.into_iter().collect();
    markers.sort();
    markers
}
