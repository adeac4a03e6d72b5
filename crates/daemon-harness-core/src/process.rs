use crate::config::ProcessConfig;
use crate::output::OutputLines;
use crate::readiness::with_deadline;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a process ended
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process exited on its own and reported an exit code
    Exited(std::process::ExitStatus),
    /// Process was ended by a signal
    Terminated,
}

impl ProcessStatus {
    pub fn success(&self) -> bool {
        matches!(self, ProcessStatus::Exited(status) if status.success())
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Core trait for process lifecycle management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a new process from `config` with stdout and stderr captured
    ///
    /// The returned handle exposes both streams merged into one line stream
    /// through [`ProcessHandle::take_output`].
    async fn spawn_process(
        &self,
        config: &ProcessConfig,
        working_dir: Option<&Path>,
    ) -> Result<Box<dyn ProcessHandle>, std::io::Error>;

    /// Wait for a process to exit, giving up once `timeout` elapses
    async fn wait_for_exit(
        &self,
        handle: &mut dyn ProcessHandle,
        timeout: Option<Duration>,
    ) -> Result<ProcessStatus> {
        match with_deadline(timeout, handle.wait()).await {
            Some(status) => status,
            None => Err(anyhow!(
                "did not exit within {}ms",
                timeout.map(|t| t.as_millis()).unwrap_or_default()
            )),
        }
    }
}

/// Trait for comprehensive process termination including process trees
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Terminate a single process gracefully (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a single process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all child processes of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Terminate an entire process tree (parent and all descendants)
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;

    /// Terminate the process group led by `handle`, escalating to a kill after a grace period
    async fn terminate_process_group(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Complete termination strategy: process group -> process tree -> individual process
    async fn terminate_completely(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        if let Some(pid) = handle.get_pid() {
            if let TerminationResult::Success = self.terminate_process_group(handle).await {
                return TerminationResult::Success;
            }

            if let TerminationResult::Success = self.terminate_process_tree(pid).await {
                return TerminationResult::Success;
            }
        }

        match self.terminate_gracefully(handle).await {
            TerminationResult::Success => {
                tokio::time::sleep(Duration::from_millis(1000)).await;

                if handle.is_running().await {
                    self.force_kill(handle).await
                } else {
                    TerminationResult::Success
                }
            }
            TerminationResult::ProcessNotFound => TerminationResult::Success,
            _ => self.force_kill(handle).await,
        }
    }
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has exited)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Take the merged stdout/stderr line stream; `None` once taken
    fn take_output(&mut self) -> Option<OutputLines>;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Kill the process (platform-specific implementation)
    async fn kill(&mut self) -> Result<()>;
}

/// High-level process manager trait that combines lifecycle and termination
#[async_trait]
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
