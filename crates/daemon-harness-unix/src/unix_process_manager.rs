use anyhow::Result;
use async_trait::async_trait;
use daemon_harness_core::output::{OutputSource, output_channel, spawn_output_pump};
use daemon_harness_core::{
    OutputLines, ProcessConfig, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessStatus, ProcessTermination, TerminationResult,
};
use std::path::Path;
use std::time::Duration;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::Stdio;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    pub(crate) const GROUP_GRACE_PERIOD: Duration = Duration::from_secs(2);
    const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

    /// Send `signal` to a single process
    pub fn send_signal(pid: ProcessId, signal: Signal) -> Result<()> {
        signal::kill(NixPid::from_raw(pid.0 as i32), signal)
            .map_err(|e| anyhow::anyhow!("Failed to send {signal} to process {pid}: {e}"))
    }

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        command: String,
        output: Option<OutputLines>,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: String, output: Option<OutputLines>) -> Self {
            Self {
                child,
                command,
                output,
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn take_output(&mut self) -> Option<OutputLines> {
            self.output.take()
        }

        async fn is_running(&self) -> bool {
            if let Some(pid) = self.get_pid() {
                let nix_pid = NixPid::from_raw(pid.0 as i32);
                // Signal 0 only checks that the process exists
                signal::kill(nix_pid, None).is_ok()
            } else {
                debug!("Unix process handle has no PID - process has exited");
                false
            }
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
            Ok(self.child.try_wait()?.map(exit_status))
        }

        async fn wait(&mut self) -> Result<ProcessStatus> {
            let status = self.child.wait().await?;
            Ok(exit_status(status))
        }

        async fn kill(&mut self) -> Result<()> {
            self.child
                .kill()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
        }
    }

    impl Drop for UnixProcessHandle {
        fn drop(&mut self) {
            // Best-effort: a handle dropped while the child is alive would orphan the daemon
            if let Some(pid) = self.child.id() {
                warn!(
                    "Process handle for {} (PID: {pid}) dropped while running - sending SIGTERM",
                    self.command
                );
                if let Err(e) = signal::killpg(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("SIGTERM to process group {pid} during drop failed: {e}");
                }
            }
        }
    }

    /// Unix-specific process manager with comprehensive process tree management
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        async fn spawn_process(
            &self,
            config: &ProcessConfig,
            working_dir: Option<&Path>,
        ) -> Result<Box<dyn ProcessHandle>, std::io::Error> {
            let mut cmd = Command::new(&config.name);
            cmd.args(&config.args)
                .envs(&config.environment_vars)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

            // Create new process group for better process tree management
            cmd.process_group(0);

            let mut child = cmd.spawn()?;
            let label = config.display_command();

            if let Some(pid) = child.id() {
                info!("Spawned Unix process: {label} (PID: {pid})");
            }

            let (tx, output) = output_channel();
            if let Some(stdout) = child.stdout.take() {
                spawn_output_pump(stdout, OutputSource::Stdout, label.clone(), tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_output_pump(stderr, OutputSource::Stderr, label.clone(), tx);
            }

            Ok(Box::new(UnixProcessHandle::new(child, label, Some(output))))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            match handle.get_pid() {
                Some(pid) => signal_result(pid, Signal::SIGTERM),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            let result = signal_result(pid, Signal::SIGKILL);
            if result == TerminationResult::Success {
                // Reap the child so it does not linger as a zombie
                if let Err(e) = handle.kill().await {
                    warn!("Handle kill cleanup failed: {}", e);
                }
            }
            result
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self
                .system
                .lock()
                .map_err(|_| anyhow::anyhow!("Process table lock poisoned"))?;
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId::from).collect())
        }

        async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
            info!("Terminating process tree for root PID {root_pid}");

            let children = match self.find_child_processes(root_pid).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("Failed to find child processes for PID {root_pid}: {e}");
                    return TerminationResult::Failed(format!("Failed to enumerate children: {e}"));
                }
            };

            if !children.is_empty() {
                info!("Found {} child processes to terminate", children.len());

                // Grandchildren come first in the list, so children are terminated bottom-up
                for child_pid in &children {
                    match self.terminate_single_process(*child_pid).await {
                        TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                        result => {
                            warn!("Failed to terminate child process {child_pid}: {result:?}");
                        }
                    }
                }
            }

            self.terminate_single_process(root_pid).await
        }

        async fn terminate_process_group(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };
            let pgid = NixPid::from_raw(pid.0 as i32);

            match signal::killpg(pgid, Signal::SIGTERM) {
                Ok(()) => {
                    info!("Sent SIGTERM to process group {pid}");

                    if wait_for_group_exit(handle, pgid, GROUP_GRACE_PERIOD).await {
                        debug!("Process group {pid} exited after SIGTERM");
                        return TerminationResult::Success;
                    }

                    match signal::killpg(pgid, Signal::SIGKILL) {
                        Ok(()) => {
                            info!("Sent SIGKILL to process group {pid}");
                            TerminationResult::Success
                        }
                        Err(nix::errno::Errno::ESRCH) => TerminationResult::Success,
                        Err(e) => {
                            warn!("Failed to send SIGKILL to process group {pid}: {e}");
                            TerminationResult::Failed(format!(
                                "SIGKILL to process group failed: {e}"
                            ))
                        }
                    }
                }
                Err(nix::errno::Errno::ESRCH) => {
                    debug!("Process group {pid} not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to terminate process group {pid}");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process group {pid}: {e}");
                    TerminationResult::Failed(format!("SIGTERM to process group failed: {e}"))
                }
            }
        }
    }

    /// Poll until the group leader is reaped and no member is left, or `grace` elapses
    async fn wait_for_group_exit(
        handle: &mut dyn ProcessHandle,
        pgid: NixPid,
        grace: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            // An unreaped leader keeps the group alive as a zombie
            let leader_gone = !matches!(handle.try_wait().await, Ok(None));
            if leader_gone && signal::killpg(pgid, None) == Err(nix::errno::Errno::ESRCH) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }

    fn exit_status(status: std::process::ExitStatus) -> ProcessStatus {
        match status.code() {
            Some(_) => ProcessStatus::Exited(status),
            None => ProcessStatus::Terminated,
        }
    }

    impl UnixProcessManager {
        /// Terminate a single process by PID with escalation
        async fn terminate_single_process(&self, pid: ProcessId) -> TerminationResult {
            match signal_result(pid, Signal::SIGTERM) {
                TerminationResult::Success => {
                    tokio::time::sleep(Duration::from_millis(500)).await;

                    match signal_result(pid, Signal::SIGKILL) {
                        TerminationResult::ProcessNotFound => TerminationResult::Success,
                        other => other,
                    }
                }
                TerminationResult::ProcessNotFound => TerminationResult::Success,
                other => other,
            }
        }

        /// Recursively find all child processes, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    fn signal_result(pid: ProcessId, sig: Signal) -> TerminationResult {
        match signal::kill(NixPid::from_raw(pid.0 as i32), sig) {
            Ok(()) => {
                info!("Sent {sig} to process {pid}");
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!("Process {pid} not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!("Permission denied to signal process {pid}");
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send {sig} to process {pid}: {e}");
                TerminationResult::Failed(format!("{sig} failed: {e}"))
            }
        }
    }

    #[async_trait]
    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager with system monitoring");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager, send_signal};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;
