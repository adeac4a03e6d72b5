use daemon_harness_core::{Daemon, DaemonProcess, ProcessManager, ProcessManagerFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[cfg(not(unix))]
compile_error!("Unsupported platform: only Unix is currently supported");

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl PlatformProcessManagerFactory {
    pub fn create_process_manager() -> Arc<dyn ProcessManager> {
        info!("Creating {} process manager", Self::platform_name());
        Arc::new(daemon_harness_unix::UnixProcessManagerFactory::create_process_manager())
    }

    pub fn platform_name() -> &'static str {
        daemon_harness_unix::UnixProcessManagerFactory::platform_name()
    }
}

/// Wrap `daemon` in a driver backed by the platform process manager
pub fn supervise<D: DaemonProcess>(daemon: D, data_dir: impl Into<PathBuf>) -> Daemon<D> {
    Daemon::new(
        daemon,
        data_dir,
        PlatformProcessManagerFactory::create_process_manager(),
    )
}
