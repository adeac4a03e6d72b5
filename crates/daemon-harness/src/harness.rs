use crate::configured::{ConfiguredDaemon, DaemonSpec};
use anyhow::{Context, bail};
use daemon_harness_core::{
    Daemon, HarnessError, MultiProcessCoordinator, ProcessManager, Supervised, SupervisionConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// An ordered set of daemons plus the supervision settings they share
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default = "default_rollback_on_failure")]
    pub rollback_on_failure: bool,
    /// Started in this order, shut down in reverse
    pub daemons: Vec<DaemonSpec>,
}

impl HarnessConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid harness configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; relative data directories are resolved against the file's directory
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config = Self::from_json(&json)
            .with_context(|| format!("Failed to load {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for daemon in &mut config.daemons {
            if daemon.data_dir.is_relative() {
                daemon.data_dir = base.join(&daemon.data_dir);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.supervision
            .validate()
            .context("invalid supervision settings")?;

        let mut names = HashSet::new();
        for daemon in &self.daemons {
            daemon.validate()?;
            if !names.insert(daemon.name.as_str()) {
                bail!("daemon name {} is used more than once", daemon.name);
            }
        }
        Ok(())
    }

    /// Build the coordinator; every daemon shares `cancellation_token`
    pub fn into_coordinator(
        self,
        process_manager: Arc<dyn ProcessManager>,
        cancellation_token: &CancellationToken,
    ) -> Result<MultiProcessCoordinator, HarnessError> {
        self.validate()
            .map_err(|e| HarnessError::ConfigurationError(format!("{e:#}")))?;

        let processes = self
            .daemons
            .into_iter()
            .map(|spec| {
                let supervision = spec
                    .supervision
                    .clone()
                    .unwrap_or_else(|| self.supervision.clone());
                let data_dir = spec.data_dir.clone();
                Box::new(
                    Daemon::new(ConfiguredDaemon::new(spec), data_dir, process_manager.clone())
                        .with_config(supervision)
                        .with_cancellation_token(cancellation_token.child_token()),
                ) as Box<dyn Supervised>
            })
            .collect();

        Ok(MultiProcessCoordinator::new(self.name, processes).with_rollback(self.rollback_on_failure))
    }
}

/// Start `coordinator`, cancelling `token` if `interrupt` resolves first
///
/// After the interrupt the start keeps running so the daemon still starting is
/// terminated and the started ones are rolled back before this returns.
pub async fn start_until_interrupted<F>(
    coordinator: &mut MultiProcessCoordinator,
    token: &CancellationToken,
    interrupt: F,
) -> Result<(), HarnessError>
where
    F: Future,
{
    let start = coordinator.start();
    tokio::pin!(start);

    tokio::select! {
        biased;
        result = &mut start => result,
        _ = interrupt => {
            warn!("Interrupted during startup, stopping daemons");
            token.cancel();
            start.await
        }
    }
}

fn default_name() -> String {
    "regtest".to_string()
}
fn default_rollback_on_failure() -> bool {
    true
}
