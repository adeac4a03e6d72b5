use anyhow::{Context, bail};
use async_trait::async_trait;
use daemon_harness_core::{DaemonProcess, ProcessConfig, StopContext, SupervisionConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// Placeholder replaced by the daemon's data directory in args, env values and stop commands
pub const DATA_DIR_PLACEHOLDER: &str = "{dataDir}";

/// How a configured daemon is asked to exit
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StopStrategy {
    /// SIGTERM to the daemon process
    #[default]
    Terminate,
    /// SIGINT to the daemon process
    Interrupt,
    /// Run a separate command that must exit successfully, e.g. `bitcoin-cli stop`
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// A daemon described entirely by configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub ready_markers: Vec<String>,
    #[serde(default)]
    pub stop: StopStrategy,
    /// Overrides the harness-wide supervision settings for this daemon
    #[serde(default)]
    pub supervision: Option<SupervisionConfig>,
}

impl DaemonSpec {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            bail!("daemon name must not be empty");
        }
        if self.command.trim().is_empty() {
            bail!("daemon {} has an empty command", self.name);
        }
        if let StopStrategy::Command { command, .. } = &self.stop {
            if command.trim().is_empty() {
                bail!("daemon {} has an empty stop command", self.name);
            }
        }
        if let Some(supervision) = &self.supervision {
            supervision
                .validate()
                .with_context(|| format!("invalid supervision settings for {}", self.name))?;
        }
        Ok(())
    }
}

/// [`DaemonProcess`] backed by a [`DaemonSpec`]
#[derive(Debug, Clone)]
pub struct ConfiguredDaemon {
    spec: DaemonSpec,
}

impl ConfiguredDaemon {
    pub fn new(spec: DaemonSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    async fn run_stop_command(
        &self,
        command: &str,
        args: &[String],
        data_dir: &Path,
    ) -> anyhow::Result<()> {
        let args: Vec<String> = args.iter().map(|a| substitute(a, data_dir)).collect();
        info!("Stopping {} with: {command} {}", self.spec.name, args.join(" "));

        let output = tokio::process::Command::new(command)
            .args(&args)
            .envs(self.env(data_dir))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run stop command {command}"))?;

        if !output.status.success() {
            bail!(
                "stop command {command} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn env(&self, data_dir: &Path) -> HashMap<String, String> {
        self.spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, data_dir)))
            .collect()
    }
}

#[async_trait]
impl DaemonProcess for ConfiguredDaemon {
    fn create_process_config(&self, data_dir: &Path) -> anyhow::Result<ProcessConfig> {
        Ok(ProcessConfig::builder()
            .name(self.spec.command.as_str())
            .args(self.spec.args.iter().map(|a| substitute(a, data_dir)))
            .env_multi(self.env(data_dir))
            .build()?)
    }

    fn startup_log_markers(&self) -> HashSet<String> {
        self.spec.ready_markers.iter().cloned().collect()
    }

    async fn invoke_stop_rpc_call(&self, ctx: &StopContext) -> anyhow::Result<()> {
        match &self.spec.stop {
            StopStrategy::Terminate => signal(ctx, nix::sys::signal::Signal::SIGTERM),
            StopStrategy::Interrupt => signal(ctx, nix::sys::signal::Signal::SIGINT),
            StopStrategy::Command { command, args } => {
                self.run_stop_command(command, args, &ctx.data_dir).await
            }
        }
    }
}

fn signal(ctx: &StopContext, signal: nix::sys::signal::Signal) -> anyhow::Result<()> {
    let pid = ctx
        .pid
        .with_context(|| format!("{} has no PID to signal", ctx.command))?;
    daemon_harness_unix::send_signal(pid, signal)
}

fn substitute(value: &str, data_dir: &Path) -> String {
    value.replace(DATA_DIR_PLACEHOLDER, &data_dir.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> DaemonSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_spec_defaults() {
        let spec = spec(r#"{"name":"bitcoind","command":"bitcoind","dataDir":"/tmp/btc"}"#);
        assert!(spec.args.is_empty());
        assert!(spec.ready_markers.is_empty());
        assert_eq!(spec.stop, StopStrategy::Terminate);
        assert!(spec.supervision.is_none());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_stop_strategy_from_json() {
        let spec = spec(
            r#"{
                "name": "bitcoind",
                "command": "bitcoind",
                "dataDir": "/tmp/btc",
                "stop": {"type": "command", "command": "bitcoin-cli", "args": ["-datadir={dataDir}", "stop"]}
            }"#,
        );
        assert_eq!(
            spec.stop,
            StopStrategy::Command {
                command: "bitcoin-cli".to_string(),
                args: vec!["-datadir={dataDir}".to_string(), "stop".to_string()],
            }
        );

        let spec = self::spec(
            r#"{"name":"tor","command":"tor","dataDir":"/tmp/tor","stop":{"type":"interrupt"}}"#,
        );
        assert_eq!(spec.stop, StopStrategy::Interrupt);
    }

    #[test]
    fn test_validation_rejects_empty_fields() {
        let mut spec = spec(r#"{"name":"x","command":"","dataDir":"/tmp/x"}"#);
        assert!(spec.validate().is_err());

        spec.command = "electrumx".to_string();
        spec.stop = StopStrategy::Command {
            command: " ".to_string(),
            args: Vec::new(),
        };
        assert!(spec.validate().is_err());

        spec.stop = StopStrategy::Terminate;
        spec.supervision = Some(SupervisionConfig {
            startup_timeout_ms: Some(0),
            ..Default::default()
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_process_config_substitutes_data_dir() {
        let daemon = ConfiguredDaemon::new(spec(
            r#"{
                "name": "bitcoind",
                "command": "bitcoind",
                "args": ["-regtest", "-datadir={dataDir}"],
                "env": {"HOME": "{dataDir}/home"},
                "dataDir": "/ignored",
                "readyMarkers": ["init message: Done loading"]
            }"#,
        ));

        let config = daemon
            .create_process_config(Path::new("/var/regtest/btc"))
            .unwrap();
        assert_eq!(
            config.to_command_list(),
            vec!["bitcoind", "-regtest", "-datadir=/var/regtest/btc"]
        );
        assert_eq!(config.environment_vars["HOME"], "/var/regtest/btc/home");
        assert_eq!(
            daemon.startup_log_markers(),
            HashSet::from(["init message: Done loading".to_string()])
        );
    }

    #[tokio::test]
    async fn test_failing_stop_command_is_an_error() {
        let daemon = ConfiguredDaemon::new(spec(
            r#"{
                "name": "flaky",
                "command": "sh",
                "dataDir": "/tmp/flaky",
                "stop": {"type": "command", "command": "sh", "args": ["-c", "echo refused >&2; exit 3"]}
            }"#,
        ));
        let ctx = StopContext {
            pid: None,
            command: "sh".to_string(),
            data_dir: PathBuf::from("/tmp/flaky"),
        };

        let err = daemon.invoke_stop_rpc_call(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn test_signal_without_pid_is_an_error() {
        let daemon = ConfiguredDaemon::new(spec(
            r#"{"name":"gone","command":"sh","dataDir":"/tmp/gone"}"#,
        ));
        let ctx = StopContext {
            pid: None,
            command: "sh".to_string(),
            data_dir: PathBuf::from("/tmp/gone"),
        };
        assert!(daemon.invoke_stop_rpc_call(&ctx).await.is_err());
    }
}
