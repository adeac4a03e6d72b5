use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Description of a single external process launch
///
/// Immutable once built. `to_command_list` yields the argv handed to the OS.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into))]
pub struct ProcessConfig {
    /// Executable path or name, resolved through `PATH` when relative
    pub name: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    /// Added on top of the inherited environment, overriding duplicates
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
}

impl ProcessConfig {
    pub fn builder() -> ProcessConfigBuilder {
        ProcessConfigBuilder::default()
    }

    /// `[name] + args`, in order
    pub fn to_command_list(&self) -> Vec<String> {
        let mut command = Vec::with_capacity(self.args.len() + 1);
        command.push(self.name.clone());
        command.extend(self.args.iter().cloned());
        command
    }

    /// Human readable form of the command line, used in logs and errors
    pub fn display_command(&self) -> String {
        self.to_command_list().join(" ")
    }
}

impl ProcessConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn arg<S: ToString>(&mut self, arg: S) -> &mut Self {
        self.args
            .get_or_insert_with(Vec::new)
            .push(arg.to_string());
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.environment_vars.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.environment_vars.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

/// Deadlines applied while supervising a daemon
///
/// `None` means wait indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisionConfig {
    /// Upper bound for the readiness scan (in milliseconds)
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,

    /// Upper bound for the exit wait after the stop call (in milliseconds)
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,

    /// Terminate the process tree when the exit wait times out
    #[serde(default = "default_force_kill_on_timeout")]
    pub force_kill_on_timeout: bool,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: None,
            shutdown_timeout_ms: None,
            force_kill_on_timeout: default_force_kill_on_timeout(),
        }
    }
}

impl SupervisionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults suited to regtest daemons on a developer machine
    pub fn regtest() -> Self {
        Self {
            startup_timeout_ms: Some(60_000),
            shutdown_timeout_ms: Some(30_000),
            force_kill_on_timeout: true,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.startup_timeout_ms == Some(0) {
            return Err(anyhow::anyhow!("startup_timeout_ms must be greater than zero"));
        }

        if self.shutdown_timeout_ms == Some(0) {
            return Err(anyhow::anyhow!("shutdown_timeout_ms must be greater than zero"));
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_ms.map(Duration::from_millis)
    }
}

/// Backoff settings for stop calls that may hit a daemon still binding its RPC port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Minimum delay between retry attempts (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum delay between retry attempts (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Total number of attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries (fail fast)
    pub fn no_retry() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 1,
            jitter: false,
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(anyhow::anyhow!(
                "min_delay_ms cannot be greater than max_delay_ms"
            ));
        }

        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }

        if self.max_attempts > 10 {
            return Err(anyhow::anyhow!(
                "max_attempts should not exceed 10 to avoid excessive retries"
            ));
        }

        if self.max_delay_ms > 60_000 {
            return Err(anyhow::anyhow!("max_delay_ms should not exceed 60 seconds"));
        }

        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Check if retries are enabled (more than 1 attempt)
    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

// Default value functions for serde
fn default_force_kill_on_timeout() -> bool {
    true
}
fn default_min_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    2_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_jitter() -> bool {
    true
}
