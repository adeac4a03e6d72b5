use anyhow::{Context, bail};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use daemon_harness_core::{DaemonProcess, ProcessConfig, RetryConfig, StopContext};
use derive_builder::Builder;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

/// Printed once bitcoind finished loading its indexes and wallets
pub const DONE_LOADING_MARKER: &str = "init message: Done loading";

/// Settings for a bitcoind instance in regtest mode
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into))]
pub struct BitcoindConfig {
    #[builder(default = "\"bitcoind\".to_string()")]
    pub executable: String,
    #[builder(default = "\"127.0.0.1\".to_string()")]
    pub host: String,
    #[builder(default = "18443")]
    pub rpc_port: u16,
    #[builder(default = "18444")]
    pub p2p_port: u16,
    pub rpc_user: String,
    pub rpc_password: String,
    #[builder(default, setter(strip_option))]
    pub zmq_block_port: Option<u16>,
    #[builder(default, setter(strip_option))]
    pub zmq_tx_port: Option<u16>,
    #[builder(default)]
    pub extra_args: Vec<String>,
    #[builder(default)]
    pub retry_config: RetryConfig,
}

impl BitcoindConfig {
    pub fn builder() -> BitcoindConfigBuilder {
        BitcoindConfigBuilder::default()
    }

    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.rpc_port)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// bitcoind in regtest mode, stopped through its JSON-RPC `stop` call
pub struct BitcoindDaemon {
    config: BitcoindConfig,
    client: reqwest::Client,
}

impl BitcoindDaemon {
    pub fn new(config: BitcoindConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &BitcoindConfig {
        &self.config
    }

    /// Issue one JSON-RPC 1.0 call, retrying while the RPC port refuses connections
    pub async fn rpc_call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let retry = &self.config.retry_config;
        retry.validate()?;

        let mut strategy = ExponentialBuilder::default()
            .with_min_delay(retry.min_delay())
            .with_max_delay(retry.max_delay())
            .with_max_times(retry.max_attempts.saturating_sub(1) as usize);
        if retry.jitter {
            strategy = strategy.with_jitter();
        }

        let body = json!({
            "jsonrpc": "1.0",
            "id": "daemon-harness",
            "method": method,
            "params": params,
        });
        let attempts = AtomicU32::new(0);
        let send = || {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.client
                .post(self.config.rpc_url())
                .basic_auth(&self.config.rpc_user, Some(&self.config.rpc_password))
                .json(&body)
                .send()
        };

        let response = send
            .retry(strategy)
            .when(|e: &reqwest::Error| e.is_connect())
            .notify(|e, delay| debug!("RPC {method} failed ({e}), retrying in {delay:?}"))
            .await
            .with_context(|| {
                format!(
                    "RPC {method} to {} failed after {} attempt(s)",
                    self.config.rpc_url(),
                    attempts.load(Ordering::Relaxed)
                )
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read RPC {method} response"))?;
        // bitcoind answers RPC errors with HTTP 500 and a JSON body
        let parsed: RpcResponse = serde_json::from_str(&body)
            .with_context(|| format!("RPC {method} returned HTTP {status}: {body}"))?;

        if let Some(error) = parsed.error {
            bail!("RPC {method} failed with code {}: {}", error.code, error.message);
        }
        Ok(parsed.result)
    }
}

#[async_trait]
impl DaemonProcess for BitcoindDaemon {
    fn create_process_config(&self, data_dir: &Path) -> anyhow::Result<ProcessConfig> {
        let config = &self.config;
        let mut builder = ProcessConfig::builder();
        builder.name(config.executable.as_str()).args([
            "-regtest".to_string(),
            format!("-datadir={}", data_dir.display()),
            "-printtoconsole".to_string(),
            "-debug=1".to_string(),
            format!("-bind={}:{}", config.host, config.p2p_port),
            format!("-whitelist={}", config.host),
            format!("-rpcbind={}:{}", config.host, config.rpc_port),
            format!("-rpcallowip={}", config.host),
            format!("-rpcuser={}", config.rpc_user),
            format!("-rpcpassword={}", config.rpc_password),
            "-server=1".to_string(),
            "-txindex=1".to_string(),
            "-fallbackfee=0.00000001".to_string(),
        ]);

        if let Some(port) = config.zmq_block_port {
            builder.arg(format!("-zmqpubrawblock=tcp://{}:{port}", config.host));
        }
        if let Some(port) = config.zmq_tx_port {
            builder.arg(format!("-zmqpubrawtx=tcp://{}:{port}", config.host));
        }
        for arg in &config.extra_args {
            builder.arg(arg);
        }

        Ok(builder.build()?)
    }

    fn startup_log_markers(&self) -> HashSet<String> {
        HashSet::from([DONE_LOADING_MARKER.to_string()])
    }

    async fn invoke_stop_rpc_call(&self, ctx: &StopContext) -> anyhow::Result<()> {
        let reply = self.rpc_call("stop", json!([])).await?;
        info!("{} acknowledged stop: {reply}", ctx.command);
        Ok(())
    }
}
