//! Launch external daemons for regtest and integration testing, wait until they
//! report readiness, and tear them down in reverse order.
//!
//! ```rust,no_run
//! use daemon_harness::{
//!     BitcoindConfig, BitcoindDaemon, MultiProcessCoordinator, Supervised, supervise,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = BitcoindConfig::builder()
//!     .rpc_user("bisq")
//!     .rpc_password("bisq")
//!     .build()?;
//! let bitcoind = supervise(BitcoindDaemon::new(config), "/tmp/regtest/bitcoind");
//!
//! let processes: Vec<Box<dyn Supervised>> = vec![Box::new(bitcoind)];
//! let mut regtest = MultiProcessCoordinator::new("regtest", processes);
//! regtest.start().await?;
//! // ... run tests against the node ...
//! regtest.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bitcoind;
pub mod configured;
mod factory;
pub mod harness;
pub mod logging;

pub use bitcoind::{BitcoindConfig, BitcoindConfigBuilder, BitcoindDaemon};
pub use configured::{ConfiguredDaemon, DaemonSpec, StopStrategy};
pub use factory::{PlatformProcessManagerFactory, supervise};
pub use harness::{HarnessConfig, start_until_interrupted};

// Re-export core functionality
pub use daemon_harness_core::*;
