//! Daemon harness core - platform-independent supervision of external daemons
//!
//! This crate provides the process traits, configuration, readiness matching,
//! the [`Daemon`] driver and the [`MultiProcessCoordinator`]. Platform crates
//! implement [`ProcessManager`].

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod output;
pub mod process;
pub mod readiness;

pub use config::*;
pub use coordinator::{MultiProcessCoordinator, Supervised};
pub use daemon::{Daemon, DaemonProcess, DaemonState, StopContext};
pub use error::*;
pub use output::{OutputLine, OutputLines, OutputSource};
pub use process::*;
pub use readiness::MarkerMatcher;
