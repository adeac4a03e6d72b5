use crate::error::HarnessError;
use async_trait::async_trait;
use tracing::{info, warn};

/// Something that can be started and later shut down as a unit
///
/// Implemented by [`crate::Daemon`] and by [`MultiProcessCoordinator`] itself,
/// so coordinators nest.
#[async_trait]
pub trait Supervised: Send {
    fn name(&self) -> String;

    async fn start(&mut self) -> Result<(), HarnessError>;

    async fn shutdown(&mut self) -> Result<(), HarnessError>;
}

/// Starts its units in list order and shuts them down in reverse
pub struct MultiProcessCoordinator {
    name: String,
    processes: Vec<Box<dyn Supervised>>,
    rollback_on_failure: bool,
}

impl MultiProcessCoordinator {
    pub fn new(name: impl Into<String>, processes: Vec<Box<dyn Supervised>>) -> Self {
        Self {
            name: name.into(),
            processes,
            rollback_on_failure: true,
        }
    }

    /// When set (the default), a failed `start` shuts down the units already started
    pub fn with_rollback(mut self, rollback_on_failure: bool) -> Self {
        self.rollback_on_failure = rollback_on_failure;
        self
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Start every unit in order; stops at the first failure
    pub async fn start(&mut self) -> Result<(), HarnessError> {
        info!("Starting {} ({} units)", self.name, self.len());

        for index in 0..self.processes.len() {
            if let Err(e) = self.processes[index].start().await {
                warn!(
                    "{} failed to start {}: {e}",
                    self.name,
                    self.processes[index].name()
                );
                if self.rollback_on_failure {
                    self.roll_back(index).await;
                }
                return Err(e);
            }
        }

        info!("{} started", self.name);
        Ok(())
    }

    /// Shut down the first `started` units in reverse, logging failures
    async fn roll_back(&mut self, started: usize) {
        for process in self.processes[..started].iter_mut().rev() {
            if let Err(e) = process.shutdown().await {
                warn!("Rollback of {} failed: {e}", process.name());
            }
        }
    }

    /// Shut down every unit in reverse order
    ///
    /// Keeps going past failures; the first failure is returned once all units
    /// were attempted.
    pub async fn shutdown(&mut self) -> Result<(), HarnessError> {
        info!("Shutting down {}", self.name);

        let mut first_error = None;
        for process in self.processes.iter_mut().rev() {
            if let Err(e) = process.shutdown().await {
                warn!("Failed to shut down {}: {e}", process.name());
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("{} shut down", self.name);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Supervised for MultiProcessCoordinator {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&mut self) -> Result<(), HarnessError> {
        MultiProcessCoordinator::start(self).await
    }

    async fn shutdown(&mut self) -> Result<(), HarnessError> {
        MultiProcessCoordinator::shutdown(self).await
    }
}
