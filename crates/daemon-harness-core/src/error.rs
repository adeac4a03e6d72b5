use thiserror::Error;

/// Label used when the failing process cannot be named yet
pub const UNKNOWN_PROCESS: &str = "unknown process";

/// Core error types for daemon supervision
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Failed to start {process}: {source:#}")]
    StartupFailure {
        process: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to shut down {process}: {source:#}")]
    ShutdownFailure {
        process: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stop request to {process} failed: {source:#}")]
    StopRequestFailed {
        process: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl HarnessError {
    pub fn startup_failure(process: Option<&str>, source: impl Into<anyhow::Error>) -> Self {
        HarnessError::StartupFailure {
            process: process_label(process),
            source: source.into(),
        }
    }

    pub fn shutdown_failure(process: Option<&str>, source: impl Into<anyhow::Error>) -> Self {
        HarnessError::ShutdownFailure {
            process: process_label(process),
            source: source.into(),
        }
    }

    pub fn stop_request_failed(process: Option<&str>, source: impl Into<anyhow::Error>) -> Self {
        HarnessError::StopRequestFailed {
            process: process_label(process),
            source: source.into(),
        }
    }

    pub fn is_startup_failure(&self) -> bool {
        matches!(self, HarnessError::StartupFailure { .. })
    }

    pub fn is_shutdown_failure(&self) -> bool {
        matches!(self, HarnessError::ShutdownFailure { .. })
    }

    /// Name of the process this error is about, if it carries one
    pub fn process(&self) -> Option<&str> {
        match self {
            HarnessError::StartupFailure { process, .. }
            | HarnessError::ShutdownFailure { process, .. }
            | HarnessError::StopRequestFailed { process, .. } => Some(process),
            _ => None,
        }
    }

    /// The readiness cause behind a startup failure, if that is what failed
    pub fn readiness_error(&self) -> Option<&ReadinessError> {
        match self {
            HarnessError::StartupFailure { source, .. } => source.downcast_ref(),
            _ => None,
        }
    }
}

/// Why a readiness scan did not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("output stream closed before startup markers were seen: {missing:?}")]
    StreamClosed { missing: Vec<String> },

    #[error("timed out after {timeout_ms}ms waiting for startup markers: {missing:?}")]
    TimedOut { timeout_ms: u64, missing: Vec<String> },

    #[error("interrupted while waiting for startup markers")]
    Interrupted,
}

fn process_label(process: Option<&str>) -> String {
    match process {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => UNKNOWN_PROCESS.to_string(),
    }
}
