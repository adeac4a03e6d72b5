use crate::error::ReadinessError;
use crate::output::OutputLines;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tracks which startup markers have shown up in a daemon's output
///
/// A marker matches when a line contains it; markers may appear on any line,
/// in any order, several on the same line.
#[derive(Debug, Clone)]
pub struct MarkerMatcher {
    required: HashSet<String>,
    matched: HashSet<String>,
}

impl MarkerMatcher {
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(markers: I) -> Self {
        Self {
            required: markers.into_iter().map(Into::into).collect(),
            matched: HashSet::new(),
        }
    }

    /// Feed one line; returns true once every marker has been seen
    pub fn observe(&mut self, line: &str) -> bool {
        for marker in &self.required {
            if !self.matched.contains(marker) && line.contains(marker.as_str()) {
                debug!("Matched startup marker {marker:?}");
                self.matched.insert(marker.clone());
            }
        }
        self.is_satisfied()
    }

    pub fn is_satisfied(&self) -> bool {
        self.matched.len() == self.required.len()
    }

    /// Markers not seen yet, sorted for stable messages
    pub fn missing(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .required
            .difference(&self.matched)
            .cloned()
            .collect();
        missing.sort();
        missing
    }
}

/// Scan `lines` until every marker was seen
///
/// Fails when the stream ends first, when `timeout` elapses, or when `cancel` fires.
pub async fn wait_for_markers(
    lines: &mut OutputLines,
    matcher: &mut MarkerMatcher,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), ReadinessError> {
    if matcher.is_satisfied() {
        return Ok(());
    }

    let scan = async {
        while let Some(line) = lines.next_line().await {
            if matcher.observe(&line.text) {
                return Ok(());
            }
        }
        Err(())
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ReadinessError::Interrupted),
        outcome = with_deadline(timeout, scan) => outcome,
    };

    match outcome {
        Some(Ok(())) => Ok(()),
        Some(Err(())) => Err(ReadinessError::StreamClosed {
            missing: matcher.missing(),
        }),
        None => Err(ReadinessError::TimedOut {
            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            missing: matcher.missing(),
        }),
    }
}

/// `None` when the deadline passed first
pub(crate) async fn with_deadline<F: std::future::Future>(
    timeout: Option<Duration>,
    future: F,
) -> Option<F::Output> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, future).await.ok(),
        None => Some(future.await),
    }
}
