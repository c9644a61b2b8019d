//! Desktop readiness detection.
//!
//! A desktop prints a sentinel line once its display stack and proxy are up
//! (or a failure sentinel if initialization went wrong). The probe reads the
//! tail of the container output and looks for those lines.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::container::ContainerRuntimeApi;

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Failed(String),
    Pending,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("startup failed: {0}")]
    Failed(String),

    #[error("not ready after {0:?}")]
    TimedOut(Duration),
}

/// Decides whether a freshly started container is ready.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, container_id: &str) -> Readiness;
}

/// Probe that scans the container output for marker lines.
pub struct LogMarkerProbe {
    runtime: Arc<dyn ContainerRuntimeApi>,
    ready_markers: Vec<String>,
    failure_markers: Vec<String>,
    tail: u32,
}

impl LogMarkerProbe {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        ready_markers: Vec<String>,
        failure_markers: Vec<String>,
        tail: u32,
    ) -> Self {
        Self {
            runtime,
            ready_markers,
            failure_markers,
            tail,
        }
    }
}

/// Classify a chunk of output. Failure markers win over ready markers.
pub(crate) fn scan_output(output: &str, ready: &[String], failure: &[String]) -> Readiness {
    let find = |markers: &[String]| {
        output.lines().find(|line| {
            markers
                .iter()
                .any(|m| !m.is_empty() && line.contains(m.as_str()))
        })
    };

    if let Some(line) = find(failure) {
        return Readiness::Failed(line.trim().to_string());
    }
    if find(ready).is_some() {
        return Readiness::Ready;
    }
    Readiness::Pending
}

#[async_trait]
impl ReadinessProbe for LogMarkerProbe {
    async fn probe(&self, container_id: &str) -> Readiness {
        let logs = match self.runtime.get_logs(container_id, Some(self.tail)).await {
            Ok(logs) => logs,
            Err(e) => {
                log::debug!("Reading logs of {} failed: {}", container_id, e);
                return Readiness::Pending;
            }
        };

        let verdict = scan_output(&logs, &self.ready_markers, &self.failure_markers);
        if verdict != Readiness::Pending {
            return verdict;
        }

        // A desktop that died before printing anything never becomes ready.
        match self.runtime.container_state_status(container_id).await {
            Ok(Some(status)) if status == "running" || status == "created" => Readiness::Pending,
            Ok(Some(status)) => Readiness::Failed(format!("container {}", status)),
            Ok(None) => Readiness::Failed("container disappeared".to_string()),
            Err(e) => {
                log::debug!("Inspecting {} failed: {}", container_id, e);
                Readiness::Pending
            }
        }
    }
}

/// Poll `probe` every `interval` until it reports a verdict or `timeout` elapses.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    container_id: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), ReadinessError> {
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());

        match tokio::time::timeout(remaining, probe.probe(container_id)).await {
            Ok(Readiness::Ready) => {
                log::debug!("{} ready after {} probe(s)", container_id, attempts);
                return Ok(());
            }
            Ok(Readiness::Failed(reason)) => return Err(ReadinessError::Failed(reason)),
            Ok(Readiness::Pending) | Err(_) => {}
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::warn!(
                "{} not ready after {} probe(s) over {:?}",
                container_id,
                attempts,
                timeout
            );
            return Err(ReadinessError::TimedOut(timeout));
        }

        tokio::time::sleep(interval.min(remaining)).await;
    }
}
