//! Ordered container teardown.
//!
//! Every step runs regardless of earlier failures. Failures are logged and
//! collected in the report, never propagated.

use std::time::Duration;

use crate::container::ContainerRuntimeApi;
use crate::ports::{PortAllocator, PortLease};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownStep {
    /// Ask the desktop to flush and upload its backup.
    Signal(String),
    /// Fixed grace period for the backup upload.
    Wait(Duration),
    /// Stop with the engine's own grace timeout (seconds).
    Stop(u32),
    /// Remove the container.
    Remove { force: bool },
    /// Return the session's ports to the pool.
    ReleasePorts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownPlan {
    steps: Vec<TeardownStep>,
}

/// What happened while executing a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// The shutdown signal reached the container.
    pub signal_delivered: bool,
    /// One entry per failed step.
    pub failures: Vec<String>,
}

impl TeardownPlan {
    /// Full shutdown with backup: signal, wait, stop, remove, release.
    pub fn graceful(signal: &str, grace: Duration, stop_timeout_secs: u32) -> Self {
        Self {
            steps: vec![
                TeardownStep::Signal(signal.to_string()),
                TeardownStep::Wait(grace),
                TeardownStep::Stop(stop_timeout_secs),
                TeardownStep::Remove { force: false },
                TeardownStep::ReleasePorts,
            ],
        }
    }

    /// Immediate cleanup with no backup: used for dead containers and for
    /// rolling back a failed start.
    pub fn forced() -> Self {
        Self {
            steps: vec![TeardownStep::Remove { force: true }, TeardownStep::ReleasePorts],
        }
    }

    pub fn steps(&self) -> &[TeardownStep] {
        &self.steps
    }

    pub async fn execute(
        &self,
        runtime: &dyn ContainerRuntimeApi,
        ports: &PortAllocator,
        container: &str,
        lease: PortLease,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();

        for step in &self.steps {
            let result = match step {
                TeardownStep::Signal(signal) => {
                    let res = runtime.signal_container(container, signal).await;
                    report.signal_delivered = res.is_ok();
                    res
                }
                TeardownStep::Wait(grace) => {
                    if !grace.is_zero() {
                        log::debug!("Waiting {:?} for {} to persist data", grace, container);
                        tokio::time::sleep(*grace).await;
                    }
                    Ok(())
                }
                TeardownStep::Stop(timeout) => runtime.stop_container(container, Some(*timeout)).await,
                TeardownStep::Remove { force } => runtime.remove_container(container, *force).await,
                TeardownStep::ReleasePorts => {
                    ports.release_pair(lease);
                    Ok(())
                }
            };

            if let Err(e) = result {
                log::warn!("Teardown step {:?} failed for {}: {}", step, container, e);
                report.failures.push(format!("{:?}: {}", step, e));
            }
        }

        report
    }
}
