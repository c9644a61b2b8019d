//! Periodic idle sweep.
//!
//! Independent of the per-session timers: a timer can be lost (e.g. a panic
//! in its task) and the sweep still reclaims the session.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::error::SessionError;
use super::models::SessionStatus;
use super::service::SessionService;

/// Terminate every running session idle for longer than `window` at `now`.
///
/// Terminations run concurrently. Returns how many sessions were terminated.
pub async fn sweep_idle(
    service: &SessionService,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> usize {
    let candidates: Vec<String> = service
        .sessions()
        .into_iter()
        .filter(|s| s.status == SessionStatus::Running && s.is_idle(now, window))
        .map(|s| s.user_id)
        .collect();

    if candidates.is_empty() {
        return 0;
    }

    info!("Idle sweep found {} candidate session(s)", candidates.len());

    let results = futures::future::join_all(
        candidates
            .iter()
            .map(|user| service.terminate_if_idle(user, now, window)),
    )
    .await;

    let mut terminated = 0;
    for (user, result) in candidates.iter().zip(results) {
        match result {
            Ok(Some(_)) => terminated += 1,
            // Extended or already gone since the snapshot.
            Ok(None) | Err(SessionError::NotFound) => {}
            Err(e) => warn!("Idle termination for user {} failed: {}", user, e),
        }
    }

    if terminated > 0 {
        info!("Terminated {} idle session(s)", terminated);
    }
    terminated
}

/// Start the sweep loop.
pub fn spawn(service: SessionService, every: Duration, window: Duration) -> JoinHandle<()> {
    info!(
        "Starting idle session reaper (check every {}s, timeout {}s)",
        every.as_secs(),
        window.as_secs()
    );

    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be idle yet.
        interval.tick().await;

        loop {
            interval.tick().await;
            sweep_idle(&service, Utc::now(), window).await;
        }
    })
}
