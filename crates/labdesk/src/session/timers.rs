//! Per-user inactivity deadlines.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// One deadline per user.
///
/// Arming replaces the previous deadline. A firing timer first removes its own
/// entry (only if it is still the current generation) and then runs the
/// expiry callback, so the callback may freely cancel or re-arm timers for the
/// same user without aborting itself.
#[derive(Default)]
pub struct SessionTimers {
    entries: Mutex<HashMap<String, TimerEntry>>,
    generation: AtomicU64,
}

impl SessionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm (or re-arm) the deadline for `user_id`.
    pub fn arm<F>(self: &Arc<Self>, user_id: &str, after: Duration, on_expire: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timers: Weak<Self> = Arc::downgrade(self);
        let user = user_id.to_string();

        // Holding the map lock while spawning keeps the new task from retiring
        // before its entry exists.
        let mut entries = self.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(timers) = timers.upgrade() else {
                return;
            };
            if !timers.retire(&user, generation) {
                return;
            }
            log::info!("Inactivity deadline reached for user {}", user);
            on_expire().await;
        });

        if let Some(previous) = entries.insert(
            user_id.to_string(),
            TimerEntry { generation, handle },
        ) {
            previous.handle.abort();
        }
    }

    /// Clear the deadline for `user_id`, if any.
    pub fn cancel(&self, user_id: &str) {
        if let Some(entry) = self.lock().remove(user_id) {
            entry.handle.abort();
        }
    }

    /// Drop the entry if it still belongs to `generation`.
    fn retire(&self, user_id: &str, generation: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(user_id) {
            Some(entry) if entry.generation == generation => {
                entries.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, user_id: &str) -> bool {
        self.lock().contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every pending deadline.
    pub fn cancel_all(&self) {
        for (_, entry) in self.lock().drain() {
            entry.handle.abort();
        }
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }
}
