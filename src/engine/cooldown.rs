//! Per-(subject, event-class) notification cooldown.
//!
//! Guarantees at-most-one user-visible notification per key per window. Cache
//! invalidation never goes through here — only notifications are suppressed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::events::EventClass;

pub struct NotificationCooldown {
    /// Per-key last-fired timestamps: (subject id, event class) → Instant.
    entries: Mutex<HashMap<(String, EventClass), Instant>>,
}

impl NotificationCooldown {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` (and arms the window) if a notification for this key
    /// may fire now; `false` if the previous one fired less than `window`
    /// ago. Check and arm are a single locked step so two events arriving
    /// together cannot both fire.
    pub fn check_and_arm(&self, subject: &str, class: EventClass, window: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = (subject.to_string(), class);

        if let Some(last) = entries.get(&key) {
            if now.duration_since(*last) < window {
                return false;
            }
        }
        entries.insert(key, now);
        true
    }

    /// Drop entries whose window has long expired. Called opportunistically
    /// by the dispatcher, not on every event, so the map stays bounded by
    /// the set of recently-active subjects.
    pub fn prune(&self, max_window: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, last| now.duration_since(*last) < max_window);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for NotificationCooldown {
    fn default() -> Self {
        Self::new()
    }
}
