// ABOUTME: Short-lived membership guard suppressing repeat enqueues of one entity
// ABOUTME: Entries expire lazily after a grace window instead of per-entry timers

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Best-effort anti-loop guard.
///
/// When the applier's own write to the secondary store fires a change
/// notification, the resulting capture lands within the grace window and
/// is suppressed, breaking the feedback cycle. Duplicates beyond the
/// window are tolerated: the applier is idempotent.
#[derive(Debug)]
pub struct DedupGuard {
    window: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the object has not been seen within the grace
    /// window, recording it; false suppresses the enqueue.
    pub fn should_enqueue(&self, object_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, seen_at| now.duration_since(*seen_at) < self.window);
        if entries.contains_key(object_id) {
            return false;
        }
        entries.insert(object_id.to_string(), now);
        true
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
