// Hybrid Clock - Stamps local mutations with monotonic (wall, logical) time
//
// Observing every applied remote timestamp keeps later local edits ordered
// after everything this instance has already seen, even with clock skew.

use crate::ledger::change::ChangeTimestamp;
use chrono::Utc;
use std::sync::Mutex;

/// Monotonic hybrid logical clock
#[derive(Debug, Default)]
pub struct HybridClock {
    last: Mutex<ChangeTimestamp>,
}

impl HybridClock {
    /// Create a clock that has seen nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp
    pub fn now(&self) -> ChangeTimestamp {
        let wall = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let next = if wall > last.wall_ms() {
            ChangeTimestamp::new(wall, 0)
        } else {
            ChangeTimestamp::new(last.wall_ms(), last.logical().saturating_add(1))
        };

        *last = next;
        next
    }

    /// Merge a timestamp seen on another instance
    pub fn observe(&self, seen: ChangeTimestamp) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if seen > *last {
            *last = seen;
        }
    }

    /// Latest timestamp issued or observed
    pub fn last(&self) -> ChangeTimestamp {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}
