use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::Clock;

/// Default window after which a stale attempt streak is forgotten.
pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(300);

struct AttemptRecord {
    count: u32,
    latest_ms: i64,
}

/// Counts liveness attempts across sessions.
///
/// If more than the reset interval has elapsed since the previous attempt the
/// streak restarts, so the next attempt counts as 1. One instance is shared by
/// every session in the process; increments from overlapping sessions are
/// serialized through the internal lock and never lost.
pub struct AttemptCounter {
    reset_interval: Duration,
    clock: Arc<dyn Clock>,
    record: Mutex<AttemptRecord>,
}

impl AttemptCounter {
    pub fn new(reset_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let latest_ms = clock.now_ms();
        Self {
            reset_interval,
            clock,
            record: Mutex::new(AttemptRecord {
                count: 0,
                latest_ms,
            }),
        }
    }

    /// Record a new attempt and return the updated count.
    pub fn count_attempt(&self) -> u32 {
        let now = self.clock.now_ms();
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_sub(record.latest_ms);
        if elapsed > self.reset_interval.as_millis() as i64 {
            if record.count > 0 {
                tracing::debug!(
                    previous = record.count,
                    elapsed_ms = elapsed,
                    "attempt window expired; resetting streak"
                );
            }
            record.count = 0;
        }
        record.count += 1;
        record.latest_ms = now;
        record.count
    }

    /// Current count without recording an attempt.
    pub fn count(&self) -> u32 {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count
    }
}
