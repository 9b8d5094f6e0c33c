//! Cancellable single-shot timers.
//!
//! The oval-fit timeout runs independently of the frame stream. A superseded
//! timer must be cancelled, not merely ignored, so every scheduled task hands
//! back a [`TimerHandle`] whose `cancel` is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Schedules a task to run once after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Handle to a scheduled task. Dropping the handle does not cancel it.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    fn new(abort: Option<tokio::task::AbortHandle>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            abort,
        }
    }

    /// Cancel the task if it has not run yet. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs timers on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling task.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });
        TimerHandle {
            cancelled,
            abort: Some(join.abort_handle()),
        }
    }
}

struct PendingTask {
    due_ms: u64,
    handle: TimerHandle,
    task: TimerTask,
}

#[derive(Default)]
struct ManualQueue {
    now_ms: u64,
    pending: Vec<PendingTask>,
}

/// Deterministic scheduler driven by explicit time advances.
///
/// Due tasks run on the thread calling [`ManualScheduler::advance_to`], in
/// due-time order, after the internal lock is released.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<ManualQueue>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).now_ms
    }

    /// Number of tasks that are scheduled and not cancelled.
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .count()
    }

    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now_ms() + by.as_millis() as u64;
        self.advance_to(target)
    }

    /// Move time forward to `now_ms` and run every task that became due.
    /// Returns how many tasks ran. Time never moves backwards.
    pub fn advance_to(&self, now_ms: u64) -> usize {
        let mut due = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.now_ms = queue.now_ms.max(now_ms);
            let now = queue.now_ms;
            queue.pending.retain(|p| !p.handle.is_cancelled());
            let (due, later): (Vec<_>, Vec<_>) =
                queue.pending.drain(..).partition(|p| p.due_ms <= now);
            queue.pending = later;
            due
        };
        due.sort_by_key(|p| p.due_ms);

        let mut ran = 0;
        for pending in due {
            if pending.handle.is_cancelled() {
                continue;
            }
            (pending.task)();
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new(None);
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let due_ms = queue.now_ms + delay.as_millis() as u64;
        queue.pending.push(PendingTask {
            due_ms,
            handle: handle.clone(),
            task,
        });
        handle
    }
}
