//! Delayed execution for every timeout-driven protocol (heartbeat wait,
//! suspicion, final check).
//!
//! Newly scheduled tasks land in a lock-free intake queue and are moved into a
//! due-time ordered lobby by whoever drives the scheduler. Time comes from an
//! injectable monotonic [`Clock`]: production drives [`TaskScheduler::trigger_due`]
//! from a recurrent actor, tests drive it by hand after advancing a [`ManualClock`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context as _, Result};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Monotonic time source, in nanoseconds since an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// [`MonotonicClock`] reads tokio's monotonic clock.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// [`ManualClock`] only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

pub type TaskFn = Box<dyn FnOnce() -> Result<()> + Send>;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a scheduled task, used to cancel it before it fires.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    /// Cancels the task. Returns `false` when the task already fired or was
    /// cancelled before; that is never an error.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

struct ScheduledTask {
    due: u64,
    id: u64,
    state: Arc<AtomicU8>,
    thunk: TaskFn,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // BinaryHeap is a max-heap; the earliest due task must surface first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due.cmp(&self.due).then_with(|| other.id.cmp(&self.id))
    }
}

pub struct TaskScheduler {
    clock: Arc<dyn Clock>,
    incoming: SegQueue<ScheduledTask>,
    lobby: Mutex<BinaryHeap<ScheduledTask>>,
    next_task_id: AtomicU64,
}

impl TaskScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TaskScheduler {
            clock,
            incoming: SegQueue::new(),
            lobby: Mutex::new(BinaryHeap::new()),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Arms `thunk` to run once at `now + delay`.
    pub fn schedule<F>(&self, thunk: F, delay: Duration) -> TaskHandle
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(AtomicU8::new(PENDING));
        let due = self.clock.now_nanos().saturating_add(delay.as_nanos() as u64);

        self.incoming.push(ScheduledTask {
            due,
            id,
            state: state.clone(),
            thunk: Box::new(thunk),
        });
        TaskHandle { state }
    }

    /// Runs every task whose due time has elapsed, earliest first, and returns
    /// how many ran. The clock is read once per call; tasks armed by a running
    /// thunk with an already elapsed due time run in the same pass.
    ///
    /// A failing thunk ends the pass with its error. Tasks not yet run stay
    /// queued for the next pass.
    pub fn trigger_due(&self) -> Result<usize> {
        let now = self.clock.now_nanos();
        let mut ran = 0;

        loop {
            let task = {
                let mut lobby = self.lobby.lock();
                while let Some(task) = self.incoming.pop() {
                    lobby.push(task);
                }
                match lobby.peek() {
                    Some(task) if task.due <= now => lobby.pop(),
                    _ => None,
                }
            };
            let Some(task) = task else {
                break;
            };

            if task.state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // cancelled
                continue;
            }

            ran += 1;
            (task.thunk)().with_context(|| format!("scheduled task {} failed", task.id))?;
        }

        if ran > 0 {
            debug!(ran, "scheduler pass completed");
        }
        Ok(ran)
    }

    /// Time until the earliest pending task is due, if any task is pending.
    pub fn next_due_in(&self) -> Option<Duration> {
        let now = self.clock.now_nanos();
        let mut lobby = self.lobby.lock();
        while let Some(task) = self.incoming.pop() {
            lobby.push(task);
        }
        lobby.retain(|task| task.state.load(Ordering::Acquire) == PENDING);
        lobby.peek().map(|task| Duration::from_nanos(task.due.saturating_sub(now)))
    }

    /// Number of tasks that are armed and not cancelled.
    pub fn pending(&self) -> usize {
        let mut lobby = self.lobby.lock();
        while let Some(task) = self.incoming.pop() {
            lobby.push(task);
        }
        lobby.iter().filter(|task| task.state.load(Ordering::Acquire) == PENDING).count()
    }

    /// Cancels every pending task.
    pub fn clear(&self) {
        let mut lobby = self.lobby.lock();
        while let Some(task) = self.incoming.pop() {
            lobby.push(task);
        }
        for task in lobby.drain() {
            let _ = task.state.compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn scheduler() -> (TaskScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (TaskScheduler::new(clock.clone()), clock)
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> TaskFn) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let make = move |n: u32| -> TaskFn {
            let sink = sink.clone();
            Box::new(move || {
                sink.lock().push(n);
                Ok(())
            })
        };
        (seen, make)
    }

    #[test]
    fn test_never_runs_before_due_time() {
        let (scheduler, clock) = scheduler();
        let (seen, task) = recorder();
        scheduler.schedule(task(1), Duration::from_millis(100));

        clock.advance(Duration::from_millis(99));
        assert_eq!(scheduler.trigger_due().unwrap(), 0);
        assert!(seen.lock().is_empty());

        clock.advance(Duration::from_millis(1));
        assert_eq!(scheduler.trigger_due().unwrap(), 1);
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn test_runs_due_tasks_in_due_order_exactly_once() {
        let (scheduler, clock) = scheduler();
        let (seen, task) = recorder();
        for (n, delay) in [(3, 30), (1, 10), (4, 40), (2, 20), (5, 500)] {
            scheduler.schedule(task(n), Duration::from_millis(delay));
        }

        clock.advance(Duration::from_millis(45));
        assert_eq!(scheduler.trigger_due().unwrap(), 4);
        assert_eq!(scheduler.trigger_due().unwrap(), 0);
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.next_due_in(), Some(Duration::from_millis(455)));
    }

    #[test]
    fn test_cancel_before_and_after_firing() {
        let (scheduler, clock) = scheduler();
        let (seen, task) = recorder();
        let cancelled = scheduler.schedule(task(1), Duration::from_millis(10));
        let fired = scheduler.schedule(task(2), Duration::from_millis(10));

        assert!(cancelled.cancel());
        assert!(!cancelled.cancel());

        clock.advance(Duration::from_millis(10));
        scheduler.trigger_due().unwrap();
        assert_eq!(*seen.lock(), vec![2]);
        assert!(fired.has_fired());
        // cancelling after the task ran is a no-op
        assert!(!fired.cancel());
        assert!(fired.has_fired());
    }

    #[test]
    fn test_failing_task_does_not_lose_other_tasks() {
        let (scheduler, clock) = scheduler();
        let (seen, task) = recorder();
        scheduler.schedule(task(1), Duration::from_millis(1));
        scheduler.schedule(|| Err(anyhow!("boom")), Duration::from_millis(2));
        scheduler.schedule(task(3), Duration::from_millis(3));

        clock.advance(Duration::from_millis(5));
        assert!(scheduler.trigger_due().is_err());
        assert_eq!(*seen.lock(), vec![1]);

        assert_eq!(scheduler.trigger_due().unwrap(), 1);
        assert_eq!(*seen.lock(), vec![1, 3]);
    }

    #[test]
    fn test_task_scheduled_from_a_thunk() {
        let (scheduler, clock) = scheduler();
        let scheduler = Arc::new(scheduler);
        let (seen, task) = recorder();

        let inner = scheduler.clone();
        let follow_up = task(2);
        let first = task(1);
        scheduler.schedule(move || {
            first()?;
            inner.schedule(follow_up, Duration::ZERO);
            Ok(())
        }, Duration::from_millis(5));

        clock.advance(Duration::from_millis(5));
        assert_eq!(scheduler.trigger_due().unwrap(), 2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_clear_cancels_everything() {
        let (scheduler, clock) = scheduler();
        let (seen, task) = recorder();
        let handle = scheduler.schedule(task(1), Duration::from_millis(1));
        scheduler.clear();

        clock.advance(Duration::from_millis(1));
        assert_eq!(scheduler.trigger_due().unwrap(), 0);
        assert!(seen.lock().is_empty());
        assert!(!handle.is_pending());
    }
}
