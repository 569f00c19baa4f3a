//! Timer scheduling behind an injectable clock.
//!
//! The simulator never touches the runtime's timers directly; it asks a
//! `Scheduler` to run a task after a delay. Two implementations share one
//! ordered queue:
//! - `TokioScheduler`: a single driver task sleeping until the next deadline.
//!   Works with `tokio::time::pause()` for deterministic tests.
//! - `ManualScheduler`: a virtual clock that only moves when `advance` is
//!   called.
//!
//! Tasks due at the same instant run in the order they were scheduled.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle returned by `Scheduler::after`, used to cancel the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

pub trait Scheduler: Send + Sync {
    /// Time elapsed since the scheduler was created.
    fn now(&self) -> Duration;

    /// Run `task` once `delay` has elapsed.
    fn after(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Cancel a pending timer. Returns false if it already ran or was cancelled.
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// Pending timers ordered by (deadline, sequence).
#[derive(Default)]
struct TimerQueue {
    next_seq: u64,
    timers: BTreeMap<(Duration, u64), Task>,
    deadlines: HashMap<u64, Duration>,
}

impl TimerQueue {
    fn push(&mut self, deadline: Duration, task: Task) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert((deadline, seq), task);
        self.deadlines.insert(seq, deadline);
        TimerHandle(seq)
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(deadline) => self.timers.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest task if it is due at or before `now`.
    fn pop_due(&mut self, now: Duration) -> Option<(Duration, Task)> {
        let (deadline, seq) = *self.timers.keys().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&seq);
        self.timers
            .remove(&(deadline, seq))
            .map(|task| (deadline, task))
    }

    fn len(&self) -> usize {
        self.timers.len()
    }
}

// ============================================================================
// Tokio-driven scheduler
// ============================================================================

struct Shared {
    origin: Instant,
    queue: Mutex<TimerQueue>,
    wake: Notify,
}

impl Shared {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Scheduler backed by the tokio clock.
///
/// Must be created inside a tokio runtime. Dropping it stops the driver and
/// discards every pending timer.
pub struct TokioScheduler {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            origin: Instant::now(),
            queue: Mutex::new(TimerQueue::default()),
            wake: Notify::new(),
        });
        let driver = tokio::spawn(Self::drive(shared.clone()));
        Self { shared, driver }
    }

    async fn drive(shared: Arc<Shared>) {
        loop {
            let next = shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .next_deadline();

            match next {
                None => shared.wake.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(shared.origin + deadline) => {}
                        _ = shared.wake.notified() => continue,
                    }
                }
            }

            loop {
                let now = shared.now();
                let due = shared
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_due(now);
                match due {
                    Some((_, task)) => task(),
                    None => break,
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Duration {
        self.shared.now()
    }

    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let deadline = self.shared.now() + delay;
        let handle = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(deadline, task);
        self.shared.wake.notify_one();
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel(handle)
    }
}

// ============================================================================
// Manual virtual clock
// ============================================================================

struct ManualState {
    now: Duration,
    queue: TimerQueue,
}

/// Virtual clock for tests. Nothing runs until `advance` is called.
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                queue: TimerQueue::default(),
            }),
        }
    }

    /// Move the clock forward by `by`, running every task that comes due.
    ///
    /// Tasks scheduled by running tasks also run if they fall inside the
    /// window. Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().now + by;
        let mut ran = 0;
        loop {
            let due = {
                let mut state = self.lock();
                let due = state.queue.pop_due(target);
                if let Some((deadline, _)) = &due {
                    state.now = state.now.max(*deadline);
                }
                due
            };
            match due {
                Some((_, task)) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        self.lock().now = target;
        ran
    }

    /// Run every pending task, jumping the clock to each deadline in turn.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let state = self.lock();
                state
                    .queue
                    .next_deadline()
                    .map(|deadline| deadline.saturating_sub(state.now))
            };
            match next {
                Some(delta) => ran += self.advance(delta),
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Duration {
        self.lock().now
    }

    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let mut state = self.lock();
        let deadline = state.now + delay;
        state.queue.push(deadline, task)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.lock().queue.cancel(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |label: &'static str| -> Task {
            let log = log_clone.clone();
            Box::new(move || log.lock().unwrap().push(label))
        };
        (log, make)
    }

    // ==================== Manual clock ====================

    #[test]
    fn test_runs_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        scheduler.after(Duration::from_millis(30), task("c"));
        scheduler.after(Duration::from_millis(10), task("a"));
        scheduler.after(Duration::from_millis(20), task("b"));

        assert_eq!(scheduler.advance(Duration::from_millis(100)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_equal_deadlines_keep_schedule_order() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        scheduler.after(Duration::from_millis(5), task("first"));
        scheduler.after(Duration::from_millis(5), task("second"));
        scheduler.after(Duration::from_millis(5), task("third"));

        scheduler.advance(Duration::from_millis(5));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_nothing_runs_before_deadline() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        scheduler.after(Duration::from_millis(10), task("late"));
        assert_eq!(scheduler.advance(Duration::from_millis(9)), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(scheduler.now(), Duration::from_millis(9));

        assert_eq!(scheduler.advance(Duration::from_millis(1)), 1);
    }

    #[test]
    fn test_cancel_prevents_run() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        let handle = scheduler.after(Duration::from_millis(10), task("cancelled"));
        scheduler.after(Duration::from_millis(10), task("kept"));

        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }

    #[test]
    fn test_task_scheduled_by_task_runs_in_window() {
        let scheduler = Arc::new(ManualScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = scheduler.clone();
        let inner_count = count.clone();
        scheduler.after(
            Duration::from_millis(10),
            Box::new(move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
                let count = inner_count.clone();
                inner_scheduler.after(
                    Duration::from_millis(10),
                    Box::new(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        scheduler.advance(Duration::from_millis(15));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.advance(Duration::from_millis(5));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_until_idle() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        scheduler.after(Duration::from_secs(3), task("b"));
        scheduler.after(Duration::from_secs(1), task("a"));

        assert_eq!(scheduler.run_until_idle(), 2);
        assert_eq!(scheduler.now(), Duration::from_secs(3));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(scheduler.pending(), 0);
    }

    // ==================== Tokio driver ====================

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_in_order() {
        let scheduler = TokioScheduler::new();
        let (log, task) = recorder();

        scheduler.after(Duration::from_millis(50), task("b"));
        scheduler.after(Duration::from_millis(10), task("a"));
        scheduler.after(Duration::from_millis(50), task("c"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel() {
        let scheduler = TokioScheduler::new();
        let (log, task) = recorder();

        let handle = scheduler.after(Duration::from_millis(10), task("never"));
        assert!(scheduler.cancel(handle));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_picks_up_earlier_timer() {
        let scheduler = TokioScheduler::new();
        let (log, task) = recorder();

        scheduler.after(Duration::from_secs(10), task("slow"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        scheduler.after(Duration::from_millis(5), task("fast"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock().unwrap(), vec!["fast"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*log.lock().unwrap(), vec!["fast", "slow"]);
    }
}
