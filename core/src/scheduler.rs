//! One-shot delayed callbacks and the clock they run against.
//!
//! # Design
//! Polling waits are scheduled callbacks, never blocking sleeps. A
//! `Scheduler` runs a task once after a delay unless its `TimerHandle` was
//! cancelled first. Implementations must never run the task from inside
//! `schedule` itself, since callers may hold their own state lock while
//! arming a timer.
//!
//! `TokioScheduler` runs timers on a tokio runtime. `ManualScheduler` is a
//! virtual clock: time only moves when `advance` is called, and due tasks
//! run on the caller's thread in deadline order.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A task run by a scheduler.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Clock plus one-shot timers.
pub trait Scheduler: Send + Sync + 'static {
    fn now(&self) -> Instant;

    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle;
}

/// Cancels a pending scheduled task. Dropping the handle does not cancel.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self {
            cancelled,
            on_cancel: None,
        }
    }

    /// Extra work to do on cancellation, such as aborting a runtime task.
    pub fn with_on_cancel(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    /// Prevent the task from running if it has not started yet.
    pub fn cancel(mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(f) = self.on_cancel.take() {
            f();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scheduler backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime the caller is running on.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });
        TimerHandle::new(cancelled).with_on_cancel(move || join.abort())
    }
}

struct TimerEntry {
    deadline: Duration,
    generation: u64,
    cancelled: Arc<AtomicBool>,
    task: ScheduledTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap: earliest deadline, then earliest insertion.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    next_generation: u64,
    timers: BinaryHeap<TimerEntry>,
    /// Heap size at which `schedule` next sweeps out cancelled entries.
    compact_at: usize,
}

impl ManualState {
    /// Take cancelled entries out of the heap. The caller drops them after
    /// releasing the lock, since dropping a task may run arbitrary code.
    fn compact(&mut self) -> Vec<TimerEntry> {
        let (live, cancelled): (Vec<_>, Vec<_>) = std::mem::take(&mut self.timers)
            .into_vec()
            .into_iter()
            .partition(|t| !t.cancelled.load(Ordering::SeqCst));
        self.timers = BinaryHeap::from(live);
        self.compact_at = (self.timers.len() * 2).max(64);
        cancelled
    }

    /// Pop the next entry due by `target`, cancelled or not.
    fn pop_due(&mut self, target: Duration) -> Option<TimerEntry> {
        if self.timers.peek()?.deadline > target {
            return None;
        }
        let entry = self.timers.pop()?;
        self.elapsed = self.elapsed.max(entry.deadline);
        Some(entry)
    }
}

/// Virtual-time scheduler for deterministic tests and simulations.
pub struct ManualScheduler {
    origin: Instant,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Number of timers that are armed and not cancelled.
    pub fn pending(&self) -> usize {
        let mut state = self.state.lock();
        let cancelled = state.compact();
        let pending = state.timers.len();
        drop(state);
        drop(cancelled);
        pending
    }

    /// Move time forward by `by`, running every task that falls due,
    /// including tasks scheduled by tasks run during this call.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().elapsed + by;
        loop {
            let entry = self.state.lock().pop_due(target);
            let Some(entry) = entry else { break };
            if !entry.cancelled.load(Ordering::SeqCst) {
                (entry.task)();
            }
        }
        let mut state = self.state.lock();
        state.elapsed = state.elapsed.max(target);
    }

    /// Run tasks that are due right now without moving time.
    pub fn run_due(&self) {
        self.advance(Duration::ZERO);
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("elapsed", &self.elapsed())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }

    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        let swept = if state.timers.len() >= state.compact_at {
            state.compact()
        } else {
            Vec::new()
        };
        let generation = state.next_generation;
        state.next_generation += 1;
        let deadline = state.elapsed + delay;
        state.timers.push(TimerEntry {
            deadline,
            generation,
            cancelled: cancelled.clone(),
            task,
        });
        drop(state);
        drop(swept);
        TimerHandle::new(cancelled)
    }
}
