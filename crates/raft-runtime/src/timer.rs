//! # timer
//!
//! why: election and heartbeat timing must be swappable for a deterministic clock in tests
//! relations: used by raft.rs; durations come from raft_core::timer
//! what: Scheduler trait, TimerHandle, TokioScheduler, VirtualScheduler

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Schedule-once / schedule-repeating / cancel.
///
/// Callbacks run without any scheduler lock held and must not block.
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, task: TimerCallback) -> TimerHandle;

    /// First fire happens after one full `interval`
    fn schedule_repeating(&self, interval: Duration, task: TimerCallback) -> TimerHandle;
}

/// Cancels its timer when cancelled explicitly or dropped
#[must_use = "dropping a TimerHandle cancels the timer"]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, task: Option<AbortHandle>) -> Self {
        Self { cancelled, task }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// -- tokio --

/// Wall-clock timers on the tokio runtime (virtual under a paused clock)
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }

    fn schedule_repeating(&self, interval: Duration, task: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                task();
            }
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }
}

// -- virtual clock --

struct Scheduled {
    task: TimerCallback,
    every: Option<Duration>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct VirtualState {
    now: Duration,
    seq: u64,
    timers: BTreeMap<(Duration, u64), Scheduled>,
}

impl VirtualState {
    fn insert(&mut self, at: Duration, scheduled: Scheduled) {
        self.seq += 1;
        self.timers.insert((at, self.seq), scheduled);
    }
}

/// Manually advanced clock. Nothing fires until `advance` is called.
///
/// Timers due at the same instant fire in scheduling order.
#[derive(Default, Clone)]
pub struct VirtualScheduler {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since the scheduler was created
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of live (not cancelled) timers
    pub fn pending(&self) -> usize {
        self.lock()
            .timers
            .values()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Move the clock forward, firing every timer that falls due on the way
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        loop {
            let due = {
                let mut state = self.lock();
                let Some((&key, _)) = state.timers.iter().next() else {
                    break;
                };
                if key.0 > target {
                    break;
                }
                let Some(scheduled) = state.timers.remove(&key) else {
                    break;
                };
                state.now = key.0;
                if scheduled.cancelled.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(every) = scheduled.every {
                    let again = Scheduled {
                        task: scheduled.task.clone(),
                        every: scheduled.every,
                        cancelled: scheduled.cancelled.clone(),
                    };
                    state.insert(key.0 + every, again);
                }
                scheduled.task
            };
            due();
        }
        self.lock().now = target;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule(&self, delay: Duration, every: Option<Duration>, task: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let at = state.now + delay;
        state.insert(
            at,
            Scheduled {
                task,
                every,
                cancelled: cancelled.clone(),
            },
        );
        TimerHandle::new(cancelled, None)
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule_once(&self, delay: Duration, task: TimerCallback) -> TimerHandle {
        self.schedule(delay, None, task)
    }

    fn schedule_repeating(&self, interval: Duration, task: TimerCallback) -> TimerHandle {
        self.schedule(interval, Some(interval.max(Duration::from_millis(1))), task)
    }
}
