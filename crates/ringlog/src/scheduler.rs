//! Consumer scheduling primitives.
//!
//! One [`Scheduler`] per log coordinates the consumer (a background thread
//! in async mode, the caller in sync mode) with producers and flush/cancel
//! requesters:
//!
//! - Producers call [`notify_wake`](Scheduler::notify_wake) when a commit
//!   looks like an empty→non-empty transition; the consumer parks on the
//!   wake condvar with a bounded timeout, so a missed wake costs at most
//!   one poll interval.
//! - [`request_flush`](Scheduler::request_flush) is a single atomic store
//!   and therefore safe to call from a signal handler; the consumer picks
//!   the flag up on its next pass. The blocking flush wrapper in
//!   [`crate::Log::flush`] additionally waits on the pass counter.
//! - Cancellation is cooperative: the consumer observes
//!   [`PendingCancel`](SchedulerState::PendingCancel) at its loop head,
//!   drains once more and transitions to `Finished`.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Lifecycle of a log's consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SchedulerState {
    Init = 0,
    Running = 1,
    PendingCancel = 2,
    Finished = 3,
    Released = 4,
}

impl SchedulerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Running,
            2 => Self::PendingCancel,
            3 => Self::Finished,
            _ => Self::Released,
        }
    }
}

pub(crate) struct Scheduler {
    state: AtomicU8,
    flush_requested: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    passes: Mutex<u64>,
    pass_done: Condvar,
    poll_interval: Duration,
}

impl Scheduler {
    pub(crate) fn new(poll_interval: Duration) -> Self {
        Self {
            state: AtomicU8::new(SchedulerState::Init as u8),
            flush_requested: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            passes: Mutex::new(0),
            pass_done: Condvar::new(),
            poll_interval,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn start(&self) {
        let _ = self.state.compare_exchange(
            SchedulerState::Init as u8,
            SchedulerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Requests cooperative cancellation and wakes the consumer.
    pub(crate) fn cancel(&self) {
        let _ = self.state.compare_exchange(
            SchedulerState::Running as u8,
            SchedulerState::PendingCancel as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.notify_wake();
    }

    pub(crate) fn finish(&self) {
        self.state
            .store(SchedulerState::Finished as u8, Ordering::Release);
        // Unblock any flush() waiting on further passes.
        let _ = self.passes.lock().map(|_guard| self.pass_done.notify_all());
    }

    pub(crate) fn release(&self) {
        self.state
            .store(SchedulerState::Released as u8, Ordering::Release);
    }

    /// Signal-safe flush request: a single atomic store, no locks, no
    /// allocation. The bounded poll guarantees pickup within one interval.
    #[inline]
    pub(crate) fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_flush_request(&self) -> bool {
        self.flush_requested.swap(false, Ordering::AcqRel)
    }

    /// Wakes the consumer; called by producers on an empty→non-empty
    /// commit and by flush/cancel requesters.
    pub(crate) fn notify_wake(&self) {
        let _guard = self
            .wake_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_one();
    }

    /// Parks the consumer until woken or one poll interval elapses.
    pub(crate) fn wait_for_work(&self) {
        let guard = self
            .wake_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .wake
            .wait_timeout(guard, self.poll_interval)
            .map(|(_, _)| ())
            .map_err(|_| ());
    }

    /// Records one completed drain pass.
    pub(crate) fn complete_pass(&self) {
        let mut passes = self.passes.lock().unwrap_or_else(PoisonError::into_inner);
        *passes += 1;
        self.pass_done.notify_all();
    }

    pub(crate) fn completed_passes(&self) -> u64 {
        *self.passes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until at least `target` passes completed, the consumer
    /// finished, or `timeout` elapsed. Returns `true` if the target was
    /// reached.
    pub(crate) fn wait_for_passes(&self, target: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut passes = self.passes.lock().unwrap_or_else(PoisonError::into_inner);
        while *passes < target {
            if matches!(
                self.state(),
                SchedulerState::Finished | SchedulerState::Released
            ) {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .pass_done
                .wait_timeout(passes, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            passes = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let sched = Scheduler::new(Duration::from_millis(1));
        assert_eq!(sched.state(), SchedulerState::Init);
        sched.start();
        assert_eq!(sched.state(), SchedulerState::Running);
        sched.cancel();
        assert_eq!(sched.state(), SchedulerState::PendingCancel);
        sched.finish();
        assert_eq!(sched.state(), SchedulerState::Finished);
        sched.release();
        assert_eq!(sched.state(), SchedulerState::Released);
    }

    #[test]
    fn test_cancel_only_from_running() {
        let sched = Scheduler::new(Duration::from_millis(1));
        sched.cancel(); // still Init
        assert_eq!(sched.state(), SchedulerState::Init);
    }

    #[test]
    fn test_flush_flag_is_taken_once() {
        let sched = Scheduler::new(Duration::from_millis(1));
        assert!(!sched.take_flush_request());
        sched.request_flush();
        assert!(sched.take_flush_request());
        assert!(!sched.take_flush_request());
    }

    #[test]
    fn test_wait_for_passes_times_out() {
        let sched = Scheduler::new(Duration::from_millis(1));
        sched.start();
        assert!(!sched.wait_for_passes(1, Duration::from_millis(10)));
        sched.complete_pass();
        assert!(sched.wait_for_passes(1, Duration::from_millis(10)));
    }

    #[test]
    fn test_bounded_wait_returns_without_wake() {
        let sched = Scheduler::new(Duration::from_millis(2));
        let start = std::time::Instant::now();
        sched.wait_for_work();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
