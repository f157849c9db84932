//! Shared bookkeeping for scheduler ticks.

use std::sync::atomic::{AtomicBool, Ordering};

/// Marks a scheduler as mid-tick. Dropping it clears the flag, including when
/// the tick returns early with an error.
pub(crate) struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunningGuard<'a> {
    /// `None` if a tick is already running on `flag`.
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Messages accepted by the mailer.
    pub sent: u32,
    /// Transient failures left pending for a later attempt.
    pub retried: u32,
    /// Sends that went terminal-failed (permanent, or retries exhausted).
    pub failed: u32,
    /// Work retired without a send (suppressed recipient).
    pub skipped: u32,
    /// Transmissions that moved `scheduled -> processing`.
    pub started: u32,
    /// Transmissions that completed.
    pub completed: u32,
    /// The rate limiter denied a slot and the rest of the tick was deferred.
    pub deferred: bool,
    /// The tick did not run because the previous one was still in flight.
    pub overlapped: bool,
}

impl TickReport {
    pub(crate) fn overlapped() -> Self {
        Self {
            overlapped: true,
            ..Self::default()
        }
    }

    /// Whether the tick touched anything.
    pub fn is_idle(&self) -> bool {
        self.sent + self.retried + self.failed + self.skipped + self.started + self.completed == 0
    }
}
