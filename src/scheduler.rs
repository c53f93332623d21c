//! Cancellable one-shot timer and the adaptive poll-interval decision.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::types::health::ServiceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed(Instant),
    Cancelled,
}

/// A single re-armable deadline.
///
/// `arm` replaces any pending deadline, `disarm` clears it, and `cancel`
/// wakes every waiter with `false` until the timer is armed again.
#[derive(Debug)]
pub struct Timer {
    tx: watch::Sender<TimerState>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TimerState::Idle);
        Self { tx }
    }

    /// Schedule the next tick `after` from now.
    pub fn arm(&self, after: Duration) {
        self.tx.send_replace(TimerState::Armed(Instant::now() + after));
    }

    pub fn disarm(&self) {
        self.tx.send_replace(TimerState::Idle);
    }

    pub fn cancel(&self) {
        self.tx.send_replace(TimerState::Cancelled);
    }

    pub fn is_armed(&self) -> bool {
        matches!(*self.tx.borrow(), TimerState::Armed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.tx.borrow(), TimerState::Cancelled)
    }

    /// Time left before the armed deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        match *self.tx.borrow() {
            TimerState::Armed(deadline) => {
                Some(deadline.saturating_duration_since(Instant::now()))
            }
            TimerState::Idle | TimerState::Cancelled => None,
        }
    }

    /// Wait for the armed deadline. Returns `true` when it fires and `false`
    /// when the timer is cancelled. While idle, waits for the next `arm`.
    pub async fn wait(&self) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                TimerState::Cancelled => return false,
                TimerState::Idle => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
                TimerState::Armed(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let mut fired = false;
                            self.tx.send_if_modified(|current| {
                                if *current == TimerState::Armed(deadline) {
                                    *current = TimerState::Idle;
                                    fired = true;
                                    true
                                } else {
                                    false
                                }
                            });
                            if fired {
                                return true;
                            }
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Interval for the next health cycle: `fast` while any service is in the
/// problem set, `base` otherwise.
pub fn next_interval<'a, I>(statuses: I, base: Duration, fast: Duration) -> Duration
where
    I: IntoIterator<Item = &'a ServiceStatus>,
{
    if statuses.into_iter().any(|s| s.is_problem()) {
        fast
    } else {
        base
    }
}
