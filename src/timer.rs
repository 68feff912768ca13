//! Background timers.
//!
//! - [`PausableTimer`]: one-shot, can be paused and resumed without losing
//!   the time already elapsed. Used for delayed sends.
//! - [`RepeatingTimer`]: fires every interval until cancelled. Used for
//!   subscription keepalives.
//!
//! Each timer runs on its own named thread and never blocks its owner.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::signal::StopSignal;

// ---------------------------------------------------------------------------
// PausableTimer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Running { deadline: Instant },
    Paused { remaining: Duration },
    Cancelled,
    Fired,
}

#[derive(Debug)]
struct Shared {
    phase: Mutex<Phase>,
    cond: Condvar,
}

/// One-shot timer that runs `action` after `delay` of *running* time.
#[derive(Debug)]
pub struct PausableTimer {
    shared: Arc<Shared>,
}

impl PausableTimer {
    /// Start counting down immediately.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if `delay` reaches past the
    /// end of the clock.
    pub fn start<F>(delay: Duration, action: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "delay out of range"))?;
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Running { deadline }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("delay-timer".into())
            .spawn(move || {
                if wait_for_deadline(&worker) {
                    action();
                }
            })?;
        Ok(Self { shared })
    }

    /// Freeze the countdown. Returns the remaining time, `None` if the timer
    /// already fired or was cancelled.
    pub fn pause(&self) -> Option<Duration> {
        let mut phase = self.shared.phase.lock();
        match *phase {
            Phase::Running { deadline } => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                *phase = Phase::Paused { remaining };
                self.shared.cond.notify_all();
                Some(remaining)
            }
            Phase::Paused { remaining } => Some(remaining),
            Phase::Cancelled | Phase::Fired => None,
        }
    }

    /// Continue a paused countdown from where it stopped. No-op otherwise.
    pub fn resume(&self) {
        let mut phase = self.shared.phase.lock();
        // A deadline the clock cannot represent stays paused.
        if let Phase::Paused { remaining } = *phase
            && let Some(deadline) = Instant::now().checked_add(remaining)
        {
            *phase = Phase::Running { deadline };
            self.shared.cond.notify_all();
        }
    }

    /// Stop the timer without running its action. No-op once fired.
    pub fn cancel(&self) {
        let mut phase = self.shared.phase.lock();
        if matches!(*phase, Phase::Running { .. } | Phase::Paused { .. }) {
            *phase = Phase::Cancelled;
            self.shared.cond.notify_all();
        }
    }

    /// Time left before the action runs, `None` once fired or cancelled.
    pub fn remaining(&self) -> Option<Duration> {
        match *self.shared.phase.lock() {
            Phase::Running { deadline } => Some(deadline.saturating_duration_since(Instant::now())),
            Phase::Paused { remaining } => Some(remaining),
            Phase::Cancelled | Phase::Fired => None,
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(*self.shared.phase.lock(), Phase::Paused { .. })
    }

    /// Fired or cancelled.
    pub fn is_finished(&self) -> bool {
        matches!(*self.shared.phase.lock(), Phase::Cancelled | Phase::Fired)
    }
}

/// Block until the deadline passes (true) or the timer is cancelled (false).
fn wait_for_deadline(shared: &Shared) -> bool {
    let mut phase = shared.phase.lock();
    loop {
        match *phase {
            Phase::Running { deadline } => {
                if Instant::now() >= deadline {
                    *phase = Phase::Fired;
                    return true;
                }
                shared.cond.wait_until(&mut phase, deadline);
            }
            Phase::Paused { .. } => shared.cond.wait(&mut phase),
            Phase::Cancelled | Phase::Fired => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// RepeatingTimer
// ---------------------------------------------------------------------------

/// Runs `action` every `interval` until cancelled or dropped.
#[derive(Debug)]
pub struct RepeatingTimer {
    stop: StopSignal,
    interval: Duration,
}

impl RepeatingTimer {
    pub fn start<F>(interval: Duration, mut action: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        thread::Builder::new()
            .name("repeat-timer".into())
            .spawn(move || {
                while !waiter.wait_timeout(interval) {
                    action();
                }
            })?;
        Ok(Self { stop, interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cancel(&self) {
        self.stop.set();
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop.set();
    }
}
