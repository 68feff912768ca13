//! Cooperative stop flag shared by the dispatcher, its workers and timers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Cloneable, set-once stop flag.
///
/// Besides polling with [`is_set`](Self::is_set), holders can sleep with
/// [`wait_timeout`](Self::wait_timeout), which returns early once the flag
/// is raised. Workers use that for their retry backoff so `stop` does not
/// have to wait out a full retry interval.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter. Idempotent.
    pub fn set(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleep up to `timeout`. Returns `true` if the flag is (or becomes) set.
    ///
    /// A timeout past the end of the clock waits for the flag only.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut stopped = self.inner.stopped.lock();
        while !*stopped {
            match deadline {
                Some(d) => {
                    if self.inner.cond.wait_until(&mut stopped, d).timed_out() {
                        break;
                    }
                }
                None => self.inner.cond.wait(&mut stopped),
            }
        }
        *stopped
    }
}
