use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A single-use broadcast signal.
///
/// Every clone observes the same signal. The first [`raise`](Interrupt::raise) releases all
/// current and future waiters at once; later raises are no-ops. Components that must react to
/// shutdown take an `Interrupt` explicitly instead of reaching for process-wide state.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    raised: Mutex<bool>,
    released: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Returns `true` only for the call that actually raised it.
    pub fn raise(&self) -> bool {
        let mut raised = self.lock();
        if *raised {
            return false;
        }
        *raised = true;
        self.inner.released.notify_all();
        true
    }

    pub fn is_raised(&self) -> bool {
        *self.lock()
    }

    /// Blocks the calling thread until the signal is raised.
    pub fn wait(&self) {
        let mut raised = self.lock();
        while !*raised {
            raised = self
                .inner
                .released
                .wait(raised)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits at most `timeout`. Returns whether the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Waits until `deadline`. Returns whether the signal was raised.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut raised = self.lock();
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .released
                .wait_timeout(raised, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            raised = guard;
        }
        true
    }

    // The guarded value is a plain flag, so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner
            .raised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_raise_only_once() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.is_raised());
        assert!(interrupt.raise());
        assert!(!interrupt.raise());
        assert!(interrupt.is_raised());
    }

    #[test]
    fn test_clones_share_signal() {
        let interrupt = Interrupt::new();
        let other = interrupt.clone();
        other.raise();
        assert!(interrupt.is_raised());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let interrupt = Interrupt::new();
        let start = Instant::now();
        assert!(!interrupt.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_after_raise_returns_immediately() {
        let interrupt = Interrupt::new();
        interrupt.raise();
        interrupt.wait();
        assert!(interrupt.wait_timeout(Duration::from_secs(60)));
        assert!(interrupt.wait_until(Instant::now()));
    }

    #[test]
    fn test_raise_releases_all_waiters() {
        let interrupt = Interrupt::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let interrupt = interrupt.clone();
                thread::spawn(move || interrupt.wait_timeout(Duration::from_secs(10)))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        interrupt.raise();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }
}
