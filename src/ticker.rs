use crate::interrupt::Interrupt;
use std::time::{Duration, Instant};

/// Fixed-period ticker aligned to its start instant.
///
/// Deadlines are `start + k * period`. A consumer that falls behind does not receive a burst
/// of catch-up ticks: missed deadlines are skipped and the next tick lands on the grid.
pub(crate) struct Ticker {
    period: Duration,
    next: Option<Instant>,
}

impl Ticker {
    pub(crate) fn new(period: Duration) -> Self {
        assert!(!period.is_zero(), "period must be positive");
        Self {
            period,
            next: Instant::now().checked_add(period),
        }
    }

    /// Blocks until the next deadline. Returns the deadline that fired, or `None` once
    /// `interrupt` is raised.
    pub(crate) fn tick(&mut self, interrupt: &Interrupt) -> Option<Instant> {
        let Some(deadline) = self.next else {
            // Deadline past the representable range: only an interrupt can end the wait.
            interrupt.wait();
            return None;
        };
        if interrupt.wait_until(deadline) {
            return None;
        }
        self.next = self.following(deadline, Instant::now());
        Some(deadline)
    }

    fn following(&self, fired: Instant, now: Instant) -> Option<Instant> {
        let next = fired.checked_add(self.period)?;
        if next > now {
            return Some(next);
        }
        let behind = (now - next).as_nanos() % self.period.as_nanos();
        // behind < period, and period fits in u64 nanos.
        now.checked_add(self.period - Duration::from_nanos(behind as u64))
    }
}
