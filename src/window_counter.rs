use crate::error::CounterError;
use crate::interrupt::Interrupt;
use crate::measure::LagMeasurer;
use crate::ticker::Ticker;
use spdlog::{debug, info, warn};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Options for a [`WindowedCounter`].
#[derive(Debug, Clone)]
pub struct CounterOptions {
    /// Used to name the rotation thread and tag its log lines.
    pub name: String,
    /// Record how late each rotation tick runs and log the summary when rotation stops.
    pub rotation_stats: bool,
}

impl Default for CounterOptions {
    fn default() -> Self {
        Self {
            name: "counter".into(),
            rotation_stats: false,
        }
    }
}

/// Maps a timestamp to the bucket that is current at that time:
/// `floor(nanos / segment_nanos) mod bucket_count`.
#[inline(always)]
pub fn segment_index(nanos: u64, segment_nanos: u64, bucket_count: usize) -> usize {
    ((nanos / segment_nanos) % bucket_count as u64) as usize
}

/// Wall-clock time in nanoseconds since the UNIX epoch. Clocks set before the epoch read as 0.
#[inline(always)]
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

struct Ring {
    cells: Box<[AtomicI64]>,
    segment_nanos: u64,
    rotations: AtomicU64,
}

impl Ring {
    #[inline(always)]
    fn index_at(&self, nanos: u64) -> usize {
        segment_index(nanos, self.segment_nanos, self.cells.len())
    }

    fn clear_at(&self, nanos: u64) -> usize {
        let index = self.index_at(nanos);
        self.cells[index].store(0, Ordering::Relaxed);
        index
    }
}

/// Counts events over a trailing time window.
///
/// The window is split into `buckets` segments of `window / buckets` each, backed by a ring
/// of `buckets + 1` atomic cells. Writers add to the cell of the current segment, readers sum
/// every other cell, and a background thread zeroes the current cell once per segment.
///
/// ## Consistency
///
/// There is no lock over the ring. [`count`](Self::count) loads cells one at a time and may
/// combine values from different instants. The rotation tick is not phase-locked to segment
/// boundaries: it clears whichever cell is current when it fires, so adds made earlier in
/// that segment are dropped, and an add racing a tick at a seam can be lost. The spare cell
/// hides up to one segment of extra history from readers.
///
/// ## Overflow
///
/// Cells are `i64` and wrap on overflow, as does the sum returned by `count`.
///
/// ## Stopping
///
/// [`stop`](Self::stop) ends rotation. `add` and `count` keep working afterwards, but nothing
/// is evicted any more and `count` grows to cover every add ever made. Dropping the counter
/// stops and joins the rotation thread.
pub struct WindowedCounter {
    window: Duration,
    ring: Arc<Ring>,
    stop: Interrupt,
    rotation: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WindowedCounter {
    /// Creates a counter over `window` with `buckets` visible segments and starts rotation.
    pub fn new(window: Duration, buckets: usize) -> Result<Self, CounterError> {
        Self::with_options(window, buckets, CounterOptions::default())
    }

    pub fn with_options(
        window: Duration,
        buckets: usize,
        options: CounterOptions,
    ) -> Result<Self, CounterError> {
        if buckets < 1 {
            return Err(CounterError::InvalidConfiguration(
                "bucket count must be at least 1".into(),
            ));
        }
        let bucket_count = buckets.checked_add(1).ok_or_else(|| {
            CounterError::InvalidConfiguration(format!("bucket count {} is too large", buckets))
        })?;

        // Truncating division: segment boundaries must match floor(window / buckets).
        let segment_nanos = window.as_nanos() / buckets as u128;
        if segment_nanos == 0 {
            return Err(CounterError::InvalidConfiguration(format!(
                "window {:?} split into {} buckets leaves a zero-length segment",
                window, buckets
            )));
        }
        let segment_nanos = u64::try_from(segment_nanos).map_err(|_| {
            CounterError::InvalidConfiguration(format!(
                "segment of {}ns does not fit in 64 bits",
                segment_nanos
            ))
        })?;

        let ring = Arc::new(Ring {
            cells: (0..bucket_count).map(|_| AtomicI64::new(0)).collect(),
            segment_nanos,
            rotations: AtomicU64::new(0),
        });
        let stop = Interrupt::new();

        let handle = {
            let ring = ring.clone();
            let stop = stop.clone();
            let thread_name = format!("{}-rotation", options.name);
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || run_rotation(ring, stop, options))
                .map_err(|err| CounterError::Spawn(err.to_string()))?
        };

        debug!(
            "windowed counter started: window={:?}, segment={}ns, buckets={}",
            window, segment_nanos, bucket_count
        );

        Ok(Self {
            window,
            ring,
            stop,
            rotation: Mutex::new(Some(handle)),
        })
    }

    /// Adds `delta` to the bucket of the current segment.
    #[inline(always)]
    pub fn add(&self, delta: i64) {
        self.add_at(unix_nanos(), delta);
    }

    /// Adds `delta` to the bucket that is current at `nanos` (nanoseconds since the UNIX epoch).
    #[inline(always)]
    pub fn add_at(&self, nanos: u64, delta: i64) {
        let index = self.ring.index_at(nanos);
        self.ring.cells[index].fetch_add(delta, Ordering::Relaxed);
    }

    /// Sum of every bucket except the current one.
    #[inline(always)]
    pub fn count(&self) -> i64 {
        self.count_at(unix_nanos())
    }

    /// Sum of every bucket except the one that is current at `nanos`.
    pub fn count_at(&self, nanos: u64) -> i64 {
        let current = self.ring.index_at(nanos);
        self.ring
            .cells
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != current)
            .fold(0i64, |sum, (_, cell)| {
                sum.wrapping_add(cell.load(Ordering::Relaxed))
            })
    }

    /// The rotation step: zeroes the bucket that is current at `nanos` and returns its index.
    pub fn rotate_at(&self, nanos: u64) -> usize {
        self.ring.clear_at(nanos)
    }

    /// Stops the rotation thread and waits for it to exit. Safe to call more than once.
    pub fn stop(&self) {
        if self.stop.raise() {
            debug!("windowed counter stopping");
        }
        let handle = self
            .rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("rotation worker panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_raised()
    }

    /// Number of buckets in the ring, one more than requested.
    pub fn bucket_count(&self) -> usize {
        self.ring.cells.len()
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_nanos(self.ring.segment_nanos)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of ticks the rotation thread has processed. Manual [`rotate_at`](Self::rotate_at)
    /// calls are not counted.
    pub fn rotations(&self) -> u64 {
        self.ring.rotations.load(Ordering::Relaxed)
    }
}

impl Debug for WindowedCounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let values = self
            .ring
            .cells
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect::<Vec<_>>();

        f.debug_struct("WindowedCounter")
            .field("window", &self.window)
            .field("segment_nanos", &self.ring.segment_nanos)
            .field("buckets", &values)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for WindowedCounter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_rotation(ring: Arc<Ring>, stop: Interrupt, options: CounterOptions) {
    let mut ticker = Ticker::new(Duration::from_nanos(ring.segment_nanos));
    let mut lag = if options.rotation_stats {
        match LagMeasurer::new() {
            Ok(measurer) => Some(measurer),
            Err(err) => {
                warn!("[Rotation:{}] stats disabled: {}", options.name, err);
                None
            }
        }
    } else {
        None
    };

    while let Some(deadline) = ticker.tick(&stop) {
        ring.clear_at(unix_nanos());
        ring.rotations.fetch_add(1, Ordering::Relaxed);
        if let Some(measurer) = lag.as_mut() {
            measurer.record(deadline.elapsed());
        }
    }

    debug!(
        "[Rotation:{}] stopped after {} ticks",
        options.name,
        ring.rotations.load(Ordering::Relaxed)
    );
    if let Some(measurer) = lag {
        info!("[Rotation:{}]{}", options.name, measurer.format_stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    // One hour over 4 buckets: the first rotation tick is 15 minutes away, so explicit
    // timestamps are never disturbed by the background thread.
    fn quiet_counter() -> WindowedCounter {
        WindowedCounter::new(HOUR, 4).unwrap()
    }

    fn segment() -> u64 {
        (HOUR / 4).as_nanos() as u64
    }

    #[test]
    fn test_bucket_count_is_one_more_than_requested() {
        for buckets in [1, 2, 5, 60] {
            let counter = WindowedCounter::new(Duration::from_secs(60), buckets).unwrap();
            assert_eq!(counter.bucket_count(), buckets + 1);
        }
    }

    #[test]
    fn test_segment_duration_truncates() {
        let counter = WindowedCounter::new(Duration::from_nanos(1_000), 3).unwrap();
        assert_eq!(counter.segment_duration(), Duration::from_nanos(333));
        assert_eq!(counter.window(), Duration::from_nanos(1_000));
    }

    #[test]
    fn test_zero_buckets_rejected() {
        assert!(matches!(
            WindowedCounter::new(Duration::from_secs(1), 0),
            Err(CounterError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_zero_segment_rejected() {
        assert!(matches!(
            WindowedCounter::new(Duration::from_nanos(4), 5),
            Err(CounterError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            WindowedCounter::new(Duration::ZERO, 1),
            Err(CounterError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_bucket_count_overflow_rejected() {
        assert!(matches!(
            WindowedCounter::new(Duration::MAX, usize::MAX),
            Err(CounterError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_oversized_segment_rejected() {
        assert!(matches!(
            WindowedCounter::new(Duration::MAX, 1),
            Err(CounterError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_segment_index() {
        assert_eq!(segment_index(0, 10, 3), 0);
        assert_eq!(segment_index(9, 10, 3), 0);
        assert_eq!(segment_index(10, 10, 3), 1);
        assert_eq!(segment_index(29, 10, 3), 2);
        assert_eq!(segment_index(30, 10, 3), 0);
    }

    #[test]
    fn test_current_bucket_excluded() {
        let counter = quiet_counter();
        let t = 7 * segment();

        counter.add_at(t, 5);
        assert_eq!(counter.count_at(t), 0);
        assert_eq!(counter.count_at(t + segment() - 1), 0);
        assert_eq!(counter.count_at(t + segment()), 5);
    }

    #[test]
    fn test_count_sums_past_segments() {
        let counter = quiet_counter();
        let s = segment();

        counter.add_at(0, 1);
        counter.add_at(s, 2);
        counter.add_at(s + 1, 2);
        counter.add_at(2 * s, 4);
        counter.add_at(3 * s, 8);

        // At segment 4 every previous bucket is visible.
        assert_eq!(counter.count_at(4 * s), 1 + 4 + 4 + 8);
        // At segment 3 the bucket for 3s is current.
        assert_eq!(counter.count_at(3 * s), 1 + 4 + 4);
    }

    #[test]
    fn test_index_wraps_to_stale_bucket() {
        let counter = quiet_counter();
        let s = segment();

        counter.add_at(0, 3);
        // 5 buckets: segment 5 maps onto bucket 0 again.
        assert_eq!(counter.count_at(5 * s), 0);
        assert_eq!(counter.count_at(6 * s), 3);
    }

    #[test]
    fn test_rotate_at_clears_current_bucket_only() {
        let counter = quiet_counter();
        let s = segment();

        counter.add_at(0, 3);
        counter.add_at(s, 4);

        assert_eq!(counter.rotate_at(5 * s), 0);
        assert_eq!(counter.count_at(2 * s), 4);
        assert_eq!(counter.rotations(), 0);
    }

    fn wait_for_tick(counter: &WindowedCounter) -> u64 {
        let seen = counter.rotations();
        while counter.rotations() == seen {
            thread::yield_now();
        }
        unix_nanos()
    }

    #[test]
    fn test_worker_clears_bucket_current_at_tick() {
        // A tick closer than this to a segment boundary cannot be attributed to one index.
        const SLACK_NANOS: u64 = 2_000_000;

        for _ in 0..20 {
            // 50ms segments over 6 buckets; each attempt gets a fresh tick phase.
            let counter = WindowedCounter::new(Duration::from_millis(250), 5).unwrap();
            wait_for_tick(&counter);
            for cell in counter.ring.cells.iter() {
                cell.store(1, Ordering::Relaxed);
            }

            let ticked = wait_for_tick(&counter);
            let expected = counter.ring.index_at(ticked);
            if counter.ring.index_at(ticked - SLACK_NANOS) != expected {
                continue;
            }

            let cleared = counter
                .ring
                .cells
                .iter()
                .enumerate()
                .filter(|(_, cell)| cell.load(Ordering::Relaxed) == 0)
                .map(|(index, _)| index)
                .collect::<Vec<_>>();
            assert_eq!(cleared, vec![expected]);
            return;
        }
        panic!("every attempt ticked next to a segment boundary");
    }

    #[test]
    fn test_negative_delta() {
        let counter = quiet_counter();
        counter.add_at(0, 10);
        counter.add_at(0, -4);
        assert_eq!(counter.count_at(segment()), 6);
    }

    #[test]
    fn test_overflow_wraps() {
        let counter = quiet_counter();
        let s = segment();

        counter.add_at(0, i64::MAX);
        counter.add_at(0, 1);
        assert_eq!(counter.count_at(s), i64::MIN);

        counter.add_at(s, 1);
        assert_eq!(counter.count_at(2 * s), i64::MIN + 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let counter = quiet_counter();
        assert!(counter.is_running());
        counter.stop();
        counter.stop();
        assert!(!counter.is_running());

        counter.add_at(0, 2);
        assert_eq!(counter.count_at(segment()), 2);
    }

    #[test]
    fn test_debug_lists_buckets() {
        let counter = quiet_counter();
        counter.add_at(segment(), 9);
        let debug = format!("{:?}", counter);
        assert!(debug.contains("buckets: [0, 9, 0, 0, 0]"));
        assert!(debug.contains("running: true"));
    }
}
