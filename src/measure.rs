use hdrhistogram::{CreationError, Histogram};
use std::time::Duration;

// 1ns to 1,000s
const MAX_LAG_NANOS: u64 = 1_000_000_000_000;

/// Summary of recorded lags, in nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct LagStats {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p99: u64,
    pub p999: u64,
}

/// Records how late periodic work ran relative to its schedule.
///
/// The rotation worker feeds it the delay between a tick's deadline and the moment the
/// bucket was actually cleared.
pub struct LagMeasurer {
    histogram: Histogram<u64>,
}

impl LagMeasurer {
    pub fn new() -> Result<Self, CreationError> {
        // 3 significant figures
        let histogram = Histogram::<u64>::new_with_bounds(1, MAX_LAG_NANOS, 3)?;
        Ok(Self { histogram })
    }

    pub fn record(&mut self, lag: Duration) {
        let nanos = u64::try_from(lag.as_nanos()).unwrap_or(u64::MAX);
        self.histogram
            .saturating_record(nanos.clamp(1, MAX_LAG_NANOS));
    }

    pub fn stats(&self) -> LagStats {
        let count = self.histogram.len();
        if count == 0 {
            return LagStats::default();
        }

        LagStats {
            count,
            min: self.histogram.min(),
            max: self.histogram.max(),
            mean: self.histogram.mean(),
            p50: self.histogram.value_at_quantile(0.5),
            p99: self.histogram.value_at_quantile(0.99),
            p999: self.histogram.value_at_quantile(0.999),
        }
    }

    pub fn format_stats(&self) -> String {
        let stats = self.stats();
        if stats.count == 0 {
            return "No samples recorded".into();
        }

        format!(
            "\tsamples={},\tmin={},\tmax={},\tmean={},\tp50={},\tp99={},\tp999={}",
            stats.count,
            format_duration(stats.min as f64),
            format_duration(stats.max as f64),
            format_duration(stats.mean),
            format_duration(stats.p50 as f64),
            format_duration(stats.p99 as f64),
            format_duration(stats.p999 as f64),
        )
    }
}

fn format_duration(nanos: f64) -> String {
    if nanos < 1000.0 {
        format!("{:.1}ns", nanos)
    } else if nanos < 1_000_000.0 {
        format!("{:.1}us", nanos / 1000.0)
    } else if nanos < 1_000_000_000.0 {
        format!("{:.1}ms", nanos / 1_000_000.0)
    } else {
        format!("{:.2}s", nanos / 1_000_000_000.0)
    }
}
