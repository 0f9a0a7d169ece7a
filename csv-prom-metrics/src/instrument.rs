use std::sync::Arc;

use parking_lot::Mutex;
use quanta::Instant;

use crate::label::LabelSet;

/// Errors raised by value updates. These never abort the calling parser task
/// (spec §4.3.3 "Unknown metric names ... are a programming error" is
/// enforced by the caller before reaching here); this type only covers
/// mis-signed values.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("counters only accept non-negative increments, got {0}")]
    NegativeCounterIncrement(f64),
}

#[derive(Debug)]
enum State {
    Counter { value: f64 },
    Gauge { value: f64 },
    Summary { sum: f64, count: u64 },
    Histogram { bounds: Arc<[f64]>, buckets: Vec<u64>, sum: f64, count: u64 },
}

struct Inner {
    state: State,
    last_updated: Instant,
}

/// A single measurement cell for one family + label-set pair (spec §3
/// "Instrument"). Holds its own lock; callers never need a family-level lock
/// to update or read a single instrument.
pub struct Instrument {
    inner: Mutex<Inner>,
}

impl Instrument {
    pub fn new_counter(now: Instant) -> Self {
        Self::from_state(State::Counter { value: 0.0 }, now)
    }

    pub fn new_gauge(now: Instant) -> Self {
        Self::from_state(State::Gauge { value: 0.0 }, now)
    }

    pub fn new_summary(now: Instant) -> Self {
        Self::from_state(State::Summary { sum: 0.0, count: 0 }, now)
    }

    /// `bounds` must already include the trailing `+Inf` sentinel (the
    /// family is responsible for that, see `MetricFamily::new`).
    pub fn new_histogram(bounds: Arc<[f64]>, now: Instant) -> Self {
        let buckets = vec![0u64; bounds.len()];
        Self::from_state(State::Histogram { bounds, buckets, sum: 0.0, count: 0 }, now)
    }

    fn from_state(state: State, now: Instant) -> Self {
        Self { inner: Mutex::new(Inner { state, last_updated: now }) }
    }

    /// Touches `last_updated` without otherwise mutating state; used by
    /// `MetricFamily::with_labels` when an instrument is looked up but not
    /// (yet) updated in the same call.
    pub fn touch(&self, now: Instant) {
        self.inner.lock().last_updated = now;
    }

    pub fn last_updated(&self) -> Instant {
        self.inner.lock().last_updated
    }

    /// Adds `value` to the instrument. For counters and histogram/summary
    /// observations `value` must be non-negative; for gauges any sign is
    /// accepted.
    pub fn add(&self, value: f64, now: Instant) -> Result<(), InstrumentError> {
        let mut inner = self.inner.lock();
        inner.last_updated = now;
        match &mut inner.state {
            State::Counter { value: v } => {
                if value < 0.0 {
                    return Err(InstrumentError::NegativeCounterIncrement(value));
                }
                *v += value;
            }
            State::Gauge { value: v } => *v += value,
            State::Summary { sum, count } => {
                *sum += value;
                *count += 1;
            }
            State::Histogram { bounds, buckets, sum, count } => {
                *sum += value;
                *count += 1;
                // Cumulative-on-write: every bucket whose bound is >= the
                // sample gets incremented now, so exposition is a direct
                // read with no fold-up pass (spec §9 Open Questions).
                for (bound, bucket) in bounds.iter().zip(buckets.iter_mut()) {
                    if value <= *bound {
                        *bucket += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Sets the instrument to an absolute value. Used for periodic refreshes
    /// of process metrics (counters, spec §3) and gauge assignment.
    pub fn set(&self, value: f64, now: Instant) -> Result<(), InstrumentError> {
        let mut inner = self.inner.lock();
        inner.last_updated = now;
        match &mut inner.state {
            State::Counter { value: v } => {
                if value < *v {
                    return Err(InstrumentError::NegativeCounterIncrement(value - *v));
                }
                *v = value;
            }
            State::Gauge { value: v } => *v = value,
            State::Summary { .. } | State::Histogram { .. } => {
                // Set() is only meaningful for counters/gauges; summaries and
                // histograms are always driven by Add().
            }
        }
        Ok(())
    }

    /// Writes this instrument's Prometheus text-format lines for `name`
    /// under `labels` into `buf`, returning the number of lines written
    /// (used to tally `exposed_metrics`).
    pub fn write_prometheus(&self, buf: &mut String, name: &str, labels: &LabelSet) -> usize {
        let inner = self.inner.lock();
        match &inner.state {
            State::Counter { value } | State::Gauge { value } => {
                write_line(buf, name, labels, None, *value);
                1
            }
            State::Summary { sum, count } => {
                write_line(buf, &format!("{name}_sum"), labels, None, *sum);
                write_line(buf, &format!("{name}_count"), labels, None, *count as f64);
                2
            }
            State::Histogram { bounds, buckets, sum, count } => {
                let bucket_name = format!("{name}_bucket");
                let mut lines = 0;
                for (bound, value) in bounds.iter().zip(buckets.iter()) {
                    let le = if bound.is_infinite() { "+Inf".to_string() } else { format_value(*bound) };
                    write_line(buf, &bucket_name, labels, Some(le.as_str()), *value as f64);
                    lines += 1;
                }
                write_line(buf, &format!("{name}_count"), labels, None, *count as f64);
                write_line(buf, &format!("{name}_sum"), labels, None, *sum);
                lines + 2
            }
        }
    }
}

fn write_line(buf: &mut String, name: &str, labels: &LabelSet, le: Option<&str>, value: f64) {
    buf.push_str(name);
    buf.push('{');
    buf.push_str(&labels.render(le));
    buf.push_str("} ");
    buf.push_str(&format_value(value));
    buf.push('\n');
}

/// Formats a value with invariant-locale semantics and Prometheus's special
/// float spellings.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf".to_string() } else { "-Inf".to_string() }
    } else {
        // Rust's `{}` formatting for f64 is already invariant-locale and
        // round-trippable; integral values print without a trailing `.0`
        // suffix removed deliberately -- Prometheus accepts `5` and `5.0`
        // equally, but whole counters read cleaner as `5`.
        if value.fract() == 0.0 && value.abs() < 1e16 {
            format!("{}", value as i64)
        } else {
            format!("{value}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        quanta::Clock::new().now()
    }

    #[test]
    fn counter_rejects_negative_add() {
        let c = Instrument::new_counter(now());
        assert!(c.add(-1.0, now()).is_err());
        assert!(c.add(5.0, now()).is_ok());
    }

    #[test]
    fn gauge_accepts_any_sign() {
        let g = Instrument::new_gauge(now());
        g.add(5.0, now()).unwrap();
        g.add(-10.0, now()).unwrap();
        let mut buf = String::new();
        let ls = LabelSet::new("prod");
        g.write_prometheus(&mut buf, "g", &ls);
        assert_eq!(buf, "g{environment=\"prod\"} -5\n");
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let bounds: Arc<[f64]> = Arc::from(vec![10.0, 100.0, 1000.0, f64::INFINITY]);
        let h = Instrument::new_histogram(bounds, now());
        for v in [5.0, 50.0, 5000.0] {
            h.add(v, now()).unwrap();
        }
        let mut buf = String::new();
        let ls = LabelSet::new("prod");
        let lines = h.write_prometheus(&mut buf, "size", &ls);
        assert_eq!(lines, 6); // 4 buckets + count + sum
        assert!(buf.contains("size_bucket{environment=\"prod\",le=\"10\"} 1\n"));
        assert!(buf.contains("size_bucket{environment=\"prod\",le=\"100\"} 2\n"));
        assert!(buf.contains("size_bucket{environment=\"prod\",le=\"1000\"} 2\n"));
        assert!(buf.contains("size_bucket{environment=\"prod\",le=\"+Inf\"} 3\n"));
        assert!(buf.contains("size_count{environment=\"prod\"} 3\n"));
        assert!(buf.contains("size_sum{environment=\"prod\"} 5055\n"));
    }

    #[test]
    fn summary_tracks_sum_and_count() {
        let s = Instrument::new_summary(now());
        s.add(3.0, now()).unwrap();
        s.add(4.0, now()).unwrap();
        let mut buf = String::new();
        let ls = LabelSet::new("prod");
        s.write_prometheus(&mut buf, "lat", &ls);
        assert_eq!(buf, "lat_sum{environment=\"prod\"} 7\nlat_count{environment=\"prod\"} 2\n");
    }
}
