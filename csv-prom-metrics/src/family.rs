use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;
use quanta::{Clock, Instant};

use crate::instrument::Instrument;
use crate::label::LabelSet;

/// The Prometheus metric kind a family holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

/// Controls how long an idle instrument stays exposed vs. how long it stays
/// resident in memory (spec §4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resilience {
    Weak,
    LongTerm,
    Zombie,
}

impl Resilience {
    /// `None` means "no horizon" (always exposed / never evicted), used by
    /// `Zombie`.
    fn exposition_horizon(self, ttl: Duration, long_term_resilience: u32) -> Option<Duration> {
        match self {
            Resilience::Weak => Some(ttl),
            Resilience::LongTerm => Some(ttl * (long_term_resilience + 1)),
            Resilience::Zombie => None,
        }
    }

    fn retention_horizon(
        self,
        ttl: Duration,
        background_resilience: u32,
        long_term_resilience: u32,
    ) -> Option<Duration> {
        match self {
            Resilience::Weak => Some(ttl * (background_resilience + 1)),
            Resilience::LongTerm => Some(ttl * (long_term_resilience + 1)),
            Resilience::Zombie => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("metric name {0:?} must match [A-Za-z0-9:_]+")]
    InvalidCharacters(String),
    #[error("metric name {0:?} must not end in _sum, _count, _bucket, or _total")]
    ReservedSuffix(String),
    #[error("metric name {0:?} collides with a reserved family name")]
    ReservedName(String),
}

pub const RESERVED_FAMILY_NAMES: &[&str] = &[
    "parser_errors",
    "lines_parsed",
    "parser_errors_per_target",
    "lines_parsed_per_target",
    "connected",
    "ssh_bytes_in",
];

/// Validates a *base* name (before the automatic Counter `_total` suffix and
/// before the global prefix are applied) against spec §3/§8.
pub fn validate_base_name(name: &str) -> Result<(), NameError> {
    if name.is_empty()
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_')
    {
        return Err(NameError::InvalidCharacters(name.to_string()));
    }
    for suffix in ["_sum", "_count", "_bucket", "_total"] {
        if name.ends_with(suffix) {
            return Err(NameError::ReservedSuffix(name.to_string()));
        }
    }
    if RESERVED_FAMILY_NAMES.contains(&name) {
        return Err(NameError::ReservedName(name.to_string()));
    }
    Ok(())
}

/// Applies the Counter `_total` suffix (if missing) and the global prefix (if
/// configured) to a validated base name.
pub fn exposed_name(base_name: &str, kind: Kind, prefix: Option<&str>) -> String {
    let with_suffix = if kind == Kind::Counter && !base_name.ends_with("_total") {
        format!("{base_name}_total")
    } else {
        base_name.to_string()
    };

    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{with_suffix}"),
        _ => with_suffix,
    }
}

/// Extends a histogram bucket-bound vector with a trailing `+Inf` sentinel if
/// not already present, per spec §3.
pub fn with_inf_sentinel(mut bounds: Vec<f64>) -> Vec<f64> {
    if bounds.last().map(|b| !b.is_infinite()).unwrap_or(true) {
        bounds.push(f64::INFINITY);
    }
    bounds
}

/// The family-level definition and container of per-label-tuple instruments
/// (spec §3/§4.5).
pub struct MetricFamily {
    name: String,
    help: String,
    kind: Kind,
    buckets: Option<Arc<[f64]>>,
    resilience: Resilience,
    instruments: RwLock<IndexMap<LabelSet, Arc<Instrument>>>,
    clock: Clock,
}

impl MetricFamily {
    pub fn new(name: String, help: String, kind: Kind, resilience: Resilience) -> Self {
        Self {
            name,
            help,
            kind,
            buckets: None,
            resilience,
            instruments: RwLock::new(IndexMap::new()),
            clock: Clock::new(),
        }
    }

    pub fn new_histogram(
        name: String,
        help: String,
        bounds: Vec<f64>,
        resilience: Resilience,
    ) -> Self {
        let bounds = with_inf_sentinel(bounds);
        Self {
            name,
            help,
            kind: Kind::Histogram,
            buckets: Some(Arc::from(bounds)),
            resilience,
            instruments: RwLock::new(IndexMap::new()),
            clock: Clock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn resilience(&self) -> Resilience {
        self.resilience
    }

    fn new_instrument(&self, now: Instant) -> Instrument {
        match self.kind {
            Kind::Counter => Instrument::new_counter(now),
            Kind::Gauge => Instrument::new_gauge(now),
            Kind::Summary => Instrument::new_summary(now),
            Kind::Histogram => {
                let bounds =
                    self.buckets.clone().expect("histogram family must carry bucket bounds");
                Instrument::new_histogram(bounds, now)
            }
        }
    }

    /// Looks up (or creates) the instrument for `labels`, touching its
    /// `last_updated` timestamp. Constant-time under the family lock: the
    /// lock is only held for the lookup/insert, never across I/O.
    pub fn with_labels(&self, labels: &LabelSet) -> Arc<Instrument> {
        let now = self.clock.now();

        // Fast path: read lock, no allocation, on the (overwhelmingly
        // common) case the instrument already exists.
        if let Some(existing) = self.instruments.read().get(labels) {
            existing.touch(now);
            return existing.clone();
        }

        let mut instruments = self.instruments.write();
        if let Some(existing) = instruments.get(labels) {
            existing.touch(now);
            return existing.clone();
        }

        let instrument = Arc::new(self.new_instrument(now));
        instruments.insert(labels.clone(), instrument.clone());
        instrument
    }

    /// Removes `labels`' instrument, if present. Used by `SSHScraper`
    /// termination to drop its `connected` gauge child (spec §4.4).
    pub fn drop_labels(&self, labels: &LabelSet) {
        self.instruments.write().shift_remove(labels);
    }

    /// Writes the HELP/TYPE header (if at least one instrument survives the
    /// exposition filter) and every surviving instrument's lines. Returns the
    /// number of metric lines emitted (for `exposed_metrics`).
    pub fn expose_to(
        &self,
        buf: &mut String,
        ttl: Duration,
        long_term_resilience: u32,
    ) -> usize {
        let now = self.clock.now();
        let horizon = self.resilience.exposition_horizon(ttl, long_term_resilience);

        let snapshot: Vec<(LabelSet, Arc<Instrument>)> = {
            let instruments = self.instruments.read();
            instruments.iter().map(|(l, i)| (l.clone(), i.clone())).collect()
        };

        let surviving: Vec<_> = snapshot
            .into_iter()
            .filter(|(_, instrument)| match horizon {
                None => true,
                Some(horizon) => age_of(now, instrument.last_updated()) <= horizon,
            })
            .collect();

        if surviving.is_empty() {
            return 0;
        }

        let type_str = match self.kind {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
            Kind::Histogram => "histogram",
            Kind::Summary => "summary",
        };
        buf.push_str("# HELP ");
        buf.push_str(&self.name);
        buf.push(' ');
        buf.push_str(&sanitize_help(&self.help));
        buf.push('\n');
        buf.push_str("# TYPE ");
        buf.push_str(&self.name);
        buf.push(' ');
        buf.push_str(type_str);
        buf.push('\n');

        let mut lines = 0;
        for (labels, instrument) in &surviving {
            lines += instrument.write_prometheus(buf, &self.name, labels);
        }
        lines
    }

    /// Removes instruments whose age exceeds this family's retention
    /// horizon. Run periodically by the family's own eviction task (spec
    /// §4.5 "Eviction cycle").
    pub fn evict(&self, ttl: Duration, background_resilience: u32, long_term_resilience: u32) {
        let Some(horizon) =
            self.resilience.retention_horizon(ttl, background_resilience, long_term_resilience)
        else {
            return; // Zombie: never evicted from memory.
        };

        let now = self.clock.now();
        let mut instruments = self.instruments.write();
        instruments.retain(|_, instrument| age_of(now, instrument.last_updated()) <= horizon);
    }

    /// Spawns this family's repeating eviction task on the current Tokio
    /// runtime. The family is never destroyed, so the task runs for the
    /// lifetime of the process; the returned handle is kept only so tests can
    /// abort it.
    pub fn spawn_eviction_task(
        self: Arc<Self>,
        ttl: Duration,
        background_resilience: u32,
        long_term_resilience: u32,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.evict(ttl, background_resilience, long_term_resilience);
            }
        })
    }
}

/// `now - then`, clamped to zero if `then` is (due to clock-source quirks)
/// somehow ahead of `now`.
fn age_of(now: Instant, then: Instant) -> Duration {
    if now >= then {
        now.duration_since(then)
    } else {
        Duration::ZERO
    }
}

fn sanitize_help(help: &str) -> String {
    let mut out = String::with_capacity(help.len());
    for c in help.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}
