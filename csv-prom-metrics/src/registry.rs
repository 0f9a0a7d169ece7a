use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::family::{Kind, MetricFamily, NameError, Resilience};

/// Process-wide registry of `MetricFamily`s (spec §3 "Global state" /
/// §4.6). TTL and prefix are fixed at construction and read-only afterwards;
/// the family map itself grows as `register_family` is called during config
/// load, then never shrinks (families are never destroyed, only their
/// children are, per §4.5).
pub struct MetricRegistry {
    families: RwLock<HashMap<String, Arc<MetricFamily>>>,
    prefix: Option<String>,
    ttl: Duration,
    background_resilience: u32,
    long_term_resilience: u32,

    parser_errors: Arc<MetricFamily>,
    lines_parsed: Arc<MetricFamily>,
    parser_errors_per_target: Arc<MetricFamily>,
    lines_parsed_per_target: Arc<MetricFamily>,
    connected: Arc<MetricFamily>,
    ssh_bytes_in: Arc<MetricFamily>,
}

impl MetricRegistry {
    pub fn new(
        prefix: Option<String>,
        ttl: Duration,
        background_resilience: u32,
        long_term_resilience: u32,
    ) -> Arc<Self> {
        let reserved = |base: &str, kind: Kind, resilience: Resilience, help: &str| {
            Arc::new(MetricFamily::new(
                crate::family::exposed_name(base, kind, prefix.as_deref()),
                help.to_string(),
                kind,
                resilience,
            ))
        };

        let parser_errors = reserved(
            "parser_errors",
            Kind::Counter,
            Resilience::LongTerm,
            "Number of CSV lines that failed to parse.",
        );
        let lines_parsed = reserved(
            "lines_parsed",
            Kind::Counter,
            Resilience::LongTerm,
            "Number of CSV lines successfully parsed.",
        );
        let parser_errors_per_target = reserved(
            "parser_errors_per_target",
            Kind::Counter,
            Resilience::LongTerm,
            "Number of CSV lines that failed to parse, broken down by target.",
        );
        let lines_parsed_per_target = reserved(
            "lines_parsed_per_target",
            Kind::Counter,
            Resilience::LongTerm,
            "Number of CSV lines successfully parsed, broken down by target.",
        );
        let connected = reserved(
            "connected",
            Kind::Gauge,
            Resilience::Zombie,
            "Whether the scraper for a given target is currently connected and tailing.",
        );
        let ssh_bytes_in = reserved(
            "ssh_bytes_in",
            Kind::Counter,
            Resilience::LongTerm,
            "Bytes read from remote SSH tail streams.",
        );

        let mut families = HashMap::new();
        for family in [
            &parser_errors,
            &lines_parsed,
            &parser_errors_per_target,
            &lines_parsed_per_target,
            &connected,
            &ssh_bytes_in,
        ] {
            families.insert(family.name().to_string(), family.clone());
        }

        Arc::new(Self {
            families: RwLock::new(families),
            prefix,
            ttl,
            background_resilience,
            long_term_resilience,
            parser_errors,
            lines_parsed,
            parser_errors_per_target,
            lines_parsed_per_target,
            connected,
            ssh_bytes_in,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn background_resilience(&self) -> u32 {
        self.background_resilience
    }

    pub fn long_term_resilience(&self) -> u32 {
        self.long_term_resilience
    }

    pub fn parser_errors(&self) -> &Arc<MetricFamily> {
        &self.parser_errors
    }

    pub fn lines_parsed(&self) -> &Arc<MetricFamily> {
        &self.lines_parsed
    }

    pub fn parser_errors_per_target(&self) -> &Arc<MetricFamily> {
        &self.parser_errors_per_target
    }

    pub fn lines_parsed_per_target(&self) -> &Arc<MetricFamily> {
        &self.lines_parsed_per_target
    }

    pub fn connected(&self) -> &Arc<MetricFamily> {
        &self.connected
    }

    pub fn ssh_bytes_in(&self) -> &Arc<MetricFamily> {
        &self.ssh_bytes_in
    }

    /// Registers a family built from the `format` configuration section.
    /// Fails if the exposed name collides with an already-registered family
    /// (reserved or user-defined).
    pub fn register_family(&self, family: Arc<MetricFamily>) -> Result<(), NameError> {
        let mut families = self.families.write();
        if families.contains_key(family.name()) {
            return Err(NameError::ReservedName(family.name().to_string()));
        }
        families.insert(family.name().to_string(), family);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<MetricFamily>> {
        self.families.read().get(name).cloned()
    }

    pub fn families(&self) -> Vec<Arc<MetricFamily>> {
        let families = self.families.read();
        let mut names: Vec<_> = families.keys().cloned().collect();
        names.sort();
        names.into_iter().filter_map(|n| families.get(&n).cloned()).collect()
    }

    /// Writes every registered family's surviving instruments to `buf` in
    /// deterministic (name-sorted) order, returning the total line count.
    pub fn expose_to(&self, buf: &mut String) -> usize {
        let mut lines = 0;
        for family in self.families() {
            lines += family.expose_to(buf, self.ttl, self.long_term_resilience);
        }
        lines
    }

    /// Spawns the per-family eviction task for every currently-registered
    /// family. Must be called once, after all `format`-derived families have
    /// been registered (spec §9 "phased initialisation").
    pub fn spawn_eviction_tasks(self: &Arc<Self>) {
        for family in self.families() {
            family.spawn_eviction_task(self.ttl, self.background_resilience, self.long_term_resilience);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_families_are_preregistered() {
        let registry = MetricRegistry::new(None, Duration::from_secs(60), 1, 10);
        assert!(registry.get("parser_errors_total").is_some());
        assert!(registry.get("lines_parsed_total").is_some());
        assert!(registry.get("connected").is_some());
        assert!(registry.get("ssh_bytes_in_total").is_some());
    }

    #[test]
    fn registering_a_reserved_name_fails() {
        let registry = MetricRegistry::new(None, Duration::from_secs(60), 1, 10);
        let dup = Arc::new(MetricFamily::new(
            "connected".to_string(),
            "dup".to_string(),
            Kind::Gauge,
            Resilience::Zombie,
        ));
        assert!(registry.register_family(dup).is_err());
    }

    #[test]
    fn prefix_is_applied_to_reserved_families() {
        let registry = MetricRegistry::new(Some("myapp".to_string()), Duration::from_secs(60), 1, 10);
        assert!(registry.get("myapp:connected").is_some());
    }
}
