use std::sync::Arc;
use std::time::Duration;

use csv_prom_metrics::{exposed_name, validate_base_name, ColumnReader, Kind, MetricFamily, MetricRegistry, Resilience};

use crate::error::ConfigError;
use crate::settings::{default_histogram_buckets, ConnectionSettings, GlobalSettings, RawSettings, SshSettings};

/// One `ssh://<host>/<file>` scrape target, resolved from either the static
/// `ssh.environments` section or a dynamic inventory document of the same
/// shape (spec §4.8).
#[derive(Clone, Debug)]
pub struct TargetSpec {
    pub target_id: String,
    pub environment: String,
    pub host: String,
    pub connection: ConnectionSettings,
}

impl TargetSpec {
    fn new(environment: String, host: String, connection: ConnectionSettings) -> Result<Self, ConfigError> {
        let file = connection.file.clone().ok_or_else(|| ConfigError::MissingFile(environment.clone()))?;
        if connection.user.is_none() {
            return Err(ConfigError::MissingUser(environment.clone()));
        }
        let target_id = format!("ssh://{host}/{file}");
        Ok(Self { target_id, environment, host, connection })
    }
}

/// The fully validated, ready-to-run configuration: a populated
/// `MetricRegistry`, the shared reader vector every `LogParser` uses, and
/// the initial target set (spec §4.8 "On startup").
pub struct ResolvedConfig {
    pub registry: Arc<MetricRegistry>,
    pub readers: Vec<ColumnReader>,
    pub targets: Vec<TargetSpec>,
    pub script: Option<String>,
    pub reload_interval: Option<Duration>,
}

/// Turns a parsed `RawSettings` document into a `ResolvedConfig`, performing
/// every cross-field validation `serde` itself cannot express: histogram-on-
/// label, undefined histogram specs, reserved-name collisions, and missing
/// `file`/`user` after override merging (spec §4.9).
pub fn resolve(raw: RawSettings) -> Result<ResolvedConfig, ConfigError> {
    if raw.script.is_none() && raw.reload_interval.is_some() {
        return Err(ConfigError::ReloadIntervalWithoutScript);
    }

    let registry = MetricRegistry::new(
        raw.global.prefix.clone(),
        Duration::from_secs(raw.global.ttl),
        raw.global.background_resilience,
        raw.global.long_term_resilience,
    );

    let readers = build_readers(&raw.global, &registry)?;
    let targets = build_targets(&raw.ssh)?;

    Ok(ResolvedConfig {
        registry,
        readers,
        targets,
        script: raw.script,
        reload_interval: raw.reload_interval.map(Duration::from_secs),
    })
}

fn build_readers(global: &GlobalSettings, registry: &Arc<MetricRegistry>) -> Result<Vec<ColumnReader>, ConfigError> {
    let mut readers = Vec::with_capacity(global.format.len());

    for (index, entry) in global.format.iter().enumerate() {
        let Some(entry) = entry else {
            readers.push(ColumnReader::Ignore);
            continue;
        };
        if entry.len() != 1 {
            return Err(ConfigError::MalformedFormatEntry { index, actual: entry.len() });
        }
        let (name, type_spec) = entry.iter().next().expect("checked len == 1 above");
        let (kind_str, histogram_spec) = match type_spec.split_once('+') {
            Some((k, h)) => (k, Some(h)),
            None => (type_spec.as_str(), None),
        };

        let reader = match kind_str {
            "ignore" => ColumnReader::Ignore,
            "label" => {
                if histogram_spec.is_some() {
                    return Err(ConfigError::HistogramOnLabel { index });
                }
                if name == "environment" {
                    return Err(ConfigError::ReservedLabelName(name.clone()));
                }
                ColumnReader::Label(name.clone())
            }
            "request_header" => {
                if histogram_spec.is_some() {
                    return Err(ConfigError::HistogramOnLabel { index });
                }
                ColumnReader::RequestHeader
            }
            "number" | "clf_number" => {
                validate_base_name(name)?;
                // `ParsedLine::metrics` is keyed by whatever name the reader
                // carries, and the registry's family map is keyed by each
                // family's *exposed* name (post `_total`-suffix, post
                // prefix) -- so the reader must carry the exposed name too,
                // or `LogParser` couldn't look the family back up.
                let exposed = register_numeric_family(registry, name, histogram_spec, global, index)?;
                if kind_str == "number" {
                    ColumnReader::Number(exposed)
                } else {
                    ColumnReader::ClfNumber(exposed)
                }
            }
            other => return Err(ConfigError::UnknownColumnType { index, kind: other.to_string() }),
        };
        readers.push(reader);
    }

    Ok(readers)
}

/// Registers the Counter (or Histogram, if `histogram_spec` is set) family
/// backing a `number`/`clf_number` format column.
fn register_numeric_family(
    registry: &Arc<MetricRegistry>,
    name: &str,
    histogram_spec: Option<&str>,
    global: &GlobalSettings,
    index: usize,
) -> Result<String, ConfigError> {
    let help = format!("Aggregate of the {name:?} format column.");

    let kind = if histogram_spec.is_some() { Kind::Histogram } else { Kind::Counter };
    let exposed = exposed_name(name, kind, registry.prefix());

    let family = match histogram_spec {
        Some(spec_name) => {
            let configured = global.histograms.get(spec_name).ok_or_else(|| ConfigError::UndefinedHistogramSpec {
                index,
                spec: spec_name.to_string(),
            })?;
            let bounds = match configured {
                Some(bounds) if !bounds.is_empty() => bounds.clone(),
                _ => default_histogram_buckets(),
            };
            Arc::new(MetricFamily::new_histogram(exposed.clone(), help, bounds, Resilience::Weak))
        }
        None => Arc::new(MetricFamily::new(exposed.clone(), help, Kind::Counter, Resilience::Weak)),
    };

    registry.register_family(family)?;
    Ok(exposed)
}

/// Resolves an `ssh` subtree into its target set. Exposed separately from
/// [`resolve`] because the dynamic inventory script's output shares this
/// exact shape (spec §4.8) and needs the same validation on every reload.
pub fn build_targets(ssh: &SshSettings) -> Result<Vec<TargetSpec>, ConfigError> {
    let mut targets = Vec::new();
    for (environment, env_settings) in &ssh.environments {
        if env_settings.hosts.is_empty() {
            return Err(ConfigError::EmptyHostList(environment.clone()));
        }
        let connection = ssh.connection.merged_with(env_settings.connection.as_ref());
        for host in &env_settings.hosts {
            targets.push(TargetSpec::new(environment.clone(), host.clone(), connection.clone())?);
        }
    }
    // `ssh.environments` is a HashMap; sort for deterministic reconciliation
    // and deterministic test assertions.
    targets.sort_by(|a, b| a.target_id.cmp(&b.target_id));
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::settings::{EnvironmentSettings, RawFormatEntry};

    fn format_entry(name: &str, type_spec: &str) -> RawFormatEntry {
        let mut m = HashMap::new();
        m.insert(name.to_string(), type_spec.to_string());
        Some(m)
    }

    fn base_raw() -> RawSettings {
        let mut environments = HashMap::new();
        environments.insert(
            "prod".to_string(),
            EnvironmentSettings {
                hosts: vec!["host-a".to_string()],
                connection: None,
            },
        );
        RawSettings {
            global: GlobalSettings {
                format: vec![format_entry("status", "label"), format_entry("bytes", "clf_number")],
                ..Default::default()
            },
            ssh: SshSettings {
                connection: ConnectionSettings {
                    file: Some("/var/log/app.log".to_string()),
                    user: Some("scraper".to_string()),
                    ..Default::default()
                },
                environments,
            },
            script: None,
            reload_interval: None,
        }
    }

    #[test]
    fn resolves_readers_and_targets() {
        let resolved = resolve(base_raw()).unwrap();
        assert_eq!(resolved.readers.len(), 2);
        assert_eq!(resolved.targets.len(), 1);
        assert_eq!(resolved.targets[0].target_id, "ssh://host-a//var/log/app.log");
        assert!(resolved.registry.get("bytes_total").is_some());
    }

    #[test]
    fn histogram_on_label_is_rejected() {
        let mut raw = base_raw();
        raw.global.format = vec![format_entry("status", "label+size_buckets")];
        assert!(matches!(resolve(raw), Err(ConfigError::HistogramOnLabel { .. })));
    }

    #[test]
    fn undefined_histogram_spec_is_rejected() {
        let mut raw = base_raw();
        raw.global.format = vec![format_entry("bytes", "clf_number+missing_spec")];
        assert!(matches!(resolve(raw), Err(ConfigError::UndefinedHistogramSpec { .. })));
    }

    #[test]
    fn defined_histogram_spec_creates_histogram_family() {
        let mut raw = base_raw();
        raw.global.format = vec![format_entry("bytes", "clf_number+size_buckets")];
        raw.global.histograms.insert("size_buckets".to_string(), Some(vec![10.0, 100.0, 1000.0]));
        let resolved = resolve(raw).unwrap();
        let family = resolved.registry.get("bytes").unwrap();
        assert_eq!(family.kind(), Kind::Histogram);
    }

    #[test]
    fn reserved_family_name_collision_is_rejected() {
        let mut raw = base_raw();
        raw.global.format = vec![format_entry("lines_parsed", "number")];
        assert!(resolve(raw).is_err());
    }

    #[test]
    fn environment_label_name_is_rejected() {
        let mut raw = base_raw();
        raw.global.format = vec![format_entry("environment", "label")];
        assert!(matches!(resolve(raw), Err(ConfigError::ReservedLabelName(_))));
    }

    #[test]
    fn missing_file_after_merge_is_rejected() {
        let mut raw = base_raw();
        raw.ssh.connection.file = None;
        assert!(matches!(resolve(raw), Err(ConfigError::MissingFile(_))));
    }

    #[test]
    fn empty_host_list_is_rejected() {
        let mut raw = base_raw();
        raw.ssh.environments.get_mut("prod").unwrap().hosts.clear();
        assert!(matches!(resolve(raw), Err(ConfigError::EmptyHostList(_))));
    }

    #[test]
    fn reload_interval_without_script_is_rejected() {
        let mut raw = base_raw();
        raw.reload_interval = Some(60);
        assert!(matches!(resolve(raw), Err(ConfigError::ReloadIntervalWithoutScript)));
    }
}
