use csv_prom_metrics::NameError;

/// Configuration errors are fatal at startup (spec §7 "configuration_error").
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("failed to parse configuration YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid metric name: {0}")]
    InvalidName(#[from] NameError),

    #[error("format column {index} uses `label` with a histogram suffix, which is not permitted")]
    HistogramOnLabel { index: usize },

    #[error("format column {index} references undefined histogram spec {spec:?}")]
    UndefinedHistogramSpec { index: usize, spec: String },

    #[error("format column {index} has unknown type {kind:?} (expected number, clf_number, label, or request_header)")]
    UnknownColumnType { index: usize, kind: String },

    #[error("format column {index} is a single-key mapping with {actual} keys")]
    MalformedFormatEntry { index: usize, actual: usize },

    #[error("label name {0:?} is reserved")]
    ReservedLabelName(String),

    #[error("ssh environment {0:?} has no hosts configured")]
    EmptyHostList(String),

    #[error("ssh environment {0:?} is missing a `file` (no default and no override)")]
    MissingFile(String),

    #[error("ssh environment {0:?} is missing a `user` (no default and no override)")]
    MissingUser(String),

    #[error("`script` must be set for `reload_interval` to have any effect")]
    ReloadIntervalWithoutScript,
}
