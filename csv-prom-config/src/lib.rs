//! YAML configuration binding for the CSV-to-Prometheus exporter.
//!
//! Parses the document described in the design's "External Interfaces"
//! section into [`settings::RawSettings`], then [`resolve::resolve`]s it into
//! a [`resolve::ResolvedConfig`] with a populated `MetricRegistry` and an
//! initial target set, performing every cross-field validation `serde`
//! itself can't express.

pub mod error;
pub mod resolve;
pub mod settings;

pub use error::ConfigError;
pub use resolve::{build_targets, resolve, ResolvedConfig, TargetSpec};
pub use settings::{ConnectionSettings, EnvironmentSettings, GlobalSettings, RawSettings, SshSettings};

use std::env;
use std::fs;
use std::path::Path;

const CONFIG_ENV_VAR: &str = "SCRAPECONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/scrapeconfig.yml";

/// Entry point for configuration loading (spec §4.9).
pub struct Settings;

impl Settings {
    /// Reads `$SCRAPECONFIG`, falling back to `/etc/scrapeconfig.yml`, parses
    /// it as YAML, and resolves it into a `ResolvedConfig`. Any failure here
    /// is a `configuration_error` and fatal at startup (spec §7).
    pub fn load_from_env() -> Result<ResolvedConfig, ConfigError> {
        let path = env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(Path::new(&path))
    }

    pub fn load_from_path(path: &Path) -> Result<ResolvedConfig, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let raw: RawSettings = serde_yaml::from_str(&contents)?;
        resolve(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_deserializes_with_defaults() {
        let raw: RawSettings = serde_yaml::from_str(
            r#"
            ssh:
              connection:
                file: /var/log/app.log
                user: scraper
              environments:
                prod:
                  hosts: [host-a, host-b]
            "#,
        )
        .unwrap();
        assert_eq!(raw.global.ttl, 60);
        assert_eq!(raw.global.background_resilience, 1);
        assert_eq!(raw.global.long_term_resilience, 10);

        let resolved = resolve(raw).unwrap();
        assert_eq!(resolved.targets.len(), 2);
        assert!(resolved.script.is_none());
    }

    #[test]
    fn empty_document_has_no_targets_and_no_custom_families() {
        let raw: RawSettings = serde_yaml::from_str("{}").unwrap();
        let resolved = resolve(raw).unwrap();
        assert!(resolved.targets.is_empty());
        assert!(resolved.readers.is_empty());
        // Only the six reserved families exist.
        assert_eq!(resolved.registry.families().len(), 6);
    }

    #[test]
    fn full_document_round_trips_format_and_histograms() {
        let raw: RawSettings = serde_yaml::from_str(
            r#"
            global:
              ttl: 30
              prefix: myapp
              histograms:
                size_buckets: [10, 100, 1000]
              format:
                - remote_host: label
                - null
                - remote_user: label
                - null
                - request_header: request_header
                - status: label
                - body_bytes_sent: clf_number+size_buckets
            ssh:
              connection:
                file: /var/log/access.log
                user: scraper
                pkey: /home/scraper/.ssh/id_ed25519
              environments:
                prod:
                  hosts: [web-1, web-2]
                staging:
                  hosts: [web-3]
                  connection:
                    file: /var/log/staging-access.log
            script: /usr/local/bin/discover-hosts.sh
            reload_interval: 300
            "#,
        )
        .unwrap();

        let resolved = resolve(raw).unwrap();
        assert_eq!(resolved.readers.len(), 7);
        assert_eq!(resolved.targets.len(), 3);
        assert_eq!(resolved.script.as_deref(), Some("/usr/local/bin/discover-hosts.sh"));
        assert!(resolved.registry.get("myapp:body_bytes_sent").is_some());

        let staging_target =
            resolved.targets.iter().find(|t| t.environment == "staging").unwrap();
        assert_eq!(staging_target.connection.file.as_deref(), Some("/var/log/staging-access.log"));
        assert_eq!(staging_target.connection.user.as_deref(), Some("scraper"));
    }

    #[test]
    fn reserved_name_collision_in_format_is_a_load_time_error() {
        let raw: RawSettings = serde_yaml::from_str(
            r#"
            global:
              format:
                - connected: number
            ssh:
              connection:
                file: /var/log/app.log
                user: scraper
              environments:
                prod:
                  hosts: [host-a]
            "#,
        )
        .unwrap();
        assert!(matches!(resolve(raw), Err(ConfigError::InvalidName(_))));
    }
}
