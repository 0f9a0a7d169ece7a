use std::collections::HashMap;

use serde::Deserialize;

fn default_ttl() -> u64 {
    60
}

fn default_background_resilience() -> u32 {
    1
}

fn default_long_term_resilience() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

/// The default histogram bucket upper bounds (spec §6 `global.histograms`),
/// before the automatic `+Inf` sentinel is appended.
pub fn default_histogram_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0]
}

/// One entry of `global.format`: either an ignored column (`null`/empty) or
/// a single-key `name: type[+histogram_spec]` mapping.
pub type RawFormatEntry = Option<HashMap<String, String>>;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default = "default_background_resilience")]
    pub background_resilience: u32,
    #[serde(default = "default_long_term_resilience")]
    pub long_term_resilience: u32,
    pub prefix: Option<String>,
    #[serde(default)]
    pub histograms: HashMap<String, Option<Vec<f64>>>,
    #[serde(default)]
    pub format: Vec<RawFormatEntry>,
}

// `#[serde(default)]` on the struct falls back to `Default::default()`
// whenever the whole `global:` section is missing, so unlike most of this
// file's types `GlobalSettings` needs a hand-written `Default` rather than
// a derive, to get `ttl=60` etc. instead of zeros.
impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            background_resilience: default_background_resilience(),
            long_term_resilience: default_long_term_resilience(),
            prefix: None,
            histograms: HashMap::new(),
            format: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectionSettings {
    pub file: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub pkey: Option<String>,
    pub pkey_passphrase: Option<String>,
    pub connect_timeout: Option<u64>,
    pub read_timeout_ms: Option<u64>,
}

impl ConnectionSettings {
    /// Merges `override_` on top of `self`, field by field; `override_`
    /// wins wherever it sets a field (spec §6 "optional `connection`
    /// overriding the defaults field-by-field").
    pub fn merged_with(&self, override_: Option<&ConnectionSettings>) -> ConnectionSettings {
        let Some(o) = override_ else { return self.clone() };
        ConnectionSettings {
            file: o.file.clone().or_else(|| self.file.clone()),
            user: o.user.clone().or_else(|| self.user.clone()),
            password: o.password.clone().or_else(|| self.password.clone()),
            pkey: o.pkey.clone().or_else(|| self.pkey.clone()),
            pkey_passphrase: o.pkey_passphrase.clone().or_else(|| self.pkey_passphrase.clone()),
            connect_timeout: o.connect_timeout.or(self.connect_timeout),
            read_timeout_ms: o.read_timeout_ms.or(self.read_timeout_ms),
        }
    }

    pub fn connect_timeout(&self) -> u64 {
        self.connect_timeout.unwrap_or_else(default_connect_timeout)
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms.unwrap_or_else(default_read_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnvironmentSettings {
    pub hosts: Vec<String>,
    pub connection: Option<ConnectionSettings>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SshSettings {
    pub connection: ConnectionSettings,
    pub environments: HashMap<String, EnvironmentSettings>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub global: GlobalSettings,
    pub ssh: SshSettings,
    pub script: Option<String>,
    pub reload_interval: Option<u64>,
}
