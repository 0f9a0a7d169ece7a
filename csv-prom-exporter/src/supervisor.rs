use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use csv_prom_config::{build_targets, ResolvedConfig, SshSettings, TargetSpec};
use csv_prom_metrics::{ColumnReader, MetricRegistry};
use csv_prom_ssh::SSHScraper;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct RunningTarget {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Maintains the active set of `SSHScraper`s keyed by `target_id`,
/// reconciling against the static configuration and (optionally) a
/// periodically re-run dynamic inventory script (spec §4.8).
pub struct Supervisor {
    readers: Arc<Vec<ColumnReader>>,
    registry: Arc<MetricRegistry>,
    script: Option<String>,
    reload_interval: Option<Duration>,
    running: HashMap<String, RunningTarget>,
    /// Cancelled scrapers whose task hasn't unwound yet, keyed by
    /// `target_id`. A `target_id` is only ever in one of `running` or
    /// `pending_teardown` at a time.
    pending_teardown: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self {
            readers: Arc::new(config.readers.clone()),
            registry: config.registry.clone(),
            script: config.script.clone(),
            reload_interval: config.reload_interval,
            running: HashMap::new(),
            pending_teardown: HashMap::new(),
        }
    }

    /// Starts the initial targets, then (if a `script` is configured) reruns
    /// it on `reload_interval` forever, or once if no interval is set.
    /// Returns once `shutdown` fires and every scraper has terminated.
    pub async fn run(mut self, initial_targets: Vec<TargetSpec>, shutdown: CancellationToken) {
        self.reconcile(initial_targets).await;

        if let Some(script) = self.script.clone() {
            let span = tracing::info_span!("inventory_reload", script = %script);
            let _entered = span.enter();
            loop {
                match run_inventory_script(&script).await {
                    Ok(targets) => self.reconcile(targets).await,
                    Err(err) => {
                        warn!(error = %err, "supervisor_inventory_error: retaining current target set");
                    }
                }

                let Some(interval) = self.reload_interval else { break };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if shutdown.is_cancelled() {
                    break;
                }
            }
        }

        shutdown.cancelled().await;
        self.shutdown_all().await;
    }

    /// Starts a scraper for each new `target_id`, cancels scrapers whose
    /// `target_id` is no longer present, and -- if the inventory reports a
    /// `target_id` whose previous scraper was cancelled but hasn't finished
    /// tearing down yet -- waits for that teardown before starting its
    /// replacement. This is required by spec §5 ("The Supervisor waits for
    /// termination before dropping the scraper's `connected` gauge"): the
    /// old scraper's `connected` gauge drop (`SSHScraper::run`, after its SSH
    /// session has fully disconnected) must happen before a new scraper for
    /// the same `{environment,host}` label set starts setting that gauge, or
    /// the old task's delayed drop would erase the new scraper's live value.
    async fn reconcile(&mut self, targets: Vec<TargetSpec>) {
        let desired: HashMap<String, TargetSpec> =
            targets.into_iter().map(|t| (t.target_id.clone(), t)).collect();

        let stale: Vec<String> =
            self.running.keys().filter(|id| !desired.contains_key(*id)).cloned().collect();
        for target_id in stale {
            if let Some(running) = self.running.remove(&target_id) {
                info!(target_id = %target_id, "inventory no longer lists this target, cancelling");
                running.cancel.cancel();
                self.pending_teardown.insert(target_id, running.handle);
            }
        }

        // Reap teardowns that finished on their own since the last
        // reconcile, so `pending_teardown` doesn't grow for ids that never
        // come back.
        self.pending_teardown.retain(|_, handle| !handle.is_finished());

        for (target_id, target) in desired {
            if self.running.contains_key(&target_id) {
                continue;
            }
            if let Some(handle) = self.pending_teardown.remove(&target_id) {
                info!(target_id = %target_id, "waiting for previous scraper instance to finish tearing down");
                if let Err(err) = handle.await {
                    error!(target_id = %target_id, error = %err, "previous scraper instance panicked during teardown");
                }
            }
            info!(target_id = %target_id, "starting scraper for new target");
            let cancel = CancellationToken::new();
            let scraper = SSHScraper::new(target, self.readers.clone(), self.registry.clone());
            let task_cancel = cancel.clone();
            let handle = tokio::spawn(async move { scraper.run(task_cancel).await });
            self.running.insert(target_id, RunningTarget { cancel, handle });
        }
    }

    async fn shutdown_all(self) {
        for (target_id, running) in self.running {
            running.cancel.cancel();
            if let Err(err) = running.handle.await {
                error!(target_id = %target_id, error = %err, "scraper task panicked during shutdown");
            }
        }
        for (target_id, handle) in self.pending_teardown {
            if let Err(err) = handle.await {
                error!(target_id = %target_id, error = %err, "scraper task panicked during teardown");
            }
        }
    }
}

/// Runs the configured inventory command and parses its stdout as an `ssh:`
/// subtree document (spec §4.8 "same schema as the static `ssh` section").
async fn run_inventory_script(script: &str) -> Result<Vec<TargetSpec>, InventoryError> {
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(InventoryError::Spawn)?;

    if !output.status.success() {
        return Err(InventoryError::NonZeroExit(output.status.code().unwrap_or(-1)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let ssh: SshSettings = serde_yaml::from_str(&stdout).map_err(InventoryError::Yaml)?;
    build_targets(&ssh).map_err(InventoryError::Config)
}

#[derive(Debug, thiserror::Error)]
enum InventoryError {
    #[error("failed to spawn inventory script: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("inventory script exited with status {0}")]
    NonZeroExit(i32),
    #[error("failed to parse inventory script output: {0}")]
    Yaml(#[source] serde_yaml::Error),
    #[error("inventory script output failed validation: {0}")]
    Config(#[source] csv_prom_config::ConfigError),
}

#[cfg(test)]
mod tests {
    use csv_prom_config::ConnectionSettings;

    use super::*;

    fn target(id: &str) -> TargetSpec {
        // `TargetSpec` has no public constructor outside `resolve`; tests
        // exercise `reconcile` through the registry keying alone, so a
        // stand-in with the same public fields is built via `build_targets`
        // instead of a literal.
        let mut environments = std::collections::HashMap::new();
        environments.insert(
            id.to_string(),
            csv_prom_config::EnvironmentSettings { hosts: vec!["host".to_string()], connection: None },
        );
        let ssh = SshSettings {
            connection: ConnectionSettings {
                file: Some("/var/log/app.log".to_string()),
                user: Some("scraper".to_string()),
                ..Default::default()
            },
            environments,
        };
        build_targets(&ssh).unwrap().remove(0)
    }

    fn supervisor() -> Supervisor {
        let registry = MetricRegistry::new(None, Duration::from_secs(60), 1, 10);
        Supervisor {
            readers: Arc::new(Vec::new()),
            registry,
            script: None,
            reload_interval: None,
            running: HashMap::new(),
            pending_teardown: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn reconcile_starts_and_stops_targets() {
        let mut supervisor = supervisor();

        let t1 = target("prod-a");
        supervisor.reconcile(vec![t1.clone()]).await;
        assert_eq!(supervisor.running.len(), 1);
        assert!(supervisor.running.contains_key(&t1.target_id));

        let t2 = target("prod-b");
        supervisor.reconcile(vec![t2.clone()]).await;
        assert_eq!(supervisor.running.len(), 1);
        assert!(supervisor.running.contains_key(&t2.target_id));
        assert!(!supervisor.running.contains_key(&t1.target_id));
    }

    #[tokio::test]
    async fn reconcile_waits_for_stale_teardown_before_reusing_target_id() {
        let mut supervisor = supervisor();

        let t1 = target("prod-a");
        supervisor.reconcile(vec![t1.clone()]).await;
        assert_eq!(supervisor.running.len(), 1);

        // Dropping it from the desired set cancels it and parks its handle
        // in `pending_teardown` rather than discarding it.
        supervisor.reconcile(vec![]).await;
        assert!(supervisor.running.is_empty());
        assert!(supervisor.pending_teardown.contains_key(&t1.target_id));

        // Reusing the same target_id must drain `pending_teardown` for it
        // before (and as part of) spawning the replacement, so the old
        // scraper's `connected` gauge drop can never race the new one's set.
        supervisor.reconcile(vec![t1.clone()]).await;
        assert!(supervisor.running.contains_key(&t1.target_id));
        assert!(!supervisor.pending_teardown.contains_key(&t1.target_id));
    }
}
