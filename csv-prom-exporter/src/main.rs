mod exposer;
mod process_metrics;
mod supervisor;

use std::net::SocketAddr;

use csv_prom_config::Settings;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::exposer::Exposer;
use crate::supervisor::Supervisor;

const LISTEN_ADDR: &str = "0.0.0.0:5000";

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Settings::load_from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration_error: failed to load configuration");
            std::process::exit(1);
        }
    };

    config.registry.spawn_eviction_tasks();

    let addr: SocketAddr = LISTEN_ADDR.parse().expect("LISTEN_ADDR is a valid socket address");
    let exposer = Exposer::new(config.registry.clone());

    let shutdown = CancellationToken::new();
    let supervisor_shutdown = shutdown.clone();
    let supervisor = Supervisor::new(&config);
    let targets = config.targets.clone();
    let supervisor_task = tokio::spawn(supervisor.run(targets, supervisor_shutdown));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, cancelling scrapers");
            shutdown.cancel();
        }
    });

    info!(addr = %addr, "listening");
    if let Err(err) = exposer.serve(addr).await {
        error!(error = %err, addr = %addr, "failed to bind listen address");
        std::process::exit(1);
    }

    supervisor_task.await.ok();
}
