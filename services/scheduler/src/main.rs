//! berth scheduler daemon
//!
//! Runs the scheduler against the built-in mock resource manager, persisting
//! state under `BERTH_DATA_DIR`. Apps listed in `BERTH_BOOTSTRAP_APPS` are
//! deployed on startup unless they already exist.

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_scheduler::config::Config;
use berth_scheduler::connector::MockConnector;
use berth_scheduler::{Scheduler, SchedulerError, StateStore};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster_id = %config.cluster_id,
        data_dir = %config.data_dir.display(),
        framework = %config.framework.name,
        "Starting berth scheduler"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let store = StateStore::open_sqlite(config.database_path()).context("opening state store")?;

    let bootstrap = config.load_bootstrap_apps()?;
    let scheduler = Scheduler::new(config.scheduler_config(), Arc::new(store));
    let handle = scheduler.handle();
    let connector = MockConnector::new(config.mock_connector_config());

    let mut running = tokio::spawn(scheduler.run(Box::new(connector)));

    for spec in bootstrap {
        let app_id = spec.id.clone();
        match handle.deploy(spec).await {
            Ok(()) => info!(app_id = %app_id, "Bootstrap app deployed"),
            Err(SchedulerError::AppExists(_)) => {
                info!(app_id = %app_id, "Bootstrap app already exists")
            }
            Err(e) => warn!(app_id = %app_id, error = %e, "Bootstrap deploy failed"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            handle.stop();
            match (&mut running).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Scheduler error during shutdown"),
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
        }
        result = &mut running => {
            match result {
                Ok(Ok(())) => info!("Scheduler exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Scheduler failed");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "Scheduler task panicked");
                    return Err(e.into());
                }
            }
        }
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
