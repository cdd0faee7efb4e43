use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use campus_notifier::config::NotifierConfig;
use campus_notifier::database;
use campus_notifier::logging;
use campus_notifier::notification::CycleCoordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NotifierConfig::load().context("Failed to load configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir, config.log_filter.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = config.transport.transport_type(),
        "campus-notifier starting"
    );

    let cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel.clone());

    let pool = database::init_pool_with_size(&config.database_url, config.max_db_connections)
        .await
        .context("Failed to open database")?;
    database::run_migrations(&pool).await?;

    let transport = config.transport.build()?;
    let coordinator = Arc::new(CycleCoordinator::from_pool(
        pool.clone(),
        transport,
        &config,
        cancel.clone(),
    ));

    let mut run_handle = tokio::spawn(Arc::clone(&coordinator).run());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
        }
        result = &mut run_handle => {
            // Only returns early if the loop panicked
            if let Err(e) = result {
                error!(error = %e, "Cycle coordinator exited unexpectedly");
            }
        }
    }

    coordinator.shutdown();
    if !run_handle.is_finished() {
        let grace = Duration::from_secs(config.shutdown_grace_secs);
        match tokio::time::timeout(grace, &mut run_handle).await {
            Ok(_) => info!("In-flight work finished"),
            Err(_) => {
                warn!(grace_secs = config.shutdown_grace_secs, "Grace period elapsed, aborting");
                run_handle.abort();
            }
        }
    }

    pool.close().await;
    info!("campus-notifier stopped");
    Ok(())
}
