//! drover scheduler
//!
//! Runs one scheduler replica: it competes for leadership, restores task
//! state, subscribes to the master and places queued tasks onto offers.
//!
//! ## Architecture
//!
//! - **Leader Election**: Leader record plus a liveness listener standbys watch
//! - **Event Controller**: Subscription, offer handling, status updates
//! - **Task Manager**: Task registry written through to the key-value store
//! - **Reconciliation**: Periodic status requests for running tasks

use std::sync::Arc;

use anyhow::{Context, Result};
use drover_kv::{KeyValueStore, MemoryStore, RetryingStore, SqliteStore};
use drover_scheduler::config::Config;
use drover_scheduler::{EventController, FirstFitMatcher, LeaderElection, MockTransport, TaskManager};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        framework = %config.framework_name,
        ha_listen_addr = %config.ha_listen_addr,
        ha_advertise_addr = %config.ha_advertise_addr,
        store_path = ?config.store_path,
        "Starting drover scheduler"
    );

    // Storage, with retries on every operation
    let backend: Arc<dyn KeyValueStore> = match &config.store_path {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("failed to open store at {}", path.display()))?,
        ),
        None => {
            warn!("DROVER_STORE_PATH not set, task state will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };
    let store: Arc<dyn KeyValueStore> =
        Arc::new(RetryingStore::new(backend, config.store_retry_policy()));

    let ha = Arc::new(LeaderElection::new(Arc::clone(&store), config.ha_config()));
    let tasks = Arc::new(TaskManager::new(
        Arc::clone(&store),
        config.task_retry_policy(),
    ));

    // The master client is not part of this workspace (mock for now)
    let transport = Arc::new(MockTransport::new(format!(
        "{}-framework",
        config.framework_name
    )));

    let controller = Arc::new(EventController::new(
        config.controller_config(),
        tasks,
        transport,
        Box::new(FirstFitMatcher::new()),
        ha,
        store,
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut run_handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    // Wait for shutdown signal
    let finished = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            None
        }
        result = &mut run_handle => Some(result),
    };

    // Signal shutdown and let the controller refresh its lease
    let _ = shutdown_tx.send(true);
    let result = match finished {
        Some(result) => result,
        None => run_handle.await,
    };

    match result {
        Ok(Ok(())) => {
            info!("Scheduler shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(alarm = true, error = %e, "Scheduler stopped");
            Err(e.into())
        }
        Err(e) => {
            error!(alarm = true, error = %e, "Scheduler task panicked");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
