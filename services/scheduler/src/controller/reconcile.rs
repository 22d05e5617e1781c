//! Periodic background work while leading.

use std::sync::Arc;
use std::time::Duration;

use drover_kv::KeyValueStore;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{lock_framework, SharedFramework};
use crate::shutdown_requested;
use crate::task::{TaskManager, TaskState};
use crate::transport::SchedulerTransport;

/// Shortest period either loop runs at. Tokio rejects a zero interval.
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Ask the master for the current status of every running task.
pub(crate) async fn reconcile_running(tasks: &TaskManager, transport: &dyn SchedulerTransport) {
    let running = match tasks.all_by_state(TaskState::Running).await {
        Ok(running) => running,
        Err(_) => {
            debug!("No running tasks to reconcile");
            return;
        }
    };

    let count = running.len();
    let descriptors = running.into_iter().map(|t| t.descriptor).collect();
    match transport.reconcile(descriptors).await {
        Ok(()) => info!(tasks = count, "Reconciliation requested"),
        Err(e) => warn!(tasks = count, error = %e, "Reconciliation failed"),
    }
}

/// Reconcile running tasks every `period` until shutdown.
pub(crate) async fn run_reconcile_loop(
    tasks: Arc<TaskManager>,
    transport: Arc<dyn SchedulerTransport>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = period.max(MIN_PERIOD);
    info!(
        interval_secs = period.as_secs(),
        "Starting reconciliation loop"
    );

    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; subscribing reconciles anyway
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconcile_running(&tasks, transport.as_ref()).await;
            }
            _ = shutdown_requested(&mut shutdown) => {
                info!("Reconciliation loop shutting down");
                break;
            }
        }
    }
}

/// Refresh the framework-id lease every `period` until shutdown.
pub(crate) async fn run_lease_keepalive(
    store: Arc<dyn KeyValueStore>,
    framework: SharedFramework,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let lease = lock_framework(&framework).lease;
                let Some(lease) = lease else {
                    continue;
                };
                match store.refresh_lease(lease).await {
                    Ok(()) => debug!(lease = %lease, "Framework id lease refreshed"),
                    Err(e) => warn!(lease = %lease, error = %e, "Failed to refresh framework id lease"),
                }
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use drover_kv::MemoryStore;
    use drover_retry::RetryPolicy;

    use super::*;
    use crate::controller::{FrameworkState, FRAMEWORK_ID_KEY};
    use crate::ids::FrameworkId;
    use crate::task::{Resources, Task, TaskDescriptor};
    use crate::transport::{Call, MockTransport};

    async fn running_tasks() -> Arc<TaskManager> {
        let tasks = Arc::new(TaskManager::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy::default(),
        ));
        let task = Task::new(TaskDescriptor::new("web", Resources::new(0.5, 64.0, 0.0)));
        tasks.add(vec![task.clone()]).await.unwrap();
        tasks.set(TaskState::Running, &task).await.unwrap();
        tasks
    }

    fn reconciles(transport: &MockTransport) -> usize {
        transport.count(|c| matches!(c, Call::Reconcile(_)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_loop_ticks_every_period() {
        let transport = Arc::new(MockTransport::new("fw-1"));
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(run_reconcile_loop(
            running_tasks().await,
            transport.clone(),
            Duration::from_secs(60),
            shutdown,
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(reconciles(&transport), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconciles(&transport), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconciles(&transport), 2);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_errors_do_not_stop_the_timer() {
        let transport = Arc::new(MockTransport::new("fw-1"));
        transport.fail_calls(true);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(run_reconcile_loop(
            running_tasks().await,
            transport.clone(),
            Duration::from_secs(60),
            shutdown,
        ));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(reconciles(&transport), 2);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_clamped() {
        let transport = Arc::new(MockTransport::new("fw-1"));
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(run_reconcile_loop(
            running_tasks().await,
            transport.clone(),
            Duration::ZERO,
            shutdown,
        ));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(reconciles(&transport), 2);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_framework_id_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let lease = store
            .create_with_lease(FRAMEWORK_ID_KEY, "fw-1", Duration::from_secs(30))
            .await
            .unwrap();
        let framework: SharedFramework = Arc::new(Mutex::new(FrameworkState {
            id: Some(FrameworkId::new("fw-1")),
            lease: Some(lease),
        }));

        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(run_lease_keepalive(
            store.clone(),
            framework,
            Duration::from_secs(10),
            shutdown,
        ));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(store.read(FRAMEWORK_ID_KEY).await.unwrap(), "fw-1");

        stop.send(true).unwrap();
        handle.await.unwrap();

        // Last refresh was at 90s
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.read(FRAMEWORK_ID_KEY).await.unwrap_err().is_not_found());
    }
}
