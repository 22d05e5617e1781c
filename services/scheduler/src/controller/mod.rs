//! Scheduler event controller.
//!
//! The controller is the top-level run loop:
//! - Wins leader election (blocking until this replica leads)
//! - Restores persisted tasks
//! - Starts periodic reconciliation and the framework-id lease keepalive
//! - Subscribes to the master and dispatches every inbound event
//!
//! Phases are published on a watch channel:
//!
//! ```text
//! Electing ─▶ Leading ─▶ Subscribing ◀─▶ Listening
//! ```

mod handlers;
mod reconcile;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use drover_kv::{KeyValueStore, KvError, LeaseId};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::ha::{HaError, LeaderElection};
use crate::ids::FrameworkId;
use crate::matcher::ResourceMatcher;
use crate::shutdown_requested;
use crate::task::{TaskError, TaskManager};
use crate::transport::{Event, SchedulerTransport, TransportError};

/// Key holding the framework identity assigned by the master.
pub const FRAMEWORK_ID_KEY: &str = "/frameworkId";

/// Inbound events buffered between the subscription and the dispatcher.
const EVENT_BUFFER: usize = 256;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub framework_name: String,

    /// TTL of the persisted framework id; the master keeps the framework's
    /// tasks this long after the scheduler disconnects.
    pub failover_timeout: Duration,

    /// Interval between reconciliations of running tasks.
    pub reconcile_interval: Duration,

    /// Pause before re-subscribing after the event stream ends.
    pub resubscribe_delay: Duration,

    /// Refuse duration sent with declined offers.
    pub decline_refuse_seconds: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            framework_name: "drover".to_string(),
            failover_timeout: Duration::from_secs(60 * 60 * 24 * 7),
            reconcile_interval: Duration::from_secs(5 * 60),
            resubscribe_delay: Duration::from_secs(2),
            decline_refuse_seconds: 5.0,
        }
    }
}

/// Controller lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Electing,
    Leading,
    Subscribing,
    Listening,
}

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("leader election failed: {0}")]
    Election(#[from] HaError),

    #[error("failed to restore tasks: {0}")]
    Restore(#[source] TaskError),

    #[error("master rejected subscription: {0}")]
    Unauthorized(#[source] TransportError),

    #[error("network partition detected: {advertise_addr} is no longer the recorded leader")]
    PartitionDetected { advertise_addr: String },

    #[error("event stream closed")]
    EventStreamClosed,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Store(#[from] KvError),
}

/// Framework identity and the lease keeping its record alive.
#[derive(Debug, Default)]
pub(crate) struct FrameworkState {
    pub(crate) id: Option<FrameworkId>,
    pub(crate) lease: Option<LeaseId>,
}

pub(crate) type SharedFramework = Arc<Mutex<FrameworkState>>;

pub(crate) fn lock_framework(framework: &SharedFramework) -> MutexGuard<'_, FrameworkState> {
    framework.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The scheduler's run loop and event dispatcher.
pub struct EventController {
    config: ControllerConfig,
    tasks: Arc<TaskManager>,
    transport: Arc<dyn SchedulerTransport>,
    matcher: Mutex<Box<dyn ResourceMatcher>>,
    ha: Arc<LeaderElection>,
    store: Arc<dyn KeyValueStore>,
    framework: SharedFramework,
    phase: Arc<watch::Sender<Phase>>,
}

impl EventController {
    /// Create a controller. `store` holds the framework id and should be the
    /// same store the task manager and election use.
    pub fn new(
        config: ControllerConfig,
        tasks: Arc<TaskManager>,
        transport: Arc<dyn SchedulerTransport>,
        matcher: Box<dyn ResourceMatcher>,
        ha: Arc<LeaderElection>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Electing);
        Self {
            config,
            tasks,
            transport,
            matcher: Mutex::new(matcher),
            ha,
            store,
            framework: Arc::new(Mutex::new(FrameworkState::default())),
            phase: Arc::new(phase),
        }
    }

    /// Watch the controller's phase.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Framework id assigned by the master, once known.
    pub fn framework_id(&self) -> Option<FrameworkId> {
        lock_framework(&self.framework).id.clone()
    }

    /// Lease keeping the persisted framework id alive, once written.
    pub fn framework_lease(&self) -> Option<LeaseId> {
        lock_framework(&self.framework).lease
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Controller phase changed");
        }
    }

    /// Run until shutdown or a fatal error.
    ///
    /// Background work spawned here is aborted when this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!(framework = %self.config.framework_name, "Starting scheduler");

        let listener = self.ha.bind().await?;
        let mut background = JoinSet::new();
        background.spawn(LeaderElection::communicate(listener, shutdown.clone()));

        self.set_phase(Phase::Electing);
        tokio::select! {
            elected = self.ha.election() => elected?,
            _ = shutdown_requested(&mut shutdown) => {
                info!("Shutdown requested before election finished");
                return Ok(());
            }
        }
        self.set_phase(Phase::Leading);

        self.load_framework_id().await?;

        let restored = self
            .tasks
            .restore()
            .await
            .map_err(ControllerError::Restore)?;
        info!(tasks = restored, "Tasks restored");

        background.spawn(reconcile::run_reconcile_loop(
            Arc::clone(&self.tasks),
            Arc::clone(&self.transport),
            self.config.reconcile_interval,
            shutdown.clone(),
        ));

        let (event_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let (fatal_tx, mut fatal) = mpsc::channel(1);
        background.spawn(subscription_loop(
            Subscription {
                transport: Arc::clone(&self.transport),
                ha: Arc::clone(&self.ha),
                framework: Arc::clone(&self.framework),
                phase: Arc::clone(&self.phase),
                resubscribe_delay: self.config.resubscribe_delay,
            },
            event_tx,
            fatal_tx,
        ));

        // Block for the first subscription
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event @ Event::Subscribed { .. }) => {
                        self.dispatch(event).await;
                        break;
                    }
                    Some(other) => {
                        warn!(event = other.kind(), "Dropping event received before subscription");
                    }
                    None => return Err(closed_reason(&mut fatal)),
                },
                Some(err) = fatal.recv() => return Err(err),
                _ = shutdown_requested(&mut shutdown) => {
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }

        background.spawn(reconcile::run_lease_keepalive(
            Arc::clone(&self.store),
            Arc::clone(&self.framework),
            (self.config.failover_timeout / 3).max(Duration::from_secs(1)),
            shutdown.clone(),
        ));

        info!("Listening for master events");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => return Err(closed_reason(&mut fatal)),
                },
                Some(err) = fatal.recv() => {
                    error!(alarm = true, error = %err, "Scheduler cannot continue");
                    return Err(err);
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Pick up a framework id persisted by a previous leader.
    async fn load_framework_id(&self) -> Result<(), ControllerError> {
        match self.store.read(FRAMEWORK_ID_KEY).await {
            Ok(id) => {
                info!(framework_id = %id, "Resuming persisted framework id");
                lock_framework(&self.framework).id = Some(FrameworkId::new(id));
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("No persisted framework id");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the framework-id lease one last time so its full failover
    /// window starts now.
    async fn shutdown(&self) {
        let lease = lock_framework(&self.framework).lease;
        if let Some(lease) = lease {
            match self.store.refresh_lease(lease).await {
                Ok(()) => info!(lease = %lease, "Framework id lease refreshed for shutdown"),
                Err(e) => warn!(lease = %lease, error = %e, "Failed to refresh framework id lease"),
            }
        }
        info!("Scheduler stopped");
    }
}

/// Why the event stream closed: the subscription loop reports a fatal error
/// before it drops its sender.
fn closed_reason(fatal: &mut mpsc::Receiver<ControllerError>) -> ControllerError {
    fatal
        .try_recv()
        .unwrap_or(ControllerError::EventStreamClosed)
}

/// What the subscription loop needs from the controller.
struct Subscription {
    transport: Arc<dyn SchedulerTransport>,
    ha: Arc<LeaderElection>,
    framework: SharedFramework,
    phase: Arc<watch::Sender<Phase>>,
    resubscribe_delay: Duration,
}

/// Keep the event stream open, re-subscribing whenever it ends.
///
/// Stops and reports a fatal error if the master rejects the framework or
/// this replica is no longer the recorded leader.
async fn subscription_loop(
    ctx: Subscription,
    events: mpsc::Sender<Event>,
    fatal: mpsc::Sender<ControllerError>,
) {
    loop {
        ctx.phase.send_replace(Phase::Subscribing);
        let framework_id = lock_framework(&ctx.framework).id.clone();

        match ctx.transport.subscribe(framework_id, events.clone()).await {
            Ok(()) => info!("Master closed the event stream"),
            Err(e) if e.is_unauthorized() => {
                error!(alarm = true, error = %e, "Master rejected subscription");
                let _ = fatal.send(ControllerError::Unauthorized(e)).await;
                return;
            }
            Err(e) => warn!(error = %e, "Subscription failed"),
        }

        match ctx.ha.is_leader().await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    alarm = true,
                    advertise_addr = %ctx.ha.advertise_addr(),
                    "No longer the recorded leader, stopping to avoid double scheduling"
                );
                let _ = fatal
                    .send(ControllerError::PartitionDetected {
                        advertise_addr: ctx.ha.advertise_addr().to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                let _ = fatal.send(ControllerError::Election(e)).await;
                return;
            }
        }

        debug!(
            delay_ms = ctx.resubscribe_delay.as_millis() as u64,
            "Re-subscribing after delay"
        );
        tokio::time::sleep(ctx.resubscribe_delay).await;
    }
}
