//! drover scheduler library
//!
//! A framework scheduler for an offer-based cluster master. It subscribes to
//! the master, places queued tasks onto resource offers, tracks task state
//! from status updates, and keeps that state durable across restarts and
//! leader failover.
//!
//! ## Architecture
//!
//! ```text
//! EventController
//! ├── LeaderElection   (leader record + liveness listener)
//! ├── TaskManager      (task registry, scale groups, write-through store)
//! ├── SchedulerTransport (master calls; mock in dev)
//! └── ResourceMatcher  (offer placement)
//! ```
//!
//! ## Modules
//!
//! - `controller`: Run loop, event handlers, periodic reconciliation
//! - `task`: Task records and the task manager
//! - `ha`: Leader election
//! - `transport`: Master interface and mock
//! - `matcher`: Offer matching interface and first-fit matcher

pub mod config;
pub mod controller;
pub mod ha;
pub mod ids;
pub mod matcher;
pub mod task;
pub mod transport;

use tokio::sync::watch;

// Re-export commonly used types
pub use controller::{ControllerConfig, ControllerError, EventController, Phase};
pub use ha::{HaConfig, LeaderElection};
pub use matcher::FirstFitMatcher;
pub use task::{Task, TaskDescriptor, TaskManager, TaskState};
pub use transport::MockTransport;

/// Resolve once `true` is sent on `shutdown` or its sender is dropped.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
