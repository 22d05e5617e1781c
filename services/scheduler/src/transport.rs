//! Scheduler transport interface and mock implementation.
//!
//! The transport abstracts the calls the scheduler makes to the cluster
//! master:
//! - Subscribing to the event stream
//! - Accepting and declining resource offers
//! - Reviving and suppressing offers
//! - Reconciling, acknowledging and killing tasks
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::ids::{AgentId, FrameworkId, OfferId, TaskId};
use crate::task::{Resources, TaskDescriptor, TaskState};

/// A grant of resources on one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Resources,
    pub attributes: BTreeMap<String, String>,
}

impl Offer {
    pub fn new(id: impl Into<OfferId>, agent_id: impl Into<AgentId>, resources: Resources) -> Self {
        let agent_id = agent_id.into();
        Self {
            id: id.into(),
            hostname: agent_id.to_string(),
            agent_id,
            resources,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Status update for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub state: TaskState,

    /// Identifies this update for acknowledgement.
    pub uuid: String,

    pub message: Option<String>,
    pub reason: Option<String>,
}

/// Offer operation sent with an accept call.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Launch(TaskDescriptor),
}

/// Filters attached to accept and decline calls.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Filters {
    /// How long the master should withhold the declined resources.
    pub refuse_seconds: Option<f64>,
}

/// Inbound event from the master.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Subscribed {
        framework_id: FrameworkId,
        heartbeat_interval: Option<Duration>,
    },
    Offers(Vec<Offer>),
    InverseOffers(Vec<OfferId>),
    Rescind(OfferId),
    RescindInverseOffer(OfferId),
    Update(TaskStatus),
    Message {
        agent_id: AgentId,
        data: Vec<u8>,
    },
    Failure {
        agent_id: Option<AgentId>,
        status: Option<i32>,
    },
    Error(String),
    Heartbeat,
    /// An event type this scheduler does not know.
    Unknown(String),
}

impl Event {
    /// Short name of the event type, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::Subscribed { .. } => "SUBSCRIBED",
            Self::Offers(_) => "OFFERS",
            Self::InverseOffers(_) => "INVERSE_OFFERS",
            Self::Rescind(_) => "RESCIND",
            Self::RescindInverseOffer(_) => "RESCIND_INVERSE_OFFER",
            Self::Update(_) => "UPDATE",
            Self::Message { .. } => "MESSAGE",
            Self::Failure { .. } => "FAILURE",
            Self::Error(_) => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::Unknown(kind) => kind,
        }
    }
}

/// Errors from master calls.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The master refused this framework's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("disconnected from master: {0}")]
    Disconnected(String),

    #[error("master rejected call with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Calls the scheduler makes to the cluster master.
#[async_trait]
pub trait SchedulerTransport: Send + Sync {
    /// Open the event stream, delivering events on `events` until it ends.
    ///
    /// Returns once the stream is closed; an `Ok` return means the master
    /// ended it cleanly.
    async fn subscribe(
        &self,
        framework_id: Option<FrameworkId>,
        events: mpsc::Sender<Event>,
    ) -> Result<(), TransportError>;

    async fn accept(
        &self,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        filters: Filters,
    ) -> Result<(), TransportError>;

    async fn decline(&self, offer_ids: Vec<OfferId>, filters: Filters)
        -> Result<(), TransportError>;

    async fn revive(&self) -> Result<(), TransportError>;

    async fn suppress(&self) -> Result<(), TransportError>;

    async fn reconcile(&self, tasks: Vec<TaskDescriptor>) -> Result<(), TransportError>;

    async fn acknowledge(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        uuid: &str,
    ) -> Result<(), TransportError>;

    async fn kill(&self, task_id: &TaskId, agent_id: Option<AgentId>)
        -> Result<(), TransportError>;
}

/// A call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Subscribe(Option<FrameworkId>),
    Accept {
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
    },
    Decline {
        offer_ids: Vec<OfferId>,
        filters: Filters,
    },
    Revive,
    Suppress,
    Reconcile(Vec<TaskId>),
    Acknowledge {
        agent_id: AgentId,
        task_id: TaskId,
        uuid: String,
    },
    Kill {
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },
}

/// Mock transport for testing and development.
///
/// Every call is recorded. `subscribe` answers with a `Subscribed` event, then
/// delivers any queued events and holds the stream open until
/// [`MockTransport::close_stream`] is called.
pub struct MockTransport {
    framework_id: FrameworkId,
    calls: Mutex<Vec<Call>>,
    queued: Mutex<VecDeque<Event>>,
    reject_subscriptions: AtomicBool,
    fail_calls: AtomicBool,
    stream_closed: Notify,
}

impl MockTransport {
    /// Create a mock that assigns `framework_id` to new subscriptions.
    pub fn new(framework_id: impl Into<FrameworkId>) -> Self {
        Self {
            framework_id: framework_id.into(),
            calls: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            reject_subscriptions: AtomicBool::new(false),
            fail_calls: AtomicBool::new(false),
            stream_closed: Notify::new(),
        }
    }

    /// Make every subscription fail as unauthorized.
    pub fn reject_subscriptions(&self, reject: bool) {
        self.reject_subscriptions.store(reject, Ordering::SeqCst);
    }

    /// Make every call other than `subscribe` fail after being recorded.
    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    /// Queue an event for delivery on the next subscription.
    pub fn push_event(&self, event: Event) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    /// End the current (or next) subscription stream.
    pub fn close_stream(&self) {
        self.stream_closed.notify_one();
    }

    /// Snapshot of the recorded calls.
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push_call(&self, call: Call) {
        debug!(call = ?call, "[MOCK] Transport call");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// Record `call` and fail it if failures are switched on.
    fn record(&self, call: Call) -> Result<(), TransportError> {
        self.push_call(call);
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                status: 503,
                message: "mock transport fails calls".into(),
            });
        }
        Ok(())
    }

    fn drain_queued(&self) -> Vec<Event> {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

#[async_trait]
impl SchedulerTransport for MockTransport {
    async fn subscribe(
        &self,
        framework_id: Option<FrameworkId>,
        events: mpsc::Sender<Event>,
    ) -> Result<(), TransportError> {
        self.push_call(Call::Subscribe(framework_id.clone()));

        if self.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(TransportError::Unauthorized(
                "mock transport rejects subscriptions".into(),
            ));
        }

        let framework_id = framework_id.unwrap_or_else(|| self.framework_id.clone());
        info!(framework_id = %framework_id, "[MOCK] Subscribed");

        let subscribed = Event::Subscribed {
            framework_id,
            heartbeat_interval: Some(Duration::from_secs(15)),
        };
        for event in std::iter::once(subscribed).chain(self.drain_queued()) {
            events
                .send(event)
                .await
                .map_err(|_| TransportError::Disconnected("event receiver dropped".into()))?;
        }

        self.stream_closed.notified().await;
        Err(TransportError::Disconnected("mock stream closed".into()))
    }

    async fn accept(
        &self,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        _filters: Filters,
    ) -> Result<(), TransportError> {
        self.record(Call::Accept {
            offer_ids,
            operations,
        })
    }

    async fn decline(
        &self,
        offer_ids: Vec<OfferId>,
        filters: Filters,
    ) -> Result<(), TransportError> {
        self.record(Call::Decline { offer_ids, filters })
    }

    async fn revive(&self) -> Result<(), TransportError> {
        self.record(Call::Revive)
    }

    async fn suppress(&self) -> Result<(), TransportError> {
        self.record(Call::Suppress)
    }

    async fn reconcile(&self, tasks: Vec<TaskDescriptor>) -> Result<(), TransportError> {
        self.record(Call::Reconcile(
            tasks.into_iter().map(|t| t.task_id).collect(),
        ))
    }

    async fn acknowledge(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        uuid: &str,
    ) -> Result<(), TransportError> {
        self.record(Call::Acknowledge {
            agent_id: agent_id.clone(),
            task_id: task_id.clone(),
            uuid: uuid.to_string(),
        })
    }

    async fn kill(
        &self,
        task_id: &TaskId,
        agent_id: Option<AgentId>,
    ) -> Result<(), TransportError> {
        self.record(Call::Kill {
            task_id: task_id.clone(),
            agent_id,
        })
    }
}
