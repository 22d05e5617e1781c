//! Event handlers and the operations exposed to the API layer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use drover_kv::{KvError, LeaseId};
use tracing::{debug, error, info, warn};

use super::reconcile::reconcile_running;
use super::{lock_framework, ControllerError, EventController, Phase, FRAMEWORK_ID_KEY};
use crate::ids::{AgentId, FrameworkId, OfferId};
use crate::matcher::ResourceMatcher;
use crate::task::{Task, TaskError, TaskState};
use crate::transport::{Event, Filters, Offer, Operation, TaskStatus};

impl EventController {
    /// Route one inbound event to its handler.
    pub async fn dispatch(&self, event: Event) {
        match event {
            Event::Subscribed {
                framework_id,
                heartbeat_interval,
            } => self.subscribed(framework_id, heartbeat_interval).await,
            Event::Offers(offers) => self.offers(offers).await,
            Event::Update(status) => self.update(status).await,
            Event::Rescind(offer_id) => {
                info!(offer_id = %offer_id, "Offer rescinded");
            }
            Event::InverseOffers(offer_ids) => {
                info!(count = offer_ids.len(), "Inverse offers received");
            }
            Event::RescindInverseOffer(offer_id) => {
                info!(offer_id = %offer_id, "Inverse offer rescinded");
            }
            Event::Message { agent_id, data } => {
                info!(agent_id = %agent_id, bytes = data.len(), "Executor message received");
            }
            Event::Failure { agent_id, status } => {
                warn!(agent_id = ?agent_id, status = ?status, "Agent or executor failure");
            }
            Event::Error(message) => {
                error!(message = %message, "Master reported an error");
            }
            Event::Heartbeat => debug!("Heartbeat"),
            Event::Unknown(kind) => warn!(event = %kind, "Unrecognized event"),
        }
    }

    /// Record the framework identity, persist it under a lease, revive
    /// offers and reconcile running tasks.
    pub async fn subscribed(&self, framework_id: FrameworkId, heartbeat: Option<Duration>) {
        info!(
            framework_id = %framework_id,
            heartbeat_secs = heartbeat.map(|h| h.as_secs()),
            "Subscribed to master"
        );
        let lease = match self.persist_framework_id(&framework_id).await {
            Ok(lease) => Some(lease),
            Err(e) => {
                error!(framework_id = %framework_id, error = %e, "Failed to persist framework id");
                None
            }
        };

        {
            let mut framework = lock_framework(&self.framework);
            framework.id = Some(framework_id);
            framework.lease = lease;
        }

        // Revive even with nothing queued so work missed while
        // disconnected is offered again
        if let Err(e) = self.transport.revive().await {
            warn!(error = %e, "Failed to revive offers");
        }

        reconcile_running(&self.tasks, self.transport.as_ref()).await;
        self.set_phase(Phase::Listening);
    }

    /// Store the framework id under a lease owned by this leader.
    ///
    /// A record written by an earlier subscription of this leader keeps its
    /// lease, which is refreshed instead of replaced. Anything else gets a
    /// fresh lease.
    async fn persist_framework_id(&self, framework_id: &FrameworkId) -> Result<LeaseId, KvError> {
        let held = lock_framework(&self.framework).lease;
        if let Some(lease) = held {
            let recorded = match self.store.read(FRAMEWORK_ID_KEY).await {
                Ok(value) => Some(value),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };

            if recorded.as_deref() == Some(framework_id.as_str()) {
                match self.store.refresh_lease(lease).await {
                    Ok(()) => {
                        debug!(lease = %lease, "Reusing framework id lease");
                        return Ok(lease);
                    }
                    Err(e) => debug!(lease = %lease, error = %e, "Held lease is gone"),
                }
            }
        }

        self.store
            .create_with_lease(
                FRAMEWORK_ID_KEY,
                framework_id.as_str(),
                self.config.failover_timeout,
            )
            .await
    }

    /// Place queued tasks onto `offers` and decline what is left.
    pub async fn offers(&self, offers: Vec<Offer>) {
        let offer_ids: Vec<OfferId> = offers.iter().map(|o| o.id.clone()).collect();
        debug!(count = offer_ids.len(), "Offers received");

        let queued = self
            .tasks
            .all_by_state(TaskState::Unknown)
            .await
            .unwrap_or_default();

        if queued.is_empty() {
            info!(offers = offer_ids.len(), "No queued tasks, suppressing offers");
            if let Err(e) = self.transport.suppress().await {
                warn!(error = %e, "Failed to suppress offers");
            }
            self.decline(offer_ids).await;
            return;
        }

        let (placed, unused) = {
            let mut matcher = self.lock_matcher();
            matcher.add_offers(offers);

            let mut placed = Vec::new();
            for task in queued {
                if !matcher.has_resources() {
                    debug!("Offers exhausted, remaining tasks stay queued");
                    break;
                }

                matcher.clear_filters();
                for constraint in &task.descriptor.constraints {
                    matcher.add_filter(constraint.clone());
                }

                match matcher.assign(&task.descriptor) {
                    Ok(offer) => placed.push((task, offer)),
                    Err(e) => warn!(task = %task.name(), error = %e, "Failed to place task"),
                }
            }
            matcher.clear_filters();

            let unused: Vec<OfferId> = matcher.offers().into_iter().map(|o| o.id).collect();
            matcher.clear_offers();
            (placed, unused)
        };

        let mut launches: BTreeMap<OfferId, Vec<Operation>> = BTreeMap::new();
        let mut consumed: BTreeSet<OfferId> = BTreeSet::new();

        for (mut task, offer) in placed {
            consumed.insert(offer.id.clone());
            task.descriptor.agent_id = Some(offer.agent_id.clone());

            // Known modeling compromise: STAGING is recorded at match time,
            // before the master reports it. Queued means UNKNOWN, so a placed
            // task has to leave that state here or the next offer round would
            // place it again.
            task.state = TaskState::Staging;
            if let Err(e) = self.tasks.update(vec![task.clone()]).await {
                error!(task = %task.name(), error = %e, "Failed to record placement, not launching");
                continue;
            }

            if task.group.in_group {
                if let Err(e) = self.tasks.link(&task.group.group_name, &offer.agent_id).await {
                    warn!(task = %task.name(), error = %e, "Failed to link agent to scale group");
                }
            }

            info!(
                task = %task.name(),
                task_id = %task.task_id(),
                offer_id = %offer.id,
                agent_id = %offer.agent_id,
                "Launching task"
            );
            launches
                .entry(offer.id)
                .or_default()
                .push(Operation::Launch(task.descriptor));
        }

        for (offer_id, operations) in launches {
            consumed.remove(&offer_id);
            if let Err(e) = self
                .transport
                .accept(vec![offer_id.clone()], operations, Filters::default())
                .await
            {
                error!(offer_id = %offer_id, error = %e, "Failed to accept offer");
            }
        }

        // Offers whose placements could not be recorded are returned too
        let mut decline = unused;
        decline.extend(consumed);
        self.decline(decline).await;
    }

    /// Apply a task status update, then acknowledge it.
    ///
    /// The acknowledgement is sent exactly once whatever the outcome,
    /// including for tasks this scheduler no longer tracks.
    pub async fn update(&self, status: TaskStatus) {
        self.apply_status(&status).await;

        if let Err(e) = self
            .transport
            .acknowledge(&status.agent_id, &status.task_id, &status.uuid)
            .await
        {
            warn!(task_id = %status.task_id, error = %e, "Failed to acknowledge status update");
        }
    }

    async fn apply_status(&self, status: &TaskStatus) {
        let task = match self.tasks.get_by_id(&status.task_id).await {
            Ok(task) => task,
            Err(_) => {
                info!(
                    task_id = %status.task_id,
                    state = %status.state,
                    "Status update for untracked task"
                );
                return;
            }
        };

        let task = match self.tasks.set(status.state, &task).await {
            Ok(task) => task,
            Err(e) => {
                error!(task = %task.name(), state = %status.state, error = %e, "Failed to record task state");
                return;
            }
        };

        let state = status.state;
        if state.needs_reschedule() {
            warn!(
                task = %task.name(),
                state = %state,
                message = ?status.message,
                reason = ?status.reason,
                "Task failed"
            );
            if task.group.in_group {
                if let Err(e) = self.tasks.unlink(&task.group.group_name, &status.agent_id).await {
                    warn!(task = %task.name(), error = %e, "Failed to unlink agent from scale group");
                }
            }
            self.reschedule(task).await;
        } else if state.is_terminal_success() {
            info!(task = %task.name(), state = %state, "Task ended");
            if let Err(e) = self.retire(&task, Some(&status.agent_id)).await {
                error!(task = %task.name(), error = %e, "Failed to clean up ended task");
            }
        } else {
            info!(task = %task.name(), state = %state, "Task state changed");
        }
    }

    /// Put a failed task back in the queue after its backoff delay.
    ///
    /// A task whose retry policy is spent stays in its failed state.
    async fn reschedule(&self, task: Task) {
        let Some(delay) = self.tasks.next_retry_delay(task.task_id()).await else {
            error!(
                alarm = true,
                task = %task.name(),
                task_id = %task.task_id(),
                "Task exhausted its retries, leaving it failed"
            );
            return;
        };

        info!(
            task = %task.name(),
            delay_ms = delay.as_millis() as u64,
            "Rescheduling task"
        );

        let tasks = Arc::clone(&self.tasks);
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // The task may have been killed or redeployed meanwhile
            match tasks.set(TaskState::Unknown, &task).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(task = %task.name(), "Task gone before reschedule");
                    return;
                }
                Err(e) => {
                    error!(task = %task.name(), error = %e, "Failed to requeue task");
                    return;
                }
            }

            if let Err(e) = transport.revive().await {
                warn!(error = %e, "Failed to revive offers");
            }
        });
    }

    /// Remove a task and shrink its scale group, deleting the group once
    /// empty.
    async fn retire(&self, task: &Task, agent: Option<&AgentId>) -> Result<(), TaskError> {
        if task.group.in_group {
            let group = &task.group.group_name;
            if let Some(agent) = agent {
                self.tasks.unlink(group, agent).await?;
            }
            if self.tasks.set_size(group, -1).await? == 0 {
                self.tasks.delete_group(group).await?;
            }
        }

        self.tasks.delete(std::slice::from_ref(task)).await
    }

    /// Register new tasks and revive offers so they get placed.
    ///
    /// Offers are revived even if part of the batch was rejected.
    pub async fn deploy(&self, tasks: Vec<Task>) -> Result<(), ControllerError> {
        let added = self.tasks.add(tasks).await;

        if let Err(e) = self.transport.revive().await {
            warn!(error = %e, "Failed to revive offers after deploy");
        }

        added.map_err(Into::into)
    }

    /// Kill a task on the cluster and forget it.
    pub async fn kill(&self, name: &str) -> Result<(), ControllerError> {
        let task = self.tasks.get(name).await?;
        let agent = task.descriptor.agent_id.clone();

        self.transport.kill(task.task_id(), agent.clone()).await?;
        info!(task = %task.name(), task_id = %task.task_id(), "Task killed");

        self.retire(&task, agent.as_ref()).await?;
        Ok(())
    }

    async fn decline(&self, offer_ids: Vec<OfferId>) {
        if offer_ids.is_empty() {
            return;
        }

        let filters = Filters {
            refuse_seconds: Some(self.config.decline_refuse_seconds),
        };
        let count = offer_ids.len();
        match self.transport.decline(offer_ids, filters).await {
            Ok(()) => debug!(count, "Offers declined"),
            Err(e) => error!(count, error = %e, "Failed to decline offers"),
        }
    }

    fn lock_matcher(&self) -> MutexGuard<'_, Box<dyn ResourceMatcher>> {
        self.matcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
