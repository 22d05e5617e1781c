//! Task registry with write-through persistence.
//!
//! Every mutation takes the registry's write lock, writes the store, and only
//! then touches memory. A failed store write leaves memory untouched, and no
//! reader can observe a record that has not been persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use drover_kv::{KeyValueStore, KvError};
use drover_retry::RetryPolicy;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{group_name_of, ScaleGroup, Task, TaskDescriptor, TaskState, GROUP_PREFIX, TASK_PREFIX};
use crate::ids::{AgentId, TaskId};

/// Errors from task registry operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    Conflict(String),

    #[error("scale group not found: {0}")]
    GroupNotFound(String),

    #[error("scale group already exists: {0}")]
    GroupExists(String),

    #[error("scale group {name} still has {size} members")]
    GroupNotEmpty { name: String, size: i64 },

    #[error("task {0} must request at least one instance")]
    InvalidInstances(String),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("failed to encode task record {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt task record at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt scale group record at {key}: {value:?}")]
    CorruptGroup { key: String, value: String },

    #[error("{} tasks failed: {}", .0.len(), describe_batch(.0))]
    Batch(Vec<TaskError>),
}

impl TaskError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::GroupNotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::GroupExists(_))
    }
}

fn describe_batch(errors: &[TaskError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn decode_task(key: &str, value: &str) -> Result<Task, TaskError> {
    serde_json::from_str(value).map_err(|source| TaskError::Decode {
        key: key.to_string(),
        source,
    })
}

#[derive(Debug, Default)]
struct Registry {
    /// Tasks by name.
    tasks: BTreeMap<String, Task>,
    groups: BTreeMap<String, ScaleGroup>,
    policies: HashMap<TaskId, RetryPolicy>,
}

impl Registry {
    /// Name of the group `name` refers to, accepting either a group name or
    /// the name of one of its sub-tasks.
    fn resolve_group(&self, name: &str) -> String {
        if self.groups.contains_key(name) {
            name.to_string()
        } else {
            group_name_of(name).to_string()
        }
    }
}

/// Authoritative store of task and scale group state.
pub struct TaskManager {
    store: Arc<dyn KeyValueStore>,

    /// Copied for every task that fails for the first time.
    retry_template: RetryPolicy,

    registry: RwLock<Registry>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn KeyValueStore>, retry_template: RetryPolicy) -> Self {
        Self {
            store,
            retry_template,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Add tasks, expanding multi-instance requests into scale groups.
    ///
    /// Each task is handled independently: a failure aborts that task only
    /// and the rest of the batch is still applied. A single failure is
    /// returned as is, several as [`TaskError::Batch`].
    pub async fn add(&self, tasks: Vec<Task>) -> Result<(), TaskError> {
        let mut registry = self.registry.write().await;
        let mut failures = Vec::new();

        for task in tasks {
            let name = task.name().to_string();
            if let Err(e) = self.add_one(&mut registry, task).await {
                warn!(task = %name, error = %e, "Failed to add task");
                failures.push(e);
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(TaskError::Batch(failures)),
        }
    }

    async fn add_one(&self, registry: &mut Registry, task: Task) -> Result<(), TaskError> {
        if task.instances == 0 {
            return Err(TaskError::InvalidInstances(task.name().to_string()));
        }

        if task.instances == 1 {
            if registry.tasks.contains_key(task.name()) {
                return Err(TaskError::Conflict(task.name().to_string()));
            }
            self.persist(&task).await?;
            info!(task = %task.name(), task_id = %task.task_id(), "Task added");
            registry.tasks.insert(task.name().to_string(), task);
            return Ok(());
        }

        let base = task.name().to_string();
        let subs: Vec<Task> = (1..=task.instances).map(|n| task.sub_task(n)).collect();

        // All names are checked before anything is written
        if let Some(taken) = subs.iter().find(|s| registry.tasks.contains_key(s.name())) {
            return Err(TaskError::Conflict(taken.name().to_string()));
        }

        if !registry.groups.contains_key(&base) {
            self.create_group_locked(registry, &base).await?;
        }

        for sub in subs {
            self.persist(&sub).await?;
            debug!(task = %sub.name(), group = %base, "Sub-task added");
            registry.tasks.insert(sub.name().to_string(), sub);
            self.set_size_locked(registry, &base, 1).await?;
        }

        info!(group = %base, instances = task.instances, "Scale group deployed");
        Ok(())
    }

    /// Remove tasks from memory and storage. Absent tasks are skipped.
    pub async fn delete(&self, tasks: &[Task]) -> Result<(), TaskError> {
        let mut registry = self.registry.write().await;

        for task in tasks {
            let key = registry
                .tasks
                .get(task.name())
                .map(Task::storage_key)
                .unwrap_or_else(|| task.storage_key());

            self.store.delete(&key).await?;

            if let Some(removed) = registry.tasks.remove(task.name()) {
                registry.policies.remove(removed.task_id());
                info!(task = %removed.name(), task_id = %removed.task_id(), "Task deleted");
            }
        }

        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Task, TaskError> {
        let registry = self.registry.read().await;
        registry
            .tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(name.to_string()))
    }

    pub async fn get_by_id(&self, task_id: &TaskId) -> Result<Task, TaskError> {
        let registry = self.registry.read().await;
        registry
            .tasks
            .values()
            .find(|t| t.task_id() == task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    pub async fn has_task(&self, descriptor: &TaskDescriptor) -> bool {
        self.registry
            .read()
            .await
            .tasks
            .contains_key(&descriptor.name)
    }

    /// Overwrite existing task records.
    ///
    /// Stops at the first task that is not registered or fails to persist;
    /// earlier tasks in the batch stay updated.
    pub async fn update(&self, tasks: Vec<Task>) -> Result<(), TaskError> {
        let mut registry = self.registry.write().await;

        for task in tasks {
            if !registry.tasks.contains_key(task.name()) {
                return Err(TaskError::NotFound(task.name().to_string()));
            }
            self.persist(&task).await?;
            registry.tasks.insert(task.name().to_string(), task);
        }

        Ok(())
    }

    /// Record a new state for `task`, returning the updated record.
    ///
    /// Fails with [`TaskError::NotFound`] if the registered task of that name
    /// has a different ID, so a stale reference cannot touch a redeployed
    /// task.
    pub async fn set(&self, state: TaskState, task: &Task) -> Result<Task, TaskError> {
        let mut registry = self.registry.write().await;

        let mut updated = registry
            .tasks
            .get(task.name())
            .filter(|current| current.task_id() == task.task_id())
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task.name().to_string()))?;
        let previous = updated.state;
        updated.state = state;

        self.persist(&updated).await?;
        debug!(task = %updated.name(), from = %previous, to = %state, "Task state set");
        registry
            .tasks
            .insert(updated.name().to_string(), updated.clone());

        Ok(updated)
    }

    /// Every task currently in `state`, ordered by name.
    pub async fn all_by_state(&self, state: TaskState) -> Result<Vec<Task>, TaskError> {
        let registry = self.registry.read().await;
        let matching: Vec<Task> = registry
            .tasks
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect();

        if matching.is_empty() {
            return Err(TaskError::NotFound(format!("tasks in state {state}")));
        }
        Ok(matching)
    }

    pub async fn all(&self) -> Result<Vec<Task>, TaskError> {
        let registry = self.registry.read().await;
        if registry.tasks.is_empty() {
            return Err(TaskError::NotFound("no tasks registered".to_string()));
        }
        Ok(registry.tasks.values().cloned().collect())
    }

    pub async fn total_tasks(&self) -> usize {
        self.registry.read().await.tasks.len()
    }

    // Scale groups

    pub async fn create_group(&self, name: &str) -> Result<(), TaskError> {
        let mut registry = self.registry.write().await;
        self.create_group_locked(&mut registry, name).await
    }

    /// Delete an empty group and its records.
    pub async fn delete_group(&self, name: &str) -> Result<(), TaskError> {
        let mut registry = self.registry.write().await;
        let name = registry.resolve_group(name);

        let size = registry
            .groups
            .get(&name)
            .map(|g| g.size)
            .ok_or_else(|| TaskError::GroupNotFound(name.clone()))?;
        if size != 0 {
            return Err(TaskError::GroupNotEmpty { name, size });
        }

        self.store.delete(&ScaleGroup::size_key(&name)).await?;
        self.store.delete(&ScaleGroup::key(&name)).await?;
        registry.groups.remove(&name);

        info!(group = %name, "Scale group deleted");
        Ok(())
    }

    /// Adjust a group's size by `delta`, flooring at zero. Returns the new size.
    pub async fn set_size(&self, name: &str, delta: i64) -> Result<i64, TaskError> {
        let mut registry = self.registry.write().await;
        self.set_size_locked(&mut registry, name, delta).await
    }

    /// Record `agent` as hosting a member of the group.
    pub async fn link(&self, name: &str, agent: &AgentId) -> Result<(), TaskError> {
        let mut registry = self.registry.write().await;
        let name = registry.resolve_group(name);
        let group = registry
            .groups
            .get_mut(&name)
            .ok_or_else(|| TaskError::GroupNotFound(name.clone()))?;

        let mut linked = group.clone();
        if !linked.link(agent) {
            return Ok(());
        }

        self.store
            .update(&ScaleGroup::key(&name), &linked.encode_agents())
            .await?;
        *group = linked;

        debug!(group = %name, agent_id = %agent, "Agent linked");
        Ok(())
    }

    pub async fn unlink(&self, name: &str, agent: &AgentId) -> Result<(), TaskError> {
        let mut registry = self.registry.write().await;
        let name = registry.resolve_group(name);
        let group = registry
            .groups
            .get_mut(&name)
            .ok_or_else(|| TaskError::GroupNotFound(name.clone()))?;

        let mut unlinked = group.clone();
        if !unlinked.unlink(agent) {
            return Ok(());
        }

        self.store
            .update(&ScaleGroup::key(&name), &unlinked.encode_agents())
            .await?;
        *group = unlinked;

        debug!(group = %name, agent_id = %agent, "Agent unlinked");
        Ok(())
    }

    pub async fn read_group(&self, name: &str) -> Result<ScaleGroup, TaskError> {
        let registry = self.registry.read().await;
        let name = registry.resolve_group(name);
        registry
            .groups
            .get(&name)
            .cloned()
            .ok_or(TaskError::GroupNotFound(name))
    }

    /// Returns true if the registered task is a member of an existing group.
    pub async fn is_in_group(&self, descriptor: &TaskDescriptor) -> bool {
        let registry = self.registry.read().await;
        registry
            .tasks
            .get(&descriptor.name)
            .filter(|t| t.group.in_group)
            .is_some_and(|t| registry.groups.contains_key(&t.group.group_name))
    }

    async fn create_group_locked(
        &self,
        registry: &mut Registry,
        name: &str,
    ) -> Result<(), TaskError> {
        if registry.groups.contains_key(name) {
            return Err(TaskError::GroupExists(name.to_string()));
        }

        self.store.update(&ScaleGroup::key(name), "").await?;
        self.store.update(&ScaleGroup::size_key(name), "0").await?;
        registry
            .groups
            .insert(name.to_string(), ScaleGroup::new(name));

        info!(group = %name, "Scale group created");
        Ok(())
    }

    async fn set_size_locked(
        &self,
        registry: &mut Registry,
        name: &str,
        delta: i64,
    ) -> Result<i64, TaskError> {
        let name = registry.resolve_group(name);
        let group = registry
            .groups
            .get_mut(&name)
            .ok_or_else(|| TaskError::GroupNotFound(name.clone()))?;

        let size = group.size.saturating_add(delta).max(0);
        self.store
            .update(&ScaleGroup::size_key(&name), &size.to_string())
            .await?;
        group.size = size;

        Ok(size)
    }

    // Retry bookkeeping

    /// The task's reschedule policy, created from the template on first use.
    pub async fn retry_policy(&self, task_id: &TaskId) -> RetryPolicy {
        let mut registry = self.registry.write().await;
        registry
            .policies
            .entry(task_id.clone())
            .or_insert_with(|| self.retry_template.clone())
            .clone()
    }

    /// Spend one reschedule attempt. Returns `None` once the policy is spent.
    pub async fn next_retry_delay(&self, task_id: &TaskId) -> Option<Duration> {
        let mut registry = self.registry.write().await;
        registry
            .policies
            .entry(task_id.clone())
            .or_insert_with(|| self.retry_template.clone())
            .advance()
    }

    pub async fn clear_retry_policy(&self, task_id: &TaskId) {
        self.registry.write().await.policies.remove(task_id);
    }

    /// Reload tasks and groups from storage, replacing the in-memory state.
    ///
    /// Returns the number of tasks restored. Any corrupt record aborts the
    /// restore and leaves memory untouched.
    pub async fn restore(&self) -> Result<usize, TaskError> {
        let mut registry = self.registry.write().await;
        let mut restored = Registry::default();

        for entry in self.store.read_all(TASK_PREFIX).await? {
            let task = decode_task(&entry.key, &entry.value)?;
            restored.tasks.insert(task.name().to_string(), task);
        }

        for entry in self.store.read_all(GROUP_PREFIX).await? {
            let Some(rest) = entry.key.strip_prefix(GROUP_PREFIX) else {
                continue;
            };

            match rest.split_once('/') {
                None => {
                    restored
                        .groups
                        .entry(rest.to_string())
                        .or_insert_with(|| ScaleGroup::new(rest))
                        .agents = ScaleGroup::decode_agents(&entry.value);
                }
                Some((name, "size")) => {
                    let size = entry.value.trim().parse::<i64>().map_err(|_| {
                        TaskError::CorruptGroup {
                            key: entry.key.clone(),
                            value: entry.value.clone(),
                        }
                    })?;
                    restored
                        .groups
                        .entry(name.to_string())
                        .or_insert_with(|| ScaleGroup::new(name))
                        .size = size.max(0);
                }
                Some(_) => {
                    let task = decode_task(&entry.key, &entry.value)?;
                    restored.tasks.insert(task.name().to_string(), task);
                }
            }
        }

        let count = restored.tasks.len();
        info!(
            tasks = count,
            groups = restored.groups.len(),
            "Task registry restored"
        );
        *registry = restored;

        Ok(count)
    }

    async fn persist(&self, task: &Task) -> Result<(), TaskError> {
        let key = task.storage_key();
        let value = serde_json::to_string(task).map_err(|source| TaskError::Encode {
            key: key.clone(),
            source,
        })?;
        self.store.update(&key, &value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use drover_kv::MemoryStore;

    use super::*;
    use crate::task::Resources;

    fn task(name: &str) -> Task {
        Task::new(TaskDescriptor::new(name, Resources::new(0.5, 64.0, 0.0)))
    }

    fn manager() -> (Arc<MemoryStore>, TaskManager) {
        let store = Arc::new(MemoryStore::new());
        let policy = RetryPolicy::new(2, Duration::from_millis(10), true)
            .with_bounds(Duration::from_millis(1), Duration::from_secs(1));
        (store.clone(), TaskManager::new(store, policy))
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let (_, tasks) = manager();
        tasks.add(vec![task("web")]).await.unwrap();

        let err = tasks.add(vec![task("web")]).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(tasks.total_tasks().await, 1);
    }

    #[tokio::test]
    async fn test_batch_applies_independent_tasks() {
        let (_, tasks) = manager();
        let err = tasks
            .add(vec![task("a"), task("a"), task("b")])
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Conflict(ref name) if name == "a"));
        assert!(tasks.get("a").await.is_ok());
        assert!(tasks.get("b").await.is_ok());
    }

    #[tokio::test]
    async fn test_multiple_failures_are_batched() {
        let (_, tasks) = manager();
        tasks.add(vec![task("a"), task("b")]).await.unwrap();

        let err = tasks
            .add(vec![task("a"), task("b"), task("c")])
            .await
            .unwrap_err();
        match err {
            TaskError::Batch(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected batch error, got {other:?}"),
        }
        assert_eq!(tasks.total_tasks().await, 3);
    }

    #[tokio::test]
    async fn test_group_expansion() {
        let (store, tasks) = manager();
        let web = task("web").with_instances(3);
        let base_id = web.task_id().clone();

        tasks.add(vec![web]).await.unwrap();

        let all = tasks.all().await.unwrap();
        let names: Vec<_> = all.iter().map(Task::name).collect();
        assert_eq!(names, vec!["web-1", "web-2", "web-3"]);
        for (n, sub) in all.iter().enumerate() {
            assert!(sub.group.in_group);
            assert_eq!(sub.group.group_name, "web");
            assert_eq!(sub.instances, 1);
            assert_eq!(sub.task_id(), &base_id.instance(n as u32 + 1));
        }

        assert_eq!(tasks.read_group("web").await.unwrap().size, 3);
        assert_eq!(store.read("/taskgroup/web/size").await.unwrap(), "3");
        assert!(store
            .read(&format!("/taskgroup/web/{}", base_id.instance(2)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_group_collision_aborts_whole_request() {
        let (_, tasks) = manager();
        tasks.add(vec![task("web-2")]).await.unwrap();

        let err = tasks
            .add(vec![task("web").with_instances(3)])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Conflict(ref name) if name == "web-2"));
        assert_eq!(tasks.total_tasks().await, 1);
        assert!(tasks.read_group("web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_zero_instances_rejected() {
        let (_, tasks) = manager();
        let err = tasks
            .add(vec![task("web").with_instances(0)])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInstances(_)));
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_task_absent() {
        let (store, tasks) = manager();
        store.set_available(false);

        let err = tasks.add(vec![task("web")]).await.unwrap_err();
        assert!(matches!(err, TaskError::Storage(_)));
        assert!(tasks.get("web").await.unwrap_err().is_not_found());
        assert_eq!(tasks.total_tasks().await, 0);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_previous_state() {
        let (store, tasks) = manager();
        let web = task("web");
        tasks.add(vec![web.clone()]).await.unwrap();

        store.set_available(false);
        assert!(tasks.set(TaskState::Running, &web).await.is_err());
        store.set_available(true);

        assert_eq!(tasks.get("web").await.unwrap().state, TaskState::Unknown);
    }

    #[tokio::test]
    async fn test_set_persists_before_returning() {
        let (store, tasks) = manager();
        let web = task("web");
        tasks.add(vec![web.clone()]).await.unwrap();

        let updated = tasks.set(TaskState::Running, &web).await.unwrap();
        assert_eq!(updated.state, TaskState::Running);

        let raw = store.read(&web.storage_key()).await.unwrap();
        let stored: Task = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.state, TaskState::Running);
    }

    #[tokio::test]
    async fn test_set_rejects_stale_task_id() {
        let (_, tasks) = manager();
        tasks.add(vec![task("web")]).await.unwrap();

        let stale = task("web");
        assert!(tasks
            .set(TaskState::Running, &stale)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, tasks) = manager();
        let web = task("web");
        tasks.add(vec![web.clone()]).await.unwrap();

        tasks.delete(&[web.clone()]).await.unwrap();
        tasks.delete(&[web.clone()]).await.unwrap();

        assert!(store.read(&web.storage_key()).await.unwrap_err().is_not_found());
        assert!(tasks.all().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_lookups_on_empty_registry() {
        let (_, tasks) = manager();
        let web = task("web");

        assert!(tasks.get_by_id(web.task_id()).await.unwrap_err().is_not_found());
        assert!(tasks
            .all_by_state(TaskState::Unknown)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!tasks.has_task(&web.descriptor).await);
    }

    #[tokio::test]
    async fn test_all_by_state_filters() {
        let (_, tasks) = manager();
        let web = task("web");
        tasks.add(vec![web.clone(), task("db")]).await.unwrap();
        tasks.set(TaskState::Running, &web).await.unwrap();

        let running = tasks.all_by_state(TaskState::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name(), "web");
        assert_eq!(
            tasks.get_by_id(web.task_id()).await.unwrap().state,
            TaskState::Running
        );
    }

    #[tokio::test]
    async fn test_group_operations_resolve_sub_task_names() {
        let (store, tasks) = manager();
        tasks
            .add(vec![task("web").with_instances(2)])
            .await
            .unwrap();

        let agent = AgentId::new("agent-1");
        tasks.link("web-1", &agent).await.unwrap();
        tasks.link("web-2", &agent).await.unwrap();
        assert_eq!(tasks.read_group("web-2").await.unwrap().agents, vec![agent.clone()]);
        assert_eq!(store.read("/taskgroup/web").await.unwrap(), "agent-1");

        let sub = tasks.get("web-1").await.unwrap();
        assert!(tasks.is_in_group(&sub.descriptor).await);

        tasks.unlink("web-1", &agent).await.unwrap();
        assert!(tasks.read_group("web").await.unwrap().agents.is_empty());
    }

    #[tokio::test]
    async fn test_group_delete_requires_zero_size() {
        let (store, tasks) = manager();
        tasks.create_group("batch").await.unwrap();
        assert!(tasks.create_group("batch").await.unwrap_err().is_conflict());

        assert_eq!(tasks.set_size("batch", 2).await.unwrap(), 2);
        assert!(matches!(
            tasks.delete_group("batch").await,
            Err(TaskError::GroupNotEmpty { size: 2, .. })
        ));

        assert_eq!(tasks.set_size("batch", -5).await.unwrap(), 0);
        tasks.delete_group("batch").await.unwrap();
        assert!(store.read("/taskgroup/batch").await.unwrap_err().is_not_found());
        assert!(store
            .read("/taskgroup/batch/size")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_retry_policy_is_per_task() {
        let (_, tasks) = manager();
        let a = TaskId::new("a");
        let b = TaskId::new("b");

        assert_eq!(tasks.next_retry_delay(&a).await, Some(Duration::from_millis(20)));
        assert_eq!(tasks.next_retry_delay(&a).await, Some(Duration::from_millis(40)));
        assert_eq!(tasks.next_retry_delay(&a).await, None);
        assert_eq!(tasks.retry_policy(&a).await.total_retries, 2);

        assert_eq!(tasks.retry_policy(&b).await.total_retries, 0);

        tasks.clear_retry_policy(&a).await;
        assert_eq!(tasks.retry_policy(&a).await.total_retries, 0);
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let (store, tasks) = manager();
        let db = task("db");
        tasks
            .add(vec![db.clone(), task("web").with_instances(2)])
            .await
            .unwrap();
        tasks.set(TaskState::Running, &db).await.unwrap();
        tasks.link("web", &AgentId::new("agent-9")).await.unwrap();

        let restored = TaskManager::new(store, RetryPolicy::default());
        assert_eq!(restored.restore().await.unwrap(), 3);

        assert_eq!(restored.all().await.unwrap(), tasks.all().await.unwrap());
        assert_eq!(
            restored.read_group("web").await.unwrap(),
            tasks.read_group("web").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_corrupt_record() {
        let (store, tasks) = manager();
        tasks.add(vec![task("web")]).await.unwrap();
        store.update("/tasks/broken", "{not json").await.unwrap();

        let fresh = TaskManager::new(store, RetryPolicy::default());
        assert!(matches!(
            fresh.restore().await,
            Err(TaskError::Decode { ref key, .. }) if key == "/tasks/broken"
        ));
        assert_eq!(fresh.total_tasks().await, 0);
    }
}
