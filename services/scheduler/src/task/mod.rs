//! Task records and the registry that owns them.
//!
//! A [`Task`] pairs an immutable [`TaskDescriptor`] with the last state the
//! scheduler recorded for it. Tasks requesting more than one instance are
//! expanded into sub-tasks that share a [`ScaleGroup`].

mod group;
mod manager;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, TaskId};

pub use group::{group_name_of, ScaleGroup};
pub use manager::{TaskError, TaskManager};

/// Key prefix for ungrouped task records.
pub const TASK_PREFIX: &str = "/tasks/";

/// Key prefix for scale groups and their member records.
pub const GROUP_PREFIX: &str = "/taskgroup/";

/// Task lifecycle state, as reported by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Unknown,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Lost,
    Dropped,
    Error,
    Gone,
    GoneByOperator,
    Unreachable,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Staging => "STAGING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Killing => "KILLING",
            Self::Killed => "KILLED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Lost => "LOST",
            Self::Dropped => "DROPPED",
            Self::Error => "ERROR",
            Self::Gone => "GONE",
            Self::GoneByOperator => "GONE_BY_OPERATOR",
            Self::Unreachable => "UNREACHABLE",
        }
    }

    /// States after which the task is removed from the registry.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Finished | Self::Killed)
    }

    /// Failure states that send the task back for placement.
    pub fn needs_reschedule(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Dropped | Self::Error | Self::Gone | Self::Lost
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "UNKNOWN" => Self::Unknown,
            "STAGING" => Self::Staging,
            "STARTING" => Self::Starting,
            "RUNNING" => Self::Running,
            "KILLING" => Self::Killing,
            "KILLED" => Self::Killed,
            "FINISHED" => Self::Finished,
            "FAILED" => Self::Failed,
            "LOST" => Self::Lost,
            "DROPPED" => Self::Dropped,
            "ERROR" => Self::Error,
            "GONE" => Self::Gone,
            "GONE_BY_OPERATOR" => Self::GoneByOperator,
            "UNREACHABLE" => Self::Unreachable,
            other => return Err(format!("unknown task state: {other}")),
        };
        Ok(state)
    }
}

/// Scalar resources requested by a task or carried by an offer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    /// Memory in MiB.
    pub mem: f64,
    /// Disk in MiB.
    #[serde(default)]
    pub disk: f64,
}

impl Resources {
    pub fn new(cpus: f64, mem: f64, disk: f64) -> Self {
        Self { cpus, mem, disk }
    }

    /// Returns true if `self` can hold `request`.
    pub fn covers(&self, request: &Resources) -> bool {
        self.cpus >= request.cpus && self.mem >= request.mem && self.disk >= request.disk
    }

    /// Subtract `request`, flooring every scalar at zero.
    pub fn consume(&mut self, request: &Resources) {
        self.cpus = (self.cpus - request.cpus).max(0.0);
        self.mem = (self.mem - request.mem).max(0.0);
        self.disk = (self.disk - request.disk).max(0.0);
    }

    pub fn is_empty(&self) -> bool {
        self.cpus <= 0.0 || self.mem <= 0.0
    }
}

/// Container image to run the task in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Placement constraint: the offer's `attribute` must equal `value`.
///
/// The attribute `hostname` matches the offer's hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    pub value: String,
}

impl Constraint {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

/// Launch specification of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub task_id: TaskId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,

    pub resources: Resources,

    /// Agent the task was placed on; unset until matched to an offer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl TaskDescriptor {
    /// Descriptor with a freshly minted task ID.
    pub fn new(name: impl Into<String>, resources: Resources) -> Self {
        let name = name.into();
        Self {
            task_id: TaskId::generate(&name),
            name,
            command: None,
            container: None,
            resources,
            agent_id: None,
            constraints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Scale group membership of a sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_name: String,
    pub in_group: bool,
}

/// A task and the state the scheduler last recorded for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub descriptor: TaskDescriptor,
    pub state: TaskState,

    /// Requested replica count.
    pub instances: u32,

    #[serde(default)]
    pub group: GroupInfo,
}

impl Task {
    /// A single-instance task awaiting placement.
    pub fn new(descriptor: TaskDescriptor) -> Self {
        Self {
            descriptor,
            state: TaskState::Unknown,
            instances: 1,
            group: GroupInfo::default(),
        }
    }

    #[must_use]
    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn task_id(&self) -> &TaskId {
        &self.descriptor.task_id
    }

    /// Key of this task's persisted record.
    pub fn storage_key(&self) -> String {
        if self.group.in_group {
            format!("{}{}/{}", GROUP_PREFIX, self.group.group_name, self.task_id())
        } else {
            format!("{}{}", TASK_PREFIX, self.task_id())
        }
    }

    /// The `n`th sub-task of a multi-instance request (1-based).
    pub(crate) fn sub_task(&self, n: u32) -> Task {
        let mut descriptor = self.descriptor.clone();
        descriptor.name = format!("{}-{}", self.descriptor.name, n);
        descriptor.task_id = self.descriptor.task_id.instance(n);

        Task {
            descriptor,
            state: self.state,
            instances: 1,
            group: GroupInfo {
                group_name: self.descriptor.name.clone(),
                in_group: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(TaskState::Finished, true, false)]
    #[case(TaskState::Killed, true, false)]
    #[case(TaskState::Failed, false, true)]
    #[case(TaskState::Lost, false, true)]
    #[case(TaskState::Dropped, false, true)]
    #[case(TaskState::Error, false, true)]
    #[case(TaskState::Gone, false, true)]
    #[case(TaskState::Running, false, false)]
    #[case(TaskState::GoneByOperator, false, false)]
    #[case(TaskState::Unreachable, false, false)]
    fn test_state_policy(
        #[case] state: TaskState,
        #[case] terminal: bool,
        #[case] reschedule: bool,
    ) {
        assert_eq!(state.is_terminal_success(), terminal);
        assert_eq!(state.needs_reschedule(), reschedule);
    }

    #[test]
    fn test_state_string_form() {
        assert_eq!(TaskState::GoneByOperator.to_string(), "GONE_BY_OPERATOR");
        assert_eq!(
            "GONE_BY_OPERATOR".parse::<TaskState>().unwrap(),
            TaskState::GoneByOperator
        );
        assert_eq!(
            serde_json::to_string(&TaskState::Staging).unwrap(),
            "\"STAGING\""
        );
        assert!("RUNNIN".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_storage_keys() {
        let task = Task::new(TaskDescriptor::new("web", Resources::new(1.0, 128.0, 0.0)));
        assert_eq!(task.storage_key(), format!("/tasks/{}", task.task_id()));

        let sub = task.clone().with_instances(2).sub_task(2);
        assert_eq!(sub.name(), "web-2");
        assert_eq!(
            sub.storage_key(),
            format!("/taskgroup/web/{}-2", task.task_id())
        );
    }

    #[test]
    fn test_resources_consume_floors_at_zero() {
        let mut offer = Resources::new(2.0, 256.0, 0.0);
        assert!(offer.covers(&Resources::new(1.5, 256.0, 0.0)));

        offer.consume(&Resources::new(1.5, 300.0, 0.0));
        assert_eq!(offer.mem, 0.0);
        assert!(offer.is_empty());
    }
}
