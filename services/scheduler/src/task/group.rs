//! Scale groups.

use crate::ids::AgentId;

use super::GROUP_PREFIX;

/// Sub-tasks created from one multi-instance request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScaleGroup {
    pub name: String,

    /// Agents hosting members, in link order.
    pub agents: Vec<AgentId>,

    /// Members still tracked; never negative.
    pub size: i64,
}

impl ScaleGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            size: 0,
        }
    }

    /// Record `agent` as hosting a member. Returns false if already linked.
    pub fn link(&mut self, agent: &AgentId) -> bool {
        if self.agents.contains(agent) {
            return false;
        }
        self.agents.push(agent.clone());
        true
    }

    /// Forget `agent`. Returns false if it was not linked.
    pub fn unlink(&mut self, agent: &AgentId) -> bool {
        let before = self.agents.len();
        self.agents.retain(|a| a != agent);
        self.agents.len() != before
    }

    pub(crate) fn key(name: &str) -> String {
        format!("{GROUP_PREFIX}{name}")
    }

    pub(crate) fn size_key(name: &str) -> String {
        format!("{GROUP_PREFIX}{name}/size")
    }

    /// Agents as stored: a comma-joined list.
    pub(crate) fn encode_agents(&self) -> String {
        self.agents
            .iter()
            .map(AgentId::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn decode_agents(value: &str) -> Vec<AgentId> {
        value
            .split(',')
            .filter(|s| !s.is_empty())
            .map(AgentId::from)
            .collect()
    }
}

/// Group name of a sub-task: its name without a trailing `-N`.
///
/// Names without a numeric suffix are returned unchanged.
pub fn group_name_of(task_name: &str) -> &str {
    match task_name.rsplit_once('-') {
        Some((base, n))
            if !base.is_empty() && !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => task_name,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("web-1", "web")]
    #[case("web-12", "web")]
    #[case("api-v2-3", "api-v2")]
    #[case("web", "web")]
    #[case("web-", "web-")]
    #[case("web-x", "web-x")]
    #[case("-1", "-1")]
    fn test_group_name_of(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(group_name_of(name), expected);
    }

    #[test]
    fn test_link_keeps_order_without_duplicates() {
        let mut group = ScaleGroup::new("web");
        assert!(group.link(&AgentId::new("a2")));
        assert!(group.link(&AgentId::new("a1")));
        assert!(!group.link(&AgentId::new("a2")));
        assert_eq!(group.encode_agents(), "a2,a1");

        assert!(group.unlink(&AgentId::new("a2")));
        assert!(!group.unlink(&AgentId::new("a2")));
        assert_eq!(group.encode_agents(), "a1");
    }

    #[test]
    fn test_decode_agents_skips_empty() {
        assert!(ScaleGroup::decode_agents("").is_empty());
        assert_eq!(
            ScaleGroup::decode_agents("a1,a2"),
            vec![AgentId::new("a1"), AgentId::new("a2")]
        );
    }
}
