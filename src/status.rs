//! Node status state machine and dependency readiness

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ChipFlowError, Result};
use crate::models::{NodeId, NodeStatus};

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Error => "error",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Timeout => "timeout",
        }
    }

    /// Terminal statuses end a node's lifecycle for the current run
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Error | NodeStatus::Skipped | NodeStatus::Timeout
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, NodeStatus::Error | NodeStatus::Timeout)
    }

    /// Whether a downstream node may consume this node's outputs
    pub fn is_usable(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Skipped)
    }

    /// Allowed transitions within a single run
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Queued | Running | Skipped | Error)
                | (Queued, Running | Skipped | Error)
                | (Running, Success | Error | Timeout | Skipped)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ChipFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "queued" => Ok(NodeStatus::Queued),
            "running" => Ok(NodeStatus::Running),
            "success" => Ok(NodeStatus::Success),
            "error" => Ok(NodeStatus::Error),
            "skipped" => Ok(NodeStatus::Skipped),
            "timeout" => Ok(NodeStatus::Timeout),
            other => Err(ChipFlowError::InvalidStatus(other.to_string())),
        }
    }
}

/// Outcome of checking a node's dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency has not reached a terminal status
    Waiting,
    /// All dependencies are settled and the node may start
    Launch,
    /// The node cannot run and is marked `error` without launching
    Fail,
}

/// Decide whether a node can launch given its dependencies' statuses.
///
/// Ordinary nodes need every dependency to be usable and fail as soon as one
/// of them errors. Builtin combinators wait for all dependencies to settle and
/// launch when at least one of them succeeded.
pub fn readiness(deps: &[NodeStatus], builtin: bool) -> Readiness {
    if builtin {
        if deps.iter().any(|s| !s.is_done()) {
            return Readiness::Waiting;
        }
        if deps.is_empty() || deps.contains(&NodeStatus::Success) {
            Readiness::Launch
        } else {
            Readiness::Fail
        }
    } else {
        if deps.iter().any(NodeStatus::is_error) {
            return Readiness::Fail;
        }
        if deps.iter().all(NodeStatus::is_done) {
            Readiness::Launch
        } else {
            Readiness::Waiting
        }
    }
}

/// Live status map owned by the scheduler
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    flow: String,
    statuses: BTreeMap<NodeId, NodeStatus>,
}

impl StatusBoard {
    pub fn new(flow: impl Into<String>) -> Self {
        Self {
            flow: flow.into(),
            statuses: BTreeMap::new(),
        }
    }

    /// Start tracking a node in `pending`
    pub fn track(&mut self, node: NodeId) {
        self.statuses.entry(node).or_insert(NodeStatus::Pending);
    }

    /// Force a status, used for seeding and resets between runs
    pub fn seed(&mut self, node: NodeId, status: NodeStatus) {
        self.statuses.insert(node, status);
    }

    pub fn get(&self, node: &NodeId) -> Option<NodeStatus> {
        self.statuses.get(node).copied()
    }

    /// Apply a checked transition
    pub fn transition(&mut self, node: &NodeId, next: NodeStatus) -> Result<()> {
        let current = self.statuses.get_mut(node).ok_or_else(|| ChipFlowError::UnknownNode {
            flow: self.flow.clone(),
            node: node.to_string(),
        })?;
        if !current.can_transition_to(next) {
            return Err(ChipFlowError::InvalidTransition {
                node: node.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        *current = next;
        Ok(())
    }

    /// Nodes currently in the given status
    pub fn with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, NodeStatus)> {
        self.statuses.iter().map(|(n, s)| (n, *s))
    }

    pub fn snapshot(&self) -> BTreeMap<NodeId, NodeStatus> {
        self.statuses.clone()
    }
}
