//! Core data models for ChipFlow flowgraphs

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ChipFlowError;

// Input validation limits
pub const MAX_FLOW_FILE_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_NODE_COUNT: usize = 1_000;
pub const MAX_NAME_LEN: usize = 64;

/// Names that cannot be used as a step or index
pub const RESERVED_NAMES: &[&str] = &["global", "default"];
/// Prefix reserved for internal steps
pub const RESERVED_PREFIX: &str = "sc_";

/// Tool name that binds a node to an in-process combinator
pub const BUILTIN_TOOL: &str = "builtin";

pub const DEFAULT_JOBNAME: &str = "job0";
pub const DEFAULT_BUILDDIR: &str = "build";
pub const DEFAULT_INDEX: &str = "0";

/// Identity of one stage instance in a flowgraph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    pub step: String,
    pub index: String,
}

impl NodeId {
    pub fn new(step: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            index: index.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.step, self.index)
    }
}

impl FromStr for NodeId {
    type Err = ChipFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((step, index)) if !step.is_empty() && !index.is_empty() && !index.contains('/') => {
                Ok(NodeId::new(step, index))
            }
            _ => Err(ChipFlowError::InvalidNodeId(s.to_string())),
        }
    }
}

impl TryFrom<String> for NodeId {
    type Error = ChipFlowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Success,
    Error,
    Skipped,
    Timeout,
}

/// Flow file parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub design: String,
    #[serde(default = "default_jobname")]
    pub jobname: String,
    #[serde(default = "default_builddir")]
    pub builddir: String,
    /// Flowgraph to execute
    pub flow: String,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    pub flows: BTreeMap<String, Vec<NodeConfig>>,
}

/// Run-level options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub prune: Vec<NodeId>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub clean: bool,
    /// Default per-node wall-clock budget in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Keep log-reported errors from failing a node
    #[serde(default, rename = "continue")]
    pub continue_on_error: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One node declaration inside a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub step: String,
    #[serde(default = "default_index", deserialize_with = "deserialize_index")]
    pub index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default)]
    pub inputs: Vec<NodeId>,
    /// Metric weights consumed by downstream selection combinators
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Metric goals; an input exceeding a goal is not selectable
    #[serde(default)]
    pub goals: BTreeMap<String, f64>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    /// Name of the remote host this node is deferred to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Job whose results feed this node instead of the current job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobinput: Option<String>,
}

impl NodeConfig {
    pub fn id(&self) -> NodeId {
        NodeId::new(self.step.clone(), self.index.clone())
    }
}

/// External tool description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
    /// Switches that make the executable print its version
    #[serde(default)]
    pub vswitch: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_pattern: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
}

/// Per-task settings of a tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Log-scan chains keyed by report suffix (`errors`, `warnings`, ...)
    #[serde(default)]
    pub regex: BTreeMap<String, Vec<String>>,
    /// Files that must exist in `inputs/` before the tool runs
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Files the tool is expected to leave in `outputs/`
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn default_jobname() -> String {
    DEFAULT_JOBNAME.to_string()
}

fn default_builddir() -> String {
    DEFAULT_BUILDDIR.to_string()
}

fn default_index() -> String {
    DEFAULT_INDEX.to_string()
}

/// Accept both `index: 0` and `index: "0"`
fn deserialize_index<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IndexRepr {
        Number(u64),
        Text(String),
    }

    Ok(match IndexRepr::deserialize(deserializer)? {
        IndexRepr::Number(n) => n.to_string(),
        IndexRepr::Text(s) => s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse_and_display() {
        let id: NodeId = "floorplan/2".parse().unwrap();
        assert_eq!(id, NodeId::new("floorplan", "2"));
        assert_eq!(id.to_string(), "floorplan/2");

        assert!("floorplan".parse::<NodeId>().is_err());
        assert!("/2".parse::<NodeId>().is_err());
        assert!("a/b/c".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_serde_as_string() {
        let id = NodeId::new("syn", "0");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"syn/0\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_node_status_tokens() {
        let json = serde_json::to_string(&NodeStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let status: NodeStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(status, NodeStatus::Skipped);
        assert_eq!(NodeStatus::default(), NodeStatus::Pending);
    }

    #[test]
    fn test_node_config_index_forms() {
        let yaml = r#"
step: floorplan
index: 3
tool: openroad
task: floorplan
inputs: [syn/0]
"#;
        let node: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.index, "3");
        assert_eq!(node.inputs, vec![NodeId::new("syn", "0")]);

        let node: NodeConfig = serde_yaml::from_str("step: import\nindex: \"a\"\n").unwrap();
        assert_eq!(node.index, "a");

        let node: NodeConfig = serde_yaml::from_str("step: import\n").unwrap();
        assert_eq!(node.index, "0");
        assert!(node.tool.is_none());
    }
}
