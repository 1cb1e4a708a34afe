//! Error types for ChipFlow

use thiserror::Error;

/// ChipFlow error types
#[derive(Error, Debug)]
pub enum ChipFlowError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    FlowParse(#[from] serde_yaml::Error),

    /// Flow file size exceeded limit
    #[error("Flow file exceeds 1MB limit (size: {0} bytes)")]
    FlowSizeExceeded(usize),

    /// Node count exceeded limit
    #[error("Node count {count} exceeds limit of {limit}")]
    NodeCountExceeded { count: usize, limit: usize },

    /// Step or index name too long
    #[error("Name '{name}' exceeds {max} characters")]
    NameTooLong { name: String, max: usize },

    /// Invalid step or index name
    #[error("Invalid name '{name}': only alphanumeric, underscore, and dash allowed")]
    InvalidName { name: String },

    /// Reserved step or index name
    #[error("'{name}' is a reserved name")]
    ReservedName { name: String },

    /// Node declared twice in the same flow
    #[error("Node {node} is declared more than once in flow '{flow}'")]
    DuplicateNode { flow: String, node: String },

    /// Duplicate edge between the same pair of nodes
    #[error("Duplicate edge from {tail} to {head}")]
    DuplicateEdge { tail: String, head: String },

    /// Reference to a node that is not in the flowgraph
    #[error("Node {node} is not defined in flowgraph '{flow}'")]
    UnknownNode { flow: String, node: String },

    /// Reference to a step that is not in the flowgraph
    #[error("Step '{step}' is not defined in flowgraph '{flow}'")]
    UnknownStep { flow: String, step: String },

    /// Node without a tool or task binding
    #[error("Node {node} is missing a {field} binding")]
    MissingBinding { node: String, field: &'static str },

    /// Cycle in the flowgraph
    #[error("Cycle detected in flowgraph: {0}")]
    CycleDetected(String),

    /// Flow name not present in the configuration
    #[error("Flowgraph '{0}' is not defined")]
    UnknownFlow(String),

    /// No task implementation for a tool/task binding
    #[error("No task implementation for tool '{tool}' task '{task}'")]
    UnknownTask { tool: String, task: String },

    /// Declared exit step has no structural path from the start nodes
    #[error("Step '{step}' cannot be reached from any of the start nodes")]
    UnreachableExit { step: String },

    /// Queue non-empty with nothing running
    #[error("Deadlock: {waiting} node(s) are waiting but nothing is running")]
    Deadlock { waiting: usize },

    /// Exit steps reachable only through failed nodes
    #[error("Could not run final steps ({steps}) due to errors in: {errors}")]
    ExitBlocked { steps: String, errors: String },

    /// Exit steps reached by no successful path and no failures to blame
    #[error("Could not run final steps: {steps}")]
    ExitUnreached { steps: String },

    /// Status change not allowed by the node state machine
    #[error("Node {node} cannot move from {from} to {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    /// Unrecognized status token
    #[error("Invalid node status '{0}'")]
    InvalidStatus(String),

    /// Invalid node identifier
    #[error("Invalid node id '{0}': expected <step>/<index>")]
    InvalidNodeId(String),

    /// Required input missing in a node's working directory
    #[error("Node {node} is missing required input: {path}")]
    MissingInput { node: String, path: String },

    /// Manifest could not be read or written
    #[error("Manifest error in {path}: {message}")]
    Manifest { path: String, message: String },

    /// Unknown manifest encoding
    #[error("Unsupported manifest format '{0}'")]
    UnsupportedFormat(String),

    /// Configuration store value has the wrong shape
    #[error("Value at [{key}] has unexpected type: {message}")]
    ValueType { key: String, message: String },

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid log-scan pattern
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// SSH errors
    #[error("SSH error on {host}: {message}")]
    Ssh { host: String, message: String },

    /// Dispatcher failed to produce a worker result
    #[error("Dispatch of {node} failed: {message}")]
    Dispatch { node: String, message: String },

    /// Run stopped by an interrupt
    #[error("Run interrupted")]
    Interrupted,

    /// Generic validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl ChipFlowError {
    /// Errors that describe an invalid flowgraph and must abort before any
    /// process is spawned.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ChipFlowError::DuplicateNode { .. }
                | ChipFlowError::DuplicateEdge { .. }
                | ChipFlowError::UnknownNode { .. }
                | ChipFlowError::UnknownStep { .. }
                | ChipFlowError::MissingBinding { .. }
                | ChipFlowError::CycleDetected(_)
                | ChipFlowError::UnknownFlow(_)
                | ChipFlowError::UnknownTask { .. }
                | ChipFlowError::UnreachableExit { .. }
                | ChipFlowError::InvalidName { .. }
                | ChipFlowError::ReservedName { .. }
                | ChipFlowError::NameTooLong { .. }
        )
    }
}

/// Result type alias using ChipFlowError
pub type Result<T> = std::result::Result<T, ChipFlowError>;
