//! YAML parser with validation for flow files

use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::error::{ChipFlowError, Result};
use crate::flowgraph::Flowgraph;
use crate::models::*;
use crate::store::ConfigStore;

/// Parse a flow file from disk.
///
/// The file is read and validated against the input limits:
/// - file size must be <= 1MB
/// - the total node count over all flows must be <= 1,000
/// - steps and indices must be alphanumeric + underscore/dash, at most 64
///   characters, and must not use a reserved name
/// - every declared input must name a node of the same flow
///
/// # Arguments
///
/// * `path` - Path to the YAML flow file
///
/// # Errors
///
/// * `ChipFlowError::Io` - If the file cannot be read
/// * `ChipFlowError::FlowSizeExceeded` - If the file exceeds 1MB
/// * `ChipFlowError::FlowParse` - If the YAML is malformed
/// * `ChipFlowError::NodeCountExceeded` - If the flows declare > 1,000 nodes
/// * `ChipFlowError::UnknownFlow` - If `flow` names no entry of `flows`
///
/// # Example
///
/// ```no_run
/// use chipflow::parser::parse_flow_file;
///
/// let config = parse_flow_file("heartbeat.yaml")?;
/// println!("Loaded design: {}", config.design);
/// # Ok::<(), chipflow::error::ChipFlowError>(())
/// ```
pub fn parse_flow_file<P: AsRef<Path>>(path: P) -> Result<FlowConfig> {
    let content = fs::read_to_string(path)?;
    parse_flow_yaml(&content)
}

/// Parse a flow file from a YAML string.
///
/// See [`parse_flow_file`] for the checks performed.
///
/// # Example
///
/// ```
/// use chipflow::parser::parse_flow_yaml;
///
/// let yaml = r#"
/// design: heartbeat
/// flow: asicflow
/// flows:
///   asicflow:
///     - { step: import, tool: builtin, task: nop }
///     - { step: syn, tool: builtin, task: nop, inputs: [import/0] }
/// "#;
///
/// let config = parse_flow_yaml(yaml)?;
/// assert_eq!(config.jobname, "job0");
/// assert_eq!(config.flows["asicflow"].len(), 2);
/// # Ok::<(), chipflow::error::ChipFlowError>(())
/// ```
pub fn parse_flow_yaml(content: &str) -> Result<FlowConfig> {
    if content.len() > MAX_FLOW_FILE_SIZE {
        return Err(ChipFlowError::FlowSizeExceeded(content.len()));
    }

    let config: FlowConfig = serde_yaml::from_str(content)?;

    let count: usize = config.flows.values().map(Vec::len).sum();
    if count > MAX_NODE_COUNT {
        return Err(ChipFlowError::NodeCountExceeded {
            count,
            limit: MAX_NODE_COUNT,
        });
    }

    if !config.flows.contains_key(&config.flow) {
        return Err(ChipFlowError::UnknownFlow(config.flow.clone()));
    }

    validate_plain_name(&config.design)?;
    validate_plain_name(&config.jobname)?;

    for (flow, nodes) in &config.flows {
        validate_plain_name(flow)?;
        validate_nodes(flow, nodes)?;
    }

    for node in &config.options.prune {
        validate_node_name(&node.step)?;
        validate_node_name(&node.index)?;
    }

    Ok(config)
}

/// Validate a step or index name
pub fn validate_node_name(name: &str) -> Result<()> {
    validate_plain_name(name)?;

    if RESERVED_NAMES.contains(&name) || name.starts_with(RESERVED_PREFIX) {
        return Err(ChipFlowError::ReservedName {
            name: name.to_string(),
        });
    }

    Ok(())
}

fn validate_plain_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ChipFlowError::InvalidName {
            name: name.to_string(),
        });
    }

    if name.len() > MAX_NAME_LEN {
        return Err(ChipFlowError::NameTooLong {
            name: name.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    // alphanumeric + underscore + dash only; rules out '/' in node names
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ChipFlowError::InvalidName {
            name: name.to_string(),
        });
    }

    Ok(())
}

fn validate_nodes(flow: &str, nodes: &[NodeConfig]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        validate_node_name(&node.step)?;
        validate_node_name(&node.index)?;
        if !seen.insert(node.id()) {
            return Err(ChipFlowError::DuplicateNode {
                flow: flow.to_string(),
                node: node.id().to_string(),
            });
        }
    }

    for node in nodes {
        for input in &node.inputs {
            if !seen.contains(input) {
                return Err(ChipFlowError::UnknownNode {
                    flow: flow.to_string(),
                    node: input.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Load a parsed flow file into a configuration store.
///
/// Every flow is built into a [`Flowgraph`] on the way, so binding and edge
/// errors surface here rather than when a run starts.
pub fn load_store(config: &FlowConfig) -> Result<ConfigStore> {
    let mut store = ConfigStore::new();

    store.set(&["option", "design"], config.design.as_str(), None);
    store.set(&["option", "jobname"], config.jobname.as_str(), None);
    store.set(&["option", "builddir"], config.builddir.as_str(), None);
    store.set(&["option", "flow"], config.flow.as_str(), None);

    let opts = &config.options;
    store.set(&["option", "from"], json!(opts.from), None);
    store.set(&["option", "to"], json!(opts.to), None);
    let prune: Vec<String> = opts.prune.iter().map(NodeId::to_string).collect();
    store.set(&["option", "prune"], json!(prune), None);
    store.set(&["option", "resume"], opts.resume, None);
    store.set(&["option", "clean"], opts.clean, None);
    store.set(&["option", "continue"], opts.continue_on_error, None);
    store.set(&["option", "quiet"], opts.quiet, None);
    if let Some(timeout) = opts.timeout {
        store.set(&["option", "timeout"], timeout, None);
    }
    for (name, value) in &opts.env {
        store.set(&["option", "env", name.as_str()], value.as_str(), None);
    }

    for (flow_name, nodes) in &config.flows {
        let flow = Flowgraph::from_config(flow_name, nodes)?;
        flow.write_to_store(&mut store);

        if *flow_name != config.flow {
            continue;
        }
        for node in nodes {
            let id = node.id();
            let scope = Some(&id);
            if let Some(timeout) = node.timeout {
                store.set(&["option", "timeout"], timeout, scope);
            }
            if let Some(cont) = node.continue_on_error {
                store.set(&["option", "continue"], cont, scope);
            }
            if let Some(remote) = &node.remote {
                store.set(&["option", "remote"], remote.as_str(), scope);
            }
            if let Some(job) = &node.jobinput {
                store.set(&["option", "jobinput"], job.as_str(), scope);
            }
            for (name, value) in &node.env {
                store.set(&["option", "env", name.as_str()], value.as_str(), scope);
            }
        }
    }

    for (tool, cfg) in &config.tools {
        let tool = tool.as_str();
        if let Some(exe) = &cfg.exe {
            store.set(&["tool", tool, "exe"], exe.as_str(), None);
        }
        if !cfg.vswitch.is_empty() {
            store.set(&["tool", tool, "vswitch"], json!(cfg.vswitch), None);
        }
        if let Some(pattern) = &cfg.version_pattern {
            store.set(&["tool", tool, "version_pattern"], pattern.as_str(), None);
        }
        for (name, value) in &cfg.env {
            store.set(&["tool", tool, "env", name.as_str()], value.as_str(), None);
        }
        for (task, tcfg) in &cfg.tasks {
            let task = task.as_str();
            store.set(&["tool", tool, "task", task, "args"], json!(tcfg.args), None);
            store.set(&["tool", tool, "task", task, "input"], json!(tcfg.inputs), None);
            store.set(&["tool", tool, "task", task, "output"], json!(tcfg.outputs), None);
            for (name, value) in &tcfg.env {
                store.set(&["tool", tool, "task", task, "env", name.as_str()], value.as_str(), None);
            }
            for (suffix, patterns) in &tcfg.regex {
                store.set(&["tool", tool, "task", task, "regex", suffix.as_str()], json!(patterns), None);
            }
        }
    }

    Ok(store)
}
