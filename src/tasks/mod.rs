//! Task capability interface
//!
//! A node's (tool, task) binding resolves to a [`Task`] implementation when
//! the flowgraph is built. The worker drives the task through
//! `setup -> select_input_nodes -> pre_process -> run -> post_process`.

pub mod builtin;
pub mod exec;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ChipFlowError, Result};
use crate::flowgraph::{Flowgraph, NodeDef};
use crate::layout::{copy_dir_contents, JobLayout};
use crate::models::{NodeId, NodeStatus, BUILTIN_TOOL};
use crate::store::ConfigStore;

pub use builtin::{BuiltinKind, BuiltinTask};
pub use exec::ExecTask;

/// Result of `setup` and `pre_process`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    Ready,
    /// The node has nothing to do and finishes as `skipped`
    Skip(String),
}

/// External command prepared by a task
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
    pub timeout: Option<Duration>,
}

/// What `run` asks the worker to do
#[derive(Debug, Clone, PartialEq)]
pub enum RunPlan {
    /// Execute an external tool and use its exit code
    Exec(ToolCommand),
    /// The task finished in-process with this exit code
    Done(i32),
}

/// Everything a task may read or record while a node runs
pub struct TaskContext<'a> {
    pub node: NodeId,
    pub graph: &'a Flowgraph,
    pub store: &'a mut ConfigStore,
    pub layout: &'a JobLayout,
    /// Upstream nodes chosen by `select_input_nodes`
    pub selected: Vec<NodeId>,
}

impl<'a> TaskContext<'a> {
    pub fn new(node: NodeId, graph: &'a Flowgraph, store: &'a mut ConfigStore, layout: &'a JobLayout) -> Self {
        Self {
            node,
            graph,
            store,
            layout,
            selected: Vec::new(),
        }
    }

    pub fn flow(&self) -> &str {
        self.graph.name()
    }

    pub fn def(&self) -> Result<&'a NodeDef> {
        self.graph.get(&self.node).ok_or_else(|| ChipFlowError::UnknownNode {
            flow: self.graph.name().to_string(),
            node: self.node.to_string(),
        })
    }

    pub fn workdir(&self) -> PathBuf {
        self.layout.workdir(&self.node)
    }

    /// Status of another node as recorded in the store
    pub fn status_of(&self, node: &NodeId) -> NodeStatus {
        self.store
            .get_str(&["flowgraph", self.flow(), "status"], Some(node))
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    /// Nodes removed from the run with `option,prune`
    pub fn pruned(&self) -> BTreeSet<NodeId> {
        self.store
            .get_str_list(&["option", "prune"], None)
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Inputs left after pruning whose outputs can be consumed
    pub fn usable_inputs(&self) -> Vec<NodeId> {
        self.graph
            .pruned_inputs(&self.node, &self.pruned())
            .into_iter()
            .filter(|input| self.status_of(input).is_usable())
            .collect()
    }

    pub fn metric(&self, node: &NodeId, name: &str) -> Option<f64> {
        self.store.get_f64(&["metric", name], Some(node))
    }

    /// Node-scoped timeout, falling back to the run default
    pub fn timeout(&self) -> Option<Duration> {
        self.store
            .get_u64(&["option", "timeout"], Some(&self.node))
            .map(Duration::from_secs)
    }

    pub fn option_env(&self) -> BTreeMap<String, String> {
        option_env(&*self.store, &self.node)
    }

    /// Copy this node's `inputs/` into `outputs/`, leaving the manifest behind
    pub fn forward_inputs(&self) -> Result<()> {
        let manifest = self.layout.input_manifest(&self.node);
        let manifest_name = manifest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        copy_dir_contents(
            &self.layout.inputs_dir(&self.node),
            &self.layout.outputs_dir(&self.node),
            &[manifest_name.as_str()],
        )
    }
}

/// `option,env,*` values seen by a node, node scope first
pub fn option_env(store: &ConfigStore, node: &NodeId) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in store.keys(&["option", "env"]) {
        let key: Vec<&str> = key.iter().map(String::as_str).collect();
        if let (Some(name), Some(value)) = (key.get(2), store.get_str(&key, Some(node))) {
            env.insert(name.to_string(), value);
        }
    }
    env
}

/// Behavior bound to a (tool, task) pair
pub trait Task: Send + Sync {
    fn tool(&self) -> &str;

    fn task(&self) -> &str;

    /// Builtin combinators get the relaxed dependency rule
    fn is_builtin(&self) -> bool {
        false
    }

    /// Extract a version string from the output of the tool's version switch
    fn parse_version(&self, _ctx: &TaskContext<'_>, output: &str) -> Option<String> {
        output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }

    fn setup(&self, _ctx: &mut TaskContext<'_>) -> Result<SetupOutcome> {
        Ok(SetupOutcome::Ready)
    }

    /// Upstream nodes whose outputs this node consumes
    fn select_input_nodes(&self, ctx: &TaskContext<'_>) -> Result<Vec<NodeId>> {
        Ok(ctx.usable_inputs())
    }

    /// Files that must be present in `inputs/` before `run`
    fn required_inputs(&self, _ctx: &TaskContext<'_>) -> Vec<String> {
        Vec::new()
    }

    fn pre_process(&self, _ctx: &mut TaskContext<'_>) -> Result<SetupOutcome> {
        Ok(SetupOutcome::Ready)
    }

    /// Command-line arguments for the tool
    fn runtime_options(&self, ctx: &TaskContext<'_>) -> Result<Vec<String>> {
        Ok(ctx.def()?.args.clone())
    }

    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<RunPlan>;

    fn post_process(&self, _ctx: &mut TaskContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Task implementations keyed by (tool, task)
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<(String, String), Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every builtin combinator
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in BuiltinKind::ALL {
            registry.register(Arc::new(BuiltinTask::new(kind)));
        }
        registry
    }

    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks
            .insert((task.tool().to_string(), task.task().to_string()), task);
    }

    pub fn lookup(&self, tool: &str, task: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(&(tool.to_string(), task.to_string())).cloned()
    }

    /// Resolve a binding. Registered tasks win; any other tool with an
    /// executable configured runs as an [`ExecTask`].
    pub fn resolve(&self, tool: &str, task: &str, store: &ConfigStore) -> Result<Arc<dyn Task>> {
        if let Some(found) = self.lookup(tool, task) {
            return Ok(found);
        }
        if tool != BUILTIN_TOOL && store.get_str(&["tool", tool, "exe"], None).is_some() {
            return Ok(Arc::new(ExecTask::new(tool, task)));
        }
        Err(ChipFlowError::UnknownTask {
            tool: tool.to_string(),
            task: task.to_string(),
        })
    }

    /// Resolve every node of a flowgraph
    pub fn resolve_flow(&self, graph: &Flowgraph, store: &ConfigStore) -> Result<BTreeMap<NodeId, Arc<dyn Task>>> {
        graph
            .nodes()
            .map(|def| Ok((def.id.clone(), self.resolve(&def.tool, &def.task, store)?)))
            .collect()
    }
}
