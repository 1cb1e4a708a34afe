//! Worker-side node runner
//!
//! A worker is started for exactly one node. It reads the input manifest the
//! controller prepared, drives the node's task, and always leaves an output
//! manifest with a terminal status behind before exiting with a matching
//! exit code.

use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ChipFlowError, Result};
use crate::flowgraph::Flowgraph;
use crate::layout::{copy_dir_contents, JobLayout, INPUTS_DIR, OUTPUTS_DIR, REPORTS_DIR};
use crate::manifest::{read_manifest, write_manifest};
use crate::models::{NodeId, NodeStatus};
use crate::process::{self, ProcessEnd};
use crate::record::{self, field, metric};
use crate::store::ConfigStore;
use crate::tasks::{RunPlan, SetupOutcome, Task, TaskContext, TaskRegistry};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_TIMEOUT: i32 = 124;

/// Process exit code reported for a terminal status
pub fn exit_code_for(status: NodeStatus) -> i32 {
    match status {
        NodeStatus::Success | NodeStatus::Skipped => EXIT_SUCCESS,
        NodeStatus::Timeout => EXIT_TIMEOUT,
        _ => EXIT_ERROR,
    }
}

/// Runs a single node inside a worker process
pub struct NodeRunner {
    node: NodeId,
    store: ConfigStore,
    graph: Flowgraph,
    layout: JobLayout,
    task: Arc<dyn Task>,
    kill_grace: Duration,
}

impl NodeRunner {
    /// Load the node described by an input manifest
    pub fn load(manifest: &Path, node: NodeId, registry: &TaskRegistry, kill_grace: Duration) -> Result<Self> {
        let store = read_manifest(manifest)?;
        Self::from_store(store, node, registry, kill_grace)
    }

    pub fn from_store(store: ConfigStore, node: NodeId, registry: &TaskRegistry, kill_grace: Duration) -> Result<Self> {
        let flow = store
            .get_str(&["option", "flow"], None)
            .ok_or_else(|| ChipFlowError::Validation("manifest does not name a flow".to_string()))?;
        let graph = Flowgraph::from_store(&store, &flow)?;
        let def = graph.get(&node).ok_or_else(|| ChipFlowError::UnknownNode {
            flow: flow.clone(),
            node: node.to_string(),
        })?;
        let task = registry.resolve(&def.tool, &def.task, &store)?;
        let layout = JobLayout::from_store(&store);

        Ok(Self {
            node,
            store,
            graph,
            layout,
            task,
            kill_grace,
        })
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn set_status(&mut self, status: NodeStatus) {
        let flow = self.graph.name().to_string();
        self.store
            .set(&["flowgraph", flow.as_str(), "status"], status.as_str(), Some(&self.node));
    }

    /// Run the node and write its output manifest. The returned status is the
    /// one recorded in the manifest.
    #[instrument(skip_all, fields(node = %self.node))]
    pub async fn run<F>(mut self, shutdown: F) -> Result<NodeStatus>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        record::clear_node(&mut self.store, &self.node);
        record::record_environment(&mut self.store, &self.node, &run_id);
        record::record_time(&mut self.store, &self.node, field::START_TIME, Utc::now());
        self.set_status(NodeStatus::Running);

        let status = match self.execute(shutdown).await {
            Ok(status) => status,
            Err(e) => {
                error!("Node failed: {}", e);
                record::set_record(&mut self.store, &self.node, field::STATUS_REASON, e.to_string());
                NodeStatus::Error
            }
        };

        record::record_time(&mut self.store, &self.node, field::END_TIME, Utc::now());
        record::set_metric(
            &mut self.store,
            &self.node,
            metric::TOTAL_TIME,
            started.elapsed().as_secs_f64(),
        );
        self.set_status(status);

        write_manifest(&self.store, &self.layout.output_manifest(&self.node))?;
        info!(status = %status, "Node finished");
        Ok(status)
    }

    async fn execute<F>(&mut self, shutdown: F) -> Result<NodeStatus>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let workdir = self.layout.workdir(&self.node);
        for dir in [INPUTS_DIR, OUTPUTS_DIR, REPORTS_DIR] {
            std::fs::create_dir_all(workdir.join(dir))?;
        }

        let task = Arc::clone(&self.task);
        let tool = task.tool().to_string();
        let task_name = task.task().to_string();
        let continue_on_error = self.store.get_bool(&["option", "continue"], Some(&self.node));
        let is_entry = self.graph.node_inputs(&self.node).is_empty();
        let input_job = self.store.get_str(&["option", "jobinput"], Some(&self.node));

        let mut ctx = TaskContext::new(self.node.clone(), &self.graph, &mut self.store, &self.layout);

        if let SetupOutcome::Skip(reason) = task.setup(&mut ctx)? {
            return skip(&mut ctx, &reason, input_job.as_deref());
        }

        let selected = task.select_input_nodes(&ctx)?;
        if selected.is_empty() && !is_entry {
            return Err(ChipFlowError::Validation(format!("No inputs selected for {}", ctx.node)));
        }
        let flow = ctx.flow().to_string();
        record::record_select(ctx.store, &flow, &ctx.node, &selected);
        if let Some(first) = selected.first() {
            record::set_record(ctx.store, &ctx.node, field::INPUT_NODE, first.to_string());
        }
        ctx.selected = selected;

        setup_input_directory(&ctx, input_job.as_deref())?;
        write_manifest(ctx.store, &ctx.layout.input_manifest(&ctx.node))?;

        let inputs_dir = ctx.layout.inputs_dir(&ctx.node);
        for required in task.required_inputs(&ctx) {
            if !inputs_dir.join(&required).exists() {
                return Err(ChipFlowError::MissingInput {
                    node: ctx.node.to_string(),
                    path: format!("{}/{}", INPUTS_DIR, required),
                });
            }
        }

        if let SetupOutcome::Skip(reason) = task.pre_process(&mut ctx)? {
            ctx.forward_inputs()?;
            record::set_record(ctx.store, &ctx.node, field::STATUS_REASON, reason.clone());
            info!("Skipped: {}", reason);
            return Ok(NodeStatus::Skipped);
        }

        if !task.is_builtin() {
            record_tool_version(&mut ctx, task.as_ref(), &tool).await;
        }

        let mut status = NodeStatus::Success;
        match task.run(&mut ctx)? {
            RunPlan::Exec(cmd) => {
                process::write_replay_script(&ctx.layout.replay_script(&ctx.node), &cmd)?;
                record::set_record(ctx.store, &ctx.node, field::TOOL_ARGS, serde_json::json!(cmd.args));

                let log = ctx.layout.tool_log(&ctx.node);
                let outcome = process::run_tool(&cmd, &log, self.kill_grace, shutdown).await?;
                let node = ctx.node.clone();
                record::set_metric(ctx.store, &node, metric::EXE_TIME, outcome.wall.as_secs_f64());
                record::set_metric(ctx.store, &node, metric::CPU_TIME, outcome.cpu.as_secs_f64());
                record::set_metric(ctx.store, &node, metric::MEMORY, outcome.max_rss);

                match outcome.end {
                    ProcessEnd::TimedOut => {
                        record::set_record(ctx.store, &node, field::STATUS_REASON, "timeout");
                        return Ok(NodeStatus::Timeout);
                    }
                    ProcessEnd::Interrupted => return Err(ChipFlowError::Interrupted),
                    ProcessEnd::Exited(code) => {
                        if let Some(code) = code {
                            record::set_record(ctx.store, &node, field::EXIT_CODE, code);
                        }
                        if code != Some(0) {
                            error!(exit_code = ?code, "{} exited with failure", cmd.program);
                            record::set_record(
                                ctx.store,
                                &node,
                                field::STATUS_REASON,
                                format!("{} exited with {:?}", tool, code),
                            );
                            status = NodeStatus::Error;
                        }
                    }
                }
            }
            RunPlan::Done(code) => {
                record::set_record(ctx.store, &ctx.node, field::EXIT_CODE, code);
                if code != 0 {
                    status = NodeStatus::Error;
                }
            }
        }

        if status == NodeStatus::Success {
            task.post_process(&mut ctx)?;
        }

        let counts = check_logfile(&mut ctx, &tool, &task_name)?;
        let errors = counts.get(metric::ERRORS).copied().unwrap_or(0);
        if errors > 0 && status == NodeStatus::Success {
            if continue_on_error {
                warn!(errors, "Log reported errors, continuing");
            } else {
                error!(errors, "Log reported errors");
                record::set_record(
                    ctx.store,
                    &ctx.node,
                    field::STATUS_REASON,
                    format!("log reported {} errors", errors),
                );
                status = NodeStatus::Error;
            }
        }

        record::set_metric(ctx.store, &ctx.node.clone(), metric::TASK_TIME, started.elapsed().as_secs_f64());
        Ok(status)
    }
}

fn skip(ctx: &mut TaskContext<'_>, reason: &str, input_job: Option<&str>) -> Result<NodeStatus> {
    ctx.selected = ctx.usable_inputs();
    let flow = ctx.flow().to_string();
    let selected = ctx.selected.clone();
    record::record_select(ctx.store, &flow, &ctx.node, &selected);
    setup_input_directory(ctx, input_job)?;
    ctx.forward_inputs()?;
    record::set_record(ctx.store, &ctx.node, field::STATUS_REASON, reason.to_string());
    info!("Skipped: {}", reason);
    Ok(NodeStatus::Skipped)
}

/// Copy the selected inputs' `outputs/` into this node's `inputs/`.
///
/// Inputs of a node fed by another job are read from that job's directory.
fn setup_input_directory(ctx: &TaskContext<'_>, input_job: Option<&str>) -> Result<()> {
    let source = match input_job {
        Some(job) => ctx.layout.for_job(job),
        None => ctx.layout.clone(),
    };
    let target = ctx.layout.inputs_dir(&ctx.node);
    let manifest = ctx.layout.input_manifest(&ctx.node);
    let manifest_name = manifest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    for input in &ctx.selected {
        if input_job.is_none() && ctx.status_of(input).is_error() {
            continue;
        }
        let outputs = source.outputs_dir(input);
        if !outputs.is_dir() {
            return Err(ChipFlowError::MissingInput {
                node: ctx.node.to_string(),
                path: outputs.display().to_string(),
            });
        }
        debug!(input = %input, "Importing outputs");
        copy_dir_contents(&outputs, &target, &[manifest_name])?;
    }
    Ok(())
}

async fn record_tool_version(ctx: &mut TaskContext<'_>, task: &dyn Task, tool: &str) {
    let Some(exe) = ctx.store.get_str(&["tool", tool, "exe"], Some(&ctx.node)) else {
        return;
    };
    record::set_record(ctx.store, &ctx.node.clone(), field::TOOL_PATH, exe.as_str());

    let vswitch = ctx.store.get_str_list(&["tool", tool, "vswitch"], Some(&ctx.node));
    if vswitch.is_empty() {
        return;
    }
    match process::query_version(&exe, &vswitch).await {
        Ok(output) => match task.parse_version(ctx, &output) {
            Some(version) => {
                info!(version = %version, "Tool version");
                record::set_record(ctx.store, &ctx.node.clone(), field::TOOL_VERSION, version);
            }
            None => warn!("Could not parse version of {}", exe),
        },
        Err(e) => warn!("Version query of {} failed: {}", exe, e),
    }
}

/// One compiled log filter; `-v <pattern>` keeps the lines that do not match
struct LineFilter {
    regex: Regex,
    invert: bool,
}

impl LineFilter {
    fn parse(pattern: &str) -> Result<Self> {
        match pattern.strip_prefix("-v ") {
            Some(rest) => Ok(Self {
                regex: Regex::new(rest)?,
                invert: true,
            }),
            None => Ok(Self {
                regex: Regex::new(pattern)?,
                invert: false,
            }),
        }
    }

    fn keeps(&self, line: &str) -> bool {
        self.regex.is_match(line) != self.invert
    }
}

/// Scan the tool log with each `regex,<suffix>` filter chain, write the
/// matching lines to `<step>.<suffix>` and fold `errors`/`warnings` counts
/// into metrics.
fn check_logfile(ctx: &mut TaskContext<'_>, tool: &str, task: &str) -> Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    let log = ctx.layout.tool_log(&ctx.node);
    if !log.exists() {
        return Ok(counts);
    }
    let text = String::from_utf8_lossy(&std::fs::read(&log)?).to_string();
    let node = ctx.node.clone();

    for key in ctx.store.keys(&["tool", tool, "task", task, "regex"]) {
        let Some(suffix) = key.get(5).cloned() else {
            continue;
        };
        let key: Vec<&str> = key.iter().map(String::as_str).collect();
        let filters = ctx
            .store
            .get_str_list(&key, Some(&node))
            .iter()
            .map(|p| LineFilter::parse(p))
            .collect::<Result<Vec<_>>>()?;

        let matches: Vec<&str> = text
            .lines()
            .filter(|line| filters.iter().all(|f| f.keeps(line)))
            .collect();
        let mut report = matches.join("\n");
        if !report.is_empty() {
            report.push('\n');
        }
        std::fs::write(ctx.layout.report(&node, &suffix), report)?;

        let count = matches.len() as u64;
        if suffix == metric::ERRORS || suffix == metric::WARNINGS {
            record::add_metric(ctx.store, &node, &suffix, count);
        }
        counts.insert(suffix, count);
    }
    Ok(counts)
}
