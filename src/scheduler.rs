//! Controller-side flowgraph scheduler
//!
//! The scheduler computes the execution set, seeds resumed nodes, and then
//! runs a polling loop that launches every node whose dependencies have
//! settled. Workers run out of process; the only state that flows back is
//! their exit code and output manifest, which the scheduler merges into its
//! own store between ticks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::{wait_for_shutdown, DispatcherSet, NodeLaunch, WorkerExit};
use crate::error::{ChipFlowError, Result};
use crate::flowgraph::Flowgraph;
use crate::history::HistoryStore;
use crate::layout::JobLayout;
use crate::manifest::{read_manifest, write_manifest, ManifestFormat};
use crate::metrics::SchedulerMetrics;
use crate::models::{NodeId, NodeStatus, DEFAULT_BUILDDIR};
use crate::record::{self, field};
use crate::settings::Settings;
use crate::status::{readiness, Readiness, StatusBoard};
use crate::store::ConfigStore;
use crate::tasks::{self, Task, TaskRegistry};

type Completion = (NodeId, Result<WorkerExit>);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub manifest_format: ManifestFormat,
    /// Append finished runs to this history database
    pub history_db: Option<PathBuf>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SchedulerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            kill_grace: settings.kill_grace(),
            manifest_format: settings.manifest_format,
            history_db: Some(settings.history_db.clone()),
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job: String,
    pub flow: String,
    pub statuses: BTreeMap<NodeId, NodeStatus>,
    /// Nodes handed to a dispatcher, in launch order
    pub launched: Vec<NodeId>,
    /// Consolidated JSON manifest of the job
    pub manifest: PathBuf,
}

/// `from`/`to`/`prune`/`resume`/`clean` as read from the store
#[derive(Debug, Clone, Default)]
struct Selection {
    from: Vec<String>,
    to: Vec<String>,
    prune: BTreeSet<NodeId>,
    resume: bool,
    clean: bool,
}

pub struct Scheduler {
    store: ConfigStore,
    graph: Flowgraph,
    layout: JobLayout,
    registry: TaskRegistry,
    dispatchers: DispatcherSet,
    options: SchedulerOptions,
    metrics: SchedulerMetrics,
    history: Option<HistoryStore>,
    board: StatusBoard,
    running: HashMap<NodeId, Instant>,
    launched: Vec<NodeId>,
    cancelled: bool,
}

impl Scheduler {
    /// Build a scheduler for the flow named by `option,flow`.
    ///
    /// A relative build directory is made absolute so workers, which run in
    /// their own working directories, resolve the same paths.
    pub fn new(
        mut store: ConfigStore,
        registry: TaskRegistry,
        dispatchers: DispatcherSet,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let flow = store
            .get_str(&["option", "flow"], None)
            .ok_or_else(|| ChipFlowError::Validation("no flow selected".to_string()))?;

        let builddir = PathBuf::from(
            store
                .get_str(&["option", "builddir"], None)
                .unwrap_or_else(|| DEFAULT_BUILDDIR.to_string()),
        );
        if builddir.is_relative() {
            let absolute = std::env::current_dir()?.join(builddir);
            store.set(&["option", "builddir"], absolute.display().to_string(), None);
        }

        let graph = Flowgraph::from_store(&store, &flow)?;
        let layout = JobLayout::from_store(&store);
        let history = options.history_db.as_ref().map(HistoryStore::open).transpose()?;

        Ok(Self {
            store,
            graph,
            layout,
            registry,
            dispatchers,
            options,
            metrics: SchedulerMetrics::new()?,
            history,
            board: StatusBoard::new(flow.as_str()),
            running: HashMap::new(),
            launched: Vec::new(),
            cancelled: false,
        })
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn graph(&self) -> &Flowgraph {
        &self.graph
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Last known status of every node, also available after a failed run
    pub fn statuses(&self) -> BTreeMap<NodeId, NodeStatus> {
        self.board.snapshot()
    }

    pub fn launched(&self) -> &[NodeId] {
        &self.launched
    }

    fn selection(&self) -> Result<Selection> {
        let prune = self
            .store
            .get_str_list(&["option", "prune"], None)
            .iter()
            .map(|s| s.parse::<NodeId>())
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Selection {
            from: self.store.get_str_list(&["option", "from"], None),
            to: self.store.get_str_list(&["option", "to"], None),
            prune,
            resume: self.store.get_bool(&["option", "resume"], None),
            clean: self.store.get_bool(&["option", "clean"], None),
        })
    }

    /// Run the flow to completion.
    ///
    /// Structural problems are reported before any worker starts. Once
    /// scheduling has begun, the consolidated manifest is written whatever
    /// the outcome.
    #[instrument(skip_all, fields(flow = %self.graph.name(), job = %self.layout.job()))]
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        let selection = self.selection()?;
        self.graph.validate()?;
        self.graph
            .validate_runtime(&selection.from, &selection.to, &selection.prune)?;
        let tasks = self.registry.resolve_flow(&self.graph, &self.store)?;
        let exec = self.graph.execution_set(
            &self.graph.start_nodes(&selection.from),
            &self.graph.target_nodes(&selection.to),
            &selection.prune,
        )?;
        info!(nodes = exec.len(), "Execution set computed");

        let jobdir = self.layout.jobdir();
        if selection.clean && selection.from.is_empty() && jobdir.exists() {
            info!("Cleaning {}", jobdir.display());
            std::fs::remove_dir_all(&jobdir)?;
        }
        std::fs::create_dir_all(&jobdir)?;

        self.board = StatusBoard::new(self.graph.name());
        self.running.clear();
        self.launched.clear();
        self.cancelled = false;

        self.load_outside(&exec, &selection.prune);
        let mut queue = self.prepare(&exec, &selection)?;
        let outcome = self.drive(&mut queue, &tasks, shutdown).await;
        self.finish(outcome, &selection, &exec)
    }

    fn status_in(&self, manifest: &ConfigStore, node: &NodeId) -> Option<NodeStatus> {
        manifest
            .get_str(&["flowgraph", self.graph.name(), "status"], Some(node))
            .and_then(|s| s.parse().ok())
    }

    fn set_status(&mut self, node: &NodeId, status: NodeStatus) {
        self.store
            .set(&["flowgraph", self.graph.name(), "status"], status.as_str(), Some(node));
    }

    fn read_output(&self, node: &NodeId) -> Option<ConfigStore> {
        let path = self.layout.output_manifest(node);
        if !path.exists() {
            return None;
        }
        match read_manifest(&path) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(node = %node, "Ignoring unreadable output manifest: {}", e);
                None
            }
        }
    }

    /// Job feeding this node when it is not the current job
    fn input_job(&self, node: &NodeId) -> Option<String> {
        self.store
            .get_str(&["option", "jobinput"], Some(node))
            .filter(|job| job != self.layout.job())
    }

    /// Dependencies the scheduler waits for
    fn dependencies(&self, node: &NodeId, prune: &BTreeSet<NodeId>) -> Vec<NodeId> {
        if self.input_job(node).is_some() {
            return Vec::new();
        }
        self.graph.pruned_inputs(node, prune)
    }

    /// Take the last known state of nodes outside the execution set from
    /// disk; pruned nodes are `skipped`.
    fn load_outside(&mut self, exec: &BTreeSet<NodeId>, prune: &BTreeSet<NodeId>) {
        let outside: Vec<NodeId> = self
            .graph
            .nodes()
            .map(|def| def.id.clone())
            .filter(|id| !exec.contains(id))
            .collect();

        for node in outside {
            let status = if prune.contains(&node) {
                NodeStatus::Skipped
            } else {
                match self.read_output(&node) {
                    Some(manifest) => {
                        self.store.merge_node(&manifest, &node);
                        self.status_in(&manifest, &node).unwrap_or_default()
                    }
                    None => NodeStatus::Pending,
                }
            };
            debug!(node = %node, status = %status, "Outside execution set");
            self.set_status(&node, status);
            self.board.seed(node, status);
        }
    }

    /// Output manifest of a node that can be reused instead of running it
    /// again
    fn resumable(
        &self,
        node: &NodeId,
        deps: &[NodeId],
        exec: &BTreeSet<NodeId>,
        seeded: &BTreeSet<NodeId>,
    ) -> Option<ConfigStore> {
        if !self.layout.workdir(node).is_dir() {
            return None;
        }
        let manifest = self.read_output(node)?;
        if self.status_in(&manifest, node) != Some(NodeStatus::Success) {
            return None;
        }
        let flow = self.graph.name();
        for binding in ["tool", "task", "input"] {
            let key = ["flowgraph", flow, binding];
            if manifest.get_exact(&key, Some(node)) != self.store.get_exact(&key, Some(node)) {
                debug!(node = %node, binding, "Binding changed since last run");
                return None;
            }
        }
        let inputs_settled = deps.iter().all(|dep| {
            if exec.contains(dep) {
                seeded.contains(dep)
            } else {
                self.board.get(dep).is_some_and(|s| s.is_usable())
            }
        });
        inputs_settled.then_some(manifest)
    }

    /// Seed resumed nodes and queue the rest with their dependencies
    fn prepare(
        &mut self,
        exec: &BTreeSet<NodeId>,
        selection: &Selection,
    ) -> Result<BTreeMap<NodeId, Vec<NodeId>>> {
        let mut seeded = BTreeSet::new();
        let mut queue = BTreeMap::new();

        for node in self.graph.topological_order()? {
            if !exec.contains(&node) {
                continue;
            }
            let deps = self.dependencies(&node, &selection.prune);

            if selection.resume {
                if let Some(manifest) = self.resumable(&node, &deps, exec, &seeded) {
                    info!(node = %node, "Reusing previous result");
                    self.store.merge_node(&manifest, &node);
                    self.set_status(&node, NodeStatus::Success);
                    self.board.seed(node.clone(), NodeStatus::Success);
                    seeded.insert(node);
                    continue;
                }
            }

            self.layout.remove_workdir(&node)?;
            record::clear_node(&mut self.store, &node);
            let flow = self.graph.name().to_string();
            self.store
                .unset(&["flowgraph", flow.as_str(), "select"], Some(&node));
            self.set_status(&node, NodeStatus::Pending);
            self.board.seed(node.clone(), NodeStatus::Pending);
            self.board.transition(&node, NodeStatus::Queued)?;
            queue.insert(node, deps);
        }

        info!(queued = queue.len(), resumed = seeded.len(), "Nodes prepared");
        Ok(queue)
    }

    async fn drive(
        &mut self,
        queue: &mut BTreeMap<NodeId, Vec<NodeId>>,
        tasks: &BTreeMap<NodeId, Arc<dyn Task>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

        loop {
            while let Ok((node, exit)) = done_rx.try_recv() {
                self.complete(node, exit);
            }

            if !self.cancelled && *shutdown.borrow() {
                self.cancel(queue);
            }
            if !self.cancelled {
                self.advance(queue, tasks, &done_tx, &shutdown);
            }

            if self.running.is_empty() {
                if self.cancelled || queue.is_empty() {
                    return Ok(());
                }
                let waiting: Vec<String> = queue.keys().map(NodeId::to_string).collect();
                error!("Nodes left in queue but nothing is running: {}", waiting.join(", "));
                return Err(ChipFlowError::Deadlock { waiting: queue.len() });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = wait_for_shutdown(shutdown.clone()), if !self.cancelled => {}
            }
        }
    }

    /// Launch or fail every queued node whose dependencies have settled,
    /// repeating until a pass changes nothing
    fn advance(
        &mut self,
        queue: &mut BTreeMap<NodeId, Vec<NodeId>>,
        tasks: &BTreeMap<NodeId, Arc<dyn Task>>,
        done_tx: &mpsc::UnboundedSender<Completion>,
        shutdown: &watch::Receiver<bool>,
    ) {
        loop {
            let settled: Vec<(NodeId, Readiness)> = queue
                .iter()
                .map(|(node, deps)| {
                    let statuses: Vec<NodeStatus> = deps
                        .iter()
                        .map(|dep| self.board.get(dep).unwrap_or_default())
                        .collect();
                    let builtin = tasks.get(node).is_some_and(|t| t.is_builtin());
                    (node.clone(), readiness(&statuses, builtin))
                })
                .filter(|(_, r)| *r != Readiness::Waiting)
                .collect();
            if settled.is_empty() {
                return;
            }

            for (node, decision) in settled {
                let deps = queue.remove(&node).unwrap_or_default();
                match decision {
                    Readiness::Launch => self.launch(&node, done_tx, shutdown),
                    Readiness::Fail => self.fail_unlaunched(&node, &deps),
                    Readiness::Waiting => {}
                }
            }
        }
    }

    fn mark_error(&mut self, node: &NodeId, reason: String) {
        if let Err(e) = self.board.transition(node, NodeStatus::Error) {
            warn!(node = %node, "{}", e);
            self.board.seed(node.clone(), NodeStatus::Error);
        }
        self.set_status(node, NodeStatus::Error);
        record::set_record(&mut self.store, node, field::STATUS_REASON, reason);
        self.metrics
            .node_resolved(self.graph.name(), &node.step, NodeStatus::Error.as_str());
    }

    fn fail_unlaunched(&mut self, node: &NodeId, deps: &[NodeId]) {
        let failed: Vec<String> = deps
            .iter()
            .filter(|dep| self.board.get(dep).is_some_and(|s| !s.is_usable()))
            .map(NodeId::to_string)
            .collect();
        warn!(node = %node, inputs = %failed.join(", "), "Inputs failed, not launching");
        self.mark_error(node, format!("inputs failed: {}", failed.join(", ")));
    }

    fn launch(
        &mut self,
        node: &NodeId,
        done_tx: &mpsc::UnboundedSender<Completion>,
        shutdown: &watch::Receiver<bool>,
    ) {
        if let Err(e) = self.try_launch(node, done_tx, shutdown) {
            error!(node = %node, "Failed to launch: {}", e);
            self.mark_error(node, e.to_string());
        }
    }

    /// Write the node's input manifest and hand it to a dispatcher
    fn try_launch(
        &mut self,
        node: &NodeId,
        done_tx: &mpsc::UnboundedSender<Completion>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let workdir = self.layout.prepare_workdir(node)?;
        let upstream = self.graph.node_inputs(node).to_vec();
        let input_job = self.input_job(node);

        // upstream results were merged as they finished; only the board
        // decides what status the node sees
        if input_job.is_none() {
            for input in &upstream {
                if let Some(status) = self.board.get(input) {
                    self.set_status(input, status);
                }
            }
        }
        record::clear_node(&mut self.store, node);

        let mut input_manifest = self.store.clone();
        if let Some(job) = &input_job {
            self.merge_other_job(&mut input_manifest, job, &upstream)?;
        }
        write_manifest(&input_manifest, &self.layout.input_manifest(node))?;

        let launch = NodeLaunch {
            node: node.clone(),
            input_manifest: self.layout.input_manifest(node),
            workdir,
            worker_log: self.layout.worker_log(node),
            env: tasks::option_env(&self.store, node),
            remote: self.store.get_str(&["option", "remote"], Some(node)),
            kill_grace: self.options.kill_grace,
        };
        let dispatcher = self.dispatchers.for_launch(&launch)?;

        self.board.transition(node, NodeStatus::Running)?;
        self.running.insert(node.clone(), Instant::now());
        self.launched.push(node.clone());
        self.metrics.node_started();
        info!(node = %node, dispatcher = dispatcher.name(), "Launching node");

        let done_tx = done_tx.clone();
        let shutdown = shutdown.clone();
        let id = node.clone();
        tokio::spawn(async move {
            let exit = dispatcher.defer(launch, shutdown).await;
            let _ = done_tx.send((id, exit));
        });
        Ok(())
    }

    /// Bring the results of another job's nodes into an input manifest, from
    /// that job's directory or else from the job history
    fn merge_other_job(&self, target: &mut ConfigStore, job: &str, upstream: &[NodeId]) -> Result<()> {
        let other = self.layout.for_job(job);
        let mut archived: Option<ConfigStore> = None;
        for input in upstream {
            let path = other.output_manifest(input);
            if path.exists() {
                target.merge_node(&read_manifest(&path)?, input);
                continue;
            }
            if archived.is_none() {
                if let Some(history) = &self.history {
                    archived = history.latest(self.layout.design(), job)?;
                }
            }
            match &archived {
                Some(manifest) => target.merge_node(manifest, input),
                None => warn!(input = %input, job, "No recorded result for input"),
            }
        }
        Ok(())
    }

    /// Classify a finished worker by its exit code and output manifest
    fn complete(&mut self, node: NodeId, exit: Result<WorkerExit>) {
        let started = self.running.remove(&node);
        let recorded = self.read_output(&node);
        let reported = recorded.as_ref().and_then(|m| self.status_in(m, &node));

        let status = match &exit {
            Ok(code) if code.success() => match (&recorded, reported) {
                (None, _) => NodeStatus::Error,
                (Some(_), Some(NodeStatus::Skipped)) => NodeStatus::Skipped,
                (Some(_), _) => NodeStatus::Success,
            },
            Ok(_) if reported == Some(NodeStatus::Timeout) => NodeStatus::Timeout,
            _ => NodeStatus::Error,
        };

        if let Some(manifest) = &recorded {
            self.store.merge_node(manifest, &node);
        }
        match &exit {
            Err(e) => {
                record::set_record(&mut self.store, &node, field::STATUS_REASON, e.to_string());
            }
            Ok(code) if code.success() && recorded.is_none() => {
                record::set_record(
                    &mut self.store,
                    &node,
                    field::STATUS_REASON,
                    "worker exited without an output manifest",
                );
            }
            _ => {}
        }

        self.set_status(&node, status);
        if let Err(e) = self.board.transition(&node, status) {
            warn!(node = %node, "{}", e);
            self.board.seed(node.clone(), status);
        }

        let elapsed = started.map(|s| s.elapsed().as_secs_f64()).unwrap_or_default();
        self.metrics
            .node_finished(self.graph.name(), &node.step, status.as_str(), elapsed);

        match (&exit, status) {
            (_, NodeStatus::Success | NodeStatus::Skipped) => {
                info!(node = %node, status = %status, "Node finished in {:.1}s", elapsed)
            }
            (Ok(code), _) => error!(node = %node, status = %status, exit_code = ?code.code, "Node failed"),
            (Err(e), _) => error!(node = %node, "Node failed: {}", e),
        }
    }

    /// Stop launching; queued nodes go back to `pending` and running workers
    /// see the shutdown flag through their dispatchers
    fn cancel(&mut self, queue: &mut BTreeMap<NodeId, Vec<NodeId>>) {
        self.cancelled = true;
        warn!(running = self.running.len(), "Interrupted, stopping running nodes");
        for node in queue.keys() {
            self.board.seed(node.clone(), NodeStatus::Pending);
        }
        queue.clear();
    }

    /// Every target step must be reached by a path of usable nodes
    fn check_exits(&self, selection: &Selection, exec: &BTreeSet<NodeId>) -> Result<()> {
        let starts = self.graph.start_nodes(&selection.from);
        let reached = self.graph.reachable(
            &starts,
            |n| self.board.get(n).is_some_and(|s| s.is_usable()),
            &selection.prune,
        );

        let unreached: BTreeSet<String> = self
            .graph
            .target_nodes(&selection.to)
            .into_iter()
            .map(|n| n.step)
            .filter(|step| !reached.iter().any(|n| &n.step == step))
            .collect();
        if unreached.is_empty() {
            return Ok(());
        }

        let steps = unreached.into_iter().collect::<Vec<_>>().join(", ");
        let errors: Vec<String> = self
            .board
            .iter()
            .filter(|(n, s)| exec.contains(*n) && s.is_error())
            .map(|(n, _)| n.to_string())
            .collect();
        if errors.is_empty() {
            Err(ChipFlowError::ExitUnreached { steps })
        } else {
            Err(ChipFlowError::ExitBlocked {
                steps,
                errors: errors.join(", "),
            })
        }
    }

    fn write_job_manifest(&mut self) -> Result<PathBuf> {
        for (node, status) in self.board.snapshot() {
            if status.is_done() {
                self.set_status(&node, status);
            }
        }
        let json = self.layout.job_manifest(ManifestFormat::Json);
        write_manifest(&self.store, &json)?;
        if self.options.manifest_format != ManifestFormat::Json {
            write_manifest(&self.store, &self.layout.job_manifest(self.options.manifest_format))?;
        }
        Ok(json)
    }

    fn finish(
        &mut self,
        outcome: Result<()>,
        selection: &Selection,
        exec: &BTreeSet<NodeId>,
    ) -> Result<RunSummary> {
        let result = match outcome {
            Err(e) => Err(e),
            Ok(()) if self.cancelled => Err(ChipFlowError::Interrupted),
            Ok(()) => self.check_exits(selection, exec),
        };
        let status = match &result {
            Ok(()) => "success",
            Err(ChipFlowError::Interrupted) => "interrupted",
            Err(_) => "error",
        };

        let manifest = self.write_job_manifest()?;
        info!("Wrote {}", manifest.display());

        let flow = self.graph.name().to_string();
        self.metrics.run_finished(&flow, status);
        if let Err(e) = self.metrics.write_to(&self.layout.metrics_file()) {
            warn!("Could not write metrics: {}", e);
        }
        if let Some(history) = &self.history {
            if let Err(e) = history.record_job(&self.store, &flow, &self.board.snapshot(), status) {
                warn!("Could not record job history: {}", e);
            }
        }

        match &result {
            Ok(()) => info!(launched = self.launched.len(), "Run finished"),
            Err(e) => error!("Run failed: {}", e),
        }
        result.map(|()| RunSummary {
            job: self.layout.job().to_string(),
            flow,
            statuses: self.board.snapshot(),
            launched: self.launched.clone(),
            manifest,
        })
    }
}
