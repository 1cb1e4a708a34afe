//! Scheduler behavior against a scripted dispatcher
//!
//! The dispatcher never starts a process. It checks what the scheduler handed
//! it and writes the output manifest a worker would have left behind.

use async_trait::async_trait;
use chipflow::dispatch::{wait_for_shutdown, Dispatcher, DispatcherSet, NodeLaunch, WorkerExit};
use chipflow::error::{ChipFlowError, Result};
use chipflow::flowgraph::Flowgraph;
use chipflow::layout::JobLayout;
use chipflow::manifest::{read_manifest, write_manifest, ManifestFormat};
use chipflow::models::{NodeId, NodeStatus};
use chipflow::parser::{load_store, parse_flow_yaml};
use chipflow::record::{self, field, metric};
use chipflow::scheduler::{Scheduler, SchedulerOptions};
use chipflow::store::ConfigStore;
use chipflow::tasks::TaskRegistry;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const FLOW: &str = r#"
design: heartbeat
flow: asicflow
tools:
  sh:
    exe: /bin/sh
flows:
  asicflow:
    - { step: import, tool: sh, task: import }
    - { step: syn, tool: sh, task: syn, inputs: [import/0] }
    - { step: floorplan, index: 0, tool: sh, task: floorplan, inputs: [syn/0] }
    - { step: floorplan, index: 1, tool: sh, task: floorplan, inputs: [syn/0] }
    - { step: merge, tool: builtin, task: minimum, inputs: [floorplan/0, floorplan/1] }
"#;

/// How a scripted worker ends
#[derive(Debug, Clone, Copy)]
enum Script {
    Succeed,
    Fail,
    /// Exit 0 without leaving a manifest
    Crash,
    Timeout,
    Skip,
    /// Run until shutdown
    Hang,
}

struct FakeDispatcher {
    scripts: HashMap<NodeId, Script>,
    launches: Mutex<Vec<NodeId>>,
    violations: Mutex<Vec<String>>,
}

impl FakeDispatcher {
    fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(node, script)| (node.parse().unwrap(), *script))
                .collect(),
            launches: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> BTreeSet<NodeId> {
        self.launches.lock().unwrap().iter().cloned().collect()
    }

    fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn defer(&self, launch: NodeLaunch, shutdown: watch::Receiver<bool>) -> Result<WorkerExit> {
        let node = launch.node.clone();
        self.launches.lock().unwrap().push(node.clone());

        let mut store = read_manifest(&launch.input_manifest)?;
        let flow = store.get_str(&["option", "flow"], None).unwrap_or_default();
        let graph = Flowgraph::from_store(&store, &flow)?;
        for input in graph.node_inputs(&node) {
            let status = store.get_str(&["flowgraph", flow.as_str(), "status"], Some(input));
            if !matches!(status.as_deref(), Some("success" | "skipped" | "error" | "timeout")) {
                self.violations
                    .lock()
                    .unwrap()
                    .push(format!("{} launched while {} was {:?}", node, input, status));
            }
        }

        let script = self.scripts.get(&node).copied().unwrap_or(Script::Succeed);
        let (status, code) = match script {
            Script::Succeed => ("success", 0),
            Script::Fail => ("error", 1),
            Script::Timeout => ("timeout", 124),
            Script::Skip => ("skipped", 0),
            Script::Crash => return Ok(WorkerExit { code: Some(0) }),
            Script::Hang => {
                wait_for_shutdown(shutdown).await;
                return Ok(WorkerExit { code: None });
            }
        };

        store.set(&["flowgraph", flow.as_str(), "status"], status, Some(&node));
        record::set_record(&mut store, &node, field::EXIT_CODE, code);
        record::set_metric(&mut store, &node, metric::TASK_TIME, 0.01);
        write_manifest(&store, &JobLayout::from_store(&store).output_manifest(&node))?;
        Ok(WorkerExit { code: Some(code) })
    }
}

fn store_for(yaml: &str, builddir: &Path) -> ConfigStore {
    let config = parse_flow_yaml(yaml).unwrap();
    let mut store = load_store(&config).unwrap();
    store.set(&["option", "builddir"], builddir.display().to_string(), None);
    store
}

fn scheduler(store: ConfigStore, dispatcher: Arc<FakeDispatcher>) -> Scheduler {
    let options = SchedulerOptions {
        poll_interval: Duration::from_millis(5),
        kill_grace: Duration::from_secs(1),
        manifest_format: ManifestFormat::Json,
        history_db: None,
    };
    Scheduler::new(store, TaskRegistry::with_builtins(), DispatcherSet::new(dispatcher), options).unwrap()
}

async fn run(scheduler: &mut Scheduler) -> Result<chipflow::scheduler::RunSummary> {
    let (_tx, rx) = watch::channel(false);
    scheduler.run(rx).await
}

fn id(s: &str) -> NodeId {
    s.parse().unwrap()
}

fn ids(nodes: &[&str]) -> BTreeSet<NodeId> {
    nodes.iter().map(|n| id(n)).collect()
}

#[tokio::test]
async fn test_full_flow_succeeds() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let summary = run(&mut sched).await.unwrap();

    assert_eq!(summary.job, "job0");
    assert!(summary.statuses.values().all(|s| *s == NodeStatus::Success));
    assert_eq!(
        summary.launched,
        vec![id("import/0"), id("syn/0"), id("floorplan/0"), id("floorplan/1"), id("merge/0")]
    );
    assert!(fake.violations().is_empty(), "{:?}", fake.violations());

    assert!(summary.manifest.exists());
    assert!(sched.layout().metrics_file().exists());
    let manifest = read_manifest(&summary.manifest).unwrap();
    assert_eq!(
        manifest.get_str(&["flowgraph", "asicflow", "status"], Some(&id("merge/0"))).as_deref(),
        Some("success")
    );
    assert_eq!(record::get_metric(&manifest, &id("syn/0"), metric::TASK_TIME), Some(0.01));
}

#[tokio::test]
async fn test_builtin_tolerates_one_failed_input() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[("floorplan/1", Script::Fail)]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let summary = run(&mut sched).await.unwrap();

    assert_eq!(summary.statuses[&id("floorplan/1")], NodeStatus::Error);
    assert_eq!(summary.statuses[&id("merge/0")], NodeStatus::Success);
    assert!(fake.launches().contains(&id("merge/0")));
    assert!(fake.violations().is_empty(), "{:?}", fake.violations());
}

#[tokio::test]
async fn test_builtin_fails_when_every_input_failed() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[("floorplan/0", Script::Fail), ("floorplan/1", Script::Fail)]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    match err {
        ChipFlowError::ExitBlocked { steps, errors } => {
            assert_eq!(steps, "merge");
            assert!(errors.contains("floorplan/0"));
            assert!(errors.contains("floorplan/1"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!fake.launches().contains(&id("merge/0")));
    assert_eq!(sched.statuses()[&id("merge/0")], NodeStatus::Error);

    // the job manifest is written even though the run failed
    let manifest = read_manifest(&sched.layout().job_manifest(ManifestFormat::Json)).unwrap();
    assert_eq!(
        manifest.get_str(&["flowgraph", "asicflow", "status"], Some(&id("merge/0"))).as_deref(),
        Some("error")
    );
}

#[tokio::test]
async fn test_ordinary_node_not_launched_after_failed_input() {
    let dir = TempDir::new().unwrap();
    let yaml = FLOW.replace("tool: builtin, task: minimum", "tool: sh, task: merge");
    let fake = FakeDispatcher::new(&[("floorplan/1", Script::Fail)]);
    let mut sched = scheduler(store_for(&yaml, dir.path()), fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::ExitBlocked { .. }), "{:?}", err);
    assert_eq!(fake.launches(), ids(&["import/0", "syn/0", "floorplan/0", "floorplan/1"]));
    let statuses = sched.statuses();
    assert_eq!(statuses[&id("floorplan/0")], NodeStatus::Success);
    assert_eq!(statuses[&id("merge/0")], NodeStatus::Error);
    let reason = record::get_record(sched.store(), &id("merge/0"), field::STATUS_REASON).unwrap();
    assert!(reason.as_str().unwrap().contains("floorplan/1"));
}

#[tokio::test]
async fn test_exit_without_manifest_is_error() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[("syn/0", Script::Crash)]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::ExitBlocked { .. }));
    assert_eq!(fake.launches(), ids(&["import/0", "syn/0"]));
    let statuses = sched.statuses();
    assert_eq!(statuses[&id("syn/0")], NodeStatus::Error);
    assert_eq!(statuses[&id("floorplan/0")], NodeStatus::Error);
    assert_eq!(statuses[&id("merge/0")], NodeStatus::Error);
    assert_eq!(
        record::get_record(sched.store(), &id("syn/0"), field::STATUS_REASON),
        Some(json!("worker exited without an output manifest"))
    );
}

#[tokio::test]
async fn test_timeout_and_skip_statuses() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[("floorplan/0", Script::Timeout), ("floorplan/1", Script::Skip)]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::ExitBlocked { .. }), "{:?}", err);
    let statuses = sched.statuses();
    assert_eq!(statuses[&id("floorplan/0")], NodeStatus::Timeout);
    assert_eq!(statuses[&id("floorplan/1")], NodeStatus::Skipped);
    // a builtin needs at least one successful input
    assert_eq!(statuses[&id("merge/0")], NodeStatus::Error);
    assert!(!fake.launches().contains(&id("merge/0")));
}

#[tokio::test]
async fn test_builtin_with_only_skipped_inputs_fails() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[("floorplan/0", Script::Skip), ("floorplan/1", Script::Skip)]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::ExitUnreached { .. } | ChipFlowError::ExitBlocked { .. }), "{:?}", err);
    assert_eq!(sched.statuses()[&id("merge/0")], NodeStatus::Error);
    assert!(!fake.launches().contains(&id("merge/0")));
}

#[tokio::test]
async fn test_builtin_with_skipped_and_successful_inputs_runs() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[("floorplan/1", Script::Skip)]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let summary = run(&mut sched).await.unwrap();

    assert_eq!(summary.statuses[&id("merge/0")], NodeStatus::Success);
    assert!(fake.violations().is_empty(), "{:?}", fake.violations());
}

/// import -> fp/{0,1} -> place/{0,1} -> merge (join)
const PLACE_FLOW: &str = r#"
design: heartbeat
flow: asicflow
tools:
  sh:
    exe: /bin/sh
flows:
  asicflow:
    - { step: import, tool: sh, task: import }
    - { step: fp, index: 0, tool: sh, task: fp, inputs: [import/0] }
    - { step: fp, index: 1, tool: sh, task: fp, inputs: [import/0] }
    - { step: place, index: 0, tool: sh, task: place, inputs: [fp/0] }
    - { step: place, index: 1, tool: sh, task: place, inputs: [fp/1] }
    - { step: merge, tool: builtin, task: join, inputs: [place/0, place/1] }
"#;

#[tokio::test]
async fn test_rerun_does_not_see_previous_results_of_failed_branch() {
    let dir = TempDir::new().unwrap();
    run(&mut scheduler(store_for(PLACE_FLOW, dir.path()), FakeDispatcher::new(&[])))
        .await
        .unwrap();

    let fake = FakeDispatcher::new(&[("fp/1", Script::Fail)]);
    let mut sched = scheduler(store_for(PLACE_FLOW, dir.path()), fake.clone());
    let summary = run(&mut sched).await.unwrap();

    assert_eq!(summary.statuses[&id("place/1")], NodeStatus::Error);
    assert_eq!(summary.statuses[&id("merge/0")], NodeStatus::Success);
    assert!(!fake.launches().contains(&id("place/1")));
    assert!(!sched.layout().output_manifest(&id("place/1")).exists());

    let merge_input = read_manifest(&sched.layout().input_manifest(&id("merge/0"))).unwrap();
    assert_eq!(
        merge_input.get_str(&["flowgraph", "asicflow", "status"], Some(&id("place/1"))).as_deref(),
        Some("error")
    );
    let job = read_manifest(&summary.manifest).unwrap();
    assert_eq!(
        job.get_str(&["flowgraph", "asicflow", "status"], Some(&id("place/1"))).as_deref(),
        Some("error")
    );
    assert_eq!(record::get_record(&job, &id("place/1"), field::EXIT_CODE), None);
}

#[tokio::test]
async fn test_resume_without_changes_launches_nothing() {
    let dir = TempDir::new().unwrap();
    let first = run(&mut scheduler(store_for(FLOW, dir.path()), FakeDispatcher::new(&[])))
        .await
        .unwrap();

    let mut store = store_for(FLOW, dir.path());
    store.set(&["option", "resume"], true, None);
    let fake = FakeDispatcher::new(&[]);
    let second = run(&mut scheduler(store, fake.clone())).await.unwrap();

    assert!(second.launched.is_empty());
    assert!(fake.launches().is_empty());
    assert_eq!(first.statuses, second.statuses);
}

#[tokio::test]
async fn test_resume_reruns_changed_node_and_its_dependents() {
    let dir = TempDir::new().unwrap();
    run(&mut scheduler(store_for(FLOW, dir.path()), FakeDispatcher::new(&[])))
        .await
        .unwrap();

    let yaml = FLOW.replace(
        "index: 1, tool: sh, task: floorplan,",
        "index: 1, tool: sh, task: floorplan_alt,",
    );
    let mut store = store_for(&yaml, dir.path());
    store.set(&["option", "resume"], true, None);
    let fake = FakeDispatcher::new(&[]);
    let summary = run(&mut scheduler(store, fake.clone())).await.unwrap();

    assert_eq!(summary.launched, vec![id("floorplan/1"), id("merge/0")]);
    assert!(summary.statuses.values().all(|s| *s == NodeStatus::Success));
}

#[tokio::test]
async fn test_from_step_without_previous_results_deadlocks() {
    let dir = TempDir::new().unwrap();
    let mut store = store_for(FLOW, dir.path());
    store.set(&["option", "from"], json!(["syn"]), None);
    let fake = FakeDispatcher::new(&[]);
    let mut sched = scheduler(store, fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::Deadlock { waiting: 4 }), "{:?}", err);
    assert!(fake.launches().is_empty());
    assert!(sched.layout().job_manifest(ManifestFormat::Json).exists());
}

#[tokio::test]
async fn test_from_step_reuses_previous_results() {
    let dir = TempDir::new().unwrap();
    run(&mut scheduler(store_for(FLOW, dir.path()), FakeDispatcher::new(&[])))
        .await
        .unwrap();

    let mut store = store_for(FLOW, dir.path());
    store.set(&["option", "from"], json!(["floorplan"]), None);
    let fake = FakeDispatcher::new(&[]);
    let summary = run(&mut scheduler(store, fake.clone())).await.unwrap();

    assert_eq!(fake.launches(), ids(&["floorplan/0", "floorplan/1", "merge/0"]));
    assert_eq!(summary.statuses[&id("syn/0")], NodeStatus::Success);
    assert!(fake.violations().is_empty(), "{:?}", fake.violations());
}

#[tokio::test]
async fn test_to_step_stops_early() {
    let dir = TempDir::new().unwrap();
    let mut store = store_for(FLOW, dir.path());
    store.set(&["option", "to"], json!(["syn"]), None);
    let fake = FakeDispatcher::new(&[]);
    let summary = run(&mut scheduler(store, fake.clone())).await.unwrap();

    assert_eq!(fake.launches(), ids(&["import/0", "syn/0"]));
    assert_eq!(summary.statuses[&id("merge/0")], NodeStatus::Pending);
}

#[tokio::test]
async fn test_pruned_node_is_skipped() {
    let dir = TempDir::new().unwrap();
    let mut store = store_for(FLOW, dir.path());
    store.set(&["option", "prune"], json!(["floorplan/1"]), None);
    let fake = FakeDispatcher::new(&[]);
    let summary = run(&mut scheduler(store, fake.clone())).await.unwrap();

    assert!(!fake.launches().contains(&id("floorplan/1")));
    assert_eq!(summary.statuses[&id("floorplan/1")], NodeStatus::Skipped);
    assert_eq!(summary.statuses[&id("merge/0")], NodeStatus::Success);
}

#[tokio::test]
async fn test_cycle_rejected_before_launch() {
    let dir = TempDir::new().unwrap();
    let yaml = r#"
design: heartbeat
flow: loop
tools:
  sh:
    exe: /bin/sh
flows:
  loop:
    - { step: import, tool: sh, task: import }
    - { step: a, tool: sh, task: a, inputs: [import/0, b/0] }
    - { step: b, tool: sh, task: b, inputs: [a/0] }
    - { step: export, tool: sh, task: export, inputs: [b/0] }
"#;
    let fake = FakeDispatcher::new(&[]);
    let mut sched = scheduler(store_for(yaml, dir.path()), fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::CycleDetected(_)), "{:?}", err);
    assert!(err.is_structural());
    assert!(fake.launches().is_empty());
    assert!(!sched.layout().job_manifest(ManifestFormat::Json).exists());
}

#[tokio::test]
async fn test_unknown_remote_marks_node_error() {
    let dir = TempDir::new().unwrap();
    let yaml = FLOW.replace(
        "{ step: syn, tool: sh, task: syn,",
        "{ step: syn, tool: sh, task: syn, remote: farm,",
    );
    let fake = FakeDispatcher::new(&[]);
    let mut sched = scheduler(store_for(&yaml, dir.path()), fake.clone());

    let err = run(&mut sched).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::ExitBlocked { .. }), "{:?}", err);
    assert_eq!(fake.launches(), ids(&["import/0"]));
    assert_eq!(sched.statuses()[&id("syn/0")], NodeStatus::Error);
}

#[tokio::test]
async fn test_interrupt_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let fake = FakeDispatcher::new(&[("syn/0", Script::Hang)]);
    let mut sched = scheduler(store_for(FLOW, dir.path()), fake.clone());

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send(true);
    });
    let err = sched.run(rx).await.unwrap_err();

    assert!(matches!(err, ChipFlowError::Interrupted), "{:?}", err);
    assert_eq!(fake.launches(), ids(&["import/0", "syn/0"]));
    let statuses = sched.statuses();
    assert_eq!(statuses[&id("syn/0")], NodeStatus::Error);
    assert_eq!(statuses[&id("floorplan/0")], NodeStatus::Pending);
    assert!(sched.layout().job_manifest(ManifestFormat::Json).exists());
}
