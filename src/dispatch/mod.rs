//! Worker dispatch
//!
//! The scheduler hands every launched node to a [`Dispatcher`]. A dispatcher
//! returns only once the node's worker is gone, leaving behind the output
//! manifest a worker writes (or nothing, if the worker crashed).

pub mod ssh;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ChipFlowError, Result};
use crate::models::NodeId;
use crate::process::terminate_group;

pub use ssh::{SshDispatcher, SshTarget};

/// Everything a dispatcher needs to start the worker of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLaunch {
    pub node: NodeId,
    pub input_manifest: PathBuf,
    pub workdir: PathBuf,
    /// Where the worker's own stdout/stderr go
    pub worker_log: PathBuf,
    /// Environment injected into this worker only
    pub env: BTreeMap<String, String>,
    /// Remote host name, `None` for local execution
    pub remote: Option<String>,
    pub kill_grace: Duration,
}

/// How a worker ended as seen from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the worker died from a signal
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

/// Runs a node's worker somewhere and waits for it
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;

    /// Run the worker for `launch`. Once `shutdown` turns true the worker must
    /// be stopped and this must return promptly.
    async fn defer(&self, launch: NodeLaunch, shutdown: watch::Receiver<bool>) -> Result<WorkerExit>;
}

/// Resolves once the shutdown flag is raised. A dropped sender never
/// resolves.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Starts `chipflow run-node` workers as local processes
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    program: PathBuf,
    base_args: Vec<String>,
}

impl LocalDispatcher {
    /// Dispatcher re-invoking the running executable
    pub fn current() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, Vec::new()))
    }

    /// Dispatcher invoking `program <base_args> run-node ...`
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    fn command(&self, launch: &NodeLaunch) -> Result<std::process::Command> {
        let log = File::create(&launch.worker_log)?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("run-node")
            .arg("--cfg")
            .arg(&launch.input_manifest)
            .arg("--step")
            .arg(&launch.node.step)
            .arg("--index")
            .arg(&launch.node.index)
            .arg("--kill-grace-secs")
            .arg(launch.kill_grace.as_secs().to_string())
            .current_dir(&launch.workdir)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);
        Ok(cmd)
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    fn name(&self) -> &str {
        "local"
    }

    async fn defer(&self, launch: NodeLaunch, shutdown: watch::Receiver<bool>) -> Result<WorkerExit> {
        let mut command = Command::from(self.command(&launch)?);
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ChipFlowError::Dispatch {
            node: launch.node.to_string(),
            message: format!("failed to start {}: {}", self.program.display(), e),
        })?;
        debug!(node = %launch.node, pid = ?child.id(), "Worker started");

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = wait_for_shutdown(shutdown) => {
                warn!(node = %launch.node, "Stopping worker");
                terminate_group(&mut child, launch.kill_grace).await?
            }
        };
        Ok(WorkerExit::from(status))
    }
}

/// The local dispatcher plus any named remote dispatchers
#[derive(Clone)]
pub struct DispatcherSet {
    local: Arc<dyn Dispatcher>,
    remote: HashMap<String, Arc<dyn Dispatcher>>,
}

impl DispatcherSet {
    pub fn new(local: Arc<dyn Dispatcher>) -> Self {
        Self {
            local,
            remote: HashMap::new(),
        }
    }

    pub fn with_remote(mut self, name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let name = name.into();
        info!(remote = %name, dispatcher = dispatcher.name(), "Registered remote dispatcher");
        self.remote.insert(name, dispatcher);
        self
    }

    /// Pick the dispatcher for a launch; naming an unknown remote is an error
    pub fn for_launch(&self, launch: &NodeLaunch) -> Result<Arc<dyn Dispatcher>> {
        match &launch.remote {
            None => Ok(Arc::clone(&self.local)),
            Some(name) => self.remote.get(name).cloned().ok_or_else(|| ChipFlowError::Dispatch {
                node: launch.node.to_string(),
                message: format!("no remote named '{}' is configured", name),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn launch(dir: &TempDir) -> NodeLaunch {
        NodeLaunch {
            node: NodeId::new("syn", "0"),
            input_manifest: dir.path().join("inputs/heartbeat.json"),
            workdir: dir.path().to_path_buf(),
            worker_log: dir.path().join("node.log"),
            env: BTreeMap::from([("PDK".to_string(), "sky130".to_string())]),
            remote: None,
            kill_grace: Duration::from_millis(200),
        }
    }

    fn sh(script: &str) -> LocalDispatcher {
        LocalDispatcher::new("/bin/sh", vec!["-c".to_string(), script.to_string(), "worker".to_string()])
    }

    #[tokio::test]
    async fn test_local_worker_arguments_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let dispatcher = sh("echo \"$PDK $@\"; exit 3");
        let (_tx, rx) = watch::channel(false);

        let exit = dispatcher.defer(launch(&dir), rx).await.unwrap();
        assert_eq!(exit, WorkerExit { code: Some(3) });
        assert!(!exit.success());

        let log = std::fs::read_to_string(dir.path().join("node.log")).unwrap();
        assert!(log.starts_with("sky130 run-node --cfg"));
        assert!(log.contains("--step syn --index 0"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let dir = TempDir::new().unwrap();
        let dispatcher = sh("sleep 30");
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { dispatcher.defer(launch(&dir), rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn test_unknown_remote_rejected() {
        let dir = TempDir::new().unwrap();
        let set = DispatcherSet::new(Arc::new(sh("true")));
        let mut remote = launch(&dir);
        remote.remote = Some("farm".to_string());

        assert_eq!(set.for_launch(&launch(&dir)).unwrap().name(), "local");
        assert!(matches!(set.for_launch(&remote), Err(ChipFlowError::Dispatch { .. })));
    }
}
