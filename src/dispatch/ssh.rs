//! SSH remote dispatch
//!
//! Runs `chipflow run-node` on another machine that mounts the same build
//! directory, so the worker's manifests and outputs land where the controller
//! expects them.
//!
//! # Security
//!
//! - **Key-based authentication only**, no password support
//! - Every argument of the remote command line is shell-quoted
//! - Key paths are validated before connecting
//!
//! Each dispatch opens its own SSH session; sessions are not pooled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{wait_for_shutdown, Dispatcher, NodeLaunch, WorkerExit};
use crate::error::{ChipFlowError, Result};
use crate::process::shell_quote;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn default_port() -> u16 {
    22
}

fn default_program() -> String {
    "chipflow".to_string()
}

/// A remote host able to run workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Private key, `~/.ssh/id_rsa` when unset
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// chipflow executable on the remote host
    #[serde(default = "default_program")]
    pub program: String,
}

/// Dispatcher running workers over SSH
#[derive(Debug, Clone)]
pub struct SshDispatcher {
    target: SshTarget,
}

impl SshDispatcher {
    pub fn new(target: SshTarget) -> Result<Self> {
        Self::validate_target(&target)?;
        Ok(Self { target })
    }

    fn validate_target(target: &SshTarget) -> Result<()> {
        if target.host.is_empty() {
            return Err(ChipFlowError::Validation("SSH host cannot be empty".to_string()));
        }
        if target.user.is_empty() {
            return Err(ChipFlowError::Validation("SSH user cannot be empty".to_string()));
        }
        if let Some(key_path) = &target.key_path {
            if !key_path.exists() {
                return Err(ChipFlowError::Validation(format!(
                    "SSH key file not found: {}",
                    key_path.display()
                )));
            }
        }
        Ok(())
    }

    fn ssh_error(&self, message: String) -> ChipFlowError {
        ChipFlowError::Ssh {
            host: self.target.host.clone(),
            message,
        }
    }

    /// Remote shell command line for a launch
    pub fn remote_command(&self, launch: &NodeLaunch) -> String {
        let mut line = format!("cd {} &&", shell_quote(&launch.workdir.display().to_string()));
        for (key, value) in &launch.env {
            line.push_str(&format!(" {}={}", key, shell_quote(value)));
        }
        let args = [
            self.target.program.clone(),
            "run-node".to_string(),
            "--cfg".to_string(),
            launch.input_manifest.display().to_string(),
            "--step".to_string(),
            launch.node.step.clone(),
            "--index".to_string(),
            launch.node.index.clone(),
            "--kill-grace-secs".to_string(),
            launch.kill_grace.as_secs().to_string(),
        ];
        for arg in &args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line.push_str(&format!(
            " > {} 2>&1",
            shell_quote(&launch.worker_log.display().to_string())
        ));
        line
    }

    fn create_session(&self) -> Result<Session> {
        let target = format!("{}:{}", self.target.host, self.target.port);
        debug!("Creating SSH session to {}", target);

        let addr = target
            .to_socket_addrs()
            .map_err(|e| self.ssh_error(format!("Invalid host address: {}", e)))?
            .next()
            .ok_or_else(|| self.ssh_error("Host did not resolve".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| self.ssh_error(format!("Failed to connect: {}", e)))?;

        let mut session = Session::new().map_err(|e| self.ssh_error(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| self.ssh_error(format!("SSH handshake failed: {}", e)))?;

        let default_key = std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".ssh/id_rsa"));
        let key_path = self
            .target
            .key_path
            .clone()
            .or(default_key)
            .ok_or_else(|| self.ssh_error("No SSH key path specified and default key not found".to_string()))?;

        session
            .userauth_pubkey_file(&self.target.user, None, Path::new(&key_path), None)
            .map_err(|e| self.ssh_error(format!("Authentication failed: {}", e)))?;
        if !session.authenticated() {
            return Err(self.ssh_error("Authentication failed".to_string()));
        }

        info!("SSH session established to {}", target);
        Ok(session)
    }

    fn run_blocking(&self, command: &str) -> Result<WorkerExit> {
        let session = self.create_session()?;
        let mut channel = session
            .channel_session()
            .map_err(|e| self.ssh_error(format!("Failed to open channel: {}", e)))?;
        channel
            .exec(command)
            .map_err(|e| self.ssh_error(format!("Failed to execute command: {}", e)))?;

        // worker output is redirected remotely; drain whatever the shell prints
        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| self.ssh_error(format!("Failed to read output: {}", e)))?;
        if !output.is_empty() {
            debug!("Remote output: {}", output.trim_end());
        }

        channel
            .wait_close()
            .map_err(|e| self.ssh_error(format!("Failed to close channel: {}", e)))?;
        let code = channel
            .exit_status()
            .map_err(|e| self.ssh_error(format!("Failed to get exit status: {}", e)))?;
        Ok(WorkerExit { code: Some(code) })
    }
}

#[async_trait]
impl Dispatcher for SshDispatcher {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn defer(&self, launch: NodeLaunch, shutdown: watch::Receiver<bool>) -> Result<WorkerExit> {
        let command = self.remote_command(&launch);
        info!(node = %launch.node, host = %self.target.host, "Dispatching worker over SSH");

        let dispatcher = self.clone();
        let job = tokio::task::spawn_blocking(move || dispatcher.run_blocking(&command));

        tokio::select! {
            joined = job => joined.map_err(|e| ChipFlowError::Dispatch {
                node: launch.node.to_string(),
                message: format!("SSH task join error: {}", e),
            })?,
            _ = wait_for_shutdown(shutdown) => {
                // the remote worker is bounded by its own timeout
                warn!(node = %launch.node, host = %self.target.host, "Abandoning remote worker");
                Ok(WorkerExit { code: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeId;
    use std::collections::BTreeMap;

    fn target() -> SshTarget {
        SshTarget {
            host: "farm01".to_string(),
            user: "eda".to_string(),
            port: 22,
            key_path: None,
            program: "/opt/chipflow/bin/chipflow".to_string(),
        }
    }

    #[test]
    fn test_validate_target() {
        assert!(SshDispatcher::new(target()).is_ok());

        let mut bad = target();
        bad.host.clear();
        assert!(matches!(SshDispatcher::new(bad), Err(ChipFlowError::Validation(_))));

        let mut bad = target();
        bad.user.clear();
        assert!(SshDispatcher::new(bad).is_err());

        let mut bad = target();
        bad.key_path = Some(PathBuf::from("/nonexistent/id_ed25519"));
        assert!(SshDispatcher::new(bad).is_err());
    }

    #[test]
    fn test_remote_command_is_quoted() {
        let dispatcher = SshDispatcher::new(target()).unwrap();
        let launch = NodeLaunch {
            node: NodeId::new("place", "1"),
            input_manifest: PathBuf::from("/nfs/build/gcd/job0/place/1/inputs/gcd.json"),
            workdir: PathBuf::from("/nfs/build/gcd/job0/place/1"),
            worker_log: PathBuf::from("/nfs/build/gcd/job0/place/1/node.log"),
            env: BTreeMap::from([("LICENSE".to_string(), "27000@lic server".to_string())]),
            remote: Some("farm".to_string()),
            kill_grace: Duration::from_secs(10),
        };

        assert_eq!(
            dispatcher.remote_command(&launch),
            "cd /nfs/build/gcd/job0/place/1 && LICENSE='27000@lic server' \
             /opt/chipflow/bin/chipflow run-node --cfg /nfs/build/gcd/job0/place/1/inputs/gcd.json \
             --step place --index 1 --kill-grace-secs 10 > /nfs/build/gcd/job0/place/1/node.log 2>&1"
        );
    }

    #[test]
    fn test_target_defaults() {
        let target: SshTarget = serde_yaml::from_str("host: farm01\nuser: eda\n").unwrap();
        assert_eq!(target.port, 22);
        assert_eq!(target.program, "chipflow");
        assert!(target.key_path.is_none());
    }
}
