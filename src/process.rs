//! Tool subprocess execution
//!
//! Tools run in their own process group so that a timeout or interrupt can
//! terminate the whole process tree, not only the direct child.

use std::fs::File;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::error::{ChipFlowError, Result};
use crate::tasks::ToolCommand;

/// How long a version query may take
pub const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// How a tool run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnd {
    /// Exited on its own; `None` when killed by a signal
    Exited(Option<i32>),
    TimedOut,
    Interrupted,
}

/// Measurements of a finished tool run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessOutcome {
    pub end: ProcessEnd,
    pub wall: Duration,
    /// User plus system CPU time of the process tree
    pub cpu: Duration,
    /// Peak resident set size in bytes
    pub max_rss: u64,
}

/// Send `signal` to every process of a group. Returns false when the group
/// no longer exists.
pub fn signal_group(pgid: u32, signal: i32) -> bool {
    // SAFETY: killpg(2) only delivers a signal; the group id comes from a
    // child we spawned as a group leader. A recycled id is an inherent limit
    // of id-based process management.
    unsafe { libc::killpg(pgid as libc::pid_t, signal) == 0 }
}

/// SIGTERM the group, wait up to `grace` for the leader, then SIGKILL
pub async fn terminate_group(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    let Some(pgid) = child.id() else {
        return Ok(child.wait().await?);
    };

    info!(pgid, "Terminating process group");
    signal_group(pgid, libc::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            // stragglers that ignored SIGTERM
            signal_group(pgid, libc::SIGKILL);
            Ok(status?)
        }
        Err(_) => {
            warn!(pgid, "Process group survived {:?} grace period, killing", grace);
            signal_group(pgid, libc::SIGKILL);
            Ok(child.wait().await?)
        }
    }
}

#[derive(Clone, Copy)]
struct Usage {
    cpu: Duration,
    max_rss: u64,
}

fn children_usage() -> Usage {
    // SAFETY: rusage is plain old data and getrusage(2) fully initializes
    // it on success.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: RUSAGE_CHILDREN with a valid out pointer is always sound.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc != 0 {
        return Usage {
            cpu: Duration::ZERO,
            max_rss: 0,
        };
    }
    let tv = |t: libc::timeval| Duration::from_secs(t.tv_sec as u64) + Duration::from_micros(t.tv_usec as u64);
    Usage {
        cpu: tv(usage.ru_utime) + tv(usage.ru_stime),
        // kilobytes on Linux
        max_rss: (usage.ru_maxrss as u64).saturating_mul(1024),
    }
}

/// Run a tool to completion with its output appended to `log_path`.
///
/// The run ends when the tool exits, when its timeout expires, or when
/// `shutdown` resolves. In the last two cases the tool's process group is
/// terminated before this returns.
pub async fn run_tool<F>(cmd: &ToolCommand, log_path: &Path, grace: Duration, shutdown: F) -> Result<ProcessOutcome>
where
    F: Future<Output = ()>,
{
    let log = File::create(log_path)?;
    let log_err = log.try_clone()?;

    let mut std_cmd = std::process::Command::new(&cmd.program);
    std_cmd
        .args(&cmd.args)
        .current_dir(&cmd.workdir)
        .envs(&cmd.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0);

    let mut command = Command::from(std_cmd);
    command.kill_on_drop(true);

    info!("Executing tool: {}", cmd.program);
    debug!("Tool args: {:?}", cmd.args);

    let before = children_usage();
    let start = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        error!("Failed to start {}: {}", cmd.program, e);
        ChipFlowError::Io(e)
    })?;

    let deadline = async {
        match cmd.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    let end = tokio::select! {
        status = child.wait() => ProcessEnd::Exited(status?.code()),
        _ = &mut deadline => {
            error!("Tool timed out after {:?}", cmd.timeout.unwrap_or_default());
            terminate_group(&mut child, grace).await?;
            ProcessEnd::TimedOut
        }
        _ = &mut shutdown => {
            warn!("Interrupted, stopping tool");
            terminate_group(&mut child, grace).await?;
            ProcessEnd::Interrupted
        }
    };

    let wall = start.elapsed();
    let after = children_usage();
    let outcome = ProcessOutcome {
        end,
        wall,
        cpu: after.cpu.saturating_sub(before.cpu),
        max_rss: after.max_rss,
    };
    info!("Tool finished: {:?} in {:.3}s", outcome.end, wall.as_secs_f64());
    Ok(outcome)
}

/// Run `exe <vswitch...>` and return its combined output
pub async fn query_version(exe: &str, vswitch: &[String]) -> Result<String> {
    let mut cmd = Command::new(exe);
    cmd.args(vswitch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(VERSION_QUERY_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ChipFlowError::Other(format!("version query of {} timed out", exe)))??;

    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

pub(crate) fn shell_quote(text: &str) -> String {
    if !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+,".contains(c))
    {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', "'\\''"))
    }
}

/// Write a script that reruns the tool by hand
pub fn write_replay_script(path: &Path, cmd: &ToolCommand) -> Result<()> {
    let mut script = String::from("#!/usr/bin/env bash\n# Replays the tool invocation of this node\n\n");
    script.push_str(&format!("cd {}\n", shell_quote(&cmd.workdir.display().to_string())));
    for (key, value) in &cmd.env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str("\nexec ");
    script.push_str(&shell_quote(&cmd.program));
    for arg in &cmd.args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }
    script.push('\n');

    std::fs::write(path, script)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sh(script: &str, workdir: &Path, timeout: Option<Duration>) -> ToolCommand {
        ToolCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            workdir: workdir.to_path_buf(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_run_tool_logs_output() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("syn.log");
        let cmd = sh("echo $GREETING; echo oops >&2; exit 3", dir.path(), None);

        let outcome = run_tool(&cmd, &log, Duration::from_secs(1), std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome.end, ProcessEnd::Exited(Some(3)));
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("hello"));
        assert!(text.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_tree() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("place.log");
        let marker = dir.path().join("grandchild-finished");
        let script = format!("(sleep 2; touch {}) & sleep 30", marker.display());
        let cmd = sh(&script, dir.path(), Some(Duration::from_millis(200)));

        let outcome = run_tool(&cmd, &log, Duration::from_millis(200), std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome.end, ProcessEnd::TimedOut);
        assert!(outcome.wall < Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "background child outlived the timeout");
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_tool() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("route.log");
        let cmd = sh("sleep 30", dir.path(), None);

        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        let outcome = run_tool(&cmd, &log, Duration::from_millis(200), shutdown)
            .await
            .unwrap();
        assert_eq!(outcome.end, ProcessEnd::Interrupted);
    }

    #[tokio::test]
    async fn test_query_version() {
        let text = query_version("/bin/sh", &["-c".to_string(), "echo tool 1.2.3".to_string()])
            .await
            .unwrap();
        assert_eq!(text.trim(), "tool 1.2.3");
    }

    #[test]
    fn test_replay_script() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.sh");
        let cmd = sh("echo it's", Path::new("/tmp/work dir"), None);
        write_replay_script(&path, &cmd).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#!/usr/bin/env bash"));
        assert!(text.contains("cd '/tmp/work dir'"));
        assert!(text.contains("export GREETING=hello"));
        assert!(text.contains("exec /bin/sh -c 'echo it'\\''s'"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
