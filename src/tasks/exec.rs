//! Generic external-executable task
//!
//! Drives any tool described under `tool,<tool>,*`: the executable, its
//! version switch, per-task arguments and environment, and the files the
//! task consumes and produces.

use regex::Regex;
use tracing::{debug, warn};

use super::{RunPlan, Task, TaskContext, ToolCommand};
use crate::error::{ChipFlowError, Result};

#[derive(Debug, Clone)]
pub struct ExecTask {
    tool: String,
    task: String,
}

impl ExecTask {
    pub fn new(tool: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            task: task.into(),
        }
    }

    fn task_key<'k>(&'k self, field: &'k str) -> [&'k str; 5] {
        ["tool", self.tool.as_str(), "task", self.task.as_str(), field]
    }

    fn env_for(&self, ctx: &TaskContext<'_>) -> std::collections::BTreeMap<String, String> {
        let mut env = std::collections::BTreeMap::new();
        for prefix in [
            vec!["tool", self.tool.as_str(), "env"],
            vec!["tool", self.tool.as_str(), "task", self.task.as_str(), "env"],
        ] {
            for key in ctx.store.keys(&prefix) {
                if key.len() != prefix.len() + 1 {
                    continue;
                }
                let key: Vec<&str> = key.iter().map(String::as_str).collect();
                if let Some(value) = ctx.store.get_str(&key, Some(&ctx.node)) {
                    env.insert(key[prefix.len()].to_string(), value);
                }
            }
        }
        // run-level and node-level environment take precedence
        env.extend(ctx.option_env());
        env
    }
}

impl Task for ExecTask {
    fn tool(&self) -> &str {
        &self.tool
    }

    fn task(&self) -> &str {
        &self.task
    }

    fn parse_version(&self, ctx: &TaskContext<'_>, output: &str) -> Option<String> {
        let pattern = ctx
            .store
            .get_str(&["tool", self.tool.as_str(), "version_pattern"], None);
        match pattern.map(|p| Regex::new(&p)) {
            Some(Ok(re)) => re
                .captures(output)
                .and_then(|c| c.get(1).or_else(|| c.get(0)))
                .map(|m| m.as_str().to_string()),
            Some(Err(e)) => {
                warn!(tool = %self.tool, "Invalid version pattern: {}", e);
                None
            }
            None => output
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
        }
    }

    fn required_inputs(&self, ctx: &TaskContext<'_>) -> Vec<String> {
        ctx.store.get_str_list(&self.task_key("input"), Some(&ctx.node))
    }

    fn runtime_options(&self, ctx: &TaskContext<'_>) -> Result<Vec<String>> {
        let mut args = ctx.store.get_str_list(&self.task_key("args"), Some(&ctx.node));
        args.extend(ctx.def()?.args.iter().cloned());
        Ok(args)
    }

    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<RunPlan> {
        let program = ctx
            .store
            .get_str(&["tool", self.tool.as_str(), "exe"], Some(&ctx.node))
            .ok_or_else(|| ChipFlowError::UnknownTask {
                tool: self.tool.clone(),
                task: self.task.clone(),
            })?;
        let args = self.runtime_options(ctx)?;
        debug!(node = %ctx.node, "Prepared {} {:?}", program, args);

        Ok(RunPlan::Exec(ToolCommand {
            program,
            args,
            env: self.env_for(ctx),
            workdir: ctx.workdir(),
            timeout: ctx.timeout(),
        }))
    }

    /// Every declared output must have been produced
    fn post_process(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let outputs_dir = ctx.layout.outputs_dir(&ctx.node);
        for output in ctx.store.get_str_list(&self.task_key("output"), Some(&ctx.node)) {
            if !outputs_dir.join(&output).exists() {
                return Err(ChipFlowError::Validation(format!(
                    "{} did not produce outputs/{}",
                    ctx.node, output
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowgraph::{Flowgraph, NodeDef};
    use crate::layout::JobLayout;
    use crate::models::NodeId;
    use crate::store::ConfigStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fixture() -> (Flowgraph, ConfigStore, NodeId) {
        let node = NodeId::new("syn", "0");
        let mut def = NodeDef::new(node.clone(), "yosys", "syn");
        def.args = vec!["-q".to_string()];
        let mut graph = Flowgraph::new("asicflow");
        graph.node(def).unwrap();

        let mut store = ConfigStore::new();
        store.set(&["tool", "yosys", "exe"], "/usr/bin/yosys", None);
        store.set(&["tool", "yosys", "version_pattern"], r"Yosys (\S+)", None);
        store.set(&["tool", "yosys", "env", "YOSYS_HOME"], "/opt/yosys", None);
        store.set(&["tool", "yosys", "task", "syn", "args"], serde_json::json!(["-s", "syn.ys"]), None);
        store.set(&["tool", "yosys", "task", "syn", "env", "ABC"], "1", None);
        store.set(&["tool", "yosys", "task", "syn", "output"], serde_json::json!(["heartbeat.vg"]), None);
        store.set(&["option", "env", "ABC"], "2", Some(&node));
        store.set(&["option", "timeout"], 30, None);
        (graph, store, node)
    }

    #[test]
    fn test_run_builds_command() {
        let (graph, mut store, node) = fixture();
        let layout = JobLayout::new("build", "heartbeat", "job0");
        let mut ctx = TaskContext::new(node, &graph, &mut store, &layout);

        let task = ExecTask::new("yosys", "syn");
        let RunPlan::Exec(cmd) = task.run(&mut ctx).unwrap() else {
            panic!("expected an external command");
        };
        assert_eq!(cmd.program, "/usr/bin/yosys");
        assert_eq!(cmd.args, vec!["-s", "syn.ys", "-q"]);
        assert_eq!(cmd.env.get("YOSYS_HOME").map(String::as_str), Some("/opt/yosys"));
        assert_eq!(cmd.env.get("ABC").map(String::as_str), Some("2"));
        assert_eq!(cmd.timeout, Some(Duration::from_secs(30)));
        assert!(cmd.workdir.ends_with("syn/0"));
    }

    #[test]
    fn test_parse_version_with_pattern() {
        let (graph, mut store, node) = fixture();
        let layout = JobLayout::new("build", "heartbeat", "job0");
        let ctx = TaskContext::new(node, &graph, &mut store, &layout);

        let task = ExecTask::new("yosys", "syn");
        assert_eq!(
            task.parse_version(&ctx, "Yosys 0.38+92 (git sha1 84116c9)\n").as_deref(),
            Some("0.38+92")
        );
        assert_eq!(task.parse_version(&ctx, "no version here"), None);
    }

    #[test]
    fn test_post_process_checks_outputs() {
        let dir = TempDir::new().unwrap();
        let (graph, mut store, node) = fixture();
        let layout = JobLayout::new(dir.path(), "heartbeat", "job0");
        layout.prepare_workdir(&node).unwrap();
        let mut ctx = TaskContext::new(node.clone(), &graph, &mut store, &layout);

        let task = ExecTask::new("yosys", "syn");
        assert!(task.post_process(&mut ctx).is_err());
        std::fs::write(layout.outputs_dir(&node).join("heartbeat.vg"), "module").unwrap();
        assert!(task.post_process(&mut ctx).is_ok());
    }
}
