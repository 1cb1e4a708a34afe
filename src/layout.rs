//! Working-directory layout of a job
//!
//! `<builddir>/<design>/<job>/<step>/<index>/{inputs,outputs,reports}/`

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::manifest::ManifestFormat;
use crate::models::NodeId;
use crate::store::ConfigStore;

pub const INPUTS_DIR: &str = "inputs";
pub const OUTPUTS_DIR: &str = "outputs";
pub const REPORTS_DIR: &str = "reports";
pub const REPLAY_SCRIPT: &str = "replay.sh";
/// Output of the worker process itself, separate from the tool log
pub const WORKER_LOG: &str = "node.log";
pub const METRICS_FILE: &str = "metrics.prom";

#[derive(Debug, Clone)]
pub struct JobLayout {
    builddir: PathBuf,
    design: String,
    job: String,
}

impl JobLayout {
    pub fn new(builddir: impl Into<PathBuf>, design: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            builddir: builddir.into(),
            design: design.into(),
            job: job.into(),
        }
    }

    /// Layout described by the `option,builddir/design/jobname` keys
    pub fn from_store(store: &ConfigStore) -> Self {
        Self::new(
            store
                .get_str(&["option", "builddir"], None)
                .unwrap_or_else(|| crate::models::DEFAULT_BUILDDIR.to_string()),
            store.get_str(&["option", "design"], None).unwrap_or_default(),
            store
                .get_str(&["option", "jobname"], None)
                .unwrap_or_else(|| crate::models::DEFAULT_JOBNAME.to_string()),
        )
    }

    /// Same design and build directory, different job
    pub fn for_job(&self, job: &str) -> Self {
        Self::new(self.builddir.clone(), self.design.clone(), job)
    }

    pub fn design(&self) -> &str {
        &self.design
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn jobdir(&self) -> PathBuf {
        self.builddir.join(&self.design).join(&self.job)
    }

    pub fn workdir(&self, node: &NodeId) -> PathBuf {
        self.jobdir().join(&node.step).join(&node.index)
    }

    pub fn inputs_dir(&self, node: &NodeId) -> PathBuf {
        self.workdir(node).join(INPUTS_DIR)
    }

    pub fn outputs_dir(&self, node: &NodeId) -> PathBuf {
        self.workdir(node).join(OUTPUTS_DIR)
    }

    pub fn reports_dir(&self, node: &NodeId) -> PathBuf {
        self.workdir(node).join(REPORTS_DIR)
    }

    pub fn input_manifest(&self, node: &NodeId) -> PathBuf {
        self.inputs_dir(node).join(self.manifest_name())
    }

    pub fn output_manifest(&self, node: &NodeId) -> PathBuf {
        self.outputs_dir(node).join(self.manifest_name())
    }

    /// Tool log of a node, `<step>.log`
    pub fn tool_log(&self, node: &NodeId) -> PathBuf {
        self.workdir(node).join(format!("{}.log", node.step))
    }

    /// Log-scan report, `<step>.<suffix>`
    pub fn report(&self, node: &NodeId, suffix: &str) -> PathBuf {
        self.workdir(node).join(format!("{}.{}", node.step, suffix))
    }

    pub fn replay_script(&self, node: &NodeId) -> PathBuf {
        self.workdir(node).join(REPLAY_SCRIPT)
    }

    pub fn worker_log(&self, node: &NodeId) -> PathBuf {
        self.workdir(node).join(WORKER_LOG)
    }

    pub fn job_manifest(&self, format: ManifestFormat) -> PathBuf {
        self.jobdir().join(format!("{}.{}", self.design, format.extension()))
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.jobdir().join(METRICS_FILE)
    }

    fn manifest_name(&self) -> String {
        format!("{}.{}", self.design, ManifestFormat::Json.extension())
    }

    /// Drop whatever a previous attempt left in a node's working directory
    pub fn remove_workdir(&self, node: &NodeId) -> Result<()> {
        let workdir = self.workdir(node);
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir)?;
        }
        Ok(())
    }

    /// Create a fresh working directory for a node, removing leftovers of a
    /// previous attempt
    pub fn prepare_workdir(&self, node: &NodeId) -> Result<PathBuf> {
        self.remove_workdir(node)?;
        let workdir = self.workdir(node);
        for dir in [INPUTS_DIR, OUTPUTS_DIR, REPORTS_DIR] {
            std::fs::create_dir_all(workdir.join(dir))?;
        }
        Ok(workdir)
    }

    pub fn builddir(&self) -> &Path {
        &self.builddir
    }
}

/// Recursively copy the contents of `from` into `to`, skipping entries whose
/// file name is listed in `exclude`
pub fn copy_dir_contents(from: &Path, to: &Path, exclude: &[&str]) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if exclude.iter().any(|e| name == *e) {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir_contents(&entry.path(), &target, &[])?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let layout = JobLayout::new("build", "heartbeat", "job0");
        let node = NodeId::new("floorplan", "2");
        assert_eq!(layout.workdir(&node), PathBuf::from("build/heartbeat/job0/floorplan/2"));
        assert_eq!(
            layout.output_manifest(&node),
            PathBuf::from("build/heartbeat/job0/floorplan/2/outputs/heartbeat.json")
        );
        assert_eq!(layout.tool_log(&node), PathBuf::from("build/heartbeat/job0/floorplan/2/floorplan.log"));
        assert_eq!(
            layout.job_manifest(ManifestFormat::Yaml),
            PathBuf::from("build/heartbeat/job0/heartbeat.yaml")
        );
        assert_eq!(layout.for_job("job1").jobdir(), PathBuf::from("build/heartbeat/job1"));
    }

    #[test]
    fn test_prepare_workdir_resets_contents() {
        let dir = TempDir::new().unwrap();
        let layout = JobLayout::new(dir.path(), "heartbeat", "job0");
        let node = NodeId::new("syn", "0");

        let workdir = layout.prepare_workdir(&node).unwrap();
        std::fs::write(workdir.join("outputs").join("stale.v"), "old").unwrap();
        layout.prepare_workdir(&node).unwrap();

        assert!(layout.inputs_dir(&node).is_dir());
        assert!(layout.reports_dir(&node).is_dir());
        assert!(!layout.outputs_dir(&node).join("stale.v").exists());
    }

    #[test]
    fn test_remove_workdir() {
        let dir = TempDir::new().unwrap();
        let layout = JobLayout::new(dir.path(), "heartbeat", "job0");
        let node = NodeId::new("syn", "0");

        layout.remove_workdir(&node).unwrap();
        layout.prepare_workdir(&node).unwrap();
        std::fs::write(layout.output_manifest(&node), "{}").unwrap();
        layout.remove_workdir(&node).unwrap();

        assert!(!layout.workdir(&node).exists());
        assert!(!layout.output_manifest(&node).exists());
    }

    #[test]
    fn test_copy_dir_contents_with_exclusions() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("from");
        std::fs::create_dir_all(from.join("sub")).unwrap();
        std::fs::write(from.join("heartbeat.v"), "module").unwrap();
        std::fs::write(from.join("heartbeat.json"), "{}").unwrap();
        std::fs::write(from.join("sub").join("a.sdc"), "clock").unwrap();

        let to = dir.path().join("to");
        copy_dir_contents(&from, &to, &["heartbeat.json"]).unwrap();
        assert!(to.join("heartbeat.v").exists());
        assert!(to.join("sub").join("a.sdc").exists());
        assert!(!to.join("heartbeat.json").exists());
    }
}
