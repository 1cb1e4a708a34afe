//! Runtime settings
//!
//! Settings are layered: built-in defaults, then an optional `chipflow.toml`
//! (or an explicit `--config` file), then `CHIPFLOW__*` environment
//! variables, e.g. `CHIPFLOW__KILL_GRACE_SECS=30`.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{DispatcherSet, LocalDispatcher, SshDispatcher, SshTarget};
use crate::error::Result;
use crate::manifest::ManifestFormat;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 10;
pub const DEFAULT_HISTORY_DB: &str = "chipflow.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite job history
    pub history_db: PathBuf,
    /// Scheduler tick
    pub poll_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL when stopping workers or tools
    pub kill_grace_secs: u64,
    /// Encoding of the consolidated job manifest, JSON is always written too
    pub manifest_format: ManifestFormat,
    /// Hosts nodes can be deferred to with `remote: <name>`
    pub remote: BTreeMap<String, SshTarget>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_db: PathBuf::from(DEFAULT_HISTORY_DB),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
            manifest_format: ManifestFormat::Json,
            remote: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from `./chipflow.toml` when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("chipflow").required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("CHIPFLOW")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Local dispatcher for this executable plus one SSH dispatcher per
    /// configured remote
    pub fn dispatchers(&self) -> Result<DispatcherSet> {
        let mut set = DispatcherSet::new(Arc::new(LocalDispatcher::current()?));
        for (name, target) in &self.remote {
            set = set.with_remote(name.clone(), Arc::new(SshDispatcher::new(target.clone())?));
        }
        Ok(set)
    }
}
