//! Append-only SQLite job history
//!
//! Every finished run appends its consolidated manifest, keyed by job name,
//! so a later job can consume a previous job's results without re-running it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ChipFlowError, Result};
use crate::manifest::{decode, encode, ManifestFormat};
use crate::models::{NodeId, NodeStatus};
use crate::record::{self, field, metric};
use crate::store::ConfigStore;

/// One recorded run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEntry {
    pub id: i64,
    pub design: String,
    pub job: String,
    pub flow: String,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}

/// Final state of one node in a recorded run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRunEntry {
    pub step: String,
    pub index: String,
    pub status: String,
    pub exit_code: Option<i64>,
    pub tasktime: Option<f64>,
}

#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Self::with_connection(conn)
    }

    /// In-memory database for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let history = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        history.init_schema()?;
        Ok(history)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChipFlowError::Other("history database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                design TEXT NOT NULL,
                job TEXT NOT NULL,
                flow TEXT NOT NULL,
                status TEXT NOT NULL,
                recorded_at TIMESTAMP NOT NULL,
                manifest TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_runs (
                job_id INTEGER NOT NULL,
                step TEXT NOT NULL,
                idx TEXT NOT NULL,
                status TEXT NOT NULL,
                exit_code INTEGER,
                tasktime REAL,
                FOREIGN KEY (job_id) REFERENCES jobs(id)
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_job ON jobs(job, id DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_design_job ON jobs(design, job, id DESC);
            CREATE INDEX IF NOT EXISTS idx_node_runs_job ON node_runs(job_id);
            ",
        )?;
        Ok(())
    }

    /// Append a finished run. Returns the new job id.
    pub fn record_job(
        &self,
        store: &ConfigStore,
        flow: &str,
        statuses: &BTreeMap<NodeId, NodeStatus>,
        status: &str,
    ) -> Result<i64> {
        let design = store.get_str(&["option", "design"], None).unwrap_or_default();
        let job = store
            .get_str(&["option", "jobname"], None)
            .unwrap_or_else(|| crate::models::DEFAULT_JOBNAME.to_string());
        let manifest = encode(store, ManifestFormat::Json)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (design, job, flow, status, recorded_at, manifest) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![design, job, flow, status, Utc::now(), manifest],
        )?;
        let job_id = tx.last_insert_rowid();

        for (node, node_status) in statuses {
            let exit_code = record::get_record(store, node, field::EXIT_CODE).and_then(|v| v.as_i64());
            let tasktime = record::get_metric(store, node, metric::TASK_TIME);
            tx.execute(
                "INSERT INTO node_runs (job_id, step, idx, status, exit_code, tasktime) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![job_id, node.step, node.index, node_status.as_str(), exit_code, tasktime],
            )?;
        }
        tx.commit()?;
        Ok(job_id)
    }

    /// Newest consolidated manifest recorded for a design's job
    pub fn latest(&self, design: &str, job: &str) -> Result<Option<ConfigStore>> {
        let conn = self.lock()?;
        let manifest: Option<String> = conn
            .query_row(
                "SELECT manifest FROM jobs WHERE design = ?1 AND job = ?2 ORDER BY id DESC LIMIT 1",
                params![design, job],
                |row| row.get(0),
            )
            .optional()?;
        manifest.map(|text| decode(&text)).transpose()
    }

    /// Recorded runs, newest first
    pub fn list_jobs(&self, job: Option<&str>, limit: usize) -> Result<Vec<JobEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, design, job, flow, status, recorded_at FROM jobs
             WHERE ?1 IS NULL OR job = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job, limit as i64], |row| {
            Ok(JobEntry {
                id: row.get(0)?,
                design: row.get(1)?,
                job: row.get(2)?,
                flow: row.get(3)?,
                status: row.get(4)?,
                recorded_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn node_runs(&self, job_id: i64) -> Result<Vec<NodeRunEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT step, idx, status, exit_code, tasktime FROM node_runs
             WHERE job_id = ?1 ORDER BY step, idx",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok(NodeRunEntry {
                step: row.get(0)?,
                index: row.get(1)?,
                status: row.get(2)?,
                exit_code: row.get(3)?,
                tasktime: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_store(job: &str, area: f64) -> (ConfigStore, BTreeMap<NodeId, NodeStatus>) {
        finished_design("heartbeat", job, area)
    }

    fn finished_design(design: &str, job: &str, area: f64) -> (ConfigStore, BTreeMap<NodeId, NodeStatus>) {
        let syn = NodeId::new("syn", "0");
        let mut store = ConfigStore::new();
        store.set(&["option", "design"], design, None);
        store.set(&["option", "jobname"], job, None);
        store.set(&["flowgraph", "asicflow", "status"], "success", Some(&syn));
        record::set_record(&mut store, &syn, field::EXIT_CODE, 0);
        record::set_metric(&mut store, &syn, metric::TASK_TIME, 4.5);
        record::set_metric(&mut store, &syn, "area", area);
        let statuses = BTreeMap::from([(syn, NodeStatus::Success)]);
        (store, statuses)
    }

    #[test]
    fn test_record_and_latest() {
        let history = HistoryStore::in_memory().unwrap();
        assert!(history.latest("heartbeat", "job0").unwrap().is_none());

        let (store, statuses) = finished_store("job0", 120.0);
        history.record_job(&store, "asicflow", &statuses, "success").unwrap();
        let (store, statuses) = finished_store("job0", 80.0);
        let id = history.record_job(&store, "asicflow", &statuses, "success").unwrap();

        let latest = history.latest("heartbeat", "job0").unwrap().unwrap();
        assert_eq!(record::get_metric(&latest, &NodeId::new("syn", "0"), "area"), Some(80.0));

        let runs = history.node_runs(id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "success");
        assert_eq!(runs[0].exit_code, Some(0));
        assert_eq!(runs[0].tasktime, Some(4.5));
    }

    #[test]
    fn test_latest_keeps_designs_apart() {
        let history = HistoryStore::in_memory().unwrap();
        let (store, statuses) = finished_design("heartbeat", "job0", 120.0);
        history.record_job(&store, "asicflow", &statuses, "success").unwrap();
        let (store, statuses) = finished_design("counter", "job0", 80.0);
        history.record_job(&store, "asicflow", &statuses, "success").unwrap();

        let latest = history.latest("heartbeat", "job0").unwrap().unwrap();
        assert_eq!(record::get_metric(&latest, &NodeId::new("syn", "0"), "area"), Some(120.0));
        assert!(history.latest("gcd", "job0").unwrap().is_none());
    }

    #[test]
    fn test_list_jobs_filters_by_name() {
        let history = HistoryStore::in_memory().unwrap();
        for job in ["job0", "job1", "job0"] {
            let (store, statuses) = finished_store(job, 1.0);
            history.record_job(&store, "asicflow", &statuses, "success").unwrap();
        }

        assert_eq!(history.list_jobs(None, 10).unwrap().len(), 3);
        let job0 = history.list_jobs(Some("job0"), 10).unwrap();
        assert_eq!(job0.len(), 2);
        assert!(job0[0].id > job0[1].id);
        assert_eq!(history.list_jobs(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state/history.db");
        let (store, statuses) = finished_store("job0", 1.0);
        HistoryStore::open(&path)
            .unwrap()
            .record_job(&store, "asicflow", &statuses, "error")
            .unwrap();

        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(reopened.list_jobs(Some("job0"), 10).unwrap()[0].status, "error");
    }
}
