//! Per-node run records and metrics
//!
//! Records and metrics live in the configuration store under `record,*` and
//! `metric,*`, always scoped to the node they describe, so they travel with
//! the node's output manifest.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::NodeId;
use crate::store::ConfigStore;

/// Fields written under `record,<field>`
pub mod field {
    pub const START_TIME: &str = "starttime";
    pub const END_TIME: &str = "endtime";
    pub const EXIT_CODE: &str = "exitcode";
    pub const TOOL_VERSION: &str = "toolversion";
    pub const TOOL_PATH: &str = "toolpath";
    pub const TOOL_ARGS: &str = "toolargs";
    pub const RUN_ID: &str = "runid";
    pub const PID: &str = "pid";
    pub const PLATFORM: &str = "platform";
    pub const ARCH: &str = "arch";
    pub const VERSION: &str = "chipflowversion";
    pub const INPUT_NODE: &str = "inputnode";
    pub const STATUS_REASON: &str = "statusreason";
}

/// Metrics the runner always reports
pub mod metric {
    pub const TASK_TIME: &str = "tasktime";
    pub const EXE_TIME: &str = "exetime";
    pub const CPU_TIME: &str = "cputime";
    pub const MEMORY: &str = "memory";
    pub const TOTAL_TIME: &str = "totaltime";
    pub const ERRORS: &str = "errors";
    pub const WARNINGS: &str = "warnings";
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn set_record(store: &mut ConfigStore, node: &NodeId, field: &str, value: impl Into<Value>) {
    store.set(&["record", field], value, Some(node));
}

pub fn get_record(store: &ConfigStore, node: &NodeId, field: &str) -> Option<Value> {
    store.get_exact(&["record", field], Some(node)).cloned()
}

pub fn record_time(store: &mut ConfigStore, node: &NodeId, field: &str, at: DateTime<Utc>) {
    set_record(store, node, field, timestamp(at));
}

/// Record who ran the node and where
pub fn record_environment(store: &mut ConfigStore, node: &NodeId, run_id: &str) {
    set_record(store, node, field::VERSION, env!("CARGO_PKG_VERSION"));
    set_record(store, node, field::PLATFORM, std::env::consts::OS);
    set_record(store, node, field::ARCH, std::env::consts::ARCH);
    set_record(store, node, field::PID, std::process::id());
    set_record(store, node, field::RUN_ID, run_id);
}

pub fn set_metric(store: &mut ConfigStore, node: &NodeId, name: &str, value: impl Into<Value>) {
    store.set(&["metric", name], value, Some(node));
}

pub fn get_metric(store: &ConfigStore, node: &NodeId, name: &str) -> Option<f64> {
    store.get_exact(&["metric", name], Some(node)).and_then(Value::as_f64)
}

/// Add to a counter metric, creating it at zero
pub fn add_metric(store: &mut ConfigStore, node: &NodeId, name: &str, amount: u64) {
    let current = store
        .get_exact(&["metric", name], Some(node))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    set_metric(store, node, name, current + amount);
}

/// Drop every record and metric of a node so a later merge cannot observe
/// values from an earlier run
pub fn clear_node(store: &mut ConfigStore, node: &NodeId) {
    store.clear_node(&["record"], node);
    store.clear_node(&["metric"], node);
}

/// Typed view of a node's run record
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunRecord {
    pub node: String,
    pub status: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: Option<i64>,
    pub tool_version: Option<String>,
    pub selected: Vec<String>,
    pub task_time: Option<f64>,
    pub errors: Option<f64>,
    pub warnings: Option<f64>,
}

impl RunRecord {
    pub fn load(store: &ConfigStore, flow: &str, node: &NodeId) -> Self {
        let text = |f: &str| get_record(store, node, f).and_then(|v| v.as_str().map(str::to_string));
        Self {
            node: node.to_string(),
            status: store.get_str(&["flowgraph", flow, "status"], Some(node)),
            start_time: text(field::START_TIME),
            end_time: text(field::END_TIME),
            exit_code: get_record(store, node, field::EXIT_CODE).and_then(|v| v.as_i64()),
            tool_version: text(field::TOOL_VERSION),
            selected: store
                .get_exact(&["flowgraph", flow, "select"], Some(node))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            task_time: get_metric(store, node, metric::TASK_TIME),
            errors: get_metric(store, node, metric::ERRORS),
            warnings: get_metric(store, node, metric::WARNINGS),
        }
    }
}

/// Record the upstream nodes a node actually used
pub fn record_select(store: &mut ConfigStore, flow: &str, node: &NodeId, selected: &[NodeId]) {
    let selected: Vec<String> = selected.iter().map(NodeId::to_string).collect();
    store.set(&["flowgraph", flow, "select"], json!(selected), Some(node));
}
