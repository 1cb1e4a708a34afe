//! Prometheus metrics for scheduler runs
//!
//! Each scheduler owns a registry. After a run the registry is rendered in
//! the text exposition format to `<jobdir>/metrics.prom`, where a node
//! exporter textfile collector can pick it up.
//!
//! # Available Metrics
//!
//! - `chipflow_runs_total{flow, status}` - Counter of scheduler runs
//! - `chipflow_node_runs_total{flow, step, status}` - Counter of finished nodes
//! - `chipflow_node_duration_seconds{flow, step}` - Histogram of node wall time
//! - `chipflow_active_nodes` - Gauge of currently running workers

use prometheus::{CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

/// Bucket boundaries for node durations in seconds; EDA steps range from
/// seconds to many hours
const NODE_DURATION_BUCKETS: &[f64] = &[1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 4.0 * 3600.0, 12.0 * 3600.0];

#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Arc<Registry>,
    runs: CounterVec,
    node_runs: CounterVec,
    node_duration: HistogramVec,
    active_nodes: Gauge,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs = CounterVec::new(
            Opts::new("chipflow_runs_total", "Total number of scheduler runs"),
            &["flow", "status"],
        )?;
        let node_runs = CounterVec::new(
            Opts::new("chipflow_node_runs_total", "Total number of finished nodes"),
            &["flow", "step", "status"],
        )?;
        let node_duration = HistogramVec::new(
            HistogramOpts::new("chipflow_node_duration_seconds", "Node wall time in seconds")
                .buckets(NODE_DURATION_BUCKETS.to_vec()),
            &["flow", "step"],
        )?;
        let active_nodes = Gauge::with_opts(Opts::new("chipflow_active_nodes", "Currently running workers"))?;

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(node_runs.clone()))?;
        registry.register(Box::new(node_duration.clone()))?;
        registry.register(Box::new(active_nodes.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            runs,
            node_runs,
            node_duration,
            active_nodes,
        })
    }

    pub fn node_started(&self) {
        self.active_nodes.inc();
    }

    /// Record a node reaching a terminal status after `duration_secs` of
    /// wall time
    pub fn node_finished(&self, flow: &str, step: &str, status: &str, duration_secs: f64) {
        self.active_nodes.dec();
        self.node_runs.with_label_values(&[flow, step, status]).inc();
        self.node_duration.with_label_values(&[flow, step]).observe(duration_secs);
    }

    /// Record a node decided without launching a worker
    pub fn node_resolved(&self, flow: &str, step: &str, status: &str) {
        self.node_runs.with_label_values(&[flow, step, status]).inc();
    }

    pub fn run_finished(&self, flow: &str, status: &str) {
        self.runs.with_label_values(&[flow, status]).inc();
    }

    pub fn active_nodes(&self) -> f64 {
        self.active_nodes.get()
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render()?)?;
        Ok(())
    }
}
