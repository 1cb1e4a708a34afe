//! CLI interface for ChipFlow

use crate::error::ChipFlowError;
use crate::flowgraph::Flowgraph;
use crate::history::HistoryStore;
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::manifest::read_manifest;
use crate::models::NodeId;
use crate::parser::{load_store, parse_flow_file};
use crate::record::RunRecord;
use crate::runner::{exit_code_for, NodeRunner};
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::settings::Settings;
use crate::store::ConfigStore;
use crate::tasks::TaskRegistry;
use crate::templates;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// ChipFlow - Flowgraph execution engine for hardware compilation pipelines
#[derive(Parser, Debug)]
#[command(name = "chipflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Flowgraph execution engine for hardware compilation pipelines", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    pub log_format: String,

    /// Settings file (defaults to ./chipflow.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Job history database, overrides the settings file
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a flow
    Run {
        /// Path to flow YAML file
        flow: PathBuf,

        /// Start from these steps
        #[arg(long)]
        from: Vec<String>,

        /// Stop after these steps
        #[arg(long)]
        to: Vec<String>,

        /// Remove a node (`step/index`) from the flowgraph for this run
        #[arg(long)]
        prune: Vec<NodeId>,

        /// Keep nodes whose previous run succeeded with unchanged settings
        #[arg(long)]
        resume: bool,

        /// Remove the job directory first
        #[arg(long)]
        clean: bool,

        /// Override the job name
        #[arg(short, long)]
        jobname: Option<String>,
    },

    /// Validate a flow file and its flowgraph
    Validate {
        /// Path to flow YAML file
        flow: PathBuf,
    },

    /// Show per-node results stored in a job or node manifest
    Status {
        /// Path to a manifest (`<jobdir>/<design>.json`)
        manifest: PathBuf,
    },

    /// Show recorded jobs
    History {
        /// Job name filter
        #[arg(short, long)]
        job: Option<String>,

        /// Show the nodes of one recorded run
        #[arg(long)]
        id: Option<i64>,

        /// Number of records to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Generate example flow YAML templates
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a single node from its input manifest (worker entry point)
    #[command(hide = true)]
    RunNode {
        /// Input manifest prepared by the controller
        #[arg(long)]
        cfg: PathBuf,

        #[arg(long)]
        step: String,

        #[arg(long)]
        index: String,

        /// Time between SIGTERM and SIGKILL for the tool
        #[arg(long, default_value = "10")]
        kill_grace_secs: u64,
    },
}

/// Available template types for the `template` subcommand.
#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateType {
    /// Two shell steps in a line
    Minimal,
    /// Fan-out over floorplan variants with metric-based selection
    Parallel,
    /// Remote synthesis and cross-job inputs
    Remote,
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let log_level: LogLevel = self.log_level.as_str().into();
        let log_format: LogFormat = self.log_format.as_str().into();

        let config = LogConfig {
            level: log_level,
            format: log_format,
        };

        init_logging(&config)
    }

    /// Execute the CLI command. Returns the process exit code.
    pub async fn execute(&self) -> anyhow::Result<i32> {
        match &self.command {
            Commands::Run {
                flow,
                from,
                to,
                prune,
                resume,
                clean,
                jobname,
            } => {
                let overrides = RunOverrides {
                    from,
                    to,
                    prune,
                    resume: *resume,
                    clean: *clean,
                    jobname: jobname.as_deref(),
                };
                return self.run_flow(flow, overrides).await;
            }
            Commands::Validate { flow } => {
                self.validate_flow(flow)?;
            }
            Commands::Status { manifest } => {
                self.show_status(manifest)?;
            }
            Commands::History { job, id, limit } => {
                self.show_history(job.as_deref(), *id, *limit)?;
            }
            Commands::Template {
                template_type,
                output,
            } => {
                self.handle_template(template_type.as_ref(), output.as_ref())?;
            }
            Commands::RunNode {
                cfg,
                step,
                index,
                kill_grace_secs,
            } => {
                return self.run_node(cfg, step, index, *kill_grace_secs).await;
            }
        }
        Ok(0)
    }

    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(db_path) = &self.db_path {
            settings.history_db = db_path.clone();
        }
        Ok(settings)
    }

    /// Run a flow to completion
    async fn run_flow(&self, flow_path: &Path, overrides: RunOverrides<'_>) -> anyhow::Result<i32> {
        info!("Loading flow from: {:?}", flow_path);

        let config = parse_flow_file(flow_path)?;
        let mut store = load_store(&config)?;
        overrides.apply(&mut store);
        info!("Design '{}' flow '{}' loaded successfully", config.design, config.flow);

        let settings = self.settings()?;
        let mut scheduler = Scheduler::new(
            store,
            TaskRegistry::with_builtins(),
            settings.dispatchers()?,
            SchedulerOptions::from_settings(&settings),
        )?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping running nodes");
                let _ = shutdown_tx.send(true);
            }
        });

        let outcome = scheduler.run(shutdown_rx).await;
        print_status_table(scheduler.store(), scheduler.graph());

        match outcome {
            Ok(summary) => {
                info!("Flow completed successfully");
                println!("Manifest: {}", summary.manifest.display());
                Ok(0)
            }
            Err(e) if e.is_structural() => Err(e.into()),
            Err(e) => {
                error!("Flow failed: {}", e);
                eprintln!("{}", e);
                Ok(1)
            }
        }
    }

    /// Validate a flow without executing
    fn validate_flow(&self, flow_path: &Path) -> anyhow::Result<()> {
        info!("Validating flow: {:?}", flow_path);

        let config = parse_flow_file(flow_path)?;
        let store = load_store(&config)?;
        let graph = Flowgraph::from_store(&store, &config.flow)?;
        graph.validate()?;

        let prune: BTreeSet<NodeId> = config.options.prune.iter().cloned().collect();
        graph.validate_runtime(&config.options.from, &config.options.to, &prune)?;
        TaskRegistry::with_builtins().resolve_flow(&graph, &store)?;

        info!("Flow validation successful");

        println!("Flow '{}' of design '{}' is valid", config.flow, config.design);
        println!("Nodes: {}", graph.len());
        for (level, nodes) in graph.execution_levels().iter().enumerate() {
            let names: Vec<String> = nodes.iter().map(NodeId::to_string).collect();
            println!("  {:>3}: {}", level, names.join(" "));
        }

        Ok(())
    }

    /// Handle the `template` subcommand.
    fn handle_template(&self, template_type: Option<&TemplateType>, output: Option<&PathBuf>) -> anyhow::Result<()> {
        let Some(tt) = template_type else {
            println!("Available templates:\n");
            let header_type = "TYPE";
            let header_desc = "DESCRIPTION";
            println!("{header_type:<12} {header_desc}");
            println!("{}", "-".repeat(72));
            for info in templates::list_templates() {
                println!("{:<12} {}", info.name, info.description);
            }
            println!();
            println!("Usage: chipflow template --type <TYPE> [-o <FILE>]");
            return Ok(());
        };

        let type_name = match tt {
            TemplateType::Minimal => "minimal",
            TemplateType::Parallel => "parallel",
            TemplateType::Remote => "remote",
        };

        let content = templates::get_template(type_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", type_name))?;

        if let Some(path) = output {
            use std::fs::OpenOptions;
            use std::io::Write as _;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        anyhow::anyhow!(
                            "File '{}' already exists. Remove it first or choose a different name.",
                            path.display()
                        )
                    } else {
                        e.into()
                    }
                })?;
            file.write_all(content.as_bytes())?;
            println!("Template written to {}", path.display());
        } else {
            print!("{content}");
        }

        Ok(())
    }

    /// Show the run records held in a manifest
    fn show_status(&self, manifest: &Path) -> anyhow::Result<()> {
        let store = read_manifest(manifest)?;
        let flow = store
            .get_str(&["option", "flow"], None)
            .ok_or_else(|| ChipFlowError::Validation(format!("{} names no flow", manifest.display())))?;
        let graph = Flowgraph::from_store(&store, &flow)?;

        println!("Design: {}", store.get_str(&["option", "design"], None).unwrap_or_default());
        println!("Job: {}", store.get_str(&["option", "jobname"], None).unwrap_or_default());
        println!("Flow: {}", flow);
        println!();
        print_status_table(&store, &graph);

        for node in graph.topological_order()? {
            let record = RunRecord::load(&store, &flow, &node);
            if !record.selected.is_empty() {
                println!("{} selected {}", record.node, record.selected.join(", "));
            }
        }

        Ok(())
    }

    /// Show recorded jobs, or the nodes of one recorded run
    fn show_history(&self, job: Option<&str>, id: Option<i64>, limit: usize) -> anyhow::Result<()> {
        let settings = self.settings()?;
        let history = HistoryStore::open(&settings.history_db)?;

        if let Some(id) = id {
            let runs = history.node_runs(id)?;
            if runs.is_empty() {
                println!("No nodes recorded for run {}", id);
                return Ok(());
            }
            println!("{:<24} {:<10} {:<6} {:<12}", "NODE", "STATUS", "EXIT", "TASKTIME");
            println!("{:-<56}", "");
            for run in runs {
                println!(
                    "{:<24} {:<10} {:<6} {:<12}",
                    format!("{}/{}", run.step, run.index),
                    run.status,
                    run.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                    run.tasktime.map(format_seconds).unwrap_or_else(|| "-".to_string()),
                );
            }
            return Ok(());
        }

        let jobs = history.list_jobs(job, limit)?;
        if jobs.is_empty() {
            println!("No job history found");
            return Ok(());
        }

        println!(
            "{:<8} {:<16} {:<12} {:<12} {:<10} {:<20}",
            "ID", "DESIGN", "JOB", "FLOW", "STATUS", "RECORDED"
        );
        println!("{:-<82}", "");
        for entry in jobs {
            let recorded = entry
                .recorded_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S");
            println!(
                "{:<8} {:<16} {:<12} {:<12} {:<10} {:<20}",
                entry.id, entry.design, entry.job, entry.flow, entry.status, recorded
            );
        }

        Ok(())
    }

    /// Worker entry point: run one node and exit with a code matching its
    /// final status
    async fn run_node(&self, cfg: &Path, step: &str, index: &str, kill_grace_secs: u64) -> anyhow::Result<i32> {
        use tokio::signal::unix::{signal, SignalKind};

        let node = NodeId::new(step, index);
        info!(node = %node, "Worker starting from {:?}", cfg);

        // registered before the tool starts so an early SIGTERM is not lost
        let mut terminate = signal(SignalKind::terminate())?;
        let shutdown = async move {
            tokio::select! {
                _ = terminate.recv() => warn!("SIGTERM received"),
                _ = tokio::signal::ctrl_c() => warn!("Interrupt received"),
            }
        };

        let runner = NodeRunner::load(
            cfg,
            node,
            &TaskRegistry::with_builtins(),
            Duration::from_secs(kill_grace_secs),
        )?;
        let status = runner.run(shutdown).await?;
        Ok(exit_code_for(status))
    }
}

/// Command-line overrides of the run options in a flow file
struct RunOverrides<'a> {
    from: &'a [String],
    to: &'a [String],
    prune: &'a [NodeId],
    resume: bool,
    clean: bool,
    jobname: Option<&'a str>,
}

impl RunOverrides<'_> {
    fn apply(&self, store: &mut ConfigStore) {
        if !self.from.is_empty() {
            store.set(&["option", "from"], json!(self.from), None);
        }
        if !self.to.is_empty() {
            store.set(&["option", "to"], json!(self.to), None);
        }
        if !self.prune.is_empty() {
            let prune: Vec<String> = self.prune.iter().map(NodeId::to_string).collect();
            store.set(&["option", "prune"], json!(prune), None);
        }
        if self.resume {
            store.set(&["option", "resume"], true, None);
        }
        if self.clean {
            store.set(&["option", "clean"], true, None);
        }
        if let Some(job) = self.jobname {
            store.set(&["option", "jobname"], job, None);
        }
    }
}

fn print_status_table(store: &ConfigStore, graph: &Flowgraph) {
    let Ok(order) = graph.topological_order() else {
        return;
    };

    println!(
        "{:<24} {:<10} {:<6} {:<12} {:<8} {:<8}",
        "NODE", "STATUS", "EXIT", "TASKTIME", "ERRORS", "WARNINGS"
    );
    println!("{:-<72}", "");
    for node in order {
        let record = RunRecord::load(store, graph.name(), &node);
        let count = |v: Option<f64>| v.map(|n| format!("{}", n as u64)).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<10} {:<6} {:<12} {:<8} {:<8}",
            record.node,
            record.status.as_deref().unwrap_or("-"),
            record.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            record.task_time.map(format_seconds).unwrap_or_else(|| "-".to_string()),
            count(record.errors),
            count(record.warnings),
        );
    }
    println!();
}

/// Format seconds to a human-readable string
fn format_seconds(seconds: f64) -> String {
    let whole = seconds as i64;
    if whole < 60 {
        format!("{:.1}s", seconds)
    } else if whole < 3600 {
        format!("{}m {}s", whole / 60, whole % 60)
    } else {
        format!("{}h {}m {}s", whole / 3600, (whole % 3600) / 60, whole % 60)
    }
}
