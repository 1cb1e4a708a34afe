//! ChipFlow - Flowgraph execution engine for hardware compilation pipelines

pub mod cli;
pub mod dispatch;
pub mod error;
pub mod flowgraph;
pub mod history;
pub mod layout;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod process;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod status;
pub mod store;
pub mod tasks;
pub mod templates;
