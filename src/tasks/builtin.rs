//! Builtin combinator tasks
//!
//! Builtins run inside the worker and never launch an external tool. They
//! choose among their inputs and forward the chosen inputs' files to their
//! own `outputs/`.

use regex::Regex;
use tracing::{info, warn};

use super::{RunPlan, Task, TaskContext};
use crate::error::{ChipFlowError, Result};
use crate::models::{NodeId, BUILTIN_TOOL};
use crate::record::{self, field};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    /// Pass every usable input through
    Nop,
    /// Merge every usable input
    Join,
    /// Pick the input with the lowest weighted score
    Minimum,
    /// Pick the input with the highest weighted score
    Maximum,
    /// Pick one input by an ordered list of metric comparisons
    Mux,
    /// Fail unless every input meets the metric conditions in `args`
    Verify,
}

impl BuiltinKind {
    pub const ALL: [BuiltinKind; 6] = [
        BuiltinKind::Nop,
        BuiltinKind::Join,
        BuiltinKind::Minimum,
        BuiltinKind::Maximum,
        BuiltinKind::Mux,
        BuiltinKind::Verify,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinKind::Nop => "nop",
            BuiltinKind::Join => "join",
            BuiltinKind::Minimum => "minimum",
            BuiltinKind::Maximum => "maximum",
            BuiltinKind::Mux => "mux",
            BuiltinKind::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Extreme {
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct BuiltinTask {
    kind: BuiltinKind,
}

impl BuiltinTask {
    pub fn new(kind: BuiltinKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> BuiltinKind {
        self.kind
    }
}

impl Task for BuiltinTask {
    fn tool(&self) -> &str {
        BUILTIN_TOOL
    }

    fn task(&self) -> &str {
        self.kind.name()
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parse_version(&self, _ctx: &TaskContext<'_>, _output: &str) -> Option<String> {
        Some(env!("CARGO_PKG_VERSION").to_string())
    }

    fn select_input_nodes(&self, ctx: &TaskContext<'_>) -> Result<Vec<NodeId>> {
        let candidates = ctx.usable_inputs();
        let selected = match self.kind {
            BuiltinKind::Nop | BuiltinKind::Join | BuiltinKind::Verify => candidates,
            BuiltinKind::Minimum => select_weighted(ctx, &candidates, Extreme::Min).into_iter().collect(),
            BuiltinKind::Maximum => select_weighted(ctx, &candidates, Extreme::Max).into_iter().collect(),
            BuiltinKind::Mux => {
                let args = ctx.def()?.args.clone();
                select_mux(ctx, &candidates, &args)?.into_iter().collect()
            }
        };
        Ok(selected)
    }

    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<RunPlan> {
        if self.kind == BuiltinKind::Verify {
            let args = ctx.def()?.args.clone();
            if let Some(reason) = verify(ctx, &args)? {
                warn!(node = %ctx.node, "{}", reason);
                record::set_record(ctx.store, &ctx.node, field::STATUS_REASON, reason);
                return Ok(RunPlan::Done(1));
            }
        }
        ctx.forward_inputs()?;
        Ok(RunPlan::Done(0))
    }
}

/// Weighted selection over normalized metrics.
///
/// Inputs that miss one of their goals (`|metric| > goal`) or lack a weighted
/// metric are discarded. Each weighted metric is normalized over the
/// remaining inputs as `(v - min) / (max - min)`, or `max` when all values
/// are equal. Ties keep the earliest declared input.
fn select_weighted(ctx: &TaskContext<'_>, candidates: &[NodeId], extreme: Extreme) -> Option<NodeId> {
    let mut survivors = Vec::new();
    'candidate: for node in candidates {
        let Some(def) = ctx.graph.get(node) else {
            continue;
        };
        for (metric, goal) in &def.goals {
            match ctx.metric(node, metric) {
                Some(real) if real.abs() > *goal => {
                    warn!(input = %node, metric = %metric, "Input did not meet its goal");
                    continue 'candidate;
                }
                Some(_) => {}
                None => {
                    warn!(input = %node, metric = %metric, "Input has a goal but no metric");
                    continue 'candidate;
                }
            }
        }
        for (metric, weight) in &def.weights {
            if *weight != 0.0 && ctx.metric(node, metric).is_none() {
                warn!(input = %node, metric = %metric, "Input has a weight but no metric");
                continue 'candidate;
            }
        }
        survivors.push((node, def));
    }

    let range = |metric: &str| {
        survivors
            .iter()
            .filter_map(|(node, _)| ctx.metric(node, metric))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
    };

    let mut best: Option<(f64, &NodeId)> = None;
    for (node, def) in &survivors {
        let mut score = 0.0;
        for (metric, weight) in &def.weights {
            if *weight == 0.0 {
                continue;
            }
            let real = ctx.metric(node, metric).unwrap_or_default();
            let (lo, hi) = range(metric.as_str());
            let scaled = if hi - lo != 0.0 { (real - lo) / (hi - lo) } else { hi };
            score += scaled * weight;
        }
        let better = match (best, extreme) {
            (None, _) => true,
            (Some((current, _)), Extreme::Min) => score < current,
            (Some((current, _)), Extreme::Max) => score > current,
        };
        if better {
            best = Some((score, *node));
        }
    }

    if let Some((score, node)) = best {
        info!(node = %ctx.node, winner = %node, score, "Selected input");
    }
    best.map(|(_, node)| node.clone())
}

/// Lexicographic selection: each `minimum(<metric>)` or `maximum(<metric>)`
/// argument narrows the candidates until one remains.
fn select_mux(ctx: &TaskContext<'_>, candidates: &[NodeId], args: &[String]) -> Result<Option<NodeId>> {
    let op_re = Regex::new(r"^(minimum|maximum)\((\w+)\)$")?;
    let mut remaining: Vec<NodeId> = candidates.to_vec();

    for arg in args {
        let caps = op_re.captures(arg.trim()).ok_or_else(|| {
            ChipFlowError::Validation(format!("invalid mux operation '{}'", arg))
        })?;
        let op = &caps[1];
        let metric = &caps[2];

        let values: Vec<(NodeId, f64)> = remaining
            .iter()
            .filter_map(|n| ctx.metric(n, metric).map(|v| (n.clone(), v)))
            .collect();
        let target = if op == "minimum" {
            values.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min)
        } else {
            values.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max)
        };
        let winners: Vec<NodeId> = values
            .into_iter()
            .filter(|(_, v)| *v == target)
            .map(|(n, _)| n)
            .collect();
        if !winners.is_empty() {
            remaining = winners;
        }
        if remaining.len() == 1 {
            break;
        }
    }

    Ok(remaining.into_iter().next())
}

/// Evaluate `<metric><op><value>` conditions against every selected input.
/// Returns the first failure.
fn verify(ctx: &TaskContext<'_>, args: &[String]) -> Result<Option<String>> {
    let cond_re = Regex::new(r"^(\w+)\s*(==|!=|<=|>=|<|>)\s*(\S+)$")?;

    for arg in args {
        let caps = cond_re.captures(arg.trim()).ok_or_else(|| {
            ChipFlowError::Validation(format!("invalid verify condition '{}'", arg))
        })?;
        let metric = &caps[1];
        let op = &caps[2];
        let expected: f64 = caps[3].parse().map_err(|_| {
            ChipFlowError::Validation(format!("invalid number in verify condition '{}'", arg))
        })?;

        for input in &ctx.selected {
            let Some(real) = ctx.metric(input, metric) else {
                return Ok(Some(format!("{input} has no value for metric '{metric}'")));
            };
            let holds = match op {
                "==" => real == expected,
                "!=" => real != expected,
                "<=" => real <= expected,
                ">=" => real >= expected,
                "<" => real < expected,
                _ => real > expected,
            };
            if !holds {
                return Ok(Some(format!("{input} fails {arg} ({metric} = {real})")));
            }
        }
    }
    Ok(None)
}
