//! Built-in flow templates for `chipflow template` subcommand.

/// Metadata for a template type.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value).
    pub name: &'static str,
    /// Short description shown in the listing table.
    pub description: &'static str,
}

/// Returns metadata for every available template.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "minimal",
            description: "Two shell steps in a line",
        },
        TemplateInfo {
            name: "parallel",
            description: "Fan-out over four floorplan variants, best one picked by metric",
        },
        TemplateInfo {
            name: "remote",
            description: "Synthesis deferred to an SSH host, results consumed by a later job",
        },
    ]
}

/// Returns the YAML content for a given template type.
///
/// The `template_type` must be one of: `minimal`, `parallel`, `remote`.
pub fn get_template(template_type: &str) -> Option<&'static str> {
    match template_type {
        "minimal" => Some(TEMPLATE_MINIMAL),
        "parallel" => Some(TEMPLATE_PARALLEL),
        "remote" => Some(TEMPLATE_REMOTE),
        _ => None,
    }
}

const TEMPLATE_MINIMAL: &str = r#"# ChipFlow - Minimal Flow
# import/0 -> syn/0, both running a shell command.
design: heartbeat
flow: asicflow

tools:
  sh:
    exe: /bin/sh

flows:
  asicflow:
    - step: import
      tool: sh
      task: import
      args: ["-c", "echo module heartbeat > outputs/heartbeat.v"]
    - step: syn
      tool: sh
      task: syn
      inputs: [import/0]
      args: ["-c", "cp inputs/heartbeat.v outputs/heartbeat.vg"]
"#;

const TEMPLATE_PARALLEL: &str = r#"# ChipFlow - Parallel Flow
# Four floorplan variants run side by side. The minimum combinator keeps
# the variant with the fewest warnings; a failed variant is simply skipped.
design: heartbeat
flow: asicflow

options:
  timeout: 3600
  env:
    PDK_ROOT: /opt/pdk

tools:
  sh:
    exe: /bin/sh
    tasks:
      floorplan:
        regex:
          errors: ["^ERROR"]
          warnings: ["^WARNING", "-v ignored"]

flows:
  asicflow:
    - { step: import, tool: sh, task: import, args: ["-c", "echo module heartbeat > outputs/heartbeat.v"] }
    - { step: syn, tool: sh, task: syn, inputs: [import/0], args: ["-c", "cp inputs/heartbeat.v outputs/"] }
    - { step: floorplan, index: 0, tool: sh, task: floorplan, inputs: [syn/0], args: ["-c", "cp inputs/* outputs/; echo 'WARNING: density 0.5'"] }
    - { step: floorplan, index: 1, tool: sh, task: floorplan, inputs: [syn/0], args: ["-c", "cp inputs/* outputs/"] }
    - { step: floorplan, index: 2, tool: sh, task: floorplan, inputs: [syn/0], args: ["-c", "cp inputs/* outputs/; echo 'WARNING: density 0.7'; echo 'WARNING: congestion'"] }
    - { step: floorplan, index: 3, tool: sh, task: floorplan, inputs: [syn/0], args: ["-c", "cp inputs/* outputs/"] }
    - step: merge
      tool: builtin
      task: minimum
      inputs: [floorplan/0, floorplan/1, floorplan/2, floorplan/3]
      weights:
        warnings: 1.0
      goals:
        errors: 0
    - { step: export, tool: sh, task: export, inputs: [merge/0], args: ["-c", "cp inputs/* outputs/"] }
"#;

const TEMPLATE_REMOTE: &str = r#"# ChipFlow - Remote Flow
# syn/0 is deferred to the host named `farm` in chipflow.toml:
#
#   [remote.farm]
#   host = "farm01"
#   user = "eda"
#
# The build directory must be on storage shared with the remote host.
# place/0 reads its inputs from the finished job `job0` instead of
# running syn again.
design: heartbeat
jobname: job1
builddir: /shared/build
flow: asicflow

tools:
  sh:
    exe: /bin/sh

flows:
  asicflow:
    - { step: import, tool: sh, task: import, args: ["-c", "echo module heartbeat > outputs/heartbeat.v"] }
    - { step: syn, tool: sh, task: syn, inputs: [import/0], remote: farm, timeout: 7200, args: ["-c", "cp inputs/heartbeat.v outputs/"] }
    - { step: place, tool: sh, task: place, inputs: [syn/0], jobinput: job0, args: ["-c", "cp inputs/* outputs/"] }
"#;
