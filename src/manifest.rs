//! Manifest files: serialized snapshots of the configuration store
//!
//! JSON is the exchange format between the controller and its workers and
//! the only format accepted by [`read_manifest`]. YAML, CSV and TCL are
//! alternate output encodings of the same data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ChipFlowError, Result};
use crate::store::{split_key, ConfigStore};

/// Manifest encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    #[default]
    Json,
    Yaml,
    Csv,
    Tcl,
}

impl ManifestFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ManifestFormat::Json => "json",
            ManifestFormat::Yaml => "yaml",
            ManifestFormat::Csv => "csv",
            ManifestFormat::Tcl => "tcl",
        }
    }

    /// Format implied by a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        ext.parse()
    }
}

impl FromStr for ManifestFormat {
    type Err = ChipFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ManifestFormat::Json),
            "yaml" | "yml" => Ok(ManifestFormat::Yaml),
            "csv" => Ok(ManifestFormat::Csv),
            "tcl" => Ok(ManifestFormat::Tcl),
            other => Err(ChipFlowError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    version: String,
    params: ConfigStore,
}

/// Encode a store in the given format
pub fn encode(store: &ConfigStore, format: ManifestFormat) -> Result<String> {
    match format {
        ManifestFormat::Json => {
            let doc = ManifestDocument {
                version: env!("CARGO_PKG_VERSION").to_string(),
                params: store.clone(),
            };
            Ok(serde_json::to_string_pretty(&doc)?)
        }
        ManifestFormat::Yaml => {
            let doc = ManifestDocument {
                version: env!("CARGO_PKG_VERSION").to_string(),
                params: store.clone(),
            };
            Ok(serde_yaml::to_string(&doc)?)
        }
        ManifestFormat::Csv => Ok(encode_csv(store)),
        ManifestFormat::Tcl => Ok(encode_tcl(store)),
    }
}

/// Decode a JSON manifest
pub fn decode(text: &str) -> Result<ConfigStore> {
    let doc: ManifestDocument = serde_json::from_str(text)?;
    Ok(doc.params)
}

/// Write a manifest, choosing the encoding from the file extension.
///
/// The file is written next to its destination and renamed into place, so a
/// concurrent reader sees either the previous manifest or the complete new one.
pub fn write_manifest(store: &ConfigStore, path: &Path) -> Result<()> {
    let format = ManifestFormat::from_path(path)?;
    let text = encode(store, format)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON manifest
pub fn read_manifest(path: &Path) -> Result<ConfigStore> {
    match ManifestFormat::from_path(path)? {
        ManifestFormat::Json => {}
        other => {
            return Err(ChipFlowError::UnsupportedFormat(format!(
                "{} (manifests are read from json only)",
                other.extension()
            )))
        }
    }
    let text = fs::read_to_string(path)?;
    decode(&text).map_err(|e| ChipFlowError::Manifest {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn csv_field(text: &str) -> String {
    if text.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn encode_csv(store: &ConfigStore) -> String {
    let mut out = String::from("key,step,index,value\n");
    for (key, param) in store.entries() {
        if let Some(value) = &param.global {
            let _ = writeln!(out, "{},,,{}", csv_field(key), csv_field(&scalar_text(value)));
        }
        for (step, indices) in &param.node {
            for (index, value) in indices {
                let _ = writeln!(
                    out,
                    "{},{},{},{}",
                    csv_field(key),
                    csv_field(step),
                    csv_field(index),
                    csv_field(&scalar_text(value))
                );
            }
        }
    }
    out
}

fn tcl_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        if matches!(c, '\\' | '"' | '$' | '[' | ']') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn tcl_value(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let mut list = String::from("[list");
            for item in items {
                list.push(' ');
                list.push_str(&tcl_value(item));
            }
            list.push(']');
            list
        }
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => tcl_quote(&scalar_text(other)),
    }
}

fn encode_tcl(store: &ConfigStore) -> String {
    let mut out = String::from("# chipflow manifest\nset chipflow [dict create]\n");
    for (key, param) in store.entries() {
        let path: Vec<String> = split_key(key).into_iter().map(tcl_quote).collect();
        let path = path.join(" ");
        if let Some(value) = &param.global {
            let _ = writeln!(out, "dict set chipflow {path} global {}", tcl_value(value));
        }
        for (step, indices) in &param.node {
            for (index, value) in indices {
                let _ = writeln!(
                    out,
                    "dict set chipflow {path} {} {} {}",
                    tcl_quote(step),
                    tcl_quote(index),
                    tcl_value(value)
                );
            }
        }
    }
    out
}
