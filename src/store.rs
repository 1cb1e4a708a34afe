//! Configuration store keyed by path with per-node value scoping
//!
//! Every parameter is addressed by a key path such as
//! `["flowgraph", "asicflow", "status"]`. A parameter holds an optional
//! global value plus values scoped to individual (step, index) nodes. Lookups
//! for a node fall back to the global value when no node-scoped value exists.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ChipFlowError, Result};
use crate::models::NodeId;

/// Separator used when a key path is flattened into a single string
pub const KEY_SEPARATOR: char = ',';

/// Values of one parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Param {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Value>,
    /// step -> index -> value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Param {
    fn is_empty(&self) -> bool {
        self.global.is_none() && self.node.is_empty()
    }

    fn node_value(&self, node: &NodeId) -> Option<&Value> {
        self.node.get(&node.step).and_then(|m| m.get(&node.index))
    }
}

/// In-memory configuration store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigStore {
    params: BTreeMap<String, Param>,
}

pub fn join_key(key: &[&str]) -> String {
    key.join(",")
}

pub fn split_key(key: &str) -> Vec<&str> {
    key.split(KEY_SEPARATOR).collect()
}

/// Whether a key may flow from a worker manifest back into another process.
///
/// Only runtime-mutable fields qualify: metrics, run records, tool-namespaced
/// values, and the per-node flowgraph `status`/`select` fields.
pub fn is_partial_key(key: &[&str]) -> bool {
    match key {
        ["metric", ..] | ["record", ..] | ["tool", ..] => true,
        ["flowgraph", _, "status"] | ["flowgraph", _, "select"] => true,
        _ => false,
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, globally or scoped to one node
    pub fn set(&mut self, key: &[&str], value: impl Into<Value>, node: Option<&NodeId>) {
        let param = self.params.entry(join_key(key)).or_default();
        let value = value.into();
        match node {
            Some(id) => {
                param
                    .node
                    .entry(id.step.clone())
                    .or_default()
                    .insert(id.index.clone(), value);
            }
            None => param.global = Some(value),
        }
    }

    /// Value for `node`, falling back to the global value
    pub fn get(&self, key: &[&str], node: Option<&NodeId>) -> Option<&Value> {
        let param = self.params.get(&join_key(key))?;
        node.and_then(|id| param.node_value(id))
            .or(param.global.as_ref())
    }

    /// Value stored at exactly this scope, without fallback
    pub fn get_exact(&self, key: &[&str], node: Option<&NodeId>) -> Option<&Value> {
        let param = self.params.get(&join_key(key))?;
        match node {
            Some(id) => param.node_value(id),
            None => param.global.as_ref(),
        }
    }

    /// Typed lookup; a value of the wrong shape is an error, a missing one is `None`
    pub fn get_as<T: DeserializeOwned>(&self, key: &[&str], node: Option<&NodeId>) -> Result<Option<T>> {
        match self.get(key, node) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ChipFlowError::ValueType {
                    key: join_key(key),
                    message: e.to_string(),
                }),
        }
    }

    pub fn get_str(&self, key: &[&str], node: Option<&NodeId>) -> Option<String> {
        self.get(key, node).and_then(Value::as_str).map(str::to_string)
    }

    pub fn get_bool(&self, key: &[&str], node: Option<&NodeId>) -> bool {
        self.get(key, node).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_f64(&self, key: &[&str], node: Option<&NodeId>) -> Option<f64> {
        self.get(key, node).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, key: &[&str], node: Option<&NodeId>) -> Option<u64> {
        self.get(key, node).and_then(Value::as_u64)
    }

    /// List of strings; a scalar string is treated as a one-element list
    pub fn get_str_list(&self, key: &[&str], node: Option<&NodeId>) -> Vec<String> {
        match self.get(key, node) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Remove a value at one scope. Empty parameters are dropped.
    pub fn unset(&mut self, key: &[&str], node: Option<&NodeId>) {
        let joined = join_key(key);
        let Some(param) = self.params.get_mut(&joined) else {
            return;
        };
        match node {
            Some(id) => {
                if let Some(indices) = param.node.get_mut(&id.step) {
                    indices.remove(&id.index);
                    if indices.is_empty() {
                        param.node.remove(&id.step);
                    }
                }
            }
            None => param.global = None,
        }
        if param.is_empty() {
            self.params.remove(&joined);
        }
    }

    pub fn contains(&self, key: &[&str]) -> bool {
        self.params.contains_key(&join_key(key))
    }

    /// Keys under a prefix, as key paths
    pub fn keys(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        self.params
            .keys()
            .map(|k| split_key(k))
            .filter(|k| k.len() >= prefix.len() && k[..prefix.len()] == *prefix)
            .map(|k| k.into_iter().map(str::to_string).collect())
            .collect()
    }

    /// Raw parameter by flattened key
    pub fn param(&self, key: &[&str]) -> Option<&Param> {
        self.params.get(&join_key(key))
    }

    /// All parameters in key order, with flattened keys
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.params.iter().map(|(k, p)| (k.as_str(), p))
    }

    /// Every node that carries a node-scoped value for `key`
    pub fn node_values(&self, key: &[&str]) -> Vec<(NodeId, &Value)> {
        let Some(param) = self.params.get(&join_key(key)) else {
            return Vec::new();
        };
        param
            .node
            .iter()
            .flat_map(|(step, indices)| {
                indices
                    .iter()
                    .map(move |(index, value)| (NodeId::new(step.clone(), index.clone()), value))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Drop every node-scoped value of `node` under the given key prefix
    pub fn clear_node(&mut self, prefix: &[&str], node: &NodeId) {
        for key in self.keys(prefix) {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            self.unset(&key, Some(node));
        }
    }

    /// Merge every runtime-mutable value of `other`, at all scopes.
    ///
    /// Immutable configuration in `self` is never touched.
    pub fn merge_partial(&mut self, other: &ConfigStore) {
        for (key, param) in &other.params {
            if !is_partial_key(&split_key(key)) {
                continue;
            }
            let target = self.params.entry(key.clone()).or_default();
            if param.global.is_some() {
                target.global = param.global.clone();
            }
            for (step, indices) in &param.node {
                let slot = target.node.entry(step.clone()).or_default();
                for (index, value) in indices {
                    slot.insert(index.clone(), value.clone());
                }
            }
        }
    }

    /// Merge the runtime-mutable values scoped to `node` only.
    ///
    /// Merges for distinct nodes write disjoint slots, so the order in which
    /// sibling manifests are merged does not matter and repeating a merge is a
    /// no-op.
    pub fn merge_node(&mut self, other: &ConfigStore, node: &NodeId) {
        for (key, param) in &other.params {
            if !is_partial_key(&split_key(key)) {
                continue;
            }
            if let Some(value) = param.node_value(node) {
                self.params
                    .entry(key.clone())
                    .or_default()
                    .node
                    .entry(node.step.clone())
                    .or_default()
                    .insert(node.index.clone(), value.clone());
            }
        }
    }

    /// Sub-store holding only the runtime-mutable keys
    pub fn partial_view(&self) -> ConfigStore {
        ConfigStore {
            params: self
                .params
                .iter()
                .filter(|(k, _)| is_partial_key(&split_key(k)))
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }
}
