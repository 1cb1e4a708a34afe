//! Flowgraph model: the DAG of (step, index) nodes and its structural queries

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::{ChipFlowError, Result};
use crate::models::{NodeConfig, NodeId, BUILTIN_TOOL};
use crate::store::ConfigStore;

/// Definition of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub id: NodeId,
    pub tool: String,
    pub task: String,
    /// Declared upstream nodes, in declaration order
    pub inputs: Vec<NodeId>,
    pub weights: BTreeMap<String, f64>,
    pub goals: BTreeMap<String, f64>,
    pub args: Vec<String>,
}

impl NodeDef {
    pub fn new(id: NodeId, tool: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id,
            tool: tool.into(),
            task: task.into(),
            inputs: Vec::new(),
            weights: BTreeMap::new(),
            goals: BTreeMap::new(),
            args: Vec::new(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.tool == BUILTIN_TOOL
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Directed graph of nodes; an edge runs from a tail node to the head it feeds
#[derive(Debug, Clone)]
pub struct Flowgraph {
    name: String,
    graph: DiGraph<NodeId, ()>,
    indices: BTreeMap<NodeId, NodeIndex>,
    nodes: BTreeMap<NodeId, NodeDef>,
    /// Inputs naming undeclared nodes: tail -> heads waiting on it
    unresolved: BTreeMap<NodeId, Vec<NodeId>>,
}

impl Flowgraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: DiGraph::new(),
            indices: BTreeMap::new(),
            nodes: BTreeMap::new(),
            unresolved: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a node and connect its declared inputs. Inputs naming a node
    /// that is not declared yet are connected when that node arrives.
    pub fn node(&mut self, def: NodeDef) -> Result<()> {
        if self.nodes.contains_key(&def.id) {
            return Err(ChipFlowError::DuplicateNode {
                flow: self.name.clone(),
                node: def.id.to_string(),
            });
        }
        let id = def.id.clone();
        let inputs = def.inputs.clone();
        let index = self.graph.add_node(id.clone());
        self.indices.insert(id.clone(), index);
        self.nodes.insert(id.clone(), def);

        for input in inputs {
            if self.nodes.contains_key(&input) {
                self.edge(&input, &id)?;
            } else {
                self.unresolved.entry(input).or_default().push(id.clone());
            }
        }
        if let Some(heads) = self.unresolved.remove(&id) {
            for head in heads {
                self.edge(&id, &head)?;
            }
        }
        Ok(())
    }

    /// Connect `tail` as an input of `head`
    pub fn edge(&mut self, tail: &NodeId, head: &NodeId) -> Result<()> {
        let t = self.index_of(tail)?;
        let h = self.index_of(head)?;
        if self.graph.find_edge(t, h).is_some() {
            return Err(ChipFlowError::DuplicateEdge {
                tail: tail.to_string(),
                head: head.to_string(),
            });
        }
        self.graph.add_edge(t, h, ());
        if let Some(def) = self.nodes.get_mut(head) {
            if !def.inputs.contains(tail) {
                def.inputs.push(tail.clone());
            }
        }
        Ok(())
    }

    fn index_of(&self, node: &NodeId) -> Result<NodeIndex> {
        self.indices
            .get(node)
            .copied()
            .ok_or_else(|| ChipFlowError::UnknownNode {
                flow: self.name.clone(),
                node: node.to_string(),
            })
    }

    /// Build a flowgraph from flow-file node declarations
    pub fn from_config(name: &str, nodes: &[NodeConfig]) -> Result<Self> {
        let mut flow = Flowgraph::new(name);
        for cfg in nodes {
            let id = cfg.id();
            let tool = cfg.tool.clone().ok_or_else(|| ChipFlowError::MissingBinding {
                node: id.to_string(),
                field: "tool",
            })?;
            let task = cfg.task.clone().ok_or_else(|| ChipFlowError::MissingBinding {
                node: id.to_string(),
                field: "task",
            })?;
            let mut def = NodeDef::new(id, tool, task);
            def.inputs = cfg.inputs.clone();
            def.weights = cfg.weights.clone();
            def.goals = cfg.goals.clone();
            def.args = cfg.args.clone();
            flow.node(def)?;
        }
        flow.check_resolved()?;
        Ok(flow)
    }

    /// Rebuild a flowgraph from the `flowgraph,<name>,*` keys of a store
    pub fn from_store(store: &ConfigStore, name: &str) -> Result<Self> {
        let tools = store.node_values(&["flowgraph", name, "tool"]);
        if tools.is_empty() {
            return Err(ChipFlowError::UnknownFlow(name.to_string()));
        }
        let weight_metrics = metric_names(store, name, "weight");
        let goal_metrics = metric_names(store, name, "goal");

        let mut flow = Flowgraph::new(name);
        for (id, tool) in tools {
            let tool = tool.as_str().unwrap_or_default().to_string();
            let task = store
                .get_str(&["flowgraph", name, "task"], Some(&id))
                .ok_or_else(|| ChipFlowError::MissingBinding {
                    node: id.to_string(),
                    field: "task",
                })?;
            let mut def = NodeDef::new(id.clone(), tool, task);
            for metric in &weight_metrics {
                if let Some(w) = store.get_f64(&["flowgraph", name, "weight", metric.as_str()], Some(&id)) {
                    def.weights.insert(metric.clone(), w);
                }
            }
            for metric in &goal_metrics {
                if let Some(g) = store.get_f64(&["flowgraph", name, "goal", metric.as_str()], Some(&id)) {
                    def.goals.insert(metric.clone(), g);
                }
            }
            def.args = store.get_str_list(&["flowgraph", name, "args"], Some(&id));
            for input in store.get_str_list(&["flowgraph", name, "input"], Some(&id)) {
                def.inputs.push(input.parse()?);
            }
            flow.node(def)?;
        }
        flow.check_resolved()?;
        Ok(flow)
    }

    /// Record the flowgraph structure in a store
    pub fn write_to_store(&self, store: &mut ConfigStore) {
        let name = self.name.as_str();
        for (id, def) in &self.nodes {
            let node = Some(id);
            store.set(&["flowgraph", name, "tool"], def.tool.as_str(), node);
            store.set(&["flowgraph", name, "task"], def.task.as_str(), node);
            let inputs: Vec<Value> = def.inputs.iter().map(|i| json!(i.to_string())).collect();
            store.set(&["flowgraph", name, "input"], inputs, node);
            if !def.args.is_empty() {
                store.set(&["flowgraph", name, "args"], json!(def.args), node);
            }
            for (metric, weight) in &def.weights {
                store.set(&["flowgraph", name, "weight", metric.as_str()], *weight, node);
            }
            for (metric, goal) in &def.goals {
                store.set(&["flowgraph", name, "goal", metric.as_str()], *goal, node);
            }
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn get(&self, node: &NodeId) -> Option<&NodeDef> {
        self.nodes.get(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Distinct step names
    pub fn steps(&self) -> BTreeSet<&str> {
        self.nodes.keys().map(|n| n.step.as_str()).collect()
    }

    /// All indices of a step
    pub fn step_nodes(&self, step: &str) -> Vec<NodeId> {
        self.nodes.keys().filter(|n| n.step == step).cloned().collect()
    }

    /// Nodes without inputs, optionally restricted to some steps
    pub fn entry_nodes(&self, steps: Option<&[String]>) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|def| def.inputs.is_empty())
            .map(|def| def.id.clone())
            .filter(|id| in_steps(id, steps))
            .collect()
    }

    /// Nodes that feed no other node, optionally restricted to some steps
    pub fn exit_nodes(&self, steps: Option<&[String]>) -> Vec<NodeId> {
        self.indices
            .iter()
            .filter(|(_, idx)| {
                self.graph
                    .neighbors_directed(**idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|(id, _)| id.clone())
            .filter(|id| in_steps(id, steps))
            .collect()
    }

    /// Declared upstream nodes
    pub fn node_inputs(&self, node: &NodeId) -> &[NodeId] {
        self.nodes
            .get(node)
            .map(|def| def.inputs.as_slice())
            .unwrap_or(&[])
    }

    /// Downstream nodes fed by `node`
    pub fn node_outputs(&self, node: &NodeId) -> Vec<NodeId> {
        let Some(&idx) = self.indices.get(node) else {
            return Vec::new();
        };
        let mut outputs: Vec<NodeId> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        outputs.sort();
        outputs
    }

    /// Declared inputs that remain reachable from the entry nodes once the
    /// pruned nodes are removed.
    pub fn pruned_inputs(&self, node: &NodeId, prune: &BTreeSet<NodeId>) -> Vec<NodeId> {
        let live = self.reachable(&self.entry_nodes(None), |_| true, prune);
        self.node_inputs(node)
            .iter()
            .filter(|input| live.contains(*input))
            .cloned()
            .collect()
    }

    /// Nodes on any path from a `from` node to a `to` node, skipping pruned
    /// nodes.
    ///
    /// Each start node is walked depth-first. Reaching a node that is already
    /// on the current path is a [`ChipFlowError::CycleDetected`] naming the
    /// loop.
    pub fn execution_set(
        &self,
        from: &[NodeId],
        to: &[NodeId],
        prune: &BTreeSet<NodeId>,
    ) -> Result<BTreeSet<NodeId>> {
        for node in from.iter().chain(to) {
            self.index_of(node)?;
        }
        let targets: BTreeSet<&NodeId> = to.iter().collect();
        let mut marks: HashMap<NodeId, Mark> = HashMap::new();
        let mut leads_to: HashMap<NodeId, bool> = HashMap::new();
        let mut path = Vec::new();

        for start in from {
            if prune.contains(start) {
                continue;
            }
            self.walk(start, &targets, prune, &mut marks, &mut leads_to, &mut path)?;
        }

        Ok(leads_to
            .into_iter()
            .filter(|(_, hit)| *hit)
            .map(|(node, _)| node)
            .collect())
    }

    fn walk(
        &self,
        node: &NodeId,
        targets: &BTreeSet<&NodeId>,
        prune: &BTreeSet<NodeId>,
        marks: &mut HashMap<NodeId, Mark>,
        leads_to: &mut HashMap<NodeId, bool>,
        path: &mut Vec<NodeId>,
    ) -> Result<bool> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(leads_to.get(node).copied().unwrap_or(false)),
            Some(Mark::OnPath) => {
                let start = path.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(NodeId::to_string).collect();
                cycle.push(node.to_string());
                return Err(ChipFlowError::CycleDetected(cycle.join(" -> ")));
            }
            None => {}
        }

        marks.insert(node.clone(), Mark::OnPath);
        path.push(node.clone());

        let mut hit = targets.contains(node);
        for next in self.node_outputs(node) {
            if prune.contains(&next) {
                continue;
            }
            if self.walk(&next, targets, prune, marks, leads_to, path)? {
                hit = true;
            }
        }

        path.pop();
        marks.insert(node.clone(), Mark::Done);
        leads_to.insert(node.clone(), hit);
        Ok(hit)
    }

    /// Breadth-first walk from `from` that only enters nodes satisfying
    /// `predicate` and never enters pruned nodes.
    pub fn reachable<F>(&self, from: &[NodeId], predicate: F, prune: &BTreeSet<NodeId>) -> BTreeSet<NodeId>
    where
        F: Fn(&NodeId) -> bool,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = from
            .iter()
            .filter(|n| self.contains(n) && !prune.contains(*n) && predicate(*n))
            .cloned()
            .collect();

        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for next in self.node_outputs(&node) {
                if !seen.contains(&next) && !prune.contains(&next) && predicate(&next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    fn check_resolved(&self) -> Result<()> {
        match self.unresolved.keys().next() {
            Some(missing) => Err(ChipFlowError::UnknownNode {
                flow: self.name.clone(),
                node: missing.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Structural validation: every input is declared and the graph is acyclic
    pub fn validate(&self) -> Result<()> {
        self.check_resolved()?;
        if is_cyclic_directed(&self.graph) {
            return Err(ChipFlowError::CycleDetected(self.find_cycle()));
        }
        Ok(())
    }

    /// Validate the run-time selection of start steps, target steps and
    /// pruned nodes against this graph.
    pub fn validate_runtime(&self, from: &[String], to: &[String], prune: &BTreeSet<NodeId>) -> Result<()> {
        for step in from.iter().chain(to) {
            if self.step_nodes(step).is_empty() {
                return Err(ChipFlowError::UnknownStep {
                    flow: self.name.clone(),
                    step: step.clone(),
                });
            }
        }
        for node in prune {
            self.index_of(node)?;
        }

        if self.entry_nodes(None).iter().all(|n| prune.contains(n)) {
            return Err(ChipFlowError::Validation(format!(
                "pruning removes every entry node of flowgraph '{}'",
                self.name
            )));
        }
        let exits = self.exit_nodes(None);
        if !exits.is_empty() && exits.iter().all(|n| prune.contains(n)) {
            return Err(ChipFlowError::Validation(format!(
                "pruning removes every exit node of flowgraph '{}'",
                self.name
            )));
        }

        let start = self.start_nodes(from);
        let live = self.reachable(&start, |_| true, prune);
        let targets: Vec<String> = if to.is_empty() {
            self.exit_nodes(None).into_iter().map(|n| n.step).collect()
        } else {
            to.to_vec()
        };
        for step in targets {
            if !live.iter().any(|n| n.step == step) {
                return Err(ChipFlowError::UnreachableExit { step });
            }
        }
        Ok(())
    }

    /// Nodes a run starts from: every index of the `from` steps, or the
    /// entry nodes when no steps are given
    pub fn start_nodes(&self, from: &[String]) -> Vec<NodeId> {
        if from.is_empty() {
            self.entry_nodes(None)
        } else {
            from.iter().flat_map(|s| self.step_nodes(s)).collect()
        }
    }

    /// Nodes a run ends at: every index of the `to` steps, or the exit nodes
    /// when no steps are given
    pub fn target_nodes(&self, to: &[String]) -> Vec<NodeId> {
        if to.is_empty() {
            self.exit_nodes(None)
        } else {
            to.iter().flat_map(|s| self.step_nodes(s)).collect()
        }
    }

    fn find_cycle(&self) -> String {
        let mut marks = HashMap::new();
        let mut leads_to = HashMap::new();
        let mut path = Vec::new();
        let targets = BTreeSet::new();
        let prune = BTreeSet::new();
        for id in self.nodes.keys() {
            if let Err(ChipFlowError::CycleDetected(cycle)) =
                self.walk(id, &targets, &prune, &mut marks, &mut leads_to, &mut path)
            {
                return cycle;
            }
            path.clear();
        }
        "Unknown cycle".to_string()
    }

    /// Nodes in dependency order
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            ChipFlowError::CycleDetected(format!("cycle through {}", self.graph[cycle.node_id()]))
        })?;
        Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
    }

    /// Nodes grouped by depth: level 0 has no inputs, level n depends only on
    /// lower levels
    pub fn execution_levels(&self) -> Vec<Vec<NodeId>> {
        let mut cache: HashMap<NodeIndex, usize> = HashMap::new();
        let mut levels: Vec<Vec<NodeId>> = Vec::new();
        for (id, &idx) in &self.indices {
            let level = self.level_of(idx, &mut cache);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(id.clone());
        }
        levels
    }

    fn level_of(&self, node: NodeIndex, cache: &mut HashMap<NodeIndex, usize>) -> usize {
        if let Some(&level) = cache.get(&node) {
            return level;
        }
        let mut level = 0;
        for parent in self.graph.neighbors_directed(node, Direction::Incoming) {
            level = level.max(self.level_of(parent, cache) + 1);
        }
        cache.insert(node, level);
        level
    }
}

fn in_steps(id: &NodeId, steps: Option<&[String]>) -> bool {
    steps.map_or(true, |steps| steps.iter().any(|s| *s == id.step))
}

fn metric_names(store: &ConfigStore, flow: &str, kind: &str) -> Vec<String> {
    store
        .keys(&["flowgraph", flow, kind])
        .into_iter()
        .filter_map(|key| key.get(3).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn def(node: &str, tool: &str, inputs: &[&str]) -> NodeDef {
        let mut def = NodeDef::new(id(node), tool, "task");
        def.inputs = inputs.iter().map(|i| id(i)).collect();
        def
    }

    /// import -> syn -> floorplan/{0..3} -> merge
    fn asic_flow() -> Flowgraph {
        let mut flow = Flowgraph::new("asicflow");
        flow.node(def("import/0", "yosys", &[])).unwrap();
        flow.node(def("syn/0", "yosys", &["import/0"])).unwrap();
        for i in 0..4 {
            flow.node(def(&format!("floorplan/{i}"), "openroad", &["syn/0"])).unwrap();
        }
        flow.node(def(
            "merge/0",
            BUILTIN_TOOL,
            &["floorplan/0", "floorplan/1", "floorplan/2", "floorplan/3"],
        ))
        .unwrap();
        flow
    }

    fn none() -> BTreeSet<NodeId> {
        BTreeSet::new()
    }

    #[test]
    fn test_entry_and_exit_nodes() {
        let flow = asic_flow();
        assert_eq!(flow.entry_nodes(None), vec![id("import/0")]);
        assert_eq!(flow.exit_nodes(None), vec![id("merge/0")]);
        assert!(flow.exit_nodes(Some(&["syn".to_string()])).is_empty());
        assert_eq!(flow.node_outputs(&id("syn/0")).len(), 4);
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let mut flow = asic_flow();
        let err = flow.edge(&id("import/0"), &id("syn/0")).unwrap_err();
        assert!(matches!(err, ChipFlowError::DuplicateEdge { .. }));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut flow = asic_flow();
        assert!(matches!(
            flow.node(def("syn/0", "yosys", &[])),
            Err(ChipFlowError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn test_inputs_declared_before_tail() {
        let mut flow = Flowgraph::new("f");
        flow.node(def("b/0", "t", &["a/0"])).unwrap();
        assert!(flow.validate().is_err());
        flow.node(def("a/0", "t", &[])).unwrap();
        assert!(flow.validate().is_ok());
        assert_eq!(flow.node_inputs(&id("b/0")), &[id("a/0")]);
        assert_eq!(flow.entry_nodes(None), vec![id("a/0")]);
    }

    #[test]
    fn test_execution_set_full_and_partial() {
        let flow = asic_flow();
        let all = flow
            .execution_set(&flow.entry_nodes(None), &flow.exit_nodes(None), &none())
            .unwrap();
        assert_eq!(all.len(), 7);

        let partial = flow
            .execution_set(&[id("syn/0")], &[id("floorplan/1")], &none())
            .unwrap();
        assert_eq!(partial, [id("syn/0"), id("floorplan/1")].into_iter().collect());
    }

    #[test]
    fn test_execution_set_skips_pruned_nodes() {
        let flow = asic_flow();
        let prune: BTreeSet<_> = [id("floorplan/2")].into_iter().collect();
        let set = flow
            .execution_set(&[id("import/0")], &[id("merge/0")], &prune)
            .unwrap();
        assert_eq!(set.len(), 6);
        assert!(!set.contains(&id("floorplan/2")));
    }

    #[test]
    fn test_execution_set_without_path_is_empty() {
        let flow = asic_flow();
        let set = flow
            .execution_set(&[id("floorplan/0")], &[id("floorplan/1")], &none())
            .unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_cycle_detected_in_execution_set() {
        let mut flow = Flowgraph::new("loop");
        flow.node(def("a/0", "t", &[])).unwrap();
        flow.node(def("b/0", "t", &["a/0"])).unwrap();
        flow.edge(&id("b/0"), &id("a/0")).unwrap();

        let err = flow
            .execution_set(&[id("a/0")], &[id("b/0")], &none())
            .unwrap_err();
        match err {
            ChipFlowError::CycleDetected(path) => assert_eq!(path, "a/0 -> b/0 -> a/0"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_pruned_inputs_drop_unreachable_nodes() {
        let mut flow = asic_flow();
        flow.node(def("extra/0", "t", &["floorplan/2"])).unwrap();
        flow.edge(&id("extra/0"), &id("merge/0")).unwrap();

        let prune: BTreeSet<_> = [id("floorplan/2")].into_iter().collect();
        let inputs = flow.pruned_inputs(&id("merge/0"), &prune);
        assert_eq!(inputs.len(), 3);
        assert!(!inputs.contains(&id("extra/0")));
        assert!(!inputs.contains(&id("floorplan/2")));
    }

    #[test]
    fn test_reachable_with_predicate() {
        let flow = asic_flow();
        let failed = id("syn/0");
        let reached = flow.reachable(&[id("import/0")], |n| *n != failed, &none());
        assert_eq!(reached, [id("import/0")].into_iter().collect());

        let reached = flow.reachable(&[id("import/0")], |n| n.index != "2", &none());
        assert!(reached.contains(&id("merge/0")));
        assert!(!reached.contains(&id("floorplan/2")));
    }

    #[test]
    fn test_validate_runtime() {
        let flow = asic_flow();
        assert!(flow.validate_runtime(&[], &[], &none()).is_ok());
        assert!(matches!(
            flow.validate_runtime(&["route".into()], &[], &none()),
            Err(ChipFlowError::UnknownStep { .. })
        ));
        assert!(matches!(
            flow.validate_runtime(&["floorplan".into()], &["syn".into()], &none()),
            Err(ChipFlowError::UnreachableExit { .. })
        ));
        let prune: BTreeSet<_> = [id("import/0")].into_iter().collect();
        assert!(flow.validate_runtime(&[], &[], &prune).is_err());
    }

    #[test]
    fn test_store_round_trip() {
        let mut flow = Flowgraph::new("asicflow");
        flow.node(def("import/0", "yosys", &[])).unwrap();
        flow.node(def("syn/0", "yosys", &["import/0"])).unwrap();
        let mut merge = def("merge/0", BUILTIN_TOOL, &["import/0", "syn/0"]);
        merge.weights.insert("area".into(), 1.0);
        merge.goals.insert("errors".into(), 0.0);
        merge.args = vec!["minimum".into()];
        flow.node(merge).unwrap();

        let mut store = ConfigStore::new();
        flow.write_to_store(&mut store);
        let loaded = Flowgraph::from_store(&store, "asicflow").unwrap();
        assert_eq!(loaded.len(), 3);
        let merge = loaded.get(&id("merge/0")).unwrap();
        assert_eq!(merge.inputs, vec![id("import/0"), id("syn/0")]);
        assert_eq!(merge.weights.get("area"), Some(&1.0));
        assert_eq!(merge.goals.get("errors"), Some(&0.0));
        assert_eq!(merge.args, vec!["minimum".to_string()]);
        assert!(merge.is_builtin());
        assert!(Flowgraph::from_store(&store, "other").is_err());
    }

    #[test]
    fn test_execution_levels() {
        let flow = asic_flow();
        let levels = flow.execution_levels();
        assert_eq!(levels.len(), 4);
        assert_eq!(levels[2].len(), 4);
        assert_eq!(levels[3], vec![id("merge/0")]);
        let order = flow.topological_order().unwrap();
        assert_eq!(order.first(), Some(&id("import/0")));
        assert_eq!(order.last(), Some(&id("merge/0")));
    }
}
