// Framework graph representation
//
// Variables and operators are both nodes of one petgraph StableGraph. An edge
// var → op means the operator reads the variable; op → var means it writes it.
// Node ids survive deletions, which canonicalization relies on.

use crate::attrs::{AttrValue, AttributeMap};
use crate::dtype::VarType;
use anyhow::{anyhow, Result};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

/// A tensor-valued variable
#[derive(Debug, Clone, PartialEq)]
pub struct VarDesc {
    pub name: String,
    pub shape: Vec<i64>,
    /// `None` for control variables and freshly synthesized intermediates
    pub dtype: Option<VarType>,
    pub persistable: bool,
}

impl VarDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            dtype: None,
            persistable: false,
        }
    }
}

/// An operator: kind, named input/output slots and attributes
#[derive(Debug, Clone, PartialEq)]
pub struct OpDesc {
    pub op_type: String,
    pub inputs: Vec<(String, Vec<String>)>,
    pub outputs: Vec<(String, Vec<String>)>,
    pub attrs: AttributeMap,
}

fn slot<'a>(slots: &'a [(String, Vec<String>)], name: &str) -> &'a [String] {
    slots
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_slice())
        .unwrap_or(&[])
}

fn set_slot(slots: &mut Vec<(String, Vec<String>)>, name: &str, names: Vec<String>) {
    match slots.iter_mut().find(|(k, _)| k == name) {
        Some(entry) => entry.1 = names,
        None => slots.push((name.to_string(), names)),
    }
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: AttributeMap::new(),
        }
    }

    /// Variable names bound to input slot `name` (empty if the slot is absent)
    pub fn input(&self, name: &str) -> &[String] {
        slot(&self.inputs, name)
    }

    pub fn output(&self, name: &str) -> &[String] {
        slot(&self.outputs, name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|(k, _)| k == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|(k, _)| k == name)
    }

    pub fn set_input(&mut self, name: &str, names: Vec<String>) {
        set_slot(&mut self.inputs, name, names);
    }

    pub fn set_output(&mut self, name: &str, names: Vec<String>) {
        set_slot(&mut self.outputs, name, names);
    }

    /// All input names in slot order
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().flat_map(|(_, v)| v.iter().cloned()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().flat_map(|(_, v)| v.iter().cloned()).collect()
    }
}

/// A node in the computation graph
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Var(VarDesc),
    Op(OpDesc),
}

impl Node {
    /// Variable name, or operator kind
    pub fn name(&self) -> &str {
        match self {
            Node::Var(v) => &v.name,
            Node::Op(op) => &op.op_type,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Node::Var(_))
    }

    pub fn is_op(&self) -> bool {
        matches!(self, Node::Op(_))
    }

    pub fn as_var(&self) -> Option<&VarDesc> {
        match self {
            Node::Var(v) => Some(v),
            Node::Op(_) => None,
        }
    }

    pub fn as_op(&self) -> Option<&OpDesc> {
        match self {
            Node::Op(op) => Some(op),
            Node::Var(_) => None,
        }
    }

    pub fn as_op_mut(&mut self) -> Option<&mut OpDesc> {
        match self {
            Node::Op(op) => Some(op),
            Node::Var(_) => None,
        }
    }
}

/// Framework computation graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    graph: StableGraph<Node, ()>,
    /// Variable name → most recently added node with that name
    vars: FxHashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a variable
    pub fn add_var(&mut self, name: impl Into<String>) -> NewVar<'_> {
        NewVar {
            graph: self,
            desc: VarDesc::new(name),
        }
    }

    /// Start building an operator
    pub fn add_op(&mut self, op_type: impl Into<String>) -> NewOp<'_> {
        NewOp {
            graph: self,
            desc: OpDesc::new(op_type),
        }
    }

    /// Insert a variable node as-is
    pub fn insert_var(&mut self, desc: VarDesc) -> NodeId {
        let name = desc.name.clone();
        let id = self.graph.add_node(Node::Var(desc));
        self.vars.insert(name, id);
        id
    }

    /// Insert an operator node without wiring any edges
    pub fn insert_op(&mut self, desc: OpDesc) -> NodeId {
        self.graph.add_node(Node::Op(desc))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.graph.node_weight_mut(id)
    }

    pub fn var(&self, id: NodeId) -> Option<&VarDesc> {
        self.node(id).and_then(Node::as_var)
    }

    pub fn var_mut(&mut self, id: NodeId) -> Option<&mut VarDesc> {
        match self.graph.node_weight_mut(id) {
            Some(Node::Var(v)) => Some(v),
            _ => None,
        }
    }

    pub fn op(&self, id: NodeId) -> Option<&OpDesc> {
        self.node(id).and_then(Node::as_op)
    }

    pub fn op_mut(&mut self, id: NodeId) -> Option<&mut OpDesc> {
        self.graph.node_weight_mut(id).and_then(Node::as_op_mut)
    }

    /// Variable node by name
    pub fn find_var(&self, name: &str) -> Option<NodeId> {
        self.vars
            .get(name)
            .copied()
            .filter(|&id| self.graph.contains_node(id))
    }

    pub fn contains_var(&self, name: &str) -> bool {
        self.find_var(name).is_some()
    }

    /// All node ids in index order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().collect()
    }

    pub fn var_ids(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&id| self.graph[id].is_var())
            .collect()
    }

    pub fn op_ids(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&id| self.graph[id].is_op())
            .collect()
    }

    /// Nodes with an edge into `id`, ordered by edge index
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| (e.id(), e.source()))
            .collect();
        nodes.sort_by_key(|(edge, _)| edge.index());
        nodes.into_iter().map(|(_, n)| n).collect()
    }

    /// Nodes `id` has an edge into, ordered by edge index
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();
        nodes.sort_by_key(|(edge, _)| edge.index());
        nodes.into_iter().map(|(_, n)| n).collect()
    }

    /// Add the edge `from → to` unless it already exists
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.ensure(from)?;
        self.ensure(to)?;
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    /// Remove every edge between `a` and `b`, in both directions
    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        while let Some(edge) = self.graph.find_edge(a, b) {
            self.graph.remove_edge(edge);
        }
        while let Some(edge) = self.graph.find_edge(b, a) {
            self.graph.remove_edge(edge);
        }
    }

    /// Remove the edge `from → to`, if present
    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) -> bool {
        match self.graph.find_edge(from, to) {
            Some(edge) => self.graph.remove_edge(edge).is_some(),
            None => false,
        }
    }

    /// Detach `id` from all neighbours; the node itself stays
    pub fn clear_node(&mut self, id: NodeId) {
        let edges: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .chain(self.graph.edges_directed(id, Direction::Outgoing))
            .map(|e| e.id())
            .collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
    }

    /// Delete a node and its edges
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let node = self
            .graph
            .remove_node(id)
            .ok_or_else(|| anyhow!("node {} not in graph", id.index()))?;
        if let Node::Var(v) = &node {
            if self.vars.get(&v.name) == Some(&id) {
                self.vars.remove(&v.name);
                // fall back to an older node with the same name, if any
                let older = self
                    .graph
                    .node_indices()
                    .filter(|&n| matches!(&self.graph[n], Node::Var(o) if o.name == v.name))
                    .last();
                if let Some(older) = older {
                    self.vars.insert(v.name.clone(), older);
                }
            }
        }
        Ok(node)
    }

    /// Operators in dependency order
    ///
    /// Deterministic for a given graph. A cycle is reported with the name of a
    /// node on it.
    pub fn topological_ops(&self) -> std::result::Result<Vec<NodeId>, String> {
        let order = toposort(&self.graph, None)
            .map_err(|cycle| self.graph[cycle.node_id()].name().to_string())?;
        Ok(order
            .into_iter()
            .filter(|&id| self.graph[id].is_op())
            .collect())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn op_count(&self) -> usize {
        self.graph.node_weights().filter(|n| n.is_op()).count()
    }

    /// Operator count per kind, sorted by kind
    pub fn op_histogram(&self) -> Vec<(String, usize)> {
        let mut counts: FxHashMap<&str, usize> = FxHashMap::default();
        for op in self.graph.node_weights().filter_map(Node::as_op) {
            *counts.entry(op.op_type.as_str()).or_insert(0) += 1;
        }
        let mut counts: Vec<_> = counts
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        counts.sort();
        counts
    }

    fn ensure(&self, id: NodeId) -> Result<()> {
        if self.graph.contains_node(id) {
            Ok(())
        } else {
            Err(anyhow!("node {} not in graph", id.index()))
        }
    }
}

/// Builder for adding a variable to the graph
pub struct NewVar<'a> {
    graph: &'a mut Graph,
    desc: VarDesc,
}

impl<'a> NewVar<'a> {
    pub fn shape(mut self, shape: Vec<i64>) -> Self {
        self.desc.shape = shape;
        self
    }

    pub fn dtype(mut self, dtype: VarType) -> Self {
        self.desc.dtype = Some(dtype);
        self
    }

    pub fn persistable(mut self, persistable: bool) -> Self {
        self.desc.persistable = persistable;
        self
    }

    pub fn finish(self) -> NodeId {
        self.graph.insert_var(self.desc)
    }
}

/// Builder for adding an operator to the graph
///
/// Input variables must already exist; output variables are created on
/// [`finish`](NewOp::finish) when missing.
pub struct NewOp<'a> {
    graph: &'a mut Graph,
    desc: OpDesc,
}

impl<'a> NewOp<'a> {
    pub fn input(mut self, slot: &str, names: &[&str]) -> Self {
        self.desc
            .set_input(slot, names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn output(mut self, slot: &str, names: &[&str]) -> Self {
        self.desc
            .set_output(slot, names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.desc.attrs.set(name, value);
        self
    }

    pub fn finish(self) -> Result<NodeId> {
        let inputs = self.desc.input_names();
        let outputs = self.desc.output_names();
        let mut input_ids = Vec::with_capacity(inputs.len());
        for name in &inputs {
            let id = self.graph.find_var(name).ok_or_else(|| {
                anyhow!("input variable {} of {} not in graph", name, self.desc.op_type)
            })?;
            input_ids.push(id);
        }
        let op = self.graph.insert_op(self.desc);
        for id in input_ids {
            self.graph.connect(id, op)?;
        }
        for name in outputs {
            let id = match self.graph.find_var(&name) {
                Some(id) => id,
                None => self.graph.insert_var(VarDesc::new(name)),
            };
            self.graph.connect(op, id)?;
        }
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu_graph() -> (Graph, NodeId, NodeId, NodeId) {
        let mut graph = Graph::new();
        let x = graph
            .add_var("x")
            .shape(vec![-1, 4])
            .dtype(VarType::Fp32)
            .finish();
        let relu = graph
            .add_op("relu")
            .input("X", &["x"])
            .output("Out", &["y"])
            .finish()
            .unwrap();
        let y = graph.find_var("y").unwrap();
        (graph, x, relu, y)
    }

    #[test]
    fn test_builder_wires_edges() {
        let (graph, x, relu, y) = relu_graph();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.predecessors(relu), vec![x]);
        assert_eq!(graph.successors(relu), vec![y]);
        assert_eq!(graph.op(relu).unwrap().input("X"), ["x".to_string()]);
    }

    #[test]
    fn test_missing_input_is_error() {
        let mut graph = Graph::new();
        let result = graph.add_op("relu").input("X", &["nope"]).finish();
        assert!(result.is_err());
    }

    #[test]
    fn test_disconnect_and_clear() {
        let (mut graph, x, relu, y) = relu_graph();
        graph.disconnect(relu, x);
        assert!(graph.predecessors(relu).is_empty());
        assert!(graph.successors(x).is_empty());
        graph.clear_node(relu);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.node(relu).is_some());
        assert!(graph.predecessors(y).is_empty());
    }

    #[test]
    fn test_remove_var_updates_lookup() {
        let (mut graph, _x, _relu, y) = relu_graph();
        graph.remove_node(y).unwrap();
        assert!(graph.find_var("y").is_none());
        assert!(graph.remove_node(y).is_err());
    }

    #[test]
    fn test_topological_ops() {
        let (mut graph, _, relu, _) = relu_graph();
        let exp = graph
            .add_op("exp")
            .input("X", &["y"])
            .output("Out", &["z"])
            .finish()
            .unwrap();
        assert_eq!(graph.topological_ops().unwrap(), vec![relu, exp]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let (mut graph, x, _relu, y) = relu_graph();
        let back = graph.add_op("assign").finish().unwrap();
        graph.connect(y, back).unwrap();
        graph.connect(back, x).unwrap();
        assert!(graph.topological_ops().is_err());
    }
}
