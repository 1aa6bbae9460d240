//! Synthesizing canonical nodes inside the framework graph
//!
//! Every operator created here records its realized operand and result
//! variable names under the `__inputs__` / `__outputs__` slots. The compiler
//! reads operand order from those slots, never from edge order.

use crate::attrs::{AttrValue, AttributeMap};
use crate::dtype::{canonical_dtype, VarType};
use crate::error::{CompilerError, Result};
use crate::graph::{Graph, NodeId, OpDesc, VarDesc};

/// Operand slot written by [`OpBuilder::make_operator`]
pub const INPUTS_SLOT: &str = "__inputs__";
/// Result slot written by [`OpBuilder::make_operator`]
pub const OUTPUTS_SLOT: &str = "__outputs__";

/// Source of synthetic variable names (`_gen_<n>`)
///
/// Owned by one compilation. Counts upward and skips names the graph
/// already holds, so graphs canonicalized before never collide.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    prefix: String,
    next: u64,
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::with_prefix("_gen_")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
        }
    }

    /// Restart counting from zero
    pub fn reseed(&mut self) {
        self.next = 0;
    }

    /// Next name not present in `graph`
    pub fn fresh(&mut self, graph: &Graph) -> String {
        loop {
            let name = format!("{}{}", self.prefix, self.next);
            self.next += 1;
            if !graph.contains_var(&name) {
                return name;
            }
        }
    }
}

/// Edits made through one [`OpBuilder`], enough to undo them
#[derive(Debug, Default)]
struct Journal {
    created: Vec<NodeId>,
    added_edges: Vec<(NodeId, NodeId)>,
    removed_edges: Vec<(NodeId, NodeId)>,
    /// First-seen descs of pre-existing operators that were edited
    edited_ops: Vec<(NodeId, OpDesc)>,
}

/// Graph editing handle given to canonicalization rewrites
///
/// Every edit is journaled; [`rollback`](OpBuilder::rollback) reverts them,
/// touching only the nodes and edges the rewrite itself changed.
pub struct OpBuilder<'a> {
    graph: &'a mut Graph,
    names: &'a mut NameGenerator,
    journal: Journal,
}

impl<'a> OpBuilder<'a> {
    pub fn new(graph: &'a mut Graph, names: &'a mut NameGenerator) -> Self {
        Self {
            graph,
            names,
            journal: Journal::default(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    fn is_created(&self, id: NodeId) -> bool {
        self.journal.created.contains(&id)
    }

    /// Revert every edit made through this builder
    pub fn rollback(self) {
        let Journal {
            created,
            added_edges,
            removed_edges,
            edited_ops,
        } = self.journal;
        for (from, to) in added_edges.into_iter().rev() {
            self.graph.remove_edge(from, to);
        }
        for (from, to) in removed_edges {
            // both ends pre-exist the rewrite
            let _ = self.graph.connect(from, to);
        }
        for id in created.into_iter().rev() {
            if self.graph.node(id).is_some() {
                let _ = self.graph.remove_node(id);
            }
        }
        for (id, desc) in edited_ops {
            if let Some(op) = self.graph.op_mut(id) {
                *op = desc;
            }
        }
    }

    pub fn generate_fresh_name(&mut self) -> String {
        self.names.fresh(&*self.graph)
    }

    /// Fresh variable with no shape or type yet
    pub fn make_variable(&mut self) -> NodeId {
        let name = self.generate_fresh_name();
        let id = self.graph.insert_var(VarDesc::new(name));
        self.journal.created.push(id);
        id
    }

    /// Create an operator wired to `inputs` and `outputs`
    ///
    /// With no `outputs`, exactly one fresh result variable is created.
    pub fn make_operator(
        &mut self,
        kind: &str,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<NodeId> {
        let mut input_names = Vec::with_capacity(inputs.len());
        for &id in inputs {
            input_names.push(self.var_name(id)?);
        }
        let outputs = if outputs.is_empty() {
            vec![self.make_variable()]
        } else {
            outputs.to_vec()
        };
        let mut output_names = Vec::with_capacity(outputs.len());
        for &id in &outputs {
            output_names.push(self.var_name(id)?);
        }

        let mut desc = OpDesc::new(kind);
        desc.set_input(INPUTS_SLOT, input_names);
        desc.set_output(OUTPUTS_SLOT, output_names);
        let op = self.graph.insert_op(desc);
        self.journal.created.push(op);
        for &id in inputs {
            self.graph.connect(id, op)?;
        }
        for &id in &outputs {
            self.graph.connect(op, id)?;
        }
        Ok(op)
    }

    pub fn create_base_op(
        &mut self,
        kind: &str,
        inputs: &[NodeId],
        outputs: &[NodeId],
        attrs: AttributeMap,
    ) -> Result<NodeId> {
        let op = self.make_operator(kind, inputs, outputs)?;
        if !attrs.is_empty() {
            self.op_desc_mut(op)?.attrs = attrs;
        }
        Ok(op)
    }

    /// `Constant` with `value`, `dims` and `dtype` attributes
    pub fn create_constant(&mut self, outputs: &[NodeId], attrs: AttributeMap) -> Result<NodeId> {
        self.create_base_op("Constant", &[], outputs, attrs)
    }

    /// INT64 constant holding `values` as a rank-1 tensor
    pub fn create_int64_constant(&mut self, values: &[i64]) -> Result<NodeId> {
        let attrs = AttributeMap::new()
            .with("value", values.to_vec())
            .with("dims", vec![values.len() as i64])
            .with("dtype", canonical_dtype(VarType::Int64).code());
        self.create_constant(&[], attrs)
    }

    /// Rank-0 constant of element type `dtype`
    pub fn create_scalar_constant(&mut self, value: f32, dtype: VarType) -> Result<NodeId> {
        let attrs = AttributeMap::new()
            .with("value", vec![value])
            .with("dims", Vec::<i64>::new())
            .with("dtype", canonical_dtype(dtype).code());
        self.create_constant(&[], attrs)
    }

    pub fn create_cast(&mut self, inputs: &[NodeId], outputs: &[NodeId], to: VarType) -> Result<NodeId> {
        let to = to.cast_name()?;
        let attrs = AttributeMap::new().with("to", to);
        self.create_base_op("Cast", inputs, outputs, attrs)
    }

    pub fn create_gemm(
        &mut self,
        inputs: &[NodeId],
        outputs: &[NodeId],
        trans_a: bool,
        trans_b: bool,
        alpha: f32,
        beta: f32,
    ) -> Result<NodeId> {
        let attrs = AttributeMap::new()
            .with("alpha", alpha)
            .with("beta", beta)
            .with("transA", trans_a as i64)
            .with("transB", trans_b as i64);
        self.create_base_op("Gemm", inputs, outputs, attrs)
    }

    /// Reshape `inputs[0]` to `shape`
    ///
    /// The target shape becomes an INT64 constant wired in as the second operand.
    pub fn create_reshape(&mut self, inputs: &[NodeId], outputs: &[NodeId], shape: &[i64]) -> Result<NodeId> {
        let data = *inputs
            .first()
            .ok_or_else(|| CompilerError::invalid("reshape needs an input"))?;
        let constant = self.create_int64_constant(shape)?;
        let shape_var = self.first_output(constant)?;
        self.create_base_op("Reshape", &[data, shape_var], outputs, AttributeMap::new())
    }

    /// Single result variable of an operator created here
    pub fn first_output(&self, op: NodeId) -> Result<NodeId> {
        let name = self
            .op_desc(op)?
            .output(OUTPUTS_SLOT)
            .first()
            .cloned()
            .ok_or_else(|| CompilerError::not_found(format!("output of node {}", op.index())))?;
        self.neighbour_var(op, &name, false)
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let fresh = !self.graph.successors(from).contains(&to);
        self.graph.connect(from, to)?;
        if fresh && !self.is_created(from) && !self.is_created(to) {
            self.journal.added_edges.push((from, to));
        }
        Ok(())
    }

    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        for (from, to) in [(a, b), (b, a)] {
            if self.graph.successors(from).contains(&to) {
                self.record_removed(from, to);
            }
        }
        self.graph.disconnect(a, b);
    }

    pub fn clear_node(&mut self, id: NodeId) {
        for from in self.graph.predecessors(id) {
            self.record_removed(from, id);
        }
        for to in self.graph.successors(id) {
            self.record_removed(id, to);
        }
        self.graph.clear_node(id);
    }

    fn record_removed(&mut self, from: NodeId, to: NodeId) {
        if !self.is_created(from) && !self.is_created(to) {
            self.journal.removed_edges.push((from, to));
        }
    }

    /// Copy attribute `name` from operator `from` to `to`
    ///
    /// An attribute already on `to` is kept unless `override_existing`.
    pub fn copy_attr(&mut self, name: &str, from: NodeId, to: NodeId, override_existing: bool) -> Result<()> {
        let value = match self.op_desc(from)?.attrs.get(name) {
            Some(v) => v.clone(),
            None => return Ok(()),
        };
        let target = self.op_desc_mut(to)?;
        if override_existing || !target.attrs.contains(name) {
            target.attrs.set(name, value);
        }
        Ok(())
    }

    pub fn op_desc(&self, op: NodeId) -> Result<&OpDesc> {
        self.graph
            .op(op)
            .ok_or_else(|| CompilerError::not_found(format!("operator node {}", op.index())))
    }

    pub fn op_desc_mut(&mut self, op: NodeId) -> Result<&mut OpDesc> {
        if !self.is_created(op) && !self.journal.edited_ops.iter().any(|(id, _)| *id == op) {
            let original = self.op_desc(op)?.clone();
            self.journal.edited_ops.push((op, original));
        }
        self.graph
            .op_mut(op)
            .ok_or_else(|| CompilerError::not_found(format!("operator node {}", op.index())))
    }

    pub fn var_desc(&self, var: NodeId) -> Result<&VarDesc> {
        self.graph
            .var(var)
            .ok_or_else(|| CompilerError::not_found(format!("variable node {}", var.index())))
    }

    /// Attribute map of an operator
    pub fn attrs(&self, op: NodeId) -> Result<&AttributeMap> {
        Ok(&self.op_desc(op)?.attrs)
    }

    /// Variable bound to input `slot[index]` of `op`
    pub fn input_node(&self, slot: &str, op: NodeId, index: usize) -> Result<NodeId> {
        let name = self.slot_name(op, slot, index, true)?;
        self.neighbour_var(op, &name, true)
    }

    /// Variable bound to output `slot[index]` of `op`
    pub fn output_node(&self, slot: &str, op: NodeId, index: usize) -> Result<NodeId> {
        let name = self.slot_name(op, slot, index, false)?;
        self.neighbour_var(op, &name, false)
    }

    /// Variable bound to output `slot[index]`, if the slot binds one
    pub fn maybe_output_node(&self, slot: &str, op: NodeId, index: usize) -> Option<NodeId> {
        self.output_node(slot, op, index).ok()
    }

    pub fn has_input(&self, slot: &str, op: NodeId) -> bool {
        self.graph
            .op(op)
            .map(|desc| !desc.input(slot).is_empty())
            .unwrap_or(false)
    }

    pub fn input_shape(&self, slot: &str, op: NodeId, index: usize) -> Result<Vec<i64>> {
        let var = self.input_node(slot, op, index)?;
        Ok(self.var_desc(var)?.shape.clone())
    }

    pub fn output_shape(&self, slot: &str, op: NodeId, index: usize) -> Result<Vec<i64>> {
        let var = self.output_node(slot, op, index)?;
        Ok(self.var_desc(var)?.shape.clone())
    }

    /// Element type of input `slot[index]`; untyped variables count as float32
    pub fn input_dtype(&self, slot: &str, op: NodeId, index: usize) -> Result<VarType> {
        let var = self.input_node(slot, op, index)?;
        Ok(self.var_desc(var)?.dtype.unwrap_or(VarType::Fp32))
    }

    /// Attribute `name` of `op`, or `default` when absent
    pub fn attr_or(&self, op: NodeId, name: &str, default: AttrValue) -> Result<AttrValue> {
        Ok(self
            .op_desc(op)?
            .attrs
            .get(name)
            .filter(|v| **v != AttrValue::None)
            .cloned()
            .unwrap_or(default))
    }

    fn var_name(&self, id: NodeId) -> Result<String> {
        Ok(self.var_desc(id)?.name.clone())
    }

    fn slot_name(&self, op: NodeId, slot: &str, index: usize, input: bool) -> Result<String> {
        let desc = self.op_desc(op)?;
        let names = if input { desc.input(slot) } else { desc.output(slot) };
        names.get(index).cloned().ok_or_else(|| {
            CompilerError::not_found(format!(
                "{} slot {}[{}] of {}",
                if input { "input" } else { "output" },
                slot,
                index,
                desc.op_type
            ))
        })
    }

    /// The neighbour of `op` named `name`, falling back to a by-name lookup
    fn neighbour_var(&self, op: NodeId, name: &str, input: bool) -> Result<NodeId> {
        let neighbours = if input {
            self.graph.predecessors(op)
        } else {
            self.graph.successors(op)
        };
        neighbours
            .into_iter()
            .find(|&n| self.graph.var(n).map(|v| v.name == name).unwrap_or(false))
            .or_else(|| self.graph.find_var(name))
            .ok_or_else(|| CompilerError::not_found(format!("variable {}", name)))
    }
}
