//! Lowering a canonical graph into a target program
//!
//! One compile per model, in this order:
//!
//! ```text
//! canonicalize → init_inputs → lower_weights → lower_body → init_outputs → export
//! ```
//!
//! The compiler owns the program builder and the symbol table for the whole
//! compile; `export` hands out the serialized program together with the
//! ordered input and output ids.

use crate::canonical::{CanonicalizeStats, Canonicalizer, NameGenerator, RewriteRegistry, INPUTS_SLOT, OUTPUTS_SLOT};
use crate::dtype::{canonical_dtype, VarType};
use crate::error::{CompilerError, Result};
use crate::graph::Graph;
use crate::program::{ConstData, ProgramBuilder, ProgramRecorder, TensorId, TensorInfo};
use crate::symbols::SymbolTable;
use crate::tensor::WeightStore;
use crate::vocab::{LoweringOp, LoweringRegistry};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to do with a feed name that matches no graph variable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedPolicy {
    /// Log a warning and declare nothing
    #[default]
    Skip,
    /// Fail with `NotFound`
    Error,
}

/// Result of a compile
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProgram {
    /// Serialized target program
    pub blob: Vec<u8>,
    /// Declared input ids, in feed order
    pub inputs: Vec<TensorId>,
    /// Declared output ids, in fetch order
    pub outputs: Vec<TensorId>,
}

/// Counters for one compile
#[derive(Debug, Clone, Default)]
pub struct CompileStats {
    pub inputs: usize,
    pub weights: usize,
    pub lowered_ops: usize,
    pub outputs: usize,
    pub canonicalize: Option<CanonicalizeStats>,
    pub duration: Duration,
}

impl std::fmt::Display for CompileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Compile Statistics:")?;
        writeln!(f, "  Inputs: {}", self.inputs)?;
        writeln!(f, "  Weights: {}", self.weights)?;
        writeln!(f, "  Lowered ops: {}", self.lowered_ops)?;
        writeln!(f, "  Outputs: {}", self.outputs)?;
        if let Some(canonicalize) = &self.canonicalize {
            writeln!(f, "  Rewritten framework ops: {}", canonicalize.ops_rewritten)?;
        }
        write!(f, "  Time: {:?}", self.duration)
    }
}

/// Graph → target program compiler
pub struct Compiler {
    lowering: Arc<LoweringRegistry>,
    rewrites: Arc<RewriteRegistry>,
    builder: Box<dyn ProgramBuilder + Send>,
    symbols: SymbolTable,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    /// Framework names of the embedded weights, in declaration order
    weights: Vec<String>,
    names: NameGenerator,
    feed_policy: FeedPolicy,
    stats: CompileStats,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("weights", &self.weights)
            .field("symbols", &self.symbols.len())
            .field("feed_policy", &self.feed_policy)
            .finish()
    }
}

impl Compiler {
    /// Compiler recording into a fresh [`ProgramRecorder`]
    pub fn new(lowering: Arc<LoweringRegistry>) -> Self {
        Self::with_builder(lowering, RewriteRegistry::global(), Box::new(ProgramRecorder::new()))
    }

    pub fn with_builder(
        lowering: Arc<LoweringRegistry>,
        rewrites: Arc<RewriteRegistry>,
        builder: Box<dyn ProgramBuilder + Send>,
    ) -> Self {
        Self {
            lowering,
            rewrites,
            builder,
            symbols: SymbolTable::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            weights: Vec::new(),
            names: NameGenerator::new(),
            feed_policy: FeedPolicy::default(),
            stats: CompileStats::default(),
        }
    }

    pub fn with_feed_policy(mut self, policy: FeedPolicy) -> Self {
        self.feed_policy = policy;
        self
    }

    /// Full pipeline: canonicalize `graph` in place, then lower it
    #[tracing::instrument(skip_all, fields(feeds = feeds.len(), fetches = fetches.len()))]
    pub fn compile<S: AsRef<str>>(
        &mut self,
        graph: &mut Graph,
        feeds: &[S],
        fetches: &[S],
        store: Option<&dyn WeightStore>,
    ) -> Result<CompiledProgram> {
        let start = Instant::now();
        self.names.reseed();
        let canonicalizer = Canonicalizer::new(self.rewrites.clone(), self.lowering.clone());
        self.stats.canonicalize = Some(canonicalizer.run(graph, &mut self.names)?);

        self.init_inputs(graph, feeds)?;
        self.lower_weights(graph, store)?;
        self.lower_body(graph)?;
        self.init_outputs(fetches)?;
        let program = self.export()?;

        self.stats.duration = start.elapsed();
        info!(
            inputs = self.stats.inputs,
            weights = self.stats.weights,
            ops = self.stats.lowered_ops,
            outputs = self.stats.outputs,
            elapsed = ?self.stats.duration,
            "compile complete"
        );
        Ok(program)
    }

    /// Declare one program input per feed name and bind it
    #[tracing::instrument(skip_all)]
    pub fn init_inputs<S: AsRef<str>>(&mut self, graph: &Graph, feeds: &[S]) -> Result<()> {
        for feed in feeds {
            let name = feed.as_ref();
            let var = match graph.find_var(name).and_then(|id| graph.var(id)) {
                Some(var) => var,
                None => match self.feed_policy {
                    FeedPolicy::Skip => {
                        warn!(feed = name, "feed has no matching variable, skipping");
                        continue;
                    }
                    FeedPolicy::Error => {
                        return Err(CompilerError::not_found(format!(
                            "feed variable {} does not exist.",
                            name
                        )))
                    }
                },
            };
            if self.symbols.contains(name) {
                debug!(feed = name, "feed declared twice, keeping the first");
                continue;
            }

            let dtype = canonical_dtype(var.dtype.unwrap_or(VarType::Fp32));
            let info = TensorInfo::new(dtype, var.shape.clone());
            let id = self.builder.add_input_tensor(info, name);
            debug!(feed = name, id = %id, "declared input");
            self.symbols.insert(name, id.clone());
            self.inputs.push(id);
            self.stats.inputs += 1;
        }
        Ok(())
    }

    /// Embed every persistable variable that has a value in `store`
    #[tracing::instrument(skip_all)]
    pub fn lower_weights(&mut self, graph: &Graph, store: Option<&dyn WeightStore>) -> Result<()> {
        let store = store.ok_or_else(|| {
            CompilerError::PreconditionNotMet("lowering weights requires a weight store".to_string())
        })?;

        for id in graph.var_ids() {
            let var = match graph.var(id) {
                Some(var) if var.persistable => var,
                _ => continue,
            };
            if self.symbols.contains(&var.name) {
                continue;
            }
            let tensor = match store.find(&var.name) {
                Some(tensor) => tensor,
                None => continue,
            };

            let data = ConstData {
                info: TensorInfo::new(canonical_dtype(tensor.dtype()), tensor.shape().to_vec()),
                data: tensor.data().to_vec(),
            };
            let tensor_id = self.builder.add_initialized_input_tensor(data, &var.name)?;
            debug!(weight = %var.name, id = %tensor_id, "embedded weight");
            self.symbols.insert(var.name.clone(), tensor_id);
            self.weights.push(var.name.clone());
            self.stats.weights += 1;
        }
        Ok(())
    }

    /// Lower every operator in topological order
    #[tracing::instrument(skip_all)]
    pub fn lower_body(&mut self, graph: &Graph) -> Result<()> {
        let order = graph.topological_ops().map_err(CompilerError::CyclicGraph)?;
        for node in order {
            let desc = match graph.op(node) {
                Some(desc) => desc,
                None => continue,
            };
            let handler = self.lowering.lookup(&desc.op_type).ok_or_else(|| {
                CompilerError::not_found(format!(
                    "no lowering handler registered for operator {}",
                    desc.op_type
                ))
            })?;

            let input_names = if desc.has_input(INPUTS_SLOT) {
                desc.input(INPUTS_SLOT).to_vec()
            } else {
                desc.input_names()
            };
            let output_names = if desc.has_output(OUTPUTS_SLOT) {
                desc.output(OUTPUTS_SLOT).to_vec()
            } else {
                desc.output_names()
            };

            let op = LoweringOp {
                op_type: &desc.op_type,
                inputs: input_names.iter().map(|n| self.symbols.resolve(n)).collect(),
                attrs: &desc.attrs,
                num_outputs: output_names.len(),
            };
            let produced = handler.lower(&mut *self.builder, &op)?;
            if produced.len() < output_names.len() {
                return Err(CompilerError::invalid(format!(
                    "{} produced {} results for {} outputs",
                    desc.op_type,
                    produced.len(),
                    output_names.len()
                )));
            }
            for (name, id) in output_names.into_iter().zip(produced) {
                self.symbols.insert(name, id);
            }
            self.stats.lowered_ops += 1;
        }
        debug!(ops = self.stats.lowered_ops, "lowered body");
        Ok(())
    }

    /// Declare each fetch as a program output
    #[tracing::instrument(skip_all)]
    pub fn init_outputs<S: AsRef<str>>(&mut self, fetches: &[S]) -> Result<()> {
        for fetch in fetches {
            let name = fetch.as_ref();
            let id = self
                .symbols
                .get(name)
                .cloned()
                .ok_or_else(|| CompilerError::not_found(format!("output tensor {} does not exist.", name)))?;
            self.builder.add_output_tensor(&id)?;
            self.outputs.push(id);
            self.stats.outputs += 1;
        }
        Ok(())
    }

    /// Serialized program plus ordered input and output ids
    pub fn export(&self) -> Result<CompiledProgram> {
        Ok(CompiledProgram {
            blob: self.builder.serialize()?,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        })
    }

    /// Write the serialized program to `path`
    pub fn save_program(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = self.builder.serialize()?;
        std::fs::write(path.as_ref(), blob)?;
        info!(path = %path.as_ref().display(), "saved compiled program");
        Ok(())
    }

    /// Framework name → target id bindings
    pub fn tensors(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Names of embedded weights, in declaration order
    pub fn weights(&self) -> &[String] {
        &self.weights
    }

    /// Shape and type of the tensor bound to framework name `name`
    pub fn tensor_info(&self, name: &str) -> Result<TensorInfo> {
        let id = self
            .symbols
            .get(name)
            .ok_or_else(|| CompilerError::not_found(format!("tensor {}", name)))?;
        self.builder.tensor_info(id)
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::TargetProgram;
    use crate::tensor::{HostTensor, Scope};

    fn linear_graph() -> Graph {
        let mut graph = Graph::new();
        graph.add_var("x").shape(vec![4, 3]).dtype(VarType::Fp32).finish();
        graph
            .add_var("w")
            .shape(vec![3, 2])
            .dtype(VarType::Fp32)
            .persistable(true)
            .finish();
        graph
            .add_op("matmul_v2")
            .input("X", &["x"])
            .input("Y", &["w"])
            .output("Out", &["h"])
            .finish()
            .unwrap();
        graph
            .add_op("relu")
            .input("X", &["h"])
            .output("Out", &["y"])
            .finish()
            .unwrap();
        graph
    }

    fn weights() -> Scope {
        let mut scope = Scope::new();
        scope.set("w", HostTensor::from_f32(vec![3, 2], &[0.5; 6]).unwrap());
        scope
    }

    #[test]
    fn test_compile_linear_model() {
        let mut graph = linear_graph();
        let mut compiler = Compiler::new(LoweringRegistry::global());
        let scope = weights();
        let program = compiler
            .compile(&mut graph, &["x"], &["y"], Some(&scope))
            .unwrap();

        assert_eq!(program.inputs.len(), 1);
        assert_eq!(program.outputs.len(), 1);
        assert_eq!(compiler.weights(), ["w".to_string()]);
        assert_eq!(compiler.tensor_info("y").unwrap().shape, vec![4, 2]);

        let decoded = TargetProgram::from_bytes(&program.blob).unwrap();
        let kinds: Vec<_> = decoded.ops.iter().map(|op| op.op_type.as_str()).collect();
        assert_eq!(kinds, vec!["Gemm", "Relu"]);
        assert_eq!(decoded.initializers[0].id, "w");
        assert_eq!(compiler.stats().lowered_ops, 2);
    }

    #[test]
    fn test_lower_weights_requires_store() {
        let graph = linear_graph();
        let mut compiler = Compiler::new(LoweringRegistry::global());
        let err = compiler.lower_weights(&graph, None).unwrap_err();
        assert!(matches!(err, CompilerError::PreconditionNotMet(_)));
    }

    #[test]
    fn test_feed_policy_error() {
        let graph = linear_graph();
        let mut compiler = Compiler::new(LoweringRegistry::global()).with_feed_policy(FeedPolicy::Error);
        let err = compiler.init_inputs(&graph, &["missing"]).unwrap_err();
        assert!(matches!(err, CompilerError::NotFound(msg) if msg.contains("missing")));
    }

    #[test]
    fn test_unregistered_canonical_kind() {
        let mut graph = Graph::new();
        graph.add_var("x").finish();
        graph
            .add_op("Relu")
            .input(INPUTS_SLOT, &["x"])
            .output(OUTPUTS_SLOT, &["y"])
            .finish()
            .unwrap();
        let empty = Arc::new(LoweringRegistry::new("lowering"));
        let mut compiler = Compiler::new(empty);
        let err = compiler.lower_body(&graph).unwrap_err();
        assert!(matches!(err, CompilerError::NotFound(msg) if msg.contains("Relu")));
    }

    #[test]
    fn test_save_program_writes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_compiled.bin");
        let mut graph = linear_graph();
        let mut compiler = Compiler::new(LoweringRegistry::global());
        let program = compiler
            .compile(&mut graph, &["x"], &["y"], Some(&weights()))
            .unwrap();
        compiler.save_program(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), program.blob);
    }
}
