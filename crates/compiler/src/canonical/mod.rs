//! Canonicalization pass
//!
//! Rewrites framework operators into the canonical vocabulary, in place:
//!
//! ```text
//! for op in topological order:
//!     canonical already?  → keep
//!     rewrite(op)         → new canonical nodes, wired to op's neighbours
//!     failure             → roll back the rewrite's journaled edits, report
//!     success             → detach and delete op
//! ```
//!
//! A rewrite only touches the op's direct neighbourhood plus nodes it creates.

pub mod op_builder;
pub mod ops;

pub use op_builder::{NameGenerator, OpBuilder, INPUTS_SLOT, OUTPUTS_SLOT};

use crate::error::{CompilerError, Result};
use crate::graph::{Graph, NodeId};
use crate::registry::HandlerRegistry;
use crate::vocab::LoweringRegistry;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Rewrites one framework operator into canonical operators
pub trait RewriteHandler: Send + Sync {
    /// Emit replacement nodes for `node`; the driver removes `node` afterwards
    fn rewrite(&self, builder: &mut OpBuilder<'_>, node: NodeId) -> Result<()>;
}

impl<F> RewriteHandler for F
where
    F: Fn(&mut OpBuilder<'_>, NodeId) -> Result<()> + Send + Sync,
{
    fn rewrite(&self, builder: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
        self(builder, node)
    }
}

/// Framework operator kind → rewrite
pub type RewriteRegistry = HandlerRegistry<dyn RewriteHandler>;

impl HandlerRegistry<dyn RewriteHandler> {
    /// Registry holding every built-in rewrite
    pub fn with_defaults() -> Self {
        let mut registry = HandlerRegistry::new("rewrite");
        ops::register_defaults(&mut registry);
        registry
    }

    /// Process-wide default registry, built on first use
    pub fn global() -> Arc<RewriteRegistry> {
        static GLOBAL: OnceLock<Arc<RewriteRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(RewriteRegistry::with_defaults()))
            .clone()
    }
}

/// Statistics for one canonicalization run
#[derive(Debug, Clone, Default)]
pub struct CanonicalizeStats {
    pub ops_rewritten: usize,
    pub ops_kept: usize,
    pub nodes_before: usize,
    pub nodes_after: usize,
    /// Rewritten framework kinds with counts, sorted by kind
    pub rewritten_kinds: Vec<(String, usize)>,
    pub duration: Duration,
}

impl std::fmt::Display for CanonicalizeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Canonicalization Statistics:")?;
        writeln!(f, "  Rewritten ops: {}", self.ops_rewritten)?;
        writeln!(f, "  Kept canonical ops: {}", self.ops_kept)?;
        writeln!(f, "  Nodes: {} → {}", self.nodes_before, self.nodes_after)?;
        for (kind, count) in &self.rewritten_kinds {
            writeln!(f, "    {}: {}", kind, count)?;
        }
        write!(f, "  Time: {:?}", self.duration)
    }
}

/// Driver for the canonicalization pass
pub struct Canonicalizer {
    rewrites: Arc<RewriteRegistry>,
    /// Kinds registered here are already canonical and left alone
    canonical: Arc<LoweringRegistry>,
}

impl Canonicalizer {
    pub fn new(rewrites: Arc<RewriteRegistry>, canonical: Arc<LoweringRegistry>) -> Self {
        Self { rewrites, canonical }
    }

    /// Canonicalizer over the process-wide registries
    pub fn with_defaults() -> Self {
        Self::new(RewriteRegistry::global(), LoweringRegistry::global())
    }

    /// Rewrite every framework operator of `graph`
    ///
    /// `names` supplies synthetic variable names; pass the compilation's
    /// generator so names stay unique across the whole compile.
    #[tracing::instrument(skip(self, graph, names))]
    pub fn run(&self, graph: &mut Graph, names: &mut NameGenerator) -> Result<CanonicalizeStats> {
        let start = Instant::now();
        let mut stats = CanonicalizeStats {
            nodes_before: graph.node_count(),
            ..Default::default()
        };
        let mut kinds: std::collections::BTreeMap<String, usize> = Default::default();

        let order = graph.topological_ops().map_err(CompilerError::CyclicGraph)?;
        info!(ops = order.len(), "canonicalizing graph");

        for node in order {
            let op_type = match graph.op(node) {
                Some(op) => op.op_type.clone(),
                None => continue,
            };
            if self.canonical.contains(&op_type) {
                stats.ops_kept += 1;
                continue;
            }
            let rewrite = self.rewrites.lookup(&op_type).ok_or_else(|| {
                CompilerError::not_found(format!(
                    "no canonicalization rewrite registered for operator {}",
                    op_type
                ))
            })?;

            let mut builder = OpBuilder::new(graph, names);
            if let Err(err) = rewrite.rewrite(&mut builder, node) {
                builder.rollback();
                return Err(CompilerError::RewriteFailed {
                    op_type,
                    reason: err.to_string(),
                });
            }

            graph.clear_node(node);
            graph.remove_node(node)?;
            debug!(op = %op_type, "rewrote operator");
            stats.ops_rewritten += 1;
            *kinds.entry(op_type).or_insert(0) += 1;
        }

        stats.nodes_after = graph.node_count();
        stats.rewritten_kinds = kinds.into_iter().collect();
        stats.duration = start.elapsed();
        info!(
            rewritten = stats.ops_rewritten,
            kept = stats.ops_kept,
            nodes_before = stats.nodes_before,
            nodes_after = stats.nodes_after,
            "canonicalization complete"
        );
        Ok(stats)
    }
}
