//! Activations: one operand, one result, a canonical twin

use super::x_and_out;
use crate::attrs::AttributeMap;
use crate::canonical::{OpBuilder, RewriteHandler};
use crate::error::Result;
use crate::graph::NodeId;

/// `X → Out` mapped onto the canonical operator named by the field
#[derive(Debug, Clone, Copy)]
pub struct UnaryRewrite(pub &'static str);

impl RewriteHandler for UnaryRewrite {
    fn rewrite(&self, b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
        let (x, out) = x_and_out(b, node)?;
        b.create_base_op(self.0, &[x], &[out], AttributeMap::new())?;
        Ok(())
    }
}

/// `softmax`: keeps `axis` (default -1)
#[derive(Debug, Clone, Copy)]
pub struct SoftmaxRewrite;

impl RewriteHandler for SoftmaxRewrite {
    fn rewrite(&self, b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
        let (x, out) = x_and_out(b, node)?;
        let axis = b.attrs(node)?.get_int_or("axis", -1)?;
        b.create_base_op("Softmax", &[x], &[out], AttributeMap::new().with("axis", axis))?;
        Ok(())
    }
}
