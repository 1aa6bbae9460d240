//! Element-wise arithmetic with the framework's `axis` broadcast rule
//!
//! With `axis = k` the smaller operand `Y` lines up with dims `k..` of `X`.
//! The canonical operators broadcast from the right, so `Y` gets trailing
//! unit dims appended first:
//!
//!   X: [N, C, H, W], Y: [C], axis = 1  →  Y reshaped to [C, 1, 1]

use crate::attrs::AttributeMap;
use crate::canonical::{OpBuilder, RewriteHandler};
use crate::error::{CompilerError, Result};
use crate::graph::NodeId;
use std::iter;

/// `elementwise_*` onto the canonical operator named by the field
#[derive(Debug, Clone, Copy)]
pub struct ElementwiseRewrite(pub &'static str);

impl RewriteHandler for ElementwiseRewrite {
    fn rewrite(&self, b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
        let x = b.input_node("X", node, 0)?;
        let mut y = b.input_node("Y", node, 0)?;
        let out = b.output_node("Out", node, 0)?;

        let axis = b.attrs(node)?.get_int_or("axis", -1)?;
        if axis != -1 {
            let x_shape = b.input_shape("X", node, 0)?;
            let y_shape = b.input_shape("Y", node, 0)?;
            if let Some(target) = aligned_shape(&x_shape, &y_shape, axis)? {
                let reshape = b.create_reshape(&[y], &[], &target)?;
                y = b.first_output(reshape)?;
            }
        }

        b.create_base_op(self.0, &[x, y], &[out], AttributeMap::new())?;
        Ok(())
    }
}

/// Shape `y` needs to broadcast from the right against `x` at `axis`, or
/// `None` when it already does
fn aligned_shape(x: &[i64], y: &[i64], axis: i64) -> Result<Option<Vec<i64>>> {
    if y.len() >= x.len() {
        return Ok(None);
    }
    let axis = if axis < 0 { axis + x.len() as i64 } else { axis };
    let trailing = x.len() as i64 - axis - y.len() as i64;
    if axis < 0 || trailing < 0 {
        return Err(CompilerError::invalid(format!(
            "cannot align shape {:?} with {:?} at axis {}",
            y, x, axis
        )));
    }
    if trailing == 0 {
        return Ok(None);
    }
    let target = y
        .iter()
        .copied()
        .chain(iter::repeat(1).take(trailing as usize))
        .collect();
    Ok(Some(target))
}
