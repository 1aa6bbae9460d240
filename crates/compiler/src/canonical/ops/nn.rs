//! Training-graph operators: dropout, cross entropy, batch norm

use super::{emit, x_and_out};
use crate::attrs::AttributeMap;
use crate::canonical::OpBuilder;
use crate::error::{CompilerError, Result};
use crate::graph::NodeId;

/// `dropout`
///
/// | mode                      | result                |
/// |---------------------------|-----------------------|
/// | training                  | `Dropout(ratio = p)`  |
/// | test, `upscale_in_train`  | `Identity`            |
/// | test, `downgrade_in_infer`| `X * (1 - p)`         |
pub fn dropout(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let attrs = b.attrs(node)?;
    let prob = attrs.get_float_or("dropout_prob", 0.5)?;
    let is_test = attrs.get_bool_or("is_test", false)?;
    let implementation = attrs.get_str_or("dropout_implementation", "downgrade_in_infer".to_string())?;
    let (x, out) = x_and_out(b, node)?;

    if !is_test {
        b.create_base_op("Dropout", &[x], &[out], AttributeMap::new().with("ratio", prob))?;
        return Ok(());
    }
    match implementation.as_str() {
        "upscale_in_train" => {
            b.create_base_op("Identity", &[x], &[out], AttributeMap::new())?;
        }
        "downgrade_in_infer" => {
            let dtype = b.input_dtype("X", node, 0)?;
            let keep = b.create_scalar_constant(1.0 - prob, dtype)?;
            let keep = b.first_output(keep)?;
            b.create_base_op("Mul", &[x, keep], &[out], AttributeMap::new())?;
        }
        other => {
            return Err(CompilerError::InvalidAttribute(format!(
                "dropout_implementation {:?}",
                other
            )))
        }
    }
    Ok(())
}

/// `cross_entropy2` over probabilities `X` and hard labels `Label[.., 1]`:
/// `NllLoss(Log(X), squeeze(Label))`, unreduced, reshaped back to the label
/// shape
pub fn cross_entropy2(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let ignore_index = b.attrs(node)?.get_int_or("ignore_index", -100)?;
    let x = b.input_node("X", node, 0)?;
    let label = b.input_node("Label", node, 0)?;
    let y = b.output_node("Y", node, 0)?;
    let label_shape = b.input_shape("Label", node, 0)?;
    if label_shape.last() != Some(&1) {
        return Err(CompilerError::invalid(format!(
            "cross_entropy2 expects labels with a trailing unit dim, got {:?}",
            label_shape
        )));
    }

    let log_probs = emit(b, "Log", &[x], AttributeMap::new())?;
    let squeezed = b.create_reshape(&[label], &[], &label_shape[..label_shape.len() - 1])?;
    let squeezed = b.first_output(squeezed)?;
    let loss = emit(
        b,
        "NllLoss",
        &[log_probs, squeezed],
        AttributeMap::new()
            .with("reduction", "none")
            .with("ignoreIndex", ignore_index),
    )?;
    b.create_reshape(&[loss], &[y], &label_shape)?;
    Ok(())
}

const BATCH_NORM_INPUTS: [&str; 5] = ["X", "Scale", "Bias", "Mean", "Variance"];
const BATCH_NORM_STATS: [&str; 4] = ["MeanOut", "VarianceOut", "SavedMean", "SavedVariance"];

/// `batch_norm`: one result in inference (`is_test` or
/// `use_global_stats`), otherwise the result plus running and saved
/// statistics
pub fn batch_norm(b: &mut OpBuilder<'_>, node: NodeId) -> Result<()> {
    let attrs = b.attrs(node)?;
    let inference = attrs.get_bool_or("is_test", false)? || attrs.get_bool_or("use_global_stats", false)?;
    let layout = attrs.get_str_or("data_layout", "NCHW".to_string())?;
    if layout != "NCHW" {
        return Err(CompilerError::Unimplemented(format!(
            "batch_norm with data_layout {}",
            layout
        )));
    }

    let mut inputs = Vec::with_capacity(BATCH_NORM_INPUTS.len());
    for slot in BATCH_NORM_INPUTS {
        inputs.push(b.input_node(slot, node, 0)?);
    }
    let mut outputs = vec![b.output_node("Y", node, 0)?];
    if !inference {
        for slot in BATCH_NORM_STATS {
            let var = match b.maybe_output_node(slot, node, 0) {
                Some(var) => var,
                None => b.make_variable(),
            };
            outputs.push(var);
        }
    }

    let bn = b.create_base_op("BatchNormalization", &inputs, &outputs, AttributeMap::new())?;
    b.copy_attr("epsilon", node, bn, true)?;
    b.copy_attr("momentum", node, bn, true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use crate::canonical::OUTPUTS_SLOT;
    use crate::dtype::VarType;
    use crate::graph::Graph;

    fn dropout_graph(is_test: bool, implementation: &str) -> Graph {
        let mut graph = Graph::new();
        graph.add_var("x").shape(vec![4, 8]).dtype(VarType::Fp32).finish();
        graph
            .add_op("dropout")
            .input("X", &["x"])
            .output("Out", &["y"])
            .output("Mask", &["mask"])
            .attr("dropout_prob", 0.25f32)
            .attr("is_test", is_test)
            .attr("dropout_implementation", implementation)
            .finish()
            .unwrap();
        graph
    }

    #[test]
    fn test_dropout_training() {
        let mut graph = dropout_graph(false, "upscale_in_train");
        canonicalize(&mut graph);
        assert_eq!(desc(&graph, "Dropout").attrs.get_float("ratio").unwrap(), 0.25);
        assert_eq!(producer(&graph, "y"), "Dropout");
    }

    #[test]
    fn test_dropout_inference_modes() {
        let mut graph = dropout_graph(true, "upscale_in_train");
        canonicalize(&mut graph);
        assert_eq!(graph.op_histogram(), vec![("Identity".to_string(), 1)]);

        let mut graph = dropout_graph(true, "downgrade_in_infer");
        canonicalize(&mut graph);
        assert_eq!(producer(&graph, "y"), "Mul");
        let constant = desc(&graph, "Constant");
        assert_eq!(constant.attrs.get_floats("value").unwrap(), vec![0.75]);
        assert_eq!(constant.attrs.get_ints("dims").unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_cross_entropy_chain() {
        let mut graph = Graph::new();
        graph.add_var("p").shape(vec![-1, 10]).dtype(VarType::Fp32).finish();
        graph.add_var("label").shape(vec![-1, 1]).dtype(VarType::Int64).finish();
        graph
            .add_op("cross_entropy2")
            .input("X", &["p"])
            .input("Label", &["label"])
            .output("Y", &["ce"])
            .output("MatchX", &["match_x"])
            .output("XShape", &["xshape"])
            .finish()
            .unwrap();
        canonicalize(&mut graph);

        let nll = desc(&graph, "NllLoss");
        assert_eq!(nll.attrs.get_str("reduction").unwrap(), "none");
        assert_eq!(nll.attrs.get_int("ignoreIndex").unwrap(), -100);
        let operands = operands(&graph, "NllLoss");
        assert_eq!(producer(&graph, &operands[0]), "Log");
        assert_eq!(producer(&graph, &operands[1]), "Reshape");
        assert_eq!(producer(&graph, "ce"), "Reshape");
    }

    fn batch_norm_graph(is_test: bool) -> Graph {
        let mut graph = Graph::new();
        graph.add_var("x").shape(vec![2, 8, 4, 4]).finish();
        for name in ["scale", "bias", "mean", "var"] {
            graph.add_var(name).shape(vec![8]).persistable(true).finish();
        }
        graph
            .add_op("batch_norm")
            .input("X", &["x"])
            .input("Scale", &["scale"])
            .input("Bias", &["bias"])
            .input("Mean", &["mean"])
            .input("Variance", &["var"])
            .output("Y", &["y"])
            .output("MeanOut", &["mean_out"])
            .output("VarianceOut", &["var_out"])
            .attr("epsilon", 1e-3f32)
            .attr("is_test", is_test)
            .finish()
            .unwrap();
        graph
    }

    #[test]
    fn test_batch_norm_inference_single_output() {
        let mut graph = batch_norm_graph(true);
        canonicalize(&mut graph);
        let bn = desc(&graph, "BatchNormalization");
        assert_eq!(bn.output(OUTPUTS_SLOT), ["y".to_string()]);
        assert_eq!(bn.attrs.get_float("epsilon").unwrap(), 1e-3);
        assert!(!bn.attrs.contains("momentum"));
    }

    #[test]
    fn test_batch_norm_training_fills_missing_statistics() {
        let mut graph = batch_norm_graph(false);
        canonicalize(&mut graph);
        let outputs = desc(&graph, "BatchNormalization").output(OUTPUTS_SLOT).to_vec();
        assert_eq!(outputs.len(), 5);
        assert_eq!(&outputs[..3], &["y", "mean_out", "var_out"]);
        assert!(outputs[3].starts_with("_gen_"));
        assert!(outputs[4].starts_with("_gen_"));
    }
}
