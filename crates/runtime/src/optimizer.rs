//! Optimizer descriptor and the configs built from it

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_BETA1: f32 = 0.9;
const DEFAULT_BETA2: f32 = 0.999;
const DEFAULT_EPSILON: f32 = 1e-8;

/// Optimizer settings collected before a training session exists
///
/// Everything here is set through the executor's setters. The learning rate
/// is refreshed from the host on every training step, so `lr` only seeds the
/// first session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerDescriptor {
    kind: Option<String>,
    lr: f32,
    lr_var_name: Option<String>,
    attrs: BTreeMap<String, f32>,
    loss: Option<String>,
}

impl OptimizerDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_type(&mut self, kind: impl Into<String>) {
        self.kind = Some(kind.into());
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: f32) {
        self.attrs.insert(name.into(), value);
    }

    pub fn set_loss(&mut self, loss: impl Into<String>) {
        self.loss = Some(loss.into());
    }

    pub fn set_lr_var_name(&mut self, name: impl Into<String>) {
        self.lr_var_name = Some(name.into());
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn lr_var_name(&self) -> Option<&str> {
        self.lr_var_name.as_deref()
    }

    pub fn loss(&self) -> Option<&str> {
        self.loss.as_deref()
    }

    pub fn attr(&self, name: &str) -> Option<f32> {
        self.attrs.get(name).copied()
    }

    /// Resolve the descriptor into a concrete optimizer
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::PreconditionNotMet`] when no type was set
    /// - [`RuntimeError::Unimplemented`] for an unknown type
    pub fn build(&self) -> Result<OptimizerConfig> {
        let kind = self
            .kind
            .as_deref()
            .ok_or_else(|| RuntimeError::PreconditionNotMet("optimizer type not set".to_string()))?;
        match kind {
            "sgd" => Ok(OptimizerConfig::Sgd { lr: self.lr }),
            "adam" => Ok(OptimizerConfig::Adam {
                lr: self.lr,
                beta1: self.attr("beta1").unwrap_or(DEFAULT_BETA1),
                beta2: self.attr("beta2").unwrap_or(DEFAULT_BETA2),
                epsilon: self.attr("epsilon").unwrap_or(DEFAULT_EPSILON),
            }),
            other => Err(RuntimeError::Unimplemented(format!(
                "optimizer {} is not implemented",
                other
            ))),
        }
    }
}

/// A fully specified optimizer, as handed to a training session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerConfig {
    Sgd { lr: f32 },
    Adam { lr: f32, beta1: f32, beta2: f32, epsilon: f32 },
}

impl OptimizerConfig {
    pub fn lr(&self) -> f32 {
        match self {
            OptimizerConfig::Sgd { lr } | OptimizerConfig::Adam { lr, .. } => *lr,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OptimizerConfig::Sgd { .. } => "sgd",
            OptimizerConfig::Adam { .. } => "adam",
        }
    }
}

/// `(device prefix, host postfix)` pairs of the tensors an optimizer keeps
/// per weight
///
/// For weight `w` and pair `(p, q)` the device tensor is `p + w` and the host
/// variable is `w + q`. `None` (inference) and "sgd" only move the weight
/// itself. Unknown kinds move nothing.
pub fn prefix_postfix(kind: Option<&str>) -> &'static [(&'static str, &'static str)] {
    match kind {
        None | Some("sgd") => &[("", "")],
        Some("adam") => &[
            ("", ""),
            ("Accl1___", "_moment1_0"),
            ("Accl2___", "_moment2_0"),
            ("Step___", "_beta1_pow_acc_0"),
        ],
        Some(_) => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_type_is_precondition() {
        let err = OptimizerDescriptor::new().build().unwrap_err();
        assert!(matches!(err, RuntimeError::PreconditionNotMet(ref m) if m.contains("type not set")));
    }

    #[test]
    fn test_unknown_type_is_unimplemented() {
        let mut desc = OptimizerDescriptor::new();
        desc.set_type("lamb");
        let err = desc.build().unwrap_err();
        assert!(matches!(err, RuntimeError::Unimplemented(ref m) if m.contains("lamb")));
    }

    #[test]
    fn test_adam_defaults_and_overrides() {
        let mut desc = OptimizerDescriptor::new();
        desc.set_type("adam");
        desc.set_lr(0.01);
        desc.set_attr("beta2", 0.98);
        assert_eq!(
            desc.build().unwrap(),
            OptimizerConfig::Adam {
                lr: 0.01,
                beta1: 0.9,
                beta2: 0.98,
                epsilon: 1e-8
            }
        );
    }

    #[test]
    fn test_prefix_postfix_tables() {
        assert_eq!(prefix_postfix(None), &[("", "")]);
        assert_eq!(prefix_postfix(Some("sgd")).len(), 1);
        assert_eq!(prefix_postfix(Some("adam")).len(), 4);
        assert!(prefix_postfix(Some("rmsprop")).is_empty());
    }
}
