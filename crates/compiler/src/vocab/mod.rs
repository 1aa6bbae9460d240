//! Canonical operator vocabulary and its lowering handlers
//!
//! Every canonical operator is one record in the table in [`ops`]: name,
//! operand arity, output count and attribute schema. Records without special
//! needs lower through [`GenericLowering`]; `Constant`, `ReduceMean`,
//! `BatchNormalization` and `NllLoss` have hand-written handlers in
//! [`custom`].

#[macro_use]
mod macros;
pub mod custom;
pub mod ops;

pub use ops::{CanonicalOp, GenericLowering};

use crate::attrs::{AttrValue, AttributeMap};
use crate::error::Result;
use crate::program::{ProgramBuilder, TensorId};
use crate::registry::HandlerRegistry;
use std::sync::{Arc, OnceLock};

/// One canonical operator as seen by its lowering handler
#[derive(Debug, Clone)]
pub struct LoweringOp<'a> {
    pub op_type: &'a str,
    /// Resolved operand ids, in `__inputs__` order
    pub inputs: Vec<TensorId>,
    pub attrs: &'a AttributeMap,
    /// Length of the operator's `__outputs__` slot
    pub num_outputs: usize,
}

/// Lowers one canonical operator into target program calls
pub trait SymbolHandler: Send + Sync {
    /// Emit the operator; returns one id per output, in `__outputs__` order
    fn lower(&self, builder: &mut dyn ProgramBuilder, op: &LoweringOp<'_>) -> Result<Vec<TensorId>>;
}

impl<F> SymbolHandler for F
where
    F: Fn(&mut dyn ProgramBuilder, &LoweringOp<'_>) -> Result<Vec<TensorId>> + Send + Sync,
{
    fn lower(&self, builder: &mut dyn ProgramBuilder, op: &LoweringOp<'_>) -> Result<Vec<TensorId>> {
        self(builder, op)
    }
}

/// Canonical operator name → lowering handler
pub type LoweringRegistry = HandlerRegistry<dyn SymbolHandler>;

impl HandlerRegistry<dyn SymbolHandler> {
    /// Registry holding a handler for every canonical operator
    pub fn with_defaults() -> Self {
        let mut registry = HandlerRegistry::new("lowering");
        register_all(&mut registry);
        registry
    }

    /// Process-wide default registry, built on first use
    pub fn global() -> Arc<LoweringRegistry> {
        static GLOBAL: OnceLock<Arc<LoweringRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(LoweringRegistry::with_defaults()))
            .clone()
    }
}

/// Register the handler of every canonical operator
///
/// Names that already have a handler keep it.
pub fn register_all(registry: &mut LoweringRegistry) {
    let custom: [(&str, Arc<dyn SymbolHandler>); 4] = [
        ("Constant", Arc::new(custom::ConstantLowering)),
        ("ReduceMean", Arc::new(custom::ReduceMeanLowering)),
        ("BatchNormalization", Arc::new(custom::BatchNormLowering)),
        ("NllLoss", Arc::new(custom::NllLossLowering)),
    ];
    for (name, handler) in custom {
        if !registry.contains(name) {
            registry.register(name, handler);
        }
    }
    for op in CanonicalOp::ALL {
        if !registry.contains(op.name()) {
            registry.register(op.name(), Arc::new(GenericLowering(*op)));
        }
    }
}

/// Element kind of an attribute in a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Int,
    Ints,
    Float,
    Floats,
    Str,
}

/// What to do when a schema attribute is absent
#[derive(Debug, Clone, PartialEq)]
pub enum AttrDefault {
    /// Absent → `MissingAttribute`
    Required,
    /// Absent → this value
    Value(AttrValue),
    /// Absent → left out of the lowered call
    Nullable,
}

/// One attribute of a canonical operator's schema
#[derive(Debug, Clone, PartialEq)]
pub struct AttrSpec {
    pub name: &'static str,
    pub kind: AttrKind,
    pub default: AttrDefault,
}

impl AttrSpec {
    /// Read this attribute from `attrs`, applying the default rule
    pub fn resolve(&self, attrs: &AttributeMap) -> Result<Option<AttrValue>> {
        if !attrs.contains(self.name) {
            return match &self.default {
                AttrDefault::Required => Err(crate::error::CompilerError::MissingAttribute(
                    self.name.to_string(),
                )),
                AttrDefault::Value(v) => Ok(Some(v.clone())),
                AttrDefault::Nullable => Ok(None),
            };
        }
        let value = match self.kind {
            AttrKind::Int => AttrValue::Int(attrs.get_int(self.name)?),
            AttrKind::Ints => AttrValue::Ints(attrs.get_ints(self.name)?),
            AttrKind::Float => AttrValue::Float(attrs.get_float(self.name)?),
            AttrKind::Floats => AttrValue::Floats(attrs.get_floats(self.name)?),
            AttrKind::Str => AttrValue::Str(attrs.get_str(self.name)?),
        };
        Ok(Some(value))
    }
}
