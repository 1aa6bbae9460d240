//! Operator attributes
//!
//! An [`AttributeMap`] keeps insertion order so that lowered programs are
//! deterministic and diffs of serialized programs stay readable.

use crate::error::{CompilerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Floats(Vec<f32>),
    Bool(bool),
    Str(String),
    Strs(Vec<String>),
    None,
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Ints(_) => "ints",
            AttrValue::Float(_) => "float",
            AttrValue::Floats(_) => "floats",
            AttrValue::Bool(_) => "bool",
            AttrValue::Str(_) => "string",
            AttrValue::Strs(_) => "strings",
            AttrValue::None => "none",
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Ints(v) => write!(f, "{:?}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Floats(v) => write!(f, "{:?}", v),
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Str(v) => write!(f, "{:?}", v),
            AttrValue::Strs(v) => write!(f, "{:?}", v),
            AttrValue::None => write!(f, "none"),
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v)
    }
}

impl From<Vec<f32>> for AttrValue {
    fn from(v: Vec<f32>) -> Self {
        AttrValue::Floats(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(v: Vec<String>) -> Self {
        AttrValue::Strs(v)
    }
}

/// Ordered name → value mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMap {
    entries: Vec<(String, AttrValue)>,
}

macro_rules! typed_getter {
    ($get:ident, $get_or:ident, $variant:ident, $ty:ty) => {
        /// Required attribute; absent → [`CompilerError::MissingAttribute`]
        pub fn $get(&self, name: &str) -> Result<$ty> {
            match self.get(name) {
                Some(AttrValue::$variant(v)) => Ok(v.clone()),
                Some(AttrValue::None) | None => {
                    Err(CompilerError::MissingAttribute(name.to_string()))
                }
                Some(other) => Err(CompilerError::InvalidAttribute(format!(
                    "{} is {}, expected {}",
                    name,
                    other.kind(),
                    stringify!($variant).to_lowercase()
                ))),
            }
        }

        /// Nullable attribute; absent → `default`
        pub fn $get_or(&self, name: &str, default: $ty) -> Result<$ty> {
            match self.get(name) {
                Some(AttrValue::None) | None => Ok(default),
                Some(_) => self.$get(name),
            }
        }
    };
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the original position on replace
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(self.get(name), Some(v) if *v != AttrValue::None)
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        let pos = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    typed_getter!(get_int, get_int_or, Int, i64);
    typed_getter!(get_ints, get_ints_or, Ints, Vec<i64>);
    typed_getter!(get_float, get_float_or, Float, f32);
    typed_getter!(get_floats, get_floats_or, Floats, Vec<f32>);
    typed_getter!(get_bool, get_bool_or, Bool, bool);
    typed_getter!(get_str, get_str_or, Str, String);
    typed_getter!(get_strs, get_strs_or, Strs, Vec<String>);
}

impl FromIterator<(String, AttrValue)> for AttributeMap {
    fn from_iter<I: IntoIterator<Item = (String, AttrValue)>>(iter: I) -> Self {
        let mut map = AttributeMap::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}
