//! Framework tensor name → target tensor id

use crate::program::TensorId;
use rustc_hash::FxHashMap;
use tracing::warn;

/// Append-only mapping from framework variable names to target tensor ids
///
/// The first binding of a name wins; bindings are never replaced.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    ids: FxHashMap<String, TensorId>,
    /// Names in binding order
    order: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `id`; a name that is already bound keeps its first id
    pub fn insert(&mut self, name: impl Into<String>, id: impl Into<TensorId>) -> bool {
        let name = name.into();
        let id = id.into();
        if let Some(existing) = self.ids.get(&name) {
            warn!(
                name = %name,
                existing = %existing,
                ignored = %id,
                "tensor already bound, keeping the first binding"
            );
            return false;
        }
        self.order.push(name.clone());
        self.ids.insert(name, id);
        true
    }

    pub fn get(&self, name: &str) -> Option<&TensorId> {
        self.ids.get(name)
    }

    /// Bound id, or `name` itself when unbound
    pub fn resolve(&self, name: &str) -> TensorId {
        self.ids.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ids.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `(name, id)` pairs in binding order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorId)> {
        self.order
            .iter()
            .filter_map(move |name| self.ids.get(name).map(|id| (name.as_str(), id)))
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}
