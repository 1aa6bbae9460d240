//! Device weight id → host variable table

use graft_compiler::{TensorId, TensorInfo};

/// Host side of one transferred device tensor
#[derive(Debug, Clone, PartialEq)]
pub struct WeightsIoEntry {
    /// Host variable the tensor is copied from and back into
    pub host_name: String,
    /// Device-side shape and element type
    pub info: TensorInfo,
}

/// Ordered table of every tensor moved between host and device
///
/// Built once when a session is prepared and reused for every transfer.
/// Entries keep insertion order; re-inserting an id replaces its entry in
/// place.
#[derive(Debug, Clone, Default)]
pub struct WeightsIo {
    entries: Vec<(TensorId, WeightsIoEntry)>,
}

impl WeightsIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<TensorId>, host_name: impl Into<String>, info: TensorInfo) {
        let id = id.into();
        let entry = WeightsIoEntry {
            host_name: host_name.into(),
            info,
        };
        match self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, slot)) => *slot = entry,
            None => self.entries.push((id, entry)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&WeightsIoEntry> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, entry)| entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &WeightsIoEntry)> {
        self.entries.iter().map(|(id, entry)| (id, entry))
    }

    pub fn ids(&self) -> impl Iterator<Item = &TensorId> {
        self.entries.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
