/// Typed index store.
///
/// Holds the currently visible subset and order of rows as a compact array
/// of original indices: `visible[i]` is the original index of the row shown
/// at visible position `i`. Observers are notified after every mutation.

use crate::query::QueryResult;
use std::fmt;
use std::sync::Arc;

/// Shared, immutable index array. Cloning bumps a reference count; the
/// indices themselves are never copied when a buffer changes hands.
pub type IndexBuffer = Arc<[u32]>;

/// Counts reported to observers after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexChange {
    pub total_count: usize,
    pub visible_count: usize,
}

type Observer = Box<dyn Fn(&IndexChange) + Send>;

pub struct IndexStore {
    visible: IndexBuffer,
    total_count: usize,
    observers: Vec<Observer>,
}

impl IndexStore {
    pub fn new() -> Self {
        IndexStore {
            visible: Arc::from(Vec::new()),
            total_count: 0,
            observers: Vec::new(),
        }
    }

    /// Identity mapping over `row_count` rows.
    pub fn initialize(&mut self, row_count: usize) {
        self.visible = (0..row_count as u32).collect::<Vec<u32>>().into();
        self.total_count = row_count;
        self.notify();
    }

    /// Replace the visible mapping with a query result.
    pub fn apply_result(&mut self, result: &QueryResult) {
        self.visible = Arc::clone(&result.indices);
        self.total_count = result.total_count;
        self.notify();
    }

    pub fn to_original(&self, visible_index: usize) -> Option<u32> {
        self.visible.get(visible_index).copied()
    }

    /// Visible position of an original index.
    ///
    /// This is a linear scan over the mapping; do not call it per row.
    pub fn to_visible(&self, original_index: u32) -> Option<usize> {
        self.visible.iter().position(|&idx| idx == original_index)
    }

    /// Original indices for visible positions `[start, end)`, clamped to the
    /// mapping. Empty or inverted ranges give an empty slice.
    pub fn range_slice(&self, start: usize, end: usize) -> Vec<u32> {
        let end = end.min(self.visible.len());
        if start >= end {
            return Vec::new();
        }
        self.visible[start..end].to_vec()
    }

    pub fn indices(&self) -> &IndexBuffer {
        &self.visible
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: Fn(&IndexChange) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Drop the mapping (as after an engine cleanup) and notify observers.
    pub fn clear(&mut self) {
        self.visible = Arc::from(Vec::new());
        self.total_count = 0;
        self.notify();
    }

    fn notify(&self) {
        let change = IndexChange {
            total_count: self.total_count,
            visible_count: self.visible.len(),
        };
        for observer in &self.observers {
            observer(&change);
        }
    }
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexStore")
            .field("total_count", &self.total_count)
            .field("visible_count", &self.visible.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
