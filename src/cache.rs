/// Row cache for windowed access, keyed by visible position.
///
/// Entries carry a last-access stamp from a monotonic counter. When a write
/// pushes the cache past `max_size`, the least recently accessed 20% are
/// dropped, repeatedly, until it fits again.

use crate::config::CacheConfig;
use crate::value::Row;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone)]
struct CacheEntry {
    row: Row,
    last_access: u64,
}

/// Result of a range lookup over `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeLookup {
    /// One slot per position; `None` where the row is not cached.
    pub rows: Vec<Option<Row>>,
    pub missing_indices: Vec<usize>,
    pub complete: bool,
}

#[derive(Debug)]
pub struct RowCache {
    config: CacheConfig,
    entries: FxHashMap<usize, CacheEntry>,
    clock: u64,
    version: u64,
}

impl RowCache {
    pub fn new(config: CacheConfig) -> Self {
        RowCache {
            config,
            entries: FxHashMap::default(),
            clock: 0,
            version: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn get(&mut self, position: usize) -> Option<&Row> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(&position)?;
        entry.last_access = stamp;
        Some(&entry.row)
    }

    pub fn contains(&self, position: usize) -> bool {
        self.entries.contains_key(&position)
    }

    pub fn set(&mut self, position: usize, row: Row) {
        self.insert(position, row);
        self.enforce_capacity();
    }

    fn insert(&mut self, position: usize, row: Row) {
        let last_access = self.tick();
        self.entries.insert(position, CacheEntry { row, last_access });
    }

    pub fn get_range(&mut self, start: usize, end: usize) -> RangeLookup {
        let mut rows = Vec::with_capacity(end.saturating_sub(start));
        let mut missing_indices = Vec::new();
        for position in start..end {
            match self.get(position) {
                Some(row) => rows.push(Some(row.clone())),
                None => {
                    rows.push(None);
                    missing_indices.push(position);
                }
            }
        }
        RangeLookup {
            complete: missing_indices.is_empty(),
            rows,
            missing_indices,
        }
    }

    /// Store `rows` at consecutive positions starting at `start`.
    pub fn set_range(&mut self, start: usize, rows: Vec<Row>) {
        for (offset, row) in rows.into_iter().enumerate() {
            self.insert(start + offset, row);
        }
        self.enforce_capacity();
    }

    /// Drop every entry. Positions no longer map to the same rows after a
    /// filter or sort change.
    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.version += 1;
    }

    /// Keep only `[keep_start - buffer, keep_end + buffer)` where buffer is
    /// the window length times `buffer_multiplier`.
    pub fn evict_outside_range(&mut self, keep_start: usize, keep_end: usize) {
        let window = keep_end.saturating_sub(keep_start);
        let buffer = (window as f64 * self.config.buffer_multiplier) as usize;
        let low = keep_start.saturating_sub(buffer);
        let high = keep_end.saturating_add(buffer);
        self.entries.retain(|&position, _| position >= low && position < high);
    }

    fn enforce_capacity(&mut self) {
        if self.entries.len() <= self.config.max_size {
            return;
        }
        let mut by_age: Vec<(u64, usize)> = self
            .entries
            .iter()
            .map(|(&position, entry)| (entry.last_access, position))
            .collect();
        by_age.sort_unstable();

        let mut oldest = by_age.into_iter().map(|(_, position)| position);
        while self.entries.len() > self.config.max_size {
            let batch = (self.entries.len() / 5).max(1);
            for position in oldest.by_ref().take(batch) {
                self.entries.remove(&position);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Default for RowCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ColumnValue;

    fn row(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("id", ColumnValue::Int(id));
        row
    }

    fn cache(max_size: usize) -> RowCache {
        RowCache::new(CacheConfig {
            max_size,
            buffer_multiplier: 0.5,
        })
    }

    #[test]
    fn test_get_range_reports_missing() {
        let mut cache = cache(100);
        cache.set_range(2, vec![row(2), row(3)]);
        let lookup = cache.get_range(0, 5);
        assert_eq!(lookup.rows.len(), 5);
        assert_eq!(lookup.missing_indices, vec![0, 1, 4]);
        assert!(!lookup.complete);
        assert_eq!(lookup.rows[3], Some(row(3)));

        assert!(cache.get_range(2, 4).complete);
    }

    #[test]
    fn test_invalidate_bumps_version() {
        let mut cache = cache(100);
        cache.set(0, row(0));
        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(cache.version(), 1);
        assert!(cache.get(0).is_none());
    }

    #[test]
    fn test_get_range_after_invalidate_is_all_missing() {
        let mut cache = cache(100);
        cache.set_range(5, (5..15).map(row).collect());
        let lookup = cache.get_range(5, 15);
        assert!(lookup.complete);
        assert!(lookup.missing_indices.is_empty());

        cache.invalidate();
        let lookup = cache.get_range(5, 15);
        assert!(!lookup.complete);
        assert_eq!(lookup.missing_indices, (5..15).collect::<Vec<_>>());
        assert!(lookup.rows.iter().all(Option::is_none));
    }

    #[test]
    fn test_evict_outside_range_keeps_buffer() {
        let mut cache = cache(1000);
        cache.set_range(0, (0..100).map(row).collect());
        // window 40..60, buffer 10
        cache.evict_outside_range(40, 60);
        assert_eq!(cache.len(), 40);
        assert!(cache.contains(30));
        assert!(cache.contains(69));
        assert!(!cache.contains(29));
        assert!(!cache.contains(70));
    }

    #[test]
    fn test_capacity_eviction_drops_least_recent() {
        let mut cache = cache(10);
        cache.set_range(0, (0..10).map(row).collect());
        // touch the two oldest so they survive
        cache.get(0);
        cache.get(1);
        cache.set(10, row(10));
        // 11 entries, 20% rounds down to 2
        assert_eq!(cache.len(), 9);
        assert!(cache.contains(0));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(!cache.contains(3));
        assert!(cache.contains(10));
    }

    #[test]
    fn test_bulk_write_larger_than_capacity_stays_bounded() {
        let mut cache = cache(10);
        cache.set_range(0, (0..50).map(row).collect());
        assert!(cache.len() <= 10);
        // the most recently written positions survive
        assert!(cache.contains(49));
        assert!(!cache.contains(0));

        cache.set_range(100, (100..1100).map(row).collect());
        assert!(cache.len() <= 10);
        assert!(cache.contains(1099));
    }
}
