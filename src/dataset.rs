/// Loaded dataset.
///
/// Rows are stored row-major and normalized against the column keys seen
/// at load time: keys are discovered in first-seen order across all rows and
/// a key a row does not carry reads as null. The original index of a row is
/// its position in the load order and never changes until the next load.

use crate::value::{sort_values, ColumnValue, Row};
use rustc_hash::{FxHashMap, FxHashSet};

static NULL_VALUE: ColumnValue = ColumnValue::Null;

/// Position of a column in the dataset schema, or `None` for a key the
/// dataset does not have (every cell of such a column reads as null).
pub type ColumnRef = Option<usize>;

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    column_keys: Vec<String>,
    lookup: FxHashMap<String, usize>,
    rows: Vec<Vec<ColumnValue>>,
}

impl Dataset {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut column_keys: Vec<String> = Vec::new();
        let mut lookup: FxHashMap<String, usize> = FxHashMap::default();

        for row in &rows {
            for key in row.keys() {
                if !lookup.contains_key(key) {
                    lookup.insert(key.to_string(), column_keys.len());
                    column_keys.push(key.to_string());
                }
            }
        }

        let width = column_keys.len();
        let cells = rows
            .into_iter()
            .map(|row| {
                let mut cells = vec![ColumnValue::Null; width];
                for (key, value) in row.iter() {
                    if let Some(&idx) = lookup.get(key) {
                        cells[idx] = value.clone();
                    }
                }
                cells
            })
            .collect();

        Dataset {
            column_keys,
            lookup,
            rows: cells,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_keys(&self) -> &[String] {
        &self.column_keys
    }

    pub fn column(&self, key: &str) -> ColumnRef {
        self.lookup.get(key).copied()
    }

    /// Cell at `(original_index, column)`. Out-of-range rows and unknown
    /// columns read as null.
    pub fn value(&self, original_index: usize, column: ColumnRef) -> &ColumnValue {
        match (column, self.rows.get(original_index)) {
            (Some(col), Some(cells)) => cells.get(col).unwrap_or(&NULL_VALUE),
            _ => &NULL_VALUE,
        }
    }

    pub fn value_by_key(&self, original_index: usize, key: &str) -> &ColumnValue {
        self.value(original_index, self.column(key))
    }

    /// Materialize one row with every dataset column.
    pub fn get_row(&self, original_index: usize) -> Option<Row> {
        let cells = self.rows.get(original_index)?;
        Some(
            self.column_keys
                .iter()
                .cloned()
                .zip(cells.iter().cloned())
                .collect(),
        )
    }

    /// Materialize rows by original index, skipping indices out of range.
    pub fn get_rows(&self, original_indices: &[u32]) -> Vec<Row> {
        original_indices
            .iter()
            .filter_map(|&idx| self.get_row(idx as usize))
            .collect()
    }

    pub fn all_rows(&self) -> Vec<Row> {
        (0..self.rows.len()).filter_map(|idx| self.get_row(idx)).collect()
    }

    /// Distinct values of a column, sorted ascending with null last.
    pub fn unique_values(&self, key: &str) -> Vec<ColumnValue> {
        let column = self.column(key);
        let mut seen: FxHashSet<&ColumnValue> = FxHashSet::default();
        let mut values: Vec<ColumnValue> = Vec::new();
        for idx in 0..self.rows.len() {
            let value = self.value(idx, column);
            if seen.insert(value) {
                values.push(value.clone());
            }
        }
        sort_values(&mut values, false);
        values
    }
}
