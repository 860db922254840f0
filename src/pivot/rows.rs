/// Row transform and row-merge spans.

use super::header::LeafSlot;
use super::{AggKey, AggregationMap, AxisKey, PivotConfig, Scope};
use crate::dataset::{ColumnRef, Dataset};
use crate::query::SortDirection;
use crate::value::{compare_in_set, is_mixed, ColumnValue, Row};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PivotRowType {
    Data,
    Subtotal,
    #[serde(rename = "grandtotal")]
    GrandTotal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotRow {
    /// Row field values. Subtotal rows carry only their prefix fields; the
    /// grand-total row carries none.
    pub row_headers: Row,
    /// Generated column key to aggregate.
    pub values: Row,
    #[serde(rename = "type")]
    pub row_type: PivotRowType,
    /// Subtotal level (index of the deepest row field it groups by).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowMergeInfo {
    pub start_index: usize,
    pub span: usize,
}

/// Distinct row-field combinations in source order.
pub(crate) fn distinct_row_keys(dataset: &Dataset, indices: &[u32], row_columns: &[ColumnRef]) -> Vec<Vec<ColumnValue>> {
    let mut seen: FxHashSet<Vec<ColumnValue>> = FxHashSet::default();
    let mut keys = Vec::new();
    for &idx in indices {
        let key: Vec<ColumnValue> = row_columns
            .iter()
            .map(|&col| dataset.value(idx as usize, col).clone())
            .collect();
        if !seen.contains(&key) {
            seen.insert(key.clone());
            keys.push(key);
        }
    }
    keys
}

fn fill_values(aggregates: &AggregationMap, slots: &[LeafSlot], row: &AxisKey) -> Row {
    let mut values = Row::with_capacity(slots.len());
    for slot in slots {
        let key = AggKey {
            row: row.clone(),
            col: slot.col.clone(),
            value_index: slot.value_index,
        };
        let value = aggregates.get(&key).cloned().unwrap_or(ColumnValue::Null);
        values.insert(slot.key.clone(), value);
    }
    values
}

fn headers(fields: &[String], values: &[ColumnValue]) -> Row {
    fields.iter().cloned().zip(values.iter().cloned()).collect()
}

/// How a sort key applies to pivot rows.
enum RowSortKey {
    Field(usize),
    Value(usize),
}

/// Order row keys: row fields ascending, then the configured sorts (stable).
fn sort_row_keys(
    config: &PivotConfig,
    keys: &mut Vec<Vec<ColumnValue>>,
    slots: &[LeafSlot],
    aggregates: &AggregationMap,
) {
    let mixed: Vec<bool> = (0..config.row_fields.len())
        .map(|pos| is_mixed(keys.iter().map(|key| &key[pos])))
        .collect();
    keys.sort_by(|a, b| {
        a.iter()
            .zip(b)
            .zip(&mixed)
            .map(|((x, y), &mixed)| compare_in_set(x, y, mixed, false))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });

    let sorts: Vec<(RowSortKey, bool)> = config
        .sorts
        .iter()
        .filter_map(|sort| {
            let descending = sort.direction == SortDirection::Desc;
            if let Some(pos) = config.row_fields.iter().position(|f| *f == sort.column_key) {
                return Some((RowSortKey::Field(pos), descending));
            }
            config
                .value_fields
                .iter()
                .position(|vf| vf.field == sort.column_key || vf.key() == sort.column_key)
                .map(|index| (RowSortKey::Value(index), descending))
        })
        .collect();
    if sorts.is_empty() {
        return;
    }

    // Summed leaf-column aggregates per row, for value-field sort keys.
    let leaf_slots: Vec<&LeafSlot> = slots.iter().filter(|s| s.col.scope == Scope::Leaf).collect();
    let totals: Vec<Vec<f64>> = keys
        .iter()
        .map(|key| {
            let row = AxisKey::leaf(key.clone());
            (0..config.value_fields.len())
                .map(|index| {
                    leaf_slots
                        .iter()
                        .filter(|s| s.value_index == index)
                        .filter_map(|s| {
                            aggregates
                                .get(&AggKey {
                                    row: row.clone(),
                                    col: s.col.clone(),
                                    value_index: index,
                                })
                                .and_then(ColumnValue::as_f64)
                        })
                        .sum()
                })
                .collect()
        })
        .collect();

    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| {
        for (sort, descending) in &sorts {
            let cmp = match sort {
                RowSortKey::Field(pos) => compare_in_set(&keys[a][*pos], &keys[b][*pos], mixed[*pos], *descending),
                RowSortKey::Value(index) => {
                    let (x, y) = (totals[a][*index], totals[b][*index]);
                    if *descending {
                        y.total_cmp(&x)
                    } else {
                        x.total_cmp(&y)
                    }
                }
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });

    let sorted: Vec<Vec<ColumnValue>> = order.into_iter().map(|i| keys[i].clone()).collect();
    *keys = sorted;
}

/// Pass 4: data rows, subtotal rows and the grand-total row.
///
/// Subtotal boundaries are found by row-field changes between adjacent data
/// rows; a subtotal row takes its values from the prefix-scope aggregates.
pub(crate) fn build_rows(
    config: &PivotConfig,
    mut keys: Vec<Vec<ColumnValue>>,
    slots: &[LeafSlot],
    aggregates: &AggregationMap,
) -> Vec<PivotRow> {
    sort_row_keys(config, &mut keys, slots, aggregates);

    let levels = config.row_subtotal_levels();
    let fields = &config.row_fields;
    let subtotal_row = |prefix: &[ColumnValue], level: usize| PivotRow {
        row_headers: headers(fields, prefix),
        values: fill_values(aggregates, slots, &AxisKey::subtotal(prefix.to_vec())),
        row_type: PivotRowType::Subtotal,
        depth: Some(level),
    };

    let mut rows = Vec::with_capacity(keys.len());
    let mut previous: Option<&Vec<ColumnValue>> = None;
    for key in &keys {
        if let Some(prev) = previous {
            if !levels.is_empty() {
                let first_change = prev.iter().zip(key).position(|(a, b)| a != b).unwrap_or(prev.len());
                for &level in levels.iter().rev().filter(|&&l| l >= first_change) {
                    rows.push(subtotal_row(&prev[..=level], level));
                }
            }
        }
        rows.push(PivotRow {
            row_headers: headers(fields, key),
            values: fill_values(aggregates, slots, &AxisKey::leaf(key.clone())),
            row_type: PivotRowType::Data,
            depth: None,
        });
        previous = Some(key);
    }
    if let Some(prev) = previous {
        for &level in levels.iter().rev() {
            rows.push(subtotal_row(&prev[..=level], level));
        }
    }

    if config.has_row_grand_total() && !keys.is_empty() {
        rows.push(PivotRow {
            row_headers: Row::new(),
            values: fill_values(aggregates, slots, &AxisKey::grand_total()),
            row_type: PivotRowType::GrandTotal,
            depth: None,
        });
    }
    rows
}

/// Pass 5: merge spans per row field. A run continues while the field and
/// every earlier field are present and unchanged; only runs longer than one
/// row are reported.
pub(crate) fn row_merge_info(fields: &[String], rows: &[PivotRow]) -> BTreeMap<String, Vec<RowMergeInfo>> {
    let mut info = BTreeMap::new();
    for (pos, field) in fields.iter().enumerate() {
        let continues = |a: &PivotRow, b: &PivotRow| {
            fields[..=pos].iter().all(|f| match (a.row_headers.get(f), b.row_headers.get(f)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            })
        };

        let mut spans = Vec::new();
        let mut start = 0;
        for i in 1..=rows.len() {
            if i == rows.len() || !continues(&rows[i - 1], &rows[i]) {
                if i - start > 1 {
                    spans.push(RowMergeInfo {
                        start_index: start,
                        span: i - start,
                    });
                }
                start = i;
            }
        }
        info.insert(field.clone(), spans);
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[(&str, &str)], row_type: PivotRowType) -> PivotRow {
        PivotRow {
            row_headers: cells.iter().map(|(k, v)| (*k, ColumnValue::from(*v))).collect(),
            values: Row::new(),
            row_type,
            depth: None,
        }
    }

    #[test]
    fn test_merge_runs_break_on_parent_change() {
        let fields = vec!["a".to_string(), "b".to_string()];
        let rows = vec![
            row(&[("a", "x"), ("b", "1")], PivotRowType::Data),
            row(&[("a", "x"), ("b", "1")], PivotRowType::Data),
            row(&[("a", "y"), ("b", "1")], PivotRowType::Data),
            row(&[("a", "y"), ("b", "2")], PivotRowType::Data),
            row(&[], PivotRowType::GrandTotal),
        ];
        let info = row_merge_info(&fields, &rows);
        assert_eq!(
            info["a"],
            vec![
                RowMergeInfo { start_index: 0, span: 2 },
                RowMergeInfo { start_index: 2, span: 2 },
            ]
        );
        // b=1 runs across rows 1..3 but the parent changes at row 2
        assert_eq!(info["b"], vec![RowMergeInfo { start_index: 0, span: 2 }]);
    }

    #[test]
    fn test_merge_on_empty_rows() {
        let info = row_merge_info(&["a".to_string()], &[]);
        assert!(info["a"].is_empty());
    }

    #[test]
    fn test_row_type_wire_names() {
        assert_eq!(serde_json::to_string(&PivotRowType::GrandTotal).unwrap(), r#""grandtotal""#);
        assert_eq!(serde_json::to_string(&PivotRowType::Subtotal).unwrap(), r#""subtotal""#);
    }
}
