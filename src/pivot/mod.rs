/// Pivot engine.
///
/// A pivot runs in ordered passes over the filtered, sorted source rows:
/// axis extraction, one grouped rollup per required (row scope, column scope)
/// pair, header-tree build, row transform with subtotals, row-merge spans.
/// Aggregates are keyed structurally by `AggKey`. Generated column keys
/// escape `\`, `|` and `:` inside each axis segment, render null as a
/// reserved segment and tag values by kind on mixed-kind levels, so distinct
/// axis positions always get distinct keys.

mod header;
mod rows;

pub use header::PivotHeaderNode;
pub use rows::{PivotRow, PivotRowType, RowMergeInfo};

use crate::aggregate::{group_rollup, AggregateFn, Measure};
use crate::dataset::{ColumnRef, Dataset};
use crate::query::{query, FilterPredicate, QuerySpec, SortDirection, SortKey};
use crate::value::{sort_values, ColumnValue, ValueKind};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label shown for a null axis value.
pub const BLANK_LABEL: &str = "(blank)";
pub const SUBTOTAL_SEGMENT: &str = "__subtotal__";
pub const GRAND_TOTAL_SEGMENT: &str = "__grandtotal__";
/// Key segment for a null axis value. Escaped data never starts with `\N`.
pub const NULL_SEGMENT: &str = "\\N";

/// One measure of the pivot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueField {
    pub field: String,
    pub aggregate_fn: AggregateFn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ValueField {
    pub fn new(field: impl Into<String>, aggregate_fn: AggregateFn) -> Self {
        ValueField {
            field: field.into(),
            aggregate_fn,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Key used in generated column keys: the label, else `{fn}_{field}`.
    pub fn key(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.aggregate_fn.name(), self.field))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PivotConfig {
    pub row_fields: Vec<String>,
    pub column_fields: Vec<String>,
    pub value_fields: Vec<ValueField>,
    pub filters: Vec<FilterPredicate>,
    pub sorts: Vec<SortKey>,
    pub show_row_sub_totals: bool,
    /// Row fields that get subtotal rows. Defaults to every row field but
    /// the last.
    pub row_sub_total_fields: Option<Vec<String>>,
    pub show_row_grand_totals: bool,
    pub show_column_sub_totals: bool,
    /// Column fields that get subtotal columns. Defaults to every column
    /// field but the last.
    pub column_sub_total_fields: Option<Vec<String>>,
    pub show_column_grand_totals: bool,
}

impl PivotConfig {
    /// Field levels that get subtotals, ascending. The last field never does.
    fn subtotal_levels(fields: &[String], chosen: Option<&Vec<String>>) -> Vec<usize> {
        let candidates = fields.len().saturating_sub(1);
        (0..candidates)
            .filter(|&level| chosen.map_or(true, |names| names.contains(&fields[level])))
            .collect()
    }

    pub(crate) fn row_subtotal_levels(&self) -> Vec<usize> {
        if !self.show_row_sub_totals {
            return Vec::new();
        }
        Self::subtotal_levels(&self.row_fields, self.row_sub_total_fields.as_ref())
    }

    pub(crate) fn column_subtotal_levels(&self) -> Vec<usize> {
        if !self.show_column_sub_totals {
            return Vec::new();
        }
        Self::subtotal_levels(&self.column_fields, self.column_sub_total_fields.as_ref())
    }

    pub(crate) fn has_row_grand_total(&self) -> bool {
        self.show_row_grand_totals && !self.row_fields.is_empty()
    }

    pub(crate) fn has_column_grand_total(&self) -> bool {
        self.show_column_grand_totals && !self.column_fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotResult {
    pub column_headers: Vec<PivotHeaderNode>,
    /// Generated column keys in header (left to right) order.
    pub column_keys: Vec<String>,
    pub rows: Vec<PivotRow>,
    /// Merge spans per row field.
    pub row_merge_info: BTreeMap<String, Vec<RowMergeInfo>>,
    pub header_depth: usize,
    pub generation: u64,
}

/// Marker returned in place of a pivot that a newer request superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalePivot {
    pub stale: bool,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PivotOutcome {
    Stale(StalePivot),
    Computed(PivotResult),
}

impl PivotOutcome {
    pub fn stale(generation: u64) -> Self {
        PivotOutcome::Stale(StalePivot {
            stale: true,
            generation,
        })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, PivotOutcome::Stale(_))
    }

    pub fn into_result(self) -> Option<PivotResult> {
        match self {
            PivotOutcome::Computed(result) => Some(result),
            PivotOutcome::Stale(_) => None,
        }
    }
}

/// Aggregation scope of an axis key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Scope {
    Leaf,
    Subtotal,
    GrandTotal,
}

/// Position on one pivot axis: the prefix of axis values plus its scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AxisKey {
    pub values: Vec<ColumnValue>,
    pub scope: Scope,
}

impl AxisKey {
    pub fn leaf(values: Vec<ColumnValue>) -> Self {
        AxisKey { values, scope: Scope::Leaf }
    }

    pub fn subtotal(values: Vec<ColumnValue>) -> Self {
        AxisKey { values, scope: Scope::Subtotal }
    }

    pub fn grand_total() -> Self {
        AxisKey { values: Vec::new(), scope: Scope::GrandTotal }
    }

    /// Generated column key for this position and a value field key.
    /// `tagged[level]` marks axis levels holding more than one value kind.
    pub fn column_key(&self, value_key: &str, tagged: &[bool]) -> String {
        let mut segments: Vec<String> = self
            .values
            .iter()
            .enumerate()
            .map(|(level, value)| key_segment(value, tagged.get(level).copied().unwrap_or(false)))
            .collect();
        match self.scope {
            Scope::Leaf => {}
            Scope::Subtotal => segments.push(SUBTOTAL_SEGMENT.to_string()),
            Scope::GrandTotal => segments.push(GRAND_TOTAL_SEGMENT.to_string()),
        }
        if segments.is_empty() {
            value_key.to_string()
        } else {
            format!("{}::{}", segments.join("|"), value_key)
        }
    }
}

/// Backslash-escape the key delimiters. Text starting with `__` gets a
/// leading backslash so it cannot read as a scope marker.
fn escape_segment(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    if text.starts_with("__") {
        escaped.push('\\');
    }
    for ch in text.chars() {
        if matches!(ch, '\\' | '|' | ':') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn key_segment(value: &ColumnValue, tagged: bool) -> String {
    if value.is_null() {
        return NULL_SEGMENT.to_string();
    }
    let text = escape_segment(&value.render());
    if !tagged {
        return text;
    }
    let tag = match value.kind() {
        ValueKind::Bool => "\\?",
        ValueKind::Number => "\\#",
        ValueKind::String => "\\$",
        ValueKind::Timestamp => "\\@",
        ValueKind::Null => "",
    };
    format!("{}{}", tag, text)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AggKey {
    pub row: AxisKey,
    pub col: AxisKey,
    pub value_index: usize,
}

pub(crate) type AggregationMap = FxHashMap<AggKey, ColumnValue>;

/// Label for an axis value.
pub(crate) fn axis_label(value: &ColumnValue) -> String {
    if value.is_null() {
        BLANK_LABEL.to_string()
    } else {
        value.render()
    }
}

/// A required aggregation scope on one axis: how many leading fields to
/// group by and the scope tag.
#[derive(Debug, Clone, Copy)]
struct ScopeSpec {
    len: usize,
    scope: Scope,
}

fn required_scopes(field_count: usize, subtotal_levels: &[usize], grand_total: bool) -> Vec<ScopeSpec> {
    let mut scopes = vec![ScopeSpec { len: field_count, scope: Scope::Leaf }];
    scopes.extend(subtotal_levels.iter().map(|&level| ScopeSpec {
        len: level + 1,
        scope: Scope::Subtotal,
    }));
    if grand_total {
        scopes.push(ScopeSpec { len: 0, scope: Scope::GrandTotal });
    }
    scopes
}

/// Distinct values of a column over `indices`, ordered per `sorts` when one
/// names the column, else ascending. Nulls last.
fn axis_values(dataset: &Dataset, indices: &[u32], field: &str, sorts: &[SortKey]) -> Vec<ColumnValue> {
    let column = dataset.column(field);
    let mut seen: FxHashSet<&ColumnValue> = FxHashSet::default();
    let mut values: Vec<ColumnValue> = Vec::new();
    for &idx in indices {
        let value = dataset.value(idx as usize, column);
        if seen.insert(value) {
            values.push(value.clone());
        }
    }

    let descending = sorts
        .iter()
        .find(|s| s.column_key == field)
        .map_or(false, |s| s.direction == SortDirection::Desc);
    sort_values(&mut values, descending);
    values
}

/// Pass 2: one rollup per required scope pair.
fn aggregation_pass(
    dataset: &Dataset,
    indices: &[u32],
    config: &PivotConfig,
    row_columns: &[ColumnRef],
    col_columns: &[ColumnRef],
) -> AggregationMap {
    let row_scopes = required_scopes(
        row_columns.len(),
        &config.row_subtotal_levels(),
        config.has_row_grand_total(),
    );
    let col_scopes = required_scopes(
        col_columns.len(),
        &config.column_subtotal_levels(),
        config.has_column_grand_total(),
    );
    let measures: Vec<Measure<'_>> = config
        .value_fields
        .iter()
        .map(|vf| Measure {
            column: dataset.column(&vf.field),
            func: &vf.aggregate_fn,
        })
        .collect();

    let mut map = AggregationMap::default();
    for row_scope in &row_scopes {
        for col_scope in &col_scopes {
            let group_columns: Vec<ColumnRef> = row_columns[..row_scope.len]
                .iter()
                .chain(&col_columns[..col_scope.len])
                .copied()
                .collect();

            for group in group_rollup(dataset, indices, &group_columns, &measures) {
                let mut key = group.key;
                let col_values = key.split_off(row_scope.len);
                let row = AxisKey { values: key, scope: row_scope.scope };
                let col = AxisKey { values: col_values, scope: col_scope.scope };
                for (value_index, value) in group.results.into_iter().enumerate() {
                    map.insert(
                        AggKey {
                            row: row.clone(),
                            col: col.clone(),
                            value_index,
                        },
                        value,
                    );
                }
            }
        }
    }
    map
}

/// Compute a pivot over the whole dataset, tagged with `generation`.
pub fn compute_pivot(dataset: &Dataset, config: &PivotConfig, generation: u64) -> PivotResult {
    let source = query(
        dataset,
        &QuerySpec {
            filters: config.filters.clone(),
            sorts: config.sorts.clone(),
        },
    );
    let indices: &[u32] = &source.indices;

    let row_columns: Vec<ColumnRef> = config.row_fields.iter().map(|f| dataset.column(f)).collect();
    let col_columns: Vec<ColumnRef> = config.column_fields.iter().map(|f| dataset.column(f)).collect();

    let axes: Vec<Vec<ColumnValue>> = config
        .column_fields
        .iter()
        .map(|field| axis_values(dataset, indices, field, &config.sorts))
        .collect();

    let aggregates = aggregation_pass(dataset, indices, config, &row_columns, &col_columns);
    let tree = header::build_header_tree(config, &axes);
    let row_keys = rows::distinct_row_keys(dataset, indices, &row_columns);
    let rows = rows::build_rows(config, row_keys, &tree.slots, &aggregates);
    let row_merge_info = rows::row_merge_info(&config.row_fields, &rows);

    PivotResult {
        column_headers: tree.nodes,
        column_keys: tree.slots.into_iter().map(|slot| slot.key).collect(),
        rows,
        row_merge_info,
        header_depth: tree.depth,
        generation,
    }
}
