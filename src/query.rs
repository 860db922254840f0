/// Filter and sort evaluation.
///
/// Filters narrow the candidate set one predicate at a time (AND semantics);
/// sorts order the survivors with a stable multi-key comparison. Results are
/// original-index arrays wrapped in a `QueryResult`.

use crate::dataset::{ColumnRef, Dataset};
use crate::index_store::IndexBuffer;
use crate::value::{collate, is_mixed, ColumnValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Between,
    IsNull,
    IsNotNull,
}

/// A single predicate on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPredicate {
    pub column_key: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: ColumnValue,
    /// Upper bound for `between`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<ColumnValue>,
}

impl FilterPredicate {
    pub fn new(column_key: impl Into<String>, operator: FilterOperator, value: ColumnValue) -> Self {
        FilterPredicate {
            column_key: column_key.into(),
            operator,
            value,
            value2: None,
        }
    }

    pub fn between(column_key: impl Into<String>, low: ColumnValue, high: ColumnValue) -> Self {
        FilterPredicate {
            column_key: column_key.into(),
            operator: FilterOperator::Between,
            value: low,
            value2: Some(high),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// A single sort key specifying a column and direction. Nulls always sort
/// last, whatever the direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    pub column_key: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn ascending(column_key: impl Into<String>) -> Self {
        SortKey {
            column_key: column_key.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn descending(column_key: impl Into<String>) -> Self {
        SortKey {
            column_key: column_key.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Combined filter + sort request. Filters run first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
    #[serde(default)]
    pub sorts: Vec<SortKey>,
}

/// Original indices in query order plus counts.
///
/// `filtered_count == indices.len()`; every index is unique and below
/// `total_count`. `generation` is the engine view generation that produced
/// the result (0 when computed outside an engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub indices: IndexBuffer,
    pub total_count: usize,
    pub filtered_count: usize,
    #[serde(default)]
    pub generation: u64,
}

impl QueryResult {
    pub fn new(indices: Vec<u32>, total_count: usize) -> Self {
        let filtered_count = indices.len();
        QueryResult {
            indices: Arc::from(indices),
            total_count,
            filtered_count,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

/// A predicate resolved against a dataset.
struct CompiledPredicate<'a> {
    column: ColumnRef,
    operator: FilterOperator,
    value: &'a ColumnValue,
    value2: Option<&'a ColumnValue>,
    /// Lower-cased needle for the text operators.
    needle: String,
}

impl<'a> CompiledPredicate<'a> {
    fn compile(dataset: &Dataset, predicate: &'a FilterPredicate) -> Self {
        let needle = match predicate.operator {
            FilterOperator::Contains
            | FilterOperator::NotContains
            | FilterOperator::StartsWith
            | FilterOperator::EndsWith => predicate.value.render().to_lowercase(),
            _ => String::new(),
        };
        CompiledPredicate {
            column: dataset.column(&predicate.column_key),
            operator: predicate.operator,
            value: &predicate.value,
            value2: predicate.value2.as_ref(),
            needle,
        }
    }

    fn matches(&self, cell: &ColumnValue) -> bool {
        match self.operator {
            FilterOperator::IsNull => return cell.is_null(),
            FilterOperator::IsNotNull => return !cell.is_null(),
            _ => {}
        }
        // Unknown values never match a comparison
        if cell.is_null() {
            return false;
        }

        match self.operator {
            FilterOperator::Eq => !self.value.is_null() && cell.compare(self.value) == Ordering::Equal,
            FilterOperator::Neq => self.value.is_null() || cell.compare(self.value) != Ordering::Equal,
            FilterOperator::Gt => self.ordered(cell, |o| o == Ordering::Greater),
            FilterOperator::Gte => self.ordered(cell, |o| o != Ordering::Less),
            FilterOperator::Lt => self.ordered(cell, |o| o == Ordering::Less),
            FilterOperator::Lte => self.ordered(cell, |o| o != Ordering::Greater),
            FilterOperator::Between => match self.value2 {
                Some(high) if !self.value.is_null() && !high.is_null() => {
                    cell.compare(self.value) != Ordering::Less && cell.compare(high) != Ordering::Greater
                }
                _ => false,
            },
            FilterOperator::Contains => cell.render().to_lowercase().contains(&self.needle),
            FilterOperator::NotContains => !cell.render().to_lowercase().contains(&self.needle),
            FilterOperator::StartsWith => cell.render().to_lowercase().starts_with(&self.needle),
            FilterOperator::EndsWith => cell.render().to_lowercase().ends_with(&self.needle),
            FilterOperator::IsNull | FilterOperator::IsNotNull => unreachable!("handled above"),
        }
    }

    fn ordered(&self, cell: &ColumnValue, accept: impl Fn(Ordering) -> bool) -> bool {
        !self.value.is_null() && accept(cell.compare(self.value))
    }
}

/// Does the row at `original_index` satisfy every predicate?
pub fn row_matches(dataset: &Dataset, original_index: usize, filters: &[FilterPredicate]) -> bool {
    filters.iter().all(|predicate| {
        let compiled = CompiledPredicate::compile(dataset, predicate);
        compiled.matches(dataset.value(original_index, compiled.column))
    })
}

/// Original indices (ascending) of rows passing every predicate.
pub fn filter_indices(dataset: &Dataset, filters: &[FilterPredicate]) -> Vec<u32> {
    let mut candidates: Vec<u32> = (0..dataset.len() as u32).collect();
    for predicate in filters {
        if candidates.is_empty() {
            break;
        }
        let compiled = CompiledPredicate::compile(dataset, predicate);
        candidates.retain(|&idx| compiled.matches(dataset.value(idx as usize, compiled.column)));
    }
    candidates
}

/// One sort key resolved against a dataset.
struct PreparedKey {
    column: ColumnRef,
    descending: bool,
    /// String renderings indexed by original index, present when the column
    /// holds more than one kind of value and so is ordered as text.
    rendered: Option<Vec<String>>,
}

/// Stable multi-key comparator over original indices.
pub struct RowComparator<'a> {
    dataset: &'a Dataset,
    keys: Vec<PreparedKey>,
}

impl<'a> RowComparator<'a> {
    pub fn new(dataset: &'a Dataset, sorts: &[SortKey]) -> Self {
        let keys = sorts
            .iter()
            .map(|key| {
                let column = dataset.column(&key.column_key);
                let rendered = if is_mixed_column(dataset, column) {
                    Some(
                        (0..dataset.len())
                            .map(|idx| dataset.value(idx, column).render())
                            .collect(),
                    )
                } else {
                    None
                };
                PreparedKey {
                    column,
                    descending: key.direction == SortDirection::Desc,
                    rendered,
                }
            })
            .collect();
        RowComparator { dataset, keys }
    }

    pub fn compare(&self, a: u32, b: u32) -> Ordering {
        let (a, b) = (a as usize, b as usize);
        for key in &self.keys {
            let va = self.dataset.value(a, key.column);
            let vb = self.dataset.value(b, key.column);
            let cmp = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => return Ordering::Greater,
                (false, true) => return Ordering::Less,
                (false, false) => {
                    let base = match &key.rendered {
                        Some(rendered) => collate(&rendered[a], &rendered[b]),
                        None => va.compare(vb),
                    };
                    if key.descending {
                        base.reverse()
                    } else {
                        base
                    }
                }
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }
}

/// A column is mixed when its non-null values span more than one kind.
fn is_mixed_column(dataset: &Dataset, column: ColumnRef) -> bool {
    is_mixed((0..dataset.len()).map(|idx| dataset.value(idx, column)))
}

/// Stable in-place sort of original indices.
pub fn sort_indices(dataset: &Dataset, indices: &mut [u32], sorts: &[SortKey]) {
    if sorts.is_empty() || indices.len() < 2 {
        return;
    }
    let comparator = RowComparator::new(dataset, sorts);
    indices.sort_by(|&a, &b| comparator.compare(a, b));
}

pub fn filter(dataset: &Dataset, filters: &[FilterPredicate]) -> QueryResult {
    QueryResult::new(filter_indices(dataset, filters), dataset.len())
}

pub fn sort(dataset: &Dataset, sorts: &[SortKey]) -> QueryResult {
    let mut indices: Vec<u32> = (0..dataset.len() as u32).collect();
    sort_indices(dataset, &mut indices, sorts);
    QueryResult::new(indices, dataset.len())
}

pub fn query(dataset: &Dataset, spec: &QuerySpec) -> QueryResult {
    let mut indices = filter_indices(dataset, &spec.filters);
    sort_indices(dataset, &mut indices, &spec.sorts);
    QueryResult::new(indices, dataset.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Row;

    fn employees() -> Dataset {
        let data: Vec<(&str, &str, Option<i64>, f64)> = vec![
            ("Alice", "Engineering", Some(34), 120000.0),
            ("Bob", "Sales", Some(45), 80000.0),
            ("Charlie", "Engineering", None, 95000.0),
            ("Diana", "Sales", Some(29), 85000.0),
            ("Eve", "Marketing", Some(34), 70000.0),
            ("frank", "engineering", Some(51), 110000.0),
        ];
        Dataset::from_rows(
            data.into_iter()
                .map(|(name, dept, age, salary)| {
                    let mut row = Row::new();
                    row.insert("name", name.into());
                    row.insert("department", dept.into());
                    row.insert("age", age.map(ColumnValue::Int).unwrap_or(ColumnValue::Null));
                    row.insert("salary", ColumnValue::Float(salary));
                    row
                })
                .collect(),
        )
    }

    fn names(ds: &Dataset, indices: &[u32]) -> Vec<String> {
        indices
            .iter()
            .map(|&i| ds.value_by_key(i as usize, "name").render())
            .collect()
    }

    #[test]
    fn test_empty_filter_returns_everything_in_order() {
        let ds = employees();
        let result = filter(&ds, &[]);
        assert_eq!(&*result.indices, &[0, 1, 2, 3, 4, 5]);
        assert_eq!(result.total_count, 6);
        assert_eq!(result.filtered_count, 6);
    }

    #[test]
    fn test_filter_is_sound_and_complete() {
        let ds = employees();
        let filters = vec![
            FilterPredicate::new("age", FilterOperator::Gte, ColumnValue::Int(30)),
            FilterPredicate::new("department", FilterOperator::Contains, "ENG".into()),
        ];
        let result = filter(&ds, &filters);
        assert_eq!(names(&ds, &result.indices), vec!["Alice", "frank"]);

        for idx in 0..ds.len() {
            let included = result.indices.contains(&(idx as u32));
            assert_eq!(included, row_matches(&ds, idx, &filters), "row {}", idx);
        }
        assert_eq!(result.filtered_count, result.indices.len());
    }

    #[test]
    fn test_predicate_order_does_not_change_result() {
        let ds = employees();
        let a = FilterPredicate::new("salary", FilterOperator::Lt, ColumnValue::Int(100000));
        let b = FilterPredicate::new("name", FilterOperator::NotContains, "e".into());
        let ab = filter(&ds, &[a.clone(), b.clone()]);
        let ba = filter(&ds, &[b, a]);
        assert_eq!(ab.indices, ba.indices);
    }

    #[test]
    fn test_nulls_never_match_comparisons() {
        let ds = employees();
        for op in [
            FilterOperator::Eq,
            FilterOperator::Neq,
            FilterOperator::Gt,
            FilterOperator::Lt,
            FilterOperator::NotContains,
        ] {
            let result = filter(&ds, &[FilterPredicate::new("age", op, ColumnValue::Int(40))]);
            assert!(!result.indices.contains(&2), "{:?} matched a null", op);
        }
        let nulls = filter(&ds, &[FilterPredicate::new("age", FilterOperator::IsNull, ColumnValue::Null)]);
        assert_eq!(&*nulls.indices, &[2]);
        let not_nulls = filter(&ds, &[FilterPredicate::new("age", FilterOperator::IsNotNull, ColumnValue::Null)]);
        assert_eq!(not_nulls.filtered_count, 5);
    }

    #[test]
    fn test_text_operators_and_between() {
        let ds = employees();
        let starts = filter(&ds, &[FilterPredicate::new("name", FilterOperator::StartsWith, "d".into())]);
        assert_eq!(names(&ds, &starts.indices), vec!["Diana"]);

        let ends = filter(&ds, &[FilterPredicate::new("name", FilterOperator::EndsWith, "E".into())]);
        assert_eq!(names(&ds, &ends.indices), vec!["Alice", "Charlie", "Eve"]);

        let between = filter(
            &ds,
            &[FilterPredicate::between("salary", ColumnValue::Int(80000), ColumnValue::Int(95000))],
        );
        assert_eq!(names(&ds, &between.indices), vec!["Bob", "Charlie", "Diana"]);
    }

    #[test]
    fn test_unknown_column_reads_as_null() {
        let ds = employees();
        let result = filter(&ds, &[FilterPredicate::new("bonus", FilterOperator::IsNull, ColumnValue::Null)]);
        assert_eq!(result.filtered_count, 6);
        let result = filter(&ds, &[FilterPredicate::new("bonus", FilterOperator::Eq, ColumnValue::Int(1))]);
        assert_eq!(result.filtered_count, 0);
    }

    #[test]
    fn test_empty_sort_keeps_original_order() {
        let ds = employees();
        assert_eq!(&*sort(&ds, &[]).indices, &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sort_is_stable_and_nulls_last_in_both_directions() {
        let ds = employees();

        let asc = sort(&ds, &[SortKey::ascending("age")]);
        // Alice and Eve tie on 34 and keep their original order
        assert_eq!(names(&ds, &asc.indices), vec!["Diana", "Alice", "Eve", "Bob", "frank", "Charlie"]);

        let desc = sort(&ds, &[SortKey::descending("age")]);
        assert_eq!(names(&ds, &desc.indices), vec!["frank", "Bob", "Alice", "Eve", "Diana", "Charlie"]);
    }

    #[test]
    fn test_multi_key_sort() {
        let ds = employees();
        let result = sort(
            &ds,
            &[SortKey::ascending("department"), SortKey::descending("salary")],
        );
        // "engineering" and "Engineering" collate together, case tie-break puts "Engineering" first
        assert_eq!(
            names(&ds, &result.indices),
            vec!["Alice", "Charlie", "frank", "Eve", "Diana", "Bob"]
        );
    }

    #[test]
    fn test_mixed_column_sorts_as_text() {
        let rows: Vec<Row> = vec![ColumnValue::Int(9), "10".into(), ColumnValue::Int(100), "apple".into()]
            .into_iter()
            .map(|v| std::iter::once(("v".to_string(), v)).collect())
            .collect();
        let ds = Dataset::from_rows(rows);
        let result = sort(&ds, &[SortKey::ascending("v")]);
        assert_eq!(&*result.indices, &[1, 2, 0, 3]);
    }

    #[test]
    fn test_query_filters_before_sorting() {
        let ds = employees();
        let spec = QuerySpec {
            filters: vec![FilterPredicate::new("department", FilterOperator::Eq, "Sales".into())],
            sorts: vec![SortKey::ascending("salary")],
        };
        let result = query(&ds, &spec);
        assert_eq!(names(&ds, &result.indices), vec!["Bob", "Diana"]);
        assert_eq!(result.total_count, 6);
        assert_eq!(result.filtered_count, 2);
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"columnKey":"name","operator":"notContains","value":"x"}"#;
        let predicate: FilterPredicate = serde_json::from_str(json).unwrap();
        assert_eq!(predicate.operator, FilterOperator::NotContains);
        assert!(predicate.value2.is_none());

        let key: SortKey = serde_json::from_str(r#"{"columnKey":"age","direction":"desc"}"#).unwrap();
        assert_eq!(key, SortKey::descending("age"));
    }
}
