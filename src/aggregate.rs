/// Group-by rollups.
///
/// `group_rollup` is the single grouping primitive: one pass over a set of
/// original indices, one `Accumulator` per (group, measure). The aggregation
/// request API and the pivot engine are both built on it.

use crate::dataset::{ColumnRef, Dataset};
use crate::query::{filter_indices, FilterPredicate};
use crate::value::{ColumnValue, Row};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

type CustomFn = dyn Fn(&[ColumnValue]) -> ColumnValue + Send + Sync;

/// A caller-supplied aggregate over the raw values of one group.
#[derive(Clone)]
pub struct CustomAggregate {
    name: String,
    func: Arc<CustomFn>,
}

impl CustomAggregate {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[ColumnValue]) -> ColumnValue + Send + Sync + 'static,
    {
        CustomAggregate {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Aggregate functions. `Custom` exists only on the Rust API; on the wire
/// functions are named by their lowercase string.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregateFn {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
    Custom(CustomAggregate),
}

impl AggregateFn {
    pub fn name(&self) -> &str {
        match self {
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Count => "count",
            AggregateFn::First => "first",
            AggregateFn::Last => "last",
            AggregateFn::Custom(custom) => custom.name(),
        }
    }

    /// Apply to a list of values in one go.
    pub fn apply(&self, values: &[ColumnValue]) -> ColumnValue {
        let mut acc = Accumulator::for_fn(self);
        for value in values {
            acc.push(value);
        }
        acc.finish(self)
    }
}

impl TryFrom<String> for AggregateFn {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        match name.to_lowercase().as_str() {
            "sum" => Ok(AggregateFn::Sum),
            "avg" | "average" | "mean" => Ok(AggregateFn::Avg),
            "min" => Ok(AggregateFn::Min),
            "max" => Ok(AggregateFn::Max),
            "count" => Ok(AggregateFn::Count),
            "first" => Ok(AggregateFn::First),
            "last" => Ok(AggregateFn::Last),
            _ => Err(format!(
                "Unknown aggregate function '{}'. Use: sum, avg, min, max, count, first, last",
                name
            )),
        }
    }
}

impl From<AggregateFn> for String {
    fn from(f: AggregateFn) -> Self {
        f.name().to_string()
    }
}

impl fmt::Debug for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFn::Custom(custom) => write!(f, "Custom({})", custom.name),
            other => f.write_str(other.name()),
        }
    }
}

impl PartialEq for AggregateFn {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AggregateFn::Custom(a), AggregateFn::Custom(b)) => {
                a.name == b.name && Arc::ptr_eq(&a.func, &b.func)
            }
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

/// Running state for one aggregate over one group.
///
/// Non-numeric values are ignored by sum/avg/min/max; count counts rows.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    sum: f64,
    numeric_count: usize,
    min: Option<f64>,
    max: Option<f64>,
    count: usize,
    first: Option<ColumnValue>,
    last: Option<ColumnValue>,
    /// Raw values, kept only for custom aggregates.
    values: Option<Vec<ColumnValue>>,
}

impl Accumulator {
    pub fn for_fn(func: &AggregateFn) -> Self {
        Accumulator {
            values: matches!(func, AggregateFn::Custom(_)).then(Vec::new),
            ..Default::default()
        }
    }

    pub fn push(&mut self, value: &ColumnValue) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(value.clone());
        }
        self.last = Some(value.clone());

        if let Some(n) = value.as_f64() {
            self.sum += n;
            self.numeric_count += 1;
            self.min = Some(self.min.map_or(n, |m| m.min(n)));
            self.max = Some(self.max.map_or(n, |m| m.max(n)));
        }

        if let Some(values) = self.values.as_mut() {
            values.push(value.clone());
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(&self, func: &AggregateFn) -> ColumnValue {
        match func {
            AggregateFn::Sum => ColumnValue::Float(self.sum),
            AggregateFn::Avg if self.numeric_count > 0 => {
                ColumnValue::Float(self.sum / self.numeric_count as f64)
            }
            AggregateFn::Avg => ColumnValue::Null,
            AggregateFn::Min => self.min.map(ColumnValue::Float).unwrap_or(ColumnValue::Null),
            AggregateFn::Max => self.max.map(ColumnValue::Float).unwrap_or(ColumnValue::Null),
            AggregateFn::Count => ColumnValue::Int(self.count as i64),
            AggregateFn::First => self.first.clone().unwrap_or(ColumnValue::Null),
            AggregateFn::Last => self.last.clone().unwrap_or(ColumnValue::Null),
            AggregateFn::Custom(custom) => {
                let values = self.values.as_deref().unwrap_or(&[]);
                (custom.func)(values)
            }
        }
    }
}

/// A measure resolved against a dataset.
pub struct Measure<'a> {
    pub column: ColumnRef,
    pub func: &'a AggregateFn,
}

/// One group produced by `group_rollup`.
#[derive(Debug, Clone)]
pub struct GroupRollup {
    /// Group values, in group-column order.
    pub key: Vec<ColumnValue>,
    /// One finished aggregate per measure.
    pub results: Vec<ColumnValue>,
    /// Source rows in the group.
    pub count: usize,
}

/// Group `indices` by `group_columns` and aggregate every measure.
/// Groups come out in order of first appearance. With no group columns all
/// rows fall into a single group (none if `indices` is empty).
pub fn group_rollup(
    dataset: &Dataset,
    indices: &[u32],
    group_columns: &[ColumnRef],
    measures: &[Measure<'_>],
) -> Vec<GroupRollup> {
    let mut positions: FxHashMap<Vec<ColumnValue>, usize> = FxHashMap::default();
    let mut groups: Vec<(Vec<ColumnValue>, Vec<Accumulator>, usize)> = Vec::new();

    for &idx in indices {
        let idx = idx as usize;
        let key: Vec<ColumnValue> = group_columns
            .iter()
            .map(|&col| dataset.value(idx, col).clone())
            .collect();

        let slot = match positions.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = groups.len();
                let accumulators = measures.iter().map(|m| Accumulator::for_fn(m.func)).collect();
                groups.push((key.clone(), accumulators, 0));
                positions.insert(key, slot);
                slot
            }
        };

        let (_, accumulators, count) = &mut groups[slot];
        *count += 1;
        for (acc, measure) in accumulators.iter_mut().zip(measures) {
            acc.push(dataset.value(idx, measure.column));
        }
    }

    groups
        .into_iter()
        .map(|(key, accumulators, count)| GroupRollup {
            key,
            results: accumulators
                .iter()
                .zip(measures)
                .map(|(acc, m)| acc.finish(m.func))
                .collect(),
            count,
        })
        .collect()
}

/// One requested aggregate column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateColumn {
    pub column_key: String,
    #[serde(rename = "fn")]
    pub func: AggregateFn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl AggregateColumn {
    pub fn new(column_key: impl Into<String>, func: AggregateFn) -> Self {
        AggregateColumn {
            column_key: column_key.into(),
            func,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output key: the alias, else `{fn}_{column}`.
    pub fn output_key(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.func.name(), self.column_key))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSpec {
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub aggregates: Vec<AggregateColumn>,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
}

/// One summary row per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    /// Group values joined with '|', in group-by order.
    pub group_key: String,
    pub group_values: Row,
    pub aggregates: Row,
    pub count: usize,
}

/// Filter, then group and aggregate.
pub fn aggregate(dataset: &Dataset, spec: &AggregateSpec) -> Vec<AggregateResult> {
    let indices = filter_indices(dataset, &spec.filters);
    let group_columns: Vec<ColumnRef> = spec.group_by.iter().map(|k| dataset.column(k)).collect();
    let measures: Vec<Measure<'_>> = spec
        .aggregates
        .iter()
        .map(|a| Measure {
            column: dataset.column(&a.column_key),
            func: &a.func,
        })
        .collect();

    group_rollup(dataset, &indices, &group_columns, &measures)
        .into_iter()
        .map(|group| {
            let group_key = group
                .key
                .iter()
                .map(ColumnValue::render)
                .collect::<Vec<_>>()
                .join("|");
            let group_values = spec.group_by.iter().cloned().zip(group.key).collect();
            let aggregates = spec
                .aggregates
                .iter()
                .map(AggregateColumn::output_key)
                .zip(group.results)
                .collect();
            AggregateResult {
                group_key,
                group_values,
                aggregates,
                count: group.count,
            }
        })
        .collect()
}
