/// Stateful engine.
///
/// Owns the loaded dataset, the index store for the current view and the
/// generation counters. Every call runs to completion on the caller's
/// thread; the worker module puts an engine behind a message channel.

use crate::aggregate::{self, AggregateResult, AggregateSpec};
use crate::config::EngineConfig;
use crate::dataset::Dataset;
use crate::error::{EngineError, Result};
use crate::index_store::IndexStore;
use crate::pivot::{compute_pivot, PivotConfig, PivotOutcome, PivotResult};
use crate::query::{self, FilterPredicate, QueryResult, QuerySpec, SortKey};
use crate::value::{ColumnValue, Row};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Reply to a load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub row_count: usize,
    pub column_keys: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Engine {
    config: EngineConfig,
    dataset: Option<Dataset>,
    index: IndexStore,
    /// Bumped on every load/filter/sort/query.
    view_generation: u64,
    /// Newest pivot generation started or announced.
    pivot_generation: u64,
    last_pivot: Option<PivotResult>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn dataset(&self) -> Result<&Dataset> {
        self.dataset.as_ref().ok_or(EngineError::EngineNotInitialized)
    }

    pub fn is_loaded(&self) -> bool {
        self.dataset.is_some()
    }

    /// Reset to a fresh, unloaded engine. Generation counters keep counting.
    pub fn init(&mut self) {
        self.dataset = None;
        self.index.clear();
        self.last_pivot = None;
        info!("engine initialized");
    }

    pub fn load_data(&mut self, rows: Vec<Row>) -> LoadSummary {
        let started = Instant::now();
        let dataset = Dataset::from_rows(rows);
        let summary = LoadSummary {
            row_count: dataset.len(),
            column_keys: dataset.column_keys().to_vec(),
        };
        self.index.initialize(dataset.len());
        self.dataset = Some(dataset);
        self.last_pivot = None;
        self.view_generation += 1;
        info!(
            "loaded {} rows, {} columns in {:?}",
            summary.row_count,
            summary.column_keys.len(),
            started.elapsed()
        );
        summary
    }

    fn apply_view(&mut self, result: QueryResult, what: &str, started: Instant) -> QueryResult {
        self.view_generation += 1;
        let result = result.with_generation(self.view_generation);
        self.index.apply_result(&result);
        debug!(
            "{}: {} of {} rows, generation {} in {:?}",
            what,
            result.filtered_count,
            result.total_count,
            self.view_generation,
            started.elapsed()
        );
        result
    }

    pub fn filter(&mut self, filters: &[FilterPredicate]) -> Result<QueryResult> {
        let started = Instant::now();
        let result = query::filter(self.dataset()?, filters);
        Ok(self.apply_view(result, "filter", started))
    }

    pub fn sort(&mut self, sorts: &[SortKey]) -> Result<QueryResult> {
        let started = Instant::now();
        let result = query::sort(self.dataset()?, sorts);
        Ok(self.apply_view(result, "sort", started))
    }

    pub fn query(&mut self, spec: &QuerySpec) -> Result<QueryResult> {
        let started = Instant::now();
        let result = query::query(self.dataset()?, spec);
        Ok(self.apply_view(result, "query", started))
    }

    pub fn aggregate(&self, spec: &AggregateSpec) -> Result<Vec<AggregateResult>> {
        let started = Instant::now();
        let results = aggregate::aggregate(self.dataset()?, spec);
        debug!("aggregate: {} groups in {:?}", results.len(), started.elapsed());
        Ok(results)
    }

    /// Record that a pivot with `generation` has been requested. A newer
    /// announcement drops the retained pivot.
    pub fn announce_pivot_generation(&mut self, generation: u64) {
        if generation > self.pivot_generation {
            self.pivot_generation = generation;
            self.last_pivot = None;
        }
    }

    /// Compute a pivot. Without an explicit generation the next one is used.
    /// A generation older than the newest one seen is reported stale and
    /// leaves the retained pivot untouched.
    pub fn pivot(&mut self, config: &PivotConfig, generation: Option<u64>) -> Result<PivotOutcome> {
        let generation = generation.unwrap_or(self.pivot_generation + 1);
        if generation < self.pivot_generation {
            warn!(
                "discarding pivot generation {} (newest is {})",
                generation, self.pivot_generation
            );
            return Ok(PivotOutcome::stale(generation));
        }
        let dataset = self.dataset()?;

        let started = Instant::now();
        let result = compute_pivot(dataset, config, generation);
        debug!(
            "pivot generation {}: {} rows, {} columns in {:?}",
            generation,
            result.rows.len(),
            result.column_keys.len(),
            started.elapsed()
        );

        self.pivot_generation = generation;
        self.last_pivot = Some(result.clone());
        Ok(PivotOutcome::Computed(result))
    }

    pub fn get_rows(&self, original_indices: &[u32]) -> Result<Vec<Row>> {
        Ok(self.dataset()?.get_rows(original_indices))
    }

    pub fn get_all_rows(&self) -> Result<Vec<Row>> {
        Ok(self.dataset()?.all_rows())
    }

    pub fn get_unique_values(&self, column_key: &str) -> Result<Vec<ColumnValue>> {
        Ok(self.dataset()?.unique_values(column_key))
    }

    /// Rows at visible positions `[start, end)` of the current view.
    /// Fails with `StaleView` when `expected_generation` names an older view.
    pub fn fetch_visible_rows(
        &self,
        start: usize,
        end: usize,
        expected_generation: Option<u64>,
    ) -> Result<Vec<Row>> {
        let dataset = self.dataset()?;
        if let Some(expected) = expected_generation {
            if expected != self.view_generation {
                return Err(EngineError::StaleView {
                    expected,
                    current: self.view_generation,
                });
            }
        }
        Ok(dataset.get_rows(&self.index.range_slice(start, end)))
    }

    pub fn cleanup(&mut self) {
        self.dataset = None;
        self.index.clear();
        self.last_pivot = None;
        info!("engine cleaned up");
    }

    pub fn view_generation(&self) -> u64 {
        self.view_generation
    }

    pub fn pivot_generation(&self) -> u64 {
        self.pivot_generation
    }

    pub fn last_pivot(&self) -> Option<&PivotResult> {
        self.last_pivot.as_ref()
    }

    pub fn index_store(&self) -> &IndexStore {
        &self.index
    }

    pub fn index_store_mut(&mut self) -> &mut IndexStore {
        &mut self.index
    }
}
