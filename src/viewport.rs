/// Caller-side windowed reader.
///
/// Serves visible-position ranges from a `RowCache`, fetching whatever is
/// missing from the engine. Scrolling schedules a debounced prefetch: each
/// `scroll_to` aborts the pending one and starts a new timer, so only the
/// last position of a burst is fetched. After a prefetch lands, entries far
/// outside the window are evicted.

use crate::cache::RowCache;
use crate::config::ViewportConfig;
use crate::error::{EngineError, Result};
use crate::query::QueryResult;
use crate::value::Row;
use crate::worker::EngineClient;
use log::debug;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

#[derive(Debug)]
struct ViewState {
    cache: RowCache,
    /// View generation the cached rows belong to.
    generation: Option<u64>,
    visible_count: usize,
}

pub struct Viewport {
    client: EngineClient,
    config: ViewportConfig,
    state: Arc<tokio::sync::Mutex<ViewState>>,
    prefetch: Mutex<Option<JoinHandle<()>>>,
}

/// Fetch `[start, end)` into the cache unless the view moved on meanwhile.
async fn fill(
    client: &EngineClient,
    state: &tokio::sync::Mutex<ViewState>,
    start: usize,
    end: usize,
) -> Result<Vec<Row>> {
    let generation = state.lock().await.generation;
    let rows = match client.fetch_visible_rows(start, end, generation).await {
        Ok(rows) => rows,
        Err(e @ EngineError::StaleView { .. }) => {
            let mut state = state.lock().await;
            state.cache.invalidate();
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    let mut state = state.lock().await;
    if state.generation == generation {
        state.cache.set_range(start, rows.clone());
    }
    Ok(rows)
}

impl Viewport {
    pub fn new(client: EngineClient, config: ViewportConfig) -> Self {
        let cache = RowCache::new(config.cache.clone());
        Viewport {
            client,
            config,
            state: Arc::new(tokio::sync::Mutex::new(ViewState {
                cache,
                generation: None,
                visible_count: 0,
            })),
            prefetch: Mutex::new(None),
        }
    }

    /// Adopt a new view after a filter, sort or query. Cached positions are
    /// dropped.
    pub async fn set_view(&self, result: &QueryResult) {
        self.cancel_prefetch();
        let mut state = self.state.lock().await;
        state.cache.invalidate();
        state.generation = Some(result.generation);
        state.visible_count = result.filtered_count;
    }

    pub async fn invalidate(&self) {
        self.cancel_prefetch();
        self.state.lock().await.cache.invalidate();
    }

    /// Rows at visible positions `[start, end)`, from cache where possible.
    pub async fn rows(&self, start: usize, end: usize) -> Result<Vec<Row>> {
        let (mut slots, missing) = {
            let mut state = self.state.lock().await;
            let end = end.min(state.visible_count.max(start));
            let lookup = state.cache.get_range(start, end);
            if lookup.complete {
                return Ok(lookup.rows.into_iter().flatten().collect());
            }
            (lookup.rows, lookup.missing_indices)
        };

        let (first, last) = match (missing.first(), missing.last()) {
            (Some(&first), Some(&last)) => (first, last + 1),
            _ => return Ok(slots.into_iter().flatten().collect()),
        };
        let fetched = fill(&self.client, &self.state, first, last).await?;
        for (offset, row) in fetched.into_iter().enumerate() {
            if let Some(slot) = slots.get_mut(first - start + offset) {
                *slot = Some(row);
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Note a new visible window and schedule a prefetch around it.
    pub fn scroll_to(&self, start: usize, end: usize) {
        let client = self.client.clone();
        let state = Arc::clone(&self.state);
        let debounce = self.config.prefetch_debounce;
        let margin = self.config.prefetch_margin;

        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            let (from, to) = {
                let state = state.lock().await;
                let to = end.saturating_add(margin).min(state.visible_count);
                (start.saturating_sub(margin), to)
            };
            if from < to {
                if let Err(e) = fill(&client, &state, from, to).await {
                    debug!("prefetch {}..{} failed: {}", from, to, e);
                    return;
                }
            }
            state.lock().await.cache.evict_outside_range(start, end);
        });

        let previous = self
            .prefetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_prefetch(&self) {
        let pending = self.prefetch.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pending) = pending {
            pending.abort();
        }
    }

    /// Wait for the scheduled prefetch, if any, to finish.
    pub async fn settle(&self) {
        let pending = self.prefetch.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pending) = pending {
            let _ = pending.await;
        }
    }

    pub async fn cached_len(&self) -> usize {
        self.state.lock().await.cache.len()
    }

    pub async fn is_cached(&self, position: usize) -> bool {
        self.state.lock().await.cache.contains(position)
    }

    pub async fn cache_version(&self) -> u64 {
        self.state.lock().await.cache.version()
    }
}

impl Drop for Viewport {
    fn drop(&mut self) {
        self.cancel_prefetch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, EngineConfig};
    use crate::query::{FilterOperator, FilterPredicate, SortKey};
    use crate::value::ColumnValue;
    use crate::worker::EngineWorker;
    use std::time::Duration;

    fn rows(n: i64) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id", ColumnValue::Int(i));
                row
            })
            .collect()
    }

    fn config() -> ViewportConfig {
        ViewportConfig {
            cache: CacheConfig {
                max_size: 10_000,
                buffer_multiplier: 0.5,
            },
            prefetch_debounce: Duration::from_millis(20),
            prefetch_margin: 5,
        }
    }

    async fn viewport(n: i64) -> (EngineClient, Viewport) {
        let client = EngineWorker::spawn(EngineConfig::default()).unwrap();
        client.load_data(rows(n)).await.unwrap();
        let result = client.query(Default::default()).await.unwrap();
        let viewport = Viewport::new(client.clone(), config());
        viewport.set_view(&result).await;
        (client, viewport)
    }

    #[tokio::test]
    async fn test_rows_fill_the_cache() {
        let (_client, viewport) = viewport(100).await;
        let rows = viewport.rows(10, 20).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.value("id").as_i64().unwrap()).collect();
        assert_eq!(ids, (10..20).collect::<Vec<_>>());
        assert_eq!(viewport.cached_len().await, 10);

        // past the end is clamped
        assert_eq!(viewport.rows(95, 200).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_scroll_burst_prefetches_only_last_window() {
        let (_client, viewport) = viewport(1000).await;
        viewport.scroll_to(0, 10);
        viewport.scroll_to(200, 210);
        viewport.scroll_to(500, 510);
        viewport.settle().await;

        assert!(viewport.is_cached(495).await);
        assert!(viewport.is_cached(514).await);
        assert!(!viewport.is_cached(0).await);
        assert!(!viewport.is_cached(200).await);
    }

    #[tokio::test]
    async fn test_prefetch_evicts_outside_window() {
        let (_client, viewport) = viewport(1000).await;
        viewport.rows(0, 100).await.unwrap();
        viewport.scroll_to(600, 620);
        viewport.settle().await;
        // keep window 600..620 with a 10 row buffer
        assert!(!viewport.is_cached(50).await);
        assert!(viewport.is_cached(610).await);
    }

    #[tokio::test]
    async fn test_new_view_invalidates() {
        let (client, viewport) = viewport(50).await;
        viewport.rows(0, 10).await.unwrap();
        let version = viewport.cache_version().await;

        let result = client
            .filter(vec![FilterPredicate::new("id", FilterOperator::Gte, ColumnValue::Int(40))])
            .await
            .unwrap();
        viewport.set_view(&result).await;
        assert_eq!(viewport.cached_len().await, 0);
        assert!(viewport.cache_version().await > version);

        let rows = viewport.rows(0, 20).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].value("id"), &ColumnValue::Int(40));
    }

    #[tokio::test]
    async fn test_stale_view_is_reported() {
        let (client, viewport) = viewport(50).await;
        client.sort(vec![SortKey::descending("id")]).await.unwrap();
        let err = viewport.rows(0, 5).await.unwrap_err();
        assert!(matches!(err, EngineError::StaleView { .. }));
    }
}
