/// LivePivot - In-Memory Query, Aggregation and Pivot Engine
///
/// Answers filter/sort/aggregate/pivot queries over a tabular dataset and
/// returns results as shared index buffers and tree-shaped pivot structures.
/// The engine can run on an isolated worker thread that the caller talks to
/// only through request/response messages.

pub mod value;
pub mod dataset;
pub mod index_store;
pub mod query;
pub mod aggregate;
pub mod pivot;
pub mod cache;
pub mod engine;
pub mod messages;
pub mod remote;
pub mod worker;
pub mod viewport;
pub mod config;
pub mod error;

pub use value::{ColumnValue, Row, ValueKind};
pub use dataset::Dataset;
pub use index_store::{IndexBuffer, IndexChange, IndexStore};
pub use query::{FilterOperator, FilterPredicate, QueryResult, QuerySpec, SortDirection, SortKey};
pub use aggregate::{AggregateColumn, AggregateFn, AggregateResult, AggregateSpec, CustomAggregate};
pub use pivot::{
    PivotConfig, PivotHeaderNode, PivotOutcome, PivotResult, PivotRow, PivotRowType, RowMergeInfo, ValueField,
};
pub use cache::{RangeLookup, RowCache};
pub use engine::{Engine, LoadSummary};
pub use messages::{Reply, Request};
pub use remote::RemoteSource;
pub use worker::{EngineClient, EngineWorker};
pub use viewport::Viewport;
pub use config::{CacheConfig, EngineConfig, ServerConfig, ViewportConfig};
pub use error::{EngineError, Result};

// WebSocket server modules - only when server feature is enabled
#[cfg(feature = "server")]
pub mod websocket;
#[cfg(feature = "server")]
pub mod server;
