//! Glidein metrics aggregation
//!
//! This module provides:
//! - Per-partition rollups of worker transitions (launched/running/idle and
//!   idle-time statistics)
//! - Per-worker metric series with window-based staleness
//! - Push backends (Graphite plaintext, in-memory with render queries)

mod aggregator;
mod backend;

pub use aggregator::{
    AggregatorConfig, MetricsAggregator, PartitionSnapshot, AVG_IDLE_TIME, IDLE, LAUNCHED,
    MAX_IDLE_TIME, MIN_IDLE_TIME, PARTITION_METRICS, RUNNING,
};
pub use backend::{
    check_series, parse_from, FanoutBackend, GraphiteBackend, InMemoryTimeSeries,
    SeriesResponse, SeriesTags, TimeSeriesBackend,
};
