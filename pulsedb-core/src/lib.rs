//! PulseDB Core - Lightweight Time-Series Storage for Device Metrics
//!
//! A Rust time-series store for numeric and string counters pushed
//! continuously by many monitored devices:
//!
//! - High-throughput batched writes into memory-mapped partition files
//! - Fixed-size block layout under a date/counter directory hierarchy
//! - Parallel query fan-out over (days x objects x blocks)
//! - Aggregations (avg/sum/min/max), histograms and gauges
//!
//! # Architecture
//!
//! PulseDB is built from four cooperating components:
//!
//! - **Mapped File**: resizable shared memory mapping with bounds-checked
//!   reads and writes under a reader-writer lock
//! - **Block Storage Engine**: per-object append into 4 KiB blocks inside
//!   partition data files, with a JSON side-index per partition
//! - **Write Pipeline**: batch buffer keyed by (object, counter), flushed
//!   on a timer into a pool of writer workers
//! - **Query Engine**: query distributor, reader shards and a bounded
//!   worker pool, with a read-through result cache

pub mod client;
pub mod config;
pub mod db;
pub mod query;
pub mod storage;
pub mod types;
pub mod write;

mod error;

pub use client::QueryClient;
pub use config::{Config, CounterConfig, CounterRegistry};
pub use db::{Database, DatabaseHandle};
pub use error::{Error, Result};
pub use types::*;

/// PulseDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tuning values
pub mod defaults {
    use std::time::Duration;

    /// On-disk block size (4 KiB)
    pub const BLOCK_SIZE: usize = 4096;

    /// Partitions per (date, counter) directory
    pub const NUM_PARTITIONS: usize = 3;

    /// Initial mapping size of a data file, in blocks (4 MiB)
    pub const INITIAL_MAP_BLOCKS: usize = 1024;

    /// Extra blocks mapped ahead when a data file grows
    pub const GROW_SLACK_BLOCKS: usize = 1024;

    /// Batch buffer flush cadence
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

    /// Batch-channel capacity multiplier per configured writer
    pub const WRITER_BATCH_MULTIPLIER: usize = 1000;

    /// Query worker-pool slots per reader shard
    pub const WORKERS_PER_READER: usize = 5;

    /// Histogram bucket width when the query omits an interval
    pub const HISTOGRAM_INTERVAL_SECS: u32 = 10;

    /// Gauge interval when the query omits one
    pub const GAUGE_INTERVAL_SECS: u32 = 30;

    /// Maximum read-cache cost (1 GiB, cost = data points)
    pub const CACHE_MAX_COST: u64 = 1 << 30;

    /// Read-cache entry time-to-live
    pub const CACHE_TTL: Duration = Duration::from_secs(1000 * 60);

    /// How long a client waits for a query response
    pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
}
