//! Den - Alopex storage-group engine for device time series.
//!
//! This crate provides the storage core of the Alopex Den time series
//! database: per-device, per-measurement samples are routed into
//! in-memory buffers backed by partitioned on-disk files, flushed into
//! immutable columnar DTS files, merged across the sequence and
//! out-of-order populations with a crash-recoverable log, and deleted
//! through tombstones that coexist with concurrent queries.
//!
//! # Components
//!
//! - [`StorageGroupProcessor`]: partition/seq-vs-unseq routing, lifecycle,
//!   deletes, query snapshots, merge trigger
//! - [`TsFileProcessor`]: memtable owner of one unsealed file
//! - [`DtsWriter`] / [`DtsReader`]: DTS columnar file format I/O
//! - [`ChunkMetadataCache`]: bounded LRU over chunk-metadata lists
//! - [`merge`]: file selection, merge execution and crash recovery
//!
//! # Example
//!
//! ```rust,ignore
//! use den::config::StorageGroupConfig;
//! use den::engine::{FlushManager, InsertPlan, MeasurementSchema, StorageGroupProcessor};
//! use den::dts::{DataType, TsValue};
//!
//! let flush = Arc::new(FlushManager::start(2));
//! let merges = Arc::new(MergeManager::start(1));
//! let cache = Arc::new(ChunkMetadataCache::new(32 << 20));
//! let group = StorageGroupProcessor::open(
//!     data_dir, "root.vehicle", StorageGroupConfig::default(), flush, merges, cache)?;
//!
//! let schema = MeasurementSchema::new("s0", DataType::Int32);
//! group.insert(&InsertPlan::new("root.vehicle.d0", 1, vec![(schema, TsValue::Int32(42))]))?;
//! group.sync_close_all_working()?;
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod dts;
pub mod engine;
pub mod error;
pub mod merge;
pub mod query;

pub use cache::ChunkMetadataCache;
pub use config::StorageGroupConfig;
pub use dts::{DtsReader, DtsWriter};
pub use engine::{FlushManager, StorageGroupProcessor, TsFileProcessor};
pub use error::{DenError, Result};
pub use merge::{MergeManager, MergeStrategy};
