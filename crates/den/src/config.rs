//! Configuration for a storage group.

use crate::merge::MergeStrategy;

/// Default width of a time partition: one week in milliseconds.
pub const DEFAULT_PARTITION_INTERVAL_MS: i64 = 7 * 24 * 3600 * 1000;

/// Default flush trigger for a working memtable: 128 MB.
pub const DEFAULT_MEMTABLE_SIZE_THRESHOLD: usize = 128 * 1024 * 1024;

/// Default ceiling of unsealed unsequence files per partition.
pub const DEFAULT_UNSEQ_FILES_PER_PARTITION_MAX: usize = 10;

/// Default metadata cache budget: 32 MB. Zero disables the cache.
pub const DEFAULT_METADATA_CACHE_SIZE: usize = 32 * 1024 * 1024;

/// Default merge memory budget: 256 MB.
pub const DEFAULT_MERGE_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

/// Default fanout of a metadata index node.
pub const DEFAULT_MAX_DEGREE_OF_INDEX_NODE: usize = 256;

/// Default bloom filter false-positive rate.
pub const DEFAULT_BLOOM_FILTER_ERROR_RATE: f64 = 0.05;

/// Configuration for one storage group.
///
/// All knobs recognized by the engine live here; collaborators receive a
/// clone at construction instead of reading ambient state.
#[derive(Debug, Clone)]
pub struct StorageGroupConfig {
    /// Width of a time partition in milliseconds.
    ///
    /// Files never cross partitions. Default: one week.
    pub partition_interval_ms: i64,

    /// Memtable byte size that triggers an asynchronous close.
    pub memtable_size_threshold: usize,

    /// Force-close ceiling for unsealed unsequence files in one partition.
    pub unseq_files_per_partition_max: usize,

    /// Byte budget of the chunk-metadata cache. Zero disables caching.
    pub metadata_cache_size: usize,

    /// Merge strategy for this storage group.
    pub merge_strategy: MergeStrategy,

    /// Memory budget handed to the merge file selector.
    pub merge_memory_budget: usize,

    /// TTL horizon: files whose every device ended before this bound are
    /// no longer merge candidates. `i64::MIN` disables the horizon.
    pub time_lower_bound: i64,

    /// During recovery, treat every resumed merge as a full merge.
    pub force_full_merge: bool,

    /// Fanout of a metadata index node.
    pub max_degree_of_index_node: usize,

    /// False-positive rate of the per-file bloom filter.
    pub bloom_filter_error_rate: f64,

    /// Number of flush worker threads.
    pub flush_workers: usize,
}

impl Default for StorageGroupConfig {
    fn default() -> Self {
        Self {
            partition_interval_ms: DEFAULT_PARTITION_INTERVAL_MS,
            memtable_size_threshold: DEFAULT_MEMTABLE_SIZE_THRESHOLD,
            unseq_files_per_partition_max: DEFAULT_UNSEQ_FILES_PER_PARTITION_MAX,
            metadata_cache_size: DEFAULT_METADATA_CACHE_SIZE,
            merge_strategy: MergeStrategy::default(),
            merge_memory_budget: DEFAULT_MERGE_MEMORY_BUDGET,
            time_lower_bound: i64::MIN,
            force_full_merge: false,
            max_degree_of_index_node: DEFAULT_MAX_DEGREE_OF_INDEX_NODE,
            bloom_filter_error_rate: DEFAULT_BLOOM_FILTER_ERROR_RATE,
            flush_workers: 2,
        }
    }
}

impl StorageGroupConfig {
    /// Sets the partition interval.
    pub fn with_partition_interval_ms(mut self, interval: i64) -> Self {
        self.partition_interval_ms = interval;
        self
    }

    /// Sets the memtable flush trigger.
    pub fn with_memtable_size_threshold(mut self, threshold: usize) -> Self {
        self.memtable_size_threshold = threshold;
        self
    }

    /// Sets the unsealed unsequence file ceiling.
    pub fn with_unseq_files_per_partition_max(mut self, max: usize) -> Self {
        self.unseq_files_per_partition_max = max;
        self
    }

    /// Sets the metadata cache byte budget.
    pub fn with_metadata_cache_size(mut self, size: usize) -> Self {
        self.metadata_cache_size = size;
        self
    }

    /// Sets the merge strategy.
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Sets the merge memory budget.
    pub fn with_merge_memory_budget(mut self, budget: usize) -> Self {
        self.merge_memory_budget = budget;
        self
    }

    /// Sets the TTL horizon.
    pub fn with_time_lower_bound(mut self, bound: i64) -> Self {
        self.time_lower_bound = bound;
        self
    }

    /// Sets whether recovered merges are forced to full merges.
    pub fn with_force_full_merge(mut self, force: bool) -> Self {
        self.force_full_merge = force;
        self
    }

    /// Sets the metadata index fanout.
    pub fn with_max_degree_of_index_node(mut self, degree: usize) -> Self {
        self.max_degree_of_index_node = degree;
        self
    }

    /// Sets the bloom filter error rate.
    pub fn with_bloom_filter_error_rate(mut self, rate: f64) -> Self {
        self.bloom_filter_error_rate = rate;
        self
    }

    /// Sets the number of flush workers.
    pub fn with_flush_workers(mut self, workers: usize) -> Self {
        self.flush_workers = workers;
        self
    }

    /// Maps a timestamp to its time partition.
    pub fn time_partition(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.partition_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = StorageGroupConfig::default()
            .with_partition_interval_ms(1000)
            .with_memtable_size_threshold(4096)
            .with_unseq_files_per_partition_max(3)
            .with_flush_workers(1);

        assert_eq!(config.partition_interval_ms, 1000);
        assert_eq!(config.memtable_size_threshold, 4096);
        assert_eq!(config.unseq_files_per_partition_max, 3);
        assert_eq!(config.flush_workers, 1);
    }

    #[test]
    fn test_time_partition_negative_timestamps() {
        let config = StorageGroupConfig::default().with_partition_interval_ms(100);
        assert_eq!(config.time_partition(0), 0);
        assert_eq!(config.time_partition(99), 0);
        assert_eq!(config.time_partition(100), 1);
        assert_eq!(config.time_partition(-1), -1);
        assert_eq!(config.time_partition(-100), -1);
        assert_eq!(config.time_partition(-101), -2);
    }
}
