//! Storage-group lifecycle: seq/unseq routing, close, delete, tablet
//! writes, query snapshots and recovery.

use den::cache::ChunkMetadataCache;
use den::config::StorageGroupConfig;
use den::dts::{DataType, TimeRange, TsValue};
use den::engine::{
    FlushManager, InsertPlan, MeasurementSchema, StorageGroupProcessor, TabletPlan,
};
use den::merge::MergeManager;
use den::query::read_series;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const DEVICE: &str = "root.vehicle.d0";

struct Fixture {
    group: StorageGroupProcessor,
    cache: Arc<ChunkMetadataCache>,
    _flush: Arc<FlushManager>,
    _merges: Arc<MergeManager>,
}

fn open_group(data_dir: &Path, config: StorageGroupConfig) -> Fixture {
    let flush = Arc::new(FlushManager::start(2));
    let merges = Arc::new(MergeManager::start(1));
    let cache = Arc::new(ChunkMetadataCache::new(config.metadata_cache_size));
    let group = StorageGroupProcessor::open(
        data_dir,
        "root.vehicle",
        config,
        flush.clone(),
        merges.clone(),
        cache.clone(),
    )
    .unwrap();
    Fixture {
        group,
        cache,
        _flush: flush,
        _merges: merges,
    }
}

fn schema() -> MeasurementSchema {
    MeasurementSchema::new("s0", DataType::Int64)
}

fn row(ts: i64, value: i64) -> InsertPlan {
    InsertPlan::new(DEVICE, ts, vec![(schema(), TsValue::Int64(value))])
}

fn timestamps(fixture: &Fixture, filter: Option<TimeRange>) -> Vec<i64> {
    let source = fixture.group.query(DEVICE, "s0", filter).unwrap();
    read_series(&source, &fixture.cache)
        .unwrap()
        .into_iter()
        .map(|(ts, _)| ts)
        .collect()
}

#[test]
fn test_sequence_inserts_one_closed_file() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 1..=100 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    assert_eq!(seq.len(), 1);
    assert!(seq[0].is_closed());
    assert_eq!(seq[0].start_time(DEVICE), Some(1));
    assert_eq!(seq[0].end_time(DEVICE), Some(100));
    assert!(fixture.group.unseq_file_resources().is_empty());

    assert_eq!(timestamps(&fixture, None), (1..=100).collect::<Vec<_>>());
}

#[test]
fn test_out_of_order_write_goes_unseq() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 1..=50 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();

    // below the sealed end time: exclusively unsequence
    fixture.group.insert(&row(10, 1000)).unwrap();
    fixture.group.sync_close_all_working().unwrap();

    assert_eq!(fixture.group.seq_file_resources().len(), 1);
    let unseq = fixture.group.unseq_file_resources();
    assert_eq!(unseq.len(), 1);
    assert_eq!(unseq[0].start_time(DEVICE), Some(10));
    assert_eq!(unseq[0].end_time(DEVICE), Some(10));

    // the newer unseq sample wins at read
    let source = fixture.group.query(DEVICE, "s0", None).unwrap();
    let data = read_series(&source, &fixture.cache).unwrap();
    assert_eq!(data[9], (10, TsValue::Int64(1000)));
}

#[test]
fn test_unseq_unsealed_delete() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    fixture.group.insert(&row(10000, 1000)).unwrap();
    fixture.group.sync_close_all_working().unwrap();

    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();

    for ts in 11..=20 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.delete(DEVICE, "s0", 15).unwrap();

    let source = fixture.group.query(DEVICE, "s0", None).unwrap();
    assert_eq!(source.seq.len(), 1);
    assert_eq!(source.unseq.len(), 2);

    let unsealed = source
        .unseq
        .iter()
        .find(|view| !view.resource.is_closed())
        .expect("an unsealed unseq view");
    assert_eq!(unsealed.mem_chunks.len(), 1);
    let times: Vec<i64> = unsealed.mem_chunks[0]
        .samples
        .iter()
        .map(|(ts, _)| *ts)
        .collect();
    assert_eq!(times, vec![16, 17, 18, 19, 20]);
    assert!(unsealed.unsealed_chunk_metadata.is_empty());

    // full read: deleted samples are gone everywhere
    let data = read_series(&source, &fixture.cache).unwrap();
    let times: Vec<i64> = data.iter().map(|(ts, _)| *ts).collect();
    assert_eq!(times, vec![16, 17, 18, 19, 20, 10000]);
}

#[test]
fn test_sequence_sync_close_many_files() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
        fixture.group.async_close_all_working();
    }
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    assert_eq!(seq.len(), 10);
    assert!(seq.iter().all(|r| r.is_closed()));
    assert!(fixture.group.unseq_file_resources().is_empty());

    assert_eq!(timestamps(&fixture, None), (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_tablet_write_and_sync_close() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    let tablet = |range: std::ops::Range<i64>| TabletPlan {
        device: DEVICE.to_string(),
        timestamps: range.clone().collect(),
        columns: vec![
            (
                MeasurementSchema::new("s0", DataType::Int32),
                range.clone().map(|_| TsValue::Int32(1)).collect(),
            ),
            (
                MeasurementSchema::new("s1", DataType::Int64),
                range.map(|_| TsValue::Int64(1)).collect(),
            ),
        ],
    };

    let results = fixture.group.insert_tablet(&tablet(0..100));
    assert!(results.iter().all(|r| r.is_ok()));
    fixture.group.async_close_all_working();

    let results = fixture.group.insert_tablet(&tablet(50..149));
    assert!(results.iter().all(|r| r.is_ok()));
    fixture.group.async_close_all_working();
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    let unseq = fixture.group.unseq_file_resources();
    assert_eq!(seq.len(), 2);
    assert_eq!(unseq.len(), 1);
    assert!(seq.iter().chain(unseq.iter()).all(|r| r.is_closed()));

    // both columns answer over the merged timeline
    let source = fixture.group.query(DEVICE, "s1", None).unwrap();
    let data = read_series(&source, &fixture.cache).unwrap();
    assert_eq!(data.len(), 149);
}

#[test]
fn test_mixed_seq_unseq_populations() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 21..=30 {
        fixture.group.insert(&row(ts, ts)).unwrap();
        fixture.group.async_close_all_working();
    }
    fixture.group.sync_close_all_working().unwrap();

    for ts in (1..=10).rev() {
        fixture.group.insert(&row(ts, ts)).unwrap();
        fixture.group.async_close_all_working();
    }
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    let unseq = fixture.group.unseq_file_resources();
    assert_eq!(seq.len(), 10);
    assert_eq!(unseq.len(), 10);
    assert!(seq.iter().chain(unseq.iter()).all(|r| r.is_closed()));

    let expected: Vec<i64> = (1..=10).chain(21..=30).collect();
    assert_eq!(timestamps(&fixture, None), expected);
}

#[test]
fn test_time_filter_skips_files() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
        fixture.group.async_close_all_working();
    }
    fixture.group.sync_close_all_working().unwrap();

    let source = fixture
        .group
        .query(DEVICE, "s0", Some(TimeRange::new(4, 6)))
        .unwrap();
    assert_eq!(source.seq.len(), 3);
    let data = read_series(&source, &fixture.cache).unwrap();
    let times: Vec<i64> = data.iter().map(|(ts, _)| *ts).collect();
    assert_eq!(times, vec![4, 5, 6]);
}

#[test]
fn test_schema_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    let bad = InsertPlan::new(DEVICE, 1, vec![(schema(), TsValue::Boolean(true))]);
    assert!(fixture.group.insert(&bad).is_err());
    // the rejected write left no state behind
    assert!(fixture.group.seq_file_resources().is_empty());
}

#[test]
fn test_delete_in_sealed_files() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();
    fixture.group.delete(DEVICE, "s0", 5).unwrap();

    assert_eq!(timestamps(&fixture, None), vec![6, 7, 8, 9, 10]);

    // deleting everything leaves an empty answer, not an error
    fixture.group.delete(DEVICE, "s0", 100).unwrap();
    assert!(timestamps(&fixture, None).is_empty());
}

#[test]
fn test_recovery_reloads_sealed_files() {
    let dir = TempDir::new().unwrap();
    {
        let fixture = open_group(dir.path(), StorageGroupConfig::default());
        for ts in 1..=10 {
            fixture.group.insert(&row(ts, ts)).unwrap();
        }
        fixture.group.sync_close_all_working().unwrap();
        fixture.group.insert(&row(5, 50)).unwrap();
        fixture.group.sync_close_all_working().unwrap();
    }

    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    assert_eq!(fixture.group.seq_file_resources().len(), 1);
    assert_eq!(fixture.group.unseq_file_resources().len(), 1);

    let source = fixture.group.query(DEVICE, "s0", None).unwrap();
    let data = read_series(&source, &fixture.cache).unwrap();
    assert_eq!(data[4], (5, TsValue::Int64(50)));

    // classification state was rebuilt: an old timestamp goes unseq
    fixture.group.insert(&row(3, 30)).unwrap();
    fixture.group.sync_close_all_working().unwrap();
    assert_eq!(fixture.group.unseq_file_resources().len(), 2);
}

#[test]
fn test_recovery_seals_torn_file() {
    let dir = TempDir::new().unwrap();
    let file_path;
    {
        let fixture = open_group(dir.path(), StorageGroupConfig::default());
        for ts in 1..=10 {
            fixture.group.insert(&row(ts, ts)).unwrap();
        }
        fixture.group.sync_close_all_working().unwrap();
        let seq = fixture.group.seq_file_resources();
        file_path = seq[0].path().to_path_buf();
    }

    // tear the tail off the sealed file and drop its side-car, as if the
    // process had died mid-seal
    let bytes = std::fs::read(&file_path).unwrap();
    std::fs::write(&file_path, &bytes[..bytes.len() - 9]).unwrap();
    std::fs::remove_file(format!("{}.resource", file_path.display())).unwrap();

    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    let seq = fixture.group.seq_file_resources();
    assert_eq!(seq.len(), 1);
    assert!(seq[0].is_closed());
    assert_eq!(timestamps(&fixture, None), (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_unseq_ceiling_forces_close() {
    let dir = TempDir::new().unwrap();
    let config = StorageGroupConfig::default().with_unseq_files_per_partition_max(0);
    let fixture = open_group(dir.path(), config);

    for ts in 1..=5 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();

    // every out-of-order write now force-closes the unsequence slot
    fixture.group.insert(&row(1, 0)).unwrap();
    fixture.group.insert(&row(2, 0)).unwrap();
    fixture.group.sync_close_all_working().unwrap();
    assert!(fixture.group.unseq_file_resources().len() >= 2);
}
