//! Merge engine: selection, execution, logging and crash recovery.

use den::cache::ChunkMetadataCache;
use den::config::StorageGroupConfig;
use den::dts::writer::WriterConfig;
use den::dts::{DataType, DtsReader, TsValue};
use den::engine::{FlushManager, InsertPlan, MeasurementSchema, StorageGroupProcessor};
use den::merge::{
    recover_merge, LogAnalyzer, MergeLogger, MergeResource, MergeStatus, MergeStrategy,
    MergeTask, MERGE_LOG_NAME,
};
use den::query::read_series;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const DEVICE: &str = "root.vehicle.d0";

struct Fixture {
    group: StorageGroupProcessor,
    cache: Arc<ChunkMetadataCache>,
    _flush: Arc<FlushManager>,
    _merges: Arc<den::merge::MergeManager>,
}

fn open_group(data_dir: &Path, config: StorageGroupConfig) -> Fixture {
    let flush = Arc::new(FlushManager::start(2));
    let merges = Arc::new(den::merge::MergeManager::start(1));
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

fn row(ts: i64, value: i64) -> InsertPlan {
    InsertPlan::new(
        DEVICE,
        ts,
        vec![(
            MeasurementSchema::new("s0", DataType::Int64),
            TsValue::Int64(value),
        )],
    )
}

fn timestamps(fixture: &Fixture) -> Vec<i64> {
    let source = fixture.group.query(DEVICE, "s0", None).unwrap();
    read_series(&source, &fixture.cache)
        .unwrap()
        .into_iter()
        .map(|(ts, _)| ts)
        .collect()
}

/// Builds the mixed population of ten sequence and ten unsequence files.
fn mixed_population(fixture: &Fixture) {
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
}

#[test]
fn test_squeeze_full_merge_to_single_file() {
    let dir = TempDir::new().unwrap();
    let config = StorageGroupConfig::default().with_merge_strategy(MergeStrategy::Squeeze);
    let fixture = open_group(dir.path(), config);
    mixed_population(&fixture);
    assert_eq!(fixture.group.seq_file_resources().len(), 10);
    assert_eq!(fixture.group.unseq_file_resources().len(), 10);

    let done = fixture.group.merge(true);
    done.recv().unwrap().unwrap();

    let seq = fixture.group.seq_file_resources();
    assert_eq!(seq.len(), 1);
    assert!(fixture.group.unseq_file_resources().is_empty());
    assert!(!fixture.group.merge_log_path().exists());

    // lineage fingerprint of the output is the union of all inputs
    assert_eq!(seq[0].historical_versions().len(), 20);

    let expected: Vec<i64> = (1..=10).chain(21..=30).collect();
    assert_eq!(timestamps(&fixture), expected);
}

#[test]
fn test_inplace_merge_conserves_file_names() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();
    // overwrite the middle out of order
    for ts in 5..=8 {
        fixture.group.insert(&row(ts, ts * 100)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();

    let before: Vec<_> = fixture
        .group
        .seq_file_resources()
        .iter()
        .map(|r| r.path().to_path_buf())
        .collect();

    let done = fixture.group.merge(true);
    done.recv().unwrap().unwrap();

    let seq = fixture.group.seq_file_resources();
    let after: Vec<_> = seq.iter().map(|r| r.path().to_path_buf()).collect();
    assert_eq!(before, after);
    assert!(fixture.group.unseq_file_resources().is_empty());
    assert!(!fixture.group.merge_log_path().exists());
    // the rewritten file inherited the unseq lineage
    assert_eq!(seq[0].historical_versions().len(), 2);

    let source = fixture.group.query(DEVICE, "s0", None).unwrap();
    let data = read_series(&source, &fixture.cache).unwrap();
    assert_eq!(data.len(), 10);
    assert_eq!(data[4], (5, TsValue::Int64(500)));
    assert_eq!(data[8], (9, TsValue::Int64(9)));
}

#[test]
fn test_merge_respects_tombstones() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());

    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();
    fixture.group.insert(&row(3, 300)).unwrap();
    fixture.group.sync_close_all_working().unwrap();
    fixture.group.delete(DEVICE, "s0", 4).unwrap();

    let done = fixture.group.merge(true);
    done.recv().unwrap().unwrap();

    // the merge replayed the tombstones before producing output
    assert_eq!(timestamps(&fixture), vec![5, 6, 7, 8, 9, 10]);
}

#[test]
fn test_merge_without_unseq_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();

    let done = fixture.group.merge(false);
    done.recv().unwrap().unwrap();
    assert_eq!(fixture.group.seq_file_resources().len(), 1);
    assert!(!fixture.group.merge_log_path().exists());
}

#[test]
fn test_selector_budget_infeasible_returns_empty() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();
    fixture.group.insert(&row(1, 0)).unwrap();
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    let unseq = fixture.group.unseq_file_resources();
    let selection = MergeStrategy::Inplace
        .select_files(&seq, &unseq, 1, i64::MIN, 1000 * 3600)
        .unwrap();
    assert!(selection.unseq_files.is_empty());

    let selection = MergeStrategy::Inplace
        .select_files(&seq, &unseq, usize::MAX, i64::MIN, 1000 * 3600)
        .unwrap();
    assert_eq!(selection.unseq_files.len(), 1);
    assert_eq!(selection.seq_files.len(), 1);
}

#[test]
fn test_recover_resumes_merge_from_log() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    for ts in 1..=10 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();
    fixture.group.insert(&row(5, 500)).unwrap();
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    let unseq = fixture.group.unseq_file_resources();
    let sys_dir = fixture.group.merge_log_path().parent().unwrap().to_path_buf();

    // simulate a crash right after MERGE_START was logged
    {
        let mut logger = MergeLogger::open(&sys_dir).unwrap();
        logger
            .log_source(
                &seq.iter().map(|r| r.path().to_path_buf()).collect::<Vec<_>>(),
                &unseq.iter().map(|r| r.path().to_path_buf()).collect::<Vec<_>>(),
            )
            .unwrap();
        logger.log_merge_start().unwrap();
    }

    let outcome = recover_merge(
        &sys_dir,
        &seq,
        &unseq,
        true,
        MergeStrategy::Inplace,
        true,
        WriterConfig::default(),
    )
    .unwrap()
    .expect("merge resumed");
    assert_eq!(outcome.rewritten_seq.len(), 1);
    assert!(!sys_dir.join(MERGE_LOG_NAME).exists());

    // the resumed merge produced the merged file in place
    let reader = DtsReader::open(seq[0].path()).unwrap();
    let chunks = reader.chunk_metadata_list(DEVICE, "s0").unwrap();
    let samples = reader.read_chunk_samples(&chunks[0]).unwrap();
    assert_eq!(samples.len(), 10);
    assert_eq!(samples[4], (5, TsValue::Int64(500)));
}

#[test]
fn test_recover_aborts_when_told_to() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    for ts in 1..=5 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();
    fixture.group.insert(&row(2, 200)).unwrap();
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    let unseq = fixture.group.unseq_file_resources();
    let sys_dir = fixture.group.merge_log_path().parent().unwrap().to_path_buf();

    {
        let mut logger = MergeLogger::open(&sys_dir).unwrap();
        logger
            .log_source(
                &seq.iter().map(|r| r.path().to_path_buf()).collect::<Vec<_>>(),
                &unseq.iter().map(|r| r.path().to_path_buf()).collect::<Vec<_>>(),
            )
            .unwrap();
        logger.log_merge_start().unwrap();
    }
    // a half-written target temp left behind by the crash
    let temp = format!("{}.merge", seq[0].path().display());
    std::fs::write(&temp, b"garbage").unwrap();

    let outcome = recover_merge(
        &sys_dir,
        &seq,
        &unseq,
        false,
        MergeStrategy::Inplace,
        false,
        WriterConfig::default(),
    )
    .unwrap();
    assert!(outcome.is_none());
    assert!(!sys_dir.join(MERGE_LOG_NAME).exists());
    assert!(!Path::new(&temp).exists());
    // inputs are untouched and queryable
    assert_eq!(timestamps(&fixture), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_recover_aborts_when_inputs_are_gone() {
    let dir = TempDir::new().unwrap();
    let sys_dir = dir.path().join("root.vehicle");
    std::fs::create_dir_all(&sys_dir).unwrap();
    {
        let mut logger = MergeLogger::open(&sys_dir).unwrap();
        logger
            .log_source(&[sys_dir.join("0/seq/1-0.dts")], &[sys_dir.join("0/unseq/2-0.dts")])
            .unwrap();
        logger.log_merge_start().unwrap();
    }

    let outcome = recover_merge(
        &sys_dir,
        &[],
        &[],
        true,
        MergeStrategy::Inplace,
        false,
        WriterConfig::default(),
    )
    .unwrap();
    assert!(outcome.is_none());
    assert!(!sys_dir.join(MERGE_LOG_NAME).exists());
}

#[test]
fn test_recovery_through_storage_group_open() {
    let dir = TempDir::new().unwrap();
    {
        let fixture = open_group(dir.path(), StorageGroupConfig::default());
        for ts in 1..=10 {
            fixture.group.insert(&row(ts, ts)).unwrap();
        }
        fixture.group.sync_close_all_working().unwrap();
        fixture.group.insert(&row(7, 700)).unwrap();
        fixture.group.sync_close_all_working().unwrap();

        let seq = fixture.group.seq_file_resources();
        let unseq = fixture.group.unseq_file_resources();
        let sys_dir = fixture.group.merge_log_path().parent().unwrap().to_path_buf();
        let mut logger = MergeLogger::open(&sys_dir).unwrap();
        logger
            .log_source(
                &seq.iter().map(|r| r.path().to_path_buf()).collect::<Vec<_>>(),
                &unseq.iter().map(|r| r.path().to_path_buf()).collect::<Vec<_>>(),
            )
            .unwrap();
        logger.log_merge_start().unwrap();
    }

    // reopening the group hands the log to merge recovery before writes
    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    assert!(!fixture.group.merge_log_path().exists());
    assert!(fixture.group.unseq_file_resources().is_empty());
    let data_times = timestamps(&fixture);
    assert_eq!(data_times, (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_log_analyzer_sees_task_progress() {
    let dir = TempDir::new().unwrap();
    let fixture = open_group(dir.path(), StorageGroupConfig::default());
    for ts in 1..=5 {
        fixture.group.insert(&row(ts, ts)).unwrap();
    }
    fixture.group.sync_close_all_working().unwrap();
    fixture.group.insert(&row(1, 100)).unwrap();
    fixture.group.sync_close_all_working().unwrap();

    let seq = fixture.group.seq_file_resources();
    let unseq = fixture.group.unseq_file_resources();
    let sys_dir = fixture.group.merge_log_path().parent().unwrap().to_path_buf();

    let task = MergeTask {
        resource: MergeResource {
            seq_files: seq.clone(),
            unseq_files: unseq.clone(),
        },
        sys_dir: sys_dir.clone(),
        strategy: MergeStrategy::Inplace,
        full_merge: true,
        writer_config: WriterConfig::default(),
    };
    task.execute().unwrap();

    // a committed merge leaves no log behind
    let state = LogAnalyzer::analyze(&sys_dir.join(MERGE_LOG_NAME)).unwrap();
    assert_eq!(state.status, MergeStatus::None);
}
