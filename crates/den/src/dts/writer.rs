//! DTS file writer.
//!
//! A writer appends chunk groups and version records to an unsealed file.
//! Sealing appends the separator, the metadata index region, the file
//! metadata with a bloom filter, the 4-byte metadata size and the tail
//! magic. A writer can also be restored onto a torn file: the self-check
//! scan finds the largest safe prefix, the file is truncated there, and
//! writing continues with the recovered chunk groups already accounted
//! for.

use crate::dts::chunk::{build_pages, ChunkGroupFooter, ChunkHeader};
use crate::dts::metadata::{
    apply_versions, build_metadata_index, ChunkGroupMetadata, ChunkMetadata, FileMetadata,
    TimeseriesMetadata,
};
use crate::dts::reader::{CheckResult, DtsReader};
use crate::dts::statistics::Statistics;
use crate::dts::{
    BloomFilter, CompressionType, DataType, Encoding, Timestamp, TsValue, HEADER_LEN, MAGIC,
    MARKER_SEPARATOR, MARKER_VERSION, VERSION,
};
use crate::error::{DenError, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Layout parameters of the sealed metadata section.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Fanout of a metadata index node.
    pub max_degree_of_index_node: usize,
    /// False-positive rate of the bloom filter.
    pub bloom_filter_error_rate: f64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_degree_of_index_node: crate::config::DEFAULT_MAX_DEGREE_OF_INDEX_NODE,
            bloom_filter_error_rate: crate::config::DEFAULT_BLOOM_FILTER_ERROR_RATE,
        }
    }
}

/// Snapshot of a writer's progress, taken before a flush attempt so a
/// failed attempt can be rolled back wholesale.
#[derive(Debug, Clone, Copy)]
pub struct WriterCheckpoint {
    position: u64,
    chunk_groups: usize,
    versions: usize,
}

/// Append-only writer for one DTS file.
pub struct DtsWriter {
    path: PathBuf,
    file: BufWriter<File>,
    position: u64,
    config: WriterConfig,
    chunk_groups: Vec<ChunkGroupMetadata>,
    version_info: Vec<(u64, u64)>,
    current_device: Option<String>,
    current_chunks: Vec<ChunkMetadata>,
    group_start: u64,
    sealed: bool,
}

impl DtsWriter {
    /// Creates a new file and writes the head magic and version.
    pub fn create(path: &Path, config: WriterConfig) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&MAGIC)?;
        writer.write_all(&VERSION)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: writer,
            position: HEADER_LEN,
            config,
            chunk_groups: Vec::new(),
            version_info: Vec::new(),
            current_device: None,
            current_chunks: Vec::new(),
            group_start: 0,
            sealed: false,
        })
    }

    /// Restores a writer onto a possibly torn file.
    ///
    /// Runs the self-check scan, truncates the file to the largest safe
    /// prefix and reopens it for appending. The recovered chunk groups and
    /// version records seed the writer, so a later [`seal`](Self::seal)
    /// indexes them as if they had been written by this writer.
    pub fn restore(path: &Path, config: WriterConfig) -> Result<Self> {
        let outcome = DtsReader::self_check(path, false)?;
        match outcome.result {
            CheckResult::Incompatible => Err(DenError::Corrupted {
                path: path.to_path_buf(),
                reason: "incompatible head magic or version".to_string(),
            }),
            CheckResult::OnlyHeader | CheckResult::Complete | CheckResult::Truncated(_) => {
                let truncated = outcome.truncated_pos;
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                if file.metadata()?.len() != truncated {
                    debug!(path = %path.display(), truncated, "truncating torn tail");
                    file.set_len(truncated)?;
                }
                let mut file = file;
                file.seek(SeekFrom::Start(truncated))?;
                Ok(Self {
                    path: path.to_path_buf(),
                    file: BufWriter::new(file),
                    position: truncated,
                    config,
                    chunk_groups: outcome.chunk_groups,
                    version_info: outcome.versions,
                    current_device: None,
                    current_chunks: Vec::new(),
                    group_start: 0,
                    sealed: false,
                })
            }
        }
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current append position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether the file has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Opens a chunk group for the device.
    pub fn start_chunk_group(&mut self, device: &str) {
        debug_assert!(self.current_device.is_none(), "chunk group already open");
        self.current_device = Some(device.to_string());
        self.current_chunks = Vec::new();
        self.group_start = self.position;
    }

    /// Writes one chunk from a sorted sample run.
    pub fn write_chunk(
        &mut self,
        measurement: &str,
        data_type: DataType,
        encoding: Encoding,
        compression: CompressionType,
        samples: &[(Timestamp, TsValue)],
    ) -> Result<()> {
        debug_assert!(self.current_device.is_some(), "no open chunk group");
        if samples.is_empty() {
            return Ok(());
        }

        let pages = build_pages(samples, encoding, compression)?;
        let data_size: usize = pages
            .iter()
            .map(|p| p.header.serialized_size() + p.payload.len())
            .sum();

        let header = ChunkHeader {
            measurement: measurement.to_string(),
            data_size: data_size as u32,
            data_type,
            compression,
            encoding,
            num_pages: pages.len() as u32,
        };

        let offset_of_chunk_header = self.position;
        header.write_to(&mut self.file)?;
        self.position += header.serialized_size() as u64;

        let mut statistics = Statistics::new();
        for page in &pages {
            page.header.write_to(&mut self.file)?;
            self.file.write_all(&page.payload)?;
            self.position += (page.header.serialized_size() + page.payload.len()) as u64;
            statistics.merge(&page.header.statistics);
        }

        self.current_chunks.push(ChunkMetadata {
            measurement: measurement.to_string(),
            data_type,
            offset_of_chunk_header,
            data_size: data_size as u32,
            statistics,
            version: 0,
        });
        Ok(())
    }

    /// Closes the open chunk group with its footer.
    pub fn end_chunk_group(&mut self) -> Result<()> {
        let device = self
            .current_device
            .take()
            .expect("no open chunk group to close");
        let footer = ChunkGroupFooter {
            device: device.clone(),
            data_size: self.position - self.group_start,
            num_chunks: self.current_chunks.len() as u32,
        };
        footer.write_to(&mut self.file)?;
        self.position += footer.serialized_size() as u64;
        self.chunk_groups.push(ChunkGroupMetadata {
            device,
            chunks: std::mem::take(&mut self.current_chunks),
        });
        Ok(())
    }

    /// Appends a version record.
    pub fn write_version(&mut self, version: u64) -> Result<()> {
        self.file.write_all(&[MARKER_VERSION])?;
        self.file.write_all(&version.to_le_bytes())?;
        self.position += 9;
        self.version_info.push((self.position, version));
        Ok(())
    }

    /// Snapshot of the writer's progress.
    pub fn checkpoint(&self) -> WriterCheckpoint {
        WriterCheckpoint {
            position: self.position,
            chunk_groups: self.chunk_groups.len(),
            versions: self.version_info.len(),
        }
    }

    /// Rolls the writer back to a checkpoint after a failed write, so a
    /// retry starts from a clean boundary.
    ///
    /// The buffered writer is replaced without flushing; whatever bytes a
    /// failed append left behind are cut off by the truncate.
    pub fn rollback_to(&mut self, checkpoint: WriterCheckpoint) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(checkpoint.position)?;
        let mut file = file;
        file.seek(SeekFrom::Start(checkpoint.position))?;
        let old = std::mem::replace(&mut self.file, BufWriter::new(file));
        let (old_file, _buffered) = old.into_parts();
        drop(old_file);
        self.position = checkpoint.position;
        self.chunk_groups.truncate(checkpoint.chunk_groups);
        self.version_info.truncate(checkpoint.versions);
        self.current_device = None;
        self.current_chunks.clear();
        self.sealed = false;
        Ok(())
    }

    /// Flushes buffered bytes and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Chunk metadata visible so far for one series, versions applied.
    ///
    /// Only chunks of completed chunk groups are visible.
    pub fn visible_chunk_metadata(&self, device: &str, measurement: &str) -> Vec<ChunkMetadata> {
        let mut chunks: Vec<ChunkMetadata> = self
            .chunk_groups
            .iter()
            .filter(|group| group.device == device)
            .flat_map(|group| group.chunks.iter())
            .filter(|chunk| chunk.measurement == measurement)
            .cloned()
            .collect();
        apply_versions(&mut chunks, &self.version_info);
        chunks.sort_by_key(|c| c.start_time());
        chunks
    }

    /// Devices with at least one completed chunk group.
    pub fn visible_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> =
            self.chunk_groups.iter().map(|g| g.device.clone()).collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Recovered or accumulated chunk groups, for resource rebuilds.
    pub fn chunk_groups(&self) -> &[ChunkGroupMetadata] {
        &self.chunk_groups
    }

    /// Largest version recorded so far.
    pub fn max_version(&self) -> Option<u64> {
        self.version_info.iter().map(|(_, v)| *v).max()
    }

    /// Seals the file: separator, metadata index region, file metadata,
    /// metadata size, tail magic, fsync.
    pub fn seal(&mut self) -> Result<()> {
        debug_assert!(self.current_device.is_none(), "open chunk group at seal");
        if self.sealed {
            return Ok(());
        }

        self.file.write_all(&[MARKER_SEPARATOR])?;
        self.position += 1;

        // device -> sorted series -> (series metadata, chunks in file order)
        let mut series: BTreeMap<String, BTreeMap<String, Vec<ChunkMetadata>>> = BTreeMap::new();
        for group in &self.chunk_groups {
            for chunk in &group.chunks {
                series
                    .entry(group.device.clone())
                    .or_default()
                    .entry(chunk.measurement.clone())
                    .or_default()
                    .push(chunk.clone());
            }
        }

        let mut bloom = BloomFilter::new(
            series.values().map(|m| m.len()).sum::<usize>(),
            self.config.bloom_filter_error_rate,
        );
        let mut indexed: BTreeMap<String, Vec<(TimeseriesMetadata, Vec<ChunkMetadata>)>> =
            BTreeMap::new();
        for (device, measurements) in series {
            let mut list = Vec::with_capacity(measurements.len());
            for (measurement, chunks) in measurements {
                bloom.insert(&format!("{device}.{measurement}"));
                let mut statistics = Statistics::new();
                for chunk in &chunks {
                    statistics.merge(&chunk.statistics);
                }
                list.push((
                    TimeseriesMetadata {
                        measurement,
                        data_type: chunks[0].data_type,
                        chunk_metadata_list_offset: 0,
                        chunk_metadata_list_size: 0,
                        statistics,
                    },
                    chunks,
                ));
            }
            indexed.insert(device, list);
        }

        let mut region = Vec::new();
        let root = build_metadata_index(
            &indexed,
            &mut region,
            self.position,
            self.config.max_degree_of_index_node,
        )?;
        self.file.write_all(&region)?;
        self.position += region.len() as u64;

        let metadata = FileMetadata {
            metadata_index: root,
            version_info: self.version_info.clone(),
            bloom_filter: Some(bloom),
        };
        let mut metadata_bytes = Vec::new();
        metadata.write_to(&mut metadata_bytes)?;
        self.file.write_all(&metadata_bytes)?;
        self.file
            .write_all(&(metadata_bytes.len() as i32).to_le_bytes())?;
        self.file.write_all(&MAGIC)?;
        self.position += metadata_bytes.len() as u64 + 4 + MAGIC.len() as u64;

        self.sync()?;
        self.sealed = true;
        debug!(path = %self.path.display(), size = self.position, "sealed file");
        Ok(())
    }
}
