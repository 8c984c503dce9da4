//! DTS file reader: metadata traversal, chunk reads and self-check.

use crate::dts::chunk::{decode_page, ChunkGroupFooter, ChunkHeader, PageHeader};
use crate::dts::metadata::{
    apply_versions, read_timeseries_run, ChunkGroupMetadata, ChunkMetadata, FileMetadata,
    MetadataIndexEntry, MetadataIndexNode, MetadataIndexNodeType, TimeseriesMetadata,
};
use crate::dts::statistics::Statistics;
use crate::dts::{
    BloomFilter, SeriesPath, Timestamp, TsValue, HEADER_LEN, MAGIC, MARKER_CHUNK_GROUP_FOOTER,
    MARKER_CHUNK_HEADER, MARKER_SEPARATOR, MARKER_VERSION, VERSION,
};
use crate::error::{DenError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome class of the self-check scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Head and tail magic both present; the file is sealed.
    Complete,
    /// The file holds nothing but the head magic and version.
    OnlyHeader,
    /// Wrong magic or shorter than the head.
    Incompatible,
    /// The data section ends cleanly at the contained position.
    Truncated(u64),
}

/// Everything the self-check scan learned about a file.
#[derive(Debug)]
pub struct SelfCheckOutcome {
    /// Outcome class.
    pub result: CheckResult,
    /// Largest safe prefix length. Truncating here leaves a syntactically
    /// complete sequence of chunk groups and version records.
    pub truncated_pos: u64,
    /// Chunk groups recovered from the safe prefix.
    pub chunk_groups: Vec<ChunkGroupMetadata>,
    /// (position, version) pairs recovered from the safe prefix.
    pub versions: Vec<(u64, u64)>,
}

/// Random-access reader over one DTS file.
pub struct DtsReader {
    path: PathBuf,
    file: Mutex<BufReader<File>>,
    file_size: u64,
    metadata_pos: u64,
    metadata_size: u32,
    metadata: Mutex<Option<Arc<FileMetadata>>>,
}

impl DtsReader {
    /// Opens a sealed file: validates the head magic and locates the file
    /// metadata from the 4-byte size before the tail magic.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        if file_size < HEADER_LEN {
            return Err(DenError::Corrupted {
                path: path.to_path_buf(),
                reason: "shorter than the file header".to_string(),
            });
        }
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }
        let mut version = [0u8; 4];
        reader.read_exact(&mut version)?;
        if version != VERSION {
            return Err(DenError::UnsupportedVersion(
                String::from_utf8_lossy(&version).into_owned(),
            ));
        }

        // tail: ... | metadata | size i32 | MAGIC
        reader.seek(SeekFrom::Start(file_size - MAGIC.len() as u64))?;
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }
        reader.seek(SeekFrom::Start(file_size - MAGIC.len() as u64 - 4))?;
        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf)?;
        let metadata_size = i32::from_le_bytes(size_buf);
        if metadata_size <= 0 {
            return Err(DenError::Corrupted {
                path: path.to_path_buf(),
                reason: format!("bad metadata size {metadata_size}"),
            });
        }
        let metadata_pos = file_size - MAGIC.len() as u64 - 4 - metadata_size as u64;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(reader),
            file_size,
            metadata_pos,
            metadata_size: metadata_size as u32,
            metadata: Mutex::new(None),
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the head magic bytes.
    pub fn head_magic(&self) -> Result<[u8; 4]> {
        let bytes = self.read_at(0, MAGIC.len())?;
        Ok(bytes.try_into().expect("four magic bytes"))
    }

    /// Reads the tail magic bytes.
    pub fn tail_magic(&self) -> Result<[u8; 4]> {
        let bytes = self.read_at(self.file_size - MAGIC.len() as u64, MAGIC.len())?;
        Ok(bytes.try_into().expect("four magic bytes"))
    }

    /// The ASCII version string after the head magic.
    pub fn version_string(&self) -> Result<String> {
        let bytes = self.read_at(MAGIC.len() as u64, VERSION.len())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Whether head and tail magic both match: the file is sealed.
    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.head_magic()? == MAGIC && self.tail_magic()? == MAGIC)
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut guard = self.file.lock();
        guard.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        guard
            .read_exact(&mut buf)
            .map_err(|_| DenError::ReachEndOfData)?;
        Ok(buf)
    }

    /// The file metadata, loaded once and cached.
    pub fn file_metadata(&self) -> Result<Arc<FileMetadata>> {
        let mut guard = self.metadata.lock();
        if let Some(metadata) = guard.as_ref() {
            return Ok(metadata.clone());
        }
        let bytes = self.read_at(self.metadata_pos, self.metadata_size as usize)?;
        let metadata = Arc::new(FileMetadata::read_from(&mut bytes.as_slice())?);
        *guard = Some(metadata.clone());
        Ok(metadata)
    }

    /// The tail bloom filter, if the file carries one.
    pub fn bloom_filter(&self) -> Result<Option<BloomFilter>> {
        Ok(self.file_metadata()?.bloom_filter.clone())
    }

    fn read_node(&self, offset: u64, end: u64) -> Result<MetadataIndexNode> {
        let bytes = self.read_at(offset, (end - offset) as usize)?;
        MetadataIndexNode::read_from(&mut bytes.as_slice())
    }

    /// Descends through index nodes while the covered child is of the
    /// sought internal kind; stops at the first diverging entry.
    fn descend(
        &self,
        node: &MetadataIndexNode,
        name: &str,
        internal: MetadataIndexNodeType,
    ) -> Result<Option<(MetadataIndexEntry, u64)>> {
        let Some((entry, end)) = node.child_covering(name) else {
            return Ok(None);
        };
        if entry.child_type == internal {
            let child = self.read_node(entry.offset, end)?;
            return self.descend(&child, name, internal);
        }
        Ok(Some((entry.clone(), end)))
    }

    /// Locates the device entry covering `device`, or `None` when the
    /// device is not in the file.
    fn device_entry(&self, device: &str) -> Result<Option<(MetadataIndexEntry, u64)>> {
        let metadata = self.file_metadata()?;
        let Some(pair) = self.descend(
            &metadata.metadata_index,
            device,
            MetadataIndexNodeType::InternalDevice,
        )?
        else {
            return Ok(None);
        };
        // one entry per device at the leaf level of the device tree, so a
        // floor hit with another name means the device is absent
        if pair.0.name != device {
            return Ok(None);
        }
        Ok(Some(pair))
    }

    fn run_at(&self, offset: u64) -> Result<Vec<TimeseriesMetadata>> {
        let mut guard = self.file.lock();
        guard.seek(SeekFrom::Start(offset))?;
        read_timeseries_run(&mut *guard)
    }

    /// Reads the per-series metadata of one `(device, measurement)`.
    ///
    /// Returns `None` when the path is not in the file.
    pub fn timeseries_metadata(
        &self,
        device: &str,
        measurement: &str,
    ) -> Result<Option<TimeseriesMetadata>> {
        let Some((mut entry, mut end)) = self.device_entry(device)? else {
            return Ok(None);
        };
        while entry.child_type != MetadataIndexNodeType::LeafMeasurement {
            let node = self.read_node(entry.offset, end)?;
            match self.descend(&node, measurement, MetadataIndexNodeType::InternalMeasurement)? {
                Some(pair) => (entry, end) = pair,
                None => return Ok(None),
            }
        }
        let run = self.run_at(entry.offset)?;
        Ok(search_run(&run, measurement))
    }

    /// Reads per-series metadata for many measurements of one device.
    ///
    /// When `|measurements| > D / ln D` every leaf under the device is
    /// traversed and filtered; below that bound each measurement descends
    /// individually.
    pub fn timeseries_metadata_bulk(
        &self,
        device: &str,
        measurements: &BTreeSet<String>,
        max_degree_of_index_node: usize,
    ) -> Result<Vec<TimeseriesMetadata>> {
        let Some((entry, end)) = self.device_entry(device)? else {
            return Ok(Vec::new());
        };
        let degree = max_degree_of_index_node.max(2) as f64;
        if measurements.len() as f64 > degree / degree.ln() {
            let mut all = Vec::new();
            self.collect_runs(&entry, end, &mut all)?;
            all.retain(|ts| measurements.contains(&ts.measurement));
            return Ok(all);
        }
        let mut result = Vec::new();
        for measurement in measurements {
            let mut entry = entry.clone();
            let mut end = end;
            let found = loop {
                if entry.child_type == MetadataIndexNodeType::LeafMeasurement {
                    break search_run(&self.run_at(entry.offset)?, measurement);
                }
                let node = self.read_node(entry.offset, end)?;
                match self.descend(
                    &node,
                    measurement,
                    MetadataIndexNodeType::InternalMeasurement,
                )? {
                    Some(pair) => (entry, end) = pair,
                    None => break None,
                }
            };
            if let Some(ts_metadata) = found {
                result.push(ts_metadata);
            }
        }
        Ok(result)
    }

    fn collect_runs(
        &self,
        entry: &MetadataIndexEntry,
        end: u64,
        out: &mut Vec<TimeseriesMetadata>,
    ) -> Result<()> {
        if entry.child_type == MetadataIndexNodeType::LeafMeasurement {
            out.extend(self.run_at(entry.offset)?);
            return Ok(());
        }
        let node = self.read_node(entry.offset, end)?;
        for i in 0..node.children.len() {
            let child_end = node
                .children
                .get(i + 1)
                .map(|next| next.offset)
                .unwrap_or(node.end_offset);
            self.collect_runs(&node.children[i], child_end, out)?;
        }
        Ok(())
    }

    /// Chunk metadata for one series, sorted by start time, versions
    /// applied. An absent path yields an empty list.
    pub fn chunk_metadata_list(&self, device: &str, measurement: &str) -> Result<Vec<ChunkMetadata>> {
        let Some(ts_metadata) = self.timeseries_metadata(device, measurement)? else {
            return Ok(Vec::new());
        };
        self.chunk_metadata_of(&ts_metadata)
    }

    /// Chunk metadata behind one timeseries-metadata record.
    pub fn chunk_metadata_of(&self, ts_metadata: &TimeseriesMetadata) -> Result<Vec<ChunkMetadata>> {
        let bytes = self.read_at(
            ts_metadata.chunk_metadata_list_offset,
            ts_metadata.chunk_metadata_list_size as usize,
        )?;
        let mut slice = bytes.as_slice();
        let mut chunks = Vec::new();
        while !slice.is_empty() {
            chunks.push(ChunkMetadata::read_from(&mut slice)?);
        }
        apply_versions(&mut chunks, &self.file_metadata()?.version_info);
        chunks.sort_by_key(|c| c.start_time());
        Ok(chunks)
    }

    /// All chunk metadata of one device: measurement -> sorted chunk list.
    pub fn chunk_metadata_in_device(
        &self,
        device: &str,
    ) -> Result<std::collections::BTreeMap<String, Vec<ChunkMetadata>>> {
        let mut result = std::collections::BTreeMap::new();
        let Some((entry, end)) = self.device_entry(device)? else {
            return Ok(result);
        };
        let mut runs = Vec::new();
        self.collect_runs(&entry, end, &mut runs)?;
        for ts_metadata in runs {
            result.insert(
                ts_metadata.measurement.clone(),
                self.chunk_metadata_of(&ts_metadata)?,
            );
        }
        Ok(result)
    }

    /// All devices in the file, sorted.
    pub fn all_devices(&self) -> Result<Vec<String>> {
        let metadata = self.file_metadata()?;
        let mut devices = Vec::new();
        self.collect_devices(&metadata.metadata_index, &mut devices)?;
        devices.sort();
        devices.dedup();
        Ok(devices)
    }

    fn collect_devices(&self, node: &MetadataIndexNode, out: &mut Vec<String>) -> Result<()> {
        for i in 0..node.children.len() {
            let child = &node.children[i];
            if child.child_type == MetadataIndexNodeType::InternalDevice {
                let end = node
                    .children
                    .get(i + 1)
                    .map(|next| next.offset)
                    .unwrap_or(node.end_offset);
                let inner = self.read_node(child.offset, end)?;
                self.collect_devices(&inner, out)?;
            } else {
                out.push(child.name.clone());
            }
        }
        Ok(())
    }

    /// All series paths in the file.
    pub fn all_paths(&self) -> Result<Vec<SeriesPath>> {
        let mut paths = Vec::new();
        for device in self.all_devices()? {
            for measurement in self.chunk_metadata_in_device(&device)?.keys() {
                paths.push(SeriesPath::new(device.clone(), measurement.clone()));
            }
        }
        Ok(paths)
    }

    /// Reads and decodes every sample of one chunk.
    pub fn read_chunk_samples(&self, chunk: &ChunkMetadata) -> Result<Vec<(Timestamp, TsValue)>> {
        let mut guard = self.file.lock();
        guard.seek(SeekFrom::Start(chunk.offset_of_chunk_header))?;
        let marker = read_u8(&mut *guard)?;
        if marker != MARKER_CHUNK_HEADER {
            return Err(DenError::Corrupted {
                path: self.path.clone(),
                reason: format!("expected chunk header marker, got {marker}"),
            });
        }
        let header = ChunkHeader::read_from(&mut *guard)?;
        let mut samples = Vec::new();
        for _ in 0..header.num_pages {
            let page_header = PageHeader::read_from(&mut *guard)?;
            let mut payload = vec![0u8; page_header.compressed_size as usize];
            guard.read_exact(&mut payload)?;
            samples.extend(decode_page(
                &page_header,
                &payload,
                header.data_type,
                header.encoding,
                header.compression,
            )?);
        }
        Ok(samples)
    }

    /// Self-check: finds the largest safe prefix of a possibly torn file.
    ///
    /// Corruption is caught and reported as [`CheckResult::Truncated`],
    /// never as an error. With `fast_finish` a file whose tail magic
    /// matches returns [`CheckResult::Complete`] without scanning.
    pub fn self_check(path: &Path, fast_finish: bool) -> Result<SelfCheckOutcome> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        if file_size < HEADER_LEN {
            return Ok(SelfCheckOutcome {
                result: CheckResult::Incompatible,
                truncated_pos: 0,
                chunk_groups: Vec::new(),
                versions: Vec::new(),
            });
        }
        let mut head = [0u8; 8];
        reader.read_exact(&mut head)?;
        if head[..4] != MAGIC || head[4..] != VERSION {
            return Ok(SelfCheckOutcome {
                result: CheckResult::Incompatible,
                truncated_pos: 0,
                chunk_groups: Vec::new(),
                versions: Vec::new(),
            });
        }
        if file_size == HEADER_LEN {
            return Ok(SelfCheckOutcome {
                result: CheckResult::OnlyHeader,
                truncated_pos: HEADER_LEN,
                chunk_groups: Vec::new(),
                versions: Vec::new(),
            });
        }

        let tail_complete = {
            let mut magic = [0u8; 4];
            reader.seek(SeekFrom::Start(file_size - MAGIC.len() as u64))?;
            reader.read_exact(&mut magic).is_ok() && magic == MAGIC
        };
        if tail_complete && fast_finish {
            return Ok(SelfCheckOutcome {
                result: CheckResult::Complete,
                truncated_pos: file_size,
                chunk_groups: Vec::new(),
                versions: Vec::new(),
            });
        }

        reader.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut pos = HEADER_LEN;
        let mut truncated = HEADER_LEN;
        let mut chunk_groups: Vec<ChunkGroupMetadata> = Vec::new();
        let mut versions: Vec<(u64, u64)> = Vec::new();
        let mut open_chunks: Vec<ChunkMetadata> = Vec::new();
        let mut reached_separator = false;

        loop {
            let marker = match read_u8(&mut reader) {
                Ok(m) => m,
                Err(_) => break,
            };
            pos += 1;
            match marker {
                MARKER_CHUNK_HEADER => {
                    let chunk_offset = pos - 1;
                    match scan_chunk(&mut reader, &mut pos) {
                        Ok(chunk_metadata) => {
                            open_chunks.push(ChunkMetadata {
                                offset_of_chunk_header: chunk_offset,
                                ..chunk_metadata
                            });
                        }
                        Err(_) => break,
                    }
                }
                MARKER_CHUNK_GROUP_FOOTER => match ChunkGroupFooter::read_from(&mut reader) {
                    Ok(footer) => {
                        pos += (footer.serialized_size() - 1) as u64;
                        chunk_groups.push(ChunkGroupMetadata {
                            device: footer.device,
                            chunks: std::mem::take(&mut open_chunks),
                        });
                        truncated = pos;
                    }
                    Err(_) => break,
                },
                MARKER_VERSION => match read_u64(&mut reader) {
                    Ok(version) => {
                        pos += 8;
                        versions.push((pos, version));
                        truncated = pos;
                    }
                    Err(_) => break,
                },
                MARKER_SEPARATOR => {
                    // end of the data section; metadata follows
                    truncated = pos - 1;
                    reached_separator = true;
                    break;
                }
                other => {
                    info!(
                        path = %path.display(),
                        pos,
                        marker = other,
                        "self-check stopped at unexpected marker"
                    );
                    break;
                }
            }
        }

        let result = if reached_separator && tail_complete {
            CheckResult::Complete
        } else {
            if !open_chunks.is_empty() {
                warn!(
                    path = %path.display(),
                    dropped = open_chunks.len(),
                    "dropping chunks of a half-finished chunk group"
                );
            }
            CheckResult::Truncated(truncated)
        };
        Ok(SelfCheckOutcome {
            result,
            truncated_pos: truncated,
            chunk_groups,
            versions,
        })
    }
}

/// Reads one chunk out of a possibly unsealed file.
///
/// Chunks are self-contained, so this needs no tail metadata; it is how
/// queries read the already-flushed chunks of an unsealed file.
pub fn read_chunk_from(path: &Path, chunk: &ChunkMetadata) -> Result<Vec<(Timestamp, TsValue)>> {
    let mut reader = BufReader::new(File::open(path)?);
    reader.seek(SeekFrom::Start(chunk.offset_of_chunk_header))?;
    let marker = read_u8(&mut reader)?;
    if marker != MARKER_CHUNK_HEADER {
        return Err(DenError::Corrupted {
            path: path.to_path_buf(),
            reason: format!("expected chunk header marker, got {marker}"),
        });
    }
    let header = ChunkHeader::read_from(&mut reader)?;
    let mut samples = Vec::new();
    for _ in 0..header.num_pages {
        let page_header = PageHeader::read_from(&mut reader)?;
        let mut payload = vec![0u8; page_header.compressed_size as usize];
        reader.read_exact(&mut payload)?;
        samples.extend(decode_page(
            &page_header,
            &payload,
            header.data_type,
            header.encoding,
            header.compression,
        )?);
    }
    Ok(samples)
}

fn search_run(run: &[TimeseriesMetadata], measurement: &str) -> Option<TimeseriesMetadata> {
    run.binary_search_by(|ts| ts.measurement.as_str().cmp(measurement))
        .ok()
        .map(|i| run[i].clone())
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader
        .read_exact(&mut buf)
        .map_err(|_| DenError::ReachEndOfData)?;
    Ok(buf[0])
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| DenError::ReachEndOfData)?;
    Ok(u64::from_le_bytes(buf))
}

/// Scans one chunk (header already marked), skipping page payloads and
/// merging page statistics into chunk metadata.
fn scan_chunk<R: Read + Seek>(reader: &mut R, pos: &mut u64) -> Result<ChunkMetadata> {
    let header = ChunkHeader::read_from(reader)?;
    *pos += (header.serialized_size() - 1) as u64;
    let mut statistics = Statistics::new();
    for _ in 0..header.num_pages {
        let page_header = PageHeader::read_from(reader)?;
        *pos += page_header.serialized_size() as u64;
        reader.seek(SeekFrom::Current(page_header.compressed_size as i64))?;
        *pos += page_header.compressed_size as u64;
        statistics.merge(&page_header.statistics);
    }
    Ok(ChunkMetadata {
        measurement: header.measurement,
        data_type: header.data_type,
        offset_of_chunk_header: 0,
        data_size: header.data_size,
        statistics,
        version: 0,
    })
}
