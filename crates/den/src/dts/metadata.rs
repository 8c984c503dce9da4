//! File metadata: chunk metadata, per-series metadata, the metadata index
//! tree and the file-level trailer.
//!
//! The index is a B-tree-like structure over device and measurement names.
//! Entries carry a child-node type telling the reader what the bytes at the
//! entry's offset contain:
//!
//! - `InternalDevice`: another device-level index node
//! - `LeafDevice`: the measurement-index root node of one device
//! - `InternalMeasurement`: a measurement-level index node
//! - `LeafMeasurement`: a raw run of [`TimeseriesMetadata`] records
//!
//! The bytes covered by child `i` of a node span from that child's offset
//! to the next sibling's offset, or to the node's end offset for the last
//! child.

use crate::dts::statistics::Statistics;
use crate::dts::{bloom::BloomFilter, rw, DataType};
use crate::error::{DenError, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Metadata of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    /// Measurement the chunk belongs to.
    pub measurement: String,
    /// Column data type.
    pub data_type: DataType,
    /// File offset of the chunk header's marker byte.
    pub offset_of_chunk_header: u64,
    /// Byte length of the chunk's pages.
    pub data_size: u32,
    /// Statistics over the chunk's samples.
    pub statistics: Statistics,
    /// Flush/merge version of the chunk, applied from the file's version
    /// records after deserialization. Not serialized.
    pub version: u64,
}

impl ChunkMetadata {
    /// Writes the chunk metadata.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        rw::write_string(writer, &self.measurement)?;
        writer.write_all(&[self.data_type as u8])?;
        writer.write_all(&self.offset_of_chunk_header.to_le_bytes())?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        self.statistics.write_to(writer)?;
        Ok(())
    }

    /// Reads chunk metadata.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let measurement = rw::read_string(reader)?;
        let data_type = rw::read_u8(reader)?;
        let data_type = DataType::from_u8(data_type)
            .ok_or_else(|| DenError::Encoding(format!("unknown data type {data_type}")))?;
        let offset_of_chunk_header = rw::read_u64(reader)?;
        let data_size = rw::read_u32(reader)?;
        let statistics = Statistics::read_from(reader)?;
        Ok(Self {
            measurement,
            data_type,
            offset_of_chunk_header,
            data_size,
            statistics,
            version: 0,
        })
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        rw::string_size(&self.measurement) + 1 + 8 + 4 + self.statistics.serialized_size()
    }

    /// Rough in-memory size, used by the metadata cache for its byte budget.
    pub fn approx_heap_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.measurement.len()
    }

    /// Start time of the chunk.
    pub fn start_time(&self) -> i64 {
        self.statistics.start_time
    }

    /// End time of the chunk.
    pub fn end_time(&self) -> i64 {
        self.statistics.end_time
    }
}

/// Chunk metadata of one device's chunk group, collected by the writer and
/// the self-check scan.
#[derive(Debug, Clone)]
pub struct ChunkGroupMetadata {
    /// Device of the group.
    pub device: String,
    /// Chunk metadata in file order.
    pub chunks: Vec<ChunkMetadata>,
}

/// Applies version records to chunk metadata.
///
/// A chunk takes the version of the first version record positioned after
/// the chunk's header offset. `versions` must be sorted by position, which
/// file order guarantees.
pub fn apply_versions(chunks: &mut [ChunkMetadata], versions: &[(u64, u64)]) {
    for chunk in chunks.iter_mut() {
        chunk.version = versions
            .iter()
            .find(|(pos, _)| *pos > chunk.offset_of_chunk_header)
            .map(|(_, v)| *v)
            .unwrap_or(0);
    }
}

/// Per-series metadata record: points at the series' chunk-metadata list.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesMetadata {
    /// Measurement identifier.
    pub measurement: String,
    /// Column data type.
    pub data_type: DataType,
    /// File offset of the series' chunk-metadata list.
    pub chunk_metadata_list_offset: u64,
    /// Byte length of the chunk-metadata list.
    pub chunk_metadata_list_size: u32,
    /// Statistics over all chunks of the series.
    pub statistics: Statistics,
}

impl TimeseriesMetadata {
    /// Writes the record.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        rw::write_string(writer, &self.measurement)?;
        writer.write_all(&[self.data_type as u8])?;
        writer.write_all(&self.chunk_metadata_list_offset.to_le_bytes())?;
        writer.write_all(&self.chunk_metadata_list_size.to_le_bytes())?;
        self.statistics.write_to(writer)?;
        Ok(())
    }

    /// Reads a record.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let measurement = rw::read_string(reader)?;
        let data_type = rw::read_u8(reader)?;
        let data_type = DataType::from_u8(data_type)
            .ok_or_else(|| DenError::Encoding(format!("unknown data type {data_type}")))?;
        let chunk_metadata_list_offset = rw::read_u64(reader)?;
        let chunk_metadata_list_size = rw::read_u32(reader)?;
        let statistics = Statistics::read_from(reader)?;
        Ok(Self {
            measurement,
            data_type,
            chunk_metadata_list_offset,
            chunk_metadata_list_size,
            statistics,
        })
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        rw::string_size(&self.measurement) + 1 + 8 + 4 + self.statistics.serialized_size()
    }
}

/// Parses a count-prefixed run of timeseries metadata records.
pub fn read_timeseries_run<R: Read>(reader: &mut R) -> Result<Vec<TimeseriesMetadata>> {
    let count = rw::read_u32(reader)? as usize;
    (0..count)
        .map(|_| TimeseriesMetadata::read_from(reader))
        .collect()
}

/// What the bytes behind a [`MetadataIndexEntry`] contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataIndexNodeType {
    /// A device-level index node.
    InternalDevice = 0,
    /// The measurement-index root node of one device.
    LeafDevice = 1,
    /// A measurement-level index node.
    InternalMeasurement = 2,
    /// A raw run of timeseries metadata records.
    LeafMeasurement = 3,
}

impl MetadataIndexNodeType {
    /// Creates a node type from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::InternalDevice),
            1 => Some(Self::LeafDevice),
            2 => Some(Self::InternalMeasurement),
            3 => Some(Self::LeafMeasurement),
            _ => None,
        }
    }
}

/// One child entry of a metadata index node.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataIndexEntry {
    /// First device or measurement name covered by the child.
    pub name: String,
    /// File offset of the child's bytes.
    pub offset: u64,
    /// What the child's bytes contain.
    pub child_type: MetadataIndexNodeType,
}

impl MetadataIndexEntry {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        rw::write_string(writer, &self.name)?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&[self.child_type as u8])?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let name = rw::read_string(reader)?;
        let offset = rw::read_u64(reader)?;
        let raw = rw::read_u8(reader)?;
        let child_type = MetadataIndexNodeType::from_u8(raw)
            .ok_or_else(|| DenError::Encoding(format!("unknown index entry type {raw}")))?;
        Ok(Self {
            name,
            offset,
            child_type,
        })
    }

    fn serialized_size(&self) -> usize {
        rw::string_size(&self.name) + 8 + 1
    }
}

/// A metadata index node: sorted child entries plus the end offset of the
/// region its children cover.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataIndexNode {
    /// Child entries, sorted by name.
    pub children: Vec<MetadataIndexEntry>,
    /// End offset of the last child's region.
    pub end_offset: u64,
}

impl MetadataIndexNode {
    /// Writes the node.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.children.len() as u32).to_le_bytes())?;
        for child in &self.children {
            child.write_to(writer)?;
        }
        writer.write_all(&self.end_offset.to_le_bytes())?;
        Ok(())
    }

    /// Reads a node.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let count = rw::read_u32(reader)? as usize;
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            children.push(MetadataIndexEntry::read_from(reader)?);
        }
        let end_offset = rw::read_u64(reader)?;
        Ok(Self {
            children,
            end_offset,
        })
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        4 + self.children.iter().map(|c| c.serialized_size()).sum::<usize>() + 8
    }

    /// Returns the child covering `name` and the end offset of its region:
    /// the greatest child whose name is `<=` the target, or the first child
    /// when every name is greater.
    pub fn child_covering(&self, name: &str) -> Option<(&MetadataIndexEntry, u64)> {
        if self.children.is_empty() {
            return None;
        }
        let idx = match self
            .children
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let end = self
            .children
            .get(idx + 1)
            .map(|next| next.offset)
            .unwrap_or(self.end_offset);
        Some((&self.children[idx], end))
    }
}

/// The file-level trailer: index root, version records, bloom filter.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// Root node of the metadata index.
    pub metadata_index: MetadataIndexNode,
    /// (position, version) pairs collected from version records.
    pub version_info: Vec<(u64, u64)>,
    /// Bloom filter over `device.measurement` paths.
    pub bloom_filter: Option<BloomFilter>,
}

impl FileMetadata {
    /// Writes the file metadata.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.metadata_index.write_to(writer)?;
        writer.write_all(&(self.version_info.len() as u32).to_le_bytes())?;
        for (pos, version) in &self.version_info {
            writer.write_all(&pos.to_le_bytes())?;
            writer.write_all(&version.to_le_bytes())?;
        }
        match &self.bloom_filter {
            Some(filter) => {
                writer.write_all(&[1u8])?;
                filter.write_to(writer)?;
            }
            None => writer.write_all(&[0u8])?,
        }
        Ok(())
    }

    /// Reads file metadata.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let metadata_index = MetadataIndexNode::read_from(reader)?;
        let count = rw::read_u32(reader)? as usize;
        let mut version_info = Vec::with_capacity(count);
        for _ in 0..count {
            version_info.push((rw::read_u64(reader)?, rw::read_u64(reader)?));
        }
        let bloom_filter = if rw::read_u8(reader)? == 1 {
            Some(BloomFilter::read_from(reader)?)
        } else {
            None
        };
        Ok(Self {
            metadata_index,
            version_info,
            bloom_filter,
        })
    }
}

/// Serializes the metadata region (chunk-metadata lists, timeseries
/// metadata runs, index nodes) into `buffer` and returns the index root.
///
/// `region_start` is the file offset where `buffer` will land; all entry
/// offsets are absolute. The root node itself is not appended to the
/// buffer; it is serialized inside the file metadata.
pub fn build_metadata_index(
    series: &BTreeMap<String, Vec<(TimeseriesMetadata, Vec<ChunkMetadata>)>>,
    buffer: &mut Vec<u8>,
    region_start: u64,
    max_degree: usize,
) -> Result<MetadataIndexNode> {
    let max_degree = max_degree.max(2);
    let mut device_entries: Vec<MetadataIndexEntry> = Vec::new();

    for (device, series_list) in series {
        // chunk-metadata lists first, so the timeseries records can point
        // at them
        let mut records: Vec<TimeseriesMetadata> = Vec::with_capacity(series_list.len());
        for (ts_meta, chunks) in series_list {
            let list_offset = region_start + buffer.len() as u64;
            for chunk in chunks {
                chunk.write_to(buffer)?;
            }
            let list_size = region_start + buffer.len() as u64 - list_offset;
            let mut record = ts_meta.clone();
            record.chunk_metadata_list_offset = list_offset;
            record.chunk_metadata_list_size = list_size as u32;
            records.push(record);
        }

        // timeseries metadata runs of at most max_degree records each;
        // a run is count-prefixed so sibling end offsets need not be tight
        let mut run_entries: Vec<MetadataIndexEntry> = Vec::new();
        let mut run_ends: Vec<u64> = Vec::new();
        for run in records.chunks(max_degree) {
            let run_offset = region_start + buffer.len() as u64;
            buffer.extend_from_slice(&(run.len() as u32).to_le_bytes());
            for record in run {
                record.write_to(buffer)?;
            }
            run_entries.push(MetadataIndexEntry {
                name: run[0].measurement.clone(),
                offset: run_offset,
                child_type: MetadataIndexNodeType::LeafMeasurement,
            });
            run_ends.push(region_start + buffer.len() as u64);
        }

        if run_entries.len() == 1 {
            device_entries.push(MetadataIndexEntry {
                name: device.clone(),
                offset: run_entries[0].offset,
                child_type: MetadataIndexNodeType::LeafMeasurement,
            });
            continue;
        }

        // measurement node levels above the runs
        let mut level = run_entries;
        let mut level_ends = run_ends;
        loop {
            let mut parents: Vec<MetadataIndexEntry> = Vec::new();
            let mut parent_ends: Vec<u64> = Vec::new();
            let groups: Vec<(usize, usize)> = group_bounds(level.len(), max_degree);
            for (lo, hi) in groups {
                let node = MetadataIndexNode {
                    children: level[lo..hi].to_vec(),
                    end_offset: level_ends[hi - 1],
                };
                let node_offset = region_start + buffer.len() as u64;
                node.write_to(buffer)?;
                parents.push(MetadataIndexEntry {
                    name: node.children[0].name.clone(),
                    offset: node_offset,
                    child_type: MetadataIndexNodeType::InternalMeasurement,
                });
                parent_ends.push(region_start + buffer.len() as u64);
            }
            if parents.len() == 1 {
                let mut entry = parents.pop().expect("single measurement root");
                entry.name = device.clone();
                entry.child_type = MetadataIndexNodeType::LeafDevice;
                device_entries.push(entry);
                break;
            }
            level = parents;
            level_ends = parent_ends;
        }
    }

    // device level
    if device_entries.len() <= max_degree {
        return Ok(MetadataIndexNode {
            children: device_entries,
            end_offset: region_start + buffer.len() as u64,
        });
    }

    // region ends of device subtrees: each spans to the next entry's
    // offset; the last one ends where the device nodes start
    let device_nodes_start = region_start + buffer.len() as u64;
    let mut level = device_entries;
    let mut level_ends: Vec<u64> = (0..level.len())
        .map(|i| {
            level
                .get(i + 1)
                .map(|next| next.offset)
                .unwrap_or(device_nodes_start)
        })
        .collect();

    loop {
        let mut parents: Vec<MetadataIndexEntry> = Vec::new();
        let mut parent_ends: Vec<u64> = Vec::new();
        for (lo, hi) in group_bounds(level.len(), max_degree) {
            let node = MetadataIndexNode {
                children: level[lo..hi].to_vec(),
                end_offset: level_ends[hi - 1],
            };
            let node_offset = region_start + buffer.len() as u64;
            node.write_to(buffer)?;
            parents.push(MetadataIndexEntry {
                name: node.children[0].name.clone(),
                offset: node_offset,
                child_type: MetadataIndexNodeType::InternalDevice,
            });
            parent_ends.push(region_start + buffer.len() as u64);
        }
        if parents.len() <= max_degree {
            return Ok(MetadataIndexNode {
                children: parents,
                end_offset: region_start + buffer.len() as u64,
            });
        }
        level = parents;
        level_ends = parent_ends;
    }
}

fn group_bounds(len: usize, max_degree: usize) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut lo = 0;
    while lo < len {
        let hi = (lo + max_degree).min(len);
        bounds.push((lo, hi));
        lo = hi;
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dts::TsValue;

    fn chunk(measurement: &str, offset: u64) -> ChunkMetadata {
        let mut statistics = Statistics::new();
        statistics.update(1, &TsValue::Int32(1));
        ChunkMetadata {
            measurement: measurement.to_string(),
            data_type: DataType::Int32,
            offset_of_chunk_header: offset,
            data_size: 10,
            statistics,
            version: 0,
        }
    }

    #[test]
    fn test_chunk_metadata_roundtrip() {
        let meta = chunk("s3", 42);
        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), meta.serialized_size());
        let decoded = ChunkMetadata::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_apply_versions() {
        let mut chunks = vec![chunk("s0", 10), chunk("s0", 100), chunk("s0", 300)];
        apply_versions(&mut chunks, &[(50, 7), (200, 9)]);
        assert_eq!(chunks[0].version, 7);
        assert_eq!(chunks[1].version, 9);
        assert_eq!(chunks[2].version, 0);
    }

    #[test]
    fn test_child_covering_floor_semantics() {
        let node = MetadataIndexNode {
            children: vec![
                MetadataIndexEntry {
                    name: "b".to_string(),
                    offset: 10,
                    child_type: MetadataIndexNodeType::LeafMeasurement,
                },
                MetadataIndexEntry {
                    name: "m".to_string(),
                    offset: 20,
                    child_type: MetadataIndexNodeType::LeafMeasurement,
                },
            ],
            end_offset: 30,
        };
        let (entry, end) = node.child_covering("c").unwrap();
        assert_eq!(entry.name, "b");
        assert_eq!(end, 20);
        let (entry, end) = node.child_covering("z").unwrap();
        assert_eq!(entry.name, "m");
        assert_eq!(end, 30);
        // below the first key falls back to the first child
        let (entry, _) = node.child_covering("a").unwrap();
        assert_eq!(entry.name, "b");
    }
}
