//! DTS file format: an append-only columnar file for device time series.
//!
//! A DTS file holds chunk groups (all chunks of one device, contiguously),
//! interleaved with version records, followed by a metadata index tree and
//! the file metadata with a bloom filter over `device.measurement` paths.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Head: "ADTS" (4 bytes) + "v001" (4 bytes)                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  (chunk group | version record)*                             │
//! │  - chunk: marker 1, header, pages                            │
//! │  - chunk group footer: marker 2, device, byte len, count     │
//! │  - version record: marker 3, u64                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Separator: marker 4 (end of data section)                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Chunk-metadata lists, timeseries metadata, index nodes      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  File metadata (index root, version info, bloom filter)      │
//! │  fileMetadataSize: i32                                       │
//! │  Tail: "ADTS" (4 bytes)                                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All fixed-width integers are little-endian; strings are a `u32` length
//! followed by UTF-8 bytes.

pub mod bloom;
pub mod chunk;
pub mod encoding;
pub mod metadata;
pub mod reader;
pub(crate) mod rw;
pub mod statistics;
pub mod writer;

pub use bloom::BloomFilter;
pub use chunk::{ChunkGroupFooter, ChunkHeader, PageHeader};
pub use metadata::{
    ChunkGroupMetadata, ChunkMetadata, FileMetadata, MetadataIndexEntry, MetadataIndexNode,
    MetadataIndexNodeType, TimeseriesMetadata,
};
pub use reader::{CheckResult, DtsReader};
pub use statistics::Statistics;
pub use writer::DtsWriter;

use crate::error::Result;
use std::io::{Read, Write};

/// Magic bytes opening and closing a DTS file: "ADTS".
pub const MAGIC: [u8; 4] = *b"ADTS";

/// Format version string, written right after the head magic.
pub const VERSION: [u8; 4] = *b"v001";

/// Bytes of head magic plus version string.
pub const HEADER_LEN: u64 = (MAGIC.len() + VERSION.len()) as u64;

/// Marker byte opening a chunk header.
pub const MARKER_CHUNK_HEADER: u8 = 1;

/// Marker byte opening a chunk group footer.
pub const MARKER_CHUNK_GROUP_FOOTER: u8 = 2;

/// Marker byte opening a version record.
pub const MARKER_VERSION: u8 = 3;

/// Marker byte separating the data section from the metadata section.
pub const MARKER_SEPARATOR: u8 = 4;

/// Data file extension.
pub const DTS_SUFFIX: &str = "dts";

/// Timestamp in milliseconds since the epoch.
pub type Timestamp = i64;

/// Data type of a measurement column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// 32-bit signed integer.
    Int32 = 0,
    /// 64-bit signed integer.
    Int64 = 1,
    /// 32-bit float.
    Float = 2,
    /// 64-bit float.
    Double = 3,
    /// Boolean.
    Boolean = 4,
    /// UTF-8 text.
    Text = 5,
}

impl DataType {
    /// Creates a DataType from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Int32),
            1 => Some(Self::Int64),
            2 => Some(Self::Float),
            3 => Some(Self::Double),
            4 => Some(Self::Boolean),
            5 => Some(Self::Text),
            _ => None,
        }
    }

    /// Whether min/max value statistics apply to this type.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::Float | Self::Double)
    }
}

/// A single typed sample value.
#[derive(Debug, Clone, PartialEq)]
pub enum TsValue {
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 text.
    Text(String),
}

impl TsValue {
    /// Returns the data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::Boolean(_) => DataType::Boolean,
            Self::Text(_) => DataType::Text,
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Boolean(_) | Self::Text(_) => None,
        }
    }

    /// Rough heap size of the value, used for memtable accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Text(s) => std::mem::size_of::<Self>() + s.len(),
            _ => std::mem::size_of::<Self>(),
        }
    }

    /// Writes the plain-encoded form of the value.
    pub fn write_plain<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::Int32(v) => writer.write_all(&v.to_le_bytes())?,
            Self::Int64(v) => writer.write_all(&v.to_le_bytes())?,
            Self::Float(v) => writer.write_all(&v.to_le_bytes())?,
            Self::Double(v) => writer.write_all(&v.to_le_bytes())?,
            Self::Boolean(v) => writer.write_all(&[*v as u8])?,
            Self::Text(v) => rw::write_string(writer, v)?,
        }
        Ok(())
    }

    /// Reads a plain-encoded value of the given type.
    pub fn read_plain<R: Read>(reader: &mut R, data_type: DataType) -> Result<Self> {
        Ok(match data_type {
            DataType::Int32 => Self::Int32(rw::read_i32(reader)?),
            DataType::Int64 => Self::Int64(rw::read_i64(reader)?),
            DataType::Float => Self::Float(f32::from_bits(rw::read_u32(reader)?)),
            DataType::Double => Self::Double(f64::from_bits(rw::read_u64(reader)?)),
            DataType::Boolean => Self::Boolean(rw::read_u8(reader)? != 0),
            DataType::Text => Self::Text(rw::read_string(reader)?),
        })
    }
}

/// Column encoding of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Encoding {
    /// Fixed-width values, timestamps as raw i64.
    #[default]
    Plain = 0,
    /// Delta-of-delta timestamps and XOR-compressed values.
    ///
    /// Only valid for `Double` columns.
    Gorilla = 1,
}

impl Encoding {
    /// Creates an Encoding from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Plain),
            1 => Some(Self::Gorilla),
            _ => None,
        }
    }
}

/// Page compression of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    Uncompressed = 0,
    /// LZ4 with a length prefix.
    #[default]
    Lz4 = 1,
}

impl CompressionType {
    /// Creates a CompressionType from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Uncompressed),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// A `device.measurement` series path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesPath {
    /// Device identifier, e.g. `root.vehicle.d0`.
    pub device: String,
    /// Measurement identifier within the device, e.g. `s0`.
    pub measurement: String,
}

impl SeriesPath {
    /// Creates a series path.
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
        }
    }

    /// The `device.measurement` string hashed into the bloom filter.
    pub fn full_path(&self) -> String {
        format!("{}.{}", self.device, self.measurement)
    }
}

impl std::fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}

/// A closed time range `[start, end]`, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub start: Timestamp,
    /// Inclusive upper bound.
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a time range.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Whether the range contains the timestamp.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Whether two ranges share at least one timestamp.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_plain_roundtrip() {
        let values = vec![
            TsValue::Int32(-7),
            TsValue::Int64(1 << 40),
            TsValue::Float(1.5),
            TsValue::Double(-2.25),
            TsValue::Boolean(true),
            TsValue::Text("temperature".to_string()),
        ];
        for value in values {
            let mut buf = Vec::new();
            value.write_plain(&mut buf).unwrap();
            let decoded =
                TsValue::read_plain(&mut buf.as_slice(), value.data_type()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_time_range_overlaps() {
        let a = TimeRange::new(10, 20);
        assert!(a.overlaps(&TimeRange::new(20, 30)));
        assert!(a.overlaps(&TimeRange::new(0, 10)));
        assert!(!a.overlaps(&TimeRange::new(21, 30)));
        assert!(a.contains(10) && a.contains(20) && !a.contains(21));
    }
}
