//! Chunk, page and chunk-group serialization.
//!
//! A chunk is a marker-prefixed header followed by one or more pages. Each
//! page carries its own statistics and a compressed payload holding the
//! encoded time column and value column. A chunk group is all chunks of one
//! device, closed by a marker-prefixed footer.

use crate::dts::statistics::Statistics;
use crate::dts::{
    encoding, rw, CompressionType, DataType, Encoding, Timestamp, TsValue,
    MARKER_CHUNK_GROUP_FOOTER, MARKER_CHUNK_HEADER,
};
use crate::error::{DenError, Result};
use std::io::{Read, Write};

/// Target number of samples per page.
pub const MAX_PAGE_POINT_COUNT: usize = 1024;

/// Header of one chunk.
///
/// Serialized as: marker (1) | measurement | data_size u32 | data_type u8 |
/// compression u8 | encoding u8 | num_pages u32.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    /// Measurement this chunk belongs to.
    pub measurement: String,
    /// Total byte length of the chunk's pages.
    pub data_size: u32,
    /// Column data type.
    pub data_type: DataType,
    /// Page compression.
    pub compression: CompressionType,
    /// Column encoding.
    pub encoding: Encoding,
    /// Number of pages.
    pub num_pages: u32,
}

impl ChunkHeader {
    /// Writes the header, including the leading marker byte.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[MARKER_CHUNK_HEADER])?;
        rw::write_string(writer, &self.measurement)?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        writer.write_all(&[self.data_type as u8])?;
        writer.write_all(&[self.compression as u8])?;
        writer.write_all(&[self.encoding as u8])?;
        writer.write_all(&self.num_pages.to_le_bytes())?;
        Ok(())
    }

    /// Reads a header. The marker byte must already be consumed.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let measurement = rw::read_string(reader)?;
        let data_size = rw::read_u32(reader)?;
        let data_type = rw::read_u8(reader)?;
        let data_type = DataType::from_u8(data_type)
            .ok_or_else(|| DenError::Encoding(format!("unknown data type {data_type}")))?;
        let compression = rw::read_u8(reader)?;
        let compression = CompressionType::from_u8(compression)
            .ok_or_else(|| DenError::Encoding(format!("unknown compression {compression}")))?;
        let encoding = rw::read_u8(reader)?;
        let encoding = Encoding::from_u8(encoding)
            .ok_or_else(|| DenError::Encoding(format!("unknown encoding {encoding}")))?;
        let num_pages = rw::read_u32(reader)?;
        Ok(Self {
            measurement,
            data_size,
            data_type,
            compression,
            encoding,
            num_pages,
        })
    }

    /// Serialized size, marker included.
    pub fn serialized_size(&self) -> usize {
        1 + rw::string_size(&self.measurement) + 4 + 1 + 1 + 1 + 4
    }
}

/// Header of one page inside a chunk.
///
/// Serialized as: uncompressed_size u32 | compressed_size u32 | statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PageHeader {
    /// Payload size before compression.
    pub uncompressed_size: u32,
    /// Payload size as stored.
    pub compressed_size: u32,
    /// Statistics over the page's samples.
    pub statistics: Statistics,
}

impl PageHeader {
    /// Writes the page header.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        self.statistics.write_to(writer)?;
        Ok(())
    }

    /// Reads a page header.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let uncompressed_size = rw::read_u32(reader)?;
        let compressed_size = rw::read_u32(reader)?;
        let statistics = Statistics::read_from(reader)?;
        Ok(Self {
            uncompressed_size,
            compressed_size,
            statistics,
        })
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        4 + 4 + self.statistics.serialized_size()
    }
}

/// Footer closing a chunk group.
///
/// Serialized as: marker (2) | device | data_size u64 | num_chunks u32.
/// `data_size` is the byte length of the group's chunks, so a reader can
/// step back to the group's first chunk from the footer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkGroupFooter {
    /// Device the group belongs to.
    pub device: String,
    /// Byte length of all chunks in the group.
    pub data_size: u64,
    /// Number of chunks in the group.
    pub num_chunks: u32,
}

impl ChunkGroupFooter {
    /// Writes the footer, including the leading marker byte.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[MARKER_CHUNK_GROUP_FOOTER])?;
        rw::write_string(writer, &self.device)?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        writer.write_all(&self.num_chunks.to_le_bytes())?;
        Ok(())
    }

    /// Reads a footer. The marker byte must already be consumed.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let device = rw::read_string(reader)?;
        let data_size = rw::read_u64(reader)?;
        let num_chunks = rw::read_u32(reader)?;
        Ok(Self {
            device,
            data_size,
            num_chunks,
        })
    }

    /// Serialized size, marker included.
    pub fn serialized_size(&self) -> usize {
        1 + rw::string_size(&self.device) + 8 + 4
    }
}

/// A page assembled from a sorted sample run: header plus stored payload.
#[derive(Debug, Clone)]
pub struct Page {
    /// The page header.
    pub header: PageHeader,
    /// Compressed payload as stored on disk.
    pub payload: Vec<u8>,
}

/// Builds the pages of one chunk from a sorted sample run.
///
/// The run is cut into pages of at most [`MAX_PAGE_POINT_COUNT`] samples;
/// each page payload is `time_len u32 | time column | value column`,
/// compressed as a whole.
pub fn build_pages(
    samples: &[(Timestamp, TsValue)],
    encoding: Encoding,
    compression: CompressionType,
) -> Result<Vec<Page>> {
    let mut pages = Vec::new();
    for run in samples.chunks(MAX_PAGE_POINT_COUNT) {
        let times: Vec<Timestamp> = run.iter().map(|(ts, _)| *ts).collect();
        let values: Vec<TsValue> = run.iter().map(|(_, v)| v.clone()).collect();

        let time_bytes = encoding::encode_times(&times, encoding)?;
        let value_bytes = encoding::encode_values(&values, encoding)?;

        let mut raw = Vec::with_capacity(4 + time_bytes.len() + value_bytes.len());
        raw.extend_from_slice(&(time_bytes.len() as u32).to_le_bytes());
        raw.extend_from_slice(&time_bytes);
        raw.extend_from_slice(&value_bytes);

        let payload = match compression {
            CompressionType::Uncompressed => raw.clone(),
            CompressionType::Lz4 => lz4_flex::compress_prepend_size(&raw),
        };

        let mut statistics = Statistics::new();
        for (ts, value) in run {
            statistics.update(*ts, value);
        }

        pages.push(Page {
            header: PageHeader {
                uncompressed_size: raw.len() as u32,
                compressed_size: payload.len() as u32,
                statistics,
            },
            payload,
        });
    }
    Ok(pages)
}

/// Decodes one page payload back into samples.
pub fn decode_page(
    header: &PageHeader,
    payload: &[u8],
    data_type: DataType,
    encoding: Encoding,
    compression: CompressionType,
) -> Result<Vec<(Timestamp, TsValue)>> {
    let raw = match compression {
        CompressionType::Uncompressed => payload.to_vec(),
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| DenError::Decompression(e.to_string()))?,
    };
    if raw.len() != header.uncompressed_size as usize {
        return Err(DenError::Decompression(format!(
            "page inflated to {} bytes, header says {}",
            raw.len(),
            header.uncompressed_size
        )));
    }

    let mut cursor = raw.as_slice();
    let time_len = rw::read_u32(&mut cursor)? as usize;
    if time_len > cursor.len() {
        return Err(DenError::ReachEndOfData);
    }
    let (time_bytes, value_bytes) = cursor.split_at(time_len);

    let count = header.statistics.count as usize;
    let times = encoding::decode_times(time_bytes, count, encoding)?;
    let values = encoding::decode_values(value_bytes, count, data_type, encoding)?;
    Ok(times.into_iter().zip(values).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<(Timestamp, TsValue)> {
        (0..n).map(|i| (i as i64, TsValue::Int64(i as i64 * 3))).collect()
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        let header = ChunkHeader {
            measurement: "s0".to_string(),
            data_size: 77,
            data_type: DataType::Int64,
            compression: CompressionType::Lz4,
            encoding: Encoding::Plain,
            num_pages: 2,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), header.serialized_size());
        assert_eq!(buf[0], MARKER_CHUNK_HEADER);

        let decoded = ChunkHeader::read_from(&mut &buf[1..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_page_roundtrip_lz4() {
        let data = samples(3000);
        let pages = build_pages(&data, Encoding::Plain, CompressionType::Lz4).unwrap();
        assert_eq!(pages.len(), 3);

        let mut decoded = Vec::new();
        for page in &pages {
            decoded.extend(
                decode_page(
                    &page.header,
                    &page.payload,
                    DataType::Int64,
                    Encoding::Plain,
                    CompressionType::Lz4,
                )
                .unwrap(),
            );
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_page_statistics_cover_samples() {
        let data = samples(10);
        let pages = build_pages(&data, Encoding::Plain, CompressionType::Uncompressed).unwrap();
        let stats = &pages[0].header.statistics;
        assert_eq!(stats.count, 10);
        assert_eq!(stats.start_time, 0);
        assert_eq!(stats.end_time, 9);
    }

    #[test]
    fn test_chunk_group_footer_roundtrip() {
        let footer = ChunkGroupFooter {
            device: "root.vehicle.d0".to_string(),
            data_size: 12345,
            num_chunks: 4,
        };
        let mut buf = Vec::new();
        footer.write_to(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_CHUNK_GROUP_FOOTER);
        let decoded = ChunkGroupFooter::read_from(&mut &buf[1..]).unwrap();
        assert_eq!(decoded, footer);
    }
}
