//! Storage-group engine: memtables, flush pipeline, file resources and the
//! storage-group processor orchestrating them.

pub mod flush;
pub mod memtable;
pub mod modification;
pub mod processor;
pub mod resource;
pub mod storage_group;
pub mod version;

pub use flush::FlushManager;
pub use memtable::{MemTable, ReadOnlyMemChunk};
pub use modification::{Deletion, ModificationFile};
pub use processor::TsFileProcessor;
pub use resource::TsFileResource;
pub use storage_group::StorageGroupProcessor;
pub use version::SimpleFileVersionController;

use crate::dts::{DataType, CompressionType, Encoding, Timestamp, TsValue};
use crate::error::{DenError, Result};

/// Schema of one measurement, handed in by the external schema manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementSchema {
    /// Measurement identifier.
    pub measurement: String,
    /// Column data type.
    pub data_type: DataType,
    /// Column encoding.
    pub encoding: Encoding,
    /// Page compression.
    pub compression: CompressionType,
}

impl MeasurementSchema {
    /// Creates a schema with the default encoding and compression.
    pub fn new(measurement: impl Into<String>, data_type: DataType) -> Self {
        Self {
            measurement: measurement.into(),
            data_type,
            encoding: Encoding::Plain,
            compression: CompressionType::Lz4,
        }
    }

    /// Overrides the encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Overrides the compression.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }
}

/// A single-row insert: one device, one timestamp, several measurements.
#[derive(Debug, Clone)]
pub struct InsertPlan {
    /// Target device.
    pub device: String,
    /// Row timestamp.
    pub timestamp: Timestamp,
    /// Measurement values with their schemas.
    pub values: Vec<(MeasurementSchema, TsValue)>,
}

impl InsertPlan {
    /// Creates an insert plan.
    pub fn new(
        device: impl Into<String>,
        timestamp: Timestamp,
        values: Vec<(MeasurementSchema, TsValue)>,
    ) -> Self {
        Self {
            device: device.into(),
            timestamp,
            values,
        }
    }

    /// Verifies every value against its schema.
    pub fn check_schema(&self) -> Result<()> {
        for (schema, value) in &self.values {
            if value.data_type() != schema.data_type {
                return Err(DenError::WriteProcess(format!(
                    "schema mismatch on {}: expected {:?}, got {:?}",
                    schema.measurement,
                    schema.data_type,
                    value.data_type()
                )));
            }
        }
        Ok(())
    }
}

/// A multi-row insert for one device.
///
/// `columns[c].1[r]` is the value of column `c` at row `r`; rows are
/// ordered by `timestamps`.
#[derive(Debug, Clone)]
pub struct TabletPlan {
    /// Target device.
    pub device: String,
    /// Row timestamps, ascending.
    pub timestamps: Vec<Timestamp>,
    /// Column schemas with per-row values.
    pub columns: Vec<(MeasurementSchema, Vec<TsValue>)>,
}

impl TabletPlan {
    /// Extracts row `r` as a single-row insert plan.
    pub fn row(&self, r: usize) -> InsertPlan {
        InsertPlan {
            device: self.device.clone(),
            timestamp: self.timestamps[r],
            values: self
                .columns
                .iter()
                .map(|(schema, values)| (schema.clone(), values[r].clone()))
                .collect(),
        }
    }
}
