//! Error and Result types for Den storage-group operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for Den operations.
pub type Result<T> = std::result::Result<T, DenError>;

/// The error type for storage-group engine operations.
#[derive(Debug, Error)]
pub enum DenError {
    /// Invalid magic bytes in a DTS file head or tail.
    #[error("Invalid magic bytes: expected ADTS, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported DTS file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    /// A file is structurally damaged beyond the recoverable tail.
    #[error("Corrupted file {path}: {reason}")]
    Corrupted {
        /// Path of the damaged file.
        path: PathBuf,
        /// What the reader stumbled over.
        reason: String,
    },

    /// A read could not be fully satisfied.
    #[error("Reach the end of the data")]
    ReachEndOfData,

    /// A write was rejected before touching engine state.
    #[error("Write rejected: {0}")]
    WriteProcess(String),

    /// Data of one file spans more than one time partition.
    #[error("Partition violation in {path}")]
    PartitionViolation {
        /// Path of the offending file.
        path: PathBuf,
    },

    /// Merge planning or execution failed.
    #[error("Merge error: {0}")]
    Merge(String),

    /// Startup recovery failed.
    #[error("Recovery error: {0}")]
    Recover(String),

    /// The version controller state is unreadable.
    #[error("Version controller error: {0}")]
    VersionController(String),

    /// Error during encoding or decoding of a column.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Error during page decompression.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}
