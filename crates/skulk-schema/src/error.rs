//! Error and Result types for Skulk schema operations.

use crate::tsm::StringIterator;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Skulk schema operations.
pub type Result<T> = std::result::Result<T, TsmError>;

/// The error type for TSM file access and schema scans.
#[derive(Debug, Error)]
pub enum TsmError {
    /// Invalid magic bytes in TSM file header or footer.
    #[error("Invalid magic bytes: expected ATSM, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported TSM file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Keys were written to a TSM file out of ascending order.
    #[error("Key out of order: {key:?} written after {previous:?}")]
    KeyOutOfOrder {
        /// Key written last.
        previous: Vec<u8>,
        /// Offending key.
        key: Vec<u8>,
    },

    /// Key exceeds the maximum length storable in the index.
    #[error("Key too long: {0} bytes")]
    KeyTooLong(usize),

    /// The key index of a TSM file could not be decoded.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The scan was canceled before the segment phase completed.
    ///
    /// `partial` holds the names found so far and the statistics for the work
    /// already done. The names are incomplete and must not be treated as the
    /// final answer.
    #[error("Scan canceled after scanning {} values", .partial.stats().scanned_values)]
    Canceled {
        /// Incomplete result with authoritative statistics.
        partial: StringIterator,
    },

    /// The write cache reported an error while being enumerated.
    #[error("Cache error: {0}")]
    Cache(String),
}

impl TsmError {
    /// Returns true if this error is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TsmError::Canceled { .. })
    }

    /// Returns the partial result carried by a cancellation.
    pub fn partial(&self) -> Option<&StringIterator> {
        match self {
            TsmError::Canceled { partial } => Some(partial),
            _ => None,
        }
    }

    /// Consumes the error, returning the partial result of a cancellation.
    pub fn into_partial(self) -> Option<StringIterator> {
        match self {
            TsmError::Canceled { partial } => Some(partial),
            _ => None,
        }
    }
}
