//! Crate-wide error type.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the storage-engine core.
///
/// I/O and corruption failures on the data path are not recoverable at this
/// layer; callers are expected to unwind the surrounding operation. `Retry`
/// and slow-path outcomes of the fast-path search are flow control, not
/// errors, and never appear here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk or in-page data failed a structural check.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A caller-supplied argument violates the API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Duplicate keys detected while building a unique index.
    #[error("could not create unique index {index:?}: duplicate keys exist")]
    UniqueViolation {
        /// Name of the index whose uniqueness constraint failed.
        index: String,
    },
    /// A versioned-file transform callback reported failure.
    #[error("failed to transform buffer data from version {from} to {to}")]
    VersionTransform {
        /// Version the data was read at.
        from: u32,
        /// Version the data should have been upgraded to.
        to: u32,
    },
}
