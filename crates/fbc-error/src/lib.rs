#![forbid(unsafe_code)]
//! Error types for FrankenCache.
//!
//! Defines `FbcError` and a `Result<T>` alias used throughout the
//! workspace. Transient capacity pressure is never an error (writers are
//! throttled instead); data-integrity violations are not represented here
//! either; those abort the process.

use thiserror::Error;

/// Unified error type for all FrankenCache operations.
#[derive(Debug, Error)]
pub enum FbcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid serializer data: {0}")]
    Format(String),

    #[error("corrupt block {block}: {detail}")]
    Corruption { block: u64, detail: String },
}

/// Result alias using `FbcError`.
pub type Result<T> = std::result::Result<T, FbcError>;
