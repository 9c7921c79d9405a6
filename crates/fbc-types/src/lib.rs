#![forbid(unsafe_code)]
//! Identifier and unit types shared across the FrankenCache workspace.
//!
//! Unit-carrying newtypes prevent mixing block ids with versions or
//! recencies at API boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top bit marks the auxiliary block-id range.
///
/// Auxiliary blocks carry no recency and may be created without a prior
/// existence check.
pub const AUX_BLOCK_BIT: u64 = 1 << 63;

/// Identifier of one fixed-size block at the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    /// First id of the auxiliary pool.
    pub const FIRST_AUX: Self = Self(AUX_BLOCK_BIT);

    /// Whether this id lies in the auxiliary range.
    #[must_use]
    pub fn is_aux(self) -> bool {
        self.0 & AUX_BLOCK_BIT != 0
    }

    /// Index within the pool this id belongs to (aux bit stripped).
    #[must_use]
    pub fn pool_index(self) -> u64 {
        self.0 & !AUX_BLOCK_BIT
    }

    /// Add a block count, returning `None` on overflow into the aux range.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        let next = self.0.checked_add(count)?;
        if self.is_aux() == (next & AUX_BLOCK_BIT != 0) {
            Some(Self(next))
        } else {
            None
        }
    }
}

/// Per-block write counter assigned to each write acquirer at enqueue time.
///
/// `ZERO` means unassigned; the first assigned value is strictly greater.
/// Used to pick the newest contributor when changes to one block are folded
/// into a single flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockVersion(u64);

impl BlockVersion {
    pub const ZERO: Self = Self(0);

    /// The next version after `self`.
    #[must_use]
    pub fn subsequent(self) -> Self {
        Self(self.0.checked_add(1).expect("block version overflow"))
    }

    /// Whether this version was ever assigned by a write enqueue.
    #[must_use]
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Logical per-block timestamp used by higher layers for conflict
/// resolution.
///
/// `INVALID` marks deleted blocks; `DISTANT_PAST` marks freshly created
/// ones that have never been stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Recency(pub u64);

impl Recency {
    pub const INVALID: Self = Self(u64::MAX);
    pub const DISTANT_PAST: Self = Self(0);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// The later of two recencies.
///
/// `INVALID` never wins over a valid stamp: a touched-only merge must not
/// resurrect a deletion marker as "newest".
#[must_use]
pub fn superceding_recency(a: Recency, b: Recency) -> Recency {
    match (a.is_valid(), b.is_valid()) {
        (true, true) => Recency(a.0.max(b.0)),
        (true, false) => a,
        (false, true) => b,
        (false, false) => Recency::INVALID,
    }
}

/// Validated block size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of one page transaction inside a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Stable identity of one in-memory page body, for evicter bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

/// Identifier of one cache connection (a serial writer lane).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnId(pub u64);

/// Commit durability requested for a write transaction.
///
/// Soft commits return once the transaction has joined the flush queue;
/// hard commits block until the batched serializer write and index write
/// have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    Soft,
    Hard,
}

impl Durability {
    #[must_use]
    pub fn is_hard(self) -> bool {
        matches!(self, Self::Hard)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_aux() {
            write!(f, "aux:{}", self.pool_index())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for BlockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Recency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
