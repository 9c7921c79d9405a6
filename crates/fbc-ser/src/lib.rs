#![forbid(unsafe_code)]
//! Block serializer boundary for the FrankenCache buffer cache.
//!
//! Provides the [`BlockSerializer`] trait the cache consumes, the shared
//! buffer and token types that cross it, and two implementations:
//! [`MemSerializer`] (in-memory, used by the test suites) and
//! [`file::FileSerializer`] (append-only block store over a pair of files).
//!
//! The serializer owns durability. The cache treats a [`BlockToken`] as an
//! opaque receipt for one persisted copy of a block; the token stays valid
//! until an index write stops referencing it.

pub mod file;

use asupersync::Cx;
use fbc_error::{FbcError, Result};
use fbc_types::{BlockId, BlockSize, Recency};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[inline]
pub fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| FbcError::Cancelled)
}

/// Shared block body.
///
/// Cloning is cheap (`Arc` bump); mutation goes through [`make_mut`], which
/// copies iff the bytes are shared. Snapshots of a block body are plain
/// clones of the `BlockBuf` that holds it.
///
/// [`make_mut`]: BlockBuf::make_mut
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A second handle to the same bytes.
    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
        }
    }

    /// Mutable view of the bytes, copying first if they are shared.
    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.bytes).as_mut_slice()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        match Arc::try_unwrap(self.bytes) {
            Ok(bytes) => bytes,
            Err(shared) => shared.as_ref().clone(),
        }
    }
}

/// Opaque handle to one persisted copy of a block.
///
/// Constructed only by serializer implementations; the cache stores and
/// compares tokens but never inspects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockToken {
    slot: u64,
    len: u32,
}

impl BlockToken {
    /// For serializer implementations: a token naming persisted copy
    /// `slot` of `len` bytes.
    #[must_use]
    pub fn new(slot: u64, len: u32) -> Self {
        Self { slot, len }
    }

    #[must_use]
    pub fn slot(self) -> u64 {
        self.slot
    }

    #[must_use]
    pub fn len(self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// One block body submitted to a batched write.
#[derive(Debug, Clone)]
pub struct BufWriteInfo {
    pub block_id: BlockId,
    pub buf: BlockBuf,
}

/// One entry of an ordered index write.
///
/// `token == None` with an invalid recency is a deletion; `token == None`
/// with a valid recency is a recency-only update.
#[derive(Debug, Clone)]
pub struct IndexWriteOp {
    pub block_id: BlockId,
    pub token: Option<BlockToken>,
    pub recency: Recency,
}

impl IndexWriteOp {
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.token.is_none() && !self.recency.is_valid()
    }
}

/// I/O priority handle for a lane of cache reads or writes.
///
/// Serializer implementations may use the priority to order queued I/O;
/// the reference implementations record it only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccount {
    pub io_priority: i32,
    pub outstanding_limit: i32,
}

impl IoAccount {
    #[must_use]
    pub fn new(io_priority: i32, outstanding_limit: i32) -> Self {
        Self {
            io_priority,
            outstanding_limit,
        }
    }
}

/// Durable block store consumed by the cache.
///
/// All calls are blocking and cancellable through `&Cx`. `block_writes`
/// persists bodies and returns their tokens; a subsequent `index_write`
/// publishes which token (and recency) each block id maps to. Index writes
/// from the cache arrive totally ordered (the cache serializes them through
/// its FIFO sink).
pub trait BlockSerializer: Send + Sync {
    /// Largest block body this serializer accepts.
    fn max_block_size(&self) -> BlockSize;

    /// Recency of every live non-auxiliary block, read at cache startup.
    fn all_recencies(&self, cx: &Cx) -> Result<HashMap<BlockId, Recency>>;

    /// Create an I/O priority account.
    fn make_io_account(&self, io_priority: i32, outstanding_limit: i32) -> IoAccount;

    /// Persist a batch of block bodies, returning one token per info, in
    /// order. Tokens are not published until a later `index_write`.
    fn block_writes(
        &self,
        cx: &Cx,
        infos: &[BufWriteInfo],
        account: &IoAccount,
    ) -> Result<Vec<BlockToken>>;

    /// Read one persisted block body by token.
    fn read_block(&self, cx: &Cx, token: BlockToken, account: &IoAccount) -> Result<BlockBuf>;

    /// The published token for a block id, if the block is live.
    ///
    /// Served from the serializer's in-memory block index; implementations
    /// must not touch disk here.
    fn index_token(&self, cx: &Cx, block_id: BlockId) -> Result<Option<BlockToken>>;

    /// Apply one ordered batch of index updates.
    fn index_write(&self, cx: &Cx, ops: &[IndexWriteOp]) -> Result<()>;

    /// Offer every live block body to `offer` (startup read-ahead).
    ///
    /// The receiver decides acceptance; implementations just stream what
    /// they have.
    fn read_ahead(
        &self,
        cx: &Cx,
        offer: &mut dyn FnMut(BlockId, BlockBuf, BlockToken),
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemSerializer
// ---------------------------------------------------------------------------

/// Counters exposed by [`MemSerializer`] for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemSerializerMetrics {
    /// Block bodies persisted via `block_writes`.
    pub blocks_written: u64,
    /// `block_writes` batches submitted (including empty ones).
    pub write_batches: u64,
    /// `index_write` batches applied.
    pub index_writes: u64,
    /// Bodies read back via `read_block`.
    pub blocks_read: u64,
}

#[derive(Debug)]
struct MemIndexEntry {
    token: Option<BlockToken>,
    recency: Recency,
}

#[derive(Debug, Default)]
struct MemState {
    slots: HashMap<u64, BlockBuf>,
    next_slot: u64,
    index: HashMap<BlockId, MemIndexEntry>,
    metrics: MemSerializerMetrics,
}

/// In-memory [`BlockSerializer`].
///
/// Persisted copies live in a slot map; the block index maps ids to
/// (token, recency). Used throughout the cache test suites.
#[derive(Debug)]
pub struct MemSerializer {
    block_size: BlockSize,
    state: Mutex<MemState>,
}

impl MemSerializer {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            state: Mutex::new(MemState::default()),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> MemSerializerMetrics {
        self.state.lock().metrics
    }

    /// The published token for `block_id`, if any.
    #[must_use]
    pub fn published_token(&self, block_id: BlockId) -> Option<BlockToken> {
        self.state.lock().index.get(&block_id).and_then(|e| e.token)
    }

    /// The published recency for `block_id`, if the block is live.
    #[must_use]
    pub fn index_recency(&self, block_id: BlockId) -> Option<Recency> {
        self.state.lock().index.get(&block_id).map(|e| e.recency)
    }

    /// The persisted body currently published for `block_id`.
    #[must_use]
    pub fn published_body(&self, block_id: BlockId) -> Option<BlockBuf> {
        let state = self.state.lock();
        let token = state.index.get(&block_id)?.token?;
        state.slots.get(&token.slot()).map(BlockBuf::clone_ref)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.block_size.as_usize() {
            return Err(FbcError::Format(format!(
                "block body of {len} bytes exceeds max block size {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

impl BlockSerializer for MemSerializer {
    fn max_block_size(&self) -> BlockSize {
        self.block_size
    }

    fn all_recencies(&self, cx: &Cx) -> Result<HashMap<BlockId, Recency>> {
        cx_checkpoint(cx)?;
        let state = self.state.lock();
        Ok(state
            .index
            .iter()
            .filter(|(id, _)| !id.is_aux())
            .map(|(id, entry)| (*id, entry.recency))
            .collect())
    }

    fn make_io_account(&self, io_priority: i32, outstanding_limit: i32) -> IoAccount {
        IoAccount::new(io_priority, outstanding_limit)
    }

    fn block_writes(
        &self,
        cx: &Cx,
        infos: &[BufWriteInfo],
        _account: &IoAccount,
    ) -> Result<Vec<BlockToken>> {
        cx_checkpoint(cx)?;
        let mut state = self.state.lock();
        state.metrics.write_batches += 1;
        let mut tokens = Vec::with_capacity(infos.len());
        for info in infos {
            self.check_len(info.buf.len())?;
            let slot = state.next_slot;
            state.next_slot += 1;
            state.slots.insert(slot, info.buf.clone_ref());
            state.metrics.blocks_written += 1;
            let token = BlockToken::new(
                slot,
                u32::try_from(info.buf.len())
                    .map_err(|_| FbcError::Format("block body length overflows u32".to_owned()))?,
            );
            trace!(
                target: "fbc::ser::mem",
                event = "block_write",
                block_id = %info.block_id,
                slot,
                len = info.buf.len()
            );
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn read_block(&self, cx: &Cx, token: BlockToken, _account: &IoAccount) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        let mut state = self.state.lock();
        state.metrics.blocks_read += 1;
        state
            .slots
            .get(&token.slot())
            .map(BlockBuf::clone_ref)
            .ok_or_else(|| FbcError::Format(format!("unknown block token slot {}", token.slot())))
    }

    fn index_token(&self, cx: &Cx, block_id: BlockId) -> Result<Option<BlockToken>> {
        cx_checkpoint(cx)?;
        Ok(self.published_token(block_id))
    }

    fn index_write(&self, cx: &Cx, ops: &[IndexWriteOp]) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut state = self.state.lock();
        state.metrics.index_writes += 1;
        for op in ops {
            if op.is_deletion() {
                state.index.remove(&op.block_id);
            } else {
                match state.index.get_mut(&op.block_id) {
                    Some(entry) => {
                        if op.token.is_some() {
                            entry.token = op.token;
                        }
                        entry.recency = op.recency;
                    }
                    None => {
                        state.index.insert(
                            op.block_id,
                            MemIndexEntry {
                                token: op.token,
                                recency: op.recency,
                            },
                        );
                    }
                }
            }
        }
        debug!(
            target: "fbc::ser::mem",
            event = "index_write",
            ops = ops.len()
        );
        Ok(())
    }

    fn read_ahead(
        &self,
        cx: &Cx,
        offer: &mut dyn FnMut(BlockId, BlockBuf, BlockToken),
    ) -> Result<()> {
        cx_checkpoint(cx)?;
        let offers: Vec<(BlockId, BlockBuf, BlockToken)> = {
            let state = self.state.lock();
            state
                .index
                .iter()
                .filter_map(|(id, entry)| {
                    let token = entry.token?;
                    let buf = state.slots.get(&token.slot())?.clone_ref();
                    Some((*id, buf, token))
                })
                .collect()
        };
        for (id, buf, token) in offers {
            offer(id, buf, token);
        }
        Ok(())
    }
}
