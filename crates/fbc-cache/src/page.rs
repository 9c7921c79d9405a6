//! In-memory representation of one block.
//!
//! A page is reachable from its block's coordination slot, from read
//! snapshots, and from in-flight flush change sets, all through
//! [`PageRef`] handles. The holder count (`Arc::strong_count`) is what the
//! evicter and the copy-on-write path consult. Invariant: a page always
//! has a body or a block token (or both).

use asupersync::Cx;
use fbc_error::{FbcError, Result};
use fbc_ser::{BlockBuf, BlockSerializer, BlockToken, IoAccount};
use fbc_types::{BlockId, PageId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared handle to a page. The slot, snapshots, and flushes each hold
/// one; the strong count is the page's holder count.
pub type PageRef = Arc<Mutex<Page>>;

#[derive(Debug)]
pub struct Page {
    page_id: PageId,
    block_id: BlockId,
    buf: Option<BlockBuf>,
    token: Option<BlockToken>,
}

impl Page {
    /// Fresh block: zeroed body, nothing persisted yet.
    #[must_use]
    pub fn new_fresh(page_id: PageId, block_id: BlockId, block_size: usize) -> Self {
        Self {
            page_id,
            block_id,
            buf: Some(BlockBuf::zeroed(block_size)),
            token: None,
        }
    }

    /// Body already in memory with a persisted copy (read-ahead).
    #[must_use]
    pub fn new_loaded(page_id: PageId, block_id: BlockId, buf: BlockBuf, token: BlockToken) -> Self {
        Self {
            page_id,
            block_id,
            buf: Some(buf),
            token: Some(token),
        }
    }

    /// Persisted but not resident; the body loads on first access.
    #[must_use]
    pub fn new_disk_backed(page_id: PageId, block_id: BlockId, token: BlockToken) -> Self {
        Self {
            page_id,
            block_id,
            buf: None,
            token: Some(token),
        }
    }

    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.buf.is_some()
    }

    #[must_use]
    pub fn is_disk_backed(&self) -> bool {
        self.token.is_some()
    }

    #[must_use]
    pub fn block_token(&self) -> Option<BlockToken> {
        self.token
    }

    /// Resident body size in bytes (0 when evicted).
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.buf.as_ref().map_or(0, BlockBuf::len)
    }

    /// Shared handle to the resident body, without touching the
    /// serializer.
    #[must_use]
    pub fn buf_for_loaded(&self) -> Option<BlockBuf> {
        self.buf.as_ref().map(BlockBuf::clone_ref)
    }

    /// Shared handle to the body, loading it from the serializer if it was
    /// evicted.
    pub fn buf_for_read(
        &mut self,
        cx: &Cx,
        serializer: &dyn BlockSerializer,
        account: &IoAccount,
    ) -> Result<BlockBuf> {
        if let Some(buf) = &self.buf {
            return Ok(buf.clone_ref());
        }
        let token = self.token.ok_or_else(|| FbcError::Corruption {
            block: self.block_id.0,
            detail: "page has neither body nor block token".to_owned(),
        })?;
        let buf = serializer.read_block(cx, token, account)?;
        self.buf = Some(buf.clone_ref());
        Ok(buf)
    }

    /// Mutate the body in place.
    ///
    /// The caller (the block's coordination slot) is responsible for
    /// copy-on-write when snapshots share this page; here the token is
    /// dropped because the body no longer matches any persisted copy.
    pub fn buf_for_write<R>(
        &mut self,
        cx: &Cx,
        serializer: &dyn BlockSerializer,
        account: &IoAccount,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.buf_for_read(cx, serializer, account)?;
        self.token = None;
        let buf = self.buf.as_mut().expect("just loaded");
        Ok(f(buf.make_mut()))
    }

    /// A detached copy of this page with the same body and no token, under
    /// a fresh page id.
    ///
    /// Used by the copy-on-write path: the writer keeps the copy, the
    /// snapshotters keep `self`.
    #[must_use]
    pub fn fork(&self, page_id: PageId) -> Self {
        Self {
            page_id,
            block_id: self.block_id,
            buf: self.buf.as_ref().map(BlockBuf::clone_ref),
            token: self.token,
        }
    }

    /// Record the token of the persisted copy just written. Exactly-once:
    /// a page that already has a token is never rewritten.
    pub fn init_block_token(&mut self, token: BlockToken) {
        assert!(
            self.token.is_none(),
            "block {} already has a token",
            self.block_id
        );
        self.token = Some(token);
    }

    /// Drop the resident body. Requires a persisted copy to reload from.
    pub fn evict_buf(&mut self) {
        assert!(self.token.is_some(), "evicting a page with no token");
        self.buf = None;
    }
}
