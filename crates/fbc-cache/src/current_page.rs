//! Per-block admission: the coordination slot and its acquirers.
//!
//! Each live block id owns one [`CurrentPage`] slot: a FIFO of acquirers,
//! back-pointers to the transaction that last write-acquired and last
//! dirtied the block, and the block's monotone write version. The
//! [`CurrentPageAcq`] handle is what callers hold while operating on a
//! block inside a transaction.
//!
//! Admission walks the FIFO: a node becomes read-available once its
//! predecessor is a pulsed reader (or absent); a write node additionally
//! becomes write-available at the head. Snapshotted readers are spliced
//! out at pulse time, capturing the body and recency they observed.

use crate::cache::{CacheCore, PageCache};
use crate::page::PageRef;
use crate::sync::Signal;
use crate::txn::Txn;
use asupersync::Cx;
use fbc_error::Result;
use fbc_ser::{BlockBuf, IoAccount};
use fbc_types::{BlockId, BlockVersion, Recency, TxnId};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Whether the acquirer creates the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCreate {
    Yes,
    No,
}

/// Block class for newly allocated blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Normal,
    Aux,
}

/// Crate-internal acquirer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AcqId(pub(crate) u64);

/// Body and recency frozen at a point in the acquirer queue.
#[derive(Debug)]
pub(crate) struct SnapshottedPage {
    pub(crate) recency: Recency,
    /// `None` means the block was already deleted when snapshotted.
    pub(crate) page: Option<PageRef>,
}

/// Arena record of one acquirer.
#[derive(Debug)]
pub(crate) struct AcqState {
    /// Set for write acquirers only; read acquirers are cache-scoped.
    pub(crate) txn: Option<TxnId>,
    pub(crate) block_id: BlockId,
    pub(crate) access: Access,
    pub(crate) block_version: BlockVersion,
    pub(crate) declared_snapshotted: bool,
    pub(crate) dirtied: bool,
    pub(crate) touched: bool,
    pub(crate) read_signal: Arc<Signal>,
    pub(crate) write_signal: Arc<Signal>,
    pub(crate) snapshotted_page: Option<SnapshottedPage>,
}

/// The per-block coordination slot.
#[derive(Debug)]
pub(crate) struct CurrentPage {
    pub(crate) block_id: BlockId,
    pub(crate) page: Option<PageRef>,
    pub(crate) is_deleted: bool,
    pub(crate) acquirers: VecDeque<AcqId>,
    pub(crate) last_write_acquirer: Option<TxnId>,
    pub(crate) last_write_acquirer_version: BlockVersion,
    pub(crate) last_dirtier: Option<TxnId>,
    pub(crate) last_dirtier_recency: Recency,
    pub(crate) last_dirtier_version: BlockVersion,
    pub(crate) num_keepalives: u64,
}

impl CurrentPage {
    pub(crate) fn new(block_id: BlockId, page: Option<PageRef>) -> Self {
        Self {
            block_id,
            page,
            is_deleted: false,
            acquirers: VecDeque::new(),
            last_write_acquirer: None,
            // Start above zero so an unassigned acquirer version (zero) is
            // distinguishable from any assigned one.
            last_write_acquirer_version: BlockVersion::ZERO.subsequent(),
            last_dirtier: None,
            last_dirtier_recency: Recency::INVALID,
            last_dirtier_version: BlockVersion::ZERO,
            num_keepalives: 0,
        }
    }

    /// Whether the slot itself may be torn down.
    ///
    /// Requires: no acquirers, no keepalives, no last write acquirer or
    /// dirtier (the flush graph still needs their versions), and a page
    /// body that is already evicted with the slot as its only holder.
    pub(crate) fn should_be_evicted(&self) -> bool {
        if !self.acquirers.is_empty()
            || self.last_write_acquirer.is_some()
            || self.last_dirtier.is_some()
            || self.num_keepalives > 0
        {
            return false;
        }
        if let Some(page) = &self.page {
            if Arc::strong_count(page) != 1 {
                return false;
            }
            let guard = page.lock();
            if guard.is_loaded() {
                return false;
            }
            debug_assert!(guard.is_disk_backed());
        }
        true
    }

    /// Whether the slot's state pins its page body in memory.
    pub(crate) fn blocks_page_eviction(&self) -> bool {
        !self.acquirers.is_empty()
            || self.last_write_acquirer.is_some()
            || self.last_dirtier.is_some()
            || self.num_keepalives > 0
    }
}

impl CacheCore {
    /// Look up the slot for an existing block, creating an empty one if the
    /// block is live on disk but not resident.
    pub(crate) fn page_for_block_id(&mut self, block_id: BlockId) -> &mut CurrentPage {
        if self.current_pages.contains_key(&block_id) {
            let slot = self.current_pages.get_mut(&block_id).expect("just checked");
            assert!(!slot.is_deleted, "block {block_id} acquired after deletion");
            return slot;
        }
        assert!(
            block_id.is_aux() || self.recency_for_block_id(block_id).is_valid(),
            "block {block_id} expected to exist (did you mean to create it?)"
        );
        self.current_pages
            .entry(block_id)
            .or_insert_with(|| CurrentPage::new(block_id, None))
    }

    /// Install the slot for a block that is being created.
    pub(crate) fn page_for_new_chosen_block_id(&mut self, block_id: BlockId) -> &mut CurrentPage {
        assert!(
            block_id.is_aux() || !self.recency_for_block_id(block_id).is_valid(),
            "chosen block {block_id} expected to be deleted"
        );
        if !block_id.is_aux() {
            self.set_recency_for_block_id(block_id, Recency::DISTANT_PAST);
        }

        let page_id = self.alloc_page_id();
        let page: PageRef = Arc::new(parking_lot::Mutex::new(crate::page::Page::new_fresh(
            page_id,
            block_id,
            self.max_block_size.as_usize(),
        )));
        self.evicter.admit(&page);

        let previous = self
            .current_pages
            .insert(block_id, CurrentPage::new(block_id, Some(page)));
        assert!(
            previous.is_none(),
            "created block {block_id} already has a live slot"
        );
        self.current_pages.get_mut(&block_id).expect("just inserted")
    }

    /// The slot's page, materialized from the serializer's block index if
    /// the slot is empty; `None` if the block is deleted.
    ///
    /// Materialization touches only the serializer's in-memory index;
    /// the body itself loads lazily on first access.
    pub(crate) fn the_page_for_read_or_deleted(
        &mut self,
        block_id: BlockId,
        serializer: &dyn fbc_ser::BlockSerializer,
    ) -> Option<PageRef> {
        let slot = self.current_pages.get(&block_id).expect("slot live");
        if slot.is_deleted {
            return None;
        }
        if slot.page.is_none() {
            let cx = Cx::for_request();
            let token = serializer
                .index_token(&cx, block_id)
                .unwrap_or_else(|err| panic!("block index lookup failed: {err}"))
                .unwrap_or_else(|| panic!("block {block_id} missing from the block index"));
            let page_id = self.alloc_page_id();
            let page: PageRef = Arc::new(parking_lot::Mutex::new(
                crate::page::Page::new_disk_backed(page_id, block_id, token),
            ));
            self.evicter.admit(&page);
            self.current_pages
                .get_mut(&block_id)
                .expect("slot live")
                .page = Some(page);
        }
        self.current_pages[&block_id].page.clone()
    }

    /// Enqueue an acquirer on a block's slot.
    ///
    /// Write acquirers advance the slot's version, take over the
    /// last-write-acquirer role (connecting a preceder edge to the
    /// previous holder's transaction), and count against their
    /// transaction's live acquirers.
    pub(crate) fn add_acquirer(
        &mut self,
        txn_id: Option<TxnId>,
        block_id: BlockId,
        access: Access,
        serializer: &dyn fbc_ser::BlockSerializer,
    ) -> AcqId {
        let acq_id = self.alloc_acq_id();
        let prev_version = self.current_pages[&block_id].last_write_acquirer_version;

        let block_version = match access {
            Access::Write => {
                let version = prev_version.subsequent();
                let txn_id = txn_id.expect("write acquirer needs a transaction");

                let slot = self.current_pages.get_mut(&block_id).expect("slot live");
                slot.last_write_acquirer_version = version;
                let prev_holder = slot.last_write_acquirer;

                if prev_holder != Some(txn_id) {
                    debug_assert!(
                        !self.txns[&txn_id]
                            .pages_write_acquired_last
                            .contains(&block_id)
                    );
                    if let Some(prev_txn) = prev_holder {
                        let pages = &mut self
                            .txns
                            .get_mut(&prev_txn)
                            .expect("previous write acquirer live")
                            .pages_write_acquired_last;
                        let position = pages
                            .iter()
                            .position(|&b| b == block_id)
                            .expect("previous holder tracks this block");
                        pages.swap_remove(position);

                        self.connect_preceder(txn_id, prev_txn);
                    }
                    self.txns
                        .get_mut(&txn_id)
                        .expect("txn live")
                        .pages_write_acquired_last
                        .push(block_id);
                    self.current_pages
                        .get_mut(&block_id)
                        .expect("slot live")
                        .last_write_acquirer = Some(txn_id);
                }
                self.txns.get_mut(&txn_id).expect("txn live").live_acqs += 1;
                version
            }
            Access::Read => prev_version,
        };

        self.acqs.insert(
            acq_id,
            AcqState {
                txn: match access {
                    Access::Write => txn_id,
                    Access::Read => None,
                },
                block_id,
                access,
                block_version,
                declared_snapshotted: false,
                dirtied: false,
                touched: false,
                read_signal: Arc::new(Signal::new()),
                write_signal: Arc::new(Signal::new()),
                snapshotted_page: None,
            },
        );
        self.current_pages
            .get_mut(&block_id)
            .expect("slot live")
            .acquirers
            .push_back(acq_id);
        trace!(
            target: "fbc::current_page",
            event = "acquirer_enqueued",
            block_id = %block_id,
            access = ?access,
            block_version = %block_version
        );
        self.pulse_pulsables(block_id, acq_id, serializer);
        acq_id
    }

    /// Walk the acquirer queue from `start`, pulsing whatever has become
    /// available.
    ///
    /// Two short-circuits keep repeated pulses cheap: nothing happens when
    /// the predecessor gate is still closed, and a pulsed non-snapshotted
    /// reader whose successor is already pulsed has no work left to do.
    pub(crate) fn pulse_pulsables(
        &mut self,
        block_id: BlockId,
        start: AcqId,
        serializer: &dyn fbc_ser::BlockSerializer,
    ) {
        let queue: Vec<AcqId> = self.current_pages[&block_id].acquirers.iter().copied().collect();
        let Some(start_index) = queue.iter().position(|&a| a == start) else {
            return;
        };

        if start_index > 0 {
            let prev = &self.acqs[&queue[start_index - 1]];
            if !(prev.access == Access::Read && prev.read_signal.is_pulsed()) {
                return;
            }
        }

        {
            let start_state = &self.acqs[&start];
            if start_state.access == Access::Read
                && start_state.read_signal.is_pulsed()
                && !start_state.declared_snapshotted
            {
                // This node was already pulsed readable, but it may have
                // been a write acquirer back then, so the successor might
                // still be waiting. Stop early only if it isn't.
                let next_pulsed = queue
                    .get(start_index + 1)
                    .copied()
                    .is_none_or(|next| self.acqs[&next].read_signal.is_pulsed());
                if next_pulsed {
                    return;
                }
            }
        }

        let current_recency = self.recency_for_block_id(block_id);

        let mut index = start_index;
        loop {
            let queue_now: Vec<AcqId> = self.current_pages[&block_id]
                .acquirers
                .iter()
                .copied()
                .collect();
            let Some(&acq_id) = queue_now.get(index) else {
                break;
            };

            self.acqs[&acq_id].read_signal.pulse();

            if self.acqs[&acq_id].access == Access::Read {
                if self.acqs[&acq_id].declared_snapshotted {
                    // Snapshotters leave the queue to make way for
                    // write acquirers, freezing what they observed. A
                    // deleted block freezes as `None`; that is how a
                    // writer that downgraded after deleting learns.
                    let page = self.the_page_for_read_or_deleted(block_id, serializer);
                    let state = self.acqs.get_mut(&acq_id).expect("acq live");
                    state.snapshotted_page = Some(SnapshottedPage {
                        recency: current_recency,
                        page,
                    });
                    let slot = self.current_pages.get_mut(&block_id).expect("slot live");
                    let position = slot
                        .acquirers
                        .iter()
                        .position(|&a| a == acq_id)
                        .expect("acquirer queued");
                    slot.acquirers.remove(position);
                    // The queue shifted left; `index` now names the next
                    // acquirer.
                } else {
                    index += 1;
                }
            } else {
                // The first write acquirer reads too; later acquirers wait
                // until it releases, because it may modify the body.
                if index == 0 {
                    let slot = &self.current_pages[&block_id];
                    assert!(!slot.is_deleted, "write admitted on a deleted block");
                    self.acqs[&acq_id].write_signal.pulse();
                }
                break;
            }
        }
    }

    /// First dirty write by `acq`: move dirtier responsibility to its
    /// transaction.
    ///
    /// If the previous dirtier is already bound to flush imminently, it
    /// captures a frozen copy of its version so the two transactions can
    /// flush independently; otherwise the two are coupled into the same
    /// flush set.
    pub(crate) fn dirty_the_page(
        &mut self,
        acq_id: AcqId,
        serializer: &dyn fbc_ser::BlockSerializer,
    ) {
        let (block_id, txn_id, acq_version) = {
            let state = self.acqs.get_mut(&acq_id).expect("acq live");
            state.dirtied = true;
            (
                state.block_id,
                state.txn.expect("dirtying acquirer is a write acquirer"),
                state.block_version,
            )
        };

        let prec = self.current_pages[&block_id].last_dirtier;
        if prec != Some(txn_id) {
            if let Some(prec) = prec {
                let pages = &mut self
                    .txns
                    .get_mut(&prec)
                    .expect("last dirtier live")
                    .pages_dirtied_last;
                let position = pages
                    .iter()
                    .position(|&b| b == block_id)
                    .expect("dirtier tracks this block");
                pages.swap_remove(position);

                if self.txns[&prec].throttler_acq.pre_spawn_flush() {
                    let slot = &self.current_pages[&block_id];
                    let version = slot.last_dirtier_version;
                    let recency = slot.last_dirtier_recency;
                    let page = self.the_page_for_read_or_deleted(block_id, serializer);
                    self.txns
                        .get_mut(&prec)
                        .expect("last dirtier live")
                        .snapshotted_dirtied_pages
                        .push(crate::txn::DirtiedPage {
                            version,
                            block_id,
                            recency,
                            page,
                        });
                    debug!(
                        target: "fbc::current_page",
                        event = "dirtier_snapshot_captured",
                        block_id = %block_id,
                        preceder = %prec,
                        successor = %txn_id
                    );
                } else {
                    // The previous dirtier holds no frozen copy of its
                    // version, so the live body now carries both writes and
                    // the two transactions must reach disk together. It is
                    // already a preceder of ours (transitively, through
                    // the write-acquirer chain); the reverse edge closes
                    // the loop and fuses the flush sets.
                    self.connect_preceder(prec, txn_id);
                }
            }
            // Grow our permit before refreshing the predecessor's (which
            // may shrink back down).
            self.txns
                .get_mut(&txn_id)
                .expect("txn live")
                .pages_dirtied_last
                .push(block_id);
            let count = self.txns[&txn_id].dirtied_page_count();
            self.txns
                .get_mut(&txn_id)
                .expect("txn live")
                .throttler_acq
                .update_dirty_page_count(count);
            if let Some(prec) = prec {
                let count = self.txns[&prec].dirtied_page_count();
                self.txns
                    .get_mut(&prec)
                    .expect("last dirtier live")
                    .throttler_acq
                    .update_dirty_page_count(count);
            }
        }

        let current_recency = self.recency_for_block_id(block_id);
        let slot = self.current_pages.get_mut(&block_id).expect("slot live");
        slot.last_dirtier = Some(txn_id);
        slot.last_dirtier_recency = current_recency;
        slot.last_dirtier_version = acq_version;
    }

    /// Delete the block: invalid recency, dropped body, deleted slot.
    ///
    /// Only the sole remaining acquirer (the current write acquirer) may
    /// delete; later acquirers would otherwise race the id's return to
    /// the free list.
    pub(crate) fn mark_deleted(&mut self, block_id: BlockId) {
        let slot = self.current_pages.get_mut(&block_id).expect("slot live");
        assert!(!slot.is_deleted, "block {block_id} deleted twice");
        assert_eq!(
            slot.acquirers.len(),
            1,
            "only the sole acquirer may delete a block"
        );
        slot.is_deleted = true;
        let page = slot.page.take();
        self.set_recency_for_block_id(block_id, Recency::INVALID);
        if let Some(page) = page {
            self.release_page_ref(page);
        }
    }
}

impl PageCache {
    pub(crate) fn release_acquirer(&self, acq_id: AcqId) {
        self.with_core(|core| {
            let Some(state) = core.acqs.remove(&acq_id) else {
                return;
            };
            let block_id = state.block_id;

            if let Some(txn_id) = state.txn {
                debug_assert_eq!(state.access, Access::Write);
                core.txn_remove_acquirer(
                    txn_id,
                    state.block_id,
                    state.block_version,
                    state.dirtied,
                    state.touched,
                );
            }

            let slot = core.current_pages.get_mut(&block_id).expect("slot live");
            if let Some(position) = slot.acquirers.iter().position(|&a| a == acq_id) {
                // A snapshotted acquirer still in the queue has no frozen
                // page yet; one that was spliced out does.
                debug_assert!(state.snapshotted_page.is_none() || !state.declared_snapshotted);
                slot.acquirers.remove(position);
                let next = slot.acquirers.get(position).copied();
                if let Some(next) = next {
                    core.pulse_pulsables(block_id, next, self.serializer());
                }
            }

            if state.declared_snapshotted {
                if let Some(snapshot) = state.snapshotted_page {
                    if let Some(page) = snapshot.page {
                        core.release_page_ref(page);
                    }
                }
                let slot = core.current_pages.get_mut(&block_id).expect("slot live");
                assert!(slot.num_keepalives > 0);
                slot.num_keepalives -= 1;
            }

            core.consider_evicting_current_page(block_id);
        });
    }
}

/// Handle held by a caller while operating on one block.
///
/// Constructed against a transaction; destroyed by drop, which releases
/// the queue position and lets the next acquirer make progress.
pub struct CurrentPageAcq {
    cache: Arc<PageCache>,
    acq_id: AcqId,
    block_id: BlockId,
    access: Access,
    read_signal: Arc<Signal>,
    write_signal: Arc<Signal>,
}

impl CurrentPageAcq {
    /// Acquire `block_id` with `access`; `PageCreate::Yes` asserts the
    /// block was previously absent and installs it with recency
    /// `DISTANT_PAST`.
    #[must_use]
    pub fn new(txn: &Txn, block_id: BlockId, access: Access, create: PageCreate) -> Self {
        if access == Access::Write {
            assert_eq!(
                txn.access(),
                Access::Write,
                "write acquirer on a read transaction"
            );
        }
        assert!(
            !(access == Access::Read && create == PageCreate::Yes),
            "cannot create a block read-only"
        );
        let cache = Arc::clone(txn.cache());
        let serializer = cache.serializer();
        let (acq_id, read_signal, write_signal) = cache.with_core(|core| {
            match create {
                PageCreate::Yes => {
                    core.free_list.acquire_chosen_block_id(block_id);
                    core.page_for_new_chosen_block_id(block_id);
                }
                PageCreate::No => {
                    core.page_for_block_id(block_id);
                }
            }
            let txn_id = (access == Access::Write).then(|| txn.txn_id());
            let acq_id = core.add_acquirer(txn_id, block_id, access, serializer);
            let state = &core.acqs[&acq_id];
            (
                acq_id,
                Arc::clone(&state.read_signal),
                Arc::clone(&state.write_signal),
            )
        });
        Self {
            cache,
            acq_id,
            block_id,
            access,
            read_signal,
            write_signal,
        }
    }

    /// Allocate a fresh block of `block_type` and write-acquire it.
    #[must_use]
    pub fn new_block(txn: &Txn, block_type: BlockType) -> Self {
        assert_eq!(
            txn.access(),
            Access::Write,
            "block creation on a read transaction"
        );
        let cache = Arc::clone(txn.cache());
        let serializer = cache.serializer();
        let (acq_id, block_id, read_signal, write_signal) = cache.with_core(|core| {
            let block_id = match block_type {
                BlockType::Normal => core.free_list.acquire_block_id(),
                BlockType::Aux => core.free_list.acquire_aux_block_id(),
            };
            core.page_for_new_chosen_block_id(block_id);
            let acq_id = core.add_acquirer(Some(txn.txn_id()), block_id, Access::Write, serializer);
            let state = &core.acqs[&acq_id];
            (
                acq_id,
                block_id,
                Arc::clone(&state.read_signal),
                Arc::clone(&state.write_signal),
            )
        });
        Self {
            cache,
            acq_id,
            block_id,
            access: Access::Write,
            read_signal,
            write_signal,
        }
    }

    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Signal pulsed when this acquirer observes read availability.
    #[must_use]
    pub fn read_acq_signal(&self) -> &Arc<Signal> {
        &self.read_signal
    }

    /// Signal pulsed when this acquirer observes write availability.
    #[must_use]
    pub fn write_acq_signal(&self) -> &Arc<Signal> {
        assert_eq!(self.access, Access::Write);
        &self.write_signal
    }

    /// The block version assigned at enqueue time.
    #[must_use]
    pub fn block_version(&self) -> BlockVersion {
        self.cache
            .with_core(|core| core.acqs[&self.acq_id].block_version)
    }

    #[must_use]
    pub fn dirtied_page(&self) -> bool {
        self.cache.with_core(|core| core.acqs[&self.acq_id].dirtied)
    }

    #[must_use]
    pub fn touched_page(&self) -> bool {
        self.cache.with_core(|core| core.acqs[&self.acq_id].touched)
    }

    /// Wait for read availability and return the block body.
    ///
    /// A snapshotted acquirer returns the frozen body it captured, however
    /// many writes have landed since.
    pub fn read(&self, cx: &Cx, account: &IoAccount) -> Result<BlockBuf> {
        self.read_signal.wait(cx)?;
        let page = self.cache.with_core(|core| {
            let state = &core.acqs[&self.acq_id];
            if let Some(snapshot) = &state.snapshotted_page {
                let page = snapshot
                    .page
                    .as_ref()
                    .unwrap_or_else(|| panic!("read of deleted block {}", self.block_id));
                Some(Arc::clone(page))
            } else {
                None
            }
        });
        let page = match page {
            Some(page) => page,
            None => self.cache.with_core(|core| {
                core.the_page_for_read_or_deleted(self.block_id, self.cache.serializer())
                    .unwrap_or_else(|| panic!("read of deleted block {}", self.block_id))
            }),
        };
        let buf = {
            let mut guard = page.lock();
            guard.buf_for_read(cx, self.cache.serializer(), account)?
        };
        self.cache.rebin_page(&page);
        Ok(buf)
    }

    /// Wait for write availability, mark the page dirty, and run `f` on
    /// the mutable body.
    ///
    /// If snapshots share the current body, the slot forks a private copy
    /// for this and future writes first; the snapshot holders keep the
    /// body they froze.
    pub fn write_with<R>(
        &self,
        cx: &Cx,
        account: &IoAccount,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        assert_eq!(self.access, Access::Write, "write on a read acquirer");
        self.write_signal.wait(cx)?;

        let serializer = self.cache.serializer();
        let page = self.cache.with_core(|core| {
            core.dirty_the_page(self.acq_id, serializer);
            core.the_page_for_read_or_deleted(self.block_id, serializer)
                .unwrap_or_else(|| panic!("write to deleted block {}", self.block_id))
        });

        // Load the body outside the core lock; the page mutex serializes
        // racing loaders.
        {
            let mut guard = page.lock();
            guard.buf_for_read(cx, serializer, account)?;
        }

        // Copy-on-write: holders beyond the slot and us are snapshots or
        // flush pins that must keep seeing the old bytes.
        let page = if Arc::strong_count(&page) > 2 {
            self.cache.with_core(|core| {
                let page_id = core.alloc_page_id();
                let fork: PageRef =
                    Arc::new(parking_lot::Mutex::new(page.lock().fork(page_id)));
                core.evicter.admit(&fork);
                let slot = core
                    .current_pages
                    .get_mut(&self.block_id)
                    .expect("slot live");
                debug_assert!(slot
                    .page
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &page)));
                slot.page = Some(Arc::clone(&fork));
                core.release_page_ref(page);
                fork
            })
        } else {
            page
        };

        let result = {
            let mut guard = page.lock();
            guard.buf_for_write(cx, serializer, account, f)?
        };
        self.cache.rebin_page(&page);
        Ok(result)
    }

    /// The block's recency as this acquirer observes it.
    pub fn recency(&self, cx: &Cx) -> Result<Recency> {
        match self.access {
            Access::Read => self.read_signal.wait(cx)?,
            // Wait for write availability so the observed recency cannot
            // change underneath a writer.
            Access::Write => self.write_signal.wait(cx)?,
        }
        Ok(self.cache.with_core(|core| {
            let state = &core.acqs[&self.acq_id];
            if let Some(snapshot) = &state.snapshotted_page {
                snapshot.recency
            } else {
                core.recency_for_block_id(self.block_id)
            }
        }))
    }

    /// Stamp the block's recency (a "touch", no data modification).
    pub fn set_recency(&self, cx: &Cx, recency: Recency) -> Result<()> {
        assert_eq!(self.access, Access::Write, "set_recency on a read acquirer");
        self.write_signal.wait(cx)?;
        self.cache.with_core(|core| {
            core.acqs.get_mut(&self.acq_id).expect("acq live").touched = true;
            core.set_recency_for_block_id(self.block_id, recency);
            let state = &core.acqs[&self.acq_id];
            let slot = core
                .current_pages
                .get_mut(&self.block_id)
                .expect("slot live");
            if slot.last_dirtier == state.txn {
                slot.last_dirtier_recency = recency;
            }
        });
        Ok(())
    }

    /// Delete the block.
    pub fn mark_deleted(&self, cx: &Cx) -> Result<()> {
        assert_eq!(self.access, Access::Write, "delete on a read acquirer");
        self.write_signal.wait(cx)?;
        let serializer = self.cache.serializer();
        self.cache.with_core(|core| {
            core.dirty_the_page(self.acq_id, serializer);
            core.mark_deleted(self.block_id);
        });
        Ok(())
    }

    /// Demote a write acquirer to read access.
    ///
    /// The transaction forgets this acquirer (a demoted acquirer can no
    /// longer dirty anything), and the queue re-pulses so the next writer
    /// may become available.
    pub fn declare_readonly(&mut self) {
        if self.access == Access::Read {
            return;
        }
        self.access = Access::Read;
        let serializer = self.cache.serializer();
        self.cache.with_core(|core| {
            let state = core.acqs.get_mut(&self.acq_id).expect("acq live");
            state.access = Access::Read;
            let demoted_txn = state.txn.take();
            let (block_version, dirtied, touched) =
                (state.block_version, state.dirtied, state.touched);
            if let Some(txn_id) = demoted_txn {
                core.txn_remove_acquirer(txn_id, self.block_id, block_version, dirtied, touched);
            }
            core.pulse_pulsables(self.block_id, self.acq_id, serializer);
        });
    }

    /// Freeze this read acquirer's view of the block.
    ///
    /// The actual body and recency are captured at pulse time, at this
    /// acquirer's position in the queue; the acquirer is then spliced out
    /// so writers behind it can proceed.
    pub fn declare_snapshotted(&self) {
        assert_eq!(
            self.access,
            Access::Read,
            "only read acquirers can snapshot"
        );
        let serializer = self.cache.serializer();
        self.cache.with_core(|core| {
            let state = core.acqs.get_mut(&self.acq_id).expect("acq live");
            // Redeclaration is allowed and does nothing.
            if state.declared_snapshotted {
                return;
            }
            state.declared_snapshotted = true;
            core.current_pages
                .get_mut(&self.block_id)
                .expect("slot live")
                .num_keepalives += 1;
            core.pulse_pulsables(self.block_id, self.acq_id, serializer);
        });
    }
}

impl Drop for CurrentPageAcq {
    fn drop(&mut self) {
        self.cache.release_acquirer(self.acq_id);
    }
}
