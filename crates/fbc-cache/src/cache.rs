//! The cache instance: core state, construction, read-ahead, teardown.
//!
//! All graph and slot mutations happen under one core mutex; serializer
//! I/O happens with it released. The lock order is core before page:
//! nothing may wait on the core mutex while holding a page mutex.

use crate::config::{CACHE_READS_IO_PRIORITY, CACHE_READS_OUTSTANDING_LIMIT};
use crate::current_page::{AcqId, AcqState, CurrentPage};
use crate::evicter::{Evicter, EvicterMetrics};
use crate::free_list::FreeList;
use crate::page::PageRef;
use crate::sync::IndexWriteSink;
use crate::throttler::{MINIMUM_SOFT_UNWRITTEN_CHANGES_LIMIT, Throttler};
use crate::txn::PageTxn;
use asupersync::Cx;
use fbc_error::Result;
use fbc_ser::{BlockBuf, BlockSerializer, BlockToken, IoAccount};
use fbc_types::{BlockId, BlockSize, ConnId, PageId, Recency, TxnId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Memory-budget policy the cache consults; in a multi-cache process this
/// is the balancer's per-instance view.
pub trait CacheBalancer: Send + Sync {
    /// Whether startup read-ahead is worthwhile (e.g. the cache is large
    /// enough relative to the data).
    fn read_ahead_ok_at_start(&self) -> bool;

    /// Resident-memory budget in bytes for this cache instance.
    fn memory_limit(&self) -> u64;
}

/// Fixed-budget balancer for single-cache deployments and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedBalancer {
    pub memory_limit: u64,
    pub read_ahead: bool,
}

impl CacheBalancer for FixedBalancer {
    fn read_ahead_ok_at_start(&self) -> bool {
        self.read_ahead
    }

    fn memory_limit(&self) -> u64 {
        self.memory_limit
    }
}

/// Point-in-time counters for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub current_pages: usize,
    pub live_txns: usize,
    pub waiting_for_spawn_flush: usize,
    pub evicter: EvicterMetrics,
}

/// State guarded by the core mutex.
pub(crate) struct CacheCore {
    pub(crate) max_block_size: BlockSize,
    pub(crate) current_pages: HashMap<BlockId, CurrentPage>,
    pub(crate) acqs: HashMap<AcqId, AcqState>,
    pub(crate) txns: HashMap<TxnId, PageTxn>,
    /// Per-connection newest write transaction.
    pub(crate) conns: HashMap<ConnId, Option<TxnId>>,
    pub(crate) recencies: HashMap<BlockId, Recency>,
    pub(crate) free_list: FreeList,
    pub(crate) evicter: Evicter,
    pub(crate) waiting_for_spawn_flush: Vec<TxnId>,
    pub(crate) read_ahead_live: bool,
    next_txn_id: u64,
    next_acq_id: u64,
    next_page_id: u64,
    pub(crate) next_conn_id: u64,
}

impl CacheCore {
    pub(crate) fn alloc_txn_id(&mut self) -> TxnId {
        let id = TxnId(self.next_txn_id);
        self.next_txn_id += 1;
        id
    }

    pub(crate) fn alloc_acq_id(&mut self) -> AcqId {
        let id = AcqId(self.next_acq_id);
        self.next_acq_id += 1;
        id
    }

    pub(crate) fn alloc_page_id(&mut self) -> PageId {
        let id = PageId(self.next_page_id);
        self.next_page_id += 1;
        id
    }

    /// The block's recency. Auxiliary blocks have none and read as
    /// `DISTANT_PAST`; unknown normal blocks read as deleted.
    pub(crate) fn recency_for_block_id(&self, block_id: BlockId) -> Recency {
        if block_id.is_aux() {
            return Recency::DISTANT_PAST;
        }
        self.recencies
            .get(&block_id)
            .copied()
            .unwrap_or(Recency::INVALID)
    }

    pub(crate) fn set_recency_for_block_id(&mut self, block_id: BlockId, recency: Recency) {
        if block_id.is_aux() {
            return;
        }
        self.recencies.insert(block_id, recency);
    }

    /// Drop one strong ref to a page, clearing its evicter entry when the
    /// ref was the last one.
    pub(crate) fn release_page_ref(&mut self, page: PageRef) {
        if Arc::strong_count(&page) == 1 {
            let page_id = page.lock().page_id();
            self.evicter.forget(page_id);
        }
        drop(page);
    }

    /// Tear down a block's slot if nothing needs it anymore. A deleted
    /// block's id returns to the free list here, only once every
    /// version-tracking back-pointer has let go.
    pub(crate) fn consider_evicting_current_page(&mut self, block_id: BlockId) {
        // Read-ahead relies on slot existence to tell whether an offered
        // body could be stale; no slot may disappear while it is live.
        if self.read_ahead_live {
            return;
        }
        let Some(slot) = self.current_pages.get(&block_id) else {
            return;
        };
        if !slot.should_be_evicted() {
            return;
        }
        let slot = self.current_pages.remove(&block_id).expect("just found");
        if let Some(page) = slot.page {
            self.release_page_ref(page);
        }
        if slot.is_deleted {
            self.free_list.release_block_id(block_id);
            self.recencies.remove(&block_id);
        }
        debug!(target: "fbc::cache", event = "current_page_evicted", block_id = %block_id);
    }

    /// Drop clean resident bodies until the evicter budget is met.
    pub(crate) fn evict_if_over_budget(&mut self) {
        let Self {
            evicter,
            current_pages,
            ..
        } = self;
        evicter.evict_if_necessary(|block_id| {
            current_pages
                .get(&block_id)
                .is_some_and(CurrentPage::blocks_page_eviction)
        });
    }
}

/// One buffer cache instance over one serializer.
pub struct PageCache {
    serializer: Arc<dyn BlockSerializer>,
    throttler: Throttler,
    core: Mutex<CacheCore>,
    index_write_sink: IndexWriteSink,
    default_reads_account: IoAccount,
    max_block_size: BlockSize,
}

impl PageCache {
    /// Construct a cache over `serializer`.
    ///
    /// Reads the serializer's recency index, seeds the free list with the
    /// live id set, sizes the evicter and throttler from the balancer's
    /// budget, and (when the balancer approves) installs every
    /// read-ahead body the serializer streams.
    pub fn new(
        serializer: Arc<dyn BlockSerializer>,
        balancer: &dyn CacheBalancer,
        cx: &Cx,
    ) -> Result<Arc<Self>> {
        let max_block_size = serializer.max_block_size();
        let recencies = serializer.all_recencies(cx)?;
        let default_reads_account =
            serializer.make_io_account(CACHE_READS_IO_PRIORITY, CACHE_READS_OUTSTANDING_LIMIT);

        let memory_limit = balancer.memory_limit();
        let throttler = Throttler::new(MINIMUM_SOFT_UNWRITTEN_CHANGES_LIMIT);
        throttler.inform_memory_limit_change(memory_limit, max_block_size);

        let free_list = FreeList::new(recencies.keys().copied());
        let start_read_ahead = balancer.read_ahead_ok_at_start();

        let core = CacheCore {
            max_block_size,
            current_pages: HashMap::new(),
            acqs: HashMap::new(),
            txns: HashMap::new(),
            conns: HashMap::new(),
            recencies,
            free_list,
            evicter: Evicter::new(
                usize::try_from(memory_limit).unwrap_or(usize::MAX),
            ),
            waiting_for_spawn_flush: Vec::new(),
            read_ahead_live: start_read_ahead,
            next_txn_id: 0,
            next_acq_id: 0,
            next_page_id: 0,
            next_conn_id: 0,
        };

        let cache = Arc::new(Self {
            serializer,
            throttler,
            core: Mutex::new(core),
            index_write_sink: IndexWriteSink::new(),
            default_reads_account,
            max_block_size,
        });

        if start_read_ahead {
            let mut offered = 0_usize;
            let mut accepted = 0_usize;
            cache.serializer.read_ahead(cx, &mut |block_id, buf, token| {
                offered += 1;
                if cache.offer_read_ahead_buf(block_id, buf, token) {
                    accepted += 1;
                }
            })?;
            info!(
                target: "fbc::cache",
                event = "read_ahead_complete",
                offered,
                accepted
            );
        }

        Ok(cache)
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, CacheCore> {
        self.core.lock()
    }

    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut CacheCore) -> R) -> R {
        f(&mut self.core.lock())
    }

    pub(crate) fn serializer(&self) -> &dyn BlockSerializer {
        &*self.serializer
    }

    pub(crate) fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    pub(crate) fn index_write_sink(&self) -> &IndexWriteSink {
        &self.index_write_sink
    }

    /// The shared account cache reads run under by default.
    #[must_use]
    pub fn default_reads_account(&self) -> IoAccount {
        self.default_reads_account
    }

    #[must_use]
    pub fn max_block_size(&self) -> BlockSize {
        self.max_block_size
    }

    /// A dedicated I/O account whose priority scales against the default
    /// read lane (priority 100 = parity).
    #[must_use]
    pub fn create_cache_account(&self, priority: i32) -> IoAccount {
        let io_priority = (CACHE_READS_IO_PRIORITY * priority / 100).max(1);
        let outstanding_limit = (16 * priority / 100).max(1);
        self.serializer
            .make_io_account(io_priority, outstanding_limit)
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let core = self.core.lock();
        CacheMetrics {
            current_pages: core.current_pages.len(),
            live_txns: core.txns.len(),
            waiting_for_spawn_flush: core.waiting_for_spawn_flush.len(),
            evicter: core.evicter.metrics(),
        }
    }

    /// A pre-loaded body offered by the serializer during startup.
    ///
    /// Accepted iff the read-ahead window is still open and no slot
    /// exists for the block. An existing slot means the block may have
    /// been modified since the body was read, so the offer is stale.
    pub fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        buf: BlockBuf,
        token: BlockToken,
    ) -> bool {
        self.with_core(|core| {
            if !core.read_ahead_live {
                return false;
            }
            if core.current_pages.contains_key(&block_id) {
                return false;
            }
            core.free_list.ensure_live(block_id);
            let page_id = core.alloc_page_id();
            let page: PageRef = Arc::new(parking_lot::Mutex::new(
                crate::page::Page::new_loaded(page_id, block_id, buf, token),
            ));
            core.evicter.admit(&page);
            core.current_pages
                .insert(block_id, CurrentPage::new(block_id, Some(page)));
            true
        })
    }

    /// Close the read-ahead window and sweep slot-eviction consideration
    /// over everything resident.
    pub fn dismiss_read_ahead(&self) {
        self.with_core(|core| {
            if !core.read_ahead_live {
                return;
            }
            core.read_ahead_live = false;
            let block_ids: Vec<BlockId> = core.current_pages.keys().copied().collect();
            for block_id in block_ids {
                core.consider_evicting_current_page(block_id);
            }
            core.evict_if_over_budget();
        });
    }

    /// Balancer callback: the memory budget changed.
    pub fn inform_memory_limit_change(&self, memory_limit: u64) {
        self.throttler
            .inform_memory_limit_change(memory_limit, self.max_block_size);
        self.with_core(|core| {
            core.evicter
                .inform_memory_limit_change(usize::try_from(memory_limit).unwrap_or(usize::MAX));
            core.evict_if_over_budget();
        });
    }

    /// Re-bin a page after its state changed and apply eviction pressure.
    pub(crate) fn rebin_page(&self, page: &PageRef) {
        self.with_core(|core| {
            let page_id = page.lock().page_id();
            if let Some(old_bag) = core.evicter.bag_of(page_id) {
                core.evicter.change_to_correct_eviction_bag(old_bag, page);
            }
            core.evict_if_over_budget();
        });
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // Terminal flush: every write txn still waiting (all soft; their
        // commits returned long ago) flushes as one set.
        let mut core = self.core.lock();
        core.read_ahead_live = false;
        let residual = core.waiting_for_spawn_flush.clone();
        if residual.is_empty() {
            drop(core);
        } else {
            info!(
                target: "fbc::cache",
                event = "terminal_flush",
                txns = residual.len()
            );
            self.spawn_flush_flushables(core, residual);
        }

        let mut core = self.core.lock();
        if !core.txns.is_empty() {
            warn!(
                target: "fbc::cache",
                event = "teardown_with_live_txns",
                txns = core.txns.len()
            );
        }
        let block_ids: Vec<BlockId> = core.current_pages.keys().copied().collect();
        for block_id in block_ids {
            let slot = core
                .current_pages
                .remove(&block_id)
                .expect("slot just listed");
            assert!(slot.acquirers.is_empty(), "teardown with live acquirers");
            assert_eq!(slot.num_keepalives, 0, "teardown with live snapshots");
            assert!(slot.last_write_acquirer.is_none());
            assert!(slot.last_dirtier.is_none());
            if slot.is_deleted {
                core.free_list.release_block_id(slot.block_id);
            }
            if let Some(page) = slot.page {
                core.release_page_ref(page);
            }
        }
    }
}
