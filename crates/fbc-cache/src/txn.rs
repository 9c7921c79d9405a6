//! Transactions and the happens-before graph.
//!
//! A write transaction batches acquirers and participates in the flush
//! graph through preceder/subseqer edges. Edges appear when a transaction
//! write-acquires a block whose previous last write acquirer was another
//! live transaction, when a dirtier handoff couples two transactions, and
//! when a cache connection chains its writes.
//!
//! The public [`Txn`] is an RAII handle over an arena record inside the
//! cache core; [`CacheConn`] is a serial writer lane.

use crate::cache::{CacheCore, PageCache};
use crate::current_page::Access;
use crate::page::PageRef;
use crate::sync::Signal;
use crate::throttler::ThrottlerAcq;
use asupersync::Cx;
use fbc_error::Result;
use fbc_ser::IoAccount;
use fbc_types::{BlockId, BlockVersion, ConnId, Durability, Recency, TxnId};
use std::sync::Arc;
use tracing::{debug, trace};

/// A versioned page snapshot a transaction must flush.
#[derive(Debug)]
pub(crate) struct DirtiedPage {
    pub(crate) version: BlockVersion,
    pub(crate) block_id: BlockId,
    pub(crate) recency: Recency,
    /// `None` means the block was deleted.
    pub(crate) page: Option<PageRef>,
}

/// A recency-only update a transaction must flush.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TouchedPage {
    pub(crate) version: BlockVersion,
    pub(crate) block_id: BlockId,
    pub(crate) recency: Recency,
}

/// Flush-planner walk state. See `flush::maximal_flushable_txn_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushMark {
    Not,
    Blue,
    Green,
    Red,
}

/// Arena record of one transaction.
#[derive(Debug)]
pub(crate) struct PageTxn {
    pub(crate) preceders: Vec<TxnId>,
    pub(crate) subseqers: Vec<TxnId>,
    pub(crate) live_acqs: u64,
    /// Blocks whose slot names this txn as the last write acquirer.
    pub(crate) pages_write_acquired_last: Vec<BlockId>,
    /// Blocks whose slot names this txn as the last dirtier.
    pub(crate) pages_dirtied_last: Vec<BlockId>,
    /// Snapshots captured when dirtier responsibility was handed off (or
    /// at graph detachment).
    pub(crate) snapshotted_dirtied_pages: Vec<DirtiedPage>,
    pub(crate) touched_pages: Vec<TouchedPage>,
    pub(crate) throttler_acq: ThrottlerAcq,
    pub(crate) began_waiting_for_flush: bool,
    pub(crate) spawned_flush: bool,
    pub(crate) mark: FlushMark,
    pub(crate) cache_conn: Option<ConnId>,
    pub(crate) flush_complete_waiters: Vec<Arc<Signal>>,
    pub(crate) read_only: bool,
}

impl PageTxn {
    pub(crate) fn new(throttler_acq: ThrottlerAcq, read_only: bool) -> Self {
        Self {
            preceders: Vec::new(),
            subseqers: Vec::new(),
            live_acqs: 0,
            pages_write_acquired_last: Vec::new(),
            pages_dirtied_last: Vec::new(),
            snapshotted_dirtied_pages: Vec::new(),
            touched_pages: Vec::new(),
            throttler_acq,
            began_waiting_for_flush: false,
            spawned_flush: false,
            mark: FlushMark::Not,
            cache_conn: None,
            flush_complete_waiters: Vec::new(),
            read_only,
        }
    }

    /// Pages this transaction is on the hook to flush.
    pub(crate) fn dirtied_page_count(&self) -> i64 {
        i64::try_from(self.pages_dirtied_last.len() + self.snapshotted_dirtied_pages.len())
            .expect("dirty page count fits i64")
    }
}

impl CacheCore {
    /// Record `preceder` as happening-before `txn`.
    ///
    /// Deduplicated; the reciprocal subseqer edge is kept in step. If
    /// `txn` is already bound to flush imminently, the state propagates
    /// up through the new edge.
    pub(crate) fn connect_preceder(&mut self, txn_id: TxnId, preceder_id: TxnId) {
        assert_ne!(txn_id, preceder_id, "transaction cannot precede itself");
        assert!(
            !self.txns[&preceder_id].spawned_flush,
            "preceder already detached from the graph"
        );

        if self.txns[&txn_id].preceders.contains(&preceder_id) {
            return;
        }
        self.txns
            .get_mut(&txn_id)
            .expect("txn live")
            .preceders
            .push(preceder_id);
        self.txns
            .get_mut(&preceder_id)
            .expect("preceder live")
            .subseqers
            .push(txn_id);
        trace!(
            target: "fbc::txn",
            event = "preceder_connected",
            txn = %txn_id,
            preceder = %preceder_id
        );
        if self.txns[&txn_id].throttler_acq.pre_spawn_flush() {
            self.propagate_pre_spawn_flush(preceder_id);
        }
    }

    pub(crate) fn remove_preceder(&mut self, txn_id: TxnId, preceder_id: TxnId) {
        let preceders = &mut self.txns.get_mut(&txn_id).expect("txn live").preceders;
        let position = preceders
            .iter()
            .position(|&p| p == preceder_id)
            .expect("preceder edge present");
        preceders.remove(position);
    }

    pub(crate) fn remove_subseqer(&mut self, txn_id: TxnId, subseqer_id: TxnId) {
        let subseqers = &mut self.txns.get_mut(&txn_id).expect("txn live").subseqers;
        let position = subseqers
            .iter()
            .position(|&s| s == subseqer_id)
            .expect("subseqer edge present");
        subseqers.remove(position);
    }

    /// A write acquirer is leaving its transaction (release or demotion).
    ///
    /// A touched-but-not-dirtied acquirer leaves behind a recency-only
    /// change; duplicates per block are fine, change reconciliation
    /// keeps the newest.
    pub(crate) fn txn_remove_acquirer(
        &mut self,
        txn_id: TxnId,
        block_id: BlockId,
        block_version: BlockVersion,
        dirtied: bool,
        touched: bool,
    ) {
        let txn = self.txns.get_mut(&txn_id).expect("txn live");
        assert!(txn.live_acqs > 0);
        txn.live_acqs -= 1;

        if !dirtied && touched {
            let recency = self.recency_for_block_id(block_id);
            self.txns
                .get_mut(&txn_id)
                .expect("txn live")
                .touched_pages
                .push(TouchedPage {
                    version: block_version,
                    block_id,
                    recency,
                });
        }
    }

    /// Mark `base` (and, transitively, every preceder) as about to flush,
    /// growing each throttler permit to its real dirty page count.
    pub(crate) fn propagate_pre_spawn_flush(&mut self, base: TxnId) {
        if self.txns[&base].throttler_acq.pre_spawn_flush() {
            return;
        }
        let count = self.txns[&base].dirtied_page_count();
        self.txns
            .get_mut(&base)
            .expect("txn live")
            .throttler_acq
            .set_pre_spawn_flush(count);

        // Every stacked txn has the flag freshly set, so none enters twice.
        let mut stack = vec![base];
        while let Some(txn_id) = stack.pop() {
            let preceders = self.txns[&txn_id].preceders.clone();
            for preceder in preceders {
                if !self.txns[&preceder].throttler_acq.pre_spawn_flush() {
                    let count = self.txns[&preceder].dirtied_page_count();
                    self.txns
                        .get_mut(&preceder)
                        .expect("preceder live")
                        .throttler_acq
                        .set_pre_spawn_flush(count);
                    stack.push(preceder);
                }
            }
        }
    }
}

/// A serial writer lane.
///
/// Write transactions opened on the same connection are totally ordered:
/// each new one gains a preceder edge to the previous newest.
pub struct CacheConn {
    cache: Arc<PageCache>,
    conn_id: ConnId,
}

impl CacheConn {
    #[must_use]
    pub fn new(cache: &Arc<PageCache>) -> Self {
        let conn_id = cache.with_core(|core| {
            let conn_id = ConnId(core.next_conn_id);
            core.next_conn_id += 1;
            core.conns.insert(conn_id, None);
            conn_id
        });
        Self {
            cache: Arc::clone(cache),
            conn_id,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub(crate) fn conn_id(&self) -> ConnId {
        self.conn_id
    }
}

impl Drop for CacheConn {
    fn drop(&mut self) {
        // A soft-durability txn can outlive its connection; tell the
        // surviving newest txn we no longer exist.
        self.cache.with_core(|core| {
            if let Some(Some(newest)) = core.conns.remove(&self.conn_id) {
                if let Some(txn) = core.txns.get_mut(&newest) {
                    txn.cache_conn = None;
                }
            }
        });
    }
}

/// One transaction. Write transactions must end in [`commit`](Self::commit);
/// dropping one uncommitted aborts the process, because its effects may
/// already be interleaved into shared pages.
pub struct Txn {
    cache: Arc<PageCache>,
    txn_id: TxnId,
    access: Access,
    durability: Durability,
    account: IoAccount,
    committed: bool,
}

impl Txn {
    /// Begin a read transaction. Reads skip the throttler entirely and may
    /// run ahead of writers.
    #[must_use]
    pub fn begin_read(conn: &CacheConn) -> Self {
        let cache = Arc::clone(conn.cache());
        let txn_id = cache.with_core(|core| {
            let txn_id = core.alloc_txn_id();
            core.txns
                .insert(txn_id, PageTxn::new(ThrottlerAcq::none(), true));
            txn_id
        });
        debug!(target: "fbc::txn", event = "read_txn_begun", txn = %txn_id);
        Self {
            account: cache.default_reads_account(),
            cache,
            txn_id,
            access: Access::Read,
            durability: Durability::Soft,
            committed: false,
        }
    }

    /// Begin a write transaction, suspending on the throttler until
    /// `expected_change_count` changes are admissible.
    pub fn begin_write(
        conn: &CacheConn,
        durability: Durability,
        expected_change_count: i64,
        cx: &Cx,
    ) -> Result<Self> {
        let cache = Arc::clone(conn.cache());
        let throttler_acq = cache
            .throttler()
            .begin_txn_or_throttle(expected_change_count, cx)?;

        let txn_id = cache.with_core(|core| {
            let txn_id = core.alloc_txn_id();
            core.txns.insert(txn_id, PageTxn::new(throttler_acq, false));

            // Chain onto the connection: the previous newest becomes a
            // preceder and loses its back-pointer.
            let slot = core
                .conns
                .get_mut(&conn.conn_id())
                .expect("connection live");
            let old_newest = slot.replace(txn_id);
            core.txns.get_mut(&txn_id).expect("just inserted").cache_conn = Some(conn.conn_id());
            if let Some(old) = old_newest {
                core.txns.get_mut(&old).expect("newest txn live").cache_conn = None;
                core.connect_preceder(txn_id, old);
            }
            txn_id
        });
        debug!(
            target: "fbc::txn",
            event = "write_txn_begun",
            txn = %txn_id,
            expected_change_count,
            hard = durability.is_hard()
        );
        Ok(Self {
            account: cache.default_reads_account(),
            cache,
            txn_id,
            access: Access::Write,
            durability,
            committed: false,
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub(crate) fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub(crate) fn access(&self) -> Access {
        self.access
    }

    /// The I/O account used by this transaction's reads.
    #[must_use]
    pub fn account(&self) -> &IoAccount {
        &self.account
    }

    pub fn set_account(&mut self, account: IoAccount) {
        self.account = account;
    }

    /// Commit a write transaction.
    ///
    /// Soft durability returns once the transaction has joined the flush
    /// queue; hard durability blocks until its flush set has been written
    /// and index-written.
    pub fn commit(mut self, cx: &Cx) -> Result<()> {
        assert!(
            matches!(self.access, Access::Write),
            "commit on a read transaction"
        );
        assert!(!self.committed);
        self.committed = true;

        let waiter = self
            .durability
            .is_hard()
            .then(|| Arc::new(Signal::new()));
        self.cache
            .flush_and_destroy_txn(self.txn_id, self.durability, waiter.clone());
        if let Some(waiter) = waiter {
            waiter.wait(cx)?;
        }
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        match self.access {
            Access::Read => self.cache.end_read_txn(self.txn_id),
            Access::Write => {
                assert!(
                    self.committed || std::thread::panicking(),
                    "a write transaction was dropped without commit; aborting to avoid \
                     persisting a torn write set"
                );
            }
        }
    }
}
