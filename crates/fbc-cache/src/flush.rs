//! Flush planning and execution.
//!
//! A transaction becomes flushable when it has begun waiting for flush and
//! every transitive preceder has too. The planner computes the largest
//! such closed set, the set is detached from the graph while the core lock
//! is held, and the engine then reconciles the set's page changes, writes
//! the dirty bodies in one serializer batch, and publishes one ordered
//! index write.
//!
//! Serializer failures during a flush are fatal by design: partial-flush
//! recovery is restart plus the serializer's on-disk consistency.

use crate::cache::{CacheCore, PageCache};
use crate::current_page::Access;
use crate::page::PageRef;
use crate::sync::{Signal, SinkTicket};
use crate::txn::{DirtiedPage, FlushMark};
use asupersync::Cx;
use fbc_ser::{BufWriteInfo, IndexWriteOp};
use fbc_types::{BlockId, BlockVersion, Durability, Recency, TxnId, superceding_recency};
use parking_lot::MutexGuard;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// One block's folded change across a flush set.
#[derive(Debug)]
pub(crate) struct BlockChange {
    pub(crate) version: BlockVersion,
    /// Whether the body itself changed (as opposed to recency only).
    pub(crate) modified: bool,
    /// The body to persist; `None` with `modified` means deletion.
    pub(crate) page: Option<PageRef>,
    pub(crate) recency: Recency,
}

impl CacheCore {
    /// The largest set of transactions containing `base` that can flush
    /// right now: every member has begun waiting for flush, and every
    /// preceder of every member is in the set.
    ///
    /// Implemented as a four-color walk. `Blue` nodes are queued for
    /// examination; a node goes `Red` when some preceder is red or not
    /// yet waiting, else `Green`. Green subseqers of a node that turns
    /// red must be re-examined, so a node can be visited at most twice
    /// (not → blue → green → blue → red is the longest path).
    pub(crate) fn maximal_flushable_txn_set(&mut self, base: TxnId) -> Vec<TxnId> {
        let mut blue: Vec<TxnId> = Vec::new();
        let mut colored: Vec<TxnId> = Vec::new();

        {
            let txn = &self.txns[&base];
            assert!(!txn.spawned_flush);
            assert!(txn.began_waiting_for_flush);
            debug_assert_eq!(txn.mark, FlushMark::Not);
        }
        self.txns.get_mut(&base).expect("base live").mark = FlushMark::Blue;
        blue.push(base);
        colored.push(base);

        while let Some(txn_id) = blue.pop() {
            debug_assert_eq!(self.txns[&txn_id].mark, FlushMark::Blue);

            let mut poisoned = false;
            let preceders = self.txns[&txn_id].preceders.clone();
            for prec in preceders {
                let prec_txn = &self.txns[&prec];
                debug_assert!(!prec_txn.spawned_flush);
                if !prec_txn.began_waiting_for_flush || prec_txn.mark == FlushMark::Red {
                    poisoned = true;
                } else if prec_txn.mark == FlushMark::Not {
                    self.txns.get_mut(&prec).expect("preceder live").mark = FlushMark::Blue;
                    blue.push(prec);
                    colored.push(prec);
                }
            }

            self.txns.get_mut(&txn_id).expect("txn live").mark = if poisoned {
                FlushMark::Red
            } else {
                FlushMark::Green
            };

            let subseqers = self.txns[&txn_id].subseqers.clone();
            for subs in subseqers {
                let subs_txn = &self.txns[&subs];
                debug_assert!(!subs_txn.spawned_flush);
                if !subs_txn.began_waiting_for_flush {
                    debug_assert_eq!(subs_txn.mark, FlushMark::Not);
                } else if subs_txn.mark == FlushMark::Not {
                    if !poisoned {
                        self.txns.get_mut(&subs).expect("subseqer live").mark = FlushMark::Blue;
                        blue.push(subs);
                        colored.push(subs);
                    }
                } else if subs_txn.mark == FlushMark::Green && poisoned {
                    self.txns.get_mut(&subs).expect("subseqer live").mark = FlushMark::Blue;
                    blue.push(subs);
                }
            }
        }

        let mut flushable = Vec::with_capacity(colored.len());
        for txn_id in colored {
            let mark = self.txns[&txn_id].mark;
            self.txns.get_mut(&txn_id).expect("txn live").mark = FlushMark::Not;
            match mark {
                FlushMark::Green => flushable.push(txn_id),
                FlushMark::Red => {}
                FlushMark::Not | FlushMark::Blue => unreachable!("walk left a {mark:?} mark"),
            }
        }
        flushable
    }

    /// Detach a flush set from the graph.
    ///
    /// After this, no member is anyone's preceder or subseqer, no slot
    /// names a member as last write acquirer or last dirtier (each
    /// member's dirtied slots are frozen into its snapshot list first),
    /// and every member is off the waiting queue with `spawned_flush`
    /// set; `connect_preceder` uses that flag to reject edges into
    /// detached territory.
    pub(crate) fn remove_txn_set_from_graph(
        &mut self,
        txns: &[TxnId],
        serializer: &dyn fbc_ser::BlockSerializer,
    ) {
        for &txn_id in txns {
            let subseqers = std::mem::take(
                &mut self.txns.get_mut(&txn_id).expect("txn live").subseqers,
            );
            for subs in subseqers {
                self.remove_preceder(subs, txn_id);
            }

            // Preceders can lie outside the set: transactions that made no
            // modifications are never flushed and never waited on.
            let preceders = std::mem::take(
                &mut self.txns.get_mut(&txn_id).expect("txn live").preceders,
            );
            for prec in preceders {
                self.remove_subseqer(prec, txn_id);
            }

            let write_acquired = std::mem::take(
                &mut self
                    .txns
                    .get_mut(&txn_id)
                    .expect("txn live")
                    .pages_write_acquired_last,
            );
            for block_id in write_acquired {
                debug_assert!(
                    {
                        let slot = &self.current_pages[&block_id];
                        slot.last_write_acquirer == Some(txn_id)
                            && slot
                                .acquirers
                                .iter()
                                .all(|acq| self.acqs[acq].access == Access::Read)
                    },
                    "a preceding write acquirer must have released before its txn flushes"
                );
                self.current_pages
                    .get_mut(&block_id)
                    .expect("slot live")
                    .last_write_acquirer = None;
                self.consider_evicting_current_page(block_id);
            }

            let dirtied = std::mem::take(
                &mut self
                    .txns
                    .get_mut(&txn_id)
                    .expect("txn live")
                    .pages_dirtied_last,
            );
            for block_id in dirtied {
                let (version, recency) = {
                    let slot = &self.current_pages[&block_id];
                    debug_assert_eq!(slot.last_dirtier, Some(txn_id));
                    (slot.last_dirtier_version, slot.last_dirtier_recency)
                };
                let page = self.the_page_for_read_or_deleted(block_id, serializer);
                self.txns
                    .get_mut(&txn_id)
                    .expect("txn live")
                    .snapshotted_dirtied_pages
                    .push(DirtiedPage {
                        version,
                        block_id,
                        recency,
                        page,
                    });
                self.current_pages
                    .get_mut(&block_id)
                    .expect("slot live")
                    .last_dirtier = None;
                self.consider_evicting_current_page(block_id);
            }

            let txn = self.txns.get_mut(&txn_id).expect("txn live");
            if let Some(conn_id) = txn.cache_conn.take() {
                let slot = self.conns.get_mut(&conn_id).expect("conn live");
                debug_assert_eq!(*slot, Some(txn_id));
                *slot = None;
            }

            assert!(!txn.spawned_flush);
            txn.spawned_flush = true;
            let position = self
                .waiting_for_spawn_flush
                .iter()
                .position(|&t| t == txn_id)
                .expect("txn was waiting for spawn flush");
            self.waiting_for_spawn_flush.remove(position);
            trace!(target: "fbc::flush", event = "txn_detached", txn = %txn_id);
        }
    }

    /// Fold every member's snapshots and touches into one change per
    /// block. The newest block version wins a collision; a touch merging
    /// into an older entry carries its version forward and combines
    /// recencies with `superceding_recency`, but never discards a body
    /// that still needs writing.
    pub(crate) fn compute_changes(&self, txns: &[TxnId]) -> HashMap<BlockId, BlockChange> {
        let mut changes: HashMap<BlockId, BlockChange> = HashMap::new();

        for &txn_id in txns {
            for d in &self.txns[&txn_id].snapshotted_dirtied_pages {
                let recency = if d.page.is_some() {
                    d.recency
                } else {
                    Recency::INVALID
                };
                match changes.get_mut(&d.block_id) {
                    None => {
                        changes.insert(
                            d.block_id,
                            BlockChange {
                                version: d.version,
                                modified: true,
                                page: d.page.as_ref().map(Arc::clone),
                                recency,
                            },
                        );
                    }
                    Some(existing) => {
                        // Distinct write operations cannot share a version.
                        assert_ne!(
                            existing.version, d.version,
                            "equal versions on block {}",
                            d.block_id
                        );
                        if existing.version < d.version {
                            *existing = BlockChange {
                                version: d.version,
                                modified: true,
                                page: d.page.as_ref().map(Arc::clone),
                                recency,
                            };
                        }
                    }
                }
            }
        }

        for &txn_id in txns {
            for t in &self.txns[&txn_id].touched_pages {
                match changes.get_mut(&t.block_id) {
                    None => {
                        changes.insert(
                            t.block_id,
                            BlockChange {
                                version: t.version,
                                modified: false,
                                page: None,
                                recency: t.recency,
                            },
                        );
                    }
                    Some(existing) => {
                        assert_ne!(existing.version, t.version);
                        if existing.version < t.version {
                            existing.version = t.version;
                            existing.recency = superceding_recency(existing.recency, t.recency);
                        }
                    }
                }
            }
        }

        changes
    }
}

impl PageCache {
    /// Commit path: hand a finished transaction to the flush scheduler.
    ///
    /// The transaction joins the waiting queue; hard durability (or a
    /// transaction already bound to flush) spawns the maximal flushable
    /// set immediately, on the calling thread.
    pub(crate) fn flush_and_destroy_txn(
        &self,
        txn_id: TxnId,
        durability: Durability,
        on_complete: Option<Arc<Signal>>,
    ) {
        let mut core = self.lock_core();
        {
            let txn = core.txns.get_mut(&txn_id).expect("txn live");
            assert!(
                txn.live_acqs == 0,
                "a current page acquirer lifespan exceeds its transaction's"
            );
            assert!(!txn.began_waiting_for_flush);
            debug_assert!(!txn.spawned_flush);

            if let Some(waiter) = on_complete {
                txn.flush_complete_waiters.push(waiter);
            }
            txn.began_waiting_for_flush = true;
        }
        core.waiting_for_spawn_flush.push(txn_id);

        if durability.is_hard() || core.txns[&txn_id].throttler_acq.pre_spawn_flush() {
            core.propagate_pre_spawn_flush(txn_id);
            let flush_set = core.maximal_flushable_txn_set(txn_id);
            debug!(
                target: "fbc::flush",
                event = "flush_spawned",
                base = %txn_id,
                set_size = flush_set.len(),
                hard = durability.is_hard()
            );
            self.spawn_flush_flushables(core, flush_set);
        }
    }

    /// Tear down a read transaction. Reads produce no changes and are
    /// never enqueued for flush.
    pub(crate) fn end_read_txn(&self, txn_id: TxnId) {
        self.with_core(|core| {
            let txn = core.txns.remove(&txn_id).expect("txn live");
            assert!(txn.read_only);
            assert_eq!(txn.live_acqs, 0);
            assert!(txn.preceders.is_empty());
            assert!(txn.subseqers.is_empty());
            assert!(txn.snapshotted_dirtied_pages.is_empty());
            assert!(txn.touched_pages.is_empty());
            assert!(txn.pages_dirtied_last.is_empty());
        });
    }

    /// Detach and flush a computed set. Consumes the core guard: the
    /// detachment happens under it, the serializer I/O after it drops.
    pub(crate) fn spawn_flush_flushables(
        &self,
        mut core: MutexGuard<'_, CacheCore>,
        flush_set: Vec<TxnId>,
    ) {
        if flush_set.is_empty() {
            return;
        }
        core.remove_txn_set_from_graph(&flush_set, self.serializer());
        let changes = core.compute_changes(&flush_set);

        if changes.is_empty() {
            drop(core);
            self.finish_flush_set(&flush_set);
            return;
        }

        // The ticket is taken while the core lock is still held, so index
        // writes land in flush spawn order.
        let ticket = self.index_write_sink().enter();
        drop(core);
        self.do_flush_changes(changes, &flush_set, ticket);
    }

    /// Execute one flush: classify changes, batch-write dirty bodies,
    /// publish the ordered index write, then settle bookkeeping and wake
    /// completion waiters.
    fn do_flush_changes(
        &self,
        changes: HashMap<BlockId, BlockChange>,
        flush_set: &[TxnId],
        ticket: SinkTicket,
    ) {
        let cx = Cx::for_request();
        let account = self.default_reads_account();

        let mut ops: Vec<IndexWriteOp> = Vec::with_capacity(changes.len());
        let mut write_infos: Vec<BufWriteInfo> = Vec::new();
        let mut write_recencies: Vec<Recency> = Vec::new();
        // Holding the PageRef pins the body against eviction until the
        // token is installed.
        let mut write_pages: Vec<PageRef> = Vec::new();

        for (block_id, change) in &changes {
            if change.modified {
                match &change.page {
                    None => ops.push(IndexWriteOp {
                        block_id: *block_id,
                        token: None,
                        recency: Recency::INVALID,
                    }),
                    Some(page) => {
                        let guard = page.lock();
                        if let Some(token) = guard.block_token() {
                            // Already persisted by an earlier flush; reuse.
                            ops.push(IndexWriteOp {
                                block_id: *block_id,
                                token: Some(token),
                                recency: change.recency,
                            });
                        } else {
                            // A dirtied body cannot have been evicted: the
                            // write cleared its token, which makes it
                            // unevictable until we persist it here.
                            let buf = guard.buf_for_loaded().unwrap_or_else(|| {
                                panic!("dirtied block {block_id} lost its body before flush")
                            });
                            write_infos.push(BufWriteInfo {
                                block_id: *block_id,
                                buf,
                            });
                            write_recencies.push(change.recency);
                            drop(guard);
                            write_pages.push(Arc::clone(page));
                        }
                    }
                }
            } else {
                ops.push(IndexWriteOp {
                    block_id: *block_id,
                    token: None,
                    recency: change.recency,
                });
            }
        }

        info!(
            target: "fbc::flush",
            event = "flush_write_start",
            txns = flush_set.len(),
            changes = changes.len(),
            block_writes = write_infos.len()
        );

        let tokens = self
            .serializer()
            .block_writes(&cx, &write_infos, &account)
            .unwrap_or_else(|err| panic!("fatal: serializer block write failed: {err}"));
        assert_eq!(tokens.len(), write_infos.len());

        for (info, (token, recency)) in write_infos
            .iter()
            .zip(tokens.iter().zip(write_recencies.iter()))
        {
            ops.push(IndexWriteOp {
                block_id: info.block_id,
                token: Some(*token),
                recency: *recency,
            });
        }

        {
            let _sink = self
                .index_write_sink()
                .wait_turn(ticket, &cx)
                .expect("flushes are not cancellable");
            self.serializer()
                .index_write(&cx, &ops)
                .unwrap_or_else(|err| panic!("fatal: serializer index write failed: {err}"));
        }

        // Install the new tokens now that the index references them, and
        // re-bin each page (it just became evictable).
        self.with_core(|core| {
            for (page, token) in write_pages.iter().zip(tokens) {
                let old_bag = core.evicter.bag_of(page.lock().page_id());
                {
                    let mut guard = page.lock();
                    debug_assert!(guard.block_token().is_none());
                    guard.init_block_token(token);
                }
                if let Some(old_bag) = old_bag {
                    core.evicter.change_to_correct_eviction_bag(old_bag, page);
                }
            }
        });
        drop(write_pages);

        self.finish_flush_set(flush_set);
    }

    /// Common tail of every flush: drop the set's page snapshots, return
    /// block-change permits, destroy the transactions, and wake their
    /// completion waiters.
    fn finish_flush_set(&self, flush_set: &[TxnId]) {
        let waiters: Vec<Arc<Signal>> = self.with_core(|core| {
            let mut waiters = Vec::new();
            for &txn_id in flush_set {
                let mut txn = core.txns.remove(&txn_id).expect("txn live");
                for dirtied in txn.snapshotted_dirtied_pages.drain(..) {
                    if let Some(page) = dirtied.page {
                        core.release_page_ref(page);
                    }
                    core.consider_evicting_current_page(dirtied.block_id);
                }
                if txn.throttler_acq.has_txn_throttler() {
                    txn.throttler_acq.mark_dirty_pages_written();
                }
                waiters.append(&mut txn.flush_complete_waiters);
                // Dropping the record returns the remaining (index) permits.
            }
            waiters
        });
        debug!(
            target: "fbc::flush",
            event = "flush_complete",
            txns = flush_set.len(),
            waiters = waiters.len()
        );
        for waiter in waiters {
            waiter.pulse();
        }
    }
}
