//! End-to-end scenarios against the in-memory serializer: admission
//! ordering, snapshots, flush coalescing, throttling, dirtier handoff,
//! read-ahead acceptance, and eviction safety.

use asupersync::Cx;
use fbc_cache::{
    Access, CacheConn, CurrentPageAcq, FixedBalancer, PageCache, PageCreate, Txn,
};
use fbc_ser::{BlockBuf, BlockSerializer, BufWriteInfo, IndexWriteOp, MemSerializer};
use fbc_types::{BlockId, BlockSize, Durability, Recency};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn cx() -> Cx {
    Cx::for_testing()
}

fn setup(memory_limit: u64, read_ahead: bool) -> (Arc<MemSerializer>, Arc<PageCache>) {
    let serializer = Arc::new(MemSerializer::new(BlockSize::new(4096).unwrap()));
    let cache = PageCache::new(
        serializer.clone(),
        &FixedBalancer {
            memory_limit,
            read_ahead,
        },
        &cx(),
    )
    .unwrap();
    (serializer, cache)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached within timeout");
}

/// One-block write then read through separate transactions.
#[test]
fn scenario_write_then_read() {
    let (serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn, BlockId(42), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), txn.account(), |body| {
        body[0] = 0x41;
        body[1] = 0x42;
    })
    .unwrap();
    drop(acq);
    txn.commit(&cx()).unwrap();

    // The hard commit published the block.
    let published = serializer.published_body(BlockId(42)).unwrap();
    assert_eq!(&published.as_slice()[..2], &[0x41, 0x42]);

    let read_txn = Txn::begin_read(&conn);
    let acq = CurrentPageAcq::new(&read_txn, BlockId(42), Access::Read, PageCreate::No);
    let body = acq.read(&cx(), read_txn.account()).unwrap();
    assert_eq!(&body.as_slice()[..2], &[0x41, 0x42]);
    drop(acq);
    drop(read_txn);
}

/// A snapshotted read keeps the body it observed across a later write.
#[test]
fn scenario_snapshot_across_write() {
    let (serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn, BlockId(7), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), txn.account(), |body| body[..2].copy_from_slice(b"v1"))
        .unwrap();
    drop(acq);
    txn.commit(&cx()).unwrap();

    let read_txn = Txn::begin_read(&conn);
    let snapshot = CurrentPageAcq::new(&read_txn, BlockId(7), Access::Read, PageCreate::No);
    snapshot.declare_snapshotted();

    let rewrite = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&rewrite, BlockId(7), Access::Write, PageCreate::No);
    acq.write_with(&cx(), rewrite.account(), |body| body[..2].copy_from_slice(b"v2"))
        .unwrap();
    drop(acq);
    rewrite.commit(&cx()).unwrap();

    // The snapshot still reads v1; the live block and disk carry v2.
    let frozen = snapshot.read(&cx(), read_txn.account()).unwrap();
    assert_eq!(&frozen.as_slice()[..2], b"v1");
    drop(snapshot);
    drop(read_txn);

    let published = serializer.published_body(BlockId(7)).unwrap();
    assert_eq!(&published.as_slice()[..2], b"v2");

    let read_txn = Txn::begin_read(&conn);
    let acq = CurrentPageAcq::new(&read_txn, BlockId(7), Access::Read, PageCreate::No);
    let live = acq.read(&cx(), read_txn.account()).unwrap();
    assert_eq!(&live.as_slice()[..2], b"v2");
    drop(acq);
    drop(read_txn);
}

/// Soft-committed writers coalesce into the flush of a later hard
/// transaction that overwrote their blocks; the newest values land.
#[test]
fn scenario_preceder_coalescing() {
    let (serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    for (block, value) in [(1_u64, 0x11_u8), (2, 0x22)] {
        let txn = Txn::begin_write(&conn, Durability::Soft, 1, &cx()).unwrap();
        let acq = CurrentPageAcq::new(&txn, BlockId(block), Access::Write, PageCreate::Yes);
        acq.write_with(&cx(), txn.account(), |body| body[0] = value)
            .unwrap();
        drop(acq);
        txn.commit(&cx()).unwrap();
    }
    // Nothing flushed yet: both soft txns are queued.
    assert_eq!(serializer.metrics().index_writes, 0);
    assert_eq!(cache.metrics().waiting_for_spawn_flush, 2);

    let txn = Txn::begin_write(&conn, Durability::Hard, 2, &cx()).unwrap();
    for block in [1_u64, 2] {
        let acq = CurrentPageAcq::new(&txn, BlockId(block), Access::Write, PageCreate::No);
        acq.write_with(&cx(), txn.account(), |body| body[0] = 0x33)
            .unwrap();
        drop(acq);
    }
    txn.commit(&cx()).unwrap();

    // One flush set carried all three txns; disk has the newest values.
    assert_eq!(serializer.metrics().index_writes, 1);
    for block in [1_u64, 2] {
        let published = serializer.published_body(BlockId(block)).unwrap();
        assert_eq!(published.as_slice()[0], 0x33);
    }
    let metrics = cache.metrics();
    assert_eq!(metrics.live_txns, 0);
    assert_eq!(metrics.waiting_for_spawn_flush, 0);
}

/// With capacity two, a third two-permit writer waits until one commits.
#[test]
fn scenario_throttler_blocks_third_writer() {
    let (_serializer, cache) = setup(64 << 20, false);
    cache.inform_memory_limit_change(4 * 4096);

    let conn = CacheConn::new(&cache);
    let first = Txn::begin_write(&conn, Durability::Hard, 2, &cx()).unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..2_u64 {
        let cache = Arc::clone(&cache);
        let started = Arc::clone(&started);
        handles.push(thread::spawn(move || {
            let conn = CacheConn::new(&cache);
            let txn = Txn::begin_write(&conn, Durability::Hard, 2, &cx()).unwrap();
            started.fetch_add(1, Ordering::SeqCst);
            let acq =
                CurrentPageAcq::new(&txn, BlockId(100 + i), Access::Write, PageCreate::Yes);
            acq.write_with(&cx(), txn.account(), |body| body[0] = 1)
                .unwrap();
            drop(acq);
            txn.commit(&cx()).unwrap();
        }));
    }

    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        started.load(Ordering::SeqCst),
        0,
        "writers must be throttled while the first holds the budget"
    );

    let acq = CurrentPageAcq::new(&first, BlockId(99), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), first.account(), |body| body[0] = 9)
        .unwrap();
    drop(acq);
    first.commit(&cx()).unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(started.load(Ordering::SeqCst), 2);
}

/// Dirtier handoff into a pre-spawn-flush preceder: the preceder freezes
/// its version and flushes without waiting for the successor.
#[test]
fn scenario_dirtier_handoff_flushes_independently() {
    let (serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    // Holds the graph open: txn1 chains behind it on the connection.
    let txn0 = Txn::begin_write(&conn, Durability::Soft, 1, &cx()).unwrap();

    let txn1 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn1, BlockId(9), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), txn1.account(), |body| body[0] = 0xAA)
        .unwrap();
    drop(acq);

    // txn1's hard commit cannot flush yet (txn0 is still open), so it
    // parks in pre-spawn-flush.
    let committer = thread::spawn(move || txn1.commit(&cx()).unwrap());
    wait_until(|| cache.metrics().waiting_for_spawn_flush == 1);
    assert_eq!(serializer.metrics().index_writes, 0);

    // A successor dirties the same block. txn1 must freeze its version
    // rather than fuse with the successor.
    let txn2 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq2 = CurrentPageAcq::new(&txn2, BlockId(9), Access::Write, PageCreate::No);
    acq2.write_with(&cx(), txn2.account(), |body| body[0] = 0xBB)
        .unwrap();

    // Releasing txn0 lets {txn0, txn1} flush, with txn2 still open and
    // holding the block dirty. If the handoff had fused txn1 to txn2,
    // this commit would deadlock.
    txn0.commit(&cx()).unwrap();
    committer.join().unwrap();

    let published = serializer.published_body(BlockId(9)).unwrap();
    assert_eq!(
        published.as_slice()[0],
        0xAA,
        "the frozen version, not the successor's, must be on disk"
    );

    drop(acq2);
    txn2.commit(&cx()).unwrap();
    let published = serializer.published_body(BlockId(9)).unwrap();
    assert_eq!(published.as_slice()[0], 0xBB);
}

/// A read enqueued behind a write acquirer observes nothing until the
/// writer releases.
#[test]
fn property_fifo_admission() {
    let (_serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let writer = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let write_acq = CurrentPageAcq::new(&writer, BlockId(5), Access::Write, PageCreate::Yes);

    let read_txn = Txn::begin_read(&conn);
    let read_acq = CurrentPageAcq::new(&read_txn, BlockId(5), Access::Read, PageCreate::No);
    assert!(
        !read_acq.read_acq_signal().is_pulsed(),
        "read admitted while a write acquirer precedes it"
    );

    write_acq
        .write_with(&cx(), writer.account(), |body| body[0] = 0x77)
        .unwrap();
    assert!(!read_acq.read_acq_signal().is_pulsed());

    drop(write_acq);
    assert!(read_acq.read_acq_signal().is_pulsed());
    let body = read_acq.read(&cx(), read_txn.account()).unwrap();
    assert_eq!(body.as_slice()[0], 0x77);

    drop(read_acq);
    drop(read_txn);
    writer.commit(&cx()).unwrap();
}

/// Successive write acquirers of one block get strictly increasing
/// versions.
#[test]
fn property_block_version_monotonic() {
    let (_serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let txn1 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq1 = CurrentPageAcq::new(&txn1, BlockId(3), Access::Write, PageCreate::Yes);
    let v1 = acq1.block_version();
    assert!(v1.is_assigned());
    acq1.write_with(&cx(), txn1.account(), |body| body[0] = 1)
        .unwrap();
    drop(acq1);

    let txn2 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq2 = CurrentPageAcq::new(&txn2, BlockId(3), Access::Write, PageCreate::No);
    let v2 = acq2.block_version();
    assert!(v2 > v1, "write versions must increase: {v1} then {v2}");
    acq2.write_with(&cx(), txn2.account(), |body| body[0] = 2)
        .unwrap();
    drop(acq2);

    txn1.commit(&cx()).unwrap();
    txn2.commit(&cx()).unwrap();
}

/// Read-ahead offers: accepted only while the window is open and no slot
/// exists for the block.
#[test]
fn property_read_ahead_acceptance() {
    let serializer = Arc::new(MemSerializer::new(BlockSize::new(4096).unwrap()));
    let account = serializer.make_io_account(100, 16);
    let tokens = serializer
        .block_writes(
            &cx(),
            &[
                BufWriteInfo {
                    block_id: BlockId(1),
                    buf: BlockBuf::new(vec![0x01; 4096]),
                },
                BufWriteInfo {
                    block_id: BlockId(2),
                    buf: BlockBuf::new(vec![0x02; 4096]),
                },
            ],
            &account,
        )
        .unwrap();
    serializer
        .index_write(
            &cx(),
            &[
                IndexWriteOp {
                    block_id: BlockId(1),
                    token: Some(tokens[0]),
                    recency: Recency(1),
                },
                IndexWriteOp {
                    block_id: BlockId(2),
                    token: Some(tokens[1]),
                    recency: Recency(2),
                },
            ],
        )
        .unwrap();

    let cache = PageCache::new(
        serializer.clone(),
        &FixedBalancer {
            memory_limit: 64 << 20,
            read_ahead: true,
        },
        &cx(),
    )
    .unwrap();
    assert_eq!(cache.metrics().current_pages, 2);

    // A slot already exists: the offered body might be stale.
    assert!(!cache.offer_read_ahead_buf(
        BlockId(1),
        BlockBuf::new(vec![0xFF; 4096]),
        tokens[0]
    ));

    // No slot and the window is open: accepted.
    let extra = serializer
        .block_writes(
            &cx(),
            &[BufWriteInfo {
                block_id: BlockId(3),
                buf: BlockBuf::new(vec![0x03; 4096]),
            }],
            &account,
        )
        .unwrap();
    assert!(cache.offer_read_ahead_buf(
        BlockId(3),
        BlockBuf::new(vec![0x03; 4096]),
        extra[0]
    ));

    // Window closed: dropped.
    cache.dismiss_read_ahead();
    assert!(!cache.offer_read_ahead_buf(
        BlockId(4),
        BlockBuf::new(vec![0x04; 4096]),
        extra[0]
    ));

    // Read-ahead bodies serve reads without touching the serializer.
    let reads_before = serializer.metrics().blocks_read;
    let conn = CacheConn::new(&cache);
    let read_txn = Txn::begin_read(&conn);
    let acq = CurrentPageAcq::new(&read_txn, BlockId(1), Access::Read, PageCreate::No);
    let body = acq.read(&cx(), read_txn.account()).unwrap();
    assert_eq!(body.as_slice()[0], 0x01);
    drop(acq);
    drop(read_txn);
    assert_eq!(serializer.metrics().blocks_read, reads_before);
}

/// Under a tiny memory budget, clean bodies are dropped and reloaded on
/// demand; no data is lost and dirty pages survive untouched.
#[test]
fn property_eviction_safety() {
    let (_serializer, cache) = setup(2 * 4096, false);
    let conn = CacheConn::new(&cache);

    for i in 0..8_u64 {
        let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
        let acq = CurrentPageAcq::new(&txn, BlockId(i), Access::Write, PageCreate::Yes);
        #[allow(clippy::cast_possible_truncation)]
        acq.write_with(&cx(), txn.account(), |body| body[0] = i as u8)
            .unwrap();
        drop(acq);
        txn.commit(&cx()).unwrap();
    }

    let metrics = cache.metrics();
    assert!(metrics.evicter.evictions > 0, "budget pressure must evict");

    for i in 0..8_u64 {
        let read_txn = Txn::begin_read(&conn);
        let acq = CurrentPageAcq::new(&read_txn, BlockId(i), Access::Read, PageCreate::No);
        let body = acq.read(&cx(), read_txn.account()).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let expected = i as u8;
        assert_eq!(body.as_slice()[0], expected);
        drop(acq);
        drop(read_txn);
    }
    assert!(cache.metrics().evicter.resident_bytes <= 2 * 4096);
}

/// A touch (recency-only change) flushes as an index update with no
/// block write.
#[test]
fn scenario_touch_only_flush() {
    let (serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn, BlockId(6), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), txn.account(), |body| body[0] = 0x66)
        .unwrap();
    acq.set_recency(&cx(), Recency(42)).unwrap();
    drop(acq);
    txn.commit(&cx()).unwrap();
    assert_eq!(serializer.index_recency(BlockId(6)), Some(Recency(42)));

    let writes_before = serializer.metrics().blocks_written;
    let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn, BlockId(6), Access::Write, PageCreate::No);
    acq.set_recency(&cx(), Recency(99)).unwrap();
    assert!(acq.touched_page());
    assert!(!acq.dirtied_page());
    drop(acq);
    txn.commit(&cx()).unwrap();

    assert_eq!(serializer.metrics().blocks_written, writes_before);
    assert_eq!(serializer.index_recency(BlockId(6)), Some(Recency(99)));
    // The body is untouched.
    assert_eq!(
        serializer.published_body(BlockId(6)).unwrap().as_slice()[0],
        0x66
    );
}

/// Deleting a block publishes a deletion and recycles the id.
#[test]
fn scenario_delete_and_recreate() {
    let (serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn, BlockId(11), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), txn.account(), |body| body[0] = 0x11)
        .unwrap();
    drop(acq);
    txn.commit(&cx()).unwrap();
    assert!(serializer.published_body(BlockId(11)).is_some());

    let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn, BlockId(11), Access::Write, PageCreate::No);
    acq.mark_deleted(&cx()).unwrap();
    drop(acq);
    txn.commit(&cx()).unwrap();

    assert!(serializer.published_body(BlockId(11)).is_none());
    assert!(!serializer.all_recencies(&cx()).unwrap().contains_key(&BlockId(11)));

    // The id is free again.
    let txn = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&txn, BlockId(11), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), txn.account(), |body| body[0] = 0x22)
        .unwrap();
    drop(acq);
    txn.commit(&cx()).unwrap();
    assert_eq!(
        serializer.published_body(BlockId(11)).unwrap().as_slice()[0],
        0x22
    );
}

/// Soft commits batch; the cache flushes the residue at teardown.
#[test]
fn scenario_terminal_flush_on_teardown() {
    let (serializer, cache) = setup(64 << 20, false);
    {
        let conn = CacheConn::new(&cache);
        for block in 20..24_u64 {
            let txn = Txn::begin_write(&conn, Durability::Soft, 1, &cx()).unwrap();
            let acq = CurrentPageAcq::new(&txn, BlockId(block), Access::Write, PageCreate::Yes);
            acq.write_with(&cx(), txn.account(), |body| body[0] = 0x5A)
                .unwrap();
            drop(acq);
            txn.commit(&cx()).unwrap();
        }
    }
    assert_eq!(serializer.metrics().index_writes, 0);
    drop(cache);
    assert_eq!(serializer.metrics().index_writes, 1);
    for block in 20..24_u64 {
        assert_eq!(
            serializer.published_body(BlockId(block)).unwrap().as_slice()[0],
            0x5A
        );
    }
}

/// Reads stack up behind a writer and are admitted together once it
/// releases; a second writer behind them stays blocked until they go.
#[test]
fn property_reader_batch_then_writer() {
    let (_serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let w1 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let w1_acq = CurrentPageAcq::new(&w1, BlockId(8), Access::Write, PageCreate::Yes);
    w1_acq
        .write_with(&cx(), w1.account(), |body| body[0] = 1)
        .unwrap();

    let read_txn = Txn::begin_read(&conn);
    let r1 = CurrentPageAcq::new(&read_txn, BlockId(8), Access::Read, PageCreate::No);
    let r2 = CurrentPageAcq::new(&read_txn, BlockId(8), Access::Read, PageCreate::No);

    let w2 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let w2_acq = CurrentPageAcq::new(&w2, BlockId(8), Access::Write, PageCreate::No);

    assert!(!r1.read_acq_signal().is_pulsed());
    assert!(!r2.read_acq_signal().is_pulsed());
    assert!(!w2_acq.write_acq_signal().is_pulsed());

    drop(w1_acq);
    // Both readers are admitted together. The writer sees read
    // availability (the chain ahead is all readers) but not write
    // availability.
    assert!(r1.read_acq_signal().is_pulsed());
    assert!(r2.read_acq_signal().is_pulsed());
    assert!(w2_acq.read_acq_signal().is_pulsed());
    assert!(!w2_acq.write_acq_signal().is_pulsed());

    drop(r1);
    assert!(!w2_acq.write_acq_signal().is_pulsed());
    drop(r2);
    assert!(w2_acq.write_acq_signal().is_pulsed());

    w2_acq
        .write_with(&cx(), w2.account(), |body| body[0] = 2)
        .unwrap();
    drop(w2_acq);
    drop(read_txn);
    w1.commit(&cx()).unwrap();
    w2.commit(&cx()).unwrap();
}

/// Demoting a write acquirer to read-only unblocks the writer queued
/// behind it.
#[test]
fn property_declare_readonly_unblocks_next_writer() {
    let (_serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let w1 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let mut w1_acq = CurrentPageAcq::new(&w1, BlockId(13), Access::Write, PageCreate::Yes);

    let w2 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let w2_acq = CurrentPageAcq::new(&w2, BlockId(13), Access::Write, PageCreate::No);
    assert!(!w2_acq.write_acq_signal().is_pulsed());

    // The first writer decides not to write after all. Demotion makes it
    // a plain reader; the second writer still waits until it leaves.
    w1_acq.declare_readonly();
    assert!(w2_acq.read_acq_signal().is_pulsed());
    assert!(!w2_acq.write_acq_signal().is_pulsed());
    drop(w1_acq);
    assert!(w2_acq.write_acq_signal().is_pulsed());

    w2_acq
        .write_with(&cx(), w2.account(), |body| body[0] = 2)
        .unwrap();
    drop(w2_acq);
    w1.commit(&cx()).unwrap();
    w2.commit(&cx()).unwrap();
}

/// A snapshotted reader is spliced out of the queue: the writer behind
/// it becomes available while the snapshot stays readable.
#[test]
fn property_snapshot_splice_unblocks_writer() {
    let (_serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let w1 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let acq = CurrentPageAcq::new(&w1, BlockId(14), Access::Write, PageCreate::Yes);
    acq.write_with(&cx(), w1.account(), |body| body[0] = 0x0E)
        .unwrap();
    drop(acq);
    w1.commit(&cx()).unwrap();

    let read_txn = Txn::begin_read(&conn);
    let snapshot = CurrentPageAcq::new(&read_txn, BlockId(14), Access::Read, PageCreate::No);
    snapshot.declare_snapshotted();

    let w2 = Txn::begin_write(&conn, Durability::Hard, 1, &cx()).unwrap();
    let w2_acq = CurrentPageAcq::new(&w2, BlockId(14), Access::Write, PageCreate::No);
    // The snapshot left the queue, so the writer is immediately at the
    // head.
    assert!(w2_acq.write_acq_signal().is_pulsed());
    w2_acq
        .write_with(&cx(), w2.account(), |body| body[0] = 0x0F)
        .unwrap();
    drop(w2_acq);
    w2.commit(&cx()).unwrap();

    let frozen = snapshot.read(&cx(), read_txn.account()).unwrap();
    assert_eq!(frozen.as_slice()[0], 0x0E);
    drop(snapshot);
    drop(read_txn);
}

/// Aux blocks: allocated from their own range, no recency tracking.
#[test]
fn scenario_aux_block_allocation() {
    let (serializer, cache) = setup(64 << 20, false);
    let conn = CacheConn::new(&cache);

    let txn = Txn::begin_write(&conn, Durability::Hard, 2, &cx()).unwrap();
    let aux = CurrentPageAcq::new_block(&txn, fbc_cache::BlockType::Aux);
    let normal = CurrentPageAcq::new_block(&txn, fbc_cache::BlockType::Normal);
    let aux_id = aux.block_id();
    let normal_id = normal.block_id();
    assert!(aux_id.is_aux());
    assert!(!normal_id.is_aux());

    aux.write_with(&cx(), txn.account(), |body| body[0] = 0xA1)
        .unwrap();
    normal.write_with(&cx(), txn.account(), |body| body[0] = 0xB2)
        .unwrap();
    drop(aux);
    drop(normal);
    txn.commit(&cx()).unwrap();

    assert_eq!(
        serializer.published_body(aux_id).unwrap().as_slice()[0],
        0xA1
    );
    // Aux blocks never enter the recency index.
    assert!(!serializer.all_recencies(&cx()).unwrap().contains_key(&aux_id));
    assert!(serializer.all_recencies(&cx()).unwrap().contains_key(&normal_id));
}
