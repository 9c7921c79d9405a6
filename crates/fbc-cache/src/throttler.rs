//! Write-transaction throttling.
//!
//! Unwritten changes consume memory until their flush completes, so new
//! write transactions pay for their expected change count up front, against
//! two budgets: unwritten block changes and unwritten index changes. Index
//! updates outlive the block write inside a flush (they are released only
//! after the index write), so the index budget is a multiple of the block
//! budget.

use asupersync::Cx;
use fbc_error::{FbcError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Hard ceiling on unwritten block changes.
pub const SOFT_UNWRITTEN_CHANGES_LIMIT: i64 = 8000;

/// Fraction of the memory budget (in blocks) made available to unwritten
/// changes.
pub const SOFT_UNWRITTEN_CHANGES_MEMORY_FRACTION: f64 = 0.5;

/// Unwritten index updates lag block writes, so their budget is larger.
pub const INDEX_CHANGES_LIMIT_FACTOR: i64 = 5;

/// Capacity floor: at least one change must always be admissible.
pub const MINIMUM_SOFT_UNWRITTEN_CHANGES_LIMIT: i64 = 1;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct SemaphoreState {
    capacity: i64,
    outstanding: i64,
    next_waiter: u64,
    /// FIFO of `(waiter id, requested count)`.
    queue: VecDeque<(u64, i64)>,
}

/// FIFO counting semaphore whose held counts can be adjusted in place.
///
/// The head waiter is admitted when the semaphore is empty or when its
/// request fits under capacity; an oversized request proceeds alone
/// rather than deadlocking.
#[derive(Debug)]
struct ChangeSemaphore {
    state: Mutex<SemaphoreState>,
    condvar: Condvar,
}

impl ChangeSemaphore {
    fn new(capacity: i64) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                capacity,
                outstanding: 0,
                next_waiter: 0,
                queue: VecDeque::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    fn acquire(&self, count: i64, cx: &Cx) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let waiter = state.next_waiter;
        state.next_waiter += 1;
        state.queue.push_back((waiter, count));
        loop {
            let at_head = state.queue.front().map(|(id, _)| *id) == Some(waiter);
            if at_head && (state.outstanding == 0 || state.outstanding + count <= state.capacity) {
                state.queue.pop_front();
                state.outstanding += count;
                drop(state);
                // A zero-count grant leaves room for the next waiter too.
                self.condvar.notify_all();
                return Ok(());
            }
            if cx.checkpoint().is_err() {
                let position = state
                    .queue
                    .iter()
                    .position(|(id, _)| *id == waiter)
                    .expect("waiter still queued");
                state.queue.remove(position);
                drop(state);
                self.condvar.notify_all();
                return Err(FbcError::Cancelled);
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(state, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Adjust a held count from `old` to `new` without re-queuing.
    ///
    /// Growth may push the semaphore over capacity; that debt drains as
    /// other holders release.
    fn change_count(&self, old: i64, new: i64) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.outstanding += new - old;
            debug_assert!(state.outstanding >= 0);
        }
        self.condvar.notify_all();
    }

    fn set_capacity(&self, capacity: i64) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.capacity = capacity;
        }
        self.condvar.notify_all();
    }

    fn outstanding(&self) -> i64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outstanding
    }

    fn capacity(&self) -> i64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity
    }
}

/// Permit held by one write transaction.
///
/// Tracks how many block and index changes the transaction is charged
/// for. Read transactions carry an empty permit.
#[derive(Debug)]
pub struct ThrottlerAcq {
    sems: Option<(Arc<ChangeSemaphore>, Arc<ChangeSemaphore>)>,
    expected_count: i64,
    block_count: i64,
    index_count: i64,
    pre_spawn_flush: bool,
}

impl ThrottlerAcq {
    /// Empty permit for read transactions.
    #[must_use]
    pub fn none() -> Self {
        Self {
            sems: None,
            expected_count: 0,
            block_count: 0,
            index_count: 0,
            pre_spawn_flush: false,
        }
    }

    #[must_use]
    pub fn has_txn_throttler(&self) -> bool {
        self.sems.is_some()
    }

    #[must_use]
    pub fn pre_spawn_flush(&self) -> bool {
        self.pre_spawn_flush
    }

    /// Enter the pre-spawn-flush state and charge for the current dirty
    /// page count.
    pub fn set_pre_spawn_flush(&mut self, dirty_page_count: i64) {
        self.pre_spawn_flush = true;
        self.update_dirty_page_count(dirty_page_count);
    }

    /// Grow the held counts to the transaction's dirty page count.
    ///
    /// Only grows (never shrinks below the expected count), and only once
    /// the transaction is in pre-spawn-flush. Before that, the expected
    /// count stands in for the real one.
    pub fn update_dirty_page_count(&mut self, new_count: i64) {
        debug_assert_eq!(self.block_count, self.index_count);
        let new_count = new_count.max(self.expected_count);
        if self.pre_spawn_flush && new_count > self.block_count {
            if let Some((block, index)) = &self.sems {
                block.change_count(self.block_count, new_count);
                index.change_count(self.index_count, new_count);
            }
            self.block_count = new_count;
            self.index_count = new_count;
        }
    }

    /// Return the block-change permits: the disk write finished, but the
    /// index updates are still unwritten.
    pub fn mark_dirty_pages_written(&mut self) {
        if let Some((block, _index)) = &self.sems {
            block.change_count(self.block_count, 0);
        }
        self.block_count = 0;
    }
}

impl Drop for ThrottlerAcq {
    fn drop(&mut self) {
        if let Some((block, index)) = self.sems.take() {
            block.change_count(self.block_count, 0);
            index.change_count(self.index_count, 0);
        }
    }
}

/// Counts pending unwritten changes and suspends new write transactions
/// while the budget is exhausted.
#[derive(Debug)]
pub struct Throttler {
    block_changes: Arc<ChangeSemaphore>,
    index_changes: Arc<ChangeSemaphore>,
    minimum_unwritten_changes_limit: i64,
}

impl Throttler {
    #[must_use]
    pub fn new(minimum_unwritten_changes_limit: i64) -> Self {
        Self {
            block_changes: Arc::new(ChangeSemaphore::new(SOFT_UNWRITTEN_CHANGES_LIMIT)),
            index_changes: Arc::new(ChangeSemaphore::new(
                SOFT_UNWRITTEN_CHANGES_LIMIT * INDEX_CHANGES_LIMIT_FACTOR,
            )),
            minimum_unwritten_changes_limit,
        }
    }

    /// Acquire a permit for `expected_change_count` changes, suspending
    /// until the budget admits it.
    pub fn begin_txn_or_throttle(
        &self,
        expected_change_count: i64,
        cx: &Cx,
    ) -> Result<ThrottlerAcq> {
        assert!(expected_change_count >= 0);
        self.index_changes.acquire(expected_change_count, cx)?;
        if let Err(err) = self.block_changes.acquire(expected_change_count, cx) {
            self.index_changes.change_count(expected_change_count, 0);
            return Err(err);
        }
        Ok(ThrottlerAcq {
            sems: Some((
                Arc::clone(&self.block_changes),
                Arc::clone(&self.index_changes),
            )),
            expected_count: expected_change_count,
            block_count: expected_change_count,
            index_count: expected_change_count,
            pre_spawn_flush: false,
        })
    }

    /// Return a permit. The drop releases everything still held.
    pub fn end_txn(&self, acq: ThrottlerAcq) {
        drop(acq);
    }

    /// Rescale the budgets to a new memory limit.
    pub fn inform_memory_limit_change(
        &self,
        memory_limit: u64,
        max_block_size: fbc_types::BlockSize,
    ) {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let scaled = ((memory_limit / u64::from(max_block_size.get())) as f64
            * SOFT_UNWRITTEN_CHANGES_MEMORY_FRACTION) as i64;
        let limit = scaled
            .min(SOFT_UNWRITTEN_CHANGES_LIMIT)
            .max(self.minimum_unwritten_changes_limit);
        debug!(
            target: "fbc::throttler",
            event = "memory_limit_change",
            memory_limit,
            block_changes_limit = limit,
            index_changes_limit = limit * INDEX_CHANGES_LIMIT_FACTOR
        );
        self.index_changes
            .set_capacity(limit * INDEX_CHANGES_LIMIT_FACTOR);
        self.block_changes.set_capacity(limit);
    }

    #[must_use]
    pub fn outstanding_block_changes(&self) -> i64 {
        self.block_changes.outstanding()
    }

    #[must_use]
    pub fn outstanding_index_changes(&self) -> i64 {
        self.index_changes.outstanding()
    }

    #[must_use]
    pub fn block_changes_capacity(&self) -> i64 {
        self.block_changes.capacity()
    }
}
