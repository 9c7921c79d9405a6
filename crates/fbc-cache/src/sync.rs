//! Wait/notify primitives for the cache.
//!
//! [`Signal`] is a one-shot pulse: acquirer availability and flush
//! completion are both "pulse exactly once, wake everyone" events.
//! [`IndexWriteSink`] hands out FIFO tickets so concurrent flushes enter
//! the serializer's index write in spawn order.

use asupersync::Cx;
use fbc_error::{FbcError, Result};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Granularity at which blocked waiters re-check for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One-shot condition: starts unpulsed, latches on the first
/// [`pulse`](Self::pulse), and stays pulsed forever.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal and wake all waiters. Idempotent.
    pub fn pulse(&self) {
        {
            let mut pulsed = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *pulsed {
                return;
            }
            *pulsed = true;
        }
        self.condvar.notify_all();
    }

    #[must_use]
    pub fn is_pulsed(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until pulsed, or until `cx` is cancelled.
    pub fn wait(&self, cx: &Cx) -> Result<()> {
        let mut pulsed = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *pulsed {
                return Ok(());
            }
            if cx.checkpoint().is_err() {
                return Err(FbcError::Cancelled);
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(pulsed, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            pulsed = guard;
        }
    }
}

/// FIFO ordering gate in front of the serializer's index write.
///
/// A flush takes a [`SinkTicket`] at spawn time (under the cache core
/// lock, so ticket order equals flush spawn order) and later blocks in
/// [`wait_turn`](Self::wait_turn) until every earlier ticket has entered
/// and left the exclusive section.
#[derive(Debug)]
pub struct IndexWriteSink {
    state: Mutex<SinkState>,
    condvar: Condvar,
}

#[derive(Debug)]
struct SinkState {
    next_ticket: u64,
    serving: u64,
}

/// Position in the index-write order. Every ticket MUST be redeemed with
/// `wait_turn`; an abandoned ticket would stall all later flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkTicket(u64);

/// Exclusive occupancy of the index-write section. Dropping it admits the
/// next ticket.
#[derive(Debug)]
pub struct SinkGuard<'a> {
    sink: &'a IndexWriteSink,
}

impl IndexWriteSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SinkState {
                next_ticket: 0,
                serving: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Reserve the next position in the index-write order.
    pub fn enter(&self) -> SinkTicket {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = SinkTicket(state.next_ticket);
        state.next_ticket += 1;
        ticket
    }

    /// Block until `ticket` is at the head of the order.
    pub fn wait_turn(&self, ticket: SinkTicket, cx: &Cx) -> Result<SinkGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.serving == ticket.0 {
                return Ok(SinkGuard { sink: self });
            }
            if cx.checkpoint().is_err() {
                return Err(FbcError::Cancelled);
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(state, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

impl Default for IndexWriteSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SinkGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self
                .sink
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.serving += 1;
        }
        self.sink.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_signal_latches() {
        let signal = Signal::new();
        assert!(!signal.is_pulsed());
        signal.pulse();
        assert!(signal.is_pulsed());
        signal.pulse();
        assert!(signal.is_pulsed());
        signal.wait(&Cx::for_testing()).unwrap();
    }

    #[test]
    fn test_signal_wakes_blocked_waiter() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(&Cx::for_testing()))
        };
        thread::sleep(Duration::from_millis(20));
        signal.pulse();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_sink_orders_tickets() {
        let sink = Arc::new(IndexWriteSink::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = sink.enter();
        let second = sink.enter();

        // Redeem out of order: the second ticket blocks until the first
        // guard drops.
        let t2 = {
            let sink = Arc::clone(&sink);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let guard = sink.wait_turn(second, &Cx::for_testing()).unwrap();
                order.lock().unwrap().push(2);
                drop(guard);
            })
        };
        thread::sleep(Duration::from_millis(20));
        {
            let guard = sink.wait_turn(first, &Cx::for_testing()).unwrap();
            order.lock().unwrap().push(1);
            drop(guard);
        }
        t2.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_sink_serial_section_is_exclusive() {
        let sink = Arc::new(IndexWriteSink::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ticket = sink.enter();
            let sink = Arc::clone(&sink);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                let guard = sink.wait_turn(ticket, &Cx::for_testing()).unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                thread::sleep(Duration::from_millis(2));
                assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                drop(guard);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
