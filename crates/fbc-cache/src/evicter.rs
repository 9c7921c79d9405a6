//! Memory-budgeted eviction of resident page bodies.
//!
//! Every page the cache knows about sits in exactly one eviction bag:
//!
//! - `unevictable`: body present, no persisted copy; dropping the body
//!   would lose data.
//! - `evictable_disk_backed`: body present and a token exists; the body
//!   can be dropped and reloaded.
//! - `evicted`: token only, nothing resident.
//!
//! Bags hold weak refs; a page whose last strong holder disappears simply
//! ages out of its bag. When resident bytes exceed the budget, bodies are
//! dropped from `evictable_disk_backed` pages, but only pages whose
//! holder count shows no snapshotters or in-flight flush pins, and whose
//! block slot reports no acquirers, writer, or dirtier.

use crate::page::PageRef;
use fbc_types::{BlockId, PageId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionBag {
    Unevictable,
    EvictableDiskBacked,
    Evicted,
}

#[derive(Debug)]
struct BagEntry {
    page: Weak<parking_lot::Mutex<crate::page::Page>>,
    block_id: BlockId,
    resident_bytes: usize,
}

/// Counters and sizes exposed for tests and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvicterMetrics {
    pub resident_bytes: usize,
    pub memory_limit: usize,
    pub evictions: u64,
    pub unevictable: usize,
    pub evictable_disk_backed: usize,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct Evicter {
    unevictable: HashMap<PageId, BagEntry>,
    evictable_disk_backed: HashMap<PageId, BagEntry>,
    evicted: HashMap<PageId, BagEntry>,
    resident_bytes: usize,
    memory_limit: usize,
    evictions: u64,
}

impl Evicter {
    #[must_use]
    pub fn new(memory_limit: usize) -> Self {
        Self {
            unevictable: HashMap::new(),
            evictable_disk_backed: HashMap::new(),
            evicted: HashMap::new(),
            resident_bytes: 0,
            memory_limit,
            evictions: 0,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> EvicterMetrics {
        EvicterMetrics {
            resident_bytes: self.resident_bytes,
            memory_limit: self.memory_limit,
            evictions: self.evictions,
            unevictable: self.unevictable.len(),
            evictable_disk_backed: self.evictable_disk_backed.len(),
            evicted: self.evicted.len(),
        }
    }

    pub fn inform_memory_limit_change(&mut self, memory_limit: usize) {
        self.memory_limit = memory_limit;
    }

    /// The bag a page belongs in, given its current state.
    #[must_use]
    pub fn correct_eviction_category(page: &crate::page::Page) -> EvictionBag {
        match (page.is_loaded(), page.is_disk_backed()) {
            (true, false) => EvictionBag::Unevictable,
            (true, true) => EvictionBag::EvictableDiskBacked,
            (false, true) => EvictionBag::Evicted,
            (false, false) => unreachable!("page with neither body nor token"),
        }
    }

    fn bag_mut(&mut self, bag: EvictionBag) -> &mut HashMap<PageId, BagEntry> {
        match bag {
            EvictionBag::Unevictable => &mut self.unevictable,
            EvictionBag::EvictableDiskBacked => &mut self.evictable_disk_backed,
            EvictionBag::Evicted => &mut self.evicted,
        }
    }

    /// First sighting of a page.
    pub fn admit(&mut self, page: &PageRef) {
        let guard = page.lock();
        let page_id = guard.page_id();
        let block_id = guard.block_id();
        let bag = Self::correct_eviction_category(&guard);
        let resident = guard.resident_bytes();
        drop(guard);

        self.resident_bytes += resident;
        let entry = BagEntry {
            page: Arc::downgrade(page),
            block_id,
            resident_bytes: resident,
        };
        let _previous = self.bag_mut(bag).insert(page_id, entry);
        debug_assert!(_previous.is_none(), "page admitted twice");
        trace!(
            target: "fbc::evicter",
            event = "admit",
            block_id = %block_id,
            bag = ?bag,
            resident
        );
    }

    /// Move a page from `old` to whatever bag its state now calls for,
    /// fixing the resident-byte accounting.
    pub fn change_to_correct_eviction_bag(&mut self, old: EvictionBag, page: &PageRef) {
        let guard = page.lock();
        let page_id = guard.page_id();
        let block_id = guard.block_id();
        let new = Self::correct_eviction_category(&guard);
        let resident = guard.resident_bytes();
        drop(guard);

        let Some(entry) = self.bag_mut(old).remove(&page_id) else {
            debug_assert!(false, "page missing from its bag");
            return;
        };
        self.resident_bytes -= entry.resident_bytes;
        self.resident_bytes += resident;
        self.bag_mut(new).insert(
            page_id,
            BagEntry {
                page: Arc::downgrade(page),
                block_id,
                resident_bytes: resident,
            },
        );
    }

    /// The bag currently holding `page_id`, if any.
    #[must_use]
    pub fn bag_of(&self, page_id: PageId) -> Option<EvictionBag> {
        if self.unevictable.contains_key(&page_id) {
            Some(EvictionBag::Unevictable)
        } else if self.evictable_disk_backed.contains_key(&page_id) {
            Some(EvictionBag::EvictableDiskBacked)
        } else if self.evicted.contains_key(&page_id) {
            Some(EvictionBag::Evicted)
        } else {
            None
        }
    }

    /// Drop entries whose page died while other holders still pinned it
    /// (the owner could not tell it was the last one out).
    fn sweep_stale(&mut self) {
        for bag in [
            EvictionBag::Unevictable,
            EvictionBag::EvictableDiskBacked,
            EvictionBag::Evicted,
        ] {
            let mut reclaimed = 0_usize;
            self.bag_mut(bag).retain(|_, entry| {
                if entry.page.strong_count() == 0 {
                    reclaimed += entry.resident_bytes;
                    false
                } else {
                    true
                }
            });
            self.resident_bytes -= reclaimed;
        }
    }

    /// Remove a page from the bags entirely (its slot is being torn down).
    pub fn forget(&mut self, page_id: PageId) {
        for bag in [
            EvictionBag::Unevictable,
            EvictionBag::EvictableDiskBacked,
            EvictionBag::Evicted,
        ] {
            if let Some(entry) = self.bag_mut(bag).remove(&page_id) {
                self.resident_bytes -= entry.resident_bytes;
                return;
            }
        }
    }

    /// Drop page bodies until resident bytes fit the budget.
    ///
    /// `blocked(block_id)` reports whether the block's slot currently
    /// forbids eviction (acquirers, last writer, last dirtier, or
    /// keepalives). Pages whose holder count exceeds two (the slot plus
    /// our probe) are pinned by snapshots or a flush and are skipped.
    pub fn evict_if_necessary(&mut self, mut blocked: impl FnMut(BlockId) -> bool) {
        if self.resident_bytes <= self.memory_limit {
            return;
        }
        self.sweep_stale();
        let candidates: Vec<PageId> = self.evictable_disk_backed.keys().copied().collect();
        for page_id in candidates {
            if self.resident_bytes <= self.memory_limit {
                break;
            }
            let Some(entry) = self.evictable_disk_backed.get(&page_id) else {
                continue;
            };
            let Some(page) = entry.page.upgrade() else {
                // The last holder went away; the entry is stale.
                let entry = self
                    .evictable_disk_backed
                    .remove(&page_id)
                    .expect("entry present");
                self.resident_bytes -= entry.resident_bytes;
                continue;
            };
            if blocked(entry.block_id) {
                continue;
            }
            // Holders: the block slot plus the ref we just upgraded.
            // Anything more is a snapshot or a flush pin.
            if Arc::strong_count(&page) > 2 {
                continue;
            }
            let mut guard = page.lock();
            if !guard.is_loaded() || !guard.is_disk_backed() {
                continue;
            }
            guard.evict_buf();
            let block_id = guard.block_id();
            drop(guard);
            self.evictions += 1;
            debug!(
                target: "fbc::evicter",
                event = "page_body_evicted",
                block_id = %block_id
            );
            self.change_to_correct_eviction_bag(EvictionBag::EvictableDiskBacked, &page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use fbc_ser::{BlockBuf, BlockToken};
    use parking_lot::Mutex;

    fn loaded_page(page_id: u64, block_id: u64, len: usize, slot: u64) -> PageRef {
        Arc::new(Mutex::new(Page::new_loaded(
            PageId(page_id),
            BlockId(block_id),
            BlockBuf::zeroed(len),
            BlockToken::new(slot, u32::try_from(len).unwrap()),
        )))
    }

    fn fresh_page(page_id: u64, block_id: u64, len: usize) -> PageRef {
        Arc::new(Mutex::new(Page::new_fresh(
            PageId(page_id),
            BlockId(block_id),
            len,
        )))
    }

    #[test]
    fn test_categorization() {
        let fresh = fresh_page(1, 1, 64);
        let loaded = loaded_page(2, 2, 64, 0);
        assert_eq!(
            Evicter::correct_eviction_category(&fresh.lock()),
            EvictionBag::Unevictable
        );
        assert_eq!(
            Evicter::correct_eviction_category(&loaded.lock()),
            EvictionBag::EvictableDiskBacked
        );
        loaded.lock().evict_buf();
        assert_eq!(
            Evicter::correct_eviction_category(&loaded.lock()),
            EvictionBag::Evicted
        );
    }

    #[test]
    fn test_budget_drives_eviction() {
        let mut evicter = Evicter::new(128);
        let pages: Vec<PageRef> = (0..4).map(|i| loaded_page(i, i, 64, i)).collect();
        for page in &pages {
            evicter.admit(page);
        }
        assert_eq!(evicter.metrics().resident_bytes, 256);

        evicter.evict_if_necessary(|_| false);
        let metrics = evicter.metrics();
        assert!(metrics.resident_bytes <= 128);
        assert_eq!(metrics.evictions, 2);
        assert_eq!(metrics.evicted, 2);
        // Evicted pages kept their tokens and can reload.
        let evicted = pages.iter().filter(|p| !p.lock().is_loaded()).count();
        assert_eq!(evicted, 2);
    }

    #[test]
    fn test_unevictable_pages_survive_pressure() {
        let mut evicter = Evicter::new(0);
        let fresh = fresh_page(1, 1, 64);
        evicter.admit(&fresh);
        evicter.evict_if_necessary(|_| false);
        assert!(fresh.lock().is_loaded());
        assert_eq!(evicter.metrics().evictions, 0);
    }

    #[test]
    fn test_blocked_slots_survive_pressure() {
        let mut evicter = Evicter::new(0);
        let page = loaded_page(1, 9, 64, 0);
        evicter.admit(&page);
        evicter.evict_if_necessary(|block_id| block_id == BlockId(9));
        assert!(page.lock().is_loaded());
    }

    #[test]
    fn test_extra_holders_survive_pressure() {
        let mut evicter = Evicter::new(0);
        let page = loaded_page(1, 1, 64, 0);
        let snapshot_pin = Arc::clone(&page);
        evicter.admit(&page);
        evicter.evict_if_necessary(|_| false);
        assert!(page.lock().is_loaded());
        drop(snapshot_pin);
        evicter.evict_if_necessary(|_| false);
        assert!(!page.lock().is_loaded());
    }

    #[test]
    fn test_rebin_tracks_accounting() {
        let mut evicter = Evicter::new(1024);
        let page = fresh_page(1, 1, 64);
        evicter.admit(&page);
        assert_eq!(evicter.metrics().resident_bytes, 64);

        // Token install makes it evictable.
        page.lock().init_block_token(BlockToken::new(0, 64));
        evicter.change_to_correct_eviction_bag(EvictionBag::Unevictable, &page);
        let metrics = evicter.metrics();
        assert_eq!(metrics.resident_bytes, 64);
        assert_eq!(metrics.evictable_disk_backed, 1);

        evicter.forget(PageId(1));
        assert_eq!(evicter.metrics().resident_bytes, 0);
    }
}
