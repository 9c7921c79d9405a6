//! Block-id allocation.
//!
//! Two recycling pools, split at the auxiliary bit: normal blocks carry a
//! recency and participate in read-ahead; auxiliary blocks have neither.
//! Released ids are reused before the frontier advances.

use fbc_types::BlockId;
use std::collections::HashSet;
use tracing::trace;

#[derive(Debug)]
struct IdPool {
    /// First id never handed out.
    frontier: u64,
    /// Released ids below the frontier, reused LIFO.
    released: Vec<u64>,
    /// Ids reserved by name before the frontier reached them.
    reserved_ahead: HashSet<u64>,
}

impl IdPool {
    fn new() -> Self {
        Self {
            frontier: 0,
            released: Vec::new(),
            reserved_ahead: HashSet::new(),
        }
    }

    fn acquire(&mut self) -> u64 {
        if let Some(index) = self.released.pop() {
            return index;
        }
        loop {
            let index = self.frontier;
            self.frontier += 1;
            if !self.reserved_ahead.remove(&index) {
                return index;
            }
        }
    }

    fn acquire_chosen(&mut self, index: u64) {
        if index < self.frontier {
            let position = self
                .released
                .iter()
                .position(|&r| r == index)
                .unwrap_or_else(|| panic!("block id {index} acquired twice"));
            self.released.swap_remove(position);
        } else {
            assert!(
                self.reserved_ahead.insert(index),
                "block id {index} acquired twice"
            );
        }
    }

    fn release(&mut self, index: u64) {
        debug_assert!(index < self.frontier);
        debug_assert!(!self.released.contains(&index));
        self.released.push(index);
    }

    fn is_live(&self, index: u64) -> bool {
        if index < self.frontier {
            !self.released.contains(&index)
        } else {
            self.reserved_ahead.contains(&index)
        }
    }
}

/// Allocator for fresh block ids, one pool per block class.
#[derive(Debug)]
pub struct FreeList {
    normal: IdPool,
    aux: IdPool,
}

impl FreeList {
    /// A free list that treats every id in `live` as taken.
    #[must_use]
    pub fn new(live: impl IntoIterator<Item = BlockId>) -> Self {
        let mut list = Self {
            normal: IdPool::new(),
            aux: IdPool::new(),
        };
        for id in live {
            list.acquire_chosen_block_id(id);
        }
        list
    }

    /// Allocate a fresh normal block id.
    pub fn acquire_block_id(&mut self) -> BlockId {
        let id = BlockId(self.normal.acquire());
        trace!(target: "fbc::free_list", event = "acquire", block_id = %id);
        id
    }

    /// Allocate a fresh auxiliary block id.
    pub fn acquire_aux_block_id(&mut self) -> BlockId {
        let id = BlockId(fbc_types::AUX_BLOCK_BIT | self.aux.acquire());
        trace!(target: "fbc::free_list", event = "acquire_aux", block_id = %id);
        id
    }

    /// Reserve a caller-named id.
    ///
    /// Panics if the id is already live: creating a block over a live id
    /// is a protocol violation.
    pub fn acquire_chosen_block_id(&mut self, id: BlockId) {
        if id.is_aux() {
            self.aux.acquire_chosen(id.pool_index());
        } else {
            self.normal.acquire_chosen(id.pool_index());
        }
        trace!(target: "fbc::free_list", event = "acquire_chosen", block_id = %id);
    }

    /// Mark an externally discovered id as taken, if it isn't already.
    ///
    /// Used when the serializer surfaces a block (read-ahead) that the
    /// startup live set did not cover.
    pub fn ensure_live(&mut self, id: BlockId) {
        let pool = if id.is_aux() { &self.aux } else { &self.normal };
        if !pool.is_live(id.pool_index()) {
            self.acquire_chosen_block_id(id);
        }
    }

    /// Return an id for reuse.
    pub fn release_block_id(&mut self, id: BlockId) {
        if id.is_aux() {
            self.aux.release(id.pool_index());
        } else {
            self.normal.release(id.pool_index());
        }
        trace!(target: "fbc::free_list", event = "release", block_id = %id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_sequential() {
        let mut list = FreeList::new([]);
        assert_eq!(list.acquire_block_id(), BlockId(0));
        assert_eq!(list.acquire_block_id(), BlockId(1));
        assert_eq!(list.acquire_block_id(), BlockId(2));
    }

    #[test]
    fn test_released_ids_are_recycled() {
        let mut list = FreeList::new([]);
        let a = list.acquire_block_id();
        let b = list.acquire_block_id();
        list.release_block_id(a);
        assert_eq!(list.acquire_block_id(), a);
        list.release_block_id(b);
        list.release_block_id(a);
        let next = list.acquire_block_id();
        assert!(next == a || next == b);
    }

    #[test]
    fn test_pools_are_independent() {
        let mut list = FreeList::new([]);
        let normal = list.acquire_block_id();
        let aux = list.acquire_aux_block_id();
        assert!(!normal.is_aux());
        assert!(aux.is_aux());
        assert_eq!(normal.pool_index(), 0);
        assert_eq!(aux.pool_index(), 0);
    }

    #[test]
    fn test_chosen_id_below_frontier() {
        let mut list = FreeList::new([]);
        let a = list.acquire_block_id();
        list.release_block_id(a);
        // Reserving the released id takes it out of circulation.
        list.acquire_chosen_block_id(a);
        assert_ne!(list.acquire_block_id(), a);
    }

    #[test]
    fn test_chosen_id_ahead_of_frontier() {
        let mut list = FreeList::new([]);
        list.acquire_chosen_block_id(BlockId(2));
        assert_eq!(list.acquire_block_id(), BlockId(0));
        assert_eq!(list.acquire_block_id(), BlockId(1));
        // Id 2 is reserved; the frontier skips it.
        assert_eq!(list.acquire_block_id(), BlockId(3));
    }

    #[test]
    fn test_new_from_live_set() {
        let mut list = FreeList::new([BlockId(0), BlockId(2)]);
        assert_eq!(list.acquire_block_id(), BlockId(1));
        assert_eq!(list.acquire_block_id(), BlockId(3));
    }

    #[test]
    #[should_panic(expected = "acquired twice")]
    fn test_double_chosen_panics() {
        let mut list = FreeList::new([]);
        list.acquire_chosen_block_id(BlockId(5));
        list.acquire_chosen_block_id(BlockId(5));
    }
}
