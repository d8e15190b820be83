//! Dirty page arena: shadow copies of every page a write transaction has
//! touched. Lookup order during the transaction is always dirty map first,
//! then the mmap.

use std::collections::HashMap;

use crate::bitmap::Bitmap;
use crate::mmap::MmapManager;

pub struct DirtyArena {
    page_size: usize,
    buffers: Vec<Vec<u8>>,
    slots: Bitmap,
    index: HashMap<u64, usize>,
}

const INITIAL_SLOTS: usize = 64;

impl DirtyArena {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            buffers: (0..INITIAL_SLOTS).map(|_| vec![0u8; page_size]).collect(),
            slots: Bitmap::new(INITIAL_SLOTS),
            index: HashMap::new(),
        }
    }

    pub fn is_dirty(&self, pgno: u64) -> bool {
        self.index.contains_key(&pgno)
    }

    pub fn get(&self, pgno: u64) -> Option<&[u8]> {
        self.index.get(&pgno).map(|&slot| self.buffers[slot].as_slice())
    }

    pub fn get_mut(&mut self, pgno: u64) -> Option<&mut [u8]> {
        let slot = *self.index.get(&pgno)?;
        Some(self.buffers[slot].as_mut_slice())
    }

    fn claim_slot(&mut self) -> usize {
        if let Some(slot) = self.slots.allocate() {
            return slot;
        }
        let new_cap = self.slots.capacity() * 2;
        self.slots.extend(new_cap);
        self.buffers.resize_with(new_cap, || vec![0u8; self.page_size]);
        self.slots.allocate().expect("just extended")
    }

    /// Return the dirty buffer for `pgno`, copying it from `source` (the
    /// mmap's current on-disk contents) if this is the first time the
    /// transaction has touched it.
    pub fn shadow(&mut self, pgno: u64, source: &[u8]) -> &mut [u8] {
        if let Some(&slot) = self.index.get(&pgno) {
            return self.buffers[slot].as_mut_slice();
        }
        let slot = self.claim_slot();
        self.buffers[slot].copy_from_slice(source);
        self.index.insert(pgno, slot);
        self.buffers[slot].as_mut_slice()
    }

    /// Shadow a brand-new page (no prior on-disk contents to copy).
    pub fn shadow_fresh(&mut self, pgno: u64) -> &mut [u8] {
        let slot = self.claim_slot();
        self.buffers[slot].iter_mut().for_each(|b| *b = 0);
        self.index.insert(pgno, slot);
        self.buffers[slot].as_mut_slice()
    }

    /// Drop a page's shadow without writing it out — used when a page
    /// allocated earlier in the same transaction is freed again before
    /// commit.
    pub fn discard(&mut self, pgno: u64) {
        if let Some(slot) = self.index.remove(&pgno) {
            self.slots.free(slot);
        }
    }

    pub fn dirty_pgnos(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Read a page, preferring the dirty shadow over the mmap.
    pub fn read<'a>(&'a self, pgno: u64, mmap: &'a MmapManager) -> &'a [u8] {
        self.get(pgno).unwrap_or_else(|| mmap.page_ptr(pgno))
    }

    /// Release all shadows, e.g. on abort or after a successful flush.
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_then_read_prefers_dirty() {
        let mut arena = DirtyArena::new(64);
        let source = vec![0xAAu8; 64];
        {
            let buf = arena.shadow(3, &source);
            buf[0] = 0xFF;
        }
        assert_eq!(arena.get(3).unwrap()[0], 0xFF);
        assert_eq!(arena.get(3).unwrap()[1], 0xAA);
    }

    #[test]
    fn discard_frees_slot_for_reuse() {
        let mut arena = DirtyArena::new(16);
        arena.shadow_fresh(10);
        assert!(arena.is_dirty(10));
        arena.discard(10);
        assert!(!arena.is_dirty(10));
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn grows_past_initial_slots() {
        let mut arena = DirtyArena::new(8);
        for pgno in 0..(INITIAL_SLOTS as u64 + 10) {
            arena.shadow_fresh(pgno);
        }
        assert_eq!(arena.len(), INITIAL_SLOTS + 10);
    }
}
