//! Blocks waiting for their parent.
//!
//! A fixed ring of slots. When full, the oldest orphan is overwritten.
//! Removing an orphan shifts the older ones up one slot so the ring stays
//! contiguous; the touched slots are reported for persistence.

use crate::core::params::MAX_ORPHAN_CACHE;
use crate::core::types::{Block, Hash256};

#[derive(Debug, Clone)]
pub struct OrphanPool {
    slots: Vec<Option<Block>>,
    first: usize,
    len: usize,
}

impl Default for OrphanPool {
    fn default() -> Self {
        OrphanPool { slots: vec![None; MAX_ORPHAN_CACHE], first: 0, len: 0 }
    }
}

impl OrphanPool {
    /// Rebuild from persisted slots.
    pub fn restore(first: usize, blocks: Vec<(usize, Block)>) -> Self {
        let mut pool = OrphanPool { first: first % MAX_ORPHAN_CACHE, ..Default::default() };
        pool.len = blocks.len().min(MAX_ORPHAN_CACHE);
        for (slot, block) in blocks {
            if slot < MAX_ORPHAN_CACHE {
                pool.slots[slot] = Some(block);
            }
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> usize {
        self.first
    }

    fn physical(&self, position: usize) -> usize {
        (self.first + position) % MAX_ORPHAN_CACHE
    }

    pub fn slot(&self, slot: usize) -> Option<&Block> {
        self.slots.get(slot)?.as_ref()
    }

    /// Occupied slot numbers, oldest first.
    pub fn occupied_slots(&self) -> Vec<usize> {
        (0..self.len).map(|p| self.physical(p)).collect()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.iter().any(|b| b.hash() == *hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        (0..self.len).filter_map(move |p| self.slots[self.physical(p)].as_ref())
    }

    /// Add a block, returning its slot and the orphan it displaced.
    pub fn push(&mut self, block: Block) -> (usize, Option<Block>) {
        if self.len == MAX_ORPHAN_CACHE {
            let slot = self.first;
            let evicted = self.slots[slot].replace(block);
            self.first = (self.first + 1) % MAX_ORPHAN_CACHE;
            (slot, evicted)
        } else {
            let slot = self.physical(self.len);
            self.slots[slot] = Some(block);
            self.len += 1;
            (slot, None)
        }
    }

    /// Position (age order) of the oldest orphan whose parent is `parent`.
    pub fn find_child(&self, parent: &Hash256) -> Option<usize> {
        (0..self.len).find(|p| self.slots[self.physical(*p)].as_ref().map_or(false, |b| b.prev_hash() == parent))
    }

    /// Remove the orphan at `position`, returning it with every slot whose
    /// content changed.
    pub fn remove(&mut self, position: usize) -> Option<(Block, Vec<usize>)> {
        if position >= self.len {
            return None;
        }
        let target = self.physical(position);
        let block = self.slots[target].take()?;
        let mut touched = vec![target];
        for p in (0..position).rev() {
            let from = self.physical(p);
            let to = self.physical(p + 1);
            self.slots[to] = self.slots[from].take();
            touched.push(from);
        }
        self.first = (self.first + 1) % MAX_ORPHAN_CACHE;
        self.len -= 1;
        if self.len == 0 {
            self.first = 0;
        }
        touched.sort_unstable();
        touched.dedup();
        Some((block, touched))
    }
}
