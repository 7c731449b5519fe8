//! Hash-to-slot index.

use rustc_hash::FxHashMap;

use crate::hash::StateHash;

/// Pool slot recorded for a hash, with the slot generation seen at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub slot: usize,
    pub generation: u64,
}

/// Maps latent-state hashes to pool slots. Last write wins.
///
/// Entries are only removed wholesale by [`StateHashIndex::clear`]; an entry
/// whose slot was since overwritten keeps pointing at the new content.
#[derive(Debug, Clone, Default)]
pub struct StateHashIndex {
    entries: FxHashMap<StateHash, SlotRef>,
}

impl StateHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `slot` under `hash`, returning the entry it replaced.
    pub fn insert(&mut self, hash: StateHash, slot: SlotRef) -> Option<SlotRef> {
        self.entries.insert(hash, slot)
    }

    pub fn get(&self, hash: StateHash) -> Option<SlotRef> {
        self.entries.get(&hash).copied()
    }

    pub fn contains(&self, hash: StateHash) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
