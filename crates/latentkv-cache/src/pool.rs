//! Fixed-capacity ring of context slots.

use std::fmt;

use latentkv_kv::ContextCache;
use serde::Serialize;
use tracing::trace;

use crate::error::{CacheError, CacheResult};
use crate::index::SlotRef;

/// What a pool is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolClass {
    /// Most recent root contexts of one environment.
    Init,
    /// Contexts produced by simulation steps, shared across environments.
    Recurrent,
    /// Per-step copies awaiting batch assembly.
    Staging,
}

impl fmt::Display for PoolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolClass::Init => write!(f, "init"),
            PoolClass::Recurrent => write!(f, "recurrent"),
            PoolClass::Staging => write!(f, "staging"),
        }
    }
}

/// Pre-sized array of context slots reused in FIFO order.
///
/// A slot is allocated on its first write and overwritten in place after
/// that. Every write bumps a pool-wide generation counter and stamps the slot
/// with it, so holders of a [`SlotRef`] can tell whether the slot has been
/// reused since.
#[derive(Debug)]
pub struct Pool {
    class: PoolClass,
    slots: Vec<Option<ContextCache>>,
    generations: Vec<u64>,
    cursor: usize,
    writes: u64,
}

impl Pool {
    pub fn new(class: PoolClass, capacity: usize) -> CacheResult<Self> {
        if capacity == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "{class} pool needs at least one slot"
            )));
        }
        Ok(Self {
            class,
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            cursor: 0,
            writes: 0,
        })
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next store will write.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of slots written at least once.
    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Total stores since construction.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Deep-copy `src` into the slot at the cursor and advance the cursor.
    pub fn store(&mut self, src: &ContextCache) -> CacheResult<SlotRef> {
        let slot = self.cursor;
        match &mut self.slots[slot] {
            Some(dst) => src.clone_into(dst)?,
            empty => *empty = Some(src.clone()),
        }

        self.writes += 1;
        self.generations[slot] = self.writes;
        self.cursor = (self.cursor + 1) % self.slots.len();
        trace!(
            pool = %self.class,
            slot,
            generation = self.writes,
            size = src.size(),
            "stored context"
        );

        Ok(SlotRef {
            slot,
            generation: self.writes,
        })
    }

    pub fn load(&self, slot: usize) -> CacheResult<&ContextCache> {
        self.slots
            .get(slot)
            .ok_or(CacheError::IndexOutOfRange {
                index: slot,
                capacity: self.slots.len(),
            })?
            .as_ref()
            .ok_or(CacheError::UnpopulatedSlot { index: slot })
    }

    /// Generation stamped by the last write to `slot`, 0 if never written.
    pub fn generation(&self, slot: usize) -> Option<u64> {
        self.generations.get(slot).copied()
    }

    /// True if `slot_ref` still names the write it was taken from.
    pub fn is_current(&self, slot_ref: SlotRef) -> bool {
        self.generation(slot_ref.slot) == Some(slot_ref.generation)
    }

    pub fn memory_bytes(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(ContextCache::memory_bytes)
            .sum()
    }
}
