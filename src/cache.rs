//! Bounded array-based LRU cache for recently touched entities.
//!
//! Grounded directly in the reference cache: linear scan over a fixed
//! array of slots, eviction picks an empty slot first and otherwise the
//! slot with the lowest monotonic `access_count`. A slot with `id == 0` is
//! empty; a non-empty slot with `op == Delete` is a *negative* entry that
//! answers `get`/`exists` as "known absent" without touching the WAL or
//! main file.

use std::any::Any;

/// The operation a cache entry last recorded, mirroring the WAL op tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOp {
    Add,
    Update,
    Delete,
}

struct CacheEntry {
    id: u32,
    type_index: u8,
    op: CacheOp,
    entity: Option<Box<dyn Any + Send + Sync>>,
    access_count: u64,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            id: 0,
            type_index: 0,
            op: CacheOp::Delete,
            entity: None,
            access_count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.id == 0
    }
}

/// Outcome of a cache lookup.
pub enum CacheLookup<'a> {
    /// Known-present with a materialized payload.
    Positive(&'a dyn Any),
    /// Known-absent (a DELETE was the last recorded operation).
    Negative,
    /// Not cached either way.
    Miss,
}

pub struct Cache {
    entries: Vec<CacheEntry>,
    capacity: usize,
    access_counter: u64,
    hits: usize,
    misses: usize,
}

/// Snapshot of cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: (0..capacity).map(|_| CacheEntry::empty()).collect(),
            capacity,
            access_counter: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn find(&self, type_index: u8, id: u32) -> Option<usize> {
        if id == 0 {
            return None;
        }
        self.entries
            .iter()
            .position(|e| e.id == id && e.type_index == type_index)
    }

    fn find_lru_slot(&self) -> usize {
        let mut lru_idx = 0;
        let mut min_access = u64::MAX;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.is_empty() {
                return i;
            }
            if entry.access_count < min_access {
                min_access = entry.access_count;
                lru_idx = i;
            }
        }
        lru_idx
    }

    pub fn get(&mut self, type_index: u8, id: u32) -> CacheLookup<'_> {
        if id == 0 {
            return CacheLookup::Miss;
        }
        match self.find(type_index, id) {
            Some(idx) => {
                self.access_counter += 1;
                self.entries[idx].access_count = self.access_counter;
                self.hits += 1;
                match (&self.entries[idx].op, &self.entries[idx].entity) {
                    (CacheOp::Delete, _) => CacheLookup::Negative,
                    (_, Some(entity)) => CacheLookup::Positive(entity.as_ref()),
                    (_, None) => CacheLookup::Miss,
                }
            }
            None => {
                self.misses += 1;
                CacheLookup::Miss
            }
        }
    }

    /// Insert or refresh an entry. `entity` is `None` for a negative
    /// (delete) entry.
    pub fn put(
        &mut self,
        type_index: u8,
        id: u32,
        entity: Option<Box<dyn Any + Send + Sync>>,
        op: CacheOp,
    ) {
        if id == 0 {
            return;
        }
        let idx = self
            .find(type_index, id)
            .unwrap_or_else(|| self.find_lru_slot());

        self.access_counter += 1;
        let slot = &mut self.entries[idx];
        slot.id = id;
        slot.type_index = type_index;
        slot.op = op;
        slot.access_count = self.access_counter;
        slot.entity = entity;
    }

    pub fn invalidate(&mut self, type_index: u8, id: u32) {
        if let Some(idx) = self.find(type_index, id) {
            self.entries[idx] = CacheEntry::empty();
        }
    }

    pub fn invalidate_all(&mut self) {
        for entry in &mut self.entries {
            *entry = CacheEntry::empty();
        }
    }

    pub fn clear(&mut self) {
        self.invalidate_all();
        self.hits = 0;
        self.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
