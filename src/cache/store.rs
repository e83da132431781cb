//! Fixed-capacity slot store.
//!
//! Keys and values live in flat half-precision buffers of `capacity × width`
//! elements. Per-slot metadata runs in parallel, and a validity mask marks
//! which slots hold live entries. Eviction only flips the mask; stale buffer
//! contents behind an invalid slot must never be attended to.

use half::f16;

use crate::cache::entry::{CacheEntry, Position, TokenId};

/// Metadata for one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlotMeta {
    pub position: Position,
    pub token_id: Option<TokenId>,
    pub importance: f32,
    pub pinned: bool,
    pub inserted_at: u64,
    /// Attention observations folded into `importance`.
    pub observed: u32,
}

/// Borrowed view of an occupied slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotRef<'a> {
    pub slot: usize,
    pub meta: &'a SlotMeta,
    pub key: &'a [f16],
}

/// Per-store storage for key/value entries.
#[derive(Debug)]
pub struct SlotStore {
    capacity: usize,

    /// Floats per key (and per value).
    width: usize,

    /// Empty until the first admission after a reset.
    keys: Vec<f16>,
    values: Vec<f16>,
    meta: Vec<SlotMeta>,
    valid: Vec<bool>,

    occupied: usize,
}

impl SlotStore {
    /// Create an empty store. No buffers are allocated yet.
    pub fn new(capacity: usize, width: usize) -> Self {
        Self {
            capacity,
            width,
            keys: Vec::new(),
            values: Vec::new(),
            meta: Vec::new(),
            valid: vec![false; capacity],
            occupied: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of valid slots.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    pub fn is_full(&self) -> bool {
        self.occupied >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Whether the key/value buffers are currently allocated.
    pub fn is_allocated(&self) -> bool {
        !self.keys.is_empty()
    }

    fn allocate(&mut self) {
        let elems = self.capacity * self.width;
        self.keys = vec![f16::ZERO; elems];
        self.values = vec![f16::ZERO; elems];
        self.meta = vec![SlotMeta::default(); self.capacity];
    }

    /// Overwrite `slot` with `entry` and mark it valid.
    ///
    /// Capacity enforcement is the caller's job.
    pub fn admit(&mut self, entry: CacheEntry, slot: usize) {
        debug_assert!(slot < self.capacity);
        debug_assert_eq!(entry.key.len(), self.width);
        debug_assert_eq!(entry.value.len(), self.width);

        if !self.is_allocated() {
            self.allocate();
        }

        let range = slot * self.width..(slot + 1) * self.width;
        self.keys[range.clone()].copy_from_slice(&entry.key);
        self.values[range].copy_from_slice(&entry.value);
        self.meta[slot] = SlotMeta {
            position: entry.position,
            token_id: entry.token_id,
            importance: entry.importance,
            pinned: entry.pinned,
            inserted_at: entry.inserted_at,
            observed: entry.observed,
        };

        if !self.valid[slot] {
            self.valid[slot] = true;
            self.occupied += 1;
        }
    }

    /// Mark `slot` invalid. Buffer contents are left in place.
    pub fn evict(&mut self, slot: usize) {
        if self.valid[slot] {
            self.valid[slot] = false;
            self.occupied -= 1;
        }
    }

    /// Lowest-indexed free slot, if any.
    pub fn first_free(&self) -> Option<usize> {
        self.valid.iter().position(|v| !v)
    }

    /// Valid entries ordered by logical position.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut out: Vec<CacheEntry> = self
            .occupied_slots()
            .map(|s| CacheEntry {
                position: s.meta.position,
                token_id: s.meta.token_id,
                key: s.key.to_vec(),
                value: self.value(s.slot).to_vec(),
                importance: s.meta.importance,
                pinned: s.meta.pinned,
                inserted_at: s.meta.inserted_at,
                observed: s.meta.observed,
            })
            .collect();
        out.sort_by_key(|e| e.position);
        out
    }

    /// Iterate over valid slots in slot order.
    pub fn occupied_slots(&self) -> impl Iterator<Item = SlotRef<'_>> + '_ {
        self.valid
            .iter()
            .enumerate()
            .filter(|(_, v)| **v)
            .map(move |(slot, _)| SlotRef {
                slot,
                meta: &self.meta[slot],
                key: self.key(slot),
            })
    }

    /// Positions of valid entries, ascending.
    pub fn positions(&self) -> Vec<Position> {
        let mut p: Vec<Position> = self.occupied_slots().map(|s| s.meta.position).collect();
        p.sort_unstable();
        p
    }

    pub fn is_valid(&self, slot: usize) -> bool {
        self.valid[slot]
    }

    /// Validity mask, one flag per slot.
    pub fn mask(&self) -> &[bool] {
        &self.valid
    }

    pub fn meta(&self, slot: usize) -> Option<&SlotMeta> {
        if self.valid[slot] {
            self.meta.get(slot)
        } else {
            None
        }
    }

    pub fn set_importance(&mut self, slot: usize, importance: f32) {
        if self.valid[slot] {
            self.meta[slot].importance = importance;
        }
    }

    /// Store a score derived from one more attention observation.
    pub fn record_observation(&mut self, slot: usize, importance: f32) {
        if self.valid[slot] {
            let meta = &mut self.meta[slot];
            meta.importance = importance;
            meta.observed = meta.observed.saturating_add(1);
        }
    }

    /// Key buffer for `slot`. Empty when unallocated.
    pub fn key(&self, slot: usize) -> &[f16] {
        if !self.is_allocated() {
            return &[];
        }
        &self.keys[slot * self.width..(slot + 1) * self.width]
    }

    pub fn value(&self, slot: usize) -> &[f16] {
        if !self.is_allocated() {
            return &[];
        }
        &self.values[slot * self.width..(slot + 1) * self.width]
    }

    /// Whole key buffer, slot-major. Empty when unallocated.
    pub fn keys(&self) -> &[f16] {
        &self.keys
    }

    pub fn values(&self) -> &[f16] {
        &self.values
    }

    /// Bytes held by the key and value buffers.
    pub fn memory_bytes(&self) -> usize {
        if self.is_allocated() {
            self.capacity * self.width * 2 * std::mem::size_of::<f16>()
        } else {
            0
        }
    }

    /// Drop every entry and release the buffers.
    pub fn clear(&mut self) {
        self.keys = Vec::new();
        self.values = Vec::new();
        self.meta = Vec::new();
        self.valid.iter_mut().for_each(|v| *v = false);
        self.occupied = 0;
    }
}
