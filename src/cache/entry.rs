//! Cache entry types and pinning rules.
//!
//! An entry holds one token's key and value for one store (either a single
//! kv head, or every kv head of a layer in shared mode). Entries are the unit
//! of admission and eviction.

use std::collections::HashSet;

use half::f16;
use serde::{Deserialize, Serialize};

/// Logical sequence position. Assigned in original token order, never reused.
pub type Position = usize;

/// Token identifier as produced by the tokenizer.
pub type TokenId = u32;

/// An incoming token's key/value pair, as handed over by the attention layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenKv {
    /// Logical position of this token.
    pub position: Position,

    /// Token id, used by marker-based pinning.
    pub token_id: Option<TokenId>,

    /// Key vector (`width` floats).
    pub key: Vec<f32>,

    /// Value vector (`width` floats).
    pub value: Vec<f32>,
}

impl TokenKv {
    pub fn new(position: Position, token_id: Option<TokenId>, key: Vec<f32>, value: Vec<f32>) -> Self {
        Self {
            position,
            token_id,
            key,
            value,
        }
    }

    /// Squared L2 norm of the key.
    pub fn key_norm_sq(&self) -> f32 {
        self.key.iter().map(|x| x * x).sum()
    }
}

/// A cache entry as it lives in a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical position.
    pub position: Position,

    /// Token id, if known.
    pub token_id: Option<TokenId>,

    /// Key vector in half precision.
    pub key: Vec<f16>,

    /// Value vector in half precision.
    pub value: Vec<f16>,

    /// Importance score. Policy-defined, 0 by default.
    pub importance: f32,

    /// Pinned entries are never evicted while an unpinned entry exists.
    pub pinned: bool,

    /// Insertion order within the current session.
    pub inserted_at: u64,

    /// Attention observations folded into `importance`.
    #[serde(default)]
    pub observed: u32,
}

impl CacheEntry {
    /// Build an entry from an incoming token, converting to half precision.
    pub fn from_token(token: &TokenKv, pinned: bool, importance: f32, inserted_at: u64) -> Self {
        Self {
            position: token.position,
            token_id: token.token_id,
            key: token.key.iter().copied().map(f16::from_f32).collect(),
            value: token.value.iter().copied().map(f16::from_f32).collect(),
            importance,
            pinned,
            inserted_at,
            observed: 0,
        }
    }

    /// Squared L2 norm of the stored key.
    pub fn key_norm_sq(&self) -> f32 {
        self.key
            .iter()
            .map(|x| {
                let v = x.to_f32();
                v * v
            })
            .sum()
    }
}

/// Decides which tokens are pinned at admission.
#[derive(Debug, Clone, Default)]
pub struct PinRule {
    /// The first `global_tokens` positions are pinned (attention sinks).
    pub global_tokens: usize,

    /// Token ids pinned wherever they occur, for strategies that pin markers.
    pub markers: HashSet<TokenId>,
}

impl PinRule {
    pub fn new(global_tokens: usize, markers: HashSet<TokenId>) -> Self {
        Self {
            global_tokens,
            markers,
        }
    }

    /// Pin nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether a token at `position` with id `token_id` is pinned.
    pub fn is_pinned(&self, position: Position, token_id: Option<TokenId>) -> bool {
        if self.in_prefix(position) {
            return true;
        }
        match token_id {
            Some(id) => self.markers.contains(&id),
            None => false,
        }
    }

    /// Whether `position` falls in the pinned global prefix.
    pub fn in_prefix(&self, position: Position) -> bool {
        position < self.global_tokens
    }

    /// Pinning check, with marker pinning switched on or off.
    pub fn check(&self, position: Position, token_id: Option<TokenId>, markers: bool) -> bool {
        if markers {
            self.is_pinned(position, token_id)
        } else {
            self.in_prefix(position)
        }
    }
}
