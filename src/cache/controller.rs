//! Cache controller: the per-store state machine.
//!
//! A controller owns one slot store together with its eviction policy and
//! prompt compressor. It admits the prompt in bulk once per session, then
//! one token per decode step, and folds attention feedback back into the
//! policy when the policy asks for it.
//!
//! ```text
//! EMPTY --bulk_admit--> PREFILLED --admit_one--> STREAMING --admit_one--> STREAMING
//!   ^                                                                        |
//!   +------------------------------- reset ----------------------------------+
//! ```

use std::collections::HashSet;

use half::f16;
use tracing::{debug, error, info, warn};

use crate::cache::compressor::{check_selection, CompressedPrompt, PromptCompressor};
use crate::cache::entry::{CacheEntry, PinRule, Position, TokenId, TokenKv};
use crate::cache::policy::{Admission, EvictionPolicy};
use crate::cache::scores::AttentionMatrix;
use crate::cache::store::SlotStore;
use crate::config::{EvictionStrategy, LayerCacheConfig};
use crate::error::{CacheError, Result};
use crate::stats::CacheStatistics;

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    Prefilled,
    Streaming,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Empty => "empty",
            CacheState::Prefilled => "prefilled",
            CacheState::Streaming => "streaming",
        }
    }
}

/// Outcome of a bulk admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefillSummary {
    pub prompt_len: usize,
    pub kept: usize,
    pub compressed: bool,
}

/// What the attention computation sees before a step: every slot's buffers
/// plus the mask of slots it may attend to.
#[derive(Debug, Clone, Copy)]
pub struct CacheView<'a> {
    /// Slot-major keys; empty while the store holds no buffers.
    pub keys: &'a [f16],
    pub values: &'a [f16],
    pub mask: &'a [bool],
    pub width: usize,
}

impl<'a> CacheView<'a> {
    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|v| **v).count()
    }

    /// Key of `slot`. Only meaningful where the mask is set.
    pub fn key(&self, slot: usize) -> &'a [f16] {
        &self.keys[slot * self.width..(slot + 1) * self.width]
    }

    pub fn value(&self, slot: usize) -> &'a [f16] {
        &self.values[slot * self.width..(slot + 1) * self.width]
    }

    /// Slots the attention computation may read.
    pub fn valid_slots(&self) -> impl Iterator<Item = usize> + 'a {
        let mask = self.mask;
        mask.iter().enumerate().filter(|(_, v)| **v).map(|(i, _)| i)
    }
}

/// Per-store cache controller.
#[derive(Debug)]
pub struct CacheController {
    store: SlotStore,
    policy: EvictionPolicy,
    compressor: PromptCompressor,
    pins: PinRule,
    state: CacheState,

    /// Last position handed to this controller in the current session.
    last_position: Option<Position>,
    next_insertion: u64,
    evictions: u64,
    drops: u64,

    layer: usize,
    head: Option<usize>,
}

impl CacheController {
    /// Build a controller for one store.
    ///
    /// `width` is the number of floats per key; `head` is `None` for a store
    /// shared by all heads of the layer.
    pub fn new(
        config: &LayerCacheConfig,
        eviction: EvictionStrategy,
        width: usize,
        markers: HashSet<TokenId>,
        layer: usize,
        head: Option<usize>,
    ) -> Self {
        Self {
            store: SlotStore::new(config.capacity, width),
            policy: EvictionPolicy::new(eviction, config),
            compressor: PromptCompressor::new(config.compression, config),
            pins: PinRule::new(config.global_tokens, markers),
            state: CacheState::Empty,
            last_position: None,
            next_insertion: 0,
            evictions: 0,
            drops: 0,
            layer,
            head,
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn occupied(&self) -> usize {
        self.store.occupied()
    }

    pub fn width(&self) -> usize {
        self.store.width()
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    pub fn compressor(&self) -> &PromptCompressor {
        &self.compressor
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    /// Whether this cache variant ever consumes attention weights.
    pub fn needs_attention_weights(&self) -> bool {
        self.policy.needs_attention_weights() || self.compressor.needs_attention_weights()
    }

    /// Whether prompt attention is needed for a prompt of `prompt_len` tokens.
    ///
    /// False when the prompt fits and the policy ignores feedback, so the
    /// caller can skip computing the prompt score matrix entirely.
    pub fn needs_prompt_attention(&self, prompt_len: usize) -> bool {
        self.policy.needs_attention_weights()
            || (self.overflow(prompt_len) && self.compressor.needs_attention_weights())
    }

    /// Whether a prompt of `prompt_len` tokens will be compressed.
    pub fn overflow(&self, prompt_len: usize) -> bool {
        prompt_len > self.store.capacity()
    }

    fn is_pinned(&self, token: &TokenKv) -> bool {
        self.pins
            .check(token.position, token.token_id, self.policy.pins_markers())
    }

    fn check_width(&self, token: &TokenKv) -> Result<()> {
        let width = self.store.width();
        for found in [token.key.len(), token.value.len()] {
            if found != width {
                return Err(CacheError::ShapeMismatch {
                    expected: width,
                    found,
                });
            }
        }
        Ok(())
    }

    fn check_position(&self, position: Position) -> Result<()> {
        match self.last_position {
            Some(last) if position <= last => {
                Err(CacheError::NonMonotonicPosition { last, got: position })
            }
            _ => Ok(()),
        }
    }

    /// `seeded` marks an importance taken from prompt attention, which counts
    /// as one observation.
    fn store_entry(&mut self, token: &TokenKv, importance: f32, seeded: bool, slot: usize) {
        let mut entry =
            CacheEntry::from_token(token, self.is_pinned(token), importance, self.next_insertion);
        entry.observed = u32::from(seeded);
        self.next_insertion += 1;
        self.store.admit(entry, slot);
        self.policy.on_admit(&mut self.store, slot);
    }

    /// Admit the whole prompt, compressing it first if it exceeds capacity.
    ///
    /// `attention` is the causal prompt attention for this store. It is
    /// required only when [`needs_prompt_attention`](Self::needs_prompt_attention)
    /// says so, and seeds importance scores when present.
    pub fn bulk_admit(
        &mut self,
        prompt: &[TokenKv],
        attention: Option<&AttentionMatrix>,
    ) -> Result<PrefillSummary> {
        if self.state != CacheState::Empty {
            return Err(CacheError::InvalidTransition {
                state: self.state.as_str(),
                op: "bulk admit",
            });
        }
        if prompt.is_empty() {
            return Err(CacheError::EmptyPrompt);
        }
        for (i, token) in prompt.iter().enumerate() {
            self.check_width(token)?;
            if i > 0 && token.position <= prompt[i - 1].position {
                return Err(CacheError::NonMonotonicPosition {
                    last: prompt[i - 1].position,
                    got: token.position,
                });
            }
        }

        let capacity = self.store.capacity();
        let compressed = self.overflow(prompt.len());
        let selected = if compressed {
            let strategy = self.compressor.strategy();
            let out = self.compressor.compress(prompt, attention, capacity, &self.pins)?;
            if let Err(e) = check_selection(strategy, &out.positions(), capacity) {
                error!(layer = self.layer, head = ?self.head, %strategy, "Prompt compressor broke its contract: {e}");
                return Err(e);
            }
            info!(
                layer = self.layer,
                head = ?self.head,
                %strategy,
                prompt_len = prompt.len(),
                kept = out.len(),
                "Compressed prompt"
            );
            out
        } else {
            // Fits as-is: no compressor call, only importance seeding.
            let importance = match attention {
                Some(a) => {
                    let means = a.column_means();
                    if means.len() != prompt.len() {
                        return Err(CacheError::ShapeMismatch {
                            expected: prompt.len(),
                            found: means.len(),
                        });
                    }
                    means
                }
                None => vec![0.0; prompt.len()],
            };
            CompressedPrompt {
                tokens: prompt.to_vec(),
                importance,
            }
        };

        let seeded = attention.is_some();
        for (slot, (token, &importance)) in selected
            .tokens
            .iter()
            .zip(&selected.importance)
            .enumerate()
        {
            self.store_entry(token, importance, seeded, slot);
        }

        self.last_position = prompt.last().map(|t| t.position);
        self.state = CacheState::Prefilled;

        Ok(PrefillSummary {
            prompt_len: prompt.len(),
            kept: selected.len(),
            compressed,
        })
    }

    /// Admit one decode-step token.
    ///
    /// Fills the lowest free slot while one exists; afterwards the policy picks
    /// a victim or the token is dropped.
    pub fn admit_one(&mut self, token: TokenKv) -> Result<Admission> {
        if self.state == CacheState::Empty {
            return Err(CacheError::InvalidTransition {
                state: self.state.as_str(),
                op: "admit a decode token",
            });
        }
        self.check_width(&token)?;
        self.check_position(token.position)?;

        self.last_position = Some(token.position);
        self.state = CacheState::Streaming;

        if let Some(slot) = self.store.first_free() {
            self.store_entry(&token, 0.0, false, slot);
            return Ok(Admission::Inserted { slot });
        }

        match self.policy.select_victim(&self.store, &token) {
            Some(slot) => {
                let evicted = self.store.meta(slot).map(|m| m.position).unwrap_or_default();
                self.store.evict(slot);
                self.store_entry(&token, 0.0, false, slot);
                self.evictions += 1;
                debug!(
                    layer = self.layer,
                    head = ?self.head,
                    slot,
                    evicted,
                    admitted = token.position,
                    "Evicted entry"
                );
                Ok(Admission::Replaced { slot, evicted })
            }
            None => {
                let reason = self.policy.drop_reason();
                self.drops += 1;
                warn!(
                    layer = self.layer,
                    head = ?self.head,
                    position = token.position,
                    %reason,
                    "Dropped admission"
                );
                Ok(Admission::Dropped(reason))
            }
        }
    }

    /// Feed one step of slot-indexed attention weights back to the policy.
    pub fn feedback(&mut self, weights: &[f32]) -> Result<()> {
        if self.state == CacheState::Empty {
            return Err(CacheError::InvalidTransition {
                state: self.state.as_str(),
                op: "apply attention feedback",
            });
        }
        if weights.len() != self.store.capacity() {
            return Err(CacheError::ShapeMismatch {
                expected: self.store.capacity(),
                found: weights.len(),
            });
        }
        self.policy.on_feedback(&mut self.store, weights);
        Ok(())
    }

    /// Buffers and validity mask for the next attention call.
    pub fn view(&self) -> CacheView<'_> {
        CacheView {
            keys: self.store.keys(),
            values: self.store.values(),
            mask: self.store.mask(),
            width: self.store.width(),
        }
    }

    /// Valid entries ordered by position.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.store.snapshot()
    }

    /// Clear every slot, counter, and policy score.
    pub fn reset(&mut self) {
        self.store.clear();
        self.state = CacheState::Empty;
        self.last_position = None;
        self.next_insertion = 0;
        self.evictions = 0;
        self.drops = 0;
    }

    /// Occupancy and footprint for a sequence of `seq_len` tokens so far.
    pub fn statistics(&self, seq_len: usize) -> CacheStatistics {
        let occupied = self.store.occupied();
        CacheStatistics {
            occupied,
            capacity: self.store.capacity(),
            retention: if seq_len == 0 {
                0.0
            } else {
                occupied as f64 / seq_len as f64
            },
            memory_bytes: self.store.memory_bytes(),
            evictions: self.evictions,
            drops: self.drops,
        }
    }
}
