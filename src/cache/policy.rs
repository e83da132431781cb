//! Eviction policy: decides which slot makes room for a new entry.
//!
//! The policy is a closed set of variants dispatched through one `match`.
//! Ranking inputs live in the slot metadata (importance, pinned flag,
//! insertion order), so the policy itself only carries its parameters.
//!
//! Every variant obeys the same two rules:
//! - a pinned slot is never chosen while an unpinned slot exists;
//! - equally eligible candidates resolve to the smallest logical position.

use std::cmp::Ordering;

use serde::Serialize;

use crate::cache::entry::{Position, TokenKv};
use crate::cache::store::{SlotMeta, SlotRef, SlotStore};
use crate::config::{EvictionStrategy, LayerCacheConfig};

/// Outcome of admitting one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored in a previously free slot.
    Inserted { slot: usize },
    /// Stored over an evicted entry.
    Replaced { slot: usize, evicted: Position },
    /// Not stored. Generation continues without this entry.
    Dropped(DropReason),
}

impl Admission {
    pub fn is_dropped(&self) -> bool {
        matches!(self, Admission::Dropped(_))
    }

    /// Slot the entry landed in, if it was stored.
    pub fn slot(&self) -> Option<usize> {
        match self {
            Admission::Inserted { slot } | Admission::Replaced { slot, .. } => Some(*slot),
            Admission::Dropped(_) => None,
        }
    }
}

/// Why an admission was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Full-retention cache reached capacity.
    CapacityExhausted,
    /// Every occupied slot is protected from eviction.
    AllProtected,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::CapacityExhausted => write!(f, "capacity exhausted"),
            DropReason::AllProtected => write!(f, "all slots protected"),
        }
    }
}

/// The eviction policy for one store.
#[derive(Debug, Clone, PartialEq)]
pub enum EvictionPolicy {
    /// No eviction. Admissions past capacity are rejected.
    Full,
    /// Evict the oldest unpinned entry.
    Window,
    /// As `Window`, with special and punctuation tokens pinned.
    Special,
    /// Evict the unpinned entry with the lowest attention EMA.
    HeavyHitter { decay: f32 },
    /// Protect pinned entries and the last `recent_window` positions; rank
    /// the rest by attention EMA.
    Hybrid { recent_window: usize, decay: f32 },
    /// Evict the unpinned entry with the largest key norm.
    KeyNorm,
}

impl EvictionPolicy {
    /// Build a policy from its identifier and the layer's parameters.
    pub fn new(strategy: EvictionStrategy, config: &LayerCacheConfig) -> Self {
        let decay = config.attention_ema_decay;
        match strategy {
            EvictionStrategy::Full => EvictionPolicy::Full,
            EvictionStrategy::Window => EvictionPolicy::Window,
            EvictionStrategy::Special => EvictionPolicy::Special,
            EvictionStrategy::HeavyHitter => EvictionPolicy::HeavyHitter { decay },
            EvictionStrategy::Hybrid => EvictionPolicy::Hybrid {
                recent_window: config.recent_window,
                decay,
            },
            EvictionStrategy::KeyNorm => EvictionPolicy::KeyNorm,
        }
    }

    pub fn strategy(&self) -> EvictionStrategy {
        match self {
            EvictionPolicy::Full => EvictionStrategy::Full,
            EvictionPolicy::Window => EvictionStrategy::Window,
            EvictionPolicy::Special => EvictionStrategy::Special,
            EvictionPolicy::HeavyHitter { .. } => EvictionStrategy::HeavyHitter,
            EvictionPolicy::Hybrid { .. } => EvictionStrategy::Hybrid,
            EvictionPolicy::KeyNorm => EvictionStrategy::KeyNorm,
        }
    }

    /// Whether post-attention weights must be computed and fed back.
    pub fn needs_attention_weights(&self) -> bool {
        matches!(
            self,
            EvictionPolicy::HeavyHitter { .. } | EvictionPolicy::Hybrid { .. }
        )
    }

    /// Whether marker tokens (special, punctuation) are pinned at admission.
    /// Global-prefix pinning applies to every variant.
    pub fn pins_markers(&self) -> bool {
        matches!(self, EvictionPolicy::Special | EvictionPolicy::Hybrid { .. })
    }

    /// Drop reason reported when [`select_victim`](Self::select_victim) finds nothing.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            EvictionPolicy::Full => DropReason::CapacityExhausted,
            _ => DropReason::AllProtected,
        }
    }

    /// Choose the slot to overwrite for `candidate` in a full store.
    ///
    /// `None` means the candidate must be dropped.
    pub fn select_victim(&self, store: &SlotStore, candidate: &TokenKv) -> Option<usize> {
        let unpinned = |s: &SlotRef<'_>| !s.meta.pinned;
        match self {
            EvictionPolicy::Full => None,
            EvictionPolicy::Window | EvictionPolicy::Special => {
                min_slot(store, unpinned, |a, b| a.inserted_at.cmp(&b.inserted_at))
            }
            EvictionPolicy::HeavyHitter { .. } => min_slot(store, unpinned, by_importance),
            EvictionPolicy::Hybrid { recent_window, .. } => {
                let recent =
                    |m: &SlotMeta| m.position.saturating_add(*recent_window) > candidate.position;
                min_slot(store, |s| unpinned(s) && !recent(s.meta), by_importance)
                    // Protected entries outnumber capacity: give up recency before pins.
                    .or_else(|| min_slot(store, unpinned, by_importance))
            }
            EvictionPolicy::KeyNorm => {
                min_slot(store, unpinned, |a, b| b.importance.total_cmp(&a.importance))
            }
        }
    }

    /// Called after `slot` received a new entry.
    pub fn on_admit(&self, store: &mut SlotStore, slot: usize) {
        if let EvictionPolicy::KeyNorm = self {
            let norm = store.key(slot).iter().map(|x| x.to_f32() * x.to_f32()).sum::<f32>();
            store.set_importance(slot, norm.sqrt());
        }
    }

    /// Fold one step of attention weights (slot-indexed) into importance.
    ///
    /// The EMA is bias-corrected: an entry's first observation replaces its
    /// zero start, so a decode token competes on the attention it actually
    /// drew rather than on `(1 - decay) × w`. No-op for policies that do not
    /// track attention.
    pub fn on_feedback(&self, store: &mut SlotStore, weights: &[f32]) {
        let decay = match self {
            EvictionPolicy::HeavyHitter { decay } | EvictionPolicy::Hybrid { decay, .. } => *decay,
            _ => return,
        };
        for (slot, &w) in weights.iter().enumerate().take(store.capacity()) {
            if let Some(meta) = store.meta(slot) {
                let updated = if meta.observed == 0 {
                    w
                } else {
                    decay * meta.importance + (1.0 - decay) * w
                };
                store.record_observation(slot, updated);
            }
        }
    }
}

fn by_importance(a: &SlotMeta, b: &SlotMeta) -> Ordering {
    a.importance.total_cmp(&b.importance)
}

/// Smallest eligible slot under `order`, ties broken by smallest position.
fn min_slot(
    store: &SlotStore,
    eligible: impl Fn(&SlotRef<'_>) -> bool,
    order: impl Fn(&SlotMeta, &SlotMeta) -> Ordering,
) -> Option<usize> {
    store
        .occupied_slots()
        .filter(|s| eligible(s))
        .min_by(|a, b| order(a.meta, b.meta).then(a.meta.position.cmp(&b.meta.position)))
        .map(|s| s.slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheEntry;

    fn token(pos: usize) -> TokenKv {
        TokenKv::new(pos, None, vec![pos as f32], vec![0.0])
    }

    fn fill(store: &mut SlotStore, entries: &[(usize, f32, bool)]) {
        for (slot, &(pos, importance, pinned)) in entries.iter().enumerate() {
            let mut e = CacheEntry::from_token(&token(pos), pinned, importance, pos as u64);
            e.observed = 1;
            store.admit(e, slot);
        }
    }

    #[test]
    fn test_full_rejects() {
        let mut store = SlotStore::new(2, 1);
        fill(&mut store, &[(0, 0.0, false), (1, 0.0, false)]);
        assert_eq!(EvictionPolicy::Full.select_victim(&store, &token(2)), None);
        assert_eq!(EvictionPolicy::Full.drop_reason(), DropReason::CapacityExhausted);
    }

    #[test]
    fn test_window_skips_pinned() {
        let mut store = SlotStore::new(3, 1);
        fill(&mut store, &[(0, 0.0, true), (1, 0.0, false), (2, 0.0, false)]);
        assert_eq!(EvictionPolicy::Window.select_victim(&store, &token(3)), Some(1));
    }

    #[test]
    fn test_heavy_hitter_lowest_score() {
        let mut store = SlotStore::new(3, 1);
        fill(&mut store, &[(0, 0.5, false), (1, 0.1, false), (2, 0.9, false)]);
        let policy = EvictionPolicy::HeavyHitter { decay: 0.9 };
        assert_eq!(policy.select_victim(&store, &token(3)), Some(1));
    }

    #[test]
    fn test_heavy_hitter_tie_breaks_by_position() {
        let mut store = SlotStore::new(3, 1);
        // Slot order differs from position order.
        fill(&mut store, &[(9, 0.2, false), (4, 0.2, false), (6, 0.2, false)]);
        let policy = EvictionPolicy::HeavyHitter { decay: 0.9 };
        assert_eq!(policy.select_victim(&store, &token(10)), Some(1));
    }

    #[test]
    fn test_hybrid_protects_recent_window() {
        let mut store = SlotStore::new(4, 1);
        fill(
            &mut store,
            &[(0, 0.9, false), (1, 0.5, false), (2, 0.0, false), (3, 0.0, false)],
        );
        let policy = EvictionPolicy::Hybrid {
            recent_window: 3,
            decay: 0.9,
        };
        // Positions 2 and 3 fall in the window ending at 4; slot 1 has the lowest
        // score outside it.
        assert_eq!(policy.select_victim(&store, &token(4)), Some(1));
    }

    #[test]
    fn test_hybrid_prefers_pins_over_recency() {
        let mut store = SlotStore::new(3, 1);
        fill(&mut store, &[(0, 0.0, true), (1, 0.3, false), (2, 0.1, false)]);
        let policy = EvictionPolicy::Hybrid {
            recent_window: 8,
            decay: 0.9,
        };
        assert_eq!(policy.select_victim(&store, &token(3)), Some(2));
    }

    #[test]
    fn test_all_pinned_yields_none() {
        let mut store = SlotStore::new(2, 1);
        fill(&mut store, &[(0, 0.0, true), (1, 0.0, true)]);
        for policy in [
            EvictionPolicy::Window,
            EvictionPolicy::Special,
            EvictionPolicy::HeavyHitter { decay: 0.5 },
            EvictionPolicy::Hybrid {
                recent_window: 1,
                decay: 0.5,
            },
            EvictionPolicy::KeyNorm,
        ] {
            assert_eq!(policy.select_victim(&store, &token(2)), None);
            assert_eq!(policy.drop_reason(), DropReason::AllProtected);
        }
    }

    #[test]
    fn test_feedback_ema() {
        let mut store = SlotStore::new(2, 1);
        fill(&mut store, &[(0, 1.0, false)]);
        let policy = EvictionPolicy::HeavyHitter { decay: 0.9 };
        policy.on_feedback(&mut store, &[0.0, 5.0]);
        assert!((store.meta(0).unwrap().importance - 0.9).abs() < 1e-6);
        // Invalid slot 1 is untouched.
        assert!(store.meta(1).is_none());

        EvictionPolicy::Window.on_feedback(&mut store, &[1.0, 1.0]);
        assert!((store.meta(0).unwrap().importance - 0.9).abs() < 1e-6);
        assert_eq!(store.meta(0).unwrap().observed, 2);
    }

    #[test]
    fn test_first_feedback_replaces_zero_start() {
        let mut store = SlotStore::new(2, 1);
        store.admit(CacheEntry::from_token(&token(0), false, 0.0, 0), 0);
        let policy = EvictionPolicy::HeavyHitter { decay: 0.9 };
        policy.on_feedback(&mut store, &[0.25, 0.0]);
        assert_eq!(store.meta(0).unwrap().importance, 0.25);
        assert_eq!(store.meta(0).unwrap().observed, 1);

        policy.on_feedback(&mut store, &[0.05, 0.0]);
        assert!((store.meta(0).unwrap().importance - 0.23).abs() < 1e-6);
    }

    #[test]
    fn test_hybrid_huge_window_does_not_overflow() {
        let mut store = SlotStore::new(3, 1);
        fill(&mut store, &[(0, 0.0, true), (1, 0.3, false), (2, 0.1, false)]);
        let policy = EvictionPolicy::Hybrid {
            recent_window: usize::MAX,
            decay: 0.9,
        };
        // Everything unpinned is recent, so recency gives way to the score.
        assert_eq!(policy.select_victim(&store, &token(3)), Some(2));
    }

    #[test]
    fn test_key_norm_evicts_largest() {
        let mut store = SlotStore::new(3, 1);
        fill(&mut store, &[(0, 0.0, false), (3, 0.0, false), (1, 0.0, false)]);
        let policy = EvictionPolicy::KeyNorm;
        for slot in 0..3 {
            policy.on_admit(&mut store, slot);
        }
        assert_eq!(policy.select_victim(&store, &token(4)), Some(1));
    }

    #[test]
    fn test_capabilities() {
        assert!(!EvictionPolicy::Window.needs_attention_weights());
        assert!(EvictionPolicy::HeavyHitter { decay: 0.5 }.needs_attention_weights());
        assert!(EvictionPolicy::Special.pins_markers());
        assert!(!EvictionPolicy::HeavyHitter { decay: 0.5 }.pins_markers());
    }
}
