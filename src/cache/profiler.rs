//! Per-head strategy profiling.
//!
//! Given one head's attention over the prompt, each candidate strategy is
//! scored by the share of attention mass its kept set would retain under the
//! budget. The cheapest strategy reaching the recovery threshold wins; `full`
//! is the fallback. The resulting table feeds `head_strategies` for later
//! sessions.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::cache::entry::{TokenId, TokenKv};
use crate::cache::scores::AttentionMatrix;
use crate::config::{Config, EvictionStrategy};

/// Candidate strategies, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadStrategy {
    Special,
    SpecialPunc,
    SpecialPuncHeavyHitter,
    SpecialPuncWindowHeavyHitter,
    Full,
}

impl HeadStrategy {
    const CANDIDATES: [HeadStrategy; 4] = [
        HeadStrategy::Special,
        HeadStrategy::SpecialPunc,
        HeadStrategy::SpecialPuncHeavyHitter,
        HeadStrategy::SpecialPuncWindowHeavyHitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HeadStrategy::Special => "special",
            HeadStrategy::SpecialPunc => "special_punc",
            HeadStrategy::SpecialPuncHeavyHitter => "special_punc_heavy_hitter",
            HeadStrategy::SpecialPuncWindowHeavyHitter => "special_punc_window_heavy_hitter",
            HeadStrategy::Full => "full",
        }
    }

    /// Streaming policy that best approximates this selection.
    pub fn eviction(&self) -> EvictionStrategy {
        match self {
            HeadStrategy::Special | HeadStrategy::SpecialPunc => EvictionStrategy::Special,
            HeadStrategy::SpecialPuncHeavyHitter => EvictionStrategy::HeavyHitter,
            HeadStrategy::SpecialPuncWindowHeavyHitter => EvictionStrategy::Hybrid,
            HeadStrategy::Full => EvictionStrategy::Full,
        }
    }
}

impl fmt::Display for HeadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profiling inputs shared by every head of a layer.
#[derive(Debug, Clone)]
pub struct ProfileParams {
    pub capacity: usize,
    pub recent_window: usize,
    pub global_tokens: usize,
    pub special: HashSet<TokenId>,
    pub punctuation: HashSet<TokenId>,
    /// Minimum share of attention mass a strategy must retain.
    pub threshold: f32,
}

/// Profiling result for one head.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeadProfile {
    pub layer: usize,
    pub head: usize,
    pub strategy: HeadStrategy,
    pub kept: usize,
    pub recovered: f32,
}

/// Profile every head of one layer.
pub fn profile_heads(
    layer: usize,
    prompt: &[TokenKv],
    attention: &[AttentionMatrix],
    params: &ProfileParams,
) -> Vec<HeadProfile> {
    attention
        .iter()
        .enumerate()
        .map(|(head, a)| profile_head(layer, head, prompt, a, params))
        .collect()
}

fn profile_head(
    layer: usize,
    head: usize,
    prompt: &[TokenKv],
    attention: &AttentionMatrix,
    params: &ProfileParams,
) -> HeadProfile {
    let received = attention.column_means();
    let total: f32 = received.iter().sum();

    for strategy in HeadStrategy::CANDIDATES {
        let keep = kept_set(strategy, prompt, &received, params);
        let kept = keep.iter().filter(|k| **k).count();
        let mass: f32 = received
            .iter()
            .zip(&keep)
            .filter(|(_, k)| **k)
            .map(|(w, _)| w)
            .sum();
        let recovered = if total > 0.0 { mass / total } else { 1.0 };
        if recovered >= params.threshold {
            return HeadProfile {
                layer,
                head,
                strategy,
                kept,
                recovered,
            };
        }
    }

    HeadProfile {
        layer,
        head,
        strategy: HeadStrategy::Full,
        kept: prompt.len(),
        recovered: 1.0,
    }
}

fn kept_set(
    strategy: HeadStrategy,
    prompt: &[TokenKv],
    received: &[f32],
    params: &ProfileParams,
) -> Vec<bool> {
    let n = prompt.len();
    let mut keep = vec![false; n];
    let mut kept = 0;
    let mut take = |i: usize, keep: &mut Vec<bool>| {
        if kept < params.capacity && !keep[i] {
            keep[i] = true;
            kept += 1;
        }
    };

    let is_special = |t: &TokenKv| {
        t.position < params.global_tokens
            || t.token_id.is_some_and(|id| params.special.contains(&id))
    };
    let is_punc = |t: &TokenKv| t.token_id.is_some_and(|id| params.punctuation.contains(&id));

    for (i, t) in prompt.iter().enumerate() {
        if is_special(t) {
            take(i, &mut keep);
        }
    }
    if strategy == HeadStrategy::Special {
        return keep;
    }

    for (i, t) in prompt.iter().enumerate() {
        if is_punc(t) {
            take(i, &mut keep);
        }
    }
    if strategy == HeadStrategy::SpecialPunc {
        return keep;
    }

    if strategy == HeadStrategy::SpecialPuncWindowHeavyHitter {
        for i in (0..n).rev().take(params.recent_window) {
            take(i, &mut keep);
        }
    }

    let mut ranked: Vec<usize> = (0..n).collect();
    ranked.sort_by(|&a, &b| received[b].total_cmp(&received[a]).then(b.cmp(&a)));
    for i in ranked {
        take(i, &mut keep);
    }
    keep
}

/// Write profiled head strategies into the configuration's layer table.
///
/// Profiled layers switch to head-specific mode.
pub fn apply_profiles(config: &mut Config, profiles: &[HeadProfile]) {
    if config.cache.layers.is_empty() {
        config.cache.layers = vec![config.cache.default.clone(); config.model.n_layers];
    }
    let n_heads = config.model.n_kv_heads;
    for p in profiles {
        let Some(layer) = config.cache.layers.get_mut(p.layer) else {
            continue;
        };
        if p.head >= n_heads {
            continue;
        }
        if layer.head_strategies.len() != n_heads {
            layer.head_strategies = vec![layer.eviction; n_heads];
        }
        layer.head_specific = true;
        layer.head_strategies[p.head] = p.strategy.eviction();
    }
}
