//! Prompt compression: shrinks an over-long prompt to the cache budget
//! before streaming starts.
//!
//! Each strategy fills the budget in priority tiers. Pinned positions come
//! first (earliest first when even they overflow), then the strategy's own
//! ranking. The kept set is always returned in original prompt order.

use crate::cache::entry::{PinRule, Position, TokenKv};
use crate::cache::scores::AttentionMatrix;
use crate::config::{CompressionStrategy, LayerCacheConfig};
use crate::error::{CacheError, Result};

/// A compressed prompt, ready for bulk admission.
#[derive(Debug, Clone, Default)]
pub struct CompressedPrompt {
    /// Kept tokens in prompt order.
    pub tokens: Vec<TokenKv>,

    /// Importance seed per kept token: the mean attention it received across
    /// prompt queries, or 0 without attention.
    pub importance: Vec<f32>,
}

impl CompressedPrompt {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.tokens.iter().map(|t| t.position).collect()
    }
}

/// The prompt compression engine for one store.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptCompressor {
    /// Global prefix plus the most recent suffix.
    Recent,
    /// Pinned tokens (markers included) plus the most recent rest.
    Special,
    /// Global prefix, recent window, then most-attended positions.
    HeavyHitter { recent_window: usize },
    /// Pinned tokens (markers included), recent window, then most-attended.
    Hybrid { recent_window: usize },
    /// Global prefix, then lowest key norms.
    KeyNorm,
}

impl PromptCompressor {
    pub fn new(strategy: CompressionStrategy, config: &LayerCacheConfig) -> Self {
        let recent_window = config.recent_window;
        match strategy {
            CompressionStrategy::Recent => PromptCompressor::Recent,
            CompressionStrategy::Special => PromptCompressor::Special,
            CompressionStrategy::HeavyHitter => PromptCompressor::HeavyHitter { recent_window },
            CompressionStrategy::Hybrid => PromptCompressor::Hybrid { recent_window },
            CompressionStrategy::KeyNorm => PromptCompressor::KeyNorm,
        }
    }

    pub fn strategy(&self) -> CompressionStrategy {
        match self {
            PromptCompressor::Recent => CompressionStrategy::Recent,
            PromptCompressor::Special => CompressionStrategy::Special,
            PromptCompressor::HeavyHitter { .. } => CompressionStrategy::HeavyHitter,
            PromptCompressor::Hybrid { .. } => CompressionStrategy::Hybrid,
            PromptCompressor::KeyNorm => CompressionStrategy::KeyNorm,
        }
    }

    /// Whether prompt attention must be computed for this compressor.
    pub fn needs_attention_weights(&self) -> bool {
        matches!(
            self,
            PromptCompressor::HeavyHitter { .. } | PromptCompressor::Hybrid { .. }
        )
    }

    /// Whether marker tokens count as pinned during selection.
    pub fn pins_markers(&self) -> bool {
        matches!(self, PromptCompressor::Special | PromptCompressor::Hybrid { .. })
    }

    /// Select at most `capacity` prompt tokens.
    ///
    /// `attention` is the causal prompt attention (queries × keys) and is
    /// only required by attention-based strategies. A prompt that already
    /// fits is returned unchanged.
    pub fn compress(
        &self,
        prompt: &[TokenKv],
        attention: Option<&AttentionMatrix>,
        capacity: usize,
        pins: &PinRule,
    ) -> Result<CompressedPrompt> {
        let received = attention.map(AttentionMatrix::column_means);
        if let Some(r) = &received {
            if r.len() != prompt.len() {
                return Err(CacheError::ShapeMismatch {
                    expected: prompt.len(),
                    found: r.len(),
                });
            }
        }

        let keep = if prompt.len() <= capacity {
            vec![true; prompt.len()]
        } else {
            self.select(prompt, received.as_deref(), capacity, pins)?
        };

        let mut out = CompressedPrompt::default();
        for (idx, token) in prompt.iter().enumerate().filter(|(i, _)| keep[*i]) {
            out.tokens.push(token.clone());
            out.importance
                .push(received.as_ref().map(|r| r[idx]).unwrap_or(0.0));
        }
        Ok(out)
    }

    fn select(
        &self,
        prompt: &[TokenKv],
        received: Option<&[f32]>,
        capacity: usize,
        pins: &PinRule,
    ) -> Result<Vec<bool>> {
        let n = prompt.len();
        let mut sel = Selection::new(n, capacity);

        // Tier 1: pinned, earliest first.
        let markers = self.pins_markers();
        let pinned = |i: &usize| pins.check(prompt[*i].position, prompt[*i].token_id, markers);
        sel.take((0..n).filter(pinned));

        match self {
            PromptCompressor::Recent | PromptCompressor::Special => {
                sel.take((0..n).rev());
            }
            PromptCompressor::HeavyHitter { recent_window }
            | PromptCompressor::Hybrid { recent_window } => {
                let received = received.ok_or(CacheError::MissingAttention)?;
                sel.take((0..n).rev().take(*recent_window));
                let mut ranked: Vec<usize> = (0..n).collect();
                // Highest attention first; ties keep the later position.
                ranked.sort_by(|&a, &b| received[b].total_cmp(&received[a]).then(b.cmp(&a)));
                sel.take(ranked);
            }
            PromptCompressor::KeyNorm => {
                let norms: Vec<f32> = prompt.iter().map(TokenKv::key_norm_sq).collect();
                let mut ranked: Vec<usize> = (0..n).collect();
                // Lowest norm first; ties keep the later position.
                ranked.sort_by(|&a, &b| norms[a].total_cmp(&norms[b]).then(b.cmp(&a)));
                sel.take(ranked);
            }
        }

        Ok(sel.keep)
    }
}

/// Keep-set under construction.
struct Selection {
    keep: Vec<bool>,
    kept: usize,
    capacity: usize,
}

impl Selection {
    fn new(n: usize, capacity: usize) -> Self {
        Self {
            keep: vec![false; n],
            kept: 0,
            capacity,
        }
    }

    /// Keep indices in iteration order until the budget runs out.
    fn take(&mut self, indices: impl IntoIterator<Item = usize>) {
        for i in indices {
            if self.kept >= self.capacity {
                return;
            }
            if !self.keep[i] {
                self.keep[i] = true;
                self.kept += 1;
            }
        }
    }
}

/// Verify a compressor's output against its budget and prompt order.
///
/// Violations are bugs in the compressor and are never repaired here.
pub fn check_selection(
    strategy: CompressionStrategy,
    positions: &[Position],
    capacity: usize,
) -> Result<()> {
    if positions.len() > capacity {
        return Err(CacheError::CompressionBudgetViolation {
            strategy: strategy.as_str(),
            returned: positions.len(),
            capacity,
        });
    }
    if positions.windows(2).any(|w| w[0] >= w[1]) {
        return Err(CacheError::UnorderedSelection {
            strategy: strategy.as_str(),
        });
    }
    Ok(())
}
