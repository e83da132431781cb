//! Layer and model-wide cache containers.
//!
//! A layer runs either one controller shared by all kv heads (entries carry
//! every head's vectors side by side) or one independent controller per kv
//! head. Layers share nothing, so they may be driven from different threads.

use std::collections::HashSet;

use crate::cache::controller::{CacheController, PrefillSummary};
use crate::cache::entry::{TokenId, TokenKv};
use crate::cache::policy::Admission;
use crate::cache::scores::AttentionMatrix;
use crate::config::{Config, LayerCacheConfig, ModelConfig};
use crate::error::{CacheError, ConfigError, Result};
use crate::stats::{CacheStatistics, LayerStats, StatsReport};

/// All cache stores of one layer.
#[derive(Debug)]
pub struct LayerCache {
    layer: usize,
    n_heads: usize,
    head_dim: usize,
    head_specific: bool,
    controllers: Vec<CacheController>,
}

impl LayerCache {
    pub fn new(
        layer: usize,
        config: &LayerCacheConfig,
        model: &ModelConfig,
        markers: &HashSet<TokenId>,
    ) -> Self {
        let n_heads = model.n_kv_heads;
        let head_dim = model.head_dim;
        let controllers = if config.head_specific {
            (0..n_heads)
                .map(|h| {
                    let eviction = config.head_strategies.get(h).copied().unwrap_or(config.eviction);
                    CacheController::new(config, eviction, head_dim, markers.clone(), layer, Some(h))
                })
                .collect()
        } else {
            vec![CacheController::new(
                config,
                config.eviction,
                n_heads * head_dim,
                markers.clone(),
                layer,
                None,
            )]
        };
        Self {
            layer,
            n_heads,
            head_dim,
            head_specific: config.head_specific,
            controllers,
        }
    }

    pub fn index(&self) -> usize {
        self.layer
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn is_head_specific(&self) -> bool {
        self.head_specific
    }

    /// Controllers of this layer: one, or one per head.
    pub fn controllers(&self) -> &[CacheController] {
        &self.controllers
    }

    /// Controller serving kv head `head`.
    pub fn controller_for_head(&self, head: usize) -> &CacheController {
        if self.head_specific {
            &self.controllers[head]
        } else {
            &self.controllers[0]
        }
    }

    pub fn capacity(&self) -> usize {
        self.controllers.iter().map(CacheController::capacity).min().unwrap_or(0)
    }

    pub fn overflow(&self, prompt_len: usize) -> bool {
        prompt_len > self.capacity()
    }

    /// Whether any store of this layer consumes attention weights.
    pub fn needs_attention_weights(&self) -> bool {
        self.controllers.iter().any(CacheController::needs_attention_weights)
    }

    /// Whether decode steps must feed attention weights back.
    pub fn needs_feedback(&self) -> bool {
        self.controllers
            .iter()
            .any(|c| c.policy().needs_attention_weights())
    }

    pub fn needs_prompt_attention(&self, prompt_len: usize) -> bool {
        self.controllers
            .iter()
            .any(|c| c.needs_prompt_attention(prompt_len))
    }

    /// Slice a full-width token down to one head.
    fn head_token(&self, token: &TokenKv, head: usize) -> TokenKv {
        let range = head * self.head_dim..(head + 1) * self.head_dim;
        TokenKv {
            position: token.position,
            token_id: token.token_id,
            key: token.key[range.clone()].to_vec(),
            value: token.value[range].to_vec(),
        }
    }

    fn check_heads<T>(&self, per_head: &[T]) -> Result<()> {
        if per_head.len() != self.n_heads {
            return Err(CacheError::ShapeMismatch {
                expected: self.n_heads,
                found: per_head.len(),
            });
        }
        Ok(())
    }

    /// Every head's prompt matrix must cover the whole prompt, with one
    /// shared query count so heads can be averaged.
    fn check_prompt_attention(&self, attention: &[AttentionMatrix], prompt_len: usize) -> Result<()> {
        self.check_heads(attention)?;
        let rows = attention.first().map(|m| m.rows).unwrap_or(0);
        for m in attention {
            if m.cols != prompt_len {
                return Err(CacheError::ShapeMismatch {
                    expected: prompt_len,
                    found: m.cols,
                });
            }
            if m.rows != rows {
                return Err(CacheError::ShapeMismatch {
                    expected: rows,
                    found: m.rows,
                });
            }
            if m.data.len() != m.rows * m.cols {
                return Err(CacheError::ShapeMismatch {
                    expected: m.rows * m.cols,
                    found: m.data.len(),
                });
            }
        }
        Ok(())
    }

    fn check_token(&self, token: &TokenKv) -> Result<()> {
        let width = self.n_heads * self.head_dim;
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

    /// Admit the prompt. Tokens carry all heads (`n_heads × head_dim`);
    /// `attention` holds one prompt matrix per kv head when supplied.
    ///
    /// All-or-nothing: on error every store of the layer is left empty.
    pub fn bulk_admit(
        &mut self,
        prompt: &[TokenKv],
        attention: Option<&[AttentionMatrix]>,
    ) -> Result<Vec<PrefillSummary>> {
        if let Some(a) = attention {
            self.check_prompt_attention(a, prompt.len())?;
        }
        for token in prompt {
            self.check_token(token)?;
        }

        if !self.head_specific {
            let mean = attention.and_then(AttentionMatrix::mean_of);
            let summary = self.controllers[0].bulk_admit(prompt, mean.as_ref())?;
            return Ok(vec![summary]);
        }

        let mut summaries = Vec::with_capacity(self.n_heads);
        for head in 0..self.n_heads {
            let head_prompt: Vec<TokenKv> = prompt.iter().map(|t| self.head_token(t, head)).collect();
            let head_attention = attention.map(|a| &a[head]);
            match self.controllers[head].bulk_admit(&head_prompt, head_attention) {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    self.controllers[..head]
                        .iter_mut()
                        .for_each(CacheController::reset);
                    return Err(e);
                }
            }
        }
        Ok(summaries)
    }

    /// Admit one decode token into every store of the layer.
    pub fn admit_one(&mut self, token: &TokenKv) -> Result<Vec<Admission>> {
        self.check_token(token)?;
        if !self.head_specific {
            return Ok(vec![self.controllers[0].admit_one(token.clone())?]);
        }
        let mut out = Vec::with_capacity(self.n_heads);
        for head in 0..self.n_heads {
            let t = self.head_token(token, head);
            out.push(self.controllers[head].admit_one(t)?);
        }
        Ok(out)
    }

    /// Feed one decode step's attention back, one slot-indexed row per kv head.
    ///
    /// A shared store receives the mean over heads.
    pub fn feedback(&mut self, per_head: &[Vec<f32>]) -> Result<()> {
        self.check_heads(per_head)?;
        if !self.head_specific {
            let cols = per_head[0].len();
            let mut mean = vec![0.0f32; cols];
            for row in per_head {
                if row.len() != cols {
                    return Err(CacheError::ShapeMismatch {
                        expected: cols,
                        found: row.len(),
                    });
                }
                for (acc, w) in mean.iter_mut().zip(row) {
                    *acc += w;
                }
            }
            let n = per_head.len() as f32;
            mean.iter_mut().for_each(|v| *v /= n);
            return self.controllers[0].feedback(&mean);
        }
        for (controller, row) in self.controllers.iter_mut().zip(per_head) {
            controller.feedback(row)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.controllers.iter_mut().for_each(CacheController::reset);
    }

    pub fn statistics(&self, seq_len: usize) -> LayerStats {
        let stores: Vec<CacheStatistics> = self
            .controllers
            .iter()
            .map(|c| c.statistics(seq_len))
            .collect();
        LayerStats::aggregate(&stores)
    }
}

/// Caches for every layer of the model.
#[derive(Debug)]
pub struct ModelCache {
    layers: Vec<LayerCache>,
}

impl ModelCache {
    /// Build every layer's cache. Fails fast on an invalid configuration.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let markers: HashSet<TokenId> = config
            .cache
            .special_token_ids
            .iter()
            .chain(&config.cache.punctuation_token_ids)
            .copied()
            .collect();
        let layers = (0..config.model.n_layers)
            .map(|idx| LayerCache::new(idx, config.cache.layer(idx), &config.model, &markers))
            .collect();
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    /// Mutable access to every layer, for driving layers independently.
    pub fn layers_mut(&mut self) -> &mut [LayerCache] {
        &mut self.layers
    }

    pub fn layer(&self, idx: usize) -> &LayerCache {
        &self.layers[idx]
    }

    pub fn layer_mut(&mut self, idx: usize) -> &mut LayerCache {
        &mut self.layers[idx]
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Clear every layer for a new session.
    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(LayerCache::reset);
    }

    /// Per layer: whether a prompt of `prompt_len` tokens will be compressed.
    pub fn overflow(&self, prompt_len: usize) -> Vec<bool> {
        self.layers.iter().map(|l| l.overflow(prompt_len)).collect()
    }

    /// Smallest layer capacity.
    pub fn min_capacity(&self) -> usize {
        self.layers.iter().map(LayerCache::capacity).min().unwrap_or(0)
    }

    /// Whether any layer consumes attention weights.
    pub fn needs_attention_weights(&self) -> bool {
        self.layers.iter().any(LayerCache::needs_attention_weights)
    }

    pub fn statistics(&self, seq_len: usize) -> StatsReport {
        let layers = self.layers.iter().map(|l| l.statistics(seq_len)).collect();
        StatsReport::from_layers(seq_len, layers)
    }
}
