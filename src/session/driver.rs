//! Session driver: runs a prompt and a generation loop through a
//! [`ModelCache`], computing attention only where a layer asks for it.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::controller::PrefillSummary;
use crate::cache::entry::{Position, TokenKv};
use crate::cache::layer::{LayerCache, ModelCache};
use crate::cache::profiler::{profile_heads, HeadProfile, ProfileParams};
use crate::cache::scores::AttentionMatrix;
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::session::attention::{AttentionBackend, DotProductAttention};
use crate::session::synthetic::SyntheticStream;
use crate::stats::StatsReport;

/// Summary of one completed session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub seed: u64,
    pub prompt_len: usize,
    pub gen_len: usize,
    /// Layers whose prompt was compressed.
    pub compressed_layers: usize,
    pub stats: StatsReport,
}

/// One generation session over its own cache.
pub struct Session<B: AttentionBackend> {
    id: Uuid,
    seed: u64,
    cache: ModelCache,
    backend: B,
    stream: SyntheticStream,
}

impl<B: AttentionBackend> Session<B> {
    pub fn new(config: &Config, backend: B, seed: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            id: Uuid::new_v4(),
            seed,
            cache: ModelCache::new(config)?,
            backend,
            stream: SyntheticStream::new(config, seed),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn stream(&self) -> &SyntheticStream {
        &self.stream
    }

    /// Prefill `prompt_len` tokens, then generate `gen_len` more.
    ///
    /// The cache is reset first, so a session may be run repeatedly.
    pub fn run(&mut self, prompt_len: usize, gen_len: usize) -> Result<SessionReport> {
        self.cache.reset();
        let summaries = self.prefill(prompt_len)?;
        let compressed_layers = summaries
            .iter()
            .filter(|layer| layer.iter().any(|s| s.compressed))
            .count();

        for step in 0..gen_len {
            self.decode(prompt_len + step)?;
        }

        let stats = self.statistics(prompt_len + gen_len);
        info!(
            session = %self.id,
            prompt_len,
            gen_len,
            compressed_layers,
            memory_gb = stats.cache_memory_gb,
            occupied_avg = stats.average.occupied,
            evictions_avg = stats.average.evictions,
            "Session finished"
        );
        Ok(SessionReport {
            session_id: self.id,
            seed: self.seed,
            prompt_len,
            gen_len,
            compressed_layers,
            stats,
        })
    }

    /// Admit the prompt into every layer. Prompt attention is computed only
    /// for layers whose compressor will rank positions by it.
    pub fn prefill(&mut self, prompt_len: usize) -> Result<Vec<Vec<PrefillSummary>>> {
        let mut out = Vec::with_capacity(self.cache.n_layers());
        for layer in self.cache.layers_mut() {
            let idx = layer.index();
            let prompt: Vec<TokenKv> = (0..prompt_len).map(|p| self.stream.token(idx, p)).collect();
            let attention = if layer.needs_prompt_attention(prompt_len) {
                Some(prompt_attention(&self.backend, &self.stream, layer, &prompt))
            } else {
                None
            };
            let summaries = layer.bulk_admit(&prompt, attention.as_deref())?;
            debug!(layer = idx, kept = ?summaries.iter().map(|s| s.kept).collect::<Vec<_>>(), "Prefilled layer");
            out.push(summaries);
        }
        Ok(out)
    }

    /// Admit the token at `position` into every layer and feed attention
    /// back where the policy tracks it. Returns the number of drops.
    pub fn decode(&mut self, position: Position) -> Result<usize> {
        let mut dropped = 0;
        for layer in self.cache.layers_mut() {
            let idx = layer.index();
            let token = self.stream.token(idx, position);
            dropped += layer
                .admit_one(&token)?
                .iter()
                .filter(|a| a.is_dropped())
                .count();

            if layer.needs_feedback() {
                let weights: Vec<Vec<f32>> = (0..layer.n_heads())
                    .map(|head| {
                        let query = self.stream.query(idx, head, position);
                        let view = layer.controller_for_head(head).view();
                        let offset = if layer.is_head_specific() {
                            0
                        } else {
                            head * layer.head_dim()
                        };
                        self.backend.decode_weights(&query, &view, offset)
                    })
                    .collect();
                layer.feedback(&weights)?;
            }
        }
        Ok(dropped)
    }

    /// Pick a strategy per head from this session's prompt attention.
    pub fn profile(&self, config: &Config, prompt_len: usize, threshold: f32) -> Vec<HeadProfile> {
        let mut out = Vec::new();
        for layer in self.cache.layers() {
            let idx = layer.index();
            let layer_config = config.cache.layer(idx);
            let prompt: Vec<TokenKv> = (0..prompt_len).map(|p| self.stream.token(idx, p)).collect();
            let attention = prompt_attention(&self.backend, &self.stream, layer, &prompt);
            let params = ProfileParams {
                capacity: layer_config.capacity,
                recent_window: layer_config.recent_window,
                global_tokens: layer_config.global_tokens,
                special: config.cache.special_token_ids.iter().copied().collect(),
                punctuation: config.cache.punctuation_token_ids.iter().copied().collect(),
                threshold,
            };
            out.extend(profile_heads(idx, &prompt, &attention, &params));
        }
        out
    }

    pub fn statistics(&self, seq_len: usize) -> StatsReport {
        self.cache.statistics(seq_len).with_session(self.id)
    }
}

/// One causal prompt matrix per kv head of `layer`.
fn prompt_attention<B: AttentionBackend>(
    backend: &B,
    stream: &SyntheticStream,
    layer: &LayerCache,
    prompt: &[TokenKv],
) -> Vec<AttentionMatrix> {
    let dim = layer.head_dim();
    (0..layer.n_heads())
        .map(|head| {
            let range = head * dim..(head + 1) * dim;
            let queries: Vec<Vec<f32>> = prompt
                .iter()
                .map(|t| stream.query(layer.index(), head, t.position))
                .collect();
            let keys: Vec<Vec<f32>> = prompt.iter().map(|t| t.key[range.clone()].to_vec()).collect();
            backend.prompt_weights(&queries, &keys)
        })
        .collect()
}

/// Run `count` independent sessions concurrently on blocking tasks.
///
/// Session `i` uses seed `config.simulation.seed + i`; reports come back in
/// seed order.
pub async fn run_sessions(
    config: Arc<Config>,
    prompt_len: usize,
    gen_len: usize,
    count: usize,
) -> anyhow::Result<Vec<SessionReport>> {
    let mut tasks = JoinSet::new();
    for i in 0..count {
        let config = Arc::clone(&config);
        let seed = config.simulation.seed + i as u64;
        tasks.spawn_blocking(move || -> Result<SessionReport> {
            let mut session = Session::new(&config, DotProductAttention, seed)?;
            session.run(prompt_len, gen_len)
        });
    }

    let mut reports = Vec::with_capacity(count);
    while let Some(joined) = tasks.join_next().await {
        reports.push(joined??);
    }
    reports.sort_by_key(|r| r.seed);
    Ok(reports)
}
