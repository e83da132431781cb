//! Runtime configuration for kv-cache-compress.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every per-layer cache knob (capacity, recent window, strategy identifiers)
//! lives here and is immutable once a cache has been built from it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use half::f16;
use serde::{Deserialize, Serialize};

use crate::cache::entry::TokenId;
use crate::error::ConfigError;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kv-cache-compress",
    about = "Simulate fixed-budget KV cache sessions and report cache statistics"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Prompt length in tokens (overrides the config file).
    #[arg(long)]
    pub prompt_len: Option<usize>,

    /// Number of tokens to generate (overrides the config file).
    #[arg(long)]
    pub gen_len: Option<usize>,

    /// Number of concurrent sessions to simulate.
    #[arg(long)]
    pub sessions: Option<usize>,

    /// Cache capacity applied to every layer.
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Eviction strategy applied to every layer.
    #[arg(long)]
    pub eviction: Option<String>,

    /// Prompt compression strategy applied to every layer.
    #[arg(long)]
    pub compression: Option<String>,

    /// Profile per-head strategies on the first session's prompt with this
    /// attention recovery threshold.
    #[arg(long)]
    pub profile_threshold: Option<f32>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(n) = self.prompt_len {
            config.simulation.prompt_len = n;
        }
        if let Some(n) = self.gen_len {
            config.simulation.gen_len = n;
        }
        if let Some(n) = self.sessions {
            config.simulation.sessions = n;
        }

        let eviction = self
            .eviction
            .as_deref()
            .map(str::parse::<EvictionStrategy>)
            .transpose()?;
        let compression = self
            .compression
            .as_deref()
            .map(str::parse::<CompressionStrategy>)
            .transpose()?;

        let table = &mut config.cache;
        for layer in std::iter::once(&mut table.default).chain(table.layers.iter_mut()) {
            if let Some(capacity) = self.capacity {
                layer.capacity = capacity;
            }
            if let Some(strategy) = eviction {
                layer.eviction = strategy;
                layer.head_strategies.clear();
            }
            if let Some(strategy) = compression {
                layer.compression = strategy;
            }
        }
        Ok(())
    }
}

/// Eviction strategy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EvictionStrategy {
    /// Admit until full, then reject.
    Full,
    /// Evict the oldest unpinned entry.
    Window,
    /// Pin special and punctuation tokens, evict the oldest unpinned entry.
    Special,
    /// Evict the unpinned entry with the lowest attention EMA.
    HeavyHitter,
    /// Pinning plus recent-window protection plus heavy-hitter ranking.
    Hybrid,
    /// Evict the unpinned entry with the largest key norm.
    KeyNorm,
}

impl EvictionStrategy {
    pub const ALL: [EvictionStrategy; 6] = [
        EvictionStrategy::Full,
        EvictionStrategy::Window,
        EvictionStrategy::Special,
        EvictionStrategy::HeavyHitter,
        EvictionStrategy::Hybrid,
        EvictionStrategy::KeyNorm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::Full => "full",
            EvictionStrategy::Window => "window",
            EvictionStrategy::Special => "special",
            EvictionStrategy::HeavyHitter => "heavy_hitter",
            EvictionStrategy::Hybrid => "hybrid",
            EvictionStrategy::KeyNorm => "key_norm",
        }
    }
}

impl FromStr for EvictionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EvictionStrategy::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStrategy {
                kind: "eviction",
                id: s.to_string(),
            })
    }
}

impl TryFrom<String> for EvictionStrategy {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EvictionStrategy> for String {
    fn from(s: EvictionStrategy) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt compression strategy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionStrategy {
    /// Keep the global prefix and the most recent suffix.
    Recent,
    /// Keep pinned tokens, fill the rest with the most recent ones.
    Special,
    /// Keep the recent window plus the most-attended prompt positions.
    HeavyHitter,
    /// Pinned, then recent window, then most-attended.
    Hybrid,
    /// Keep pinned tokens, then the lowest key norms.
    KeyNorm,
}

impl CompressionStrategy {
    pub const ALL: [CompressionStrategy; 5] = [
        CompressionStrategy::Recent,
        CompressionStrategy::Special,
        CompressionStrategy::HeavyHitter,
        CompressionStrategy::Hybrid,
        CompressionStrategy::KeyNorm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionStrategy::Recent => "recent",
            CompressionStrategy::Special => "special",
            CompressionStrategy::HeavyHitter => "heavy_hitter",
            CompressionStrategy::Hybrid => "hybrid",
            CompressionStrategy::KeyNorm => "key_norm",
        }
    }
}

impl FromStr for CompressionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompressionStrategy::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStrategy {
                kind: "compression",
                id: s.to_string(),
            })
    }
}

impl TryFrom<String> for CompressionStrategy {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CompressionStrategy> for String {
    fn from(s: CompressionStrategy) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model dimensions relevant to the cache.
    pub model: ModelConfig,

    /// Per-layer cache table.
    pub cache: CacheTableConfig,

    /// Session simulation settings (binary only).
    pub simulation: SimulationConfig,
}

/// Model dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of transformer layers.
    pub n_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_layers: 8,
            n_kv_heads: 4,
            head_dim: 64,
        }
    }
}

impl ModelConfig {
    /// Bytes for one token's K and V in one head at FP16.
    pub fn entry_bytes_per_head(&self) -> usize {
        2 * self.head_dim * std::mem::size_of::<f16>()
    }
}

/// Cache parameters for one layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerCacheConfig {
    /// Maximum number of retained tokens.
    pub capacity: usize,

    /// Number of most recent positions protected by the hybrid policy and
    /// kept by the attention-based compressors.
    pub recent_window: usize,

    /// Leading positions pinned as attention sinks.
    pub global_tokens: usize,

    /// Streaming eviction strategy.
    pub eviction: EvictionStrategy,

    /// Prompt compression strategy.
    pub compression: CompressionStrategy,

    /// EMA decay for heavy-hitter importance.
    pub attention_ema_decay: f32,

    /// One independent store per kv head instead of one shared store.
    pub head_specific: bool,

    /// Per-head eviction overrides (head-specific mode only).
    pub head_strategies: Vec<EvictionStrategy>,
}

impl Default for LayerCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            recent_window: 64,
            global_tokens: 4,
            eviction: EvictionStrategy::Window,
            compression: CompressionStrategy::Recent,
            attention_ema_decay: 0.9,
            head_specific: false,
            head_strategies: Vec::new(),
        }
    }
}

/// The per-layer configuration table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTableConfig {
    /// Used for every layer when `layers` is empty.
    pub default: LayerCacheConfig,

    /// Per-layer entries; must match the layer count when non-empty.
    pub layers: Vec<LayerCacheConfig>,

    /// Special token ids (BOS, EOS, chat markers) pinned by marker-aware policies.
    pub special_token_ids: Vec<TokenId>,

    /// Punctuation token ids pinned by marker-aware policies.
    pub punctuation_token_ids: Vec<TokenId>,
}

impl CacheTableConfig {
    /// Configuration for layer `idx`.
    pub fn layer(&self, idx: usize) -> &LayerCacheConfig {
        self.layers.get(idx).unwrap_or(&self.default)
    }
}

/// Simulation settings for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub prompt_len: usize,
    pub gen_len: usize,
    pub sessions: usize,
    pub vocab_size: u32,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            prompt_len: 1024,
            gen_len: 128,
            sessions: 1,
            vocab_size: 32000,
            seed: 0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the layer table against the model dimensions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        if model.n_layers == 0 || model.n_kv_heads == 0 || model.head_dim == 0 {
            return Err(ConfigError::ZeroDimension);
        }

        let layers = &self.cache.layers;
        if !layers.is_empty() && layers.len() != model.n_layers {
            return Err(ConfigError::LayerCountMismatch {
                expected: model.n_layers,
                found: layers.len(),
            });
        }

        for idx in 0..model.n_layers {
            let layer = self.cache.layer(idx);
            if layer.capacity == 0 {
                return Err(ConfigError::ZeroCapacity { layer: idx });
            }
            if !(0.0..1.0).contains(&layer.attention_ema_decay) {
                return Err(ConfigError::InvalidDecay(layer.attention_ema_decay));
            }
            if !layer.head_strategies.is_empty() {
                if !layer.head_specific {
                    return Err(ConfigError::HeadStrategiesWithoutHeadSpecific { layer: idx });
                }
                if layer.head_strategies.len() != model.n_kv_heads {
                    return Err(ConfigError::HeadCountMismatch {
                        layer: idx,
                        expected: model.n_kv_heads,
                        found: layer.head_strategies.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Full-occupancy footprint of layer `idx` in bytes.
    pub fn layer_memory_bytes(&self, idx: usize) -> usize {
        self.cache.layer(idx).capacity * self.model.entry_bytes_per_head() * self.model.n_kv_heads
    }

    /// Full-occupancy footprint of every layer in bytes.
    pub fn total_memory_bytes(&self) -> usize {
        (0..self.model.n_layers).map(|i| self.layer_memory_bytes(i)).sum()
    }
}
