//! Deterministic synthetic token stream.
//!
//! Stands in for a model when driving the cache: token ids, keys, values,
//! and queries are pure functions of `(seed, layer, position)`, so two runs
//! with the same seed see identical inputs.

use std::collections::HashSet;

use crate::cache::entry::{Position, TokenId, TokenKv};
use crate::config::Config;

/// Shape and seed of a synthetic stream.
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    seed: u64,
    vocab_size: u32,
    n_heads: usize,
    head_dim: usize,
    /// Marker ids mixed into the stream at a fixed rate.
    markers: Vec<TokenId>,
}

// Stream channels, so keys, values and queries never share a hash input.
const KEY: u64 = 1;
const VALUE: u64 = 2;
const QUERY: u64 = 3;
const TOKEN: u64 = 4;

/// One in `MARKER_PERIOD` positions carries a marker id.
const MARKER_PERIOD: u64 = 16;

impl SyntheticStream {
    pub fn new(config: &Config, seed: u64) -> Self {
        let markers: HashSet<TokenId> = config
            .cache
            .special_token_ids
            .iter()
            .chain(&config.cache.punctuation_token_ids)
            .copied()
            .collect();
        let mut markers: Vec<TokenId> = markers.into_iter().collect();
        markers.sort_unstable();
        Self {
            seed,
            vocab_size: config.simulation.vocab_size.max(1),
            n_heads: config.model.n_kv_heads,
            head_dim: config.model.head_dim,
            markers,
        }
    }

    pub fn width(&self) -> usize {
        self.n_heads * self.head_dim
    }

    pub fn token_id(&self, position: Position) -> TokenId {
        let h = mix(self.seed, TOKEN, 0, position as u64);
        if !self.markers.is_empty() && h % MARKER_PERIOD == 0 {
            let pick = (h / MARKER_PERIOD) as usize % self.markers.len();
            return self.markers[pick];
        }
        (h % self.vocab_size as u64) as TokenId
    }

    /// Full-width token (all heads) for `layer` at `position`.
    pub fn token(&self, layer: usize, position: Position) -> TokenKv {
        TokenKv::new(
            position,
            Some(self.token_id(position)),
            self.vector(KEY, layer, position),
            self.vector(VALUE, layer, position),
        )
    }

    /// Query of one head for `layer` at `position`.
    pub fn query(&self, layer: usize, head: usize, position: Position) -> Vec<f32> {
        let full = self.vector(QUERY, layer, position);
        full[head * self.head_dim..(head + 1) * self.head_dim].to_vec()
    }

    fn vector(&self, channel: u64, layer: usize, position: Position) -> Vec<f32> {
        let base = mix(self.seed, channel, layer as u64, position as u64);
        (0..self.width() as u64)
            .map(|i| unit(splitmix(base ^ i.wrapping_mul(0x9e37_79b9_7f4a_7c15))))
            .collect()
    }
}

fn mix(seed: u64, channel: u64, layer: u64, position: u64) -> u64 {
    let mut h = splitmix(seed ^ channel.rotate_left(56));
    h = splitmix(h ^ layer.rotate_left(40));
    splitmix(h ^ position)
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Map to [-1, 1).
fn unit(x: u64) -> f32 {
    ((x >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.model.n_kv_heads = 2;
        config.model.head_dim = 4;
        config.cache.special_token_ids = vec![1];
        config.simulation.vocab_size = 100;
        config
    }

    #[test]
    fn test_stream_is_deterministic() {
        let a = SyntheticStream::new(&config(), 7);
        let b = SyntheticStream::new(&config(), 7);
        assert_eq!(a.token(3, 10), b.token(3, 10));
        assert_eq!(a.query(0, 1, 5), b.query(0, 1, 5));
        assert_ne!(a.token(3, 10).key, a.token(3, 11).key);
    }

    #[test]
    fn test_shapes_and_ranges() {
        let s = SyntheticStream::new(&config(), 0);
        let t = s.token(0, 0);
        assert_eq!(t.key.len(), 8);
        assert_eq!(s.query(0, 1, 0).len(), 4);
        assert!(t.key.iter().all(|v| (-1.0..1.0).contains(v)));
        assert!((0..200).all(|p| s.token_id(p) < 100));
    }

    #[test]
    fn test_markers_appear() {
        let s = SyntheticStream::new(&config(), 3);
        assert!((0..1000).any(|p| s.token_id(p) == 1));
    }
}
