//! Integration tests for prompt compression through bulk admission.

use std::collections::HashSet;

use kv_cache_compress::cache::controller::CacheController;
use kv_cache_compress::cache::entry::TokenKv;
use kv_cache_compress::cache::scores::AttentionMatrix;
use kv_cache_compress::config::{CompressionStrategy, EvictionStrategy, LayerCacheConfig};
use kv_cache_compress::error::CacheError;

fn prompt(n: usize) -> Vec<TokenKv> {
    (0..n)
        .map(|i| TokenKv::new(i, Some(i as u32), vec![(i % 5) as f32, 1.0], vec![0.0, 0.0]))
        .collect()
}

/// Causal attention spread uniformly over each query's visible keys.
fn uniform_causal(n: usize) -> AttentionMatrix {
    let mut data = vec![0.0; n * n];
    for q in 0..n {
        for k in 0..=q {
            data[q * n + k] = 1.0 / (q + 1) as f32;
        }
    }
    AttentionMatrix::new(n, n, data).unwrap()
}

fn make_controller(compression: CompressionStrategy, capacity: usize) -> CacheController {
    let cfg = LayerCacheConfig {
        capacity,
        global_tokens: 1,
        recent_window: 1,
        compression,
        ..Default::default()
    };
    CacheController::new(&cfg, EvictionStrategy::Window, 2, HashSet::new(), 0, None)
}

fn positions(c: &CacheController) -> Vec<usize> {
    c.snapshot().iter().map(|e| e.position).collect()
}

#[test]
fn test_every_strategy_fits_budget_in_order() {
    let attention = uniform_causal(10);
    for strategy in CompressionStrategy::ALL {
        let mut c = make_controller(strategy, 4);
        let summary = c.bulk_admit(&prompt(10), Some(&attention)).unwrap();
        assert!(summary.compressed, "{strategy}");
        assert_eq!(summary.kept, 4, "{strategy}");

        let kept = positions(&c);
        assert_eq!(kept.len(), 4, "{strategy}");
        assert!(kept.windows(2).all(|w| w[0] < w[1]), "{strategy}: {kept:?}");
        assert_eq!(kept[0], 0, "{strategy} dropped the sink");
    }
}

#[test]
fn test_noop_when_prompt_fits() {
    for strategy in CompressionStrategy::ALL {
        let mut c = make_controller(strategy, 4);
        let summary = c.bulk_admit(&prompt(4), None).unwrap();
        assert!(!summary.compressed);
        assert_eq!(positions(&c), vec![0, 1, 2, 3]);
    }
}

#[test]
fn test_recent_keeps_suffix() {
    let mut c = make_controller(CompressionStrategy::Recent, 4);
    c.bulk_admit(&prompt(10), None).unwrap();
    assert_eq!(positions(&c), vec![0, 7, 8, 9]);
}

#[test]
fn test_heavy_hitter_keeps_most_attended() {
    // Uniform causal attention favours early keys.
    let mut c = make_controller(CompressionStrategy::HeavyHitter, 4);
    c.bulk_admit(&prompt(10), Some(&uniform_causal(10))).unwrap();
    assert_eq!(positions(&c), vec![0, 1, 2, 9]);
}

#[test]
fn test_compression_seeds_importance() {
    let attention = uniform_causal(6);
    let means = attention.column_means();
    let mut c = make_controller(CompressionStrategy::HeavyHitter, 3);
    c.bulk_admit(&prompt(6), Some(&attention)).unwrap();
    for entry in c.snapshot() {
        assert_eq!(entry.importance, means[entry.position]);
    }
}

#[test]
fn test_attention_strategy_without_attention_fails() {
    let mut c = make_controller(CompressionStrategy::Hybrid, 4);
    assert!(matches!(
        c.bulk_admit(&prompt(10), None),
        Err(CacheError::MissingAttention)
    ));
    assert_eq!(c.occupied(), 0);
    // The controller is still empty and accepts a valid prefill.
    c.bulk_admit(&prompt(10), Some(&uniform_causal(10))).unwrap();
    assert_eq!(c.occupied(), 4);
}

#[test]
fn test_key_norm_keeps_low_norms() {
    let mut c = make_controller(CompressionStrategy::KeyNorm, 4);
    c.bulk_admit(&prompt(10), None).unwrap();
    // Sink at 0; key[0] cycles 0..5, so 5 is the other zero-norm key and
    // 6, 1 follow. Ties keep the later position.
    assert_eq!(positions(&c), vec![0, 1, 5, 6]);
}

#[test]
fn test_needs_prompt_attention() {
    let c = make_controller(CompressionStrategy::HeavyHitter, 4);
    assert!(!c.needs_prompt_attention(4));
    assert!(c.needs_prompt_attention(5));
    let c = make_controller(CompressionStrategy::Recent, 4);
    assert!(!c.needs_prompt_attention(100));
}
