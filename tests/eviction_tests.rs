//! Integration tests for the streaming eviction policies.

use std::collections::HashSet;

use kv_cache_compress::cache::controller::CacheController;
use kv_cache_compress::cache::entry::{TokenId, TokenKv};
use kv_cache_compress::cache::policy::{Admission, DropReason};
use kv_cache_compress::cache::scores::AttentionMatrix;
use kv_cache_compress::config::{EvictionStrategy, LayerCacheConfig};

const MARKER: TokenId = 7;

fn token(pos: usize) -> TokenKv {
    TokenKv::new(pos, Some(1), vec![pos as f32, 1.0], vec![0.0, 0.0])
}

fn marker(pos: usize) -> TokenKv {
    TokenKv::new(pos, Some(MARKER), vec![pos as f32, 1.0], vec![0.0, 0.0])
}

fn make_controller(
    eviction: EvictionStrategy,
    capacity: usize,
    global_tokens: usize,
    recent_window: usize,
) -> CacheController {
    let cfg = LayerCacheConfig {
        capacity,
        global_tokens,
        recent_window,
        eviction,
        attention_ema_decay: 0.0,
        ..Default::default()
    };
    let markers: HashSet<TokenId> = [MARKER].into_iter().collect();
    CacheController::new(&cfg, eviction, 2, markers, 0, None)
}

fn positions(c: &CacheController) -> Vec<usize> {
    c.snapshot().iter().map(|e| e.position).collect()
}

#[test]
fn test_window_keeps_most_recent() {
    let mut c = make_controller(EvictionStrategy::Window, 3, 0, 0);
    c.bulk_admit(&[token(0)], None).unwrap();
    for pos in 1..5 {
        c.admit_one(token(pos)).unwrap();
    }
    assert_eq!(positions(&c), vec![2, 3, 4]);
    assert_eq!(c.statistics(5).evictions, 2);
}

#[test]
fn test_pinned_prefix_never_evicted() {
    for strategy in [
        EvictionStrategy::Window,
        EvictionStrategy::Special,
        EvictionStrategy::HeavyHitter,
        EvictionStrategy::Hybrid,
        EvictionStrategy::KeyNorm,
    ] {
        let mut c = make_controller(strategy, 4, 2, 1);
        let prompt: Vec<TokenKv> = (0..4).map(token).collect();
        c.bulk_admit(&prompt, None).unwrap();
        for pos in 4..30 {
            if let Admission::Replaced { evicted, .. } = c.admit_one(token(pos)).unwrap() {
                assert!(evicted >= 2, "{strategy} evicted sink {evicted}");
            }
        }
        let kept = positions(&c);
        assert_eq!(&kept[..2], &[0, 1], "{strategy}");
    }
}

#[test]
fn test_heavy_hitter_equal_scores_deterministic() {
    let run = || {
        let mut c = make_controller(EvictionStrategy::HeavyHitter, 3, 0, 0);
        let prompt: Vec<TokenKv> = (0..3).map(token).collect();
        c.bulk_admit(&prompt, None).unwrap();
        c.admit_one(token(3)).unwrap()
    };
    let first = run();
    assert_eq!(first, Admission::Replaced { slot: 0, evicted: 0 });
    assert_eq!(first, run());
}

#[test]
fn test_heavy_hitter_evicts_least_attended() {
    let mut c = make_controller(EvictionStrategy::HeavyHitter, 3, 0, 0);
    let prompt: Vec<TokenKv> = (0..3).map(token).collect();
    c.bulk_admit(&prompt, None).unwrap();
    c.feedback(&[0.9, 0.1, 0.5]).unwrap();
    assert_eq!(
        c.admit_one(token(3)).unwrap(),
        Admission::Replaced { slot: 1, evicted: 1 }
    );
}

#[test]
fn test_heavy_hitter_generated_tokens_survive_uniform_feedback() {
    let cfg = LayerCacheConfig {
        capacity: 4,
        global_tokens: 0,
        eviction: EvictionStrategy::HeavyHitter,
        attention_ema_decay: 0.9,
        ..Default::default()
    };
    let mut c = CacheController::new(&cfg, EvictionStrategy::HeavyHitter, 2, HashSet::new(), 0, None);

    let mut data = vec![0.0; 16];
    for q in 0..4 {
        for k in 0..=q {
            data[q * 4 + k] = 1.0 / (q + 1) as f32;
        }
    }
    let attention = AttentionMatrix::new(4, 4, data).unwrap();
    let prompt: Vec<_> = (0..4).map(token).collect();
    c.bulk_admit(&prompt, Some(&attention)).unwrap();

    for pos in 4..20 {
        c.admit_one(token(pos)).unwrap();
        c.feedback(&[0.25; 4]).unwrap();
    }

    // The two most-attended prompt tokens stay above the uniform weight;
    // decode tokens compete among themselves instead of dying on arrival.
    let mut kept = positions(&c);
    kept.sort_unstable();
    assert_eq!(&kept[..2], &[0, 1]);
    assert_eq!(kept.iter().filter(|&&p| p >= 4).count(), 2);
    assert!(kept.contains(&19));
    let newest = c.snapshot().into_iter().find(|e| e.position == 19).unwrap();
    assert_eq!(newest.observed, 1);
    assert!((newest.importance - 0.25).abs() < 1e-6);
}

#[test]
fn test_hybrid_protects_recent_window() {
    let mut c = make_controller(EvictionStrategy::Hybrid, 4, 0, 2);
    let prompt: Vec<TokenKv> = (0..4).map(token).collect();
    c.bulk_admit(&prompt, None).unwrap();
    // Position 3 draws the least attention but sits inside the window.
    c.feedback(&[0.5, 0.4, 0.3, 0.0]).unwrap();
    assert_eq!(
        c.admit_one(token(4)).unwrap(),
        Admission::Replaced { slot: 2, evicted: 2 }
    );
}

#[test]
fn test_hybrid_gives_up_recency_before_pins() {
    // Every slot is either pinned or recent.
    let mut c = make_controller(EvictionStrategy::Hybrid, 3, 1, 8);
    c.bulk_admit(&[token(0), token(1), token(2)], None).unwrap();
    c.feedback(&[0.0, 0.6, 0.2]).unwrap();
    assert_eq!(
        c.admit_one(token(3)).unwrap(),
        Admission::Replaced { slot: 2, evicted: 2 }
    );
}

#[test]
fn test_special_pins_markers() {
    let mut c = make_controller(EvictionStrategy::Special, 3, 0, 0);
    c.bulk_admit(&[token(0), marker(1)], None).unwrap();
    for pos in 2..10 {
        c.admit_one(token(pos)).unwrap();
    }
    assert_eq!(positions(&c), vec![1, 8, 9]);

    // Window ignores markers.
    let mut w = make_controller(EvictionStrategy::Window, 3, 0, 0);
    w.bulk_admit(&[token(0), marker(1)], None).unwrap();
    for pos in 2..10 {
        w.admit_one(token(pos)).unwrap();
    }
    assert_eq!(positions(&w), vec![7, 8, 9]);
}

#[test]
fn test_all_protected_drops() {
    let mut c = make_controller(EvictionStrategy::Special, 2, 0, 0);
    c.bulk_admit(&[marker(0), marker(1)], None).unwrap();
    assert_eq!(
        c.admit_one(token(2)).unwrap(),
        Admission::Dropped(DropReason::AllProtected)
    );
    assert_eq!(positions(&c), vec![0, 1]);
    assert_eq!(c.statistics(3).drops, 1);
}

#[test]
fn test_full_rejects_past_capacity() {
    let mut c = make_controller(EvictionStrategy::Full, 2, 0, 0);
    c.bulk_admit(&[token(0)], None).unwrap();
    assert_eq!(c.admit_one(token(1)).unwrap(), Admission::Inserted { slot: 1 });
    assert_eq!(
        c.admit_one(token(2)).unwrap(),
        Admission::Dropped(DropReason::CapacityExhausted)
    );
    assert_eq!(positions(&c), vec![0, 1]);
    // Positions keep advancing after a drop.
    assert!(c.admit_one(token(3)).unwrap().is_dropped());
}

#[test]
fn test_key_norm_evicts_largest() {
    let mut c = make_controller(EvictionStrategy::KeyNorm, 2, 0, 0);
    let loud = TokenKv::new(0, None, vec![3.0, 4.0], vec![0.0, 0.0]);
    let quiet = TokenKv::new(1, None, vec![1.0, 0.0], vec![0.0, 0.0]);
    c.bulk_admit(&[loud, quiet], None).unwrap();
    assert_eq!(
        c.admit_one(token(2)).unwrap(),
        Admission::Replaced { slot: 0, evicted: 0 }
    );
}
