//! Attention computation over the cache.
//!
//! The cache never computes attention itself; a backend reads the slot
//! buffers and validity mask, and hands slot-indexed weights back when the
//! eviction policy asks for them.

use crate::cache::controller::CacheView;
use crate::cache::scores::AttentionMatrix;

/// Computes attention weights for the driver.
pub trait AttentionBackend: Send + Sync {
    /// Weights of one query over every slot of `view`.
    ///
    /// The query covers `query.len()` floats of each slot key starting at
    /// `offset`. The result has one entry per slot, zero where the mask is
    /// unset, and sums to 1 over valid slots.
    fn decode_weights(&self, query: &[f32], view: &CacheView<'_>, offset: usize) -> Vec<f32>;

    /// Causal attention of the prompt over itself (queries × keys).
    fn prompt_weights(&self, queries: &[Vec<f32>], keys: &[Vec<f32>]) -> AttentionMatrix;
}

/// Scaled dot-product attention with softmax normalisation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductAttention;

impl AttentionBackend for DotProductAttention {
    fn decode_weights(&self, query: &[f32], view: &CacheView<'_>, offset: usize) -> Vec<f32> {
        let dim = query.len();
        let scale = 1.0 / (dim.max(1) as f32).sqrt();
        let mut logits = vec![f32::NEG_INFINITY; view.mask.len()];
        for slot in view.valid_slots() {
            let key = &view.key(slot)[offset..offset + dim];
            let dot: f32 = key.iter().zip(query).map(|(k, q)| k.to_f32() * q).sum();
            logits[slot] = dot * scale;
        }
        softmax(&mut logits);
        logits
    }

    fn prompt_weights(&self, queries: &[Vec<f32>], keys: &[Vec<f32>]) -> AttentionMatrix {
        let n = keys.len();
        let mut data = Vec::with_capacity(queries.len() * n);
        for (i, query) in queries.iter().enumerate() {
            let scale = 1.0 / (query.len().max(1) as f32).sqrt();
            let mut row: Vec<f32> = keys
                .iter()
                .enumerate()
                .map(|(j, key)| {
                    if j > i {
                        f32::NEG_INFINITY
                    } else {
                        dot(query, key) * scale
                    }
                })
                .collect();
            softmax(&mut row);
            data.extend(row);
        }
        AttentionMatrix {
            rows: queries.len(),
            cols: n,
            data,
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// In-place softmax; `-inf` entries come out as 0. An all-masked row stays 0.
fn softmax(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        logits.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let mut sum = 0.0;
    for v in logits.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    logits.iter_mut().for_each(|v| *v /= sum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_decode_weights_respect_mask() {
        let keys: Vec<f16> = [1.0, 0.0, 5.0, 5.0, 0.0, 1.0]
            .into_iter()
            .map(f16::from_f32)
            .collect();
        let mask = [true, false, true];
        let view = CacheView {
            keys: &keys,
            values: &keys,
            mask: &mask,
            width: 2,
        };
        let w = DotProductAttention.decode_weights(&[1.0, 0.0], &view, 0);
        assert_eq!(w.len(), 3);
        assert_eq!(w[1], 0.0);
        assert!((w[0] + w[2] - 1.0).abs() < 1e-5);
        assert!(w[0] > w[2]);
    }

    #[test]
    fn test_decode_weights_head_offset() {
        let keys: Vec<f16> = [0.0, 0.0, 2.0, 0.0].into_iter().map(f16::from_f32).collect();
        let mask = [true, true];
        let view = CacheView {
            keys: &keys,
            values: &keys,
            mask: &mask,
            width: 2,
        };
        // Second half of each key: both zero, so the weights are uniform.
        let w = DotProductAttention.decode_weights(&[3.0], &view, 1);
        assert!((w[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_view_gives_zeros() {
        let mask = [false, false];
        let view = CacheView {
            keys: &[],
            values: &[],
            mask: &mask,
            width: 2,
        };
        assert_eq!(DotProductAttention.decode_weights(&[1.0, 1.0], &view, 0), vec![0.0, 0.0]);
    }

    #[test]
    fn test_prompt_weights_are_causal() {
        let q = vec![vec![1.0], vec![1.0], vec![1.0]];
        let m = DotProductAttention.prompt_weights(&q, &q);
        assert_eq!(m.row(0), &[1.0, 0.0, 0.0]);
        assert_eq!(m.row(1)[2], 0.0);
        assert!((m.row(2).iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
