//! Error types for cache construction and cache operations.
//!
//! Admission drops are deliberately absent: a full cache of protected entries
//! refusing a token is reported through [`crate::cache::policy::Admission`],
//! never as an error.

use thiserror::Error;

use crate::cache::entry::Position;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal and surface before any session starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown {kind} strategy identifier: {id:?}")]
    UnknownStrategy { kind: &'static str, id: String },

    #[error("Layer {layer} has zero cache capacity")]
    ZeroCapacity { layer: usize },

    #[error("Per-layer table has {found} entries but the model has {expected} layers")]
    LayerCountMismatch { expected: usize, found: usize },

    #[error("Layer {layer} lists {found} head strategies but the model has {expected} kv heads")]
    HeadCountMismatch {
        layer: usize,
        expected: usize,
        found: usize,
    },

    #[error("Layer {layer} sets head strategies without head_specific mode")]
    HeadStrategiesWithoutHeadSpecific { layer: usize },

    #[error("Attention EMA decay must lie in [0, 1), got {0}")]
    InvalidDecay(f32),

    #[error("Model dimensions must be non-zero")]
    ZeroDimension,

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bulk admission requires a non-empty prompt")]
    EmptyPrompt,

    #[error("Cannot {op} while cache is {state}")]
    InvalidTransition { state: &'static str, op: &'static str },

    #[error("Position {got} does not follow last admitted position {last}")]
    NonMonotonicPosition { last: Position, got: Position },

    #[error("Vector width mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("Strategy requires attention weights but none were supplied")]
    MissingAttention,

    #[error("Compressor {strategy} returned {returned} entries for capacity {capacity}")]
    CompressionBudgetViolation {
        strategy: &'static str,
        returned: usize,
        capacity: usize,
    },

    #[error("Compressor {strategy} returned positions out of prompt order")]
    UnorderedSelection { strategy: &'static str },
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
