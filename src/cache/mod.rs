//! Fixed-budget KV cache management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`entry`]: CacheEntry, TokenKv, pinning rules
//! - [`store`]: fixed-capacity slot store with validity mask
//! - [`policy`]: eviction policies for streaming admission
//! - [`compressor`]: prompt compression for over-long prompts
//! - [`controller`]: per-store state machine tying the above together
//! - [`layer`]: per-layer and model-wide containers
//! - [`profiler`]: per-head strategy selection from prompt attention
//! - [`scores`]: attention weight matrices

pub mod compressor;
pub mod controller;
pub mod entry;
pub mod layer;
pub mod policy;
pub mod profiler;
pub mod scores;
pub mod store;
