//! kv-cache-compress: fixed-budget attention KV cache.
//!
//! Keeps a bounded set of past key/value entries per layer (or per head)
//! while a model streams tokens. Over-long prompts are compressed to the
//! budget up front; afterwards each new token either fills a free slot,
//! replaces a victim picked by the eviction policy, or is dropped.

pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod stats;
