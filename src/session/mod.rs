//! End-to-end driver for the cache.
//!
//! - [`attention`]: the attention seam and a dot-product backend
//! - [`synthetic`]: deterministic token stream standing in for a model
//! - [`driver`]: prefill/decode sessions and the concurrent runner

pub mod attention;
pub mod driver;
pub mod synthetic;
