//! kv-cache-compress: simulate fixed-budget KV cache sessions.
//!
//! Loads a cache configuration, drives one or more synthetic sessions
//! through prompt compression and streaming eviction, and prints the
//! resulting statistics as JSON (optionally as Prometheus text as well).

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tracing::info;

use kv_cache_compress::cache::profiler::apply_profiles;
use kv_cache_compress::config::{Cli, Config};
use kv_cache_compress::session::attention::DotProductAttention;
use kv_cache_compress::session::driver::{run_sessions, Session};
use kv_cache_compress::stats::{render, StatsExporter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_cache_compress=debug"
    } else {
        "kv_cache_compress=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("kv-cache-compress v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration and apply overrides.
    let mut config = Config::load(&cli.config)?;
    cli.apply(&mut config)?;
    config.validate().context("invalid configuration after overrides")?;

    info!(
        n_layers = config.model.n_layers,
        n_kv_heads = config.model.n_kv_heads,
        head_dim = config.model.head_dim,
        "Configuration loaded"
    );

    for idx in 0..config.model.n_layers {
        let layer = config.cache.layer(idx);
        info!(
            layer = idx,
            capacity = layer.capacity,
            eviction = %layer.eviction,
            compression = %layer.compression,
            head_specific = layer.head_specific,
            memory_bytes = config.layer_memory_bytes(idx),
            "Layer cache"
        );
    }
    info!(
        total_bytes = config.total_memory_bytes(),
        "KV cache footprint at full occupancy (FP16)"
    );

    let sim = config.simulation.clone();

    // Optionally profile heads on the first session's prompt.
    if let Some(threshold) = cli.profile_threshold {
        let session = Session::new(&config, DotProductAttention, sim.seed)?;
        let profiles = session.profile(&config, sim.prompt_len, threshold);
        info!(heads = profiles.len(), threshold, "Profiled heads");
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        apply_profiles(&mut config, &profiles);
    }

    // Run the sessions.
    let config = Arc::new(config);
    let reports = run_sessions(config, sim.prompt_len, sim.gen_len, sim.sessions).await?;
    println!("{}", serde_json::to_string_pretty(&reports)?);

    if cli.metrics {
        let registry = Registry::new();
        let exporter = StatsExporter::new(&registry)?;
        if let Some(report) = reports.last() {
            exporter.publish(&report.stats);
        }
        print!("{}", render(&registry)?);
    }

    Ok(())
}
