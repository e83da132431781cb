//! Cache statistics: per-store figures, per-layer aggregates, and the
//! session-wide report exported for logging and Prometheus.
//!
//! Everything here is read-only over cache state and never fails; an empty
//! cache reports zeros.

use std::collections::BTreeMap;

use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use uuid::Uuid;

const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Figures for a single store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    /// Valid slots.
    pub occupied: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Occupied slots over tokens seen so far.
    pub retention: f64,
    /// Key/value buffer footprint in bytes.
    pub memory_bytes: usize,
    /// Entries evicted this session.
    pub evictions: u64,
    /// Admissions dropped this session.
    pub drops: u64,
}

/// Figures for one layer, aggregated over its stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LayerStats {
    /// Mean occupied slots per store.
    pub occupied: f64,
    pub capacity: usize,
    pub retention: f64,
    pub memory_gb: f64,
    /// Summed over stores.
    pub evictions: u64,
    pub drops: u64,
}

impl LayerStats {
    /// Aggregate the stores of one layer (one store in shared mode, one per
    /// head otherwise).
    pub fn aggregate(stores: &[CacheStatistics]) -> Self {
        if stores.is_empty() {
            return Self::default();
        }
        let n = stores.len() as f64;
        Self {
            occupied: stores.iter().map(|s| s.occupied as f64).sum::<f64>() / n,
            capacity: stores.iter().map(|s| s.capacity).max().unwrap_or(0),
            retention: stores.iter().map(|s| s.retention).sum::<f64>() / n,
            memory_gb: stores.iter().map(|s| s.memory_bytes).sum::<usize>() as f64 / BYTES_PER_GB,
            evictions: stores.iter().map(|s| s.evictions).sum(),
            drops: stores.iter().map(|s| s.drops).sum(),
        }
    }
}

/// Means across layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LayerAverages {
    pub occupied: f64,
    pub capacity: f64,
    pub retention: f64,
    pub evictions: f64,
    pub drops: f64,
}

/// Session-wide statistics record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsReport {
    /// Session the report belongs to, when the caller tracks one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Tokens seen so far (prompt plus generated).
    pub seq_len: usize,
    /// Indexed by layer.
    pub layers: Vec<LayerStats>,
    pub average: LayerAverages,
    /// Summed over layers.
    pub cache_memory_gb: f64,
}

impl StatsReport {
    pub fn from_layers(seq_len: usize, layers: Vec<LayerStats>) -> Self {
        let mut average = LayerAverages::default();
        if !layers.is_empty() {
            let n = layers.len() as f64;
            average = LayerAverages {
                occupied: layers.iter().map(|l| l.occupied).sum::<f64>() / n,
                capacity: layers.iter().map(|l| l.capacity as f64).sum::<f64>() / n,
                retention: layers.iter().map(|l| l.retention).sum::<f64>() / n,
                evictions: layers.iter().map(|l| l.evictions as f64).sum::<f64>() / n,
                drops: layers.iter().map(|l| l.drops as f64).sum::<f64>() / n,
            };
        }
        let cache_memory_gb = layers.iter().map(|l| l.memory_gb).sum();
        Self {
            session_id: None,
            seq_len,
            layers,
            average,
            cache_memory_gb,
        }
    }

    pub fn with_session(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }

    /// Flat `name_layer` / `name_avg` mapping for line-oriented logs.
    pub fn flatten(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (idx, l) in self.layers.iter().enumerate() {
            out.insert(format!("occupied_{idx}"), l.occupied);
            out.insert(format!("capacity_{idx}"), l.capacity as f64);
            out.insert(format!("retention_{idx}"), l.retention);
            out.insert(format!("memory_gb_{idx}"), l.memory_gb);
            out.insert(format!("evictions_{idx}"), l.evictions as f64);
            out.insert(format!("drops_{idx}"), l.drops as f64);
        }
        if !self.layers.is_empty() {
            let a = &self.average;
            out.insert("occupied_avg".to_string(), a.occupied);
            out.insert("capacity_avg".to_string(), a.capacity);
            out.insert("retention_avg".to_string(), a.retention);
            out.insert("evictions_avg".to_string(), a.evictions);
            out.insert("drops_avg".to_string(), a.drops);
        }
        out.insert("cache_memory_gb".to_string(), self.cache_memory_gb);
        out
    }
}

/// Publishes reports as Prometheus gauges labelled by layer.
pub struct StatsExporter {
    occupied: GaugeVec,
    capacity: IntGaugeVec,
    memory: IntGaugeVec,
    evictions: IntGaugeVec,
    drops: IntGaugeVec,
}

impl StatsExporter {
    /// Create the gauges and register them with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let labels = &["layer"];
        let occupied = GaugeVec::new(
            Opts::new("kv_cache_occupied_slots", "Mean occupied slots per store"),
            labels,
        )?;
        let capacity = IntGaugeVec::new(
            Opts::new("kv_cache_capacity_slots", "Configured slots per store"),
            labels,
        )?;
        let memory = IntGaugeVec::new(
            Opts::new("kv_cache_memory_bytes", "Key/value buffer footprint"),
            labels,
        )?;
        let evictions = IntGaugeVec::new(
            Opts::new("kv_cache_evictions", "Entries evicted this session"),
            labels,
        )?;
        let drops = IntGaugeVec::new(
            Opts::new("kv_cache_drops", "Admissions dropped this session"),
            labels,
        )?;

        registry.register(Box::new(occupied.clone()))?;
        registry.register(Box::new(capacity.clone()))?;
        registry.register(Box::new(memory.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(drops.clone()))?;

        Ok(Self {
            occupied,
            capacity,
            memory,
            evictions,
            drops,
        })
    }

    /// Overwrite every layer's gauges with `report`.
    pub fn publish(&self, report: &StatsReport) {
        for (idx, l) in report.layers.iter().enumerate() {
            let layer = idx.to_string();
            let labels = &[layer.as_str()];
            self.occupied.with_label_values(labels).set(l.occupied);
            self.capacity.with_label_values(labels).set(l.capacity as i64);
            self.memory
                .with_label_values(labels)
                .set((l.memory_gb * BYTES_PER_GB).round() as i64);
            self.evictions.with_label_values(labels).set(l.evictions as i64);
            self.drops.with_label_values(labels).set(l.drops as i64);
        }
    }
}

/// Text exposition of everything registered in `registry`.
pub fn render(registry: &Registry) -> prometheus::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(occupied: usize, memory_bytes: usize, evictions: u64) -> CacheStatistics {
        CacheStatistics {
            occupied,
            capacity: 8,
            retention: occupied as f64 / 16.0,
            memory_bytes,
            evictions,
            drops: 0,
        }
    }

    #[test]
    fn test_layer_aggregate() {
        let layer = LayerStats::aggregate(&[store(4, 1 << 29, 1), store(8, 1 << 29, 2)]);
        assert_eq!(layer.occupied, 6.0);
        assert_eq!(layer.capacity, 8);
        assert_eq!(layer.memory_gb, 1.0);
        assert_eq!(layer.evictions, 3);
        assert_eq!(LayerStats::aggregate(&[]), LayerStats::default());
    }

    #[test]
    fn test_report_averages_and_total() {
        let a = LayerStats::aggregate(&[store(4, 1 << 30, 2)]);
        let b = LayerStats::aggregate(&[store(8, 1 << 30, 0)]);
        let report = StatsReport::from_layers(16, vec![a, b]);
        assert_eq!(report.average.occupied, 6.0);
        assert_eq!(report.average.evictions, 1.0);
        assert_eq!(report.cache_memory_gb, 2.0);

        let flat = report.flatten();
        assert_eq!(flat["occupied_1"], 8.0);
        assert_eq!(flat["occupied_avg"], 6.0);
        assert_eq!(flat["cache_memory_gb"], 2.0);
    }

    #[test]
    fn test_empty_report_is_zero() {
        let report = StatsReport::from_layers(0, Vec::new());
        assert_eq!(report.cache_memory_gb, 0.0);
        assert_eq!(report.average, LayerAverages::default());
        assert_eq!(report.flatten().len(), 1);
    }

    #[test]
    fn test_exporter_publishes_gauges() {
        let registry = Registry::new();
        let exporter = StatsExporter::new(&registry).unwrap();
        let report = StatsReport::from_layers(16, vec![LayerStats::aggregate(&[store(4, 1024, 3)])]);
        exporter.publish(&report);

        let text = render(&registry).unwrap();
        assert!(text.contains("kv_cache_memory_bytes{layer=\"0\"} 1024"));
        assert!(text.contains("kv_cache_evictions{layer=\"0\"} 3"));
    }
}
