use serde::Deserialize;
use std::fs;

use crate::index::Metric;
use crate::tracker::TrackerConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dim: usize,
    pub nlist: usize,
    pub nprobe: usize,
    pub metric: Metric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            dim: 128,
            nlist: 16,
            nprobe: 4,
            metric: Metric::Cosine,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: u32,
    pub tracker: TrackerConfig,
    pub index: IndexConfig,
    /// Identity lookups must pass this to count as a match (distance
    /// ceiling for L2, similarity floor for cosine).
    pub search_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_id: 0,
            tracker: TrackerConfig::default(),
            index: IndexConfig::default(),
            search_threshold: 0.5,
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&data)?;
        Ok(cfg)
    }
}
