//! Platform description: how many clusters, how many cores, how much memory.

use std::path::Path;

use serde::{Deserialize, Serialize};
use spad_core::{Result, SpadError};

/// Shape of the simulated accelerator.
///
/// Every cluster has `compute_cores_per_cluster` compute cores plus one
/// data-mover core, a private TCDM of `tcdm_bytes`, and one DMA engine.
/// All clusters share a single main memory of `main_memory_bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub num_clusters: usize,
    pub compute_cores_per_cluster: usize,
    pub tcdm_bytes: usize,
    pub main_memory_bytes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            compute_cores_per_cluster: 8,
            tcdm_bytes: 128 * 1024,
            main_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ClusterConfig {
    /// Cores per cluster, data mover included.
    pub fn cores_per_cluster(&self) -> usize {
        self.compute_cores_per_cluster + 1
    }

    pub fn total_cores(&self) -> usize {
        self.num_clusters * self.cores_per_cluster()
    }

    pub fn total_compute_cores(&self) -> usize {
        self.num_clusters * self.compute_cores_per_cluster
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_clusters == 0 {
            return Err(SpadError::InvalidConfig("num_clusters must be at least 1".into()));
        }
        if self.compute_cores_per_cluster == 0 {
            return Err(SpadError::InvalidConfig(
                "compute_cores_per_cluster must be at least 1".into(),
            ));
        }
        if self.tcdm_bytes == 0 || self.main_memory_bytes == 0 {
            return Err(SpadError::InvalidConfig("memory sizes must be non-zero".into()));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.cores_per_cluster(), 9);
        assert_eq!(cfg.total_compute_cores(), 8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: ClusterConfig = serde_json::from_str(r#"{"num_clusters": 4}"#).unwrap();
        assert_eq!(cfg.num_clusters, 4);
        assert_eq!(cfg.compute_cores_per_cluster, 8);
        assert_eq!(cfg.total_cores(), 36);
    }

    #[test]
    fn test_rejects_empty_cluster() {
        let cfg = ClusterConfig {
            compute_cores_per_cluster: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
