//! Leaf executor configuration
//!
//! Loaded from TOML; every field has a default so a partial file works.

use crate::error::{QueryError, Result};
use rusts_core::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Leaf executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafConfig {
    /// Name of this node, reported as the sender of responses
    pub node: String,
    /// Stage pool sizes
    pub pools: PoolConfig,
    /// Capacity of the per-query group tag value cache
    pub tag_value_cache_capacity: usize,
    /// Deadline applied to queries that come without one
    pub query_timeout_secs: Option<u64>,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            node: "leaf".to_string(),
            pools: PoolConfig::default(),
            tag_value_cache_capacity: 4096,
            query_timeout_secs: None,
        }
    }
}

impl LeafConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| QueryError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: LeafConfig = toml::from_str(content)
            .map_err(|e| QueryError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pools
            .validate()
            .map_err(|e| QueryError::Config(e.to_string()))?;
        if self.tag_value_cache_capacity == 0 {
            return Err(QueryError::Config(
                "tag_value_cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs.map(Duration::from_secs)
    }
}
