//! Cache engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Configuration for a [`CacheEngine`](crate::CacheEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Parallel environments served by one engine.
    pub env_count: usize,

    /// Simulations per search; sizes the recurrent pool with `env_count`.
    pub num_simulations: usize,

    /// Root contexts kept per environment.
    pub init_pool_size: usize,

    /// Window limit in positions; the model's `max_tokens` when unset.
    pub context_length: Option<usize>,

    /// Treat index entries whose slot was reused as misses.
    pub detect_stale_hits: bool,

    /// Force every recurrent lookup to miss.
    pub reanalyze: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            env_count: 1,
            num_simulations: 50,
            init_pool_size: 2,
            context_length: None,
            detect_stale_hits: false,
            reanalyze: false,
        }
    }
}

impl CacheConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env_count(mut self, n: usize) -> Self {
        self.env_count = n;
        self
    }

    pub fn with_num_simulations(mut self, n: usize) -> Self {
        self.num_simulations = n;
        self
    }

    pub fn with_init_pool_size(mut self, n: usize) -> Self {
        self.init_pool_size = n;
        self
    }

    pub fn with_context_length(mut self, n: usize) -> Self {
        self.context_length = Some(n);
        self
    }

    pub fn with_detect_stale_hits(mut self, on: bool) -> Self {
        self.detect_stale_hits = on;
        self
    }

    pub fn with_reanalyze(mut self, on: bool) -> Self {
        self.reanalyze = on;
        self
    }

    /// Slots in the shared recurrent pool.
    pub fn recurrent_pool_size(&self) -> usize {
        self.num_simulations * self.env_count
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.env_count == 0 {
            return Err(CacheError::InvalidConfig("env_count must be at least 1".into()));
        }
        if self.num_simulations == 0 {
            return Err(CacheError::InvalidConfig(
                "num_simulations must be at least 1".into(),
            ));
        }
        if self.init_pool_size == 0 {
            return Err(CacheError::InvalidConfig(
                "init_pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.env_count, 1);
        assert_eq!(config.init_pool_size, 2);
        assert_eq!(config.context_length, None);
        assert!(!config.detect_stale_hits);
        assert!(!config.reanalyze);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_chain() {
        let config = CacheConfig::new()
            .with_env_count(4)
            .with_num_simulations(25)
            .with_init_pool_size(3)
            .with_context_length(8)
            .with_detect_stale_hits(true)
            .with_reanalyze(true);
        assert_eq!(config.recurrent_pool_size(), 100);
        assert_eq!(config.init_pool_size, 3);
        assert_eq!(config.context_length, Some(8));
        assert!(config.detect_stale_hits);
        assert!(config.reanalyze);
    }

    #[test]
    fn zero_sizes_rejected() {
        assert!(CacheConfig::new().with_env_count(0).validate().is_err());
        assert!(CacheConfig::new().with_num_simulations(0).validate().is_err());
        assert!(CacheConfig::new().with_init_pool_size(0).validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config =
            CacheConfig::from_json_str(r#"{"env_count": 3, "context_length": 6}"#).unwrap();
        assert_eq!(config.env_count, 3);
        assert_eq!(config.context_length, Some(6));
        assert_eq!(config.num_simulations, 50);
    }

    #[test]
    fn invalid_json_values_rejected() {
        assert!(matches!(
            CacheConfig::from_json_str(r#"{"env_count": 0}"#),
            Err(CacheError::InvalidConfig(_))
        ));
        assert!(matches!(
            CacheConfig::from_json_str("{"),
            Err(CacheError::ConfigParse(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            CacheConfig::from_json_file("/nonexistent/latentkv.json"),
            Err(CacheError::Io(_))
        ));
    }
}
