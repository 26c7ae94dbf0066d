//! Configuration types for the SHGAT engine

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

/// Engine configuration
///
/// Dimensions are fixed for the lifetime of an engine; the head count may be
/// left unset to let the engine pick one from the graph size on first use.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Width of tool / capability / intent embeddings
    pub embedding_dim: usize,

    /// Width of a single attention head
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,

    /// Fixed head count; when absent the engine chooses adaptively
    #[serde(default)]
    pub num_heads: Option<usize>,

    /// Seed for parameter initialization and replay sampling
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// SGD learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// L2 regularization strength
    #[serde(default = "default_l2_lambda")]
    pub l2_lambda: f32,

    /// Gradient-norm threshold that triggers a warning log
    #[serde(default = "default_gradient_warn_norm")]
    pub gradient_warn_norm: f32,
}

impl EngineConfig {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            head_dim: default_head_dim(),
            num_heads: None,
            seed: default_seed(),
            learning_rate: default_learning_rate(),
            l2_lambda: default_l2_lambda(),
            gradient_warn_norm: default_gradient_warn_norm(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(Error::Config("embedding_dim must be positive".to_string()));
        }
        if self.head_dim == 0 {
            return Err(Error::Config("head_dim must be positive".to_string()));
        }
        if let Some(heads) = self.num_heads {
            if heads == 0 || heads % 2 != 0 {
                return Err(Error::Config(format!(
                    "num_heads must be a positive even number, got {}",
                    heads
                )));
            }
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 2.0) {
            return Err(Error::Config(format!(
                "learning_rate must be in (0, 2], got {}",
                self.learning_rate
            )));
        }
        if self.l2_lambda < 0.0 {
            return Err(Error::Config("l2_lambda must be non-negative".to_string()));
        }
        Ok(())
    }
}

/// Batch-training configuration for the out-of-process worker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    /// Number of single-example gradient steps to run
    #[serde(default = "default_steps")]
    pub steps: usize,

    /// Replay sampling exponent
    #[serde(default = "default_replay_alpha")]
    pub replay_alpha: f32,

    /// Lower bound for example priorities
    #[serde(default = "default_min_priority")]
    pub min_priority: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            replay_alpha: default_replay_alpha(),
            min_priority: default_min_priority(),
        }
    }
}

// Default value functions
fn default_head_dim() -> usize {
    16
}

fn default_seed() -> u64 {
    42
}

fn default_learning_rate() -> f32 {
    0.05
}

fn default_l2_lambda() -> f32 {
    1e-4
}

fn default_gradient_warn_norm() -> f32 {
    100.0
}

fn default_steps() -> usize {
    256
}

fn default_replay_alpha() -> f32 {
    0.6
}

fn default_min_priority() -> f32 {
    1e-3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new(1024);
        assert_eq!(config.head_dim, 16);
        assert_eq!(config.seed, 42);
        assert!(config.num_heads.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_deserialization_fills_defaults() {
        let config: EngineConfig = serde_yaml::from_str("embedding_dim: 256\n").unwrap();
        assert_eq!(config.embedding_dim, 256);
        assert_eq!(config.head_dim, 16);
        assert_eq!(config.learning_rate, 0.05);
    }

    #[test]
    fn test_validation_rejects_odd_heads() {
        let mut config = EngineConfig::new(64);
        config.num_heads = Some(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_learning_rate() {
        let mut config = EngineConfig::new(64);
        config.learning_rate = 2.5;
        assert!(config.validate().is_err());
        config.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }
}
