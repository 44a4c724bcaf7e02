//! Configuration types for tessera-llm.
//!
//! All configuration is supplied as already-parsed structures; the engine
//! only checks them with [`EngineConfig::validate`] before construction.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Block allocator configuration.
///
/// Fixed at construction, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Number of tokens a block covers (scheduling granularity).
    pub block_token_num: usize,
    /// Size of one block in bytes.
    pub block_size: usize,
    /// Total number of blocks in the pool.
    pub block_num: usize,
    /// Total budget for contiguous allocations, in bytes.
    pub contiguous_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_token_num: 16,
            block_size: 256 * 1024,
            block_num: 512,
            contiguous_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of sequences stepped together in one batch.
    pub max_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_batch_size: 64 }
    }
}

/// Sampling configuration, one per generation branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (1.0 = no change).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Token ids that stop generation when produced.
    pub stop_token_ids: Vec<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            stop_token_ids: Vec::new(),
        }
    }
}

/// Per-model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, used to route requests.
    pub name: String,
    /// Maximum total sequence length (prompt + output).
    pub max_context_len: usize,
    /// End-of-sequence token id.
    pub eos_token_id: u32,
    /// Vocabulary size, used to shape the logits workspace.
    pub vocab_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_context_len: 2048,
            eos_token_id: 2,
            vocab_size: 32000,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Block allocator configuration.
    pub allocator: AllocatorConfig,
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
    /// Tensor parallel degree.
    pub tensor_parallel_size: usize,
    /// Pipeline parallel degree.
    pub pipeline_parallel_size: usize,
    /// Models to load at initialization.
    pub models: Vec<ModelConfig>,
}

impl EngineConfig {
    /// Check that every section is present and well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    /// Any failure here is fatal to the engine instance.
    pub fn validate(&self) -> Result<()> {
        if self.allocator.block_token_num == 0 {
            return Err(Error::Config("block_token_num must be positive".into()));
        }
        if self.allocator.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if self.allocator.block_num == 0 {
            return Err(Error::Config("block_num must be positive".into()));
        }
        if self.scheduler.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be positive".into()));
        }
        if self.tensor_parallel_size == 0 || self.pipeline_parallel_size == 0 {
            return Err(Error::Config("parallel degrees must be positive".into()));
        }
        if self.models.is_empty() {
            return Err(Error::Config("no models configured".into()));
        }
        for model in &self.models {
            if model.name.is_empty() {
                return Err(Error::Config("model name must not be empty".into()));
            }
            if model.max_context_len == 0 {
                return Err(Error::Config(format!(
                    "model '{}': max_context_len must be positive",
                    model.name
                )));
            }
            if model.vocab_size == 0 {
                return Err(Error::Config(format!(
                    "model '{}': vocab_size must be positive",
                    model.name
                )));
            }
        }
        let mut names: Vec<&str> = self.models.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.models.len() {
            return Err(Error::Config("duplicate model names".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EngineConfig {
        EngineConfig {
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            models: vec![ModelConfig::default()],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_no_models() {
        let mut config = valid_config();
        config.models.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_parallel_degree() {
        let mut config = valid_config();
        config.tensor_parallel_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_blocks() {
        let mut config = valid_config();
        config.allocator.block_num = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_model_names() {
        let mut config = valid_config();
        config.models.push(ModelConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = valid_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.allocator.block_num, config.allocator.block_num);
        assert_eq!(parsed.models.len(), 1);
    }
}
