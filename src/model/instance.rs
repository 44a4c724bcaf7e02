//! Loaded model instances.
//!
//! A [`ModelInstance`] is a ready-to-execute model bound to the process
//! context. Instances are read-only during inference and shared across all
//! requests naming their model. Each instance claims a logits workspace
//! from the allocator's contiguous pool at construction and releases it
//! when dropped.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::core::allocator::BlockAllocator;
use crate::core::block::BlockId;
use crate::core::context::Context;
use crate::error::{Error, Result};
use crate::model::executor::{DType, ModelExecutor, StepBatch, TensorRef};

/// A loaded, executable model.
pub struct ModelInstance {
    config: ModelConfig,
    context: Arc<Context>,
    allocator: Arc<BlockAllocator>,
    executor: Arc<dyn ModelExecutor>,
    workspace: BlockId,
    max_batch_size: usize,
}

impl ModelInstance {
    /// Bind an executor to the context and claim its logits workspace
    /// (`max_batch_size * vocab_size` F32 elements) from the contiguous
    /// pool.
    pub fn new(
        config: ModelConfig,
        context: Arc<Context>,
        allocator: Arc<BlockAllocator>,
        executor: Arc<dyn ModelExecutor>,
        max_batch_size: usize,
    ) -> Result<Self> {
        let workspace_bytes = max_batch_size * config.vocab_size * std::mem::size_of::<f32>();
        let workspace = allocator.allocate_contiguous(workspace_bytes)?;
        info!(
            model = %config.name,
            workspace_bytes,
            "loaded model instance"
        );
        Ok(Self {
            config,
            context,
            allocator,
            executor,
            workspace,
            max_batch_size,
        })
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Maximum total sequence length this model supports.
    pub fn max_context_len(&self) -> usize {
        self.config.max_context_len
    }

    /// End-of-sequence token id.
    pub fn eos_token_id(&self) -> u32 {
        self.config.eos_token_id
    }

    /// Execute one generation step, returning one next token per branch.
    pub fn execute_step(&self, batch: &StepBatch) -> Result<Vec<u32>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.len() > self.max_batch_size {
            return Err(Error::Execution(format!(
                "batch of {} exceeds max_batch_size {}",
                batch.len(),
                self.max_batch_size
            )));
        }

        let addr = self.allocator.contiguous_ptr(self.workspace)?;
        let logits = TensorRef {
            addr,
            shape: vec![batch.len(), self.config.vocab_size],
            dtype: DType::F32,
        };
        let stream = self
            .context
            .stream(0)
            .ok_or_else(|| Error::Execution("context has no rank-0 stream".into()))?;

        let output = self.executor.execute(batch, &logits, stream)?;
        if output.next_tokens.len() != batch.len() {
            return Err(Error::Execution(format!(
                "executor returned {} tokens for a batch of {}",
                output.next_tokens.len(),
                batch.len()
            )));
        }
        Ok(output.next_tokens)
    }
}

impl Drop for ModelInstance {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.free_contiguous(self.workspace) {
            debug!(model = %self.config.name, error = %e, "workspace already released");
        }
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.config.name)
            .field("max_context_len", &self.config.max_context_len)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}
