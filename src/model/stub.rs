//! Deterministic stand-in executor.
//!
//! Used by the demo binary and the test suite where real kernels are not
//! available. Successor mode emits `last_token + 1` (mod vocab), fixed
//! mode always emits the same token, so tests can trigger end-of-sequence
//! and stop-token paths on demand.

use std::sync::Arc;

use crate::config::ModelConfig;
use crate::core::context::{ComputeStream, Context};
use crate::error::{Error, Result};
use crate::model::executor::{ModelExecutor, ModelLoader, StepBatch, StepOutput, TensorRef};

/// Deterministic [`ModelExecutor`].
#[derive(Debug, Clone)]
pub struct StubExecutor {
    vocab_size: usize,
    fixed: Option<u32>,
}

impl StubExecutor {
    /// Successor mode: each branch's next token is `last + 1` mod vocab.
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size, fixed: None }
    }

    /// Fixed mode: every branch always receives `token`.
    pub fn fixed(token: u32) -> Self {
        Self { vocab_size: 0, fixed: Some(token) }
    }
}

impl ModelExecutor for StubExecutor {
    fn execute(
        &self,
        batch: &StepBatch,
        logits: &TensorRef,
        _stream: &ComputeStream,
    ) -> Result<StepOutput> {
        if logits.shape.first() != Some(&batch.len()) {
            return Err(Error::Execution(format!(
                "logits shape {:?} does not match batch of {}",
                logits.shape,
                batch.len()
            )));
        }

        let mut next_tokens = Vec::with_capacity(batch.len());
        for seq in &batch.sequences {
            let last = seq.tokens.last().copied().ok_or_else(|| {
                Error::Execution(format!("request {} branch {} has no tokens", seq.req_id, seq.branch))
            })?;
            let next = match self.fixed {
                Some(token) => token,
                None => (last + 1) % self.vocab_size.max(1) as u32,
            };
            next_tokens.push(next);
        }
        Ok(StepOutput { next_tokens })
    }
}

/// Loader producing successor-mode stubs from the model config.
#[derive(Debug, Default)]
pub struct StubLoader;

impl ModelLoader for StubLoader {
    fn load(&self, config: &ModelConfig, _context: &Arc<Context>) -> Result<Arc<dyn ModelExecutor>> {
        Ok(Arc::new(StubExecutor::new(config.vocab_size)))
    }
}
