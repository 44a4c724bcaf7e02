//! Execution-kernel call contract.
//!
//! The core never performs tensor arithmetic. It hands an executor
//! correctly shaped inputs (token histories, KV block addresses, a logits
//! workspace, a compute stream) and receives one next token per scheduled
//! branch. What happens on the device is the executor's business.

use std::sync::Arc;

use crate::config::{ModelConfig, SamplingConfig};
use crate::core::block::DeviceAddr;
use crate::core::context::{ComputeStream, Context};
use crate::core::request::RequestId;
use crate::error::Result;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F16,
    BF16,
    F32,
    U32,
    I32,
}

/// Descriptor of a device tensor: address, shape, element type.
///
/// The core supplies and owns the memory behind `addr`; it does not
/// inspect numerical contents.
#[derive(Debug, Clone)]
pub struct TensorRef {
    /// Device address of the first element.
    pub addr: DeviceAddr,
    /// Dimension sizes, outermost first.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
}

impl TensorRef {
    /// Total element count.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One scheduled generation branch within a step.
#[derive(Debug, Clone)]
pub struct StepSequence {
    /// Owning request.
    pub req_id: RequestId,
    /// Branch index within the request.
    pub branch: usize,
    /// Full token history, input first.
    pub tokens: Vec<u32>,
    /// Device addresses of the branch's KV cache blocks, logical order.
    pub kv_block_addrs: Vec<DeviceAddr>,
    /// Sampling parameters for this branch.
    pub sampling: SamplingConfig,
}

/// All branches stepped together in one execution call.
#[derive(Debug, Clone, Default)]
pub struct StepBatch {
    /// Scheduled branches, batch order.
    pub sequences: Vec<StepSequence>,
}

impl StepBatch {
    /// Number of branches in the batch.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Result of one execution step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Next token per branch, batch order.
    pub next_tokens: Vec<u32>,
}

/// A loaded model's forward-and-sample step.
///
/// Implementations run the actual kernels; the stub used in tests computes
/// tokens deterministically without touching the tensors.
pub trait ModelExecutor: Send + Sync {
    /// Execute one generation step for the whole batch.
    ///
    /// `logits` points at the instance's workspace, shaped
    /// `[batch, vocab_size]` in F32. Must return exactly one token per
    /// batch entry.
    fn execute(
        &self,
        batch: &StepBatch,
        logits: &TensorRef,
        stream: &ComputeStream,
    ) -> Result<StepOutput>;
}

/// Weight-loading collaborator, injected into the engine.
///
/// Stands in for whatever loads real model weights; out of scope here
/// beyond this contract.
pub trait ModelLoader {
    /// Produce a ready executor for `config`, bound to `context`.
    fn load(&self, config: &ModelConfig, context: &Arc<Context>) -> Result<Arc<dyn ModelExecutor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_num_elements() {
        let t = TensorRef { addr: 0, shape: vec![4, 32000], dtype: DType::F32 };
        assert_eq!(t.num_elements(), 128000);

        let scalar = TensorRef { addr: 0, shape: vec![], dtype: DType::F32 };
        assert_eq!(scalar.num_elements(), 1);
    }

    #[test]
    fn test_step_batch_len() {
        let batch = StepBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}
