//! Request state tracking.
//!
//! A request enters the system as a [`RequestInput`] written into the
//! request channel by a front end, and lives inside the batch manager as a
//! [`Request`]: one [`SequenceState`] per generation branch, a lifecycle
//! state, and the waiter its consumers block on.

use std::sync::Arc;

use crate::config::SamplingConfig;
use crate::core::block::BlockId;
use crate::core::waiter::Waiter;

/// Unique identifier for a request.
pub type RequestId = u64;

/// A request as produced by a front end.
///
/// The waiter is created by the producer, which keeps a clone to block on
/// until results become available.
#[derive(Debug, Clone)]
pub struct RequestInput {
    /// Unique request id, assigned by the front end from the shared
    /// [`IdGenerator`](crate::core::id_generator::IdGenerator).
    pub req_id: RequestId,
    /// Name of the model that should serve this request.
    pub model_name: String,
    /// Input token ids, one sequence per generation branch.
    pub token_sequences: Vec<Vec<u32>>,
    /// Sampling configuration, one per branch.
    pub sampling_configs: Vec<SamplingConfig>,
    /// Notification primitive consumers block on.
    pub waiter: Arc<Waiter>,
}

/// Lifecycle state of a request inside the batch manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Admitted, waiting for memory blocks.
    Pending,
    /// Part of the active batch.
    Active,
    /// Terminal; blocks released.
    Finished,
}

/// Reason a generation branch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Sampling config's token limit reached.
    MaxTokens,
    /// Model's maximum context length reached.
    ContextFull,
    /// A configured stop token was generated.
    StopSequence,
    /// Aborted by shutdown or an execution failure.
    Aborted,
}

/// Per-branch generation state.
#[derive(Debug, Clone)]
pub struct SequenceState {
    /// Input token ids.
    pub input_tokens: Vec<u32>,
    /// Generated token ids, in emission order.
    pub output_tokens: Vec<u32>,
    /// Sampling configuration for this branch.
    pub sampling: SamplingConfig,
    /// Blocks currently held by this branch. Drained exactly once when the
    /// branch finishes.
    pub block_ids: Vec<BlockId>,
    /// Why the branch stopped, once terminal.
    pub finish_reason: Option<FinishReason>,
}

impl SequenceState {
    /// Create a fresh branch from its input and sampling config.
    pub fn new(input_tokens: Vec<u32>, sampling: SamplingConfig) -> Self {
        Self {
            input_tokens,
            output_tokens: Vec::new(),
            sampling,
            block_ids: Vec::new(),
            finish_reason: None,
        }
    }

    /// Total length (input + output).
    pub fn total_len(&self) -> usize {
        self.input_tokens.len() + self.output_tokens.len()
    }

    /// Whether the branch reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Full token history, input first.
    pub fn all_tokens(&self) -> Vec<u32> {
        let mut tokens = self.input_tokens.clone();
        tokens.extend(&self.output_tokens);
        tokens
    }
}

/// A request as tracked by the batch manager.
///
/// Mutated only by the scheduling loop; consumers read it through the
/// surrounding mutex and block on the waiter.
#[derive(Debug)]
pub struct Request {
    /// Unique request id.
    pub req_id: RequestId,
    /// Owning model name.
    pub model_name: String,
    /// Generation branches.
    pub sequences: Vec<SequenceState>,
    /// Lifecycle state.
    pub state: RequestState,
    /// Notification primitive shared with consumers.
    pub waiter: Arc<Waiter>,
}

impl Request {
    /// Build the internal record from a front-end input.
    ///
    /// Caller has already validated branch counts; this just pairs each
    /// input sequence with its sampling config.
    pub fn from_input(input: RequestInput) -> Self {
        let sequences = input
            .token_sequences
            .into_iter()
            .zip(input.sampling_configs)
            .map(|(tokens, sampling)| SequenceState::new(tokens, sampling))
            .collect();
        Self {
            req_id: input.req_id,
            model_name: input.model_name,
            sequences,
            state: RequestState::Pending,
            waiter: input.waiter,
        }
    }

    /// Whether every branch reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state == RequestState::Finished
    }

    /// Generated tokens per branch, cloned.
    pub fn output_tokens(&self) -> Vec<Vec<u32>> {
        self.sequences.iter().map(|s| s.output_tokens.clone()).collect()
    }
}
