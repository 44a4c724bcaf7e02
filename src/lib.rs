//! tessera-llm: a block-based LLM inference serving core.
//!
//! This crate implements the serving-side machinery of an inference
//! engine, leaving kernel numerics to pluggable executors:
//! - Block-based device-memory management with pre-allocated pools
//! - Continuous batching under memory-block backpressure
//! - A closable request channel and blocking streaming iterators
//! - Clean drain-and-shutdown semantics

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod model;
pub mod scheduler;

pub use config::{AllocatorConfig, EngineConfig, ModelConfig, SamplingConfig, SchedulerConfig};
pub use crate::core::allocator::{BlockAllocator, HostBackend, MemoryBackend};
pub use crate::core::block::{blocks_needed, BlockId, DeviceAddr, MemoryBlock};
pub use crate::core::context::{ComputeStream, Context};
pub use crate::core::id_generator::IdGenerator;
pub use crate::core::request::{FinishReason, Request, RequestId, RequestInput, RequestState};
pub use crate::core::waiter::Waiter;
pub use engine::{InferenceEngine, RequestChannel, StreamingIterator};
pub use error::{Error, ErrorKind, Result};
pub use model::{
    DType, ModelExecutor, ModelInstance, ModelLoader, StepBatch, StepOutput, StepSequence,
    StubExecutor, StubLoader, TensorRef,
};
pub use scheduler::BatchManager;
