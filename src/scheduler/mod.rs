//! Continuous batching.
//!
//! This module owns the full lifecycle of admitted requests: FIFO
//! admission under memory-block backpressure, per-step batched execution,
//! output recording, and terminal-state reclamation.

pub mod batch_manager;

pub use batch_manager::BatchManager;
