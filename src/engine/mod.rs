//! Inference engine.
//!
//! This module contains:
//! - InferenceEngine for orchestrating initialization and ingestion
//! - RequestChannel, the closable queue between front ends and the engine
//! - StreamingIterator for blocking per-request token delivery

pub mod channel;
pub mod inference;
pub mod streaming;

pub use channel::RequestChannel;
pub use inference::InferenceEngine;
pub use streaming::StreamingIterator;
