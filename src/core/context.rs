//! Process-wide execution context.
//!
//! The context holds one compute-stream handle per tensor/pipeline-parallel
//! rank. It is built once during engine initialization and shared by
//! reference (`Arc`) with model instances and device memory backends; none
//! of them own it.

use crate::error::{Error, Result};

/// Opaque per-rank compute-stream handle.
///
/// The core only threads these through to execution kernels; what a handle
/// means is up to the device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeStream {
    rank: usize,
    handle: u64,
}

impl ComputeStream {
    /// Rank this stream belongs to.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Raw stream handle.
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

/// Execution context for all parallel ranks.
#[derive(Debug)]
pub struct Context {
    tensor_parallel_size: usize,
    pipeline_parallel_size: usize,
    streams: Vec<ComputeStream>,
}

impl Context {
    /// Build a context with one stream per rank.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either parallel degree is zero.
    pub fn new(tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Result<Self> {
        if tensor_parallel_size == 0 || pipeline_parallel_size == 0 {
            return Err(Error::Config("parallel degrees must be positive".into()));
        }
        let world_size = tensor_parallel_size * pipeline_parallel_size;
        let streams = (0..world_size)
            .map(|rank| ComputeStream { rank, handle: rank as u64 })
            .collect();
        Ok(Self {
            tensor_parallel_size,
            pipeline_parallel_size,
            streams,
        })
    }

    /// Tensor parallel degree.
    pub fn tensor_parallel_size(&self) -> usize {
        self.tensor_parallel_size
    }

    /// Pipeline parallel degree.
    pub fn pipeline_parallel_size(&self) -> usize {
        self.pipeline_parallel_size
    }

    /// Total number of ranks.
    pub fn world_size(&self) -> usize {
        self.streams.len()
    }

    /// Stream for a given rank.
    pub fn stream(&self, rank: usize) -> Option<&ComputeStream> {
        self.streams.get(rank)
    }

    /// All streams, rank order.
    pub fn streams(&self) -> &[ComputeStream] {
        &self.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let context = Context::new(2, 2).unwrap();
        assert_eq!(context.tensor_parallel_size(), 2);
        assert_eq!(context.pipeline_parallel_size(), 2);
        assert_eq!(context.world_size(), 4);
        assert_eq!(context.stream(3).unwrap().rank(), 3);
        assert!(context.stream(4).is_none());
    }

    #[test]
    fn test_zero_degree_rejected() {
        assert!(Context::new(0, 1).is_err());
        assert!(Context::new(1, 0).is_err());
    }
}
