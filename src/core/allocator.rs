//! Block-based device-memory management.
//!
//! The [`BlockAllocator`] owns two independent pools:
//!
//! - a fixed pool of equally-sized blocks, pre-allocated as one slab and
//!   partitioned at construction so block addresses stay stable for the
//!   process lifetime;
//! - a budgeted pool of variably-sized contiguous regions.
//!
//! The pools are guarded by separate locks and never contend with each
//! other. Raw memory acquisition is delegated to an injected
//! [`MemoryBackend`], so the allocator is agnostic to whether it manages
//! host or accelerator memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::AllocatorConfig;
use crate::core::block::{BlockId, DeviceAddr, MemoryBlock};
use crate::core::id_generator::IdGenerator;
use crate::error::{Error, Result};

/// Raw device-memory capability, implemented per device backend and
/// injected into the allocator at construction.
pub trait MemoryBackend: Send + Sync {
    /// Acquire `bytes` of device memory, returning its address.
    fn acquire(&self, bytes: usize) -> Result<DeviceAddr>;

    /// Release a previously acquired address.
    fn release(&self, addr: DeviceAddr) -> Result<()>;
}

/// Heap-backed [`MemoryBackend`].
///
/// Buffers stay alive (and their addresses stable) until released.
#[derive(Debug, Default)]
pub struct HostBackend {
    allocations: Mutex<HashMap<DeviceAddr, Box<[u8]>>>,
}

impl HostBackend {
    /// Create an empty host backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations, for tests and introspection.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }
}

impl MemoryBackend for HostBackend {
    fn acquire(&self, bytes: usize) -> Result<DeviceAddr> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("zero-byte allocation".into()));
        }
        let buffer = vec![0u8; bytes].into_boxed_slice();
        let addr = buffer.as_ptr() as DeviceAddr;
        self.allocations.lock().insert(addr, buffer);
        Ok(addr)
    }

    fn release(&self, addr: DeviceAddr) -> Result<()> {
        self.allocations
            .lock()
            .remove(&addr)
            .map(|_| ())
            .ok_or(Error::UnknownAddress(addr))
    }
}

/// The blocked pool: every block is in exactly one of these maps.
#[derive(Debug, Default)]
struct BlockPools {
    free: HashMap<BlockId, MemoryBlock>,
    used: HashMap<BlockId, MemoryBlock>,
}

/// The contiguous pool: live regions plus the remaining byte budget.
#[derive(Debug)]
struct ContiguousPool {
    used: HashMap<BlockId, MemoryBlock>,
    remaining: usize,
}

/// Thread-safe allocator over blocked and contiguous device memory.
pub struct BlockAllocator {
    config: AllocatorConfig,
    ids: Arc<IdGenerator>,
    backend: Box<dyn MemoryBackend>,
    slab: DeviceAddr,
    blocks: Mutex<BlockPools>,
    contiguous: Mutex<ContiguousPool>,
}

impl BlockAllocator {
    /// Create an allocator, pre-allocating the full blocked budget.
    ///
    /// The whole slab is acquired in one backend call and partitioned into
    /// `block_num` equal slices, each registered as a free block with a
    /// fresh id from the shared generator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a degenerate configuration, or the
    /// backend's error if the slab cannot be acquired.
    pub fn new(
        config: AllocatorConfig,
        backend: Box<dyn MemoryBackend>,
        ids: Arc<IdGenerator>,
    ) -> Result<Self> {
        if config.block_size == 0 || config.block_num == 0 || config.block_token_num == 0 {
            return Err(Error::Config("block_size, block_num and block_token_num must be positive".into()));
        }

        let slab = backend.acquire(config.block_size * config.block_num)?;
        let mut free = HashMap::with_capacity(config.block_num);
        for i in 0..config.block_num {
            let block_id = ids.next_id();
            free.insert(
                block_id,
                MemoryBlock {
                    block_id,
                    addr: slab + i * config.block_size,
                    size: config.block_size,
                },
            );
        }
        debug!(
            block_num = config.block_num,
            block_size = config.block_size,
            contiguous_bytes = config.contiguous_bytes,
            "pre-allocated block pool"
        );

        let contiguous = ContiguousPool {
            used: HashMap::new(),
            remaining: config.contiguous_bytes,
        };

        Ok(Self {
            config,
            ids,
            backend,
            slab,
            blocks: Mutex::new(BlockPools { free, used: HashMap::new() }),
            contiguous: Mutex::new(contiguous),
        })
    }

    /// Allocator configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Number of tokens one block covers.
    pub fn block_token_num(&self) -> usize {
        self.config.block_token_num
    }

    /// Atomically reserve `count` blocks.
    ///
    /// All-or-nothing: on [`Error::OutOfBlocks`] the pool is unchanged.
    pub fn allocate_blocks(&self, count: usize) -> Result<Vec<BlockId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut pools = self.blocks.lock();
        if pools.free.len() < count {
            return Err(Error::OutOfBlocks);
        }
        let ids: Vec<BlockId> = pools.free.keys().take(count).copied().collect();
        for id in &ids {
            if let Some(block) = pools.free.remove(id) {
                pools.used.insert(*id, block);
            }
        }
        Ok(ids)
    }

    /// Return blocks to the free pool.
    ///
    /// Fails with [`Error::UnknownBlock`] (pool unchanged) if any id is not
    /// currently used: a double-free, an unknown id, or a duplicate within
    /// `block_ids` itself.
    pub fn free_blocks(&self, block_ids: &[BlockId]) -> Result<()> {
        let mut pools = self.blocks.lock();
        let mut seen = HashSet::with_capacity(block_ids.len());
        for id in block_ids {
            if !pools.used.contains_key(id) || !seen.insert(*id) {
                return Err(Error::UnknownBlock(*id));
            }
        }
        for id in block_ids {
            if let Some(block) = pools.used.remove(id) {
                pools.free.insert(*id, block);
            }
        }
        Ok(())
    }

    /// Reserve one contiguous region of `size` bytes.
    ///
    /// The contiguous budget is independent of the blocked pool.
    pub fn allocate_contiguous(&self, size: usize) -> Result<BlockId> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-byte contiguous allocation".into()));
        }
        let mut pool = self.contiguous.lock();
        if pool.remaining < size {
            return Err(Error::OutOfContiguousMemory {
                requested: size,
                remaining: pool.remaining,
            });
        }
        let addr = self.backend.acquire(size)?;
        let block_id = self.ids.next_id();
        pool.used.insert(block_id, MemoryBlock { block_id, addr, size });
        pool.remaining -= size;
        Ok(block_id)
    }

    /// Release a contiguous region back to the budget.
    pub fn free_contiguous(&self, block_id: BlockId) -> Result<()> {
        let mut pool = self.contiguous.lock();
        let block = pool.used.remove(&block_id).ok_or(Error::UnknownBlock(block_id))?;
        match self.backend.release(block.addr) {
            Ok(()) => {
                pool.remaining += block.size;
                Ok(())
            }
            Err(e) => {
                pool.used.insert(block_id, block);
                Err(e)
            }
        }
    }

    /// Addresses of used blocks, in the order given. Pure lookup.
    pub fn block_ptrs(&self, block_ids: &[BlockId]) -> Result<Vec<DeviceAddr>> {
        let pools = self.blocks.lock();
        block_ids
            .iter()
            .map(|id| pools.used.get(id).map(|b| b.addr).ok_or(Error::UnknownBlock(*id)))
            .collect()
    }

    /// Address of a used contiguous region. Pure lookup.
    pub fn contiguous_ptr(&self, block_id: BlockId) -> Result<DeviceAddr> {
        self.contiguous
            .lock()
            .used
            .get(&block_id)
            .map(|b| b.addr)
            .ok_or(Error::UnknownBlock(block_id))
    }

    /// Free block count. Point-in-time: may be stale under contention,
    /// which is fine for scheduling heuristics.
    pub fn free_block_count(&self) -> usize {
        self.blocks.lock().free.len()
    }

    /// Used block count. Same staleness caveat as [`free_block_count`](Self::free_block_count).
    pub fn used_block_count(&self) -> usize {
        self.blocks.lock().used.len()
    }

    /// Remaining contiguous budget in bytes.
    pub fn contiguous_remaining(&self) -> usize {
        self.contiguous.lock().remaining
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        let mut pool = self.contiguous.lock();
        for (_, block) in pool.used.drain() {
            if let Err(e) = self.backend.release(block.addr) {
                warn!(block_id = block.block_id, error = %e, "leaked contiguous region");
            }
        }
        drop(pool);
        if let Err(e) = self.backend.release(self.slab) {
            warn!(error = %e, "leaked block slab");
        }
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("config", &self.config)
            .field("free", &self.free_block_count())
            .field("used", &self.used_block_count())
            .field("contiguous_remaining", &self.contiguous_remaining())
            .finish()
    }
}
