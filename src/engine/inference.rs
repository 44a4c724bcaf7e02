//! Engine orchestration.
//!
//! The [`InferenceEngine`] wires configuration, the block allocator, the
//! loaded model instances and the batch manager together, and owns the
//! ingestion thread that reads front-end requests from the
//! [`RequestChannel`]. Initialization is all-or-nothing: any failure
//! surfaces as an error from [`InferenceEngine::new`] and no partially
//! initialized engine escapes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::allocator::{BlockAllocator, HostBackend, MemoryBackend};
use crate::core::context::Context;
use crate::core::id_generator::IdGenerator;
use crate::core::request::{RequestId, RequestInput};
use crate::engine::channel::RequestChannel;
use crate::engine::streaming::StreamingIterator;
use crate::error::{Error, Result};
use crate::model::{ModelInstance, ModelLoader};
use crate::scheduler::BatchManager;

/// Orchestrates initialization, ingestion and shutdown.
pub struct InferenceEngine {
    context: Arc<Context>,
    ids: Arc<IdGenerator>,
    allocator: Arc<BlockAllocator>,
    batch_manager: Arc<BatchManager>,
    model_instances: Vec<Arc<ModelInstance>>,
    channel: Arc<RequestChannel>,
    ingest_handle: Mutex<Option<JoinHandle<()>>>,
    terminated: Arc<AtomicBool>,
    started: AtomicBool,
}

impl InferenceEngine {
    /// Initialize an engine over host memory.
    ///
    /// Builds the context, the allocator and the batch manager, then loads
    /// and registers every configured model.
    ///
    /// # Errors
    ///
    /// Any configuration or loading failure. Treat a failure as fatal to
    /// this engine instance; there is no partial-start state.
    pub fn new(
        config: EngineConfig,
        loader: &dyn ModelLoader,
        channel: Arc<RequestChannel>,
    ) -> Result<Self> {
        Self::with_backend(config, loader, channel, Box::new(HostBackend::new()))
    }

    /// Initialize with a device-specific memory backend.
    pub fn with_backend(
        config: EngineConfig,
        loader: &dyn ModelLoader,
        channel: Arc<RequestChannel>,
        backend: Box<dyn MemoryBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let context = Arc::new(Context::new(
            config.tensor_parallel_size,
            config.pipeline_parallel_size,
        )?);
        let ids = Arc::new(IdGenerator::new());
        let allocator = Arc::new(BlockAllocator::new(
            config.allocator.clone(),
            backend,
            ids.clone(),
        )?);
        let batch_manager = Arc::new(BatchManager::new(
            allocator.clone(),
            config.scheduler.max_batch_size,
        ));

        let mut model_instances = Vec::with_capacity(config.models.len());
        for model_config in &config.models {
            let executor = loader.load(model_config, &context)?;
            let instance = Arc::new(ModelInstance::new(
                model_config.clone(),
                context.clone(),
                allocator.clone(),
                executor,
                config.scheduler.max_batch_size,
            )?);
            batch_manager.register_model_instance(instance.clone());
            model_instances.push(instance);
        }
        info!(
            models = model_instances.len(),
            blocks = config.allocator.block_num,
            "engine initialized"
        );

        Ok(Self {
            context,
            ids,
            allocator,
            batch_manager,
            model_instances,
            channel,
            ingest_handle: Mutex::new(None),
            terminated: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        })
    }

    /// Start the scheduling loop, then the ingestion thread.
    pub fn start(&self) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.batch_manager.start()?;

        let channel = self.channel.clone();
        let batch_manager = self.batch_manager.clone();
        let terminated = self.terminated.clone();
        let handle = std::thread::Builder::new()
            .name("tessera-ingest".into())
            .spawn(move || {
                info!("ingestion loop started");
                while let Some(input) = channel.read() {
                    if terminated.load(Ordering::Acquire) {
                        break;
                    }
                    let req_id = input.req_id;
                    // One bad request must not halt ingestion of the rest.
                    match batch_manager.enqueue(input) {
                        Ok(()) => debug!(req_id, "request handed to batch manager"),
                        Err(e) => warn!(req_id, error = %e, "failed to enqueue request"),
                    }
                }
                info!("ingestion loop exiting");
            })
            .map_err(|e| Error::Execution(format!("failed to spawn ingestion thread: {e}")))?;
        *self.ingest_handle.lock() = Some(handle);
        Ok(())
    }

    /// Forward one request to the batch manager, status unchanged.
    pub fn handle_request(&self, input: RequestInput) -> Result<()> {
        self.batch_manager.enqueue(input)
    }

    /// All tokens generated so far for a request, one vector per branch.
    pub fn fetch_result(&self, req_id: RequestId) -> Result<Vec<Vec<u32>>> {
        self.batch_manager.fetch_result(req_id)
    }

    /// Blocking streaming cursor over a request's generated tokens.
    pub fn stream(&self, req_id: RequestId) -> Result<StreamingIterator> {
        let (handle, waiter) = self.batch_manager.request_handle(req_id)?;
        Ok(StreamingIterator::new(handle, waiter))
    }

    /// Drain in-flight work, then tear the pipeline down. Idempotent.
    ///
    /// Order matters: the channel closes and the ingestion thread joins
    /// first, every admitted request runs to a terminal state, and only
    /// then does the scheduling loop stop.
    pub fn stop(&self) -> Result<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("stopping engine");
        self.channel.close();
        let handle = self.ingest_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("ingestion thread panicked");
            }
        }
        info!("waiting for in-flight requests");
        if let Err(e) = self.batch_manager.wait_all_done() {
            warn!(error = %e, "drain interrupted");
        }
        self.batch_manager.stop();
        info!("engine stopped");
        Ok(())
    }

    /// Shared id generator, for front ends assigning request ids.
    pub fn id_generator(&self) -> Arc<IdGenerator> {
        self.ids.clone()
    }

    /// The engine's block allocator, for capacity introspection.
    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    /// The execution context.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// The batch manager.
    pub fn batch_manager(&self) -> &Arc<BatchManager> {
        &self.batch_manager
    }

    /// Loaded model instances.
    pub fn model_instances(&self) -> &[Arc<ModelInstance>] {
        &self.model_instances
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::Acquire) && self.started.load(Ordering::Acquire) {
            let _ = self.stop();
        }
    }
}
