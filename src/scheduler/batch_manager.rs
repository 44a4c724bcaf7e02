//! Batch manager: request lifecycle and the scheduling loop.
//!
//! Admitted requests wait in a FIFO pending queue and are promoted into
//! the active batch when the allocator can cover their prompt blocks.
//! Each scheduling step grows active sequences across block boundaries,
//! executes one generation step per model for every runnable branch,
//! records outputs, and reclaims the blocks of terminal requests.
//!
//! Backpressure policy: an active branch that cannot acquire its next
//! block is not evicted. It stalls, holding its blocks, until a later
//! step succeeds; completing in-flight work always wins over admitting
//! new work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::core::allocator::BlockAllocator;
use crate::core::block::blocks_needed;
use crate::core::request::{FinishReason, Request, RequestId, RequestInput, RequestState};
use crate::core::waiter::Waiter;
use crate::error::{Error, Result};
use crate::model::{ModelInstance, StepBatch, StepSequence};

/// Shared handle to one request's mutable state.
pub type RequestHandle = Arc<Mutex<Request>>;

#[derive(Default)]
struct SchedState {
    /// Admitted, not yet holding blocks. Arrival order.
    pending: VecDeque<RequestId>,
    /// Requests in the active batch.
    active: Vec<RequestId>,
    /// Every request this manager has seen, terminal ones included so
    /// results stay fetchable after completion.
    requests: HashMap<RequestId, RequestHandle>,
}

/// Branches scheduled against one model instance this step.
struct ModelBatch {
    instance: Arc<ModelInstance>,
    entries: Vec<(RequestHandle, usize)>,
}

/// Owns request admission, batching, execution, and result queries.
pub struct BatchManager {
    allocator: Arc<BlockAllocator>,
    max_batch_size: usize,
    models: Mutex<HashMap<String, Arc<ModelInstance>>>,
    state: Mutex<SchedState>,
    /// Wakes the scheduling loop when work arrives or stop is requested.
    wake: Condvar,
    /// Signalled on every terminal transition, for `wait_all_done`.
    done: Condvar,
    running: AtomicBool,
    stopped: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchManager {
    /// Create a manager over the given allocator.
    pub fn new(allocator: Arc<BlockAllocator>, max_batch_size: usize) -> Self {
        Self {
            allocator,
            max_batch_size,
            models: Mutex::new(HashMap::new()),
            state: Mutex::new(SchedState::default()),
            wake: Condvar::new(),
            done: Condvar::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    /// Register a model as servable. Must happen before [`start`](Self::start).
    pub fn register_model_instance(&self, instance: Arc<ModelInstance>) {
        let name = instance.name().to_string();
        if self.models.lock().insert(name.clone(), instance).is_some() {
            warn!(model = %name, "model instance replaced");
        } else {
            info!(model = %name, "model instance registered");
        }
    }

    /// Admit a new request into the pending queue.
    ///
    /// Admission never requires block availability; the scheduling loop
    /// promotes the request once its prompt blocks can be covered.
    ///
    /// # Errors
    ///
    /// [`Error::ModelNotFound`] for an unregistered model,
    /// [`Error::EmptyInput`] for an empty sequence list or branch,
    /// [`Error::InvalidArgument`] for count mismatches, zero `max_tokens`,
    /// prompts that already exceed the model context, or a duplicate id,
    /// [`Error::Terminated`] after [`stop`](Self::stop).
    pub fn enqueue(&self, input: RequestInput) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        let max_context = {
            let models = self.models.lock();
            models
                .get(&input.model_name)
                .ok_or_else(|| Error::ModelNotFound(input.model_name.clone()))?
                .max_context_len()
        };
        if input.token_sequences.is_empty() || input.token_sequences.iter().any(Vec::is_empty) {
            return Err(Error::EmptyInput);
        }
        if input.sampling_configs.len() != input.token_sequences.len() {
            return Err(Error::InvalidArgument(format!(
                "{} token sequences but {} sampling configs",
                input.token_sequences.len(),
                input.sampling_configs.len()
            )));
        }
        for (i, (tokens, sampling)) in input
            .token_sequences
            .iter()
            .zip(&input.sampling_configs)
            .enumerate()
        {
            if sampling.max_tokens == 0 {
                return Err(Error::InvalidArgument(format!("branch {i}: max_tokens must be positive")));
            }
            if tokens.len() >= max_context {
                return Err(Error::InvalidArgument(format!(
                    "branch {i}: input length {} exceeds model context {max_context}",
                    tokens.len()
                )));
            }
        }

        let req_id = input.req_id;
        let branches = input.token_sequences.len();
        let request = Request::from_input(input);

        let mut st = self.state.lock();
        if st.requests.contains_key(&req_id) {
            return Err(Error::InvalidArgument(format!("duplicate request id {req_id}")));
        }
        st.requests.insert(req_id, Arc::new(Mutex::new(request)));
        st.pending.push_back(req_id);
        debug!(req_id, branches, "request enqueued");
        self.wake.notify_one();
        Ok(())
    }

    /// All tokens generated so far, one vector per branch. Never blocks.
    pub fn fetch_result(&self, req_id: RequestId) -> Result<Vec<Vec<u32>>> {
        let handle = self
            .state
            .lock()
            .requests
            .get(&req_id)
            .cloned()
            .ok_or(Error::RequestNotFound(req_id))?;
        let req = handle.lock();
        Ok(req.output_tokens())
    }

    /// Handle and waiter for a request, for streaming consumers.
    pub fn request_handle(&self, req_id: RequestId) -> Result<(RequestHandle, Arc<Waiter>)> {
        let handle = self
            .state
            .lock()
            .requests
            .get(&req_id)
            .cloned()
            .ok_or(Error::RequestNotFound(req_id))?;
        let waiter = handle.lock().waiter.clone();
        Ok((handle, waiter))
    }

    /// Number of requests waiting for admission into the active batch.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of requests in the active batch.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Start the scheduling loop on its own OS thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mgr = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("tessera-sched".into())
            .spawn(move || mgr.run_loop())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                Error::Execution(format!("failed to spawn scheduling loop: {e}"))
            })?;
        *self.loop_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the scheduling loop and abort anything still in flight.
    ///
    /// Does not return until no scheduling step is running. Idempotent.
    /// Callers wanting a graceful drain call [`wait_all_done`](Self::wait_all_done)
    /// first, as the engine's shutdown path does.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping batch manager");
        self.running.store(false, Ordering::Release);
        {
            let _st = self.state.lock();
            self.wake.notify_all();
        }
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("scheduling loop panicked");
            }
        }

        // Abort leftovers so no consumer blocks forever on a waiter.
        let leftovers: Vec<RequestHandle> = {
            let mut st = self.state.lock();
            st.pending.clear();
            st.active.clear();
            st.requests
                .values()
                .filter(|h| !h.lock().is_terminal())
                .cloned()
                .collect()
        };
        for handle in &leftovers {
            self.finish_request(handle, FinishReason::Aborted);
        }
        {
            let _st = self.state.lock();
            self.done.notify_all();
        }
        info!(aborted = leftovers.len(), "batch manager stopped");
    }

    /// Block until every request admitted before this call is terminal.
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] if the manager is stopped while waiting.
    pub fn wait_all_done(&self) -> Result<()> {
        let mut st = self.state.lock();
        let targets: Vec<RequestId> = st
            .requests
            .iter()
            .filter(|(_, h)| !h.lock().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(Error::Terminated);
            }
            let all_done = targets
                .iter()
                .all(|id| st.requests.get(id).map_or(true, |h| h.lock().is_terminal()));
            if all_done {
                return Ok(());
            }
            self.done.wait(&mut st);
        }
    }

    // ========== Scheduling loop ==========

    fn run_loop(&self) {
        info!("scheduling loop started");
        loop {
            let batches = {
                let mut st = self.state.lock();
                loop {
                    if !self.running.load(Ordering::Acquire) {
                        info!("scheduling loop exiting");
                        return;
                    }
                    let admitted = self.admit_pending(&mut st);
                    let batches = self.collect_runnable(&mut st);
                    if admitted == 0 && batches.is_empty() {
                        // Nothing runnable and nothing admitted; park until
                        // an enqueue or stop wakes us.
                        self.wake.wait(&mut st);
                        continue;
                    }
                    break batches;
                }
            };
            self.execute_batches(batches);
        }
    }

    /// Promote pending requests, head first, while their prompt blocks fit.
    ///
    /// Head-of-line blocking is deliberate: a later request never jumps an
    /// earlier one that is still waiting for memory.
    fn admit_pending(&self, st: &mut SchedState) -> usize {
        let token_num = self.allocator.block_token_num();
        let mut admitted = 0;
        while let Some(&req_id) = st.pending.front() {
            let Some(handle) = st.requests.get(&req_id).cloned() else {
                st.pending.pop_front();
                continue;
            };
            let mut req = handle.lock();
            let per_branch: Vec<usize> = req
                .sequences
                .iter()
                .map(|s| blocks_needed(s.input_tokens.len(), token_num))
                .collect();
            let total: usize = per_branch.iter().sum();
            match self.allocator.allocate_blocks(total) {
                Ok(ids) => {
                    let mut remaining = ids;
                    for (seq, count) in req.sequences.iter_mut().zip(&per_branch) {
                        let rest = remaining.split_off(*count);
                        seq.block_ids = remaining;
                        remaining = rest;
                    }
                    req.state = RequestState::Active;
                    drop(req);
                    st.pending.pop_front();
                    st.active.push(req_id);
                    admitted += 1;
                    debug!(req_id, blocks = total, "request activated");
                }
                Err(Error::OutOfBlocks) => {
                    trace!(
                        req_id,
                        needed = total,
                        free = self.allocator.free_block_count(),
                        "admission blocked on memory"
                    );
                    break;
                }
                Err(e) => {
                    drop(req);
                    st.pending.pop_front();
                    warn!(req_id, error = %e, "admission failed, aborting request");
                    self.finish_request(&handle, FinishReason::Aborted);
                    st.active.retain(|id| *id != req_id);
                    self.done.notify_all();
                }
            }
        }
        admitted
    }

    /// Growth-check every active branch and group the runnable ones by
    /// model. A branch that cannot get its next block stalls in place.
    fn collect_runnable(&self, st: &mut SchedState) -> Vec<ModelBatch> {
        if st.active.is_empty() {
            return Vec::new();
        }
        let models = self.models.lock().clone();
        let token_num = self.allocator.block_token_num();
        let mut batches: HashMap<String, ModelBatch> = HashMap::new();
        let mut finished_here: Vec<RequestId> = Vec::new();

        for req_id in st.active.clone() {
            let Some(handle) = st.requests.get(&req_id).cloned() else {
                continue;
            };
            let mut req = handle.lock();
            let Some(instance) = models.get(&req.model_name) else {
                // Registration precedes start, so an active request should
                // always find its model. Abort it if not.
                warn!(req_id, model = %req.model_name, "active request lost its model");
                self.abort_locked(&mut req);
                finished_here.push(req_id);
                continue;
            };

            for branch in 0..req.sequences.len() {
                let seq = &mut req.sequences[branch];
                if seq.is_finished() {
                    continue;
                }
                // The token produced this step lands at position total_len,
                // so capacity for total_len + 1 must exist before stepping.
                let needed = blocks_needed(seq.total_len() + 1, token_num);
                if needed > seq.block_ids.len() {
                    match self.allocator.allocate_blocks(needed - seq.block_ids.len()) {
                        Ok(ids) => seq.block_ids.extend(ids),
                        Err(Error::OutOfBlocks) => {
                            trace!(req_id, branch, "branch stalled on memory");
                            continue;
                        }
                        Err(e) => {
                            warn!(req_id, branch, error = %e, "block growth failed");
                            continue;
                        }
                    }
                }

                let entry = batches.entry(req.model_name.clone()).or_insert_with(|| ModelBatch {
                    instance: instance.clone(),
                    entries: Vec::new(),
                });
                if entry.entries.len() >= self.max_batch_size {
                    trace!(req_id, branch, "batch full, branch deferred");
                    continue;
                }
                entry.entries.push((handle.clone(), branch));
            }
        }

        if !finished_here.is_empty() {
            for req_id in finished_here {
                st.active.retain(|id| *id != req_id);
            }
            self.done.notify_all();
        }
        batches.into_values().collect()
    }

    /// Run one generation step for every model batch and apply the outputs.
    fn execute_batches(&self, batches: Vec<ModelBatch>) {
        for batch in batches {
            let mut step = StepBatch::default();
            let mut lookup_failed = false;
            for (handle, branch) in &batch.entries {
                let req = handle.lock();
                let seq = &req.sequences[*branch];
                match self.allocator.block_ptrs(&seq.block_ids) {
                    Ok(addrs) => step.sequences.push(StepSequence {
                        req_id: req.req_id,
                        branch: *branch,
                        tokens: seq.all_tokens(),
                        kv_block_addrs: addrs,
                        sampling: seq.sampling.clone(),
                    }),
                    Err(e) => {
                        error!(req_id = req.req_id, branch, error = %e, "block lookup failed");
                        lookup_failed = true;
                        break;
                    }
                }
            }
            if lookup_failed {
                self.abort_entries(&batch.entries);
                continue;
            }

            let tokens = match batch.instance.execute_step(&step) {
                Ok(tokens) => tokens,
                Err(e) => {
                    error!(model = batch.instance.name(), error = %e, "execution step failed");
                    self.abort_entries(&batch.entries);
                    continue;
                }
            };

            self.apply_outputs(&batch, tokens);
        }
    }

    /// Record one generated token per branch, finishing branches whose
    /// termination condition is met and reclaiming their blocks.
    fn apply_outputs(&self, batch: &ModelBatch, tokens: Vec<u32>) {
        let eos = batch.instance.eos_token_id();
        let max_context = batch.instance.max_context_len();
        let mut newly_terminal: Vec<(RequestId, RequestHandle)> = Vec::new();

        for ((handle, branch), token) in batch.entries.iter().zip(tokens) {
            let mut req = handle.lock();
            let req_id = req.req_id;
            let seq = &mut req.sequences[*branch];
            seq.output_tokens.push(token);

            // Termination policy: the stricter of the sampling limit and
            // the model context length applies; eos and stop tokens win
            // over both.
            let reason = if token == eos {
                Some(FinishReason::EndOfSequence)
            } else if seq.sampling.stop_token_ids.contains(&token) {
                Some(FinishReason::StopSequence)
            } else if seq.output_tokens.len() >= seq.sampling.max_tokens {
                Some(FinishReason::MaxTokens)
            } else if seq.total_len() >= max_context {
                Some(FinishReason::ContextFull)
            } else {
                None
            };

            if let Some(reason) = reason {
                seq.finish_reason = Some(reason);
                let ids = std::mem::take(&mut seq.block_ids);
                if let Err(e) = self.allocator.free_blocks(&ids) {
                    warn!(req_id, branch, error = %e, "block release failed");
                }
                debug!(req_id, branch, ?reason, "branch finished");
            }

            let terminal = req.sequences.iter().all(|s| s.is_finished());
            if terminal {
                req.state = RequestState::Finished;
            }
            let waiter = req.waiter.clone();
            drop(req);
            waiter.notify();
            if terminal {
                newly_terminal.push((req_id, handle.clone()));
            }
        }

        if !newly_terminal.is_empty() {
            let mut st = self.state.lock();
            for (req_id, _) in &newly_terminal {
                st.active.retain(|id| id != req_id);
                info!(req_id, "request finished");
            }
            self.done.notify_all();
        }
    }

    // ========== Termination helpers ==========

    /// Abort every branch of a locked request, releasing its blocks.
    fn abort_locked(&self, req: &mut Request) {
        for seq in &mut req.sequences {
            if seq.finish_reason.is_none() {
                seq.finish_reason = Some(FinishReason::Aborted);
            }
            let ids = std::mem::take(&mut seq.block_ids);
            if !ids.is_empty() {
                if let Err(e) = self.allocator.free_blocks(&ids) {
                    warn!(req_id = req.req_id, error = %e, "block release failed");
                }
            }
        }
        req.state = RequestState::Finished;
        req.waiter.notify();
    }

    /// Abort a request and notify its waiter. Caller must not hold the
    /// request lock or the scheduler state lock for the same request.
    fn finish_request(&self, handle: &RequestHandle, reason: FinishReason) {
        let mut req = handle.lock();
        let req_id = req.req_id;
        for seq in &mut req.sequences {
            if seq.finish_reason.is_none() {
                seq.finish_reason = Some(reason);
            }
            let ids = std::mem::take(&mut seq.block_ids);
            if !ids.is_empty() {
                if let Err(e) = self.allocator.free_blocks(&ids) {
                    warn!(req_id, error = %e, "block release failed");
                }
            }
        }
        req.state = RequestState::Finished;
        let waiter = req.waiter.clone();
        drop(req);
        waiter.notify();
        debug!(req_id, ?reason, "request finished early");
    }

    /// Abort every distinct request appearing in `entries`.
    fn abort_entries(&self, entries: &[(RequestHandle, usize)]) {
        let mut aborted: HashSet<RequestId> = HashSet::new();
        for (handle, _) in entries {
            let req_id = handle.lock().req_id;
            if aborted.insert(req_id) {
                self.finish_request(handle, FinishReason::Aborted);
            }
        }
        let mut st = self.state.lock();
        st.active.retain(|id| !aborted.contains(id));
        self.done.notify_all();
    }
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("BatchManager")
            .field("pending", &st.pending.len())
            .field("active", &st.active.len())
            .field("requests", &st.requests.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
