//! Command stream receiver: submission and completion engine of one hardware context.
//!
//! Counters that waits read (`task_count`, `latest_sent_task_count`,
//! `latest_flushed_task_count`) are atomics so a wait never needs the CSR lock; everything that
//! writes the command stream goes through [`CsrGuard`], obtained with
//! [`CommandStreamReceiver::obtain_unique_ownership`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use neo_cmd::records::{FlushDwFlags, MiBatchBufferEnd, MiBatchBufferStart, PipeControl};
use neo_cmd::CmdArena;
use tracing::{debug, error, trace, warn};

use crate::allocation::{
    AllocationId, AllocationType, CompletionFence, CompletionProof, GraphicsAllocation,
    OsContextId, TaskCount,
};
use crate::allocation_storage::{AllocationUsage, ContextRegistry, InternalAllocationStorage, TagView};
use crate::backend::{BatchBuffer, BatchSegment, SegmentKind, SubmissionBackend, SubmissionStatus};
use crate::config::DriverConfig;
use crate::device::EngineGroupType;
use crate::error::{ZeError, ZeResult};
use crate::hw::{CommandEncoder, PostSyncArgs};
use crate::linear_stream::LinearStream;
use crate::memory_manager::{AllocationProperties, MemoryManager};
use crate::pause::{self, OperatorIo, PauseState, PauseThread};
use crate::stats::SubmissionStats;
use crate::stream_properties::{PreemptionMode, StreamProperties};

pub const TAG_ALLOCATION_SIZE: u64 = 4096;
/// Offset of the operator pause slot in the tag allocation.
pub const PAUSE_SLOT_OFFSET: u64 = 2048;
/// Tag value before the first submission completes.
pub const INITIAL_TAG_VALUE: TaskCount = 0;

const CHAIN_RESERVE: usize = core::mem::size_of::<MiBatchBufferStart>();
const PREEMPTION_ALLOCATION_SIZE: u64 = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitParams {
    /// `None` waits until the tag is reached or a hang is detected.
    pub timeout: Option<Duration>,
}

impl WaitParams {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            timeout: config.wait_timeout,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Everything a CSR is wired to.
pub struct CsrCreateArgs {
    pub context: OsContextId,
    pub engine: EngineGroupType,
    pub encoder: &'static dyn CommandEncoder,
    pub config: Arc<DriverConfig>,
    pub memory_manager: Arc<dyn MemoryManager>,
    pub backend: Arc<dyn SubmissionBackend>,
    pub registry: Arc<ContextRegistry>,
    pub stats: Arc<SubmissionStats>,
    pub operator: Option<Arc<dyn OperatorIo>>,
}

struct CsrState {
    stream: Option<LinearStream>,
    /// Offset in `stream` where the submission being built starts.
    submission_start: usize,
    /// Ring chunks of the submission being built that live in already retired buffers.
    pending_ring: Vec<BatchSegment>,
    residency: Vec<Arc<GraphicsAllocation>>,
    resident_ids: HashSet<AllocationId>,
    stream_properties: StreamProperties,
    preemption_allocation: Option<Arc<GraphicsAllocation>>,
    sip_programmed: bool,
    scratch: Option<Arc<GraphicsAllocation>>,
    pause_thread: Option<PauseThread>,
}

pub struct CommandStreamReceiver {
    context: OsContextId,
    engine: EngineGroupType,
    encoder: &'static dyn CommandEncoder,
    config: Arc<DriverConfig>,
    memory_manager: Arc<dyn MemoryManager>,
    backend: Arc<dyn SubmissionBackend>,
    registry: Arc<ContextRegistry>,
    stats: Arc<SubmissionStats>,
    tag: TagView,
    task_count: AtomicU32,
    latest_sent_task_count: AtomicU32,
    latest_flushed_task_count: AtomicU32,
    context_initialized: AtomicBool,
    storage: InternalAllocationStorage,
    state: Mutex<CsrState>,
}

impl CommandStreamReceiver {
    pub fn new(args: CsrCreateArgs) -> ZeResult<Arc<Self>> {
        let tag = Self::initialize_tag_allocation(&args)?;
        let pause_thread = match args.config.pause_on_enqueue {
            Some(_) => {
                let operator = args
                    .operator
                    .clone()
                    .unwrap_or_else(|| Arc::new(pause::StdioOperator) as Arc<dyn OperatorIo>);
                let thread =
                    PauseThread::spawn(tag.allocation().clone(), PAUSE_SLOT_OFFSET, operator);
                match thread {
                    Ok(thread) => Some(thread),
                    Err(err) => {
                        warn!(%err, "failed to spawn pause thread");
                        args.memory_manager
                            .free_graphics_memory(tag.allocation().clone());
                        return Err(ZeError::OutOfHostMemory);
                    }
                }
            }
            None => None,
        };
        args.registry.register(tag.clone());

        let support = args.encoder.stream_properties_support();
        debug!(context = args.context.0, engine = ?args.engine, "csr created");
        Ok(Arc::new(Self {
            context: args.context,
            engine: args.engine,
            encoder: args.encoder,
            storage: InternalAllocationStorage::new(args.memory_manager.clone()),
            config: args.config,
            memory_manager: args.memory_manager,
            backend: args.backend,
            registry: args.registry,
            stats: args.stats,
            tag,
            task_count: AtomicU32::new(0),
            latest_sent_task_count: AtomicU32::new(0),
            latest_flushed_task_count: AtomicU32::new(0),
            context_initialized: AtomicBool::new(false),
            state: Mutex::new(CsrState {
                stream: None,
                submission_start: 0,
                pending_ring: Vec::new(),
                residency: Vec::new(),
                resident_ids: HashSet::new(),
                stream_properties: StreamProperties::new(support),
                preemption_allocation: None,
                sip_programmed: false,
                scratch: None,
                pause_thread,
            }),
        }))
    }

    /// Allocate the fence and set every partition slot to the not-yet-reached value.
    fn initialize_tag_allocation(args: &CsrCreateArgs) -> ZeResult<TagView> {
        let allocation = args
            .memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                TAG_ALLOCATION_SIZE,
                AllocationType::TagBuffer,
            ))
            .ok_or(ZeError::OutOfDeviceMemory)?;
        let partitions = match args.engine {
            EngineGroupType::Compute => args.config.active_partitions,
            EngineGroupType::Copy => 1,
        };
        let tag = TagView::new(
            args.context,
            allocation,
            partitions,
            u64::from(args.config.partition_tag_offset),
        );
        tag.write_all(INITIAL_TAG_VALUE);
        tag.allocation()
            .write_u32(PAUSE_SLOT_OFFSET, PauseState::Idle as u32);
        Ok(tag)
    }

    pub fn context(&self) -> OsContextId {
        self.context
    }

    pub fn engine(&self) -> EngineGroupType {
        self.engine
    }

    pub fn encoder(&self) -> &'static dyn CommandEncoder {
        self.encoder
    }

    pub fn config(&self) -> &Arc<DriverConfig> {
        &self.config
    }

    pub fn stats(&self) -> &Arc<SubmissionStats> {
        &self.stats
    }

    pub fn tag(&self) -> &TagView {
        &self.tag
    }

    pub fn active_partitions(&self) -> u32 {
        self.tag.partitions()
    }

    pub fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn latest_sent_task_count(&self) -> TaskCount {
        self.latest_sent_task_count.load(Ordering::Acquire)
    }

    pub fn latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed_task_count.load(Ordering::Acquire)
    }

    pub fn get_tag_value(&self, partition: u32) -> Option<TaskCount> {
        self.tag.tag_value(partition)
    }

    /// Minimum tag over the active partitions.
    pub fn completed_task_count(&self) -> TaskCount {
        self.tag.completed()
    }

    pub fn is_task_count_ready(&self, task_count: TaskCount) -> bool {
        self.completed_task_count() >= task_count
    }

    pub fn internal_allocation_storage(&self) -> &InternalAllocationStorage {
        &self.storage
    }

    pub fn is_context_initialized(&self) -> bool {
        self.context_initialized.load(Ordering::Acquire)
    }

    pub fn obtain_unique_ownership(&self) -> CsrGuard<'_> {
        CsrGuard {
            csr: self,
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn ensure_context_initialized(&self) -> ZeResult<()> {
        if self.is_context_initialized() {
            return Ok(());
        }
        self.obtain_unique_ownership().ensure_context_initialized()
    }

    /// Submit a batch that only updates the tag to a new task count.
    pub fn flush_tag_update(&self) -> ZeResult<CompletionFence> {
        let mut guard = self.obtain_unique_ownership();
        guard.flush_submission_with(Vec::new(), true, false)
    }

    /// Poll the tag until it reaches `task_count_to_wait`, the timeout elapses or the device
    /// reports a hang.
    pub fn wait_for_completion_with_timeout(
        &self,
        params: WaitParams,
        task_count_to_wait: TaskCount,
    ) -> WaitStatus {
        self.stats.inc_waits();
        if self.latest_flushed_task_count() < task_count_to_wait {
            if let Err(err) = self.flush_tag_update() {
                warn!(%err, task_count_to_wait, "tag update flush failed");
                return WaitStatus::NotReady;
            }
        }

        let start = Instant::now();
        let mut spins = 0;
        let mut backoff = Duration::from_micros(1);
        loop {
            self.backend.progress();
            if self.is_task_count_ready(task_count_to_wait) {
                self.storage
                    .clean_allocation_list(&self.tag, AllocationUsage::TemporaryAllocation);
                trace!(task_count_to_wait, "wait ready");
                return WaitStatus::Ready;
            }
            if self.backend.is_gpu_hang_detected() {
                self.stats.inc_gpu_hangs();
                error!(context = self.context.0, task_count_to_wait, "gpu hang detected");
                return WaitStatus::GpuHang;
            }
            if params.timeout.is_some_and(|timeout| start.elapsed() >= timeout) {
                self.stats.inc_wait_timeouts();
                debug!(
                    task_count_to_wait,
                    completed = self.completed_task_count(),
                    "wait timed out"
                );
                return WaitStatus::NotReady;
            }
            if spins < self.config.wait_spin_iterations {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(self.config.wait_backoff_max);
            }
        }
    }

    /// Wait for `fence` and return the proof that lets its allocations be released.
    pub fn wait_for_fence(&self, fence: CompletionFence, params: WaitParams) -> ZeResult<CompletionProof> {
        if fence.context != self.context {
            return Err(ZeError::InvalidArgument);
        }
        match self.wait_for_completion_with_timeout(params, fence.task_count) {
            WaitStatus::Ready => Ok(CompletionProof::new(
                self.context,
                self.completed_task_count(),
            )),
            WaitStatus::NotReady => Err(ZeError::NotReady),
            WaitStatus::GpuHang => Err(ZeError::DeviceLost),
        }
    }

    fn obtain_stream_allocation(&self, size: u64) -> ZeResult<Arc<GraphicsAllocation>> {
        if let Some(reused) = self
            .storage
            .obtain_reusable_allocation(size, AllocationType::LinearStream, &self.tag)
        {
            return Ok(reused);
        }
        self.memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                size,
                AllocationType::LinearStream,
            ))
            .ok_or(ZeError::OutOfDeviceMemory)
    }

    /// Wait for outstanding work, then free everything the CSR owns.
    fn cleanup_resources(&mut self) {
        let target = self.latest_flushed_task_count().max(self.task_count());
        if !self.config.skip_resource_cleanup && target > 0 {
            let status = self.wait_for_completion_with_timeout(
                WaitParams::with_timeout(self.config.cleanup_wait_timeout),
                target,
            );
            if status != WaitStatus::Ready {
                warn!(?status, target, "freeing csr resources with work outstanding");
            }
        }
        self.registry.unregister(self.context);

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.pause_thread = None;
        let mut owned: Vec<Arc<GraphicsAllocation>> = Vec::new();
        owned.extend(state.stream.take().map(|s| s.allocation().clone()));
        owned.extend(state.preemption_allocation.take());
        owned.extend(state.scratch.take());
        owned.push(self.tag.allocation().clone());
        state.residency.clear();
        for allocation in owned {
            self.memory_manager.free_graphics_memory(allocation);
        }
        self.storage.free_all();
        debug!(context = self.context.0, "csr resources released");
    }
}

impl Drop for CommandStreamReceiver {
    fn drop(&mut self) {
        self.cleanup_resources();
    }
}

impl std::fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("context", &self.context)
            .field("engine", &self.engine)
            .field("task_count", &self.task_count())
            .field("completed", &self.completed_task_count())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the CSR's command stream, residency and live state.
pub struct CsrGuard<'a> {
    csr: &'a CommandStreamReceiver,
    state: MutexGuard<'a, CsrState>,
}

impl<'a> CsrGuard<'a> {
    pub fn csr(&self) -> &'a CommandStreamReceiver {
        self.csr
    }

    pub fn ensure_context_initialized(&mut self) -> ZeResult<()> {
        if self.csr.is_context_initialized() {
            return Ok(());
        }
        let status = self.csr.backend.ensure_context_initialized();
        if !status.is_success() {
            warn!(?status, context = self.csr.context.0, "context initialization failed");
            return Err(ZeError::Uninitialized);
        }
        self.csr.context_initialized.store(true, Ordering::Release);
        debug!(context = self.csr.context.0, "context initialized");
        Ok(())
    }

    /// Live hardware state the command lists are diffed against.
    pub fn stream_properties(&mut self) -> &mut StreamProperties {
        &mut self.state.stream_properties
    }

    /// Command stream with at least `min_size` bytes free, chaining to a new buffer if needed.
    pub fn get_cs(&mut self, min_size: usize) -> ZeResult<&mut CmdArena> {
        Ok(self.ensure_command_buffer_allocation(min_size)?.arena_mut())
    }

    pub fn ensure_command_buffer_allocation(&mut self, min_size: usize) -> ZeResult<&mut LinearStream> {
        let csr = self.csr;
        let needed = min_size + CHAIN_RESERVE;
        let needs_new = self
            .state
            .stream
            .as_ref()
            .map_or(true, |s| s.space_remaining() < needed);
        if needs_new {
            let size = csr.config.csr_command_stream_size.max(needed) as u64;
            let allocation = csr.obtain_stream_allocation(size)?;
            let state = &mut *self.state;
            match state.stream.as_mut() {
                Some(old) => {
                    csr.encoder
                        .encode_batch_buffer_start(old.arena_mut(), allocation.gpu_address())?;
                    state.pending_ring.push(BatchSegment {
                        kind: SegmentKind::Ring,
                        gpu_address: old.gpu_address_at(state.submission_start),
                        bytes: old.as_bytes()[state.submission_start..].to_vec(),
                    });
                    let retired = old.replace_buffer(allocation);
                    csr.storage.store_allocation_with_task_count(
                        retired,
                        AllocationUsage::ReusableAllocation,
                        csr.task_count() + 1,
                        csr.context,
                    );
                    csr.stats.inc_command_buffer_chains();
                    debug!(context = csr.context.0, "csr command stream chained");
                }
                None => state.stream = Some(LinearStream::new(allocation)),
            }
            state.submission_start = 0;
        }
        self.state.stream.as_mut().ok_or(ZeError::Uninitialized)
    }

    /// Drop the ring commands written since the last submission.
    pub fn discard_unsubmitted(&mut self) {
        let state = &mut *self.state;
        state.pending_ring.clear();
        if let Some(stream) = &state.stream {
            state.submission_start = stream.used();
        }
    }

    /// Declare `allocation` resident for the next submission.
    pub fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        let csr = self.csr;
        if self.state.resident_ids.insert(allocation.id()) {
            allocation.update_resident_task_count(csr.task_count() + 1, csr.context);
            csr.memory_manager.make_resident_hook(allocation, csr.context);
            self.state.residency.push(allocation.clone());
        }
    }

    pub fn make_non_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        let csr = self.csr;
        if self.state.resident_ids.remove(&allocation.id()) {
            self.state.residency.retain(|a| a.id() != allocation.id());
        }
        allocation.release_residency_in_os_context(csr.context);
        csr.memory_manager.evict_hook(allocation, csr.context);
    }

    /// Forget the residency set of the submission that just went out. Resident task counts
    /// stay on the allocations.
    pub fn make_surface_pack_non_resident(&mut self) {
        self.state.residency.clear();
        self.state.resident_ids.clear();
    }

    pub fn residency(&self) -> &[Arc<GraphicsAllocation>] {
        &self.state.residency
    }

    /// Program `STATE_SIP` once per context when mid-thread preemption is configured.
    pub fn program_preamble(&mut self) -> ZeResult<()> {
        let csr = self.csr;
        if csr.engine != EngineGroupType::Compute
            || csr.config.preemption_mode != PreemptionMode::MidThread
        {
            return Ok(());
        }
        let allocation = match &self.state.preemption_allocation {
            Some(a) => a.clone(),
            None => {
                let a = csr
                    .memory_manager
                    .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                        PREEMPTION_ALLOCATION_SIZE,
                        AllocationType::PreemptionBuffer,
                    ))
                    .ok_or(ZeError::OutOfDeviceMemory)?;
                self.state.preemption_allocation = Some(a.clone());
                a
            }
        };
        self.make_resident(&allocation);
        if !self.state.sip_programmed {
            let arena = self.get_cs(core::mem::size_of::<neo_cmd::records::StateSip>())?;
            csr.encoder.encode_state_sip(arena, allocation.gpu_address())?;
            self.state.sip_programmed = true;
        }
        Ok(())
    }

    /// GPU address of the current scratch space, 0 when none was requested yet.
    pub fn scratch_gpu_address(&self) -> u64 {
        self.state.scratch.as_ref().map_or(0, |s| s.gpu_address())
    }

    /// Scratch space of at least `size` bytes. Returns its GPU address and whether it moved.
    pub fn ensure_scratch_space(&mut self, size: u64) -> ZeResult<(u64, bool)> {
        let csr = self.csr;
        let current = self.state.scratch.clone().filter(|s| s.size() >= size);
        if let Some(scratch) = current {
            self.make_resident(&scratch);
            return Ok((scratch.gpu_address(), false));
        }
        let scratch = csr
            .memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                size,
                AllocationType::ScratchSurface,
            ))
            .ok_or(ZeError::OutOfDeviceMemory)?;
        if let Some(old) = self.state.scratch.replace(scratch.clone()) {
            csr.storage.store_allocation_with_task_count(
                old,
                AllocationUsage::TemporaryAllocation,
                csr.task_count() + 1,
                csr.context,
            );
        }
        self.make_resident(&scratch);
        Ok((scratch.gpu_address(), true))
    }

    /// Records stalling the workload until the operator confirms, when configured.
    pub fn encode_pause_before(&mut self) -> ZeResult<()> {
        let csr = self.csr;
        if !csr.config.pause_on_enqueue.is_some_and(|p| p.before_workload) {
            return Ok(());
        }
        let slot = csr.tag.tag_address() + PAUSE_SLOT_OFFSET;
        let arena = self.get_cs(pause::pause_point_size() * 2)?;
        pause::encode_pause_point(
            csr.encoder,
            arena,
            slot,
            PauseState::WaitingForStartConfirmation,
            PauseState::HasStartConfirmation,
        )?;
        csr.encoder
            .encode_store_data_imm(arena, slot, PauseState::Idle as u64, false)
    }

    fn end_of_submission_size(&self) -> usize {
        core::mem::size_of::<PipeControl>() + pause::pause_point_size() * 2
            + core::mem::size_of::<MiBatchBufferEnd>()
    }

    fn encode_tag_update(&mut self, task_count: TaskCount) -> ZeResult<()> {
        let csr = self.csr;
        let tag_address = csr.tag.tag_address();
        let partitions = csr.tag.partitions();
        let size = self.end_of_submission_size();
        let arena = self.get_cs(size)?;
        match csr.engine {
            EngineGroupType::Compute => {
                csr.encoder
                    .encode_tag_update(arena, tag_address, task_count, partitions, true)
            }
            EngineGroupType::Copy => csr.encoder.encode_mi_flush_dw(
                arena,
                FlushDwFlags::LLC_FLUSH,
                Some(PostSyncArgs::write_immediate(tag_address, u64::from(task_count))),
            ),
        }
    }

    /// Close the ring chunk written since the last submission and submit it together with
    /// `batches`.
    pub fn flush_submission(&mut self, batches: Vec<BatchSegment>) -> ZeResult<CompletionFence> {
        let update_tag = !self.csr.config.update_tag_from_wait;
        self.flush_submission_with(batches, update_tag, true)
    }

    fn flush_submission_with(
        &mut self,
        batches: Vec<BatchSegment>,
        update_tag: bool,
        allow_pause: bool,
    ) -> ZeResult<CompletionFence> {
        let csr = self.csr;
        self.ensure_context_initialized()?;
        let next = csr.task_count() + 1;

        if update_tag {
            self.encode_tag_update(next)?;
        }
        if allow_pause && csr.config.pause_on_enqueue.is_some_and(|p| p.after_workload) {
            let slot = csr.tag.tag_address() + PAUSE_SLOT_OFFSET;
            let arena = self.get_cs(pause::pause_point_size() * 2)?;
            pause::encode_pause_point(
                csr.encoder,
                arena,
                slot,
                PauseState::WaitingForEndConfirmation,
                PauseState::HasEndConfirmation,
            )?;
            csr.encoder
                .encode_store_data_imm(arena, slot, PauseState::Idle as u64, false)?;
        }
        let arena = self.get_cs(core::mem::size_of::<MiBatchBufferEnd>())?;
        csr.encoder.encode_batch_buffer_end(arena)?;

        let tag_allocation = csr.tag.allocation().clone();
        self.make_resident(&tag_allocation);
        if let Some(stream_allocation) = self.state.stream.as_ref().map(|s| s.allocation().clone()) {
            self.make_resident(&stream_allocation);
        }

        let state = &mut *self.state;
        let mut segments = std::mem::take(&mut state.pending_ring);
        if let Some(stream) = &state.stream {
            segments.push(BatchSegment {
                kind: SegmentKind::Ring,
                gpu_address: stream.gpu_address_at(state.submission_start),
                bytes: stream.as_bytes()[state.submission_start..].to_vec(),
            });
            state.submission_start = stream.used();
        }
        segments.extend(batches);

        let batch = BatchBuffer {
            segments,
            task_count: next,
            tag: csr.tag.clone(),
            residency: state.residency.clone(),
            tag_update: update_tag,
        };
        let result = self.submit_batch_buffer(batch);
        match result {
            Ok(task_count) => {
                for allocation in &self.state.residency {
                    allocation.update_task_count(task_count, csr.context);
                }
                self.make_surface_pack_non_resident();
                Ok(CompletionFence {
                    context: csr.context,
                    task_count,
                })
            }
            Err(status) => {
                self.make_surface_pack_non_resident();
                Err(status.to_error().unwrap_or(ZeError::DeviceLost))
            }
        }
    }

    /// Hand `batch` to the backend. On failure the task count is left untouched.
    pub fn submit_batch_buffer(&mut self, batch: BatchBuffer) -> Result<TaskCount, SubmissionStatus> {
        let csr = self.csr;
        let current = csr.task_count();
        let next = current + 1;
        csr.latest_sent_task_count.store(next, Ordering::Release);

        let bytes = batch.total_bytes();
        let residency = batch.residency.len();
        let tag_update = batch.tag_update;
        let status = csr.backend.flush(batch);
        if !status.is_success() {
            csr.stats.inc_flush_failures();
            warn!(?status, task_count = next, "flush failed");
            return Err(status);
        }

        csr.task_count.store(next, Ordering::Release);
        if tag_update || !csr.config.update_tag_from_wait {
            csr.latest_flushed_task_count.store(next, Ordering::Release);
        }
        csr.stats.inc_submissions();
        debug!(task_count = next, bytes, residency, "submitted batch");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeferredBackend, ImmediateBackend, NullBackend};
    use crate::hw::{encoder_for, HwFamily};
    use crate::memory_manager::SimMemoryManager;

    struct Fixture {
        mm: Arc<SimMemoryManager>,
        csr: Arc<CommandStreamReceiver>,
    }

    fn fixture(backend: Arc<dyn SubmissionBackend>, config: DriverConfig) -> Fixture {
        let mm = Arc::new(SimMemoryManager::new());
        let csr = CommandStreamReceiver::new(CsrCreateArgs {
            context: OsContextId(0),
            engine: EngineGroupType::Compute,
            encoder: encoder_for(HwFamily::XeHpCore),
            config: Arc::new(config),
            memory_manager: mm.clone(),
            backend,
            registry: Arc::new(ContextRegistry::new()),
            stats: Arc::new(SubmissionStats::new()),
            operator: None,
        })
        .unwrap();
        Fixture { mm, csr }
    }

    fn submit_empty(csr: &CommandStreamReceiver) -> ZeResult<CompletionFence> {
        let mut guard = csr.obtain_unique_ownership();
        guard.flush_submission(Vec::new())
    }

    #[test]
    fn tag_starts_unreached_and_submissions_complete() {
        let backend = Arc::new(ImmediateBackend::new());
        let f = fixture(backend.clone(), DriverConfig::default());
        assert_eq!(f.csr.get_tag_value(0), Some(INITIAL_TAG_VALUE));

        let fence = submit_empty(&f.csr).unwrap();
        assert_eq!(fence.task_count, 1);
        assert_eq!(f.csr.task_count(), 1);
        assert_eq!(f.csr.latest_flushed_task_count(), 1);
        assert_eq!(
            f.csr
                .wait_for_completion_with_timeout(WaitParams::default(), 1),
            WaitStatus::Ready
        );
        assert!(f.csr.is_context_initialized());
    }

    #[test]
    fn failed_flush_leaves_task_count_unchanged() {
        let backend = Arc::new(ImmediateBackend::new());
        let f = fixture(backend.clone(), DriverConfig::default());
        backend.fail_next_flush(SubmissionStatus::OutOfMemory);
        assert_eq!(submit_empty(&f.csr), Err(ZeError::OutOfDeviceMemory));
        assert_eq!(f.csr.task_count(), 0);
        assert_eq!(f.csr.latest_sent_task_count(), 1);
        assert_eq!(f.csr.stats().snapshot().flush_failures, 1);

        assert_eq!(submit_empty(&f.csr).unwrap().task_count, 1);
    }

    #[test]
    fn deferred_tag_update_is_flushed_by_wait() {
        let backend = Arc::new(ImmediateBackend::new());
        let f = fixture(
            backend.clone(),
            DriverConfig {
                update_tag_from_wait: true,
                ..Default::default()
            },
        );
        let fence = submit_empty(&f.csr).unwrap();
        assert_eq!(f.csr.latest_flushed_task_count(), 0);
        assert_eq!(f.csr.completed_task_count(), 0);

        backend.fail_next_flush(SubmissionStatus::Failed);
        assert_eq!(
            f.csr
                .wait_for_completion_with_timeout(WaitParams::default(), fence.task_count),
            WaitStatus::NotReady
        );
        assert_eq!(f.csr.task_count(), 1);

        assert_eq!(
            f.csr
                .wait_for_completion_with_timeout(WaitParams::default(), fence.task_count),
            WaitStatus::Ready
        );
        assert_eq!(f.csr.task_count(), 2);
        let submitted = backend.submitted_count();
        assert_eq!(
            f.csr
                .wait_for_completion_with_timeout(WaitParams::default(), fence.task_count),
            WaitStatus::Ready
        );
        assert_eq!(backend.submitted_count(), submitted);
    }

    #[test]
    fn wait_times_out_and_detects_hangs() {
        let backend = Arc::new(NullBackend::new());
        let f = fixture(backend.clone(), DriverConfig::default());
        let fence = submit_empty(&f.csr).unwrap();
        let params = WaitParams::with_timeout(Duration::from_millis(5));
        assert_eq!(
            f.csr.wait_for_completion_with_timeout(params, fence.task_count),
            WaitStatus::NotReady
        );
        backend.set_gpu_hang(true);
        assert_eq!(
            f.csr.wait_for_completion_with_timeout(params, fence.task_count),
            WaitStatus::GpuHang
        );
        assert_eq!(f.csr.wait_for_fence(fence, params), Err(ZeError::DeviceLost));
        let stats = f.csr.stats().snapshot();
        assert_eq!(stats.wait_timeouts, 1);
        assert_eq!(stats.gpu_hangs, 2);
    }

    #[test]
    fn residency_tracks_the_next_task_count() {
        let backend = Arc::new(DeferredBackend::new());
        let f = fixture(backend.clone(), DriverConfig::default());
        let buffer = f
            .mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                4096,
                AllocationType::Buffer,
            ))
            .unwrap();
        let fence = {
            let mut guard = f.csr.obtain_unique_ownership();
            guard.make_resident(&buffer);
            assert_eq!(buffer.resident_task_count(OsContextId(0)), Some(1));
            guard.flush_submission(Vec::new()).unwrap()
        };
        assert!(buffer.is_resident(OsContextId(0)));
        assert_eq!(buffer.task_count(OsContextId(0)), Some(fence.task_count));

        backend.complete_all();
        let proof = f
            .csr
            .wait_for_fence(fence, WaitParams::default())
            .unwrap();
        crate::allocation::release_with_proof(f.mm.as_ref(), buffer, &[proof]).unwrap();
    }

    #[test]
    fn full_command_stream_chains_into_a_new_buffer() {
        let backend = Arc::new(ImmediateBackend::new());
        let f = fixture(
            backend.clone(),
            DriverConfig {
                csr_command_stream_size: 1024,
                min_command_stream_space: 256,
                ..Default::default()
            },
        );
        for _ in 0..40 {
            submit_empty(&f.csr).unwrap();
        }
        assert!(f.csr.stats().snapshot().command_buffer_chains > 0);
        assert_eq!(f.csr.completed_task_count(), 40);
    }

    #[test]
    fn drop_waits_and_frees_everything() {
        let backend = Arc::new(ImmediateBackend::new());
        let f = fixture(backend, DriverConfig::default());
        submit_empty(&f.csr).unwrap();
        let mm = f.mm.clone();
        drop(f);
        assert_eq!(mm.live_allocations(), 0);
    }

    struct GatedOperator {
        prompts: Mutex<Vec<String>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl OperatorIo for GatedOperator {
        fn confirm(&self, message: &str) {
            self.prompts.lock().unwrap().push(message.to_string());
            let _ = self.release.lock().unwrap().recv();
        }
    }

    impl GatedOperator {
        fn prompt_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    fn poll_until(backend: &ImmediateBackend, what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            backend.progress();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn paused_submission_runs_only_after_each_confirmation() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let (release, gate) = std::sync::mpsc::channel();
        let operator = Arc::new(GatedOperator {
            prompts: Mutex::new(Vec::new()),
            release: Mutex::new(gate),
        });
        let backend = Arc::new(ImmediateBackend::new());
        let config = DriverConfig {
            pause_on_enqueue: Some(pause::PauseConfig {
                before_workload: true,
                after_workload: true,
            }),
            ..Default::default()
        };
        let csr = CommandStreamReceiver::new(CsrCreateArgs {
            context: OsContextId(0),
            engine: EngineGroupType::Compute,
            encoder: encoder_for(HwFamily::XeHpCore),
            config: Arc::new(config),
            memory_manager: Arc::new(SimMemoryManager::new()),
            backend: backend.clone(),
            registry: Arc::new(ContextRegistry::new()),
            stats: Arc::new(SubmissionStats::new()),
            operator: Some(operator.clone() as Arc<dyn OperatorIo>),
        })
        .unwrap();
        let tag = csr.tag().allocation().clone();
        let slot = || tag.read_u32(PAUSE_SLOT_OFFSET);

        let fence = {
            let mut guard = csr.obtain_unique_ownership();
            guard.encode_pause_before().unwrap();
            guard.flush_submission(Vec::new()).unwrap()
        };

        poll_until(&backend, "the start prompt", || operator.prompt_count() == 1);
        backend.progress();
        assert_eq!(slot(), Some(PauseState::WaitingForStartConfirmation as u32));
        assert_eq!(backend.pending_count(), 1);
        assert!(!csr.is_task_count_ready(fence.task_count));

        release.send(()).unwrap();
        poll_until(&backend, "the end prompt", || operator.prompt_count() == 2);
        backend.progress();
        assert_eq!(slot(), Some(PauseState::WaitingForEndConfirmation as u32));
        assert!(csr.is_task_count_ready(fence.task_count));
        assert_eq!(backend.pending_count(), 1);

        release.send(()).unwrap();
        poll_until(&backend, "the batch to retire", || backend.pending_count() == 0);
        assert_eq!(slot(), Some(PauseState::Idle as u32));
        assert_eq!(operator.prompt_count(), 2);
    }
}
