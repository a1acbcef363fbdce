//! Command queues: program the state each list needs on the engine's CSR, then jump into it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use neo_cmd::records::{CfeState, MiBatchBufferStart, StateComputeMode};
use tracing::{debug, trace, warn};

use crate::allocation::{CompletionFence, GraphicsAllocation};
use crate::backend::BatchSegment;
use crate::command_list::CommandList;
use crate::csr::{CommandStreamReceiver, CsrGuard, WaitParams};
use crate::debugger::DebuggerNotify;
use crate::device::{Device, EngineGroupType};
use crate::error::{ZeError, ZeResult};
use crate::stream_properties::StreamProperties;

/// Whether submissions return at once or after the GPU finished them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QueueMode {
    #[default]
    Asynchronous,
    Synchronous,
}

/// `CFE_STATE` records inside a list, to be given the scratch base at submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrontEndPatch {
    pub segment: usize,
    pub offset: usize,
}

/// One list's share of a submission.
pub(crate) struct ListSubmission<'a> {
    pub required: &'a StreamProperties,
    pub final_state: &'a StreamProperties,
    pub start_address: u64,
    pub segments: Vec<BatchSegment>,
    pub front_end_patches: Vec<FrontEndPatch>,
    pub residency: &'a [Arc<GraphicsAllocation>],
    pub scratch_size: u32,
}

fn patch_front_end(segments: &mut [BatchSegment], patch: FrontEndPatch, scratch_base: u64) {
    let size = core::mem::size_of::<CfeState>();
    let Some(bytes) = segments
        .get_mut(patch.segment)
        .and_then(|s| s.bytes.get_mut(patch.offset..patch.offset + size))
    else {
        warn!(?patch, "front end record outside the submitted segments");
        return;
    };
    let mut cfe: CfeState = bytemuck::pod_read_unaligned(bytes);
    cfe.scratch_base = scratch_base;
    bytes.copy_from_slice(bytemuck::bytes_of(&cfe));
}

/// Bring the live state to what `list` requires, then adopt its final state.
fn program_state(guard: &mut CsrGuard<'_>, list: &mut ListSubmission<'_>) -> ZeResult<()> {
    let csr = guard.csr();
    let encoder = csr.encoder();
    let stats = csr.stats().clone();
    let mut live = *guard.stream_properties();

    let ps = &mut live.pipeline_select;
    ps.copy_properties_all(&list.required.pipeline_select);
    if ps.is_dirty() || (csr.config().force_pipeline_select_on_every_list && ps.is_set()) {
        let arena = guard.get_cs(encoder.pipeline_select_size())?;
        encoder.encode_pipeline_select(arena, &live.pipeline_select)?;
        stats.inc_pipeline_select_records();
    }

    live.state_compute_mode
        .copy_properties_all(&list.required.state_compute_mode);
    if live.state_compute_mode.is_dirty() {
        trace!(fields = ?live.state_compute_mode.dirty_fields(), "compute mode programmed");
        let arena = guard.get_cs(core::mem::size_of::<StateComputeMode>())?;
        encoder.encode_state_compute_mode(arena, &live.state_compute_mode)?;
        stats.inc_compute_mode_records();
    }

    let mut scratch_moved = false;
    if list.scratch_size > 0 {
        let (scratch_base, moved) = guard.ensure_scratch_space(u64::from(list.scratch_size))?;
        scratch_moved = moved;
        for patch in std::mem::take(&mut list.front_end_patches) {
            patch_front_end(&mut list.segments, patch, scratch_base);
        }
    }
    live.front_end_state
        .copy_properties_all(&list.required.front_end_state);
    if live.front_end_state.is_dirty() || (scratch_moved && live.front_end_state.is_set()) {
        let scratch_base = guard.scratch_gpu_address();
        let arena = guard.get_cs(core::mem::size_of::<CfeState>())?;
        encoder.encode_front_end_state(arena, &live.front_end_state, scratch_base)?;
        stats.inc_front_end_records();
    }

    live.state_base_address
        .copy_properties_all(&list.required.state_base_address);
    if live.state_base_address.is_dirty() {
        debug!(fields = ?live.state_base_address.dirty_fields(), "state base address programmed");
        let arena = guard.get_cs(encoder.state_base_address_size())?;
        encoder.encode_state_base_address(arena, &live.state_base_address)?;
        stats.inc_state_base_address_records();
    }

    live.copy_properties_all(list.final_state);
    live.clear_is_dirty();
    *guard.stream_properties() = live;
    Ok(())
}

fn encode_lists(
    guard: &mut CsrGuard<'_>,
    lists: Vec<ListSubmission<'_>>,
    debugger: Option<&dyn DebuggerNotify>,
) -> ZeResult<Vec<BatchSegment>> {
    let csr = guard.csr();
    guard.ensure_context_initialized()?;
    guard.program_preamble()?;
    guard.encode_pause_before()?;

    let mut segments = Vec::new();
    for mut list in lists {
        if csr.engine() == EngineGroupType::Compute {
            program_state(guard, &mut list)?;
        }
        for allocation in list.residency {
            guard.make_resident(allocation);
        }
        let arena = guard.get_cs(core::mem::size_of::<MiBatchBufferStart>())?;
        csr.encoder()
            .encode_batch_buffer_start(arena, list.start_address)?;
        if let Some(debugger) = debugger {
            debugger.command_list_allocations(list.residency);
        }
        segments.append(&mut list.segments);
    }
    Ok(segments)
}

/// Submit `lists` on `csr` as one batch. Nothing written for a failed attempt is executed later.
pub(crate) fn submit_lists(
    csr: &CommandStreamReceiver,
    lists: Vec<ListSubmission<'_>>,
    debugger: Option<&dyn DebuggerNotify>,
) -> ZeResult<CompletionFence> {
    let mut guard = csr.obtain_unique_ownership();
    let live = *guard.stream_properties();
    let result = match encode_lists(&mut guard, lists, debugger) {
        Ok(segments) => guard.flush_submission(segments),
        Err(err) => {
            guard.discard_unsubmitted();
            warn!(%err, context = csr.context().0, "submission abandoned");
            Err(err)
        }
    };
    if result.is_err() {
        // The state programmed for this attempt never reached the engine.
        *guard.stream_properties() = live;
    }
    result
}

/// Host-side fence signaled by one [`CommandQueue::execute_command_lists`] call.
#[derive(Debug)]
pub struct Fence {
    csr: Arc<CommandStreamReceiver>,
    completion: Mutex<Option<CompletionFence>>,
}

impl Fence {
    fn completion(&self) -> Option<CompletionFence> {
        *self.completion.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok` once the submission the fence was passed to completed.
    pub fn query_status(&self) -> ZeResult<()> {
        match self.completion() {
            Some(fence) if self.csr.is_task_count_ready(fence.task_count) => Ok(()),
            _ => Err(ZeError::NotReady),
        }
    }

    pub fn host_synchronize(&self, timeout: Option<Duration>) -> ZeResult<()> {
        let fence = self.completion().ok_or(ZeError::NotReady)?;
        let params = timeout.map_or_else(|| WaitParams::from_config(self.csr.config()), WaitParams::with_timeout);
        self.csr.wait_for_fence(fence, params).map(|_| ())
    }

    pub fn reset(&self) {
        *self.completion.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Submits closed command lists to one engine group.
#[derive(Debug)]
pub struct CommandQueue {
    device: Device,
    engine: EngineGroupType,
    mode: QueueMode,
    csr: Arc<CommandStreamReceiver>,
    last_fence: Mutex<Option<CompletionFence>>,
}

impl CommandQueue {
    pub fn create(device: &Device, engine: EngineGroupType, mode: QueueMode) -> ZeResult<Self> {
        let csr = device.csr(engine)?.clone();
        Ok(Self {
            device: device.clone(),
            engine,
            mode,
            csr,
            last_fence: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> EngineGroupType {
        self.engine
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn csr(&self) -> &Arc<CommandStreamReceiver> {
        &self.csr
    }

    pub fn create_fence(&self) -> Fence {
        Fence {
            csr: self.csr.clone(),
            completion: Mutex::new(None),
        }
    }

    /// Fence of the latest successful submission.
    pub fn last_fence(&self) -> Option<CompletionFence> {
        *self.last_fence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute `lists` in order as one submission.
    ///
    /// Every list must be a closed regular list recorded for this queue's engine group.
    pub fn execute_command_lists(
        &self,
        lists: &[&CommandList],
        fence: Option<&Fence>,
    ) -> ZeResult<CompletionFence> {
        if lists.is_empty() {
            return Err(ZeError::InvalidArgument);
        }
        if let Some(fence) = fence {
            if !Arc::ptr_eq(&fence.csr, &self.csr) {
                return Err(ZeError::InvalidArgument);
            }
        }
        for list in lists {
            if list.is_immediate() || !list.is_closed() || list.engine() != self.engine {
                warn!(
                    immediate = list.is_immediate(),
                    closed = list.is_closed(),
                    engine = ?list.engine(),
                    "command list cannot be executed on this queue"
                );
                return Err(ZeError::InvalidArgument);
            }
        }

        let submissions = lists.iter().map(|list| list.submission()).collect();
        let completion = submit_lists(&self.csr, submissions, self.device.debugger())?;
        debug!(
            lists = lists.len(),
            task_count = completion.task_count,
            engine = ?self.engine,
            "command lists executed"
        );
        *self.last_fence.lock().unwrap_or_else(PoisonError::into_inner) = Some(completion);
        if let Some(fence) = fence {
            *fence.completion.lock().unwrap_or_else(PoisonError::into_inner) = Some(completion);
        }
        if self.mode == QueueMode::Synchronous {
            self.csr
                .wait_for_fence(completion, WaitParams::from_config(self.csr.config()))?;
        }
        Ok(completion)
    }

    /// Wait for everything submitted so far. `None` uses the configured timeout.
    pub fn synchronize(&self, timeout: Option<Duration>) -> ZeResult<()> {
        let Some(fence) = self.last_fence() else {
            return Ok(());
        };
        let params = timeout.map_or_else(|| WaitParams::from_config(self.csr.config()), WaitParams::with_timeout);
        self.csr.wait_for_fence(fence, params).map(|_| ())
    }
}
