//! Immediate command lists: every append is submitted to the engine's CSR right away.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::CommandList;
use crate::allocation::CompletionFence;
use crate::command_container::StreamPosition;
use crate::command_queue::{submit_lists, QueueMode};
use crate::csr::{CommandStreamReceiver, WaitParams};
use crate::device::{Device, EngineGroupType};
use crate::error::ZeResult;

#[derive(Debug)]
pub(super) struct ImmediateState {
    mode: QueueMode,
    csr: Arc<CommandStreamReceiver>,
    /// Start of the commands not submitted yet.
    pub(super) last_position: StreamPosition,
    last_fence: Option<CompletionFence>,
}

impl CommandList {
    pub fn create_immediate(device: &Device, engine: EngineGroupType, mode: QueueMode) -> ZeResult<Self> {
        let csr = device.csr(engine)?.clone();
        let mut list = Self::create(device, engine)?;
        list.immediate = Some(ImmediateState {
            mode,
            csr,
            last_position: list.container.position(),
            last_fence: None,
        });
        Ok(list)
    }

    /// Mode of an immediate list; `None` for regular lists.
    pub fn queue_mode(&self) -> Option<QueueMode> {
        self.immediate.as_ref().map(|state| state.mode)
    }

    /// Fence of the latest submission of an immediate list.
    pub fn last_fence(&self) -> Option<CompletionFence> {
        self.immediate.as_ref().and_then(|state| state.last_fence)
    }

    /// Wait for everything an immediate list submitted. `None` uses the configured timeout.
    pub fn host_synchronize(&self, timeout: Option<Duration>) -> ZeResult<()> {
        let Some(state) = &self.immediate else {
            return Ok(());
        };
        let Some(fence) = state.last_fence else {
            return Ok(());
        };
        let params = timeout.map_or_else(|| WaitParams::from_config(state.csr.config()), WaitParams::with_timeout);
        state.csr.wait_for_fence(fence, params).map(|_| ())
    }

    /// Rewind the command buffers once the GPU finished everything submitted from them.
    pub(super) fn prepare_immediate(&mut self) {
        let Some(state) = self.immediate.as_mut() else {
            return;
        };
        let idle = state
            .last_fence
            .is_some_and(|fence| state.csr.is_task_count_ready(fence.task_count));
        if !idle {
            return;
        }
        self.container.reset();
        state.last_position = self.container.position();
        state.last_fence = None;
        debug!(engine = ?self.engine, "immediate command list rewound");
    }

    /// Submit the commands recorded since the last submission.
    ///
    /// A failed submission is not retried: its commands are skipped and the list stays usable.
    pub(super) fn flush_immediate(&mut self, operation: &'static str) -> ZeResult<()> {
        let Some(state) = self.immediate.as_ref() else {
            return Ok(());
        };
        let from = state.last_position;
        let csr = state.csr.clone();
        let mode = state.mode;
        if self.container.position() == from {
            return Ok(());
        }

        let closed = self.container.close();
        let result = closed.and_then(|()| {
            submit_lists(&csr, vec![self.submission_from(from)], self.device.debugger())
        });

        self.required_state.reset_state();
        self.final_state.reset_state();
        self.has_dispatch = false;
        self.scratch_size = 0;
        self.front_end_patches.clear();
        let end = self.container.position();
        let Some(state) = self.immediate.as_mut() else {
            return Ok(());
        };
        state.last_position = end;

        let fence = match result {
            Ok(fence) => fence,
            Err(err) => {
                warn!(operation, %err, "immediate submission failed");
                return Err(err);
            }
        };
        state.last_fence = Some(fence);
        debug!(operation, task_count = fence.task_count, ?mode, "immediate submission");
        if mode == QueueMode::Synchronous {
            csr.wait_for_fence(fence, WaitParams::from_config(csr.config()))?;
        }
        Ok(())
    }

    pub(super) fn wait_immediate_idle(&self) {
        let Some(state) = &self.immediate else {
            return;
        };
        let Some(fence) = state.last_fence else {
            return;
        };
        let params = WaitParams::with_timeout(state.csr.config().cleanup_wait_timeout);
        if let Err(err) = state.csr.wait_for_fence(fence, params) {
            warn!(%err, task_count = fence.task_count, "immediate command list destroyed with work outstanding");
        }
    }
}
