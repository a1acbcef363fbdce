use std::sync::Arc;

use tracing::{debug, trace};

use super::{CommandList, StateRecord, WaitList};
use crate::device::EngineGroupType;
use crate::error::{ZeError, ZeResult};
use crate::event::{Event, TimestampField, EVENT_PACKET_SIZE, STATE_SIGNALED};
use crate::hw::{DispatchKernelArgs, PostSyncArgs};
use crate::indirect_heap::HeapType;
use crate::module::{Kernel, KernelImmutableData};
use crate::stream_properties::{HeapBinding, StateBaseAddressInputs};

impl CommandList {
    /// Record a dispatch of `kernel` over `group_count` work groups.
    ///
    /// `signal` is signaled when the dispatch completes; the dispatch starts only after every
    /// event of `wait` was signaled.
    pub fn append_launch_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal: Option<&Arc<Event>>,
        wait: WaitList<'_>,
    ) -> ZeResult<()> {
        self.record("append_launch_kernel", |list| {
            let waits = wait.resolve()?;
            list.check_launch(kernel, group_count)?;
            list.encode_waits(waits)?;
            list.launch(kernel, group_count, signal)?;
            if let Some(event) = signal {
                list.encode_signal_after(event, false)?;
            }
            Ok(())
        })
    }

    fn check_launch(&self, kernel: &Kernel, group_count: [u32; 3]) -> ZeResult<()> {
        if self.engine != EngineGroupType::Compute {
            return Err(ZeError::InvalidEnumeration);
        }
        let hw = self.encoder.hw_info();
        if group_count.contains(&0) {
            return Err(ZeError::InvalidArgument);
        }
        if group_count.iter().zip(hw.max_group_count).any(|(count, max)| *count > max) {
            return Err(ZeError::InvalidArgument);
        }
        if !self.device.is_module_fully_linked(kernel.module()) {
            return Err(ZeError::InvalidModuleUnlinked);
        }
        let data = kernel.immutable_data();
        if data.slm_size > hw.slm_size {
            debug!(kernel = %data.name, slm = data.slm_size, max = hw.slm_size, "kernel exceeds shared local memory");
            return Err(ZeError::OutOfDeviceMemory);
        }
        if !kernel.args_complete() {
            return Err(ZeError::InvalidArgument);
        }
        Ok(())
    }

    /// Encode one dispatch: heaps, state, walker. A device-scope signal rides on the walker's
    /// post-sync; everything else about the signal is left to the caller.
    pub(super) fn launch(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal: Option<&Arc<Event>>,
    ) -> ZeResult<()> {
        let encoder = self.encoder;
        let data = kernel.immutable_data().clone();
        let partitions = self.partition_count();

        let requirements = encoder.heap_requirements(kernel);
        for heap_type in HeapType::ALL {
            let size = requirements.get(heap_type);
            if size > 0 && self.container.heap(heap_type).is_some() {
                self.container
                    .get_indirect_heap(heap_type, size, heap_type.default_alignment())?;
            }
        }
        self.program_dispatch_state(&data)?;

        let post_sync = match signal {
            Some(event) => {
                self.container.add_to_residency(event.allocation());
                event.set_packets_in_use(partitions);
                if event.is_timestamp() {
                    self.encode_timestamp_start(event)?;
                    Some(PostSyncArgs::write_timestamp(
                        event.timestamp_address(0, TimestampField::ContextEnd),
                    ))
                } else if self.signal_needs_flush(event, false) {
                    None
                } else {
                    Some(PostSyncArgs::write_immediate(
                        event.completion_address(0),
                        u64::from(STATE_SIGNALED),
                    ))
                }
            }
            None => None,
        };

        for allocation in kernel.allocations() {
            self.container.add_to_residency(&allocation);
        }
        if data.uses_printf && !self.printf_kernels.iter().any(|k| Arc::ptr_eq(k, &data)) {
            self.printf_kernels.push(data.clone());
        }
        self.scratch_size = self.scratch_size.max(data.scratch_size);

        encoder.encode_dispatch_kernel(
            &mut self.container,
            &DispatchKernelArgs {
                kernel,
                group_count,
                post_sync,
                post_sync_partition_stride: EVENT_PACKET_SIZE,
                partition_count: partitions,
            },
        )?;
        trace!(kernel = %data.name, ?group_count, partitions, "kernel dispatched");
        Ok(())
    }

    /// Fold the dispatch's state into the final state. The first dispatch defines the required
    /// state; later changes are recorded in the list.
    fn program_dispatch_state(&mut self, data: &KernelImmutableData) -> ZeResult<()> {
        let config = self.device.config().clone();
        let partitions = self.partition_count();

        self.final_state.state_compute_mode.set_properties_all(
            data.requires_coherency,
            data.uses_large_grf(),
            data.thread_arbitration_policy.unwrap_or_default(),
            config.preemption_mode,
        );
        self.final_state.front_end_state.set_properties_all(
            config.disable_eu_fusion || data.requires_disable_eu_fusion,
            partitions > 1,
            false,
        );
        self.final_state
            .pipeline_select
            .set_properties_all(data.uses_systolic, false);

        let binding = |heap: Option<&crate::indirect_heap::IndirectHeap>| {
            heap.map(|h| HeapBinding {
                base: h.gpu_base(),
                size: h.size() as u32,
            })
        };
        let inputs = StateBaseAddressInputs {
            surface_state: binding(self.container.heap(HeapType::SurfaceState)),
            dynamic_state: binding(self.container.heap(HeapType::DynamicState)),
            indirect_object: binding(self.container.heap(HeapType::IndirectObject)),
            stateless_mocs: self.container.stateless_mocs(),
            global_atomics: partitions > 1,
        };
        self.final_state
            .state_base_address
            .set_properties_all(&inputs);

        if !self.has_dispatch {
            self.required_state.copy_properties_all(&self.final_state);
            self.required_state.clear_is_dirty();
            self.final_state.clear_is_dirty();
            self.has_dispatch = true;
            return Ok(());
        }
        if self.final_state.pipeline_select.is_dirty() {
            self.emit_state_record(StateRecord::PipelineSelect)?;
        }
        if self.final_state.state_compute_mode.is_dirty() {
            self.emit_state_record(StateRecord::ComputeMode)?;
        }
        if self.final_state.front_end_state.is_dirty() {
            self.emit_state_record(StateRecord::FrontEnd)?;
        }
        if self.final_state.state_base_address.is_dirty() {
            self.emit_state_record(StateRecord::BaseAddress)?;
        }
        Ok(())
    }
}
