//! Command lists: recorded launches, copies, fills, barriers and event operations.
//!
//! A regular list is recorded, closed and then executed on a
//! [`CommandQueue`](crate::command_queue::CommandQueue) any number of times. An immediate list
//! submits every operation to its engine's CSR as soon as it is appended.
//!
//! Each list keeps two views of the expensive hardware state. The *required* state is what the
//! first dispatch needs; the queue programs it before jumping into the list, and only where it
//! differs from what the engine already runs with. The *final* state is what the list leaves
//! behind. Differences between dispatches inside one list are emitted in the list itself.

mod immediate;
mod launch;
mod memory;
mod sync;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use neo_cmd::records::CfeState;
use neo_cmd::CmdArena;
use tracing::{debug, warn};

use crate::allocation::GraphicsAllocation;
use crate::command_container::{CommandContainer, StreamPosition};
use crate::command_queue::{FrontEndPatch, ListSubmission};
use crate::device::{Device, EngineGroupType};
use crate::error::{ZeError, ZeResult};
use crate::hw::CommandEncoder;
use crate::indirect_heap::HeapType;
use crate::module::KernelImmutableData;
use crate::stream_properties::StreamProperties;

pub use crate::command_queue::QueueMode;
pub use memory::{CopyRegion, MemoryRef};
pub use sync::WaitList;

use immediate::ImmediateState;

/// Host memory registered with a list for use as a copy source or destination.
#[derive(Clone, Debug)]
struct HostPtrEntry {
    size: u64,
    allocation: Arc<GraphicsAllocation>,
}

/// State record emitted between two dispatches of one list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StateRecord {
    PipelineSelect,
    ComputeMode,
    FrontEnd,
    BaseAddress,
}

pub struct CommandList {
    device: Device,
    engine: EngineGroupType,
    encoder: &'static dyn CommandEncoder,
    container: CommandContainer,
    required_state: StreamProperties,
    final_state: StreamProperties,
    has_dispatch: bool,
    closed: bool,
    poisoned: bool,
    state_transition_records: u32,
    scratch_size: u32,
    front_end_patches: Vec<StreamPosition>,
    printf_kernels: Vec<Arc<KernelImmutableData>>,
    host_ptr_map: BTreeMap<u64, HostPtrEntry>,
    immediate: Option<ImmediateState>,
}

impl CommandList {
    /// A regular list for `engine`; `InvalidEnumeration` when the device has no such engine.
    pub fn create(device: &Device, engine: EngineGroupType) -> ZeResult<Self> {
        device.csr(engine)?;
        let heaps: &[HeapType] = match engine {
            EngineGroupType::Compute => device.hw_info().required_heaps(),
            EngineGroupType::Copy => &[],
        };
        let container = CommandContainer::initialize(device.container_resources().clone(), heaps)?;
        let encoder = device.encoder();
        let support = encoder.stream_properties_support();
        debug!(?engine, family = ?encoder.family(), "command list created");
        Ok(Self {
            device: device.clone(),
            engine,
            encoder,
            container,
            required_state: StreamProperties::new(support),
            final_state: StreamProperties::new(support),
            has_dispatch: false,
            closed: false,
            poisoned: false,
            state_transition_records: 0,
            scratch_size: 0,
            front_end_patches: Vec::new(),
            printf_kernels: Vec::new(),
            host_ptr_map: BTreeMap::new(),
            immediate: None,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn engine(&self) -> EngineGroupType {
        self.engine
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// A failed append leaves the list unusable until [`Self::reset`].
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate.is_some()
    }

    pub fn container(&self) -> &CommandContainer {
        &self.container
    }

    /// State the first dispatch needs programmed before the list runs.
    pub fn required_state(&self) -> &StreamProperties {
        &self.required_state
    }

    /// State the list leaves the engine in.
    pub fn final_state(&self) -> &StreamProperties {
        &self.final_state
    }

    /// State records emitted inside the list between dispatches.
    pub fn num_state_transition_records(&self) -> u32 {
        self.state_transition_records
    }

    /// Allocations that must be resident whenever the list executes.
    pub fn get_residency(&self) -> &[Arc<GraphicsAllocation>] {
        self.container.residency_container()
    }

    /// Kernels launched by the list that print; their buffers are read after completion.
    pub fn printf_kernels(&self) -> &[Arc<KernelImmutableData>] {
        &self.printf_kernels
    }

    /// Largest scratch space any launched kernel needs.
    pub fn scratch_size(&self) -> u32 {
        self.scratch_size
    }

    /// Terminate the list. Immediate lists have nothing to close.
    pub fn close(&mut self) -> ZeResult<()> {
        if self.poisoned {
            return Err(ZeError::InvalidArgument);
        }
        if self.closed || self.is_immediate() {
            return Ok(());
        }
        if let Err(err) = self.container.close() {
            self.poisoned = true;
            return Err(err);
        }
        self.closed = true;
        debug!(
            used = self.container.used(),
            buffers = self.container.command_buffers().len(),
            transitions = self.state_transition_records,
            "command list closed"
        );
        Ok(())
    }

    /// Back to an empty, open list. Registered host memory is released.
    pub fn reset(&mut self) {
        self.container.reset();
        self.clear_recording_state();
        self.closed = false;
        self.poisoned = false;
        self.release_host_ptrs();
        if let Some(immediate) = self.immediate.as_mut() {
            immediate.last_position = self.container.position();
        }
        debug!(engine = ?self.engine, "command list reset");
    }

    fn clear_recording_state(&mut self) {
        self.required_state.reset_state();
        self.final_state.reset_state();
        self.has_dispatch = false;
        self.state_transition_records = 0;
        self.scratch_size = 0;
        self.front_end_patches.clear();
        self.printf_kernels.clear();
    }

    /// Make `size` bytes of host memory at `address` usable as [`MemoryRef::HostPtr`].
    pub fn register_host_ptr(&mut self, address: u64, size: u64) -> ZeResult<Arc<GraphicsAllocation>> {
        if address == 0 {
            return Err(ZeError::InvalidNullHandle);
        }
        if size == 0 {
            return Err(ZeError::InvalidSize);
        }
        let end = address.checked_add(size).ok_or(ZeError::InvalidSize)?;
        if let Some(existing) = self.find_host_ptr(address, size) {
            return Ok(existing.0);
        }
        let overlaps = self
            .host_ptr_map
            .range(..end)
            .next_back()
            .is_some_and(|(base, entry)| base + entry.size > address);
        if overlaps {
            return Err(ZeError::InvalidArgument);
        }
        let allocation = self.device.allocate(size, crate::allocation::AllocationType::ExternalHostPtr)?;
        self.host_ptr_map.insert(
            address,
            HostPtrEntry {
                size,
                allocation: allocation.clone(),
            },
        );
        debug!(address, size, gpu_address = allocation.gpu_address(), "host pointer registered");
        Ok(allocation)
    }

    /// Allocation and offset backing `len` bytes of registered host memory at `address`.
    fn find_host_ptr(&self, address: u64, len: u64) -> Option<(Arc<GraphicsAllocation>, u64)> {
        let (base, entry) = self.host_ptr_map.range(..=address).next_back()?;
        let offset = address - base;
        offset
            .checked_add(len)
            .is_some_and(|end| end <= entry.size)
            .then(|| (entry.allocation.clone(), offset))
    }

    fn release_host_ptrs(&mut self) {
        let resources = self.container.resources().clone();
        for (_, entry) in std::mem::take(&mut self.host_ptr_map) {
            resources.release_deferred(entry.allocation);
        }
    }

    /// Run `encode` against the list. A failure after commands were written poisons it; an
    /// immediate list submits what was recorded.
    fn record<F>(&mut self, operation: &'static str, encode: F) -> ZeResult<()>
    where
        F: FnOnce(&mut Self) -> ZeResult<()>,
    {
        if self.poisoned || self.closed {
            warn!(
                operation,
                poisoned = self.poisoned,
                closed = self.closed,
                "append on a list that does not accept commands"
            );
            return Err(ZeError::InvalidArgument);
        }
        self.prepare_immediate();
        let before = self.container.position();
        if let Err(err) = encode(self) {
            if self.container.position() != before {
                self.poisoned = true;
                warn!(operation, %err, "append failed after recording started; list poisoned");
            } else {
                debug!(operation, %err, "append rejected");
            }
            return Err(err);
        }
        if self.is_immediate() {
            self.flush_immediate(operation)?;
        }
        Ok(())
    }

    fn cs(&mut self, size: usize) -> ZeResult<&mut CmdArena> {
        self.container.get_command_stream(size)
    }

    /// Active partitions a dispatch is split across.
    fn partition_count(&self) -> u32 {
        match self.engine {
            EngineGroupType::Compute => self.device.config().active_partitions.max(1),
            EngineGroupType::Copy => 1,
        }
    }

    fn emit_state_record(&mut self, kind: StateRecord) -> ZeResult<()> {
        let encoder = self.encoder;
        let props = self.final_state;
        let stats = self.device.stats().clone();
        match kind {
            StateRecord::PipelineSelect => {
                let arena = self.cs(encoder.pipeline_select_size())?;
                encoder.encode_pipeline_select(arena, &props.pipeline_select)?;
                stats.inc_pipeline_select_records();
                self.final_state.pipeline_select.clear_is_dirty();
            }
            StateRecord::ComputeMode => {
                let arena = self.cs(core::mem::size_of::<neo_cmd::records::StateComputeMode>())?;
                encoder.encode_state_compute_mode(arena, &props.state_compute_mode)?;
                stats.inc_compute_mode_records();
                self.final_state.state_compute_mode.clear_is_dirty();
            }
            StateRecord::FrontEnd => {
                let size = core::mem::size_of::<CfeState>();
                self.cs(size)?;
                self.front_end_patches.push(self.container.position());
                let arena = self.cs(size)?;
                encoder.encode_front_end_state(arena, &props.front_end_state, 0)?;
                stats.inc_front_end_records();
                self.final_state.front_end_state.clear_is_dirty();
            }
            StateRecord::BaseAddress => {
                let arena = self.cs(encoder.state_base_address_size())?;
                encoder.encode_state_base_address(arena, &props.state_base_address)?;
                stats.inc_state_base_address_records();
                self.final_state.state_base_address.clear_is_dirty();
            }
        }
        self.state_transition_records += 1;
        debug!(record = ?kind, total = self.state_transition_records, "state transition recorded");
        Ok(())
    }

    /// The part of the list recorded at or after `from`, ready for submission.
    fn submission_from(&self, from: StreamPosition) -> ListSubmission<'_> {
        let front_end_patches = self
            .front_end_patches
            .iter()
            .filter(|p| (p.buffer, p.offset) >= (from.buffer, from.offset))
            .map(|p| FrontEndPatch {
                segment: p.buffer - from.buffer,
                offset: if p.buffer == from.buffer {
                    p.offset - from.offset
                } else {
                    p.offset
                },
            })
            .collect();
        ListSubmission {
            required: &self.required_state,
            final_state: &self.final_state,
            start_address: self.container.gpu_address_at(from),
            segments: self.container.segments_from(from),
            front_end_patches,
            residency: self.container.residency_container(),
            scratch_size: self.scratch_size,
        }
    }

    pub(crate) fn submission(&self) -> ListSubmission<'_> {
        self.submission_from(StreamPosition::default())
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.wait_immediate_idle();
        self.release_host_ptrs();
    }
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("engine", &self.engine)
            .field("immediate", &self.immediate)
            .field("closed", &self.closed)
            .field("poisoned", &self.poisoned)
            .field("state_transition_records", &self.state_transition_records)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use crate::backend::{ImmediateBackend, SubmissionBackend};
    use crate::config::DriverConfig;
    use crate::device::{Device, DeviceDescriptor};
    use crate::hw::HwFamily;
    use crate::memory_manager::SimMemoryManager;
    use crate::module::{ArgKind, Kernel, KernelDesc, ModuleDesc};

    pub fn device(family: HwFamily, config: DriverConfig) -> Device {
        Device::new(
            DeviceDescriptor::new(family).with_config(config),
            Arc::new(SimMemoryManager::new()),
            |_| Arc::new(ImmediateBackend::new()) as Arc<dyn SubmissionBackend>,
        )
        .unwrap()
    }

    /// A kernel with one buffer argument bound to a fresh allocation.
    pub fn kernel(device: &Device, desc: KernelDesc) -> Kernel {
        let name = desc.name.clone();
        let buffers = desc.args.iter().filter(|a| matches!(a, ArgKind::Buffer)).count();
        let module = device
            .create_module(ModuleDesc {
                kernels: vec![desc],
                ..Default::default()
            })
            .unwrap();
        let mut kernel = device.create_kernel(module, &name).unwrap();
        for index in 0..buffers {
            let buffer = device
                .allocate(4096, crate::allocation::AllocationType::Buffer)
                .unwrap();
            kernel.set_arg_buffer(index, buffer, 0).unwrap();
        }
        kernel
    }

    pub fn simple_kernel(device: &Device) -> Kernel {
        kernel(
            device,
            KernelDesc {
                name: "simple".into(),
                args: vec![ArgKind::Buffer],
                ..Default::default()
            },
        )
    }
}
