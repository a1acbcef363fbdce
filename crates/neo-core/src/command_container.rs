//! Command buffers, indirect heaps and the residency/deallocation sets backing a command list.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use neo_cmd::records::{MiBatchBufferEnd, MiBatchBufferStart};
use neo_cmd::CmdArena;
use tracing::debug;

use crate::allocation::{AllocationId, AllocationType, GraphicsAllocation};
use crate::allocation_storage::{AllocationUsage, ContextRegistry, InternalAllocationStorage};
use crate::backend::{BatchSegment, SegmentKind};
use crate::config::DriverConfig;
use crate::error::{ZeError, ZeResult};
use crate::indirect_heap::{HeapType, IndirectHeap};
use crate::linear_stream::LinearStream;
use crate::memory_manager::{AllocationProperties, MemoryManager};
use crate::stats::SubmissionStats;

/// Bytes kept free at the end of every command buffer for the chaining `MI_BATCH_BUFFER_START`.
pub const CHAIN_RESERVE: usize = core::mem::size_of::<MiBatchBufferStart>();

/// Recording cursor: the command buffer being written and its fill level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamPosition {
    pub buffer: usize,
    pub offset: usize,
}

/// Device-wide collaborators every container draws from.
#[derive(Clone)]
pub struct ContainerResources {
    pub config: Arc<DriverConfig>,
    pub memory_manager: Arc<dyn MemoryManager>,
    /// Retired command buffers and heaps, reused once every context that used them is done.
    pub reuse_pool: Arc<InternalAllocationStorage>,
    pub completion: Arc<ContextRegistry>,
    pub stats: Arc<SubmissionStats>,
}

impl ContainerResources {
    /// Reuse a completed allocation from the pool or allocate a fresh one.
    pub fn obtain(&self, size: u64, allocation_type: AllocationType) -> ZeResult<Arc<GraphicsAllocation>> {
        if let Some(reused) =
            self.reuse_pool
                .obtain_reusable_allocation(size, allocation_type, self.completion.as_ref())
        {
            return Ok(reused);
        }
        self.memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(size, allocation_type))
            .ok_or(ZeError::OutOfDeviceMemory)
    }

    /// Hand `allocation` back to the pool; it keeps its recorded task counts.
    pub fn retire(&self, allocation: Arc<GraphicsAllocation>) {
        self.reuse_pool
            .store_allocation(allocation, AllocationUsage::ReusableAllocation);
    }

    /// Free `allocation` once its recorded uses completed.
    pub fn release_deferred(&self, allocation: Arc<GraphicsAllocation>) {
        self.reuse_pool
            .store_allocation(allocation, AllocationUsage::TemporaryAllocation);
    }

    pub fn heap_size(&self, heap_type: HeapType) -> u64 {
        let size = match heap_type {
            HeapType::SurfaceState => self.config.surface_state_heap_reserved_size(),
            HeapType::DynamicState => self.config.dynamic_state_heap_size,
            HeapType::IndirectObject => self.config.indirect_object_heap_size,
        };
        size as u64
    }
}

impl fmt::Debug for ContainerResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerResources")
            .field("reuse_pool", &self.reuse_pool)
            .finish_non_exhaustive()
    }
}

pub struct CommandContainer {
    resources: ContainerResources,
    /// In execution order; the last one is being written.
    cmd_buffers: Vec<LinearStream>,
    heaps: [Option<IndirectHeap>; 3],
    /// Heaps replaced since the last reset. Still referenced by recorded commands.
    retired_heaps: Vec<Arc<GraphicsAllocation>>,
    residency: Vec<Arc<GraphicsAllocation>>,
    resident_ids: HashSet<AllocationId>,
    deallocation: Vec<Arc<GraphicsAllocation>>,
    heap_reallocations: u32,
    stateless_mocs: u32,
}

impl CommandContainer {
    /// Allocate the first command buffer and one heap per entry of `heaps_required`.
    pub fn initialize(resources: ContainerResources, heaps_required: &[HeapType]) -> ZeResult<Self> {
        let buffer = resources.obtain(
            resources.config.command_buffer_size as u64,
            AllocationType::CommandBuffer,
        )?;
        let mut heaps: [Option<IndirectHeap>; 3] = [None, None, None];
        for heap_type in heaps_required {
            match resources.obtain(resources.heap_size(*heap_type), AllocationType::InternalHeap) {
                Ok(allocation) => {
                    heaps[heap_type.index()] = Some(IndirectHeap::new(*heap_type, allocation));
                }
                Err(err) => {
                    resources.retire(buffer);
                    for heap in heaps.into_iter().flatten() {
                        resources.retire(heap.allocation().clone());
                    }
                    return Err(err);
                }
            }
        }

        let mut container = Self {
            stateless_mocs: resources.config.stateless_mocs,
            resources,
            cmd_buffers: vec![LinearStream::new(buffer)],
            heaps,
            retired_heaps: Vec::new(),
            residency: Vec::new(),
            resident_ids: HashSet::new(),
            deallocation: Vec::new(),
            heap_reallocations: 0,
        };
        container.add_owned_to_residency();
        Ok(container)
    }

    fn add_owned_to_residency(&mut self) {
        let owned: Vec<_> = self
            .cmd_buffers
            .iter()
            .map(|b| b.allocation().clone())
            .chain(self.heaps.iter().flatten().map(|h| h.allocation().clone()))
            .chain(self.retired_heaps.iter().cloned())
            .collect();
        for allocation in owned {
            self.add_to_residency(&allocation);
        }
    }

    pub fn resources(&self) -> &ContainerResources {
        &self.resources
    }

    pub fn stateless_mocs(&self) -> u32 {
        self.stateless_mocs
    }

    pub fn heap(&self, heap_type: HeapType) -> Option<&IndirectHeap> {
        self.heaps[heap_type.index()].as_ref()
    }

    pub fn heap_mut(&mut self, heap_type: HeapType) -> Option<&mut IndirectHeap> {
        self.heaps[heap_type.index()].as_mut()
    }

    /// Live heap of `heap_type` with room for `min_size` bytes at `alignment`.
    ///
    /// An exhausted heap is switched to a new allocation, which moves its base address.
    pub fn get_indirect_heap(
        &mut self,
        heap_type: HeapType,
        min_size: u64,
        alignment: u64,
    ) -> ZeResult<&mut IndirectHeap> {
        let fits = self
            .heap(heap_type)
            .ok_or(ZeError::InvalidArgument)?
            .fits(min_size, alignment);
        if !fits {
            let size = self
                .resources
                .heap_size(heap_type)
                .max(neo_cmd::align_up(min_size + alignment, 4096));
            let allocation = self.resources.obtain(size, AllocationType::InternalHeap)?;
            self.add_to_residency(&allocation);
            let heap = self.heaps[heap_type.index()]
                .as_mut()
                .ok_or(ZeError::InvalidArgument)?;
            let retired = heap.replace_buffer(allocation);
            self.retired_heaps.push(retired);
            self.heap_reallocations += 1;
            self.resources.stats.inc_heap_reallocations();
            debug!(?heap_type, size, "indirect heap reallocated");
        }
        self.heaps[heap_type.index()]
            .as_mut()
            .ok_or(ZeError::InvalidArgument)
    }

    /// Number of heap replacements since the container was created.
    pub fn heap_reallocations(&self) -> u32 {
        self.heap_reallocations
    }

    fn current(&self) -> ZeResult<&LinearStream> {
        self.cmd_buffers.last().ok_or(ZeError::Uninitialized)
    }

    fn current_mut(&mut self) -> ZeResult<&mut LinearStream> {
        self.cmd_buffers.last_mut().ok_or(ZeError::Uninitialized)
    }

    /// Command stream with at least `min_size` bytes free besides the chaining reserve.
    pub fn get_command_stream(&mut self, min_size: usize) -> ZeResult<&mut CmdArena> {
        if self.current()?.space_remaining() < min_size + CHAIN_RESERVE {
            self.chain_new_buffer(min_size)?;
        }
        Ok(self.current_mut()?.arena_mut())
    }

    fn chain_new_buffer(&mut self, min_size: usize) -> ZeResult<()> {
        let size = self
            .resources
            .config
            .command_buffer_size
            .max(min_size + CHAIN_RESERVE * 2) as u64;
        let allocation = self.resources.obtain(size, AllocationType::CommandBuffer)?;
        let address = allocation.gpu_address();
        let current = self.current_mut()?;
        if let Err(err) = current.write(MiBatchBufferStart {
            address,
            ..Default::default()
        }) {
            self.resources.retire(allocation);
            return Err(err.into());
        }
        self.add_to_residency(&allocation);
        self.cmd_buffers.push(LinearStream::new(allocation));
        self.resources.stats.inc_command_buffer_chains();
        debug!(buffers = self.cmd_buffers.len(), "command buffer chained");
        Ok(())
    }

    /// Terminate the recorded commands with `MI_BATCH_BUFFER_END`.
    pub fn close(&mut self) -> ZeResult<()> {
        let arena = self.get_command_stream(core::mem::size_of::<MiBatchBufferEnd>())?;
        arena.write(MiBatchBufferEnd::default())?;
        Ok(())
    }

    pub fn command_buffers(&self) -> &[LinearStream] {
        &self.cmd_buffers
    }

    /// GPU address execution of the recorded commands starts at.
    pub fn start_address(&self) -> u64 {
        self.cmd_buffers.first().map_or(0, LinearStream::gpu_base)
    }

    pub fn used(&self) -> usize {
        self.cmd_buffers.iter().map(LinearStream::used).sum()
    }

    pub fn position(&self) -> StreamPosition {
        StreamPosition {
            buffer: self.cmd_buffers.len().saturating_sub(1),
            offset: self.cmd_buffers.last().map_or(0, LinearStream::used),
        }
    }

    pub fn gpu_address_at(&self, position: StreamPosition) -> u64 {
        self.cmd_buffers
            .get(position.buffer)
            .map_or(0, |b| b.gpu_address_at(position.offset))
    }

    /// The recorded command buffers as batch segments, in execution order.
    pub fn batch_segments(&self) -> Vec<BatchSegment> {
        self.segments_from(StreamPosition::default())
    }

    /// Batch segments of everything recorded at or after `from`.
    pub fn segments_from(&self, from: StreamPosition) -> Vec<BatchSegment> {
        self.cmd_buffers
            .iter()
            .enumerate()
            .skip(from.buffer)
            .map(|(index, buffer)| {
                let start = if index == from.buffer { from.offset } else { 0 };
                BatchSegment {
                    kind: SegmentKind::Batch,
                    gpu_address: buffer.gpu_address_at(start),
                    bytes: buffer.as_bytes()[start.min(buffer.used())..].to_vec(),
                }
            })
            .collect()
    }

    /// Add `allocation` to the residency set unless it is already there.
    pub fn add_to_residency(&mut self, allocation: &Arc<GraphicsAllocation>) {
        if self.resident_ids.insert(allocation.id()) {
            self.residency.push(allocation.clone());
        }
    }

    pub fn residency_container(&self) -> &[Arc<GraphicsAllocation>] {
        &self.residency
    }

    /// Allocation owned by the list, freed on reset or destroy once the GPU is done with it.
    pub fn add_to_deallocation(&mut self, allocation: Arc<GraphicsAllocation>) {
        self.add_to_residency(&allocation);
        self.deallocation.push(allocation);
    }

    pub fn deallocation_container(&self) -> &[Arc<GraphicsAllocation>] {
        &self.deallocation
    }

    /// Back to an empty recording state.
    ///
    /// The first command buffer is rewound and kept; heaps keep their allocation and cursor, so
    /// their base addresses survive the reset. Everything else goes back to the pool.
    pub fn reset(&mut self) {
        let mut buffers = std::mem::take(&mut self.cmd_buffers).into_iter();
        if let Some(mut first) = buffers.next() {
            first.reset();
            self.cmd_buffers.push(first);
        }
        for extra in buffers {
            self.resources.retire(extra.allocation().clone());
        }
        for heap in self.retired_heaps.drain(..) {
            self.resources.retire(heap);
        }
        for allocation in self.deallocation.drain(..) {
            self.resources.release_deferred(allocation);
        }
        self.resources.reuse_pool.clean_allocation_list(
            self.resources.completion.as_ref(),
            AllocationUsage::TemporaryAllocation,
        );
        self.residency.clear();
        self.resident_ids.clear();
        self.add_owned_to_residency();
    }

    fn destroy(&mut self) {
        let mut owned: Vec<Arc<GraphicsAllocation>> = self
            .cmd_buffers
            .drain(..)
            .map(|b| b.allocation().clone())
            .collect();
        owned.extend(
            self.heaps
                .iter_mut()
                .filter_map(Option::take)
                .map(|h| h.allocation().clone()),
        );
        owned.append(&mut self.retired_heaps);
        for allocation in owned {
            self.resources.retire(allocation);
        }
        for allocation in self.deallocation.drain(..) {
            self.resources.release_deferred(allocation);
        }
        self.residency.clear();
        self.resident_ids.clear();
    }
}

impl Drop for CommandContainer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for CommandContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContainer")
            .field("cmd_buffers", &self.cmd_buffers)
            .field("heaps", &self.heaps)
            .field("residency", &self.residency.len())
            .field("heap_reallocations", &self.heap_reallocations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::SimMemoryManager;
    use neo_cmd::records::{MiNoop, PipeControl};
    use neo_cmd::{count_opcode, parse_cmd_stream, records::CmdOpcode};

    fn resources(mm: &Arc<SimMemoryManager>, config: DriverConfig) -> ContainerResources {
        ContainerResources {
            config: Arc::new(config),
            memory_manager: mm.clone(),
            reuse_pool: Arc::new(InternalAllocationStorage::new(mm.clone())),
            completion: Arc::new(ContextRegistry::new()),
            stats: Arc::new(SubmissionStats::new()),
        }
    }

    #[test]
    fn initialize_allocates_buffer_and_requested_heaps() {
        let mm = Arc::new(SimMemoryManager::new());
        let c = CommandContainer::initialize(
            resources(&mm, DriverConfig::default()),
            &[HeapType::IndirectObject, HeapType::SurfaceState],
        )
        .unwrap();
        assert!(c.heap(HeapType::DynamicState).is_none());
        assert!(c.heap(HeapType::SurfaceState).is_some());
        assert_eq!(c.residency_container().len(), 3);
        assert_eq!(mm.live_allocations(), 3);
    }

    #[test]
    fn initialize_failure_returns_partial_allocations() {
        let mm = Arc::new(SimMemoryManager::new());
        mm.fail_allocations_of_type(AllocationType::InternalHeap);
        let r = resources(&mm, DriverConfig::default());
        let err = CommandContainer::initialize(r.clone(), &HeapType::ALL).unwrap_err();
        assert_eq!(err, ZeError::OutOfDeviceMemory);
        assert_eq!(r.reuse_pool.len(AllocationUsage::ReusableAllocation), 1);
    }

    #[test]
    fn overflow_chains_into_a_new_buffer() {
        let mm = Arc::new(SimMemoryManager::new());
        let config = DriverConfig {
            command_buffer_size: 256,
            ..Default::default()
        };
        let mut c = CommandContainer::initialize(resources(&mm, config), &[]).unwrap();
        for _ in 0..12 {
            c.get_command_stream(32)
                .unwrap()
                .write(PipeControl::default())
                .unwrap();
        }
        c.close().unwrap();
        assert_eq!(c.command_buffers().len(), 2);

        let first = parse_cmd_stream(c.command_buffers()[0].as_bytes()).unwrap();
        let neo_cmd::ParsedCmd::MiBatchBufferStart(bbs) = first[first.len() - 1] else {
            panic!("first buffer must end with a chain");
        };
        assert_eq!(bbs.address, c.command_buffers()[1].gpu_base());
        let second = parse_cmd_stream(c.command_buffers()[1].as_bytes()).unwrap();
        assert_eq!(count_opcode(&second, CmdOpcode::MiBatchBufferEnd), 1);
        assert_eq!(c.residency_container().len(), 2);
    }

    #[test]
    fn heap_exhaustion_moves_the_base_and_keeps_the_old_heap_resident() {
        let mm = Arc::new(SimMemoryManager::new());
        let config = DriverConfig {
            surface_state_heap_size: 4096,
            ..Default::default()
        };
        let mut c = CommandContainer::initialize(resources(&mm, config), &[HeapType::SurfaceState]).unwrap();
        let base = c.heap(HeapType::SurfaceState).unwrap().gpu_base();

        let heap = c.get_indirect_heap(HeapType::SurfaceState, 4000, 64).unwrap();
        heap.get_space(4000).unwrap();
        assert_eq!(c.heap(HeapType::SurfaceState).unwrap().gpu_base(), base);

        c.get_indirect_heap(HeapType::SurfaceState, 512, 64).unwrap();
        assert_ne!(c.heap(HeapType::SurfaceState).unwrap().gpu_base(), base);
        assert_eq!(c.heap_reallocations(), 1);
        assert!(c.residency_container().iter().any(|a| a.gpu_address() == base));
    }

    #[test]
    fn reset_keeps_heap_bases_and_rewinds_the_first_buffer() {
        let mm = Arc::new(SimMemoryManager::new());
        let r = resources(&mm, DriverConfig::default());
        let mut c = CommandContainer::initialize(r.clone(), &[HeapType::IndirectObject]).unwrap();
        let base = c.heap(HeapType::IndirectObject).unwrap().gpu_base();
        c.get_command_stream(8).unwrap().write(MiNoop::default()).unwrap();
        c.heap_mut(HeapType::IndirectObject).unwrap().get_space(64).unwrap();

        let scratch = mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(64, AllocationType::Buffer))
            .unwrap();
        c.add_to_deallocation(scratch.clone());
        c.add_to_residency(&scratch);
        assert_eq!(c.residency_container().len(), 3);

        c.reset();
        assert_eq!(c.used(), 0);
        assert_eq!(c.heap(HeapType::IndirectObject).unwrap().gpu_base(), base);
        assert_eq!(c.heap(HeapType::IndirectObject).unwrap().used(), 64);
        assert_eq!(c.residency_container().len(), 2);
        assert!(!mm.is_live(scratch.id()));
    }

    #[test]
    fn drop_returns_everything_to_the_pool() {
        let mm = Arc::new(SimMemoryManager::new());
        let r = resources(&mm, DriverConfig::default());
        let c = CommandContainer::initialize(r.clone(), &HeapType::ALL).unwrap();
        drop(c);
        assert_eq!(r.reuse_pool.len(AllocationUsage::ReusableAllocation), 4);

        let again = CommandContainer::initialize(r.clone(), &HeapType::ALL).unwrap();
        assert_eq!(r.reuse_pool.len(AllocationUsage::ReusableAllocation), 0);
        assert_eq!(mm.live_allocations(), 4);
        drop(again);
    }

    #[test]
    fn segments_from_skip_what_was_already_submitted() {
        let mm = Arc::new(SimMemoryManager::new());
        let mut c = CommandContainer::initialize(resources(&mm, DriverConfig::default()), &[]).unwrap();
        c.get_command_stream(8).unwrap().write(MiNoop::default()).unwrap();
        c.close().unwrap();
        let mark = c.position();
        assert_eq!(mark, StreamPosition { buffer: 0, offset: 16 });

        c.get_command_stream(32).unwrap().write(PipeControl::default()).unwrap();
        c.close().unwrap();
        let segments = c.segments_from(mark);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].gpu_address, c.gpu_address_at(mark));
        assert_eq!(segments[0].bytes.len(), 40);
        assert_eq!(c.batch_segments()[0].bytes.len(), 56);
    }
}
