//! GPU allocations and the completion types that guard their release.
//!
//! Allocations are owned by the [`MemoryManager`]; command lists and CSRs only hold `Arc`s and
//! record, per submission context, the task count of the last submission that referenced them.
//! Releasing an allocation requires a [`CompletionProof`] for every context that used it.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::memory_manager::MemoryManager;

/// Submission counter of one context. Strictly increasing per submitted batch.
pub type TaskCount = u32;

/// Task-count slot value for "never used by this context".
pub const OBJECT_NOT_USED: TaskCount = TaskCount::MAX;

/// Number of submission contexts an allocation can track independently.
pub const MAX_OS_CONTEXTS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsContextId(pub u32);

impl OsContextId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationType {
    CommandBuffer,
    LinearStream,
    InternalHeap,
    TagBuffer,
    KernelIsa,
    Buffer,
    ExternalHostPtr,
    TimestampPacket,
    PreemptionBuffer,
    ScratchSurface,
    PrintfSurface,
}

impl AllocationType {
    /// Whether allocations of this type default to host-visible words.
    pub fn is_host_visible_by_default(self) -> bool {
        matches!(
            self,
            AllocationType::TagBuffer
                | AllocationType::TimestampPacket
                | AllocationType::ExternalHostPtr
                | AllocationType::PrintfSurface
        )
    }
}

struct UsageSlot {
    task_count: AtomicU32,
    resident_task_count: AtomicU32,
}

impl UsageSlot {
    fn new() -> Self {
        Self {
            task_count: AtomicU32::new(OBJECT_NOT_USED),
            resident_task_count: AtomicU32::new(OBJECT_NOT_USED),
        }
    }
}

/// A GPU-addressable memory region.
pub struct GraphicsAllocation {
    id: AllocationId,
    allocation_type: AllocationType,
    gpu_address: u64,
    size: u64,
    host_words: Option<Box<[AtomicU32]>>,
    usage: [UsageSlot; MAX_OS_CONTEXTS],
}

impl GraphicsAllocation {
    pub fn new(
        id: AllocationId,
        allocation_type: AllocationType,
        gpu_address: u64,
        size: u64,
        host_visible: bool,
    ) -> Self {
        let host_words = host_visible.then(|| {
            (0..size.div_ceil(4))
                .map(|_| AtomicU32::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        Self {
            id,
            allocation_type,
            gpu_address,
            size,
            host_words,
            usage: std::array::from_fn(|_| UsageSlot::new()),
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_end(&self) -> u64 {
        self.gpu_address + self.size
    }

    pub fn contains_gpu_range(&self, address: u64, len: u64) -> bool {
        address >= self.gpu_address
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.gpu_end())
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_words.is_some()
    }

    fn word(&self, byte_offset: u64) -> Option<&AtomicU32> {
        if byte_offset % 4 != 0 {
            return None;
        }
        self.host_words.as_ref()?.get((byte_offset / 4) as usize)
    }

    /// Host read of the dword at `byte_offset`. `None` when not host visible or out of range.
    pub fn read_u32(&self, byte_offset: u64) -> Option<u32> {
        self.word(byte_offset).map(|w| w.load(Ordering::Acquire))
    }

    /// Host write of the dword at `byte_offset`. Returns false when the write was dropped.
    pub fn write_u32(&self, byte_offset: u64, value: u32) -> bool {
        match self.word(byte_offset) {
            Some(w) => {
                w.store(value, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn read_u64(&self, byte_offset: u64) -> Option<u64> {
        let lo = self.read_u32(byte_offset)?;
        let hi = self.read_u32(byte_offset + 4)?;
        Some(u64::from(lo) | (u64::from(hi) << 32))
    }

    pub fn write_u64(&self, byte_offset: u64, value: u64) -> bool {
        self.write_u32(byte_offset, value as u32) && self.write_u32(byte_offset + 4, (value >> 32) as u32)
    }

    fn slot(&self, context: OsContextId) -> Option<&UsageSlot> {
        self.usage.get(context.index())
    }

    /// Task count of the last submission on `context` that referenced this allocation.
    pub fn task_count(&self, context: OsContextId) -> Option<TaskCount> {
        let v = self.slot(context)?.task_count.load(Ordering::Acquire);
        (v != OBJECT_NOT_USED).then_some(v)
    }

    pub fn update_task_count(&self, task_count: TaskCount, context: OsContextId) {
        if let Some(slot) = self.slot(context) {
            slot.task_count.store(task_count, Ordering::Release);
        }
    }

    pub fn is_used_by_os_context(&self, context: OsContextId) -> bool {
        self.task_count(context).is_some()
    }

    /// Whether any context recorded a use of this allocation.
    pub fn is_used(&self) -> bool {
        self.used_contexts().next().is_some()
    }

    /// `(context, task_count)` for every context that recorded a use.
    pub fn used_contexts(&self) -> impl Iterator<Item = (OsContextId, TaskCount)> + '_ {
        self.usage.iter().enumerate().filter_map(|(i, slot)| {
            let tc = slot.task_count.load(Ordering::Acquire);
            (tc != OBJECT_NOT_USED).then_some((OsContextId(i as u32), tc))
        })
    }

    pub fn resident_task_count(&self, context: OsContextId) -> Option<TaskCount> {
        let v = self.slot(context)?.resident_task_count.load(Ordering::Acquire);
        (v != OBJECT_NOT_USED).then_some(v)
    }

    pub fn update_resident_task_count(&self, task_count: TaskCount, context: OsContextId) {
        if let Some(slot) = self.slot(context) {
            slot.resident_task_count
                .store(task_count, Ordering::Release);
        }
    }

    pub fn is_resident(&self, context: OsContextId) -> bool {
        self.resident_task_count(context).is_some()
    }

    pub fn release_residency_in_os_context(&self, context: OsContextId) {
        self.update_resident_task_count(OBJECT_NOT_USED, context);
    }
}

impl fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("id", &self.id)
            .field("type", &self.allocation_type)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size)
            .field("host_visible", &self.is_host_visible())
            .finish()
    }
}

/// Handle returned by a successful submission: the work is complete once the context's tag
/// reaches `task_count`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompletionFence {
    pub context: OsContextId,
    pub task_count: TaskCount,
}

/// Evidence that `context` completed every submission up to `completed`.
///
/// Only a CSR wait that observed the tag can construct one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionProof {
    context: OsContextId,
    completed: TaskCount,
}

impl CompletionProof {
    pub(crate) fn new(context: OsContextId, completed: TaskCount) -> Self {
        Self { context, completed }
    }

    pub fn context(&self) -> OsContextId {
        self.context
    }

    pub fn completed(&self) -> TaskCount {
        self.completed
    }

    pub fn covers(&self, fence: CompletionFence) -> bool {
        self.context == fence.context && self.completed >= fence.task_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReleaseError {
    #[error("allocation {id:?} is still in use by context {context:?} up to task count {task_count}")]
    StillInUse {
        id: AllocationId,
        context: OsContextId,
        task_count: TaskCount,
    },
}

/// Free `allocation` once every context that used it is covered by one of `proofs`.
///
/// On failure the allocation is handed back untouched.
pub fn release_with_proof(
    memory_manager: &dyn MemoryManager,
    allocation: Arc<GraphicsAllocation>,
    proofs: &[CompletionProof],
) -> Result<(), (ReleaseError, Arc<GraphicsAllocation>)> {
    let used: Vec<_> = allocation.used_contexts().collect();
    for (context, task_count) in used {
        let covered = proofs
            .iter()
            .any(|p| p.context == context && p.completed >= task_count);
        if !covered {
            let err = ReleaseError::StillInUse {
                id: allocation.id(),
                context,
                task_count,
            };
            return Err((err, allocation));
        }
    }
    memory_manager.free_graphics_memory(allocation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::{AllocationProperties, SimMemoryManager};

    #[test]
    fn host_words_are_readable_and_writable() {
        let alloc = GraphicsAllocation::new(
            AllocationId(1),
            AllocationType::TagBuffer,
            0x1000,
            64,
            true,
        );
        assert!(alloc.write_u32(8, 0xDEAD_BEEF));
        assert_eq!(alloc.read_u32(8), Some(0xDEAD_BEEF));
        assert!(alloc.write_u64(16, 0x1122_3344_5566_7788));
        assert_eq!(alloc.read_u64(16), Some(0x1122_3344_5566_7788));
        assert!(!alloc.write_u32(64, 1));
        assert_eq!(alloc.read_u32(3), None);

        let device_only =
            GraphicsAllocation::new(AllocationId(2), AllocationType::Buffer, 0x2000, 64, false);
        assert_eq!(device_only.read_u32(0), None);
    }

    #[test]
    fn task_counts_are_tracked_per_context() {
        let alloc =
            GraphicsAllocation::new(AllocationId(1), AllocationType::Buffer, 0x1000, 64, false);
        assert!(!alloc.is_used());

        alloc.update_task_count(3, OsContextId(0));
        alloc.update_task_count(9, OsContextId(2));
        assert_eq!(alloc.task_count(OsContextId(0)), Some(3));
        assert!(!alloc.is_used_by_os_context(OsContextId(1)));
        assert_eq!(
            alloc.used_contexts().collect::<Vec<_>>(),
            vec![(OsContextId(0), 3), (OsContextId(2), 9)]
        );

        alloc.update_resident_task_count(4, OsContextId(0));
        assert!(alloc.is_resident(OsContextId(0)));
        alloc.release_residency_in_os_context(OsContextId(0));
        assert!(!alloc.is_resident(OsContextId(0)));
    }

    #[test]
    fn release_requires_proof_for_every_context() {
        let mm = SimMemoryManager::new();
        let alloc = mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                4096,
                AllocationType::Buffer,
            ))
            .unwrap();
        alloc.update_task_count(5, OsContextId(0));
        alloc.update_task_count(2, OsContextId(1));

        let early = [CompletionProof::new(OsContextId(0), 4)];
        let (err, alloc) = release_with_proof(&mm, alloc, &early).unwrap_err();
        assert_eq!(
            err,
            ReleaseError::StillInUse {
                id: alloc.id(),
                context: OsContextId(0),
                task_count: 5
            }
        );
        assert_eq!(mm.live_allocations(), 1);

        let partial = [CompletionProof::new(OsContextId(0), 5)];
        let (_, alloc) = release_with_proof(&mm, alloc, &partial).unwrap_err();

        let full = [
            CompletionProof::new(OsContextId(0), 5),
            CompletionProof::new(OsContextId(1), 7),
        ];
        release_with_proof(&mm, alloc, &full).unwrap();
        assert_eq!(mm.live_allocations(), 0);
    }
}
