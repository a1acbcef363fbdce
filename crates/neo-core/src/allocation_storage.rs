//! Deferred release and reuse of allocations that in-flight GPU work may still reference.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::trace;

use crate::allocation::{AllocationType, GraphicsAllocation, OsContextId, TaskCount};
use crate::memory_manager::MemoryManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationUsage {
    /// Freed once the GPU is done with it.
    TemporaryAllocation,
    /// Kept for reuse once the GPU is done with it.
    ReusableAllocation,
}

/// Answers whether every recorded GPU use of an allocation has completed.
pub trait CompletionOracle {
    fn is_completed(&self, allocation: &GraphicsAllocation) -> bool;
}

/// Completion of a single context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextCompletion {
    pub context: OsContextId,
    pub completed: TaskCount,
}

impl CompletionOracle for ContextCompletion {
    fn is_completed(&self, allocation: &GraphicsAllocation) -> bool {
        allocation
            .task_count(self.context)
            .map_or(true, |tc| tc <= self.completed)
    }
}

/// Host view of a context's tag allocation.
#[derive(Clone, Debug)]
pub struct TagView {
    context: OsContextId,
    allocation: Arc<GraphicsAllocation>,
    partitions: u32,
    partition_offset: u64,
}

impl TagView {
    pub fn new(
        context: OsContextId,
        allocation: Arc<GraphicsAllocation>,
        partitions: u32,
        partition_offset: u64,
    ) -> Self {
        Self {
            context,
            allocation,
            partitions: partitions.max(1),
            partition_offset,
        }
    }

    pub fn context(&self) -> OsContextId {
        self.context
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn partition_offset(&self) -> u64 {
        self.partition_offset
    }

    pub fn tag_address(&self) -> u64 {
        self.allocation.gpu_address()
    }

    pub fn tag_value(&self, partition: u32) -> Option<TaskCount> {
        if partition >= self.partitions {
            return None;
        }
        self.allocation
            .read_u32(u64::from(partition) * self.partition_offset)
    }

    /// Minimum tag over the active partitions.
    pub fn completed(&self) -> TaskCount {
        (0..self.partitions)
            .map(|p| self.tag_value(p).unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Write `value` to every partition slot.
    pub fn write_all(&self, value: TaskCount) {
        for p in 0..self.partitions {
            self.allocation
                .write_u32(u64::from(p) * self.partition_offset, value);
        }
    }
}

impl CompletionOracle for TagView {
    fn is_completed(&self, allocation: &GraphicsAllocation) -> bool {
        ContextCompletion {
            context: self.context,
            completed: self.completed(),
        }
        .is_completed(allocation)
    }
}

/// Tag views of every live context of a device.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    views: RwLock<Vec<TagView>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, view: TagView) {
        let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
        views.retain(|v| v.context != view.context);
        views.push(view);
    }

    pub fn unregister(&self, context: OsContextId) {
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|v| v.context != context);
    }

    pub fn completed(&self, context: OsContextId) -> Option<TaskCount> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|v| v.context == context)
            .map(TagView::completed)
    }
}

impl CompletionOracle for ContextRegistry {
    fn is_completed(&self, allocation: &GraphicsAllocation) -> bool {
        // A context that is gone has nothing in flight.
        allocation
            .used_contexts()
            .all(|(context, tc)| self.completed(context).map_or(true, |done| done >= tc))
    }
}

/// Ordered list of allocations waiting for completion.
#[derive(Debug, Default)]
pub struct AllocationsList {
    allocations: Vec<Arc<GraphicsAllocation>>,
}

impl AllocationsList {
    pub fn push(&mut self, allocation: Arc<GraphicsAllocation>) {
        self.allocations.push(allocation);
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        self.allocations.iter()
    }

    /// Remove and return the first completed allocation of `allocation_type` holding at least
    /// `min_size` bytes.
    pub fn detach_allocation(
        &mut self,
        min_size: u64,
        allocation_type: AllocationType,
        oracle: &dyn CompletionOracle,
    ) -> Option<Arc<GraphicsAllocation>> {
        let idx = self.allocations.iter().position(|a| {
            a.allocation_type() == allocation_type
                && a.size() >= min_size
                && oracle.is_completed(a)
        })?;
        Some(self.allocations.remove(idx))
    }

    /// Remove and return every completed allocation.
    pub fn take_completed(&mut self, oracle: &dyn CompletionOracle) -> Vec<Arc<GraphicsAllocation>> {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.allocations)
            .into_iter()
            .partition(|a| oracle.is_completed(a));
        self.allocations = pending;
        done
    }

    pub fn take_all(&mut self) -> Vec<Arc<GraphicsAllocation>> {
        std::mem::take(&mut self.allocations)
    }
}

#[derive(Debug, Default)]
struct StorageLists {
    temporary: AllocationsList,
    reusable: AllocationsList,
}

impl StorageLists {
    fn list_mut(&mut self, usage: AllocationUsage) -> &mut AllocationsList {
        match usage {
            AllocationUsage::TemporaryAllocation => &mut self.temporary,
            AllocationUsage::ReusableAllocation => &mut self.reusable,
        }
    }
}

/// Temporary and reusable allocation lists, bucketed by the task count at which each
/// allocation becomes safe to touch again.
pub struct InternalAllocationStorage {
    memory_manager: Arc<dyn MemoryManager>,
    lists: Mutex<StorageLists>,
}

impl InternalAllocationStorage {
    pub fn new(memory_manager: Arc<dyn MemoryManager>) -> Self {
        Self {
            memory_manager,
            lists: Mutex::new(StorageLists::default()),
        }
    }

    fn lists(&self) -> MutexGuard<'_, StorageLists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store_allocation(&self, allocation: Arc<GraphicsAllocation>, usage: AllocationUsage) {
        self.lists().list_mut(usage).push(allocation);
    }

    /// Record that `allocation` is used on `context` up to `task_count`, then store it.
    pub fn store_allocation_with_task_count(
        &self,
        allocation: Arc<GraphicsAllocation>,
        usage: AllocationUsage,
        task_count: TaskCount,
        context: OsContextId,
    ) {
        allocation.update_task_count(task_count, context);
        self.store_allocation(allocation, usage);
    }

    /// Free every completed allocation of `usage`. Returns how many were freed.
    pub fn clean_allocation_list(&self, oracle: &dyn CompletionOracle, usage: AllocationUsage) -> usize {
        let done = self.lists().list_mut(usage).take_completed(oracle);
        let freed = done.len();
        for allocation in done {
            self.memory_manager.free_graphics_memory(allocation);
        }
        if freed > 0 {
            trace!(freed, ?usage, "cleaned allocation list");
        }
        freed
    }

    pub fn obtain_reusable_allocation(
        &self,
        min_size: u64,
        allocation_type: AllocationType,
        oracle: &dyn CompletionOracle,
    ) -> Option<Arc<GraphicsAllocation>> {
        self.lists()
            .reusable
            .detach_allocation(min_size, allocation_type, oracle)
    }

    pub fn len(&self, usage: AllocationUsage) -> usize {
        self.lists().list_mut(usage).len()
    }

    /// Free everything regardless of completion. Only for teardown after a final wait.
    pub fn free_all(&self) {
        let mut lists = self.lists();
        let mut all = lists.temporary.take_all();
        all.extend(lists.reusable.take_all());
        drop(lists);
        for allocation in all {
            self.memory_manager.free_graphics_memory(allocation);
        }
    }
}

impl std::fmt::Debug for InternalAllocationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists();
        f.debug_struct("InternalAllocationStorage")
            .field("temporary", &lists.temporary.len())
            .field("reusable", &lists.reusable.len())
            .finish()
    }
}
