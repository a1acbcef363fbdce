use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::allocation::{AllocationId, AllocationType, GraphicsAllocation, OsContextId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationProperties {
    pub size: u64,
    pub allocation_type: AllocationType,
    pub host_visible: bool,
}

impl AllocationProperties {
    pub fn new(size: u64, allocation_type: AllocationType) -> Self {
        Self {
            size,
            allocation_type,
            host_visible: allocation_type.is_host_visible_by_default(),
        }
    }

    pub fn host_visible(mut self, host_visible: bool) -> Self {
        self.host_visible = host_visible;
        self
    }
}

/// Owner of every [`GraphicsAllocation`].
pub trait MemoryManager: Send + Sync {
    /// `None` when the allocation cannot be satisfied.
    fn allocate_graphics_memory_with_properties(
        &self,
        properties: &AllocationProperties,
    ) -> Option<Arc<GraphicsAllocation>>;

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>);

    fn make_resident_hook(&self, _allocation: &GraphicsAllocation, _context: OsContextId) {}

    fn evict_hook(&self, _allocation: &GraphicsAllocation, _context: OsContextId) {}

    fn live_allocations(&self) -> usize;
}

const GPU_VA_BASE: u64 = 0x0000_0001_0000_0000;
const GPU_VA_ALIGNMENT: u64 = 64 * 1024;

#[derive(Debug, Default)]
struct SimState {
    next_gpu_va: u64,
    next_id: u64,
    live: HashMap<AllocationId, AllocationType>,
    freed: Vec<AllocationId>,
    fail_next: u32,
    fail_types: HashSet<AllocationType>,
}

/// In-process memory manager: bump-allocated GPU virtual addresses, optional host words and
/// allocation failure injection.
#[derive(Debug)]
pub struct SimMemoryManager {
    state: Mutex<SimState>,
}

impl Default for SimMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMemoryManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_gpu_va: GPU_VA_BASE,
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` allocations regardless of type.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Fail every allocation of `allocation_type` until [`Self::clear_failures`].
    pub fn fail_allocations_of_type(&self, allocation_type: AllocationType) {
        self.state().fail_types.insert(allocation_type);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_next = 0;
        state.fail_types.clear();
    }

    pub fn live_allocations_of_type(&self, allocation_type: AllocationType) -> usize {
        self.state()
            .live
            .values()
            .filter(|ty| **ty == allocation_type)
            .count()
    }

    pub fn is_live(&self, id: AllocationId) -> bool {
        self.state().live.contains_key(&id)
    }

    pub fn freed(&self) -> Vec<AllocationId> {
        self.state().freed.clone()
    }
}

impl MemoryManager for SimMemoryManager {
    fn allocate_graphics_memory_with_properties(
        &self,
        properties: &AllocationProperties,
    ) -> Option<Arc<GraphicsAllocation>> {
        let mut state = self.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            trace!(?properties, "injected allocation failure");
            return None;
        }
        if properties.size == 0 || state.fail_types.contains(&properties.allocation_type) {
            return None;
        }

        let id = AllocationId(state.next_id);
        state.next_id += 1;
        let gpu_address = state.next_gpu_va;
        let span = neo_cmd::align_up(properties.size, GPU_VA_ALIGNMENT);
        state.next_gpu_va = state.next_gpu_va.checked_add(span)?;
        state.live.insert(id, properties.allocation_type);

        Some(Arc::new(GraphicsAllocation::new(
            id,
            properties.allocation_type,
            gpu_address,
            properties.size,
            properties.host_visible,
        )))
    }

    fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        let mut state = self.state();
        if state.live.remove(&allocation.id()).is_some() {
            state.freed.push(allocation.id());
        }
    }

    fn live_allocations(&self) -> usize {
        self.state().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_get_distinct_aligned_addresses() {
        let mm = SimMemoryManager::new();
        let a = mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                100,
                AllocationType::Buffer,
            ))
            .unwrap();
        let b = mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                100,
                AllocationType::TagBuffer,
            ))
            .unwrap();
        assert_ne!(a.gpu_address(), b.gpu_address());
        assert_eq!(b.gpu_address() % GPU_VA_ALIGNMENT, 0);
        assert!(!a.is_host_visible());
        assert!(b.is_host_visible());
        assert_eq!(mm.live_allocations(), 2);

        mm.free_graphics_memory(a.clone());
        mm.free_graphics_memory(a.clone());
        assert_eq!(mm.live_allocations(), 1);
        assert_eq!(mm.freed(), vec![a.id()]);
    }

    #[test]
    fn failure_injection() {
        let mm = SimMemoryManager::new();
        let props = AllocationProperties::new(64, AllocationType::InternalHeap);

        mm.fail_next_allocations(1);
        assert!(mm.allocate_graphics_memory_with_properties(&props).is_none());
        assert!(mm.allocate_graphics_memory_with_properties(&props).is_some());

        mm.fail_allocations_of_type(AllocationType::InternalHeap);
        assert!(mm.allocate_graphics_memory_with_properties(&props).is_none());
        assert!(mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                64,
                AllocationType::Buffer
            ))
            .is_some());

        mm.clear_failures();
        assert!(mm.allocate_graphics_memory_with_properties(&props).is_some());
        assert_eq!(mm.live_allocations_of_type(AllocationType::InternalHeap), 2);
    }
}
