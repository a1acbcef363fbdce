use std::fmt;
use std::sync::Arc;

use neo_cmd::{ArenaError, CmdArena, CmdRecord};

use crate::allocation::GraphicsAllocation;

/// A command arena backed by one GPU allocation.
///
/// The GPU address of a record is the allocation's GPU address plus the record's arena offset.
pub struct LinearStream {
    arena: CmdArena,
    allocation: Arc<GraphicsAllocation>,
}

impl LinearStream {
    pub fn new(allocation: Arc<GraphicsAllocation>) -> Self {
        Self {
            arena: CmdArena::with_capacity(allocation.size() as usize),
            allocation,
        }
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn gpu_base(&self) -> u64 {
        self.allocation.gpu_address()
    }

    pub fn gpu_address_at(&self, offset: usize) -> u64 {
        self.allocation.gpu_address() + offset as u64
    }

    /// GPU address the next record will be written at.
    pub fn current_gpu_address(&self) -> u64 {
        self.gpu_address_at(self.arena.used())
    }

    pub fn used(&self) -> usize {
        self.arena.used()
    }

    pub fn space_remaining(&self) -> usize {
        self.arena.space_remaining()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.arena.as_bytes()
    }

    pub fn arena(&self) -> &CmdArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut CmdArena {
        &mut self.arena
    }

    pub fn write<T: CmdRecord>(&mut self, record: T) -> Result<usize, ArenaError> {
        self.arena.write(record)
    }

    /// Switch to `allocation` with an empty arena, returning the previous allocation.
    pub fn replace_buffer(&mut self, allocation: Arc<GraphicsAllocation>) -> Arc<GraphicsAllocation> {
        self.arena = CmdArena::with_capacity(allocation.size() as usize);
        std::mem::replace(&mut self.allocation, allocation)
    }

    /// Rewind to the start of the current allocation.
    pub fn reset(&mut self) {
        self.arena.reset();
    }
}

impl fmt::Debug for LinearStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearStream")
            .field("gpu_base", &format_args!("{:#x}", self.gpu_base()))
            .field("used", &self.arena.used())
            .field("capacity", &self.arena.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationId, AllocationType};
    use neo_cmd::records::{MiBatchBufferEnd, MiNoop};

    fn alloc(id: u64, gpu: u64, size: u64) -> Arc<GraphicsAllocation> {
        Arc::new(GraphicsAllocation::new(
            AllocationId(id),
            AllocationType::CommandBuffer,
            gpu,
            size,
            false,
        ))
    }

    #[test]
    fn addresses_follow_arena_offsets() {
        let mut stream = LinearStream::new(alloc(1, 0x10_0000, 64));
        let off = stream.write(MiNoop::default()).unwrap();
        assert_eq!(stream.gpu_address_at(off), 0x10_0000);
        assert_eq!(stream.current_gpu_address(), 0x10_0008);
        assert_eq!(stream.space_remaining(), 56);
    }

    #[test]
    fn replace_buffer_resets_the_arena() {
        let mut stream = LinearStream::new(alloc(1, 0x10_0000, 64));
        stream.write(MiBatchBufferEnd::default()).unwrap();
        let old = stream.replace_buffer(alloc(2, 0x20_0000, 128));
        assert_eq!(old.id(), AllocationId(1));
        assert_eq!(stream.used(), 0);
        assert_eq!(stream.space_remaining(), 128);
        assert_eq!(stream.gpu_base(), 0x20_0000);
    }
}
