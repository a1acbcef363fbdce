use std::fmt;
use std::sync::Arc;

use neo_cmd::align_up;

use crate::allocation::GraphicsAllocation;
use crate::error::ZeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapType {
    DynamicState,
    IndirectObject,
    SurfaceState,
}

impl HeapType {
    pub const ALL: [HeapType; 3] = [
        HeapType::DynamicState,
        HeapType::IndirectObject,
        HeapType::SurfaceState,
    ];

    pub fn index(self) -> usize {
        match self {
            HeapType::DynamicState => 0,
            HeapType::IndirectObject => 1,
            HeapType::SurfaceState => 2,
        }
    }

    /// Alignment of the state blocks the encoders place in this heap.
    pub fn default_alignment(self) -> u64 {
        64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("{heap_type:?} heap exhausted: requested {requested} bytes, available {available}")]
    Exhausted {
        heap_type: HeapType,
        requested: u64,
        available: u64,
    },
    #[error("write of {len} bytes at offset {offset} is outside the used part of the {heap_type:?} heap")]
    OutOfBounds {
        heap_type: HeapType,
        offset: u64,
        len: usize,
    },
}

impl From<HeapError> for ZeError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::Exhausted { .. } => ZeError::OutOfDeviceMemory,
            HeapError::OutOfBounds { .. } => ZeError::InvalidArgument,
        }
    }
}

/// Bump allocator over one GPU-visible allocation holding surface, dynamic or indirect-object
/// state.
///
/// The cursor only moves forward; the heap is never rewound while it keeps the same allocation,
/// so state written for an earlier submission stays intact while the GPU may still read it.
pub struct IndirectHeap {
    heap_type: HeapType,
    allocation: Arc<GraphicsAllocation>,
    capacity: u64,
    cursor: u64,
    shadow: Vec<u8>,
}

impl IndirectHeap {
    pub fn new(heap_type: HeapType, allocation: Arc<GraphicsAllocation>) -> Self {
        let capacity = allocation.size();
        Self {
            heap_type,
            allocation,
            capacity,
            cursor: 0,
            shadow: Vec::new(),
        }
    }

    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn gpu_base(&self) -> u64 {
        self.allocation.gpu_address()
    }

    /// Offset of the heap's first byte from [`Self::gpu_base`].
    pub fn heap_gpu_start_offset(&self) -> u64 {
        0
    }

    pub fn size(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.cursor
    }

    pub fn available_space(&self) -> u64 {
        self.capacity - self.cursor
    }

    /// Whether `size` bytes fit after aligning the cursor to `alignment`.
    pub fn fits(&self, size: u64, alignment: u64) -> bool {
        align_up(self.cursor, alignment.max(1))
            .checked_add(size)
            .is_some_and(|end| end <= self.capacity)
    }

    pub fn align(&mut self, alignment: u64) {
        self.cursor = align_up(self.cursor, alignment.max(1)).min(self.capacity);
    }

    /// Reserve `size` bytes and return their heap offset.
    pub fn get_space(&mut self, size: u64) -> Result<u64, HeapError> {
        if size > self.available_space() {
            return Err(HeapError::Exhausted {
                heap_type: self.heap_type,
                requested: size,
                available: self.available_space(),
            });
        }
        let offset = self.cursor;
        self.cursor += size;
        let end = self.cursor as usize;
        if self.shadow.len() < end {
            self.shadow.resize(end, 0);
        }
        Ok(offset)
    }

    /// Reserve aligned space and copy `bytes` into it.
    pub fn push(&mut self, bytes: &[u8], alignment: u64) -> Result<u64, HeapError> {
        if !self.fits(bytes.len() as u64, alignment) {
            return Err(HeapError::Exhausted {
                heap_type: self.heap_type,
                requested: bytes.len() as u64,
                available: self.available_space(),
            });
        }
        self.align(alignment);
        let offset = self.get_space(bytes.len() as u64)?;
        self.write_at(offset, bytes)?;
        Ok(offset)
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), HeapError> {
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end as u64 <= self.cursor)
            .ok_or(HeapError::OutOfBounds {
                heap_type: self.heap_type,
                offset,
                len: bytes.len(),
            })?;
        self.shadow[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Host copy of the bytes written so far.
    pub fn shadow(&self) -> &[u8] {
        &self.shadow
    }

    /// Switch to `allocation`, resetting the cursor. Returns the retired allocation.
    pub fn replace_buffer(&mut self, allocation: Arc<GraphicsAllocation>) -> Arc<GraphicsAllocation> {
        self.capacity = allocation.size();
        self.cursor = 0;
        self.shadow.clear();
        std::mem::replace(&mut self.allocation, allocation)
    }
}

impl fmt::Debug for IndirectHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndirectHeap")
            .field("heap_type", &self.heap_type)
            .field("gpu_base", &format_args!("{:#x}", self.gpu_base()))
            .field("used", &self.cursor)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationId, AllocationType};

    fn heap(size: u64) -> IndirectHeap {
        IndirectHeap::new(
            HeapType::SurfaceState,
            Arc::new(GraphicsAllocation::new(
                AllocationId(1),
                AllocationType::InternalHeap,
                0x40_0000,
                size,
                false,
            )),
        )
    }

    #[test]
    fn get_space_respects_alignment_and_capacity() {
        let mut heap = heap(256);
        assert_eq!(heap.get_space(10).unwrap(), 0);
        heap.align(64);
        assert_eq!(heap.get_space(64).unwrap(), 64);
        assert_eq!(heap.available_space(), 128);

        let err = heap.get_space(200).unwrap_err();
        assert_eq!(
            err,
            HeapError::Exhausted {
                heap_type: HeapType::SurfaceState,
                requested: 200,
                available: 128
            }
        );
        assert_eq!(heap.used(), 128);
    }

    #[test]
    fn push_writes_the_shadow() {
        let mut heap = heap(256);
        heap.get_space(4).unwrap();
        let off = heap.push(&[1, 2, 3, 4], 64).unwrap();
        assert_eq!(off, 64);
        assert_eq!(&heap.shadow()[64..68], &[1, 2, 3, 4]);
        assert!(heap.write_at(250, &[0; 8]).is_err());
    }

    #[test]
    fn replace_buffer_moves_the_base() {
        let mut heap = heap(128);
        heap.get_space(100).unwrap();
        assert!(!heap.fits(64, 64));

        let old_base = heap.gpu_base();
        let old = heap.replace_buffer(Arc::new(GraphicsAllocation::new(
            AllocationId(2),
            AllocationType::InternalHeap,
            0x80_0000,
            128,
            false,
        )));
        assert_eq!(old.gpu_address(), old_base);
        assert_ne!(heap.gpu_base(), old_base);
        assert_eq!(heap.used(), 0);
        assert!(heap.fits(64, 64));
    }
}
