use std::fmt;

use crate::records::{CmdHeader, CmdRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("command arena out of space: requested {requested} bytes, remaining {remaining} bytes")]
    OutOfSpace { requested: usize, remaining: usize },
    #[error("patch at offset {offset} is out of bounds (used {used} bytes)")]
    PatchOutOfBounds { offset: usize, used: usize },
    #[error("patch at offset {offset} expected opcode 0x{expected:X}, found 0x{found:X}")]
    PatchOpcodeMismatch {
        offset: usize,
        expected: u32,
        found: u32,
    },
}

/// Append-only, bounds-checked writer for command records.
///
/// The arena never grows past its capacity: a write that does not fit fails with
/// [`ArenaError::OutOfSpace`] and leaves the arena untouched. Callers that need more room
/// chain to a new arena (see the command container).
#[derive(Clone, Default)]
pub struct CmdArena {
    buf: Vec<u8>,
    capacity: usize,
}

impl CmdArena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn space_remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Whether a record of type `T` fits in the remaining space.
    pub fn fits<T: CmdRecord>(&self) -> bool {
        core::mem::size_of::<T>() <= self.space_remaining()
    }

    /// Append `record`, stamping its header, and return the byte offset it was written at.
    pub fn write<T: CmdRecord>(&mut self, mut record: T) -> Result<usize, ArenaError> {
        let size = core::mem::size_of::<T>();
        if size > self.space_remaining() {
            return Err(ArenaError::OutOfSpace {
                requested: size,
                remaining: self.space_remaining(),
            });
        }
        *record.header_mut() = T::expected_header();

        let offset = self.buf.len();
        self.buf.extend_from_slice(bytemuck::bytes_of(&record));
        Ok(offset)
    }

    /// Append raw, 4-byte aligned payload bytes (no header). Used for padding.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, ArenaError> {
        debug_assert_eq!(bytes.len() % 4, 0);
        if bytes.len() > self.space_remaining() {
            return Err(ArenaError::OutOfSpace {
                requested: bytes.len(),
                remaining: self.space_remaining(),
            });
        }
        let offset = self.buf.len();
        self.buf.extend_from_slice(bytes);
        Ok(offset)
    }

    /// Rewrite an already written record in place.
    pub fn patch<T: CmdRecord>(&mut self, offset: usize, mut record: T) -> Result<(), ArenaError> {
        let size = core::mem::size_of::<T>();
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ArenaError::PatchOutOfBounds {
                offset,
                used: self.buf.len(),
            })?;

        let existing: CmdHeader =
            bytemuck::pod_read_unaligned(&self.buf[offset..offset + CmdHeader::SIZE_BYTES]);
        if existing.opcode != T::OPCODE as u32 {
            return Err(ArenaError::PatchOpcodeMismatch {
                offset,
                expected: T::OPCODE as u32,
                found: existing.opcode,
            });
        }

        *record.header_mut() = T::expected_header();
        self.buf[offset..end].copy_from_slice(bytemuck::bytes_of(&record));
        Ok(())
    }

    /// Read back a record previously written at `offset`.
    pub fn read<T: CmdRecord>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(core::mem::size_of::<T>())?;
        let bytes = self.buf.get(offset..end)?;
        let record: T = bytemuck::pod_read_unaligned(bytes);
        (record.header().opcode == T::OPCODE as u32).then_some(record)
    }
}

impl fmt::Debug for CmdArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdArena")
            .field("used", &self.buf.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
