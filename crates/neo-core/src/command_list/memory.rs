//! Copies, fills and prefetches. The compute engine runs them as built-in kernels, the copy
//! engine as blits.

use std::sync::Arc;

use neo_cmd::records::XyCopyBlt;
use tracing::trace;

use super::{CommandList, WaitList};
use crate::allocation::GraphicsAllocation;
use crate::builtins::{fill_pattern_arg, plan_copy, plan_fill, BuiltinKernel, DispatchChunk, RegionArgs};
use crate::device::EngineGroupType;
use crate::error::{ZeError, ZeResult};
use crate::event::Event;
use crate::module::Kernel;

/// Memory operand of a copy, fill or query.
#[derive(Clone, Debug)]
pub enum MemoryRef {
    Device {
        allocation: Arc<GraphicsAllocation>,
        offset: u64,
    },
    /// Host memory previously registered with [`CommandList::register_host_ptr`].
    HostPtr(u64),
}

impl MemoryRef {
    pub fn device(allocation: &Arc<GraphicsAllocation>, offset: u64) -> Self {
        MemoryRef::Device {
            allocation: allocation.clone(),
            offset,
        }
    }
}

/// A box inside a pitched buffer: origin in bytes/rows/slices and its extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyRegion {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl CopyRegion {
    fn origin_offset(&self, pitch: u32, slice_pitch: u32) -> u64 {
        u64::from(self.z) * u64::from(slice_pitch) + u64::from(self.y) * u64::from(pitch) + u64::from(self.x)
    }

    /// Bytes from the origin to the end of the last row of the last slice.
    fn extent(&self, pitch: u32, slice_pitch: u32) -> u64 {
        u64::from(self.depth - 1) * u64::from(slice_pitch)
            + u64::from(self.height - 1) * u64::from(pitch)
            + u64::from(self.width)
    }
}

impl CommandList {
    /// Allocation and offset behind `len` bytes of `memory`.
    pub(super) fn resolve_memory(&self, memory: &MemoryRef, len: u64) -> ZeResult<(Arc<GraphicsAllocation>, u64)> {
        match memory {
            MemoryRef::Device { allocation, offset } => {
                let end = offset.checked_add(len).ok_or(ZeError::InvalidSize)?;
                if end > allocation.size() {
                    return Err(ZeError::InvalidSize);
                }
                Ok((allocation.clone(), *offset))
            }
            MemoryRef::HostPtr(address) => self
                .find_host_ptr(*address, len)
                .ok_or(ZeError::InvalidArgument),
        }
    }

    fn completion_needs_flush(&self, destination: &Arc<GraphicsAllocation>, wait: WaitList<'_>) -> bool {
        wait.has_host_scope() || destination.is_host_visible()
    }

    /// Finish a copy or fill: signal `signal`, or flush on its own when the result must be
    /// host visible.
    fn encode_completion(&mut self, signal: Option<&Arc<Event>>, dc_flush: bool) -> ZeResult<()> {
        match signal {
            Some(event) => self.encode_signal(event, dc_flush),
            None if dc_flush => self.encode_stall(true),
            None => Ok(()),
        }
    }

    fn builtin_kernel(&self, which: BuiltinKernel) -> ZeResult<Kernel> {
        self.device
            .builtins()
            .kernel(which, self.encoder.hw_info().max_work_group_size)
    }

    fn dispatch_chunk(&mut self, kernel: &Kernel, chunk: &DispatchChunk) -> ZeResult<()> {
        let group_count = chunk.group_count(kernel.group_size()[0]);
        self.launch(kernel, group_count, None)
    }

    /// Copy `size` bytes from `source` to `destination`.
    pub fn append_memory_copy(
        &mut self,
        destination: &MemoryRef,
        source: &MemoryRef,
        size: u64,
        signal: Option<&Arc<Event>>,
        wait: WaitList<'_>,
    ) -> ZeResult<()> {
        self.record("append_memory_copy", |list| {
            let waits = wait.resolve()?;
            let (dst, dst_offset) = list.resolve_memory(destination, size)?;
            let (src, src_offset) = list.resolve_memory(source, size)?;
            list.container.add_to_residency(&dst);
            list.container.add_to_residency(&src);
            list.encode_waits(waits)?;

            let dst_address = dst.gpu_address() + dst_offset;
            let src_address = src.gpu_address() + src_offset;
            match list.engine {
                EngineGroupType::Compute => {
                    let max = list.device.config().max_copy_dispatch_size;
                    for chunk in plan_copy(dst_address, src_address, size, max) {
                        let mut kernel = list.builtin_kernel(chunk.kernel)?;
                        kernel.set_arg_buffer(0, dst.clone(), dst_offset + chunk.offset)?;
                        kernel.set_arg_buffer(1, src.clone(), src_offset + chunk.offset)?;
                        kernel.set_arg_value(2, &chunk.size.to_le_bytes())?;
                        list.dispatch_chunk(&kernel, &chunk)?;
                    }
                }
                EngineGroupType::Copy => {
                    let encoder = list.encoder;
                    let arena = list.cs(encoder.blit_copy_size(size))?;
                    encoder.encode_blit_copy(arena, dst_address, src_address, size)?;
                }
            }
            trace!(dst_address, src_address, size, engine = ?list.engine, "memory copy recorded");
            let flush = list.completion_needs_flush(&dst, wait);
            list.encode_completion(signal, flush)
        })
    }

    /// Copy a `width` x `height` x `depth` box between two pitched buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn append_memory_copy_region(
        &mut self,
        destination: &MemoryRef,
        dst_region: CopyRegion,
        dst_pitch: u32,
        dst_slice_pitch: u32,
        source: &MemoryRef,
        src_region: CopyRegion,
        src_pitch: u32,
        src_slice_pitch: u32,
        signal: Option<&Arc<Event>>,
        wait: WaitList<'_>,
    ) -> ZeResult<()> {
        self.record("append_memory_copy_region", |list| {
            let waits = wait.resolve()?;
            let dims = |r: &CopyRegion| (r.width, r.height, r.depth);
            if dims(&dst_region) != dims(&src_region) {
                return Err(ZeError::InvalidArgument);
            }
            if src_region.width == 0 || src_region.height == 0 || src_region.depth == 0 {
                return Err(ZeError::InvalidSize);
            }
            if src_region.width > src_pitch || dst_region.width > dst_pitch {
                return Err(ZeError::InvalidArgument);
            }
            let dst_start = dst_region.origin_offset(dst_pitch, dst_slice_pitch);
            let src_start = src_region.origin_offset(src_pitch, src_slice_pitch);
            let dst_len = dst_start + dst_region.extent(dst_pitch, dst_slice_pitch);
            let src_len = src_start + src_region.extent(src_pitch, src_slice_pitch);
            let (dst, dst_offset) = list.resolve_memory(destination, dst_len)?;
            let (src, src_offset) = list.resolve_memory(source, src_len)?;
            list.container.add_to_residency(&dst);
            list.container.add_to_residency(&src);
            list.encode_waits(waits)?;

            match list.engine {
                EngineGroupType::Compute => {
                    let mut kernel = list.builtin_kernel(BuiltinKernel::CopyRegion3d)?;
                    kernel.set_arg_buffer(0, dst.clone(), dst_offset + dst_start)?;
                    kernel.set_arg_buffer(1, src.clone(), src_offset + src_start)?;
                    let args = RegionArgs {
                        destination_pitch: dst_pitch,
                        destination_slice_pitch: dst_slice_pitch,
                        source_pitch: src_pitch,
                        source_slice_pitch: src_slice_pitch,
                        width: src_region.width,
                        height: src_region.height,
                        depth: src_region.depth,
                        reserved: 0,
                    };
                    kernel.set_arg_value(2, bytemuck::bytes_of(&args))?;
                    let group_count = [
                        src_region.width.div_ceil(kernel.group_size()[0]),
                        src_region.height,
                        src_region.depth,
                    ];
                    list.launch(&kernel, group_count, None)?;
                }
                EngineGroupType::Copy => {
                    let encoder = list.encoder;
                    let base_dst = dst.gpu_address() + dst_offset + dst_start;
                    let base_src = src.gpu_address() + src_offset + src_start;
                    let slices = src_region.depth as usize;
                    let arena = list.cs(core::mem::size_of::<XyCopyBlt>() * slices)?;
                    for slice in 0..u64::from(src_region.depth) {
                        encoder.encode_blit_copy_region(
                            arena,
                            base_dst + slice * u64::from(dst_slice_pitch),
                            dst_pitch,
                            base_src + slice * u64::from(src_slice_pitch),
                            src_pitch,
                            src_region.width,
                            src_region.height,
                        )?;
                    }
                }
            }
            let flush = list.completion_needs_flush(&dst, wait);
            list.encode_completion(signal, flush)
        })
    }

    /// Fill `size` bytes of `destination` with `pattern` repeated.
    pub fn append_memory_fill(
        &mut self,
        destination: &MemoryRef,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        wait: WaitList<'_>,
    ) -> ZeResult<()> {
        self.record("append_memory_fill", |list| {
            let waits = wait.resolve()?;
            if pattern.is_empty() {
                return Err(ZeError::InvalidArgument);
            }
            if pattern.len() > crate::builtins::WIDE_ALIGNMENT as usize {
                return Err(ZeError::InvalidSize);
            }
            let (dst, dst_offset) = list.resolve_memory(destination, size)?;
            list.container.add_to_residency(&dst);
            list.encode_waits(waits)?;

            let dst_address = dst.gpu_address() + dst_offset;
            match list.engine {
                EngineGroupType::Compute => {
                    let max = list.device.config().max_copy_dispatch_size;
                    for chunk in plan_fill(dst_address, size, pattern.len(), max) {
                        let mut kernel = list.builtin_kernel(chunk.kernel)?;
                        kernel.set_arg_buffer(0, dst.clone(), dst_offset + chunk.offset)?;
                        kernel.set_arg_value(1, &fill_pattern_arg(pattern, chunk.offset))?;
                        kernel.set_arg_value(2, &chunk.size.to_le_bytes())?;
                        list.dispatch_chunk(&kernel, &chunk)?;
                    }
                }
                EngineGroupType::Copy => {
                    let encoder = list.encoder;
                    let arena = list.cs(encoder.blit_fill_size(size))?;
                    encoder.encode_blit_fill(arena, dst_address, size, pattern)?;
                }
            }
            trace!(dst_address, size, pattern_len = pattern.len(), "memory fill recorded");
            let flush = list.completion_needs_flush(&dst, wait);
            list.encode_completion(signal, flush)
        })
    }

    /// Make `size` bytes of `memory` resident whenever the list executes.
    pub fn append_memory_prefetch(&mut self, memory: &MemoryRef, size: u64) -> ZeResult<()> {
        self.record("append_memory_prefetch", |list| {
            let (allocation, _) = list.resolve_memory(memory, size)?;
            list.container.add_to_residency(&allocation);
            Ok(())
        })
    }
}
