//! Built-in kernels behind compute-engine copies and fills, and the planning that splits a
//! byte range into dispatches.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ZeError, ZeResult};
use crate::memory_manager::MemoryManager;
use crate::module::{ArgKind, Kernel, KernelDesc, KernelImmutableData, ModuleDesc, ModuleId, ModuleRegistry};

/// Alignment the wide copy and fill variants operate at.
pub const WIDE_ALIGNMENT: u64 = 16;
const BUILTIN_SIMD: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinKernel {
    CopyBufferBytes,
    CopyBuffer16,
    CopyRegion3d,
    FillBufferBytes,
    FillBuffer16,
}

impl BuiltinKernel {
    pub const ALL: [BuiltinKernel; 5] = [
        BuiltinKernel::CopyBufferBytes,
        BuiltinKernel::CopyBuffer16,
        BuiltinKernel::CopyRegion3d,
        BuiltinKernel::FillBufferBytes,
        BuiltinKernel::FillBuffer16,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinKernel::CopyBufferBytes => "copy_buffer_to_buffer_bytes",
            BuiltinKernel::CopyBuffer16 => "copy_buffer_to_buffer_16",
            BuiltinKernel::CopyRegion3d => "copy_buffer_region_3d",
            BuiltinKernel::FillBufferBytes => "fill_buffer_bytes",
            BuiltinKernel::FillBuffer16 => "fill_buffer_16",
        }
    }

    /// Bytes one work item handles.
    pub fn item_size(self) -> u64 {
        match self {
            BuiltinKernel::CopyBuffer16 | BuiltinKernel::FillBuffer16 => WIDE_ALIGNMENT,
            _ => 1,
        }
    }

    fn args(self) -> Vec<ArgKind> {
        match self {
            BuiltinKernel::CopyBufferBytes | BuiltinKernel::CopyBuffer16 => {
                vec![ArgKind::Buffer, ArgKind::Buffer, ArgKind::Value { size: 8 }]
            }
            BuiltinKernel::CopyRegion3d => {
                vec![ArgKind::Buffer, ArgKind::Buffer, ArgKind::Value { size: 32 }]
            }
            BuiltinKernel::FillBufferBytes | BuiltinKernel::FillBuffer16 => vec![
                ArgKind::Buffer,
                ArgKind::Value { size: 16 },
                ArgKind::Value { size: 8 },
            ],
        }
    }

    fn desc(self) -> KernelDesc {
        let mut isa = self.name().as_bytes().to_vec();
        isa.resize(64, 0);
        KernelDesc {
            name: self.name().to_string(),
            isa,
            simd_size: BUILTIN_SIMD,
            args: self.args(),
            ..Default::default()
        }
    }
}

/// The device's built-in module.
#[derive(Debug)]
pub struct Builtins {
    module: ModuleId,
    kernels: HashMap<BuiltinKernel, Arc<KernelImmutableData>>,
}

impl Builtins {
    pub fn create(registry: &mut ModuleRegistry, memory_manager: &dyn MemoryManager) -> ZeResult<Self> {
        let desc = ModuleDesc {
            kernels: BuiltinKernel::ALL.iter().map(|k| k.desc()).collect(),
            ..Default::default()
        };
        let module = registry.create_module(desc, memory_manager)?;
        let built = registry.get(module).ok_or(ZeError::ModuleBuildFailure)?;
        let mut kernels = HashMap::new();
        for which in BuiltinKernel::ALL {
            let data = built
                .get_kernel_immutable_data(which.name())
                .ok_or(ZeError::ModuleBuildFailure)?;
            kernels.insert(which, data.clone());
        }
        Ok(Self { module, kernels })
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn kernel(&self, which: BuiltinKernel, max_work_group_size: u32) -> ZeResult<Kernel> {
        let data = self.kernels.get(&which).ok_or(ZeError::Uninitialized)?;
        Ok(Kernel::new(self.module, data.clone(), max_work_group_size))
    }
}

/// One built-in dispatch covering `size` bytes starting `offset` bytes into the range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchChunk {
    pub kernel: BuiltinKernel,
    pub offset: u64,
    pub size: u64,
}

impl DispatchChunk {
    /// Number of work items.
    pub fn items(&self) -> u64 {
        self.size / self.kernel.item_size()
    }

    pub fn group_count(&self, group_size: u32) -> [u32; 3] {
        let groups = self.items().div_ceil(u64::from(group_size.max(1)));
        [groups as u32, 1, 1]
    }
}

fn split(kernel: BuiltinKernel, offset: u64, size: u64, max_dispatch: u64, out: &mut Vec<DispatchChunk>) {
    let step = if kernel.item_size() > 1 {
        (max_dispatch / WIDE_ALIGNMENT * WIDE_ALIGNMENT).max(WIDE_ALIGNMENT)
    } else {
        max_dispatch.max(1)
    };
    let mut done = 0;
    while done < size {
        let len = step.min(size - done);
        out.push(DispatchChunk {
            kernel,
            offset: offset + done,
            size: len,
        });
        done += len;
    }
}

/// Split a `size`-byte range at `head_address` into an unaligned head, a 16-byte middle and a
/// tail, each cut into dispatches of at most `max_dispatch` bytes.
fn plan(
    head_address: u64,
    size: u64,
    wide_possible: bool,
    bytes: BuiltinKernel,
    wide: BuiltinKernel,
    max_dispatch: u64,
) -> Vec<DispatchChunk> {
    let mut out = Vec::new();
    if !wide_possible {
        split(bytes, 0, size, max_dispatch, &mut out);
        return out;
    }
    let head = ((WIDE_ALIGNMENT - head_address % WIDE_ALIGNMENT) % WIDE_ALIGNMENT).min(size);
    let middle = (size - head) / WIDE_ALIGNMENT * WIDE_ALIGNMENT;
    let tail = size - head - middle;
    split(bytes, 0, head, max_dispatch, &mut out);
    split(wide, head, middle, max_dispatch, &mut out);
    split(bytes, head + middle, tail, max_dispatch, &mut out);
    out
}

pub fn plan_copy(destination: u64, source: u64, size: u64, max_dispatch: u64) -> Vec<DispatchChunk> {
    plan(
        destination,
        size,
        destination % WIDE_ALIGNMENT == source % WIDE_ALIGNMENT,
        BuiltinKernel::CopyBufferBytes,
        BuiltinKernel::CopyBuffer16,
        max_dispatch,
    )
}

pub fn plan_fill(destination: u64, size: u64, pattern_len: usize, max_dispatch: u64) -> Vec<DispatchChunk> {
    plan(
        destination,
        size,
        WIDE_ALIGNMENT % pattern_len as u64 == 0,
        BuiltinKernel::FillBufferBytes,
        BuiltinKernel::FillBuffer16,
        max_dispatch,
    )
}

/// The 16-byte pattern argument for a fill chunk starting `offset` bytes into the range.
pub fn fill_pattern_arg(pattern: &[u8], offset: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    if pattern.is_empty() {
        return out;
    }
    let phase = (offset % pattern.len() as u64) as usize;
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = pattern[(phase + i) % pattern.len()];
    }
    out
}

/// Argument block of the region copy kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RegionArgs {
    pub destination_pitch: u32,
    pub destination_slice_pitch: u32,
    pub source_pitch: u32,
    pub source_slice_pitch: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub reserved: u32,
}
