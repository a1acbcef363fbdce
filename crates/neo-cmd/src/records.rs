//! Command record layouts.
//!
//! Every record is a `#[repr(C)]` little-endian struct that starts with a [`CmdHeader`]. Sizes are
//! multiples of 8 bytes so records never need interior padding, which is what lets them be
//! [`bytemuck::Pod`].

use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CmdHeader {
    pub opcode: u32,
    pub size_bytes: u32,
}

impl CmdHeader {
    pub const SIZE_BYTES: usize = 8;
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmdOpcode {
    MiNoop = 0x00,
    MiBatchBufferEnd = 0x0A,
    MiSemaphoreWait = 0x1C,
    MiStoreDataImm = 0x20,
    MiStoreRegisterMem = 0x24,
    MiFlushDw = 0x26,
    MiCopyMemMem = 0x2E,
    MiBatchBufferStart = 0x31,

    XyCopyBlt = 0x5042,
    XyColorBlt = 0x5050,

    StateBaseAddress = 0x6101,
    StateSip = 0x6102,
    StateComputeMode = 0x6105,
    PipelineSelect = 0x6904,

    MediaInterfaceDescriptorLoad = 0x7002,
    GpgpuWalker = 0x7105,
    CfeState = 0x7200,
    ComputeWalker = 0x7202,
    PipeControl = 0x7A00,
}

impl CmdOpcode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x00 => Some(Self::MiNoop),
            0x0A => Some(Self::MiBatchBufferEnd),
            0x1C => Some(Self::MiSemaphoreWait),
            0x20 => Some(Self::MiStoreDataImm),
            0x24 => Some(Self::MiStoreRegisterMem),
            0x26 => Some(Self::MiFlushDw),
            0x2E => Some(Self::MiCopyMemMem),
            0x31 => Some(Self::MiBatchBufferStart),
            0x5042 => Some(Self::XyCopyBlt),
            0x5050 => Some(Self::XyColorBlt),
            0x6101 => Some(Self::StateBaseAddress),
            0x6102 => Some(Self::StateSip),
            0x6105 => Some(Self::StateComputeMode),
            0x6904 => Some(Self::PipelineSelect),
            0x7002 => Some(Self::MediaInterfaceDescriptorLoad),
            0x7105 => Some(Self::GpgpuWalker),
            0x7200 => Some(Self::CfeState),
            0x7202 => Some(Self::ComputeWalker),
            0x7A00 => Some(Self::PipeControl),
            _ => None,
        }
    }

    /// Records that (re)program expensive hardware state.
    pub const fn is_state_transition(self) -> bool {
        matches!(
            self,
            Self::StateBaseAddress | Self::StateComputeMode | Self::CfeState | Self::PipelineSelect
        )
    }

    pub const fn is_walker(self) -> bool {
        matches!(self, Self::ComputeWalker | Self::GpgpuWalker)
    }
}

/// A fixed-layout command record.
pub trait CmdRecord: Pod {
    const OPCODE: CmdOpcode;

    fn header_mut(&mut self) -> &mut CmdHeader;

    fn header(&self) -> &CmdHeader;

    /// Header value a well-formed record of this type must carry.
    fn expected_header() -> CmdHeader {
        CmdHeader {
            opcode: Self::OPCODE as u32,
            size_bytes: core::mem::size_of::<Self>() as u32,
        }
    }
}

macro_rules! cmd_record {
    ($ty:ty, $opcode:expr) => {
        impl CmdRecord for $ty {
            const OPCODE: CmdOpcode = $opcode;

            fn header_mut(&mut self) -> &mut CmdHeader {
                &mut self.hdr
            }

            fn header(&self) -> &CmdHeader {
                &self.hdr
            }
        }

        const _: () = assert!(core::mem::size_of::<$ty>() % 8 == 0);
    };
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PipeControlFlags: u32 {
        const DC_FLUSH = 1 << 0;
        const CS_STALL = 1 << 1;
        const HDC_PIPELINE_FLUSH = 1 << 2;
        const UNTYPED_DATAPORT_CACHE_FLUSH = 1 << 3;
        const TEXTURE_CACHE_INVALIDATE = 1 << 4;
        const CONSTANT_CACHE_INVALIDATE = 1 << 5;
        const STATE_CACHE_INVALIDATE = 1 << 6;
        const INSTRUCTION_CACHE_INVALIDATE = 1 << 7;
        const TLB_INVALIDATE = 1 << 8;
        const NOTIFY_ENABLE = 1 << 9;
        const WORKLOAD_PARTITION_ID_OFFSET = 1 << 10;
        const RENDER_TARGET_CACHE_FLUSH = 1 << 11;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FlushDwFlags: u32 {
        const NOTIFY_ENABLE = 1 << 0;
        const TLB_INVALIDATE = 1 << 1;
        const LLC_FLUSH = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StateBaseAddressFlags: u32 {
        const DYNAMIC_STATE_VALID = 1 << 0;
        const GLOBAL_ATOMICS = 1 << 1;
        const BINDING_TABLE_POOL_VALID = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ComputeModeFlags: u32 {
        const FORCE_NON_COHERENT = 1 << 0;
        const LARGE_GRF = 1 << 1;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FrontEndFlags: u32 {
        const DISABLE_EU_FUSION = 1 << 0;
        const COMPUTE_DISPATCH_ALL_WALKER = 1 << 1;
        const SINGLE_SLICE_DISPATCH_CCS = 1 << 2;
        const DISABLE_OVERDISPATCH = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PipelineSelectFlags: u32 {
        const SYSTOLIC_MODE = 1 << 0;
        const MEDIA_SAMPLER_DOP_CLOCK_GATE = 1 << 1;
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PostSyncOp {
    #[default]
    NoWrite = 0,
    WriteImmediate = 1,
    WriteTimestamp = 3,
}

impl PostSyncOp {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::NoWrite),
            1 => Some(Self::WriteImmediate),
            3 => Some(Self::WriteTimestamp),
            _ => None,
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SemaphoreCompare {
    SadGreaterThanSdd = 0,
    SadGreaterThanOrEqualSdd = 1,
    SadLessThanSdd = 2,
    SadLessThanOrEqualSdd = 3,
    SadEqualSdd = 4,
    SadNotEqualSdd = 5,
}

impl SemaphoreCompare {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::SadGreaterThanSdd),
            1 => Some(Self::SadGreaterThanOrEqualSdd),
            2 => Some(Self::SadLessThanSdd),
            3 => Some(Self::SadLessThanOrEqualSdd),
            4 => Some(Self::SadEqualSdd),
            5 => Some(Self::SadNotEqualSdd),
            _ => None,
        }
    }

    /// Evaluate the comparison the way the command streamer does (`memory <op> data`).
    pub const fn evaluate(self, memory: u32, data: u32) -> bool {
        match self {
            Self::SadGreaterThanSdd => memory > data,
            Self::SadGreaterThanOrEqualSdd => memory >= data,
            Self::SadLessThanSdd => memory < data,
            Self::SadLessThanOrEqualSdd => memory <= data,
            Self::SadEqualSdd => memory == data,
            Self::SadNotEqualSdd => memory != data,
        }
    }
}

/// Timestamp registers readable with `MI_STORE_REGISTER_MEM`.
pub const REG_GLOBAL_TIMESTAMP_LOW: u32 = 0x2358;
pub const REG_CONTEXT_TIMESTAMP_LOW: u32 = 0x23A8;

/* ------------------------------- MI commands ------------------------------ */

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiNoop {
    pub hdr: CmdHeader,
}
cmd_record!(MiNoop, CmdOpcode::MiNoop);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiBatchBufferEnd {
    pub hdr: CmdHeader,
}
cmd_record!(MiBatchBufferEnd, CmdOpcode::MiBatchBufferEnd);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiBatchBufferStart {
    pub hdr: CmdHeader,
    pub address: u64,
}
cmd_record!(MiBatchBufferStart, CmdOpcode::MiBatchBufferStart);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiSemaphoreWait {
    pub hdr: CmdHeader,
    pub address: u64,
    pub value: u32,
    /// [`SemaphoreCompare`] discriminant.
    pub compare_op: u32,
    /// 1 = polling mode.
    pub wait_mode: u32,
    pub reserved0: u32,
}
cmd_record!(MiSemaphoreWait, CmdOpcode::MiSemaphoreWait);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiStoreDataImm {
    pub hdr: CmdHeader,
    pub address: u64,
    pub data: u64,
    pub store_qword: u32,
    pub reserved0: u32,
}
cmd_record!(MiStoreDataImm, CmdOpcode::MiStoreDataImm);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiStoreRegisterMem {
    pub hdr: CmdHeader,
    pub address: u64,
    pub register: u32,
    pub reserved0: u32,
}
cmd_record!(MiStoreRegisterMem, CmdOpcode::MiStoreRegisterMem);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiCopyMemMem {
    pub hdr: CmdHeader,
    pub destination: u64,
    pub source: u64,
}
cmd_record!(MiCopyMemMem, CmdOpcode::MiCopyMemMem);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MiFlushDw {
    pub hdr: CmdHeader,
    pub address: u64,
    pub immediate_data: u64,
    /// [`FlushDwFlags`] bits.
    pub flags: u32,
    /// [`PostSyncOp`] discriminant.
    pub post_sync_op: u32,
}
cmd_record!(MiFlushDw, CmdOpcode::MiFlushDw);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PipeControl {
    pub hdr: CmdHeader,
    pub address: u64,
    pub immediate_data: u64,
    /// [`PipeControlFlags`] bits.
    pub flags: u32,
    /// [`PostSyncOp`] discriminant.
    pub post_sync_op: u32,
}
cmd_record!(PipeControl, CmdOpcode::PipeControl);

impl PipeControl {
    pub fn pipe_control_flags(&self) -> PipeControlFlags {
        PipeControlFlags::from_bits_truncate(self.flags)
    }
}

/* ------------------------------ State commands ----------------------------- */

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StateBaseAddress {
    pub hdr: CmdHeader,
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub instruction_base: u64,
    pub binding_table_pool_base: u64,
    pub surface_state_size: u32,
    pub dynamic_state_size: u32,
    pub indirect_object_size: u32,
    pub binding_table_pool_size: u32,
    pub stateless_mocs: u32,
    /// [`StateBaseAddressFlags`] bits.
    pub flags: u32,
}
cmd_record!(StateBaseAddress, CmdOpcode::StateBaseAddress);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StateSip {
    pub hdr: CmdHeader,
    pub sip_address: u64,
}
cmd_record!(StateSip, CmdOpcode::StateSip);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StateComputeMode {
    pub hdr: CmdHeader,
    /// [`ComputeModeFlags`] bits.
    pub flags: u32,
    pub thread_arbitration_policy: u32,
    pub preemption_mode: u32,
    pub reserved0: u32,
}
cmd_record!(StateComputeMode, CmdOpcode::StateComputeMode);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CfeState {
    pub hdr: CmdHeader,
    pub scratch_base: u64,
    pub max_threads: u32,
    /// [`FrontEndFlags`] bits.
    pub flags: u32,
}
cmd_record!(CfeState, CmdOpcode::CfeState);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PipelineSelect {
    pub hdr: CmdHeader,
    /// 2 = GPGPU.
    pub mode: u32,
    /// [`PipelineSelectFlags`] bits.
    pub flags: u32,
}
cmd_record!(PipelineSelect, CmdOpcode::PipelineSelect);

pub const PIPELINE_SELECT_MODE_GPGPU: u32 = 2;

/* ------------------------------ Dispatch commands -------------------------- */

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ComputeWalker {
    pub hdr: CmdHeader,
    pub kernel_start_pointer: u64,
    /// GPU address of the cross-thread data in the indirect-object heap.
    pub indirect_data_start: u64,
    pub post_sync_address: u64,
    pub post_sync_immediate_data: u64,
    pub thread_group_id_x_dimension: u32,
    pub thread_group_id_y_dimension: u32,
    pub thread_group_id_z_dimension: u32,
    pub group_size_x: u32,
    pub group_size_y: u32,
    pub group_size_z: u32,
    pub simd_size: u32,
    pub threads_per_group: u32,
    pub indirect_data_length: u32,
    pub binding_table_pointer: u32,
    pub sampler_state_pointer: u32,
    pub slm_size: u32,
    /// [`PostSyncOp`] discriminant.
    pub post_sync_op: u32,
    pub partition_count: u32,
    /// Bytes between the post-sync slots of consecutive partitions.
    pub post_sync_partition_stride: u32,
    pub reserved0: u32,
}
cmd_record!(ComputeWalker, CmdOpcode::ComputeWalker);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MediaInterfaceDescriptorLoad {
    pub hdr: CmdHeader,
    /// Offset of the interface descriptor in the dynamic-state heap.
    pub descriptor_offset: u32,
    pub descriptor_length: u32,
}
cmd_record!(MediaInterfaceDescriptorLoad, CmdOpcode::MediaInterfaceDescriptorLoad);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GpgpuWalker {
    pub hdr: CmdHeader,
    /// Offset of the cross-thread data from the indirect-object base.
    pub indirect_data_start_offset: u32,
    pub indirect_data_length: u32,
    pub interface_descriptor_offset: u32,
    pub simd_size: u32,
    pub thread_group_id_x_dimension: u32,
    pub thread_group_id_y_dimension: u32,
    pub thread_group_id_z_dimension: u32,
    pub threads_per_group: u32,
    pub right_execution_mask: u32,
    pub reserved0: u32,
}
cmd_record!(GpgpuWalker, CmdOpcode::GpgpuWalker);

/// Interface descriptor written into the dynamic-state heap ahead of a `GPGPU_WALKER`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct InterfaceDescriptorData {
    pub kernel_start_pointer: u64,
    pub binding_table_pointer: u32,
    pub sampler_state_pointer: u32,
    pub slm_size: u32,
    pub threads_per_group: u32,
    pub cross_thread_data_length: u32,
    pub barrier_enable: u32,
}

/* ------------------------------- Blitter ----------------------------------- */

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct XyCopyBlt {
    pub hdr: CmdHeader,
    pub source: u64,
    pub destination: u64,
    pub width: u32,
    pub height: u32,
    pub source_pitch: u32,
    pub destination_pitch: u32,
}
cmd_record!(XyCopyBlt, CmdOpcode::XyCopyBlt);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct XyColorBlt {
    pub hdr: CmdHeader,
    pub destination: u64,
    pub width: u32,
    pub height: u32,
    pub destination_pitch: u32,
    /// Bytes per pixel of the fill pattern (1, 2, 4, 8 or 16).
    pub color_depth: u32,
    pub pattern: [u32; 4],
}
cmd_record!(XyColorBlt, CmdOpcode::XyColorBlt);
