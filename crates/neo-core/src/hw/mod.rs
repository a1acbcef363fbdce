//! Per-hardware-family command encoders.
//!
//! The family is picked once when the device is created ([`encoder_for`]); everything above
//! this module only sees `&'static dyn CommandEncoder`.

mod gen12lp;
mod xe_hp;

use bytemuck::{Pod, Zeroable};
use neo_cmd::records::*;
use neo_cmd::CmdArena;

use crate::command_container::CommandContainer;
use crate::error::{ZeError, ZeResult};
use crate::indirect_heap::HeapType;
use crate::module::Kernel;
use crate::stream_properties::{
    FrontEndProperties, PipelineSelectProperties, StateBaseAddressProperties,
    StateComputeModeProperties, StreamPropertiesSupport,
};

pub use gen12lp::Gen12LpEncoder;
pub use xe_hp::XeHpEncoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HwFamily {
    Gen12Lp,
    XeHpCore,
    XeHpc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WalkerType {
    /// `MEDIA_INTERFACE_DESCRIPTOR_LOAD` + `GPGPU_WALKER`, interface descriptor in the DSH.
    GpgpuWalker,
    /// `COMPUTE_WALKER` with an inline interface descriptor.
    ComputeWalker,
}

bitflags::bitflags! {
    /// Optional features of a hardware family.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HwCaps: u32 {
        /// Image and sampler support; without it there is no dynamic-state heap.
        const IMAGES = 1 << 0;
        const BLITTER = 1 << 1;
        const SYSTOLIC = 1 << 2;
        const LARGE_GRF = 1 << 3;
        const THREAD_ARBITRATION = 1 << 4;
        const PREEMPTION_IN_COMPUTE_MODE = 1 << 5;
        const EU_FUSION_CONTROL = 1 << 6;
        const COMPUTE_DISPATCH_ALL_WALKER = 1 << 7;
        const SINGLE_SLICE_DISPATCH = 1 << 8;
        const GLOBAL_ATOMICS = 1 << 9;
        const BINDING_TABLE_POOL = 1 << 10;
        const MEDIA_SAMPLER_DOP_CLOCK_GATE = 1 << 11;
    }
}

/// Static capabilities of a hardware family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwInfo {
    pub family: HwFamily,
    pub name: &'static str,
    pub slm_size: u32,
    pub max_work_group_size: u32,
    pub max_group_count: [u32; 3],
    pub eu_count: u32,
    pub threads_per_eu: u32,
    pub caps: HwCaps,
    pub max_partitions: u32,
    pub walker: WalkerType,
}

impl HwInfo {
    pub fn max_hw_threads(&self) -> u32 {
        self.eu_count * self.threads_per_eu
    }

    pub fn stream_properties_support(&self) -> StreamPropertiesSupport {
        StreamPropertiesSupport {
            coherency_required: true,
            large_grf_mode: self.caps.contains(HwCaps::LARGE_GRF),
            thread_arbitration_policy: self.caps.contains(HwCaps::THREAD_ARBITRATION),
            device_preemption_mode: self.caps.contains(HwCaps::PREEMPTION_IN_COMPUTE_MODE),
            disable_eu_fusion: self.caps.contains(HwCaps::EU_FUSION_CONTROL),
            compute_dispatch_all_walker: self.caps.contains(HwCaps::COMPUTE_DISPATCH_ALL_WALKER),
            single_slice_dispatch_ccs_mode: self.caps.contains(HwCaps::SINGLE_SLICE_DISPATCH),
            disable_overdispatch: self.caps.contains(HwCaps::COMPUTE_DISPATCH_ALL_WALKER),
            systolic_mode: self.caps.contains(HwCaps::SYSTOLIC),
            media_sampler_dop_clock_gate: self.caps.contains(HwCaps::MEDIA_SAMPLER_DOP_CLOCK_GATE),
            dynamic_state_heap: self.caps.contains(HwCaps::IMAGES),
            binding_table_pool: self.caps.contains(HwCaps::BINDING_TABLE_POOL),
            global_atomics: self.caps.contains(HwCaps::GLOBAL_ATOMICS),
        }
    }

    /// Heaps a compute command list of this family needs.
    pub fn required_heaps(&self) -> &'static [HeapType] {
        if self.caps.contains(HwCaps::IMAGES) {
            &HeapType::ALL
        } else {
            &[HeapType::IndirectObject, HeapType::SurfaceState]
        }
    }
}

/// Select the encoder for `family`.
pub fn encoder_for(family: HwFamily) -> &'static dyn CommandEncoder {
    match family {
        HwFamily::Gen12Lp => &gen12lp::GEN12LP,
        HwFamily::XeHpCore => &xe_hp::XE_HP_CORE,
        HwFamily::XeHpc => &xe_hp::XE_HPC,
    }
}

/// Stateless surface state for a buffer argument.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SurfaceState {
    pub base_address: u64,
    pub size: u64,
    pub surface_type: u32,
    pub mocs: u32,
    pub reserved: [u32; 10],
}

pub const SURFACE_TYPE_BUFFER: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SamplerState {
    pub words: [u32; 4],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostSyncArgs {
    pub address: u64,
    pub op: PostSyncOp,
    pub immediate_data: u64,
}

impl PostSyncArgs {
    pub fn write_immediate(address: u64, immediate_data: u64) -> Self {
        Self {
            address,
            op: PostSyncOp::WriteImmediate,
            immediate_data,
        }
    }

    pub fn write_timestamp(address: u64) -> Self {
        Self {
            address,
            op: PostSyncOp::WriteTimestamp,
            immediate_data: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeControlArgs {
    pub flags: PipeControlFlags,
    pub post_sync: Option<PostSyncArgs>,
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchKernelArgs<'a> {
    pub kernel: &'a Kernel,
    pub group_count: [u32; 3],
    /// Written by the walker when every partition finished; partition `p` writes at
    /// `address + p * post_sync_partition_stride`.
    pub post_sync: Option<PostSyncArgs>,
    pub post_sync_partition_stride: u64,
    pub partition_count: u32,
}

/// Heap bytes one dispatch of a kernel consumes (including alignment padding).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapRequirements {
    pub surface_state: u64,
    pub dynamic_state: u64,
    pub indirect_object: u64,
}

impl HeapRequirements {
    pub fn get(&self, heap_type: HeapType) -> u64 {
        match heap_type {
            HeapType::SurfaceState => self.surface_state,
            HeapType::DynamicState => self.dynamic_state,
            HeapType::IndirectObject => self.indirect_object,
        }
    }
}

/// Largest width or height of one blit, in bytes / rows.
pub const MAX_BLIT_WIDTH: u64 = 0x4000;
pub const MAX_BLIT_HEIGHT: u64 = 0x4000;

/// Timestamp registers read with `MI_STORE_REGISTER_MEM`.
pub const REG_GLOBAL_TIMESTAMP_LOW: u32 = 0x2358;
pub const REG_CONTEXT_TIMESTAMP_LOW: u32 = 0x23A8;

const HEAP_ALIGNMENT: u64 = 64;

fn threads_per_group(group_size: [u32; 3], simd_size: u32) -> u32 {
    let items = group_size[0] * group_size[1] * group_size[2];
    items.div_ceil(simd_size.max(1))
}

/// Write the surface states and binding table of `kernel`'s buffer arguments.
///
/// Returns the binding table offset within the surface-state heap (0 when there is none).
fn encode_binding_table(container: &mut CommandContainer, kernel: &Kernel, mocs: u32) -> ZeResult<u32> {
    let surfaces = kernel.surface_args();
    if surfaces.is_empty() {
        return Ok(0);
    }
    let ssh = container
        .heap_mut(HeapType::SurfaceState)
        .ok_or(ZeError::InvalidArgument)?;
    let mut entries = Vec::with_capacity(surfaces.len());
    for (base_address, size) in surfaces {
        let state = SurfaceState {
            base_address,
            size,
            surface_type: SURFACE_TYPE_BUFFER,
            mocs,
            ..Default::default()
        };
        let offset = ssh.push(bytemuck::bytes_of(&state), HEAP_ALIGNMENT)?;
        entries.push(offset as u32);
    }
    let offset = ssh.push(bytemuck::cast_slice(&entries), HEAP_ALIGNMENT)?;
    Ok(offset as u32)
}

fn encode_sampler_states(container: &mut CommandContainer, kernel: &Kernel) -> ZeResult<u32> {
    let count = kernel.immutable_data().sampler_count as usize;
    if count == 0 {
        return Ok(0);
    }
    let dsh = container
        .heap_mut(HeapType::DynamicState)
        .ok_or(ZeError::InvalidArgument)?;
    let samplers = vec![SamplerState::default(); count];
    Ok(dsh.push(bytemuck::cast_slice(&samplers), HEAP_ALIGNMENT)? as u32)
}

/// Common heap sizing: surface states plus binding table, cross-thread data, samplers.
fn common_heap_requirements(kernel: &Kernel, dsh_extra: u64) -> HeapRequirements {
    let pad = HEAP_ALIGNMENT;
    let surfaces = kernel.surface_args().len() as u64;
    let surface_state = if surfaces == 0 {
        0
    } else {
        surfaces * (core::mem::size_of::<SurfaceState>() as u64 + pad) + surfaces * 4 + pad
    };
    let samplers = u64::from(kernel.immutable_data().sampler_count);
    let dynamic_state = if samplers == 0 {
        dsh_extra
    } else {
        samplers * core::mem::size_of::<SamplerState>() as u64 + pad + dsh_extra
    };
    HeapRequirements {
        surface_state,
        dynamic_state,
        indirect_object: kernel.indirect_data_size() as u64 + pad,
    }
}

/// Translator from logical operations into command records.
///
/// Implementations are stateless; all state comes in through the arguments.
pub trait CommandEncoder: Send + Sync + std::fmt::Debug {
    fn hw_info(&self) -> &'static HwInfo;

    fn family(&self) -> HwFamily {
        self.hw_info().family
    }

    fn stream_properties_support(&self) -> StreamPropertiesSupport {
        self.hw_info().stream_properties_support()
    }

    /// Heap bytes [`Self::encode_dispatch_kernel`] consumes for `kernel`.
    fn heap_requirements(&self, kernel: &Kernel) -> HeapRequirements;

    /// Upper bound of command bytes one dispatch writes.
    fn dispatch_size(&self) -> usize;

    /// Encode one kernel dispatch. The heaps must already hold
    /// [`Self::heap_requirements`] bytes. Returns the command offset of the walker.
    fn encode_dispatch_kernel(
        &self,
        container: &mut CommandContainer,
        args: &DispatchKernelArgs<'_>,
    ) -> ZeResult<usize>;

    /// Cache flush flags for host-visible completion.
    fn dc_flush_flags(&self) -> PipeControlFlags {
        PipeControlFlags::DC_FLUSH | PipeControlFlags::CS_STALL
    }

    fn state_base_address_size(&self) -> usize {
        core::mem::size_of::<PipeControl>() * 2 + core::mem::size_of::<StateBaseAddress>()
    }

    fn encode_state_base_address(
        &self,
        arena: &mut CmdArena,
        props: &StateBaseAddressProperties,
    ) -> ZeResult<()> {
        arena.write(PipeControl {
            flags: (PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH).bits(),
            ..Default::default()
        })?;

        let mut flags = StateBaseAddressFlags::empty();
        let dynamic_state_base = props.dynamic_state_base_address.get();
        if dynamic_state_base.is_some() {
            flags |= StateBaseAddressFlags::DYNAMIC_STATE_VALID;
        }
        if props.global_atomics.get() == Some(true) {
            flags |= StateBaseAddressFlags::GLOBAL_ATOMICS;
        }
        if props.binding_table_pool_base_address.get().is_some() {
            flags |= StateBaseAddressFlags::BINDING_TABLE_POOL_VALID;
        }
        arena.write(StateBaseAddress {
            surface_state_base: props.surface_state_base_address.get().unwrap_or(0),
            surface_state_size: props.surface_state_size.get().unwrap_or(0),
            dynamic_state_base: dynamic_state_base.unwrap_or(0),
            dynamic_state_size: props.dynamic_state_size.get().unwrap_or(0),
            indirect_object_base: props.indirect_object_base_address.get().unwrap_or(0),
            indirect_object_size: props.indirect_object_size.get().unwrap_or(0),
            binding_table_pool_base: props.binding_table_pool_base_address.get().unwrap_or(0),
            binding_table_pool_size: props.binding_table_pool_size.get().unwrap_or(0),
            stateless_mocs: props.stateless_mocs.get().unwrap_or(0),
            flags: flags.bits(),
            ..Default::default()
        })?;

        arena.write(PipeControl {
            flags: (PipeControlFlags::STATE_CACHE_INVALIDATE
                | PipeControlFlags::TEXTURE_CACHE_INVALIDATE
                | PipeControlFlags::CS_STALL)
                .bits(),
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_state_compute_mode(
        &self,
        arena: &mut CmdArena,
        props: &StateComputeModeProperties,
    ) -> ZeResult<()> {
        let mut flags = ComputeModeFlags::empty();
        if props.is_coherency_required.get() == Some(false) {
            flags |= ComputeModeFlags::FORCE_NON_COHERENT;
        }
        if props.large_grf_mode.get() == Some(true) {
            flags |= ComputeModeFlags::LARGE_GRF;
        }
        arena.write(StateComputeMode {
            flags: flags.bits(),
            thread_arbitration_policy: props
                .thread_arbitration_policy
                .get()
                .map_or(0, |p| p as u32),
            preemption_mode: props.device_preemption_mode.get().map_or(0, |p| p as u32),
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_front_end_state(
        &self,
        arena: &mut CmdArena,
        props: &FrontEndProperties,
        scratch_base: u64,
    ) -> ZeResult<()> {
        let mut flags = FrontEndFlags::empty();
        flags.set(
            FrontEndFlags::DISABLE_EU_FUSION,
            props.disable_eu_fusion.get() == Some(true),
        );
        flags.set(
            FrontEndFlags::COMPUTE_DISPATCH_ALL_WALKER,
            props.compute_dispatch_all_walker_enable.get() == Some(true),
        );
        flags.set(
            FrontEndFlags::SINGLE_SLICE_DISPATCH_CCS,
            props.single_slice_dispatch_ccs_mode.get() == Some(true),
        );
        flags.set(
            FrontEndFlags::DISABLE_OVERDISPATCH,
            props.disable_overdispatch.get() == Some(true),
        );
        arena.write(CfeState {
            scratch_base,
            max_threads: self.hw_info().max_hw_threads(),
            flags: flags.bits(),
            ..Default::default()
        })?;
        Ok(())
    }

    fn pipeline_select_size(&self) -> usize {
        core::mem::size_of::<PipelineSelect>()
    }

    fn encode_pipeline_select(
        &self,
        arena: &mut CmdArena,
        props: &PipelineSelectProperties,
    ) -> ZeResult<()> {
        let mut flags = PipelineSelectFlags::empty();
        flags.set(
            PipelineSelectFlags::SYSTOLIC_MODE,
            props.systolic_mode.get() == Some(true),
        );
        flags.set(
            PipelineSelectFlags::MEDIA_SAMPLER_DOP_CLOCK_GATE,
            props.media_sampler_dop_clock_gate.get() == Some(true),
        );
        arena.write(PipelineSelect {
            mode: PIPELINE_SELECT_MODE_GPGPU,
            flags: flags.bits(),
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_semaphore_wait(
        &self,
        arena: &mut CmdArena,
        address: u64,
        value: u32,
        compare: SemaphoreCompare,
    ) -> ZeResult<()> {
        arena.write(MiSemaphoreWait {
            address,
            value,
            compare_op: compare as u32,
            wait_mode: 1,
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_pipe_control(&self, arena: &mut CmdArena, args: PipeControlArgs) -> ZeResult<()> {
        let post_sync = args.post_sync.unwrap_or_default();
        arena.write(PipeControl {
            address: post_sync.address,
            immediate_data: post_sync.immediate_data,
            flags: args.flags.bits(),
            post_sync_op: post_sync.op as u32,
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_mi_flush_dw(
        &self,
        arena: &mut CmdArena,
        flags: FlushDwFlags,
        post_sync: Option<PostSyncArgs>,
    ) -> ZeResult<()> {
        let post_sync = post_sync.unwrap_or_default();
        arena.write(MiFlushDw {
            address: post_sync.address,
            immediate_data: post_sync.immediate_data,
            flags: flags.bits(),
            post_sync_op: post_sync.op as u32,
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_store_data_imm(
        &self,
        arena: &mut CmdArena,
        address: u64,
        data: u64,
        store_qword: bool,
    ) -> ZeResult<()> {
        arena.write(MiStoreDataImm {
            address,
            data,
            store_qword: store_qword as u32,
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_store_register_mem(
        &self,
        arena: &mut CmdArena,
        register: u32,
        address: u64,
    ) -> ZeResult<()> {
        arena.write(MiStoreRegisterMem {
            address,
            register,
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_copy_mem_mem(&self, arena: &mut CmdArena, destination: u64, source: u64) -> ZeResult<()> {
        arena.write(MiCopyMemMem {
            destination,
            source,
            ..Default::default()
        })?;
        Ok(())
    }

    fn encode_batch_buffer_start(&self, arena: &mut CmdArena, address: u64) -> ZeResult<usize> {
        Ok(arena.write(MiBatchBufferStart {
            address,
            ..Default::default()
        })?)
    }

    fn encode_batch_buffer_end(&self, arena: &mut CmdArena) -> ZeResult<()> {
        arena.write(MiBatchBufferEnd::default())?;
        Ok(())
    }

    fn encode_noop(&self, arena: &mut CmdArena) -> ZeResult<()> {
        arena.write(MiNoop::default())?;
        Ok(())
    }

    fn encode_state_sip(&self, arena: &mut CmdArena, sip_address: u64) -> ZeResult<()> {
        arena.write(StateSip {
            sip_address,
            ..Default::default()
        })?;
        Ok(())
    }

    /// Post-sync write of `task_count` to the tag of every active partition.
    fn encode_tag_update(
        &self,
        arena: &mut CmdArena,
        tag_address: u64,
        task_count: u32,
        partitions: u32,
        dc_flush: bool,
    ) -> ZeResult<()> {
        let mut flags = PipeControlFlags::CS_STALL;
        if dc_flush {
            flags |= self.dc_flush_flags();
        }
        if partitions > 1 {
            flags |= PipeControlFlags::WORKLOAD_PARTITION_ID_OFFSET;
        }
        self.encode_pipe_control(
            arena,
            PipeControlArgs {
                flags,
                post_sync: Some(PostSyncArgs::write_immediate(tag_address, u64::from(task_count))),
            },
        )
    }

    fn blit_copy_size(&self, size: u64) -> usize {
        blit_record_count(size) * core::mem::size_of::<XyCopyBlt>()
    }

    fn blit_fill_size(&self, size: u64) -> usize {
        blit_record_count(size) * core::mem::size_of::<XyColorBlt>()
    }

    /// Linear copy on the blitter, split into rows of at most [`MAX_BLIT_WIDTH`] bytes.
    fn encode_blit_copy(
        &self,
        arena: &mut CmdArena,
        destination: u64,
        source: u64,
        size: u64,
    ) -> ZeResult<()> {
        if !self.hw_info().caps.contains(HwCaps::BLITTER) {
            return Err(ZeError::UnsupportedFeature);
        }
        for chunk in blit_chunks(size) {
            arena.write(XyCopyBlt {
                source: source + chunk.offset,
                destination: destination + chunk.offset,
                width: chunk.width as u32,
                height: chunk.height as u32,
                source_pitch: chunk.width as u32,
                destination_pitch: chunk.width as u32,
                ..Default::default()
            })?;
        }
        Ok(())
    }

    /// 2D copy of `width` bytes x `height` rows.
    #[allow(clippy::too_many_arguments)]
    fn encode_blit_copy_region(
        &self,
        arena: &mut CmdArena,
        destination: u64,
        destination_pitch: u32,
        source: u64,
        source_pitch: u32,
        width: u32,
        height: u32,
    ) -> ZeResult<()> {
        if !self.hw_info().caps.contains(HwCaps::BLITTER) {
            return Err(ZeError::UnsupportedFeature);
        }
        if u64::from(width) > MAX_BLIT_WIDTH || u64::from(height) > MAX_BLIT_HEIGHT {
            return Err(ZeError::InvalidSize);
        }
        arena.write(XyCopyBlt {
            source,
            destination,
            width,
            height,
            source_pitch,
            destination_pitch,
            ..Default::default()
        })?;
        Ok(())
    }

    /// Fill with a repeating pattern of 1, 2, 4, 8 or 16 bytes.
    fn encode_blit_fill(
        &self,
        arena: &mut CmdArena,
        destination: u64,
        size: u64,
        pattern: &[u8],
    ) -> ZeResult<()> {
        if !self.hw_info().caps.contains(HwCaps::BLITTER) {
            return Err(ZeError::UnsupportedFeature);
        }
        if !matches!(pattern.len(), 1 | 2 | 4 | 8 | 16) {
            return Err(ZeError::UnsupportedFeature);
        }
        let mut words = [0u32; 4];
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..pattern.len()].copy_from_slice(pattern);
        for chunk in blit_chunks(size) {
            arena.write(XyColorBlt {
                destination: destination + chunk.offset,
                width: chunk.width as u32,
                height: chunk.height as u32,
                destination_pitch: chunk.width as u32,
                color_depth: pattern.len() as u32,
                pattern: words,
                ..Default::default()
            })?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlitChunk {
    offset: u64,
    width: u64,
    height: u64,
}

fn blit_chunks(size: u64) -> Vec<BlitChunk> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < size {
        let remaining = size - offset;
        let chunk = if remaining >= MAX_BLIT_WIDTH {
            let height = (remaining / MAX_BLIT_WIDTH).min(MAX_BLIT_HEIGHT);
            BlitChunk {
                offset,
                width: MAX_BLIT_WIDTH,
                height,
            }
        } else {
            BlitChunk {
                offset,
                width: remaining,
                height: 1,
            }
        };
        offset += chunk.width * chunk.height;
        chunks.push(chunk);
    }
    chunks
}

fn blit_record_count(size: u64) -> usize {
    blit_chunks(size).len()
}
