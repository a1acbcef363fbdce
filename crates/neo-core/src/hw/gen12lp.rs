use neo_cmd::records::*;
use neo_cmd::CmdArena;

use super::{
    common_heap_requirements, encode_binding_table, encode_sampler_states, threads_per_group,
    CommandEncoder, DispatchKernelArgs, HeapRequirements, HwCaps, HwFamily, HwInfo, PipeControlArgs,
    WalkerType, HEAP_ALIGNMENT,
};
use crate::command_container::CommandContainer;
use crate::error::{ZeError, ZeResult};
use crate::indirect_heap::HeapType;
use crate::module::Kernel;
use crate::stream_properties::PipelineSelectProperties;

static GEN12LP_INFO: HwInfo = HwInfo {
    family: HwFamily::Gen12Lp,
    name: "gen12lp",
    slm_size: 64 * 1024,
    max_work_group_size: 512,
    max_group_count: [u32::MAX, 0xFFFF, 0xFFFF],
    eu_count: 96,
    threads_per_eu: 7,
    caps: HwCaps::IMAGES
        .union(HwCaps::THREAD_ARBITRATION)
        .union(HwCaps::MEDIA_SAMPLER_DOP_CLOCK_GATE),
    max_partitions: 1,
    walker: WalkerType::GpgpuWalker,
};

/// Encoder for the media-pipeline walker generation: interface descriptors live in the
/// dynamic-state heap and are loaded before every `GPGPU_WALKER`.
#[derive(Debug)]
pub struct Gen12LpEncoder {
    info: &'static HwInfo,
}

pub(super) static GEN12LP: Gen12LpEncoder = Gen12LpEncoder {
    info: &GEN12LP_INFO,
};

const IDD_SIZE: u64 = core::mem::size_of::<InterfaceDescriptorData>() as u64;

fn right_execution_mask(group_size: [u32; 3], simd_size: u32) -> u32 {
    let items = group_size[0] * group_size[1] * group_size[2];
    let rem = items % simd_size.max(1);
    if rem == 0 {
        u32::MAX >> (32 - simd_size.clamp(1, 32))
    } else {
        (1u32 << rem) - 1
    }
}

impl CommandEncoder for Gen12LpEncoder {
    fn hw_info(&self) -> &'static HwInfo {
        self.info
    }

    fn heap_requirements(&self, kernel: &Kernel) -> HeapRequirements {
        common_heap_requirements(kernel, IDD_SIZE + HEAP_ALIGNMENT)
    }

    fn dispatch_size(&self) -> usize {
        core::mem::size_of::<MediaInterfaceDescriptorLoad>()
            + core::mem::size_of::<GpgpuWalker>()
            + core::mem::size_of::<PipeControl>()
    }

    fn encode_dispatch_kernel(
        &self,
        container: &mut CommandContainer,
        args: &DispatchKernelArgs<'_>,
    ) -> ZeResult<usize> {
        if args.partition_count > 1 {
            return Err(ZeError::UnsupportedFeature);
        }
        let kernel = args.kernel;
        let data = kernel.immutable_data();
        let group_size = kernel.group_size();
        let threads = threads_per_group(group_size, data.simd_size);

        let mocs = container.stateless_mocs();
        let binding_table = encode_binding_table(container, kernel, mocs)?;
        let samplers = encode_sampler_states(container, kernel)?;

        let payload = kernel.indirect_data(args.group_count);
        let ioh_offset = container
            .heap_mut(HeapType::IndirectObject)
            .ok_or(ZeError::InvalidArgument)?
            .push(&payload, HEAP_ALIGNMENT)?;

        let idd = InterfaceDescriptorData {
            kernel_start_pointer: data.isa_gpu_address(),
            binding_table_pointer: binding_table,
            sampler_state_pointer: samplers,
            slm_size: data.slm_size,
            threads_per_group: threads,
            cross_thread_data_length: payload.len() as u32,
            barrier_enable: data.uses_barriers as u32,
        };
        let idd_offset = container
            .heap_mut(HeapType::DynamicState)
            .ok_or(ZeError::InvalidArgument)?
            .push(bytemuck::bytes_of(&idd), HEAP_ALIGNMENT)?;

        let arena = container.get_command_stream(self.dispatch_size())?;
        arena.write(MediaInterfaceDescriptorLoad {
            descriptor_offset: idd_offset as u32,
            descriptor_length: IDD_SIZE as u32,
            ..Default::default()
        })?;
        let walker = arena.write(GpgpuWalker {
            indirect_data_start_offset: ioh_offset as u32,
            indirect_data_length: payload.len() as u32,
            interface_descriptor_offset: 0,
            simd_size: data.simd_size,
            thread_group_id_x_dimension: args.group_count[0],
            thread_group_id_y_dimension: args.group_count[1],
            thread_group_id_z_dimension: args.group_count[2],
            threads_per_group: threads,
            right_execution_mask: right_execution_mask(group_size, data.simd_size),
            ..Default::default()
        })?;

        // GPGPU_WALKER has no post-sync of its own.
        if let Some(post_sync) = args.post_sync {
            self.encode_pipe_control(
                arena,
                PipeControlArgs {
                    flags: PipeControlFlags::CS_STALL,
                    post_sync: Some(post_sync),
                },
            )?;
        }
        Ok(walker)
    }

    fn pipeline_select_size(&self) -> usize {
        core::mem::size_of::<PipeControl>() + core::mem::size_of::<PipelineSelect>()
    }

    fn encode_pipeline_select(
        &self,
        arena: &mut CmdArena,
        props: &PipelineSelectProperties,
    ) -> ZeResult<()> {
        arena.write(PipeControl {
            flags: (PipeControlFlags::RENDER_TARGET_CACHE_FLUSH | PipeControlFlags::CS_STALL)
                .bits(),
            ..Default::default()
        })?;
        let mut flags = PipelineSelectFlags::empty();
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
}
