use neo_cmd::records::*;

use super::{
    common_heap_requirements, encode_binding_table, encode_sampler_states, threads_per_group,
    CommandEncoder, DispatchKernelArgs, HeapRequirements, HwCaps, HwFamily, HwInfo, WalkerType,
    HEAP_ALIGNMENT,
};
use crate::command_container::CommandContainer;
use crate::error::{ZeError, ZeResult};
use crate::indirect_heap::HeapType;
use crate::module::Kernel;

static XE_HP_CORE_INFO: HwInfo = HwInfo {
    family: HwFamily::XeHpCore,
    name: "xe_hp_core",
    slm_size: 64 * 1024,
    max_work_group_size: 1024,
    max_group_count: [u32::MAX, u32::MAX, u32::MAX],
    eu_count: 512,
    threads_per_eu: 8,
    caps: HwCaps::IMAGES
        .union(HwCaps::BLITTER)
        .union(HwCaps::SYSTOLIC)
        .union(HwCaps::LARGE_GRF)
        .union(HwCaps::THREAD_ARBITRATION)
        .union(HwCaps::PREEMPTION_IN_COMPUTE_MODE)
        .union(HwCaps::EU_FUSION_CONTROL)
        .union(HwCaps::BINDING_TABLE_POOL),
    max_partitions: 1,
    walker: WalkerType::ComputeWalker,
};

static XE_HPC_INFO: HwInfo = HwInfo {
    family: HwFamily::XeHpc,
    name: "xe_hpc",
    slm_size: 128 * 1024,
    max_work_group_size: 1024,
    max_group_count: [u32::MAX, u32::MAX, u32::MAX],
    eu_count: 1024,
    threads_per_eu: 8,
    caps: HwCaps::BLITTER
        .union(HwCaps::LARGE_GRF)
        .union(HwCaps::THREAD_ARBITRATION)
        .union(HwCaps::PREEMPTION_IN_COMPUTE_MODE)
        .union(HwCaps::COMPUTE_DISPATCH_ALL_WALKER)
        .union(HwCaps::SINGLE_SLICE_DISPATCH)
        .union(HwCaps::GLOBAL_ATOMICS)
        .union(HwCaps::BINDING_TABLE_POOL),
    max_partitions: 4,
    walker: WalkerType::ComputeWalker,
};

/// Encoder for the `COMPUTE_WALKER` generations. The two families differ only in their
/// [`HwInfo`] capabilities and cache flush flavor.
#[derive(Debug)]
pub struct XeHpEncoder {
    info: &'static HwInfo,
}

pub(super) static XE_HP_CORE: XeHpEncoder = XeHpEncoder {
    info: &XE_HP_CORE_INFO,
};

pub(super) static XE_HPC: XeHpEncoder = XeHpEncoder {
    info: &XE_HPC_INFO,
};

impl CommandEncoder for XeHpEncoder {
    fn hw_info(&self) -> &'static HwInfo {
        self.info
    }

    fn heap_requirements(&self, kernel: &Kernel) -> HeapRequirements {
        let mut req = common_heap_requirements(kernel, 0);
        if !self.info.caps.contains(HwCaps::IMAGES) {
            req.dynamic_state = 0;
        }
        req
    }

    fn dispatch_size(&self) -> usize {
        core::mem::size_of::<ComputeWalker>()
    }

    fn dc_flush_flags(&self) -> PipeControlFlags {
        if self.info.caps.contains(HwCaps::IMAGES) {
            PipeControlFlags::DC_FLUSH | PipeControlFlags::CS_STALL
        } else {
            // No L3 data cache flush on this family; flush the dataport instead.
            PipeControlFlags::HDC_PIPELINE_FLUSH
                | PipeControlFlags::UNTYPED_DATAPORT_CACHE_FLUSH
                | PipeControlFlags::CS_STALL
        }
    }

    fn encode_dispatch_kernel(
        &self,
        container: &mut CommandContainer,
        args: &DispatchKernelArgs<'_>,
    ) -> ZeResult<usize> {
        if args.partition_count > self.info.max_partitions {
            return Err(ZeError::UnsupportedFeature);
        }
        let kernel = args.kernel;
        let data = kernel.immutable_data();
        if data.sampler_count > 0 && !self.info.caps.contains(HwCaps::IMAGES) {
            return Err(ZeError::UnsupportedFeature);
        }
        let group_size = kernel.group_size();

        let mocs = container.stateless_mocs();
        let binding_table = encode_binding_table(container, kernel, mocs)?;
        let samplers = encode_sampler_states(container, kernel)?;

        let payload = kernel.indirect_data(args.group_count);
        let ioh_offset = container
            .heap_mut(HeapType::IndirectObject)
            .ok_or(ZeError::InvalidArgument)?
            .push(&payload, HEAP_ALIGNMENT)?;

        let post_sync = args.post_sync.unwrap_or_default();
        let arena = container.get_command_stream(self.dispatch_size())?;
        let walker = arena.write(ComputeWalker {
            kernel_start_pointer: data.isa_gpu_address(),
            indirect_data_start: ioh_offset,
            post_sync_address: post_sync.address,
            post_sync_immediate_data: post_sync.immediate_data,
            thread_group_id_x_dimension: args.group_count[0],
            thread_group_id_y_dimension: args.group_count[1],
            thread_group_id_z_dimension: args.group_count[2],
            group_size_x: group_size[0],
            group_size_y: group_size[1],
            group_size_z: group_size[2],
            simd_size: data.simd_size,
            threads_per_group: threads_per_group(group_size, data.simd_size),
            indirect_data_length: payload.len() as u32,
            binding_table_pointer: binding_table,
            sampler_state_pointer: samplers,
            slm_size: data.slm_size,
            post_sync_op: post_sync.op as u32,
            partition_count: args.partition_count.max(1),
            post_sync_partition_stride: args.post_sync_partition_stride as u32,
            ..Default::default()
        })?;
        Ok(walker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_differ_in_heap_and_flush_capabilities() {
        assert!(XE_HP_CORE.hw_info().caps.contains(HwCaps::IMAGES));
        assert!(!XE_HPC.hw_info().caps.contains(HwCaps::IMAGES));
        assert!(XE_HP_CORE.dc_flush_flags().contains(PipeControlFlags::DC_FLUSH));
        assert!(!XE_HPC.dc_flush_flags().contains(PipeControlFlags::DC_FLUSH));
        assert!(XE_HPC
            .dc_flush_flags()
            .contains(PipeControlFlags::UNTYPED_DATAPORT_CACHE_FLUSH));
        assert!(XE_HPC.stream_properties_support().single_slice_dispatch_ccs_mode);
        assert!(!XE_HPC.stream_properties_support().dynamic_state_heap);
    }
}
