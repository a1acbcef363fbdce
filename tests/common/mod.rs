#![allow(dead_code)]

use std::sync::Arc;

use neo_cmd::parse::{parse_cmd_stream, ParsedCmd};
use neo_core::backend::{ImmediateBackend, SubmissionBackend};
use neo_core::memory_manager::SimMemoryManager;
use neo_core::module::{ArgKind, Kernel, KernelDesc, ModuleDesc};
use neo_core::{AllocationType, CommandList, Device, DeviceDescriptor, DriverConfig, HwFamily};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Device whose engines each run on their own [`ImmediateBackend`].
pub fn device(family: HwFamily, config: DriverConfig) -> Device {
    init_tracing();
    Device::new(
        DeviceDescriptor::new(family).with_config(config),
        Arc::new(SimMemoryManager::new()),
        |_| Arc::new(ImmediateBackend::new()) as Arc<dyn SubmissionBackend>,
    )
    .unwrap()
}

/// Device whose compute engine submits to `backend`. Only meant for tests that stay on the
/// compute engine.
pub fn device_with_backend<B>(
    family: HwFamily,
    config: DriverConfig,
    memory_manager: Arc<SimMemoryManager>,
    backend: Arc<B>,
) -> Device
where
    B: SubmissionBackend + 'static,
{
    init_tracing();
    Device::new(
        DeviceDescriptor::new(family).with_config(config),
        memory_manager,
        move |_| backend.clone() as Arc<dyn SubmissionBackend>,
    )
    .unwrap()
}

/// Build `desc` into its own module and bind every buffer argument to a fresh 4 KiB buffer.
pub fn kernel(device: &Device, desc: KernelDesc) -> Kernel {
    let name = desc.name.clone();
    let buffers = desc
        .args
        .iter()
        .filter(|arg| matches!(arg, ArgKind::Buffer))
        .count();
    let module = device
        .create_module(ModuleDesc {
            kernels: vec![desc],
            ..Default::default()
        })
        .unwrap();
    let mut kernel = device.create_kernel(module, &name).unwrap();
    for index in 0..buffers {
        let buffer = device.allocate(4096, AllocationType::Buffer).unwrap();
        kernel.set_arg_buffer(index, buffer, 0).unwrap();
    }
    kernel
}

pub fn buffer_kernel(device: &Device, name: &str, buffers: usize) -> Kernel {
    kernel(
        device,
        KernelDesc {
            name: name.into(),
            args: vec![ArgKind::Buffer; buffers],
            ..Default::default()
        },
    )
}

/// Every record of every command buffer of `list`, in submission order.
pub fn list_commands(list: &CommandList) -> Vec<ParsedCmd> {
    list.container()
        .command_buffers()
        .iter()
        .flat_map(|buffer| parse_cmd_stream(buffer.as_bytes()).unwrap())
        .collect()
}

/// Indices of the walkers in `cmds`.
pub fn walker_positions(cmds: &[ParsedCmd]) -> Vec<usize> {
    cmds.iter()
        .enumerate()
        .filter(|(_, cmd)| cmd.opcode().is_walker())
        .map(|(index, _)| index)
        .collect()
}
