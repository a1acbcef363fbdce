mod common;

use neo_cmd::parse::{count_opcode, parse_cmd_stream, ParsedCmd};
use neo_cmd::records::CmdOpcode;
use neo_core::backend::{ImmediateBackend, SegmentKind};
use neo_core::command_list::WaitList;
use neo_core::indirect_heap::HeapType;
use neo_core::memory_manager::SimMemoryManager;
use neo_core::module::{ArgKind, KernelDesc};
use neo_core::{CommandList, CommandQueue, DriverConfig, EngineGroupType, HwFamily, QueueMode};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;

use common::{buffer_kernel, list_commands, walker_positions};

#[test]
fn identical_launches_emit_no_state_between_them() {
    let device = common::device(HwFamily::XeHpCore, DriverConfig::default());
    let kernel = buffer_kernel(&device, "saxpy", 2);
    let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();

    list.append_launch_kernel(&kernel, [8, 1, 1], None, WaitList::default())
        .unwrap();
    let records = list.num_state_transition_records();
    list.append_launch_kernel(&kernel, [8, 1, 1], None, WaitList::default())
        .unwrap();
    assert_eq!(list.num_state_transition_records(), records);
    list.close().unwrap();

    let cmds = list_commands(&list);
    let walkers = walker_positions(&cmds);
    assert_eq!(walkers.len(), 2);
    assert!(cmds[walkers[0] + 1..walkers[1]]
        .iter()
        .all(|cmd| !cmd.opcode().is_state_transition()));
}

#[test]
fn queue_programs_required_state_only_when_it_changes() {
    let backend = Arc::new(ImmediateBackend::new());
    let device = common::device_with_backend(
        HwFamily::XeHpCore,
        DriverConfig::default(),
        Arc::new(SimMemoryManager::new()),
        backend.clone(),
    );
    let kernel = buffer_kernel(&device, "scale", 1);
    let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
    list.append_launch_kernel(&kernel, [4, 1, 1], None, WaitList::default())
        .unwrap();
    list.close().unwrap();

    let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Synchronous).unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();

    let stats = device.stats().snapshot();
    assert_eq!(stats.state_base_address_records, 1);
    assert_eq!(stats.compute_mode_records, 1);
    assert_eq!(stats.submissions, 2);

    let batches = backend.submitted_batches();
    let ring_sba: Vec<usize> = batches
        .iter()
        .map(|batch| {
            batch
                .segments
                .iter()
                .filter(|s| s.kind == SegmentKind::Ring)
                .map(|s| count_opcode(&parse_cmd_stream(&s.bytes).unwrap(), CmdOpcode::StateBaseAddress))
                .sum()
        })
        .collect();
    assert_eq!(ring_sba, vec![1, 0]);
}

#[test]
fn surface_state_exhaustion_rebinds_the_heap_once() {
    let config = DriverConfig {
        surface_state_heap_size: 4096,
        ..Default::default()
    };
    let device = common::device(HwFamily::XeHpCore, config);
    let kernel = buffer_kernel(&device, "gather", 4);
    let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
    list.append_launch_kernel(&kernel, [1, 1, 1], None, WaitList::default())
        .unwrap();

    let mut launches = 1;
    let new_base = loop {
        let container = list.container();
        let base = container.heap(HeapType::SurfaceState).unwrap().gpu_base();
        let reallocations = container.heap_reallocations();
        let records = list.num_state_transition_records();

        list.append_launch_kernel(&kernel, [1, 1, 1], None, WaitList::default())
            .unwrap();
        launches += 1;

        let after = list.container().heap(HeapType::SurfaceState).unwrap().gpu_base();
        if list.container().heap_reallocations() > reallocations {
            assert_ne!(after, base);
            assert_eq!(list.num_state_transition_records(), records + 1);
            break after;
        }
        assert_eq!(after, base);
        assert_eq!(list.num_state_transition_records(), records);
        assert!(launches < 64, "surface state heap never filled up");
    };
    list.close().unwrap();

    let cmds = list_commands(&list);
    let walkers = walker_positions(&cmds);
    assert_eq!(walkers.len(), launches);
    let between = &cmds[walkers[launches - 2] + 1..walkers[launches - 1]];
    assert_eq!(count_opcode(between, CmdOpcode::StateBaseAddress), 1);
    let sba = between
        .iter()
        .find_map(|cmd| match cmd {
            ParsedCmd::StateBaseAddress(sba) => Some(*sba),
            _ => None,
        })
        .unwrap();
    assert_eq!(sba.surface_state_base, new_base);
    assert_eq!(
        cmds[..walkers[launches - 2]]
            .iter()
            .filter(|cmd| cmd.opcode() == CmdOpcode::StateBaseAddress)
            .count(),
        0
    );
}

#[derive(Clone, Copy, Debug)]
struct Variant {
    large_grf: bool,
    systolic: bool,
}

fn variant() -> impl Strategy<Value = Variant> {
    (any::<bool>(), any::<bool>()).prop_map(|(large_grf, systolic)| Variant { large_grf, systolic })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn in_list_records_follow_property_changes(variants in prop::collection::vec(variant(), 1..12)) {
        let device = common::device(HwFamily::XeHpCore, DriverConfig::default());
        let kernels: Vec<_> = [(false, false), (false, true), (true, false), (true, true)]
            .into_iter()
            .map(|(large_grf, systolic)| {
                common::kernel(&device, KernelDesc {
                    name: format!("k_{large_grf}_{systolic}"),
                    grf_count: if large_grf { 256 } else { 128 },
                    uses_systolic: systolic,
                    args: vec![ArgKind::Buffer],
                    ..Default::default()
                })
            })
            .collect();
        let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
        for v in &variants {
            let kernel = &kernels[usize::from(v.large_grf) * 2 + usize::from(v.systolic)];
            list.append_launch_kernel(kernel, [1, 1, 1], None, WaitList::default()).unwrap();
        }
        list.close().unwrap();

        let expected: u32 = variants
            .windows(2)
            .map(|w| u32::from(w[0].large_grf != w[1].large_grf) + u32::from(w[0].systolic != w[1].systolic))
            .sum();
        prop_assert_eq!(list.num_state_transition_records(), expected);
        let cmds = list_commands(&list);
        prop_assert_eq!(count_opcode(&cmds, CmdOpcode::StateBaseAddress), 0);
    }

    #[test]
    fn heap_base_moves_only_on_reallocation(buffer_counts in prop::collection::vec(0usize..6, 1..24)) {
        let config = DriverConfig {
            surface_state_heap_size: 4096,
            ..Default::default()
        };
        let device = common::device(HwFamily::XeHpCore, config);
        let kernels: Vec<_> = (0..6)
            .map(|buffers| buffer_kernel(&device, &format!("k{buffers}"), buffers))
            .collect();
        let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
        for buffers in buffer_counts {
            let base = list.container().heap(HeapType::SurfaceState).unwrap().gpu_base();
            let reallocations = list.container().heap_reallocations();
            list.append_launch_kernel(&kernels[buffers], [1, 1, 1], None, WaitList::default()).unwrap();
            let moved = list.container().heap(HeapType::SurfaceState).unwrap().gpu_base() != base;
            prop_assert_eq!(moved, list.container().heap_reallocations() != reallocations);
        }
    }
}
