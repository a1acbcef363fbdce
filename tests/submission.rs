mod common;

use std::sync::Arc;
use std::time::Duration;

use neo_core::backend::{DeferredBackend, ImmediateBackend, NullBackend, SubmissionStatus};
use neo_core::command_list::WaitList;
use neo_core::memory_manager::{MemoryManager, SimMemoryManager};
use neo_core::module::{ArgKind, KernelDesc};
use neo_core::{
    release_with_proof, AllocationType, CommandList, CommandQueue, DriverConfig, EngineGroupType,
    HwFamily, QueueMode, WaitParams, WaitStatus, ZeError,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn recorded_list(device: &neo_core::Device) -> CommandList {
    let kernel = common::buffer_kernel(device, "work", 1);
    let mut list = CommandList::create(device, EngineGroupType::Compute).unwrap();
    list.append_launch_kernel(&kernel, [2, 1, 1], None, WaitList::default())
        .unwrap();
    list.close().unwrap();
    list
}

#[test]
fn failed_tag_flush_reports_not_ready_and_keeps_the_task_count() {
    let backend = Arc::new(ImmediateBackend::new());
    let config = DriverConfig {
        update_tag_from_wait: true,
        ..Default::default()
    };
    let device = common::device_with_backend(
        HwFamily::XeHpCore,
        config,
        Arc::new(SimMemoryManager::new()),
        backend.clone(),
    );
    let list = recorded_list(&device);
    let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
    let fence = queue.execute_command_lists(&[&list], None).unwrap();
    let csr = queue.csr();
    assert_eq!(csr.task_count(), fence.task_count);
    assert!(csr.latest_flushed_task_count() < fence.task_count);

    backend.fail_next_flush(SubmissionStatus::Failed);
    let status = csr.wait_for_completion_with_timeout(
        WaitParams::with_timeout(Duration::from_millis(10)),
        fence.task_count,
    );
    assert_eq!(status, WaitStatus::NotReady);
    assert_eq!(csr.task_count(), fence.task_count);
    assert_eq!(device.stats().snapshot().flush_failures, 1);

    let status = csr.wait_for_completion_with_timeout(
        WaitParams::with_timeout(Duration::from_secs(5)),
        fence.task_count,
    );
    assert_eq!(status, WaitStatus::Ready);
    assert_eq!(csr.task_count(), fence.task_count + 1);
}

#[test]
fn waiting_twice_does_not_flush_again() {
    let backend = Arc::new(ImmediateBackend::new());
    let device = common::device_with_backend(
        HwFamily::XeHpCore,
        DriverConfig::default(),
        Arc::new(SimMemoryManager::new()),
        backend.clone(),
    );
    let list = recorded_list(&device);
    let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
    let fence = queue.execute_command_lists(&[&list], None).unwrap();
    let csr = queue.csr();

    let params = WaitParams::with_timeout(Duration::from_secs(5));
    assert_eq!(csr.wait_for_completion_with_timeout(params, fence.task_count), WaitStatus::Ready);
    let submitted = backend.submitted_count();
    assert_eq!(csr.wait_for_completion_with_timeout(params, fence.task_count), WaitStatus::Ready);
    assert_eq!(backend.submitted_count(), submitted);
    assert_eq!(csr.task_count(), fence.task_count);
}

#[test]
fn resident_allocation_is_released_only_with_proof() {
    let mm = Arc::new(SimMemoryManager::new());
    let backend = Arc::new(DeferredBackend::new());
    let device = common::device_with_backend(
        HwFamily::XeHpCore,
        DriverConfig::default(),
        mm.clone(),
        backend.clone(),
    );
    let buffer = device.allocate(4096, AllocationType::Buffer).unwrap();
    let mut kernel = common::kernel(
        &device,
        KernelDesc {
            name: "consume".into(),
            args: vec![ArgKind::Buffer],
            ..Default::default()
        },
    );
    kernel.set_arg_buffer(0, buffer.clone(), 0).unwrap();
    let mut list = CommandList::create(&device, EngineGroupType::Compute).unwrap();
    list.append_launch_kernel(&kernel, [1, 1, 1], None, WaitList::default())
        .unwrap();
    list.close().unwrap();

    let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
    let fence = queue.execute_command_lists(&[&list], None).unwrap();
    let csr = queue.csr();
    assert_eq!(buffer.task_count(csr.context()), Some(fence.task_count));

    let early = csr.wait_for_fence(fence, WaitParams::with_timeout(Duration::from_millis(5)));
    assert_eq!(early, Err(ZeError::NotReady));
    let (_, buffer) = release_with_proof(mm.as_ref(), buffer, &[]).unwrap_err();
    assert!(mm.is_live(buffer.id()));

    backend.complete_all();
    let proof = csr
        .wait_for_fence(fence, WaitParams::with_timeout(Duration::from_secs(5)))
        .unwrap();
    assert!(proof.covers(fence));
    let id = buffer.id();
    drop(kernel);
    drop(list);
    release_with_proof(mm.as_ref() as &dyn MemoryManager, buffer, &[proof]).unwrap();
    assert!(!mm.is_live(id));
}

#[test]
fn hang_is_reported_as_device_lost() {
    let backend = Arc::new(ImmediateBackend::new());
    let device = common::device_with_backend(
        HwFamily::XeHpCore,
        DriverConfig::default(),
        Arc::new(SimMemoryManager::new()),
        backend.clone(),
    );
    let list = recorded_list(&device);
    let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
    backend.set_gpu_hang(true);
    queue.execute_command_lists(&[&list], None).unwrap();
    assert_eq!(queue.synchronize(None), Err(ZeError::DeviceLost));
    assert_eq!(device.stats().snapshot().gpu_hangs, 1);
}

#[test]
fn flush_failures_map_to_result_codes() {
    let cases = [
        (SubmissionStatus::OutOfMemory, ZeError::OutOfDeviceMemory),
        (SubmissionStatus::OutOfHostMemory, ZeError::OutOfHostMemory),
        (SubmissionStatus::Failed, ZeError::DeviceLost),
    ];
    for (status, expected) in cases {
        let backend = Arc::new(NullBackend::new());
        let device = common::device_with_backend(
            HwFamily::XeHpCore,
            DriverConfig {
                skip_resource_cleanup: true,
                ..Default::default()
            },
            Arc::new(SimMemoryManager::new()),
            backend.clone(),
        );
        let list = recorded_list(&device);
        let queue =
            CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
        backend.fail_next_flush(status);
        assert_eq!(queue.execute_command_lists(&[&list], None), Err(expected));
        assert_eq!(queue.csr().task_count(), 0);

        let fence = queue.execute_command_lists(&[&list], None).unwrap();
        assert_eq!(fence.task_count, 1);
        assert_eq!(backend.submitted_count(), 1);
    }
}

#[test]
fn context_initialization_failure_is_uninitialized() {
    let backend = Arc::new(ImmediateBackend::new());
    let device = common::device_with_backend(
        HwFamily::XeHpCore,
        DriverConfig::default(),
        Arc::new(SimMemoryManager::new()),
        backend.clone(),
    );
    let list = recorded_list(&device);
    let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
    backend.fail_context_initialization(SubmissionStatus::DeviceUninitialized);
    assert_eq!(
        queue.execute_command_lists(&[&list], None),
        Err(ZeError::Uninitialized)
    );
    assert!(!queue.csr().is_context_initialized());
}

#[test]
fn queue_rejects_lists_it_cannot_run() {
    let device = common::device(HwFamily::XeHpCore, DriverConfig::default());
    let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
    let open = CommandList::create(&device, EngineGroupType::Compute).unwrap();
    assert_eq!(
        queue.execute_command_lists(&[&open], None),
        Err(ZeError::InvalidArgument)
    );

    let mut copy = CommandList::create(&device, EngineGroupType::Copy).unwrap();
    copy.close().unwrap();
    assert_eq!(
        queue.execute_command_lists(&[&copy], None),
        Err(ZeError::InvalidArgument)
    );
    assert_eq!(queue.execute_command_lists(&[], None), Err(ZeError::InvalidArgument));
    assert_eq!(queue.csr().task_count(), 0);
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Execute,
    TagUpdate,
    FailedExecute,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Execute),
        Just(Step::TagUpdate),
        Just(Step::FailedExecute),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn task_counts_grow_by_one_per_successful_submission(steps in prop::collection::vec(step(), 1..16)) {
        let backend = Arc::new(ImmediateBackend::new());
        let device = common::device_with_backend(
            HwFamily::XeHpCore,
            DriverConfig::default(),
            Arc::new(SimMemoryManager::new()),
            backend.clone(),
        );
        let list = recorded_list(&device);
        let queue = CommandQueue::create(&device, EngineGroupType::Compute, QueueMode::Asynchronous).unwrap();
        let csr = queue.csr().clone();

        let mut expected = 0;
        for step in steps {
            let before = csr.task_count();
            match step {
                Step::Execute => {
                    let fence = queue.execute_command_lists(&[&list], None).unwrap();
                    expected += 1;
                    prop_assert_eq!(fence.task_count, before + 1);
                }
                Step::TagUpdate => {
                    let fence = csr.flush_tag_update().unwrap();
                    expected += 1;
                    prop_assert_eq!(fence.task_count, before + 1);
                }
                Step::FailedExecute => {
                    backend.fail_next_flush(SubmissionStatus::OutOfMemory);
                    prop_assert!(queue.execute_command_lists(&[&list], None).is_err());
                    prop_assert_eq!(csr.task_count(), before);
                }
            }
            prop_assert_eq!(csr.task_count(), expected);
        }
        queue.synchronize(Some(Duration::from_secs(5))).unwrap();
        prop_assert_eq!(csr.completed_task_count(), expected);
    }
}
