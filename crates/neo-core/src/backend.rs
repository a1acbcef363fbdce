//! OS submission backends.
//!
//! [`SubmissionBackend`] is the seam between a CSR and whatever actually hands work to the GPU.
//! The in-process backends below stand in for a device: they walk the submitted command
//! buffers with a simulated command streamer that executes every memory-writing
//! synchronization record (post-syncs, immediate stores, timestamp reads, memory copies) and
//! stalls on unsatisfied semaphore waits. Walkers and blits are treated as no-ops apart from
//! their post-sync.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use neo_cmd::records::{PipeControlFlags, PostSyncOp, SemaphoreCompare};
use neo_cmd::{parse_cmd_at, ParsedCmd};
use tracing::{trace, warn};

use crate::allocation::{GraphicsAllocation, TaskCount};
use crate::allocation_storage::TagView;
use crate::error::ZeError;

/// Outcome of [`SubmissionBackend::flush`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmissionStatus {
    Success,
    OutOfMemory,
    OutOfHostMemory,
    Failed,
    DeviceUninitialized,
    Unsupported,
}

impl SubmissionStatus {
    pub fn is_success(self) -> bool {
        self == SubmissionStatus::Success
    }

    /// Error an API call reports for a failed submission.
    pub fn to_error(self) -> Option<ZeError> {
        match self {
            SubmissionStatus::Success => None,
            SubmissionStatus::OutOfMemory => Some(ZeError::OutOfDeviceMemory),
            SubmissionStatus::OutOfHostMemory => Some(ZeError::OutOfHostMemory),
            SubmissionStatus::Failed => Some(ZeError::DeviceLost),
            SubmissionStatus::DeviceUninitialized => Some(ZeError::Uninitialized),
            SubmissionStatus::Unsupported => Some(ZeError::UnsupportedFeature),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Part of the CSR's own command stream.
    Ring,
    /// A command buffer of a command list, entered with `MI_BATCH_BUFFER_START` from the ring
    /// and left with `MI_BATCH_BUFFER_END`.
    Batch,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BatchSegment {
    pub kind: SegmentKind,
    pub gpu_address: u64,
    pub bytes: Vec<u8>,
}

impl BatchSegment {
    fn contains(&self, address: u64) -> bool {
        address >= self.gpu_address && address < self.gpu_address + self.bytes.len() as u64
    }
}

impl fmt::Debug for BatchSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchSegment")
            .field("kind", &self.kind)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Everything one submission hands to the backend. Execution starts at offset 0 of
/// `segments[0]`.
#[derive(Clone, Debug)]
pub struct BatchBuffer {
    pub segments: Vec<BatchSegment>,
    pub task_count: TaskCount,
    pub tag: TagView,
    pub residency: Vec<Arc<GraphicsAllocation>>,
    /// Whether the batch programs the tag update for `task_count`.
    pub tag_update: bool,
}

impl BatchBuffer {
    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.bytes.len()).sum()
    }
}

pub trait SubmissionBackend: Send + Sync + fmt::Debug {
    fn flush(&self, batch: BatchBuffer) -> SubmissionStatus;

    fn ensure_context_initialized(&self) -> SubmissionStatus {
        SubmissionStatus::Success
    }

    /// Driver-model hang query.
    fn is_gpu_hang_detected(&self) -> bool {
        false
    }

    /// Give the device a chance to make progress. Called between polls of a wait.
    fn progress(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursor {
    segment: usize,
    offset: usize,
}

#[derive(Debug)]
struct PendingBatch {
    batch: BatchBuffer,
    cursor: Cursor,
    return_stack: Vec<Cursor>,
}

enum RunOutcome {
    Completed,
    Blocked,
}

/// Simulated command streamer shared by the in-process backends.
#[derive(Default)]
struct SimGpu {
    pending: Mutex<VecDeque<PendingBatch>>,
    history: Mutex<Vec<BatchBuffer>>,
    fail_next: Mutex<VecDeque<SubmissionStatus>>,
    init_status: Mutex<Option<SubmissionStatus>>,
    hang: AtomicBool,
    timestamp: AtomicU64,
    executed: AtomicU64,
}

const TIMESTAMP_BASE: u64 = 0x1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimGpu {
    fn take_injected_failure(&self) -> Option<SubmissionStatus> {
        lock(&self.fail_next).pop_front()
    }

    fn accept(&self, batch: BatchBuffer) -> SubmissionStatus {
        if let Some(status) = self.take_injected_failure() {
            warn!(?status, task_count = batch.task_count, "injected flush failure");
            return status;
        }
        lock(&self.history).push(batch.clone());
        lock(&self.pending).push_back(PendingBatch {
            batch,
            cursor: Cursor {
                segment: 0,
                offset: 0,
            },
            return_stack: Vec::new(),
        });
        SubmissionStatus::Success
    }

    fn next_timestamp(&self) -> u64 {
        TIMESTAMP_BASE + self.timestamp.fetch_add(16, Ordering::Relaxed)
    }

    /// Execute pending batches in order while their task count is at most `limit`.
    fn run(&self, limit: TaskCount) {
        if self.hang.load(Ordering::Acquire) {
            return;
        }
        let mut pending = lock(&self.pending);
        while let Some(front) = pending.front_mut() {
            if front.batch.task_count > limit {
                break;
            }
            match self.execute(front) {
                RunOutcome::Completed => {
                    self.executed.fetch_add(1, Ordering::Relaxed);
                    pending.pop_front();
                }
                RunOutcome::Blocked => break,
            }
        }
    }

    fn execute(&self, pending: &mut PendingBatch) -> RunOutcome {
        let batch = &pending.batch;
        loop {
            let Some(segment) = batch.segments.get(pending.cursor.segment) else {
                return RunOutcome::Completed;
            };
            if pending.cursor.offset >= segment.bytes.len() {
                warn!(task_count = batch.task_count, "segment ended without MI_BATCH_BUFFER_END");
                return RunOutcome::Completed;
            }
            let (cmd, size) = match parse_cmd_at(&segment.bytes, pending.cursor.offset) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(%err, task_count = batch.task_count, "malformed command buffer");
                    return RunOutcome::Completed;
                }
            };
            let next = Cursor {
                segment: pending.cursor.segment,
                offset: pending.cursor.offset + size,
            };
            match cmd {
                ParsedCmd::MiBatchBufferEnd => match pending.return_stack.pop() {
                    Some(ret) => pending.cursor = ret,
                    None => return RunOutcome::Completed,
                },
                ParsedCmd::MiBatchBufferStart(bbs) => {
                    let Some(target) = batch.segments.iter().position(|s| s.contains(bbs.address)) else {
                        warn!(address = bbs.address, "batch buffer start outside the submission");
                        return RunOutcome::Completed;
                    };
                    if segment.kind == SegmentKind::Ring && batch.segments[target].kind == SegmentKind::Batch {
                        pending.return_stack.push(next);
                    }
                    pending.cursor = Cursor {
                        segment: target,
                        offset: (bbs.address - batch.segments[target].gpu_address) as usize,
                    };
                }
                ParsedCmd::MiSemaphoreWait(wait) => {
                    let Some(compare) = SemaphoreCompare::from_u32(wait.compare_op) else {
                        pending.cursor = next;
                        continue;
                    };
                    let value = read_u32(&batch.residency, wait.address).unwrap_or(0);
                    if !compare.evaluate(value, wait.value) {
                        trace!(address = wait.address, value, "semaphore wait stalls");
                        return RunOutcome::Blocked;
                    }
                    pending.cursor = next;
                }
                other => {
                    self.execute_write(batch, other);
                    pending.cursor = next;
                }
            }
        }
    }

    fn post_sync(&self, residency: &[Arc<GraphicsAllocation>], address: u64, op: u32, data: u64) {
        match PostSyncOp::from_u32(op) {
            Some(PostSyncOp::WriteImmediate) => write_u64(residency, address, data),
            Some(PostSyncOp::WriteTimestamp) => write_u64(residency, address, self.next_timestamp()),
            _ => {}
        }
    }

    fn execute_write(&self, batch: &BatchBuffer, cmd: ParsedCmd) {
        let residency = &batch.residency;
        match cmd {
            ParsedCmd::PipeControl(pc) => {
                if pc.pipe_control_flags().contains(PipeControlFlags::WORKLOAD_PARTITION_ID_OFFSET) {
                    for partition in 0..batch.tag.partitions() {
                        let address = pc.address + u64::from(partition) * batch.tag.partition_offset();
                        self.post_sync(residency, address, pc.post_sync_op, pc.immediate_data);
                    }
                } else {
                    self.post_sync(residency, pc.address, pc.post_sync_op, pc.immediate_data);
                }
            }
            ParsedCmd::MiFlushDw(flush) => {
                self.post_sync(residency, flush.address, flush.post_sync_op, flush.immediate_data);
            }
            ParsedCmd::ComputeWalker(walker) => {
                for partition in 0..walker.partition_count.max(1) {
                    let address = walker.post_sync_address
                        + u64::from(partition) * u64::from(walker.post_sync_partition_stride);
                    self.post_sync(residency, address, walker.post_sync_op, walker.post_sync_immediate_data);
                }
            }
            ParsedCmd::MiStoreDataImm(store) => {
                if store.store_qword != 0 {
                    write_u64(residency, store.address, store.data);
                } else {
                    write_u32(residency, store.address, store.data as u32);
                }
            }
            ParsedCmd::MiStoreRegisterMem(srm) => {
                write_u64(residency, srm.address, self.next_timestamp());
            }
            ParsedCmd::MiCopyMemMem(copy) => {
                if let Some(value) = read_u64(residency, copy.source) {
                    write_u64(residency, copy.destination, value);
                }
            }
            _ => {}
        }
    }
}

fn find(residency: &[Arc<GraphicsAllocation>], address: u64, len: u64) -> Option<&Arc<GraphicsAllocation>> {
    let found = residency
        .iter()
        .find(|a| a.contains_gpu_range(address, len));
    if found.is_none() {
        warn!(address, "access to a non-resident address");
    }
    found
}

fn read_u32(residency: &[Arc<GraphicsAllocation>], address: u64) -> Option<u32> {
    let alloc = find(residency, address, 4)?;
    alloc.read_u32(address - alloc.gpu_address())
}

fn read_u64(residency: &[Arc<GraphicsAllocation>], address: u64) -> Option<u64> {
    let alloc = find(residency, address, 8)?;
    alloc.read_u64(address - alloc.gpu_address())
}

fn write_u32(residency: &[Arc<GraphicsAllocation>], address: u64, value: u32) {
    if let Some(alloc) = find(residency, address, 4) {
        alloc.write_u32(address - alloc.gpu_address(), value);
    }
}

fn write_u64(residency: &[Arc<GraphicsAllocation>], address: u64, value: u64) {
    if let Some(alloc) = find(residency, address, 8) {
        alloc.write_u64(address - alloc.gpu_address(), value);
    }
}

impl fmt::Debug for SimGpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimGpu")
            .field("pending", &lock(&self.pending).len())
            .field("submitted", &lock(&self.history).len())
            .field("hang", &self.hang.load(Ordering::Relaxed))
            .finish()
    }
}

macro_rules! sim_backend_controls {
    ($ty:ident) => {
        impl $ty {
            pub fn new() -> Self {
                Self::default()
            }

            /// The next flush returns `status` without accepting the batch.
            pub fn fail_next_flush(&self, status: SubmissionStatus) {
                lock(&self.gpu.fail_next).push_back(status);
            }

            /// Status returned by every later `ensure_context_initialized`.
            pub fn fail_context_initialization(&self, status: SubmissionStatus) {
                *lock(&self.gpu.init_status) = Some(status);
            }

            /// A hung device stops executing and reports the hang on the next query.
            pub fn set_gpu_hang(&self, hang: bool) {
                self.gpu.hang.store(hang, Ordering::Release);
            }

            /// Every batch accepted so far, in submission order.
            pub fn submitted_batches(&self) -> Vec<BatchBuffer> {
                lock(&self.gpu.history).clone()
            }

            pub fn submitted_count(&self) -> usize {
                lock(&self.gpu.history).len()
            }

            pub fn pending_count(&self) -> usize {
                lock(&self.gpu.pending).len()
            }

            pub fn executed_count(&self) -> u64 {
                self.gpu.executed.load(Ordering::Relaxed)
            }
        }
    };
}

macro_rules! sim_backend_queries {
    () => {
        fn ensure_context_initialized(&self) -> SubmissionStatus {
            lock(&self.gpu.init_status).unwrap_or(SubmissionStatus::Success)
        }

        fn is_gpu_hang_detected(&self) -> bool {
            self.gpu.hang.load(Ordering::Acquire)
        }
    };
}

/// Executes every batch as soon as it is flushed. A batch stalled on a semaphore resumes on the
/// next flush or wait poll.
#[derive(Debug, Default)]
pub struct ImmediateBackend {
    gpu: SimGpu,
}

sim_backend_controls!(ImmediateBackend);

impl SubmissionBackend for ImmediateBackend {
    fn flush(&self, batch: BatchBuffer) -> SubmissionStatus {
        let status = self.gpu.accept(batch);
        self.gpu.run(TaskCount::MAX);
        status
    }

    fn progress(&self) {
        self.gpu.run(TaskCount::MAX);
    }

    sim_backend_queries!();
}

/// Queues batches until the test lets the device run.
#[derive(Debug, Default)]
pub struct DeferredBackend {
    gpu: SimGpu,
}

sim_backend_controls!(DeferredBackend);

impl DeferredBackend {
    /// Execute queued batches up to and including `task_count`.
    pub fn complete_up_to(&self, task_count: TaskCount) {
        self.gpu.run(task_count);
    }

    pub fn complete_all(&self) {
        self.gpu.run(TaskCount::MAX);
    }
}

impl SubmissionBackend for DeferredBackend {
    fn flush(&self, batch: BatchBuffer) -> SubmissionStatus {
        self.gpu.accept(batch)
    }

    sim_backend_queries!();
}

/// Accepts every batch and never executes anything.
#[derive(Debug, Default)]
pub struct NullBackend {
    gpu: SimGpu,
}

sim_backend_controls!(NullBackend);

impl SubmissionBackend for NullBackend {
    fn flush(&self, batch: BatchBuffer) -> SubmissionStatus {
        self.gpu.accept(batch)
    }

    sim_backend_queries!();
}
