use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`SubmissionStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmissionStatsSnapshot {
    pub submissions: u64,
    pub flush_failures: u64,
    pub waits: u64,
    pub wait_timeouts: u64,
    pub gpu_hangs: u64,

    pub state_base_address_records: u64,
    pub compute_mode_records: u64,
    pub front_end_records: u64,
    pub pipeline_select_records: u64,

    pub heap_reallocations: u64,
    pub command_buffer_chains: u64,
}

/// Counters shared by every command list, queue and CSR of a device.
///
/// Updated with relaxed ordering; the values are only used for profiling and tests.
#[derive(Debug, Default)]
pub struct SubmissionStats {
    submissions: AtomicU64,
    flush_failures: AtomicU64,
    waits: AtomicU64,
    wait_timeouts: AtomicU64,
    gpu_hangs: AtomicU64,

    state_base_address_records: AtomicU64,
    compute_mode_records: AtomicU64,
    front_end_records: AtomicU64,
    pipeline_select_records: AtomicU64,

    heap_reallocations: AtomicU64,
    command_buffer_chains: AtomicU64,
}

impl SubmissionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_submissions(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flush_failures(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_waits(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wait_timeouts(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gpu_hangs(&self) {
        self.gpu_hangs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_state_base_address_records(&self) {
        self.state_base_address_records
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_compute_mode_records(&self) {
        self.compute_mode_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_front_end_records(&self) {
        self.front_end_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pipeline_select_records(&self) {
        self.pipeline_select_records
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_heap_reallocations(&self) {
        self.heap_reallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffer_chains(&self) {
        self.command_buffer_chains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SubmissionStatsSnapshot {
        SubmissionStatsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            gpu_hangs: self.gpu_hangs.load(Ordering::Relaxed),
            state_base_address_records: self.state_base_address_records.load(Ordering::Relaxed),
            compute_mode_records: self.compute_mode_records.load(Ordering::Relaxed),
            front_end_records: self.front_end_records.load(Ordering::Relaxed),
            pipeline_select_records: self.pipeline_select_records.load(Ordering::Relaxed),
            heap_reallocations: self.heap_reallocations.load(Ordering::Relaxed),
            command_buffer_chains: self.command_buffer_chains.load(Ordering::Relaxed),
        }
    }
}
