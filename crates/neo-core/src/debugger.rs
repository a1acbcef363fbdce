use std::sync::Arc;

use crate::allocation::GraphicsAllocation;
use crate::module::ModuleId;

/// Observer for a source-level debugger. Every method is optional.
pub trait DebuggerNotify: Send + Sync {
    fn module_loaded(&self, _module: ModuleId, _isa_allocations: &[Arc<GraphicsAllocation>]) {}

    /// An instruction segment was patched in place by dynamic linking.
    fn segment_patched(&self, _module: ModuleId, _kernel: &str, _isa_gpu_address: u64) {}

    /// Allocations a command list made resident for a submission.
    fn command_list_allocations(&self, _allocations: &[Arc<GraphicsAllocation>]) {}
}
