//! Kernel modules: immutable kernel data, the module registry and dynamic linking.
//!
//! Compilation is out of scope; a module is created from already compiled instruction
//! segments plus symbol tables. The core only ever mutates a module's binaries to patch
//! relocations into instruction segments that are already allocated.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::allocation::{AllocationType, GraphicsAllocation};
use crate::debugger::DebuggerNotify;
use crate::error::{ZeError, ZeResult};
use crate::memory_manager::{AllocationProperties, MemoryManager};
use crate::stream_properties::ThreadArbitrationPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Stateless buffer pointer; gets a surface state and a binding table entry.
    Buffer,
    /// By-value argument of `size` bytes.
    Value { size: u32 },
}

/// Compiled kernel as handed over by the compiler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelDesc {
    pub name: String,
    pub isa: Vec<u8>,
    pub simd_size: u32,
    pub grf_count: u32,
    pub slm_size: u32,
    pub cross_thread_data_size: u32,
    pub per_thread_data_size: u32,
    pub args: Vec<ArgKind>,
    pub sampler_count: u32,
    pub scratch_size: u32,
    pub uses_printf: bool,
    pub uses_systolic: bool,
    pub uses_barriers: bool,
    pub requires_disable_eu_fusion: bool,
    pub requires_coherency: bool,
    pub thread_arbitration_policy: Option<ThreadArbitrationPolicy>,
}

impl Default for KernelDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            isa: vec![0; 64],
            simd_size: 32,
            grf_count: 128,
            slm_size: 0,
            cross_thread_data_size: 32,
            per_thread_data_size: 0,
            args: Vec::new(),
            sampler_count: 0,
            scratch_size: 0,
            uses_printf: false,
            uses_systolic: false,
            uses_barriers: false,
            requires_disable_eu_fusion: false,
            requires_coherency: false,
            thread_arbitration_policy: None,
        }
    }
}

/// A symbol a module exports: `offset` bytes into the instruction segment of `kernel`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolExport {
    pub name: String,
    pub kernel: String,
    pub offset: u64,
}

/// A 64-bit address to patch at `offset` of `kernel`'s instruction segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub symbol: String,
    pub kernel: String,
    pub offset: usize,
    pub addend: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleDesc {
    pub native_binary: Vec<u8>,
    pub debug_info: Option<Vec<u8>>,
    pub kernels: Vec<KernelDesc>,
    pub exports: Vec<SymbolExport>,
    pub relocations: Vec<Relocation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Unlinked,
    LinkedPartially,
    FullyLinked,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("unknown module {0:?}")]
    UnknownModule(ModuleId),
    #[error("{count} unresolved symbol(s) remain after linking")]
    Unresolved { count: usize },
    #[error("relocation of `{symbol}` at offset {offset} is outside kernel `{kernel}`")]
    RelocationOutOfBounds {
        symbol: String,
        kernel: String,
        offset: usize,
    },
}

impl From<LinkError> for ZeError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::UnknownModule(_) => ZeError::InvalidArgument,
            LinkError::Unresolved { .. } | LinkError::RelocationOutOfBounds { .. } => {
                ZeError::ModuleLinkFailure
            }
        }
    }
}

/// Per-kernel data shared by every [`Kernel`] instance.
pub struct KernelImmutableData {
    pub name: String,
    pub simd_size: u32,
    pub grf_count: u32,
    pub slm_size: u32,
    pub cross_thread_data_size: u32,
    pub per_thread_data_size: u32,
    pub args: Vec<ArgKind>,
    pub sampler_count: u32,
    pub scratch_size: u32,
    pub uses_printf: bool,
    pub uses_systolic: bool,
    pub uses_barriers: bool,
    pub requires_disable_eu_fusion: bool,
    pub requires_coherency: bool,
    pub thread_arbitration_policy: Option<ThreadArbitrationPolicy>,
    isa_allocation: Arc<GraphicsAllocation>,
    isa: Mutex<Vec<u8>>,
}

impl KernelImmutableData {
    fn new(desc: KernelDesc, isa_allocation: Arc<GraphicsAllocation>) -> Self {
        Self {
            name: desc.name,
            simd_size: desc.simd_size,
            grf_count: desc.grf_count,
            slm_size: desc.slm_size,
            cross_thread_data_size: desc.cross_thread_data_size,
            per_thread_data_size: desc.per_thread_data_size,
            args: desc.args,
            sampler_count: desc.sampler_count,
            scratch_size: desc.scratch_size,
            uses_printf: desc.uses_printf,
            uses_systolic: desc.uses_systolic,
            uses_barriers: desc.uses_barriers,
            requires_disable_eu_fusion: desc.requires_disable_eu_fusion,
            requires_coherency: desc.requires_coherency,
            thread_arbitration_policy: desc.thread_arbitration_policy,
            isa_allocation,
            isa: Mutex::new(desc.isa),
        }
    }

    pub fn isa_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.isa_allocation
    }

    pub fn isa_gpu_address(&self) -> u64 {
        self.isa_allocation.gpu_address()
    }

    /// Copy of the instruction segment.
    pub fn isa(&self) -> Vec<u8> {
        self.isa.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Large GRF mode is selected by kernels that use more than the default register file.
    pub fn uses_large_grf(&self) -> bool {
        self.grf_count > 128
    }

    pub fn binding_table_count(&self) -> usize {
        self.args.iter().filter(|a| matches!(a, ArgKind::Buffer)).count()
    }

    fn patch_u64(&self, offset: usize, value: u64) -> bool {
        let mut isa = self.isa.lock().unwrap_or_else(PoisonError::into_inner);
        match offset.checked_add(8).and_then(|end| isa.get_mut(offset..end)) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for KernelImmutableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelImmutableData")
            .field("name", &self.name)
            .field("simd_size", &self.simd_size)
            .field("slm_size", &self.slm_size)
            .field("isa_gpu_address", &format_args!("{:#x}", self.isa_gpu_address()))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Module {
    id: ModuleId,
    kernels: Vec<Arc<KernelImmutableData>>,
    exports: HashMap<String, u64>,
    unresolved: Vec<Relocation>,
    build_log: Vec<String>,
    native_binary: Vec<u8>,
    debug_info: Option<Vec<u8>>,
    link_state: LinkState,
}

impl Module {
    /// Allocate instruction segments and resolve relocations against the module's own exports.
    pub fn create(id: ModuleId, desc: ModuleDesc, memory_manager: &dyn MemoryManager) -> ZeResult<Self> {
        let mut names = std::collections::HashSet::new();
        for kernel in &desc.kernels {
            if kernel.isa.is_empty() || kernel.simd_size == 0 || !names.insert(kernel.name.as_str()) {
                return Err(ZeError::ModuleBuildFailure);
            }
        }
        let known = |k: &str| desc.kernels.iter().any(|d| d.name == k);
        if desc.exports.iter().any(|e| !known(&e.kernel))
            || desc.relocations.iter().any(|r| !known(&r.kernel))
        {
            return Err(ZeError::ModuleBuildFailure);
        }

        let mut kernels: Vec<Arc<KernelImmutableData>> = Vec::with_capacity(desc.kernels.len());
        for kernel in desc.kernels {
            let props = AllocationProperties::new(kernel.isa.len().max(64) as u64, AllocationType::KernelIsa);
            let Some(allocation) = memory_manager.allocate_graphics_memory_with_properties(&props) else {
                for k in kernels {
                    memory_manager.free_graphics_memory(k.isa_allocation.clone());
                }
                return Err(ZeError::OutOfDeviceMemory);
            };
            kernels.push(Arc::new(KernelImmutableData::new(kernel, allocation)));
        }

        let mut exports = HashMap::new();
        for export in desc.exports {
            if let Some(k) = kernels.iter().find(|k| k.name == export.kernel) {
                exports.insert(export.name, k.isa_gpu_address() + export.offset);
            }
        }

        let mut module = Self {
            id,
            kernels,
            exports,
            unresolved: Vec::new(),
            build_log: Vec::new(),
            native_binary: desc.native_binary,
            debug_info: desc.debug_info,
            link_state: LinkState::FullyLinked,
        };
        let own = module.exports.clone();
        module.unresolved = module.apply_relocations(desc.relocations, &own, |_| {});
        if !module.unresolved.is_empty() {
            module.link_state = LinkState::Unlinked;
        }
        Ok(module)
    }

    /// Patch every relocation whose symbol is in `symbols`; return the ones still unresolved.
    fn apply_relocations(
        &mut self,
        relocations: Vec<Relocation>,
        symbols: &HashMap<String, u64>,
        mut on_patched: impl FnMut(&KernelImmutableData),
    ) -> Vec<Relocation> {
        let mut remaining = Vec::new();
        for reloc in relocations {
            let Some(address) = symbols.get(&reloc.symbol) else {
                remaining.push(reloc);
                continue;
            };
            let Some(kernel) = self.kernels.iter().find(|k| k.name == reloc.kernel) else {
                remaining.push(reloc);
                continue;
            };
            if kernel.patch_u64(reloc.offset, address.wrapping_add_signed(reloc.addend)) {
                on_patched(kernel);
            } else {
                let err = LinkError::RelocationOutOfBounds {
                    symbol: reloc.symbol.clone(),
                    kernel: reloc.kernel.clone(),
                    offset: reloc.offset,
                };
                self.build_log.push(format!("error: {err}"));
                remaining.push(reloc);
            }
        }
        remaining
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn is_fully_linked(&self) -> bool {
        self.link_state == LinkState::FullyLinked
    }

    pub fn kernels(&self) -> &[Arc<KernelImmutableData>] {
        &self.kernels
    }

    pub fn get_kernel_immutable_data(&self, name: &str) -> Option<&Arc<KernelImmutableData>> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn exported_symbols(&self) -> &HashMap<String, u64> {
        &self.exports
    }

    pub fn unresolved_externals(&self) -> &[Relocation] {
        &self.unresolved
    }

    pub fn build_log(&self) -> String {
        self.build_log.join("\n")
    }

    pub fn get_native_binary(&self) -> &[u8] {
        &self.native_binary
    }

    pub fn get_debug_info(&self) -> Option<&[u8]> {
        self.debug_info.as_deref()
    }

    pub fn isa_allocations(&self) -> Vec<Arc<GraphicsAllocation>> {
        self.kernels
            .iter()
            .map(|k| k.isa_allocation.clone())
            .collect()
    }
}

/// Owner of every module of a device; other objects refer to modules by [`ModuleId`].
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: HashMap<ModuleId, Module>,
    next_id: u32,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_module(&mut self, desc: ModuleDesc, memory_manager: &dyn MemoryManager) -> ZeResult<ModuleId> {
        let id = ModuleId(self.next_id);
        let module = Module::create(id, desc, memory_manager)?;
        self.next_id += 1;
        debug!(module = id.0, link_state = ?module.link_state, "module created");
        self.modules.insert(id, module);
        Ok(id)
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    pub fn remove(&mut self, id: ModuleId) -> Option<Module> {
        self.modules.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Remove `id` and free its instruction segments.
    pub fn destroy(&mut self, id: ModuleId, memory_manager: &dyn MemoryManager) -> ZeResult<()> {
        let module = self.modules.remove(&id).ok_or(ZeError::InvalidArgument)?;
        for allocation in module.isa_allocations() {
            memory_manager.free_graphics_memory(allocation);
        }
        debug!(module = id.0, "module destroyed");
        Ok(())
    }

    pub fn destroy_all(&mut self, memory_manager: &dyn MemoryManager) {
        let ids: Vec<ModuleId> = self.modules.keys().copied().collect();
        for id in ids {
            let _ = self.destroy(id, memory_manager);
        }
    }

    /// Resolve the unresolved externals of `ids` against the union of their exports.
    ///
    /// Linking is all or nothing across the participating modules: they only become fully
    /// linked when no symbol remains unresolved in any of them.
    pub fn perform_dynamic_link(
        &mut self,
        ids: &[ModuleId],
        debugger: Option<&dyn DebuggerNotify>,
    ) -> ZeResult<()> {
        if ids.is_empty() {
            return Err(ZeError::InvalidArgument);
        }
        let mut participants: Vec<ModuleId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.modules.contains_key(id) {
                return Err(LinkError::UnknownModule(*id).into());
            }
            if !participants.contains(id) {
                participants.push(*id);
            }
        }

        let mut symbols: HashMap<String, u64> = HashMap::new();
        for id in &participants {
            for (name, address) in &self.modules[id].exports {
                symbols.entry(name.clone()).or_insert(*address);
            }
        }

        let mut remaining_total = 0;
        for id in &participants {
            let Some(module) = self.modules.get_mut(id) else {
                continue;
            };
            let pending = std::mem::take(&mut module.unresolved);
            let mut patched: Vec<(String, u64)> = Vec::new();
            let remaining = module.apply_relocations(pending, &symbols, |k| {
                if !patched.iter().any(|(name, _)| *name == k.name) {
                    patched.push((k.name.clone(), k.isa_gpu_address()));
                }
            });
            if let Some(debugger) = debugger {
                for (kernel, address) in &patched {
                    debugger.segment_patched(*id, kernel, *address);
                }
            }
            remaining_total += remaining.len();
            module.unresolved = remaining;
        }

        if remaining_total == 0 {
            for id in &participants {
                if let Some(module) = self.modules.get_mut(id) {
                    module.link_state = LinkState::FullyLinked;
                }
            }
            debug!(modules = participants.len(), "dynamic link complete");
            return Ok(());
        }

        for id in &participants {
            let Some(module) = self.modules.get_mut(id) else {
                continue;
            };
            let missing: Vec<String> = module
                .unresolved
                .iter()
                .map(|r| format!("error: unresolved symbol `{}` in kernel `{}`", r.symbol, r.kernel))
                .collect();
            module.build_log.extend(missing);
            if module.link_state != LinkState::FullyLinked || !module.unresolved.is_empty() {
                module.link_state = LinkState::LinkedPartially;
            }
        }
        let err = LinkError::Unresolved {
            count: remaining_total,
        };
        warn!(%err, "dynamic link failed");
        Err(err.into())
    }
}

#[derive(Clone, Debug)]
pub enum KernelArg {
    Buffer {
        allocation: Arc<GraphicsAllocation>,
        offset: u64,
    },
    Value(Vec<u8>),
}

/// Kernel payload header: group counts, group size, work dimensions.
const INDIRECT_DATA_HEADER: usize = 32;

/// A kernel instance with its launch configuration.
#[derive(Clone, Debug)]
pub struct Kernel {
    module: ModuleId,
    data: Arc<KernelImmutableData>,
    max_work_group_size: u32,
    group_size: [u32; 3],
    args: Vec<Option<KernelArg>>,
    printf_buffer: Option<Arc<GraphicsAllocation>>,
}

impl Kernel {
    pub fn new(module: ModuleId, data: Arc<KernelImmutableData>, max_work_group_size: u32) -> Self {
        let group_size = [data.simd_size.min(max_work_group_size).max(1), 1, 1];
        Self {
            module,
            args: vec![None; data.args.len()],
            data,
            max_work_group_size,
            group_size,
            printf_buffer: None,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn immutable_data(&self) -> &Arc<KernelImmutableData> {
        &self.data
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn group_size(&self) -> [u32; 3] {
        self.group_size
    }

    pub fn set_group_size(&mut self, x: u32, y: u32, z: u32) -> ZeResult<()> {
        let total = u64::from(x) * u64::from(y) * u64::from(z);
        if total == 0 || total > u64::from(self.max_work_group_size) {
            return Err(ZeError::InvalidArgument);
        }
        self.group_size = [x, y, z];
        Ok(())
    }

    pub fn set_arg_buffer(
        &mut self,
        index: usize,
        allocation: Arc<GraphicsAllocation>,
        offset: u64,
    ) -> ZeResult<()> {
        if !matches!(self.data.args.get(index), Some(ArgKind::Buffer)) {
            return Err(ZeError::InvalidArgument);
        }
        if offset > allocation.size() {
            return Err(ZeError::InvalidSize);
        }
        self.args[index] = Some(KernelArg::Buffer { allocation, offset });
        Ok(())
    }

    pub fn set_arg_value(&mut self, index: usize, bytes: &[u8]) -> ZeResult<()> {
        match self.data.args.get(index) {
            Some(ArgKind::Value { size }) if *size as usize == bytes.len() => {
                self.args[index] = Some(KernelArg::Value(bytes.to_vec()));
                Ok(())
            }
            Some(ArgKind::Value { .. }) => Err(ZeError::InvalidSize),
            _ => Err(ZeError::InvalidArgument),
        }
    }

    pub fn set_printf_buffer(&mut self, allocation: Arc<GraphicsAllocation>) {
        self.printf_buffer = Some(allocation);
    }

    pub fn printf_buffer(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.printf_buffer.as_ref()
    }

    pub fn args_complete(&self) -> bool {
        self.args.iter().all(Option::is_some)
    }

    /// Every allocation the kernel references: ISA, buffer arguments, printf buffer.
    pub fn allocations(&self) -> Vec<Arc<GraphicsAllocation>> {
        let mut out = vec![self.data.isa_allocation.clone()];
        for arg in self.args.iter().flatten() {
            if let KernelArg::Buffer { allocation, .. } = arg {
                out.push(allocation.clone());
            }
        }
        out.extend(self.printf_buffer.iter().cloned());
        out
    }

    /// `(gpu_address, size)` of each buffer argument, in argument order.
    pub fn surface_args(&self) -> Vec<(u64, u64)> {
        self.data
            .args
            .iter()
            .zip(&self.args)
            .filter(|(kind, _)| matches!(kind, ArgKind::Buffer))
            .map(|(_, arg)| match arg {
                Some(KernelArg::Buffer { allocation, offset }) => {
                    (allocation.gpu_address() + offset, allocation.size() - offset)
                }
                _ => (0, 0),
            })
            .collect()
    }

    fn arg_slot_size(kind: &ArgKind) -> usize {
        match kind {
            ArgKind::Buffer => 8,
            ArgKind::Value { size } => (*size as usize).div_ceil(8) * 8,
        }
    }

    pub fn indirect_data_size(&self) -> usize {
        let args: usize = self.data.args.iter().map(Self::arg_slot_size).sum();
        let printf = if self.printf_buffer.is_some() { 8 } else { 0 };
        let computed = INDIRECT_DATA_HEADER + args + printf;
        let size = computed.max(self.data.cross_thread_data_size as usize);
        size.div_ceil(32) * 32
    }

    /// Cross-thread payload for a dispatch of `group_count` groups.
    pub fn indirect_data(&self, group_count: [u32; 3]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.indirect_data_size());
        let work_dim = if self.group_size[2] > 1 || group_count[2] > 1 {
            3
        } else if self.group_size[1] > 1 || group_count[1] > 1 {
            2
        } else {
            1
        };
        let header: [u32; 8] = [
            group_count[0],
            group_count[1],
            group_count[2],
            self.group_size[0],
            self.group_size[1],
            self.group_size[2],
            work_dim,
            0,
        ];
        out.extend_from_slice(bytemuck::cast_slice(&header));
        for (kind, arg) in self.data.args.iter().zip(&self.args) {
            let start = out.len();
            match arg {
                Some(KernelArg::Buffer { allocation, offset }) => {
                    out.extend_from_slice(&(allocation.gpu_address() + offset).to_le_bytes());
                }
                Some(KernelArg::Value(bytes)) => out.extend_from_slice(bytes),
                None => {}
            }
            out.resize(start + Self::arg_slot_size(kind), 0);
        }
        if let Some(printf) = &self.printf_buffer {
            out.extend_from_slice(&printf.gpu_address().to_le_bytes());
        }
        out.resize(self.indirect_data_size(), 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::testing::RecordingDebugger;
    use crate::memory_manager::SimMemoryManager;
    use pretty_assertions::assert_eq;

    fn kernel_desc(name: &str) -> KernelDesc {
        KernelDesc {
            name: name.to_string(),
            isa: vec![0; 128],
            ..Default::default()
        }
    }

    fn isa_u64(module: &Module, kernel: &str, offset: usize) -> u64 {
        let isa = module.get_kernel_immutable_data(kernel).unwrap().isa();
        u64::from_le_bytes(isa[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn module_resolves_its_own_exports_at_creation() {
        let mm = SimMemoryManager::new();
        let mut registry = ModuleRegistry::new();
        let id = registry
            .create_module(
                ModuleDesc {
                    kernels: vec![kernel_desc("main"), kernel_desc("helper")],
                    exports: vec![SymbolExport {
                        name: "helper_fn".into(),
                        kernel: "helper".into(),
                        offset: 0x10,
                    }],
                    relocations: vec![Relocation {
                        symbol: "helper_fn".into(),
                        kernel: "main".into(),
                        offset: 8,
                        addend: 4,
                    }],
                    ..Default::default()
                },
                &mm,
            )
            .unwrap();

        let module = registry.get(id).unwrap();
        assert!(module.is_fully_linked());
        let helper = module.get_kernel_immutable_data("helper").unwrap();
        assert_eq!(isa_u64(module, "main", 8), helper.isa_gpu_address() + 0x14);
        assert_eq!(mm.live_allocations(), 2);
    }

    #[test]
    fn invalid_modules_fail_to_build() {
        let mm = SimMemoryManager::new();
        let mut registry = ModuleRegistry::new();
        let dup = ModuleDesc {
            kernels: vec![kernel_desc("k"), kernel_desc("k")],
            ..Default::default()
        };
        assert_eq!(
            registry.create_module(dup, &mm),
            Err(ZeError::ModuleBuildFailure)
        );

        mm.fail_next_allocations(1);
        let desc = ModuleDesc {
            kernels: vec![kernel_desc("k")],
            ..Default::default()
        };
        assert_eq!(
            registry.create_module(desc, &mm),
            Err(ZeError::OutOfDeviceMemory)
        );
        assert!(registry.is_empty());
    }

    fn importer(symbol: &str) -> ModuleDesc {
        ModuleDesc {
            kernels: vec![kernel_desc("user")],
            relocations: vec![Relocation {
                symbol: symbol.into(),
                kernel: "user".into(),
                offset: 0,
                addend: 0,
            }],
            ..Default::default()
        }
    }

    fn exporter(symbol: &str) -> ModuleDesc {
        ModuleDesc {
            kernels: vec![kernel_desc("lib")],
            exports: vec![SymbolExport {
                name: symbol.into(),
                kernel: "lib".into(),
                offset: 0x40,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn dynamic_link_patches_across_modules() {
        let mm = SimMemoryManager::new();
        let mut registry = ModuleRegistry::new();
        let user = registry.create_module(importer("lib_fn"), &mm).unwrap();
        let lib = registry.create_module(exporter("lib_fn"), &mm).unwrap();
        assert_eq!(registry.get(user).unwrap().link_state(), LinkState::Unlinked);

        let debugger = RecordingDebugger::default();
        registry
            .perform_dynamic_link(&[user, lib], Some(&debugger))
            .unwrap();

        let lib_addr = registry
            .get(lib)
            .unwrap()
            .get_kernel_immutable_data("lib")
            .unwrap()
            .isa_gpu_address();
        let user_module = registry.get(user).unwrap();
        assert!(user_module.is_fully_linked());
        assert_eq!(isa_u64(user_module, "user", 0), lib_addr + 0x40);
        assert_eq!(
            *debugger.patched.lock().unwrap(),
            vec![(user, "user".to_string())]
        );
    }

    #[test]
    fn partial_link_is_a_barrier_across_participants() {
        let mm = SimMemoryManager::new();
        let mut registry = ModuleRegistry::new();
        let a = registry.create_module(importer("present"), &mm).unwrap();
        let b = registry.create_module(importer("missing"), &mm).unwrap();
        let lib = registry.create_module(exporter("present"), &mm).unwrap();

        assert_eq!(
            registry.perform_dynamic_link(&[a, b, lib], None),
            Err(ZeError::ModuleLinkFailure)
        );
        assert_eq!(registry.get(a).unwrap().link_state(), LinkState::LinkedPartially);
        assert_eq!(registry.get(b).unwrap().link_state(), LinkState::LinkedPartially);
        assert!(registry.get(a).unwrap().unresolved_externals().is_empty());
        assert!(registry
            .get(b)
            .unwrap()
            .build_log()
            .contains("unresolved symbol `missing`"));
        assert_eq!(registry.get(lib).unwrap().link_state(), LinkState::FullyLinked);

        assert_eq!(
            registry.perform_dynamic_link(&[ModuleId(99)], None),
            Err(ZeError::InvalidArgument)
        );
    }

    #[test]
    fn kernel_arguments_and_payload() {
        let mm = SimMemoryManager::new();
        let mut registry = ModuleRegistry::new();
        let id = registry
            .create_module(
                ModuleDesc {
                    kernels: vec![KernelDesc {
                        name: "k".into(),
                        args: vec![ArgKind::Buffer, ArgKind::Value { size: 4 }],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                &mm,
            )
            .unwrap();
        let data = registry.get(id).unwrap().kernels()[0].clone();
        let mut kernel = Kernel::new(id, data, 1024);
        assert!(!kernel.args_complete());

        let buf = mm
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                256,
                AllocationType::Buffer,
            ))
            .unwrap();
        assert_eq!(
            kernel.set_arg_value(0, &[0; 4]),
            Err(ZeError::InvalidArgument)
        );
        assert_eq!(kernel.set_arg_value(1, &[0; 2]), Err(ZeError::InvalidSize));
        kernel.set_arg_buffer(0, buf.clone(), 16).unwrap();
        kernel.set_arg_value(1, &7u32.to_le_bytes()).unwrap();
        assert!(kernel.args_complete());
        assert_eq!(kernel.set_group_size(0, 1, 1), Err(ZeError::InvalidArgument));
        assert_eq!(kernel.set_group_size(2048, 1, 1), Err(ZeError::InvalidArgument));
        kernel.set_group_size(64, 2, 1).unwrap();

        assert_eq!(kernel.surface_args(), vec![(buf.gpu_address() + 16, 240)]);
        let payload = kernel.indirect_data([4, 1, 1]);
        assert_eq!(payload.len(), kernel.indirect_data_size());
        assert_eq!(payload.len(), 64);
        let words: &[u32] = bytemuck::cast_slice(&payload[..32]);
        assert_eq!(words, &[4, 1, 1, 64, 2, 1, 2, 0]);
        assert_eq!(
            u64::from_le_bytes(payload[32..40].try_into().unwrap()),
            buf.gpu_address() + 16
        );
        assert_eq!(&payload[40..44], &7u32.to_le_bytes());
        assert_eq!(kernel.allocations().len(), 2);
    }

    #[test]
    fn destroy_frees_instruction_segments() {
        let mm = SimMemoryManager::new();
        let mut registry = ModuleRegistry::new();
        let desc = ModuleDesc {
            kernels: vec![kernel_desc("a"), kernel_desc("b")],
            ..Default::default()
        };
        let id = registry.create_module(desc.clone(), &mm).unwrap();
        registry.create_module(desc, &mm).unwrap();
        assert_eq!(mm.live_allocations(), 4);

        registry.destroy(id, &mm).unwrap();
        assert_eq!(mm.live_allocations(), 2);
        assert_eq!(registry.destroy(id, &mm), Err(ZeError::InvalidArgument));
        registry.destroy_all(&mm);
        assert!(registry.is_empty());
        assert_eq!(mm.live_allocations(), 0);
    }
}
