//! The device: one encoder, one CSR per engine group, the reuse pool, the module registry and
//! the built-in kernels. Command lists and queues hold a [`Device`] handle, so the device
//! outlives everything recorded against it.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::allocation::{AllocationType, GraphicsAllocation, OsContextId};
use crate::allocation_storage::{ContextRegistry, InternalAllocationStorage};
use crate::backend::SubmissionBackend;
use crate::builtins::Builtins;
use crate::command_container::ContainerResources;
use crate::config::DriverConfig;
use crate::csr::{CommandStreamReceiver, CsrCreateArgs};
use crate::debugger::DebuggerNotify;
use crate::error::{ZeError, ZeResult};
use crate::event::EventPool;
use crate::hw::{encoder_for, CommandEncoder, HwCaps, HwFamily, HwInfo};
use crate::memory_manager::{AllocationProperties, MemoryManager};
use crate::module::{Kernel, ModuleDesc, ModuleId, ModuleRegistry};
use crate::pause::OperatorIo;
use crate::stats::SubmissionStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineGroupType {
    Compute,
    Copy,
}

impl EngineGroupType {
    pub const ALL: [EngineGroupType; 2] = [EngineGroupType::Compute, EngineGroupType::Copy];

    /// OS context the engine group submits on.
    pub fn context(self) -> OsContextId {
        match self {
            EngineGroupType::Compute => OsContextId(0),
            EngineGroupType::Copy => OsContextId(1),
        }
    }
}

pub struct DeviceDescriptor {
    pub family: HwFamily,
    pub config: DriverConfig,
    pub debugger: Option<Arc<dyn DebuggerNotify>>,
    /// Operator of the debug pause thread; stdin/stdout when `None`.
    pub operator: Option<Arc<dyn OperatorIo>>,
}

impl DeviceDescriptor {
    pub fn new(family: HwFamily) -> Self {
        Self {
            family,
            config: DriverConfig::default(),
            debugger: None,
            operator: None,
        }
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }
}

struct DeviceInner {
    encoder: &'static dyn CommandEncoder,
    config: Arc<DriverConfig>,
    memory_manager: Arc<dyn MemoryManager>,
    stats: Arc<SubmissionStats>,
    resources: ContainerResources,
    csrs: Vec<Arc<CommandStreamReceiver>>,
    modules: RwLock<ModuleRegistry>,
    builtins: Builtins,
    debugger: Option<Arc<dyn DebuggerNotify>>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        // CSRs wait for their outstanding work before anything they may reference is freed.
        self.csrs.clear();
        self.modules
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .destroy_all(self.memory_manager.as_ref());
        self.resources.reuse_pool.free_all();
        debug!(family = ?self.encoder.family(), "device destroyed");
    }
}

/// Shared handle to a device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// `backend_for` supplies the submission backend of each engine group the family has.
    pub fn new<F>(
        desc: DeviceDescriptor,
        memory_manager: Arc<dyn MemoryManager>,
        mut backend_for: F,
    ) -> ZeResult<Self>
    where
        F: FnMut(EngineGroupType) -> Arc<dyn SubmissionBackend>,
    {
        if let Err(err) = desc.config.validate() {
            warn!(%err, "invalid driver configuration");
            return Err(ZeError::InvalidArgument);
        }
        let encoder = encoder_for(desc.family);
        let hw_info = encoder.hw_info();
        if desc.config.active_partitions > hw_info.max_partitions {
            warn!(
                active_partitions = desc.config.active_partitions,
                max = hw_info.max_partitions,
                "more partitions than the family supports"
            );
            return Err(ZeError::InvalidArgument);
        }

        let config = Arc::new(desc.config);
        let stats = Arc::new(SubmissionStats::new());
        let registry = Arc::new(ContextRegistry::new());

        let mut csrs = Vec::new();
        for engine in EngineGroupType::ALL {
            if engine == EngineGroupType::Copy && !hw_info.caps.contains(HwCaps::BLITTER) {
                continue;
            }
            csrs.push(CommandStreamReceiver::new(CsrCreateArgs {
                context: engine.context(),
                engine,
                encoder,
                config: config.clone(),
                memory_manager: memory_manager.clone(),
                backend: backend_for(engine),
                registry: registry.clone(),
                stats: stats.clone(),
                operator: desc.operator.clone(),
            })?);
        }

        let resources = ContainerResources {
            config: config.clone(),
            memory_manager: memory_manager.clone(),
            reuse_pool: Arc::new(InternalAllocationStorage::new(memory_manager.clone())),
            completion: registry,
            stats: stats.clone(),
        };

        let mut modules = ModuleRegistry::new();
        let builtins = Builtins::create(&mut modules, memory_manager.as_ref())?;

        debug!(family = ?desc.family, engines = csrs.len(), "device created");
        Ok(Self {
            inner: Arc::new(DeviceInner {
                encoder,
                config,
                memory_manager,
                stats,
                resources,
                csrs,
                modules: RwLock::new(modules),
                builtins,
                debugger: desc.debugger,
            }),
        })
    }

    pub fn encoder(&self) -> &'static dyn CommandEncoder {
        self.inner.encoder
    }

    pub fn hw_info(&self) -> &'static HwInfo {
        self.inner.encoder.hw_info()
    }

    pub fn config(&self) -> &Arc<DriverConfig> {
        &self.inner.config
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.inner.memory_manager
    }

    pub fn stats(&self) -> &Arc<SubmissionStats> {
        &self.inner.stats
    }

    pub fn container_resources(&self) -> &ContainerResources {
        &self.inner.resources
    }

    pub fn builtins(&self) -> &Builtins {
        &self.inner.builtins
    }

    pub fn debugger(&self) -> Option<&dyn DebuggerNotify> {
        self.inner.debugger.as_deref()
    }

    pub fn engines(&self) -> impl Iterator<Item = EngineGroupType> + '_ {
        self.inner.csrs.iter().map(|csr| csr.engine())
    }

    /// CSR of `engine`; `InvalidEnumeration` when the family has no such engine.
    pub fn csr(&self, engine: EngineGroupType) -> ZeResult<&Arc<CommandStreamReceiver>> {
        self.inner
            .csrs
            .iter()
            .find(|csr| csr.engine() == engine)
            .ok_or(ZeError::InvalidEnumeration)
    }

    pub fn module_registry(&self) -> RwLockReadGuard<'_, ModuleRegistry> {
        self.inner
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn module_registry_mut(&self) -> RwLockWriteGuard<'_, ModuleRegistry> {
        self.inner
            .modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_module(&self, desc: ModuleDesc) -> ZeResult<ModuleId> {
        let mut modules = self.module_registry_mut();
        let id = modules.create_module(desc, self.inner.memory_manager.as_ref())?;
        if let (Some(debugger), Some(module)) = (self.debugger(), modules.get(id)) {
            debugger.module_loaded(id, &module.isa_allocations());
        }
        Ok(id)
    }

    pub fn destroy_module(&self, id: ModuleId) -> ZeResult<()> {
        if id == self.inner.builtins.module() {
            return Err(ZeError::InvalidArgument);
        }
        self.module_registry_mut()
            .destroy(id, self.inner.memory_manager.as_ref())
    }

    pub fn perform_dynamic_link(&self, ids: &[ModuleId]) -> ZeResult<()> {
        self.module_registry_mut()
            .perform_dynamic_link(ids, self.debugger())
    }

    pub fn is_module_fully_linked(&self, id: ModuleId) -> bool {
        self.module_registry()
            .get(id)
            .is_some_and(|module| module.is_fully_linked())
    }

    pub fn create_kernel(&self, module: ModuleId, name: &str) -> ZeResult<Kernel> {
        let modules = self.module_registry();
        let data = modules
            .get(module)
            .ok_or(ZeError::InvalidArgument)?
            .get_kernel_immutable_data(name)
            .ok_or(ZeError::InvalidArgument)?
            .clone();
        Ok(Kernel::new(module, data, self.hw_info().max_work_group_size))
    }

    pub fn get_native_binary(&self, module: ModuleId) -> ZeResult<Vec<u8>> {
        self.module_registry()
            .get(module)
            .map(|m| m.get_native_binary().to_vec())
            .ok_or(ZeError::InvalidArgument)
    }

    pub fn get_debug_info(&self, module: ModuleId) -> ZeResult<Option<Vec<u8>>> {
        self.module_registry()
            .get(module)
            .map(|m| m.get_debug_info().map(<[u8]>::to_vec))
            .ok_or(ZeError::InvalidArgument)
    }

    pub fn module_build_log(&self, module: ModuleId) -> ZeResult<String> {
        self.module_registry()
            .get(module)
            .map(|m| m.build_log())
            .ok_or(ZeError::InvalidArgument)
    }

    /// Device memory for kernel arguments and copy targets.
    pub fn allocate(&self, size: u64, allocation_type: AllocationType) -> ZeResult<Arc<GraphicsAllocation>> {
        if size == 0 {
            return Err(ZeError::InvalidSize);
        }
        self.inner
            .memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(size, allocation_type))
            .ok_or(ZeError::OutOfDeviceMemory)
    }

    pub fn create_event_pool(&self, count: u32, timestamp: bool) -> ZeResult<Arc<EventPool>> {
        EventPool::create(self.inner.memory_manager.clone(), count, timestamp)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("family", &self.inner.encoder.family())
            .field("csrs", &self.inner.csrs)
            .finish_non_exhaustive()
    }
}
