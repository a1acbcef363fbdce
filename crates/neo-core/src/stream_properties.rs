//! Dirty tracking for expensive hardware state.
//!
//! Every state-transition record (`STATE_BASE_ADDRESS`, `STATE_COMPUTE_MODE`, `CFE_STATE`,
//! `PIPELINE_SELECT`) has an aggregate here. Setting a field to the value it already holds is a
//! no-op; only a real change marks the aggregate dirty. The owner emits the record when the
//! aggregate is dirty and then calls `clear_is_dirty` exactly once.
//!
//! Fields the hardware family does not support are never set, so they stay unset and can never
//! cause a record to be emitted.

/// A scalar with an "unset" sentinel (`None`) and a dirty bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamProperty<T> {
    value: Option<T>,
    is_dirty: bool,
}

impl<T> Default for StreamProperty<T> {
    fn default() -> Self {
        Self {
            value: None,
            is_dirty: false,
        }
    }
}

impl<T: Copy + PartialEq> StreamProperty<T> {
    /// Unset input is ignored.
    pub fn set(&mut self, value: Option<T>) {
        if let Some(value) = value {
            if self.value != Some(value) {
                self.value = Some(value);
                self.is_dirty = true;
            }
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn clear_is_dirty(&mut self) {
        self.is_dirty = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ThreadArbitrationPolicy {
    #[default]
    AgeBased = 0,
    RoundRobin = 1,
    RoundRobinAfterDependency = 2,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PreemptionMode {
    Disabled = 0,
    MidBatch = 1,
    #[default]
    ThreadGroup = 2,
    MidThread = 3,
}

/// Which stream-property fields the hardware family programs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamPropertiesSupport {
    pub coherency_required: bool,
    pub large_grf_mode: bool,
    pub thread_arbitration_policy: bool,
    pub device_preemption_mode: bool,

    pub disable_eu_fusion: bool,
    pub compute_dispatch_all_walker: bool,
    pub single_slice_dispatch_ccs_mode: bool,
    pub disable_overdispatch: bool,

    pub systolic_mode: bool,
    pub media_sampler_dop_clock_gate: bool,

    pub dynamic_state_heap: bool,
    pub binding_table_pool: bool,
    pub global_atomics: bool,
}

macro_rules! property_set {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl $ty {
            pub fn init_support(&mut self, support: StreamPropertiesSupport) {
                self.support = support;
            }

            pub fn is_dirty(&self) -> bool {
                false $(|| self.$field.is_dirty())+
            }

            pub fn clear_is_dirty(&mut self) {
                $(self.$field.clear_is_dirty();)+
            }

            /// Take every set value of `other`; only real changes dirty `self`.
            pub fn copy_properties_all(&mut self, other: &Self) {
                $(self.$field.set(other.$field.get());)+
            }

            /// Names of the dirty fields, for diagnostics.
            pub fn dirty_fields(&self) -> Vec<&'static str> {
                let mut fields = Vec::new();
                $(
                    if self.$field.is_dirty() {
                        fields.push(stringify!($field));
                    }
                )+
                fields
            }

            /// Forget every value, keeping the capability flags.
            pub fn reset_state(&mut self) {
                $(self.$field.reset();)+
            }

            /// Whether any field holds a value.
            pub fn is_set(&self) -> bool {
                false $(|| self.$field.get().is_some())+
            }
        }
    };
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateComputeModeProperties {
    pub is_coherency_required: StreamProperty<bool>,
    pub large_grf_mode: StreamProperty<bool>,
    pub thread_arbitration_policy: StreamProperty<ThreadArbitrationPolicy>,
    pub device_preemption_mode: StreamProperty<PreemptionMode>,
    support: StreamPropertiesSupport,
}

property_set!(StateComputeModeProperties {
    is_coherency_required,
    large_grf_mode,
    thread_arbitration_policy,
    device_preemption_mode,
});

impl StateComputeModeProperties {
    pub fn set_properties_all(
        &mut self,
        requires_coherency: bool,
        large_grf: bool,
        thread_arbitration_policy: ThreadArbitrationPolicy,
        preemption_mode: PreemptionMode,
    ) {
        let s = self.support;
        self.is_coherency_required
            .set(s.coherency_required.then_some(requires_coherency));
        self.large_grf_mode.set(s.large_grf_mode.then_some(large_grf));
        self.thread_arbitration_policy
            .set(s.thread_arbitration_policy.then_some(thread_arbitration_policy));
        self.device_preemption_mode
            .set(s.device_preemption_mode.then_some(preemption_mode));
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrontEndProperties {
    pub disable_eu_fusion: StreamProperty<bool>,
    pub compute_dispatch_all_walker_enable: StreamProperty<bool>,
    pub single_slice_dispatch_ccs_mode: StreamProperty<bool>,
    pub disable_overdispatch: StreamProperty<bool>,
    support: StreamPropertiesSupport,
}

property_set!(FrontEndProperties {
    disable_eu_fusion,
    compute_dispatch_all_walker_enable,
    single_slice_dispatch_ccs_mode,
    disable_overdispatch,
});

impl FrontEndProperties {
    pub fn set_properties_all(
        &mut self,
        disable_eu_fusion: bool,
        compute_dispatch_all_walker: bool,
        single_slice_dispatch: bool,
    ) {
        let s = self.support;
        self.disable_eu_fusion
            .set(s.disable_eu_fusion.then_some(disable_eu_fusion));
        self.compute_dispatch_all_walker_enable
            .set(s.compute_dispatch_all_walker.then_some(compute_dispatch_all_walker));
        self.single_slice_dispatch_ccs_mode
            .set(s.single_slice_dispatch_ccs_mode.then_some(single_slice_dispatch));
        self.disable_overdispatch
            .set(s.disable_overdispatch.then_some(true));
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineSelectProperties {
    pub mode_selected: StreamProperty<bool>,
    pub systolic_mode: StreamProperty<bool>,
    pub media_sampler_dop_clock_gate: StreamProperty<bool>,
    support: StreamPropertiesSupport,
}

property_set!(PipelineSelectProperties {
    mode_selected,
    systolic_mode,
    media_sampler_dop_clock_gate,
});

impl PipelineSelectProperties {
    pub fn set_properties_all(&mut self, systolic_mode: bool, media_sampler_dop_clock_gate: bool) {
        let s = self.support;
        self.mode_selected.set(Some(true));
        self.systolic_mode.set(s.systolic_mode.then_some(systolic_mode));
        self.media_sampler_dop_clock_gate
            .set(s.media_sampler_dop_clock_gate.then_some(media_sampler_dop_clock_gate));
    }
}

/// Heap bases and sizes as seen by the next dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapBinding {
    pub base: u64,
    pub size: u32,
}

/// Inputs of [`StateBaseAddressProperties::set_properties_all`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateBaseAddressInputs {
    pub surface_state: Option<HeapBinding>,
    /// `None` on families without a dynamic-state heap; that is a valid state, not an error.
    pub dynamic_state: Option<HeapBinding>,
    pub indirect_object: Option<HeapBinding>,
    pub stateless_mocs: u32,
    pub global_atomics: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateBaseAddressProperties {
    pub surface_state_base_address: StreamProperty<u64>,
    pub surface_state_size: StreamProperty<u32>,
    pub dynamic_state_base_address: StreamProperty<u64>,
    pub dynamic_state_size: StreamProperty<u32>,
    pub indirect_object_base_address: StreamProperty<u64>,
    pub indirect_object_size: StreamProperty<u32>,
    pub binding_table_pool_base_address: StreamProperty<u64>,
    pub binding_table_pool_size: StreamProperty<u32>,
    pub stateless_mocs: StreamProperty<u32>,
    pub global_atomics: StreamProperty<bool>,
    support: StreamPropertiesSupport,
}

property_set!(StateBaseAddressProperties {
    surface_state_base_address,
    surface_state_size,
    dynamic_state_base_address,
    dynamic_state_size,
    indirect_object_base_address,
    indirect_object_size,
    binding_table_pool_base_address,
    binding_table_pool_size,
    stateless_mocs,
    global_atomics,
});

impl StateBaseAddressProperties {
    pub fn set_properties_all(&mut self, inputs: &StateBaseAddressInputs) {
        let s = self.support;
        if let Some(ssh) = inputs.surface_state {
            self.surface_state_base_address.set(Some(ssh.base));
            self.surface_state_size.set(Some(ssh.size));
            if s.binding_table_pool {
                self.binding_table_pool_base_address.set(Some(ssh.base));
                self.binding_table_pool_size.set(Some(ssh.size));
            }
        }
        if s.dynamic_state_heap {
            if let Some(dsh) = inputs.dynamic_state {
                self.dynamic_state_base_address.set(Some(dsh.base));
                self.dynamic_state_size.set(Some(dsh.size));
            }
        }
        if let Some(ioh) = inputs.indirect_object {
            self.indirect_object_base_address.set(Some(ioh.base));
            self.indirect_object_size.set(Some(ioh.size));
        }
        self.stateless_mocs.set(Some(inputs.stateless_mocs));
        self.global_atomics
            .set(s.global_atomics.then_some(inputs.global_atomics));
    }
}

/// The four aggregates tracked by a command list (required and final state) and by a CSR
/// (live state).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamProperties {
    pub state_compute_mode: StateComputeModeProperties,
    pub front_end_state: FrontEndProperties,
    pub pipeline_select: PipelineSelectProperties,
    pub state_base_address: StateBaseAddressProperties,
}

impl StreamProperties {
    pub fn new(support: StreamPropertiesSupport) -> Self {
        let mut props = Self::default();
        props.init_support(support);
        props
    }

    pub fn init_support(&mut self, support: StreamPropertiesSupport) {
        self.state_compute_mode.init_support(support);
        self.front_end_state.init_support(support);
        self.pipeline_select.init_support(support);
        self.state_base_address.init_support(support);
    }

    pub fn reset_state(&mut self) {
        self.state_compute_mode.reset_state();
        self.front_end_state.reset_state();
        self.pipeline_select.reset_state();
        self.state_base_address.reset_state();
    }

    pub fn copy_properties_all(&mut self, other: &Self) {
        self.state_compute_mode
            .copy_properties_all(&other.state_compute_mode);
        self.front_end_state
            .copy_properties_all(&other.front_end_state);
        self.pipeline_select
            .copy_properties_all(&other.pipeline_select);
        self.state_base_address
            .copy_properties_all(&other.state_base_address);
    }

    pub fn is_dirty(&self) -> bool {
        self.state_compute_mode.is_dirty()
            || self.front_end_state.is_dirty()
            || self.pipeline_select.is_dirty()
            || self.state_base_address.is_dirty()
    }

    pub fn clear_is_dirty(&mut self) {
        self.state_compute_mode.clear_is_dirty();
        self.front_end_state.clear_is_dirty();
        self.pipeline_select.clear_is_dirty();
        self.state_base_address.clear_is_dirty();
    }
}
