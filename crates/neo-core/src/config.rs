use std::time::Duration;

use crate::pause::PauseConfig;
use crate::stream_properties::PreemptionMode;

const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("active_partitions={active_partitions} exceeds the {max} tag slots")]
    TooManyPartitions { active_partitions: u32, max: u32 },
    #[error("partition_tag_offset={offset} must be a non-zero multiple of 4 of at most {max}")]
    PartitionTagOffset { offset: u32, max: u32 },
    #[error("{field}={size} is smaller than the minimum of {min} bytes")]
    TooSmall {
        field: &'static str,
        size: usize,
        min: usize,
    },
}

/// Immutable driver configuration, built once and shared by every object of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// `None` waits forever.
    pub wait_timeout: Option<Duration>,
    pub wait_spin_iterations: u32,
    pub wait_backoff_max: Duration,
    /// Upper bound on how long `Drop` of a CSR waits for outstanding work.
    pub cleanup_wait_timeout: Duration,
    /// Submissions do not program the tag update; it is flushed separately when a wait needs it.
    pub update_tag_from_wait: bool,

    pub active_partitions: u32,
    /// Bytes between the tag slots of consecutive partitions.
    pub partition_tag_offset: u32,

    pub command_buffer_size: usize,
    pub min_command_stream_space: usize,
    pub csr_command_stream_size: usize,

    pub surface_state_heap_size: usize,
    pub dynamic_state_heap_size: usize,
    pub indirect_object_heap_size: usize,

    pub max_copy_dispatch_size: u64,
    pub stateless_mocs: u32,

    pub pause_on_enqueue: Option<PauseConfig>,
    pub skip_resource_cleanup: bool,
    pub force_dc_flush: bool,
    pub force_pipeline_select_on_every_list: bool,
    pub preemption_mode: PreemptionMode,
    pub disable_eu_fusion: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            wait_timeout: None,
            wait_spin_iterations: 64,
            wait_backoff_max: Duration::from_millis(1),
            cleanup_wait_timeout: Duration::from_secs(5),
            update_tag_from_wait: false,
            active_partitions: 1,
            partition_tag_offset: 16,
            command_buffer_size: 64 * 1024,
            min_command_stream_space: 1024,
            csr_command_stream_size: 64 * 1024,
            surface_state_heap_size: 64 * 1024,
            dynamic_state_heap_size: 64 * 1024,
            indirect_object_heap_size: 64 * 1024,
            max_copy_dispatch_size: 4 * 1024 * 1024 * 1024,
            stateless_mocs: 2,
            pause_on_enqueue: None,
            skip_resource_cleanup: false,
            force_dc_flush: false,
            force_pipeline_select_on_every_list: false,
            preemption_mode: PreemptionMode::ThreadGroup,
            disable_eu_fusion: false,
        }
    }
}

impl DriverConfig {
    /// Maximum number of partition tag slots in a tag allocation.
    pub const MAX_PARTITIONS: u32 = 8;
    /// Partition tag slots must stay below the pause slot of the tag allocation.
    pub const MAX_PARTITION_TAG_OFFSET: u32 = 256;

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("command_buffer_size", self.command_buffer_size),
            ("csr_command_stream_size", self.csr_command_stream_size),
            ("surface_state_heap_size", self.surface_state_heap_size),
            ("dynamic_state_heap_size", self.dynamic_state_heap_size),
            ("indirect_object_heap_size", self.indirect_object_heap_size),
            ("max_copy_dispatch_size", self.max_copy_dispatch_size as usize),
            ("active_partitions", self.active_partitions as usize),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.active_partitions > Self::MAX_PARTITIONS {
            return Err(ConfigError::TooManyPartitions {
                active_partitions: self.active_partitions,
                max: Self::MAX_PARTITIONS,
            });
        }
        if self.partition_tag_offset == 0
            || self.partition_tag_offset % 4 != 0
            || self.partition_tag_offset > Self::MAX_PARTITION_TAG_OFFSET
        {
            return Err(ConfigError::PartitionTagOffset {
                offset: self.partition_tag_offset,
                max: Self::MAX_PARTITION_TAG_OFFSET,
            });
        }
        let min = self.min_command_stream_space.max(256);
        for (field, size) in [
            ("command_buffer_size", self.command_buffer_size),
            ("csr_command_stream_size", self.csr_command_stream_size),
        ] {
            if size < min {
                return Err(ConfigError::TooSmall { field, size, min });
            }
        }
        Ok(())
    }

    /// Surface-state heaps are reserved in whole pages.
    pub fn surface_state_heap_reserved_size(&self) -> usize {
        neo_cmd::align_up(self.surface_state_heap_size as u64, PAGE_SIZE as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_sizes_and_partitions() {
        let cfg = DriverConfig {
            indirect_object_heap_size: 0,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero {
                field: "indirect_object_heap_size"
            })
        );

        let cfg = DriverConfig {
            active_partitions: 0,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero {
                field: "active_partitions"
            })
        );

        let cfg = DriverConfig {
            active_partitions: 9,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooManyPartitions { .. })
        ));

        let cfg = DriverConfig {
            partition_tag_offset: 6,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PartitionTagOffset { offset: 6, .. })
        ));
    }

    #[test]
    fn surface_state_heap_is_page_aligned() {
        let cfg = DriverConfig {
            surface_state_heap_size: 5000,
            ..Default::default()
        };
        assert_eq!(cfg.surface_state_heap_reserved_size(), 8192);
    }
}
