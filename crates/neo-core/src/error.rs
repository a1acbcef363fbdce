use neo_cmd::ArenaError;

use crate::allocation::ReleaseError;

/// Non-success outcome of a driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ZeError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid enumeration")]
    InvalidEnumeration,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("module build failure")]
    ModuleBuildFailure,
    #[error("module link failure")]
    ModuleLinkFailure,
    #[error("kernel belongs to a module that is not fully linked")]
    InvalidModuleUnlinked,
    #[error("unsupported feature")]
    UnsupportedFeature,
    #[error("device lost")]
    DeviceLost,
    #[error("uninitialized")]
    Uninitialized,
    #[error("not ready")]
    NotReady,
    #[error("invalid size")]
    InvalidSize,
    #[error("invalid null handle")]
    InvalidNullHandle,
}

pub type ZeResult<T> = Result<T, ZeError>;

/// Closed result-code enumeration of the C-style API surface.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    NotReady = 1,
    DeviceLost = 0x7000_0001,
    OutOfHostMemory = 0x7000_0002,
    OutOfDeviceMemory = 0x7000_0003,
    ModuleBuildFailure = 0x7000_0004,
    ModuleLinkFailure = 0x7000_0005,
    Uninitialized = 0x7800_0001,
    UnsupportedFeature = 0x7800_0003,
    InvalidArgument = 0x7800_0004,
    InvalidNullHandle = 0x7800_0005,
    InvalidSize = 0x7800_0008,
    InvalidEnumeration = 0x7800_000C,
    InvalidModuleUnlinked = 0x7800_0019,
}

impl From<ZeError> for ResultCode {
    fn from(err: ZeError) -> Self {
        match err {
            ZeError::InvalidArgument => ResultCode::InvalidArgument,
            ZeError::InvalidEnumeration => ResultCode::InvalidEnumeration,
            ZeError::OutOfDeviceMemory => ResultCode::OutOfDeviceMemory,
            ZeError::OutOfHostMemory => ResultCode::OutOfHostMemory,
            ZeError::ModuleBuildFailure => ResultCode::ModuleBuildFailure,
            ZeError::ModuleLinkFailure => ResultCode::ModuleLinkFailure,
            ZeError::InvalidModuleUnlinked => ResultCode::InvalidModuleUnlinked,
            ZeError::UnsupportedFeature => ResultCode::UnsupportedFeature,
            ZeError::DeviceLost => ResultCode::DeviceLost,
            ZeError::Uninitialized => ResultCode::Uninitialized,
            ZeError::NotReady => ResultCode::NotReady,
            ZeError::InvalidSize => ResultCode::InvalidSize,
            ZeError::InvalidNullHandle => ResultCode::InvalidNullHandle,
        }
    }
}

impl<T> From<&ZeResult<T>> for ResultCode {
    fn from(result: &ZeResult<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(err) => (*err).into(),
        }
    }
}

// Arena overflow only happens when a size estimate was wrong; the container always reserves
// space before encoding.
impl From<ArenaError> for ZeError {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::OutOfSpace { .. } => ZeError::OutOfHostMemory,
            ArenaError::PatchOutOfBounds { .. } | ArenaError::PatchOpcodeMismatch { .. } => {
                ZeError::InvalidArgument
            }
        }
    }
}

impl From<ReleaseError> for ZeError {
    fn from(err: ReleaseError) -> Self {
        match err {
            ReleaseError::StillInUse { .. } => ZeError::NotReady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_from_result() {
        let ok: ZeResult<u32> = Ok(7);
        assert_eq!(ResultCode::from(&ok), ResultCode::Success);

        let err: ZeResult<u32> = Err(ZeError::ModuleLinkFailure);
        assert_eq!(ResultCode::from(&err), ResultCode::ModuleLinkFailure);
        assert_eq!(ResultCode::from(ZeError::DeviceLost) as u32, 0x7000_0001);
    }

    #[test]
    fn arena_overflow_maps_to_host_memory() {
        let err = ArenaError::OutOfSpace {
            requested: 32,
            remaining: 8,
        };
        assert_eq!(ZeError::from(err), ZeError::OutOfHostMemory);
    }
}
