use std::collections::TryReserveError;
use std::path::PathBuf;

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("layer not present: {0}")]
    LayerNotPresent(String),

    #[error("extension not present: {0}")]
    ExtensionNotPresent(String),

    #[error("incompatible driver: {0}")]
    IncompatibleDriver(String),

    #[error("forced-on layer {0} was not found and VK_LOADER_LAYERS_EXIT_ON_MISSING is set")]
    MissingForcedLayer(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("function not supported: {0}")]
    FunctionNotSupported(String),

    #[error("manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TryReserveError> for CoreError {
    fn from(_: TryReserveError) -> Self {
        CoreError::OutOfHostMemory
    }
}

impl CoreError {
    /// The API result code a caller observes for this error.
    pub fn vk_result(&self) -> vk::Result {
        match self {
            CoreError::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            CoreError::LayerNotPresent(_) | CoreError::MissingForcedLayer(_) => {
                vk::Result::ERROR_LAYER_NOT_PRESENT
            }
            CoreError::ExtensionNotPresent(_) | CoreError::FunctionNotSupported(_) => {
                vk::Result::ERROR_EXTENSION_NOT_PRESENT
            }
            CoreError::IncompatibleDriver(_) => vk::Result::ERROR_INCOMPATIBLE_DRIVER,
            CoreError::InitializationFailed(_)
            | CoreError::InvalidHandle(_)
            | CoreError::Manifest { .. }
            | CoreError::Json(_)
            | CoreError::Io(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
        }
    }

    pub fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CoreError::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Append with fallible allocation, so exhaustion surfaces as
/// [`CoreError::OutOfHostMemory`] instead of aborting.
pub fn try_push<T>(list: &mut Vec<T>, item: T) -> Result<(), CoreError> {
    list.try_reserve(1)?;
    list.push(item);
    Ok(())
}
