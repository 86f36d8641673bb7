use std::path::PathBuf;

use ash::vk;
use vkchain_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("failed to open {path}: {source}")]
    Library {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("{path} does not export {symbol}")]
    MissingSymbol { path: PathBuf, symbol: String },

    #[error("no library registered for {0}")]
    Unavailable(PathBuf),

    #[error("{call} returned {result:?}")]
    Vulkan { call: &'static str, result: vk::Result },
}

impl LoaderError {
    /// The API result code a caller observes for this error.
    pub fn vk_result(&self) -> vk::Result {
        match self {
            LoaderError::Core(e) => e.vk_result(),
            LoaderError::Library { .. } | LoaderError::MissingSymbol { .. } | LoaderError::Unavailable(_) => {
                vk::Result::ERROR_INCOMPATIBLE_DRIVER
            }
            LoaderError::Vulkan { result, .. } => *result,
        }
    }

    pub fn invalid_handle(what: impl Into<String>) -> Self {
        LoaderError::Core(CoreError::InvalidHandle(what.into()))
    }

    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        LoaderError::Vulkan { call, result }
    }
}
