//! The contract between the chain builder and anything that can sit in a
//! dispatch chain.
//!
//! Building a chain is a request/response handshake. The builder creates the
//! bottom link first, then hands it to each layer from last to first; every
//! layer answers with its own link, which becomes the `next` of the layer
//! above. A slot is then resolved by asking the top link, which either answers
//! with its own entry point or forwards the question to `next`.
//!
//! Layers loaded as native code take part through their create call instead:
//! they receive the lookup functions of the link below them in the create
//! info, and are asked for slots only once the object exists.

use std::ffi::c_char;
use std::sync::Arc;

use ash::vk;

use crate::error::CoreError;

/// An untyped API entry point. `None` means "not provided".
pub type EntryPoint = vk::PFN_vkVoidFunction;

pub type GetPhysicalDeviceProcAddr = unsafe extern "system" fn(vk::Instance, *const c_char) -> vk::PFN_vkVoidFunction;

/// One link of an instance or device chain.
pub trait ChainLink: Send + Sync {
    fn proc_addr(&self, name: &str) -> EntryPoint;
}

/// Lookup functions a native layer exported or negotiated.
#[derive(Debug, Clone, Copy)]
pub struct NativeEntryPoints {
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub get_physical_device_proc_addr: Option<GetPhysicalDeviceProcAddr>,
}

/// A loaded layer: something that can contribute links to a chain.
pub trait Interposer: Send + Sync {
    /// Loader/layer interface version agreed during negotiation.
    fn interface_version(&self) -> u32;

    /// Set for layers loaded from a shared object. The chain builder then
    /// links the layer itself and threads its next pointers through the
    /// create call, so the link methods below are not used.
    fn native_entry_points(&self) -> Option<NativeEntryPoints> {
        None
    }

    /// The layer's override of a global query (`vkEnumerateInstance*`),
    /// called through a pre-instance chain.
    fn pre_instance_function(&self, _command: &str) -> EntryPoint {
        None
    }

    /// Returning `next` unchanged leaves the layer out of the chain.
    fn instance_link(&self, next: Arc<dyn ChainLink>) -> Result<Arc<dyn ChainLink>, CoreError> {
        Ok(next)
    }

    fn device_link(&self, next: Arc<dyn ChainLink>) -> Result<Arc<dyn ChainLink>, CoreError> {
        Ok(next)
    }
}
