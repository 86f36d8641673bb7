//! Handle arenas for loader objects.
//!
//! Every handle the loader gives out is registered here under its raw value.
//! Lookups go through the typed maps, so a handle of the wrong kind (or one
//! already destroyed) is rejected without being dereferenced.

use std::sync::{Arc, OnceLock};

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use vkchain_core::CoreError;

use crate::device::DeviceRecord;
use crate::dispatch::Dispatchable;
use crate::instance::InstanceRecord;
use crate::physical_device::{PhysicalDeviceTerminator, PhysicalDeviceTrampoline};

macro_rules! handle_map {
    ($map_name:ident, $fn_map:ident, $fn_store:ident, $fn_get:ident, $fn_remove:ident, $ty:ty) => {
        static $map_name: OnceLock<DashMap<u64, Arc<$ty>>> = OnceLock::new();

        fn $fn_map() -> &'static DashMap<u64, Arc<$ty>> {
            $map_name.get_or_init(DashMap::new)
        }

        pub fn $fn_store(handle: u64, object: Arc<$ty>) {
            $fn_map().insert(handle, object);
        }

        pub fn $fn_get(handle: u64) -> Option<Arc<$ty>> {
            $fn_map().get(&handle).map(|v| v.clone())
        }

        pub fn $fn_remove(handle: u64) -> Option<Arc<$ty>> {
            $fn_map().remove(&handle).map(|(_, v)| v)
        }
    };
}

handle_map!(INSTANCE_MAP, instance_map, store_instance, get_instance, remove_instance, Dispatchable<InstanceRecord>);
handle_map!(TRAMPOLINE_MAP, trampoline_map, store_trampoline, get_trampoline, remove_trampoline, Dispatchable<PhysicalDeviceTrampoline>);
handle_map!(TERMINATOR_MAP, terminator_map, store_terminator, get_terminator, remove_terminator, Dispatchable<PhysicalDeviceTerminator>);
handle_map!(DEVICE_MAP, device_map, store_device, get_device, remove_device, DeviceRecord);

// ── Validated lookup ────────────────────────────────────────

/// A loader object carrying a magic tag.
pub trait Tagged {
    const MAGIC: u64;
    const KIND: &'static str;

    fn magic(&self) -> u64;
}

impl<T: Tagged> Tagged for Dispatchable<T> {
    const MAGIC: u64 = T::MAGIC;
    const KIND: &'static str = T::KIND;

    fn magic(&self) -> u64 {
        (**self).magic()
    }
}

fn checked<T: Tagged>(object: Option<Arc<T>>, handle: u64) -> Result<Arc<T>, CoreError> {
    match object {
        Some(object) if object.magic() == T::MAGIC => Ok(object),
        Some(object) => Err(CoreError::InvalidHandle(format!(
            "{} {:#x} has bad magic {:#x}",
            T::KIND,
            handle,
            object.magic()
        ))),
        None => Err(CoreError::InvalidHandle(format!("unknown {} {:#x}", T::KIND, handle))),
    }
}

pub fn unwrap_instance(handle: vk::Instance) -> Result<Arc<Dispatchable<InstanceRecord>>, CoreError> {
    checked(get_instance(handle.as_raw()), handle.as_raw())
}

/// The application-facing wrapper for `handle`.
pub fn unwrap_trampoline(
    handle: vk::PhysicalDevice,
) -> Result<Arc<Dispatchable<PhysicalDeviceTrampoline>>, CoreError> {
    checked(get_trampoline(handle.as_raw()), handle.as_raw())
}

/// The driver-facing wrapper for `handle`.
pub fn unwrap_terminator(
    handle: vk::PhysicalDevice,
) -> Result<Arc<Dispatchable<PhysicalDeviceTerminator>>, CoreError> {
    checked(get_terminator(handle.as_raw()), handle.as_raw())
}

pub fn unwrap_device(handle: vk::Device) -> Result<Arc<DeviceRecord>, CoreError> {
    checked(get_device(handle.as_raw()), handle.as_raw())
}
