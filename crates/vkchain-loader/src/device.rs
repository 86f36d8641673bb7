//! Logical devices.
//!
//! Device handles are the driver's own objects. The loader writes the device
//! table into the object's first word, so layers and the application reach
//! the table through the handle they already hold.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use ash::vk;
use ash::vk::Handle;
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::error::try_push;
use vkchain_core::layer::layer_names;
use vkchain_core::{ChainLink, CoreError, EntryPoint, LayerRecord};

use crate::chain::{build_chain, create_device_chain, ChainKind, DeviceTerminatorLink};
use crate::dispatch::{
    cast_entry, raw_handle, set_loader_data, DispatchTable, DEVICE_COMMANDS, DEVICE_MAGIC, MAX_UNKNOWN_FUNCTIONS,
};
use crate::error::LoaderError;
use crate::handle_store::{self, Tagged};
use crate::instance::{live_instance, IcdRecord};
use crate::library::{extension_name, DriverDeviceInfo, HostAllocator, QueueRequest};
use crate::physical_device::TerminatorHandle;

#[derive(Debug, Clone, Default)]
pub struct DeviceCreateInfo {
    pub queues: Vec<QueueRequest>,
    pub enabled_extensions: Vec<String>,
    pub allocator: Option<HostAllocator>,
}

pub struct DeviceRecord {
    magic: AtomicU64,
    /// The driver's device handle, also the handle the application holds.
    pub handle: vk::Device,
    pub instance: u64,
    pub icd_index: usize,
    pub physical_device: TerminatorHandle,
    table: Box<DispatchTable>,
    bottom: Arc<DeviceTerminatorLink>,
    top: OnceLock<Arc<dyn ChainLink>>,
    /// Layers the device chain was built from, application side first.
    pub layers: Vec<Arc<LayerRecord>>,
    pub enabled_extensions: Vec<String>,
    pub allocator: Option<HostAllocator>,
    set_object_name: EntryPoint,
}

impl DeviceRecord {
    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn is_valid(&self) -> bool {
        self.magic() == DEVICE_MAGIC
    }

    /// Top of the device chain. Until the chain is linked, the driver.
    pub(crate) fn top(&self) -> Arc<dyn ChainLink> {
        match self.top.get() {
            Some(top) => top.clone(),
            None => self.bottom.clone(),
        }
    }

    pub(crate) fn bottom_proc_addr(&self, name: &str) -> EntryPoint {
        self.bottom.proc_addr(name)
    }

    /// The driver's own `vkSetDebugUtilsObjectNameEXT`.
    pub(crate) fn driver_object_name_entry(&self) -> EntryPoint {
        self.set_object_name
    }
}

impl Tagged for DeviceRecord {
    const MAGIC: u64 = DEVICE_MAGIC;
    const KIND: &'static str = "device";

    fn magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("handle", &self.handle)
            .field("icd_index", &self.icd_index)
            .field("layers", &layer_names(&self.layers))
            .field("enabled_extensions", &self.enabled_extensions)
            .field("table", &self.table)
            .finish()
    }
}

// ── Creation ────────────────────────────────────────────────

/// Create a device on `physical_device` (an application-facing handle).
pub fn create_device(physical_device: vk::PhysicalDevice, info: &DeviceCreateInfo) -> Result<vk::Device, LoaderError> {
    let trampoline = handle_store::unwrap_trampoline(physical_device)?;
    let instance = live_instance(trampoline.instance)?;
    let terminator = handle_store::unwrap_terminator(trampoline.next)?;
    let icd = instance
        .icds
        .get(terminator.icd_index)
        .ok_or_else(|| LoaderError::invalid_handle(format!("driver index {}", terminator.icd_index)))?;

    let supported: Vec<String> = icd
        .driver
        .device_extensions(icd.instance, terminator.driver_handle)?
        .iter()
        .map(extension_name)
        .collect();
    let mut driver_extensions: Vec<String> = Vec::new();
    for requested in &info.enabled_extensions {
        if supported.contains(requested) {
            try_push(&mut driver_extensions, requested.clone())?;
            continue;
        }
        let from_layer = instance
            .layers
            .expanded
            .iter()
            .any(|layer| layer.device_extensions.iter().any(|ext| &ext.name == requested));
        if !from_layer {
            loader_log!(
                DebugFlags::ERROR | DebugFlags::VALIDATION,
                "device extension {} is not supported by the driver or any enabled layer",
                requested
            );
            return Err(CoreError::ExtensionNotPresent(requested.clone()).into());
        }
    }

    let driver_info = DriverDeviceInfo {
        queues: info.queues.clone(),
        extensions: driver_extensions,
        allocator: info.allocator,
    };
    let device = icd.driver.create_device(icd.instance, terminator.driver_handle, &driver_info)?;

    let layers = instance.layers.expanded.clone();
    match register_device(icd, trampoline.instance, &terminator, device, layers, info) {
        Ok(()) => {
            loader_log!(DebugFlags::INFO, "created device {:?} on driver {}", device, icd.driver.name());
            Ok(device)
        }
        Err(e) => {
            icd.driver.destroy_device(icd.instance, device, info.allocator.as_ref());
            Err(e)
        }
    }
}

fn register_device(
    icd: &IcdRecord,
    instance: u64,
    terminator: &TerminatorHandle,
    device: vk::Device,
    layers: Vec<Arc<LayerRecord>>,
    info: &DeviceCreateInfo,
) -> Result<(), LoaderError> {
    let owner = live_instance(instance)?;
    let table = Box::new(DispatchTable::empty(DEVICE_COMMANDS, MAX_UNKNOWN_FUNCTIONS)?);
    unsafe { set_loader_data(device.as_raw(), &*table) }?;

    let bottom = Arc::new(DeviceTerminatorLink {
        driver: icd.driver.clone(),
        instance: icd.instance,
        device,
    });
    let record = Arc::new(DeviceRecord {
        magic: AtomicU64::new(DEVICE_MAGIC),
        handle: device,
        instance,
        icd_index: icd.index,
        physical_device: terminator.clone(),
        table,
        bottom: bottom.clone(),
        top: OnceLock::new(),
        layers,
        enabled_extensions: info.enabled_extensions.clone(),
        allocator: info.allocator,
        set_object_name: icd
            .driver
            .device_proc_addr(icd.instance, device, "vkSetDebugUtilsObjectNameEXT"),
    });
    try_push(&mut *icd.devices.lock(), record.clone())?;
    handle_store::store_device(device.as_raw(), record.clone());

    // Native layers look the device up while they are being created.
    let linked = build_chain(bottom, &record.layers, ChainKind::Device, device.as_raw())
        .map_err(LoaderError::from)
        .and_then(|chain| {
            let physical_device = vk::PhysicalDevice::from_raw(raw_handle(terminator));
            create_device_chain(&chain, vk::Instance::from_raw(instance), physical_device, device, info)?;
            Ok(chain)
        });
    let chain = match linked {
        Ok(chain) => chain,
        Err(e) => {
            icd.devices.lock().retain(|other| !Arc::ptr_eq(other, &record));
            handle_store::remove_device(device.as_raw());
            record.magic.store(0, Ordering::Release);
            return Err(e);
        }
    };

    record.table.fill(&*chain.top);
    // Names already assigned on other devices get their slot up front.
    for (index, name) in owner.unknown_device_functions.names().iter().enumerate() {
        if let Some(slot) = record.table.unknown_slot(index) {
            let _ = slot.set(chain.top.proc_addr(name));
        }
    }
    let _ = record.top.set(chain.top);
    Ok(())
}

// ── Destruction ─────────────────────────────────────────────

/// Destroy a device through its chain. The loader terminator unlinks it.
pub fn destroy_device(handle: vk::Device) -> Result<(), LoaderError> {
    if handle == vk::Device::null() {
        return Ok(());
    }
    let record = handle_store::unwrap_device(handle)?;
    let destroy = unsafe { cast_entry::<vk::PFN_vkDestroyDevice>(record.table().get("vkDestroyDevice")) };
    if let Some(destroy) = destroy {
        unsafe { destroy(handle, HostAllocator::as_ptr(record.allocator.as_ref())) };
    }
    if handle_store::get_device(handle.as_raw()).is_some() {
        terminate_device(handle)?;
    }
    Ok(())
}

/// Unlink a device from its driver record and release it.
pub(crate) fn terminate_device(handle: vk::Device) -> Result<(), LoaderError> {
    let record = handle_store::unwrap_device(handle)?;
    let instance = live_instance(record.instance)?;
    let icd = instance
        .icds
        .get(record.icd_index)
        .ok_or_else(|| LoaderError::invalid_handle(format!("driver index {}", record.icd_index)))?;
    icd.devices.lock().retain(|device| !Arc::ptr_eq(device, &record));
    release_device(icd, &record);
    Ok(())
}

pub(crate) fn release_device(icd: &IcdRecord, device: &DeviceRecord) {
    handle_store::remove_device(device.handle.as_raw());
    device.magic.store(0, Ordering::Release);
    icd.driver.destroy_device(icd.instance, device.handle, device.allocator.as_ref());
    loader_log!(DebugFlags::INFO, "destroyed device {:?}", device.handle);
}

// ── Lookup ──────────────────────────────────────────────────

/// Entry point for `name` on `handle`'s device chain.
///
/// Names outside the fixed command list get an unknown-function slot shared
/// by every device of the instance, as long as some layer or the driver
/// provides them.
pub fn get_device_proc_addr(handle: vk::Device, name: &str) -> Result<EntryPoint, LoaderError> {
    let record = handle_store::unwrap_device(handle)?;
    if record.table().is_known(name) {
        return Ok(record.table().get(name));
    }

    let instance = live_instance(record.instance)?;
    let index = match instance.unknown_device_functions.index_of(name) {
        Some(index) => index,
        None => {
            let from_layer = record.layers.iter().any(|layer| layer.exposes_device_entrypoint(name));
            if !from_layer && record.top().proc_addr(name).is_none() {
                return Err(CoreError::FunctionNotSupported(name.to_string()).into());
            }
            instance.unknown_device_functions.assign(name)?
        }
    };
    let slot = record
        .table()
        .unknown_slot(index)
        .ok_or_else(|| CoreError::FunctionNotSupported(name.to_string()))?;
    Ok(*slot.get_or_init(|| record.top().proc_addr(name)))
}
