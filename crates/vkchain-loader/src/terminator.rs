//! Loader terminators: the bottom of every instance chain, and the few device
//! calls the loader keeps for itself.
//!
//! Layers call these with loader handles (the instance, terminator physical
//! devices, loader-owned devices). Each one translates to the driver's own
//! handles and forwards.

use std::ffi::{c_char, c_void, CStr};

use ash::vk;
use ash::vk::Handle;
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::EntryPoint;

use crate::device;
use crate::dispatch::{cast_entry, raw_handle, set_loader_data};
use crate::entry_point;
use crate::handle_store;
use crate::instance::{self, live_instance};
use crate::library::{extension_name, extension_properties};
use crate::physical_device::{self, TerminatorHandle};

/// Loader terminator for an instance-level command, if it has one.
pub fn instance_terminator(name: &str) -> EntryPoint {
    match name {
        "vkDestroyInstance" => entry_point!(destroy_instance),
        "vkEnumeratePhysicalDevices" => entry_point!(enumerate_physical_devices),
        "vkEnumeratePhysicalDeviceGroups" => entry_point!(enumerate_physical_device_groups),
        "vkGetPhysicalDeviceProperties" => entry_point!(get_physical_device_properties),
        "vkGetPhysicalDeviceFeatures" => entry_point!(get_physical_device_features),
        "vkGetPhysicalDeviceMemoryProperties" => entry_point!(get_physical_device_memory_properties),
        "vkGetPhysicalDeviceQueueFamilyProperties" => entry_point!(get_physical_device_queue_family_properties),
        "vkEnumerateDeviceExtensionProperties" => entry_point!(enumerate_device_extension_properties),
        _ => None,
    }
}

pub fn device_terminator(name: &str) -> EntryPoint {
    match name {
        "vkDestroyDevice" => entry_point!(destroy_device),
        "vkSetDebugUtilsObjectNameEXT" => entry_point!(set_debug_utils_object_name),
        _ => None,
    }
}

// ── Native layer bottom ─────────────────────────────────────

/// Next instance lookup handed to the lowest native layer.
pub(crate) unsafe extern "system" fn native_get_instance_proc_addr(
    _instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let Ok(name) = (unsafe { CStr::from_ptr(p_name) }).to_str() else {
        return None;
    };
    match name {
        "vkGetInstanceProcAddr" => entry_point!(native_get_instance_proc_addr),
        "vkCreateInstance" => entry_point!(create_instance_bottom),
        "vkCreateDevice" => entry_point!(create_device_bottom),
        _ => instance_terminator(name),
    }
}

/// Next device lookup handed to the lowest native layer: the device chain's
/// bottom link.
pub(crate) unsafe extern "system" fn native_get_device_proc_addr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let Ok(name) = (unsafe { CStr::from_ptr(p_name) }).to_str() else {
        return None;
    };
    if name == "vkGetDeviceProcAddr" {
        return entry_point!(native_get_device_proc_addr);
    }
    match handle_store::unwrap_device(device) {
        Ok(record) => record.bottom_proc_addr(name),
        Err(e) => {
            loader_log!(DebugFlags::ERROR | DebugFlags::VALIDATION, "vkGetDeviceProcAddr: {}", e);
            None
        }
    }
}

/// Driver instances exist before the layers are created, so the bottom of a
/// native create call only checks the handle it is given.
unsafe extern "system" fn create_instance_bottom(
    _p_create_info: *const vk::InstanceCreateInfo<'_>,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    if p_instance.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    match handle_store::unwrap_instance(unsafe { *p_instance }) {
        Ok(_) => vk::Result::SUCCESS,
        Err(e) => e.vk_result(),
    }
}

unsafe extern "system" fn create_device_bottom(
    physical_device: vk::PhysicalDevice,
    _p_create_info: *const vk::DeviceCreateInfo<'_>,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    if p_device.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if let Err(e) = handle_store::unwrap_terminator(physical_device) {
        return e.vk_result();
    }
    match handle_store::unwrap_device(unsafe { *p_device }) {
        Ok(_) => vk::Result::SUCCESS,
        Err(e) => e.vk_result(),
    }
}

/// Stamp an object a layer created with the instance table.
pub(crate) unsafe extern "system" fn set_instance_loader_data(instance: vk::Instance, object: *mut c_void) -> vk::Result {
    let record = match handle_store::unwrap_instance(instance) {
        Ok(record) => record,
        Err(e) => return e.vk_result(),
    };
    match unsafe { set_loader_data(object as u64, record.dispatch()) } {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => e.vk_result(),
    }
}

/// Stamp an object a layer created with the device table.
pub(crate) unsafe extern "system" fn set_device_loader_data(device: vk::Device, object: *mut c_void) -> vk::Result {
    let record = match handle_store::unwrap_device(device) {
        Ok(record) => record,
        Err(e) => return e.vk_result(),
    };
    match unsafe { set_loader_data(object as u64, record.table()) } {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => e.vk_result(),
    }
}

/// Write `items` into a caller-provided array using the count-then-fill
/// protocol.
///
/// # Safety
/// `p_count` must be valid; `p_out`, when non-null, must hold `*p_count`
/// elements.
pub(crate) unsafe fn fill_array<T: Copy>(items: &[T], p_count: *mut u32, p_out: *mut T) -> vk::Result {
    if p_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if p_out.is_null() {
        unsafe { *p_count = items.len() as u32 };
        return vk::Result::SUCCESS;
    }
    let capacity = unsafe { *p_count } as usize;
    let written = capacity.min(items.len());
    unsafe {
        std::ptr::copy_nonoverlapping(items.as_ptr(), p_out, written);
        *p_count = written as u32;
    }
    if written < items.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

/// The terminator wrapper behind `physical_device`, with its owning instance.
fn terminator_of(
    physical_device: vk::PhysicalDevice,
) -> Option<(physical_device::InstanceHandle, TerminatorHandle)> {
    let terminator = match handle_store::unwrap_terminator(physical_device) {
        Ok(terminator) => terminator,
        Err(e) => {
            loader_log!(DebugFlags::ERROR | DebugFlags::VALIDATION, "{}", e);
            return None;
        }
    };
    let instance = live_instance(terminator.instance).ok()?;
    Some((instance, terminator))
}

// ── Instance ────────────────────────────────────────────────

unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    match handle_store::unwrap_instance(instance) {
        Ok(record) => instance::teardown_instance(&record),
        Err(e) => loader_log!(DebugFlags::ERROR | DebugFlags::VALIDATION, "vkDestroyInstance: {}", e),
    }
}

unsafe extern "system" fn enumerate_physical_devices(
    instance: vk::Instance,
    p_count: *mut u32,
    p_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    let record = match handle_store::unwrap_instance(instance) {
        Ok(record) => record,
        Err(e) => return e.vk_result(),
    };
    let devices = match physical_device::terminator_devices(&record) {
        Ok(devices) => devices,
        Err(e) => return e.vk_result(),
    };
    let handles: Vec<vk::PhysicalDevice> = devices
        .iter()
        .map(|t| vk::PhysicalDevice::from_raw(raw_handle(t)))
        .collect();
    unsafe { fill_array(&handles, p_count, p_devices) }
}

unsafe extern "system" fn enumerate_physical_device_groups(
    instance: vk::Instance,
    p_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties<'_>,
) -> vk::Result {
    let record = match handle_store::unwrap_instance(instance) {
        Ok(record) => record,
        Err(e) => return e.vk_result(),
    };
    let groups = match physical_device::terminator_groups(&record) {
        Ok(groups) => groups,
        Err(e) => return e.vk_result(),
    };
    let handles: Vec<Vec<vk::PhysicalDevice>> = groups
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|t| vk::PhysicalDevice::from_raw(raw_handle(t)))
                .collect()
        })
        .collect();
    unsafe { fill_groups(&handles, p_count, p_groups) }
}

/// [`fill_array`] for device groups. Only the payload fields are written;
/// `sType` and `pNext` belong to the caller.
///
/// # Safety
/// Same contract as [`fill_array`].
pub(crate) unsafe fn fill_groups(
    groups: &[Vec<vk::PhysicalDevice>],
    p_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties<'_>,
) -> vk::Result {
    if p_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if p_groups.is_null() {
        unsafe { *p_count = groups.len() as u32 };
        return vk::Result::SUCCESS;
    }
    let capacity = unsafe { *p_count } as usize;
    let written = capacity.min(groups.len());
    for (i, group) in groups.iter().take(written).enumerate() {
        let out = unsafe { &mut *p_groups.add(i) };
        let count = group.len().min(vk::MAX_DEVICE_GROUP_SIZE);
        out.physical_device_count = count as u32;
        out.physical_devices[..count].copy_from_slice(&group[..count]);
        out.subset_allocation = vk::FALSE;
    }
    unsafe { *p_count = written as u32 };
    if written < groups.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

// ── Physical device queries ─────────────────────────────────

macro_rules! forward_query {
    ($fn_name:ident, $pfn:ty, $command:literal, $out:ty) => {
        unsafe extern "system" fn $fn_name(physical_device: vk::PhysicalDevice, p_out: *mut $out) {
            let Some((instance, terminator)) = terminator_of(physical_device) else {
                return;
            };
            let Some(icd) = instance.icds.get(terminator.icd_index) else {
                return;
            };
            if let Some(call) = unsafe { cast_entry::<$pfn>(icd.dispatch().get($command)) } {
                unsafe { call(terminator.driver_handle, p_out) };
            }
        }
    };
}

forward_query!(
    get_physical_device_properties,
    vk::PFN_vkGetPhysicalDeviceProperties,
    "vkGetPhysicalDeviceProperties",
    vk::PhysicalDeviceProperties
);
forward_query!(
    get_physical_device_features,
    vk::PFN_vkGetPhysicalDeviceFeatures,
    "vkGetPhysicalDeviceFeatures",
    vk::PhysicalDeviceFeatures
);
forward_query!(
    get_physical_device_memory_properties,
    vk::PFN_vkGetPhysicalDeviceMemoryProperties,
    "vkGetPhysicalDeviceMemoryProperties",
    vk::PhysicalDeviceMemoryProperties
);

unsafe extern "system" fn get_physical_device_queue_family_properties(
    physical_device: vk::PhysicalDevice,
    p_count: *mut u32,
    p_props: *mut vk::QueueFamilyProperties,
) {
    let Some((instance, terminator)) = terminator_of(physical_device) else {
        return;
    };
    let Some(icd) = instance.icds.get(terminator.icd_index) else {
        return;
    };
    let get = unsafe {
        cast_entry::<vk::PFN_vkGetPhysicalDeviceQueueFamilyProperties>(
            icd.dispatch().get("vkGetPhysicalDeviceQueueFamilyProperties"),
        )
    };
    if let Some(get) = get {
        unsafe { get(terminator.driver_handle, p_count, p_props) };
    }
}

/// Driver extensions plus those of the enabled layers, or one layer's list
/// when `p_layer_name` is set.
unsafe extern "system" fn enumerate_device_extension_properties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_count: *mut u32,
    p_props: *mut vk::ExtensionProperties,
) -> vk::Result {
    let Some((instance, terminator)) = terminator_of(physical_device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    if !p_layer_name.is_null() {
        let name = unsafe { CStr::from_ptr(p_layer_name) }.to_string_lossy();
        let Some(layer) = instance.layers.expanded.iter().find(|layer| layer.name == name) else {
            return vk::Result::ERROR_LAYER_NOT_PRESENT;
        };
        let props: Vec<vk::ExtensionProperties> = layer
            .device_extensions
            .iter()
            .map(|ext| extension_properties(&ext.name, ext.spec_version))
            .collect();
        return unsafe { fill_array(&props, p_count, p_props) };
    }

    let Some(icd) = instance.icds.get(terminator.icd_index) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let mut props = match icd.driver.device_extensions(icd.instance, terminator.driver_handle) {
        Ok(props) => props,
        Err(e) => return e.vk_result(),
    };
    for layer in &instance.layers.expanded {
        for ext in &layer.device_extensions {
            if !props.iter().any(|p| extension_name(p) == ext.name) {
                props.push(extension_properties(&ext.name, ext.spec_version));
            }
        }
    }
    unsafe { fill_array(&props, p_count, p_props) }
}

// ── Device ──────────────────────────────────────────────────

unsafe extern "system" fn destroy_device(device: vk::Device, _p_allocator: *const vk::AllocationCallbacks<'_>) {
    if let Err(e) = device::terminate_device(device) {
        loader_log!(DebugFlags::ERROR | DebugFlags::VALIDATION, "vkDestroyDevice: {}", e);
    }
}

/// Replace loader handles in the name info with the driver's own before
/// forwarding.
unsafe extern "system" fn set_debug_utils_object_name(
    device: vk::Device,
    p_name_info: *const vk::DebugUtilsObjectNameInfoEXT<'_>,
) -> vk::Result {
    if p_name_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let record = match handle_store::unwrap_device(device) {
        Ok(record) => record,
        Err(e) => return e.vk_result(),
    };
    let Some(forward) =
        (unsafe { cast_entry::<vk::PFN_vkSetDebugUtilsObjectNameEXT>(record.driver_object_name_entry()) })
    else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };

    let mut info = unsafe { *p_name_info };
    match info.object_type {
        vk::ObjectType::PHYSICAL_DEVICE => {
            let handle = vk::PhysicalDevice::from_raw(info.object_handle);
            let translated = handle_store::unwrap_terminator(handle)
                .map(|t| t.driver_handle)
                .or_else(|_| {
                    handle_store::unwrap_trampoline(handle)
                        .and_then(|t| handle_store::unwrap_terminator(t.next))
                        .map(|t| t.driver_handle)
                });
            match translated {
                Ok(driver_handle) => info.object_handle = driver_handle.as_raw(),
                Err(e) => return e.vk_result(),
            }
        }
        vk::ObjectType::INSTANCE => {
            let handle = vk::Instance::from_raw(info.object_handle);
            match handle_store::unwrap_instance(handle) {
                Ok(instance) => match instance.icds.get(record.icd_index) {
                    Some(icd) => info.object_handle = icd.instance.as_raw(),
                    None => return vk::Result::ERROR_INITIALIZATION_FAILED,
                },
                Err(e) => return e.vk_result(),
            }
        }
        _ => {}
    }
    unsafe { forward(record.handle, &info) }
}
