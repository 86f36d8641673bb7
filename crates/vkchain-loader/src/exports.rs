//! Exported API entry points.
//!
//! These are the symbols an application links against when it loads the
//! loader as a shared library. Each one converts the C arguments, calls into
//! the Rust API, and maps errors to result codes.

#![allow(non_snake_case)]

use std::ffi::{c_char, CStr};
use std::sync::OnceLock;

use ash::vk;
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::{CoreError, EntryPoint};

use crate::device::{self, DeviceCreateInfo};
use crate::entry_point;
use crate::error::LoaderError;
use crate::instance::{self, InstanceCreateInfo, Loader};
use crate::library::{HostAllocator, QueueRequest};
use crate::physical_device;
use crate::terminator::{fill_array, fill_groups};

static LOADER: OnceLock<Loader> = OnceLock::new();

fn loader() -> &'static Loader {
    LOADER.get_or_init(Loader::new)
}

fn report(call: &str, e: LoaderError) -> vk::Result {
    loader_log!(DebugFlags::ERROR, "{}: {}", call, e);
    e.vk_result()
}

unsafe fn read_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

unsafe fn read_string_array(ptrs: *const *const c_char, count: u32) -> Vec<String> {
    if ptrs.is_null() {
        return Vec::new();
    }
    (0..count as usize)
        .filter_map(|i| unsafe { read_string(*ptrs.add(i)) })
        .collect()
}

unsafe fn read_allocator(ptr: *const vk::AllocationCallbacks<'_>) -> Option<HostAllocator> {
    if ptr.is_null() {
        return None;
    }
    Some(HostAllocator(unsafe { *(ptr as *const vk::AllocationCallbacks<'static>) }))
}

// ── Global ──────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceVersion(p_api_version: *mut u32) -> vk::Result {
    if p_api_version.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    match loader().instance_version() {
        Ok(version) => {
            unsafe { *p_api_version = version };
            vk::Result::SUCCESS
        }
        Err(e) => report("vkEnumerateInstanceVersion", e),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceLayerProperties(
    p_count: *mut u32,
    p_props: *mut vk::LayerProperties,
) -> vk::Result {
    match loader().instance_layer_properties() {
        Ok(props) => unsafe { fill_array(&props, p_count, p_props) },
        Err(e) => report("vkEnumerateInstanceLayerProperties", e),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceExtensionProperties(
    p_layer_name: *const c_char,
    p_count: *mut u32,
    p_props: *mut vk::ExtensionProperties,
) -> vk::Result {
    let layer = unsafe { read_string(p_layer_name) };
    match loader().enumerate_instance_extensions(layer.as_deref()) {
        Ok(props) => unsafe { fill_array(&props, p_count, p_props) },
        Err(e) => report("vkEnumerateInstanceExtensionProperties", e),
    }
}

// ── Instance ────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkCreateInstance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    if p_create_info.is_null() || p_instance.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let ci = unsafe { &*p_create_info };

    let (application_name, api_version) = if ci.p_application_info.is_null() {
        (None, vk::API_VERSION_1_0)
    } else {
        let app = unsafe { &*ci.p_application_info };
        (unsafe { read_string(app.p_application_name) }, app.api_version)
    };
    let info = InstanceCreateInfo {
        application_name,
        api_version,
        enabled_layers: unsafe { read_string_array(ci.pp_enabled_layer_names, ci.enabled_layer_count) },
        enabled_extensions: unsafe {
            read_string_array(ci.pp_enabled_extension_names, ci.enabled_extension_count)
        },
        allocator: unsafe { read_allocator(p_allocator) },
    };

    match loader().create_instance(&info) {
        Ok(instance) => {
            unsafe { *p_instance = instance };
            vk::Result::SUCCESS
        }
        Err(LoaderError::Core(CoreError::MissingForcedLayer(name))) => {
            loader_log!(
                DebugFlags::ERROR | DebugFlags::LAYER,
                "forced layer {} is missing, terminating",
                name
            );
            std::process::abort();
        }
        Err(e) => report("vkCreateInstance", e),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyInstance(
    instance: vk::Instance,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if let Err(e) = instance::destroy_instance(instance) {
        report("vkDestroyInstance", e);
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumeratePhysicalDevices(
    instance: vk::Instance,
    p_count: *mut u32,
    p_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    match physical_device::enumerate_physical_devices(instance) {
        Ok(devices) => unsafe { fill_array(&devices, p_count, p_devices) },
        Err(e) => report("vkEnumeratePhysicalDevices", e),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumeratePhysicalDeviceGroups(
    instance: vk::Instance,
    p_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties<'_>,
) -> vk::Result {
    match physical_device::enumerate_physical_device_groups(instance) {
        Ok(groups) => unsafe { fill_groups(&groups, p_count, p_groups) },
        Err(e) => report("vkEnumeratePhysicalDeviceGroups", e),
    }
}

// ── Physical device ─────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceProperties(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties,
) {
    if p_properties.is_null() {
        return;
    }
    match physical_device::physical_device_properties(physical_device) {
        Ok(props) => unsafe { *p_properties = props },
        Err(e) => {
            report("vkGetPhysicalDeviceProperties", e);
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceFeatures(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures,
) {
    if p_features.is_null() {
        return;
    }
    match physical_device::physical_device_features(physical_device) {
        Ok(features) => unsafe { *p_features = features },
        Err(e) => {
            report("vkGetPhysicalDeviceFeatures", e);
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceMemoryProperties(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceMemoryProperties,
) {
    if p_properties.is_null() {
        return;
    }
    match physical_device::physical_device_memory_properties(physical_device) {
        Ok(props) => unsafe { *p_properties = props },
        Err(e) => {
            report("vkGetPhysicalDeviceMemoryProperties", e);
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceQueueFamilyProperties(
    physical_device: vk::PhysicalDevice,
    p_count: *mut u32,
    p_props: *mut vk::QueueFamilyProperties,
) {
    match physical_device::queue_family_properties(physical_device) {
        Ok(families) => {
            // INCOMPLETE has no channel here; the count already says it.
            let _ = unsafe { fill_array(&families, p_count, p_props) };
        }
        Err(e) => {
            report("vkGetPhysicalDeviceQueueFamilyProperties", e);
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateDeviceExtensionProperties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_count: *mut u32,
    p_props: *mut vk::ExtensionProperties,
) -> vk::Result {
    let layer = unsafe { read_string(p_layer_name) };
    match physical_device::enumerate_device_extensions(physical_device, layer.as_deref()) {
        Ok(props) => unsafe { fill_array(&props, p_count, p_props) },
        Err(e) => report("vkEnumerateDeviceExtensionProperties", e),
    }
}

// ── Device ──────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkCreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    if p_create_info.is_null() || p_device.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let ci = unsafe { &*p_create_info };
    let mut queues = Vec::new();
    if !ci.p_queue_create_infos.is_null() {
        for i in 0..ci.queue_create_info_count as usize {
            let queue = unsafe { &*ci.p_queue_create_infos.add(i) };
            let priorities = if queue.p_queue_priorities.is_null() {
                Vec::new()
            } else {
                unsafe { std::slice::from_raw_parts(queue.p_queue_priorities, queue.queue_count as usize) }.to_vec()
            };
            queues.push(QueueRequest {
                family_index: queue.queue_family_index,
                priorities,
            });
        }
    }
    let info = DeviceCreateInfo {
        queues,
        enabled_extensions: unsafe {
            read_string_array(ci.pp_enabled_extension_names, ci.enabled_extension_count)
        },
        allocator: unsafe { read_allocator(p_allocator) },
    };

    match device::create_device(physical_device, &info) {
        Ok(device) => {
            unsafe { *p_device = device };
            vk::Result::SUCCESS
        }
        Err(e) => report("vkCreateDevice", e),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyDevice(device: vk::Device, _p_allocator: *const vk::AllocationCallbacks<'_>) {
    if let Err(e) = device::destroy_device(device) {
        report("vkDestroyDevice", e);
    }
}

// ── Proc address lookup ─────────────────────────────────────

/// Entry points that work without an instance.
fn global_entry(name: &str) -> EntryPoint {
    match name {
        "vkGetInstanceProcAddr" => entry_point!(vkGetInstanceProcAddr),
        "vkCreateInstance" => entry_point!(vkCreateInstance),
        "vkEnumerateInstanceVersion" => entry_point!(vkEnumerateInstanceVersion),
        "vkEnumerateInstanceLayerProperties" => entry_point!(vkEnumerateInstanceLayerProperties),
        "vkEnumerateInstanceExtensionProperties" => entry_point!(vkEnumerateInstanceExtensionProperties),
        _ => None,
    }
}

/// The loader's own trampolines for instance-level commands.
fn trampoline_entry(name: &str) -> EntryPoint {
    match name {
        "vkDestroyInstance" => entry_point!(vkDestroyInstance),
        "vkEnumeratePhysicalDevices" => entry_point!(vkEnumeratePhysicalDevices),
        "vkEnumeratePhysicalDeviceGroups" => entry_point!(vkEnumeratePhysicalDeviceGroups),
        "vkGetPhysicalDeviceProperties" => entry_point!(vkGetPhysicalDeviceProperties),
        "vkGetPhysicalDeviceFeatures" => entry_point!(vkGetPhysicalDeviceFeatures),
        "vkGetPhysicalDeviceMemoryProperties" => entry_point!(vkGetPhysicalDeviceMemoryProperties),
        "vkGetPhysicalDeviceQueueFamilyProperties" => entry_point!(vkGetPhysicalDeviceQueueFamilyProperties),
        "vkEnumerateDeviceExtensionProperties" => entry_point!(vkEnumerateDeviceExtensionProperties),
        "vkCreateDevice" => entry_point!(vkCreateDevice),
        "vkDestroyDevice" => entry_point!(vkDestroyDevice),
        "vkGetDeviceProcAddr" => entry_point!(vkGetDeviceProcAddr),
        _ => None,
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetInstanceProcAddr(instance: vk::Instance, p_name: *const c_char) -> EntryPoint {
    let name = unsafe { read_string(p_name) }?;
    if let Some(entry) = global_entry(&name) {
        return Some(entry);
    }
    if instance == vk::Instance::null() {
        return None;
    }
    if let Some(entry) = trampoline_entry(&name) {
        return Some(entry);
    }
    match instance::get_instance_proc_addr(instance, &name) {
        Ok(entry) => entry,
        Err(e) => {
            report("vkGetInstanceProcAddr", e);
            None
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceProcAddr(device: vk::Device, p_name: *const c_char) -> EntryPoint {
    let name = unsafe { read_string(p_name) }?;
    match name.as_str() {
        "vkGetDeviceProcAddr" => return entry_point!(vkGetDeviceProcAddr),
        // Destruction goes through the loader so its records are released.
        "vkDestroyDevice" => return entry_point!(vkDestroyDevice),
        _ => {}
    }
    match device::get_device_proc_addr(device, &name) {
        Ok(entry) => entry,
        Err(LoaderError::Core(CoreError::FunctionNotSupported(_))) => None,
        Err(e) => {
            report("vkGetDeviceProcAddr", e);
            None
        }
    }
}
