//! Structures a layer reads from the `pNext` chain of its create call.
//!
//! The loader calls the create function of the top native layer with one
//! `LINK_INFO` node per native layer. Each layer takes the next pointers from
//! the current node, advances `layer_info` to the following node, and calls
//! down. A `LOADER_DATA_CALLBACK` node carries the function a layer uses to
//! stamp dispatchable objects it creates itself.

use std::ffi::c_void;
use std::ptr;

use ash::vk;
use vkchain_core::GetPhysicalDeviceProcAddr;

pub const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
pub const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

pub type LayerFunction = i32;
pub const LAYER_LINK_INFO: LayerFunction = 0;
pub const LOADER_DATA_CALLBACK: LayerFunction = 1;

pub type SetInstanceLoaderData = unsafe extern "system" fn(vk::Instance, *mut c_void) -> vk::Result;
pub type SetDeviceLoaderData = unsafe extern "system" fn(vk::Device, *mut c_void) -> vk::Result;

// ── Instance ────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_physical_device_proc_addr: Option<GetPhysicalDeviceProcAddr>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union LayerInstanceCreateUnion {
    pub layer_info: *mut LayerInstanceLink,
    pub set_instance_loader_data: SetInstanceLoaderData,
    _reserved: [*const c_void; 2],
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: LayerFunction,
    pub u: LayerInstanceCreateUnion,
}

// ── Device ──────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union LayerDeviceCreateUnion {
    pub layer_info: *mut LayerDeviceLink,
    pub set_device_loader_data: SetDeviceLoaderData,
    _reserved: [*const c_void; 2],
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: LayerFunction,
    pub u: LayerDeviceCreateUnion,
}

// ── Lookup ──────────────────────────────────────────────────

#[repr(C)]
struct BaseIn {
    s_type: vk::StructureType,
    p_next: *const BaseIn,
}

/// First node of `s_type` and `function` in a `pNext` chain.
///
/// # Safety
/// `p_next` must start a valid chain of API structures.
unsafe fn find_node(mut p_next: *const c_void, s_type: vk::StructureType, function: LayerFunction) -> *mut c_void {
    while !p_next.is_null() {
        let base = p_next as *const BaseIn;
        if unsafe { (*base).s_type } == s_type {
            // Both create info layouts share the header up to `function`.
            let node = p_next as *const LayerInstanceCreateInfo;
            if unsafe { (*node).function } == function {
                return p_next as *mut c_void;
            }
        }
        p_next = unsafe { (*base).p_next } as *const c_void;
    }
    ptr::null_mut()
}

/// The link node of an instance create call, as a layer looks it up.
///
/// # Safety
/// `create_info` must be the pointer the layer's `vkCreateInstance` received.
pub unsafe fn instance_link_info(
    create_info: *const vk::InstanceCreateInfo<'_>,
    function: LayerFunction,
) -> *mut LayerInstanceCreateInfo {
    if create_info.is_null() {
        return ptr::null_mut();
    }
    unsafe { find_node((*create_info).p_next, LOADER_INSTANCE_CREATE_INFO, function) as *mut LayerInstanceCreateInfo }
}

/// The link node of a device create call.
///
/// # Safety
/// `create_info` must be the pointer the layer's `vkCreateDevice` received.
pub unsafe fn device_link_info(
    create_info: *const vk::DeviceCreateInfo<'_>,
    function: LayerFunction,
) -> *mut LayerDeviceCreateInfo {
    if create_info.is_null() {
        return ptr::null_mut();
    }
    unsafe { find_node((*create_info).p_next, LOADER_DEVICE_CREATE_INFO, function) as *mut LayerDeviceCreateInfo }
}
