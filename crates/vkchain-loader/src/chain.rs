//! Chain construction.
//!
//! The bottom link is created first. Each active layer, from the one closest
//! to the driver up to the one closest to the application, receives the link
//! below it and answers with its own. The returned top link is what known
//! slots and later lookups are resolved against.
//!
//! Native layers sit directly above the bottom link. They learn their next
//! lookup functions from the create call, so after the object exists the
//! loader calls [`create_instance_chain`] or [`create_device_chain`], which
//! threads one link node per native layer through the create info.

use std::ffi::{c_char, c_void, CString};
use std::fmt;
use std::ptr;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::{ChainLink, CoreError, EntryPoint, Interposer, LayerRecord, NativeEntryPoints};

use crate::device::DeviceCreateInfo;
use crate::dispatch::cast_entry;
use crate::error::LoaderError;
use crate::instance::InstanceCreateInfo;
use crate::library::{c_strings, Driver, HostAllocator};
use crate::link_info::{
    LayerDeviceCreateInfo, LayerDeviceCreateUnion, LayerDeviceLink, LayerInstanceCreateInfo,
    LayerInstanceCreateUnion, LayerInstanceLink, LAYER_LINK_INFO, LOADER_DATA_CALLBACK, LOADER_DEVICE_CREATE_INFO,
    LOADER_INSTANCE_CREATE_INFO,
};
use crate::terminator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    Instance,
    Device,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKind::Instance => f.write_str("instance"),
            ChainKind::Device => f.write_str("device"),
        }
    }
}

#[derive(Debug, Clone)]
struct NativeHop {
    name: String,
    entry: NativeEntryPoints,
}

/// A built chain: the top link, and the native layers that still need their
/// create call, driver side first.
pub struct LinkedChain {
    pub top: Arc<dyn ChainLink>,
    native: Vec<NativeHop>,
}

impl LinkedChain {
    pub fn native_layers(&self) -> Vec<&str> {
        self.native.iter().map(|hop| hop.name.as_str()).collect()
    }
}

impl fmt::Debug for LinkedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedChain").field("native", &self.native_layers()).finish()
    }
}

/// Thread `layers` (application side first) on top of `bottom`.
///
/// `handle` is the loader object the chain belongs to; native layers are
/// asked for entry points with it. Meta layers and layers without a loaded
/// library contribute no link, and neither does a native layer placed above
/// an in-process one.
pub fn build_chain(
    bottom: Arc<dyn ChainLink>,
    layers: &[Arc<LayerRecord>],
    kind: ChainKind,
    handle: u64,
) -> Result<LinkedChain, CoreError> {
    let mut next = bottom;
    let mut native = Vec::new();
    let mut native_open = true;
    for layer in layers.iter().rev() {
        if layer.is_meta() {
            continue;
        }
        let Some(library) = layer.library() else {
            loader_log!(
                DebugFlags::WARN | DebugFlags::LAYER,
                "layer {} has no loaded library, leaving it out of the {} chain",
                layer.name,
                kind
            );
            continue;
        };
        match library.native_entry_points() {
            Some(_) if !native_open => {
                loader_log!(
                    DebugFlags::WARN | DebugFlags::LAYER,
                    "native layer {} sits above an in-process layer, leaving it out of the {} chain",
                    layer.name,
                    kind
                );
                continue;
            }
            Some(entry) if kind == ChainKind::Device && entry.get_device_proc_addr.is_none() => {
                loader_log!(DebugFlags::LAYER, "layer {} has no device lookup", layer.name);
                continue;
            }
            Some(entry) => {
                native.push(NativeHop {
                    name: layer.name.clone(),
                    entry,
                });
                next = Arc::new(NativeLayerLink {
                    layer: layer.name.clone(),
                    kind,
                    handle,
                    entry,
                    next,
                    _library: library.clone(),
                });
            }
            None => {
                next = match kind {
                    ChainKind::Instance => library.instance_link(next)?,
                    ChainKind::Device => library.device_link(next)?,
                };
                native_open = false;
            }
        }
        loader_log!(DebugFlags::LAYER, "inserted {} layer {}", kind, layer.name);
    }
    Ok(LinkedChain { top: next, native })
}

/// A native layer's link: the layer's own lookup on the chain's object, then
/// the link below.
struct NativeLayerLink {
    layer: String,
    kind: ChainKind,
    handle: u64,
    entry: NativeEntryPoints,
    next: Arc<dyn ChainLink>,
    _library: Arc<dyn Interposer>,
}

impl ChainLink for NativeLayerLink {
    fn proc_addr(&self, name: &str) -> EntryPoint {
        let Ok(c_name) = CString::new(name) else {
            return None;
        };
        let own = unsafe {
            match (self.kind, self.entry.get_device_proc_addr) {
                (ChainKind::Instance, _) => {
                    (self.entry.get_instance_proc_addr)(vk::Instance::from_raw(self.handle), c_name.as_ptr())
                }
                (ChainKind::Device, Some(gdpa)) => gdpa(vk::Device::from_raw(self.handle), c_name.as_ptr()),
                (ChainKind::Device, None) => None,
            }
        };
        if own.is_some() {
            loader_log!(DebugFlags::DEBUG | DebugFlags::LAYER, "{} answers {}", self.layer, name);
            return own;
        }
        self.next.proc_addr(name)
    }
}

// ── Native create calls ─────────────────────────────────────

fn name_pointers(names: &[CString]) -> Vec<*const c_char> {
    names.iter().map(|name| name.as_ptr()).collect()
}

/// Call the top native layer's `vkCreateInstance` for the loader instance
/// `instance`. The loader's own terminator sits at the bottom and only
/// confirms the handle, the drivers' instances already exist.
pub fn create_instance_chain(
    chain: &LinkedChain,
    instance: vk::Instance,
    info: &InstanceCreateInfo,
    layer_names: &[String],
) -> Result<(), LoaderError> {
    let Some(top) = chain.native.last() else {
        return Ok(());
    };

    let mut links: Vec<LayerInstanceLink> = Vec::with_capacity(chain.native.len());
    for index in 0..chain.native.len() {
        let (gipa, gpdpa) = match index.checked_sub(1) {
            Some(below) => (
                chain.native[below].entry.get_instance_proc_addr,
                chain.native[below].entry.get_physical_device_proc_addr,
            ),
            None => (terminator::native_get_instance_proc_addr as vk::PFN_vkGetInstanceProcAddr, None),
        };
        links.push(LayerInstanceLink {
            p_next: ptr::null_mut(),
            next_get_instance_proc_addr: gipa,
            next_get_physical_device_proc_addr: gpdpa,
        });
    }
    let base = links.as_mut_ptr();
    for index in 1..links.len() {
        unsafe { (*base.add(index)).p_next = base.add(index - 1) };
    }

    let callback = LayerInstanceCreateInfo {
        s_type: LOADER_INSTANCE_CREATE_INFO,
        p_next: ptr::null(),
        function: LOADER_DATA_CALLBACK,
        u: LayerInstanceCreateUnion {
            set_instance_loader_data: terminator::set_instance_loader_data,
        },
    };
    let mut link_info = LayerInstanceCreateInfo {
        s_type: LOADER_INSTANCE_CREATE_INFO,
        p_next: &callback as *const LayerInstanceCreateInfo as *const c_void,
        function: LAYER_LINK_INFO,
        u: LayerInstanceCreateUnion {
            layer_info: unsafe { base.add(links.len() - 1) },
        },
    };

    let application_name = info.application_name.as_deref().and_then(|name| CString::new(name).ok());
    let application_info = vk::ApplicationInfo {
        p_application_name: application_name.as_ref().map_or(ptr::null(), |name| name.as_ptr()),
        api_version: info.api_version,
        ..Default::default()
    };
    let layers = c_strings(layer_names)?;
    let layer_ptrs = name_pointers(&layers);
    let extensions = c_strings(&info.enabled_extensions)?;
    let extension_ptrs = name_pointers(&extensions);
    let create_info = vk::InstanceCreateInfo {
        p_next: &mut link_info as *mut LayerInstanceCreateInfo as *const c_void,
        p_application_info: &application_info,
        enabled_layer_count: layer_ptrs.len() as u32,
        pp_enabled_layer_names: layer_ptrs.as_ptr(),
        enabled_extension_count: extension_ptrs.len() as u32,
        pp_enabled_extension_names: extension_ptrs.as_ptr(),
        ..Default::default()
    };

    let create = unsafe {
        let entry = (top.entry.get_instance_proc_addr)(
            vk::Instance::null(),
            b"vkCreateInstance\0".as_ptr() as *const c_char,
        );
        cast_entry::<vk::PFN_vkCreateInstance>(entry)
    };
    let Some(create) = create else {
        loader_log!(DebugFlags::ERROR | DebugFlags::LAYER, "layer {} has no vkCreateInstance", top.name);
        return Err(CoreError::InitializationFailed(format!("layer {} has no vkCreateInstance", top.name)).into());
    };
    let mut created = instance;
    let result = unsafe { create(&create_info, HostAllocator::as_ptr(info.allocator.as_ref()), &mut created) };
    if result != vk::Result::SUCCESS {
        loader_log!(
            DebugFlags::ERROR | DebugFlags::LAYER,
            "vkCreateInstance through layer {} failed: {:?}",
            top.name,
            result
        );
        return Err(LoaderError::vulkan("vkCreateInstance", result));
    }
    if created != instance {
        return Err(CoreError::InitializationFailed("a layer replaced the instance handle".to_string()).into());
    }
    Ok(())
}

/// Call the top native layer's `vkCreateDevice` for `device`, which the
/// driver has already created. Layers see `physical_device` as the loader's
/// driver-facing handle.
pub fn create_device_chain(
    chain: &LinkedChain,
    instance: vk::Instance,
    physical_device: vk::PhysicalDevice,
    device: vk::Device,
    info: &DeviceCreateInfo,
) -> Result<(), LoaderError> {
    let Some(top) = chain.native.last() else {
        return Ok(());
    };

    let mut links: Vec<LayerDeviceLink> = Vec::with_capacity(chain.native.len());
    for index in 0..chain.native.len() {
        let (gipa, gdpa) = match index.checked_sub(1).map(|below| &chain.native[below].entry) {
            Some(below) => match below.get_device_proc_addr {
                Some(gdpa) => (below.get_instance_proc_addr, gdpa),
                None => {
                    return Err(CoreError::InitializationFailed(format!(
                        "layer {} has no device lookup",
                        chain.native[index - 1].name
                    ))
                    .into())
                }
            },
            None => (
                terminator::native_get_instance_proc_addr as vk::PFN_vkGetInstanceProcAddr,
                terminator::native_get_device_proc_addr as vk::PFN_vkGetDeviceProcAddr,
            ),
        };
        links.push(LayerDeviceLink {
            p_next: ptr::null_mut(),
            next_get_instance_proc_addr: gipa,
            next_get_device_proc_addr: gdpa,
        });
    }
    let base = links.as_mut_ptr();
    for index in 1..links.len() {
        unsafe { (*base.add(index)).p_next = base.add(index - 1) };
    }

    let callback = LayerDeviceCreateInfo {
        s_type: LOADER_DEVICE_CREATE_INFO,
        p_next: ptr::null(),
        function: LOADER_DATA_CALLBACK,
        u: LayerDeviceCreateUnion {
            set_device_loader_data: terminator::set_device_loader_data,
        },
    };
    let mut link_info = LayerDeviceCreateInfo {
        s_type: LOADER_DEVICE_CREATE_INFO,
        p_next: &callback as *const LayerDeviceCreateInfo as *const c_void,
        function: LAYER_LINK_INFO,
        u: LayerDeviceCreateUnion {
            layer_info: unsafe { base.add(links.len() - 1) },
        },
    };

    let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = info
        .queues
        .iter()
        .map(|queue| vk::DeviceQueueCreateInfo {
            queue_family_index: queue.family_index,
            queue_count: queue.priorities.len() as u32,
            p_queue_priorities: queue.priorities.as_ptr(),
            ..Default::default()
        })
        .collect();
    let extensions = c_strings(&info.enabled_extensions)?;
    let extension_ptrs = name_pointers(&extensions);
    let create_info = vk::DeviceCreateInfo {
        p_next: &mut link_info as *mut LayerDeviceCreateInfo as *const c_void,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extension_ptrs.len() as u32,
        pp_enabled_extension_names: extension_ptrs.as_ptr(),
        ..Default::default()
    };

    let create = unsafe {
        let entry = (top.entry.get_instance_proc_addr)(instance, b"vkCreateDevice\0".as_ptr() as *const c_char);
        cast_entry::<vk::PFN_vkCreateDevice>(entry)
    };
    let Some(create) = create else {
        loader_log!(DebugFlags::ERROR | DebugFlags::LAYER, "layer {} has no vkCreateDevice", top.name);
        return Err(CoreError::InitializationFailed(format!("layer {} has no vkCreateDevice", top.name)).into());
    };
    let mut created = device;
    let result = unsafe {
        create(
            physical_device,
            &create_info,
            HostAllocator::as_ptr(info.allocator.as_ref()),
            &mut created,
        )
    };
    if result != vk::Result::SUCCESS {
        loader_log!(
            DebugFlags::ERROR | DebugFlags::LAYER,
            "vkCreateDevice through layer {} failed: {:?}",
            top.name,
            result
        );
        return Err(LoaderError::vulkan("vkCreateDevice", result));
    }
    if created != device {
        return Err(CoreError::InitializationFailed("a layer replaced the device handle".to_string()).into());
    }
    Ok(())
}

// ── Bottom links ────────────────────────────────────────────

/// Bottom of an instance chain: the loader's own terminators.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceTerminatorLink;

impl ChainLink for InstanceTerminatorLink {
    fn proc_addr(&self, name: &str) -> EntryPoint {
        terminator::instance_terminator(name)
    }
}

/// Bottom of a device chain: the driver, with a few calls kept by the loader.
pub struct DeviceTerminatorLink {
    pub driver: Arc<dyn Driver>,
    pub instance: vk::Instance,
    pub device: vk::Device,
}

impl ChainLink for DeviceTerminatorLink {
    fn proc_addr(&self, name: &str) -> EntryPoint {
        match name {
            "vkDestroyDevice" => terminator::device_terminator(name),
            // Handles inside the name info need translating for the driver.
            "vkSetDebugUtilsObjectNameEXT" => {
                self.driver.device_proc_addr(self.instance, self.device, name)?;
                terminator::device_terminator(name)
            }
            _ => self.driver.device_proc_addr(self.instance, self.device, name),
        }
    }
}

/// A driver's own instance-level lookup, used for the per-driver table the
/// terminators forward through.
pub struct DriverLink {
    pub driver: Arc<dyn Driver>,
    pub instance: vk::Instance,
}

impl ChainLink for DriverLink {
    fn proc_addr(&self, name: &str) -> EntryPoint {
        self.driver.instance_proc_addr(self.instance, name)
    }
}
