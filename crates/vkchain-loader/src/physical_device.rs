//! Physical-device wrapping.
//!
//! Two wrappers exist for every driver physical device. The terminator
//! wrapper is what the bottom of the instance chain hands to layers; it names
//! the driver and the driver's own handle. The trampoline wrapper is what the
//! application sees; it records whatever handle the chain returned, so a
//! layer that wraps handles still receives its own handle back.
//!
//! Both lists live in the instance record and are reused across
//! enumerations. A handle is only dropped when its device disappears.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::config::DeviceSelectConfig;
use vkchain_core::error::try_push;
use vkchain_core::{ChainLink, CoreError};

use crate::dispatch::{
    cast_entry, raw_handle, DispatchTable, Dispatchable, TERMINATOR_MAGIC, TRAMPOLINE_MAGIC,
};
use crate::error::LoaderError;
use crate::handle_store::{self, Tagged};
use crate::instance::{live_instance, IcdRecord, InstanceRecord};
use crate::library::{enumerate_two_call, extension_properties, MIN_PHYSICAL_DEVICE_PROC_INTERFACE};

const _: () = assert!(std::mem::offset_of!(Dispatchable<PhysicalDeviceTrampoline>, dispatch) == 0);
const _: () = assert!(std::mem::offset_of!(Dispatchable<PhysicalDeviceTerminator>, dispatch) == 0);

pub type InstanceHandle = Arc<Dispatchable<InstanceRecord>>;
pub type TerminatorHandle = Arc<Dispatchable<PhysicalDeviceTerminator>>;
pub type TrampolineHandle = Arc<Dispatchable<PhysicalDeviceTrampoline>>;

// ── Wrappers ────────────────────────────────────────────────

/// Application-facing physical device.
pub struct PhysicalDeviceTrampoline {
    magic: AtomicU64,
    /// Raw handle of the owning instance.
    pub instance: u64,
    /// Handle returned by the top of the chain.
    pub next: vk::PhysicalDevice,
}

impl PhysicalDeviceTrampoline {
    pub(crate) fn invalidate(&self) {
        self.magic.store(0, Ordering::Release);
    }
}

impl Tagged for PhysicalDeviceTrampoline {
    const MAGIC: u64 = TRAMPOLINE_MAGIC;
    const KIND: &'static str = "physical device";

    fn magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }
}

impl fmt::Debug for PhysicalDeviceTrampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalDeviceTrampoline")
            .field("instance", &format_args!("{:#x}", self.instance))
            .field("next", &self.next)
            .finish()
    }
}

/// Driver-facing physical device, seen by the layers.
pub struct PhysicalDeviceTerminator {
    magic: AtomicU64,
    pub instance: u64,
    pub icd_index: usize,
    pub driver_handle: vk::PhysicalDevice,
}

impl PhysicalDeviceTerminator {
    pub(crate) fn invalidate(&self) {
        self.magic.store(0, Ordering::Release);
    }
}

impl Tagged for PhysicalDeviceTerminator {
    const MAGIC: u64 = TERMINATOR_MAGIC;
    const KIND: &'static str = "terminator physical device";

    fn magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }
}

impl fmt::Debug for PhysicalDeviceTerminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalDeviceTerminator")
            .field("instance", &format_args!("{:#x}", self.instance))
            .field("icd_index", &self.icd_index)
            .field("driver_handle", &self.driver_handle)
            .finish()
    }
}

// ── Terminator side ─────────────────────────────────────────

/// Enumerate every driver's devices and return their terminator wrappers,
/// reusing wrappers from earlier calls.
pub(crate) fn terminator_devices(instance: &InstanceHandle) -> Result<Vec<TerminatorHandle>, LoaderError> {
    let instance_handle = raw_handle(instance);
    let mut known = instance.terminators.lock();
    let mut current: Vec<TerminatorHandle> = Vec::new();

    for icd in &instance.icds {
        let handles = match icd.driver.enumerate_physical_devices(icd.instance) {
            Ok(handles) => handles,
            Err(e) => {
                loader_log!(
                    DebugFlags::WARN | DebugFlags::DRIVER,
                    "driver {} failed to enumerate physical devices: {}",
                    icd.driver.name(),
                    e
                );
                continue;
            }
        };
        for driver_handle in handles {
            let existing = known
                .iter()
                .find(|t| t.icd_index == icd.index && t.driver_handle == driver_handle)
                .cloned();
            let terminator = match existing {
                Some(terminator) => terminator,
                None => {
                    let dispatch: *const DispatchTable = icd.dispatch();
                    let terminator = Arc::new(Dispatchable::new(
                        dispatch,
                        PhysicalDeviceTerminator {
                            magic: AtomicU64::new(TERMINATOR_MAGIC),
                            instance: instance_handle,
                            icd_index: icd.index,
                            driver_handle,
                        },
                    ));
                    handle_store::store_terminator(raw_handle(&terminator), terminator.clone());
                    terminator
                }
            };
            try_push(&mut current, terminator)?;
        }
    }

    for stale in known.iter().filter(|t| !current.iter().any(|c| Arc::ptr_eq(c, t))) {
        loader_log!(
            DebugFlags::DRIVER,
            "physical device {:?} of driver {} disappeared",
            stale.driver_handle,
            stale.icd_index
        );
        handle_store::remove_terminator(raw_handle(stale));
        stale.invalidate();
    }

    sort_devices(instance, &mut current, &instance.settings.device_select);
    *known = current.clone();
    Ok(current)
}

/// Device groups across every driver. Drivers without group enumeration get
/// one single-device group per device.
pub(crate) fn terminator_groups(instance: &InstanceHandle) -> Result<Vec<Vec<TerminatorHandle>>, LoaderError> {
    let devices = terminator_devices(instance)?;
    let mut groups: Vec<Vec<TerminatorHandle>> = Vec::new();

    for icd in &instance.icds {
        let own: Vec<&TerminatorHandle> = devices.iter().filter(|t| t.icd_index == icd.index).collect();
        let driver_groups = if icd.supports_extended_enumeration {
            icd.driver.enumerate_physical_device_groups(icd.instance).unwrap_or_else(|e| {
                loader_log!(
                    DebugFlags::WARN | DebugFlags::DRIVER,
                    "driver {} failed to enumerate device groups: {}",
                    icd.driver.name(),
                    e
                );
                Vec::new()
            })
        } else {
            Vec::new()
        };

        if driver_groups.is_empty() {
            for terminator in own {
                try_push(&mut groups, vec![terminator.clone()])?;
            }
            continue;
        }
        for group in driver_groups {
            let members: Vec<TerminatorHandle> = group
                .iter()
                .filter_map(|handle| own.iter().find(|t| t.driver_handle == *handle).map(|t| (*t).clone()))
                .collect();
            if !members.is_empty() {
                try_push(&mut groups, members)?;
            }
        }
    }
    Ok(groups)
}

/// Properties straight from the driver that owns `terminator`.
pub(crate) fn driver_properties(icd: &IcdRecord, terminator: &PhysicalDeviceTerminator) -> Option<vk::PhysicalDeviceProperties> {
    let get = unsafe {
        cast_entry::<vk::PFN_vkGetPhysicalDeviceProperties>(icd.dispatch().get("vkGetPhysicalDeviceProperties"))
    }?;
    let mut props = vk::PhysicalDeviceProperties::default();
    unsafe { get(terminator.driver_handle, &mut props) };
    Some(props)
}

fn type_rank(device_type: vk::PhysicalDeviceType) -> u8 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        _ => 4,
    }
}

fn sort_devices(instance: &InstanceRecord, devices: &mut [TerminatorHandle], config: &DeviceSelectConfig) {
    if !config.sorting_enabled && config.select.is_none() {
        return;
    }
    let mut keyed: Vec<((bool, u8), TerminatorHandle)> = devices
        .iter()
        .map(|terminator| {
            let props = instance
                .icds
                .get(terminator.icd_index)
                .and_then(|icd| driver_properties(icd, terminator));
            let selected = match (config.select, props) {
                (Some(selector), Some(props)) => {
                    props.vendor_id == selector.vendor_id && props.device_id == selector.device_id
                }
                _ => false,
            };
            let rank = match (config.sorting_enabled, props) {
                (true, Some(props)) => type_rank(props.device_type),
                _ => 0,
            };
            ((!selected, rank), terminator.clone())
        })
        .collect();
    keyed.sort_by_key(|(key, _)| *key);
    for (slot, (_, terminator)) in devices.iter_mut().zip(keyed) {
        *slot = terminator;
    }
}

// ── Trampoline side ─────────────────────────────────────────

/// Wrap handles returned by the chain. With `prune`, trampolines whose handle
/// was not returned are invalidated.
fn wrap_physical_devices(
    instance: &InstanceHandle,
    next_handles: &[vk::PhysicalDevice],
    prune: bool,
) -> Result<Vec<vk::PhysicalDevice>, LoaderError> {
    let instance_handle = raw_handle(instance);
    let dispatch: *const DispatchTable = instance.table();
    let mut trampolines = instance.trampolines.lock();
    let mut out: Vec<vk::PhysicalDevice> = Vec::new();

    for next in next_handles {
        let existing = trampolines.iter().find(|t| t.next == *next).cloned();
        let trampoline = match existing {
            Some(trampoline) => trampoline,
            None => {
                let trampoline = Arc::new(Dispatchable::new(
                    dispatch,
                    PhysicalDeviceTrampoline {
                        magic: AtomicU64::new(TRAMPOLINE_MAGIC),
                        instance: instance_handle,
                        next: *next,
                    },
                ));
                handle_store::store_trampoline(raw_handle(&trampoline), trampoline.clone());
                try_push(&mut *trampolines, trampoline.clone())?;
                trampoline
            }
        };
        try_push(&mut out, vk::PhysicalDevice::from_raw(raw_handle(&trampoline)))?;
    }

    if prune {
        trampolines.retain(|trampoline| {
            let keep = next_handles.contains(&trampoline.next);
            if !keep {
                handle_store::remove_trampoline(raw_handle(trampoline));
                trampoline.invalidate();
            }
            keep
        });
    }
    Ok(out)
}

/// Physical devices of `instance`, as seen through its layers.
pub fn enumerate_physical_devices(handle: vk::Instance) -> Result<Vec<vk::PhysicalDevice>, LoaderError> {
    let instance = handle_store::unwrap_instance(handle)?;
    let enumerate = unsafe {
        cast_entry::<vk::PFN_vkEnumeratePhysicalDevices>(instance.table().get("vkEnumeratePhysicalDevices"))
    }
    .ok_or_else(|| CoreError::FunctionNotSupported("vkEnumeratePhysicalDevices".to_string()))?;
    let next_handles = enumerate_two_call(vk::PhysicalDevice::null(), |count, out| unsafe {
        enumerate(handle, count, out)
    })
    .map_err(|result| LoaderError::vulkan("vkEnumeratePhysicalDevices", result))?;
    wrap_physical_devices(&instance, &next_handles, true)
}

pub fn enumerate_physical_device_groups(handle: vk::Instance) -> Result<Vec<Vec<vk::PhysicalDevice>>, LoaderError> {
    let instance = handle_store::unwrap_instance(handle)?;
    let enumerate = unsafe {
        cast_entry::<vk::PFN_vkEnumeratePhysicalDeviceGroups>(instance.table().get("vkEnumeratePhysicalDeviceGroups"))
    }
    .ok_or_else(|| CoreError::FunctionNotSupported("vkEnumeratePhysicalDeviceGroups".to_string()))?;
    let groups = enumerate_two_call(vk::PhysicalDeviceGroupProperties::default(), |count, out| unsafe {
        enumerate(handle, count, out)
    })
    .map_err(|result| LoaderError::vulkan("vkEnumeratePhysicalDeviceGroups", result))?;

    let mut out = Vec::new();
    for group in &groups {
        let count = (group.physical_device_count as usize).min(group.physical_devices.len());
        let wrapped = wrap_physical_devices(&instance, &group.physical_devices[..count], false)?;
        try_push(&mut out, wrapped)?;
    }
    Ok(out)
}

/// The next entry point for a known physical-device command, together with
/// the handle that entry point expects.
fn next_link<F: Copy>(handle: vk::PhysicalDevice, command: &'static str) -> Result<(F, vk::PhysicalDevice), LoaderError> {
    let trampoline = handle_store::unwrap_trampoline(handle)?;
    let instance = live_instance(trampoline.instance)?;
    let entry = unsafe { cast_entry::<F>(instance.table().get(command)) }
        .ok_or_else(|| CoreError::FunctionNotSupported(command.to_string()))?;
    Ok((entry, trampoline.next))
}

pub fn physical_device_properties(handle: vk::PhysicalDevice) -> Result<vk::PhysicalDeviceProperties, LoaderError> {
    let (get, next) = next_link::<vk::PFN_vkGetPhysicalDeviceProperties>(handle, "vkGetPhysicalDeviceProperties")?;
    let mut props = vk::PhysicalDeviceProperties::default();
    unsafe { get(next, &mut props) };
    Ok(props)
}

pub fn physical_device_features(handle: vk::PhysicalDevice) -> Result<vk::PhysicalDeviceFeatures, LoaderError> {
    let (get, next) = next_link::<vk::PFN_vkGetPhysicalDeviceFeatures>(handle, "vkGetPhysicalDeviceFeatures")?;
    let mut features = vk::PhysicalDeviceFeatures::default();
    unsafe { get(next, &mut features) };
    Ok(features)
}

pub fn physical_device_memory_properties(
    handle: vk::PhysicalDevice,
) -> Result<vk::PhysicalDeviceMemoryProperties, LoaderError> {
    let (get, next) =
        next_link::<vk::PFN_vkGetPhysicalDeviceMemoryProperties>(handle, "vkGetPhysicalDeviceMemoryProperties")?;
    let mut props = vk::PhysicalDeviceMemoryProperties::default();
    unsafe { get(next, &mut props) };
    Ok(props)
}

pub fn queue_family_properties(handle: vk::PhysicalDevice) -> Result<Vec<vk::QueueFamilyProperties>, LoaderError> {
    let (get, next) = next_link::<vk::PFN_vkGetPhysicalDeviceQueueFamilyProperties>(
        handle,
        "vkGetPhysicalDeviceQueueFamilyProperties",
    )?;
    let mut count = 0u32;
    unsafe { get(next, &mut count, std::ptr::null_mut()) };
    let mut families = Vec::new();
    families.try_reserve_exact(count as usize).map_err(CoreError::from)?;
    families.resize(count as usize, vk::QueueFamilyProperties::default());
    unsafe { get(next, &mut count, families.as_mut_ptr()) };
    families.truncate(count as usize);
    Ok(families)
}

/// Device extensions of a physical device, or of one enabled layer.
pub fn enumerate_device_extensions(
    handle: vk::PhysicalDevice,
    layer_name: Option<&str>,
) -> Result<Vec<vk::ExtensionProperties>, LoaderError> {
    if let Some(name) = layer_name {
        let trampoline = handle_store::unwrap_trampoline(handle)?;
        let instance = live_instance(trampoline.instance)?;
        let layer = instance
            .layers
            .expanded
            .iter()
            .find(|layer| layer.name == name)
            .ok_or_else(|| CoreError::LayerNotPresent(name.to_string()))?;
        return Ok(layer
            .device_extensions
            .iter()
            .map(|ext| extension_properties(&ext.name, ext.spec_version))
            .collect());
    }
    let (enumerate, next) = next_link::<vk::PFN_vkEnumerateDeviceExtensionProperties>(
        handle,
        "vkEnumerateDeviceExtensionProperties",
    )?;
    enumerate_two_call(vk::ExtensionProperties::default(), |count, out| unsafe {
        enumerate(next, std::ptr::null(), count, out)
    })
    .map_err(|result| LoaderError::vulkan("vkEnumerateDeviceExtensionProperties", result))
}

// ── Unknown physical-device functions ───────────────────────

/// A resolved physical-device function and the handle to call it with.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceFunction {
    pub entry: unsafe extern "system" fn(),
    pub handle: vk::PhysicalDevice,
}

/// Resolve a physical-device function the loader has no fixed slot for.
///
/// A layer that answers for `name` is called with the trampoline's next
/// handle. Otherwise the call goes straight to the owning driver with the
/// driver's handle.
pub fn physical_device_function(handle: vk::PhysicalDevice, name: &str) -> Result<PhysicalDeviceFunction, LoaderError> {
    let trampoline = handle_store::unwrap_trampoline(handle)?;
    let instance = live_instance(trampoline.instance)?;

    let index = match instance.unknown_physical_device_functions.index_of(name) {
        Some(index) => index,
        None => {
            let driver_support = instance.icds.iter().any(|icd| {
                icd.driver.interface_version() >= MIN_PHYSICAL_DEVICE_PROC_INTERFACE
                    && icd.driver.physical_device_proc_addr(icd.instance, name).is_some()
            });
            if !driver_support && instance.top().proc_addr(name).is_none() {
                return Err(CoreError::FunctionNotSupported(name.to_string()).into());
            }
            instance.unknown_physical_device_functions.assign(name)?
        }
    };

    let layer_entry = instance
        .table()
        .unknown_slot(index)
        .and_then(|slot| *slot.get_or_init(|| instance.top().proc_addr(name)));
    if let Some(entry) = layer_entry {
        return Ok(PhysicalDeviceFunction {
            entry,
            handle: trampoline.next,
        });
    }

    let terminator = handle_store::unwrap_terminator(trampoline.next)?;
    let icd = instance
        .icds
        .get(terminator.icd_index)
        .ok_or_else(|| LoaderError::invalid_handle(format!("driver index {}", terminator.icd_index)))?;
    let driver_entry = icd.dispatch().unknown_slot(index).and_then(|slot| {
        *slot.get_or_init(|| {
            if icd.driver.interface_version() >= MIN_PHYSICAL_DEVICE_PROC_INTERFACE {
                icd.driver.physical_device_proc_addr(icd.instance, name)
            } else {
                None
            }
        })
    });
    match driver_entry {
        Some(entry) => Ok(PhysicalDeviceFunction {
            entry,
            handle: terminator.driver_handle,
        }),
        None => {
            loader_log!(
                DebugFlags::WARN | DebugFlags::DRIVER,
                "driver {} does not support {}",
                icd.driver.name(),
                name
            );
            Err(CoreError::FunctionNotSupported(name.to_string()).into())
        }
    }
}
