//! Layer and driver libraries.
//!
//! [`LibraryOpener`] is the seam between the loader and shared objects.
//! [`NativeLibraries`] opens them with `libloading` and negotiates the loader
//! interface version; [`StaticLibraries`] serves in-process implementations
//! registered under their manifest library paths.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use ash::vk;
use libloading::{Library, Symbol};
use parking_lot::{const_mutex, Mutex};
use tracing::{debug, info};
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::{
    CoreError, DriverManifest, EntryPoint, GetPhysicalDeviceProcAddr, Interposer, LayerRecord, NativeEntryPoints,
};

use crate::dispatch::cast_entry;
use crate::error::LoaderError;

/// Highest layer interface version this loader speaks.
pub const LAYER_INTERFACE_VERSION: u32 = 2;
/// Highest driver interface version this loader speaks.
pub const DRIVER_INTERFACE_VERSION: u32 = 7;
/// Drivers below this version do not export a physical-device proc lookup.
pub const MIN_PHYSICAL_DEVICE_PROC_INTERFACE: u32 = 4;

/// Serialises every open and close. Never taken on the dispatch path.
static LIBRARY_LOCK: Mutex<()> = const_mutex(());

// ── Creation parameters ─────────────────────────────────────

/// Application allocation callbacks, carried through to drivers.
#[derive(Debug, Clone, Copy)]
pub struct HostAllocator(pub vk::AllocationCallbacks<'static>);

// The callbacks are plain function pointers plus the application's user
// data pointer, which the application owns for the object's lifetime.
unsafe impl Send for HostAllocator {}
unsafe impl Sync for HostAllocator {}

impl HostAllocator {
    pub fn as_ptr(allocator: Option<&HostAllocator>) -> *const vk::AllocationCallbacks<'static> {
        allocator.map_or(ptr::null(), |a| &a.0 as *const _)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriverInstanceInfo {
    pub application_name: Option<String>,
    pub api_version: u32,
    pub extensions: Vec<String>,
    pub allocator: Option<HostAllocator>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueRequest {
    pub family_index: u32,
    pub priorities: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct DriverDeviceInfo {
    pub queues: Vec<QueueRequest>,
    pub extensions: Vec<String>,
    pub allocator: Option<HostAllocator>,
}

// ── Traits ──────────────────────────────────────────────────

/// A loaded driver. Handles passed in and out are the driver's own.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn interface_version(&self) -> u32;

    /// Whether the driver reports device groups itself.
    fn supports_extended_enumeration(&self) -> bool {
        false
    }

    fn instance_extensions(&self) -> Result<Vec<vk::ExtensionProperties>, LoaderError>;

    fn create_instance(&self, info: &DriverInstanceInfo) -> Result<vk::Instance, LoaderError>;

    fn destroy_instance(&self, instance: vk::Instance, allocator: Option<&HostAllocator>);

    fn enumerate_physical_devices(&self, instance: vk::Instance) -> Result<Vec<vk::PhysicalDevice>, LoaderError>;

    fn enumerate_physical_device_groups(
        &self,
        _instance: vk::Instance,
    ) -> Result<Vec<Vec<vk::PhysicalDevice>>, LoaderError> {
        Ok(Vec::new())
    }

    fn device_extensions(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, LoaderError>;

    fn create_device(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        info: &DriverDeviceInfo,
    ) -> Result<vk::Device, LoaderError>;

    fn destroy_device(&self, instance: vk::Instance, device: vk::Device, allocator: Option<&HostAllocator>);

    fn instance_proc_addr(&self, instance: vk::Instance, name: &str) -> EntryPoint;

    fn physical_device_proc_addr(&self, _instance: vk::Instance, _name: &str) -> EntryPoint {
        None
    }

    fn device_proc_addr(&self, instance: vk::Instance, device: vk::Device, name: &str) -> EntryPoint;
}

pub trait LibraryOpener: Send + Sync {
    fn open_layer(&self, layer: &LayerRecord) -> Result<Arc<dyn Interposer>, LoaderError>;

    fn open_driver(&self, manifest: &DriverManifest) -> Result<Arc<dyn Driver>, LoaderError>;
}

// ── Shared objects ──────────────────────────────────────────

struct LoadedLibrary {
    path: PathBuf,
    library: Option<Library>,
}

impl LoadedLibrary {
    fn open(path: &Path) -> Result<Self, LoaderError> {
        let _guard = LIBRARY_LOCK.lock();
        match unsafe { Library::new(path) } {
            Ok(library) => {
                info!("loaded {}", path.display());
                Ok(LoadedLibrary {
                    path: path.to_path_buf(),
                    library: Some(library),
                })
            }
            Err(source) => {
                debug!("failed to load {}: {}", path.display(), source);
                Err(LoaderError::Library {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    unsafe fn symbol<F: Copy>(&self, name: &str) -> Option<F> {
        let library = self.library.as_ref()?;
        unsafe { library.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
    }

    unsafe fn require<F: Copy>(&self, name: &str) -> Result<F, LoaderError> {
        unsafe { self.symbol(name) }.ok_or_else(|| LoaderError::MissingSymbol {
            path: self.path.clone(),
            symbol: name.to_string(),
        })
    }
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        let _guard = LIBRARY_LOCK.lock();
        if self.library.take().is_some() {
            debug!("unloaded {}", self.path.display());
        }
    }
}

/// Opens layer and driver libraries from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLibraries;

impl LibraryOpener for NativeLibraries {
    fn open_layer(&self, layer: &LayerRecord) -> Result<Arc<dyn Interposer>, LoaderError> {
        Ok(Arc::new(NativeLayer::open(layer)?))
    }

    fn open_driver(&self, manifest: &DriverManifest) -> Result<Arc<dyn Driver>, LoaderError> {
        Ok(Arc::new(NativeDriver::open(manifest)?))
    }
}

// ── Native layers ───────────────────────────────────────────

const LAYER_NEGOTIATE_INTERFACE_STRUCT: u32 = 1;
const DEFAULT_LAYER_NEGOTIATE: &str = "vkNegotiateLoaderLayerInterfaceVersion";

type FnNegotiateLayerInterface = unsafe extern "system" fn(*mut NegotiateLayerInterface) -> vk::Result;
type FnNegotiateDriverInterface = unsafe extern "system" fn(*mut u32) -> vk::Result;

#[repr(C)]
struct NegotiateLayerInterface {
    s_type: u32,
    p_next: *mut c_void,
    loader_layer_interface_version: u32,
    get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    get_physical_device_proc_addr: Option<GetPhysicalDeviceProcAddr>,
}

struct NativeLayer {
    interface_version: u32,
    gipa: vk::PFN_vkGetInstanceProcAddr,
    gdpa: Option<vk::PFN_vkGetDeviceProcAddr>,
    gpdpa: Option<GetPhysicalDeviceProcAddr>,
    /// Global query overrides named in the manifest, by command.
    pre_instance: Vec<(String, EntryPoint)>,
    _library: LoadedLibrary,
}

impl NativeLayer {
    fn open(layer: &LayerRecord) -> Result<Self, LoaderError> {
        let path = layer.library_path.as_deref().ok_or_else(|| {
            CoreError::InitializationFailed(format!("layer {} has no library", layer.name))
        })?;
        let library = LoadedLibrary::open(path)?;
        let functions = &layer.functions;

        let negotiate_name = functions
            .negotiate_interface
            .as_deref()
            .unwrap_or(DEFAULT_LAYER_NEGOTIATE);
        let negotiate: Option<FnNegotiateLayerInterface> = unsafe { library.symbol(negotiate_name) };

        let mut interface_version = 1;
        let mut gipa = None;
        let mut gdpa = None;
        let mut gpdpa = None;
        if let Some(negotiate) = negotiate {
            let mut request = NegotiateLayerInterface {
                s_type: LAYER_NEGOTIATE_INTERFACE_STRUCT,
                p_next: ptr::null_mut(),
                loader_layer_interface_version: LAYER_INTERFACE_VERSION,
                get_instance_proc_addr: None,
                get_device_proc_addr: None,
                get_physical_device_proc_addr: None,
            };
            let result = unsafe { negotiate(&mut request) };
            if result != vk::Result::SUCCESS {
                loader_log!(
                    DebugFlags::WARN | DebugFlags::LAYER,
                    "layer {} rejected interface version {}: {:?}",
                    layer.name,
                    LAYER_INTERFACE_VERSION,
                    result
                );
                return Err(CoreError::IncompatibleDriver(layer.name.clone()).into());
            }
            interface_version = request.loader_layer_interface_version.min(LAYER_INTERFACE_VERSION);
            gipa = request.get_instance_proc_addr;
            gdpa = request.get_device_proc_addr;
            gpdpa = request.get_physical_device_proc_addr;
        }

        let gipa = match gipa {
            Some(gipa) => gipa,
            None => {
                let symbol = functions
                    .get_instance_proc_addr
                    .as_deref()
                    .unwrap_or("vkGetInstanceProcAddr");
                unsafe { library.require(symbol)? }
            }
        };
        if gdpa.is_none() {
            let symbol = functions
                .get_device_proc_addr
                .as_deref()
                .unwrap_or("vkGetDeviceProcAddr");
            gdpa = unsafe { library.symbol(symbol) };
        }

        let mut pre_instance = Vec::new();
        for (command, symbol) in &layer.pre_instance_functions {
            match unsafe { library.symbol::<unsafe extern "system" fn()>(symbol) } {
                Some(entry) => pre_instance.push((command.clone(), Some(entry))),
                None => loader_log!(
                    DebugFlags::WARN | DebugFlags::LAYER,
                    "layer {} does not export {} for {}",
                    layer.name,
                    symbol,
                    command
                ),
            }
        }

        loader_log!(
            DebugFlags::LAYER,
            "layer {} negotiated interface version {}",
            layer.name,
            interface_version
        );
        Ok(NativeLayer {
            interface_version,
            gipa,
            gdpa,
            gpdpa,
            pre_instance,
            _library: library,
        })
    }
}

impl Interposer for NativeLayer {
    fn interface_version(&self) -> u32 {
        self.interface_version
    }

    fn native_entry_points(&self) -> Option<NativeEntryPoints> {
        Some(NativeEntryPoints {
            get_instance_proc_addr: self.gipa,
            get_device_proc_addr: self.gdpa,
            get_physical_device_proc_addr: self.gpdpa,
        })
    }

    fn pre_instance_function(&self, command: &str) -> EntryPoint {
        self.pre_instance
            .iter()
            .find(|(name, _)| name == command)
            .and_then(|(_, entry)| *entry)
    }
}

// ── Native drivers ──────────────────────────────────────────

struct NativeDriver {
    name: String,
    interface_version: u32,
    extended_enumeration: bool,
    gipa: vk::PFN_vkGetInstanceProcAddr,
    gpdpa: Option<GetPhysicalDeviceProcAddr>,
    _library: LoadedLibrary,
}

impl NativeDriver {
    fn open(manifest: &DriverManifest) -> Result<Self, LoaderError> {
        let library = LoadedLibrary::open(&manifest.library_path)?;

        let negotiate: Option<FnNegotiateDriverInterface> =
            unsafe { library.symbol("vk_icdNegotiateLoaderICDInterfaceVersion") };
        let interface_version = match negotiate {
            Some(negotiate) => {
                let mut version = DRIVER_INTERFACE_VERSION;
                let result = unsafe { negotiate(&mut version) };
                if result != vk::Result::SUCCESS {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::DRIVER,
                        "driver {} failed interface negotiation: {:?}",
                        manifest.library_path.display(),
                        result
                    );
                    return Err(CoreError::IncompatibleDriver(manifest.file_name()).into());
                }
                version.min(DRIVER_INTERFACE_VERSION)
            }
            None => 1,
        };

        let gipa: vk::PFN_vkGetInstanceProcAddr = match unsafe { library.symbol("vk_icdGetInstanceProcAddr") } {
            Some(gipa) => gipa,
            None => unsafe { library.require("vkGetInstanceProcAddr")? },
        };
        let gpdpa = if interface_version >= MIN_PHYSICAL_DEVICE_PROC_INTERFACE {
            unsafe { library.symbol("vk_icdGetPhysicalDeviceProcAddr") }
        } else {
            None
        };

        loader_log!(
            DebugFlags::DRIVER,
            "driver {} negotiated interface version {}",
            manifest.library_path.display(),
            interface_version
        );
        Ok(NativeDriver {
            name: manifest.file_name(),
            interface_version,
            extended_enumeration: manifest.api_version >= vk::API_VERSION_1_1,
            gipa,
            gpdpa,
            _library: library,
        })
    }

    fn lookup<F: Copy>(&self, instance: vk::Instance, name: &str) -> Result<F, LoaderError> {
        unsafe { cast_entry(self.instance_proc_addr(instance, name)) }.ok_or_else(|| {
            LoaderError::MissingSymbol {
                path: PathBuf::from(&self.name),
                symbol: name.to_string(),
            }
        })
    }
}

pub(crate) fn c_strings(names: &[String]) -> Result<Vec<CString>, LoaderError> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|_| LoaderError::Core(CoreError::ExtensionNotPresent(name.clone())))
        })
        .collect()
}

impl Driver for NativeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn interface_version(&self) -> u32 {
        self.interface_version
    }

    fn supports_extended_enumeration(&self) -> bool {
        self.extended_enumeration
    }

    fn instance_extensions(&self) -> Result<Vec<vk::ExtensionProperties>, LoaderError> {
        let enumerate: vk::PFN_vkEnumerateInstanceExtensionProperties =
            self.lookup(vk::Instance::null(), "vkEnumerateInstanceExtensionProperties")?;
        enumerate_two_call(vk::ExtensionProperties::default(), |count, out| unsafe {
            enumerate(ptr::null(), count, out)
        })
        .map_err(|result| LoaderError::vulkan("vkEnumerateInstanceExtensionProperties", result))
    }

    fn create_instance(&self, info: &DriverInstanceInfo) -> Result<vk::Instance, LoaderError> {
        let create: vk::PFN_vkCreateInstance = self.lookup(vk::Instance::null(), "vkCreateInstance")?;
        let application_name = info
            .application_name
            .as_deref()
            .and_then(|name| CString::new(name).ok());
        let extensions = c_strings(&info.extensions)?;
        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let mut app_info = vk::ApplicationInfo::default().api_version(info.api_version);
        if let Some(name) = &application_name {
            app_info = app_info.application_name(name);
        }
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs);

        let mut instance = vk::Instance::null();
        let result = unsafe {
            create(
                &create_info,
                HostAllocator::as_ptr(info.allocator.as_ref()),
                &mut instance,
            )
        };
        if result != vk::Result::SUCCESS {
            return Err(LoaderError::vulkan("vkCreateInstance", result));
        }
        Ok(instance)
    }

    fn destroy_instance(&self, instance: vk::Instance, allocator: Option<&HostAllocator>) {
        if let Ok(destroy) = self.lookup::<vk::PFN_vkDestroyInstance>(instance, "vkDestroyInstance") {
            unsafe { destroy(instance, HostAllocator::as_ptr(allocator)) };
        }
    }

    fn enumerate_physical_devices(&self, instance: vk::Instance) -> Result<Vec<vk::PhysicalDevice>, LoaderError> {
        let enumerate: vk::PFN_vkEnumeratePhysicalDevices =
            self.lookup(instance, "vkEnumeratePhysicalDevices")?;
        enumerate_two_call(vk::PhysicalDevice::null(), |count, out| unsafe {
            enumerate(instance, count, out)
        })
        .map_err(|result| LoaderError::vulkan("vkEnumeratePhysicalDevices", result))
    }

    fn enumerate_physical_device_groups(
        &self,
        instance: vk::Instance,
    ) -> Result<Vec<Vec<vk::PhysicalDevice>>, LoaderError> {
        let Ok(enumerate) =
            self.lookup::<vk::PFN_vkEnumeratePhysicalDeviceGroups>(instance, "vkEnumeratePhysicalDeviceGroups")
        else {
            return Ok(Vec::new());
        };
        let groups = enumerate_two_call(vk::PhysicalDeviceGroupProperties::default(), |count, out| unsafe {
            enumerate(instance, count, out)
        })
        .map_err(|result| LoaderError::vulkan("vkEnumeratePhysicalDeviceGroups", result))?;
        Ok(groups
            .iter()
            .map(|group| {
                let count = (group.physical_device_count as usize).min(group.physical_devices.len());
                group.physical_devices[..count].to_vec()
            })
            .collect())
    }

    fn device_extensions(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, LoaderError> {
        let enumerate: vk::PFN_vkEnumerateDeviceExtensionProperties =
            self.lookup(instance, "vkEnumerateDeviceExtensionProperties")?;
        enumerate_two_call(vk::ExtensionProperties::default(), |count, out| unsafe {
            enumerate(physical_device, ptr::null(), count, out)
        })
        .map_err(|result| LoaderError::vulkan("vkEnumerateDeviceExtensionProperties", result))
    }

    fn create_device(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        info: &DriverDeviceInfo,
    ) -> Result<vk::Device, LoaderError> {
        let create: vk::PFN_vkCreateDevice = self.lookup(instance, "vkCreateDevice")?;
        let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = info
            .queues
            .iter()
            .map(|queue| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(queue.family_index)
                    .queue_priorities(&queue.priorities)
            })
            .collect();
        let extensions = c_strings(&info.extensions)?;
        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);

        let mut device = vk::Device::null();
        let result = unsafe {
            create(
                physical_device,
                &create_info,
                HostAllocator::as_ptr(info.allocator.as_ref()),
                &mut device,
            )
        };
        if result != vk::Result::SUCCESS {
            return Err(LoaderError::vulkan("vkCreateDevice", result));
        }
        Ok(device)
    }

    fn destroy_device(&self, instance: vk::Instance, device: vk::Device, allocator: Option<&HostAllocator>) {
        let entry = self.device_proc_addr(instance, device, "vkDestroyDevice");
        if let Some(destroy) = unsafe { cast_entry::<vk::PFN_vkDestroyDevice>(entry) } {
            unsafe { destroy(device, HostAllocator::as_ptr(allocator)) };
        }
    }

    fn instance_proc_addr(&self, instance: vk::Instance, name: &str) -> EntryPoint {
        let name = CString::new(name).ok()?;
        unsafe { (self.gipa)(instance, name.as_ptr()) }
    }

    fn physical_device_proc_addr(&self, instance: vk::Instance, name: &str) -> EntryPoint {
        let gpdpa = self.gpdpa?;
        let name = CString::new(name).ok()?;
        unsafe { gpdpa(instance, name.as_ptr()) }
    }

    fn device_proc_addr(&self, instance: vk::Instance, device: vk::Device, name: &str) -> EntryPoint {
        let gdpa: vk::PFN_vkGetDeviceProcAddr = self.lookup(instance, "vkGetDeviceProcAddr").ok()?;
        let name = CString::new(name).ok()?;
        unsafe { gdpa(device, name.as_ptr()) }
    }
}

// ── In-process libraries ────────────────────────────────────

/// Layers and drivers implemented in Rust, registered by library path.
#[derive(Default, Clone)]
pub struct StaticLibraries {
    layers: HashMap<PathBuf, Arc<dyn Interposer>>,
    drivers: HashMap<PathBuf, Arc<dyn Driver>>,
}

impl StaticLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, library_path: impl Into<PathBuf>, layer: Arc<dyn Interposer>) -> Self {
        self.layers.insert(library_path.into(), layer);
        self
    }

    pub fn with_driver(mut self, library_path: impl Into<PathBuf>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(library_path.into(), driver);
        self
    }
}

impl LibraryOpener for StaticLibraries {
    fn open_layer(&self, layer: &LayerRecord) -> Result<Arc<dyn Interposer>, LoaderError> {
        let path = layer.library_path.clone().unwrap_or_default();
        self.layers
            .get(&path)
            .cloned()
            .ok_or(LoaderError::Unavailable(path))
    }

    fn open_driver(&self, manifest: &DriverManifest) -> Result<Arc<dyn Driver>, LoaderError> {
        self.drivers
            .get(&manifest.library_path)
            .cloned()
            .ok_or_else(|| LoaderError::Unavailable(manifest.library_path.clone()))
    }
}

// ── Helpers ─────────────────────────────────────────────────

/// Run the usual count-then-fill query until the list stops growing.
pub(crate) fn enumerate_two_call<T: Clone>(
    empty: T,
    mut call: impl FnMut(*mut u32, *mut T) -> vk::Result,
) -> Result<Vec<T>, vk::Result> {
    loop {
        let mut count = 0u32;
        let result = call(&mut count as *mut u32, ptr::null_mut());
        if result != vk::Result::SUCCESS {
            return Err(result);
        }
        let mut items = vec![empty.clone(); count as usize];
        let result = call(&mut count as *mut u32, items.as_mut_ptr());
        match result {
            vk::Result::SUCCESS => {
                items.truncate(count as usize);
                return Ok(items);
            }
            vk::Result::INCOMPLETE => continue,
            other => return Err(other),
        }
    }
}

/// Copy `name` into a fixed-size, NUL-terminated API string field.
pub fn copy_name(dst: &mut [c_char], name: &str) {
    if dst.is_empty() {
        return;
    }
    let bytes = name.as_bytes();
    let len = bytes.len().min(dst.len() - 1);
    for (d, b) in dst.iter_mut().zip(&bytes[..len]) {
        *d = *b as c_char;
    }
    dst[len] = 0;
}

/// Read a fixed-size, NUL-terminated API string field.
pub fn fixed_name(src: &[c_char]) -> String {
    let bytes: Vec<u8> = src.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn extension_properties(name: &str, spec_version: u32) -> vk::ExtensionProperties {
    let mut props = vk::ExtensionProperties {
        spec_version,
        ..Default::default()
    };
    copy_name(&mut props.extension_name, name);
    props
}

pub fn extension_name(props: &vk::ExtensionProperties) -> String {
    fixed_name(&props.extension_name)
}
