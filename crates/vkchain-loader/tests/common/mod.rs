//! Shared fixtures for the loader integration tests: an in-process driver, a
//! layer that records how it was linked, and a filesystem with nothing on it.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use vkchain_common::MapEnvironment;
use vkchain_core::catalog::MemoryCatalog;
use vkchain_core::fs::FileSystem;
use vkchain_core::{ChainLink, CoreError, DriverManifest, EntryPoint, Interposer, LayerRecord};
use vkchain_loader::library::extension_properties;
use vkchain_loader::{
    entry_point, Driver, DriverDeviceInfo, DriverInstanceInfo, DriverObject, HostAllocator, Loader, LoaderError,
    StaticLibraries,
};

pub const MOCK_DEVICE_FUNCTION: &str = "vkCmdMockVendorEXT";
pub const MOCK_PHYSICAL_DEVICE_FUNCTION: &str = "vkGetPhysicalDeviceMockDataEXT";

// ── Filesystem ──────────────────────────────────────────────

/// No files anywhere, so no settings file is ever found.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyFileSystem;

impl FileSystem for EmptyFileSystem {
    fn exists(&self, _path: &Path) -> bool {
        false
    }

    fn read_to_string(&self, path: &Path) -> Result<String, CoreError> {
        Err(CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            path.display().to_string(),
        )))
    }

    fn json_files(&self, _dir: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    fn executable_path(&self) -> Option<PathBuf> {
        None
    }
}

// ── Driver ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDevice {
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
}

impl MockDevice {
    pub fn discrete(vendor_id: u32, device_id: u32) -> Self {
        MockDevice {
            vendor_id,
            device_id,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
        }
    }

    pub fn integrated(vendor_id: u32, device_id: u32) -> Self {
        MockDevice {
            vendor_id,
            device_id,
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
        }
    }

    fn encode(&self) -> u64 {
        ((self.vendor_id as u64) << 32) | ((self.device_id as u64 & 0xFF_FFFF) << 8) | (self.device_type.as_raw() as u64 & 0xFF)
    }

    fn decode(id: u64) -> Self {
        MockDevice {
            vendor_id: (id >> 32) as u32,
            device_id: ((id >> 8) & 0xFF_FFFF) as u32,
            device_type: vk::PhysicalDeviceType::from_raw((id & 0xFF) as i32),
        }
    }
}

/// Physical-device handles are [`DriverObject`]s whose id encodes the
/// device, so the exported query functions need no driver state.
pub struct MockDriver {
    name: String,
    interface_version: u32,
    extended_enumeration: bool,
    object_naming: bool,
    instance_extensions: Vec<String>,
    device_extensions: Vec<String>,
    devices: Mutex<Vec<vk::PhysicalDevice>>,
    next_id: AtomicU64,
    pub instances_created: AtomicUsize,
    pub instances_destroyed: AtomicUsize,
    pub devices_created: AtomicUsize,
    pub devices_destroyed: AtomicUsize,
}

impl MockDriver {
    pub fn new(name: &str, devices: &[MockDevice]) -> Self {
        let handles = devices
            .iter()
            .map(|device| vk::PhysicalDevice::from_raw(DriverObject::new(device.encode()) as u64))
            .collect();
        MockDriver {
            name: name.to_string(),
            interface_version: 5,
            extended_enumeration: false,
            object_naming: false,
            instance_extensions: vec!["VK_KHR_surface".to_string()],
            device_extensions: vec!["VK_KHR_swapchain".to_string()],
            devices: Mutex::new(handles),
            next_id: AtomicU64::new(1),
            instances_created: AtomicUsize::new(0),
            instances_destroyed: AtomicUsize::new(0),
            devices_created: AtomicUsize::new(0),
            devices_destroyed: AtomicUsize::new(0),
        }
    }

    pub fn with_interface_version(mut self, version: u32) -> Self {
        self.interface_version = version;
        self
    }

    pub fn with_groups(mut self) -> Self {
        self.extended_enumeration = true;
        self
    }

    pub fn with_object_naming(mut self) -> Self {
        self.object_naming = true;
        self
    }

    pub fn with_instance_extension(mut self, name: &str) -> Self {
        self.instance_extensions.push(name.to_string());
        self
    }

    /// Drop a device from the driver's list. The object is leaked so its
    /// address cannot be reused while the loader still remembers it.
    pub fn remove_device(&self, index: usize) -> vk::PhysicalDevice {
        self.devices.lock().remove(index)
    }

    pub fn device_handles(&self) -> Vec<vk::PhysicalDevice> {
        self.devices.lock().clone()
    }

    fn new_object(&self) -> u64 {
        DriverObject::new(self.next_id.fetch_add(1, Ordering::Relaxed)) as u64
    }
}

impl Driver for MockDriver {
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
        Ok(self
            .instance_extensions
            .iter()
            .map(|name| extension_properties(name, 1))
            .collect())
    }

    fn create_instance(&self, _info: &DriverInstanceInfo) -> Result<vk::Instance, LoaderError> {
        self.instances_created.fetch_add(1, Ordering::SeqCst);
        Ok(vk::Instance::from_raw(self.new_object()))
    }

    fn destroy_instance(&self, instance: vk::Instance, _allocator: Option<&HostAllocator>) {
        self.instances_destroyed.fetch_add(1, Ordering::SeqCst);
        unsafe { DriverObject::destroy(instance.as_raw() as *mut DriverObject) };
    }

    fn enumerate_physical_devices(&self, _instance: vk::Instance) -> Result<Vec<vk::PhysicalDevice>, LoaderError> {
        Ok(self.device_handles())
    }

    fn enumerate_physical_device_groups(
        &self,
        _instance: vk::Instance,
    ) -> Result<Vec<Vec<vk::PhysicalDevice>>, LoaderError> {
        if !self.extended_enumeration {
            return Ok(Vec::new());
        }
        Ok(vec![self.device_handles()])
    }

    fn device_extensions(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, LoaderError> {
        Ok(self
            .device_extensions
            .iter()
            .map(|name| extension_properties(name, 1))
            .collect())
    }

    fn create_device(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
        _info: &DriverDeviceInfo,
    ) -> Result<vk::Device, LoaderError> {
        self.devices_created.fetch_add(1, Ordering::SeqCst);
        Ok(vk::Device::from_raw(self.new_object()))
    }

    fn destroy_device(&self, _instance: vk::Instance, device: vk::Device, _allocator: Option<&HostAllocator>) {
        self.devices_destroyed.fetch_add(1, Ordering::SeqCst);
        unsafe { DriverObject::destroy(device.as_raw() as *mut DriverObject) };
    }

    fn instance_proc_addr(&self, _instance: vk::Instance, name: &str) -> EntryPoint {
        match name {
            "vkGetPhysicalDeviceProperties" => entry_point!(mock_get_properties),
            "vkGetPhysicalDeviceFeatures" => entry_point!(mock_get_features),
            "vkGetPhysicalDeviceMemoryProperties" => entry_point!(mock_get_memory_properties),
            "vkGetPhysicalDeviceQueueFamilyProperties" => entry_point!(mock_get_queue_families),
            _ => None,
        }
    }

    fn physical_device_proc_addr(&self, _instance: vk::Instance, name: &str) -> EntryPoint {
        match name {
            MOCK_PHYSICAL_DEVICE_FUNCTION => entry_point!(mock_physical_device_data),
            _ => None,
        }
    }

    fn device_proc_addr(&self, _instance: vk::Instance, _device: vk::Device, name: &str) -> EntryPoint {
        match name {
            "vkGetDeviceQueue" => entry_point!(mock_get_device_queue),
            MOCK_DEVICE_FUNCTION => entry_point!(mock_vendor_command),
            "vkSetDebugUtilsObjectNameEXT" if self.object_naming => entry_point!(mock_set_object_name),
            _ => None,
        }
    }
}

unsafe fn decode(physical_device: vk::PhysicalDevice) -> MockDevice {
    MockDevice::decode(unsafe { DriverObject::id(physical_device.as_raw() as *const DriverObject) })
}

unsafe extern "system" fn mock_get_properties(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties,
) {
    let device = unsafe { decode(physical_device) };
    let props = unsafe { &mut *p_properties };
    props.vendor_id = device.vendor_id;
    props.device_id = device.device_id;
    props.device_type = device.device_type;
    props.api_version = vk::API_VERSION_1_3;
}

unsafe extern "system" fn mock_get_features(_physical_device: vk::PhysicalDevice, p_features: *mut vk::PhysicalDeviceFeatures) {
    unsafe { (*p_features).robust_buffer_access = vk::TRUE };
}

unsafe extern "system" fn mock_get_memory_properties(
    _physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceMemoryProperties,
) {
    unsafe { (*p_properties).memory_heap_count = 2 };
}

unsafe extern "system" fn mock_get_queue_families(
    _physical_device: vk::PhysicalDevice,
    p_count: *mut u32,
    p_props: *mut vk::QueueFamilyProperties,
) {
    let families = [
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            queue_count: 1,
            ..Default::default()
        },
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::TRANSFER,
            queue_count: 2,
            ..Default::default()
        },
    ];
    if p_props.is_null() {
        unsafe { *p_count = families.len() as u32 };
        return;
    }
    let count = (unsafe { *p_count } as usize).min(families.len());
    for (i, family) in families.iter().take(count).enumerate() {
        unsafe { *p_props.add(i) = *family };
    }
    unsafe { *p_count = count as u32 };
}

/// Writes the id the driver gave the physical device.
pub unsafe extern "system" fn mock_physical_device_data(physical_device: vk::PhysicalDevice, p_out: *mut u64) {
    unsafe { *p_out = DriverObject::id(physical_device.as_raw() as *const DriverObject) };
}

unsafe extern "system" fn mock_get_device_queue(
    _device: vk::Device,
    _family_index: u32,
    _queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    unsafe { *p_queue = vk::Queue::null() };
}

pub unsafe extern "system" fn mock_vendor_command() {}

/// Handle seen by the driver's `vkSetDebugUtilsObjectNameEXT`.
pub static LAST_NAMED_OBJECT: AtomicU64 = AtomicU64::new(0);

unsafe extern "system" fn mock_set_object_name(
    _device: vk::Device,
    p_name_info: *const vk::DebugUtilsObjectNameInfoEXT<'_>,
) -> vk::Result {
    LAST_NAMED_OBJECT.store(unsafe { (*p_name_info).object_handle }, Ordering::SeqCst);
    vk::Result::SUCCESS
}

// ── Layer ───────────────────────────────────────────────────

/// A layer that logs every link it creates and can answer for one command.
pub struct RecordingLayer {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    intercept: Option<(&'static str, EntryPoint)>,
}

impl RecordingLayer {
    pub fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        RecordingLayer {
            name: name.to_string(),
            log,
            intercept: None,
        }
    }

    pub fn intercepting(mut self, command: &'static str, entry: EntryPoint) -> Self {
        self.intercept = Some((command, entry));
        self
    }
}

impl Interposer for RecordingLayer {
    fn interface_version(&self) -> u32 {
        2
    }

    fn instance_link(&self, next: Arc<dyn ChainLink>) -> Result<Arc<dyn ChainLink>, CoreError> {
        self.log.lock().push(format!("instance:{}", self.name));
        Ok(Arc::new(RecordingLink {
            intercept: self.intercept,
            next,
        }))
    }

    fn device_link(&self, next: Arc<dyn ChainLink>) -> Result<Arc<dyn ChainLink>, CoreError> {
        self.log.lock().push(format!("device:{}", self.name));
        Ok(Arc::new(RecordingLink {
            intercept: self.intercept,
            next,
        }))
    }
}

struct RecordingLink {
    intercept: Option<(&'static str, EntryPoint)>,
    next: Arc<dyn ChainLink>,
}

impl ChainLink for RecordingLink {
    fn proc_addr(&self, name: &str) -> EntryPoint {
        match self.intercept {
            Some((command, entry)) if command == name => entry,
            _ => self.next.proc_addr(name),
        }
    }
}

pub unsafe extern "system" fn layer_marker() {}

/// A `vkDestroyInstance` that never calls down the chain.
pub unsafe extern "system" fn swallow_destroy_instance(
    _instance: vk::Instance,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
) {
}

pub fn same_entry(entry: EntryPoint, expected: unsafe extern "system" fn()) -> bool {
    entry.map(|f| f as usize) == Some(expected as usize)
}

// ── Assembly ────────────────────────────────────────────────

pub fn driver_manifest(name: &str) -> DriverManifest {
    DriverManifest::new(format!("/drivers/{}.json", name), format!("/lib/lib{}.so", name))
}

pub fn layer(name: &str) -> LayerRecord {
    LayerRecord::explicit(name, format!("/lib/lib{}.so", name)).with_manifest_path(format!("/layers/{}.json", name))
}

/// A catalog, libraries, and environment assembled into a loader.
pub struct Fixture {
    pub env: MapEnvironment,
    pub catalog: MemoryCatalog,
    pub libraries: StaticLibraries,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            env: MapEnvironment::new(),
            catalog: MemoryCatalog::new(),
            libraries: StaticLibraries::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn driver(mut self, name: &str, driver: Arc<MockDriver>) -> Self {
        let manifest = driver_manifest(name);
        self.libraries = self.libraries.with_driver(manifest.library_path.clone(), driver);
        self.catalog = self.catalog.with_driver(manifest);
        self
    }

    /// Register `record` and back it with a [`RecordingLayer`].
    pub fn layer(mut self, record: LayerRecord, intercept: Option<(&'static str, EntryPoint)>) -> Self {
        let mut library = RecordingLayer::new(&record.name, self.log.clone());
        if let Some((command, entry)) = intercept {
            library = library.intercepting(command, entry);
        }
        if let Some(path) = record.library_path.clone() {
            self.libraries = self.libraries.with_layer(path, Arc::new(library));
        }
        self.catalog = self.catalog.with_layer(record);
        self
    }

    /// Register `record` backed by `library`.
    pub fn layer_with(mut self, record: LayerRecord, library: Arc<dyn Interposer>) -> Self {
        if let Some(path) = record.library_path.clone() {
            self.libraries = self.libraries.with_layer(path, library);
        }
        self.catalog = self.catalog.with_layer(record);
        self
    }

    /// Register `record` without a library, so loading it fails.
    pub fn unloadable_layer(mut self, record: LayerRecord) -> Self {
        self.catalog = self.catalog.with_layer(record);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.set(key, value);
        self
    }

    pub fn build(self) -> (Loader, Arc<Mutex<Vec<String>>>) {
        let loader = Loader::builder()
            .env(self.env)
            .fs(EmptyFileSystem)
            .catalog(self.catalog)
            .libraries(self.libraries)
            .build();
        (loader, self.log)
    }
}

/// One driver with one discrete device, no layers.
pub fn single_driver_loader() -> (Loader, Arc<MockDriver>) {
    let driver = Arc::new(MockDriver::new("mock", &[MockDevice::discrete(0x10de, 0x2204)]));
    let (loader, _) = Fixture::new().driver("mock", driver.clone()).build();
    (loader, driver)
}
