//! Integration test: native layers
//!
//! Layers that take part through their own create calls: the link nodes they
//! read from the create info, the next pointers they forward through, the
//! loader-data callback, and where they may sit in a chain.
//!
//! Run with: cargo test -p vkchain-loader --test native_layer_test

mod common;

use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use common::*;
use parking_lot::{const_mutex, Mutex};
use serial_test::serial;
use vkchain_core::{Interposer, LayerRecord, NativeEntryPoints};
use vkchain_loader::dispatch::{cast_entry, dispatch_of, DispatchTable, DriverObject};
use vkchain_loader::handle_store;
use vkchain_loader::link_info::{
    device_link_info, instance_link_info, SetDeviceLoaderData, LAYER_LINK_INFO, LOADER_DATA_CALLBACK,
};
use vkchain_loader::{
    create_device, destroy_device, destroy_instance, enumerate_physical_devices, entry_point, get_device_proc_addr,
    physical_device_properties, DeviceCreateInfo, InstanceCreateInfo, LibraryOpener, LoaderError, NativeLibraries,
    QueueRequest,
};

const PROPERTIES_MARKER: u32 = 0x4C41_5952;

// ── Test layer ──────────────────────────────────────────────

/// Next pointers the layer received, as a native layer keeps them.
struct Next {
    instance: vk::Instance,
    gipa: Option<vk::PFN_vkGetInstanceProcAddr>,
    gdpa: Option<vk::PFN_vkGetDeviceProcAddr>,
    get_properties: Option<vk::PFN_vkGetPhysicalDeviceProperties>,
    get_queue: Option<vk::PFN_vkGetDeviceQueue>,
}

static NEXT: Mutex<Next> = const_mutex(Next {
    instance: vk::Instance::null(),
    gipa: None,
    gdpa: None,
    get_properties: None,
    get_queue: None,
});
static INSTANCES_CREATED: AtomicUsize = AtomicUsize::new(0);
static DEVICES_CREATED: AtomicUsize = AtomicUsize::new(0);
static QUEUE_CALLS: AtomicUsize = AtomicUsize::new(0);
static FAIL_CREATE: AtomicBool = AtomicBool::new(false);
/// An object the layer made itself and stamped through the loader callback.
static LAYER_OBJECT: AtomicU64 = AtomicU64::new(0);

fn reset() {
    *NEXT.lock() = Next {
        instance: vk::Instance::null(),
        gipa: None,
        gdpa: None,
        get_properties: None,
        get_queue: None,
    };
    INSTANCES_CREATED.store(0, Ordering::SeqCst);
    DEVICES_CREATED.store(0, Ordering::SeqCst);
    QUEUE_CALLS.store(0, Ordering::SeqCst);
    FAIL_CREATE.store(false, Ordering::SeqCst);
    LAYER_OBJECT.store(0, Ordering::SeqCst);
}

struct ForwardingLayer;

impl Interposer for ForwardingLayer {
    fn interface_version(&self) -> u32 {
        2
    }

    fn native_entry_points(&self) -> Option<NativeEntryPoints> {
        Some(NativeEntryPoints {
            get_instance_proc_addr: layer_get_instance_proc_addr,
            get_device_proc_addr: Some(layer_get_device_proc_addr),
            get_physical_device_proc_addr: None,
        })
    }
}

unsafe fn name_of<'a>(p_name: *const c_char) -> &'a str {
    unsafe { CStr::from_ptr(p_name) }.to_str().unwrap_or("")
}

unsafe extern "system" fn layer_get_instance_proc_addr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    match unsafe { name_of(p_name) } {
        "vkGetInstanceProcAddr" => entry_point!(layer_get_instance_proc_addr),
        "vkCreateInstance" => entry_point!(layer_create_instance),
        "vkCreateDevice" => entry_point!(layer_create_device),
        "vkGetPhysicalDeviceProperties" => entry_point!(layer_get_physical_device_properties),
        _ => {
            let next = NEXT.lock().gipa;
            next.and_then(|gipa| unsafe { gipa(instance, p_name) })
        }
    }
}

unsafe extern "system" fn layer_get_device_proc_addr(device: vk::Device, p_name: *const c_char) -> vk::PFN_vkVoidFunction {
    match unsafe { name_of(p_name) } {
        "vkGetDeviceProcAddr" => entry_point!(layer_get_device_proc_addr),
        "vkGetDeviceQueue" => entry_point!(layer_get_device_queue),
        _ => {
            let next = NEXT.lock().gdpa;
            next.and_then(|gdpa| unsafe { gdpa(device, p_name) })
        }
    }
}

unsafe extern "system" fn layer_create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    if FAIL_CREATE.load(Ordering::SeqCst) {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let link = unsafe { instance_link_info(p_create_info, LAYER_LINK_INFO) };
    if link.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let next_gipa = unsafe {
        let layer_info = (*link).u.layer_info;
        (*link).u.layer_info = (*layer_info).p_next;
        (*layer_info).next_get_instance_proc_addr
    };
    let create = unsafe {
        cast_entry::<vk::PFN_vkCreateInstance>(next_gipa(
            vk::Instance::null(),
            b"vkCreateInstance\0".as_ptr() as *const c_char,
        ))
    };
    let Some(create) = create else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe { create(p_create_info, p_allocator, p_instance) };
    if result != vk::Result::SUCCESS {
        return result;
    }

    let instance = unsafe { *p_instance };
    let mut next = NEXT.lock();
    next.instance = instance;
    next.gipa = Some(next_gipa);
    next.get_properties = unsafe {
        cast_entry(next_gipa(
            instance,
            b"vkGetPhysicalDeviceProperties\0".as_ptr() as *const c_char,
        ))
    };
    INSTANCES_CREATED.fetch_add(1, Ordering::SeqCst);
    vk::Result::SUCCESS
}

unsafe extern "system" fn layer_create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    let link = unsafe { device_link_info(p_create_info, LAYER_LINK_INFO) };
    let callback = unsafe { device_link_info(p_create_info, LOADER_DATA_CALLBACK) };
    if link.is_null() || callback.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let (next_gipa, next_gdpa) = unsafe {
        let layer_info = (*link).u.layer_info;
        (*link).u.layer_info = (*layer_info).p_next;
        ((*layer_info).next_get_instance_proc_addr, (*layer_info).next_get_device_proc_addr)
    };
    let instance = NEXT.lock().instance;
    let create = unsafe {
        cast_entry::<vk::PFN_vkCreateDevice>(next_gipa(instance, b"vkCreateDevice\0".as_ptr() as *const c_char))
    };
    let Some(create) = create else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe { create(physical_device, p_create_info, p_allocator, p_device) };
    if result != vk::Result::SUCCESS {
        return result;
    }

    let device = unsafe { *p_device };
    let set_loader_data: SetDeviceLoaderData = unsafe { (*callback).u.set_device_loader_data };
    let object = DriverObject::new(7);
    if unsafe { set_loader_data(device, object as *mut c_void) } != vk::Result::SUCCESS {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    LAYER_OBJECT.store(object as u64, Ordering::SeqCst);

    let mut next = NEXT.lock();
    next.gdpa = Some(next_gdpa);
    next.get_queue = unsafe { cast_entry(next_gdpa(device, b"vkGetDeviceQueue\0".as_ptr() as *const c_char)) };
    DEVICES_CREATED.fetch_add(1, Ordering::SeqCst);
    vk::Result::SUCCESS
}

unsafe extern "system" fn layer_get_physical_device_properties(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties,
) {
    let next = NEXT.lock().get_properties;
    if let Some(next) = next {
        unsafe { next(physical_device, p_properties) };
    }
    unsafe { (*p_properties).driver_version = PROPERTIES_MARKER };
}

unsafe extern "system" fn layer_get_device_queue(
    device: vk::Device,
    family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    QUEUE_CALLS.fetch_add(1, Ordering::SeqCst);
    let next = NEXT.lock().get_queue;
    if let Some(next) = next {
        unsafe { next(device, family_index, queue_index, p_queue) };
    }
}

// ── Helpers ─────────────────────────────────────────────────

fn native_fixture(driver: Arc<MockDriver>) -> Fixture {
    Fixture::new()
        .driver("mock", driver)
        .layer_with(layer("Native"), Arc::new(ForwardingLayer))
}

fn with_layers(names: &[&str]) -> InstanceCreateInfo {
    InstanceCreateInfo {
        enabled_layers: names.iter().map(|name| name.to_string()).collect(),
        ..Default::default()
    }
}

fn one_queue() -> DeviceCreateInfo {
    DeviceCreateInfo {
        queues: vec![QueueRequest {
            family_index: 0,
            priorities: vec![1.0],
        }],
        ..Default::default()
    }
}

fn mock_driver() -> Arc<MockDriver> {
    Arc::new(MockDriver::new("mock", &[MockDevice::discrete(0x10de, 0x2204)]))
}

// ── Instance ────────────────────────────────────────────────

#[test]
#[serial]
fn test_native_layer_forwards_through_next_instance_pointer() {
    reset();
    let (loader, _) = native_fixture(mock_driver()).build();
    let instance = loader.create_instance(&with_layers(&["Native"])).unwrap();
    assert_eq!(INSTANCES_CREATED.load(Ordering::SeqCst), 1);
    assert_eq!(NEXT.lock().instance, instance);

    let physical_device = enumerate_physical_devices(instance).unwrap()[0];
    let props = physical_device_properties(physical_device).unwrap();
    // The driver filled the ids, the layer added its marker on the way back.
    assert_eq!(props.vendor_id, 0x10de);
    assert_eq!(props.device_id, 0x2204);
    assert_eq!(props.driver_version, PROPERTIES_MARKER);

    destroy_instance(instance).unwrap();
    assert!(handle_store::unwrap_instance(instance).is_err());
}

#[test]
#[serial]
fn test_native_layer_create_failure_releases_driver_instances() {
    reset();
    FAIL_CREATE.store(true, Ordering::SeqCst);
    let driver = mock_driver();
    let (loader, _) = native_fixture(driver.clone()).build();

    match loader.create_instance(&with_layers(&["Native"])) {
        Err(LoaderError::Vulkan { call, result }) => {
            assert_eq!(call, "vkCreateInstance");
            assert_eq!(result, vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        other => panic!("expected Vulkan error, got {:?}", other),
    }
    assert_eq!(driver.instances_created.load(Ordering::SeqCst), 1);
    assert_eq!(driver.instances_destroyed.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn test_native_layer_above_in_process_layer_is_left_out() {
    reset();
    let (loader, log) = native_fixture(mock_driver())
        .layer(layer("InProcess"), None)
        .build();
    let instance = loader.create_instance(&with_layers(&["Native", "InProcess"])).unwrap();

    assert_eq!(INSTANCES_CREATED.load(Ordering::SeqCst), 0);
    assert_eq!(*log.lock(), vec!["instance:InProcess".to_string()]);
    let physical_device = enumerate_physical_devices(instance).unwrap()[0];
    assert_ne!(physical_device_properties(physical_device).unwrap().driver_version, PROPERTIES_MARKER);
    destroy_instance(instance).unwrap();
}

#[test]
#[serial]
fn test_native_layer_below_in_process_layer_is_created() {
    reset();
    let (loader, log) = native_fixture(mock_driver())
        .layer(layer("InProcess"), None)
        .build();
    let instance = loader.create_instance(&with_layers(&["InProcess", "Native"])).unwrap();

    assert_eq!(INSTANCES_CREATED.load(Ordering::SeqCst), 1);
    assert_eq!(*log.lock(), vec!["instance:InProcess".to_string()]);
    let physical_device = enumerate_physical_devices(instance).unwrap()[0];
    assert_eq!(physical_device_properties(physical_device).unwrap().driver_version, PROPERTIES_MARKER);
    destroy_instance(instance).unwrap();
}

// ── Device ──────────────────────────────────────────────────

#[test]
#[serial]
fn test_native_layer_forwards_through_next_device_pointer() {
    reset();
    let driver = mock_driver();
    let (loader, _) = native_fixture(driver.clone()).build();
    let instance = loader.create_instance(&with_layers(&["Native"])).unwrap();
    let physical_device = enumerate_physical_devices(instance).unwrap()[0];

    let device = create_device(physical_device, &one_queue()).unwrap();
    assert_eq!(DEVICES_CREATED.load(Ordering::SeqCst), 1);
    assert_eq!(driver.devices_created.load(Ordering::SeqCst), 1);

    let entry = get_device_proc_addr(device, "vkGetDeviceQueue").unwrap();
    let get_queue = unsafe { cast_entry::<vk::PFN_vkGetDeviceQueue>(entry) }.unwrap();
    let mut queue = vk::Queue::from_raw(0xdead);
    unsafe { get_queue(device, 0, 0, &mut queue) };
    assert_eq!(QUEUE_CALLS.load(Ordering::SeqCst), 1);
    // The driver's queue lookup ran underneath the layer.
    assert_eq!(queue, vk::Queue::null());

    destroy_device(device).unwrap();
    assert_eq!(driver.devices_destroyed.load(Ordering::SeqCst), 1);
    destroy_instance(instance).unwrap();
}

#[test]
#[serial]
fn test_loader_data_callback_stamps_layer_objects() {
    reset();
    let (loader, _) = native_fixture(mock_driver()).build();
    let instance = loader.create_instance(&with_layers(&["Native"])).unwrap();
    let physical_device = enumerate_physical_devices(instance).unwrap()[0];
    let device = create_device(physical_device, &one_queue()).unwrap();

    let object = LAYER_OBJECT.load(Ordering::SeqCst);
    assert_ne!(object, 0);
    let record = handle_store::unwrap_device(device).unwrap();
    assert_eq!(unsafe { dispatch_of(object) }, record.table() as *const DispatchTable);

    unsafe { DriverObject::destroy(object as *mut DriverObject) };
    destroy_device(device).unwrap();
    destroy_instance(instance).unwrap();
}

// ── Shared objects ──────────────────────────────────────────

#[test]
fn test_layer_library_that_is_not_a_shared_object_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("libbroken.so");
    std::fs::write(&path, b"not a shared object").unwrap();
    let record = LayerRecord::explicit("Broken", &path);

    match NativeLibraries.open_layer(&record) {
        Err(LoaderError::Library { path: reported, .. }) => assert_eq!(reported, path),
        Err(other) => panic!("expected Library error, got {:?}", other),
        Ok(_) => panic!("expected Library error, got a layer"),
    }
}
