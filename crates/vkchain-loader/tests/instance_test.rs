//! Integration test: instance lifecycle
//!
//! Instance creation against in-process drivers and layers: chain order,
//! extension validation, driver filtering, layer failures, and teardown.
//!
//! Run with: cargo test -p vkchain-loader --test instance_test

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ash::vk::Handle;
use common::*;
use vkchain_core::CoreError;
use vkchain_loader::dispatch::{dispatch_of, DispatchTable};
use vkchain_loader::handle_store;
use vkchain_loader::library::extension_name;
use vkchain_loader::{destroy_instance, get_instance_proc_addr, InstanceCreateInfo, LoaderError};

fn with_layers(names: &[&str]) -> InstanceCreateInfo {
    InstanceCreateInfo {
        enabled_layers: names.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    }
}

fn with_extensions(names: &[&str]) -> InstanceCreateInfo {
    InstanceCreateInfo {
        enabled_extensions: names.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    }
}

// ── Lifecycle ───────────────────────────────────────────────

#[test]
fn test_create_and_destroy_instance() {
    let (loader, driver) = single_driver_loader();
    let handle = loader.create_instance(&InstanceCreateInfo::default()).unwrap();

    let record = handle_store::unwrap_instance(handle).unwrap();
    assert!(record.is_valid());
    assert_eq!(record.icds.len(), 1);
    assert_eq!(driver.instances_created.load(Ordering::SeqCst), 1);

    destroy_instance(handle).unwrap();
    assert!(!record.is_valid());
    assert_eq!(driver.instances_destroyed.load(Ordering::SeqCst), 1);
    match handle_store::unwrap_instance(handle) {
        Err(CoreError::InvalidHandle(_)) => {}
        other => panic!("expected InvalidHandle, got {:?}", other),
    }
}

#[test]
fn test_instance_first_word_is_its_table() {
    let (loader, _driver) = single_driver_loader();
    let handle = loader.create_instance(&InstanceCreateInfo::default()).unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();

    let word = unsafe { dispatch_of(handle.as_raw()) };
    assert_eq!(word, record.table() as *const DispatchTable);
    destroy_instance(handle).unwrap();
}

#[test]
fn test_destroy_null_instance_is_noop() {
    destroy_instance(ash::vk::Instance::null()).unwrap();
}

#[test]
fn test_no_drivers_is_incompatible_driver() {
    let (loader, _) = Fixture::new().build();
    match loader.create_instance(&InstanceCreateInfo::default()) {
        Err(LoaderError::Core(CoreError::IncompatibleDriver(_))) => {}
        other => panic!("expected IncompatibleDriver, got {:?}", other),
    }
}

#[test]
fn test_layer_that_does_not_forward_destroy_still_tears_down() {
    let driver = Arc::new(MockDriver::new("mock", &[MockDevice::discrete(0x10de, 1)]));
    let (loader, _) = Fixture::new()
        .driver("mock", driver.clone())
        .layer(
            layer("VK_LAYER_swallow"),
            Some(("vkDestroyInstance", vkchain_loader::entry_point!(swallow_destroy_instance))),
        )
        .build();
    let handle = loader.create_instance(&with_layers(&["VK_LAYER_swallow"])).unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();

    destroy_instance(handle).unwrap();
    assert!(!record.is_valid());
    assert_eq!(driver.instances_destroyed.load(Ordering::SeqCst), 1);
}

// ── Layers ──────────────────────────────────────────────────

#[test]
fn test_chain_built_from_driver_side_up() {
    let driver = Arc::new(MockDriver::new("mock", &[MockDevice::discrete(0x10de, 1)]));
    let (loader, log) = Fixture::new()
        .driver("mock", driver)
        .layer(layer("VK_LAYER_A"), None)
        .layer(layer("VK_LAYER_B"), None)
        .build();
    let handle = loader
        .create_instance(&with_layers(&["VK_LAYER_B", "VK_LAYER_A"]))
        .unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();

    assert_eq!(record.layers.expanded_names(), vec!["VK_LAYER_A", "VK_LAYER_B"]);
    assert_eq!(*log.lock(), vec!["instance:VK_LAYER_B", "instance:VK_LAYER_A"]);
    destroy_instance(handle).unwrap();
}

#[test]
fn test_unknown_app_layer_is_layer_not_present() {
    let (loader, _driver) = single_driver_loader();
    match loader.create_instance(&with_layers(&["VK_LAYER_missing"])) {
        Err(LoaderError::Core(CoreError::LayerNotPresent(name))) => assert_eq!(name, "VK_LAYER_missing"),
        other => panic!("expected LayerNotPresent, got {:?}", other),
    }
}

#[test]
fn test_layer_that_fails_to_load_is_omitted() {
    let driver = Arc::new(MockDriver::new("mock", &[MockDevice::discrete(0x10de, 1)]));
    let (loader, log) = Fixture::new()
        .driver("mock", driver)
        .layer(layer("VK_LAYER_good"), None)
        .unloadable_layer(layer("VK_LAYER_broken"))
        .build();
    let handle = loader
        .create_instance(&with_layers(&["VK_LAYER_good", "VK_LAYER_broken"]))
        .unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();

    assert_eq!(record.layers.expanded_names(), vec!["VK_LAYER_good"]);
    assert_eq!(record.layers.requested_names(), vec!["VK_LAYER_good"]);
    assert_eq!(*log.lock(), vec!["instance:VK_LAYER_good"]);
    destroy_instance(handle).unwrap();
}

#[test]
fn test_missing_forced_layer_with_exit_policy_fails() {
    let driver = Arc::new(MockDriver::new("mock", &[]));
    let (loader, _) = Fixture::new()
        .driver("mock", driver)
        .env("VK_INSTANCE_LAYERS", "VK_LAYER_gone")
        .env("VK_LOADER_LAYERS_EXIT_ON_MISSING", "1")
        .build();
    match loader.create_instance(&InstanceCreateInfo::default()) {
        Err(LoaderError::Core(CoreError::MissingForcedLayer(name))) => assert_eq!(name, "VK_LAYER_gone"),
        other => panic!("expected MissingForcedLayer, got {:?}", other),
    }
}

#[test]
fn test_missing_forced_layer_without_exit_policy_is_recorded() {
    let driver = Arc::new(MockDriver::new("mock", &[]));
    let (loader, _) = Fixture::new()
        .driver("mock", driver)
        .env("VK_INSTANCE_LAYERS", "VK_LAYER_gone")
        .build();
    let handle = loader.create_instance(&InstanceCreateInfo::default()).unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();
    assert_eq!(record.layers.missing_forced, vec!["VK_LAYER_gone"]);
    destroy_instance(handle).unwrap();
}

#[test]
fn test_enumerate_instance_layers_honours_disable_filter() {
    let (loader, _) = Fixture::new()
        .layer(layer("VK_LAYER_keep"), None)
        .layer(layer("VK_LAYER_drop"), None)
        .env("VK_LOADER_LAYERS_DISABLE", "VK_LAYER_drop")
        .build();
    let names: Vec<String> = loader
        .enumerate_instance_layers()
        .unwrap()
        .iter()
        .map(|layer| layer.name.clone())
        .collect();
    assert_eq!(names, vec!["VK_LAYER_keep"]);
}

// ── Extensions ──────────────────────────────────────────────

#[test]
fn test_unsupported_extension_is_rejected() {
    let (loader, driver) = single_driver_loader();
    match loader.create_instance(&with_extensions(&["VK_EXT_not_real"])) {
        Err(LoaderError::Core(CoreError::ExtensionNotPresent(name))) => assert_eq!(name, "VK_EXT_not_real"),
        other => panic!("expected ExtensionNotPresent, got {:?}", other),
    }
    assert_eq!(driver.instances_created.load(Ordering::SeqCst), 0);
}

#[test]
fn test_layer_extension_is_accepted_but_not_passed_to_driver() {
    let driver = Arc::new(MockDriver::new("mock", &[]));
    let (loader, _) = Fixture::new()
        .driver("mock", driver)
        .layer(layer("VK_LAYER_ext").with_instance_extension("VK_EXT_layer_feature", 1), None)
        .build();
    let info = InstanceCreateInfo {
        enabled_layers: vec!["VK_LAYER_ext".to_string()],
        enabled_extensions: vec!["VK_KHR_surface".to_string(), "VK_EXT_layer_feature".to_string()],
        ..Default::default()
    };
    let handle = loader.create_instance(&info).unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();

    assert_eq!(record.icds[0].enabled_extensions, vec!["VK_KHR_surface"]);
    assert_eq!(record.enabled_extensions.len(), 2);
    destroy_instance(handle).unwrap();
}

#[test]
fn test_disabled_extension_filter_passes_everything() {
    let driver = Arc::new(MockDriver::new("mock", &[]));
    let (loader, _) = Fixture::new()
        .driver("mock", driver)
        .env("VK_LOADER_DISABLE_INST_EXT_FILTER", "1")
        .build();
    let handle = loader.create_instance(&with_extensions(&["VK_EXT_not_real"])).unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();
    assert_eq!(record.icds[0].enabled_extensions, vec!["VK_EXT_not_real"]);
    destroy_instance(handle).unwrap();
}

#[test]
fn test_instance_extensions_are_deduplicated_across_drivers() {
    let a = Arc::new(MockDriver::new("mock_a", &[]).with_instance_extension("VK_EXT_only_a"));
    let b = Arc::new(MockDriver::new("mock_b", &[]));
    let (loader, _) = Fixture::new()
        .driver("mock_a", a)
        .driver("mock_b", b)
        .layer(layer("VK_LAYER_ext").with_instance_extension("VK_EXT_layer_feature", 2), None)
        .build();

    let names: Vec<String> = loader
        .enumerate_instance_extensions(None)
        .unwrap()
        .iter()
        .map(extension_name)
        .collect();
    assert_eq!(names, vec!["VK_KHR_surface", "VK_EXT_only_a"]);

    let layer_props = loader.enumerate_instance_extensions(Some("VK_LAYER_ext")).unwrap();
    assert_eq!(layer_props.len(), 1);
    assert_eq!(extension_name(&layer_props[0]), "VK_EXT_layer_feature");
    assert_eq!(layer_props[0].spec_version, 2);

    match loader.enumerate_instance_extensions(Some("VK_LAYER_nope")) {
        Err(LoaderError::Core(CoreError::LayerNotPresent(_))) => {}
        other => panic!("expected LayerNotPresent, got {:?}", other),
    }
}

// ── Drivers ─────────────────────────────────────────────────

#[test]
fn test_disabled_driver_is_not_loaded() {
    let a = Arc::new(MockDriver::new("mock_a", &[]));
    let b = Arc::new(MockDriver::new("mock_b", &[]));
    let (loader, _) = Fixture::new()
        .driver("mock_a", a.clone())
        .driver("mock_b", b.clone())
        .env("VK_LOADER_DRIVERS_DISABLE", "mock_b.json")
        .build();
    let handle = loader.create_instance(&InstanceCreateInfo::default()).unwrap();
    let record = handle_store::unwrap_instance(handle).unwrap();

    assert_eq!(record.icds.len(), 1);
    assert_eq!(record.icds[0].driver.name(), "mock_a");
    assert_eq!(b.instances_created.load(Ordering::SeqCst), 0);
    destroy_instance(handle).unwrap();
}

// ── Proc address lookup ─────────────────────────────────────

#[test]
fn test_instance_proc_addr_prefers_layer() {
    let driver = Arc::new(MockDriver::new("mock", &[]));
    let (loader, _) = Fixture::new()
        .driver("mock", driver)
        .layer(
            layer("VK_LAYER_tool"),
            Some(("vkCreateToolThingEXT", vkchain_loader::entry_point!(layer_marker))),
        )
        .build();
    let handle = loader.create_instance(&with_layers(&["VK_LAYER_tool"])).unwrap();

    let known = get_instance_proc_addr(handle, "vkEnumeratePhysicalDevices").unwrap();
    assert!(known.is_some());
    let layered = get_instance_proc_addr(handle, "vkCreateToolThingEXT").unwrap();
    assert!(same_entry(layered, layer_marker));
    assert!(get_instance_proc_addr(handle, "vkNobodyHasThisEXT").unwrap().is_none());
    destroy_instance(handle).unwrap();
}
