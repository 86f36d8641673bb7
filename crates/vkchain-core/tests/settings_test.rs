//! Integration test: settings resolution
//!
//! Default search paths, environment overrides, the settings file, and the
//! process-global snapshot.
//!
//! Run with: cargo test -p vkchain-core --test settings_test

use std::fs;
use std::path::{Path, PathBuf};

use serial_test::serial;
use vkchain_common::{logging, DebugFlags, MapEnvironment};
use vkchain_core::config::{complete_search_path, DeviceSelector, ManifestKind, SettingsSnapshot};
use vkchain_core::fs::OsFileSystem;
use vkchain_core::global;
use vkchain_core::layer::LayerControl;
use vkchain_core::settings_file::LoaderSettingsFile;

fn home_env(home: &Path) -> MapEnvironment {
    MapEnvironment::new().with("HOME", home.to_str().unwrap())
}

fn write_settings(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("vk_loader_settings.json");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_default_search_paths_follow_xdg_order() {
    let env = MapEnvironment::new().with("HOME", "/home/user");
    let snapshot =
        SettingsSnapshot::resolve_with_file(&env, &OsFileSystem::new(), Some(Path::new("/nonexistent/s.json")))
            .unwrap();

    let expected: Vec<PathBuf> = [
        "/home/user/.config/vulkan/icd.d",
        "/etc/xdg/vulkan/icd.d",
        "/etc/vulkan/icd.d",
        "/home/user/.local/share/vulkan/icd.d",
        "/usr/local/share/vulkan/icd.d",
        "/usr/share/vulkan/icd.d",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    assert_eq!(snapshot.search_paths.get(ManifestKind::Driver), expected.as_slice());

    // The settings search skips the system configuration directory.
    assert!(!snapshot
        .search_paths
        .settings
        .contains(&PathBuf::from("/etc/vulkan/loader_settings.d")));
}

#[test]
fn test_override_replaces_and_additional_prepends() {
    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("VK_LAYER_PATH", "/opt/a:/opt/b:/opt/a")
        .with("VK_ADD_IMPLICIT_LAYER_PATH", "/extra/implicit")
        .with("VK_DRIVER_FILES", "/drivers/one.json")
        .with("VK_ICD_FILENAMES", "/drivers/ignored.json");
    let snapshot =
        SettingsSnapshot::resolve_with_file(&env, &OsFileSystem::new(), Some(Path::new("/nonexistent/s.json")))
            .unwrap();

    assert_eq!(
        snapshot.search_paths.explicit_layer,
        vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
    );
    assert_eq!(snapshot.search_paths.implicit_layer[0], PathBuf::from("/extra/implicit"));
    assert!(snapshot.search_paths.implicit_layer.len() > 1);
    assert_eq!(snapshot.search_paths.driver, vec![PathBuf::from("/drivers/one.json")]);
}

#[test]
fn test_legacy_driver_variable_used_as_fallback() {
    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("VK_ICD_FILENAMES", "/drivers/legacy.json");
    let snapshot =
        SettingsSnapshot::resolve_with_file(&env, &OsFileSystem::new(), Some(Path::new("/nonexistent/s.json")))
            .unwrap();
    assert_eq!(snapshot.search_paths.driver, vec![PathBuf::from("/drivers/legacy.json")]);
}

#[test]
fn test_complete_search_path_drops_short_entries_and_duplicates() {
    let defaults = vec![PathBuf::from("/d1"), PathBuf::from("/d2")];
    let additional = vec![PathBuf::from("/d2"), PathBuf::from("/"), PathBuf::from("/a")];
    let out = complete_search_path(&defaults, None, Some(&additional)).unwrap();
    assert_eq!(out, vec![PathBuf::from("/d2"), PathBuf::from("/a"), PathBuf::from("/d1")]);
}

#[test]
fn test_elevated_process_ignores_path_overrides() {
    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("VK_LAYER_PATH", "/attacker/layers")
        .elevated(true);
    let snapshot =
        SettingsSnapshot::resolve_with_file(&env, &OsFileSystem::new(), Some(Path::new("/nonexistent/s.json")))
            .unwrap();
    assert!(!snapshot
        .search_paths
        .explicit_layer
        .contains(&PathBuf::from("/attacker/layers")));
}

#[test]
fn test_resolution_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(
        dir.path(),
        r#"{
            "file_format_version": "1.0.0",
            "settings": {
                "stderr_log": ["warn"],
                "layers": [
                    { "control": "off", "name": "VK_LAYER_off", "path": "/x/off.json" },
                    { "control": "unordered_layer_location" }
                ]
            }
        }"#,
    );
    let env = home_env(dir.path())
        .with("VK_LOADER_LAYERS_ENABLE", "*validation*")
        .with("VK_LOADER_LAYERS_DISABLE", "~implicit~")
        .with("VK_INSTANCE_LAYERS", "VK_LAYER_a:VK_LAYER_b")
        .with("VK_LOADER_DEVICE_SELECT", "10de:2204");
    let fs = OsFileSystem::new();

    let first = SettingsSnapshot::resolve_with_file(&env, &fs, Some(&settings)).unwrap();
    let second = SettingsSnapshot::resolve_with_file(&env, &fs, Some(&settings)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_environment_overrides_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(
        dir.path(),
        r#"{
            "file_format_version": "1.0.0",
            "settings": {
                "stderr_log": ["warn"],
                "layers": [ { "control": "unordered_layer_location" } ]
            }
        }"#,
    );
    let fs = OsFileSystem::new();

    let from_file = SettingsSnapshot::resolve_with_file(&home_env(dir.path()), &fs, Some(&settings)).unwrap();
    assert_eq!(from_file.log.flags, DebugFlags::WARN);
    assert!(from_file.layers.settings_active);
    assert!(from_file.layers.has_unordered_layer_location);
    assert_eq!(from_file.settings_file.as_deref(), Some(settings.as_path()));

    let env = home_env(dir.path()).with("VK_LOADER_DEBUG", "error,layer");
    let overridden = SettingsSnapshot::resolve_with_file(&env, &fs, Some(&settings)).unwrap();
    assert_eq!(overridden.log.flags, DebugFlags::ERROR | DebugFlags::LAYER);
}

#[test]
fn test_layer_and_driver_variables() {
    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("VK_INSTANCE_LAYERS", "VK_LAYER_a::VK_LAYER_b")
        .with("VK_LOADER_LAYERS_EXIT_ON_MISSING", "1")
        .with("VK_LOADER_DRIVERS_SELECT", "nvidia*")
        .with("VK_LOADER_DRIVERS_DISABLE", "*lvp*")
        .with("VK_LOADER_DISABLE_INST_EXT_FILTER", "1");
    let snapshot =
        SettingsSnapshot::resolve_with_file(&env, &OsFileSystem::new(), Some(Path::new("/nonexistent/s.json")))
            .unwrap();

    assert_eq!(snapshot.layers.forced_layers, vec!["VK_LAYER_a", "VK_LAYER_b"]);
    assert!(snapshot.layers.exit_on_missing);
    assert!(snapshot.drivers.select.matches("nvidia_icd.json"));
    assert!(snapshot.drivers.disable.matches("lvp_icd.x86_64.json"));
    assert!(snapshot.instance.disable_instance_extension_filter);
    assert!(!snapshot.layers.settings_active);
    assert!(snapshot.has_layer_overrides());
}

#[test]
fn test_device_select_parsing() {
    assert_eq!(
        DeviceSelector::parse("10de:2204"),
        Some(DeviceSelector { vendor_id: 0x10de, device_id: 0x2204 })
    );
    assert_eq!(
        DeviceSelector::parse("0x1002:0x73bf"),
        Some(DeviceSelector { vendor_id: 0x1002, device_id: 0x73bf })
    );
    assert_eq!(DeviceSelector::parse("nonsense"), None);

    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("VK_LOADER_DEVICE_SELECT", "10de:2204")
        .with("VK_LOADER_DISABLE_SELECT", "1");
    let snapshot =
        SettingsSnapshot::resolve_with_file(&env, &OsFileSystem::new(), Some(Path::new("/nonexistent/s.json")))
            .unwrap();
    assert!(!snapshot.device_select.sorting_enabled);
    assert_eq!(snapshot.device_select.select, None);
}

#[test]
fn test_settings_file_app_keys_selection() {
    let text = r#"{
        "file_format_version": "1.0.0",
        "settings_array": [
            {
                "app_keys": ["/usr/bin/game"],
                "layers": [ { "control": "on", "name": "VK_LAYER_game", "path": "/l/game.json" } ]
            },
            {
                "layers": [
                    { "control": "auto", "name": "VK_LAYER_global", "path": "/l/global.json",
                      "treat_as_implicit_manifest": true },
                    { "control": "unordered_layer_location" }
                ]
            }
        ]
    }"#;
    let path = Path::new("/s/vk_loader_settings.json");

    let game = LoaderSettingsFile::parse(path, text, Some(Path::new("/usr/bin/game")))
        .unwrap()
        .unwrap();
    assert_eq!(game.layer_configurations.len(), 1);
    assert_eq!(game.layer_configurations[0].name, "VK_LAYER_game");
    assert_eq!(game.layer_configurations[0].control, LayerControl::On);
    assert!(!game.has_unordered_layer_location);

    let other = LoaderSettingsFile::parse(path, text, Some(Path::new("/usr/bin/other")))
        .unwrap()
        .unwrap();
    assert_eq!(other.layer_configurations.len(), 2);
    assert_eq!(other.layer_configurations[0].control, LayerControl::Default);
    assert!(other.layer_configurations[0].treat_as_implicit);
    assert!(other.has_unordered_layer_location);
}

#[test]
fn test_settings_file_without_layers_is_rejected() {
    let text = r#"{ "file_format_version": "1.0.0", "settings": { "stderr_log": ["all"] } }"#;
    match LoaderSettingsFile::parse(Path::new("/s.json"), text, None) {
        Err(vkchain_core::CoreError::Manifest { .. }) => {}
        other => panic!("expected Manifest error, got {:?}", other),
    }
}

#[test]
fn test_settings_file_log_locations_are_accepted_and_ignored() {
    let text = r#"{
        "file_format_version": "1.0.0",
        "settings": {
            "stderr_log": ["error", "layer"],
            "log_locations": [{ "destinations": ["/tmp/vk.log"], "filters": ["all"] }],
            "layers": [{ "control": "on", "name": "VK_LAYER_a", "path": "/x/a.json" }]
        }
    }"#;
    let file = LoaderSettingsFile::parse(Path::new("/s.json"), text, None).unwrap().unwrap();
    assert_eq!(file.stderr_log, Some(DebugFlags::ERROR | DebugFlags::LAYER));
    assert_eq!(file.layer_configurations.len(), 1);
}

#[test]
fn test_malformed_settings_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path(), "{ this is not json");
    let snapshot =
        SettingsSnapshot::resolve_with_file(&home_env(dir.path()), &OsFileSystem::new(), Some(&settings))
            .unwrap();
    assert!(!snapshot.layers.settings_active);
    assert_eq!(snapshot.settings_file, None);
    assert_eq!(snapshot.log.flags, DebugFlags::ERROR);
}

#[test]
fn test_settings_file_found_under_home() {
    let dir = tempfile::tempdir().unwrap();
    let settings_dir = dir.path().join(".local/share/vulkan/loader_settings.d");
    fs::create_dir_all(&settings_dir).unwrap();
    let path = write_settings(
        &settings_dir,
        r#"{ "file_format_version": "1.0.0", "settings": { "layers": [] } }"#,
    );
    let snapshot = SettingsSnapshot::resolve(&home_env(dir.path()), &OsFileSystem::new()).unwrap();
    assert!(snapshot.layers.settings_active);
    assert_eq!(snapshot.settings_file, Some(path));
}

#[test]
#[serial]
fn test_global_snapshot_refcount_and_log_mask() {
    global::init();
    global::init();
    assert_eq!(global::refcount(), 2);

    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("VK_LOADER_DEBUG", "warn");
    let snapshot =
        SettingsSnapshot::resolve_with_file(&env, &OsFileSystem::new(), Some(Path::new("/nonexistent/s.json")))
            .unwrap();
    let first = global::update(snapshot.clone());
    let second = global::update(snapshot);
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    assert_eq!(global::snapshot().map(|s| s.log.flags), Some(DebugFlags::WARN));
    assert!(logging::should_log(DebugFlags::WARN));
    assert!(!logging::should_log(DebugFlags::PERF));

    global::teardown();
    assert!(global::snapshot().is_some());
    global::teardown();
    assert_eq!(global::refcount(), 0);
    assert!(global::snapshot().is_none());
    assert!(!logging::should_log(DebugFlags::WARN));
    assert!(logging::should_log(DebugFlags::ERROR));
}
