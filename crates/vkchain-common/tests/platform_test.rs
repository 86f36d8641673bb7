//! Integration test: environment access and search path assembly
//!
//! Run with: cargo test -p vkchain-common --test platform_test

use std::path::PathBuf;

use serial_test::serial;
use vkchain_common::env::{Environment, MapEnvironment, ProcessEnvironment};
use vkchain_common::logging::{self, DebugFlags};
use vkchain_common::platform;

#[test]
fn test_secure_get_refused_when_elevated() {
    let env = MapEnvironment::new().with("VK_LAYER_PATH", "/opt/layers");
    assert_eq!(env.secure_get("VK_LAYER_PATH").as_deref(), Some("/opt/layers"));

    let elevated = env.elevated(true);
    assert_eq!(elevated.get("VK_LAYER_PATH").as_deref(), Some("/opt/layers"));
    assert_eq!(elevated.secure_get("VK_LAYER_PATH"), None);
}

#[test]
#[serial]
fn test_process_environment_reads_real_variables() {
    std::env::set_var("VKCHAIN_TEST_VARIABLE", "value");
    assert_eq!(
        ProcessEnvironment.get("VKCHAIN_TEST_VARIABLE").as_deref(),
        Some("value")
    );
    std::env::remove_var("VKCHAIN_TEST_VARIABLE");
    assert_eq!(ProcessEnvironment.get("VKCHAIN_TEST_VARIABLE"), None);
}

#[test]
fn test_split_path_list_drops_short_entries() {
    let sep = platform::PATH_SEPARATOR;
    let value = format!("/a{sep}{sep}x{sep}/b/c");
    assert_eq!(
        platform::split_path_list(&value),
        vec![PathBuf::from("/a"), PathBuf::from("/b/c")]
    );
}

#[test]
fn test_default_search_dirs_with_xdg_variables() {
    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("XDG_CONFIG_HOME", "/cfg")
        .with("XDG_CONFIG_DIRS", "/xdg1:/xdg2")
        .with("XDG_DATA_HOME", "/data")
        .with("XDG_DATA_DIRS", "/share");
    let dirs = platform::default_search_dirs(&env, "vulkan/explicit_layer.d", true);
    let expected: Vec<PathBuf> = [
        "/cfg/vulkan/explicit_layer.d",
        "/xdg1/vulkan/explicit_layer.d",
        "/xdg2/vulkan/explicit_layer.d",
        "/etc/vulkan/explicit_layer.d",
        "/data/vulkan/explicit_layer.d",
        "/share/vulkan/explicit_layer.d",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    assert_eq!(dirs, expected);

    let without_sysconf = platform::default_search_dirs(&env, "vulkan/loader_settings.d", false);
    assert_eq!(without_sysconf.len(), 5);
}

#[test]
fn test_settings_file_candidates_order() {
    let env = MapEnvironment::new()
        .with("HOME", "/home/user")
        .with("XDG_DATA_HOME", "/data");
    let candidates = platform::settings_file_candidates(&env);
    assert_eq!(
        candidates,
        vec![
            PathBuf::from("/home/user/.local/share/vulkan/loader_settings.d/vk_loader_settings.json"),
            PathBuf::from("/data/vulkan/loader_settings.d/vk_loader_settings.json"),
            PathBuf::from("/etc/vulkan/loader_settings.d/vk_loader_settings.json"),
        ]
    );
}

#[test]
fn test_debug_flag_parsing() {
    assert_eq!(DebugFlags::parse_list("warn,error"), DebugFlags::WARN | DebugFlags::ERROR);
    assert_eq!(DebugFlags::parse_list("icd, layer ,bogus"), DebugFlags::DRIVER | DebugFlags::LAYER);
    assert_eq!(DebugFlags::parse_list("all"), DebugFlags::all());
    assert_eq!(DebugFlags::from_names(["info", "perf"]), DebugFlags::INFO | DebugFlags::PERF);
}

#[test]
#[serial]
fn test_active_flags_gate_loader_log() {
    let previous = logging::active_flags();
    logging::set_active_flags(DebugFlags::LAYER);
    assert!(logging::should_log(DebugFlags::WARN | DebugFlags::LAYER));
    assert!(!logging::should_log(DebugFlags::DRIVER));
    vkchain_common::loader_log!(DebugFlags::LAYER, "layer message {}", 1);
    logging::set_active_flags(previous);
}
