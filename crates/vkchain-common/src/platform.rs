use std::path::{Path, PathBuf};

use crate::env::Environment;

pub const DRIVER_RELATIVE_DIR: &str = "vulkan/icd.d";
pub const IMPLICIT_LAYER_RELATIVE_DIR: &str = "vulkan/implicit_layer.d";
pub const EXPLICIT_LAYER_RELATIVE_DIR: &str = "vulkan/explicit_layer.d";
pub const SETTINGS_RELATIVE_DIR: &str = "vulkan/loader_settings.d";
pub const SETTINGS_FILE_NAME: &str = "vk_loader_settings.json";

pub const SYSCONFDIR: &str = "/etc";
pub const FALLBACK_CONFIG_DIRS: &str = "/etc/xdg";
pub const FALLBACK_DATA_DIRS: &str = "/usr/local/share:/usr/share";

/// Separator between entries of path-list environment variables.
#[cfg(windows)]
pub const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_SEPARATOR: char = ':';

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}

/// Split a path-list value. Entries of one character or less are dropped.
pub fn split_path_list(value: &str) -> Vec<PathBuf> {
    value
        .split(PATH_SEPARATOR)
        .filter(|entry| entry.len() > 1)
        .map(PathBuf::from)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn home_subdir(env: &dyn Environment, xdg_var: &str, home_suffix: &str) -> Option<PathBuf> {
    match non_empty(env.secure_get(xdg_var)) {
        Some(dir) => Some(PathBuf::from(dir)),
        None => non_empty(env.secure_get("HOME")).map(|home| Path::new(&home).join(home_suffix)),
    }
}

/// Default directories for one manifest kind, in search order:
/// config home, config dirs, sysconfdir, data home, data dirs.
///
/// The settings file search skips the system configuration directory.
pub fn default_search_dirs(env: &dyn Environment, relative: &str, include_sysconf: bool) -> Vec<PathBuf> {
    let config_home = home_subdir(env, "XDG_CONFIG_HOME", ".config");
    let data_home = home_subdir(env, "XDG_DATA_HOME", ".local/share");
    let config_dirs = non_empty(env.secure_get("XDG_CONFIG_DIRS"))
        .unwrap_or_else(|| FALLBACK_CONFIG_DIRS.to_string());
    let data_dirs = non_empty(env.secure_get("XDG_DATA_DIRS"))
        .unwrap_or_else(|| FALLBACK_DATA_DIRS.to_string());

    let mut bases: Vec<PathBuf> = Vec::new();
    bases.extend(config_home);
    bases.extend(split_path_list(&config_dirs));
    if include_sysconf {
        bases.push(PathBuf::from(SYSCONFDIR));
    }
    bases.extend(data_home);
    bases.extend(split_path_list(&data_dirs));

    bases.into_iter().map(|base| base.join(relative)).collect()
}

/// Candidate locations of `vk_loader_settings.json`, most specific first.
pub fn settings_file_candidates(env: &dyn Environment) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = non_empty(env.secure_get("HOME")) {
        candidates.push(
            Path::new(&home)
                .join(".local/share")
                .join(SETTINGS_RELATIVE_DIR)
                .join(SETTINGS_FILE_NAME),
        );
    }
    if let Some(data_home) = non_empty(env.secure_get("XDG_DATA_HOME")) {
        candidates.push(Path::new(&data_home).join(SETTINGS_RELATIVE_DIR).join(SETTINGS_FILE_NAME));
    }
    candidates.push(Path::new(SYSCONFDIR).join(SETTINGS_RELATIVE_DIR).join(SETTINGS_FILE_NAME));
    candidates
}

/// Path of the running executable, used to match settings `app_keys`.
pub fn executable_path() -> Option<PathBuf> {
    std::env::current_exe().ok()
}
