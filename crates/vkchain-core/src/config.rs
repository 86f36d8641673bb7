//! The resolved loader configuration.
//!
//! [`SettingsSnapshot::resolve`] runs a fixed pipeline: platform default
//! search paths, then the optional settings file, then environment overrides
//! (the environment always wins), then the final per-kind search path lists.
//! The result is immutable; instances keep their own copy.

use std::path::{Path, PathBuf};

use vkchain_common::platform::{
    self, DRIVER_RELATIVE_DIR, EXPLICIT_LAYER_RELATIVE_DIR, IMPLICIT_LAYER_RELATIVE_DIR,
    PATH_SEPARATOR, SETTINGS_RELATIVE_DIR,
};
use vkchain_common::{loader_log, DebugFlags, Environment};

use crate::error::CoreError;
use crate::filter::{DisableFilter, FilterSet};
use crate::fs::FileSystem;
use crate::settings_file::{LayerConfiguration, LoaderSettingsFile};

// ── Environment variable names ──────────────────────────────

pub const ENV_LOADER_DEBUG: &str = "VK_LOADER_DEBUG";
pub const ENV_LAYERS_ENABLE: &str = "VK_LOADER_LAYERS_ENABLE";
pub const ENV_LAYERS_DISABLE: &str = "VK_LOADER_LAYERS_DISABLE";
pub const ENV_INSTANCE_LAYERS: &str = "VK_INSTANCE_LAYERS";
pub const ENV_LAYERS_EXIT_ON_MISSING: &str = "VK_LOADER_LAYERS_EXIT_ON_MISSING";
pub const ENV_DRIVERS_SELECT: &str = "VK_LOADER_DRIVERS_SELECT";
pub const ENV_DRIVERS_DISABLE: &str = "VK_LOADER_DRIVERS_DISABLE";
pub const ENV_DRIVER_FILES: &str = "VK_DRIVER_FILES";
pub const ENV_ICD_FILENAMES: &str = "VK_ICD_FILENAMES";
pub const ENV_ADD_DRIVER_FILES: &str = "VK_ADD_DRIVER_FILES";
pub const ENV_LAYER_PATH: &str = "VK_LAYER_PATH";
pub const ENV_ADD_LAYER_PATH: &str = "VK_ADD_LAYER_PATH";
pub const ENV_IMPLICIT_LAYER_PATH: &str = "VK_IMPLICIT_LAYER_PATH";
pub const ENV_ADD_IMPLICIT_LAYER_PATH: &str = "VK_ADD_IMPLICIT_LAYER_PATH";
pub const ENV_DEVICE_SELECT: &str = "VK_LOADER_DEVICE_SELECT";
pub const ENV_DISABLE_SELECT: &str = "VK_LOADER_DISABLE_SELECT";
pub const ENV_DISABLE_INST_EXT_FILTER: &str = "VK_LOADER_DISABLE_INST_EXT_FILTER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    Driver,
    ImplicitLayer,
    ExplicitLayer,
    Settings,
}

impl ManifestKind {
    pub const ALL: [ManifestKind; 4] = [
        ManifestKind::Driver,
        ManifestKind::ImplicitLayer,
        ManifestKind::ExplicitLayer,
        ManifestKind::Settings,
    ];

    pub fn relative_dir(self) -> &'static str {
        match self {
            ManifestKind::Driver => DRIVER_RELATIVE_DIR,
            ManifestKind::ImplicitLayer => IMPLICIT_LAYER_RELATIVE_DIR,
            ManifestKind::ExplicitLayer => EXPLICIT_LAYER_RELATIVE_DIR,
            ManifestKind::Settings => SETTINGS_RELATIVE_DIR,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ManifestKind::Driver => "driver",
            ManifestKind::ImplicitLayer => "implicit layer",
            ManifestKind::ExplicitLayer => "explicit layer",
            ManifestKind::Settings => "settings file",
        }
    }

    fn log_flag(self) -> DebugFlags {
        match self {
            ManifestKind::Driver => DebugFlags::DRIVER,
            ManifestKind::ImplicitLayer | ManifestKind::ExplicitLayer => DebugFlags::LAYER,
            ManifestKind::Settings => DebugFlags::INFO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub flags: DebugFlags,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            flags: DebugFlags::ERROR,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InstanceConfig {
    /// Pass every requested instance extension to every driver.
    pub disable_instance_extension_filter: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LayerConfig {
    /// `VK_INSTANCE_LAYERS`, in order.
    pub forced_layers: Vec<String>,
    pub enable: FilterSet,
    pub disable: DisableFilter,
    pub exit_on_missing: bool,
    /// True when a settings file applies; layer selection then follows
    /// `settings_layers`.
    pub settings_active: bool,
    pub settings_layers: Vec<LayerConfiguration>,
    pub has_unordered_layer_location: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DriverConfig {
    pub select: FilterSet,
    pub disable: FilterSet,
}

/// `VK_LOADER_DEVICE_SELECT=vendor:device`, both hexadecimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSelector {
    pub vendor_id: u32,
    pub device_id: u32,
}

impl DeviceSelector {
    pub fn parse(value: &str) -> Option<Self> {
        fn hex(part: &str) -> Option<u32> {
            let part = part.trim();
            let digits = part
                .strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part);
            u32::from_str_radix(digits, 16).ok()
        }
        let (vendor, device) = value.split_once(':')?;
        Some(DeviceSelector {
            vendor_id: hex(vendor)?,
            device_id: hex(device)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSelectConfig {
    pub sorting_enabled: bool,
    pub select: Option<DeviceSelector>,
}

impl Default for DeviceSelectConfig {
    fn default() -> Self {
        DeviceSelectConfig {
            sorting_enabled: cfg!(target_os = "linux"),
            select: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SearchPaths {
    pub driver: Vec<PathBuf>,
    pub implicit_layer: Vec<PathBuf>,
    pub explicit_layer: Vec<PathBuf>,
    pub settings: Vec<PathBuf>,
}

impl SearchPaths {
    pub fn get(&self, kind: ManifestKind) -> &[PathBuf] {
        match kind {
            ManifestKind::Driver => &self.driver,
            ManifestKind::ImplicitLayer => &self.implicit_layer,
            ManifestKind::ExplicitLayer => &self.explicit_layer,
            ManifestKind::Settings => &self.settings,
        }
    }

    fn get_mut(&mut self, kind: ManifestKind) -> &mut Vec<PathBuf> {
        match kind {
            ManifestKind::Driver => &mut self.driver,
            ManifestKind::ImplicitLayer => &mut self.implicit_layer,
            ManifestKind::ExplicitLayer => &mut self.explicit_layer,
            ManifestKind::Settings => &mut self.settings,
        }
    }
}

/// Everything that governs layer and driver selection for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub log: LogConfig,
    pub instance: InstanceConfig,
    pub layers: LayerConfig,
    pub drivers: DriverConfig,
    pub device_select: DeviceSelectConfig,
    pub search_paths: SearchPaths,
    /// The settings file in effect, if any.
    pub settings_file: Option<PathBuf>,
}

/// Combine a default list with an override or additional list: an override
/// replaces the defaults, additional entries go first. Duplicates are
/// removed keeping the first occurrence.
pub fn complete_search_path(
    defaults: &[PathBuf],
    override_paths: Option<&[PathBuf]>,
    additional: Option<&[PathBuf]>,
) -> Result<Vec<PathBuf>, CoreError> {
    let mut out: Vec<PathBuf> = Vec::new();
    let sources: Vec<&[PathBuf]> = match override_paths {
        Some(paths) => vec![paths],
        None => vec![additional.unwrap_or(&[]), defaults],
    };
    out.try_reserve(sources.iter().map(|s| s.len()).sum())?;
    for path in sources.into_iter().flatten() {
        if path.as_os_str().len() > 1 && !out.contains(path) {
            out.push(path.clone());
        }
    }
    Ok(out)
}

fn is_truthy(value: Option<String>) -> bool {
    value
        .map(|v| {
            let v = v.trim();
            v.parse::<i64>().map(|n| n != 0).unwrap_or(false) || v.eq_ignore_ascii_case("true")
        })
        .unwrap_or(false)
}

/// A path-list variable, honoured only when longer than one character.
fn env_path_list(env: &dyn Environment, key: &str, flag: DebugFlags) -> Option<Vec<PathBuf>> {
    let value = env.secure_get(key).filter(|v| v.len() > 1)?;
    loader_log!(DebugFlags::INFO | flag, "found environment var {}, using value {}", key, value);
    Some(platform::split_path_list(&value))
}

impl SettingsSnapshot {
    pub fn resolve(env: &dyn Environment, fs: &dyn FileSystem) -> Result<Self, CoreError> {
        Self::resolve_with_file(env, fs, None)
    }

    /// Like [`SettingsSnapshot::resolve`], reading the settings file from
    /// `settings_file` instead of the platform locations.
    pub fn resolve_with_file(
        env: &dyn Environment,
        fs: &dyn FileSystem,
        settings_file: Option<&Path>,
    ) -> Result<Self, CoreError> {
        let mut snapshot = SettingsSnapshot::default();

        // 1. platform defaults
        let mut defaults = SearchPaths::default();
        for kind in ManifestKind::ALL {
            let include_sysconf = kind != ManifestKind::Settings;
            *defaults.get_mut(kind) =
                platform::default_search_dirs(env, kind.relative_dir(), include_sysconf);
        }

        // 2. settings file
        if let Some(file) = LoaderSettingsFile::locate(env, fs, settings_file) {
            loader_log!(
                DebugFlags::INFO,
                "using layer configurations found in loader settings from {}",
                file.path.display()
            );
            snapshot.layers.settings_active = true;
            snapshot.layers.has_unordered_layer_location = file.has_unordered_layer_location;
            snapshot.layers.settings_layers = file.layer_configurations;
            if let Some(flags) = file.stderr_log {
                snapshot.log.flags = flags;
            }
            snapshot.settings_file = Some(file.path);
        }

        // 3. environment overrides
        if let Some(debug) = env.get(ENV_LOADER_DEBUG).filter(|v| !v.is_empty()) {
            snapshot.log.flags = DebugFlags::parse_list(&debug);
        }
        if let Some(value) = env.secure_get(ENV_LAYERS_ENABLE) {
            snapshot.layers.enable = FilterSet::parse(&value);
        }
        if let Some(value) = env.secure_get(ENV_LAYERS_DISABLE) {
            snapshot.layers.disable = DisableFilter::parse(&value);
        }
        if let Some(value) = env.get(ENV_INSTANCE_LAYERS) {
            snapshot.layers.forced_layers = value
                .split(PATH_SEPARATOR)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        snapshot.layers.exit_on_missing = is_truthy(env.get(ENV_LAYERS_EXIT_ON_MISSING));
        if let Some(value) = env.secure_get(ENV_DRIVERS_SELECT) {
            snapshot.drivers.select = FilterSet::parse(&value);
        }
        if let Some(value) = env.secure_get(ENV_DRIVERS_DISABLE) {
            snapshot.drivers.disable = FilterSet::parse(&value);
        }
        snapshot.instance.disable_instance_extension_filter =
            is_truthy(env.get(ENV_DISABLE_INST_EXT_FILTER));

        if is_truthy(env.get(ENV_DISABLE_SELECT)) {
            loader_log!(
                DebugFlags::INFO | DebugFlags::DRIVER,
                "{} set to non-zero, disabling device sorting",
                ENV_DISABLE_SELECT
            );
            snapshot.device_select.sorting_enabled = false;
        } else if let Some(value) = env.get(ENV_DEVICE_SELECT).filter(|v| v.len() > 1) {
            match DeviceSelector::parse(&value) {
                Some(selector) => snapshot.device_select.select = Some(selector),
                None => loader_log!(
                    DebugFlags::WARN | DebugFlags::DRIVER,
                    "ignoring malformed {}={}",
                    ENV_DEVICE_SELECT,
                    value
                ),
            }
        }

        // 4. final search paths
        let driver_override = env_path_list(env, ENV_DRIVER_FILES, DebugFlags::DRIVER)
            .or_else(|| env_path_list(env, ENV_ICD_FILENAMES, DebugFlags::DRIVER));
        let driver_add = env_path_list(env, ENV_ADD_DRIVER_FILES, DebugFlags::DRIVER);
        let explicit_override = env_path_list(env, ENV_LAYER_PATH, DebugFlags::LAYER);
        let explicit_add = env_path_list(env, ENV_ADD_LAYER_PATH, DebugFlags::LAYER);
        let implicit_override = env_path_list(env, ENV_IMPLICIT_LAYER_PATH, DebugFlags::LAYER);
        let implicit_add = env_path_list(env, ENV_ADD_IMPLICIT_LAYER_PATH, DebugFlags::LAYER);

        snapshot.search_paths.driver = complete_search_path(
            &defaults.driver,
            driver_override.as_deref(),
            driver_add.as_deref(),
        )?;
        snapshot.search_paths.implicit_layer = complete_search_path(
            &defaults.implicit_layer,
            implicit_override.as_deref(),
            implicit_add.as_deref(),
        )?;
        snapshot.search_paths.explicit_layer = complete_search_path(
            &defaults.explicit_layer,
            explicit_override.as_deref(),
            explicit_add.as_deref(),
        )?;
        snapshot.search_paths.settings = complete_search_path(&defaults.settings, None, None)?;

        for kind in ManifestKind::ALL {
            let paths = snapshot.search_paths.get(kind);
            loader_log!(
                kind.log_flag(),
                "search paths for {} manifest files: {:?}",
                kind.label(),
                paths
            );
        }

        Ok(snapshot)
    }

    /// Whether any setting would influence which layers are enabled.
    pub fn has_layer_overrides(&self) -> bool {
        self.layers.settings_active
            || !self.layers.enable.is_empty()
            || !self.layers.disable.is_empty()
            || !self.layers.forced_layers.is_empty()
    }
}
