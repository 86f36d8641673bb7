//! `vk_loader_settings.json`: the optional loader settings file.
//!
//! ```json
//! {
//!     "file_format_version": "1.0.0",
//!     "settings_array": [
//!         {
//!             "app_keys": ["/usr/bin/game"],
//!             "stderr_log": ["error", "warn"],
//!             "layers": [
//!                 { "control": "on", "name": "VK_LAYER_A", "path": "/etc/a.json" },
//!                 { "control": "unordered_layer_location" }
//!             ]
//!         }
//!     ]
//! }
//! ```
//!
//! A single `"settings"` object may be used instead of `"settings_array"`.
//! The object whose `app_keys` contains the running executable wins;
//! otherwise the first object without `app_keys` applies.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use vkchain_common::{loader_log, DebugFlags, Environment};

use crate::error::CoreError;
use crate::fs::FileSystem;
use crate::layer::LayerControl;

#[derive(Debug, Deserialize)]
struct RawSettingsFile {
    file_format_version: String,
    #[serde(default)]
    settings: Option<RawSettings>,
    #[serde(default)]
    settings_array: Option<Vec<RawSettings>>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    app_keys: Option<Vec<String>>,
    #[serde(default)]
    layers: Option<Vec<RawLayerConfiguration>>,
    #[serde(default)]
    stderr_log: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawLayerConfiguration {
    control: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    treat_as_implicit_manifest: bool,
}

/// One entry of the settings file `layers` array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerConfiguration {
    /// Empty for [`LayerControl::UnorderedLocation`] entries.
    pub name: String,
    /// Empty for [`LayerControl::UnorderedLocation`] entries.
    pub path: PathBuf,
    pub control: LayerControl,
    pub treat_as_implicit: bool,
}

impl LayerConfiguration {
    pub fn new(name: &str, path: impl Into<PathBuf>, control: LayerControl) -> Self {
        LayerConfiguration {
            name: name.to_string(),
            path: path.into(),
            control,
            treat_as_implicit: false,
        }
    }

    pub fn unordered_location() -> Self {
        LayerConfiguration {
            name: String::new(),
            path: PathBuf::new(),
            control: LayerControl::UnorderedLocation,
            treat_as_implicit: false,
        }
    }
}

/// The applicable settings object of a parsed settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSettingsFile {
    pub path: PathBuf,
    pub file_format_version: String,
    pub layer_configurations: Vec<LayerConfiguration>,
    pub stderr_log: Option<DebugFlags>,
    pub has_unordered_layer_location: bool,
}

fn convert_configuration(raw: RawLayerConfiguration) -> Result<LayerConfiguration, String> {
    let control = LayerControl::parse(&raw.control);
    if control == LayerControl::UnorderedLocation {
        return Ok(LayerConfiguration::unordered_location());
    }
    let name = raw.name.ok_or_else(|| "layer entry without \"name\"".to_string())?;
    let path = raw.path.ok_or_else(|| format!("layer entry {} without \"path\"", name))?;
    Ok(LayerConfiguration {
        name,
        path: PathBuf::from(path),
        control,
        treat_as_implicit: raw.treat_as_implicit_manifest,
    })
}

impl LoaderSettingsFile {
    /// Parse the text of a settings file.
    ///
    /// `Ok(None)` means the file is valid but no settings object applies to
    /// this executable.
    pub fn parse(path: &Path, text: &str, executable: Option<&Path>) -> Result<Option<Self>, CoreError> {
        let raw: RawSettingsFile = serde_json::from_str(text)?;

        let objects = match (raw.settings_array, raw.settings) {
            (Some(array), _) => array,
            (None, Some(single)) => vec![single],
            (None, None) => return Ok(None),
        };

        let mut global_index = None;
        let mut app_index = None;
        for (index, object) in objects.iter().enumerate() {
            match &object.app_keys {
                None => {
                    if global_index.is_none() {
                        global_index = Some(index);
                    }
                }
                Some(keys) => {
                    if let Some(exe) = executable {
                        if app_index.is_none() && keys.iter().any(|key| Path::new(key) == exe) {
                            app_index = Some(index);
                        }
                    }
                }
            }
        }

        let Some(index) = app_index.or(global_index) else {
            return Ok(None);
        };
        let Some(object) = objects.into_iter().nth(index) else {
            return Ok(None);
        };

        let raw_layers = object
            .layers
            .ok_or_else(|| CoreError::manifest(path, "settings object has no \"layers\" array"))?;
        let mut layer_configurations = Vec::new();
        layer_configurations.try_reserve(raw_layers.len())?;
        for raw_layer in raw_layers {
            let configuration =
                convert_configuration(raw_layer).map_err(|reason| CoreError::manifest(path, reason))?;
            layer_configurations.push(configuration);
        }

        let has_unordered_layer_location = layer_configurations
            .iter()
            .any(|c| c.control == LayerControl::UnorderedLocation);

        Ok(Some(LoaderSettingsFile {
            path: path.to_path_buf(),
            file_format_version: raw.file_format_version,
            layer_configurations,
            stderr_log: object.stderr_log.map(DebugFlags::from_names),
            has_unordered_layer_location,
        }))
    }

    /// Find and parse the settings file. A missing or malformed file is not
    /// an error: it is logged and `None` is returned.
    pub fn locate(
        env: &dyn Environment,
        fs: &dyn FileSystem,
        override_path: Option<&Path>,
    ) -> Option<Self> {
        let candidates = match override_path {
            Some(path) => vec![path.to_path_buf()],
            None => vkchain_common::platform::settings_file_candidates(env),
        };
        let path = candidates.into_iter().find(|p| fs.exists(p))?;

        let text = match fs.read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                loader_log!(DebugFlags::WARN, "could not read settings file {}: {}", path.display(), e);
                return None;
            }
        };
        let executable = fs.executable_path();
        match LoaderSettingsFile::parse(&path, &text, executable.as_deref()) {
            Ok(Some(settings)) => Some(settings),
            Ok(None) => {
                loader_log!(
                    DebugFlags::INFO,
                    "settings file {} has no settings for this application",
                    path.display()
                );
                None
            }
            Err(e) => {
                loader_log!(DebugFlags::WARN, "ignoring settings file {}: {}", path.display(), e);
                None
            }
        }
    }
}
