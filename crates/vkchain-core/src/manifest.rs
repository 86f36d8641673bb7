//! JSON manifest parsing for layers and drivers.
//!
//! Layer manifests carry either a single `"layer"` object or a `"layers"`
//! array. Driver manifests carry an `"ICD"` object. Individual malformed
//! layer entries are skipped with a warning; a manifest that is not valid JSON
//! at all is an error for the caller to log and skip.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ash::vk;
use serde::{Deserialize, Deserializer};
use vkchain_common::{loader_log, DebugFlags};

use crate::error::CoreError;
use crate::layer::{
    DeviceExtensionProperty, EnvToggle, ExtensionProperty, LayerFunctions, LayerRecord, LayerType,
};

#[derive(Debug, Deserialize)]
struct RawLayerManifest {
    file_format_version: String,
    #[serde(default)]
    layer: Option<serde_json::Value>,
    #[serde(default)]
    layers: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawLayer {
    name: String,
    #[serde(rename = "type")]
    layer_type: String,
    #[serde(default)]
    library_path: Option<String>,
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default, deserialize_with = "number_or_string")]
    implementation_version: u32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    functions: BTreeMap<String, String>,
    #[serde(default)]
    instance_extensions: Vec<RawExtension>,
    #[serde(default)]
    device_extensions: Vec<RawDeviceExtension>,
    #[serde(default)]
    enable_environment: BTreeMap<String, String>,
    #[serde(default)]
    disable_environment: BTreeMap<String, String>,
    #[serde(default)]
    component_layers: Vec<String>,
    #[serde(default)]
    override_paths: Vec<String>,
    #[serde(default)]
    blacklisted_layers: Vec<String>,
    #[serde(default)]
    app_keys: Vec<String>,
    #[serde(default)]
    pre_instance_functions: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawExtension {
    name: String,
    #[serde(default, deserialize_with = "number_or_string")]
    spec_version: u32,
}

#[derive(Debug, Deserialize)]
struct RawDeviceExtension {
    name: String,
    #[serde(default, deserialize_with = "number_or_string")]
    spec_version: u32,
    #[serde(default)]
    entrypoints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDriverManifest {
    file_format_version: String,
    #[serde(rename = "ICD")]
    icd: RawIcd,
}

#[derive(Debug, Deserialize)]
struct RawIcd {
    library_path: String,
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    is_portability_driver: bool,
}

/// Manifests write versions both as `"1"` and as `1`.
fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u32),
        Text(String),
    }
    Ok(match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => n,
        NumberOrString::Text(s) => s.trim().parse().unwrap_or(0),
    })
}

/// Parse `"major.minor.patch"` into a packed API version.
pub fn parse_api_version(text: &str) -> u32 {
    let mut parts = text.split('.').map(|p| p.trim().parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    vk::make_api_version(0, major, minor, patch)
}

/// Library paths containing a directory separator are relative to the
/// manifest; bare file names are left for the system library search.
pub fn resolve_library_path(manifest_path: &Path, library: &str) -> PathBuf {
    let lib = Path::new(library);
    if lib.is_absolute() || lib.components().count() <= 1 {
        return lib.to_path_buf();
    }
    match manifest_path.parent() {
        Some(dir) => dir.join(lib),
        None => lib.to_path_buf(),
    }
}

fn first_toggle(map: BTreeMap<String, String>) -> Option<EnvToggle> {
    map.into_iter().next().map(|(name, value)| EnvToggle { name, value })
}

fn convert_layer(
    raw: RawLayer,
    manifest_path: &Path,
    file_format_version: &str,
    implicit: bool,
) -> Option<LayerRecord> {
    let mut type_flags = match raw.layer_type.as_str() {
        "INSTANCE" | "GLOBAL" => LayerType::INSTANCE,
        other => {
            loader_log!(
                DebugFlags::WARN | DebugFlags::LAYER,
                "layer {} in {} has unsupported type {:?}, skipping",
                raw.name,
                manifest_path.display(),
                other
            );
            return None;
        }
    };
    if !implicit {
        type_flags |= LayerType::EXPLICIT;
    }
    if !raw.component_layers.is_empty() {
        type_flags |= LayerType::META;
    }

    let library_path = if type_flags.contains(LayerType::META) {
        if raw.library_path.is_some() {
            loader_log!(
                DebugFlags::WARN | DebugFlags::LAYER,
                "meta layer {} declares a library_path, ignoring it",
                raw.name
            );
        }
        None
    } else {
        match raw.library_path {
            Some(lib) => Some(resolve_library_path(manifest_path, &lib)),
            None => {
                loader_log!(
                    DebugFlags::WARN | DebugFlags::LAYER,
                    "layer {} in {} has no library_path, skipping",
                    raw.name,
                    manifest_path.display()
                );
                return None;
            }
        }
    };

    if implicit && raw.disable_environment.is_empty() {
        loader_log!(
            DebugFlags::WARN | DebugFlags::LAYER,
            "implicit layer {} does not declare disable_environment",
            raw.name
        );
    }

    let mut layer = LayerRecord::new(&raw.name, type_flags);
    layer.api_version = raw.api_version.as_deref().map_or(0, parse_api_version);
    layer.implementation_version = raw.implementation_version;
    layer.description = raw.description;
    layer.file_format_version = file_format_version.to_string();
    layer.manifest_path = manifest_path.to_path_buf();
    layer.library_path = library_path;
    layer.functions = LayerFunctions {
        get_instance_proc_addr: raw.functions.get("vkGetInstanceProcAddr").cloned(),
        get_device_proc_addr: raw.functions.get("vkGetDeviceProcAddr").cloned(),
        negotiate_interface: raw
            .functions
            .get("vkNegotiateLoaderLayerInterfaceVersion")
            .cloned(),
    };
    layer.instance_extensions = raw
        .instance_extensions
        .into_iter()
        .map(|ext| ExtensionProperty {
            name: ext.name,
            spec_version: ext.spec_version,
        })
        .collect();
    layer.device_extensions = raw
        .device_extensions
        .into_iter()
        .map(|ext| DeviceExtensionProperty {
            name: ext.name,
            spec_version: ext.spec_version,
            entrypoints: ext.entrypoints,
        })
        .collect();
    layer.enable_env = first_toggle(raw.enable_environment);
    layer.disable_env = first_toggle(raw.disable_environment);
    layer.component_layers = raw.component_layers;
    layer.override_paths = raw.override_paths.into_iter().map(PathBuf::from).collect();
    layer.blacklisted_layers = raw.blacklisted_layers;
    layer.app_keys = raw.app_keys.into_iter().map(PathBuf::from).collect();
    layer.pre_instance_functions = raw.pre_instance_functions;
    Some(layer)
}

/// Parse a layer manifest. `implicit` selects the manifest kind, since the
/// kind comes from where the file was found rather than from its contents.
pub fn parse_layer_manifest(
    manifest_path: &Path,
    text: &str,
    implicit: bool,
) -> Result<Vec<LayerRecord>, CoreError> {
    let raw: RawLayerManifest = serde_json::from_str(text)?;

    let mut values = raw.layers;
    if let Some(single) = raw.layer {
        values.insert(0, single);
    }
    if values.is_empty() {
        return Err(CoreError::manifest(manifest_path, "no \"layer\" or \"layers\" entry"));
    }

    let mut layers = Vec::new();
    layers.try_reserve(values.len())?;
    for value in values {
        match serde_json::from_value::<RawLayer>(value) {
            Ok(raw_layer) => {
                if let Some(layer) =
                    convert_layer(raw_layer, manifest_path, &raw.file_format_version, implicit)
                {
                    layers.push(layer);
                }
            }
            Err(e) => loader_log!(
                DebugFlags::WARN | DebugFlags::LAYER,
                "skipping malformed layer entry in {}: {}",
                manifest_path.display(),
                e
            ),
        }
    }
    Ok(layers)
}

/// A discovered driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverManifest {
    pub manifest_path: PathBuf,
    pub library_path: PathBuf,
    pub api_version: u32,
    pub is_portability_driver: bool,
    pub file_format_version: String,
}

impl DriverManifest {
    pub fn new(manifest_path: impl Into<PathBuf>, library_path: impl Into<PathBuf>) -> Self {
        DriverManifest {
            manifest_path: manifest_path.into(),
            library_path: library_path.into(),
            api_version: vk::API_VERSION_1_0,
            is_portability_driver: false,
            file_format_version: "1.0.0".to_string(),
        }
    }

    /// The manifest file name, which driver filters are matched against.
    pub fn file_name(&self) -> String {
        self.manifest_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn parse_driver_manifest(manifest_path: &Path, text: &str) -> Result<DriverManifest, CoreError> {
    let raw: RawDriverManifest = serde_json::from_str(text)?;
    if raw.icd.library_path.is_empty() {
        return Err(CoreError::manifest(manifest_path, "empty library_path"));
    }
    Ok(DriverManifest {
        manifest_path: manifest_path.to_path_buf(),
        library_path: resolve_library_path(manifest_path, &raw.icd.library_path),
        api_version: raw
            .icd
            .api_version
            .as_deref()
            .map_or(vk::API_VERSION_1_0, parse_api_version),
        is_portability_driver: raw.icd.is_portability_driver,
        file_format_version: raw.file_format_version,
    })
}
