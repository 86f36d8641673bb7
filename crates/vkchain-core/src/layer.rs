//! Discovered layer descriptions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use crate::interpose::Interposer;

bitflags! {
    /// Absence of a bit means the opposite kind: device, implicit, standard.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerType: u32 {
        const INSTANCE = 0x1;
        const EXPLICIT = 0x2;
        const META = 0x4;
    }
}

/// Per-layer control from the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LayerControl {
    /// `"auto"`: the usual enable rules decide.
    #[default]
    Default,
    On,
    Off,
    /// Position where layers not named in the settings file are placed.
    UnorderedLocation,
}

impl LayerControl {
    /// Unrecognised strings fall back to [`LayerControl::Default`].
    pub fn parse(value: &str) -> Self {
        match value {
            "on" => LayerControl::On,
            "off" => LayerControl::Off,
            "unordered_layer_location" => LayerControl::UnorderedLocation,
            _ => LayerControl::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerControl::Default => "auto",
            LayerControl::On => "on",
            LayerControl::Off => "off",
            LayerControl::UnorderedLocation => "unordered_layer_location",
        }
    }
}

/// Custom names for the layer's exported entry points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerFunctions {
    pub get_instance_proc_addr: Option<String>,
    pub get_device_proc_addr: Option<String>,
    pub negotiate_interface: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionProperty {
    pub name: String,
    pub spec_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceExtensionProperty {
    pub name: String,
    pub spec_version: u32,
    pub entrypoints: Vec<String>,
}

/// An `enable_environment` / `disable_environment` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvToggle {
    pub name: String,
    pub value: String,
}

#[derive(Clone)]
pub struct LayerRecord {
    pub name: String,
    pub type_flags: LayerType,
    pub api_version: u32,
    pub implementation_version: u32,
    pub description: String,
    pub file_format_version: String,
    pub manifest_path: PathBuf,
    /// Always `None` for meta layers.
    pub library_path: Option<PathBuf>,
    pub functions: LayerFunctions,
    pub instance_extensions: Vec<ExtensionProperty>,
    pub device_extensions: Vec<DeviceExtensionProperty>,
    pub enable_env: Option<EnvToggle>,
    pub disable_env: Option<EnvToggle>,
    pub component_layers: Vec<String>,
    pub override_paths: Vec<PathBuf>,
    pub blacklisted_layers: Vec<String>,
    pub app_keys: Vec<PathBuf>,
    pub pre_instance_functions: BTreeMap<String, String>,
    /// Set only for layers that came from the settings file.
    pub control: Option<LayerControl>,
    library: OnceLock<Arc<dyn Interposer>>,
}

impl LayerRecord {
    pub fn new(name: &str, type_flags: LayerType) -> Self {
        LayerRecord {
            name: name.to_string(),
            type_flags: type_flags | LayerType::INSTANCE,
            api_version: 0,
            implementation_version: 0,
            description: String::new(),
            file_format_version: String::new(),
            manifest_path: PathBuf::new(),
            library_path: None,
            functions: LayerFunctions::default(),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            enable_env: None,
            disable_env: None,
            component_layers: Vec::new(),
            override_paths: Vec::new(),
            blacklisted_layers: Vec::new(),
            app_keys: Vec::new(),
            pre_instance_functions: BTreeMap::new(),
            control: None,
            library: OnceLock::new(),
        }
    }

    /// Shorthand for an explicit layer backed by `library`.
    pub fn explicit(name: &str, library: impl Into<PathBuf>) -> Self {
        LayerRecord::new(name, LayerType::EXPLICIT).with_library(library)
    }

    /// Shorthand for an implicit layer backed by `library`.
    pub fn implicit(name: &str, library: impl Into<PathBuf>) -> Self {
        LayerRecord::new(name, LayerType::empty()).with_library(library)
    }

    /// A meta layer. `explicit` selects the manifest kind.
    pub fn meta(name: &str, components: &[&str], explicit: bool) -> Self {
        let kind = if explicit { LayerType::EXPLICIT } else { LayerType::empty() };
        let mut layer = LayerRecord::new(name, kind | LayerType::META);
        layer.component_layers = components.iter().map(|c| c.to_string()).collect();
        layer
    }

    /// Negative marker for a settings-file `off` entry: only the identity
    /// fields are populated.
    pub fn off_marker(name: &str, manifest_path: &Path) -> Self {
        let mut layer = LayerRecord::new(name, LayerType::EXPLICIT);
        layer.manifest_path = manifest_path.to_path_buf();
        layer.control = Some(LayerControl::Off);
        layer
    }

    pub fn with_library(mut self, library: impl Into<PathBuf>) -> Self {
        self.library_path = Some(library.into());
        self
    }

    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn with_enable_env(mut self, name: &str, value: &str) -> Self {
        self.enable_env = Some(EnvToggle {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn with_disable_env(mut self, name: &str, value: &str) -> Self {
        self.disable_env = Some(EnvToggle {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn with_control(mut self, control: LayerControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_instance_extension(mut self, name: &str, spec_version: u32) -> Self {
        self.instance_extensions.push(ExtensionProperty {
            name: name.to_string(),
            spec_version,
        });
        self
    }

    /// Name the library symbol that overrides `command` before an instance
    /// exists.
    pub fn with_pre_instance_function(mut self, command: &str, symbol: &str) -> Self {
        self.pre_instance_functions.insert(command.to_string(), symbol.to_string());
        self
    }

    pub fn with_device_extension(mut self, name: &str, entrypoints: &[&str]) -> Self {
        self.device_extensions.push(DeviceExtensionProperty {
            name: name.to_string(),
            spec_version: 1,
            entrypoints: entrypoints.iter().map(|e| e.to_string()).collect(),
        });
        self
    }

    pub fn is_explicit(&self) -> bool {
        self.type_flags.contains(LayerType::EXPLICIT)
    }

    pub fn is_implicit(&self) -> bool {
        !self.is_explicit()
    }

    pub fn is_meta(&self) -> bool {
        self.type_flags.contains(LayerType::META)
    }

    /// Identity used for de-duplication: the same name, and unless a meta
    /// layer is involved, the same library (or, for `off` markers, the same
    /// manifest).
    pub fn same_identity(&self, other: &LayerRecord) -> bool {
        if self.name != other.name {
            return false;
        }
        if self.is_meta() || other.is_meta() {
            return true;
        }
        let marker = self.control == Some(LayerControl::Off) || other.control == Some(LayerControl::Off);
        if marker {
            return self.manifest_path == other.manifest_path;
        }
        self.library_path == other.library_path
    }

    /// Whether `app_keys` (if any) admit `executable`.
    pub fn applies_to(&self, executable: Option<&Path>) -> bool {
        if self.app_keys.is_empty() {
            return true;
        }
        executable.is_some_and(|exe| self.app_keys.iter().any(|key| key == exe))
    }

    /// Whether the layer advertises `entrypoint` among its device extensions.
    pub fn exposes_device_entrypoint(&self, entrypoint: &str) -> bool {
        self.device_extensions
            .iter()
            .any(|ext| ext.entrypoints.iter().any(|e| e == entrypoint))
    }

    /// The loaded library, once bound.
    pub fn library(&self) -> Option<&Arc<dyn Interposer>> {
        self.library.get()
    }

    /// Bind the loaded library. The first binding wins.
    pub fn bind_library(&self, library: Arc<dyn Interposer>) -> &Arc<dyn Interposer> {
        self.library.get_or_init(|| library)
    }

    /// Negotiated interface version, or 0 while the library is not loaded.
    pub fn interface_version(&self) -> u32 {
        self.library().map_or(0, |lib| lib.interface_version())
    }
}

impl fmt::Debug for LayerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerRecord")
            .field("name", &self.name)
            .field("type_flags", &self.type_flags)
            .field("manifest_path", &self.manifest_path)
            .field("library_path", &self.library_path)
            .field("component_layers", &self.component_layers)
            .field("control", &self.control)
            .field("loaded", &self.library.get().is_some())
            .finish()
    }
}

/// Names of a layer list, in order.
pub fn layer_names(layers: &[Arc<LayerRecord>]) -> Vec<String> {
    layers.iter().map(|layer| layer.name.clone()).collect()
}
