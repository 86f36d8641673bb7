//! Configuration and layer resolution for the vkchain loader.
//!
//! Everything here is independent of the dispatch machinery: settings
//! resolution, manifest parsing and discovery, name filters, and the
//! algorithm that turns all of those into an ordered layer list.

pub mod catalog;
pub mod config;
pub mod error;
pub mod filter;
pub mod fs;
pub mod global;
pub mod interpose;
pub mod layer;
pub mod manifest;
pub mod resolve;
pub mod settings_file;

pub use catalog::{DirectoryCatalog, ManifestCatalog, MemoryCatalog};
pub use config::SettingsSnapshot;
pub use error::CoreError;
pub use filter::{DisableFilter, FilterSet};
pub use fs::{FileSystem, OsFileSystem};
pub use interpose::{ChainLink, EntryPoint, GetPhysicalDeviceProcAddr, Interposer, NativeEntryPoints};
pub use layer::{LayerControl, LayerRecord, LayerType};
pub use manifest::DriverManifest;
pub use resolve::{resolve_instance_layers, ResolveRequest, ResolvedLayers};
