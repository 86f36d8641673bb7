//! Manifest discovery.
//!
//! A [`ManifestCatalog`] turns a settings snapshot into the list of layers
//! and drivers visible to the loader. [`DirectoryCatalog`] scans the
//! snapshot's search paths; [`MemoryCatalog`] serves fixed lists.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vkchain_common::{loader_log, DebugFlags};

use crate::config::{ManifestKind, SettingsSnapshot};
use crate::error::{try_push, CoreError};
use crate::fs::FileSystem;
use crate::layer::LayerRecord;
use crate::manifest::{parse_driver_manifest, parse_layer_manifest, DriverManifest};

/// Implicit meta layer whose `override_paths` replace the explicit layer
/// search path.
pub const OVERRIDE_LAYER_NAME: &str = "VK_LAYER_LUNARG_override";

pub trait ManifestCatalog: Send + Sync {
    /// Every discovered layer, implicit layers first, in discovery order.
    fn layers(&self, settings: &SettingsSnapshot) -> Result<Vec<Arc<LayerRecord>>, CoreError>;

    fn drivers(&self, settings: &SettingsSnapshot) -> Result<Vec<DriverManifest>, CoreError>;

    /// Parse one specific layer manifest, as named by a settings file entry.
    fn layer_from_manifest(&self, path: &Path, implicit: bool) -> Result<Vec<LayerRecord>, CoreError>;
}

// ── Directory scanning ──────────────────────────────────────

pub struct DirectoryCatalog<F: FileSystem> {
    fs: F,
    executable: Option<PathBuf>,
}

impl<F: FileSystem> DirectoryCatalog<F> {
    pub fn new(fs: F) -> Self {
        let executable = fs.executable_path();
        DirectoryCatalog { fs, executable }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Manifest files named by a search path entry: the entry itself when it
    /// names a `.json` file, otherwise the `.json` files inside it.
    fn manifest_files(&self, entry: &Path) -> Vec<PathBuf> {
        if entry.extension().is_some_and(|ext| ext == "json") {
            if self.fs.exists(entry) {
                return vec![entry.to_path_buf()];
            }
            return Vec::new();
        }
        self.fs.json_files(entry)
    }

    fn scan_layers(
        &self,
        paths: &[PathBuf],
        implicit: bool,
        out: &mut Vec<Arc<LayerRecord>>,
    ) -> Result<(), CoreError> {
        for entry in paths {
            for file in self.manifest_files(entry) {
                let layers = match self.layer_from_manifest(&file, implicit) {
                    Ok(layers) => layers,
                    Err(CoreError::OutOfHostMemory) => return Err(CoreError::OutOfHostMemory),
                    Err(e) => {
                        loader_log!(
                            DebugFlags::WARN | DebugFlags::LAYER,
                            "skipping layer manifest {}: {}",
                            file.display(),
                            e
                        );
                        continue;
                    }
                };
                for layer in layers {
                    if out.iter().any(|existing| existing.name == layer.name) {
                        loader_log!(
                            DebugFlags::WARN | DebugFlags::LAYER,
                            "layer {} from {} is already known, ignoring this copy",
                            layer.name,
                            file.display()
                        );
                        continue;
                    }
                    loader_log!(
                        DebugFlags::DEBUG | DebugFlags::LAYER,
                        "found {} layer {} in {}",
                        if implicit { "implicit" } else { "explicit" },
                        layer.name,
                        file.display()
                    );
                    try_push(out, Arc::new(layer))?;
                }
            }
        }
        Ok(())
    }
}

impl<F: FileSystem> ManifestCatalog for DirectoryCatalog<F> {
    fn layers(&self, settings: &SettingsSnapshot) -> Result<Vec<Arc<LayerRecord>>, CoreError> {
        let mut layers = Vec::new();
        self.scan_layers(settings.search_paths.get(ManifestKind::ImplicitLayer), true, &mut layers)?;

        let override_paths = layers
            .iter()
            .find(|layer| {
                layer.name == OVERRIDE_LAYER_NAME
                    && layer.is_meta()
                    && !layer.override_paths.is_empty()
                    && layer.applies_to(self.executable.as_deref())
            })
            .map(|layer| layer.override_paths.clone());

        match override_paths {
            Some(paths) => {
                loader_log!(
                    DebugFlags::INFO | DebugFlags::LAYER,
                    "override layer restricts explicit layer search to {:?}",
                    paths
                );
                self.scan_layers(&paths, false, &mut layers)?;
            }
            None => self.scan_layers(
                settings.search_paths.get(ManifestKind::ExplicitLayer),
                false,
                &mut layers,
            )?,
        }
        Ok(layers)
    }

    fn drivers(&self, settings: &SettingsSnapshot) -> Result<Vec<DriverManifest>, CoreError> {
        let mut drivers: Vec<DriverManifest> = Vec::new();
        for entry in settings.search_paths.get(ManifestKind::Driver) {
            for file in self.manifest_files(entry) {
                let parsed = self
                    .fs
                    .read_to_string(&file)
                    .and_then(|text| parse_driver_manifest(&file, &text));
                match parsed {
                    Ok(driver) => {
                        if drivers.iter().any(|d| d.manifest_path == driver.manifest_path) {
                            continue;
                        }
                        loader_log!(
                            DebugFlags::DEBUG | DebugFlags::DRIVER,
                            "found driver manifest {} -> {}",
                            file.display(),
                            driver.library_path.display()
                        );
                        try_push(&mut drivers, driver)?;
                    }
                    Err(CoreError::OutOfHostMemory) => return Err(CoreError::OutOfHostMemory),
                    Err(e) => loader_log!(
                        DebugFlags::WARN | DebugFlags::DRIVER,
                        "skipping driver manifest {}: {}",
                        file.display(),
                        e
                    ),
                }
            }
        }
        Ok(drivers)
    }

    fn layer_from_manifest(&self, path: &Path, implicit: bool) -> Result<Vec<LayerRecord>, CoreError> {
        let text = self.fs.read_to_string(path)?;
        parse_layer_manifest(path, &text, implicit)
    }
}

// ── Fixed lists ─────────────────────────────────────────────

/// A catalog with a fixed content, for embedders and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    layers: Vec<Arc<LayerRecord>>,
    drivers: Vec<DriverManifest>,
    manifests: HashMap<PathBuf, Vec<LayerRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a discovered layer. Its manifest path also becomes readable
    /// through [`ManifestCatalog::layer_from_manifest`].
    pub fn with_layer(mut self, layer: LayerRecord) -> Self {
        if !layer.manifest_path.as_os_str().is_empty() {
            self.manifests
                .entry(layer.manifest_path.clone())
                .or_default()
                .push(layer.clone());
        }
        self.layers.push(Arc::new(layer));
        self
    }

    /// Register a manifest that is not part of the discovered list, such as
    /// a layer only reachable through a settings file entry.
    pub fn with_manifest(mut self, path: impl Into<PathBuf>, layer: LayerRecord) -> Self {
        let path = path.into();
        self.manifests
            .entry(path.clone())
            .or_default()
            .push(layer.with_manifest_path(path));
        self
    }

    pub fn with_driver(mut self, driver: DriverManifest) -> Self {
        self.drivers.push(driver);
        self
    }
}

impl ManifestCatalog for MemoryCatalog {
    fn layers(&self, _settings: &SettingsSnapshot) -> Result<Vec<Arc<LayerRecord>>, CoreError> {
        Ok(self.layers.clone())
    }

    fn drivers(&self, _settings: &SettingsSnapshot) -> Result<Vec<DriverManifest>, CoreError> {
        Ok(self.drivers.clone())
    }

    fn layer_from_manifest(&self, path: &Path, implicit: bool) -> Result<Vec<LayerRecord>, CoreError> {
        let layers = self
            .manifests
            .get(path)
            .ok_or_else(|| CoreError::manifest(path, "no such manifest"))?;
        Ok(layers
            .iter()
            .cloned()
            .map(|mut layer| {
                if implicit {
                    layer.type_flags.remove(crate::layer::LayerType::EXPLICIT);
                }
                layer
            })
            .collect())
    }
}
