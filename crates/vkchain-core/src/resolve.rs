//! Layer resolution: which layers an instance activates, and in what order.
//!
//! Two modes exist. When a settings file applies, its ordered layer
//! configurations decide (optionally merging the discovered catalog at an
//! `unordered_layer_location` placeholder). Otherwise every discovered layer
//! goes through the environment and application enable test.
//!
//! Both modes produce two parallel lists: `requested` holds what was enabled,
//! meta layers included, and `expanded` holds the layers that actually get
//! loaded, with every meta layer replaced by its components.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use vkchain_common::{loader_log, DebugFlags, Environment};

use crate::catalog::ManifestCatalog;
use crate::config::{DriverConfig, SettingsSnapshot};
use crate::error::{try_push, CoreError};
use crate::layer::{LayerControl, LayerRecord};
use crate::manifest::DriverManifest;
use crate::settings_file::LayerConfiguration;

/// Inputs of one resolution.
pub struct ResolveRequest<'a> {
    pub settings: &'a SettingsSnapshot,
    pub env: &'a dyn Environment,
    pub catalog: &'a dyn ManifestCatalog,
    /// The discovered layers, as returned by `catalog.layers()`.
    pub available: &'a [Arc<LayerRecord>],
    /// Layer names the application asked for.
    pub app_layers: &'a [String],
    pub executable: Option<&'a Path>,
}

#[derive(Debug, Default)]
pub struct ResolvedLayers {
    pub requested: Vec<Arc<LayerRecord>>,
    pub expanded: Vec<Arc<LayerRecord>>,
    /// Forced layer names that were never discovered.
    pub missing_forced: Vec<String>,
}

impl ResolvedLayers {
    pub fn requested_names(&self) -> Vec<String> {
        crate::layer::layer_names(&self.requested)
    }

    pub fn expanded_names(&self) -> Vec<String> {
        crate::layer::layer_names(&self.expanded)
    }
}

/// Outcome of expanding one meta layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Expanded,
    /// The meta layer is already being expanded further up.
    CycleDetected,
    ComponentMissing(String),
}

// ── Implicit layer environment toggles ──────────────────────

/// Whether an implicit layer's own environment declarations enable it.
///
/// Any value of the disable variable disables. A declared enable variable
/// must be set to its declared value. Without either, the layer is on.
pub fn implicit_layer_env_enabled(layer: &LayerRecord, env: &dyn Environment) -> bool {
    if let Some(disable) = &layer.disable_env {
        if env.get(&disable.name).is_some() {
            return false;
        }
    }
    match &layer.enable_env {
        Some(enable) => env.get(&enable.name).is_some_and(|value| value == enable.value),
        None => true,
    }
}

// ── Settings file layers ────────────────────────────────────

/// One position of the settings file layer list.
#[derive(Debug, Clone)]
pub enum SettingsEntry {
    Layer(Arc<LayerRecord>),
    /// The `unordered_layer_location` slot.
    Placeholder,
}

/// Turn settings file configurations into layer records.
///
/// `off` entries become identity-only markers. Manifests that cannot be read
/// or whose layer name differs from the entry are dropped with a warning, as
/// are duplicates.
pub fn settings_layers(
    configurations: &[LayerConfiguration],
    catalog: &dyn ManifestCatalog,
) -> Result<Vec<SettingsEntry>, CoreError> {
    let mut entries: Vec<SettingsEntry> = Vec::new();
    for config in configurations {
        let layer = match config.control {
            LayerControl::UnorderedLocation => {
                try_push(&mut entries, SettingsEntry::Placeholder)?;
                continue;
            }
            LayerControl::Off => LayerRecord::off_marker(&config.name, &config.path),
            LayerControl::On | LayerControl::Default => {
                let parsed = match catalog.layer_from_manifest(&config.path, config.treat_as_implicit) {
                    Ok(parsed) => parsed,
                    Err(CoreError::OutOfHostMemory) => return Err(CoreError::OutOfHostMemory),
                    Err(e) => {
                        loader_log!(
                            DebugFlags::WARN | DebugFlags::LAYER,
                            "settings file layer {}: could not load manifest {}: {}",
                            config.name,
                            config.path.display(),
                            e
                        );
                        continue;
                    }
                };
                let Some(layer) = parsed.into_iter().find(|layer| layer.name == config.name) else {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::LAYER,
                        "settings file names layer {} but manifest {} does not declare it, removing it",
                        config.name,
                        config.path.display()
                    );
                    continue;
                };
                layer.with_control(config.control)
            }
        };

        let duplicate = entries.iter().any(|entry| match entry {
            SettingsEntry::Layer(existing) => existing.same_identity(&layer),
            SettingsEntry::Placeholder => false,
        });
        if duplicate {
            loader_log!(
                DebugFlags::WARN | DebugFlags::LAYER,
                "settings file lists layer {} more than once, ignoring the repeat",
                layer.name
            );
            continue;
        }
        try_push(&mut entries, SettingsEntry::Layer(Arc::new(layer)))?;
    }
    Ok(entries)
}

/// Merge settings entries with the discovered layers.
///
/// Without a placeholder the settings entries are the whole list. With one,
/// the discovered layers not named anywhere in the settings are inserted at
/// its position.
pub fn combine(
    entries: &[SettingsEntry],
    available: &[Arc<LayerRecord>],
) -> Result<Vec<Arc<LayerRecord>>, CoreError> {
    let settings_only = || {
        entries.iter().filter_map(|entry| match entry {
            SettingsEntry::Layer(layer) => Some(layer),
            SettingsEntry::Placeholder => None,
        })
    };

    let Some(placeholder) = entries
        .iter()
        .position(|entry| matches!(entry, SettingsEntry::Placeholder))
    else {
        let mut out = Vec::new();
        out.try_reserve(entries.len())?;
        out.extend(settings_only().cloned());
        return Ok(out);
    };

    let mut out: Vec<Arc<LayerRecord>> = Vec::new();
    out.try_reserve(entries.len() + available.len())?;

    for entry in &entries[..placeholder] {
        if let SettingsEntry::Layer(layer) = entry {
            if !out.iter().any(|existing| existing.same_identity(layer)) {
                out.push(layer.clone());
            }
        }
    }
    for layer in available {
        let named = settings_only().any(|listed| listed.same_identity(layer));
        if !named && !out.iter().any(|existing| existing.same_identity(layer)) {
            out.push(layer.clone());
        }
    }
    for entry in &entries[placeholder + 1..] {
        if let SettingsEntry::Layer(layer) = entry {
            out.push(layer.clone());
        }
    }
    Ok(out)
}

// ── Meta layer expansion ────────────────────────────────────

/// Expand `meta` into `out`, components in declaration order. Nested meta
/// layers expand in place. On [`Expansion::ComponentMissing`] the contents of
/// `out` are unspecified and should be discarded.
pub fn expand_meta_layer(
    meta: &Arc<LayerRecord>,
    lookup: &[Arc<LayerRecord>],
    visited: &mut HashSet<String>,
    out: &mut Vec<Arc<LayerRecord>>,
) -> Result<Expansion, CoreError> {
    if !visited.insert(meta.name.clone()) {
        return Ok(Expansion::CycleDetected);
    }
    for component_name in &meta.component_layers {
        let component = lookup
            .iter()
            .find(|layer| &layer.name == component_name && layer.control != Some(LayerControl::Off));
        let Some(component) = component else {
            return Ok(Expansion::ComponentMissing(component_name.clone()));
        };
        if component.is_meta() {
            match expand_meta_layer(component, lookup, visited, out)? {
                Expansion::Expanded => {}
                Expansion::CycleDetected => {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::LAYER,
                        "meta layer {} refers back to {}, ignoring the cycle",
                        meta.name,
                        component.name
                    );
                }
                missing @ Expansion::ComponentMissing(_) => return Ok(missing),
            }
            continue;
        }
        if !out.iter().any(|existing| existing.name == component.name) {
            try_push(out, component.clone())?;
        }
    }
    Ok(Expansion::Expanded)
}

// ── Resolution ──────────────────────────────────────────────

struct Activation<'a> {
    request: &'a ResolveRequest<'a>,
    lookup: &'a [Arc<LayerRecord>],
    out: ResolvedLayers,
}

impl Activation<'_> {
    /// The enable test used for every layer without a settings `on`/`off`.
    fn env_enabled(&self, layer: &LayerRecord) -> bool {
        let layers = &self.request.settings.layers;
        if layers.enable.matches(&layer.name) {
            loader_log!(
                DebugFlags::INFO | DebugFlags::LAYER,
                "layer {} enabled by {}",
                layer.name,
                crate::config::ENV_LAYERS_ENABLE
            );
            return true;
        }
        if layers.disable.rejects(&layer.name, layer.is_implicit()) {
            loader_log!(
                DebugFlags::INFO | DebugFlags::LAYER,
                "layer {} disabled by {}",
                layer.name,
                crate::config::ENV_LAYERS_DISABLE
            );
            return false;
        }
        layers.forced_layers.iter().any(|name| name == &layer.name)
            || self.request.app_layers.iter().any(|name| name == &layer.name)
            || (layer.is_implicit() && implicit_layer_env_enabled(layer, self.request.env))
    }

    fn activate(&mut self, layer: &Arc<LayerRecord>) -> Result<(), CoreError> {
        if !layer.is_meta() {
            if !self.out.requested.iter().any(|existing| existing.name == layer.name) {
                try_push(&mut self.out.requested, layer.clone())?;
            }
            if !self.out.expanded.iter().any(|existing| existing.name == layer.name) {
                try_push(&mut self.out.expanded, layer.clone())?;
            }
            return Ok(());
        }

        if self.out.requested.iter().any(|existing| existing.name == layer.name) {
            return Ok(());
        }
        let mut visited = HashSet::new();
        let mut components = Vec::new();
        match expand_meta_layer(layer, self.lookup, &mut visited, &mut components)? {
            Expansion::Expanded => {
                try_push(&mut self.out.requested, layer.clone())?;
                for component in components {
                    if !self.out.expanded.iter().any(|existing| existing.name == component.name) {
                        try_push(&mut self.out.expanded, component)?;
                    }
                }
            }
            Expansion::CycleDetected => {}
            Expansion::ComponentMissing(name) => {
                loader_log!(
                    DebugFlags::WARN | DebugFlags::LAYER,
                    "meta layer {} is missing component {}, not activating it",
                    layer.name,
                    name
                );
            }
        }
        Ok(())
    }
}

/// Layers left after applying meta layer blacklists and `app_keys`.
fn applicable_layers(
    available: &[Arc<LayerRecord>],
    executable: Option<&Path>,
) -> Result<Vec<Arc<LayerRecord>>, CoreError> {
    let mut blacklist: HashSet<&str> = HashSet::new();
    for layer in available {
        if layer.is_meta() && layer.applies_to(executable) {
            blacklist.extend(layer.blacklisted_layers.iter().map(String::as_str));
        }
    }

    let mut out = Vec::new();
    out.try_reserve(available.len())?;
    for layer in available {
        if layer.is_meta() && !layer.applies_to(executable) {
            loader_log!(
                DebugFlags::INFO | DebugFlags::LAYER,
                "meta layer {} does not apply to this application",
                layer.name
            );
            continue;
        }
        if blacklist.contains(layer.name.as_str()) {
            loader_log!(
                DebugFlags::INFO | DebugFlags::LAYER,
                "layer {} is blacklisted by a meta layer",
                layer.name
            );
            continue;
        }
        out.push(layer.clone());
    }
    Ok(out)
}

/// Decide the layers of one instance.
///
/// Fails with [`CoreError::LayerNotPresent`] when the application names a
/// layer that does not exist, and with [`CoreError::MissingForcedLayer`] when
/// a forced layer is missing and the exit-on-missing policy is set.
pub fn resolve_instance_layers(request: &ResolveRequest<'_>) -> Result<ResolvedLayers, CoreError> {
    let available = applicable_layers(request.available, request.executable)?;
    let layer_config = &request.settings.layers;

    let candidates = if layer_config.settings_active {
        let entries = settings_layers(&layer_config.settings_layers, request.catalog)?;
        combine(&entries, &available)?
    } else {
        available.clone()
    };

    for name in request.app_layers {
        if !candidates.iter().any(|layer| &layer.name == name) {
            loader_log!(
                DebugFlags::ERROR | DebugFlags::LAYER,
                "requested layer {} was not found",
                name
            );
            return Err(CoreError::LayerNotPresent(name.clone()));
        }
    }

    // Components may live outside the settings list when no placeholder
    // merged the catalog in.
    let mut lookup = candidates.clone();
    lookup.try_reserve(available.len())?;
    for layer in &available {
        if !lookup.iter().any(|existing| existing.name == layer.name) {
            lookup.push(layer.clone());
        }
    }

    let mut out = ResolvedLayers::default();
    for name in &layer_config.forced_layers {
        // Settings markers and filtered catalog layers still count as found.
        let discovered = lookup.iter().chain(request.available).any(|layer| &layer.name == name);
        if discovered {
            continue;
        }
        loader_log!(
            DebugFlags::ERROR | DebugFlags::LAYER,
            "layer {} named in {} was not found",
            name,
            crate::config::ENV_INSTANCE_LAYERS
        );
        if layer_config.exit_on_missing {
            return Err(CoreError::MissingForcedLayer(name.clone()));
        }
        try_push(&mut out.missing_forced, name.clone())?;
    }

    let mut activation = Activation {
        request,
        lookup: &lookup,
        out,
    };

    for layer in &candidates {
        let enabled = match layer.control {
            Some(LayerControl::Off) => {
                loader_log!(
                    DebugFlags::INFO | DebugFlags::LAYER,
                    "layer {} is turned off by the settings file",
                    layer.name
                );
                false
            }
            Some(LayerControl::On) => true,
            _ => activation.env_enabled(layer),
        };
        if enabled {
            activation.activate(layer)?;
        }
    }

    let out = activation.out;
    loader_log!(
        DebugFlags::INFO | DebugFlags::LAYER,
        "resolved layers: requested {:?}, expanded {:?}",
        out.requested_names(),
        out.expanded_names()
    );
    Ok(out)
}

// ── Drivers ─────────────────────────────────────────────────

/// Apply the driver select filter (keep matches) and then the disable filter
/// (drop matches) to driver manifest file names.
pub fn select_drivers(drivers: Vec<DriverManifest>, config: &DriverConfig) -> Vec<DriverManifest> {
    drivers
        .into_iter()
        .filter(|driver| {
            let file_name = driver.file_name();
            if !config.select.is_empty() && !config.select.matches(&file_name) {
                loader_log!(
                    DebugFlags::INFO | DebugFlags::DRIVER,
                    "driver {} not selected by {}",
                    file_name,
                    crate::config::ENV_DRIVERS_SELECT
                );
                return false;
            }
            if config.disable.matches(&file_name) {
                loader_log!(
                    DebugFlags::INFO | DebugFlags::DRIVER,
                    "driver {} disabled by {}",
                    file_name,
                    crate::config::ENV_DRIVERS_DISABLE
                );
                return false;
            }
            true
        })
        .collect()
}
