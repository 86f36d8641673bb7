//! Human-readable reports over the same resolution the loader performs.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use tracing::warn;
use vkchain_common::ProcessEnvironment;
use vkchain_core::config::ManifestKind;
use vkchain_core::resolve::select_drivers;
use vkchain_core::{
    resolve_instance_layers, DirectoryCatalog, FileSystem, FilterSet, LayerRecord, ManifestCatalog, OsFileSystem,
    ResolveRequest, SettingsSnapshot,
};
use vkchain_loader::library::fixed_name;
use vkchain_loader::{
    destroy_instance, enumerate_physical_devices, physical_device_properties, InstanceCreateInfo, Loader,
};

/// Where and as whom the loader would run.
pub struct Scope {
    pub settings_file: Option<PathBuf>,
    pub exe: Option<PathBuf>,
    pub env: ProcessEnvironment,
}

impl Scope {
    pub fn new(settings_file: Option<PathBuf>, exe: Option<PathBuf>) -> Self {
        Scope {
            settings_file,
            exe,
            env: ProcessEnvironment,
        }
    }

    pub fn fs(&self) -> OsFileSystem {
        match &self.exe {
            Some(path) => OsFileSystem::with_executable(path),
            None => OsFileSystem::new(),
        }
    }

    pub fn settings(&self) -> anyhow::Result<SettingsSnapshot> {
        Ok(SettingsSnapshot::resolve_with_file(
            &self.env,
            &self.fs(),
            self.settings_file.as_deref(),
        )?)
    }

    pub fn catalog(&self) -> DirectoryCatalog<OsFileSystem> {
        DirectoryCatalog::new(self.fs())
    }
}

pub fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

fn rules(filter: &FilterSet) -> String {
    if filter.is_empty() {
        return "(none)".to_string();
    }
    filter
        .rules()
        .iter()
        .map(|rule| format!("{:?}:{}", rule.kind, rule.pattern))
        .collect::<Vec<_>>()
        .join(", ")
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

// ── settings / paths ────────────────────────────────────────

pub fn print_settings(settings: &SettingsSnapshot) {
    let settings_file = match &settings.settings_file {
        Some(path) => path.display().to_string(),
        None => "(none)".to_string(),
    };
    println!("Settings file:      {}", settings_file);
    println!("Log flags:          {:?}", settings.log.flags);
    println!();

    let layers = &settings.layers;
    println!("Layers");
    println!("  forced:           {}", list(&layers.forced_layers));
    println!("  enable filter:    {}", rules(&layers.enable));
    println!("  disable filter:   {}", rules(&layers.disable.additional));
    println!(
        "  disable all:      {} (implicit {}, explicit {})",
        layers.disable.disable_all, layers.disable.disable_all_implicit, layers.disable.disable_all_explicit
    );
    println!("  exit on missing:  {}", layers.exit_on_missing);
    if layers.settings_active {
        println!("  settings file layers:");
        for entry in &layers.settings_layers {
            if entry.name.is_empty() {
                println!("    <{}>", entry.control.as_str());
            } else {
                println!("    {:<40} {:<5} {}", entry.name, entry.control.as_str(), entry.path.display());
            }
        }
    }
    println!();

    println!("Drivers");
    println!("  select filter:    {}", rules(&settings.drivers.select));
    println!("  disable filter:   {}", rules(&settings.drivers.disable));
    println!();

    println!("Devices");
    println!("  sorting:          {}", settings.device_select.sorting_enabled);
    match settings.device_select.select {
        Some(selector) => println!("  select:           {:04x}:{:04x}", selector.vendor_id, selector.device_id),
        None => println!("  select:           (none)"),
    }
    println!(
        "  instance extension filter disabled: {}",
        settings.instance.disable_instance_extension_filter
    );
}

pub fn print_search_paths(settings: &SettingsSnapshot) {
    for kind in ManifestKind::ALL {
        println!("{}:", kind.label());
        let paths = settings.search_paths.get(kind);
        if paths.is_empty() {
            println!("  (none)");
        }
        for path in paths {
            println!("  {}", path.display());
        }
    }
}

// ── layers ──────────────────────────────────────────────────

fn print_layer(layer: &LayerRecord) {
    println!("  {}", layer.name);
    println!("    type:     {:?}", layer.type_flags);
    println!(
        "    version:  api {}, implementation {}",
        version_string(layer.api_version),
        layer.implementation_version
    );
    if let Some(path) = &layer.library_path {
        println!("    library:  {}", path.display());
    }
    if !layer.component_layers.is_empty() {
        println!("    components: {}", layer.component_layers.join(", "));
    }
    println!("    manifest: {}", layer.manifest_path.display());
}

pub fn print_layers(scope: &Scope, app_layers: &[String], all: bool) -> anyhow::Result<()> {
    let settings = scope.settings()?;
    let catalog = scope.catalog();
    let available: Vec<Arc<LayerRecord>> = catalog.layers(&settings)?;

    if all {
        println!("Discovered layers ({}):", available.len());
        for layer in &available {
            print_layer(layer);
        }
        println!();
    }

    let executable = scope.fs().executable_path();
    let resolved = resolve_instance_layers(&ResolveRequest {
        settings: &settings,
        env: &scope.env,
        catalog: &catalog,
        available: &available,
        app_layers,
        executable: executable.as_deref(),
    })?;

    println!("Requested: {}", list(&resolved.requested_names()));
    println!("Chain (application side first):");
    if resolved.expanded.is_empty() {
        println!("  (no layers)");
    }
    for (i, layer) in resolved.expanded.iter().enumerate() {
        println!("  {}. {}", i + 1, layer.name);
    }
    if !resolved.missing_forced.is_empty() {
        warn!("forced layers not found: {}", resolved.missing_forced.join(", "));
        println!("Missing forced layers: {}", resolved.missing_forced.join(", "));
    }
    Ok(())
}

// ── drivers ─────────────────────────────────────────────────

pub fn print_drivers(scope: &Scope) -> anyhow::Result<()> {
    let settings = scope.settings()?;
    let discovered = scope.catalog().drivers(&settings)?;
    let kept = select_drivers(discovered.clone(), &settings.drivers);

    println!("Drivers ({} discovered, {} kept):", discovered.len(), kept.len());
    for driver in &discovered {
        let mark = if kept.contains(driver) { "+" } else { "-" };
        println!("  {} {}", mark, driver.file_name());
        println!("      library:  {}", driver.library_path.display());
        println!("      api:      {}", version_string(driver.api_version));
        if driver.is_portability_driver {
            println!("      portability driver");
        }
    }
    Ok(())
}

// ── devices ─────────────────────────────────────────────────

pub fn print_devices(scope: &Scope, layers: Vec<String>) -> anyhow::Result<()> {
    let mut builder = Loader::builder().fs(scope.fs());
    if let Some(path) = &scope.settings_file {
        builder = builder.settings_file(path.clone());
    }
    let loader = builder.build();

    let instance = loader.create_instance(&InstanceCreateInfo {
        application_name: Some("vkchain".to_string()),
        api_version: vk::API_VERSION_1_1,
        enabled_layers: layers,
        ..Default::default()
    })?;

    let result = (|| -> anyhow::Result<()> {
        let devices = enumerate_physical_devices(instance)?;
        println!("Physical devices ({}):", devices.len());
        for (i, device) in devices.iter().enumerate() {
            let props = physical_device_properties(*device)?;
            println!("  GPU {}: {}", i, fixed_name(&props.device_name));
            println!("    Type:     {:?}", props.device_type);
            println!("    ID:       {:04x}:{:04x}", props.vendor_id, props.device_id);
            println!("    API:      {}", version_string(props.api_version));
        }
        Ok(())
    })();

    destroy_instance(instance)?;
    result
}
