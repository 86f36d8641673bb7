//! The loader front end and the instance lifecycle.
//!
//! [`Loader`] owns the collaborators (environment, filesystem, manifest
//! catalog, library opener) and turns an instance request into an
//! [`InstanceRecord`]: settings, drivers, resolved layers, one driver
//! instance per driver, and the instance chain.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use vkchain_common::env::{Environment, ProcessEnvironment};
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::catalog::{DirectoryCatalog, ManifestCatalog};
use vkchain_core::config::SettingsSnapshot;
use vkchain_core::error::try_push;
use vkchain_core::fs::{FileSystem, OsFileSystem};
use vkchain_core::resolve::{self, resolve_instance_layers, ResolveRequest, ResolvedLayers};
use vkchain_core::{global, ChainLink, CoreError, EntryPoint, LayerControl, LayerRecord};

use crate::chain::{build_chain, create_instance_chain, ChainKind, DriverLink, InstanceTerminatorLink};
use crate::device::{self, DeviceRecord};
use crate::dispatch::{
    cast_entry, raw_handle, DispatchTable, Dispatchable, INSTANCE_COMMANDS, INSTANCE_MAGIC,
    MAX_UNKNOWN_FUNCTIONS,
};
use crate::error::LoaderError;
use crate::handle_store::{self, Tagged};
use crate::library::{
    copy_name, extension_name, extension_properties, Driver, DriverInstanceInfo, HostAllocator, LibraryOpener,
    NativeLibraries,
};
use crate::physical_device::{TerminatorHandle, TrampolineHandle};
use crate::pre_instance::{
    self, Interceptor, ENUMERATE_INSTANCE_EXTENSION_PROPERTIES, ENUMERATE_INSTANCE_LAYER_PROPERTIES,
    ENUMERATE_INSTANCE_VERSION,
};
use crate::unknown_ext::UnknownFunctionTable;

const _: () = assert!(std::mem::offset_of!(Dispatchable<InstanceRecord>, dispatch) == 0);

#[derive(Debug, Clone, Default)]
pub struct InstanceCreateInfo {
    pub application_name: Option<String>,
    pub api_version: u32,
    pub enabled_layers: Vec<String>,
    pub enabled_extensions: Vec<String>,
    pub allocator: Option<HostAllocator>,
}

// ── Records ─────────────────────────────────────────────────

/// One driver under an instance.
pub struct IcdRecord {
    pub index: usize,
    pub driver: Arc<dyn Driver>,
    /// The driver's own instance handle.
    pub instance: vk::Instance,
    dispatch: Box<DispatchTable>,
    pub(crate) devices: Mutex<Vec<Arc<DeviceRecord>>>,
    pub supports_extended_enumeration: bool,
    pub enabled_extensions: Vec<String>,
}

impl IcdRecord {
    /// Entry points resolved from the driver. Unknown physical-device
    /// functions use the same indices as the instance table.
    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn devices(&self) -> Vec<Arc<DeviceRecord>> {
        self.devices.lock().clone()
    }
}

impl fmt::Debug for IcdRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcdRecord")
            .field("index", &self.index)
            .field("driver", &self.driver.name())
            .field("instance", &self.instance)
            .field("devices", &self.devices.lock().len())
            .finish()
    }
}

pub struct InstanceRecord {
    magic: AtomicU64,
    pub app_api_version: u32,
    pub layers: ResolvedLayers,
    pub icds: Vec<IcdRecord>,
    top: OnceLock<Arc<dyn ChainLink>>,
    table: Box<DispatchTable>,
    pub(crate) trampolines: Mutex<Vec<TrampolineHandle>>,
    pub(crate) terminators: Mutex<Vec<TerminatorHandle>>,
    pub allocator: Option<HostAllocator>,
    pub enabled_extensions: Vec<String>,
    pub settings: Arc<SettingsSnapshot>,
    pub unknown_device_functions: UnknownFunctionTable,
    pub unknown_physical_device_functions: UnknownFunctionTable,
}

impl InstanceRecord {
    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// Top of the instance chain. Until the chain is linked, the loader's
    /// terminators.
    pub(crate) fn top(&self) -> Arc<dyn ChainLink> {
        match self.top.get() {
            Some(top) => top.clone(),
            None => Arc::new(InstanceTerminatorLink),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic() == INSTANCE_MAGIC
    }

    /// Physical devices handed to the application so far.
    pub fn physical_device_count(&self) -> usize {
        self.trampolines.lock().len()
    }
}

impl Tagged for InstanceRecord {
    const MAGIC: u64 = INSTANCE_MAGIC;
    const KIND: &'static str = "instance";

    fn magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }
}

impl fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("magic", &format_args!("{:#x}", self.magic()))
            .field("app_api_version", &self.app_api_version)
            .field("layers", &self.layers.expanded_names())
            .field("icds", &self.icds)
            .field("table", &self.table)
            .finish()
    }
}

/// Look up a live instance by raw handle.
pub(crate) fn live_instance(handle: u64) -> Result<Arc<Dispatchable<InstanceRecord>>, LoaderError> {
    Ok(handle_store::unwrap_instance(vk::Instance::from_raw(handle))?)
}

// ── Loader ──────────────────────────────────────────────────

pub struct Loader {
    env: Arc<dyn Environment>,
    fs: Arc<dyn FileSystem>,
    catalog: Arc<dyn ManifestCatalog>,
    libraries: Arc<dyn LibraryOpener>,
    settings_file: Option<PathBuf>,
}

/// Replaces the loader's collaborators. Anything not set uses the process
/// environment, the real filesystem, and native libraries.
#[derive(Default)]
pub struct LoaderBuilder {
    env: Option<Arc<dyn Environment>>,
    fs: Option<Arc<dyn FileSystem>>,
    catalog: Option<Arc<dyn ManifestCatalog>>,
    libraries: Option<Arc<dyn LibraryOpener>>,
    settings_file: Option<PathBuf>,
}

impl LoaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, env: impl Environment + 'static) -> Self {
        self.env = Some(Arc::new(env));
        self
    }

    pub fn fs(mut self, fs: impl FileSystem + 'static) -> Self {
        self.fs = Some(Arc::new(fs));
        self
    }

    pub fn catalog(mut self, catalog: impl ManifestCatalog + 'static) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }

    pub fn libraries(mut self, libraries: impl LibraryOpener + 'static) -> Self {
        self.libraries = Some(Arc::new(libraries));
        self
    }

    /// Read the settings file from `path` instead of the platform locations.
    pub fn settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_file = Some(path.into());
        self
    }

    pub fn build(self) -> Loader {
        global::init();
        Loader {
            env: self.env.unwrap_or_else(|| Arc::new(ProcessEnvironment)),
            fs: self.fs.unwrap_or_else(|| Arc::new(OsFileSystem::new())),
            catalog: self
                .catalog
                .unwrap_or_else(|| Arc::new(DirectoryCatalog::new(OsFileSystem::new()))),
            libraries: self.libraries.unwrap_or_else(|| Arc::new(NativeLibraries)),
            settings_file: self.settings_file,
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        global::teardown();
    }
}

impl Loader {
    pub fn new() -> Self {
        LoaderBuilder::new().build()
    }

    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::new()
    }

    /// Resolve the settings and publish them as the global snapshot.
    pub fn settings(&self) -> Result<Arc<SettingsSnapshot>, LoaderError> {
        let snapshot =
            SettingsSnapshot::resolve_with_file(&*self.env, &*self.fs, self.settings_file.as_deref())?;
        Ok(global::update(snapshot))
    }

    /// Every discovered layer, in search order.
    pub fn available_layers(&self) -> Result<Vec<Arc<LayerRecord>>, LoaderError> {
        let settings = self.settings()?;
        Ok(self.catalog.layers(&settings)?)
    }

    /// Layers an application may request: the settings file list when one is
    /// active, otherwise every discovered layer the disable filter leaves.
    pub fn enumerate_instance_layers(&self) -> Result<Vec<Arc<LayerRecord>>, LoaderError> {
        let settings = self.settings()?;
        let available = self.catalog.layers(&settings)?;
        let layer_config = &settings.layers;
        if layer_config.settings_active {
            let entries = resolve::settings_layers(&layer_config.settings_layers, &*self.catalog)?;
            let combined = resolve::combine(&entries, &available)?;
            return Ok(combined
                .into_iter()
                .filter(|layer| layer.control != Some(LayerControl::Off))
                .collect());
        }
        Ok(available
            .into_iter()
            .filter(|layer| {
                layer_config.enable.matches(&layer.name)
                    || !layer_config.disable.rejects(&layer.name, layer.is_implicit())
            })
            .collect())
    }

    /// Instance extensions of every driver, or of one layer, as the enabled
    /// implicit layers report them.
    pub fn enumerate_instance_extensions(
        &self,
        layer_name: Option<&str>,
    ) -> Result<Vec<vk::ExtensionProperties>, LoaderError> {
        let settings = self.settings()?;
        let interceptors = self.pre_instance_interceptors(&settings, ENUMERATE_INSTANCE_EXTENSION_PROPERTIES)?;
        let answer = self.own_instance_extensions(&settings, layer_name);
        if interceptors.is_empty() {
            return answer;
        }
        pre_instance::instance_extension_properties(&interceptors, layer_name, answer.map_err(|e| e.vk_result()))
    }

    fn own_instance_extensions(
        &self,
        settings: &SettingsSnapshot,
        layer_name: Option<&str>,
    ) -> Result<Vec<vk::ExtensionProperties>, LoaderError> {
        if let Some(name) = layer_name {
            let layers = self.enumerate_instance_layers()?;
            let layer = layers
                .iter()
                .find(|layer| layer.name == name)
                .ok_or_else(|| CoreError::LayerNotPresent(name.to_string()))?;
            return Ok(layer
                .instance_extensions
                .iter()
                .map(|ext| extension_properties(&ext.name, ext.spec_version))
                .collect());
        }

        let mut out: Vec<vk::ExtensionProperties> = Vec::new();
        for driver in self.open_drivers(settings)? {
            let extensions = match driver.instance_extensions() {
                Ok(extensions) => extensions,
                Err(e) => {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::DRIVER,
                        "driver {} failed to report instance extensions: {}",
                        driver.name(),
                        e
                    );
                    continue;
                }
            };
            for ext in extensions {
                let name = extension_name(&ext);
                if !out.iter().any(|existing| extension_name(existing) == name) {
                    try_push(&mut out, ext)?;
                }
            }
        }
        Ok(out)
    }

    /// [`Self::enumerate_instance_layers`] as API properties, as the enabled
    /// implicit layers report them.
    pub fn instance_layer_properties(&self) -> Result<Vec<vk::LayerProperties>, LoaderError> {
        let settings = self.settings()?;
        let props: Vec<vk::LayerProperties> = self
            .enumerate_instance_layers()?
            .iter()
            .map(|layer| {
                let mut props = vk::LayerProperties {
                    spec_version: layer.api_version,
                    implementation_version: layer.implementation_version,
                    ..Default::default()
                };
                copy_name(&mut props.layer_name, &layer.name);
                copy_name(&mut props.description, &layer.description);
                props
            })
            .collect();
        let interceptors = self.pre_instance_interceptors(&settings, ENUMERATE_INSTANCE_LAYER_PROPERTIES)?;
        if interceptors.is_empty() {
            return Ok(props);
        }
        pre_instance::instance_layer_properties(&interceptors, props)
    }

    pub fn instance_version(&self) -> Result<u32, LoaderError> {
        let settings = self.settings()?;
        let interceptors = self.pre_instance_interceptors(&settings, ENUMERATE_INSTANCE_VERSION)?;
        if interceptors.is_empty() {
            return Ok(vk::HEADER_VERSION_COMPLETE);
        }
        pre_instance::instance_version(&interceptors, vk::HEADER_VERSION_COMPLETE)
    }

    /// Enabled implicit layers whose manifest overrides `command`, in search
    /// order. A layer that cannot be loaded or lacks the symbol is skipped.
    fn pre_instance_interceptors(
        &self,
        settings: &SettingsSnapshot,
        command: &str,
    ) -> Result<Vec<Interceptor>, LoaderError> {
        let layer_config = &settings.layers;
        let mut out: Vec<Interceptor> = Vec::new();
        for layer in self.catalog.layers(settings)? {
            if !layer.is_implicit() || !layer.pre_instance_functions.contains_key(command) {
                continue;
            }
            if !resolve::implicit_layer_env_enabled(&layer, &*self.env)
                || (!layer_config.enable.matches(&layer.name) && layer_config.disable.rejects(&layer.name, true))
            {
                continue;
            }
            let library = match layer.library() {
                Some(library) => library.clone(),
                None => match self.libraries.open_layer(&layer) {
                    Ok(library) => library,
                    Err(e) => {
                        loader_log!(
                            DebugFlags::WARN | DebugFlags::LAYER,
                            "unable to load implicit layer {} for {}: {}",
                            layer.name,
                            command,
                            e
                        );
                        continue;
                    }
                },
            };
            match library.pre_instance_function(command) {
                Some(entry) => try_push(&mut out, Interceptor::new(&layer.name, Some(entry), library))?,
                None => loader_log!(
                    DebugFlags::WARN | DebugFlags::LAYER,
                    "implicit layer {} names an override of {} it does not provide",
                    layer.name,
                    command
                ),
            }
        }
        Ok(out)
    }

    fn open_drivers(&self, settings: &SettingsSnapshot) -> Result<Vec<Arc<dyn Driver>>, LoaderError> {
        let manifests = resolve::select_drivers(self.catalog.drivers(settings)?, &settings.drivers);
        let mut drivers: Vec<Arc<dyn Driver>> = Vec::new();
        for manifest in &manifests {
            match self.libraries.open_driver(manifest) {
                Ok(driver) => {
                    loader_log!(
                        DebugFlags::INFO | DebugFlags::DRIVER,
                        "found driver {} (interface version {})",
                        manifest.library_path.display(),
                        driver.interface_version()
                    );
                    try_push(&mut drivers, driver)?;
                }
                Err(LoaderError::Core(CoreError::OutOfHostMemory)) => {
                    return Err(CoreError::OutOfHostMemory.into());
                }
                Err(e) => {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::DRIVER,
                        "skipping driver {}: {}",
                        manifest.library_path.display(),
                        e
                    );
                }
            }
        }
        Ok(drivers)
    }

    /// Open the library of every expanded layer. Layers that fail to load are
    /// left out of both lists.
    fn load_layers(&self, layers: &mut ResolvedLayers) {
        let mut failed: Vec<String> = Vec::new();
        for layer in &layers.expanded {
            if layer.is_meta() || layer.library().is_some() {
                continue;
            }
            match self.libraries.open_layer(layer) {
                Ok(library) => {
                    layer.bind_library(library);
                }
                Err(e) => {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::LAYER,
                        "failed to load layer {}: {}; omitting it",
                        layer.name,
                        e
                    );
                    failed.push(layer.name.clone());
                }
            }
        }
        if failed.is_empty() {
            return;
        }
        layers.expanded.retain(|layer| !failed.contains(&layer.name));
        layers
            .requested
            .retain(|layer| layer.is_meta() || !failed.contains(&layer.name));
    }

    pub fn create_instance(&self, info: &InstanceCreateInfo) -> Result<vk::Instance, LoaderError> {
        let settings = self.settings()?;
        let available = self.catalog.layers(&settings)?;
        let drivers = self.open_drivers(&settings)?;
        if drivers.is_empty() {
            loader_log!(DebugFlags::ERROR | DebugFlags::DRIVER, "no drivers found");
            return Err(CoreError::IncompatibleDriver("no drivers found".to_string()).into());
        }

        let executable = self.fs.executable_path();
        let request = ResolveRequest {
            settings: &settings,
            env: &*self.env,
            catalog: &*self.catalog,
            available: &available,
            app_layers: &info.enabled_layers,
            executable: executable.as_deref(),
        };
        let mut layers = resolve_instance_layers(&request)?;
        self.load_layers(&mut layers);

        // Extension checks
        let driver_extensions: Vec<Vec<String>> = drivers
            .iter()
            .map(|driver| match driver.instance_extensions() {
                Ok(extensions) => extensions.iter().map(extension_name).collect(),
                Err(e) => {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::DRIVER,
                        "driver {} failed to report instance extensions: {}",
                        driver.name(),
                        e
                    );
                    Vec::new()
                }
            })
            .collect();
        let filter_disabled = settings.instance.disable_instance_extension_filter;
        if !filter_disabled {
            for requested in &info.enabled_extensions {
                let from_driver = driver_extensions.iter().any(|list| list.contains(requested));
                let from_layer = layers
                    .expanded
                    .iter()
                    .any(|layer| layer.instance_extensions.iter().any(|ext| &ext.name == requested));
                if !from_driver && !from_layer {
                    loader_log!(
                        DebugFlags::ERROR | DebugFlags::VALIDATION,
                        "instance extension {} is not supported by any driver or enabled layer",
                        requested
                    );
                    return Err(CoreError::ExtensionNotPresent(requested.clone()).into());
                }
            }
        }

        // Driver instances
        let mut icds: Vec<IcdRecord> = Vec::new();
        for (driver, supported) in drivers.iter().zip(&driver_extensions) {
            let extensions: Vec<String> = if filter_disabled {
                info.enabled_extensions.clone()
            } else {
                info.enabled_extensions
                    .iter()
                    .filter(|ext| supported.contains(ext))
                    .cloned()
                    .collect()
            };
            let driver_info = DriverInstanceInfo {
                application_name: info.application_name.clone(),
                api_version: info.api_version,
                extensions: extensions.clone(),
                allocator: info.allocator,
            };
            let driver_instance = match driver.create_instance(&driver_info) {
                Ok(instance) => instance,
                Err(e) => {
                    loader_log!(
                        DebugFlags::WARN | DebugFlags::DRIVER,
                        "driver {} failed to create an instance: {}",
                        driver.name(),
                        e
                    );
                    continue;
                }
            };
            let link = DriverLink {
                driver: driver.clone(),
                instance: driver_instance,
            };
            let dispatch = match DispatchTable::resolve(INSTANCE_COMMANDS, &link, MAX_UNKNOWN_FUNCTIONS) {
                Ok(dispatch) => dispatch,
                Err(e) => {
                    driver.destroy_instance(driver_instance, info.allocator.as_ref());
                    release_icds(&icds, info.allocator.as_ref());
                    return Err(e.into());
                }
            };
            icds.push(IcdRecord {
                index: icds.len(),
                driver: driver.clone(),
                instance: driver_instance,
                dispatch: Box::new(dispatch),
                devices: Mutex::new(Vec::new()),
                supports_extended_enumeration: driver.supports_extended_enumeration(),
                enabled_extensions: extensions,
            });
        }
        if icds.is_empty() {
            return Err(CoreError::IncompatibleDriver("no driver could create an instance".to_string()).into());
        }

        let table = match DispatchTable::empty(INSTANCE_COMMANDS, MAX_UNKNOWN_FUNCTIONS) {
            Ok(table) => Box::new(table),
            Err(e) => {
                release_icds(&icds, info.allocator.as_ref());
                return Err(e.into());
            }
        };
        let dispatch: *const DispatchTable = &*table;
        let layer_names = layers.expanded_names();
        let record = Arc::new(Dispatchable::new(
            dispatch,
            InstanceRecord {
                magic: AtomicU64::new(INSTANCE_MAGIC),
                app_api_version: info.api_version,
                layers,
                icds,
                top: OnceLock::new(),
                table,
                trampolines: Mutex::new(Vec::new()),
                terminators: Mutex::new(Vec::new()),
                allocator: info.allocator,
                enabled_extensions: info.enabled_extensions.clone(),
                settings,
                unknown_device_functions: UnknownFunctionTable::new(),
                unknown_physical_device_functions: UnknownFunctionTable::new(),
            },
        ));
        let handle = raw_handle(&record);
        let driver_count = record.icds.len();
        handle_store::store_instance(handle, record.clone());

        // Chain. Native layers see the instance while they are created.
        let bottom: Arc<dyn ChainLink> = Arc::new(InstanceTerminatorLink);
        let linked = build_chain(bottom, &record.layers.expanded, ChainKind::Instance, handle)
            .map_err(LoaderError::from)
            .and_then(|chain| {
                let chain_layers: Vec<String> = record
                    .layers
                    .expanded
                    .iter()
                    .filter(|layer| !layer.is_meta())
                    .map(|layer| layer.name.clone())
                    .collect();
                create_instance_chain(&chain, vk::Instance::from_raw(handle), info, &chain_layers)?;
                Ok(chain)
            });
        let chain = match linked {
            Ok(chain) => chain,
            Err(e) => {
                teardown_instance(&record);
                return Err(e);
            }
        };
        record.table.fill(&*chain.top);
        let _ = record.top.set(chain.top);

        loader_log!(
            DebugFlags::INFO,
            "created instance {:#x} with {} driver(s), layers {:?}",
            handle,
            driver_count,
            layer_names
        );
        Ok(vk::Instance::from_raw(handle))
    }
}

fn release_icds(icds: &[IcdRecord], allocator: Option<&HostAllocator>) {
    for icd in icds {
        icd.driver.destroy_instance(icd.instance, allocator);
    }
}

// ── Lifecycle ───────────────────────────────────────────────

/// Destroy an instance through its chain. The loader terminator at the bottom
/// releases everything the instance owns.
pub fn destroy_instance(handle: vk::Instance) -> Result<(), LoaderError> {
    if handle == vk::Instance::null() {
        return Ok(());
    }
    let instance = handle_store::unwrap_instance(handle)?;
    let destroy = unsafe { cast_entry::<vk::PFN_vkDestroyInstance>(instance.table().get("vkDestroyInstance")) };
    if let Some(destroy) = destroy {
        unsafe { destroy(handle, HostAllocator::as_ptr(instance.allocator.as_ref())) };
    }
    // A layer that does not forward the call leaves the record behind.
    if handle_store::get_instance(handle.as_raw()).is_some() {
        teardown_instance(&instance);
    }
    Ok(())
}

pub(crate) fn teardown_instance(instance: &Arc<Dispatchable<InstanceRecord>>) {
    let handle = raw_handle(instance);
    for icd in &instance.icds {
        let devices = std::mem::take(&mut *icd.devices.lock());
        for device in &devices {
            device::release_device(icd, device);
        }
        icd.driver.destroy_instance(icd.instance, instance.allocator.as_ref());
    }
    for trampoline in instance.trampolines.lock().drain(..) {
        handle_store::remove_trampoline(raw_handle(&trampoline));
        trampoline.invalidate();
    }
    for terminator in instance.terminators.lock().drain(..) {
        handle_store::remove_terminator(raw_handle(&terminator));
        terminator.invalidate();
    }
    instance.magic.store(0, Ordering::Release);
    handle_store::remove_instance(handle);
    loader_log!(DebugFlags::INFO, "destroyed instance {:#x}", handle);
}

/// Entry point for `name` as seen from the top of the instance chain.
pub fn get_instance_proc_addr(handle: vk::Instance, name: &str) -> Result<EntryPoint, LoaderError> {
    let instance = handle_store::unwrap_instance(handle)?;
    if instance.table().is_known(name) {
        return Ok(instance.table().get(name));
    }
    Ok(instance.top().proc_addr(name))
}
