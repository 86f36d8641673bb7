use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use vkchain_core::config::ManifestKind;
use vkchain_core::resolve::select_drivers;
use vkchain_core::{DriverManifest, LayerControl, LayerRecord, ManifestCatalog, SettingsSnapshot};

use crate::inspect::Scope;

/// Exported by every driver library the loader accepts.
const DRIVER_ENTRY_SYMBOL: &[u8] = b"vk_icdGetInstanceProcAddr\0";

// ── Check result types ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            details: Vec::new(),
        }
    }

    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    fn fail(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn warn(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    fn skip(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

// ── Main entry point ────────────────────────────────────────

/// Run every check and print the results. Returns true if any check failed.
pub fn run_verify(scope: &Scope, json: bool) -> bool {
    let mut results: Vec<CheckResult> = Vec::new();

    let settings = check_settings(scope, &mut results);
    if let Some(settings) = settings {
        check_search_paths(&settings, &mut results);
        check_drivers(scope, &settings, &mut results);
        let layers = check_layers(scope, &settings, &mut results);
        check_forced_layers(&settings, &layers, &mut results);
        check_settings_layers(&settings, &mut results);
    }

    if json {
        print_results_json(&results);
    } else {
        print_results_pretty(&results);
    }
    results.iter().any(|r| r.status == CheckStatus::Fail)
}

// ── Checks ──────────────────────────────────────────────────

fn check_settings(scope: &Scope, results: &mut Vec<CheckResult>) -> Option<SettingsSnapshot> {
    match scope.settings() {
        Ok(settings) => {
            let result = match &settings.settings_file {
                Some(path) => CheckResult::pass("Settings", "settings file applies")
                    .detail(format!("File: {}", path.display()))
                    .detail(format!("{} layer entries", settings.layers.settings_layers.len())),
                None => match &scope.settings_file {
                    Some(path) => CheckResult::warn("Settings", "settings file was not used")
                        .detail(format!("File: {}", path.display()))
                        .detail("Missing, malformed, or no app_keys match this executable"),
                    None => CheckResult::skip("Settings", "no settings file, using the environment"),
                },
            };
            results.push(result);
            Some(settings)
        }
        Err(e) => {
            results.push(CheckResult::fail("Settings", format!("could not resolve settings: {}", e)));
            None
        }
    }
}

fn check_search_paths(settings: &SettingsSnapshot, results: &mut Vec<CheckResult>) {
    for kind in [ManifestKind::Driver, ManifestKind::ImplicitLayer, ManifestKind::ExplicitLayer] {
        let paths = settings.search_paths.get(kind);
        let existing: Vec<&Path> = paths.iter().map(|p| p.as_path()).filter(|p| p.exists()).collect();
        let name = format!("Search path: {}", kind.label());
        let result = if existing.is_empty() {
            let mut result = CheckResult::warn(&name, "no search directory exists");
            for path in paths {
                result = result.detail(format!("Tried: {}", path.display()));
            }
            result
        } else {
            let mut result = CheckResult::pass(&name, format!("{} of {} directories exist", existing.len(), paths.len()));
            for path in existing {
                result = result.detail(path.display().to_string());
            }
            result
        };
        results.push(result);
    }
}

fn probe_driver(driver: &DriverManifest) -> Result<(), String> {
    if !driver.library_path.exists() && driver.library_path.components().count() > 1 {
        return Err(format!("library not found: {}", driver.library_path.display()));
    }
    let library = unsafe { libloading::Library::new(&driver.library_path) }.map_err(|e| e.to_string())?;
    unsafe { library.get::<unsafe extern "system" fn()>(DRIVER_ENTRY_SYMBOL) }
        .map(|_| ())
        .map_err(|_| "library does not export vk_icdGetInstanceProcAddr".to_string())
}

fn check_drivers(scope: &Scope, settings: &SettingsSnapshot, results: &mut Vec<CheckResult>) {
    let discovered = match scope.catalog().drivers(settings) {
        Ok(drivers) => drivers,
        Err(e) => {
            results.push(CheckResult::fail("Drivers", format!("driver discovery failed: {}", e)));
            return;
        }
    };
    let kept = select_drivers(discovered.clone(), &settings.drivers);

    if discovered.is_empty() {
        results.push(CheckResult::fail("Drivers", "no driver manifests found"));
        return;
    }
    if kept.is_empty() {
        results.push(
            CheckResult::fail("Drivers", "every driver is excluded by the driver filters")
                .detail(format!("{} manifests discovered", discovered.len())),
        );
        return;
    }

    let mut loadable = 0usize;
    for driver in &kept {
        let name = format!("Driver {}", driver.file_name());
        match probe_driver(driver) {
            Ok(()) => {
                loadable += 1;
                results.push(
                    CheckResult::pass(&name, "library loads")
                        .detail(format!("Library: {}", driver.library_path.display())),
                );
            }
            Err(reason) => results.push(
                CheckResult::warn(&name, reason).detail(format!("Manifest: {}", driver.manifest_path.display())),
            ),
        }
    }
    if loadable == 0 {
        results.push(CheckResult::fail("Drivers", "no selected driver library could be loaded"));
    }
}

fn check_layers(scope: &Scope, settings: &SettingsSnapshot, results: &mut Vec<CheckResult>) -> Vec<Arc<LayerRecord>> {
    let layers = match scope.catalog().layers(settings) {
        Ok(layers) => layers,
        Err(e) => {
            results.push(CheckResult::fail("Layers", format!("layer discovery failed: {}", e)));
            return Vec::new();
        }
    };
    if layers.is_empty() {
        results.push(CheckResult::skip("Layers", "no layers discovered"));
        return layers;
    }

    let mut problems = Vec::new();
    for layer in &layers {
        if layer.is_meta() {
            for component in &layer.component_layers {
                if !layers.iter().any(|l| &l.name == component) {
                    problems.push(format!("{}: component {} not found", layer.name, component));
                }
            }
        } else if let Some(path) = &layer.library_path {
            if path.components().count() > 1 && !path.exists() {
                problems.push(format!("{}: library not found: {}", layer.name, path.display()));
            }
        }
    }

    let result = if problems.is_empty() {
        CheckResult::pass("Layers", format!("{} layers discovered", layers.len()))
    } else {
        let mut result = CheckResult::warn("Layers", format!("{} problems in {} layers", problems.len(), layers.len()));
        for problem in problems {
            result = result.detail(problem);
        }
        result
    };
    results.push(result);
    layers
}

fn check_forced_layers(settings: &SettingsSnapshot, layers: &[Arc<LayerRecord>], results: &mut Vec<CheckResult>) {
    let forced = &settings.layers.forced_layers;
    if forced.is_empty() {
        return;
    }
    let missing: Vec<&String> = forced
        .iter()
        .filter(|name| !layers.iter().any(|l| &&l.name == name))
        .collect();
    if missing.is_empty() {
        results.push(CheckResult::pass("Forced layers", format!("all {} forced layers found", forced.len())));
        return;
    }

    let status = if settings.layers.exit_on_missing {
        CheckStatus::Fail
    } else {
        CheckStatus::Warn
    };
    let mut result = CheckResult::new("Forced layers", status, format!("{} forced layers not found", missing.len()));
    for name in missing {
        result = result.detail(name.clone());
    }
    if settings.layers.exit_on_missing {
        result = result.detail("Instance creation will abort");
    }
    results.push(result);
}

fn check_settings_layers(settings: &SettingsSnapshot, results: &mut Vec<CheckResult>) {
    if !settings.layers.settings_active {
        return;
    }
    let missing: Vec<String> = settings
        .layers
        .settings_layers
        .iter()
        .filter(|entry| entry.control != LayerControl::UnorderedLocation && !entry.path.exists())
        .map(|entry| format!("{} ({}): {}", entry.name, entry.control.as_str(), entry.path.display()))
        .collect();
    if missing.is_empty() {
        results.push(CheckResult::pass("Settings layers", "every layer manifest named in the settings file exists"));
    } else {
        let mut result = CheckResult::warn("Settings layers", format!("{} manifests missing", missing.len()));
        for entry in missing {
            result = result.detail(entry);
        }
        results.push(result);
    }
}

// ── Output formatters ───────────────────────────────────────

fn print_results_pretty(results: &[CheckResult]) {
    println!();
    println!("vkchain Loader Verification");
    println!("===========================");
    println!();

    let mut pass_count = 0u32;
    let mut fail_count = 0u32;
    let mut warn_count = 0u32;

    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Warn => {
                warn_count += 1;
                ("[WARN]", "\x1b[33m", "\x1b[0m")
            }
            CheckStatus::Skip => ("[SKIP]", "\x1b[90m", "\x1b[0m"),
        };

        println!("  {}{}{} {} - {}", color_start, icon, color_end, result.name, result.message);
        for detail in &result.details {
            println!("         {}", detail);
        }
        println!();
    }

    println!("-------------------------------");
    println!("  {} passed, {} failed, {} warnings", pass_count, fail_count, warn_count);
    println!();
}

fn print_results_json(results: &[CheckResult]) {
    match serde_json::to_string(results) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to encode results: {}", e),
    }
}
