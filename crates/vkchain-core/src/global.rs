//! Process-global settings.
//!
//! One snapshot is shared by everything that runs outside an instance. It is
//! guarded by a single mutex and reference counted: each loader front end calls
//! [`init`] when it comes up and [`teardown`] when it goes away, and the
//! snapshot is dropped when the last reference is released.

use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use vkchain_common::logging;
use vkchain_common::{loader_log, DebugFlags};

use crate::config::SettingsSnapshot;

#[derive(Debug, Default)]
pub struct GlobalState {
    refcount: usize,
    settings: Option<Arc<SettingsSnapshot>>,
}

static GLOBAL: Mutex<GlobalState> = const_mutex(GlobalState {
    refcount: 0,
    settings: None,
});

/// Take a reference on the global settings.
pub fn init() {
    let mut state = GLOBAL.lock();
    state.refcount += 1;
}

/// Release a reference; the last one drops the snapshot.
pub fn teardown() {
    let mut state = GLOBAL.lock();
    state.refcount = state.refcount.saturating_sub(1);
    if state.refcount == 0 {
        state.settings = None;
        logging::set_active_flags(DebugFlags::ERROR);
    }
}

/// Number of live references.
pub fn refcount() -> usize {
    GLOBAL.lock().refcount
}

/// Replace the global snapshot and apply its log mask to `loader_log!`. The
/// new snapshot is logged only when it differs from the one it replaces.
pub fn update(snapshot: SettingsSnapshot) -> Arc<SettingsSnapshot> {
    let mut state = GLOBAL.lock();
    if let Some(existing) = &state.settings {
        if **existing == snapshot {
            return existing.clone();
        }
    }
    logging::set_active_flags(snapshot.log.flags);
    log_snapshot(&snapshot);
    let snapshot = Arc::new(snapshot);
    state.settings = Some(snapshot.clone());
    snapshot
}

/// The global snapshot, if one has been resolved.
pub fn snapshot() -> Option<Arc<SettingsSnapshot>> {
    GLOBAL.lock().settings.clone()
}

fn log_snapshot(snapshot: &SettingsSnapshot) {
    if let Some(path) = &snapshot.settings_file {
        loader_log!(DebugFlags::INFO, "loader settings file: {}", path.display());
    }
    let layers = &snapshot.layers;
    if layers.settings_active {
        for config in &layers.settings_layers {
            loader_log!(
                DebugFlags::INFO,
                "layer configuration: name={} control={} path={}",
                config.name,
                config.control.as_str(),
                config.path.display()
            );
        }
    }
    if !layers.forced_layers.is_empty() {
        loader_log!(DebugFlags::INFO, "forced layers: {:?}", layers.forced_layers);
    }
    if !layers.enable.is_empty() {
        loader_log!(DebugFlags::INFO, "layer enable filter: {} rules", layers.enable.len());
    }
    if !layers.disable.is_empty() {
        loader_log!(DebugFlags::INFO, "layer disable filter: {:?}", layers.disable);
    }
}
