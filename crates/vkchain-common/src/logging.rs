use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set VKCHAIN_LOG=debug (or trace, info, warn, error) for verbosity control.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("VKCHAIN_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = subscriber_fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
}

bitflags! {
    /// Loader message categories, as selected by `VK_LOADER_DEBUG` or the
    /// settings file `stderr_log` array.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        const INFO = 0x01;
        const WARN = 0x02;
        const PERF = 0x04;
        const ERROR = 0x08;
        const DEBUG = 0x10;
        const LAYER = 0x20;
        const DRIVER = 0x40;
        const VALIDATION = 0x80;
    }
}

impl DebugFlags {
    /// Parse a `VK_LOADER_DEBUG` value: comma separated category names.
    /// Unknown tokens are ignored.
    pub fn parse_list(value: &str) -> Self {
        let mut flags = DebugFlags::empty();
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            flags |= match token {
                "all" => DebugFlags::all(),
                "warn" => DebugFlags::WARN,
                "info" => DebugFlags::INFO,
                "perf" => DebugFlags::PERF,
                "error" => DebugFlags::ERROR,
                "debug" => DebugFlags::DEBUG,
                "layer" => DebugFlags::LAYER,
                "driver" | "implem" | "icd" => DebugFlags::DRIVER,
                "validation" => DebugFlags::VALIDATION,
                _ => DebugFlags::empty(),
            };
        }
        flags
    }

    /// Parse the settings file `stderr_log` entries.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .fold(DebugFlags::empty(), |acc, name| acc | DebugFlags::parse_list(name.as_ref()))
    }

    fn category(self) -> &'static str {
        if self.contains(DebugFlags::VALIDATION) {
            "validation"
        } else if self.contains(DebugFlags::LAYER) {
            "layer"
        } else if self.contains(DebugFlags::DRIVER) {
            "driver"
        } else if self.contains(DebugFlags::PERF) {
            "perf"
        } else {
            "general"
        }
    }
}

// ── Active category mask ────────────────────────────────────

static ACTIVE_FLAGS: AtomicU32 = AtomicU32::new(DebugFlags::ERROR.bits());

/// Replace the process-wide set of enabled loader categories.
pub fn set_active_flags(flags: DebugFlags) {
    ACTIVE_FLAGS.store(flags.bits(), Ordering::Relaxed);
}

pub fn active_flags() -> DebugFlags {
    DebugFlags::from_bits_truncate(ACTIVE_FLAGS.load(Ordering::Relaxed))
}

/// A message is emitted when any of its category bits is enabled.
pub fn should_log(flags: DebugFlags) -> bool {
    active_flags().intersects(flags)
}

#[doc(hidden)]
pub fn emit(flags: DebugFlags, args: fmt::Arguments<'_>) {
    let category = flags.category();
    if flags.contains(DebugFlags::ERROR) {
        tracing::error!(target: "vkchain::loader", category, "{}", args);
    } else if flags.contains(DebugFlags::WARN) {
        tracing::warn!(target: "vkchain::loader", category, "{}", args);
    } else if flags.intersects(DebugFlags::DEBUG | DebugFlags::PERF) {
        tracing::debug!(target: "vkchain::loader", category, "{}", args);
    } else {
        tracing::info!(target: "vkchain::loader", category, "{}", args);
    }
}

/// Log a loader message under one or more [`DebugFlags`] categories.
///
/// ```ignore
/// loader_log!(DebugFlags::WARN | DebugFlags::LAYER, "layer {} ignored", name);
/// ```
#[macro_export]
macro_rules! loader_log {
    ($flags:expr, $($arg:tt)+) => {{
        let flags: $crate::logging::DebugFlags = $flags;
        if $crate::logging::should_log(flags) {
            $crate::logging::emit(flags, ::std::format_args!($($arg)+));
        }
    }};
}
