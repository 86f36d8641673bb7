//! Shared plumbing for the vkchain crates: logging, environment access and
//! platform search-path rules.

pub mod env;
pub mod logging;
pub mod platform;

pub use env::{Environment, MapEnvironment, ProcessEnvironment};
pub use logging::{init_logging, DebugFlags};
