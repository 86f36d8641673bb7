//! Environment variable access.
//!
//! Everything in the loader that reads the environment goes through
//! [`Environment`] so resolution can be driven from a fixed map in tests and
//! tools.

use std::collections::HashMap;

pub trait Environment: Send + Sync {
    /// Plain lookup. An empty value is reported as `Some("")`.
    fn get(&self, key: &str) -> Option<String>;

    /// Whether the process runs with elevated privileges (setuid/setgid).
    fn is_high_integrity(&self) -> bool {
        false
    }

    /// Lookup that refuses to answer under elevated privileges, so search
    /// paths cannot be redirected into a privileged process.
    fn secure_get(&self, key: &str) -> Option<String> {
        if self.is_high_integrity() {
            None
        } else {
            self.get(key)
        }
    }
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn is_high_integrity(&self) -> bool {
        is_high_integrity()
    }
}

#[cfg(unix)]
pub fn is_high_integrity() -> bool {
    // SAFETY: these calls only read process credentials.
    unsafe { libc::geteuid() != libc::getuid() || libc::getegid() != libc::getgid() }
}

#[cfg(not(unix))]
pub fn is_high_integrity() -> bool {
    false
}

/// Fixed key/value environment.
#[derive(Debug, Clone, Default)]
pub struct MapEnvironment {
    vars: HashMap<String, String>,
    elevated: bool,
}

impl MapEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        self.vars.remove(key);
    }

    /// Simulate a setuid process: `secure_get` returns nothing.
    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }
}

impl Environment for MapEnvironment {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn is_high_integrity(&self) -> bool {
        self.elevated
    }
}
