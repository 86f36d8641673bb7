//! Slot assignment for entry points the loader was not built with.
//!
//! Each instance keeps one append-only name table per object level. The
//! index assigned to a name is used in every table under that instance, so
//! terminator code can reach the same slot in any driver's table.

use parking_lot::RwLock;
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::CoreError;

use crate::dispatch::MAX_UNKNOWN_FUNCTIONS;

#[derive(Debug)]
pub struct UnknownFunctionTable {
    names: RwLock<Vec<String>>,
    capacity: usize,
}

impl Default for UnknownFunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UnknownFunctionTable {
    pub fn new() -> Self {
        Self::with_capacity(MAX_UNKNOWN_FUNCTIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        UnknownFunctionTable {
            names: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.read().iter().position(|n| n == name)
    }

    /// Index for `name`, assigning the next free slot on first use.
    pub fn assign(&self, name: &str) -> Result<usize, CoreError> {
        if let Some(index) = self.index_of(name) {
            return Ok(index);
        }
        let mut names = self.names.write();
        // Another thread may have assigned it between the two locks.
        if let Some(index) = names.iter().position(|n| n == name) {
            return Ok(index);
        }
        if names.len() >= self.capacity {
            loader_log!(
                DebugFlags::ERROR,
                "no unknown function slot left for {} ({} in use)",
                name,
                names.len()
            );
            return Err(CoreError::FunctionNotSupported(name.to_string()));
        }
        names.try_reserve(1)?;
        names.push(name.to_string());
        Ok(names.len() - 1)
    }

    /// Assigned names in slot order.
    pub fn names(&self) -> Vec<String> {
        self.names.read().clone()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
