//! Dispatch tables and the first-word convention for dispatchable objects.
//!
//! Layers and drivers receive loader objects as opaque handles and locate the
//! right table by reading the handle's first pointer-sized word. Every object
//! the loader hands out is therefore a `#[repr(C)]` [`Dispatchable`] whose
//! first field is the table pointer. Objects created by drivers carry
//! [`ICD_LOADER_MAGIC`] in that word until the loader overwrites it.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use vkchain_core::{ChainLink, CoreError, EntryPoint};

/// Value a driver stores in the first word of every dispatchable object it
/// creates.
pub const ICD_LOADER_MAGIC: usize = 0x01CDC0DE;

pub const INSTANCE_MAGIC: u64 = 0x10AD_ED01_0110_ADED;
pub const TRAMPOLINE_MAGIC: u64 = 0x10AD_ED02_0210_ADED;
pub const TERMINATOR_MAGIC: u64 = 0x10AD_ED03_0310_ADED;
pub const DEVICE_MAGIC: u64 = 0x10AD_ED04_0410_ADED;

/// Upper bound on unknown entry points per instance.
pub const MAX_UNKNOWN_FUNCTIONS: usize = 250;

// ── Known commands ──────────────────────────────────────────

/// Commands dispatched through an instance (and physical-device) table.
pub const INSTANCE_COMMANDS: &[&str] = &[
    "vkDestroyInstance",
    "vkEnumeratePhysicalDevices",
    "vkEnumeratePhysicalDeviceGroups",
    "vkGetPhysicalDeviceProperties",
    "vkGetPhysicalDeviceFeatures",
    "vkGetPhysicalDeviceMemoryProperties",
    "vkGetPhysicalDeviceQueueFamilyProperties",
    "vkEnumerateDeviceExtensionProperties",
];

/// Commands dispatched through a device table.
pub const DEVICE_COMMANDS: &[&str] = &[
    "vkDestroyDevice",
    "vkGetDeviceQueue",
    "vkQueueSubmit",
    "vkQueueWaitIdle",
    "vkDeviceWaitIdle",
    "vkAllocateMemory",
    "vkFreeMemory",
    "vkCreateBuffer",
    "vkDestroyBuffer",
    "vkCreateCommandPool",
    "vkDestroyCommandPool",
    "vkAllocateCommandBuffers",
    "vkFreeCommandBuffers",
    "vkBeginCommandBuffer",
    "vkEndCommandBuffer",
    "vkCmdDispatch",
    "vkSetDebugUtilsObjectNameEXT",
];

// ── Tables ──────────────────────────────────────────────────

/// Resolved entry points for one object: a fixed slot per known command plus
/// a bounded run of unknown-function slots filled on first use.
///
/// A table can exist before its chain does, so an object's first word is
/// final before any layer sees the object. Known slots are then filled once.
pub struct DispatchTable {
    commands: &'static [&'static str],
    known: Box<[OnceLock<EntryPoint>]>,
    unknown: Box<[OnceLock<EntryPoint>]>,
}

impl DispatchTable {
    /// A table with every slot still unresolved.
    pub fn empty(commands: &'static [&'static str], unknown_capacity: usize) -> Result<Self, CoreError> {
        let mut known = Vec::new();
        known.try_reserve_exact(commands.len())?;
        known.resize_with(commands.len(), OnceLock::new);

        let mut unknown = Vec::new();
        unknown.try_reserve_exact(unknown_capacity)?;
        unknown.resize_with(unknown_capacity, OnceLock::new);

        Ok(DispatchTable {
            commands,
            known: known.into_boxed_slice(),
            unknown: unknown.into_boxed_slice(),
        })
    }

    /// Resolve every known slot once by asking `link`.
    pub fn resolve(
        commands: &'static [&'static str],
        link: &dyn ChainLink,
        unknown_capacity: usize,
    ) -> Result<Self, CoreError> {
        let table = Self::empty(commands, unknown_capacity)?;
        table.fill(link);
        Ok(table)
    }

    /// Ask `link` for every known slot not resolved yet.
    pub fn fill(&self, link: &dyn ChainLink) {
        for (slot, name) in self.known.iter().zip(self.commands) {
            slot.get_or_init(|| link.proc_addr(name));
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|command| *command == name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Entry point of a known command. `None` also for unknown names and
    /// slots not resolved yet.
    pub fn get(&self, name: &str) -> EntryPoint {
        self.index_of(name).and_then(|index| self.known[index].get().copied().flatten())
    }

    pub fn unknown_slot(&self, index: usize) -> Option<&OnceLock<EntryPoint>> {
        self.unknown.get(index)
    }

    pub fn unknown_capacity(&self) -> usize {
        self.unknown.len()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self.known.iter().filter(|slot| matches!(slot.get(), Some(Some(_)))).count();
        let assigned = self.unknown.iter().filter(|slot| slot.get().is_some()).count();
        f.debug_struct("DispatchTable")
            .field("known", &self.known.len())
            .field("resolved", &resolved)
            .field("unknown_assigned", &assigned)
            .finish()
    }
}

// ── Dispatchable objects ────────────────────────────────────

/// A loader object whose handle is its address. The table pointer must stay
/// the first field; each concrete payload type asserts that at compile time.
#[repr(C)]
pub struct Dispatchable<T> {
    pub(crate) dispatch: *const DispatchTable,
    payload: T,
}

// The table pointer targets a boxed table owned by the object graph and is
// never written after construction.
unsafe impl<T: Send> Send for Dispatchable<T> {}
unsafe impl<T: Sync> Sync for Dispatchable<T> {}

impl<T> Dispatchable<T> {
    pub fn new(dispatch: *const DispatchTable, payload: T) -> Self {
        Dispatchable { dispatch, payload }
    }

    pub fn dispatch(&self) -> *const DispatchTable {
        self.dispatch
    }
}

impl<T: fmt::Debug> fmt::Debug for Dispatchable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatchable")
            .field("dispatch", &self.dispatch)
            .field("payload", &self.payload)
            .finish()
    }
}

impl<T> Deref for Dispatchable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

/// Handle value of a shared loader object.
pub fn raw_handle<T>(object: &Arc<Dispatchable<T>>) -> u64 {
    Arc::as_ptr(object) as u64
}

/// Read the table pointer stored in the first word of `handle`.
///
/// # Safety
/// `handle` must point to a live dispatchable object.
pub unsafe fn dispatch_of(handle: u64) -> *const DispatchTable {
    unsafe { *(handle as *const *const DispatchTable) }
}

/// Store `table` in the first word of a driver-created object.
///
/// # Safety
/// `object` must point to a live dispatchable object created by a driver.
pub unsafe fn set_loader_data(object: u64, table: *const DispatchTable) -> Result<(), CoreError> {
    let word = object as *mut usize;
    if word.is_null() {
        return Err(CoreError::InvalidHandle("null driver object".to_string()));
    }
    let current = unsafe { word.read() };
    if current != ICD_LOADER_MAGIC {
        return Err(CoreError::InvalidHandle(format!(
            "driver object {:#x} does not carry the loader magic (found {:#x})",
            object, current
        )));
    }
    unsafe { word.write(table as usize) };
    Ok(())
}

// ── Driver-side objects ─────────────────────────────────────

/// Layout drivers use for dispatchable objects they return to the loader.
/// The loader writes its table pointer into `loader_data`.
#[repr(C)]
#[derive(Debug)]
pub struct DriverObject {
    pub loader_data: usize,
    /// The driver's own identifier for the object.
    pub id: u64,
}

impl DriverObject {
    /// Allocate a new object on the heap.
    pub fn new(id: u64) -> *mut Self {
        Box::into_raw(Box::new(Self {
            loader_data: ICD_LOADER_MAGIC,
            id,
        }))
    }

    /// # Safety
    /// The pointer must point to a valid `DriverObject`.
    pub unsafe fn id(ptr: *const Self) -> u64 {
        unsafe { (*ptr).id }
    }

    /// # Safety
    /// The pointer must have been created by `DriverObject::new`.
    pub unsafe fn destroy(ptr: *mut Self) {
        drop(unsafe { Box::from_raw(ptr) });
    }
}

// ── Entry point casts ───────────────────────────────────────

/// Wrap a function item as an untyped [`EntryPoint`].
#[macro_export]
macro_rules! entry_point {
    ($f:expr) => {
        Some(unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>($f as *const ()) })
    };
}

/// Reinterpret an untyped entry point as the concrete `PFN_*` type `F`.
///
/// # Safety
/// `F` must be a function pointer type matching the real signature.
pub unsafe fn cast_entry<F: Copy>(entry: EntryPoint) -> Option<F> {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<unsafe extern "system" fn()>()
    );
    entry.map(|f| unsafe { std::mem::transmute_copy::<unsafe extern "system" fn(), F>(&f) })
}
