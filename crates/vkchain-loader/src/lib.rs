//! vkchain loader
//!
//! Builds instance and device dispatch chains from the layers the resolver
//! selects, wraps physical devices for the application and the layers, and
//! exports the C entry points applications link against.

pub mod chain;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod exports;
pub mod handle_store;
pub mod instance;
pub mod library;
pub mod link_info;
pub mod physical_device;
pub mod pre_instance;
pub mod terminator;
pub mod unknown_ext;

pub use device::{create_device, destroy_device, get_device_proc_addr, DeviceCreateInfo, DeviceRecord};
pub use dispatch::{DispatchTable, Dispatchable, DriverObject, ICD_LOADER_MAGIC, MAX_UNKNOWN_FUNCTIONS};
pub use error::LoaderError;
pub use instance::{
    destroy_instance, get_instance_proc_addr, IcdRecord, InstanceCreateInfo, InstanceRecord, Loader, LoaderBuilder,
};
pub use library::{
    Driver, DriverDeviceInfo, DriverInstanceInfo, HostAllocator, LibraryOpener, NativeLibraries, QueueRequest,
    StaticLibraries,
};
pub use physical_device::{
    enumerate_device_extensions, enumerate_physical_device_groups, enumerate_physical_devices,
    physical_device_features, physical_device_function, physical_device_memory_properties,
    physical_device_properties, queue_family_properties, PhysicalDeviceFunction,
};
