//! Chains for the global queries that run before any instance exists.
//!
//! Implicit layers may override `vkEnumerateInstanceExtensionProperties`,
//! `vkEnumerateInstanceLayerProperties` and `vkEnumerateInstanceVersion`.
//! Each overriding layer is called with the node below it and calls down
//! through [`ExtensionPropertiesChain::call_down`] (or its siblings). The
//! loader's own answer sits in the tail node.

use std::ffi::{c_char, CString};
use std::mem;
use std::ptr;
use std::sync::Arc;

use ash::vk;
use vkchain_common::{loader_log, DebugFlags};
use vkchain_core::{CoreError, EntryPoint, Interposer};

use crate::dispatch::cast_entry;
use crate::error::LoaderError;
use crate::terminator::fill_array;

pub const ENUMERATE_INSTANCE_EXTENSION_PROPERTIES: &str = "vkEnumerateInstanceExtensionProperties";
pub const ENUMERATE_INSTANCE_LAYER_PROPERTIES: &str = "vkEnumerateInstanceLayerProperties";
pub const ENUMERATE_INSTANCE_VERSION: &str = "vkEnumerateInstanceVersion";

pub const CHAIN_TYPE_ENUMERATE_INSTANCE_EXTENSION_PROPERTIES: i32 = 1;
pub const CHAIN_TYPE_ENUMERATE_INSTANCE_LAYER_PROPERTIES: i32 = 2;
pub const CHAIN_TYPE_ENUMERATE_INSTANCE_VERSION: i32 = 3;
pub const CURRENT_CHAIN_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChainHeader {
    pub chain_type: i32,
    pub version: u32,
    pub size: u32,
}

impl ChainHeader {
    fn new<C>(chain_type: i32) -> Self {
        ChainHeader {
            chain_type,
            version: CURRENT_CHAIN_VERSION,
            size: mem::size_of::<C>() as u32,
        }
    }
}

pub type NextExtensionProperties = unsafe extern "system" fn(
    *const ExtensionPropertiesChain,
    *const c_char,
    *mut u32,
    *mut vk::ExtensionProperties,
) -> vk::Result;
pub type NextLayerProperties =
    unsafe extern "system" fn(*const LayerPropertiesChain, *mut u32, *mut vk::LayerProperties) -> vk::Result;
pub type NextVersion = unsafe extern "system" fn(*const VersionChain, *mut u32) -> vk::Result;

#[repr(C)]
pub struct ExtensionPropertiesChain {
    pub header: ChainHeader,
    pub next_layer: NextExtensionProperties,
    pub next_link: *const ExtensionPropertiesChain,
}

impl ExtensionPropertiesChain {
    /// # Safety
    /// `self` must be a node the loader passed in; the pointers follow the
    /// usual count-then-fill rules.
    pub unsafe fn call_down(
        &self,
        p_layer_name: *const c_char,
        p_count: *mut u32,
        p_props: *mut vk::ExtensionProperties,
    ) -> vk::Result {
        unsafe { (self.next_layer)(self.next_link, p_layer_name, p_count, p_props) }
    }
}

#[repr(C)]
pub struct LayerPropertiesChain {
    pub header: ChainHeader,
    pub next_layer: NextLayerProperties,
    pub next_link: *const LayerPropertiesChain,
}

impl LayerPropertiesChain {
    /// # Safety
    /// As for [`ExtensionPropertiesChain::call_down`].
    pub unsafe fn call_down(&self, p_count: *mut u32, p_props: *mut vk::LayerProperties) -> vk::Result {
        unsafe { (self.next_layer)(self.next_link, p_count, p_props) }
    }
}

#[repr(C)]
pub struct VersionChain {
    pub header: ChainHeader,
    pub next_layer: NextVersion,
    pub next_link: *const VersionChain,
}

impl VersionChain {
    /// # Safety
    /// `self` must be a node the loader passed in.
    pub unsafe fn call_down(&self, p_version: *mut u32) -> vk::Result {
        unsafe { (self.next_layer)(self.next_link, p_version) }
    }
}

// ── Interceptors ────────────────────────────────────────────

/// One layer's override of a global query. Holds the layer library open for
/// the duration of the call.
pub struct Interceptor {
    pub layer: String,
    entry: EntryPoint,
    _library: Arc<dyn Interposer>,
}

impl Interceptor {
    pub fn new(layer: &str, entry: EntryPoint, library: Arc<dyn Interposer>) -> Self {
        Interceptor {
            layer: layer.to_string(),
            entry,
            _library: library,
        }
    }
}

/// A node type of one of the three chains.
trait ChainNode: Sized {
    const CHAIN_TYPE: i32;
    type Next: Copy;

    fn node(next_layer: Self::Next, next_link: *const Self) -> Self;
}

impl ChainNode for ExtensionPropertiesChain {
    const CHAIN_TYPE: i32 = CHAIN_TYPE_ENUMERATE_INSTANCE_EXTENSION_PROPERTIES;
    type Next = NextExtensionProperties;

    fn node(next_layer: Self::Next, next_link: *const Self) -> Self {
        ExtensionPropertiesChain {
            header: ChainHeader::new::<Self>(Self::CHAIN_TYPE),
            next_layer,
            next_link,
        }
    }
}

impl ChainNode for LayerPropertiesChain {
    const CHAIN_TYPE: i32 = CHAIN_TYPE_ENUMERATE_INSTANCE_LAYER_PROPERTIES;
    type Next = NextLayerProperties;

    fn node(next_layer: Self::Next, next_link: *const Self) -> Self {
        LayerPropertiesChain {
            header: ChainHeader::new::<Self>(Self::CHAIN_TYPE),
            next_layer,
            next_link,
        }
    }
}

impl ChainNode for VersionChain {
    const CHAIN_TYPE: i32 = CHAIN_TYPE_ENUMERATE_INSTANCE_VERSION;
    type Next = NextVersion;

    fn node(next_layer: Self::Next, next_link: *const Self) -> Self {
        VersionChain {
            header: ChainHeader::new::<Self>(Self::CHAIN_TYPE),
            next_layer,
            next_link,
        }
    }
}

/// The tail node and the loader's answer behind it. The tail links to
/// itself, so the terminator is handed the tail.
#[repr(C)]
struct Tail<C, T> {
    link: C,
    answer: T,
}

struct LinkedQuery<C, T> {
    tail: Box<Tail<C, T>>,
    nodes: Vec<Box<C>>,
}

impl<C: ChainNode, T> LinkedQuery<C, T> {
    /// Interceptors are listed in search order; the last one is called first.
    fn new(terminator: C::Next, answer: T, interceptors: &[Interceptor]) -> Self {
        let mut tail = Box::new(Tail {
            link: C::node(terminator, ptr::null()),
            answer,
        });
        let tail_ptr: *mut C = ptr::addr_of_mut!(tail.link);
        unsafe { *tail_ptr = C::node(terminator, tail_ptr) };

        let mut nodes: Vec<Box<C>> = Vec::with_capacity(interceptors.len());
        let mut below: *const C = tail_ptr;
        for interceptor in interceptors {
            let Some(next_layer) = (unsafe { cast_entry::<C::Next>(interceptor.entry) }) else {
                continue;
            };
            loader_log!(
                DebugFlags::DEBUG | DebugFlags::LAYER,
                "layer {} overrides pre-instance chain {}",
                interceptor.layer,
                C::CHAIN_TYPE
            );
            let node = Box::new(C::node(next_layer, below));
            below = &*node;
            nodes.push(node);
        }
        LinkedQuery { tail, nodes }
    }

    /// The node the first call goes through.
    fn head(&self) -> &C {
        match self.nodes.last() {
            Some(node) => &**node,
            None => &self.tail.link,
        }
    }
}

fn call_failed(call: &'static str, result: vk::Result) -> LoaderError {
    loader_log!(DebugFlags::ERROR | DebugFlags::LAYER, "{} through implicit layers returned {:?}", call, result);
    LoaderError::vulkan(call, result)
}

// ── Terminators ─────────────────────────────────────────────

type ExtensionAnswer = Result<Vec<vk::ExtensionProperties>, vk::Result>;

unsafe extern "system" fn extension_tail(
    chain: *const ExtensionPropertiesChain,
    _p_layer_name: *const c_char,
    p_count: *mut u32,
    p_props: *mut vk::ExtensionProperties,
) -> vk::Result {
    if chain.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let tail = unsafe { &*(chain as *const Tail<ExtensionPropertiesChain, ExtensionAnswer>) };
    match &tail.answer {
        Ok(props) => unsafe { fill_array(props, p_count, p_props) },
        Err(result) => *result,
    }
}

unsafe extern "system" fn layer_tail(
    chain: *const LayerPropertiesChain,
    p_count: *mut u32,
    p_props: *mut vk::LayerProperties,
) -> vk::Result {
    if chain.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let tail = unsafe { &*(chain as *const Tail<LayerPropertiesChain, Vec<vk::LayerProperties>>) };
    unsafe { fill_array(&tail.answer, p_count, p_props) }
}

unsafe extern "system" fn version_tail(chain: *const VersionChain, p_version: *mut u32) -> vk::Result {
    if chain.is_null() || p_version.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let tail = unsafe { &*(chain as *const Tail<VersionChain, u32>) };
    unsafe { *p_version = tail.answer };
    vk::Result::SUCCESS
}

// ── Queries ─────────────────────────────────────────────────

/// Run `vkEnumerateInstanceExtensionProperties` through `interceptors`, with
/// `answer` as the loader's own result.
pub fn instance_extension_properties(
    interceptors: &[Interceptor],
    layer_name: Option<&str>,
    answer: ExtensionAnswer,
) -> Result<Vec<vk::ExtensionProperties>, LoaderError> {
    let layer_name = layer_name
        .map(|name| CString::new(name).map_err(|_| CoreError::LayerNotPresent(name.to_string())))
        .transpose()?;
    let p_layer_name = layer_name.as_ref().map_or(ptr::null(), |name| name.as_ptr());
    let query = LinkedQuery::<ExtensionPropertiesChain, _>::new(extension_tail, answer, interceptors);
    let head = query.head();

    let mut count = 0u32;
    let result = unsafe { head.call_down(p_layer_name, &mut count, ptr::null_mut()) };
    if result != vk::Result::SUCCESS {
        return Err(call_failed(ENUMERATE_INSTANCE_EXTENSION_PROPERTIES, result));
    }
    let mut props = vec![vk::ExtensionProperties::default(); count as usize];
    let result = unsafe { head.call_down(p_layer_name, &mut count, props.as_mut_ptr()) };
    if result != vk::Result::SUCCESS && result != vk::Result::INCOMPLETE {
        return Err(call_failed(ENUMERATE_INSTANCE_EXTENSION_PROPERTIES, result));
    }
    props.truncate(count as usize);
    Ok(props)
}

pub fn instance_layer_properties(
    interceptors: &[Interceptor],
    answer: Vec<vk::LayerProperties>,
) -> Result<Vec<vk::LayerProperties>, LoaderError> {
    let query = LinkedQuery::<LayerPropertiesChain, _>::new(layer_tail, answer, interceptors);
    let head = query.head();

    let mut count = 0u32;
    let result = unsafe { head.call_down(&mut count, ptr::null_mut()) };
    if result != vk::Result::SUCCESS {
        return Err(call_failed(ENUMERATE_INSTANCE_LAYER_PROPERTIES, result));
    }
    let mut props = vec![vk::LayerProperties::default(); count as usize];
    let result = unsafe { head.call_down(&mut count, props.as_mut_ptr()) };
    if result != vk::Result::SUCCESS && result != vk::Result::INCOMPLETE {
        return Err(call_failed(ENUMERATE_INSTANCE_LAYER_PROPERTIES, result));
    }
    props.truncate(count as usize);
    Ok(props)
}

pub fn instance_version(interceptors: &[Interceptor], answer: u32) -> Result<u32, LoaderError> {
    let query = LinkedQuery::<VersionChain, _>::new(version_tail, answer, interceptors);
    let mut version = 0u32;
    let result = unsafe { query.head().call_down(&mut version) };
    if result != vk::Result::SUCCESS {
        return Err(call_failed(ENUMERATE_INSTANCE_VERSION, result));
    }
    Ok(version)
}
