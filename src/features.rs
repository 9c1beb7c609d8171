//! The negotiated capability set handed to a plugin at instantiation.
//!
//! Every feature struct lives in a `Box` owned by the table so the
//! pointers given to the plugin stay valid for the instance lifetime.
//! Extension ABIs the binding crates do not cover (options, buf-size,
//! state paths) are declared repr(C) here, matching their headers.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use lv2_raw::core::LV2Feature;
use lv2_raw::urid::{LV2Urid, LV2UridMap, LV2UridUnmap};

use crate::urid::UridRegistry;

pub const LV2_URID_MAP_URI: &CStr = c"http://lv2plug.in/ns/ext/urid#map";
pub const LV2_URID_UNMAP_URI: &CStr = c"http://lv2plug.in/ns/ext/urid#unmap";
pub const LV2_OPTIONS_URI: &CStr = c"http://lv2plug.in/ns/ext/options#options";
pub const LV2_BOUNDED_BLOCK_LENGTH_URI: &CStr =
    c"http://lv2plug.in/ns/ext/buf-size#boundedBlockLength";
pub const LV2_POW2_BLOCK_LENGTH_URI: &CStr =
    c"http://lv2plug.in/ns/ext/buf-size#powerOf2BlockLength";
pub const LV2_FIXED_BLOCK_LENGTH_URI: &CStr =
    c"http://lv2plug.in/ns/ext/buf-size#fixedBlockLength";
pub const LV2_STATE_MAP_PATH_URI: &CStr = c"http://lv2plug.in/ns/ext/state#mapPath";
pub const LV2_STATE_MAKE_PATH_URI: &CStr = c"http://lv2plug.in/ns/ext/state#makePath";
pub const LV2_STATE_FREE_PATH_URI: &CStr = c"http://lv2plug.in/ns/ext/state#freePath";

pub const LV2_MAX_BLOCK_LENGTH: &str = "http://lv2plug.in/ns/ext/buf-size#maxBlockLength";
pub const LV2_ATOM_INT: &str = "http://lv2plug.in/ns/ext/atom#Int";

/// Features the host always provides, regardless of what a given table
/// instance negotiated. `lv2:isLive` and `lv2:inPlaceBroken` are plugin
/// traits the host tolerates rather than capabilities, the same way jalv
/// treats them.
const ALWAYS_SUPPORTED: &[&str] = &[
    "http://lv2plug.in/ns/lv2core#isLive",
    "http://lv2plug.in/ns/lv2core#inPlaceBroken",
];

const LV2_OPTIONS_INSTANCE: u32 = 0;

#[repr(C)]
struct Lv2OptionsOption {
    context: u32,
    subject: u32,
    key: LV2Urid,
    size: u32,
    type_: LV2Urid,
    value: *const c_void,
}

#[repr(C)]
struct Lv2StateMapPath {
    handle: *mut c_void,
    abstract_path: Option<extern "C" fn(*mut c_void, *const c_char) -> *mut c_char>,
    absolute_path: Option<extern "C" fn(*mut c_void, *const c_char) -> *mut c_char>,
}

#[repr(C)]
struct Lv2StateMakePath {
    handle: *mut c_void,
    path: Option<extern "C" fn(*mut c_void, *const c_char) -> *mut c_char>,
}

#[repr(C)]
struct Lv2StateFreePath {
    handle: *mut c_void,
    free_path: Option<extern "C" fn(*mut c_void, *mut c_char)>,
}

/// The feature list for one plugin instance.
pub struct FeatureTable {
    _registry: Arc<UridRegistry>,
    _map: Box<LV2UridMap>,
    _unmap: Box<LV2UridUnmap>,
    _max_block_length: Box<u32>,
    _options: Box<[Lv2OptionsOption; 2]>,
    _map_path: Box<Lv2StateMapPath>,
    _make_path: Box<Lv2StateMakePath>,
    _free_path: Box<Lv2StateFreePath>,
    features: Vec<LV2Feature>,
}

// The raw pointers inside the LV2Feature structs all target the boxed
// members above, which move with the table.
unsafe impl Send for FeatureTable {}

impl FeatureTable {
    /// Assemble the table. `schedule_feature` points at the worker's
    /// `LV2_Worker_Schedule` struct (see `worker::WorkerLink`), owned by
    /// the caller for at least as long as this table.
    pub fn new(
        registry: Arc<UridRegistry>,
        max_block_length: u32,
        schedule_feature: LV2Feature,
    ) -> Self {
        let map = Box::new(registry.as_lv2_map());
        let unmap = Box::new(registry.as_lv2_unmap());
        let max_block = Box::new(max_block_length);

        let options = Box::new([
            Lv2OptionsOption {
                context: LV2_OPTIONS_INSTANCE,
                subject: 0,
                key: registry.map(LV2_MAX_BLOCK_LENGTH),
                size: std::mem::size_of::<u32>() as u32,
                type_: registry.map(LV2_ATOM_INT),
                value: (&*max_block as *const u32).cast::<c_void>(),
            },
            Lv2OptionsOption {
                context: LV2_OPTIONS_INSTANCE,
                subject: 0,
                key: 0,
                size: 0,
                type_: 0,
                value: std::ptr::null(),
            },
        ]);

        let map_path = Box::new(Lv2StateMapPath {
            handle: std::ptr::null_mut(),
            abstract_path: Some(state_copy_path_callback),
            absolute_path: Some(state_copy_path_callback),
        });
        let make_path = Box::new(Lv2StateMakePath {
            handle: std::ptr::null_mut(),
            path: Some(state_copy_path_callback),
        });
        let free_path = Box::new(Lv2StateFreePath {
            handle: std::ptr::null_mut(),
            free_path: Some(state_free_path_callback),
        });

        let features = vec![
            LV2Feature {
                uri: LV2_URID_MAP_URI.as_ptr(),
                data: (&*map as *const LV2UridMap).cast_mut().cast::<c_void>(),
            },
            LV2Feature {
                uri: LV2_URID_UNMAP_URI.as_ptr(),
                data: (&*unmap as *const LV2UridUnmap).cast_mut().cast::<c_void>(),
            },
            LV2Feature {
                uri: LV2_OPTIONS_URI.as_ptr(),
                data: (options.as_ptr()).cast_mut().cast::<c_void>(),
            },
            LV2Feature {
                uri: LV2_BOUNDED_BLOCK_LENGTH_URI.as_ptr(),
                data: std::ptr::null_mut(),
            },
            LV2Feature {
                uri: LV2_POW2_BLOCK_LENGTH_URI.as_ptr(),
                data: std::ptr::null_mut(),
            },
            LV2Feature {
                uri: LV2_FIXED_BLOCK_LENGTH_URI.as_ptr(),
                data: std::ptr::null_mut(),
            },
            schedule_feature,
            LV2Feature {
                uri: LV2_STATE_MAP_PATH_URI.as_ptr(),
                data: (&*map_path as *const Lv2StateMapPath)
                    .cast_mut()
                    .cast::<c_void>(),
            },
            LV2Feature {
                uri: LV2_STATE_MAKE_PATH_URI.as_ptr(),
                data: (&*make_path as *const Lv2StateMakePath)
                    .cast_mut()
                    .cast::<c_void>(),
            },
            LV2Feature {
                uri: LV2_STATE_FREE_PATH_URI.as_ptr(),
                data: (&*free_path as *const Lv2StateFreePath)
                    .cast_mut()
                    .cast::<c_void>(),
            },
        ];

        Self {
            _registry: registry,
            _map: map,
            _unmap: unmap,
            _max_block_length: max_block,
            _options: options,
            _map_path: map_path,
            _make_path: make_path,
            _free_path: free_path,
            features,
        }
    }

    /// Borrow the feature list in the form `Plugin::instantiate` wants.
    pub fn as_refs(&self) -> Vec<&LV2Feature> {
        self.features.iter().collect()
    }

    /// True if `uri` names a capability this table offers.
    pub fn supports(&self, uri: &str) -> bool {
        if ALWAYS_SUPPORTED.contains(&uri) {
            return true;
        }
        self.features.iter().any(|f| {
            let feature_uri = unsafe { CStr::from_ptr(f.uri) };
            feature_uri.to_str().map(|s| s == uri).unwrap_or(false)
        })
    }

    /// The features relevant to `state:interface` calls, null-terminated.
    pub fn state_feature_ptrs(&self) -> Vec<*const LV2Feature> {
        let mut ptrs: Vec<*const LV2Feature> = self
            .features
            .iter()
            .enumerate()
            // map, unmap and the three state path features
            .filter(|(i, _)| *i < 2 || *i > 6)
            .map(|(_, f)| f as *const LV2Feature)
            .collect();
        ptrs.push(std::ptr::null());
        ptrs
    }
}

/// `state:mapPath` / `state:makePath`: identity mapping that returns a
/// copy of the argument, to be replaced when persistent asset storage
/// lands.
extern "C" fn state_copy_path_callback(_handle: *mut c_void, path: *const c_char) -> *mut c_char {
    if path.is_null() {
        return std::ptr::null_mut();
    }
    let copy = unsafe { CStr::from_ptr(path) }.to_owned();
    copy.into_raw()
}

extern "C" fn state_free_path_callback(_handle: *mut c_void, path: *mut c_char) {
    if path.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerLink;

    fn table() -> (FeatureTable, WorkerLink) {
        let registry = Arc::new(UridRegistry::new());
        let link = WorkerLink::new();
        let table = FeatureTable::new(registry, 4096, link.schedule_feature());
        (table, link)
    }

    #[test]
    fn advertises_negotiated_capabilities() {
        let (table, _link) = table();
        for uri in [
            "http://lv2plug.in/ns/ext/urid#map",
            "http://lv2plug.in/ns/ext/urid#unmap",
            "http://lv2plug.in/ns/ext/options#options",
            "http://lv2plug.in/ns/ext/buf-size#boundedBlockLength",
            "http://lv2plug.in/ns/ext/worker#schedule",
            "http://lv2plug.in/ns/ext/state#makePath",
        ] {
            assert!(table.supports(uri), "missing {uri}");
        }
        assert!(!table.supports("http://example.org/unheard-of"));
    }

    #[test]
    fn plugin_traits_are_tolerated() {
        let (table, _link) = table();
        assert!(table.supports("http://lv2plug.in/ns/lv2core#isLive"));
        assert!(table.supports("http://lv2plug.in/ns/lv2core#inPlaceBroken"));
    }

    #[test]
    fn path_callbacks_copy_and_free() {
        let input = CString::new("/tmp/pedalgrid-state").unwrap();
        let copy = state_copy_path_callback(std::ptr::null_mut(), input.as_ptr());
        assert!(!copy.is_null());
        assert_eq!(
            unsafe { CStr::from_ptr(copy) }.to_str().unwrap(),
            "/tmp/pedalgrid-state"
        );
        state_free_path_callback(std::ptr::null_mut(), copy);
    }

    #[test]
    fn state_feature_list_is_null_terminated() {
        let (table, _link) = table();
        let ptrs = table.state_feature_ptrs();
        assert_eq!(ptrs.len(), 6);
        assert!(ptrs.last().unwrap().is_null());
        assert!(ptrs[..5].iter().all(|p| !p.is_null()));
    }
}
