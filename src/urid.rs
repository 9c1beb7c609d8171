//! Process-wide URI ↔ URID interning.
//!
//! Shared by every plugin instance. The mutex is only contended the first
//! time a URI is seen, which happens during instantiation; by the time the
//! audio thread runs, every URID the DSP needs is already interned.

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::Mutex;

use lv2_raw::urid::{LV2Urid, LV2UridMap, LV2UridMapHandle, LV2UridUnmap, LV2UridUnmapHandle};

pub struct UridRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    by_uri: HashMap<String, LV2Urid>,
    // Index 0 is the reserved "none" id, so the table starts with a dummy.
    by_id: Vec<CString>,
}

impl UridRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_uri: HashMap::new(),
                by_id: vec![CString::default()],
            }),
        }
    }

    /// Map a URI to its URID, allocating the next sequential id (from 1)
    /// on first sight. Returns 0 only for URIs that cannot be interned.
    pub fn map(&self, uri: &str) -> LV2Urid {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.by_uri.get(uri) {
            return id;
        }
        let Ok(cstr) = CString::new(uri) else {
            return 0;
        };
        let id = inner.by_id.len() as LV2Urid;
        inner.by_uri.insert(uri.to_string(), id);
        inner.by_id.push(cstr);
        id
    }

    /// Reverse-map a URID to its canonical URI string.
    pub fn unmap(&self, urid: LV2Urid) -> Option<String> {
        if urid == 0 {
            return None;
        }
        let inner = self.inner.lock().unwrap();
        inner
            .by_id
            .get(urid as usize)
            .and_then(|s| s.to_str().ok().map(str::to_string))
    }

    /// Build the `LV2_URID_Map` struct handed to plugins.
    ///
    /// The struct holds a raw pointer back to this registry; the caller
    /// must keep the registry alive for as long as any plugin may call it
    /// (the engine shares it via `Arc` for the process lifetime).
    pub fn as_lv2_map(&self) -> LV2UridMap {
        LV2UridMap {
            handle: self as *const UridRegistry as LV2UridMapHandle,
            map: urid_map_callback,
        }
    }

    /// Build the `LV2_URID_Unmap` counterpart.
    pub fn as_lv2_unmap(&self) -> LV2UridUnmap {
        LV2UridUnmap {
            handle: self as *const UridRegistry as LV2UridUnmapHandle,
            unmap: urid_unmap_callback,
        }
    }
}

impl Default for UridRegistry {
    fn default() -> Self {
        Self::new()
    }
}

extern "C" fn urid_map_callback(handle: LV2UridMapHandle, uri: *const c_char) -> LV2Urid {
    if handle.is_null() || uri.is_null() {
        return 0;
    }
    let registry = unsafe { &*(handle as *const UridRegistry) };
    match unsafe { CStr::from_ptr(uri) }.to_str() {
        Ok(s) => registry.map(s),
        Err(_) => 0,
    }
}

extern "C" fn urid_unmap_callback(handle: LV2UridUnmapHandle, urid: LV2Urid) -> *const c_char {
    if handle.is_null() || urid == 0 {
        return std::ptr::null();
    }
    let registry = unsafe { &*(handle as *const UridRegistry) };
    let inner = match registry.inner.lock() {
        Ok(inner) => inner,
        Err(_) => return std::ptr::null(),
    };
    // CString heap storage never moves, so the pointer stays valid even
    // when the id table grows.
    match inner.by_id.get(urid as usize) {
        Some(s) => s.as_ptr(),
        None => std::ptr::null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_stable_across_calls() {
        let reg = UridRegistry::new();
        let a = reg.map("http://example.org/a");
        assert_eq!(reg.map("http://example.org/a"), a);
        assert_eq!(reg.map("http://example.org/a"), a);
    }

    #[test]
    fn distinct_uris_get_distinct_ids() {
        let reg = UridRegistry::new();
        let a = reg.map("urn:a");
        let b = reg.map("urn:b");
        let c = reg.map("urn:c");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let reg = UridRegistry::new();
        assert_eq!(reg.map("urn:first"), 1);
        assert_eq!(reg.map("urn:second"), 2);
    }

    #[test]
    fn unmap_is_left_inverse_of_map() {
        let reg = UridRegistry::new();
        for uri in [
            "http://lv2plug.in/ns/ext/atom#Sequence",
            "urn:with:colons",
            "urn:ünïcode",
        ] {
            let id = reg.map(uri);
            assert_eq!(reg.unmap(id).as_deref(), Some(uri));
        }
    }

    #[test]
    fn zero_is_reserved() {
        let reg = UridRegistry::new();
        assert_eq!(reg.unmap(0), None);
        assert!(reg.map("urn:x") != 0);
    }

    #[test]
    fn unknown_ids_unmap_to_none() {
        let reg = UridRegistry::new();
        reg.map("urn:x");
        assert_eq!(reg.unmap(999), None);
    }

    #[test]
    fn c_callbacks_roundtrip() {
        let reg = UridRegistry::new();
        let map = reg.as_lv2_map();
        let unmap = reg.as_lv2_unmap();
        let uri = CString::new("urn:via:callback").unwrap();
        let id = unsafe { (map.map)(map.handle, uri.as_ptr()) };
        assert!(id != 0);
        let back = unsafe { (unmap.unmap)(unmap.handle, id) };
        assert!(!back.is_null());
        assert_eq!(unsafe { CStr::from_ptr(back) }.to_str().unwrap(), "urn:via:callback");
    }
}
