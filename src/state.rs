//! Plugin state save/restore.
//!
//! Captures every input control value by symbol plus whatever the plugin
//! stores through `state:interface`, and writes the snapshot as a JSON
//! document at a host-supplied path. Restore is symbol-keyed and ignores
//! symbols the plugin no longer has.
//!
//! Call only while the chain is paused, or between process() calls for
//! plugins that advertise `state:threadSafeRestore`.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

use lv2_raw::core::LV2Feature;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::instance::PluginInstance;

pub const LV2_STATE_INTERFACE_URI: &str = "http://lv2plug.in/ns/ext/state#interface";

type Lv2StateHandle = *mut c_void;
type Lv2StateStatus = u32;
const LV2_STATE_SUCCESS: Lv2StateStatus = 0;
const LV2_STATE_ERR_NO_PROPERTY: Lv2StateStatus = 5;

type Lv2StateStoreFn = Option<
    unsafe extern "C" fn(
        handle: Lv2StateHandle,
        key: u32,
        value: *const c_void,
        size: usize,
        type_: u32,
        flags: u32,
    ) -> Lv2StateStatus,
>;
type Lv2StateRetrieveFn = Option<
    unsafe extern "C" fn(
        handle: Lv2StateHandle,
        key: u32,
        size: *mut usize,
        type_: *mut u32,
        flags: *mut u32,
    ) -> *const c_void,
>;

/// `LV2_State_Interface` from lv2/state/state.h.
#[repr(C)]
pub(crate) struct Lv2StateInterface {
    save: Option<
        unsafe extern "C" fn(
            instance: *mut c_void,
            store: Lv2StateStoreFn,
            handle: Lv2StateHandle,
            flags: u32,
            features: *const *const LV2Feature,
        ) -> Lv2StateStatus,
    >,
    restore: Option<
        unsafe extern "C" fn(
            instance: *mut c_void,
            retrieve: Lv2StateRetrieveFn,
            handle: Lv2StateHandle,
            flags: u32,
            features: *const *const LV2Feature,
        ) -> Lv2StateStatus,
    >,
}

/// The on-disk snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginState {
    pub plugin_uri: String,
    pub port_values: Vec<StatePortValue>,
    #[serde(default)]
    pub properties: Vec<StateProperty>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePortValue {
    pub symbol: String,
    pub value: f32,
}

/// One plugin-defined property, keyed by URI so the snapshot survives a
/// process restart with a different URID numbering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateProperty {
    pub key_uri: String,
    pub type_uri: String,
    pub flags: u32,
    pub value: Vec<u8>,
}

#[derive(Debug)]
struct RawProperty {
    key: u32,
    type_: u32,
    flags: u32,
    value: Vec<u8>,
}

struct SaveContext {
    properties: Vec<RawProperty>,
}

struct RestoreContext {
    properties: Vec<RawProperty>,
    by_key: HashMap<u32, usize>,
}

extern "C" fn state_store_callback(
    handle: Lv2StateHandle,
    key: u32,
    value: *const c_void,
    size: usize,
    type_: u32,
    flags: u32,
) -> Lv2StateStatus {
    if handle.is_null() || value.is_null() || size == 0 {
        return LV2_STATE_ERR_NO_PROPERTY;
    }
    let ctx = unsafe { &mut *(handle as *mut SaveContext) };
    let bytes = unsafe { std::slice::from_raw_parts(value.cast::<u8>(), size) };
    ctx.properties.push(RawProperty {
        key,
        type_,
        flags,
        value: bytes.to_vec(),
    });
    LV2_STATE_SUCCESS
}

extern "C" fn state_retrieve_callback(
    handle: Lv2StateHandle,
    key: u32,
    size: *mut usize,
    type_: *mut u32,
    flags: *mut u32,
) -> *const c_void {
    if handle.is_null() {
        return std::ptr::null();
    }
    let ctx = unsafe { &*(handle as *const RestoreContext) };
    let Some(prop) = ctx.by_key.get(&key).and_then(|&i| ctx.properties.get(i)) else {
        return std::ptr::null();
    };
    unsafe {
        if !size.is_null() {
            *size = prop.value.len();
        }
        if !type_.is_null() {
            *type_ = prop.type_;
        }
        if !flags.is_null() {
            *flags = prop.flags;
        }
    }
    prop.value.as_ptr().cast::<c_void>()
}

/// Capture the instance's current state in memory.
pub fn snapshot(instance: &PluginInstance) -> PluginState {
    let port_values = instance
        .control_inputs()
        .map(|(symbol, value)| StatePortValue {
            symbol: symbol.to_string(),
            value,
        })
        .collect();

    let mut state = PluginState {
        plugin_uri: instance.uri().to_string(),
        port_values,
        properties: Vec::new(),
    };

    let Some(iface) = instance.extension_data::<Lv2StateInterface>(LV2_STATE_INTERFACE_URI)
    else {
        return state;
    };
    let Some(save_fn) = (unsafe { iface.as_ref() }).save else {
        return state;
    };

    let mut ctx = SaveContext {
        properties: Vec::new(),
    };
    let features = instance.features().state_feature_ptrs();
    let status = unsafe {
        save_fn(
            instance.instance_handle(),
            Some(state_store_callback),
            (&mut ctx as *mut SaveContext).cast::<c_void>(),
            0,
            features.as_ptr(),
        )
    };
    if status != LV2_STATE_SUCCESS {
        log::warn!("'{}' state save returned status {status}", instance.uri());
        return state;
    }

    let registry = instance.registry();
    state.properties = ctx
        .properties
        .into_iter()
        .filter_map(|p| {
            let key_uri = registry.unmap(p.key)?;
            let type_uri = registry.unmap(p.type_)?;
            Some(StateProperty {
                key_uri,
                type_uri,
                flags: p.flags,
                value: p.value,
            })
        })
        .collect();
    state
}

/// Apply an in-memory snapshot: control values by symbol (unknown symbols
/// ignored), then plugin-defined properties through `state:interface`.
pub fn apply(instance: &mut PluginInstance, state: &PluginState) -> Result<()> {
    for port in &state.port_values {
        // Symbols the plugin no longer has are skipped on purpose.
        let _ = instance.set_control(&port.symbol, port.value);
    }
    if state.properties.is_empty() {
        return Ok(());
    }

    let Some(iface) = instance.extension_data::<Lv2StateInterface>(LV2_STATE_INTERFACE_URI)
    else {
        return Ok(());
    };
    let Some(restore_fn) = (unsafe { iface.as_ref() }).restore else {
        return Ok(());
    };

    let registry = instance.registry();
    let mut properties = Vec::new();
    let mut by_key = HashMap::new();
    for prop in &state.properties {
        let key = registry.map(&prop.key_uri);
        let type_ = registry.map(&prop.type_uri);
        if key == 0 || type_ == 0 {
            continue;
        }
        by_key.insert(key, properties.len());
        properties.push(RawProperty {
            key,
            type_,
            flags: prop.flags,
            value: prop.value.clone(),
        });
    }
    let ctx = RestoreContext { properties, by_key };
    let features = instance.features().state_feature_ptrs();

    let status = unsafe {
        restore_fn(
            instance.instance_handle(),
            Some(state_retrieve_callback),
            (&ctx as *const RestoreContext).cast_mut().cast::<c_void>(),
            0,
            features.as_ptr(),
        )
    };
    if status == LV2_STATE_SUCCESS {
        Ok(())
    } else {
        Err(HostError::StateIo(format!(
            "'{}' state restore returned status {status}",
            instance.uri()
        )))
    }
}

/// Serialize the instance's state to `path`.
pub fn save(instance: &PluginInstance, path: &Path) -> Result<()> {
    let state = snapshot(instance);
    let text = serde_json::to_string_pretty(&state)
        .map_err(|e| HostError::StateIo(e.to_string()))?;
    std::fs::write(path, text).map_err(|e| HostError::StateIo(e.to_string()))?;
    log::info!(
        "saved state of '{}' to {} ({} ports, {} properties)",
        instance.uri(),
        path.display(),
        state.port_values.len(),
        state.properties.len()
    );
    Ok(())
}

/// Restore the instance's state from `path`. The plugin keeps its prior
/// state when the file cannot be read or belongs to another plugin.
pub fn load(instance: &mut PluginInstance, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path).map_err(|e| HostError::StateIo(e.to_string()))?;
    let state: PluginState =
        serde_json::from_str(&text).map_err(|e| HostError::StateIo(e.to_string()))?;
    if state.plugin_uri != instance.uri() {
        return Err(HostError::StateIo(format!(
            "state file is for '{}', not '{}'",
            state.plugin_uri,
            instance.uri()
        )));
    }
    apply(instance, &state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PluginState {
        PluginState {
            plugin_uri: "http://example.org/gain".to_string(),
            port_values: vec![
                StatePortValue {
                    symbol: "gain_db".to_string(),
                    value: -6.02,
                },
                StatePortValue {
                    symbol: "bypass".to_string(),
                    value: 1.0,
                },
            ],
            properties: vec![StateProperty {
                key_uri: "http://example.org/gain#ir".to_string(),
                type_uri: "http://lv2plug.in/ns/ext/atom#Path".to_string(),
                flags: 0,
                value: b"/tmp/ir.wav".to_vec(),
            }],
        }
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let state = sample_state();
        let text = serde_json::to_string(&state).unwrap();
        let back: PluginState = serde_json::from_str(&text).unwrap();
        assert_eq!(back.plugin_uri, state.plugin_uri);
        assert_eq!(back.port_values.len(), 2);
        assert_eq!(back.port_values[0].symbol, "gain_db");
        assert_eq!(back.port_values[0].value, -6.02);
        assert_eq!(back.properties[0].value, b"/tmp/ir.wav");
    }

    #[test]
    fn properties_default_to_empty_for_old_files() {
        let text = r#"{
            "plugin_uri": "urn:p",
            "port_values": [{"symbol": "x", "value": 0.25}]
        }"#;
        let state: PluginState = serde_json::from_str(text).unwrap();
        assert!(state.properties.is_empty());
        assert_eq!(state.port_values[0].value, 0.25);
    }

    #[test]
    fn retrieve_callback_answers_only_known_keys() {
        let ctx = RestoreContext {
            properties: vec![RawProperty {
                key: 3,
                type_: 9,
                flags: 1,
                value: vec![5, 6, 7],
            }],
            by_key: HashMap::from([(3, 0)]),
        };
        let mut size = 0usize;
        let mut type_ = 0u32;
        let mut flags = 0u32;
        let handle = (&ctx as *const RestoreContext).cast_mut().cast::<c_void>();

        let ptr = state_retrieve_callback(handle, 3, &mut size, &mut type_, &mut flags);
        assert!(!ptr.is_null());
        assert_eq!((size, type_, flags), (3, 9, 1));

        let miss = state_retrieve_callback(handle, 4, &mut size, &mut type_, &mut flags);
        assert!(miss.is_null());
    }

    #[test]
    fn store_callback_rejects_empty_values() {
        let mut ctx = SaveContext {
            properties: Vec::new(),
        };
        let handle = (&mut ctx as *mut SaveContext).cast::<c_void>();
        let payload = [1u8, 2, 3];
        assert_eq!(
            state_store_callback(handle, 1, payload.as_ptr().cast(), 3, 2, 0),
            LV2_STATE_SUCCESS
        );
        assert_eq!(
            state_store_callback(handle, 1, std::ptr::null(), 0, 2, 0),
            LV2_STATE_ERR_NO_PROPERTY
        );
        assert_eq!(ctx.properties.len(), 1);
        assert_eq!(ctx.properties[0].value, vec![1, 2, 3]);
    }
}
