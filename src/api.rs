//! The binding layer: one process-wide engine handle and the relay
//! functions the control surface binding calls.
//!
//! The core itself has no singleton (`Engine` is an ordinary handle),
//! but the native binding needs exactly one, so it lives here. The audio
//! transport should grab the handle once via [`engine`] when its stream
//! starts and call `Engine::process` on its own clone, never through this
//! module's lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{Engine, EngineConfig};

static ENGINE: Mutex<Option<Arc<Engine>>> = Mutex::new(None);

/// Create the engine if it does not exist yet. Returns true when an
/// engine is available afterwards.
pub fn create() -> bool {
    create_with(EngineConfig::default())
}

pub fn create_with(config: EngineConfig) -> bool {
    let mut slot = ENGINE.lock();
    if slot.is_none() {
        *slot = Some(Arc::new(Engine::new(config)));
        log::info!(
            "engine created ({} ch, {} Hz, {} max frames)",
            config.channels,
            config.sample_rate,
            config.max_block_length
        );
    }
    true
}

/// Shut down and drop the engine.
pub fn destroy() {
    if let Some(engine) = ENGINE.lock().take() {
        engine.shutdown();
    }
}

/// The current engine handle, for the audio transport.
pub fn engine() -> Option<Arc<Engine>> {
    ENGINE.lock().clone()
}

fn with_engine<R>(what: &str, f: impl FnOnce(&Engine) -> R) -> Option<R> {
    let engine = ENGINE.lock().clone();
    match engine {
        Some(engine) => Some(f(&engine)),
        None => {
            log::error!("{what}: engine is not created yet");
            None
        }
    }
}

/// Enumerate bundles under the filesystem path.
pub fn init_plugins(search_path: &str) {
    with_engine("init_plugins", |e| e.init_plugins(search_path));
}

/// The catalog as JSON; `{}` until `init_plugins` ran.
pub fn get_plugin_info() -> String {
    with_engine("get_plugin_info", Engine::plugin_info_json).unwrap_or_else(|| "{}".to_string())
}

/// Install a plugin into a slot (1-based). Returns 0 on success, -1 on
/// any error.
pub fn add_plugin(slot: usize, uri: &str) -> i32 {
    match with_engine("add_plugin", |e| e.add(slot, uri)) {
        Some(Ok(())) => 0,
        Some(Err(e)) => {
            log::error!("add_plugin({slot}, {uri}): {e}");
            -1
        }
        None => -1,
    }
}

/// Empty a slot.
pub fn delete_plugin(slot: usize) {
    if let Some(Err(e)) = with_engine("delete_plugin", |e| e.remove(slot)) {
        log::error!("delete_plugin({slot}): {e}");
    }
}

/// Set a control value by port index.
pub fn set_value(slot: usize, port_index: u32, value: f32) {
    if let Some(Err(e)) = with_engine("set_value", |e| e.set_parameter(slot, port_index, value)) {
        log::debug!("set_value({slot}, {port_index}): {e}");
    }
}

/// Toggle the whole chain between processing and pass-through.
pub fn set_effect_on(on: bool) -> bool {
    with_engine("set_effect_on", |e| e.set_effect_on(on)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test exercises the whole lifecycle: the handle is process-wide
    // state, so splitting these into parallel tests would race.
    #[test]
    fn singleton_lifecycle() {
        destroy();
        assert!(engine().is_none());
        assert_eq!(get_plugin_info(), "{}");
        assert_eq!(add_plugin(1, "urn:x"), -1);
        assert!(!set_effect_on(true));

        assert!(create());
        assert!(create(), "create is idempotent");
        let handle = engine().expect("engine exists after create");

        // No catalog yet: adds fail cleanly, info is empty.
        assert_eq!(get_plugin_info(), "{}");
        assert_eq!(add_plugin(1, "urn:x"), -1);
        assert_eq!(add_plugin(0, "urn:x"), -1);
        delete_plugin(1);
        set_value(1, 0, 0.5);
        assert!(set_effect_on(false));
        assert!(!handle.effect_on());
        assert!(set_effect_on(true));

        destroy();
        assert!(engine().is_none());
    }
}
