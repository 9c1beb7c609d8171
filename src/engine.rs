//! The chain engine: four fixed slots of plugin instances between the
//! audio transport and the control surface.
//!
//! Slot handoff uses one atomic pointer per slot: the audio thread loads
//! it once per process call with acquire ordering, the control thread
//! installs replacements with a release store. The swapped-out `Arc` keeps
//! the old instance alive through any cycle that already loaded it, which
//! is the entire reclamation grace period.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::catalog::Catalog;
use crate::error::{HostError, Result};
use crate::instance::PluginInstance;
use crate::state;
use crate::urid::UridRegistry;

/// Fixed number of chain slots.
pub const CHAIN_SLOTS: usize = 4;

pub const DEFAULT_SAMPLE_RATE: f64 = 48000.0;
pub const DEFAULT_MAX_BLOCK_LENGTH: u32 = 4096;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub sample_rate: f64,
    /// Interleaved channel count of the transport, 1 or 2.
    pub channels: usize,
    pub max_block_length: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            max_block_length: DEFAULT_MAX_BLOCK_LENGTH,
        }
    }
}

/// What the audio transport should do after a process call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Continue,
    Stop,
}

/// Counters the control surface may poll; all writes happen RT-safely.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlotStatus {
    pub worker_no_space: u32,
    pub event_overruns: u32,
}

struct ProcessScratch {
    a: Vec<f32>,
    b: Vec<f32>,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<UridRegistry>,
    catalog: Mutex<Option<Catalog>>,
    slots: [ArcSwapOption<Mutex<PluginInstance>>; CHAIN_SLOTS],
    scratch: Mutex<ProcessScratch>,
    effects_on: AtomicBool,
    shutdown: AtomicBool,
    /// Process calls that found a slot momentarily contended mid-swap.
    slot_skips: AtomicU32,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let samples = config.max_block_length as usize * config.channels.clamp(1, 2);
        Self {
            config: EngineConfig {
                channels: config.channels.clamp(1, 2),
                ..config
            },
            registry: Arc::new(UridRegistry::new()),
            catalog: Mutex::new(None),
            slots: Default::default(),
            scratch: Mutex::new(ProcessScratch {
                a: vec![0.0; samples],
                b: vec![0.0; samples],
            }),
            effects_on: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            slot_skips: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Scan the LV2 bundles under `search_path` and build the catalog.
    pub fn init_plugins(&self, search_path: &str) {
        let catalog = Catalog::new(search_path);
        *self.catalog.lock() = Some(catalog);
    }

    /// Catalog JSON for the control surface; `{}` before `init_plugins`.
    pub fn plugin_info_json(&self) -> String {
        self.catalog
            .lock()
            .as_ref()
            .map(|c| c.to_json())
            .unwrap_or_else(|| "{}".to_string())
    }

    /// URIs of every discovered plugin.
    pub fn plugin_uris(&self) -> Vec<String> {
        self.catalog
            .lock()
            .as_ref()
            .map(|c| c.entries().keys().cloned().collect())
            .unwrap_or_default()
    }

    fn slot_index(&self, slot: usize) -> Result<usize> {
        if (1..=CHAIN_SLOTS).contains(&slot) {
            Ok(slot - 1)
        } else {
            Err(HostError::InvalidArgument("slot out of range"))
        }
    }

    /// Install `uri` into `slot` (1-based). A previous occupant is closed
    /// first; the new instance arrives initialized and active.
    pub fn add(&self, slot: usize, uri: &str) -> Result<()> {
        let index = self.slot_index(slot)?;

        if let Some(old) = self.slots[index].swap(None) {
            old.lock().close();
        }

        let catalog_guard = self.catalog.lock();
        let catalog = catalog_guard
            .as_ref()
            .ok_or_else(|| HostError::UnknownPlugin(uri.to_string()))?;
        let instance = PluginInstance::initialize(
            catalog,
            Arc::clone(&self.registry),
            uri,
            self.config.sample_rate,
            self.config.max_block_length,
            self.config.channels,
        )?;
        drop(catalog_guard);

        log::info!("slot {slot}: '{}'", instance.name());
        self.slots[index].store(Some(Arc::new(Mutex::new(instance))));
        Ok(())
    }

    /// Empty `slot`, closing its instance off the audio thread.
    pub fn remove(&self, slot: usize) -> Result<()> {
        let index = self.slot_index(slot)?;
        if let Some(old) = self.slots[index].swap(None) {
            // Any in-flight process call still holds its own Arc; locking
            // here waits at most one audio quantum.
            old.lock().close();
            log::info!("slot {slot}: removed");
        }
        Ok(())
    }

    /// Clamp and set a control by port index.
    pub fn set_parameter(&self, slot: usize, port_index: u32, value: f32) -> Result<()> {
        let index = self.slot_index(slot)?;
        let guard = self.slots[index].load();
        let cell = guard
            .as_ref()
            .ok_or(HostError::InvalidArgument("slot is empty"))?;
        cell.lock().set_control_by_index(port_index, value)
    }

    /// Clamp and set a control by port symbol.
    pub fn set_control(&self, slot: usize, symbol: &str, value: f32) -> Result<()> {
        let index = self.slot_index(slot)?;
        let guard = self.slots[index].load();
        let cell = guard
            .as_ref()
            .ok_or(HostError::InvalidArgument("slot is empty"))?;
        cell.lock().set_control(symbol, value)
    }

    /// Read back a control port's current value.
    pub fn control_value(&self, slot: usize, symbol: &str) -> Option<f32> {
        let guard = self.slots[self.slot_index(slot).ok()?].load();
        guard.as_ref().and_then(|cell| cell.lock().control_value(symbol))
    }

    /// Stage an atom message for the slot's plugin.
    pub fn set_atom_message(
        &self,
        slot: usize,
        symbol: &str,
        type_: u32,
        data: &[u8],
    ) -> Result<()> {
        let index = self.slot_index(slot)?;
        let guard = self.slots[index].load();
        let cell = guard
            .as_ref()
            .ok_or(HostError::InvalidArgument("slot is empty"))?;
        cell.lock().set_atom_message(symbol, type_, data)
    }

    /// Pop one DSP→UI event from the slot's plugin.
    pub fn read_events(&self, slot: usize, symbol: &str, out: &mut [u8]) -> usize {
        let Ok(index) = self.slot_index(slot) else {
            return 0;
        };
        let guard = self.slots[index].load();
        guard
            .as_ref()
            .map(|cell| cell.lock().read_events(symbol, out))
            .unwrap_or(0)
    }

    /// Serialize the slot's plugin state to `path`. Call while the chain
    /// is paused.
    pub fn save_state(&self, slot: usize, path: &std::path::Path) -> Result<()> {
        let index = self.slot_index(slot)?;
        let guard = self.slots[index].load();
        let cell = guard
            .as_ref()
            .ok_or(HostError::InvalidArgument("slot is empty"))?;
        state::save(&cell.lock(), path)
    }

    /// Restore the slot's plugin state from `path`. Call while the chain
    /// is paused.
    pub fn load_state(&self, slot: usize, path: &std::path::Path) -> Result<()> {
        let index = self.slot_index(slot)?;
        let guard = self.slots[index].load();
        let cell = guard
            .as_ref()
            .ok_or(HostError::InvalidArgument("slot is empty"))?;
        state::load(&mut cell.lock(), path)
    }

    pub fn set_effect_on(&self, on: bool) {
        self.effects_on.store(on, Ordering::Release);
        log::info!("effects {}", if on { "on" } else { "off" });
    }

    pub fn effect_on(&self) -> bool {
        self.effects_on.load(Ordering::Acquire)
    }

    /// Overrun counters for the slot, or `None` when it is empty.
    pub fn slot_status(&self, slot: usize) -> Option<SlotStatus> {
        let guard = self.slots[self.slot_index(slot).ok()?].load();
        guard.as_ref().map(|cell| {
            let instance = cell.lock();
            SlotStatus {
                worker_no_space: instance.worker_no_space_count(),
                event_overruns: instance.event_overruns(),
            }
        })
    }

    /// Process calls that skipped a slot because it was mid-swap.
    pub fn slot_skips(&self) -> u32 {
        self.slot_skips.load(Ordering::Relaxed)
    }

    /// The audio transport callback. Walks the occupied slots in order,
    /// each instance reading the previous one's output. Empty, contended
    /// or failing slots degrade to pass-through. Never blocks, never
    /// allocates.
    pub fn process(&self, input: &[f32], output: &mut [f32], frames: usize) -> ProcessStatus {
        if self.shutdown.load(Ordering::Acquire) {
            return ProcessStatus::Stop;
        }

        let channels = self.config.channels;
        let samples = frames * channels;
        let valid = frames > 0
            && frames <= self.config.max_block_length as usize
            && input.len() >= samples
            && output.len() >= samples;
        if !valid {
            let n = input.len().min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            return ProcessStatus::Continue;
        }

        if !self.effects_on.load(Ordering::Acquire) {
            output[..samples].copy_from_slice(&input[..samples]);
            return ProcessStatus::Continue;
        }

        // The scratch lock is only ever taken here, by the single audio
        // thread; try_lock keeps the path non-blocking regardless.
        let Some(mut scratch) = self.scratch.try_lock() else {
            output[..samples].copy_from_slice(&input[..samples]);
            return ProcessStatus::Continue;
        };
        let scratch = &mut *scratch;

        scratch.a[..samples].copy_from_slice(&input[..samples]);

        for slot in &self.slots {
            let guard = slot.load();
            let Some(cell) = guard.as_ref() else {
                continue;
            };
            // A slot being swapped out right now is skipped rather than
            // waited for.
            let Some(mut instance) = cell.try_lock() else {
                self.slot_skips.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match instance.process(&scratch.a[..samples], &mut scratch.b[..samples], frames) {
                Ok(()) => std::mem::swap(&mut scratch.a, &mut scratch.b),
                Err(_) => {
                    // Pass-through for this slot; the input stays in `a`.
                }
            }
        }

        output[..samples].copy_from_slice(&scratch.a[..samples]);
        ProcessStatus::Continue
    }

    /// Stop processing and close every instance. The next audio cycle
    /// observes the flag and returns `Stop`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for slot in 1..=CHAIN_SLOTS {
            let _ = self.remove(slot);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(channels: usize) -> Engine {
        Engine::new(EngineConfig {
            sample_rate: 48000.0,
            channels,
            max_block_length: 4096,
        })
    }

    /// The 256-sample ramp 0.0, 0.1, … 25.5.
    fn ramp() -> Vec<f32> {
        (0..256).map(|i| i as f32 * 0.1).collect()
    }

    #[test]
    fn empty_chain_is_bit_exact_pass_through() {
        let engine = engine(1);
        let input = ramp();
        let mut output = vec![0.0f32; 256];
        let status = engine.process(&input, &mut output, 256);
        assert_eq!(status, ProcessStatus::Continue);
        assert_eq!(input, output);
    }

    #[test]
    fn effects_off_is_bit_exact_pass_through() {
        let engine = engine(1);
        engine.set_effect_on(false);
        assert!(!engine.effect_on());
        let input = ramp();
        let mut output = vec![0.0f32; 256];
        engine.process(&input, &mut output, 256);
        assert_eq!(input, output);
    }

    #[test]
    fn stereo_pass_through_keeps_interleaving() {
        let engine = engine(2);
        let input: Vec<f32> = (0..512).map(|i| i as f32).collect();
        let mut output = vec![0.0f32; 512];
        engine.process(&input, &mut output, 256);
        assert_eq!(input, output);
    }

    #[test]
    fn invalid_frame_counts_degrade_to_pass_through() {
        let engine = engine(1);
        let input = ramp();
        let mut output = vec![0.0f32; 256];

        assert_eq!(engine.process(&input, &mut output, 0), ProcessStatus::Continue);
        // frames beyond the negotiated maximum
        assert_eq!(
            engine.process(&input, &mut output, 10_000),
            ProcessStatus::Continue
        );
        assert_eq!(input, output);
    }

    #[test]
    fn slot_bounds_are_enforced() {
        let engine = engine(1);
        assert!(matches!(
            engine.add(0, "urn:x"),
            Err(HostError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.add(CHAIN_SLOTS + 1, "urn:x"),
            Err(HostError::InvalidArgument(_))
        ));
        assert!(engine.remove(1).is_ok());
        assert!(engine.remove(CHAIN_SLOTS).is_ok());
        assert!(engine.remove(9).is_err());
    }

    #[test]
    fn add_without_catalog_reports_unknown_plugin() {
        let engine = engine(1);
        assert!(matches!(
            engine.add(1, "urn:never-scanned"),
            Err(HostError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn parameter_calls_on_empty_slots_are_rejected() {
        let engine = engine(1);
        assert!(engine.set_parameter(1, 0, 1.0).is_err());
        assert!(engine.set_control(2, "gain", 1.0).is_err());
        assert_eq!(engine.control_value(3, "gain"), None);
        assert!(engine.slot_status(4).is_none());
    }

    #[test]
    fn plugin_info_is_empty_object_before_init() {
        let engine = engine(1);
        assert_eq!(engine.plugin_info_json(), "{}");
        assert!(engine.plugin_uris().is_empty());
    }

    #[test]
    fn shutdown_stops_the_transport() {
        let engine = engine(1);
        engine.shutdown();
        let input = ramp();
        let mut output = vec![0.0f32; 256];
        assert_eq!(engine.process(&input, &mut output, 256), ProcessStatus::Stop);
    }
}
