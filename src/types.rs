//! Shared port and control types.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lv2_raw::urid::LV2Urid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::ring::RingBuffer;

/// Default capacity of each DSP→UI event ring (must be a power of two).
pub const DSP_TO_UI_RING_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    Audio,
    Control,
    Atom,
    Unknown,
}

impl PortKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortKind::Audio => "audio",
            PortKind::Control => "control",
            PortKind::Atom => "atom",
            PortKind::Unknown => "unknown",
        }
    }
}

/// Static description of one plugin port, extracted from the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    pub index: u32,
    pub symbol: String,
    pub name: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub default_value: f32,
    pub min_value: f32,
    pub max_value: f32,
    /// Declared `rsz:minimumSize` for atom ports.
    pub minimum_size: Option<u32>,
    /// Whether an atom input accepts MIDI events.
    pub supports_midi: bool,
    /// Control carries the `lv2:toggled` property.
    #[serde(default)]
    pub toggled: bool,
    /// Control carries the `pprops:trigger` property.
    #[serde(default)]
    pub trigger: bool,
}

impl PortInfo {
    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }
}

/// Clamp tolerating NaN bounds; some bundles ship without a usable range.
pub fn safe_clamp(value: f32, min: f32, max: f32) -> f32 {
    if min.is_nan() || max.is_nan() || min > max {
        return value;
    }
    value.clamp(min, max)
}

/// UI↔DSP communication state of one atom port.
///
/// The UI→DSP direction is a single last-writer-wins slot published with a
/// release store of `pending`; the DSP→UI direction is an SPSC ring of
/// framed atoms.
pub struct AtomState {
    pending: AtomicBool,
    slot: Mutex<PendingAtom>,
    pub dsp_to_ui: RingBuffer,
    overruns: AtomicU32,
}

struct PendingAtom {
    type_: LV2Urid,
    data: Vec<u8>,
}

impl AtomState {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            slot: Mutex::new(PendingAtom {
                type_: 0,
                data: Vec::new(),
            }),
            dsp_to_ui: RingBuffer::new(DSP_TO_UI_RING_SIZE),
            overruns: AtomicU32::new(0),
        }
    }

    /// UI side: stage a message for the next DSP cycle, overwriting any
    /// message the DSP has not consumed yet.
    pub fn set_message(&self, type_: LV2Urid, data: &[u8], max_size: usize) -> Result<(), HostError> {
        if data.len() > max_size {
            return Err(HostError::NoSpace);
        }
        {
            let mut slot = self.slot.lock();
            slot.type_ = type_;
            slot.data.clear();
            slot.data.extend_from_slice(data);
        }
        self.pending.store(true, Ordering::Release);
        Ok(())
    }

    /// DSP side: take the staged message if one is pending.
    ///
    /// Non-blocking; if the UI is mid-overwrite the message is left staged
    /// for the next cycle.
    pub fn take_pending<R>(&self, consume: impl FnOnce(LV2Urid, &[u8]) -> R) -> Option<R> {
        if !self.pending.swap(false, Ordering::Acquire) {
            return None;
        }
        match self.slot.try_lock() {
            Some(slot) => Some(consume(slot.type_, &slot.data)),
            None => {
                self.pending.store(true, Ordering::Release);
                None
            }
        }
    }

    /// DSP side: note a dropped DSP→UI event.
    pub fn count_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of DSP→UI events dropped because the ring was full.
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Default for AtomState {
    fn default() -> Self {
        Self::new()
    }
}

/// The semantic model behind a writable port, replacing the source's
/// virtual control hierarchy with a tagged sum. `coerce` returns the value
/// to store into the port's backing scalar, or `None` for a type mismatch
/// (which is ignored, per contract).
pub enum Control {
    Float {
        value: f32,
        min: f32,
        max: f32,
        default: f32,
    },
    Toggle {
        value: bool,
        default: bool,
    },
    Trigger {
        armed: bool,
    },
    Atom(AtomState),
}

impl Control {
    pub fn coerce(&mut self, input: f32) -> Option<f32> {
        match self {
            Control::Float {
                value, min, max, ..
            } => {
                *value = safe_clamp(input, *min, *max);
                Some(*value)
            }
            Control::Toggle { value, .. } => {
                *value = input > 0.5;
                Some(if *value { 1.0 } else { 0.0 })
            }
            Control::Trigger { armed } => {
                *armed = input > 0.5;
                Some(if *armed { 1.0 } else { 0.0 })
            }
            // Atom ports take byte payloads, not scalars.
            Control::Atom(_) => None,
        }
    }

    /// Restore the bundle default. Returns the scalar to store, if any.
    pub fn reset(&mut self) -> Option<f32> {
        match self {
            Control::Float { value, default, .. } => {
                *value = *default;
                Some(*value)
            }
            Control::Toggle { value, default } => {
                *value = *default;
                Some(if *value { 1.0 } else { 0.0 })
            }
            Control::Trigger { armed } => {
                *armed = false;
                Some(0.0)
            }
            Control::Atom(_) => None,
        }
    }

    pub fn atom_state(&self) -> Option<&AtomState> {
        match self {
            Control::Atom(state) => Some(state),
            _ => None,
        }
    }
}
