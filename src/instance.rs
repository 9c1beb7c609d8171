//! One hosted plugin: port table, buffers, feature table, worker and the
//! real-time process path.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lilv::instance::ActiveInstance;

use crate::atom::{
    self, AtomBuffer, ATOM_HEADER_SIZE, EVENT_HEADER_SIZE, SEQUENCE_BODY_SIZE,
};
use crate::catalog::{Catalog, CatalogEntry};
use crate::error::{HostError, Result};
use crate::features::FeatureTable;
use crate::types::{AtomState, Control, PortInfo, PortKind};
use crate::urid::UridRegistry;
use crate::worker::{Lv2WorkerInterface, Worker, WorkerLink, LV2_WORKER_INTERFACE_URI};

/// Baseline atom port buffer size; raised per-port by `rsz:minimumSize`.
pub const DEFAULT_ATOM_BUFFER_SIZE: usize = 8192;

const LV2_ATOM_SEQUENCE: &str = "http://lv2plug.in/ns/ext/atom#Sequence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Unloaded,
    Ready,
    Active,
    ShuttingDown,
}

/// One connection point plus its backing store. The `value` scalar and the
/// atom buffer are connected to the plugin once at initialization and must
/// not move afterwards; the port vector is frozen while the instance is
/// active.
struct Port {
    info: PortInfo,
    control: Option<Control>,
    value: f32,
    atom: Option<AtomBuffer>,
}

pub struct PluginInstance {
    uri: String,
    name: String,
    state: ActivationState,
    instance: Option<ActiveInstance>,
    features: FeatureTable,
    worker_link: WorkerLink,
    worker: Option<Worker>,
    ports: Vec<Port>,
    channel_in: Vec<Vec<f32>>,
    channel_out: Vec<Vec<f32>>,
    channels: usize,
    max_block_length: u32,
    atom_buffer_size: usize,
    sequence_urid: u32,
    registry: Arc<UridRegistry>,
    shutdown: Arc<AtomicBool>,
}

// The lilv instance handle is only touched from the thread driving
// process() and, for worker calls, from the worker thread the instance
// joins before freeing anything.
unsafe impl Send for PluginInstance {}

fn required_atom_size(entry: &CatalogEntry) -> usize {
    let mut size = DEFAULT_ATOM_BUFFER_SIZE;
    for port in &entry.ports {
        if port.kind == PortKind::Atom {
            if let Some(min) = port.minimum_size {
                size = size.max(min as usize);
            }
        }
    }
    size
}

/// Largest UI→DSP payload that still fits the port buffer once wrapped in
/// a sequence header and one padded event.
fn max_message_size(atom_buffer_size: usize) -> usize {
    atom_buffer_size
        .saturating_sub(ATOM_HEADER_SIZE + SEQUENCE_BODY_SIZE + EVENT_HEADER_SIZE + 7)
}

fn control_for_port(info: &PortInfo) -> Option<Control> {
    match info.kind {
        PortKind::Control if info.is_input() => Some(if info.trigger {
            Control::Trigger { armed: false }
        } else if info.toggled {
            Control::Toggle {
                value: info.default_value > 0.5,
                default: info.default_value > 0.5,
            }
        } else {
            Control::Float {
                value: info.default_value,
                min: info.min_value,
                max: info.max_value,
                default: info.default_value,
            }
        }),
        PortKind::Atom => Some(Control::Atom(AtomState::new())),
        _ => None,
    }
}

impl PluginInstance {
    /// Resolve, instantiate and activate `uri` from the catalog.
    ///
    /// On failure the plugin stays unloaded and the error names the cause:
    /// `UnknownPlugin`, `UnsupportedFeature` or `InstantiationFailed`.
    pub fn initialize(
        catalog: &Catalog,
        registry: Arc<UridRegistry>,
        uri: &str,
        sample_rate: f64,
        max_block_length: u32,
        channels: usize,
    ) -> Result<Self> {
        let entry = catalog
            .entry(uri)
            .ok_or_else(|| HostError::UnknownPlugin(uri.to_string()))?
            .clone();

        let atom_buffer_size = required_atom_size(&entry);

        let worker_link = WorkerLink::new();
        let features = FeatureTable::new(
            Arc::clone(&registry),
            max_block_length,
            worker_link.schedule_feature(),
        );
        for required in &entry.required_features {
            if !features.supports(required) {
                log::error!("{uri}: required feature {required} not supported");
                return Err(HostError::UnsupportedFeature(required.clone()));
            }
        }

        let uri_node = catalog.world().new_uri(uri);
        let plugin = catalog
            .world()
            .plugins()
            .plugin(&uri_node)
            .ok_or_else(|| HostError::UnknownPlugin(uri.to_string()))?;

        let instance = unsafe { plugin.instantiate(sample_rate, features.as_refs()) }
            .ok_or_else(|| HostError::InstantiationFailed(uri.to_string()))?;

        let sequence_urid = registry.map(LV2_ATOM_SEQUENCE);

        let ports: Vec<Port> = entry
            .ports
            .iter()
            .map(|info| {
                let atom = (info.kind == PortKind::Atom)
                    .then(|| AtomBuffer::new(atom_buffer_size));
                Port {
                    info: info.clone(),
                    control: control_for_port(info),
                    value: info.default_value,
                    atom,
                }
            })
            .collect();

        let channels = channels.clamp(1, 2);
        let block = max_block_length as usize;
        let mut this = Self {
            uri: uri.to_string(),
            name: entry.name.clone(),
            state: ActivationState::Ready,
            instance: None,
            features,
            worker_link,
            worker: None,
            ports,
            channel_in: vec![vec![0.0; block]; channels],
            channel_out: vec![vec![0.0; block]; channels],
            channels,
            max_block_length,
            atom_buffer_size,
            sequence_urid,
            registry,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        this.connect_and_activate(instance)?;

        log::info!(
            "loaded '{}' ({}): {} ports, atom buffers {} bytes, worker: {}",
            this.name,
            this.uri,
            this.ports.len(),
            this.atom_buffer_size,
            this.worker.is_some()
        );
        Ok(this)
    }

    /// Connect every non-audio port to its permanent backing store, then
    /// activate. Audio ports are reconnected each process() because the
    /// caller's buffers change.
    fn connect_and_activate(&mut self, mut instance: lilv::instance::Instance) -> Result<()> {
        for port in self.ports.iter_mut() {
            let index = port.info.index as usize;
            match port.info.kind {
                PortKind::Audio => {}
                PortKind::Control => unsafe {
                    instance.connect_port_mut(index, &mut port.value as *mut f32);
                },
                PortKind::Atom => {
                    let buf = port.atom.as_mut().expect("atom port has a buffer");
                    if port.info.is_input() {
                        atom::init_input_sequence(buf.bytes_mut(), self.sequence_urid);
                    } else {
                        atom::init_output_sequence(buf.bytes_mut());
                    }
                    unsafe {
                        instance.connect_port_mut(index, buf.ptr_mut());
                    }
                }
                PortKind::Unknown => unsafe {
                    // Known to be optional by this point; connect to null.
                    instance.connect_port_mut(index, std::ptr::null_mut::<f32>());
                },
            }
        }

        let active = unsafe { instance.activate() };

        let iface = unsafe {
            active
                .instance()
                .extension_data::<Lv2WorkerInterface>(LV2_WORKER_INTERFACE_URI)
        };
        if let Some(iface) = iface {
            let handle = active.instance().handle() as *mut c_void;
            self.worker = Some(unsafe { self.worker_link.activate(handle, iface.as_ptr()) });
        }

        self.instance = Some(active);
        self.state = ActivationState::Active;
        Ok(())
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn activation_state(&self) -> ActivationState {
        self.state
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Requests the plugin failed to schedule because the worker ring was
    /// full.
    pub fn worker_no_space_count(&self) -> u32 {
        self.worker_link.no_space_count()
    }

    /// DSP→UI events dropped because a port ring was full.
    pub fn event_overruns(&self) -> u32 {
        self.ports
            .iter()
            .filter_map(|p| p.control.as_ref().and_then(Control::atom_state))
            .map(AtomState::overruns)
            .sum()
    }

    /// The RT-critical path: connect audio, inject pending UI atoms, run,
    /// drain worker responses, export produced atoms, reset sequences.
    ///
    /// `input` and `output` are interleaved with the channel count fixed
    /// at initialization. No allocation, no blocking locks.
    pub fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) || self.state != ActivationState::Active {
            return Err(HostError::InvalidArgument("instance not active"));
        }
        if frames == 0 || frames > self.max_block_length as usize {
            return Err(HostError::InvalidArgument("frame count out of range"));
        }
        let samples = frames * self.channels;
        if input.len() < samples || output.len() < samples {
            return Err(HostError::InvalidArgument("audio buffer too short"));
        }

        // De-interleave the caller's buffer into per-channel scratch.
        for (ch, buf) in self.channel_in.iter_mut().enumerate() {
            for frame in 0..frames {
                buf[frame] = input[frame * self.channels + ch];
            }
        }
        for buf in self.channel_out.iter_mut() {
            buf[..frames].fill(0.0);
        }

        // Audio ports: the k-th input port reads the k-th channel, extra
        // ports fold onto the last channel.
        let instance = self
            .instance
            .as_mut()
            .ok_or(HostError::InvalidArgument("instance not active"))?;
        let mut input_index = 0usize;
        let mut output_index = 0usize;
        for port in self.ports.iter_mut() {
            if port.info.kind != PortKind::Audio {
                continue;
            }
            let index = port.info.index as usize;
            if port.info.is_input() {
                let ch = input_index.min(self.channels - 1);
                unsafe {
                    instance
                        .instance_mut()
                        .connect_port_mut(index, self.channel_in[ch].as_mut_ptr());
                }
                input_index += 1;
            } else {
                let ch = output_index.min(self.channels - 1);
                unsafe {
                    instance
                        .instance_mut()
                        .connect_port_mut(index, self.channel_out[ch].as_mut_ptr());
                }
                output_index += 1;
            }
        }

        // Atom inputs: fresh empty sequence, then at most one pending UI
        // message wrapped as an event at frame 0.
        let sequence_urid = self.sequence_urid;
        for port in self.ports.iter_mut() {
            if port.info.kind != PortKind::Atom || !port.info.is_input() {
                continue;
            }
            let Some(buf) = port.atom.as_mut() else {
                continue;
            };
            atom::init_input_sequence(buf.bytes_mut(), sequence_urid);
            if let Some(state) = port.control.as_ref().and_then(Control::atom_state) {
                let _ = state.take_pending(|type_, data| {
                    let _ = atom::append_event(buf.bytes_mut(), 0, type_, data);
                });
            }
        }
        // Atom outputs: advertise the full capacity for run() to fill.
        for port in self.ports.iter_mut() {
            if port.info.kind == PortKind::Atom && !port.info.is_input() {
                if let Some(buf) = port.atom.as_mut() {
                    atom::init_output_sequence(buf.bytes_mut());
                }
            }
        }

        unsafe {
            instance.run(frames);
        }

        if let Some(worker) = self.worker.as_mut() {
            unsafe {
                worker.drain_responses();
            }
        }

        // Export produced events to the UI rings and reset for the next
        // cycle.
        for port in self.ports.iter_mut() {
            if port.info.kind != PortKind::Atom || port.info.is_input() {
                continue;
            }
            let Some(buf) = port.atom.as_mut() else {
                continue;
            };
            if let Some(state) = port.control.as_ref().and_then(Control::atom_state) {
                if atom::sequence_type(buf.bytes()) != 0 {
                    for event in atom::sequence_events(buf.bytes()) {
                        if event.body.is_empty() {
                            continue;
                        }
                        let total = ATOM_HEADER_SIZE + event.body.len();
                        if state.dsp_to_ui.write_space() >= total {
                            state.dsp_to_ui.write(&(event.body.len() as u32).to_ne_bytes());
                            state.dsp_to_ui.write(&event.type_.to_ne_bytes());
                            state.dsp_to_ui.write(event.body);
                        } else {
                            state.count_overrun();
                        }
                    }
                }
            }
            atom::init_output_sequence(buf.bytes_mut());
        }

        // Re-interleave; channels the plugin did not produce fall back to
        // the input so a mono plugin in a stereo chain passes the other
        // channel through.
        for frame in 0..frames {
            for ch in 0..self.channels {
                let sample = if ch < output_index {
                    self.channel_out[ch][frame]
                } else {
                    self.channel_in[ch][frame]
                };
                output[frame * self.channels + ch] = sample;
            }
        }
        Ok(())
    }

    /// Clamp and store a control value, keyed by port symbol.
    pub fn set_control(&mut self, symbol: &str, value: f32) -> Result<()> {
        let port = self
            .ports
            .iter_mut()
            .find(|p| p.info.symbol == symbol && p.info.is_input())
            .ok_or(HostError::InvalidArgument("unknown port symbol"))?;
        Self::store_control(port, value);
        Ok(())
    }

    /// Clamp and store a control value, keyed by port index.
    pub fn set_control_by_index(&mut self, port_index: u32, value: f32) -> Result<()> {
        let port = self
            .ports
            .iter_mut()
            .find(|p| p.info.index == port_index && p.info.is_input())
            .ok_or(HostError::InvalidArgument("port index out of range"))?;
        Self::store_control(port, value);
        Ok(())
    }

    fn store_control(port: &mut Port, value: f32) {
        if let Some(control) = port.control.as_mut() {
            // A mismatched kind (e.g. a scalar aimed at an atom port) is
            // ignored.
            if let Some(scalar) = control.coerce(value) {
                port.value = scalar;
            }
        }
    }

    /// Read back a control port's current scalar.
    pub fn control_value(&self, symbol: &str) -> Option<f32> {
        self.ports
            .iter()
            .find(|p| p.info.symbol == symbol && p.info.kind == PortKind::Control)
            .map(|p| p.value)
    }

    /// Restore every control to its bundle default.
    pub fn reset_controls(&mut self) {
        for port in self.ports.iter_mut() {
            if let Some(control) = port.control.as_mut() {
                if let Some(scalar) = control.reset() {
                    port.value = scalar;
                }
            }
        }
    }

    /// Stage an atom message for the next DSP cycle (last-writer-wins).
    /// Rejected with `NoSpace` when the payload cannot fit the port's
    /// sequence buffer.
    pub fn set_atom_message(&mut self, symbol: &str, type_: u32, data: &[u8]) -> Result<()> {
        let limit = max_message_size(self.atom_buffer_size);
        let port = self
            .ports
            .iter()
            .find(|p| {
                p.info.symbol == symbol && p.info.kind == PortKind::Atom && p.info.is_input()
            })
            .ok_or(HostError::InvalidArgument("unknown atom input port"))?;
        let state = port
            .control
            .as_ref()
            .and_then(Control::atom_state)
            .ok_or(HostError::InvalidArgument("unknown atom input port"))?;
        state.set_message(type_, data, limit)
    }

    /// Pop one framed atom `(size, type, body)` produced by the plugin on
    /// an atom output port. Returns the number of bytes written into
    /// `out` (0 when no complete event is available or `out` is too
    /// small).
    pub fn read_events(&self, symbol: &str, out: &mut [u8]) -> usize {
        let Some(state) = self
            .ports
            .iter()
            .find(|p| {
                p.info.symbol == symbol && p.info.kind == PortKind::Atom && !p.info.is_input()
            })
            .and_then(|p| p.control.as_ref())
            .and_then(Control::atom_state)
        else {
            return 0;
        };
        let ring = &state.dsp_to_ui;
        if out.len() < ATOM_HEADER_SIZE {
            return 0;
        }
        let mut header = [0u8; ATOM_HEADER_SIZE];
        if ring.peek(&mut header) < ATOM_HEADER_SIZE {
            return 0;
        }
        let size = u32::from_ne_bytes(header[0..4].try_into().unwrap()) as usize;
        let total = ATOM_HEADER_SIZE + size;
        if total > out.len() || ring.read_space() < total {
            return 0;
        }
        ring.read(&mut out[..total])
    }

    pub(crate) fn registry(&self) -> &Arc<UridRegistry> {
        &self.registry
    }

    pub(crate) fn features(&self) -> &FeatureTable {
        &self.features
    }

    pub(crate) fn instance_handle(&self) -> *mut c_void {
        self.instance
            .as_ref()
            .map(|i| i.instance().handle() as *mut c_void)
            .unwrap_or(std::ptr::null_mut())
    }

    pub(crate) fn control_inputs(&self) -> impl Iterator<Item = (&str, f32)> {
        self.ports.iter().filter_map(|p| {
            (p.info.kind == PortKind::Control && p.info.is_input())
                .then_some((p.info.symbol.as_str(), p.value))
        })
    }

    pub(crate) fn extension_data<T>(&self, uri: &str) -> Option<std::ptr::NonNull<T>> {
        let instance = self.instance.as_ref()?;
        unsafe { instance.instance().extension_data::<T>(uri) }
    }

    /// Tear down: stop the worker, deactivate and free the instance.
    pub fn close(&mut self) {
        if self.state == ActivationState::Unloaded {
            return;
        }
        self.state = ActivationState::ShuttingDown;
        self.shutdown.store(true, Ordering::Release);

        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        if let Some(instance) = self.instance.take() {
            let _ = unsafe { instance.deactivate() };
        }
        self.state = ActivationState::Unloaded;
        log::info!("closed '{}'", self.uri);
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortDirection;

    fn atom_port(minimum_size: Option<u32>) -> PortInfo {
        PortInfo {
            index: 0,
            symbol: "events".to_string(),
            name: "Events".to_string(),
            direction: PortDirection::Input,
            kind: PortKind::Atom,
            default_value: 0.0,
            min_value: 0.0,
            max_value: 0.0,
            minimum_size,
            supports_midi: true,
            toggled: false,
            trigger: false,
        }
    }

    fn entry_with_ports(ports: Vec<PortInfo>) -> CatalogEntry {
        CatalogEntry {
            uri: "urn:test".to_string(),
            name: "Test".to_string(),
            author: None,
            ports,
            required_features: vec![],
            compatible: true,
        }
    }

    #[test]
    fn atom_size_starts_at_default_and_honors_minimums() {
        let entry = entry_with_ports(vec![atom_port(None)]);
        assert_eq!(required_atom_size(&entry), DEFAULT_ATOM_BUFFER_SIZE);

        let entry = entry_with_ports(vec![atom_port(Some(4096)), atom_port(Some(32768))]);
        assert_eq!(required_atom_size(&entry), 32768);
    }

    #[test]
    fn message_limit_leaves_room_for_framing() {
        let limit = max_message_size(DEFAULT_ATOM_BUFFER_SIZE);
        assert!(limit < DEFAULT_ATOM_BUFFER_SIZE);
        // A maximal message must still fit once framed and padded.
        assert!(
            ATOM_HEADER_SIZE + SEQUENCE_BODY_SIZE + EVENT_HEADER_SIZE + atom::pad_size(limit)
                <= DEFAULT_ATOM_BUFFER_SIZE
        );
    }

    #[test]
    fn control_models_follow_port_properties() {
        let mut info = PortInfo {
            index: 1,
            symbol: "gain".to_string(),
            name: "Gain".to_string(),
            direction: PortDirection::Input,
            kind: PortKind::Control,
            default_value: 1.0,
            min_value: 0.0,
            max_value: 2.0,
            minimum_size: None,
            supports_midi: false,
            toggled: false,
            trigger: false,
        };
        assert!(matches!(
            control_for_port(&info),
            Some(Control::Float { default, .. }) if default == 1.0
        ));

        info.toggled = true;
        assert!(matches!(
            control_for_port(&info),
            Some(Control::Toggle { value: true, .. })
        ));

        info.trigger = true;
        assert!(matches!(
            control_for_port(&info),
            Some(Control::Trigger { armed: false })
        ));

        info.direction = PortDirection::Output;
        info.trigger = false;
        info.toggled = false;
        assert!(control_for_port(&info).is_none());
    }
}
