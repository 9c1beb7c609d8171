//! Plugin discovery and the metadata snapshot handed to the control
//! surface.
//!
//! The catalog is built once from an LV2 search path and is read-only
//! afterwards. It keeps the lilv world alive so instances can resolve
//! their plugin descriptors from the same bundle set they were listed
//! from.

use std::collections::HashMap;

use lilv::World;
use serde_json::json;

use crate::types::{PortDirection, PortInfo, PortKind};

const LV2_INPUT_PORT: &str = "http://lv2plug.in/ns/lv2core#InputPort";
const LV2_OUTPUT_PORT: &str = "http://lv2plug.in/ns/lv2core#OutputPort";
const LV2_AUDIO_PORT: &str = "http://lv2plug.in/ns/lv2core#AudioPort";
const LV2_CONTROL_PORT: &str = "http://lv2plug.in/ns/lv2core#ControlPort";
const LV2_ATOM_PORT: &str = "http://lv2plug.in/ns/ext/atom#AtomPort";
const LV2_TOGGLED: &str = "http://lv2plug.in/ns/lv2core#toggled";
const LV2_TRIGGER: &str = "http://lv2plug.in/ns/ext/port-props#trigger";
const LV2_MIDI_EVENT: &str = "http://lv2plug.in/ns/ext/midi#MidiEvent";
const LV2_MINIMUM_SIZE: &str = "http://lv2plug.in/ns/ext/resize-port#minimumSize";

/// What the host's feature table will offer every instance; mirrored here
/// so the scan can flag plugins that could never load.
const PROVIDED_FEATURES: &[&str] = &[
    "http://lv2plug.in/ns/ext/urid#map",
    "http://lv2plug.in/ns/ext/urid#unmap",
    "http://lv2plug.in/ns/ext/options#options",
    "http://lv2plug.in/ns/ext/buf-size#boundedBlockLength",
    "http://lv2plug.in/ns/ext/buf-size#powerOf2BlockLength",
    "http://lv2plug.in/ns/ext/buf-size#fixedBlockLength",
    "http://lv2plug.in/ns/ext/worker#schedule",
    "http://lv2plug.in/ns/ext/state#mapPath",
    "http://lv2plug.in/ns/ext/state#makePath",
    "http://lv2plug.in/ns/ext/state#freePath",
    "http://lv2plug.in/ns/lv2core#isLive",
    "http://lv2plug.in/ns/lv2core#inPlaceBroken",
];

/// Metadata snapshot for one discovered plugin.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub uri: String,
    pub name: String,
    pub author: Option<String>,
    pub ports: Vec<PortInfo>,
    pub required_features: Vec<String>,
    /// False when the plugin requires a feature the host never offers.
    pub compatible: bool,
}

impl CatalogEntry {
    pub fn port_by_symbol(&self, symbol: &str) -> Option<&PortInfo> {
        self.ports.iter().find(|p| p.symbol == symbol)
    }

    fn to_json_value(&self) -> serde_json::Value {
        let ports: Vec<serde_json::Value> = self
            .ports
            .iter()
            .map(|p| {
                let mut port = json!({
                    "index": p.index,
                    "symbol": p.symbol,
                    "name": p.name,
                    "type": p.kind.as_str(),
                });
                if p.kind == PortKind::Control {
                    port["min"] = json!(p.min_value);
                    port["max"] = json!(p.max_value);
                    port["default"] = json!(p.default_value);
                }
                port
            })
            .collect();
        json!({
            "name": self.name,
            "uri": self.uri,
            "author": self.author.as_deref().unwrap_or(""),
            "ports": self.ports.len(),
            "port": ports,
        })
    }
}

/// World-wide scan result: `uri → entry` plus the live lilv world.
pub struct Catalog {
    world: World,
    entries: HashMap<String, CatalogEntry>,
}

// The world is only touched from the control thread: entry lookups during
// add-plugin and the initial scan. The audio thread never sees it.
unsafe impl Send for Catalog {}

impl Catalog {
    /// Load every bundle under `search_path` (a directory of `.lv2`
    /// subdirectories) and snapshot the metadata of each plugin found.
    pub fn new(search_path: &str) -> Self {
        if !search_path.is_empty() {
            std::env::set_var("LV2_PATH", search_path);
        }
        let world = World::with_load_all();
        let entries = scan(&world);
        log::info!(
            "catalog: {} plugins under '{}'",
            entries.len(),
            search_path
        );
        Self { world, entries }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn entry(&self, uri: &str) -> Option<&CatalogEntry> {
        self.entries.get(uri)
    }

    pub fn entries(&self) -> &HashMap<String, CatalogEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The catalog as the JSON document the control surface renders:
    /// one object per URI with name, author and the port array.
    pub fn to_json(&self) -> String {
        entries_to_json(&self.entries)
    }
}

pub(crate) fn entries_to_json(entries: &HashMap<String, CatalogEntry>) -> String {
    let mut root = serde_json::Map::new();
    for (uri, entry) in entries {
        root.insert(uri.clone(), entry.to_json_value());
    }
    serde_json::Value::Object(root).to_string()
}

fn scan(world: &World) -> HashMap<String, CatalogEntry> {
    let input_class = world.new_uri(LV2_INPUT_PORT);
    let output_class = world.new_uri(LV2_OUTPUT_PORT);
    let audio_class = world.new_uri(LV2_AUDIO_PORT);
    let control_class = world.new_uri(LV2_CONTROL_PORT);
    let atom_class = world.new_uri(LV2_ATOM_PORT);
    let toggled = world.new_uri(LV2_TOGGLED);
    let trigger = world.new_uri(LV2_TRIGGER);
    let midi_event = world.new_uri(LV2_MIDI_EVENT);
    let minimum_size = world.new_uri(LV2_MINIMUM_SIZE);

    let mut entries = HashMap::new();

    for plugin in world.plugins().iter() {
        if !plugin.verify() {
            log::warn!("catalog: skipping plugin that failed verification");
            continue;
        }
        let Some(uri) = plugin.uri().as_uri().map(str::to_string) else {
            continue;
        };
        let name = plugin
            .name()
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| uri.clone());
        let author = plugin
            .author_name()
            .and_then(|n| n.as_str().map(String::from));

        let mut ports = Vec::new();

        let port_ranges = plugin.port_ranges_float();
        for (i, range) in port_ranges.iter().enumerate() {
            let Some(port) = plugin.port_by_index(i) else {
                continue;
            };

            let symbol = port
                .symbol()
                .and_then(|s| s.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("port_{i}"));
            let port_name = port
                .name()
                .and_then(|n| n.as_str().map(str::to_string))
                .unwrap_or_else(|| symbol.clone());

            let direction = if port.is_a(&output_class) && !port.is_a(&input_class) {
                PortDirection::Output
            } else {
                PortDirection::Input
            };
            let kind = if port.is_a(&audio_class) {
                PortKind::Audio
            } else if port.is_a(&control_class) {
                PortKind::Control
            } else if port.is_a(&atom_class) {
                PortKind::Atom
            } else {
                PortKind::Unknown
            };

            let is_control_input =
                kind == PortKind::Control && direction == PortDirection::Input;
            let is_trigger = is_control_input && port.has_property(&trigger);
            let is_toggled = is_control_input && !is_trigger && port.has_property(&toggled);

            let port_minimum_size = if kind == PortKind::Atom {
                port.get(&minimum_size)
                    .and_then(|n| n.as_int())
                    .map(|n| n.max(0) as u32)
            } else {
                None
            };
            let supports_midi = kind == PortKind::Atom
                && direction == PortDirection::Input
                && port.supports_event(&midi_event);

            ports.push(PortInfo {
                index: i as u32,
                symbol,
                name: port_name,
                direction,
                kind,
                default_value: range.default,
                min_value: range.min,
                max_value: range.max,
                minimum_size: port_minimum_size,
                supports_midi,
                toggled: is_toggled,
                trigger: is_trigger,
            });
        }

        let required_features: Vec<String> = plugin
            .required_features()
            .iter()
            .filter_map(|n| n.as_uri().map(String::from))
            .collect();
        let compatible = required_features
            .iter()
            .all(|req| PROVIDED_FEATURES.contains(&req.as_str()));
        if !compatible {
            log::warn!("catalog: '{name}' requires features the host lacks");
        }

        entries.insert(
            uri.clone(),
            CatalogEntry {
                uri,
                name,
                author,
                ports,
                required_features,
                compatible,
            },
        );
    }

    entries
}
