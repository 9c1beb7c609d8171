//! pedalgrid: real-time LV2 plugin host core.
//!
//! Routes live mono/stereo audio through a fixed chain of up to four LV2
//! effect plugins. The audio transport drives [`engine::Engine::process`]
//! from its callback; the control surface talks to the same engine (or to
//! the single process-wide handle in [`api`]) for catalog queries, chain
//! edits, parameters, events and state.

pub mod api;
pub mod atom;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod features;
pub mod instance;
pub mod ring;
pub mod state;
pub mod types;
pub mod urid;
pub mod worker;

pub use catalog::{Catalog, CatalogEntry};
pub use engine::{Engine, EngineConfig, ProcessStatus, CHAIN_SLOTS};
pub use error::{HostError, Result};
pub use instance::{ActivationState, PluginInstance};
pub use ring::RingBuffer;
pub use state::PluginState;
pub use types::{Control, PortDirection, PortInfo, PortKind};
pub use urid::UridRegistry;
