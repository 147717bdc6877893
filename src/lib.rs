//! podbridge: POD HD USB controller to Boss Katana MIDI bridge
//!
//! Reads MIDI from the POD's bulk USB endpoints, mirrors the raw stream on a
//! virtual MIDI port and forwards a translated stream to the amplifier,
//! following both devices through unplug/replug cycles.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod midi;
pub mod ports;
pub mod queue;
pub mod reader;
pub mod state;
pub mod translate;
pub mod transport;
pub mod watcher;
