//! MIDI port handling
//!
//! Opens the amp's output port by substring match and advertises the
//! virtual port pair that mirrors the raw controller stream.

use anyhow::{anyhow, Context, Result};
use midir::{MidiOutput, MidiOutputConnection, MidiOutputPort};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::midi::format_hex;

/// Shared, swappable amp connection (`None` while the amp is away)
pub type SinkSlot = Arc<Mutex<Option<Box<dyn MidiSink>>>>;

/// Anything the dispatcher can push raw MIDI bytes into
pub trait MidiSink: Send {
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Name used in log lines
    fn name(&self) -> &str;
}

/// List available MIDI output ports
pub fn list_output_ports() -> Result<Vec<String>> {
    let midi_out = MidiOutput::new("Podbridge-Scanner")
        .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?;

    let mut port_names = Vec::new();
    for port in midi_out.ports() {
        if let Ok(name) = midi_out.port_name(&port) {
            port_names.push(name);
        }
    }

    Ok(port_names)
}

/// Case-insensitive substring match, first hit wins
pub fn matches_port(name: &str, pattern: &str) -> bool {
    name.to_lowercase().contains(&pattern.to_lowercase())
}

/// Find an output port by substring match
fn find_output_port(midi_out: &MidiOutput, pattern: &str) -> Option<(MidiOutputPort, String)> {
    for port in midi_out.ports() {
        if let Ok(name) = midi_out.port_name(&port) {
            if matches_port(&name, pattern) {
                debug!("Found port '{}' matching pattern '{}'", name, pattern);
                return Some((port, name));
            }
        }
    }
    None
}

/// Whether an output port matching `pattern` is currently listed
pub fn amp_port_present(pattern: &str) -> Result<bool> {
    Ok(list_output_ports()?
        .iter()
        .any(|name| matches_port(name, pattern)))
}

/// Connection to the amplifier's MIDI input
pub struct AmpOutput {
    conn: MidiOutputConnection,
    port_name: String,
}

impl AmpOutput {
    /// Open the first output port matching `pattern`
    ///
    /// Returns `Ok(None)` when no such port exists: a missing amp is a normal
    /// state, not an error.
    pub fn open(pattern: &str) -> Result<Option<Self>> {
        let midi_out = MidiOutput::new("Podbridge-Amp")
            .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?;

        let Some((port, port_name)) = find_output_port(&midi_out, pattern) else {
            debug!("No output port matches '{}'", pattern);
            return Ok(None);
        };

        let conn = midi_out
            .connect(&port, "podbridge-amp")
            .map_err(|e| anyhow!("Failed to connect to '{}': {}", port_name, e))?;

        info!("Amp output opened: {}", port_name);
        Ok(Some(Self { conn, port_name }))
    }
}

impl MidiSink for AmpOutput {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.conn
            .send(data)
            .with_context(|| format!("Failed to send {} to amp", format_hex(data)))
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}

/// Virtual MIDI source/sink pair advertised to other software
pub struct VirtualPorts {
    output: MidiOutputConnection,
    // Kept open so the port pair stays visible; nothing is read from it
    _input: midir::MidiInputConnection<()>,
    name: String,
}

impl VirtualPorts {
    #[cfg(unix)]
    pub fn create(name: &str) -> Result<Self> {
        use midir::os::unix::{VirtualInput, VirtualOutput};
        use midir::MidiInput;
        use tracing::trace;

        let output = MidiOutput::new("Podbridge-Virtual-Out")
            .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?
            .create_virtual(name)
            .map_err(|e| anyhow!("Failed to create virtual output '{}': {}", name, e))?;

        let input = MidiInput::new("Podbridge-Virtual-In")
            .map_err(|e| anyhow!("Failed to create MIDI input: {}", e))?
            .create_virtual(
                name,
                |_timestamp, data, _| trace!("Virtual port RX (ignored): {}", format_hex(data)),
                (),
            )
            .map_err(|e| anyhow!("Failed to create virtual input '{}': {}", name, e))?;

        info!("Virtual MIDI port created: {}", name);
        Ok(Self {
            output,
            _input: input,
            name: name.to_string(),
        })
    }

    #[cfg(not(unix))]
    pub fn create(name: &str) -> Result<Self> {
        Err(anyhow!(
            "Virtual MIDI port '{}' is not supported on this platform",
            name
        ))
    }
}

impl MidiSink for VirtualPorts {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.output
            .send(data)
            .with_context(|| format!("Failed to send {} to virtual port", format_hex(data)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
