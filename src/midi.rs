//! MIDI utilities and message types
//!
//! Provides MIDI message parsing, encoding, and the stream decoder used on
//! raw controller transfers (the POD batches several messages per USB read).

use std::fmt;
use tracing::{debug, trace, warn};

/// MIDI message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    ///
    /// Velocity 0 is kept as a Note On so that encoding stays lossless.
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Polyphonic Key Pressure: channel (0-15), note (0-127), pressure (0-127)
    PolyPressure { channel: u8, note: u8, pressure: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// Program Change: channel (0-15), program (0-127)
    ProgramChange { channel: u8, program: u8 },

    /// Channel Pressure: channel (0-15), pressure (0-127)
    ChannelPressure { channel: u8, pressure: u8 },

    /// Pitch Bend: channel (0-15), value (0-16383, 14-bit)
    PitchBend { channel: u8, value: u16 },

    /// System Exclusive payload, without the F0/F7 framing
    SysEx { data: Vec<u8> },

    /// MIDI Time Code Quarter Frame
    MidiTimeCode { data: u8 },

    /// Song Position Pointer
    SongPosition { position: u16 },

    /// Song Select
    SongSelect { song: u8 },

    /// Tune Request
    TuneRequest,

    /// Timing Clock
    TimingClock,

    /// Start
    Start,

    /// Continue
    Continue,

    /// Stop
    Stop,

    /// Active Sensing
    ActiveSensing,

    /// System Reset
    SystemReset,
}

impl MidiMessage {
    /// Parse a single MIDI message from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }

        let status = data[0];

        // Running status is not produced by the controller
        if status < 0x80 {
            return None;
        }

        // Channel messages (0x80-0xEF)
        if status < 0xF0 {
            let message_type = status & 0xF0;
            let channel = status & 0x0F;

            match message_type {
                0x80 => {
                    if data.len() < 3 { return None; }
                    Some(MidiMessage::NoteOff {
                        channel,
                        note: data[1] & 0x7F,
                        velocity: data[2] & 0x7F,
                    })
                }
                0x90 => {
                    if data.len() < 3 { return None; }
                    Some(MidiMessage::NoteOn {
                        channel,
                        note: data[1] & 0x7F,
                        velocity: data[2] & 0x7F,
                    })
                }
                0xA0 => {
                    if data.len() < 3 { return None; }
                    Some(MidiMessage::PolyPressure {
                        channel,
                        note: data[1] & 0x7F,
                        pressure: data[2] & 0x7F,
                    })
                }
                0xB0 => {
                    if data.len() < 3 { return None; }
                    Some(MidiMessage::ControlChange {
                        channel,
                        cc: data[1] & 0x7F,
                        value: data[2] & 0x7F,
                    })
                }
                0xC0 => {
                    if data.len() < 2 { return None; }
                    Some(MidiMessage::ProgramChange {
                        channel,
                        program: data[1] & 0x7F,
                    })
                }
                0xD0 => {
                    if data.len() < 2 { return None; }
                    Some(MidiMessage::ChannelPressure {
                        channel,
                        pressure: data[1] & 0x7F,
                    })
                }
                0xE0 => {
                    if data.len() < 3 { return None; }
                    let lsb = (data[1] & 0x7F) as u16;
                    let msb = (data[2] & 0x7F) as u16;
                    Some(MidiMessage::PitchBend { channel, value: (msb << 7) | lsb })
                }
                _ => None,
            }
        } else {
            match status {
                0xF0 => {
                    let end = data.iter().position(|&b| b == 0xF7)?;
                    Some(MidiMessage::SysEx { data: data[1..end].to_vec() })
                }
                0xF1 => {
                    if data.len() < 2 { return None; }
                    Some(MidiMessage::MidiTimeCode { data: data[1] & 0x7F })
                }
                0xF2 => {
                    if data.len() < 3 { return None; }
                    let lsb = (data[1] & 0x7F) as u16;
                    let msb = (data[2] & 0x7F) as u16;
                    Some(MidiMessage::SongPosition { position: (msb << 7) | lsb })
                }
                0xF3 => {
                    if data.len() < 2 { return None; }
                    Some(MidiMessage::SongSelect { song: data[1] & 0x7F })
                }
                0xF6 => Some(MidiMessage::TuneRequest),
                0xF8 => Some(MidiMessage::TimingClock),
                0xFA => Some(MidiMessage::Start),
                0xFB => Some(MidiMessage::Continue),
                0xFC => Some(MidiMessage::Stop),
                0xFE => Some(MidiMessage::ActiveSensing),
                0xFF => Some(MidiMessage::SystemReset),
                _ => None,
            }
        }
    }

    /// Encode the message to MIDI bytes
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::PolyPressure { channel, note, pressure } => {
                vec![0xA0 | (channel & 0x0F), note & 0x7F, pressure & 0x7F]
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                vec![0xB0 | (channel & 0x0F), cc & 0x7F, value & 0x7F]
            }
            MidiMessage::ProgramChange { channel, program } => {
                vec![0xC0 | (channel & 0x0F), program & 0x7F]
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                vec![0xD0 | (channel & 0x0F), pressure & 0x7F]
            }
            MidiMessage::PitchBend { channel, value } => {
                let lsb = (value & 0x7F) as u8;
                let msb = ((value >> 7) & 0x7F) as u8;
                vec![0xE0 | (channel & 0x0F), lsb, msb]
            }
            MidiMessage::SysEx { ref data } => {
                let mut result = Vec::with_capacity(data.len() + 2);
                result.push(0xF0);
                result.extend(data.iter().map(|b| b & 0x7F));
                result.push(0xF7);
                result
            }
            MidiMessage::MidiTimeCode { data } => vec![0xF1, data & 0x7F],
            MidiMessage::SongPosition { position } => {
                vec![0xF2, (position & 0x7F) as u8, ((position >> 7) & 0x7F) as u8]
            }
            MidiMessage::SongSelect { song } => vec![0xF3, song & 0x7F],
            MidiMessage::TuneRequest => vec![0xF6],
            MidiMessage::TimingClock => vec![0xF8],
            MidiMessage::Start => vec![0xFA],
            MidiMessage::Continue => vec![0xFB],
            MidiMessage::Stop => vec![0xFC],
            MidiMessage::ActiveSensing => vec![0xFE],
            MidiMessage::SystemReset => vec![0xFF],
        }
    }

    /// Get the channel for channel messages (0-15), None for system messages
    pub fn channel(&self) -> Option<u8> {
        match *self {
            MidiMessage::NoteOff { channel, .. } |
            MidiMessage::NoteOn { channel, .. } |
            MidiMessage::PolyPressure { channel, .. } |
            MidiMessage::ControlChange { channel, .. } |
            MidiMessage::ProgramChange { channel, .. } |
            MidiMessage::ChannelPressure { channel, .. } |
            MidiMessage::PitchBend { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Check if this is a control change
    pub fn is_cc(&self) -> bool {
        matches!(self, MidiMessage::ControlChange { .. })
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::PolyPressure { channel, note, pressure } => {
                write!(f, "PolyPressure ch:{} n:{} p:{}", channel + 1, note, pressure)
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, cc, value)
            }
            MidiMessage::ProgramChange { channel, program } => {
                write!(f, "ProgramChange ch:{} p:{}", channel + 1, program)
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                write!(f, "ChannelPressure ch:{} p:{}", channel + 1, pressure)
            }
            MidiMessage::PitchBend { channel, value } => {
                write!(f, "PitchBend ch:{} v:{}", channel + 1, value)
            }
            MidiMessage::SysEx { ref data } => {
                write!(f, "SysEx {} bytes", data.len())
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Coarse classification used by the translation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteOn,
    NoteOff,
    ControlChange,
    ProgramChange,
    Other,
}

/// A decoded controller event together with the bytes it came from
///
/// Never modified after decoding. Translation builds new messages from it,
/// and the raw bytes are what the virtual port mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub message: MidiMessage,
    pub raw: Vec<u8>,
}

impl MidiEvent {
    /// Build an event from a message, using its canonical encoding as raw bytes
    pub fn from_message(message: MidiMessage) -> Self {
        let raw = message.encode();
        Self { message, raw }
    }

    pub fn kind(&self) -> EventKind {
        match self.message {
            MidiMessage::NoteOn { .. } => EventKind::NoteOn,
            MidiMessage::NoteOff { .. } => EventKind::NoteOff,
            MidiMessage::ControlChange { .. } => EventKind::ControlChange,
            MidiMessage::ProgramChange { .. } => EventKind::ProgramChange,
            _ => EventKind::Other,
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, format_hex(&self.raw))
    }
}

/// How many bytes a message starting with `status` occupies
enum Frame {
    Fixed(usize),
    SysEx,
    Undefined,
}

fn frame_for(status: u8) -> Frame {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Frame::Fixed(3),
        0xC0..=0xDF => Frame::Fixed(2),
        0xF0 => Frame::SysEx,
        0xF1 | 0xF3 => Frame::Fixed(2),
        0xF2 => Frame::Fixed(3),
        0xF6 | 0xF8 | 0xFA | 0xFB | 0xFC | 0xFE | 0xFF => Frame::Fixed(1),
        _ => Frame::Undefined,
    }
}

/// Decode a raw byte buffer into zero or more events, in stream order
///
/// Stray data bytes are skipped, real-time bytes are emitted where they
/// appear (even inside another message), a status byte arriving before the
/// current message is complete abandons it, and an incomplete tail is
/// dropped. None of these are errors.
pub fn decode(data: &[u8]) -> Vec<MidiEvent> {
    let mut events = Vec::new();
    let mut pending: Vec<u8> = Vec::with_capacity(3);
    let mut expected = 0usize;
    let mut in_sysex = false;

    for &byte in data {
        if byte >= 0xF8 {
            match frame_for(byte) {
                Frame::Fixed(_) => push_event(&mut events, &[byte]),
                _ => trace!("Skipping undefined real-time byte {:02X}", byte),
            }
            continue;
        }

        if byte == 0xF7 {
            if in_sysex {
                pending.push(byte);
                push_event(&mut events, &pending);
                pending.clear();
                in_sysex = false;
            } else {
                trace!("Skipping stray end-of-exclusive");
            }
            continue;
        }

        if byte >= 0x80 {
            if !pending.is_empty() {
                debug!("Abandoning incomplete MIDI message: {}", format_hex(&pending));
                pending.clear();
            }
            in_sysex = false;

            match frame_for(byte) {
                Frame::Fixed(1) => push_event(&mut events, &[byte]),
                Frame::Fixed(len) => {
                    pending.push(byte);
                    expected = len;
                }
                Frame::SysEx => {
                    pending.push(byte);
                    in_sysex = true;
                }
                Frame::Undefined => trace!("Skipping undefined status byte {:02X}", byte),
            }
            continue;
        }

        if pending.is_empty() {
            trace!("Skipping stray data byte {:02X}", byte);
            continue;
        }

        pending.push(byte);
        if !in_sysex && pending.len() == expected {
            push_event(&mut events, &pending);
            pending.clear();
        }
    }

    if !pending.is_empty() {
        warn!("Dropping incomplete trailing MIDI bytes: {}", format_hex(&pending));
    }

    events
}

fn push_event(events: &mut Vec<MidiEvent>, bytes: &[u8]) {
    match MidiMessage::parse(bytes) {
        Some(message) => events.push(MidiEvent {
            message,
            raw: bytes.to_vec(),
        }),
        None => warn!("Failed to parse MIDI: {}", format_hex(bytes)),
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
