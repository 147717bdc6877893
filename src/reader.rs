//! Reader loop
//!
//! Runs on its own OS thread because bulk reads block. Each pass reads one
//! bounded burst from the controller, decodes it and enqueues the events in
//! order. It knows nothing about translation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::midi::{decode, format_hex};
use crate::queue::EventSender;
use crate::state::ConnectivityState;
use crate::transport::{read_burst, ControllerSlot};

/// Outcome of a single reader pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Controller absent or not open; nothing was read
    Idle,
    /// A burst was read; this many events were enqueued
    Read(usize),
    /// The transport errored mid-burst; partial data was still enqueued
    Faulted(usize),
    /// The dispatcher is gone
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub bytes: u64,
    pub events: u64,
    pub faults: u64,
}

pub struct ReaderLoop {
    slot: ControllerSlot,
    state: Arc<ConnectivityState>,
    events: EventSender,
    max_reads: usize,
    read_timeout: Duration,
    idle_poll: Duration,
    stats: ReaderStats,
}

impl ReaderLoop {
    pub fn new(
        config: &ControllerConfig,
        slot: ControllerSlot,
        state: Arc<ConnectivityState>,
        events: EventSender,
    ) -> Self {
        Self {
            slot,
            state,
            events,
            max_reads: config.max_reads_per_call,
            read_timeout: config.read_timeout(),
            idle_poll: config.idle_poll(),
            stats: ReaderStats::default(),
        }
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Read one burst and enqueue whatever it decodes to
    pub fn poll_once(&mut self) -> Poll {
        if !self.state.controller_present() {
            return Poll::Idle;
        }

        let burst = {
            let mut slot = self.slot.lock();
            let Some(transport) = slot.as_mut() else {
                return Poll::Idle;
            };
            read_burst(transport.as_mut(), self.max_reads, self.read_timeout)
        };

        if burst.faulted {
            self.stats.faults += 1;
        }
        if burst.disconnected {
            debug!("Controller handle is dead, flagging for reopen");
            self.state.flag_controller_fault();
        }
        if burst.data.is_empty() {
            return if burst.faulted { Poll::Faulted(0) } else { Poll::Read(0) };
        }

        self.stats.bytes += burst.data.len() as u64;
        trace!("Burst of {} bytes: {}", burst.data.len(), format_hex(&burst.data));

        let mut count = 0;
        for event in decode(&burst.data) {
            debug!("RECEIVED: {}", event);
            if self.events.push(event).is_err() {
                return Poll::Closed;
            }
            count += 1;
        }
        self.stats.events += count as u64;

        if burst.faulted {
            Poll::Faulted(count)
        } else {
            Poll::Read(count)
        }
    }

    /// Loop until `stop` is set or the queue closes
    pub fn run(mut self, stop: Arc<AtomicBool>) -> ReaderStats {
        info!("Reader started");

        while !stop.load(Ordering::Acquire) {
            match self.poll_once() {
                Poll::Read(_) => {}
                Poll::Idle | Poll::Faulted(_) => thread::sleep(self.idle_poll),
                Poll::Closed => {
                    warn!("Event queue closed, reader exiting");
                    break;
                }
            }
        }

        info!(
            "Reader stopped: {} bytes, {} events, {} faulted bursts",
            self.stats.bytes, self.stats.events, self.stats.faults
        );
        self.stats
    }

    /// Start the loop on a dedicated thread
    pub fn spawn(self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<ReaderStats>> {
        thread::Builder::new()
            .name("podbridge-reader".to_string())
            .spawn(move || self.run(stop))
    }
}
