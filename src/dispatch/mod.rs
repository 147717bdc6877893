//! Translator/dispatcher task
//!
//! Drains the event queue in order. Every event is mirrored untouched to the
//! virtual port, then translated and, if the amp is reachable, forwarded to
//! it. Amp-bound messages are never buffered: while the amp is away they
//! are dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::{DispatcherConfig, TranslationConfig};
use crate::midi::{format_hex, MidiEvent};
use crate::ports::{MidiSink, SinkSlot};
use crate::queue::{EventReceiver, Recv};
use crate::state::ConnectivityState;
use crate::translate::{AmpPlan, Translator};

#[cfg(test)]
mod tests;

/// Counters reported when the dispatcher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub mirrored: u64,
    pub sent_to_amp: u64,
    pub duplicates: u64,
    /// Events whose amp messages were dropped because the amp was away
    pub dropped: u64,
}

pub struct Dispatcher {
    translator: Translator,
    state: Arc<ConnectivityState>,
    amp: SinkSlot,
    virtual_out: Option<Box<dyn MidiSink>>,
    seen_generation: u64,
    recv_timeout: Duration,
    backlog_warn_depth: usize,
    backlog_warned: bool,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        translation: TranslationConfig,
        config: &DispatcherConfig,
        state: Arc<ConnectivityState>,
        amp: SinkSlot,
        virtual_out: Option<Box<dyn MidiSink>>,
    ) -> Self {
        let seen_generation = state.generation();
        Self {
            translator: Translator::new(translation),
            state,
            amp,
            virtual_out,
            seen_generation,
            recv_timeout: Duration::from_millis(config.recv_timeout_ms),
            backlog_warn_depth: config.backlog_warn_depth,
            backlog_warned: false,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Process one event: mirror, translate, forward
    pub fn handle_event(&mut self, event: &MidiEvent) {
        self.stats.received += 1;
        self.sync_generation();

        if let Some(virtual_out) = self.virtual_out.as_mut() {
            match virtual_out.send(&event.raw) {
                Ok(()) => self.stats.mirrored += 1,
                Err(e) => warn!("Virtual port '{}': {:#}", virtual_out.name(), e),
            }
        }

        let messages = match self.translator.plan(event) {
            AmpPlan::Duplicate(message) => {
                debug!("Skipping duplicate: {}", message);
                self.stats.duplicates += 1;
                return;
            }
            AmpPlan::Send(messages) => messages,
        };

        let mut slot = self.amp.lock();
        let amp = match slot.as_mut() {
            Some(amp) if self.state.amp_present() => amp,
            _ => {
                trace!("Amp not connected, dropping {}", event);
                self.stats.dropped += 1;
                if let Some(last) = messages.into_iter().last() {
                    self.translator.mark_sent(last);
                }
                return;
            }
        };

        for message in messages {
            let bytes = message.encode();
            debug!("SENDING: {} [{}]", message, format_hex(&bytes));
            // Recorded before the send: a failed send still counts as last sent
            self.translator.mark_sent(message);

            if let Err(e) = amp.send(&bytes) {
                // At most once: the rest of this event is abandoned
                warn!("Amp '{}': {:#}", amp.name(), e);
                break;
            }
            self.stats.sent_to_amp += 1;
        }
    }

    /// A reconnect happened since the last event: forget what the old amp saw
    fn sync_generation(&mut self) {
        let generation = self.state.generation();
        if generation != self.seen_generation {
            debug!("Reconnect generation {} -> {}, clearing last sent", self.seen_generation, generation);
            self.seen_generation = generation;
            self.translator.clear();
        }
    }

    fn check_backlog(&mut self, depth: usize) {
        if self.backlog_warn_depth == 0 {
            return;
        }
        if !self.backlog_warned && depth >= self.backlog_warn_depth {
            warn!("Event queue backlog: {} events waiting", depth);
            self.backlog_warned = true;
        } else if self.backlog_warned && depth < self.backlog_warn_depth / 2 {
            info!("Event queue backlog cleared");
            self.backlog_warned = false;
        }
    }

    /// Run until shutdown is signalled or every producer is gone
    pub async fn run(
        mut self,
        mut events: EventReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> DispatchStats {
        info!("Dispatcher started");
        let started = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                recv = events.recv_timeout(self.recv_timeout) => match recv {
                    Recv::Event(event) => {
                        self.check_backlog(events.depth());
                        self.handle_event(&event);
                    }
                    Recv::Timeout => trace!("Dispatcher idle"),
                    Recv::Closed => {
                        info!("Event queue closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { self.stats.received as f64 / elapsed } else { 0.0 };
        info!(
            "Dispatcher stopped: {} received ({:.1}/s), {} sent to amp, {} duplicates, {} dropped",
            self.stats.received, rate, self.stats.sent_to_amp, self.stats.duplicates, self.stats.dropped
        );
        self.stats
    }
}
