//! Event queue between the reader loop and the dispatcher
//!
//! Unbounded and strictly FIFO. The depth counter only feeds backlog
//! logging; nothing is ever dropped or coalesced here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::midi::MidiEvent;

/// Create a connected sender/receiver pair
pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        EventSender { tx, depth: depth.clone() },
        EventReceiver { rx, depth },
    )
}

/// The consumer side has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Producer side; cheap to clone
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<MidiEvent>,
    depth: Arc<AtomicUsize>,
}

impl EventSender {
    /// Enqueue an event without blocking
    pub fn push(&self, event: MidiEvent) -> Result<(), QueueClosed> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            QueueClosed
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of a timed wait on the queue
#[derive(Debug)]
pub enum Recv {
    Event(MidiEvent),
    /// Nothing arrived in time; not an error
    Timeout,
    /// Every sender has been dropped and the queue is drained
    Closed,
}

/// Consumer side; owned by the dispatcher
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<MidiEvent>,
    depth: Arc<AtomicUsize>,
}

impl EventReceiver {
    /// Wait up to `timeout` for the next event
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Recv::Event(event)
            }
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Timeout,
        }
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<MidiEvent> {
        let event = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(event)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}
