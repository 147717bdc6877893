//! Device watcher
//!
//! Polls the USB bus and the MIDI output list, publishes presence into the
//! shared [`ConnectivityState`] and drives reconnects. A reconnect fires
//! when a poll sees any presence flip and both ends are now present, or when
//! the reader reports a dead controller handle. Probe and reconnect failures
//! are logged and the next tick tries again, except a permission failure,
//! which waits for the next presence change.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerReopen, WatcherConfig};
use crate::error::TransportError;
use crate::state::{ConnectivityState, Presence};

/// Source of presence observations
pub trait PresenceProbe: Send {
    /// Whether the controller is on the USB bus
    fn controller_present(&mut self) -> Result<bool>;

    /// Whether an amp output port is listed
    fn amp_present(&mut self) -> Result<bool>;
}

/// Opens and closes device handles on the watcher's behalf
pub trait Reconnector: Send {
    /// Release and reopen the amp, and the controller when asked
    fn reconnect(&mut self, reopen_controller: bool) -> Result<()>;

    /// Controller went away: close its handle
    fn on_controller_lost(&mut self);

    /// Amp went away: close its handle
    fn on_amp_lost(&mut self);
}

/// Outcome of one watcher poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPoll {
    Unchanged,
    /// Presence changed but a reconnect was not (yet) possible
    Changed(Presence),
    Reconnected { presence: Presence, generation: u64 },
    ReconnectFailed,
    /// The reconnect needs USB access; not retried until presence changes
    ReconnectAbandoned,
    ProbeFailed,
}

pub struct DeviceWatcher<P, R> {
    probe: P,
    reconnector: R,
    state: Arc<ConnectivityState>,
    policy: ControllerReopen,
    poll_interval: Duration,
    last: Presence,
    /// A reconnect failed and is retried on the next poll
    pending_reconnect: bool,
    /// The controller handle was closed since it was last opened
    controller_stale: bool,
}

impl<P: PresenceProbe, R: Reconnector> DeviceWatcher<P, R> {
    pub fn new(config: &WatcherConfig, probe: P, reconnector: R, state: Arc<ConnectivityState>) -> Self {
        let last = state.snapshot();
        Self {
            probe,
            reconnector,
            state,
            policy: config.controller_reopen,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            last,
            pending_reconnect: false,
            controller_stale: !last.controller,
        }
    }

    fn observe(&mut self) -> Result<Presence> {
        Ok(Presence {
            controller: self.probe.controller_present()?,
            amp: self.probe.amp_present()?,
        })
    }

    /// Run one presence check and act on it
    pub fn poll_once(&mut self) -> WatchPoll {
        let now = match self.observe() {
            Ok(presence) => presence,
            Err(e) => {
                warn!("Presence check failed: {:#}", e);
                return WatchPoll::ProbeFailed;
            }
        };

        let before = self.last;
        let changed = now != before;

        // Replugged between two polls: the handle is dead but presence never flipped
        if self.state.take_controller_fault() && before.controller && now.controller {
            warn!("Controller handle went dead, reopening");
            self.reconnector.on_controller_lost();
            self.controller_stale = true;
            self.pending_reconnect = true;
        }

        if changed {
            info!(
                "Connectivity: controller {} -> {}, amp {} -> {}",
                label(before.controller),
                label(now.controller),
                label(before.amp),
                label(now.amp)
            );
            self.last = now;
            self.state.store(now);

            if before.controller && !now.controller {
                self.reconnector.on_controller_lost();
                self.controller_stale = true;
            }
            if before.amp && !now.amp {
                self.reconnector.on_amp_lost();
            }
        } else if !self.pending_reconnect {
            return WatchPoll::Unchanged;
        }

        if !now.both() {
            self.pending_reconnect = false;
            return WatchPoll::Changed(now);
        }

        let reopen_controller = match self.policy {
            ControllerReopen::Observed => now.controller,
            ControllerReopen::PreviouslyConnected => self.controller_stale,
        };

        debug!("Reconnecting (reopen controller: {})", reopen_controller);
        match self.reconnector.reconnect(reopen_controller) {
            Ok(()) => {
                self.pending_reconnect = false;
                if reopen_controller {
                    self.controller_stale = false;
                }
                // Faults raised against the replaced handle
                self.state.take_controller_fault();
                let generation = self.state.bump_generation();
                info!("Reconnected (generation {})", generation);
                WatchPoll::Reconnected { presence: now, generation }
            }
            Err(e) if permission_denied(&e) => {
                error!("Reconnect abandoned until a device is replugged: {:#}", e);
                self.pending_reconnect = false;
                WatchPoll::ReconnectAbandoned
            }
            Err(e) => {
                warn!("Reconnect failed, retrying next poll: {:#}", e);
                self.pending_reconnect = true;
                WatchPoll::ReconnectFailed
            }
        }
    }

    /// Poll on a fixed interval until shutdown
    ///
    /// Each poll enumerates USB and may open devices, so it runs on the
    /// blocking pool.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>)
    where
        P: 'static,
        R: 'static,
    {
        info!("Device watcher started (every {:?})", self.poll_interval);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup has just probed
        ticker.tick().await;

        let mut watcher = self;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let polled = tokio::task::spawn_blocking(move || {
                        let outcome = watcher.poll_once();
                        (watcher, outcome)
                    })
                    .await;

                    match polled {
                        Ok((returned, outcome)) => {
                            debug!("Watcher poll: {:?}", outcome);
                            watcher = returned;
                        }
                        Err(e) => {
                            error!("Watcher poll panicked, stopping watcher: {}", e);
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Device watcher stopped");
    }
}

fn permission_denied(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<TransportError>(),
            Some(TransportError::PermissionDenied)
        )
    })
}

fn label(present: bool) -> &'static str {
    if present {
        "connected"
    } else {
        "disconnected"
    }
}
