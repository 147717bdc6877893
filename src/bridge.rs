//! Bridge supervisor
//!
//! Acquires the devices, wires the reader thread, dispatcher and watcher
//! together and tears everything down again on shutdown.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ControllerConfig};
use crate::dispatch::Dispatcher;
use crate::ports::{self, AmpOutput, MidiSink, SinkSlot, VirtualPorts};
use crate::queue::event_queue;
use crate::reader::ReaderLoop;
use crate::state::{ConnectivityState, Presence};
use crate::transport::{self, ControllerSlot, ControllerTransport, UsbController};
use crate::watcher::{DeviceWatcher, PresenceProbe, Reconnector};

/// Presence probe backed by libusb enumeration and the MIDI output list
pub struct SystemProbe {
    vendor_id: u16,
    product_id: u16,
    amp_pattern: String,
}

impl SystemProbe {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            vendor_id: config.controller.vendor_id,
            product_id: config.controller.product_id,
            amp_pattern: config.amp.port_name.clone(),
        }
    }
}

impl PresenceProbe for SystemProbe {
    fn controller_present(&mut self) -> Result<bool> {
        Ok(transport::controller_present(self.vendor_id, self.product_id)?)
    }

    fn amp_present(&mut self) -> Result<bool> {
        ports::amp_port_present(&self.amp_pattern)
    }
}

/// Opens the amp output matching a pattern; `None` when nothing matches
pub type AmpOpener = Box<dyn FnMut(&str) -> Result<Option<Box<dyn MidiSink>>> + Send>;

/// Opens and claims the controller
pub type ControllerOpener =
    Box<dyn FnMut(&ControllerConfig) -> Result<Box<dyn ControllerTransport>> + Send>;

/// Owns handle open/close for both devices
///
/// Every open first takes the previous handle out of its slot and releases
/// it, so at most one live handle exists per device.
pub struct DeviceManager {
    controller_config: ControllerConfig,
    amp_pattern: String,
    controller: ControllerSlot,
    amp: SinkSlot,
    open_amp_port: AmpOpener,
    open_controller_device: ControllerOpener,
}

impl DeviceManager {
    /// Manager backed by midir and libusb
    pub fn new(config: &AppConfig, controller: ControllerSlot, amp: SinkSlot) -> Self {
        Self::with_openers(
            config,
            controller,
            amp,
            Box::new(|pattern| {
                Ok(AmpOutput::open(pattern)?.map(|amp| Box::new(amp) as Box<dyn MidiSink>))
            }),
            Box::new(|config| {
                Ok(Box::new(UsbController::open(config)?) as Box<dyn ControllerTransport>)
            }),
        )
    }

    pub fn with_openers(
        config: &AppConfig,
        controller: ControllerSlot,
        amp: SinkSlot,
        open_amp_port: AmpOpener,
        open_controller_device: ControllerOpener,
    ) -> Self {
        Self {
            controller_config: config.controller.clone(),
            amp_pattern: config.amp.port_name.clone(),
            controller,
            amp,
            open_amp_port,
            open_controller_device,
        }
    }

    /// (Re)open the amp output; `Ok(false)` when no port matches
    pub fn open_amp(&mut self) -> Result<bool> {
        self.close_amp();

        match (self.open_amp_port)(&self.amp_pattern)? {
            Some(amp) => {
                *self.amp.lock() = Some(amp);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// (Re)open and claim the controller
    ///
    /// On failure the slot stays empty.
    pub fn open_controller(&mut self) -> Result<()> {
        self.close_controller();

        let controller = (self.open_controller_device)(&self.controller_config)?;
        *self.controller.lock() = Some(controller);
        Ok(())
    }

    pub fn close_controller(&self) {
        // Take first so the slot lock is not held during release
        let previous = self.controller.lock().take();
        if let Some(mut controller) = previous {
            controller.release();
        }
    }

    pub fn close_amp(&self) {
        let previous = self.amp.lock().take();
        if let Some(amp) = previous {
            debug!("Closing amp output '{}'", amp.name());
        }
    }
}

impl Reconnector for DeviceManager {
    fn reconnect(&mut self, reopen_controller: bool) -> Result<()> {
        if !self.open_amp()? {
            anyhow::bail!("no MIDI output matches '{}'", self.amp_pattern);
        }
        if reopen_controller {
            self.open_controller().context("Failed to reopen controller")?;
        }
        Ok(())
    }

    fn on_controller_lost(&mut self) {
        warn!("Controller disconnected");
        self.close_controller();
    }

    fn on_amp_lost(&mut self) {
        warn!("Amp disconnected");
        self.close_amp();
    }
}

fn open_virtual_port(config: &AppConfig) -> Option<Box<dyn MidiSink>> {
    if !config.virtual_port.enabled {
        info!("Virtual port disabled");
        return None;
    }

    match VirtualPorts::create(&config.virtual_port.name) {
        Ok(ports) => Some(Box::new(ports)),
        Err(e) => {
            warn!("Virtual port unavailable, continuing without it: {:#}", e);
            None
        }
    }
}

/// Run the bridge until `shutdown` resolves
pub async fn run(config: AppConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    if config.startup_delay_ms > 0 {
        info!("Waiting {} ms for devices to settle", config.startup_delay_ms);
        tokio::time::sleep(Duration::from_millis(config.startup_delay_ms)).await;
    }

    let virtual_out = open_virtual_port(&config);

    let controller_slot: ControllerSlot = Arc::new(Mutex::new(None));
    let amp_slot: SinkSlot = Arc::new(Mutex::new(None));
    let mut manager = DeviceManager::new(&config, controller_slot.clone(), amp_slot.clone());

    let amp_connected = match manager.open_amp() {
        Ok(connected) => connected,
        Err(e) => {
            warn!("Amp could not be opened: {:#}", e);
            false
        }
    };
    if amp_connected {
        info!("✅ Amp connected");
    } else {
        warn!("Amp not connected (waiting for a port matching '{}')", config.amp.port_name);
    }

    if let Err(e) = manager.open_controller() {
        error!("Controller not available: {:#}", e);
        return Err(e.context("Failed to open controller"));
    }
    info!("✅ Controller connected");

    let state = Arc::new(ConnectivityState::new(Presence::new(true, amp_connected)));
    let (events_tx, events_rx) = event_queue();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stop_reader = Arc::new(AtomicBool::new(false));

    let reader = ReaderLoop::new(&config.controller, controller_slot.clone(), state.clone(), events_tx)
        .spawn(stop_reader.clone())
        .context("Failed to start reader thread")?;

    let dispatcher = Dispatcher::new(
        config.translation.clone(),
        &config.dispatcher,
        state.clone(),
        amp_slot.clone(),
        virtual_out,
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(events_rx, shutdown_rx.clone()));

    let watcher = DeviceWatcher::new(&config.watcher, SystemProbe::new(&config), manager, state.clone());
    let watcher_task = tokio::spawn(watcher.run(shutdown_rx));

    info!("Bridge running, press Ctrl+C to stop");
    shutdown.await;

    info!("Shutting down...");
    // Receivers may already be gone if a task ended early
    let _ = shutdown_tx.send(true);
    stop_reader.store(true, Ordering::Release);

    if let Err(e) = watcher_task.await {
        warn!("Watcher task failed: {}", e);
    }
    if let Err(e) = dispatcher_task.await {
        warn!("Dispatcher task failed: {}", e);
    }
    match tokio::task::spawn_blocking(move || reader.join()).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => warn!("Reader thread panicked"),
        Err(e) => warn!("Failed to join reader thread: {}", e),
    }

    let controller = controller_slot.lock().take();
    if let Some(mut controller) = controller {
        controller.release();
    }
    let amp = amp_slot.lock().take();
    drop(amp);

    info!("All devices released");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result as TransportResult, TransportError};
    use crate::watcher::WatchPoll;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Transport that logs its release under a name
    struct LoggedTransport {
        name: String,
        log: Log,
    }

    impl ControllerTransport for LoggedTransport {
        fn read_chunk(&mut self, _timeout: Duration) -> TransportResult<Vec<u8>> {
            Err(TransportError::Timeout)
        }

        fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
            Ok(data.len())
        }

        fn release(&mut self) {
            self.log.lock().push(format!("release {}", self.name));
        }
    }

    /// Sink that logs when it is dropped
    struct LoggedSink {
        name: String,
        log: Log,
    }

    impl MidiSink for LoggedSink {
        fn send(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    impl Drop for LoggedSink {
        fn drop(&mut self) {
            self.log.lock().push(format!("drop {}", self.name));
        }
    }

    struct Rig {
        manager: DeviceManager,
        controller: ControllerSlot,
        amp: SinkSlot,
        log: Log,
        amp_available: Arc<AtomicBool>,
        controller_error: Arc<Mutex<Option<TransportError>>>,
    }

    /// Manager whose openers log each open and see whether the slot was emptied
    fn rig() -> Rig {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let controller: ControllerSlot = Arc::new(Mutex::new(None));
        let amp: SinkSlot = Arc::new(Mutex::new(None));
        let amp_available = Arc::new(AtomicBool::new(true));
        let controller_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let amp_opener: AmpOpener = {
            let (log, slot, available) = (log.clone(), amp.clone(), amp_available.clone());
            let mut opened = 0;
            Box::new(move |_pattern| {
                log.lock().push(format!("open amp (slot empty: {})", slot.lock().is_none()));
                if !available.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                opened += 1;
                let sink: Box<dyn MidiSink> = Box::new(LoggedSink {
                    name: format!("amp{}", opened),
                    log: log.clone(),
                });
                Ok(Some(sink))
            })
        };
        let controller_opener: ControllerOpener = {
            let (log, slot, error) = (log.clone(), controller.clone(), controller_error.clone());
            let mut opened = 0;
            Box::new(move |_config| {
                log.lock().push(format!(
                    "open controller (slot empty: {})",
                    slot.lock().is_none()
                ));
                if let Some(e) = error.lock().take() {
                    return Err(e.into());
                }
                opened += 1;
                let transport: Box<dyn ControllerTransport> = Box::new(LoggedTransport {
                    name: format!("controller{}", opened),
                    log: log.clone(),
                });
                Ok(transport)
            })
        };

        let manager = DeviceManager::with_openers(
            &AppConfig::default(),
            controller.clone(),
            amp.clone(),
            amp_opener,
            controller_opener,
        );
        Rig { manager, controller, amp, log, amp_available, controller_error }
    }

    struct CountingTransport(Arc<AtomicUsize>);

    impl ControllerTransport for CountingTransport {
        fn read_chunk(&mut self, _timeout: Duration) -> TransportResult<Vec<u8>> {
            Err(TransportError::Timeout)
        }

        fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
            Ok(data.len())
        }

        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NamedSink;

    impl MidiSink for NamedSink {
        fn send(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "KATANA MIDI 1"
        }
    }

    #[test]
    fn test_loss_handlers_empty_the_slots() {
        let releases = Arc::new(AtomicUsize::new(0));
        let transport: Box<dyn ControllerTransport> = Box::new(CountingTransport(releases.clone()));
        let sink: Box<dyn MidiSink> = Box::new(NamedSink);
        let controller: ControllerSlot = Arc::new(Mutex::new(Some(transport)));
        let amp: SinkSlot = Arc::new(Mutex::new(Some(sink)));
        let mut manager = DeviceManager::new(&AppConfig::default(), controller.clone(), amp.clone());

        manager.on_controller_lost();
        manager.on_amp_lost();
        // Closing an empty slot is a no-op
        manager.on_controller_lost();

        assert!(controller.lock().is_none());
        assert!(amp.lock().is_none());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reconnect_releases_old_handles_before_opening() {
        let mut rig = rig();

        rig.manager.reconnect(true).unwrap();
        rig.manager.reconnect(true).unwrap();

        assert_eq!(
            *rig.log.lock(),
            vec![
                "open amp (slot empty: true)",
                "open controller (slot empty: true)",
                "drop amp1",
                "open amp (slot empty: true)",
                "release controller1",
                "open controller (slot empty: true)",
            ]
        );
        assert_eq!(rig.amp.lock().as_ref().map(|a| a.name().to_string()), Some("amp2".into()));
        assert!(rig.controller.lock().is_some());
    }

    #[test]
    fn test_reconnect_without_controller_reopen_keeps_claim() {
        let mut rig = rig();

        rig.manager.reconnect(true).unwrap();
        rig.manager.reconnect(false).unwrap();

        let log = rig.log.lock();
        assert!(!log.iter().any(|line| line == "release controller1"));
        assert!(rig.controller.lock().is_some());
    }

    #[test]
    fn test_missing_amp_bails_before_controller() {
        let mut rig = rig();
        rig.amp_available.store(false, Ordering::SeqCst);

        let err = rig.manager.reconnect(true).unwrap_err();

        assert!(err.to_string().contains("no MIDI output matches"));
        assert_eq!(*rig.log.lock(), vec!["open amp (slot empty: true)"]);
        assert!(rig.amp.lock().is_none());
        assert!(rig.controller.lock().is_none());
    }

    /// Presence that never changes
    struct FixedProbe(Presence);

    impl PresenceProbe for FixedProbe {
        fn controller_present(&mut self) -> Result<bool> {
            Ok(self.0.controller)
        }

        fn amp_present(&mut self) -> Result<bool> {
            Ok(self.0.amp)
        }
    }

    #[test]
    fn test_controller_reopen_failure_leaves_slot_empty() {
        let mut rig = rig();
        rig.manager.reconnect(true).unwrap();
        *rig.controller_error.lock() = Some(TransportError::Usb(rusb::Error::Busy));

        let state = Arc::new(ConnectivityState::new(Presence::new(true, false)));
        let mut watcher = DeviceWatcher::new(
            &AppConfig::default().watcher,
            FixedProbe(Presence::new(true, true)),
            rig.manager,
            state.clone(),
        );

        assert_eq!(watcher.poll_once(), WatchPoll::ReconnectFailed);
        assert!(rig.controller.lock().is_none());
        assert!(rig.log.lock().contains(&"release controller1".to_string()));
        assert_eq!(state.generation(), 0);

        // Retried on the next poll and succeeds
        assert!(matches!(watcher.poll_once(), WatchPoll::Reconnected { generation: 1, .. }));
        assert!(rig.controller.lock().is_some());
    }

    #[test]
    fn test_controller_permission_failure_is_abandoned() {
        let rig = rig();
        *rig.controller_error.lock() = Some(TransportError::PermissionDenied);

        let state = Arc::new(ConnectivityState::new(Presence::new(true, false)));
        let mut watcher = DeviceWatcher::new(
            &AppConfig::default().watcher,
            FixedProbe(Presence::new(true, true)),
            rig.manager,
            state.clone(),
        );

        assert_eq!(watcher.poll_once(), WatchPoll::ReconnectAbandoned);
        assert_eq!(watcher.poll_once(), WatchPoll::Unchanged);
        assert!(rig.controller.lock().is_none());
        assert_eq!(state.generation(), 0);
    }
}
