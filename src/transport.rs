//! USB bulk transport for the controller
//!
//! The POD exposes its MIDI stream on a pair of bulk endpoints that only
//! exist on one alternate setting of interface 0. `UsbController` opens and
//! claims the device; `read_burst` implements the bounded read policy the
//! reader loop relies on.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::error::{Result, TransportError};
use crate::midi::{format_hex, MidiMessage};

const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Capabilities the reader and supervisor need from an open controller
pub trait ControllerTransport: Send {
    /// Read one chunk. A timeout with no data is `Err(TransportError::Timeout)`
    /// or `Ok` with an empty vector; callers treat both as "nothing yet".
    fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Write raw bytes to the controller's write endpoint
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Release the device. Safe to call more than once.
    fn release(&mut self);
}

/// Shared controller handle; the watcher swaps it, the reader borrows it
pub type ControllerSlot = Arc<Mutex<Option<Box<dyn ControllerTransport>>>>;

/// Result of one bounded read call
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Burst {
    pub data: Vec<u8>,
    /// A transport error (not a timeout) cut the burst short
    pub faulted: bool,
    /// That error says the device is gone
    pub disconnected: bool,
}

/// Read up to `max_reads` chunks, concatenating what arrives
///
/// Stops at the first empty read or timeout. Any other error ends the burst
/// with whatever was accumulated; it is never propagated.
pub fn read_burst<T>(transport: &mut T, max_reads: usize, timeout: Duration) -> Burst
where
    T: ControllerTransport + ?Sized,
{
    let mut burst = Burst::default();

    for _ in 0..max_reads {
        match transport.read_chunk(timeout) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => burst.data.extend_from_slice(&chunk),
            Err(e) if e.is_timeout() => break,
            Err(e) => {
                debug!(
                    "Controller read failed after {} bytes: {}",
                    burst.data.len(),
                    e
                );
                burst.faulted = true;
                burst.disconnected = e.is_disconnect();
                break;
            }
        }
    }

    burst
}

/// An opened and claimed POD controller
pub struct UsbController {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    interface: u8,
    read_endpoint: u8,
    write_endpoint: u8,
    chunk_size: usize,
    claimed: bool,
    /// Kernel driver was detached on open and must be reattached on release
    detached_kernel_driver: bool,
    released: bool,
}

impl UsbController {
    /// Open, reset and claim the controller, then send a MIDI reset
    pub fn open(config: &ControllerConfig) -> Result<Self> {
        let device = find_device(config.vendor_id, config.product_id)?.ok_or(
            TransportError::DeviceNotFound {
                vendor_id: config.vendor_id,
                product_id: config.product_id,
            },
        )?;

        let mut handle = device.open()?;
        let detached_kernel_driver = detach_kernel_driver(&mut handle, config.interface)?;

        // From here on Drop takes care of reattaching the kernel driver
        let mut controller = Self {
            handle,
            interface: config.interface,
            read_endpoint: config.read_endpoint,
            write_endpoint: config.write_endpoint,
            chunk_size: config.chunk_size,
            claimed: false,
            detached_kernel_driver,
            released: false,
        };

        controller.handle.reset()?;

        if let Err(e) = controller.handle.set_active_configuration(config.configuration) {
            warn!(
                "Could not select configuration {} (continuing): {}",
                config.configuration, e
            );
        }

        controller
            .handle
            .claim_interface(config.interface)
            .map_err(|source| match source {
                rusb::Error::Access => TransportError::PermissionDenied,
                source => TransportError::ClaimFailed {
                    interface: config.interface,
                    source,
                },
            })?;
        controller.claimed = true;

        controller
            .handle
            .set_alternate_setting(config.interface, config.alt_setting)?;

        let endpoints = endpoint_addresses(&device, config.interface, config.alt_setting)?;
        for address in [config.read_endpoint, config.write_endpoint] {
            if !endpoints.contains(&address) {
                return Err(TransportError::EndpointMissing {
                    address,
                    interface: config.interface,
                    alt_setting: config.alt_setting,
                });
            }
        }
        debug!(
            "Controller endpoints: read=0x{:02X} write=0x{:02X} (available: {})",
            config.read_endpoint,
            config.write_endpoint,
            format_hex(&endpoints)
        );

        if config.send_reset_on_open {
            controller.write(&MidiMessage::SystemReset.encode())?;
        }

        info!(
            "Controller {:04x}:{:04x} claimed (interface {}, alt setting {})",
            config.vendor_id, config.product_id, config.interface, config.alt_setting
        );

        Ok(controller)
    }
}

impl ControllerTransport for UsbController {
    fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        // libusb treats a zero timeout as "wait forever"
        let timeout = timeout.max(Duration::from_millis(1));

        let n = self.handle.read_bulk(self.read_endpoint, &mut buf, timeout)?;
        buf.truncate(n);

        if n > 0 {
            trace!("USB RX {} bytes: {}", n, format_hex(&buf));
        }
        Ok(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.handle.write_bulk(self.write_endpoint, data, WRITE_TIMEOUT)?;
        trace!("USB TX {} bytes: {}", n, format_hex(data));
        Ok(n)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.claimed {
            if let Err(e) = self.handle.release_interface(self.interface) {
                debug!("Release of interface {} failed: {}", self.interface, e);
            }
            self.claimed = false;
        }

        if self.detached_kernel_driver {
            match self.handle.attach_kernel_driver(self.interface) {
                Ok(()) => info!("Kernel driver reattached to interface {}", self.interface),
                Err(e) => warn!("Failed to reattach kernel driver: {}", e),
            }
            self.detached_kernel_driver = false;
        }

        debug!("Controller released");
    }
}

impl Drop for UsbController {
    fn drop(&mut self) {
        self.release();
    }
}

/// Detach the kernel driver from `interface` where the platform supports it
///
/// Returns whether a detach happened.
fn detach_kernel_driver(
    handle: &mut rusb::DeviceHandle<rusb::GlobalContext>,
    interface: u8,
) -> Result<bool> {
    if !rusb::supports_detach_kernel_driver() {
        return Ok(false);
    }

    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            handle.detach_kernel_driver(interface)?;
            info!("Detached kernel driver from interface {}", interface);
            Ok(true)
        }
        Ok(false) => Ok(false),
        Err(rusb::Error::NotSupported) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Endpoint addresses declared by one alternate setting
fn endpoint_addresses(
    device: &rusb::Device<rusb::GlobalContext>,
    interface: u8,
    alt_setting: u8,
) -> Result<Vec<u8>> {
    let config = device.active_config_descriptor()?;

    let addresses = config
        .interfaces()
        .flat_map(|iface| iface.descriptors())
        .filter(|desc| desc.interface_number() == interface && desc.setting_number() == alt_setting)
        .flat_map(|desc| {
            desc.endpoint_descriptors()
                .map(|ep| ep.address())
                .collect::<Vec<_>>()
        })
        .collect();

    Ok(addresses)
}

fn find_device(vendor_id: u16, product_id: u16) -> Result<Option<rusb::Device<rusb::GlobalContext>>> {
    for device in rusb::devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                trace!("Skipping device without descriptor: {}", e);
                continue;
            }
        };
        if desc.vendor_id() == vendor_id && desc.product_id() == product_id {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

/// Whether the controller currently shows up on the USB bus
pub fn controller_present(vendor_id: u16, product_id: u16) -> Result<bool> {
    Ok(find_device(vendor_id, product_id)?.is_some())
}

/// Bus locations of every connected device matching the ids (for --list-ports)
pub fn list_controllers(vendor_id: u16, product_id: u16) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for device in rusb::devices()?.iter() {
        if let Ok(desc) = device.device_descriptor() {
            if desc.vendor_id() == vendor_id && desc.product_id() == product_id {
                out.push(format!(
                    "{:04x}:{:04x} bus={} addr={}",
                    vendor_id,
                    product_id,
                    device.bus_number(),
                    device.address()
                ));
            }
        }
    }
    Ok(out)
}
