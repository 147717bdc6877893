//! Error types for the controller transport.
//!
//! Everything above the transport works with `anyhow`; these variants exist
//! so startup can tell a missing device from a permissions problem, and so
//! the read path can tell a benign timeout from a real fault.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("controller {vendor_id:04x}:{product_id:04x} not found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("failed to claim interface {interface}: {source}")]
    ClaimFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("endpoint 0x{address:02X} not found on interface {interface} alt setting {alt_setting}")]
    EndpointMissing {
        address: u8,
        interface: u8,
        alt_setting: u8,
    },

    #[error("permission denied accessing the controller (check udev rules or run with elevated privileges)")]
    PermissionDenied,

    #[error("read timed out")]
    Timeout,

    #[error("USB error: {0}")]
    Usb(rusb::Error),
}

impl TransportError {
    /// Timeouts are the normal "no data" outcome of a bulk read
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    /// The device behind an open handle has gone away
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Usb(rusb::Error::NoDevice))
    }
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Access => TransportError::PermissionDenied,
            other => TransportError::Usb(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
