//! USB backend for Apple mobile devices.
//!
//! Claims the mux interface on a device and exposes the raw bulk pipe the
//! transport multiplexes over. Device setup follows the protocol the device
//! expects: configuration 3, interface 1, a drain of stale bulk-in data and
//! a version handshake before the first mux packet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use nusb::transfer::{Direction, EndpointType, RequestBuffer, TransferError};

use crate::{mux::MuxBackend, Error};

/// Apple's USB vendor ID.
pub const APPLE_VENDOR_ID: u16 = 0x05ac;

/// Product IDs of devices speaking the mux protocol.
pub const MUX_PRODUCT_IDS: std::ops::RangeInclusive<u16> = 0x1290..=0x1293;

const MUX_CONFIGURATION: u8 = 3;
const MUX_INTERFACE: u8 = 1;

const DRAIN_TIMEOUT_MS: u64 = 50;
const DRAIN_ROUNDS: usize = 64;
const HANDSHAKE_TIMEOUT_MS: u64 = 1000;

/// An attached device as seen during enumeration.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// Device serial: the 40 hex digit unique device identifier
    pub udid: String,
    pub bus_number: u8,
    pub address: u8,
}

fn is_mux_device(info: &nusb::DeviceInfo) -> bool {
    info.vendor_id() == APPLE_VENDOR_ID && MUX_PRODUCT_IDS.contains(&info.product_id())
}

/// Scans the USB busses for attached Apple mobile devices.
pub fn list_devices() -> Result<Vec<DeviceEntry>, Error> {
    let devices = nusb::list_devices().map_err(|e| Error::MuxError(e.to_string()))?;
    Ok(devices
        .filter(is_mux_device)
        .map(|info| DeviceEntry {
            udid: info.serial_number().unwrap_or_default().to_lowercase(),
            bus_number: info.bus_number(),
            address: info.device_address(),
        })
        .collect())
}

/// Version handshake exchanged right after the interface is claimed.
///
/// 20 bytes on the wire: major and minor as big-endian u32, then padding.
/// The device echoes the header back; anything but our own version is a
/// protocol mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionHeader {
    pub major: u32,
    pub minor: u32,
}

impl VersionHeader {
    pub(crate) const SIZE: usize = 20;
    pub(crate) const CURRENT: VersionHeader = VersionHeader { major: 1, minor: 0 };

    pub(crate) fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.major.to_be_bytes());
        buf[4..8].copy_from_slice(&self.minor.to_be_bytes());
        buf
    }

    pub(crate) fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::NotEnoughData(buf.len(), Self::SIZE));
        }
        Ok(Self {
            major: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            minor: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

fn transfer_error(e: TransferError) -> Error {
    match e {
        TransferError::Cancelled => Error::Timeout,
        TransferError::Disconnected => Error::NoDevice,
        TransferError::Stall => Error::MuxError("bulk endpoint stalled".into()),
        TransferError::Fault => Error::MuxError("usb fault".into()),
        TransferError::Unknown => Error::MuxError("unknown usb transfer failure".into()),
    }
}

/// A claimed mux interface on one physical device.
///
/// Bulk-in and bulk-out are serialized independently; a reader never blocks
/// a writer.
pub struct UsbBackend {
    interface: nusb::Interface,
    endpoint_in: u8,
    endpoint_out: u8,
    in_lock: tokio::sync::Mutex<()>,
    out_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl UsbBackend {
    /// Opens the first matching device, or the one with the given udid.
    pub async fn open_matching(udid: Option<&str>) -> Result<(Self, String), Error> {
        let devices = nusb::list_devices().map_err(|e| Error::MuxError(e.to_string()))?;
        for info in devices.filter(is_mux_device) {
            let serial = info.serial_number().unwrap_or_default().to_lowercase();
            match udid {
                Some(wanted) if wanted.to_lowercase() != serial => continue,
                _ => return Self::open_info(info).await,
            }
        }
        Err(Error::NoDevice)
    }

    /// Opens a device by its bus number and address.
    pub async fn open_at(bus_number: u8, address: u8) -> Result<(Self, String), Error> {
        let devices = nusb::list_devices().map_err(|e| Error::MuxError(e.to_string()))?;
        for info in devices.filter(is_mux_device) {
            if info.bus_number() == bus_number && info.device_address() == address {
                return Self::open_info(info).await;
            }
        }
        Err(Error::NoDevice)
    }

    async fn open_info(info: nusb::DeviceInfo) -> Result<(Self, String), Error> {
        let udid = info.serial_number().unwrap_or_default().to_lowercase();
        debug!("Opening device {udid}");

        let device = info.open().map_err(|e| Error::MuxError(e.to_string()))?;

        if let Err(e) = device.set_configuration(MUX_CONFIGURATION) {
            // A kernel driver holding the interface blocks the switch
            debug!("Setting configuration failed ({e}), detaching kernel driver");
            if let Err(e) = device.detach_kernel_driver(MUX_INTERFACE) {
                debug!("Kernel driver detach failed: {e}");
            }
            device
                .set_configuration(MUX_CONFIGURATION)
                .map_err(|e| Error::MuxError(format!("cannot select configuration: {e}")))?;
        }

        let interface = device
            .claim_interface(MUX_INTERFACE)
            .map_err(|e| Error::MuxError(format!("cannot claim interface: {e}")))?;

        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for alt in interface.descriptors() {
            for endpoint in alt.endpoints() {
                if endpoint.transfer_type() != EndpointType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In if endpoint_in.is_none() => {
                        endpoint_in = Some(endpoint.address())
                    }
                    Direction::Out if endpoint_out.is_none() => {
                        endpoint_out = Some(endpoint.address())
                    }
                    _ => {}
                }
            }
        }
        let (endpoint_in, endpoint_out) = match (endpoint_in, endpoint_out) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                return Err(Error::MuxError(
                    "interface is missing its bulk endpoints".into(),
                ))
            }
        };

        let backend = Self {
            interface,
            endpoint_in,
            endpoint_out,
            in_lock: tokio::sync::Mutex::new(()),
            out_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        backend.drain().await;
        backend.version_handshake().await?;

        Ok((backend, udid))
    }

    /// Discards whatever a previous user of the pipe left behind.
    pub(crate) async fn drain(&self) {
        for _ in 0..DRAIN_ROUNDS {
            match self.bulk_read(0x10000, DRAIN_TIMEOUT_MS).await {
                Ok(stale) if !stale.is_empty() => {
                    debug!("Drained {} stale bytes", stale.len());
                }
                _ => break,
            }
        }
    }

    async fn version_handshake(&self) -> Result<(), Error> {
        let hello = VersionHeader::CURRENT.serialize();
        self.bulk_write(&hello, HANDSHAKE_TIMEOUT_MS).await?;

        let mut echo = Vec::with_capacity(VersionHeader::SIZE);
        while echo.len() < VersionHeader::SIZE {
            let chunk = self
                .bulk_read(VersionHeader::SIZE - echo.len(), HANDSHAKE_TIMEOUT_MS)
                .await?;
            if chunk.is_empty() {
                return Err(Error::NotEnoughData(echo.len(), VersionHeader::SIZE));
            }
            echo.extend_from_slice(&chunk);
        }

        let version = VersionHeader::parse(&echo)?;
        if version != VersionHeader::CURRENT {
            warn!(
                "Device answered the version handshake with {}.{}",
                version.major, version.minor
            );
            return Err(Error::BadHeader);
        }
        Ok(())
    }
}

impl std::fmt::Debug for UsbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbBackend")
            .field("endpoint_in", &self.endpoint_in)
            .field("endpoint_out", &self.endpoint_out)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MuxBackend for UsbBackend {
    async fn bulk_write(&self, buf: &[u8], timeout_ms: u64) -> Result<usize, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let _guard = self.out_lock.lock().await;
        let transfer = self.interface.bulk_out(self.endpoint_out, buf.to_vec());
        match tokio::time::timeout(Duration::from_millis(timeout_ms), transfer).await {
            Ok(completion) => {
                let response = completion.into_result().map_err(transfer_error)?;
                Ok(response.actual_length())
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn bulk_read(&self, max_len: usize, timeout_ms: u64) -> Result<Vec<u8>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let _guard = self.in_lock.lock().await;
        let transfer = self
            .interface
            .bulk_in(self.endpoint_in, RequestBuffer::new(max_len));
        match tokio::time::timeout(Duration::from_millis(timeout_ms), transfer).await {
            Ok(completion) => completion.into_result().map_err(transfer_error),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&self) {
        // The claimed interface is released when the backend is dropped;
        // from here on the pipe only reports closure.
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_header_round_trips() {
        let wire = VersionHeader::CURRENT.serialize();
        assert_eq!(wire.len(), VersionHeader::SIZE);
        assert_eq!(&wire[0..4], &1u32.to_be_bytes());
        assert_eq!(&wire[4..8], &0u32.to_be_bytes());
        assert!(wire[8..].iter().all(|b| *b == 0));

        let parsed = VersionHeader::parse(&wire).unwrap();
        assert_eq!(parsed, VersionHeader::CURRENT);
    }

    #[test]
    fn version_header_mismatch_is_detectable() {
        let other = VersionHeader { major: 2, minor: 1 };
        let parsed = VersionHeader::parse(&other.serialize()).unwrap();
        assert_ne!(parsed, VersionHeader::CURRENT);
    }

    #[test]
    fn short_version_header_is_rejected() {
        match VersionHeader::parse(&[0u8; 12]) {
            Err(Error::NotEnoughData(12, VersionHeader::SIZE)) => {}
            other => panic!("expected NotEnoughData, got {other:?}"),
        }
    }
}
