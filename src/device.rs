//! Handle for one attached device.

use log::debug;

use crate::{
    mux::{MuxSocket, MuxTransport},
    usb::{self, UsbBackend},
    Error,
};

/// An opened Apple mobile device.
///
/// Owns the claimed USB interface and the mux transport multiplexing it.
/// At most one `Device` can exist per physical device: the kernel refuses
/// a second claim on the interface.
///
/// All logical connections obtained from [`Device::connect`] die with the
/// device; any task blocked on one of them is woken with
/// [`Error::ConnectionClosed`].
#[derive(Debug)]
pub struct Device {
    udid: String,
    transport: MuxTransport<UsbBackend>,
}

impl Device {
    /// Opens a device.
    ///
    /// With a udid, enumerates and matches by serial; otherwise the first
    /// attached device wins. Fails with [`Error::NoDevice`] when nothing
    /// matches.
    pub async fn open(udid: Option<&str>) -> Result<Self, Error> {
        let (backend, udid) = UsbBackend::open_matching(udid).await?;
        Ok(Self {
            udid,
            transport: MuxTransport::new(backend),
        })
    }

    /// Opens the device at an explicit bus number and address.
    pub async fn open_at(bus_number: u8, address: u8) -> Result<Self, Error> {
        let (backend, udid) = UsbBackend::open_at(bus_number, address).await?;
        Ok(Self {
            udid,
            transport: MuxTransport::new(backend),
        })
    }

    /// Devices currently attached, without opening any of them.
    pub fn list() -> Result<Vec<usb::DeviceEntry>, Error> {
        usb::list_devices()
    }

    /// The unique device identifier, 40 hex digits, lowercase.
    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Opens a logical connection to a TCP-like port on the device.
    pub async fn connect(&self, port: u16) -> Result<MuxSocket<UsbBackend>, Error> {
        self.transport.connect(port).await
    }

    /// Closes the device: live connections are reset, residual bulk-in
    /// traffic is drained and the USB interface is released.
    ///
    /// Dropping a `Device` without calling this performs the same cleanup
    /// best-effort from a spawned task.
    pub async fn close(self) {
        debug!("Closing device {}", self.udid);
        self.transport.shutdown().await;
    }
}
