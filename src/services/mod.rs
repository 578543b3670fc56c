//! Service clients layered over the core transport.
//!
//! Services are thin: lockdown hands out a port, the device hands out a
//! fresh mux connection to it, and the client speaks its own framing on
//! top (plist messages for most, a binary header for AFC).

#[cfg(feature = "afc")]
pub mod afc;
#[cfg(feature = "notification_proxy")]
pub mod notification_proxy;

use crate::{Error, ServiceStream};

/// A service reachable through lockdown's `StartService`.
pub trait DeviceService: Sized {
    /// The service name as lockdownd knows it.
    fn service_name() -> std::borrow::Cow<'static, str>;

    /// Builds the client over an established, already-upgraded stream.
    #[allow(async_fn_in_trait)]
    async fn from_stream(stream: ServiceStream) -> Result<Self, Error>;

    /// The full dance: a sessioned lockdown client asks for the service,
    /// a fresh connection is opened to the returned port, and when the
    /// device asks for service SSL the stream is TLS-upgraded with the
    /// same pair record before any service traffic flows.
    #[cfg(feature = "usb")]
    #[allow(async_fn_in_trait)]
    async fn connect(
        device: &crate::Device,
        record: &crate::PairRecord,
        label: impl Into<String> + Send,
    ) -> Result<Self, Error> {
        let label = label.into();

        let mut lockdown = crate::LockdownClient::connect(device, label.clone()).await?;
        lockdown.start_session(record).await?;
        let (port, ssl) = lockdown.start_service(Self::service_name()).await?;
        lockdown.close().await;

        let socket = device.connect(port).await?;
        let mut stream = ServiceStream::new(Box::new(socket), label);
        if ssl {
            stream.start_session(record).await?;
        }
        Self::from_stream(stream).await
    }
}
