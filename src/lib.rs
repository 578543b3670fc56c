#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]

#[cfg(feature = "pair")]
mod ca;
#[cfg(feature = "usb")]
pub mod device;
pub mod lockdown;
pub mod mux;
pub mod pair_record;
mod tls;
#[cfg(feature = "usb")]
pub mod usb;

pub mod services;

#[cfg(feature = "usb")]
pub use device::Device;
pub use lockdown::LockdownClient;
pub use pair_record::PairRecord;

use std::io::{self, BufWriter};

use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A trait combining all required characteristics for a device communication
/// stream.
///
/// Anything that can carry bytes to and from the device qualifies: a mux
/// socket, a TLS session layered over one, or an in-memory pipe in tests.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Largest framed plist message accepted from a device.
///
/// Inbound frames claiming more than this are rejected before allocation.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Error type shared by every layer of the crate
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("no matching device")]
    NoDevice,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughData(usize, usize),
    #[error("bad version header from device")]
    BadHeader,
    #[error("operation timed out")]
    Timeout,
    #[error("mux transport failure: {0}")]
    MuxError(String),
    #[error("plist failure: {0}")]
    PlistError(String),
    #[error("TLS failure: {0}")]
    SslError(String),
    #[error("pairing trust dialog pending on device")]
    PairingDialogResponsePending,
    #[error("pair record is missing or malformed")]
    InvalidPairRecord,
    #[error("device is locked with a passcode")]
    PasswordProtected,
    #[error("unexpected service type")]
    InvalidService,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unknown error `{0}` returned from device")]
    Unknown(String),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Error::ConnectionClosed,
            _ => Error::MuxError(value.to_string()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::ConnectionClosed => io::ErrorKind::ConnectionReset,
            Error::InvalidArg => io::ErrorKind::InvalidInput,
            Error::NotEnoughData(_, _) => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value.to_string())
    }
}

impl From<plist::Error> for Error {
    fn from(value: plist::Error) -> Self {
        Error::PlistError(value.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(value: rustls::Error) -> Self {
        Error::SslError(value.to_string())
    }
}

impl Error {
    /// Maps an `Error` string reported by lockdownd to a typed error.
    ///
    /// Strings without a known mapping are preserved verbatim in `Unknown`.
    pub(crate) fn from_lockdown_string(e: &str) -> Self {
        match e {
            "PairingDialogResponsePending" => Error::PairingDialogResponsePending,
            "PasswordProtected" => Error::PasswordProtected,
            "InvalidService" => Error::InvalidService,
            "InvalidHostID" | "InvalidPairRecord" => Error::InvalidPairRecord,
            _ => Error::Unknown(e.to_string()),
        }
    }
}

/// Serialization format for a property list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlistFormat {
    Xml,
    /// Apple binary plist, `bplist00`
    Binary,
}

/// Serializes a plist value to bytes in the requested format.
pub fn encode_plist(value: &plist::Value, format: PlistFormat) -> Result<Vec<u8>, Error> {
    let buf = Vec::new();
    let mut writer = BufWriter::new(buf);
    match format {
        PlistFormat::Xml => value.to_writer_xml(&mut writer)?,
        PlistFormat::Binary => value.to_writer_binary(&mut writer)?,
    }
    writer
        .into_inner()
        .map_err(|e| Error::PlistError(e.to_string()))
}

/// Parses bytes as a plist value. Both XML and `bplist00` are accepted; the
/// format is detected from the payload itself.
pub fn decode_plist(bytes: &[u8]) -> Result<plist::Value, Error> {
    Ok(plist::from_bytes(bytes)?)
}

/// The transport a [`ServiceStream`] is currently speaking over.
///
/// Lockdown upgrades a plain stream to TLS mid-connection and may downgrade
/// it again on `StopSession`, so both shapes have to be representable.
#[derive(Debug)]
enum Transport {
    Plain(Box<dyn ReadWrite>),
    Secure(Box<tokio_rustls::client::TlsStream<Box<dyn ReadWrite>>>),
}

impl Transport {
    fn stream(&mut self) -> &mut (dyn ReadWrite) {
        match self {
            Transport::Plain(s) => s.as_mut(),
            Transport::Secure(s) => &mut **s as &mut dyn ReadWrite,
        }
    }
}

/// A length-prefixed plist channel to one service on the device.
///
/// Wraps a logical connection (usually a mux socket) and provides the
/// framing shared by lockdown and the plist-speaking service clients:
/// a big-endian u32 length followed by an XML or binary plist payload.
#[derive(Debug)]
pub struct ServiceStream {
    transport: Option<Transport>,
    label: String,
}

impl ServiceStream {
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            transport: Some(Transport::Plain(socket)),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the stream has been upgraded to TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self.transport, Some(Transport::Secure(_)))
    }

    /// Consumes the stream and returns the plain socket, if the stream is
    /// not currently secured.
    pub fn into_inner(self) -> Option<Box<dyn ReadWrite>> {
        match self.transport {
            Some(Transport::Plain(s)) => Some(s),
            _ => None,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut (dyn ReadWrite), Error> {
        match &mut self.transport {
            Some(t) => Ok(t.stream()),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Sends one framed message: big-endian u32 length, then the payload.
    pub async fn send_framed(&mut self, payload: &[u8]) -> Result<(), Error> {
        let stream = self.stream_mut()?;
        let len = payload.len() as u32;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads one framed message, looping until the full payload arrived.
    pub async fn read_framed(&mut self) -> Result<Vec<u8>, Error> {
        let stream = self.stream_mut()?;
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::PlistError(format!(
                "framed payload of {len} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap"
            )));
        }
        let mut buf = vec![0; len as usize];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Sends a plist message in XML form.
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), Error> {
        debug!("Sending plist: {message:?}");
        let payload = encode_plist(&message, PlistFormat::Xml)?;
        self.send_framed(&payload).await
    }

    /// Sends a plist message in binary (`bplist00`) form.
    pub async fn send_binary_plist(&mut self, message: plist::Value) -> Result<(), Error> {
        debug!("Sending binary plist: {message:?}");
        let payload = encode_plist(&message, PlistFormat::Binary)?;
        self.send_framed(&payload).await
    }

    /// Reads a framed plist message.
    pub async fn read_plist_value(&mut self) -> Result<plist::Value, Error> {
        let buf = self.read_framed().await?;
        decode_plist(&buf)
    }

    /// Reads a framed plist dictionary, surfacing device-reported errors.
    ///
    /// If the message carries an `Error` string it is mapped to a typed
    /// [`Error`]; unknown strings are preserved in [`Error::Unknown`].
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, Error> {
        let value = self.read_plist_value().await?;
        let dict: plist::Dictionary = plist::from_value(&value)?;
        debug!("Received plist: {dict:?}");

        if let Some(e) = dict.get("Error") {
            match e.as_string() {
                Some(e) => return Err(Error::from_lockdown_string(e)),
                None => {
                    warn!("Device reported a non-string error: {e:?}");
                    return Err(Error::Unknown(format!("{e:?}")));
                }
            }
        }
        Ok(dict)
    }

    /// Sends raw bytes, unframed.
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), Error> {
        let stream = self.stream_mut()?;
        stream.write_all(message).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let stream = self.stream_mut()?;
        let mut buf = vec![0; len];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads up to `max_size` bytes, returning whatever arrived first.
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, Error> {
        let stream = self.stream_mut()?;
        let mut buf = vec![0; max_size as usize];
        let len = stream.read(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Upgrades the stream to TLS using the pairing credentials.
    ///
    /// The handshake authenticates us with the host certificate and private
    /// key, and pins the peer to the certificates recorded at pairing time.
    /// Every byte after this call is carried inside the TLS session.
    pub async fn start_session(&mut self, record: &PairRecord) -> Result<(), Error> {
        tls::ensure_crypto_provider();
        let config = tls::client_config(record)?;
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));

        let socket = match self.transport.take() {
            Some(Transport::Plain(s)) => s,
            Some(secure) => {
                self.transport = Some(secure);
                return Err(Error::InvalidArg);
            }
            None => return Err(Error::ConnectionClosed),
        };

        let server_name = rustls::pki_types::ServerName::try_from("Device").unwrap();
        match connector.connect(server_name, socket).await {
            Ok(stream) => {
                self.transport = Some(Transport::Secure(Box::new(stream)));
                Ok(())
            }
            Err(e) => Err(Error::SslError(e.to_string())),
        }
    }

    /// Tears the TLS session down and resumes plaintext framing.
    ///
    /// A close-notify is sent to the device first. No-op on a plain stream.
    pub async fn end_session(&mut self) -> Result<(), Error> {
        match self.transport.take() {
            Some(Transport::Secure(mut stream)) => {
                if let Err(e) = stream.shutdown().await {
                    debug!("TLS shutdown reported {e:?}");
                }
                let (socket, _) = stream.into_inner();
                self.transport = Some(Transport::Plain(socket));
                Ok(())
            }
            Some(plain) => {
                self.transport = Some(plain);
                Ok(())
            }
            None => Err(Error::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dict() -> plist::Value {
        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "QueryType".into());
        dict.insert("Label".into(), "imobile-test".into());
        dict.insert("Answer".into(), 42.into());
        dict.insert("Flag".into(), true.into());
        plist::Value::Dictionary(dict)
    }

    #[test]
    fn plist_codec_round_trips_both_formats() {
        let value = sample_dict();

        let xml = encode_plist(&value, PlistFormat::Xml).unwrap();
        assert_eq!(decode_plist(&xml).unwrap(), value);

        let binary = encode_plist(&value, PlistFormat::Binary).unwrap();
        assert!(binary.starts_with(b"bplist00"));
        assert_eq!(decode_plist(&binary).unwrap(), value);
    }

    #[tokio::test]
    async fn framed_plists_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = ServiceStream::new(Box::new(client), "a");
        let mut b = ServiceStream::new(Box::new(server), "b");

        a.send_plist(sample_dict()).await.unwrap();
        let received = b.read_plist().await.unwrap();
        assert_eq!(plist::Value::Dictionary(received), sample_dict());

        b.send_binary_plist(sample_dict()).await.unwrap();
        let received = a.read_plist_value().await.unwrap();
        assert_eq!(received, sample_dict());
    }

    #[tokio::test]
    async fn framed_read_survives_chunked_delivery() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut stream = ServiceStream::new(Box::new(client), "chunked");

        let payload = encode_plist(&sample_dict(), PlistFormat::Binary).unwrap();
        let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&payload);

        let writer = tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                server.write_all(chunk).await.unwrap();
                server.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            server
        });

        let received = stream.read_plist_value().await.unwrap();
        assert_eq!(received, sample_dict());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = ServiceStream::new(Box::new(client), "oversize");

        server
            .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        match stream.read_framed().await {
            Err(Error::PlistError(_)) => {}
            other => panic!("expected PlistError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_error_strings_are_mapped() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = ServiceStream::new(Box::new(client), "a");
        let mut b = ServiceStream::new(Box::new(server), "b");

        for (wire, expect_pending) in [
            ("PairingDialogResponsePending", true),
            ("SomethingNew", false),
        ] {
            let mut dict = plist::Dictionary::new();
            dict.insert("Request".into(), "Pair".into());
            dict.insert("Error".into(), wire.into());
            b.send_plist(plist::Value::Dictionary(dict)).await.unwrap();

            match a.read_plist().await {
                Err(Error::PairingDialogResponsePending) if expect_pending => {}
                Err(Error::Unknown(s)) if !expect_pending => assert_eq!(s, wire),
                other => panic!("unexpected mapping for {wire}: {other:?}"),
            }
        }
    }

    #[test]
    fn io_errors_fold_into_wire_kinds() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(Error::from(timeout), Error::Timeout));

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "gone");
        assert!(matches!(Error::from(eof), Error::ConnectionClosed));

        let other = io::Error::other("weird");
        assert!(matches!(Error::from(other), Error::MuxError(_)));
    }
}
