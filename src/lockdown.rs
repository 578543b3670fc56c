//! Client for lockdownd, the device's control plane.
//!
//! Lockdown answers on its well-known port with XML plist messages and is
//! the way to everything else: it validates the pairing, starts sessions
//! (optionally upgrading the connection to TLS in-band) and hands out the
//! ports of every other service.

use log::{debug, warn};
use plist::Value;

use crate::{Error, PairRecord, ReadWrite, ServiceStream};

/// TCP-like port lockdownd listens on.
pub const LOCKDOWN_PORT: u16 = 62078;

/// Service type lockdownd must report; anything else means we are not
/// talking to lockdownd at all.
pub const LOCKDOWN_SERVICE_TYPE: &str = "com.apple.mobile.lockdown";

#[cfg(feature = "pair")]
const PAIRING_DIALOG_RETRIES: u32 = 20;
#[cfg(feature = "pair")]
const PAIRING_DIALOG_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// A lockdown control channel.
///
/// The client moves through the session lifecycle: fresh after the service
/// type check, sessioned after [`start_session`](Self::start_session)
/// (secured when the device asks for SSL), and back once
/// [`stop_session`](Self::stop_session) tears the session down. Requests
/// issued concurrently from several tasks serialize on `&mut self`.
#[derive(Debug)]
pub struct LockdownClient {
    stream: ServiceStream,
    session_id: Option<String>,
}

impl LockdownClient {
    /// Connects to lockdownd on an opened device and verifies the service
    /// type.
    #[cfg(feature = "usb")]
    pub async fn connect(
        device: &crate::Device,
        label: impl Into<String>,
    ) -> Result<Self, Error> {
        let socket = device.connect(LOCKDOWN_PORT).await?;
        Self::from_stream(Box::new(socket), label).await
    }

    /// Builds a client over an already established connection and verifies
    /// the service type.
    pub async fn from_stream(
        socket: Box<dyn ReadWrite>,
        label: impl Into<String>,
    ) -> Result<Self, Error> {
        let mut client = Self {
            stream: ServiceStream::new(socket, label),
            session_id: None,
        };

        let service_type = client.query_type().await?;
        if service_type != LOCKDOWN_SERVICE_TYPE {
            warn!("Port {LOCKDOWN_PORT} answered as {service_type:?}");
            return Err(Error::InvalidService);
        }
        Ok(client)
    }

    /// The session identifier assigned by the device, once a session runs.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// True while lockdown traffic is TLS-protected.
    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    fn base_request(&self, request: &str) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert("Label".into(), self.stream.label().into());
        dict.insert("Request".into(), request.into());
        dict
    }

    /// Asks the device what is answering on the lockdown port.
    pub async fn query_type(&mut self) -> Result<String, Error> {
        let req = self.base_request("QueryType");
        self.stream.send_plist(Value::Dictionary(req)).await?;

        let response = self.stream.read_plist().await?;
        match response.get("Type").and_then(|t| t.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(Error::Unknown("QueryType response without a Type".into())),
        }
    }

    /// Fetches a value from the device.
    ///
    /// With no key, the whole domain dictionary is returned; with no
    /// domain, the global one is queried.
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, Error> {
        let mut req = self.base_request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.stream.send_plist(Value::Dictionary(req)).await?;

        let mut response = self.stream.read_plist().await?;
        match response.remove("Value") {
            Some(v) => Ok(v),
            None => Err(Error::Unknown("GetValue response without a Value".into())),
        }
    }

    /// Sets a value on the device.
    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), Error> {
        let mut req = self.base_request("SetValue");
        req.insert("Key".into(), key.into().into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.stream.send_plist(Value::Dictionary(req)).await?;
        self.stream.read_plist().await?;
        Ok(())
    }

    /// Starts a session with the pairing identity.
    ///
    /// When the device requests SSL the connection is upgraded in place
    /// before this returns, and every later byte on this channel travels
    /// inside the TLS session. Returns whether that upgrade happened.
    pub async fn start_session(&mut self, record: &PairRecord) -> Result<bool, Error> {
        let mut req = self.base_request("StartSession");
        req.insert("HostID".into(), record.host_id.clone().into());
        req.insert("SystemBUID".into(), record.system_buid.clone().into());
        self.stream.send_plist(Value::Dictionary(req)).await?;

        let response = self.stream.read_plist().await?;
        let session_id = match response.get("SessionID").and_then(|s| s.as_string()) {
            Some(s) => s.to_string(),
            None => {
                return Err(Error::Unknown(
                    "StartSession response without a SessionID".into(),
                ))
            }
        };
        let ssl = response
            .get("EnableSessionSSL")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);

        if ssl {
            debug!("Device requested session SSL, upgrading");
            self.stream.start_session(record).await?;
        }

        self.session_id = Some(session_id);
        Ok(ssl)
    }

    /// Ends the running session.
    ///
    /// The device is told first, then the TLS session (if any) is shut
    /// down with a close-notify and the channel drops back to plaintext.
    pub async fn stop_session(&mut self) -> Result<(), Error> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };

        let mut req = self.base_request("StopSession");
        req.insert("SessionID".into(), session_id.into());
        self.stream.send_plist(Value::Dictionary(req)).await?;
        let response = self.stream.read_plist().await;

        self.stream.end_session().await?;
        response.map(|_| ())
    }

    /// Asks lockdownd to start a service and reports where it listens.
    ///
    /// Returns the port and whether the service connection itself must be
    /// TLS-upgraded with the pair record before use.
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<(u16, bool), Error> {
        let identifier = identifier.into();
        let mut req = self.base_request("StartService");
        req.insert("Service".into(), identifier.clone().into());
        self.stream.send_plist(Value::Dictionary(req)).await?;

        let response = self.stream.read_plist().await?;
        let ssl = response
            .get("EnableServiceSSL")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);

        match response
            .get("Port")
            .and_then(|p| p.as_unsigned_integer())
        {
            Some(port) if port > 0 && port <= u16::MAX as u64 => Ok((port as u16, ssl)),
            _ => {
                warn!("StartService for {identifier} returned no usable port");
                Err(Error::Unknown(format!(
                    "StartService for {identifier} returned no usable port"
                )))
            }
        }
    }

    /// Pairs with the device, generating the host identity and the
    /// certificates the device keeps.
    ///
    /// While the trust dialog is on the device's screen the request is
    /// retried once a second until the user decides, bounded at
    /// 20 attempts. The returned record is *not* persisted; hand it to a
    /// [`PairRecordStore`](crate::pair_record::PairRecordStore).
    ///
    /// Computationally heavy in a debug build: an RSA key is generated.
    #[cfg(feature = "pair")]
    pub async fn pair(
        &mut self,
        host_id: Option<String>,
        system_buid: impl Into<String>,
    ) -> Result<PairRecord, Error> {
        let host_id = host_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let system_buid = system_buid.into();

        let public_key = self.get_value(Some("DevicePublicKey"), None).await?;
        let public_key = match public_key.as_data() {
            Some(data) => data.to_vec(),
            None => {
                return Err(Error::Unknown(
                    "DevicePublicKey did not come back as data".into(),
                ))
            }
        };

        let wifi_mac_address = self
            .get_value(Some("WiFiAddress"), None)
            .await
            .ok()
            .and_then(|v| v.as_string().map(str::to_string));

        let identity = crate::ca::generate_identity(&public_key)?;

        // Only certificates and identifiers travel to the device
        let mut offered = plist::Dictionary::new();
        offered.insert(
            "DeviceCertificate".into(),
            Value::Data(identity.device_cert_pem.clone()),
        );
        offered.insert(
            "HostCertificate".into(),
            Value::Data(identity.host_cert_pem.clone()),
        );
        offered.insert(
            "RootCertificate".into(),
            Value::Data(identity.host_cert_pem.clone()),
        );
        offered.insert("HostID".into(), host_id.clone().into());
        offered.insert("SystemBUID".into(), system_buid.clone().into());

        let mut options = plist::Dictionary::new();
        options.insert("ExtendedPairingErrors".into(), true.into());

        let mut request = self.base_request("Pair");
        request.insert("PairRecord".into(), Value::Dictionary(offered));
        request.insert("ProtocolVersion".into(), "2".into());
        request.insert("PairingOptions".into(), Value::Dictionary(options));
        let request = Value::Dictionary(request);

        let mut attempts = 0;
        let response = loop {
            self.stream.send_plist(request.clone()).await?;
            match self.stream.read_plist().await {
                Ok(response) => break response,
                Err(Error::PairingDialogResponsePending) => {
                    attempts += 1;
                    if attempts >= PAIRING_DIALOG_RETRIES {
                        return Err(Error::PairingDialogResponsePending);
                    }
                    debug!("Trust dialog still pending (attempt {attempts})");
                    tokio::time::sleep(PAIRING_DIALOG_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };

        let escrow_bag = response
            .get("EscrowBag")
            .and_then(|b| b.as_data())
            .map(<[u8]>::to_vec);

        Ok(PairRecord {
            device_certificate: identity.device_cert_pem,
            host_certificate: identity.host_cert_pem.clone(),
            root_certificate: identity.host_cert_pem,
            host_private_key: identity.host_key_pem.clone(),
            root_private_key: identity.host_key_pem,
            host_id,
            system_buid,
            device_public_key: Some(public_key),
            escrow_bag,
            wifi_mac_address,
            udid: None,
        })
    }

    /// Closes the client: best-effort `StopSession`, then the connection
    /// itself is shut down.
    pub async fn close(mut self) {
        if self.session_id.is_some() {
            if let Err(e) = self.stop_session().await {
                debug!("StopSession on close failed: {e:?}");
            }
        }
        let Self { stream, .. } = self;
        if let Some(mut socket) = stream.into_inner() {
            use tokio::io::AsyncWriteExt;
            let _ = socket.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// Runs a scripted lockdownd over the server half of a duplex pipe.
    fn fake_lockdownd(
        server: DuplexStream,
        mut script: impl FnMut(plist::Dictionary) -> Option<plist::Dictionary> + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = ServiceStream::new(Box::new(server), "fake-lockdownd");
            loop {
                let request = match stream.read_plist().await {
                    Ok(r) => r,
                    Err(_) => break,
                };
                match script(request) {
                    Some(reply) => stream
                        .send_plist(Value::Dictionary(reply))
                        .await
                        .expect("fake lockdownd write failed"),
                    None => break,
                }
            }
        })
    }

    fn echo_request(request: &plist::Dictionary) -> plist::Dictionary {
        let mut reply = plist::Dictionary::new();
        if let Some(r) = request.get("Request") {
            reply.insert("Request".into(), r.clone());
        }
        reply
    }

    #[tokio::test]
    async fn connect_verifies_the_service_type() {
        let (client, server) = tokio::io::duplex(8192);
        fake_lockdownd(server, |req| {
            let mut reply = echo_request(&req);
            match req.get("Request").and_then(|r| r.as_string()) {
                Some("QueryType") => {
                    reply.insert("Type".into(), LOCKDOWN_SERVICE_TYPE.into());
                }
                Some("GetValue") => {
                    assert_eq!(
                        req.get("Key").and_then(|k| k.as_string()),
                        Some("DeviceName")
                    );
                    reply.insert("Value".into(), "Kyber's iPhone".into());
                }
                other => panic!("unexpected request {other:?}"),
            }
            Some(reply)
        });

        let mut lockdown = LockdownClient::from_stream(Box::new(client), "imobile-test")
            .await
            .unwrap();
        let name = lockdown.get_value(Some("DeviceName"), None).await.unwrap();
        assert_eq!(name.as_string(), Some("Kyber's iPhone"));
    }

    #[tokio::test]
    async fn unexpected_service_type_is_fatal() {
        let (client, server) = tokio::io::duplex(8192);
        fake_lockdownd(server, |req| {
            let mut reply = echo_request(&req);
            reply.insert("Type".into(), "com.apple.mobile.debug".into());
            Some(reply)
        });

        match LockdownClient::from_stream(Box::new(client), "imobile-test").await {
            Err(Error::InvalidService) => {}
            other => panic!("expected InvalidService, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_errors_surface_as_typed_errors() {
        let (client, server) = tokio::io::duplex(8192);
        fake_lockdownd(server, |req| {
            let mut reply = echo_request(&req);
            match req.get("Request").and_then(|r| r.as_string()) {
                Some("QueryType") => {
                    reply.insert("Type".into(), LOCKDOWN_SERVICE_TYPE.into());
                }
                _ => {
                    reply.insert("Error".into(), "PasswordProtected".into());
                }
            }
            Some(reply)
        });

        let mut lockdown = LockdownClient::from_stream(Box::new(client), "imobile-test")
            .await
            .unwrap();
        match lockdown.get_value(Some("DeviceName"), None).await {
            Err(Error::PasswordProtected) => {}
            other => panic!("expected PasswordProtected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_service_reports_port_and_ssl() {
        let (client, server) = tokio::io::duplex(8192);
        fake_lockdownd(server, |req| {
            let mut reply = echo_request(&req);
            match req.get("Request").and_then(|r| r.as_string()) {
                Some("QueryType") => {
                    reply.insert("Type".into(), LOCKDOWN_SERVICE_TYPE.into());
                }
                Some("StartService") => {
                    assert_eq!(
                        req.get("Service").and_then(|s| s.as_string()),
                        Some("com.apple.afc")
                    );
                    reply.insert("Port".into(), 49152.into());
                    reply.insert("EnableServiceSSL".into(), false.into());
                }
                other => panic!("unexpected request {other:?}"),
            }
            Some(reply)
        });

        let mut lockdown = LockdownClient::from_stream(Box::new(client), "imobile-test")
            .await
            .unwrap();
        let (port, ssl) = lockdown.start_service("com.apple.afc").await.unwrap();
        assert_eq!(port, 49152);
        assert!(!ssl);
    }

    #[tokio::test]
    async fn plain_session_lifecycle() {
        let (client, server) = tokio::io::duplex(8192);
        fake_lockdownd(server, |req| {
            let mut reply = echo_request(&req);
            match req.get("Request").and_then(|r| r.as_string()) {
                Some("QueryType") => {
                    reply.insert("Type".into(), LOCKDOWN_SERVICE_TYPE.into());
                }
                Some("StartSession") => {
                    assert!(req.get("HostID").is_some());
                    assert!(req.get("SystemBUID").is_some());
                    reply.insert("SessionID".into(), "session-1".into());
                    reply.insert("EnableSessionSSL".into(), false.into());
                }
                Some("StopSession") => {
                    assert_eq!(
                        req.get("SessionID").and_then(|s| s.as_string()),
                        Some("session-1")
                    );
                }
                other => panic!("unexpected request {other:?}"),
            }
            Some(reply)
        });

        let record = test_record();
        let mut lockdown = LockdownClient::from_stream(Box::new(client), "imobile-test")
            .await
            .unwrap();

        let ssl = lockdown.start_session(&record).await.unwrap();
        assert!(!ssl);
        assert_eq!(lockdown.session_id(), Some("session-1"));
        assert!(!lockdown.is_secure());

        lockdown.stop_session().await.unwrap();
        assert_eq!(lockdown.session_id(), None);
    }

    fn test_record() -> PairRecord {
        PairRecord {
            device_certificate: b"unused".to_vec(),
            host_certificate: b"unused".to_vec(),
            root_certificate: b"unused".to_vec(),
            host_private_key: b"unused".to_vec(),
            root_private_key: b"unused".to_vec(),
            host_id: "0A291556-2CC8-4CD3-9A4E-1E0E12F54E14".into(),
            system_buid: "FFDAB217-5A27-4DBB-AD17-BD853AE3B25B".into(),
            device_public_key: None,
            escrow_bag: None,
            wifi_mac_address: None,
            udid: None,
        }
    }

    #[cfg(feature = "pair")]
    mod pairing {
        use super::*;
        use rsa::pkcs1::EncodeRsaPublicKey;
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};

        #[tokio::test(start_paused = true)]
        async fn pairing_retries_through_the_trust_dialog() {
            let mut rng = rsa::rand_core::OsRng;
            let device_key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
            let device_public_pem = rsa::RsaPublicKey::from(&device_key)
                .to_pkcs1_pem(LineEnding::LF)
                .unwrap()
                .into_bytes();

            let (client, server) = tokio::io::duplex(65536);
            let mut pending_left = 3;
            fake_lockdownd(server, move |req| {
                let mut reply = echo_request(&req);
                match req.get("Request").and_then(|r| r.as_string()) {
                    Some("QueryType") => {
                        reply.insert("Type".into(), LOCKDOWN_SERVICE_TYPE.into());
                    }
                    Some("GetValue") => match req.get("Key").and_then(|k| k.as_string()) {
                        Some("DevicePublicKey") => {
                            reply.insert(
                                "Value".into(),
                                Value::Data(device_public_pem.clone()),
                            );
                        }
                        Some("WiFiAddress") => {
                            reply.insert("Value".into(), "aa:bb:cc:dd:ee:ff".into());
                        }
                        other => panic!("unexpected GetValue key {other:?}"),
                    },
                    Some("Pair") => {
                        let record = req
                            .get("PairRecord")
                            .and_then(|r| r.as_dictionary())
                            .expect("Pair request without a record");
                        for key in [
                            "DeviceCertificate",
                            "HostCertificate",
                            "RootCertificate",
                            "HostID",
                            "SystemBUID",
                        ] {
                            assert!(record.contains_key(key), "missing {key}");
                        }
                        assert!(!record.contains_key("HostPrivateKey"));

                        if pending_left > 0 {
                            pending_left -= 1;
                            reply.insert(
                                "Error".into(),
                                "PairingDialogResponsePending".into(),
                            );
                        } else {
                            reply.insert("EscrowBag".into(), Value::Data(vec![1, 2, 3]));
                        }
                    }
                    other => panic!("unexpected request {other:?}"),
                }
                Some(reply)
            });

            let mut lockdown = LockdownClient::from_stream(Box::new(client), "imobile-test")
                .await
                .unwrap();
            let record = lockdown
                .pair(None, "E27C9E32-0E5B-4A2A-8B0B-8C7E10D3E6C1")
                .await
                .unwrap();

            // RFC 4122 hyphenated form, lowercase
            assert_eq!(record.host_id.len(), 36);
            assert_eq!(record.host_id.matches('-').count(), 4);
            assert_eq!(record.host_id, record.host_id.to_lowercase());

            assert!(record
                .device_certificate
                .starts_with(b"-----BEGIN CERTIFICATE-----"));
            assert!(record
                .host_certificate
                .starts_with(b"-----BEGIN CERTIFICATE-----"));
            assert_eq!(record.root_certificate, record.host_certificate);
            assert_eq!(record.escrow_bag, Some(vec![1, 2, 3]));
            assert_eq!(record.wifi_mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        }

        #[tokio::test]
        async fn session_ssl_upgrade_and_traffic() {
            crate::tls::ensure_crypto_provider();

            // Device-side identity: the certificates pairing would have
            // produced, with the device key available to the fake device.
            let mut rng = rsa::rand_core::OsRng;
            let device_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
            let device_public_pem = rsa::RsaPublicKey::from(&device_key)
                .to_pkcs1_pem(LineEnding::LF)
                .unwrap()
                .into_bytes();
            let identity = crate::ca::generate_identity(&device_public_pem).unwrap();

            let record = PairRecord {
                device_certificate: identity.device_cert_pem.clone(),
                host_certificate: identity.host_cert_pem.clone(),
                root_certificate: identity.host_cert_pem.clone(),
                host_private_key: identity.host_key_pem.clone(),
                root_private_key: identity.host_key_pem.clone(),
                host_id: "2E8A5C4E-5D39-4A1C-9E5B-B6A1A0F8C7D2".into(),
                system_buid: "A81E88D5-34A9-42A5-94D9-1C9EA02E7E5D".into(),
                device_public_key: Some(device_public_pem),
                escrow_bag: None,
                wifi_mac_address: None,
                udid: None,
            };

            use rustls::pki_types::pem::PemObject;
            let device_cert_der =
                rustls::pki_types::CertificateDer::from_pem_slice(&identity.device_cert_pem)
                    .unwrap();
            let device_key_der = rustls::pki_types::PrivateKeyDer::from_pem_slice(
                device_key
                    .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
                    .unwrap()
                    .as_bytes(),
            )
            .unwrap();
            let server_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![device_cert_der], device_key_der)
                .unwrap();
            let acceptor = tokio_rustls::TlsAcceptor::from(std::sync::Arc::new(server_config));

            let (client, server) = tokio::io::duplex(65536);

            let device = tokio::spawn(async move {
                let mut plain = ServiceStream::new(Box::new(server), "fake-lockdownd");

                let request = plain.read_plist().await.unwrap();
                assert_eq!(
                    request.get("Request").and_then(|r| r.as_string()),
                    Some("QueryType")
                );
                let mut reply = plist::Dictionary::new();
                reply.insert("Request".into(), "QueryType".into());
                reply.insert("Type".into(), LOCKDOWN_SERVICE_TYPE.into());
                plain.send_plist(Value::Dictionary(reply)).await.unwrap();

                let request = plain.read_plist().await.unwrap();
                assert_eq!(
                    request.get("Request").and_then(|r| r.as_string()),
                    Some("StartSession")
                );
                let mut reply = plist::Dictionary::new();
                reply.insert("Request".into(), "StartSession".into());
                reply.insert("SessionID".into(), "secure-session".into());
                reply.insert("EnableSessionSSL".into(), true.into());
                plain.send_plist(Value::Dictionary(reply)).await.unwrap();

                // handshake happens on the raw stream
                let socket = plain.into_inner().unwrap();
                let tls = acceptor.accept(socket).await.unwrap();
                let mut secure = ServiceStream::new(Box::new(tls), "fake-lockdownd");

                let request = secure.read_plist().await.unwrap();
                assert_eq!(
                    request.get("Request").and_then(|r| r.as_string()),
                    Some("GetValue")
                );
                let mut reply = plist::Dictionary::new();
                reply.insert("Request".into(), "GetValue".into());
                reply.insert("Value".into(), "over tls".into());
                secure.send_plist(Value::Dictionary(reply)).await.unwrap();
            });

            let mut lockdown = LockdownClient::from_stream(Box::new(client), "imobile-test")
                .await
                .unwrap();
            let ssl = lockdown.start_session(&record).await.unwrap();
            assert!(ssl);
            assert!(lockdown.is_secure());
            assert_eq!(lockdown.session_id(), Some("secure-session"));

            let value = lockdown.get_value(Some("DeviceName"), None).await.unwrap();
            assert_eq!(value.as_string(), Some("over tls"));

            device.await.unwrap();
        }
    }
}
