//! TLS configuration for sessions bridged over a mux connection.
//!
//! The device presents the certificate we generated for it at pairing time,
//! self-signed by our own throwaway authority, under whatever name it
//! pleases. webpki's opinion of that chain is not interesting: the peer is
//! verified by pinning it to the certificates in the pair record.

use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct,
};

use crate::{pair_record::PairRecord, Error};

/// Installs a process-wide rustls crypto provider if none is set yet.
pub(crate) fn ensure_crypto_provider() {
    if CryptoProvider::get_default().is_none() {
        let provider: CryptoProvider = {
            #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
            {
                rustls::crypto::ring::default_provider()
            }

            #[cfg(all(feature = "aws-lc", not(feature = "ring")))]
            {
                rustls::crypto::aws_lc_rs::default_provider()
            }

            #[cfg(all(feature = "aws-lc", feature = "ring"))]
            {
                log::warn!("Both aws-lc and ring are enabled, using ring");
                rustls::crypto::ring::default_provider()
            }

            #[cfg(not(any(feature = "aws-lc", feature = "ring")))]
            {
                compile_error!("No crypto backend selected! Enable the aws-lc or ring feature")
            }
        };

        if let Err(e) = CryptoProvider::install_default(provider) {
            // Racing installers are fine, somebody won
            log::debug!("Crypto provider was installed concurrently: {e:?}");
        }
    }
}

/// Accepts exactly the peer certificates recorded at pairing time.
#[derive(Debug)]
struct PinnedCertVerifier {
    expected: Vec<CertificateDer<'static>>,
    schemes: Vec<rustls::SignatureScheme>,
}

impl PinnedCertVerifier {
    fn new(record: &PairRecord) -> Result<Self, Error> {
        let expected = vec![
            record.device_certificate_der()?,
            record.root_certificate_der()?,
        ];
        let schemes = CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default();
        Ok(Self { expected, schemes })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.expected.iter().any(|cert| cert == end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

/// Builds the client configuration for a session secured with `record`:
/// client authentication with the host identity, peer pinned to the paired
/// device.
pub(crate) fn client_config(record: &PairRecord) -> Result<ClientConfig, Error> {
    let verifier = Arc::new(PinnedCertVerifier::new(record)?);
    let host_cert = record.host_certificate_der()?;
    let host_key = record.host_private_key_der()?;

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![host_cert], host_key)?;

    Ok(config)
}
