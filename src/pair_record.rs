//! Pairing credentials and their persistence.
//!
//! A pair record is what pairing leaves behind: the host identity
//! (certificate and private key), the certificates derived for the device,
//! and the identifiers lockdownd expects back when a session starts. On
//! disk it is an XML plist dictionary keyed by the device udid.

use std::path::{Path, PathBuf};

use log::warn;
use plist::Data;
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Credentials shared with a device during pairing.
///
/// Certificates and private keys are kept in PEM form, the way they travel
/// inside the record plist.
#[derive(Clone, Debug, PartialEq)]
pub struct PairRecord {
    pub device_certificate: Vec<u8>,
    pub host_certificate: Vec<u8>,
    pub root_certificate: Vec<u8>,
    pub host_private_key: Vec<u8>,
    pub root_private_key: Vec<u8>,
    /// Host identity sent on every `StartSession`, a hyphenated UUID
    pub host_id: String,
    /// Host-wide identifier shared across all paired devices
    pub system_buid: String,
    pub device_public_key: Option<Vec<u8>>,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairRecord {
    device_certificate: Data,
    host_certificate: Data,
    root_certificate: Data,
    host_private_key: Data,
    root_private_key: Data,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_public_key: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress", skip_serializing_if = "Option::is_none")]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID", skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairRecord {
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let bytes = std::fs::read(path).map_err(|_| Error::InvalidPairRecord)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        match plist::from_bytes::<RawPairRecord>(bytes) {
            Ok(raw) => Ok(raw.into()),
            Err(e) => {
                warn!("Pair record does not parse: {e:?}");
                Err(Error::InvalidPairRecord)
            }
        }
    }

    pub fn from_value(value: &plist::Value) -> Result<Self, Error> {
        match plist::from_value::<RawPairRecord>(value) {
            Ok(raw) => Ok(raw.into()),
            Err(e) => {
                warn!("Pair record value does not parse: {e:?}");
                Err(Error::InvalidPairRecord)
            }
        }
    }

    /// Serializes the record as an XML plist.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let raw = RawPairRecord::from(self.clone());
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }

    pub(crate) fn device_certificate_der(&self) -> Result<CertificateDer<'static>, Error> {
        CertificateDer::from_pem_slice(&self.device_certificate)
            .map_err(|_| Error::InvalidPairRecord)
    }

    pub(crate) fn host_certificate_der(&self) -> Result<CertificateDer<'static>, Error> {
        CertificateDer::from_pem_slice(&self.host_certificate).map_err(|_| Error::InvalidPairRecord)
    }

    pub(crate) fn root_certificate_der(&self) -> Result<CertificateDer<'static>, Error> {
        CertificateDer::from_pem_slice(&self.root_certificate).map_err(|_| Error::InvalidPairRecord)
    }

    pub(crate) fn host_private_key_der(&self) -> Result<PrivateKeyDer<'static>, Error> {
        PrivateKeyDer::from_pem_slice(&self.host_private_key).map_err(|_| Error::InvalidPairRecord)
    }
}

impl From<RawPairRecord> for PairRecord {
    fn from(value: RawPairRecord) -> Self {
        Self {
            device_certificate: value.device_certificate.into(),
            host_certificate: value.host_certificate.into(),
            root_certificate: value.root_certificate.into(),
            host_private_key: value.host_private_key.into(),
            root_private_key: value.root_private_key.into(),
            host_id: value.host_id,
            system_buid: value.system_buid,
            device_public_key: value.device_public_key.map(Into::into),
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}

impl From<PairRecord> for RawPairRecord {
    fn from(value: PairRecord) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate),
            host_certificate: Data::new(value.host_certificate),
            root_certificate: Data::new(value.root_certificate),
            host_private_key: Data::new(value.host_private_key),
            root_private_key: Data::new(value.root_private_key),
            host_id: value.host_id,
            system_buid: value.system_buid,
            device_public_key: value.device_public_key.map(Data::new),
            escrow_bag: value.escrow_bag.map(Data::new),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}

/// Persistence for pair records, keyed by device udid.
///
/// The transport core never touches disk itself; anything that can look a
/// record up by udid will do.
pub trait PairRecordStore: Send + Sync + std::fmt::Debug {
    fn load(&self, udid: &str) -> Option<PairRecord>;
    fn save(&self, udid: &str, record: &PairRecord) -> Result<(), Error>;
    fn remove(&self, udid: &str);
}

/// Stores each record as `<directory>/<udid>.plist`.
#[derive(Debug, Clone)]
pub struct FilePairRecordStore {
    directory: PathBuf,
}

impl FilePairRecordStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, udid: &str) -> PathBuf {
        self.directory.join(format!("{udid}.plist"))
    }
}

impl PairRecordStore for FilePairRecordStore {
    fn load(&self, udid: &str) -> Option<PairRecord> {
        let bytes = std::fs::read(self.path_for(udid)).ok()?;
        match PairRecord::from_bytes(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Stored pair record for {udid} is unusable: {e:?}");
                None
            }
        }
    }

    fn save(&self, udid: &str, record: &PairRecord) -> Result<(), Error> {
        std::fs::create_dir_all(&self.directory)
            .map_err(|e| Error::Unknown(format!("cannot create record directory: {e}")))?;
        let bytes = record.serialize()?;
        std::fs::write(self.path_for(udid), bytes)
            .map_err(|e| Error::Unknown(format!("cannot write pair record: {e}")))
    }

    fn remove(&self, udid: &str) {
        let _ = std::fs::remove_file(self.path_for(udid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PairRecord {
        PairRecord {
            device_certificate: b"device cert pem".to_vec(),
            host_certificate: b"host cert pem".to_vec(),
            root_certificate: b"root cert pem".to_vec(),
            host_private_key: b"host key pem".to_vec(),
            root_private_key: b"root key pem".to_vec(),
            host_id: "E7B5B220-1485-4A2B-8B64-97D534A64E31".to_lowercase(),
            system_buid: "9CB44B28-B0D6-4E94-A54F-3D84A44D1E0E".to_lowercase(),
            device_public_key: Some(b"device public key pem".to_vec()),
            escrow_bag: None,
            wifi_mac_address: Some("aa:bb:cc:dd:ee:ff".into()),
            udid: None,
        }
    }

    #[test]
    fn record_round_trips_through_xml() {
        let record = sample_record();
        let bytes = record.serialize().unwrap();
        let parsed = PairRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn record_uses_the_expected_plist_keys() {
        let bytes = sample_record().serialize().unwrap();
        let value: plist::Value = plist::from_bytes(&bytes).unwrap();
        let dict = value.as_dictionary().unwrap();

        for key in [
            "DeviceCertificate",
            "HostCertificate",
            "RootCertificate",
            "HostPrivateKey",
            "RootPrivateKey",
            "HostID",
            "SystemBUID",
            "WiFiMACAddress",
        ] {
            assert!(dict.contains_key(key), "missing {key}");
        }
        assert!(!dict.contains_key("EscrowBag"));
    }

    #[test]
    fn incomplete_records_are_rejected() {
        let mut dict = plist::Dictionary::new();
        dict.insert("HostID".into(), "whatever".into());
        let mut bytes = Vec::new();
        plist::to_writer_xml(&mut bytes, &plist::Value::Dictionary(dict)).unwrap();

        match PairRecord::from_bytes(&bytes) {
            Err(Error::InvalidPairRecord) => {}
            other => panic!("expected InvalidPairRecord, got {other:?}"),
        }
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePairRecordStore::new(dir.path());
        let udid = "00008101000a2d3e0122002e";

        assert!(store.load(udid).is_none());

        let record = sample_record();
        store.save(udid, &record).unwrap();
        assert_eq!(store.load(udid), Some(record));

        store.remove(udid);
        assert!(store.load(udid).is_none());
    }
}
