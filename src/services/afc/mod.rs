//! AFC (Apple File Conduit) client for the device filesystem.
//!
//! Requests and responses are numbered packets with the `"CFA6LPAA"`
//! header. String tables come back as NUL-separated fields.

use std::collections::HashMap;

use log::warn;

use opcode::{status_description, AfcFopenMode, AfcOpcode};
use packet::AfcPacket;

use crate::{Error, ServiceStream};

use super::DeviceService;

pub mod opcode;
pub mod packet;

pub use packet::MAGIC;

/// Client for the AFC file service.
pub struct AfcClient {
    stream: ServiceStream,
    packet_number: u64,
}

/// Information about one file or directory.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub size: usize,
    pub blocks: usize,
    pub creation: chrono::NaiveDateTime,
    pub modified: chrono::NaiveDateTime,
    pub st_nlink: String,
    pub st_ifmt: String,
    pub st_link_target: Option<String>,
}

/// Information about the device filesystem.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub model: String,
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub block_size: usize,
}

impl DeviceService for AfcClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.afc".into()
    }

    async fn from_stream(stream: ServiceStream) -> Result<Self, Error> {
        Ok(Self::new(stream))
    }
}

impl AfcClient {
    pub fn new(stream: ServiceStream) -> Self {
        Self {
            stream,
            packet_number: 0,
        }
    }

    /// Sends one request and reads the device's reply, failing on error
    /// statuses.
    async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, Error> {
        let packet = AfcPacket::request(operation, self.packet_number, header_payload, payload);
        self.packet_number += 1;

        self.stream.send_raw(&packet.serialize()).await?;
        let response = AfcPacket::read(&mut self.stream).await?;

        if response.header.operation == AfcOpcode::Status {
            let code = status_code(&response)?;
            if code != 0 {
                warn!("afc {operation:?} failed with status {code}");
                return Err(Error::Unknown(format!(
                    "afc {operation:?} failed: {} ({code})",
                    status_description(code)
                )));
            }
        }
        Ok(response)
    }

    /// Queries filesystem-wide information.
    pub async fn get_device_info(&mut self) -> Result<DeviceInfo, Error> {
        let response = self
            .request(AfcOpcode::GetDevInfo, Vec::new(), Vec::new())
            .await?;
        let fields = parse_string_table(&response.payload);

        Ok(DeviceInfo {
            model: required(&fields, "Model")?.to_string(),
            total_bytes: numeric(&fields, "FSTotalBytes")?,
            free_bytes: numeric(&fields, "FSFreeBytes")?,
            block_size: numeric(&fields, "FSBlockSize")?,
        })
    }

    /// Lists the entries of a directory.
    pub async fn list_dir(&mut self, path: impl Into<String>) -> Result<Vec<String>, Error> {
        let path = path.into();
        let response = self
            .request(AfcOpcode::ReadDir, path.into_bytes(), Vec::new())
            .await?;

        Ok(response
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect())
    }

    /// Stats one path.
    pub async fn file_info(&mut self, path: impl Into<String>) -> Result<FileInfo, Error> {
        let path = path.into();
        let response = self
            .request(AfcOpcode::GetFileInfo, path.into_bytes(), Vec::new())
            .await?;
        let fields = parse_string_table(&response.payload);

        let timestamp = |key: &str| -> Result<chrono::NaiveDateTime, Error> {
            let nanos: i64 = numeric(&fields, key)? as i64;
            Ok(chrono::DateTime::from_timestamp_nanos(nanos).naive_utc())
        };

        Ok(FileInfo {
            size: numeric(&fields, "st_size")?,
            blocks: numeric(&fields, "st_blocks")?,
            creation: timestamp("st_birthtime")?,
            modified: timestamp("st_mtime")?,
            st_nlink: required(&fields, "st_nlink")?.to_string(),
            st_ifmt: required(&fields, "st_ifmt")?.to_string(),
            st_link_target: fields.get("LinkTarget").cloned(),
        })
    }

    /// Opens a file and returns its descriptor.
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        mode: AfcFopenMode,
    ) -> Result<u64, Error> {
        let path = path.into();
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend_from_slice(path.as_bytes());

        let response = self
            .request(AfcOpcode::FileOpen, header_payload, Vec::new())
            .await?;
        if response.header.operation != AfcOpcode::FileOpenRes {
            return Err(Error::Unknown(format!(
                "afc open answered with {:?}",
                response.header.operation
            )));
        }
        match response.header_payload.get(0..8) {
            Some(fd) => Ok(u64::from_le_bytes(fd.try_into().unwrap())),
            None => Err(Error::NotEnoughData(response.header_payload.len(), 8)),
        }
    }

    /// Reads up to `len` bytes from an open file.
    pub async fn read(&mut self, fd: u64, len: u64) -> Result<Vec<u8>, Error> {
        let mut header_payload = fd.to_le_bytes().to_vec();
        header_payload.extend_from_slice(&len.to_le_bytes());

        let response = self
            .request(AfcOpcode::Read, header_payload, Vec::new())
            .await?;
        Ok(response.payload)
    }

    /// Writes bytes to an open file.
    pub async fn write(&mut self, fd: u64, data: &[u8]) -> Result<(), Error> {
        let header_payload = fd.to_le_bytes().to_vec();
        self.request(AfcOpcode::Write, header_payload, data.to_vec())
            .await?;
        Ok(())
    }

    /// Closes an open file.
    pub async fn close_file(&mut self, fd: u64) -> Result<(), Error> {
        let header_payload = fd.to_le_bytes().to_vec();
        self.request(AfcOpcode::FileClose, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    /// Removes a file or an empty directory.
    pub async fn remove_path(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.request(AfcOpcode::RemovePath, path.into().into_bytes(), Vec::new())
            .await?;
        Ok(())
    }

    /// Creates a directory, parents included.
    pub async fn make_dir(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.request(AfcOpcode::MakeDir, path.into().into_bytes(), Vec::new())
            .await?;
        Ok(())
    }

    /// Renames a path.
    pub async fn rename_path(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), Error> {
        let mut header_payload = source.into().into_bytes();
        header_payload.push(0);
        header_payload.extend_from_slice(target.into().as_bytes());
        header_payload.push(0);

        self.request(AfcOpcode::RenamePath, header_payload, Vec::new())
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AfcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfcClient")
            .field("packet_number", &self.packet_number)
            .finish()
    }
}

fn status_code(packet: &AfcPacket) -> Result<u64, Error> {
    match packet.header_payload.get(0..8) {
        Some(code) => Ok(u64::from_le_bytes(code.try_into().unwrap())),
        None => Err(Error::NotEnoughData(packet.header_payload.len(), 8)),
    }
}

/// Splits a NUL-separated key/value table into a map.
fn parse_string_table(payload: &[u8]) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut parts = payload
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).to_string());
    while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
        fields.insert(key, value);
    }
    fields
}

fn required<'a>(fields: &'a HashMap<String, String>, key: &str) -> Result<&'a str, Error> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::Unknown(format!("afc response is missing {key}")))
}

fn numeric(fields: &HashMap<String, String>, key: &str) -> Result<usize, Error> {
    required(fields, key)?
        .parse()
        .map_err(|_| Error::Unknown(format!("afc field {key} is not numeric")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_tables_parse_into_pairs() {
        let payload = b"Model\0iPhone3,1\0FSTotalBytes\032000000000\0FSFreeBytes\08000000\0";
        let fields = parse_string_table(payload);
        assert_eq!(fields.get("Model").map(String::as_str), Some("iPhone3,1"));
        assert_eq!(numeric(&fields, "FSTotalBytes").unwrap(), 32000000000);
        assert!(matches!(
            required(&fields, "FSBlockSize"),
            Err(Error::Unknown(_))
        ));
    }

    /// Answers one GetDevInfo request like a device would.
    #[tokio::test]
    async fn get_device_info_round_trip() {
        let (client, server) = tokio::io::duplex(8192);
        let mut afc = AfcClient::new(ServiceStream::new(Box::new(client), "afc-test"));

        let device = tokio::spawn(async move {
            let mut stream = ServiceStream::new(Box::new(server), "fake-afc");
            let request = AfcPacket::read(&mut stream).await.unwrap();
            assert_eq!(request.header.operation, AfcOpcode::GetDevInfo);
            assert_eq!(request.header.packet_num, 0);

            let payload =
                b"Model\0iPhone3,1\0FSTotalBytes\032000000000\0FSFreeBytes\08000000000\0FSBlockSize\04096\0"
                    .to_vec();
            let reply = AfcPacket::request(AfcOpcode::Data, 0, Vec::new(), payload);
            stream.send_raw(&reply.serialize()).await.unwrap();
        });

        let info = afc.get_device_info().await.unwrap();
        assert_eq!(info.model, "iPhone3,1");
        assert_eq!(info.total_bytes, 32000000000);
        assert_eq!(info.free_bytes, 8000000000);
        assert_eq!(info.block_size, 4096);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn error_statuses_fail_the_operation() {
        let (client, server) = tokio::io::duplex(8192);
        let mut afc = AfcClient::new(ServiceStream::new(Box::new(client), "afc-test"));

        let device = tokio::spawn(async move {
            let mut stream = ServiceStream::new(Box::new(server), "fake-afc");
            let request = AfcPacket::read(&mut stream).await.unwrap();
            assert_eq!(request.header.operation, AfcOpcode::ReadDir);

            // object not found
            let reply = AfcPacket::request(
                AfcOpcode::Status,
                0,
                8u64.to_le_bytes().to_vec(),
                Vec::new(),
            );
            stream.send_raw(&reply.serialize()).await.unwrap();
        });

        match afc.list_dir("/nonexistent").await {
            Err(Error::Unknown(e)) => assert!(e.contains("not found"), "{e}"),
            other => panic!("expected an afc failure, got {other:?}"),
        }
        device.await.unwrap();
    }
}
