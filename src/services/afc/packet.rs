//! AFC wire format: a 40 byte little-endian header, an operation-specific
//! header payload, and an optional data payload.

use log::debug;

use crate::{Error, ServiceStream};

use super::opcode::AfcOpcode;

/// `"CFA6LPAA"` on the wire.
pub const MAGIC: u64 = 0x4141504c36414643;

#[derive(Clone, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    /// Header, header payload and data payload together
    pub entire_len: u64,
    /// Header and header payload
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::LEN as usize);
        res.extend_from_slice(&self.magic.to_le_bytes());
        res.extend_from_slice(&self.entire_len.to_le_bytes());
        res.extend_from_slice(&self.header_payload_len.to_le_bytes());
        res.extend_from_slice(&self.packet_num.to_le_bytes());
        res.extend_from_slice(&(self.operation as u64).to_le_bytes());
        res
    }

    pub async fn read(stream: &mut ServiceStream) -> Result<Self, Error> {
        let bytes = stream.read_raw(Self::LEN as usize).await?;
        let mut chunks = bytes.chunks_exact(8);
        let mut next =
            || u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());

        let magic = next();
        let entire_len = next();
        let header_payload_len = next();
        let packet_num = next();
        let operation = next();

        if magic != MAGIC {
            return Err(Error::Unknown(format!("invalid afc magic {magic:#018x}")));
        }
        if header_payload_len < Self::LEN || entire_len < header_payload_len {
            return Err(Error::Unknown(format!(
                "inconsistent afc lengths: {entire_len} / {header_payload_len}"
            )));
        }
        let operation = AfcOpcode::try_from(operation)
            .map_err(|op| Error::Unknown(format!("unknown afc opcode {op:#x}")))?;

        Ok(Self {
            magic,
            entire_len,
            header_payload_len,
            packet_num,
            operation,
        })
    }
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacket {
    /// Builds a request packet with correct length fields.
    pub fn request(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let header_payload_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        let header = AfcPacketHeader {
            magic: MAGIC,
            entire_len: header_payload_len + payload.len() as u64,
            header_payload_len,
            packet_num,
            operation,
        };
        Self {
            header,
            header_payload,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = self.header.serialize();
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);
        res
    }

    pub async fn read(stream: &mut ServiceStream) -> Result<Self, Error> {
        let header = AfcPacketHeader::read(stream).await?;
        debug!("afc header: {header:?}");

        let header_payload = stream
            .read_raw((header.header_payload_len - AfcPacketHeader::LEN) as usize)
            .await?;
        let payload = if header.entire_len == header.header_payload_len {
            Vec::new()
        } else {
            stream
                .read_raw((header.entire_len - header.header_payload_len) as usize)
                .await?
        };

        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }
}
