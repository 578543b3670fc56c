//! Wire format of the USB mux protocol.
//!
//! Every packet is a fixed 28 byte header followed by the payload. All
//! multi-byte fields are network byte order. The total length is carried
//! twice, as a u32 and as a truncated u16 copy, and both must agree.

use crate::Error;

/// Protocol discriminator carried in every header. Only the TCP-like
/// stream protocol is spoken.
pub const PROTOCOL_TCP: u32 = 6;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Header data offset byte. The device expects the historical TCP value
/// (5 words, high nibble), not one derived from this header's own size.
const DATA_OFFSET: u8 = 0x50;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MuxFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub ack: bool,
}

impl MuxFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;

    pub fn from_byte(flags: u8) -> Self {
        Self {
            fin: (flags & Self::FIN) != 0,
            syn: (flags & Self::SYN) != 0,
            rst: (flags & Self::RST) != 0,
            ack: (flags & Self::ACK) != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= Self::FIN;
        }
        if self.syn {
            flags |= Self::SYN;
        }
        if self.rst {
            flags |= Self::RST;
        }
        if self.ack {
            flags |= Self::ACK;
        }
        flags
    }

    pub fn syn() -> Self {
        Self {
            syn: true,
            ..Default::default()
        }
    }

    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }

    pub fn fin() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn rst() -> Self {
        Self {
            rst: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxPacket {
    pub source_port: u16,
    pub dest_port: u16,
    /// Payload bytes the sender has emitted on this connection so far.
    pub seq: u32,
    /// Payload bytes the sender has accepted from its peer so far.
    pub ack: u32,
    pub flags: MuxFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// Outcome of pulling one packet out of a receive buffer.
#[derive(Debug)]
pub(crate) enum ParseOutcome {
    Ok {
        packet: MuxPacket,
        bytes_consumed: usize,
    },
    NotEnough,
    Invalid(String),
}

impl MuxPacket {
    /// Builds the full wire representation of one packet.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        source_port: u16,
        dest_port: u16,
        seq: u32,
        ack: u32,
        flags: MuxFlags,
        window: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let length = (HEADER_SIZE + payload.len()) as u32;
        let mut packet = Vec::with_capacity(length as usize);

        packet.extend_from_slice(&PROTOCOL_TCP.to_be_bytes());
        packet.extend_from_slice(&length.to_be_bytes());
        packet.extend_from_slice(&source_port.to_be_bytes());
        packet.extend_from_slice(&dest_port.to_be_bytes());
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&ack.to_be_bytes());
        packet.push(DATA_OFFSET);
        packet.push(flags.to_byte());
        packet.extend_from_slice(&window.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&(length as u16).to_be_bytes());
        packet.extend_from_slice(payload);

        packet
    }

    /// Attempts to parse one packet from the front of `buf`.
    pub(crate) fn parse(buf: &[u8]) -> ParseOutcome {
        if buf.len() < HEADER_SIZE {
            return ParseOutcome::NotEnough;
        }

        let protocol = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if protocol != PROTOCOL_TCP {
            return ParseOutcome::Invalid(format!("unknown protocol {protocol}"));
        }

        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if length >= 1 << 31 {
            return ParseOutcome::Invalid(format!("unreasonable packet length {length}"));
        }
        if (length as usize) < HEADER_SIZE {
            return ParseOutcome::Invalid(format!("packet length {length} below header size"));
        }

        let length16 = u16::from_be_bytes([buf[26], buf[27]]);
        if length <= u16::MAX as u32 && length16 as u32 != length {
            return ParseOutcome::Invalid(format!(
                "length fields disagree: {length} vs {length16}"
            ));
        }

        if buf.len() < length as usize {
            return ParseOutcome::NotEnough;
        }

        let packet = MuxPacket {
            source_port: u16::from_be_bytes([buf[8], buf[9]]),
            dest_port: u16::from_be_bytes([buf[10], buf[11]]),
            seq: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            ack: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            flags: MuxFlags::from_byte(buf[21]),
            window: u16::from_be_bytes([buf[22], buf[23]]),
            payload: buf[HEADER_SIZE..length as usize].to_vec(),
        };

        ParseOutcome::Ok {
            packet,
            bytes_consumed: length as usize,
        }
    }

    /// Strict parse of a whole buffer holding exactly one packet.
    pub fn parse_one(buf: &[u8]) -> Result<Self, Error> {
        match Self::parse(buf) {
            ParseOutcome::Ok {
                packet,
                bytes_consumed,
            } if bytes_consumed == buf.len() => Ok(packet),
            ParseOutcome::Ok { bytes_consumed, .. } => Err(Error::MuxError(format!(
                "trailing bytes after packet: {} of {}",
                bytes_consumed,
                buf.len()
            ))),
            ParseOutcome::NotEnough => Err(Error::NotEnoughData(buf.len(), HEADER_SIZE)),
            ParseOutcome::Invalid(e) => Err(Error::MuxError(e)),
        }
    }
}
