//! 3-Space wire framing
//!
//! Command frames:
//! - Wired: `0xF9, cmd, payload.., checksum`
//! - Wireless (through a dongle): `0xFA, logical_id, cmd, payload.., checksum`
//!
//! The checksum is the sum of every byte after the start byte, modulo 256.
//!
//! Every response and stream batch is preceded by an 8-byte header enabled at
//! channel open: `status, timestamp (u32 BE), command echo, logical id,
//! data length`.

use crate::core::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Start byte of a wired command
pub const WIRED_START: u8 = 0xF9;
/// Start byte of a wireless command
pub const WIRELESS_START: u8 = 0xFA;
/// Response header length with [`HEADER_BITFIELD`] enabled
pub const HEADER_LEN: usize = 8;
/// Logical id echoed by wired devices
pub const WIRED_LOGICAL_ID: u8 = 0xFE;
/// Command echo carried by unsolicited stream batches
pub const STREAM_ECHO: u8 = 0xFF;
/// Highest wireless logical id
pub const MAX_LOGICAL_ID: u8 = 14;

/// Header bits: success, timestamp, command echo, logical id, data length
pub const HEADER_BITFIELD: u32 = 0x01 | 0x02 | 0x04 | 0x10 | 0x40;

/// Frame addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addressing {
    /// Directly attached device
    Wired,
    /// Wireless sensor at a dongle logical id
    Wireless(u8),
}

impl Addressing {
    /// Logical id the device echoes in its response header
    pub fn logical_id(self) -> u8 {
        match self {
            Self::Wired => WIRED_LOGICAL_ID,
            Self::Wireless(lid) => lid,
        }
    }
}

/// Sum-8 checksum
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build a command frame
pub fn encode_command(addr: Addressing, command: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    match addr {
        Addressing::Wired => buf.put_u8(WIRED_START),
        Addressing::Wireless(lid) => {
            buf.put_u8(WIRELESS_START);
            buf.put_u8(lid);
        }
    }
    buf.put_u8(command);
    buf.put_slice(payload);
    let sum = checksum(&buf[1..]);
    buf.put_u8(sum);
    buf.freeze()
}

/// A command frame taken apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub addressing: Addressing,
    pub command: u8,
    pub payload: Bytes,
}

/// Parse one complete command frame
pub fn decode_command(frame: &[u8]) -> Result<ParsedCommand> {
    let (addressing, body_start) = match frame.first() {
        Some(&WIRED_START) if frame.len() >= 3 => (Addressing::Wired, 1),
        Some(&WIRELESS_START) if frame.len() >= 4 => (Addressing::Wireless(frame[1]), 2),
        _ => {
            return Err(Error::Parameter(format!(
                "not a command frame: {}",
                hex::encode(frame)
            )))
        }
    };

    let (body, sum) = frame.split_at(frame.len() - 1);
    if checksum(&body[1..]) != sum[0] {
        return Err(Error::Parameter(format!(
            "bad checksum on frame {}",
            hex::encode(frame)
        )));
    }

    Ok(ParsedCommand {
        addressing,
        command: body[body_start],
        payload: Bytes::copy_from_slice(&body[body_start + 1..]),
    })
}

/// Response header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    /// 0 on success
    pub status: u8,
    /// Device timestamp in microseconds
    pub timestamp: u32,
    /// Echo of the command byte, or [`STREAM_ECHO`]
    pub command: u8,
    /// Logical id of the responding device
    pub logical_id: u8,
    /// Bytes of data following the header
    pub data_len: u8,
}

impl ResponseHeader {
    /// Parse an 8-byte header
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(Error::Read(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            status: bytes[0],
            timestamp: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            command: bytes[5],
            logical_id: bytes[6],
            data_len: bytes[7],
        })
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let ts = self.timestamp.to_be_bytes();
        [
            self.status,
            ts[0],
            ts[1],
            ts[2],
            ts[3],
            self.command,
            self.logical_id,
            self.data_len,
        ]
    }

    /// Whether this header precedes an unsolicited stream batch
    pub fn is_stream(&self) -> bool {
        self.command == STREAM_ECHO
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Header followed by data, as a device would emit it
pub fn encode_response(header: ResponseHeader, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(data);
    buf.freeze()
}
