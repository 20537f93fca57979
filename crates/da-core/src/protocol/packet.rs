//! Packet framing for the DA wire format.
//!
//! Both generations share the same 12-byte little-endian header:
//! `magic:u32` (0xFEEEEEEF), `data_type:u32`, `length:u32`, followed by
//! `length` payload bytes. An unexpected magic is a framing error, not a
//! protocol error: the session aborts instead of attempting recovery.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{DaError, Result};
use crate::protocol::constants::{PACKET_HEADER_SIZE, PACKET_MAGIC};
use crate::transport::Transport;

/// Payload class carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    /// Commands, parameters, status words and ack tokens.
    ProtocolFlow = 1,
    /// Bulk data (transfer chunks).
    Message = 2,
}

impl DataType {
    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(DataType::ProtocolFlow),
            2 => Ok(DataType::Message),
            other => Err(DaError::framing(format!("unknown data type {}", other))),
        }
    }
}

/// A decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data_type: DataType,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Encode a header + payload frame.
    pub fn encode(data_type: DataType, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        buf.write_u32::<LittleEndian>(PACKET_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(data_type as u32).unwrap();
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    /// Read one packet from the transport.
    ///
    /// Reads exactly 12 header bytes and exactly `length` payload bytes,
    /// never more; trailing filler a device may append stays on the stream
    /// and is ignored, matching the device's own lenient framing.
    pub fn read_from(transport: &mut dyn Transport) -> Result<Packet> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        transport.read_exact(&mut header)?;

        let mut cursor = Cursor::new(&header[..]);
        // Reads from a fixed 12-byte array cannot fail.
        let magic = cursor.read_u32::<LittleEndian>().unwrap_or_default();
        let data_type = cursor.read_u32::<LittleEndian>().unwrap_or_default();
        let length = cursor.read_u32::<LittleEndian>().unwrap_or_default();

        if magic != PACKET_MAGIC {
            return Err(DaError::framing(format!(
                "bad magic: expected 0x{:08X}, got 0x{:08X}",
                PACKET_MAGIC, magic
            )));
        }

        let data_type = DataType::from_raw(data_type)?;
        let mut payload = vec![0u8; length as usize];
        transport.read_exact(&mut payload)?;

        Ok(Packet { data_type, payload })
    }

    /// Payload as a little-endian u32, for status and sentinel packets.
    pub fn as_u32(&self) -> Result<u32> {
        if self.payload.len() != 4 {
            return Err(DaError::proto(format!(
                "expected a 4-byte word, got {} bytes",
                self.payload.len()
            )));
        }
        Ok(u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }
}

/// The packet framer bound to an owned transport.
///
/// Large payloads are written as one header followed by body chunks capped
/// at `write_chunk`, since some UART bridges drop oversized writes.
pub struct Channel {
    transport: Box<dyn Transport>,
    write_chunk: usize,
}

impl Channel {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            write_chunk: crate::protocol::constants::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn set_write_chunk(&mut self, chunk: usize) {
        if chunk > 0 {
            self.write_chunk = chunk;
        }
    }

    pub fn write_chunk(&self) -> usize {
        self.write_chunk
    }

    /// Frame and send one packet.
    pub fn send(&mut self, data_type: DataType, payload: &[u8]) -> Result<()> {
        let mut header = Vec::with_capacity(PACKET_HEADER_SIZE);
        header.write_u32::<LittleEndian>(PACKET_MAGIC).unwrap();
        header.write_u32::<LittleEndian>(data_type as u32).unwrap();
        header
            .write_u32::<LittleEndian>(payload.len() as u32)
            .unwrap();
        self.transport.write_all(&header)?;

        let mut pos = 0;
        while pos < payload.len() {
            let end = payload.len().min(pos + self.write_chunk);
            tracing::trace!(len = end - pos, "tx chunk");
            self.transport.write_all(&payload[pos..end])?;
            pos = end;
        }

        self.transport.flush()?;
        Ok(())
    }

    /// Read one packet.
    pub fn recv(&mut self) -> Result<Packet> {
        Packet::read_from(self.transport.as_mut())
    }

    /// Send a V6 ack token verbatim.
    pub fn send_token(&mut self, token: &[u8]) -> Result<()> {
        self.send(DataType::ProtocolFlow, token)
    }

    /// Read a packet and require its payload to equal `expected` exactly.
    /// Near-matches are flagged, never accepted.
    pub fn expect_token(&mut self, expected: &[u8]) -> Result<()> {
        let packet = self.recv()?;
        if packet.payload == expected {
            Ok(())
        } else {
            Err(DaError::proto(format!(
                "expected token {:?}, got {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&packet.payload)
            )))
        }
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_encode_layout() {
        let bytes = Packet::encode(DataType::Message, b"\xAA\xBB");
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[0..4], &[0xEF, 0xEE, 0xEE, 0xFE]);
        assert_eq!(&bytes[4..8], &[2, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[2, 0, 0, 0]);
        assert_eq!(&bytes[12..], b"\xAA\xBB");
    }

    #[test]
    fn test_roundtrip() {
        let mut mock = MockTransport::new();
        let payload: Vec<u8> = (0u16..300).map(|v| v as u8).collect();
        mock.queue_bytes(&Packet::encode(DataType::ProtocolFlow, &payload));

        let packet = Packet::read_from(&mut mock).unwrap();
        assert_eq!(packet.data_type, DataType::ProtocolFlow);
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_trailing_filler_is_not_consumed() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(&Packet::encode(DataType::Message, b"abc"));
        mock.queue_bytes(b"\0\0\0\0");

        let packet = Packet::read_from(&mut mock).unwrap();
        assert_eq!(packet.payload, b"abc");
        assert_eq!(mock.unread_len(), 4);
    }

    #[test]
    fn test_bad_magic_is_framing_error() {
        let mut mock = MockTransport::new();
        let mut bytes = Packet::encode(DataType::Message, b"abc");
        bytes[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        mock.queue_bytes(&bytes);

        let err = Packet::read_from(&mut mock).unwrap_err();
        assert!(matches!(err, DaError::Framing(_)));
    }

    #[test]
    fn test_expect_token_rejects_near_match() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(&Packet::encode(DataType::ProtocolFlow, b"OK"));

        let mut channel = Channel::new(Box::new(mock));
        let err = channel.expect_token(b"OK\0").unwrap_err();
        assert!(matches!(err, DaError::Protocol(_)));
    }
}
