//! Chunked data transfer loops.
//!
//! Every loop is strictly lockstep: one outstanding unacknowledged unit
//! at a time, no pipelining, no automatic chunk retry. A transfer is
//! complete only when the bytes moved equal the announced total; partial
//! completion is always an error.

use std::io::{Read, Write};

use tracing::{debug, trace};

use crate::error::{DaError, Result};
use crate::protocol::constants::{TOK_AT_PREFIX, TOK_OK, TOK_OK_FLOW, V5_CHUNK_ACK};
use crate::protocol::packet::{Channel, DataType};

/// Transfer direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

/// Parameters of one chunked transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferSpec {
    pub direction: Direction,
    pub total_size: u64,
    pub chunk_size: usize,
}

impl TransferSpec {
    pub fn host_to_device(total_size: u64, chunk_size: usize) -> Self {
        Self {
            direction: Direction::HostToDevice,
            total_size,
            chunk_size,
        }
    }

    pub fn device_to_host(total_size: u64, chunk_size: usize) -> Self {
        Self {
            direction: Direction::DeviceToHost,
            total_size,
            chunk_size,
        }
    }

    /// Number of chunks a compliant peer will exchange.
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.chunk_size as u64)
    }
}

/// Parse an `OK@0x<hex>` announcement token.
fn parse_at_token(payload: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DaError::transfer("announcement token is not ASCII"))?
        .trim_end_matches('\0');
    let hex = text
        .strip_prefix(TOK_AT_PREFIX)
        .ok_or_else(|| DaError::transfer(format!("expected OK@0x token, got {:?}", text)))?;
    u64::from_str_radix(hex, 16)
        .map_err(|_| DaError::transfer(format!("bad hex in token {:?}", text)))
}

/// Read a token packet and require it to equal `expected` exactly.
fn expect_transfer_token(channel: &mut Channel, expected: &[u8]) -> Result<()> {
    let packet = channel.recv()?;
    if packet.payload == expected {
        Ok(())
    } else {
        Err(DaError::transfer(format!(
            "expected ack {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&packet.payload)
        )))
    }
}

/// V5 device-to-host loop: the device sends data chunks, the host
/// acknowledges each with a 4-byte zero before the next arrives.
pub fn v5_receive(channel: &mut Channel, spec: &TransferSpec, sink: &mut dyn Write) -> Result<u64> {
    let mut received: u64 = 0;
    while received < spec.total_size {
        let packet = channel.recv()?;
        let len = packet.payload.len() as u64;
        if received + len > spec.total_size {
            return Err(DaError::transfer(format!(
                "chunk overruns announced size: {} + {} > {}",
                received, len, spec.total_size
            )));
        }
        sink.write_all(&packet.payload)
            .map_err(|e| DaError::transfer(format!("sink write failed: {}", e)))?;
        received += len;
        trace!(received, total = spec.total_size, "rx chunk");
        channel.send(DataType::ProtocolFlow, &V5_CHUNK_ACK)?;
    }
    debug!(bytes = received, "Receive complete");
    Ok(received)
}

/// V5 host-to-device loop: the host sends data chunks, the device
/// acknowledges each with a 4-byte zero before the next is sent.
pub fn v5_send(channel: &mut Channel, spec: &TransferSpec, source: &mut dyn Read) -> Result<u64> {
    let mut sent: u64 = 0;
    let mut buf = vec![0u8; spec.chunk_size.max(1)];
    while sent < spec.total_size {
        let want = (spec.total_size - sent).min(buf.len() as u64) as usize;
        source
            .read_exact(&mut buf[..want])
            .map_err(|e| DaError::transfer(format!("source ended early: {}", e)))?;
        channel.send(DataType::Message, &buf[..want])?;
        sent += want as u64;
        trace!(sent, total = spec.total_size, "tx chunk");

        let ack = channel.recv()?;
        if ack.payload != V5_CHUNK_ACK {
            return Err(DaError::transfer(format!(
                "expected zero ack, got {} bytes",
                ack.payload.len()
            )));
        }
    }
    debug!(bytes = sent, "Send complete");
    Ok(sent)
}

/// V6 upload sub-flow (device to host), entered after the device issued
/// `CMD:UPLOAD-FILE`. The host acks, the device announces `OK@0x<size>`,
/// the host acks again; then per chunk the device sends a readiness
/// marker, the host acks, the device sends data, the host acks.
///
/// Returns the announced (and received) byte count.
pub fn v6_upload(channel: &mut Channel, sink: &mut dyn Write) -> Result<u64> {
    channel.send_token(TOK_OK)?;
    let total = parse_at_token(&channel.recv()?.payload)?;
    channel.send_token(TOK_OK)?;
    debug!(bytes = total, "Upload announced");

    let mut received: u64 = 0;
    while received < total {
        expect_transfer_token(channel, TOK_OK)?;
        channel.send_token(TOK_OK)?;

        let packet = channel.recv()?;
        let len = packet.payload.len() as u64;
        if received + len > total {
            return Err(DaError::transfer(format!(
                "chunk overruns announced size: {} + {} > {}",
                received, len, total
            )));
        }
        sink.write_all(&packet.payload)
            .map_err(|e| DaError::transfer(format!("sink write failed: {}", e)))?;
        received += len;
        trace!(received, total, "rx chunk");
        channel.send_token(TOK_OK)?;
    }
    debug!(bytes = received, "Upload complete");
    Ok(received)
}

/// V6 download sub-flow (host to device), entered after the device issued
/// `CMD:DOWNLOAD-FILE`. The host acks `OK!`, the device announces
/// `OK@0x<size>`, the host acks `OK!`; then per chunk the device sends
/// `OK@0x<offset>`, the host sends data, the device acks `OK!`.
pub fn v6_download(channel: &mut Channel, spec: &TransferSpec, source: &mut dyn Read) -> Result<u64> {
    channel.send_token(TOK_OK_FLOW)?;
    let announced = parse_at_token(&channel.recv()?.payload)?;
    if announced != spec.total_size {
        return Err(DaError::transfer(format!(
            "device expects 0x{:X} bytes, host has 0x{:X}",
            announced, spec.total_size
        )));
    }
    channel.send_token(TOK_OK_FLOW)?;
    debug!(bytes = announced, "Download announced");

    let mut sent: u64 = 0;
    let mut buf = vec![0u8; spec.chunk_size.max(1)];
    while sent < spec.total_size {
        let offset = parse_at_token(&channel.recv()?.payload)?;
        if offset != sent {
            return Err(DaError::transfer(format!(
                "device at offset 0x{:X}, host at 0x{:X}",
                offset, sent
            )));
        }

        let want = (spec.total_size - sent).min(buf.len() as u64) as usize;
        source
            .read_exact(&mut buf[..want])
            .map_err(|e| DaError::transfer(format!("source ended early: {}", e)))?;
        channel.send(DataType::Message, &buf[..want])?;
        sent += want as u64;
        trace!(sent, total = spec.total_size, "tx chunk");

        expect_transfer_token(channel, TOK_OK_FLOW)?;
    }
    debug!(bytes = sent, "Download complete");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn channel_with(mock: MockTransport) -> Channel {
        Channel::new(Box::new(mock))
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        assert_eq!(TransferSpec::device_to_host(10, 4).chunk_count(), 3);
        assert_eq!(TransferSpec::device_to_host(8, 4).chunk_count(), 2);
        assert_eq!(TransferSpec::device_to_host(0, 4).chunk_count(), 0);
    }

    #[test]
    fn test_v5_receive_acks_every_chunk() {
        let mut mock = MockTransport::new();
        mock.queue_packet(DataType::Message, &[0xAA; 4]);
        mock.queue_packet(DataType::Message, &[0xBB; 4]);
        mock.queue_packet(DataType::Message, &[0xCC; 2]);

        let handle = mock.clone();
        let mut channel = channel_with(mock);
        let spec = TransferSpec::device_to_host(10, 4);
        let mut out = Vec::new();
        let n = v5_receive(&mut channel, &spec, &mut out).unwrap();

        assert_eq!(n, 10);
        assert_eq!(out.len(), 10);
        assert_eq!(&out[8..], &[0xCC, 0xCC]);
        // Three acks, each a header write followed by the zero payload.
        let acks: Vec<_> = handle
            .writes()
            .into_iter()
            .filter(|w| w.as_slice() == V5_CHUNK_ACK)
            .collect();
        assert_eq!(acks.len(), 3);
    }

    #[test]
    fn test_v5_receive_rejects_overrun_chunk() {
        let mut mock = MockTransport::new();
        mock.queue_packet(DataType::Message, &[0u8; 8]);

        let mut channel = channel_with(mock);
        let spec = TransferSpec::device_to_host(6, 8);
        let mut out = Vec::new();
        let err = v5_receive(&mut channel, &spec, &mut out).unwrap_err();
        assert!(matches!(err, DaError::Transfer(_)));
    }

    #[test]
    fn test_v5_send_waits_for_zero_acks() {
        let mut mock = MockTransport::new();
        mock.queue_status(0);
        mock.queue_status(0);

        let mut channel = channel_with(mock);
        let spec = TransferSpec::host_to_device(6, 4);
        let mut source = &b"abcdef"[..];
        let n = v5_send(&mut channel, &spec, &mut source).unwrap();
        assert_eq!(n, 6);
    }

    #[test]
    fn test_v5_send_short_source_is_transfer_error() {
        let mut mock = MockTransport::new();
        mock.queue_status(0);

        let mut channel = channel_with(mock);
        let spec = TransferSpec::host_to_device(8, 4);
        let mut source = &b"abc"[..];
        let err = v5_send(&mut channel, &spec, &mut source).unwrap_err();
        assert!(matches!(err, DaError::Transfer(_)));
    }

    #[test]
    fn test_v6_upload() {
        let mut mock = MockTransport::new();
        mock.queue_token(b"OK@0x6");
        mock.queue_token(TOK_OK);
        mock.queue_packet(DataType::Message, b"abcd");
        mock.queue_token(TOK_OK);
        mock.queue_packet(DataType::Message, b"ef");

        let mut channel = channel_with(mock);
        let mut out = Vec::new();
        let n = v6_upload(&mut channel, &mut out).unwrap();
        assert_eq!(n, 6);
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_v6_upload_bad_readiness_token() {
        let mut mock = MockTransport::new();
        mock.queue_token(b"OK@0x4");
        mock.queue_token(b"ERR\0");

        let mut channel = channel_with(mock);
        let mut out = Vec::new();
        let err = v6_upload(&mut channel, &mut out).unwrap_err();
        assert!(matches!(err, DaError::Transfer(_)));
    }

    #[test]
    fn test_v6_download_tracks_offsets() {
        let mut mock = MockTransport::new();
        mock.queue_token(b"OK@0x6");
        mock.queue_token(b"OK@0x0");
        mock.queue_token(TOK_OK_FLOW);
        mock.queue_token(b"OK@0x4");
        mock.queue_token(TOK_OK_FLOW);

        let mut channel = channel_with(mock);
        let spec = TransferSpec::host_to_device(6, 4);
        let mut source = &b"abcdef"[..];
        let n = v6_download(&mut channel, &spec, &mut source).unwrap();
        assert_eq!(n, 6);
    }

    #[test]
    fn test_v6_download_size_mismatch() {
        let mut mock = MockTransport::new();
        mock.queue_token(b"OK@0x10");

        let mut channel = channel_with(mock);
        let spec = TransferSpec::host_to_device(6, 4);
        let mut source = &b"abcdef"[..];
        let err = v6_download(&mut channel, &spec, &mut source).unwrap_err();
        assert!(matches!(err, DaError::Transfer(_)));
    }

    #[test]
    fn test_at_token_parse() {
        assert_eq!(parse_at_token(b"OK@0x1F4").unwrap(), 0x1F4);
        assert_eq!(parse_at_token(b"OK@0x0\0").unwrap(), 0);
        assert!(parse_at_token(b"OK!").is_err());
        assert!(parse_at_token(b"OK@0xZZ").is_err());
    }
}
