//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{Transport, TransportError};
use crate::protocol::packet::{DataType, Packet};

struct Inner {
    /// Queued device-to-host bytes.
    rx: VecDeque<u8>,
    /// Captured host-to-device writes, one entry per `write_all`.
    writes: Vec<Vec<u8>>,
    /// Whether the device is "connected".
    connected: bool,
}

/// Scripted in-memory transport for unit testing engine logic.
///
/// Tests queue the device-side byte stream up front; the engine consumes
/// it with `read_exact` while every `write_all` is captured for
/// assertions. State is shared between clones, so a test can hand one
/// clone to the code under test and keep another for inspection.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rx: VecDeque::new(),
                writes: Vec::new(),
                connected: true,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Queue raw bytes to be returned on subsequent reads.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
    }

    /// Queue a framed packet.
    pub fn queue_packet(&mut self, data_type: DataType, payload: &[u8]) {
        self.queue_bytes(&Packet::encode(data_type, payload));
    }

    /// Queue a V5 status packet.
    pub fn queue_status(&mut self, status: u32) {
        self.queue_packet(DataType::ProtocolFlow, &status.to_le_bytes());
    }

    /// Queue a V6 ack-token packet.
    pub fn queue_token(&mut self, token: &[u8]) {
        self.queue_packet(DataType::ProtocolFlow, token);
    }

    /// Queue a V6 XML document packet.
    pub fn queue_xml(&mut self, xml: &str) {
        self.queue_packet(DataType::ProtocolFlow, xml.as_bytes());
    }

    /// All captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Bytes queued but not yet read.
    pub fn unread_len(&self) -> usize {
        self.lock().rx.len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&mut self) {
        self.lock().connected = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::Disconnected);
        }
        if inner.rx.len() < buf.len() {
            // Nothing more scripted: behave like a read timeout.
            return Err(TransportError::Timeout { timeout_ms: 5000 });
        }
        for slot in buf.iter_mut() {
            *slot = inner.rx.pop_front().unwrap();
        }
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::Disconnected);
        }
        inner.writes.push(data.to_vec());
        Ok(())
    }
}
