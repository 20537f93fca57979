//! Transport layer abstraction.
//!
//! The DA protocol runs over any ordered byte stream (USB bulk endpoints
//! or a UART bridge). The `Transport` trait is that stream; a session owns
//! exactly one transport for its whole life.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An exclusively owned, ordered byte stream to the device.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
/// - Future alternative backends (UART)
pub trait Transport: Send {
    /// Read exactly `buf.len()` bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Write all of `data`.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Flush any buffered writes.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
