//! Error taxonomy for the DA protocol engine.
//!
//! The variants follow the recoverability rules of the protocol:
//! framing and protocol errors are fatal to the session, device-reported
//! failures at a command boundary are not.

use std::fmt;

use thiserror::Error;

use crate::protocol::status::StatusWord;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, DaError>;

#[derive(Error, Debug)]
pub enum DaError {
    /// Bad magic or truncated header/payload. Always fatal to the session.
    #[error("framing error: {0}")]
    Framing(String),

    /// A response arrived in a state that does not expect it. Fatal to the
    /// session; the caller decides whether to reconnect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device reported a failure for the current command. The session
    /// stays usable when this occurs at a command boundary.
    #[error("device error: {0}")]
    Device(DeviceFailure),

    /// Chunk-count or ack mismatch inside a transfer loop.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// `ERR!UNSUPPORTED` or its V5 status equivalent: the command needs
    /// extensions that did not load. Recoverable.
    #[error("command not supported by device")]
    Unsupported,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed XML in a device message.
    #[error("xml error: {0}")]
    Xml(String),

    /// The session was closed or poisoned by a previous fatal error.
    #[error("session closed")]
    SessionClosed,
}

impl DaError {
    pub fn framing<S: Into<String>>(msg: S) -> Self {
        DaError::Framing(msg.into())
    }

    pub fn proto<S: Into<String>>(msg: S) -> Self {
        DaError::Protocol(msg.into())
    }

    pub fn transfer<S: Into<String>>(msg: S) -> Self {
        DaError::Transfer(msg.into())
    }

    pub fn xml<S: Into<String>>(msg: S) -> Self {
        DaError::Xml(msg.into())
    }

    /// Whether the session must be torn down after this error.
    ///
    /// Transfer errors are treated as fatal: there is no protocol-level way
    /// to prove the device-side loop terminated cleanly.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DaError::Device(_) | DaError::Unsupported)
    }
}

/// What the device reported, in the form the active generation produced it:
/// a structured V5 status word or free text from a V6 `CMD:END` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFailure {
    Status(StatusWord),
    Text(String),
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFailure::Status(status) => write!(f, "{}", status),
            DeviceFailure::Text(message) => write!(f, "{}", message),
        }
    }
}
