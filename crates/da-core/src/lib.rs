//! DA-Core: MediaTek Download Agent protocol implementation in Rust.
//!
//! This crate drives a MediaTek device that has already booted a Download
//! Agent (DA), over both protocol generations: V5 "XFlash" (binary
//! commands, u32 status words) and V6 "XML" (XML commands, token acks).
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Packet framing, status words, command tables, XML messages
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Transfer**: Lockstep chunked data loops for both generations
//! - **Progress**: Unified progress-event stream
//! - **Engine**: One command engine per generation behind a shared trait
//! - **Session**: Engine selection and operation lifecycle
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use da_core::handler::TracingHandler;
//! use da_core::session::{Session, SessionOptions};
//! use da_core::transport::NusbTransport;
//!
//! let transport = NusbTransport::open().expect("no DA device");
//! let options = SessionOptions::default();
//! let mut session = Session::open(Box::new(transport), &options, Arc::new(TracingHandler))
//!     .expect("handshake failed");
//!
//! let mut out = Vec::new();
//! session.read_partition("boot_a", &mut out).expect("read failed");
//! ```

pub mod engine;
pub mod error;
pub mod handler;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use engine::{BootMode, CommandEngine, Generation, LockState, XFlashEngine, XmlEngine};
pub use error::{DaError, DeviceFailure, Result};
pub use handler::{DenyAll, HostHandler, TracingHandler};
pub use progress::{ProgressEvent, ProgressStream, ProgressTracker};
pub use protocol::{Channel, DataType, Packet, StatusWord, XmlMessage};
pub use session::{Session, SessionOptions};
pub use transfer::{Direction, TransferSpec};
pub use transport::{MockTransport, NusbTransport, Transport, TransportError};
