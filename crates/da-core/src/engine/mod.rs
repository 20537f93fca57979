//! Command engines.
//!
//! One engine per protocol generation, both implementing [`CommandEngine`].
//! The generation is chosen once at session open; nothing above this
//! module branches on it again.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod xflash;
pub mod xml;

pub use xflash::XFlashEngine;
pub use xml::XmlEngine;

/// DA protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Generation {
    /// XFlash: binary commands, u32 status words.
    V5,
    /// XML: text commands, token acks.
    V6,
}

/// Target state for a reboot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Normal,
    HomeScreen,
    Fastboot,
    Meta,
    Test,
}

/// Seccfg target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Lock,
    Unlock,
}

/// The operation contract shared by both generations.
///
/// Streaming operations take `Read`/`Write` endpoints so partition-sized
/// payloads never have to fit in memory. Read operations return the byte
/// count moved.
pub trait CommandEngine: Send {
    fn generation(&self) -> Generation;

    /// Raw partition-table bytes as the device reports them.
    fn partition_table(&mut self) -> Result<Vec<u8>>;

    fn read_partition(&mut self, name: &str, sink: &mut dyn Write) -> Result<u64>;

    fn write_partition(&mut self, name: &str, size: u64, source: &mut dyn Read) -> Result<()>;

    /// Read `len` bytes of raw flash starting at `addr`.
    fn read_flash(&mut self, addr: u64, len: u64, sink: &mut dyn Write) -> Result<u64>;

    /// Write `size` bytes of raw flash starting at `addr`.
    fn write_flash(&mut self, addr: u64, size: u64, source: &mut dyn Read) -> Result<()>;

    fn erase_partition(&mut self, name: &str) -> Result<()>;

    /// Erase `len` bytes of raw flash starting at `addr`.
    fn erase_flash(&mut self, addr: u64, len: u64) -> Result<()>;

    /// Power the device off. Consumes the engine's usefulness but not the
    /// object; subsequent calls will fail at the transport.
    fn shutdown(&mut self) -> Result<()>;

    fn reboot(&mut self, mode: BootMode) -> Result<()>;

    /// Read `len` bytes of device memory at `addr`. Extension operation;
    /// devices without extensions report it as unsupported.
    fn peek(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Lock or unlock the security configuration. Extension operation.
    fn set_seccfg(&mut self, state: LockState) -> Result<()>;
}
