//! Session: engine selection and operation lifecycle.
//!
//! A session owns the transport for its whole life and executes
//! operations strictly one at a time (`&mut self` receivers, so a second
//! concurrent call is a compile error, not a queued request). Errors that
//! leave the wire state unknown close the session; device-reported
//! failures and unsupported commands do not.
//!
//! There is no protocol-level abort message: cancelling an operation
//! mid-transfer requires dropping the session and reconnecting.

use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{BootMode, CommandEngine, Generation, LockState, XFlashEngine, XmlEngine};
use crate::error::{DaError, Result};
use crate::handler::HostHandler;
use crate::protocol::packet::Channel;
use crate::transport::Transport;

/// Session configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Protocol generation the connected DA speaks.
    pub generation: Generation,
    /// Transfer chunk size; `None` keeps the default (or, for V5, the
    /// negotiated packet length).
    pub chunk_size: Option<usize>,
    /// Host-side read timeout in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            generation: Generation::V6,
            chunk_size: None,
            read_timeout_ms: 5000,
        }
    }
}

impl SessionOptions {
    /// Load options from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: SessionOptions = toml::from_str(&content)?;
        Ok(options)
    }

    /// Save options to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// One open DA connection.
pub struct Session {
    engine: Box<dyn CommandEngine>,
    closed: bool,
}

impl Session {
    /// Select the engine for `options.generation` and run its handshake.
    pub fn open(
        transport: Box<dyn Transport>,
        options: &SessionOptions,
        handler: Arc<dyn HostHandler>,
    ) -> Result<Self> {
        info!(generation = ?options.generation, "Opening session");
        let mut channel = Channel::new(transport);
        if let Some(chunk) = options.chunk_size {
            channel.set_write_chunk(chunk);
        }

        let engine: Box<dyn CommandEngine> = match options.generation {
            Generation::V5 => Box::new(XFlashEngine::new(channel, handler)?),
            Generation::V6 => Box::new(XmlEngine::new(channel, handler)?),
        };

        Ok(Self {
            engine,
            closed: false,
        })
    }

    pub fn generation(&self) -> Generation {
        self.engine.generation()
    }

    /// Run one operation, closing the session on errors that leave the
    /// wire state unknown.
    fn run<T>(&mut self, op: impl FnOnce(&mut dyn CommandEngine) -> Result<T>) -> Result<T> {
        if self.closed {
            return Err(DaError::SessionClosed);
        }
        match op(self.engine.as_mut()) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_fatal() {
                    warn!(error = %e, "Closing session");
                    self.closed = true;
                }
                Err(e)
            }
        }
    }

    pub fn partition_table(&mut self) -> Result<Vec<u8>> {
        self.run(|engine| engine.partition_table())
    }

    pub fn read_partition(&mut self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        self.run(|engine| engine.read_partition(name, sink))
    }

    /// Read every listed partition except those in `skip`, opening one
    /// sink per partition. Stops at the first failure.
    pub fn read_all(
        &mut self,
        partitions: &[String],
        skip: &[String],
        open_sink: &mut dyn FnMut(&str) -> std::io::Result<Box<dyn Write>>,
    ) -> Result<Vec<(String, u64)>> {
        let mut results = Vec::new();
        for name in partitions {
            if skip.iter().any(|s| s == name) {
                info!(partition = %name, "Skipping");
                continue;
            }
            let mut sink = open_sink(name)
                .map_err(|e| DaError::transfer(format!("cannot open sink for {}: {}", name, e)))?;
            let bytes = self.read_partition(name, sink.as_mut())?;
            results.push((name.clone(), bytes));
        }
        Ok(results)
    }

    pub fn write_partition(&mut self, name: &str, size: u64, source: &mut dyn Read) -> Result<()> {
        self.run(|engine| engine.write_partition(name, size, source))
    }

    pub fn read_flash(&mut self, addr: u64, len: u64, sink: &mut dyn Write) -> Result<u64> {
        self.run(|engine| engine.read_flash(addr, len, sink))
    }

    pub fn write_flash(&mut self, addr: u64, size: u64, source: &mut dyn Read) -> Result<()> {
        self.run(|engine| engine.write_flash(addr, size, source))
    }

    pub fn erase_partition(&mut self, name: &str) -> Result<()> {
        self.run(|engine| engine.erase_partition(name))
    }

    pub fn erase_flash(&mut self, addr: u64, len: u64) -> Result<()> {
        self.run(|engine| engine.erase_flash(addr, len))
    }

    /// Power off and close the session.
    pub fn shutdown(&mut self) -> Result<()> {
        let result = self.run(|engine| engine.shutdown());
        self.closed = true;
        result
    }

    /// Reboot into `mode` and close the session.
    pub fn reboot(&mut self, mode: BootMode) -> Result<()> {
        let result = self.run(|engine| engine.reboot(mode));
        self.closed = true;
        result
    }

    pub fn peek(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.run(|engine| engine.peek(addr, len))
    }

    pub fn set_seccfg(&mut self, state: LockState) -> Result<()> {
        self.run(|engine| engine.set_seccfg(state))
    }

    /// Release the transport. Subsequent operations fail with
    /// [`DaError::SessionClosed`].
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DenyAll;
    use crate::protocol::constants::{TOK_OK, STATUS_UNSUPPORTED_CTRL_CODE};
    use crate::transport::MockTransport;

    fn v5_options() -> SessionOptions {
        SessionOptions {
            generation: Generation::V5,
            ..SessionOptions::default()
        }
    }

    /// Script the V5 packet-length negotiation as unsupported.
    fn queue_v5_handshake(mock: &mut MockTransport) {
        mock.queue_status(0);
        mock.queue_status(STATUS_UNSUPPORTED_CTRL_CODE);
    }

    fn queue_v6_handshake(mock: &mut MockTransport) {
        mock.queue_token(TOK_OK);
        mock.queue_xml("<da><version>1.0</version><command>CMD:END</command><arg></arg></da>");
    }

    #[test]
    fn test_device_error_keeps_session_open() {
        let mut mock = MockTransport::new();
        queue_v5_handshake(&mut mock);
        // FormatPartition rejected at the command boundary.
        mock.queue_status(0xC004_0006);

        let mut session =
            Session::open(Box::new(mock), &v5_options(), Arc::new(DenyAll)).unwrap();
        let err = session.erase_partition("nosuch").unwrap_err();
        assert!(matches!(err, DaError::Device(_)));
        assert!(!session.is_closed());
    }

    #[test]
    fn test_bad_magic_closes_session() {
        let mut mock = MockTransport::new();
        queue_v5_handshake(&mut mock);
        let mut frame = vec![0u8; 12];
        frame[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        mock.queue_bytes(&frame);

        let mut session =
            Session::open(Box::new(mock), &v5_options(), Arc::new(DenyAll)).unwrap();
        let err = session.partition_table().unwrap_err();
        assert!(matches!(err, DaError::Framing(_)));
        assert!(session.is_closed());

        // Every later call fails fast without touching the transport.
        assert!(matches!(
            session.partition_table(),
            Err(DaError::SessionClosed)
        ));
    }

    #[test]
    fn test_unsupported_keeps_v6_session_open() {
        let mut mock = MockTransport::new();
        queue_v6_handshake(&mut mock);
        mock.queue_token(b"ERR!UNSUPPORTED\0");

        let options = SessionOptions::default();
        let mut session =
            Session::open(Box::new(mock), &options, Arc::new(DenyAll)).unwrap();
        let err = session.set_seccfg(LockState::Unlock).unwrap_err();
        assert!(matches!(err, DaError::Unsupported));
        assert!(!session.is_closed());
    }

    #[test]
    fn test_read_all_honors_skip_set() {
        let mut mock = MockTransport::new();
        queue_v5_handshake(&mut mock);

        // One Upload exchange for "misc" only.
        mock.queue_status(0); // Upload ack
        mock.queue_status(0); // name ack
        mock.queue_packet(
            crate::protocol::packet::DataType::ProtocolFlow,
            &2u64.to_le_bytes(),
        );
        mock.queue_packet(crate::protocol::packet::DataType::Message, b"ab");
        mock.queue_status(0); // final status

        let mut session =
            Session::open(Box::new(mock), &v5_options(), Arc::new(DenyAll)).unwrap();
        let partitions = vec!["userdata".to_string(), "misc".to_string()];
        let skip = vec!["userdata".to_string()];
        let results = session
            .read_all(&partitions, &skip, &mut |_| Ok(Box::new(Vec::<u8>::new())))
            .unwrap();

        assert_eq!(results, vec![("misc".to_string(), 2)]);
    }

    #[test]
    fn test_options_roundtrip_through_toml() {
        let options = SessionOptions {
            generation: Generation::V5,
            chunk_size: Some(0x1000),
            read_timeout_ms: 2000,
        };
        let text = toml::to_string_pretty(&options).unwrap();
        let parsed: SessionOptions = toml::from_str(&text).unwrap();
        assert_eq!(parsed.generation, Generation::V5);
        assert_eq!(parsed.chunk_size, Some(0x1000));
    }
}
