//! V6 (XML) command engine.
//!
//! Host commands are XML documents acked by a token; while a command
//! executes, the device drives the exchange with XML commands of its own
//! (file transfers, progress, host queries) until `CMD:END`. The engine
//! answers device requests through the session's [`HostHandler`]; denying
//! one is a legitimate protocol outcome, not an error.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{DaError, DeviceFailure, Result};
use crate::handler::HostHandler;
use crate::progress::ProgressStream;
use crate::protocol::constants::{
    CMD_DOWNLOAD_FILE, CMD_END, CMD_ERASE_FLASH, CMD_ERASE_PARTITION, CMD_FILE_SYS_OPERATION,
    CMD_NOTIFY_INIT_HW, CMD_PROGRESS_REPORT, CMD_RAM_REQUEST, CMD_READ_FLASH, CMD_READ_MEM,
    CMD_READ_PARTITION, CMD_REBOOT, CMD_SET_BOOT_MODE, CMD_SET_SECCFG, CMD_UPLOAD_FILE, CMD_WRITE_FLASH,
    CMD_WRITE_PARTITION, TOK_ERR, TOK_OK,
};
use crate::protocol::packet::{Channel, DataType};
use crate::protocol::status::{decode_text, ErrorDetail};
use crate::protocol::xml::XmlMessage;
use crate::transfer::{self, TransferSpec};

use super::{BootMode, CommandEngine, Generation, LockState};

/// The GPT backup partition name used for partition-table reads.
const PGPT_PARTITION: &str = "PGPT";

/// Data endpoint a command execution may consume.
enum Endpoint<'a> {
    /// Command moves no bulk data.
    None,
    /// Device-to-host data lands here.
    Sink(&'a mut dyn Write),
    /// Host-to-device data comes from here, `size` bytes.
    Source {
        source: &'a mut dyn Read,
        size: u64,
    },
}

pub struct XmlEngine {
    channel: Channel,
    handler: Arc<dyn HostHandler>,
}

impl XmlEngine {
    /// Wrap an open channel and notify the device that host-side hardware
    /// setup is done. Old DA builds do not know the notification; that is
    /// tolerated.
    pub fn new(channel: Channel, handler: Arc<dyn HostHandler>) -> Result<Self> {
        let mut engine = Self { channel, handler };

        match engine.send_command(&XmlMessage::new(CMD_NOTIFY_INIT_HW)) {
            Ok(()) => {
                engine.run_to_end(&mut Endpoint::None)?;
            }
            Err(DaError::Unsupported) => {
                debug!("Device does not know CMD:NOTIFY-INIT-HW");
            }
            Err(e) => return Err(e),
        }

        Ok(engine)
    }

    /// Send one host command and collect the immediate ack token.
    fn send_command(&mut self, msg: &XmlMessage) -> Result<()> {
        debug!(command = %msg.command, "Command");
        self.channel
            .send(DataType::ProtocolFlow, msg.to_xml().as_bytes())?;

        let ack = self.channel.recv()?.payload;
        if ack == TOK_OK {
            return Ok(());
        }
        match decode_text(&ack) {
            ErrorDetail::Unsupported => Err(DaError::Unsupported),
            ErrorDetail::Cancelled => {
                Err(DaError::Device(DeviceFailure::Text("cancelled".to_string())))
            }
            ErrorDetail::Other(_) => Err(DaError::proto(format!(
                "unexpected command ack {:?}",
                String::from_utf8_lossy(&ack)
            ))),
        }
    }

    /// Drive the device-led phase of a command until `CMD:END`.
    ///
    /// Returns the number of bulk bytes moved through `endpoint`.
    fn run_to_end(&mut self, endpoint: &mut Endpoint<'_>) -> Result<u64> {
        let mut moved: u64 = 0;
        loop {
            let msg = XmlMessage::parse(&self.channel.recv()?.payload)?;
            debug!(command = %msg.command, "Device command");

            match msg.command.as_str() {
                CMD_UPLOAD_FILE => match endpoint {
                    Endpoint::Sink(sink) => {
                        moved += transfer::v6_upload(&mut self.channel, &mut **sink)?;
                    }
                    _ => {
                        self.channel.send_token(TOK_ERR)?;
                        return Err(DaError::proto("device requested an unexpected upload"));
                    }
                },
                CMD_DOWNLOAD_FILE => match endpoint {
                    Endpoint::Source { source, size } => {
                        let spec =
                            TransferSpec::host_to_device(*size, self.channel.write_chunk());
                        moved += transfer::v6_download(&mut self.channel, &spec, &mut **source)?;
                    }
                    _ => {
                        self.channel.send_token(TOK_ERR)?;
                        return Err(DaError::proto("device requested an unexpected download"));
                    }
                },
                CMD_PROGRESS_REPORT => {
                    self.channel.send_token(TOK_OK)?;
                    let handler = Arc::clone(&self.handler);
                    ProgressStream::v6(&mut self.channel)
                        .drain(&mut |pct| handler.on_progress(pct))?;
                }
                CMD_FILE_SYS_OPERATION => self.answer_file_sys(&msg)?,
                CMD_RAM_REQUEST => self.answer_ram_request(&msg)?,
                CMD_END => {
                    self.channel.send_token(TOK_OK)?;
                    return match msg.message.as_deref() {
                        None | Some("") | Some("OK") => Ok(moved),
                        Some(text) => match decode_text(text.as_bytes()) {
                            ErrorDetail::Unsupported => Err(DaError::Unsupported),
                            ErrorDetail::Cancelled => Err(DaError::Device(DeviceFailure::Text(
                                "cancelled".to_string(),
                            ))),
                            ErrorDetail::Other(text) => {
                                Err(DaError::Device(DeviceFailure::Text(text)))
                            }
                        },
                    };
                }
                other => {
                    return Err(DaError::proto(format!(
                        "unexpected device command {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Answer a host-filesystem query. Everything the handler does not
    /// explicitly allow is denied.
    fn answer_file_sys(&mut self, msg: &XmlMessage) -> Result<()> {
        let operation: String = msg.field("arg/operation")?;
        let path: String = msg.field("arg/file_path").unwrap_or_default();
        debug!(operation = %operation, path = %path, "File system operation");

        match operation.as_str() {
            "EXIST" if self.handler.file_exists(&path) => self.channel.send_token(TOK_OK),
            "SIZE" => match self.handler.file_size(&path) {
                Some(size) => {
                    let token = format!("OK@{:#x}", size);
                    self.channel.send_token(token.as_bytes())
                }
                None => self.channel.send_token(TOK_ERR),
            },
            _ => self.channel.send_token(TOK_ERR),
        }
    }

    /// Answer a scratch-RAM request.
    fn answer_ram_request(&mut self, msg: &XmlMessage) -> Result<()> {
        let size = msg.field_hex("arg/necessary_length").unwrap_or(0);
        if size > 0 && self.handler.alloc_ram(size) {
            self.channel.send_token(TOK_OK)
        } else {
            warn!(size, "Denying RAM request");
            self.channel.send_token(TOK_ERR)
        }
    }

    /// Issue a command with no bulk data phase.
    fn run_simple(&mut self, msg: XmlMessage) -> Result<()> {
        self.send_command(&msg)?;
        self.run_to_end(&mut Endpoint::None)?;
        Ok(())
    }

    fn boot_mode_name(mode: BootMode) -> Option<&'static str> {
        match mode {
            BootMode::Fastboot => Some("FASTBOOT"),
            BootMode::Meta => Some("META"),
            BootMode::Test => Some("TEST"),
            BootMode::Normal | BootMode::HomeScreen => None,
        }
    }
}

impl CommandEngine for XmlEngine {
    fn generation(&self) -> Generation {
        Generation::V6
    }

    fn partition_table(&mut self) -> Result<Vec<u8>> {
        let mut table = Vec::new();
        self.read_partition(PGPT_PARTITION, &mut table)?;
        Ok(table)
    }

    fn read_partition(&mut self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        info!(partition = name, "Read partition");
        let msg = XmlMessage::new(CMD_READ_PARTITION)
            .arg("partition", name)
            .arg("target_file", format!("{}.img", name));
        self.send_command(&msg)?;
        self.run_to_end(&mut Endpoint::Sink(sink))
    }

    fn write_partition(&mut self, name: &str, size: u64, source: &mut dyn Read) -> Result<()> {
        info!(partition = name, size, "Write partition");
        let msg = XmlMessage::new(CMD_WRITE_PARTITION)
            .arg("partition", name)
            .arg("source_file", format!("{}.img", name));
        self.send_command(&msg)?;
        self.run_to_end(&mut Endpoint::Source { source, size })?;
        Ok(())
    }

    fn read_flash(&mut self, addr: u64, len: u64, sink: &mut dyn Write) -> Result<u64> {
        info!(addr = %format!("0x{:X}", addr), len, "Read flash");
        let msg = XmlMessage::new(CMD_READ_FLASH)
            .arg("partition", "EMMC-USER")
            .arg("offset", format!("{:#x}", addr))
            .arg("length", format!("{:#x}", len))
            .arg("target_file", "flash.bin");
        self.send_command(&msg)?;
        self.run_to_end(&mut Endpoint::Sink(sink))
    }

    fn write_flash(&mut self, addr: u64, size: u64, source: &mut dyn Read) -> Result<()> {
        info!(addr = %format!("0x{:X}", addr), size, "Write flash");
        let msg = XmlMessage::new(CMD_WRITE_FLASH)
            .arg("partition", "EMMC-USER")
            .arg("offset", format!("{:#x}", addr))
            .arg("source_file", "flash.bin");
        self.send_command(&msg)?;
        self.run_to_end(&mut Endpoint::Source { source, size })?;
        Ok(())
    }

    fn erase_partition(&mut self, name: &str) -> Result<()> {
        info!(partition = name, "Erase partition");
        self.run_simple(XmlMessage::new(CMD_ERASE_PARTITION).arg("partition", name))
    }

    fn erase_flash(&mut self, addr: u64, len: u64) -> Result<()> {
        info!(addr = %format!("0x{:X}", addr), len, "Erase flash");
        self.run_simple(
            XmlMessage::new(CMD_ERASE_FLASH)
                .arg("partition", "EMMC-USER")
                .arg("offset", format!("{:#x}", addr))
                .arg("length", format!("{:#x}", len)),
        )
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("Shutdown");
        self.run_simple(XmlMessage::new(CMD_REBOOT).arg("action", "POWER-OFF"))
    }

    fn reboot(&mut self, mode: BootMode) -> Result<()> {
        info!(mode = ?mode, "Reboot");
        if let Some(name) = Self::boot_mode_name(mode) {
            self.run_simple(XmlMessage::new(CMD_SET_BOOT_MODE).arg("mode", name))?;
        }
        self.run_simple(XmlMessage::new(CMD_REBOOT).arg("action", "IMMEDIATE"))
    }

    fn peek(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        debug!(addr = %format!("0x{:X}", addr), len, "Peek");
        let msg = XmlMessage::new(CMD_READ_MEM)
            .arg("address", format!("{:#x}", addr))
            .arg("length", format!("{:#x}", len));
        self.send_command(&msg)?;

        let mut out = Vec::new();
        self.run_to_end(&mut Endpoint::Sink(&mut out))?;
        if out.len() != len {
            return Err(DaError::proto(format!(
                "peek returned {} bytes, wanted {}",
                out.len(),
                len
            )));
        }
        Ok(out)
    }

    fn set_seccfg(&mut self, state: LockState) -> Result<()> {
        info!(state = ?state, "Set seccfg");
        let mode = match state {
            LockState::Lock => "LOCK",
            LockState::Unlock => "UNLOCK",
        };
        self.run_simple(XmlMessage::new(CMD_SET_SECCFG).arg("mode", mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DenyAll;
    use crate::transport::MockTransport;

    fn end_ok() -> String {
        "<da><version>1.0</version><command>CMD:END</command><arg></arg></da>".to_string()
    }

    fn end_with(message: &str) -> String {
        format!(
            "<da><version>1.0</version><command>CMD:END</command>\
             <arg><message>{}</message></arg></da>",
            message
        )
    }

    /// Script the hardware-init notification that `new` performs.
    fn queue_init(mock: &mut MockTransport) {
        mock.queue_token(TOK_OK);
        mock.queue_xml(&end_ok());
    }

    fn engine_with(mock: MockTransport) -> XmlEngine {
        XmlEngine::new(Channel::new(Box::new(mock)), Arc::new(DenyAll)).unwrap()
    }

    #[test]
    fn test_init_notification_tolerates_unsupported() {
        let mut mock = MockTransport::new();
        mock.queue_token(b"ERR!UNSUPPORTED\0");
        let engine = engine_with(mock);
        assert_eq!(engine.generation(), Generation::V6);
    }

    #[test]
    fn test_read_partition_via_upload_flow() {
        let mut mock = MockTransport::new();
        queue_init(&mut mock);

        mock.queue_token(TOK_OK); // command ack
        mock.queue_xml(
            "<da><version>1.0</version><command>CMD:UPLOAD-FILE</command><arg></arg></da>",
        );
        mock.queue_token(b"OK@0x6"); // size announcement
        mock.queue_token(TOK_OK); // readiness
        mock.queue_packet(DataType::Message, b"abcd");
        mock.queue_token(TOK_OK); // readiness
        mock.queue_packet(DataType::Message, b"ef");
        mock.queue_xml(&end_ok());

        let mut engine = engine_with(mock);
        let mut out = Vec::new();
        let n = engine.read_partition("seccfg", &mut out).unwrap();
        assert_eq!(n, 6);
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_unsupported_command_leaves_engine_usable() {
        let mut mock = MockTransport::new();
        queue_init(&mut mock);

        // First command is rejected outright.
        mock.queue_token(b"ERR!UNSUPPORTED\0");
        // Second command succeeds.
        mock.queue_token(TOK_OK);
        mock.queue_xml(&end_ok());

        let mut engine = engine_with(mock);
        let err = engine.set_seccfg(LockState::Unlock).unwrap_err();
        assert!(matches!(err, DaError::Unsupported));
        assert!(!err.is_fatal());

        engine.erase_partition("cache").unwrap();
    }

    #[test]
    fn test_end_message_is_device_error() {
        let mut mock = MockTransport::new();
        queue_init(&mut mock);

        mock.queue_token(TOK_OK);
        mock.queue_xml(&end_with("partition boot_x not found"));

        let mut engine = engine_with(mock);
        let err = engine.erase_partition("boot_x").unwrap_err();
        match err {
            DaError::Device(DeviceFailure::Text(text)) => {
                assert!(text.contains("boot_x"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_file_sys_operation_denied_by_default() {
        let mut mock = MockTransport::new();
        queue_init(&mut mock);

        mock.queue_token(TOK_OK);
        mock.queue_xml(
            "<da><version>1.0</version><command>CMD:FILE-SYS-OPERATION</command>\
             <arg><operation>EXIST</operation><file_path>/tmp/x</file_path></arg></da>",
        );
        mock.queue_xml(&end_ok());

        let handle = mock.clone();
        let mut engine = engine_with(mock);
        engine.erase_partition("cache").unwrap();

        // The deny went out as a plain ERR token.
        assert!(handle.writes().iter().any(|w| w.as_slice() == TOK_ERR));
    }

    #[test]
    fn test_progress_report_forwards_to_handler() {
        use std::sync::atomic::{AtomicU8, Ordering};

        struct Last(AtomicU8);
        impl HostHandler for Last {
            fn on_progress(&self, percentage: u8) {
                self.0.store(percentage, Ordering::SeqCst);
            }
        }

        let mut mock = MockTransport::new();
        queue_init(&mut mock);

        mock.queue_token(TOK_OK);
        mock.queue_xml(
            "<da><version>1.0</version><command>CMD:PROGRESS-REPORT</command><arg></arg></da>",
        );
        mock.queue_token(b"OK!PROGRESS@40");
        mock.queue_token(b"OK!PROGRESS@100");
        mock.queue_token(b"OK!EOT\0");
        mock.queue_xml(&end_ok());

        let handler = Arc::new(Last(AtomicU8::new(0)));
        let mut engine =
            XmlEngine::new(Channel::new(Box::new(mock)), handler.clone()).unwrap();
        engine.erase_partition("userdata").unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_unexpected_device_command_is_protocol_error() {
        let mut mock = MockTransport::new();
        queue_init(&mut mock);

        mock.queue_token(TOK_OK);
        mock.queue_xml(
            "<da><version>1.0</version><command>CMD:BOGUS</command><arg></arg></da>",
        );

        let mut engine = engine_with(mock);
        let err = engine.erase_partition("cache").unwrap_err();
        assert!(matches!(err, DaError::Protocol(_)));
        assert!(err.is_fatal());
    }
}
