//! V5 (XFlash) command engine.
//!
//! Binary commands: every command id, parameter and payload is a framed
//! packet, and the device acknowledges each with a u32 status word. A
//! non-success status at a command boundary is a device error the caller
//! may recover from; an unexpected response shape is a protocol error and
//! the session must be reopened.

use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, warn};

use crate::error::{DaError, DeviceFailure, Result};
use crate::handler::HostHandler;
use crate::progress::ProgressStream;
use crate::protocol::constants::{
    Cmd, DevCtrl, STATUS_UNSUPPORTED_CMD, STATUS_UNSUPPORTED_CTRL_CODE,
};
use crate::protocol::packet::{Channel, DataType};
use crate::protocol::status::StatusWord;
use crate::transfer::{self, TransferSpec};

use super::{BootMode, CommandEngine, Generation, LockState};

/// Partition names travel as fixed 64-byte NUL-padded blocks.
const NAME_BLOCK_SIZE: usize = 64;

/// Shutdown parameter values.
const SHUTDOWN_POWER_OFF: u32 = 0;
const SHUTDOWN_REBOOT: u32 = 1;
const SHUTDOWN_HOME_SCREEN: u32 = 2;
const SHUTDOWN_FASTBOOT: u32 = 3;

/// SetMetaBootMode parameter values.
const META_MODE_META: u32 = 1;
const META_MODE_TEST: u32 = 2;

pub struct XFlashEngine {
    channel: Channel,
    handler: Arc<dyn HostHandler>,
}

impl XFlashEngine {
    /// Wrap an open channel and negotiate the packet length. Devices that
    /// do not implement the getter keep the default chunk size.
    pub fn new(channel: Channel, handler: Arc<dyn HostHandler>) -> Result<Self> {
        let mut engine = Self { channel, handler };

        match engine.devctrl_get(DevCtrl::GetPacketLength) {
            Ok(raw) if raw.len() >= 8 => {
                let write_len = LittleEndian::read_u32(&raw[0..4]) as usize;
                let read_len = LittleEndian::read_u32(&raw[4..8]) as usize;
                debug!(write_len, read_len, "Negotiated packet length");
                engine.channel.set_write_chunk(write_len);
            }
            Ok(raw) => {
                warn!(len = raw.len(), "Short packet-length reply, keeping default");
            }
            Err(DaError::Unsupported) | Err(DaError::Device(_)) => {
                debug!("Packet-length getter not supported, keeping default");
            }
            Err(e) => return Err(e),
        }

        Ok(engine)
    }

    fn status(&mut self) -> Result<StatusWord> {
        Ok(StatusWord::from_raw(self.channel.recv()?.as_u32()?))
    }

    /// Read a status word and classify it: success passes, the two
    /// "not implemented" words map to `Unsupported`, everything else is a
    /// device failure.
    fn check_status(&mut self) -> Result<()> {
        let status = self.status()?;
        if status.is_ok() {
            return Ok(());
        }
        match status.raw() {
            STATUS_UNSUPPORTED_CMD | STATUS_UNSUPPORTED_CTRL_CODE => Err(DaError::Unsupported),
            _ => Err(DaError::Device(DeviceFailure::Status(status))),
        }
    }

    fn send_cmd(&mut self, cmd: Cmd) -> Result<()> {
        debug!(cmd = ?cmd, "Command");
        self.channel
            .send(DataType::ProtocolFlow, &(cmd as u32).to_le_bytes())?;
        self.check_status()
    }

    /// Send one command parameter and collect its ack.
    fn send_param(&mut self, param: &[u8]) -> Result<()> {
        self.channel.send(DataType::ProtocolFlow, param)?;
        self.check_status()
    }

    /// Open the secondary dispatch: DeviceCtrl id, ack, sub-id, ack.
    fn devctrl(&mut self, ctrl: DevCtrl) -> Result<()> {
        self.send_cmd(Cmd::DeviceCtrl)?;
        debug!(ctrl = ?ctrl, "DeviceCtrl");
        self.send_param(&(ctrl as u32).to_le_bytes())
    }

    /// Setter-style control: one payload toward the device, final ack.
    fn devctrl_set(&mut self, ctrl: DevCtrl, payload: &[u8]) -> Result<()> {
        self.devctrl(ctrl)?;
        self.channel.send(DataType::ProtocolFlow, payload)?;
        self.check_status()
    }

    /// Getter-style control: one payload from the device, final ack.
    fn devctrl_get(&mut self, ctrl: DevCtrl) -> Result<Vec<u8>> {
        self.devctrl(ctrl)?;
        let payload = self.channel.recv()?.payload;
        self.check_status()?;
        Ok(payload)
    }

    /// Control with no payload in either direction.
    fn devctrl_query(&mut self, ctrl: DevCtrl) -> Result<()> {
        self.devctrl(ctrl)?;
        self.check_status()
    }

    fn name_block(name: &str) -> Result<[u8; NAME_BLOCK_SIZE]> {
        let bytes = name.as_bytes();
        if bytes.len() >= NAME_BLOCK_SIZE {
            return Err(DaError::proto(format!(
                "partition name too long: {:?}",
                name
            )));
        }
        let mut block = [0u8; NAME_BLOCK_SIZE];
        block[..bytes.len()].copy_from_slice(bytes);
        Ok(block)
    }

    fn addr_len_param(addr: u64, len: u64) -> [u8; 16] {
        let mut param = [0u8; 16];
        LittleEndian::write_u64(&mut param[0..8], addr);
        LittleEndian::write_u64(&mut param[8..16], len);
        param
    }

    /// Drain the progress sequence of a long-running command, forwarding
    /// percentages to the host handler.
    fn drain_progress(&mut self) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        ProgressStream::v5(&mut self.channel).drain(&mut |pct| handler.on_progress(pct))
    }
}

impl CommandEngine for XFlashEngine {
    fn generation(&self) -> Generation {
        Generation::V5
    }

    fn partition_table(&mut self) -> Result<Vec<u8>> {
        self.devctrl_get(DevCtrl::GetPartitionTblCata)
    }

    fn read_partition(&mut self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        info!(partition = name, "Read partition");
        self.send_cmd(Cmd::Upload)?;
        self.send_param(&Self::name_block(name)?)?;

        // The device announces the partition length before the data.
        let announce = self.channel.recv()?.payload;
        if announce.len() != 8 {
            return Err(DaError::proto(format!(
                "expected 8-byte length announcement, got {} bytes",
                announce.len()
            )));
        }
        let total = LittleEndian::read_u64(&announce);

        let spec = TransferSpec::device_to_host(total, self.channel.write_chunk());
        let received = transfer::v5_receive(&mut self.channel, &spec, sink)?;
        self.check_status()?;
        Ok(received)
    }

    fn write_partition(&mut self, name: &str, size: u64, source: &mut dyn Read) -> Result<()> {
        info!(partition = name, size, "Write partition");
        self.devctrl_query(DevCtrl::StartDlInfo)?;

        self.send_cmd(Cmd::Download)?;
        self.send_param(&Self::name_block(name)?)?;
        self.send_param(&size.to_le_bytes())?;

        let spec = TransferSpec::host_to_device(size, self.channel.write_chunk());
        transfer::v5_send(&mut self.channel, &spec, source)?;
        self.check_status()?;

        self.devctrl_query(DevCtrl::EndDlInfo)
    }

    fn read_flash(&mut self, addr: u64, len: u64, sink: &mut dyn Write) -> Result<u64> {
        info!(addr = %format!("0x{:X}", addr), len, "Read flash");
        self.send_cmd(Cmd::ReadData)?;
        self.send_param(&Self::addr_len_param(addr, len))?;

        let spec = TransferSpec::device_to_host(len, self.channel.write_chunk());
        let received = transfer::v5_receive(&mut self.channel, &spec, sink)?;
        self.check_status()?;
        Ok(received)
    }

    fn write_flash(&mut self, addr: u64, size: u64, source: &mut dyn Read) -> Result<()> {
        info!(addr = %format!("0x{:X}", addr), size, "Write flash");
        self.devctrl_query(DevCtrl::StartDlInfo)?;

        self.send_cmd(Cmd::WriteData)?;
        self.send_param(&Self::addr_len_param(addr, size))?;

        let spec = TransferSpec::host_to_device(size, self.channel.write_chunk());
        transfer::v5_send(&mut self.channel, &spec, source)?;
        self.check_status()?;

        self.devctrl_query(DevCtrl::EndDlInfo)
    }

    fn erase_partition(&mut self, name: &str) -> Result<()> {
        info!(partition = name, "Erase partition");
        self.send_cmd(Cmd::FormatPartition)?;
        self.send_param(&Self::name_block(name)?)?;
        self.drain_progress()
    }

    fn erase_flash(&mut self, addr: u64, len: u64) -> Result<()> {
        info!(addr = %format!("0x{:X}", addr), len, "Erase flash");
        self.send_cmd(Cmd::Format)?;
        self.send_param(&Self::addr_len_param(addr, len))?;
        self.drain_progress()
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("Shutdown");
        self.send_cmd(Cmd::Shutdown)?;
        self.send_param(&SHUTDOWN_POWER_OFF.to_le_bytes())
    }

    fn reboot(&mut self, mode: BootMode) -> Result<()> {
        info!(mode = ?mode, "Reboot");
        let shutdown_mode = match mode {
            BootMode::Normal => SHUTDOWN_REBOOT,
            BootMode::HomeScreen => SHUTDOWN_HOME_SCREEN,
            BootMode::Fastboot => SHUTDOWN_FASTBOOT,
            BootMode::Meta => {
                self.devctrl_set(DevCtrl::SetMetaBootMode, &META_MODE_META.to_le_bytes())?;
                SHUTDOWN_REBOOT
            }
            BootMode::Test => {
                self.devctrl_set(DevCtrl::SetMetaBootMode, &META_MODE_TEST.to_le_bytes())?;
                SHUTDOWN_REBOOT
            }
        };
        self.send_cmd(Cmd::Shutdown)?;
        self.send_param(&shutdown_mode.to_le_bytes())
    }

    fn peek(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        debug!(addr = %format!("0x{:X}", addr), len, "Peek");
        self.devctrl(DevCtrl::ExtReadMem)?;

        let mut param = [0u8; 12];
        LittleEndian::write_u64(&mut param[0..8], addr);
        LittleEndian::write_u32(&mut param[8..12], len as u32);
        self.send_param(&param)?;

        let payload = self.channel.recv()?.payload;
        self.check_status()?;

        if payload.len() != len {
            return Err(DaError::proto(format!(
                "peek returned {} bytes, wanted {}",
                payload.len(),
                len
            )));
        }
        Ok(payload)
    }

    fn set_seccfg(&mut self, state: LockState) -> Result<()> {
        info!(state = ?state, "Set seccfg");
        let flag: u32 = match state {
            LockState::Unlock => 0,
            LockState::Lock => 1,
        };
        self.devctrl_set(DevCtrl::ExtSetSeccfg, &flag.to_le_bytes())
    }
}
