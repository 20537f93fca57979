//! Protocol constants shared by both DA generations.
//!
//! The V6 ack tokens are a verbatim constant table: the exact byte
//! sequences (including trailing NULs) were validated against captures,
//! and the engine compares them exactly rather than accepting near-matches.

/// Packet header magic, both generations.
pub const PACKET_MAGIC: u32 = 0xFEEE_EEEF;

/// Packet header size in bytes (magic + data_type + length).
pub const PACKET_HEADER_SIZE: usize = 12;

/// Default write chunk cap before packet-length negotiation.
pub const DEFAULT_CHUNK_SIZE: usize = 0x8000;

// ============================================================================
// V5 status words
// ============================================================================

/// In-flight progress notification sentinel.
pub const STATUS_PROGRESS: u32 = 0x4004_0004;

/// Terminal progress sentinel, followed by the final status.
pub const STATUS_PROGRESS_END: u32 = 0x4004_0005;

/// V5 "unsupported command" status.
pub const STATUS_UNSUPPORTED_CMD: u32 = 0xC001_0003;

/// V5 "unsupported device-control code" status.
pub const STATUS_UNSUPPORTED_CTRL_CODE: u32 = 0xC001_0004;

/// V5 transfer chunk acknowledgement payload.
pub const V5_CHUNK_ACK: [u8; 4] = [0, 0, 0, 0];

// ============================================================================
// V5 major commands
// ============================================================================

/// V5 major command ids. `DeviceCtrl` switches to the secondary
/// [`DevCtrl`] dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Cmd {
    Download = 0x01_0001,
    Upload = 0x01_0002,
    Format = 0x01_0003,
    WriteData = 0x01_0004,
    ReadData = 0x01_0005,
    FormatPartition = 0x01_0006,
    Shutdown = 0x01_0007,
    BootTo = 0x01_0008,
    DeviceCtrl = 0x01_0009,
    InitExtRam = 0x01_000A,
    SwitchUsbSpeed = 0x01_000B,
}

/// V5 device-control ids. Each id belongs to one numeric family; the
/// extension family is only present once DA extensions have booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DevCtrl {
    // Setters
    SetChecksumLevel = 0x02_0003,
    SetHostInfo = 0x02_0005,
    SetMetaBootMode = 0x02_0006,

    // Getters
    GetEmmcInfo = 0x04_0001,
    GetDaVersion = 0x04_0005,
    GetPacketLength = 0x04_0007,
    GetRandomId = 0x04_0008,
    GetPartitionTblCata = 0x04_0009,
    GetUsbSpeed = 0x04_000B,
    GetChipId = 0x04_000D,

    // Download control
    StartDlInfo = 0x08_0001,
    EndDlInfo = 0x08_0002,
    ActLockOtpZone = 0x08_0003,
    DisableEmmcHwResetPin = 0x08_0004,

    // Extensions (privileged, present only after extension boot)
    ExtAck = 0x0F_0000,
    ExtReadMem = 0x0F_0001,
    ExtReadRegister = 0x0F_0002,
    ExtWriteRegister = 0x0F_0004,
    ExtSetSeccfg = 0x0F_0006,

    // Storage control
    StorageLifeCycleCheck = 0x10_0001,
    StorageSwitchPart = 0x10_0002,
}

/// Device-control command families, derived from the id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlFamily {
    Setter,
    Getter,
    DownloadCtrl,
    StorageCtrl,
    Extension,
}

impl DevCtrl {
    pub fn family(self) -> CtrlFamily {
        match (self as u32) >> 16 {
            0x02 => CtrlFamily::Setter,
            0x04 => CtrlFamily::Getter,
            0x08 => CtrlFamily::DownloadCtrl,
            0x0F => CtrlFamily::Extension,
            _ => CtrlFamily::StorageCtrl,
        }
    }
}

// ============================================================================
// V6 command strings (host -> device)
// ============================================================================

pub const CMD_READ_PARTITION: &str = "CMD:READ-PARTITION";
pub const CMD_WRITE_PARTITION: &str = "CMD:WRITE-PARTITION";
pub const CMD_READ_FLASH: &str = "CMD:READ-FLASH";
pub const CMD_WRITE_FLASH: &str = "CMD:WRITE-FLASH";
pub const CMD_ERASE_PARTITION: &str = "CMD:ERASE-PARTITION";
pub const CMD_ERASE_FLASH: &str = "CMD:ERASE-FLASH";
pub const CMD_REBOOT: &str = "CMD:REBOOT";
pub const CMD_SET_BOOT_MODE: &str = "CMD:SET-BOOT-MODE";
pub const CMD_NOTIFY_INIT_HW: &str = "CMD:NOTIFY-INIT-HW";
pub const CMD_READ_MEM: &str = "CMD:READ-MEM";
pub const CMD_SET_SECCFG: &str = "CMD:SET-SECCFG";

// ============================================================================
// V6 command strings (device -> host)
// ============================================================================

pub const CMD_UPLOAD_FILE: &str = "CMD:UPLOAD-FILE";
pub const CMD_DOWNLOAD_FILE: &str = "CMD:DOWNLOAD-FILE";
pub const CMD_PROGRESS_REPORT: &str = "CMD:PROGRESS-REPORT";
pub const CMD_FILE_SYS_OPERATION: &str = "CMD:FILE-SYS-OPERATION";
pub const CMD_RAM_REQUEST: &str = "CMD:RAM-REQUEST";
pub const CMD_END: &str = "CMD:END";

// ============================================================================
// V6 ack tokens
// ============================================================================

/// Generic flow ack.
pub const TOK_OK: &[u8] = b"OK\0";

/// Generic flow deny/failure.
pub const TOK_ERR: &[u8] = b"ERR\0";

/// Transfer sub-flow ack (download direction and progress sub-flow).
pub const TOK_OK_FLOW: &[u8] = b"OK!";

/// End of a progress sub-flow.
pub const TOK_EOT: &[u8] = b"OK!EOT\0";

/// Size/offset announcement prefix, followed by a hex value.
pub const TOK_AT_PREFIX: &str = "OK@0x";

/// Progress notification prefix, followed by a decimal percentage.
pub const TOK_PROGRESS_PREFIX: &str = "OK!PROGRESS@";

/// Command rejected: the required extension did not load.
pub const TOK_ERR_UNSUPPORTED: &str = "ERR!UNSUPPORTED";

/// Operation cancelled on the device side.
pub const TOK_ERR_CANCEL: &str = "ERR!CANCEL";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devctrl_families() {
        assert_eq!(DevCtrl::SetMetaBootMode.family(), CtrlFamily::Setter);
        assert_eq!(DevCtrl::GetPacketLength.family(), CtrlFamily::Getter);
        assert_eq!(DevCtrl::StartDlInfo.family(), CtrlFamily::DownloadCtrl);
        assert_eq!(DevCtrl::StorageSwitchPart.family(), CtrlFamily::StorageCtrl);
        assert_eq!(DevCtrl::ExtSetSeccfg.family(), CtrlFamily::Extension);
    }
}
