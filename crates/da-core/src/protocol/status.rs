//! V5 status word decomposition and V6 error-text decoding.
//!
//! A V5 status word layers three fields:
//!
//! * severity, the top two bits: Success (0), Info (1), Warning (2),
//!   Error (3)
//! * domain, bits 29..16: which component produced the code
//! * code, the low 16 bits, specific to the domain
//!
//! Example: `0xC0070004` is Error | DA (7) | code 4, the DA2 hash
//! mismatch report. Decomposition is total: unknown domains and codes
//! are carried through as opaque integers, never rejected.

use std::fmt;

use crate::protocol::constants::{TOK_ERR_CANCEL, TOK_ERR_UNSUPPORTED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Success => write!(f, "Success"),
            Severity::Info => write!(f, "Info"),
            Severity::Warning => write!(f, "Warning"),
            Severity::Error => write!(f, "Error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Common,
    Security,
    Library,
    /// Storage, DRAM, eFuses.
    Device,
    Host,
    Brom,
    Da,
    Preloader,
    /// Preserved verbatim for values outside the known table.
    Other(u16),
}

impl Domain {
    fn from_field(field: u16) -> Self {
        match field {
            1 => Domain::Common,
            2 => Domain::Security,
            3 => Domain::Library,
            4 => Domain::Device,
            5 => Domain::Host,
            6 => Domain::Brom,
            7 => Domain::Da,
            8 => Domain::Preloader,
            other => Domain::Other(other),
        }
    }

    fn field(self) -> u16 {
        match self {
            Domain::Common => 1,
            Domain::Security => 2,
            Domain::Library => 3,
            Domain::Device => 4,
            Domain::Host => 5,
            Domain::Brom => 6,
            Domain::Da => 7,
            Domain::Preloader => 8,
            Domain::Other(other) => other,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Common => write!(f, "Common"),
            Domain::Security => write!(f, "Security"),
            Domain::Library => write!(f, "Library"),
            Domain::Device => write!(f, "Device"),
            Domain::Host => write!(f, "Host"),
            Domain::Brom => write!(f, "BROM"),
            Domain::Da => write!(f, "DA"),
            Domain::Preloader => write!(f, "Preloader"),
            Domain::Other(other) => write!(f, "Domain({})", other),
        }
    }
}

/// A decomposed 32-bit V5 status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord {
    raw: u32,
}

impl StatusWord {
    pub const OK: StatusWord = StatusWord { raw: 0 };

    pub fn from_raw(raw: u32) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn severity(&self) -> Severity {
        match self.raw >> 30 {
            0 => Severity::Success,
            1 => Severity::Info,
            2 => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn domain(&self) -> Domain {
        Domain::from_field(((self.raw >> 16) & 0x3FFF) as u16)
    }

    pub fn code(&self) -> u16 {
        (self.raw & 0xFFFF) as u16
    }

    pub fn is_ok(&self) -> bool {
        self.severity() == Severity::Success
    }

    /// Recompose the three fields into the original word.
    pub fn recompose(severity: Severity, domain: Domain, code: u16) -> u32 {
        let sev = match severity {
            Severity::Success => 0u32,
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Error => 3,
        };
        (sev << 30) | ((domain.field() as u32) << 16) | code as u32
    }

    /// Human-readable text for the well-known codes; `None` for the rest.
    pub fn describe(&self) -> Option<&'static str> {
        let text = match self.raw {
            0xC001_0001 => "generic error",
            0xC001_0002 => "abort",
            0xC001_0003 => "unsupported command",
            0xC001_0004 => "unsupported devctrl code",
            0xC001_0005 => "protocol error",
            0xC001_0007 => "insufficient buffer",
            0xC002_002E => "seccfg not found",
            0xC002_0030 => "seccfg is invalid",
            0xC004_0006 => "partition not found",
            0xC004_0007 => "failed to read partition table",
            0xC005_0003 => "download exception",
            0xC005_0004 => "upload exception",
            0xC007_0004 => "DA2 hash does not match hash in DA1",
            _ => return None,
        };
        Some(text)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/0x{:04X} (0x{:08X})",
            self.severity(),
            self.domain(),
            self.code(),
            self.raw
        )?;
        if let Some(text) = self.describe() {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

/// A V6 protocol error delivered as free text in the `message` field of
/// `CMD:END`. The protocol guarantees no structure beyond the two
/// well-known tokens, so everything else is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetail {
    Unsupported,
    Cancelled,
    Other(String),
}

/// Decode a free-text error payload, trimming trailing NUL filler.
pub fn decode_text(raw: &[u8]) -> ErrorDetail {
    let message = std::str::from_utf8(raw).unwrap_or("invalid UTF-8");
    let message = message.trim_end_matches('\0');

    match message {
        TOK_ERR_UNSUPPORTED => ErrorDetail::Unsupported,
        TOK_ERR_CANCEL => ErrorDetail::Cancelled,
        other => ErrorDetail::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_da_hash_mismatch() {
        let status = StatusWord::from_raw(0xC0070004);
        assert_eq!(status.severity(), Severity::Error);
        assert_eq!(status.domain(), Domain::Da);
        assert_eq!(status.code(), 0x4);
    }

    #[test]
    fn test_decode_progress_sentinel() {
        // The Info-class progress sentinel sits in the Device/HW domain (4).
        let status = StatusWord::from_raw(0x40040004);
        assert_eq!(status.severity(), Severity::Info);
        assert_eq!(status.domain(), Domain::Device);
        assert_eq!(status.code(), 0x4);
    }

    #[test]
    fn test_decode_is_total_and_recomposes() {
        // Exhaustive over a spread of inputs, including unknown domains.
        for raw in [
            0u32,
            1,
            0x4004_0005,
            0x8FFF_1234,
            0xC001_0003,
            0xC0FF_FFFF,
            0xDEAD_BEEF,
            u32::MAX,
        ] {
            let status = StatusWord::from_raw(raw);
            let rebuilt =
                StatusWord::recompose(status.severity(), status.domain(), status.code());
            assert_eq!(rebuilt, raw, "recompose mismatch for 0x{:08X}", raw);
        }
    }

    #[test]
    fn test_success_class() {
        assert!(StatusWord::from_raw(0).is_ok());
        assert!(StatusWord::from_raw(0x3FFF_FFFF).is_ok());
        assert!(!StatusWord::from_raw(0x4004_0004).is_ok());
        assert!(!StatusWord::from_raw(0xC007_0004).is_ok());
    }

    #[test]
    fn test_decode_text_tokens() {
        assert_eq!(decode_text(b"ERR!UNSUPPORTED\0"), ErrorDetail::Unsupported);
        assert_eq!(decode_text(b"ERR!CANCEL"), ErrorDetail::Cancelled);
        assert_eq!(
            decode_text(b"partition boot_a missing\0\0"),
            ErrorDetail::Other("partition boot_a missing".to_string())
        );
    }
}
