//! Host-side callbacks for device-initiated requests.
//!
//! While executing a V6 command the device may assert control requests of
//! its own: ask whether a host file exists, ask for its size, or request
//! memory. Host policy for these lives behind `HostHandler`, passed in at
//! session open, instead of inside the protocol state machine. Denying a
//! request is a legitimate protocol outcome (the DA treats the host as a
//! plain flash tool), not an error.

/// Callbacks a session invokes on behalf of the device.
///
/// Every method has a deny/no-op default.
pub trait HostHandler: Send + Sync {
    /// `CMD:FILE-SYS-OPERATION` existence query.
    fn file_exists(&self, _path: &str) -> bool {
        false
    }

    /// `CMD:FILE-SYS-OPERATION` size query; `None` denies.
    fn file_size(&self, _path: &str) -> Option<u64> {
        None
    }

    /// `CMD:RAM-REQUEST`: may the device claim `size` bytes of scratch RAM.
    fn alloc_ram(&self, _size: u64) -> bool {
        false
    }

    /// Progress notification for the in-flight operation, 0..=100.
    fn on_progress(&self, _percentage: u8) {}
}

/// Denies every device request and discards progress.
pub struct DenyAll;

impl HostHandler for DenyAll {}

/// Denies device requests but logs progress through `tracing`.
pub struct TracingHandler;

impl HostHandler for TracingHandler {
    fn on_progress(&self, percentage: u8) {
        tracing::debug!(progress = %format!("{}%", percentage), "Progress");
    }
}
