//! nusb-based USB transport implementation.

use nusb::transfer::{Bulk, In, Out};
use nusb::{list_devices, Interface, MaybeFuture};
use std::io::{Read, Write};
use tracing::{debug, info, instrument};

use super::traits::{Transport, TransportError};

/// USB ports known to expose a DA-mode device, (VID, PID).
pub const KNOWN_DA_PORTS: &[(u16, u16)] = &[
    (0x0E8D, 0x2001), // MediaTek USB Port (DA)
    (0x0E8D, 0x0003), // MediaTek USB Port (BROM, post-jump)
    (0x0E8D, 0x2000), // MediaTek USB Port (Preloader)
    (0x0E8D, 0x20FF), // MediaTek USB Port (Preloader)
];

/// Blocking bulk-endpoint transport over nusb.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
    /// Bytes read off the wire but not yet consumed by `read_exact`.
    residue: Vec<u8>,
    /// Host-side read timeout, reported in timeout errors.
    read_timeout_ms: u64,
}

impl NusbTransport {
    /// Open any known DA-mode device.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            let ids = (device_info.vendor_id(), device_info.product_id());
            if KNOWN_DA_PORTS.contains(&ids) {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: KNOWN_DA_PORTS[0].0,
            pid: KNOWN_DA_PORTS[0].1,
        })
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == 0 {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
            residue: Vec::new(),
            read_timeout_ms: 5000,
        })
    }

    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    pub fn product_id(&self) -> u16 {
        self.pid
    }

    pub fn set_read_timeout(&mut self, ms: u64) {
        self.read_timeout_ms = ms;
    }
}

impl Transport for NusbTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        // Bulk reads arrive in endpoint-sized bursts; buffer the overshoot
        // so framing stays exact.
        while self.residue.len() < buf.len() {
            let ep = self
                .interface
                .endpoint::<Bulk, In>(self.in_endpoint)
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

            let mut reader = ep.reader(4096);
            let mut chunk = vec![0u8; 4096];
            let n = reader.read(&mut chunk).map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    TransportError::Timeout {
                        timeout_ms: self.read_timeout_ms,
                    }
                } else {
                    TransportError::ReadFailed(e.to_string())
                }
            })?;
            if n == 0 {
                return Err(TransportError::Disconnected);
            }
            self.residue.extend_from_slice(&chunk[..n]);
        }

        buf.copy_from_slice(&self.residue[..buf.len()]);
        self.residue.drain(..buf.len());
        debug!(bytes_read = buf.len(), "Read complete");
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096);
        writer
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(())
    }
}
