//! Port discovery
//!
//! Enumerates candidate serial ports and optionally probes them for identity.
//! The [`PortScanner`] trait is the seam: [`SystemPortScanner`] talks to the
//! operating system, tests substitute their own.

use super::channel::{ChannelOptions, TransportChannel};
use super::device::{DeviceId, DeviceInfo, DeviceKind};
use super::error::Result;
use super::session::{DeviceSession, Route, SessionOptions};
use super::transport;
use serde::Serialize;
use serialport::SerialPortType;
use std::sync::Arc;
use tracing::debug;

/// USB vendor id of 3-Space devices
pub const YOST_VID: u16 = 0x2476;

/// A candidate port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComPort {
    pub path: String,
    pub friendly_name: String,
    /// Kind inferred from USB descriptors, when recognisable
    pub kind_guess: Option<DeviceKind>,
}

/// Port enumeration and identification
#[cfg_attr(test, mockall::automock)]
pub trait PortScanner {
    /// Ports that look like 3-Space devices
    fn ports(&self) -> Result<Vec<ComPort>>;

    /// Open `path` briefly and identify the device
    fn probe(&self, path: &str) -> Result<DeviceInfo>;
}

/// Scanner backed by the operating system's port list
#[derive(Debug, Clone)]
pub struct SystemPortScanner {
    baud_rate: u32,
    /// Include ports without a 3-Space USB vendor id
    include_unknown: bool,
}

impl Default for SystemPortScanner {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            include_unknown: false,
        }
    }
}

impl SystemPortScanner {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Also report ports of other vendors
    pub fn include_unknown(mut self, include: bool) -> Self {
        self.include_unknown = include;
        self
    }
}

/// Guess a kind from a USB product string
pub fn guess_kind(product: &str) -> Option<DeviceKind> {
    let p = product.to_ascii_lowercase();
    if p.contains("dongle") {
        Some(DeviceKind::Dongle)
    } else if p.contains("bootloader") {
        Some(DeviceKind::Bootloader)
    } else if p.contains("wireless") {
        Some(DeviceKind::WirelessWired)
    } else if p.contains("data") && p.contains("log") {
        Some(DeviceKind::DataLogger)
    } else if p.contains("embedded") {
        Some(DeviceKind::Embedded)
    } else if p.contains("bluetooth") {
        Some(DeviceKind::Bluetooth)
    } else if p.contains("usb") || p.contains("3-space") {
        Some(DeviceKind::Usb)
    } else {
        None
    }
}

impl PortScanner for SystemPortScanner {
    fn ports(&self) -> Result<Vec<ComPort>> {
        let mut found = Vec::new();
        for info in transport::list_ports()? {
            match info.port_type {
                SerialPortType::UsbPort(usb) if usb.vid == YOST_VID => {
                    let product = usb.product.unwrap_or_default();
                    found.push(ComPort {
                        kind_guess: guess_kind(&product),
                        friendly_name: if product.is_empty() {
                            info.port_name.clone()
                        } else {
                            product
                        },
                        path: info.port_name,
                    });
                }
                _ if self.include_unknown => found.push(ComPort {
                    friendly_name: info.port_name.clone(),
                    path: info.port_name,
                    kind_guess: None,
                }),
                _ => debug!(port = %info.port_name, "Skipping non-3-Space port"),
            }
        }
        Ok(found)
    }

    fn probe(&self, path: &str) -> Result<DeviceInfo> {
        let channel = TransportChannel::open(path, self.baud_rate, ChannelOptions::default())?;
        probe_channel(channel)
    }
}

/// Identify whatever answers on `channel`, then close it
pub fn probe_channel(channel: Arc<TransportChannel>) -> Result<DeviceInfo> {
    let session = DeviceSession::new(
        Route::Wired(channel),
        DeviceKind::Usb,
        SessionOptions::default(),
        None,
    );
    let info = session.identify();
    session.close();
    info
}

/// Ports whose kind matches `mask` (a `DeviceId` kind mask).
///
/// With `probe`, each port is identified and classified by its hardware
/// version; ports that fail to answer are skipped.
pub fn find_ports(scanner: &dyn PortScanner, mask: u32, probe: bool) -> Result<Vec<ComPort>> {
    let mut matched = Vec::new();
    for mut port in scanner.ports()? {
        if probe {
            match scanner.probe(&port.path) {
                Ok(info) => port.kind_guess = info.kind.or(port.kind_guess),
                Err(e) => {
                    debug!(port = %port.path, "Probe failed: {e}");
                    continue;
                }
            }
        }
        let kind_mask = port.kind_guess.map(DeviceKind::mask).unwrap_or(0);
        if kind_mask & mask & DeviceId::ALL_SENSORS != 0 {
            matched.push(port);
        }
    }
    Ok(matched)
}

/// First port whose kind matches `mask`
pub fn first_port(scanner: &dyn PortScanner, mask: u32, probe: bool) -> Result<Option<ComPort>> {
    Ok(find_ports(scanner, mask, probe)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;

    fn port(path: &str, kind: Option<DeviceKind>) -> ComPort {
        ComPort {
            path: path.into(),
            friendly_name: path.into(),
            kind_guess: kind,
        }
    }

    #[test]
    fn test_guess_kind_from_product() {
        assert_eq!(guess_kind("3-Space Wireless Dongle"), Some(DeviceKind::Dongle));
        assert_eq!(guess_kind("3-Space USB"), Some(DeviceKind::Usb));
        assert_eq!(guess_kind("3-Space Data Logger"), Some(DeviceKind::DataLogger));
        assert_eq!(guess_kind("Arduino"), None);
    }

    #[test]
    fn test_find_ports_filters_by_mask() {
        let mut scanner = MockPortScanner::new();
        scanner.expect_ports().returning(|| {
            Ok(vec![
                port("/dev/ttyACM0", Some(DeviceKind::Dongle)),
                port("/dev/ttyACM1", Some(DeviceKind::Usb)),
                port("/dev/ttyACM2", None),
            ])
        });
        scanner.expect_probe().never();

        let sensors = find_ports(&scanner, DeviceId::NO_DONGLE, false).unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].path, "/dev/ttyACM1");

        let dongle = first_port(&scanner, DeviceId::DONGLE, false).unwrap();
        assert_eq!(dongle.map(|p| p.path), Some("/dev/ttyACM0".to_string()));
    }

    #[test]
    fn test_probe_reclassifies_and_skips_silent_ports() {
        let mut scanner = MockPortScanner::new();
        scanner
            .expect_ports()
            .returning(|| Ok(vec![port("/dev/ttyACM0", None), port("/dev/ttyACM1", None)]));
        scanner.expect_probe().returning(|path| {
            if path == "/dev/ttyACM0" {
                Ok(DeviceInfo {
                    kind: Some(DeviceKind::Embedded),
                    ..Default::default()
                })
            } else {
                Err(Error::Timeout(1000))
            }
        });

        let found = find_ports(&scanner, DeviceId::ALL_SENSORS, true).unwrap();
        assert_eq!(found, vec![port("/dev/ttyACM0", Some(DeviceKind::Embedded))]);
    }
}
