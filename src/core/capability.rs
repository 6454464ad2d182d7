//! Device Capability Registry
//!
//! Each [`DeviceKind`] declares the command groups it understands. Sessions
//! consult this before any I/O so an unsupported command fails fast with
//! `InvalidCommand` instead of timing out on the wire.

use super::device::DeviceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Command group flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Orientation reads (quaternion, euler, matrix, axis-angle)
    Orientation,
    /// Normalized and corrected sensor reads
    Sensors,
    /// Raw sensor reads
    RawSensors,
    /// Streaming slots, timing, start and stop
    Streaming,
    /// Tare and persistent settings
    Settings,
    /// Axis directions, filter mode, component enables and ranges
    SensorSettings,
    /// Timestamp read/update
    Timestamp,
    /// Pan id, channel and wireless commit
    Wireless,
    /// Dongle-only commands: logical id table, retries, open slots
    Dongle,
    /// Battery voltage and charge
    Battery,
    /// LED color
    Led,
    /// Button state
    Button,
    /// Identification, reset, commit
    System,
}

/// Capability set for one device kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: HashSet<Capability>,
    description: String,
}

impl CapabilitySet {
    /// Create a new empty capability set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create capability set with description
    pub fn with_description(description: &str) -> Self {
        Self {
            capabilities: HashSet::new(),
            description: description.to_string(),
        }
    }

    /// Add multiple capabilities
    pub fn add_all(&mut self, caps: &[Capability]) -> &mut Self {
        self.capabilities.extend(caps.iter().copied());
        self
    }

    /// Check if capability is supported
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Check if all capabilities are supported
    pub fn supports_all(&self, caps: &[Capability]) -> bool {
        caps.iter().all(|c| self.capabilities.contains(c))
    }

    /// Get description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether this kind can stream
    pub fn can_stream(&self) -> bool {
        self.supports(Capability::Streaming)
    }
}

const SENSOR_CORE: &[Capability] = &[
    Capability::Orientation,
    Capability::Sensors,
    Capability::RawSensors,
    Capability::Streaming,
    Capability::Settings,
    Capability::SensorSettings,
    Capability::Timestamp,
    Capability::Led,
    Capability::System,
];

/// Capability registry for all device kinds
pub struct CapabilityRegistry;

impl CapabilityRegistry {
    /// Capabilities for a device kind
    pub fn for_kind(kind: DeviceKind) -> CapabilitySet {
        match kind {
            DeviceKind::Bootloader => Self::bootloader(),
            DeviceKind::Usb => Self::usb(),
            DeviceKind::Dongle => Self::dongle(),
            DeviceKind::Embedded => Self::embedded(),
            DeviceKind::WirelessWired | DeviceKind::WirelessWireless => Self::wireless(),
            DeviceKind::DataLogger => Self::datalogger(),
            DeviceKind::Bluetooth => Self::bluetooth(),
        }
    }

    /// Bootloader only answers identification
    pub fn bootloader() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("Bootloader");
        caps.add_all(&[Capability::System]);
        caps
    }

    pub fn usb() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("3-Space USB");
        caps.add_all(SENSOR_CORE).add_all(&[Capability::Button]);
        caps
    }

    pub fn embedded() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("3-Space Embedded");
        caps.add_all(SENSOR_CORE);
        caps
    }

    pub fn dongle() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("3-Space Wireless Dongle");
        caps.add_all(&[
            Capability::System,
            Capability::Settings,
            Capability::Timestamp,
            Capability::Wireless,
            Capability::Dongle,
            Capability::Led,
        ]);
        caps
    }

    pub fn wireless() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("3-Space Wireless");
        caps.add_all(SENSOR_CORE).add_all(&[
            Capability::Wireless,
            Capability::Battery,
            Capability::Button,
        ]);
        caps
    }

    pub fn datalogger() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("3-Space Data-Logging");
        caps.add_all(SENSOR_CORE)
            .add_all(&[Capability::Battery, Capability::Button]);
        caps
    }

    pub fn bluetooth() -> CapabilitySet {
        let mut caps = CapabilitySet::with_description("3-Space Bluetooth");
        caps.add_all(SENSOR_CORE)
            .add_all(&[Capability::Battery, Capability::Button]);
        caps
    }
}
