//! Device identity: kinds, identifiers, firmware tiers and readings

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged device classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Sensor sitting in its bootloader
    Bootloader,
    /// USB sensor
    Usb,
    /// Wireless dongle
    Dongle,
    /// Embedded sensor
    Embedded,
    /// Wireless sensor attached over its USB cable
    WirelessWired,
    /// Wireless sensor reached through a dongle
    WirelessWireless,
    /// Data-logging sensor
    DataLogger,
    /// Bluetooth sensor
    Bluetooth,
}

impl DeviceKind {
    /// Every kind, in id-mask order
    pub const ALL: [DeviceKind; 8] = [
        Self::Bootloader,
        Self::Dongle,
        Self::Usb,
        Self::Embedded,
        Self::WirelessWired,
        Self::WirelessWireless,
        Self::DataLogger,
        Self::Bluetooth,
    ];

    /// Identifier type bits for this kind
    pub const fn mask(self) -> u32 {
        match self {
            Self::Bootloader => DeviceId::BOOTLOADER,
            Self::Dongle => DeviceId::DONGLE,
            Self::Usb => DeviceId::USB,
            Self::Embedded => DeviceId::EMBEDDED,
            Self::WirelessWired => DeviceId::WIRELESS_WIRED,
            Self::WirelessWireless => DeviceId::WIRELESS_WIRELESS,
            Self::DataLogger => DeviceId::DATALOGGER,
            Self::Bluetooth => DeviceId::BLUETOOTH,
        }
    }

    /// Classify from the hardware version string returned by command 0xE6.
    ///
    /// The string is of the form `TSS-USB`, `TSS-DNG`, `TSS-WL`, and so on.
    pub fn from_hardware_version(hw: &str) -> Option<Self> {
        let upper = hw.trim().to_ascii_uppercase();
        if upper.contains("BTL") || upper.contains("BOOT") {
            Some(Self::Bootloader)
        } else if upper.contains("DNG") {
            Some(Self::Dongle)
        } else if upper.contains("WL") {
            Some(Self::WirelessWired)
        } else if upper.contains("USB") {
            Some(Self::Usb)
        } else if upper.contains("EM") {
            Some(Self::Embedded)
        } else if upper.contains("DL") {
            Some(Self::DataLogger)
        } else if upper.contains("BT") {
            Some(Self::Bluetooth)
        } else {
            None
        }
    }

    /// Short name used in logs and CLI output
    pub fn name(self) -> &'static str {
        match self {
            Self::Bootloader => "bootloader",
            Self::Usb => "usb",
            Self::Dongle => "dongle",
            Self::Embedded => "embedded",
            Self::WirelessWired => "wireless-wired",
            Self::WirelessWireless => "wireless",
            Self::DataLogger => "datalogger",
            Self::Bluetooth => "bluetooth",
        }
    }

    /// Whether this kind is a sensor (everything except dongle and bootloader)
    pub fn is_sensor(self) -> bool {
        !matches!(self, Self::Dongle | Self::Bootloader)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque device identifier: registry slot in the low bits, kind in the high byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const NO_DEVICE: u32 = 0x0080_0000;
    pub const BOOTLOADER: u32 = 0x0100_0000;
    pub const DONGLE: u32 = 0x0200_0000;
    pub const USB: u32 = 0x0400_0000;
    pub const EMBEDDED: u32 = 0x0800_0000;
    pub const WIRELESS_WIRED: u32 = 0x1000_0000;
    pub const WIRELESS_WIRELESS: u32 = 0x2000_0000;
    pub const DATALOGGER: u32 = 0x4000_0000;
    pub const BLUETOOTH: u32 = 0x8000_0000;
    /// Any wireless sensor
    pub const WIRELESS: u32 = Self::WIRELESS_WIRED | Self::WIRELESS_WIRELESS;
    /// Every sensor kind (excludes nothing in the high byte)
    pub const ALL_SENSORS: u32 = 0xff00_0000;
    /// Every sensor kind except dongles
    pub const NO_DONGLE: u32 = 0xfd00_0000;

    const SLOT_MASK: u32 = 0x007f_ffff;

    /// "No device" sentinel
    pub const NONE: DeviceId = DeviceId(Self::NO_DEVICE);

    /// Compose an identifier from a registry slot and a kind
    pub fn new(slot: u32, kind: DeviceKind) -> Self {
        Self((slot & Self::SLOT_MASK) | kind.mask())
    }

    /// Registry slot
    pub fn slot(self) -> u32 {
        self.0 & Self::SLOT_MASK
    }

    /// Whether this is the "no device" sentinel
    pub fn is_none(self) -> bool {
        self.0 & Self::NO_DEVICE != 0
    }

    /// Kind encoded in the high byte
    pub fn kind(self) -> Option<DeviceKind> {
        DeviceKind::ALL.into_iter().find(|k| self.0 & k.mask() != 0)
    }

    /// Whether the kind bits intersect `mask`
    pub fn matches(self, mask: u32) -> bool {
        !self.is_none() && self.0 & mask & 0xff00_0000 != 0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Where a response's timestamp comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    /// No timestamp
    None,
    /// Device clock from the response header (microseconds)
    #[default]
    Sensor,
    /// Host clock at receipt, microseconds since the channel opened
    System,
}

/// Coarse firmware classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FirmwareTier {
    /// Built before the streaming/timestamp protocol revision
    Legacy,
    /// Current protocol
    Current,
}

impl FirmwareTier {
    /// Builds dated before this use the legacy protocol
    pub fn cutoff() -> NaiveDate {
        NaiveDate::from_ymd_opt(2012, 1, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Classify a firmware version string such as `25Apr2013A00`.
    ///
    /// Returns `None` when no leading `ddMonYYYY` date can be parsed.
    pub fn from_version(version: &str) -> Option<Self> {
        let date = parse_build_date(version)?;
        Some(if date < Self::cutoff() {
            Self::Legacy
        } else {
            Self::Current
        })
    }
}

/// Parse the leading `ddMonYYYY` build date of a firmware version string
pub fn parse_build_date(version: &str) -> Option<NaiveDate> {
    let head = version.trim().get(..9)?;
    NaiveDate::parse_from_str(head, "%d%b%Y").ok()
}

/// Identity gathered during the identification round-trip
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Hardware serial number
    pub serial: u32,
    /// Firmware version string
    pub firmware_version: String,
    /// Hardware version string
    pub hardware_version: String,
    /// Classification from the hardware version, if recognised
    pub kind: Option<DeviceKind>,
    /// Firmware tier
    pub tier: Option<FirmwareTier>,
}

impl DeviceInfo {
    /// Serial as the 8-digit hex string printed on device labels
    pub fn serial_hex(&self) -> String {
        format!("{:08X}", self.serial)
    }
}

/// Natural to output axis mapping; the letter at each position names the
/// output axis the natural X, Y or Z axis is reported on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AxisOrder {
    #[default]
    Xyz = 0,
    Xzy = 1,
    Yxz = 2,
    Yzx = 3,
    Zxy = 4,
    Zyx = 5,
}

impl AxisOrder {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Xyz,
            1 => Self::Xzy,
            2 => Self::Yxz,
            3 => Self::Yzx,
            4 => Self::Zxy,
            5 => Self::Zyx,
            _ => return None,
        })
    }
}

/// Axis order plus per-axis negation, carried on the wire as one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisDirections {
    pub order: AxisOrder,
    pub negate_x: bool,
    pub negate_y: bool,
    pub negate_z: bool,
}

impl AxisDirections {
    const NEGATE_X: u8 = 0x20;
    const NEGATE_Y: u8 = 0x10;
    const NEGATE_Z: u8 = 0x08;

    /// Wire byte: bits 0-2 order, bit 5/4/3 negate X/Y/Z
    pub fn to_byte(self) -> u8 {
        let mut b = self.order as u8;
        if self.negate_x {
            b |= Self::NEGATE_X;
        }
        if self.negate_y {
            b |= Self::NEGATE_Y;
        }
        if self.negate_z {
            b |= Self::NEGATE_Z;
        }
        b
    }

    /// `None` for an order value above 5
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(Self {
            order: AxisOrder::from_u8(b & 0x07)?,
            negate_x: b & Self::NEGATE_X != 0,
            negate_y: b & Self::NEGATE_Y != 0,
            negate_z: b & Self::NEGATE_Z != 0,
        })
    }
}

/// A typed command result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading<T> {
    /// Decoded value
    pub value: T,
    /// Timestamp per the session's timestamp mode
    pub timestamp: Option<u32>,
    /// Produced by an older substitute command on legacy firmware
    pub emulated: bool,
}

impl<T> Reading<T> {
    /// Transform the value, keeping metadata
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
        Reading {
            value: f(self.value),
            timestamp: self.timestamp,
            emulated: self.emulated,
        }
    }
}
