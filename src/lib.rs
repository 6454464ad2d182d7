//! # 3-Space Core Library
//!
//! Device communication and streaming engine for 3-Space inertial sensors
//! and their wireless dongles:
//! - Typed command encoding against a static command table
//! - Wired (serial) and wireless (through a dongle) command routing
//! - Asynchronous stream delivery with per-device caches and callbacks
//! - A registry of device sessions addressed by opaque identifiers
//!
//! ## Example
//!
//! ```rust,no_run
//! use threespace_core::{code, DeviceRegistry, EngineConfig, StreamDuration, StreamTiming};
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = DeviceRegistry::new(EngineConfig::load()?);
//!     let id = registry.create_device("/dev/ttyACM0", None)?;
//!     let sensor = registry.get(id)?;
//!
//!     println!("{:?}", sensor.tared_quaternion()?.value);
//!
//!     sensor.set_stream_slots(&[code::TARED_QUATERNION, code::RAW_GYRO])?;
//!     sensor.set_stream_timing(StreamTiming::new(
//!         Duration::from_millis(10),
//!         StreamDuration::Finite(Duration::from_secs(1)),
//!     ))?;
//!     sensor.start_streaming()?;
//!     while let Ok(batch) = sensor.next_stream_batch(Duration::from_millis(100)) {
//!         println!("{:?}", batch.floats());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::EngineConfig;
pub use crate::core::capture::{CaptureFormat, TrafficLog};
pub use crate::core::device::{
    AxisDirections, AxisOrder, DeviceId, DeviceInfo, DeviceKind, FirmwareTier, Reading, TimestampMode,
};
pub use crate::core::error::{Error, Result};
pub use crate::core::protocol::{code, Field, FieldType, ResponseFrame};
pub use crate::core::registry::DeviceRegistry;
pub use crate::core::session::{DeviceEvent, DeviceSession, SessionState};
pub use crate::core::stream::{StreamBatch, StreamDuration, StreamStatus, StreamTiming};
pub use crate::core::transport::{Link, SerialConfig, TransportError};
pub use crate::utils::autoconnect::{ReconnectConfig, ReconnectEvent, Reconnector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
