//! Engine error taxonomy
//!
//! Every protocol operation returns one of these to its immediate caller.
//! Nothing in the engine swallows a failed command; the only local recovery
//! is the wireless multiplexer's bounded software retry on [`Error::Timeout`].

use super::transport::TransportError;
use thiserror::Error;

/// Engine result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Identifier is not registered, or its session is closed
    #[error("Invalid device id: {0:#010x}")]
    InvalidId(u32),

    /// Command not supported by this device kind
    #[error("Command 0x{code:02x} is not supported by {kind}")]
    InvalidCommand {
        /// Command byte
        code: u8,
        /// Device kind name
        kind: String,
    },

    /// Wireless table index outside 0..15, or no sensor assigned to it
    #[error("Invalid wireless table index: {0}")]
    InvalidIndex(u8),

    /// Encode/decode schema mismatch
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// No response within the bound
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Incomplete write
    #[error("Write failed: {0}")]
    Write(String),

    /// Incomplete read
    #[error("Read failed: {0}")]
    Read(String),

    /// Wireless outstanding-command queue is saturated
    #[error("Wireless command slots full ({0} outstanding)")]
    StreamSlotsFull(usize),

    /// Inconsistent streaming slot or timing configuration
    #[error("Stream configuration error: {0}")]
    StreamConfig(String),

    /// Allocation or queue capacity failure
    #[error("Out of memory: {0}")]
    Memory(String),

    /// Command requires newer firmware
    #[error("Command 0x{0:02x} requires a firmware upgrade")]
    FirmwareIncompatible(u8),

    /// Wired device creation failed
    #[error("USB connection failed: {0}")]
    UsbConnection(String),

    /// Wireless device creation failed
    #[error("Wireless connection failed: {0}")]
    WirelessConnection(String),

    /// Link-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Numeric error code for the flat export surface
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidCommand { .. } => 1,
            Self::InvalidId(_) => 2,
            Self::InvalidIndex(_) => 3,
            Self::FirmwareIncompatible(_) => 5,
            Self::UsbConnection(_) => 6,
            Self::WirelessConnection(_) => 7,
            Self::Write(_) => 8,
            Self::Read(_) => 9,
            Self::Timeout(_) => 11,
            Self::Parameter(_) => 12,
            Self::StreamSlotsFull(_) => 13,
            Self::StreamConfig(_) => 14,
            Self::Memory(_) => 15,
            Self::Transport(_) => 16,
        }
    }

    /// Whether the wireless multiplexer may resend after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
