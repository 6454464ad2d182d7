//! CLI Exit Codes
//!
//! Stable process exit codes so scripts can tell failures apart.

use crate::core::error::Error;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const CONNECTION_FAILED: u8 = 3;
    pub const TIMEOUT: u8 = 4;
    pub const PERMISSION_DENIED: u8 = 7;
    pub const CONFIG_ERROR: u8 = 8;
    /// Malformed or unexpected response
    pub const PROTOCOL_ERROR: u8 = 9;
    pub const CANCELLED: u8 = 11;
    pub const DEVICE_NOT_FOUND: u8 = 12;
    /// Port already open, or wireless slots exhausted
    pub const DEVICE_BUSY: u8 = 13;
    pub const PORT_NOT_FOUND: u8 = 14;
    /// Command not supported by this device or firmware
    pub const UNSUPPORTED: u8 = 15;
    pub const STREAM_ERROR: u8 = 16;
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),
    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    pub fn port_not_found(port: &str) -> Self {
        Self::Error(ExitCodes::PORT_NOT_FOUND, format!("Port not found: {port}"))
    }

    /// Map any error, recognising engine and I/O errors in the chain
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<Error>() {
                return Self::Error(engine_code(e), format!("{err:#}"));
            }
            if let Some(e) = cause.downcast_ref::<TransportError>() {
                return Self::Error(transport_code(e), format!("{err:#}"));
            }
            if let Some(e) = cause.downcast_ref::<std::io::Error>() {
                return Self::Error(Self::from(std::io::Error::from(e.kind())).code(), format!("{err:#}"));
            }
        }
        Self::Error(ExitCodes::ERROR, format!("{err:#}"))
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
        TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        TransportError::PortInUse(_) => ExitCodes::DEVICE_BUSY,
        TransportError::InvalidConfiguration(_) => ExitCodes::CONFIG_ERROR,
        _ => ExitCodes::CONNECTION_FAILED,
    }
}

fn engine_code(err: &Error) -> u8 {
    match err {
        Error::InvalidId(_) => ExitCodes::DEVICE_NOT_FOUND,
        Error::InvalidCommand { .. } | Error::FirmwareIncompatible(_) => ExitCodes::UNSUPPORTED,
        Error::InvalidIndex(_) | Error::Parameter(_) => ExitCodes::INVALID_ARGS,
        Error::Timeout(_) => ExitCodes::TIMEOUT,
        Error::Write(_) | Error::Read(_) => ExitCodes::PROTOCOL_ERROR,
        Error::StreamSlotsFull(_) => ExitCodes::DEVICE_BUSY,
        Error::StreamConfig(_) => ExitCodes::STREAM_ERROR,
        Error::Memory(_) => ExitCodes::INTERNAL_ERROR,
        Error::UsbConnection(_) | Error::WirelessConnection(_) => ExitCodes::CONNECTION_FAILED,
        Error::Transport(e) => transport_code(e),
    }
}

impl From<&Error> for CliResult {
    fn from(err: &Error) -> Self {
        Self::Error(engine_code(err), err.to_string())
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::PORT_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            ErrorKind::Interrupted => ExitCodes::CANCELLED,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Timeout",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Device busy",
        14 => "Port not found",
        15 => "Unsupported by device or firmware",
        16 => "Streaming error",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 7, 8, 9, 11, 12, 13, 14, 15, 16, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_engine_errors_map_to_codes() {
        assert_eq!(CliResult::from(&Error::Timeout(1000)).code(), ExitCodes::TIMEOUT);
        assert_eq!(CliResult::from(&Error::InvalidId(5)).code(), ExitCodes::DEVICE_NOT_FOUND);
        assert_eq!(
            CliResult::from(&Error::FirmwareIncompatible(0x2D)).code(),
            ExitCodes::UNSUPPORTED
        );
        assert_eq!(
            CliResult::from(&Error::Transport(TransportError::PortInUse("COM3".into()))).code(),
            ExitCodes::DEVICE_BUSY
        );
    }

    #[test]
    fn test_anyhow_chain_is_searched() {
        let err = anyhow::Error::new(Error::StreamSlotsFull(15)).context("reading dongle");
        assert_eq!(CliResult::from_anyhow(&err).code(), ExitCodes::DEVICE_BUSY);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(CliResult::from_anyhow(&plain).code(), ExitCodes::ERROR);
    }
}
