//! Serial port link

use super::{Link, TransportError};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyACM0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// 8N1 configuration for a port
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("COM1", 115_200)
    }
}

/// Serial port link
pub struct SerialLink {
    config: SerialConfig,
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open the configured port
    pub fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let port = open_port(&config)?;
        Ok(Self { config, port })
    }

    /// Configuration this link was opened with
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>, TransportError> {
    let parity = match config.parity {
        SerialParity::Odd => Parity::Odd,
        SerialParity::Even => Parity::Even,
        SerialParity::None => Parity::None,
    };

    let flow_control = match config.flow_control {
        SerialFlowControl::Hardware => FlowControl::Hardware,
        SerialFlowControl::Software => FlowControl::Software,
        SerialFlowControl::None => FlowControl::None,
    };

    serialport::new(&config.port, config.baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(parity)
        .flow_control(flow_control)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| map_open_error(&config.port, e))
}

fn map_open_error(port: &str, e: serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::PortNotFound(port.to_string()),
        serialport::ErrorKind::InvalidInput => TransportError::InvalidConfiguration(e.to_string()),
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PermissionDenied(port.to_string())
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::PortNotFound(port.to_string())
        }
        _ => TransportError::ConnectionFailed(e.to_string()),
    }
}

impl Link for SerialLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.port
            .set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(|e| TransportError::IoError(e.into()))?;

        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(TransportError::IoError(e)),
        }
    }

    fn try_clone(&self) -> Result<Box<dyn Link>, TransportError> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| TransportError::IoError(e.into()))?;
        Ok(Box::new(Self {
            config: self.config.clone(),
            port,
        }))
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.port = open_port(&self.config)?;
        Ok(())
    }

    fn path(&self) -> &str {
        &self.config.port
    }

    fn describe(&self) -> String {
        format!(
            "{} @ {} baud (8{}1 {})",
            self.config.port,
            self.config.baud_rate,
            match self.config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            match self.config.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_8n1() {
        let cfg = SerialConfig::new("/dev/ttyACM0", 115_200);
        assert_eq!(cfg.parity, SerialParity::None);
        assert_eq!(cfg.flow_control, SerialFlowControl::None);
        assert_eq!(cfg.baud_rate, 115_200);
    }

    #[test]
    fn test_missing_port_maps_to_not_found() {
        let err = SerialLink::open(SerialConfig::new("/dev/definitely-not-a-3space-port", 115_200));
        assert!(matches!(
            err,
            Err(TransportError::PortNotFound(_)) | Err(TransportError::ConnectionFailed(_))
        ));
    }
}
