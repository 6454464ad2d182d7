//! Physical link layer
//!
//! A [`Link`] is a blocking byte pipe to one physical port. The serial
//! implementation lives in [`serial`]; the in-memory virtual devices in
//! `core::simulator` implement the same trait for tests and `--simulate`.

mod serial;

pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialLink, SerialParity};

use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Port already backs a live session
    #[error("Port already in use: {0}")]
    PortInUse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Link went away underneath us
    #[error("Disconnected")]
    Disconnected,
}

/// Byte counters for one link
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Frames written
    pub frames_sent: u64,
    /// Frames read (responses and stream batches)
    pub frames_received: u64,
    /// Read/write failures
    pub errors: u64,
}

/// Blocking byte pipe to a single port
pub trait Link: Send {
    /// Write every byte or fail
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Independent handle to the same port, used by the delivery thread
    fn try_clone(&self) -> Result<Box<dyn Link>, TransportError>;

    /// Close and reopen the same path
    fn reopen(&mut self) -> Result<(), TransportError>;

    /// Port path
    fn path(&self) -> &str;

    /// Human readable description
    fn describe(&self) -> String {
        self.path().to_string()
    }
}

/// Outcome of [`read_exact`]
#[derive(Debug)]
pub enum ReadOutcome {
    /// All requested bytes arrived
    Complete(Bytes),
    /// Nothing at all arrived before the deadline
    Idle,
    /// Some bytes arrived, then the deadline passed
    Partial(usize),
}

/// Read exactly `len` bytes before `timeout` elapses.
///
/// `Idle` and `Partial` are distinguished so a caller polling for the next
/// header can tell an empty line from a torn frame.
pub fn read_exact(
    link: &mut dyn Link,
    len: usize,
    timeout: Duration,
) -> Result<ReadOutcome, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut buf = BytesMut::zeroed(len);
    let mut filled = 0;

    while filled < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        filled += link.read(&mut buf[filled..], remaining)?;
    }

    Ok(match filled {
        0 if len > 0 => ReadOutcome::Idle,
        n if n == len => ReadOutcome::Complete(buf.freeze()),
        n => ReadOutcome::Partial(n),
    })
}

/// Discard whatever is waiting on the link
pub fn drain(link: &mut dyn Link, quiet: Duration) -> Result<usize, TransportError> {
    let mut scratch = [0u8; 256];
    let mut total = 0;
    loop {
        let n = link.read(&mut scratch, quiet)?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Link for Scripted {
        fn write_all(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(0)
                }
            }
        }

        fn try_clone(&self) -> Result<Box<dyn Link>, TransportError> {
            Err(TransportError::Disconnected)
        }

        fn reopen(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn path(&self) -> &str {
            "scripted"
        }
    }

    #[test]
    fn test_read_exact_joins_chunks() {
        let mut link = Scripted {
            chunks: VecDeque::from(vec![vec![1, 2], vec![3], vec![4, 5, 6]]),
        };
        match read_exact(&mut link, 5, Duration::from_millis(50)).unwrap() {
            ReadOutcome::Complete(b) => assert_eq!(&b[..], &[1, 2, 3, 4, 5]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_read_exact_reports_partial_and_idle() {
        let mut link = Scripted {
            chunks: VecDeque::from(vec![vec![1, 2]]),
        };
        assert!(matches!(
            read_exact(&mut link, 4, Duration::from_millis(10)).unwrap(),
            ReadOutcome::Partial(2)
        ));
        assert!(matches!(
            read_exact(&mut link, 4, Duration::from_millis(10)).unwrap(),
            ReadOutcome::Idle
        ));
    }
}
