//! CLI output formatting
//!
//! Every command result renders either as aligned text or as one JSON
//! document per line, so output can be piped into other tools.

use serde::Serialize;
use std::io::{self, Write};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human readable text
    #[default]
    Text,
    /// One JSON document per line
    Json,
}

/// Hex dump with spaces
pub fn hex_format(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Floats with fixed precision, comma separated
pub fn floats_format(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| format!("{v:.6}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Aligned `key: value` lines
pub fn key_values(pairs: &[(&str, String)]) -> String {
    let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    pairs
        .iter()
        .map(|(k, v)| format!("{k:<width$}  {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stdout writer that treats a closed pipe as a normal end of output
pub struct StdoutSink {
    format: OutputFormat,
    closed: bool,
}

impl StdoutSink {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            closed: false,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Whether the reader went away
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut out = io::stdout().lock();
        match writeln!(out, "{line}").and_then(|()| out.flush()) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.closed = true;
                Ok(())
            }
            other => other,
        }
    }

    /// Emit `value` as JSON, or as `text(value)` in text mode
    pub fn emit<T: Serialize>(&mut self, value: &T, text: impl FnOnce(&T) -> String) -> io::Result<()> {
        let line = match self.format {
            OutputFormat::Text => text(value),
            OutputFormat::Json => serde_json::to_string(value).map_err(io::Error::other)?,
        };
        self.write_line(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_format() {
        assert_eq!(hex_format(&[0xf9, 0x00, 0xed]), "f9 00 ed");
        assert_eq!(hex_format(&[]), "");
    }

    #[test]
    fn test_floats_format() {
        assert_eq!(floats_format(&[1.0, -0.5]), "1.000000, -0.500000");
    }

    #[test]
    fn test_key_values_align() {
        let text = key_values(&[("serial", "0000ABCD".into()), ("firmware", "25Apr2013A00".into())]);
        assert_eq!(text, "serial    0000ABCD\nfirmware  25Apr2013A00");
    }
}
