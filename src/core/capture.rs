//! Traffic capture
//!
//! Records every frame a channel writes or reads, with a local wall-clock
//! timestamp. Entries are kept in a bounded in-memory ring and optionally
//! appended to a file in one of the [`CaptureFormat`]s.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Capture file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Direction, command name and hex payload
    #[default]
    Text,
    /// Hex dump only
    Hex,
    /// JSON lines
    JsonLines,
}

impl CaptureFormat {
    /// File extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Hex => "hex",
            Self::JsonLines => "jsonl",
        }
    }
}

/// Frame direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// One captured frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureEntry {
    pub timestamp: DateTime<Local>,
    pub direction: Direction,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

impl CaptureEntry {
    fn arrow(&self) -> &'static str {
        match self.direction {
            Direction::Sent => "TX",
            Direction::Received => "RX",
        }
    }

    /// Format as an annotated line
    pub fn to_text(&self) -> String {
        let mut line = format!(
            "[{}] {} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.arrow(),
            self.to_hex_body()
        );
        if let Some(note) = &self.note {
            line.push_str("  ; ");
            line.push_str(note);
        }
        line
    }

    fn to_hex_body(&self) -> String {
        self.data
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format as a bare hex line
    pub fn to_hex(&self) -> String {
        format!("{} {}", self.arrow(), self.to_hex_body())
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn render(&self, format: CaptureFormat) -> String {
        match format {
            CaptureFormat::Text => self.to_text(),
            CaptureFormat::Hex => self.to_hex(),
            CaptureFormat::JsonLines => self.to_json(),
        }
    }
}

struct Inner {
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    format: CaptureFormat,
    ring: VecDeque<CaptureEntry>,
    capacity: usize,
    frames: usize,
}

/// Thread-safe frame capture attached to a channel
pub struct TrafficLog {
    inner: Mutex<Inner>,
}

impl TrafficLog {
    /// In-memory capture holding at most `capacity` frames
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                file: None,
                path: None,
                format: CaptureFormat::Text,
                ring: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                frames: 0,
            }),
        }
    }

    /// Also append every frame to `path`
    pub fn to_file(&self, path: &Path, format: CaptureFormat) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut inner = self.inner.lock();
        inner.file = Some(BufWriter::new(file));
        inner.path = Some(path.to_path_buf());
        inner.format = format;
        Ok(())
    }

    /// Capture file path, if any
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    /// Record a frame
    pub fn record(&self, direction: Direction, data: &[u8], note: Option<String>) {
        let entry = CaptureEntry {
            timestamp: Local::now(),
            direction,
            data: data.to_vec(),
            note,
        };

        let mut inner = self.inner.lock();
        inner.frames += 1;
        let format = inner.format;
        let frames = inner.frames;
        if let Some(file) = inner.file.as_mut() {
            let _ = writeln!(file, "{}", entry.render(format));
            if frames % 100 == 0 {
                let _ = file.flush();
            }
        }

        if inner.ring.len() == inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(entry);
    }

    /// Snapshot of the in-memory ring
    pub fn entries(&self) -> Vec<CaptureEntry> {
        self.inner.lock().ring.iter().cloned().collect()
    }

    /// Total frames recorded since creation
    pub fn frames(&self) -> usize {
        self.inner.lock().frames
    }

    /// Render the ring in the given format
    pub fn export(&self, format: CaptureFormat) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for entry in &inner.ring {
            out.push_str(&entry.render(format));
            out.push('\n');
        }
        out
    }

    /// Flush to disk
    pub fn flush(&self) {
        if let Some(file) = self.inner.lock().file.as_mut() {
            let _ = file.flush();
        }
    }
}

impl Drop for TrafficLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Capture file name with a timestamp
pub fn capture_filename(prefix: &str, format: CaptureFormat) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_text_has_direction_and_note() {
        let log = TrafficLog::new(8);
        log.record(Direction::Sent, &[0xF9, 0x00, 0x00], Some("tared_quaternion".into()));
        let text = log.entries()[0].to_text();
        assert!(text.contains("TX F9 00 00"));
        assert!(text.contains("tared_quaternion"));
    }

    #[test]
    fn test_ring_is_bounded() {
        let log = TrafficLog::new(5);
        for i in 0..10u8 {
            log.record(Direction::Received, &[i], None);
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].data, vec![5]);
        assert_eq!(log.frames(), 10);
    }

    #[test]
    fn test_json_line_round_trips() {
        let log = TrafficLog::new(2);
        log.record(Direction::Received, &[0xAB, 0xCD], None);
        let line = log.export(CaptureFormat::JsonLines);
        let entry: CaptureEntry = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(entry.data, vec![0xAB, 0xCD]);
        assert_eq!(entry.direction, Direction::Received);
    }

    #[test]
    fn test_file_capture_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(capture_filename("cap", CaptureFormat::Hex));
        {
            let log = TrafficLog::new(4);
            log.to_file(&path, CaptureFormat::Hex).unwrap();
            log.record(Direction::Sent, &[1, 2], None);
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), "TX 01 02");
    }
}
