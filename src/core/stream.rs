//! Streaming engine
//!
//! Per-device stream state: `Idle -> Configured -> Streaming -> Idle`.
//!
//! The channel's delivery thread pushes raw batches into a bounded queue; a
//! per-channel dispatcher thread hands them to [`StreamState::deliver`], which
//! updates the last-value cache, wakes blocking readers, invokes the callback
//! and fans out to subscribers. Every consumption mode sits on that one path.

use super::device::TimestampMode;
use super::error::{Error, Result};
use super::protocol::codec::{self, Field, FieldType};
use super::protocol::commands::{self, code};
use super::protocol::framing::ResponseHeader;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maximum number of streaming slots
pub const MAX_SLOTS: usize = 8;

/// Wire encoding of an infinite stream duration
pub const INFINITE_DURATION: u32 = u32::MAX;

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Idle,
    Configured,
    Streaming,
}

/// How long a stream runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamDuration {
    Finite(Duration),
    Infinite,
}

impl StreamDuration {
    fn to_micros(self) -> u32 {
        match self {
            Self::Infinite => INFINITE_DURATION,
            Self::Finite(d) => u32::try_from(d.as_micros())
                .unwrap_or(INFINITE_DURATION - 1)
                .min(INFINITE_DURATION - 1),
        }
    }

    fn is_zero(self) -> bool {
        matches!(self, Self::Finite(d) if d.is_zero())
    }
}

/// Stream interval, duration and start delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTiming {
    pub interval: Duration,
    pub duration: StreamDuration,
    pub delay: Duration,
}

impl StreamTiming {
    /// Timing with no start delay
    pub fn new(interval: Duration, duration: StreamDuration) -> Self {
        Self {
            interval,
            duration,
            delay: Duration::ZERO,
        }
    }

    /// Payload fields for the set-timing command (microseconds)
    pub fn to_fields(&self) -> [Field; 3] {
        let us = |d: Duration| u32::try_from(d.as_micros()).unwrap_or(u32::MAX);
        [
            Field::U32(us(self.interval)),
            Field::U32(self.duration.to_micros()),
            Field::U32(us(self.delay)),
        ]
    }

    /// Inverse of [`StreamTiming::to_fields`]
    pub fn from_micros(interval: u32, duration: u32, delay: u32) -> Self {
        Self {
            interval: Duration::from_micros(u64::from(interval)),
            duration: if duration == INFINITE_DURATION {
                StreamDuration::Infinite
            } else {
                StreamDuration::Finite(Duration::from_micros(u64::from(duration)))
            },
            delay: Duration::from_micros(u64::from(delay)),
        }
    }
}

/// One slot of a batch layout: command byte and decoded field count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub command: u8,
    pub fields: usize,
}

/// Validated slot selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPlan {
    slots: Vec<u8>,
    layout: Arc<[SlotLayout]>,
    schema: Vec<FieldType>,
}

impl SlotPlan {
    /// Validate a slot list; `0xFF` entries are empty slots
    pub fn new(slots: &[u8]) -> Result<Self> {
        if slots.len() > MAX_SLOTS {
            return Err(Error::StreamConfig(format!(
                "{} slots requested, at most {MAX_SLOTS}",
                slots.len()
            )));
        }

        let mut layout = Vec::new();
        let mut schema = Vec::new();
        for &slot in slots.iter().filter(|&&s| s != code::NULL_SLOT) {
            let spec = commands::lookup(slot)
                .filter(|s| s.streamable)
                .ok_or_else(|| Error::StreamConfig(format!("0x{slot:02x} is not streamable")))?;
            layout.push(SlotLayout {
                command: slot,
                fields: spec.output.iter().filter(|t| **t != FieldType::Pad).count(),
            });
            schema.extend_from_slice(spec.output);
        }

        if layout.is_empty() {
            return Err(Error::StreamConfig("no stream slots selected".into()));
        }

        Ok(Self {
            slots: layout.iter().map(|l| l.command).collect(),
            layout: layout.into(),
            schema,
        })
    }

    /// Non-empty slot commands in order
    pub fn commands(&self) -> &[u8] {
        &self.slots
    }

    /// Payload fields for the set-slots command, padded with empty slots
    pub fn to_fields(&self) -> [Field; MAX_SLOTS] {
        let mut fields = [Field::U8(code::NULL_SLOT); MAX_SLOTS];
        for (f, &c) in fields.iter_mut().zip(&self.slots) {
            *f = Field::U8(c);
        }
        fields
    }

    /// Expected batch payload length
    pub fn batch_len(&self) -> usize {
        codec::schema_len(&self.schema)
    }
}

/// Raw batch handed from the delivery thread to the dispatcher
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub header: ResponseHeader,
    pub data: Bytes,
    /// Host receive time, microseconds since the channel opened
    pub host_time_us: u32,
}

/// One decoded stream batch
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    /// Decoded fields of every slot, in slot order
    pub fields: Vec<Field>,
    /// Timestamp per the session's timestamp mode
    pub timestamp: Option<u32>,
    /// Per-device arrival counter, starting at 1
    pub sequence: u64,
    layout: Arc<[SlotLayout]>,
}

impl StreamBatch {
    /// Every float field in slot order
    pub fn floats(&self) -> Vec<f32> {
        codec::floats(&self.fields)
    }

    /// Fields belonging to slot `idx`
    pub fn slot(&self, idx: usize) -> Option<&[Field]> {
        let start: usize = self.layout.iter().take(idx).map(|l| l.fields).sum();
        let len = self.layout.get(idx)?.fields;
        self.fields.get(start..start + len)
    }

    /// Command bytes of the slots in this batch
    pub fn slot_commands(&self) -> Vec<u8> {
        self.layout.iter().map(|l| l.command).collect()
    }
}

/// Per-batch handler invoked on the dispatcher thread
pub type StreamCallback = Arc<dyn Fn(&StreamBatch) + Send + Sync>;

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    pub delivered: u64,
    pub dropped: u64,
}

struct Inner {
    status: StreamStatus,
    plan: Option<SlotPlan>,
    timing: Option<StreamTiming>,
    deadline: Option<Instant>,
    latest: Option<StreamBatch>,
    generation: u64,
}

impl Inner {
    fn refresh_configured(&mut self) {
        if self.status != StreamStatus::Streaming {
            self.status = if self.plan.is_some() && self.timing.is_some() {
                StreamStatus::Configured
            } else {
                StreamStatus::Idle
            };
        }
    }
}

/// Stream state of one device
pub struct StreamState {
    logical_id: u8,
    inner: Mutex<Inner>,
    arrived: Condvar,
    mode: RwLock<TimestampMode>,
    callback: RwLock<Option<StreamCallback>>,
    subscribers: Mutex<Vec<Sender<StreamBatch>>>,
    subscriber_capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl StreamState {
    pub fn new(logical_id: u8, mode: TimestampMode, subscriber_capacity: usize) -> Self {
        Self {
            logical_id,
            inner: Mutex::new(Inner {
                status: StreamStatus::Idle,
                plan: None,
                timing: None,
                deadline: None,
                latest: None,
                generation: 0,
            }),
            arrived: Condvar::new(),
            mode: RwLock::new(mode),
            callback: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            subscriber_capacity: subscriber_capacity.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Logical id batches for this device carry
    pub fn logical_id(&self) -> u8 {
        self.logical_id
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.lock().status
    }

    pub fn set_timestamp_mode(&self, mode: TimestampMode) {
        *self.mode.write() = mode;
    }

    fn ensure_not_streaming(inner: &Inner) -> Result<()> {
        if inner.status == StreamStatus::Streaming {
            return Err(Error::StreamConfig("stop streaming before reconfiguring".into()));
        }
        Ok(())
    }

    /// Check a slot plan can be applied now
    pub fn check_reconfigure(&self) -> Result<()> {
        Self::ensure_not_streaming(&self.inner.lock())
    }

    /// Record slots accepted by the device
    pub fn apply_slots(&self, plan: SlotPlan) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_not_streaming(&inner)?;
        inner.plan = Some(plan);
        inner.refresh_configured();
        Ok(())
    }

    /// Record timing accepted by the device
    pub fn apply_timing(&self, timing: StreamTiming) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_not_streaming(&inner)?;
        inner.timing = Some(timing);
        inner.refresh_configured();
        Ok(())
    }

    /// Configured timing, if any
    pub fn timing(&self) -> Option<StreamTiming> {
        self.inner.lock().timing
    }

    /// Configured slot commands, if any
    pub fn slots(&self) -> Option<Vec<u8>> {
        self.inner.lock().plan.as_ref().map(|p| p.commands().to_vec())
    }

    /// Verify a start is allowed and return the timing it will run with
    pub fn check_start(&self) -> Result<StreamTiming> {
        let inner = self.inner.lock();
        match (inner.status, inner.timing) {
            (StreamStatus::Configured, Some(timing)) => Ok(timing),
            (StreamStatus::Streaming, _) => Err(Error::StreamConfig("already streaming".into())),
            _ => Err(Error::StreamConfig(
                "stream slots and timing must both be set before starting".into(),
            )),
        }
    }

    /// Enter `Streaming` after the device acknowledged the start.
    ///
    /// Returns `false` when the duration is zero, in which case the state
    /// is already back at `Idle`.
    pub fn begin(&self, now: Instant) -> Result<bool> {
        let mut inner = self.inner.lock();
        let timing = match (inner.status, inner.timing) {
            (StreamStatus::Configured, Some(t)) => t,
            _ => return Err(Error::StreamConfig("stream is not configured".into())),
        };

        if timing.duration.is_zero() {
            Self::clear(&mut inner);
            self.arrived.notify_all();
            return Ok(false);
        }

        inner.deadline = match timing.duration {
            StreamDuration::Finite(d) => Some(now + timing.delay + d),
            StreamDuration::Infinite => None,
        };
        inner.latest = None;
        inner.status = StreamStatus::Streaming;
        info!(logical_id = self.logical_id, "Streaming started");
        Ok(true)
    }

    fn clear(inner: &mut Inner) {
        inner.status = StreamStatus::Idle;
        inner.plan = None;
        inner.timing = None;
        inner.deadline = None;
        inner.latest = None;
    }

    /// Return to `Idle`, dropping configuration and cache
    pub fn end(&self) {
        let mut inner = self.inner.lock();
        if inner.status == StreamStatus::Streaming {
            info!(logical_id = self.logical_id, "Streaming stopped");
        }
        Self::clear(&mut inner);
        self.arrived.notify_all();
    }

    /// `Streaming -> Idle`; any other state is left as it is.
    ///
    /// Returns whether a running stream was stopped.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.status != StreamStatus::Streaming {
            return false;
        }
        info!(logical_id = self.logical_id, "Streaming stopped");
        Self::clear(&mut inner);
        self.arrived.notify_all();
        true
    }

    /// Auto-stop once the configured duration has elapsed
    pub fn poll_expiry(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.deadline {
            Some(deadline) if inner.status == StreamStatus::Streaming && now >= deadline => {
                info!(logical_id = self.logical_id, "Stream duration elapsed");
                Self::clear(&mut inner);
                self.arrived.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Count a batch lost before reaching this state
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Decode and publish one batch
    pub fn deliver(&self, raw: RawBatch) {
        let batch = {
            let mut inner = self.inner.lock();
            let (fields, layout) = {
                let plan = match (&inner.plan, inner.status) {
                    (Some(plan), StreamStatus::Streaming) => plan,
                    _ => {
                        debug!(logical_id = self.logical_id, "Batch while not streaming");
                        self.record_drop();
                        return;
                    }
                };

                if raw.data.len() != plan.batch_len() {
                    warn!(
                        logical_id = self.logical_id,
                        expected = plan.batch_len(),
                        got = raw.data.len(),
                        "Stream batch length does not match slot layout"
                    );
                    self.record_drop();
                    return;
                }

                match codec::decode(&plan.schema, &raw.data) {
                    Ok(f) => (f, Arc::clone(&plan.layout)),
                    Err(e) => {
                        warn!(logical_id = self.logical_id, "Undecodable batch: {e}");
                        self.record_drop();
                        return;
                    }
                }
            };

            let timestamp = match *self.mode.read() {
                TimestampMode::None => None,
                TimestampMode::Sensor => Some(raw.header.timestamp),
                TimestampMode::System => Some(raw.host_time_us),
            };

            inner.generation += 1;
            let batch = StreamBatch {
                fields,
                timestamp,
                sequence: inner.generation,
                layout,
            };
            inner.latest = Some(batch.clone());
            batch
        };

        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.arrived.notify_all();

        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            cb(&batch);
        }

        let mut subs = self.subscribers.lock();
        subs.retain(|tx| match tx.try_send(batch.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Cached batch without waiting
    pub fn last(&self) -> Result<StreamBatch> {
        self.inner
            .lock()
            .latest
            .clone()
            .ok_or_else(|| Error::Read("no stream data has arrived".into()))
    }

    /// Wait for the next batch to arrive
    pub fn wait_next(&self, timeout: Duration) -> Result<StreamBatch> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        if inner.status != StreamStatus::Streaming {
            return Err(Error::StreamConfig("not streaming".into()));
        }

        let seen = inner.generation;
        while inner.generation == seen {
            if self.arrived.wait_until(&mut inner, deadline).timed_out() && inner.generation == seen
            {
                return Err(Error::Timeout(timeout.as_millis() as u64));
            }
            if inner.generation == seen && inner.status != StreamStatus::Streaming {
                return Err(Error::StreamConfig("streaming stopped".into()));
            }
        }

        inner
            .latest
            .clone()
            .ok_or_else(|| Error::Read("no stream data has arrived".into()))
    }

    /// Install or remove the per-batch callback
    pub fn set_callback(&self, callback: Option<StreamCallback>) {
        *self.callback.write() = callback;
    }

    /// Bounded receiver of every batch from now on
    pub fn subscribe(&self) -> Receiver<StreamBatch> {
        let (tx, rx) = crossbeam_channel::bounded(self.subscriber_capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn counters(&self) -> StreamCounters {
        StreamCounters {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
