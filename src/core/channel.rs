//! Transport channel
//!
//! Owns one physical link. Writers serialize on a single lock so two command
//! frames never interleave on the wire. A dedicated delivery thread owns the
//! read half: it reads one header at a time and classifies what follows as
//! either a pending command's response or an unsolicited stream batch.
//!
//! Pending commands are queued per logical id in issue order, so responses on
//! one channel complete first-in first-out. A command whose caller gave up
//! stays queued as an abandoned entry for a grace period: a reply echoing the
//! same command within that window is taken as the late reply and dropped.
//! Stream batches go through a
//! bounded queue to a dispatcher thread that feeds the per-device
//! [`StreamState`]s.

use super::capture::{Direction, TrafficLog};
use super::error::{Error, Result};
use super::protocol::commands::{self, code};
use super::protocol::framing::{self, Addressing, ResponseHeader, HEADER_BITFIELD, HEADER_LEN};
use super::stream::{RawBatch, StreamState};
use super::transport::{self, Link, ReadOutcome, SerialConfig, SerialLink, TransportStats};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long to wait for the data that follows a header
const DATA_TIMEOUT: Duration = Duration::from_millis(250);

/// Channel tuning
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Delivery thread read timeout, and the stream expiry check period
    pub poll_interval: Duration,
    /// Pause after enabling response headers before draining the link
    pub settle: Duration,
    /// Capacity of the delivery-to-dispatcher batch queue
    pub stream_queue: usize,
    /// How long an abandoned command still claims a matching reply
    pub late_reply_grace: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            settle: Duration::from_millis(100),
            stream_queue: 64,
            late_reply_grace: Duration::from_millis(250),
        }
    }
}

/// A response as it came off the wire
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub header: ResponseHeader,
    pub data: Bytes,
    /// Host receive time, microseconds since the channel opened
    pub host_time_us: u32,
}

enum PendingEntry {
    Live {
        seq: u64,
        command: u8,
        tx: Sender<Result<RawResponse>>,
        /// A reply to this command was claimed by an abandoned entry ahead of it
        shadowed: bool,
    },
    Abandoned {
        command: u8,
        until: Instant,
    },
}

impl PendingEntry {
    fn command(&self) -> u8 {
        match *self {
            Self::Live { command, .. } | Self::Abandoned { command, .. } => command,
        }
    }

    fn abandoned_until(&self) -> Option<Instant> {
        match *self {
            Self::Abandoned { until, .. } => Some(until),
            Self::Live { .. } => None,
        }
    }

    fn fail(self, reason: String) {
        if let Self::Live { tx, .. } = self {
            let _ = tx.send(Err(Error::Read(reason)));
        }
    }
}

struct Shared {
    path: String,
    epoch: Instant,
    running: AtomicBool,
    alive: AtomicBool,
    generation: AtomicU64,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u8, VecDeque<PendingEntry>>>,
    streams: RwLock<HashMap<u8, Arc<StreamState>>>,
    capture: RwLock<Option<Arc<TrafficLog>>>,
    stats: Mutex<TransportStats>,
    stale: AtomicU64,
    late_reply_grace: Duration,
}

impl Shared {
    fn host_time_us(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }

    fn capture(&self, direction: Direction, data: &[u8], note: Option<String>) {
        if let Some(log) = self.capture.read().as_ref() {
            log.record(direction, data, note);
        }
    }

    /// Drop `seq` from the queue; it never reached the wire
    fn withdraw(&self, logical_id: u8, seq: u64) {
        if let Some(queue) = self.pending.lock().get_mut(&logical_id) {
            queue.retain(|e| !matches!(e, PendingEntry::Live { seq: s, .. } if *s == seq));
        }
    }

    /// The caller stopped waiting for `seq`.
    ///
    /// The entry keeps its queue position as an abandoned marker unless its
    /// reply was already claimed by an earlier abandoned command.
    fn abandon(&self, logical_id: u8, seq: u64) {
        let mut pending = self.pending.lock();
        let Some(queue) = pending.get_mut(&logical_id) else {
            return;
        };
        let Some(pos) = queue
            .iter()
            .position(|e| matches!(e, PendingEntry::Live { seq: s, .. } if *s == seq))
        else {
            return;
        };
        let keep = !self.late_reply_grace.is_zero()
            && matches!(queue[pos], PendingEntry::Live { shadowed: false, .. });
        if keep {
            let command = queue[pos].command();
            queue[pos] = PendingEntry::Abandoned {
                command,
                until: Instant::now() + self.late_reply_grace,
            };
        } else {
            queue.remove(pos);
        }
    }

    fn fail_all_pending(&self, reason: &str) {
        let drained: Vec<PendingEntry> = self
            .pending
            .lock()
            .drain()
            .flat_map(|(_, q)| q.into_iter())
            .collect();
        for entry in drained {
            entry.fail(reason.to_string());
        }
    }

    fn complete(&self, header: ResponseHeader, data: Bytes) {
        let now = Instant::now();
        let entry = {
            let mut pending = self.pending.lock();
            let Some(queue) = pending.get_mut(&header.logical_id) else {
                self.stale.fetch_add(1, Ordering::Relaxed);
                debug!(cmd = header.command, lid = header.logical_id, "Unexpected response");
                return;
            };
            loop {
                let Some((until, same)) = queue
                    .front()
                    .map(|e| (e.abandoned_until(), e.command() == header.command))
                else {
                    break None;
                };
                match until {
                    Some(until) if same && until > now => {
                        queue.pop_front();
                        if let Some(PendingEntry::Live { command, shadowed, .. }) =
                            queue.front_mut()
                        {
                            *shadowed |= *command == header.command;
                        }
                        debug!(cmd = header.command, lid = header.logical_id, "Late reply");
                        break None;
                    }
                    // expired, or replies are in order and this one never came
                    Some(_) => {
                        queue.pop_front();
                    }
                    None if same => break queue.pop_front(),
                    None => break None,
                }
            }
        };

        match entry {
            Some(PendingEntry::Live { tx, .. }) => {
                let _ = tx.send(Ok(RawResponse {
                    header,
                    data,
                    host_time_us: self.host_time_us(),
                }));
            }
            _ => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                debug!(
                    cmd = header.command,
                    lid = header.logical_id,
                    "Dropping stale response"
                );
            }
        }
    }

    fn fail_front(&self, logical_id: u8, reason: String) {
        let entry = {
            let mut pending = self.pending.lock();
            let Some(queue) = pending.get_mut(&logical_id) else {
                return;
            };
            while matches!(queue.front(), Some(PendingEntry::Abandoned { .. })) {
                queue.pop_front();
            }
            queue.pop_front()
        };
        if let Some(entry) = entry {
            entry.fail(reason);
        }
    }
}

/// A command written to the wire, waiting for its response
pub struct Pending {
    shared: Arc<Shared>,
    logical_id: u8,
    seq: u64,
    rx: Receiver<Result<RawResponse>>,
}

impl Pending {
    /// Block until the response arrives or `timeout` elapses.
    ///
    /// On timeout the entry is abandoned, so a late response is discarded
    /// rather than matched to a later command.
    pub fn wait(self, timeout: Duration) -> Result<RawResponse> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout.as_millis() as u64)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Read("channel closed".into())),
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.shared.abandon(self.logical_id, self.seq);
    }
}

#[derive(Default)]
struct Workers {
    delivery: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

/// One open physical link and its delivery machinery
pub struct TransportChannel {
    shared: Arc<Shared>,
    writer: Mutex<Box<dyn Link>>,
    workers: Mutex<Workers>,
    options: ChannelOptions,
    description: String,
}

impl TransportChannel {
    /// Open a serial port
    pub fn open(path: &str, baud: u32, options: ChannelOptions) -> Result<Arc<Self>> {
        let link = SerialLink::open(SerialConfig::new(path, baud))?;
        Self::with_link(Box::new(link), options)
    }

    /// Wrap any link: enable response headers, then start delivery
    pub fn with_link(mut link: Box<dyn Link>, options: ChannelOptions) -> Result<Arc<Self>> {
        let path = link.path().to_string();
        let description = link.describe();
        configure_link(link.as_mut(), &options)?;
        let reader = link.try_clone()?;

        let channel = Arc::new(Self {
            shared: Arc::new(Shared {
                path,
                epoch: Instant::now(),
                running: AtomicBool::new(false),
                alive: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                streams: RwLock::new(HashMap::new()),
                capture: RwLock::new(None),
                stats: Mutex::new(TransportStats::default()),
                stale: AtomicU64::new(0),
                late_reply_grace: options.late_reply_grace,
            }),
            writer: Mutex::new(link),
            workers: Mutex::new(Workers::default()),
            options,
            description,
        });
        channel.start_workers(reader)?;
        info!(port = %channel.shared.path, "Channel open: {}", channel.description);
        Ok(channel)
    }

    fn start_workers(&self, reader: Box<dyn Link>) -> Result<()> {
        let (batch_tx, batch_rx) = crossbeam_channel::bounded(self.options.stream_queue.max(1));
        self.shared.running.store(true, Ordering::Release);

        let delivery_shared = Arc::clone(&self.shared);
        let poll = self.options.poll_interval;
        let delivery = thread::Builder::new()
            .name(format!("3space-rx {}", self.shared.path))
            .spawn(move || delivery_loop(delivery_shared, reader, batch_tx, poll))
            .map_err(|e| Error::Memory(format!("failed to spawn delivery thread: {e}")))?;

        let dispatch_shared = Arc::clone(&self.shared);
        let dispatcher = thread::Builder::new()
            .name(format!("3space-stream {}", self.shared.path))
            .spawn(move || dispatch_loop(dispatch_shared, batch_rx))
            .map_err(|e| Error::Memory(format!("failed to spawn dispatcher thread: {e}")))?;

        let mut workers = self.workers.lock();
        workers.delivery = Some(delivery);
        workers.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Stop both workers. A worker calling this (a stream callback closing
    /// its own session) is not joined; it exits once its loop ends.
    fn stop_workers(&self) {
        self.shared.running.store(false, Ordering::Release);
        let mut workers = self.workers.lock();
        let current = thread::current().id();
        for handle in [workers.delivery.take(), workers.dispatcher.take()]
            .into_iter()
            .flatten()
        {
            if handle.thread().id() == current {
                debug!(port = %self.shared.path, "Worker stopping itself");
                continue;
            }
            if handle.join().is_err() {
                error!(port = %self.shared.path, "Channel worker panicked");
            }
        }
    }

    /// Port path
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Incremented on every successful reconnect
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Microseconds since the channel opened
    pub fn host_time_us(&self) -> u32 {
        self.shared.host_time_us()
    }

    /// Write a command frame and register for its response
    pub fn send(&self, addr: Addressing, command: u8, payload: &[u8]) -> Result<Pending> {
        let frame = framing::encode_command(addr, command, payload);
        let logical_id = addr.logical_id();

        let mut writer = self.writer.lock();
        if !self.shared.alive.load(Ordering::Acquire) {
            return Err(Error::Write(format!("{} is not connected", self.shared.path)));
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.shared
            .pending
            .lock()
            .entry(logical_id)
            .or_default()
            .push_back(PendingEntry::Live {
                seq,
                command,
                tx,
                shadowed: false,
            });

        if let Err(e) = writer.write_all(&frame) {
            self.shared.withdraw(logical_id, seq);
            self.shared.stats.lock().errors += 1;
            warn!(port = %self.shared.path, "Write failed: {e}");
            return Err(Error::Write(e.to_string()));
        }

        {
            let mut stats = self.shared.stats.lock();
            stats.bytes_sent += frame.len() as u64;
            stats.frames_sent += 1;
        }
        debug!(cmd = command, lid = logical_id, frame = %hex::encode(&frame), "TX");
        self.shared.capture(
            Direction::Sent,
            &frame,
            commands::lookup(command).map(|c| c.name.to_string()),
        );
        Ok(Pending {
            shared: Arc::clone(&self.shared),
            logical_id,
            seq,
            rx,
        })
    }

    /// Whether the link is usable; with `reconnect`, try to reopen a dead one
    pub fn is_alive(&self, reconnect: bool) -> bool {
        if self.shared.alive.load(Ordering::Acquire) {
            return true;
        }
        reconnect && self.reconnect().is_ok()
    }

    /// Reopen the same path.
    ///
    /// Pending commands fail, wireless outstanding counts reset (via
    /// [`generation`](Self::generation)) and every stream returns to idle.
    pub fn reconnect(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        warn!(port = %self.shared.path, "Reconnecting");
        self.stop_workers();
        self.shared.alive.store(false, Ordering::Release);
        self.shared.fail_all_pending("channel reconnecting");
        for stream in self.shared.streams.read().values() {
            stream.end();
        }

        writer.reopen()?;
        configure_link(writer.as_mut(), &self.options)?;
        let reader = writer.try_clone()?;
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.alive.store(true, Ordering::Release);
        self.start_workers(reader)?;
        info!(port = %self.shared.path, "Reconnected");
        Ok(())
    }

    /// Stop delivery and fail everything pending
    pub fn close(&self) {
        let _writer = self.writer.lock();
        self.shared.alive.store(false, Ordering::Release);
        self.stop_workers();
        self.shared.fail_all_pending("channel closed");
        for stream in self.shared.streams.read().values() {
            stream.end();
        }
        info!(port = %self.shared.path, "Channel closed");
    }

    /// Route stream batches for `logical_id` to `state`
    pub fn register_stream(&self, state: Arc<StreamState>) {
        self.shared
            .streams
            .write()
            .insert(state.logical_id(), state);
    }

    pub fn unregister_stream(&self, logical_id: u8) {
        self.shared.streams.write().remove(&logical_id);
    }

    /// Attach a traffic capture
    pub fn set_capture(&self, log: Option<Arc<TrafficLog>>) {
        *self.shared.capture.write() = log;
    }

    pub fn stats(&self) -> TransportStats {
        *self.shared.stats.lock()
    }

    /// Responses that matched no pending command
    pub fn stale_responses(&self) -> u64 {
        self.shared.stale.load(Ordering::Relaxed)
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

/// Enable the response header and discard whatever the device said meanwhile
fn configure_link(link: &mut dyn Link, options: &ChannelOptions) -> Result<()> {
    let bitfield = HEADER_BITFIELD.to_be_bytes();
    for cmd in [code::SET_WIRED_HEADER, code::SET_WIRELESS_HEADER] {
        let frame = framing::encode_command(Addressing::Wired, cmd, &bitfield);
        link.write_all(&frame)
            .map_err(|e| Error::Write(e.to_string()))?;
    }
    if !options.settle.is_zero() {
        thread::sleep(options.settle);
    }
    let discarded = transport::drain(link, Duration::from_millis(10))?;
    if discarded > 0 {
        debug!(port = link.path(), discarded, "Drained link after header setup");
    }
    Ok(())
}

fn delivery_loop(
    shared: Arc<Shared>,
    mut reader: Box<dyn Link>,
    batches: Sender<RawBatch>,
    poll: Duration,
) {
    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();
        for stream in shared.streams.read().values() {
            stream.poll_expiry(now);
        }

        let header_bytes = match transport::read_exact(reader.as_mut(), HEADER_LEN, poll) {
            Ok(ReadOutcome::Complete(b)) => b,
            Ok(ReadOutcome::Idle) => continue,
            Ok(ReadOutcome::Partial(n)) => {
                warn!(port = %shared.path, got = n, "Torn header, resynchronizing");
                shared.stats.lock().errors += 1;
                let _ = transport::drain(reader.as_mut(), poll);
                continue;
            }
            Err(e) => {
                link_lost(&shared, &e.to_string());
                break;
            }
        };

        let header = match ResponseHeader::parse(&header_bytes) {
            Ok(h) => h,
            Err(e) => {
                warn!(port = %shared.path, "{e}");
                continue;
            }
        };

        let data = if header.data_len == 0 {
            Bytes::new()
        } else {
            match transport::read_exact(reader.as_mut(), usize::from(header.data_len), DATA_TIMEOUT) {
                Ok(ReadOutcome::Complete(d)) => d,
                Ok(_) => {
                    let reason = format!(
                        "incomplete read: expected {} data bytes after header",
                        header.data_len
                    );
                    warn!(port = %shared.path, cmd = header.command, "{reason}");
                    shared.stats.lock().errors += 1;
                    if !header.is_stream() {
                        shared.fail_front(header.logical_id, reason);
                    }
                    continue;
                }
                Err(e) => {
                    link_lost(&shared, &e.to_string());
                    break;
                }
            }
        };

        {
            let mut stats = shared.stats.lock();
            stats.bytes_received += (HEADER_LEN + data.len()) as u64;
            stats.frames_received += 1;
        }
        if shared.capture.read().is_some() {
            let mut frame = header_bytes.to_vec();
            frame.extend_from_slice(&data);
            shared.capture(Direction::Received, &frame, None);
        }

        if header.is_stream() {
            let batch = RawBatch {
                header,
                data,
                host_time_us: shared.host_time_us(),
            };
            match batches.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    if let Some(stream) = shared.streams.read().get(&header.logical_id) {
                        stream.record_drop();
                    }
                    debug!(lid = header.logical_id, "Stream queue full, batch dropped");
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        } else {
            debug!(
                cmd = header.command,
                lid = header.logical_id,
                status = header.status,
                len = data.len(),
                "RX"
            );
            shared.complete(header, data);
        }
    }
    debug!(port = %shared.path, "Delivery thread exiting");
}

fn link_lost(shared: &Shared, reason: &str) {
    error!(port = %shared.path, "Link lost: {reason}");
    shared.stats.lock().errors += 1;
    shared.alive.store(false, Ordering::Release);
    shared.fail_all_pending(reason);
}

fn dispatch_loop(shared: Arc<Shared>, batches: Receiver<RawBatch>) {
    while let Ok(batch) = batches.recv() {
        let state = shared.streams.read().get(&batch.header.logical_id).cloned();
        match state {
            Some(state) => state.deliver(batch),
            None => debug!(lid = batch.header.logical_id, "Batch for unknown device"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::framing::encode_response;
    use std::sync::mpsc;

    /// Loopback link: frames written are handed to the test, bytes pushed by
    /// the test are read back.
    struct Loopback {
        written: mpsc::Sender<Vec<u8>>,
        incoming: Arc<Mutex<VecDeque<u8>>>,
    }

    impl Link for Loopback {
        fn write_all(&mut self, data: &[u8]) -> std::result::Result<(), transport::TransportError> {
            let _ = self.written.send(data.to_vec());
            Ok(())
        }

        fn read(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> std::result::Result<usize, transport::TransportError> {
            let mut q = self.incoming.lock();
            if q.is_empty() {
                drop(q);
                thread::sleep(timeout.min(Duration::from_millis(1)));
                return Ok(0);
            }
            let n = buf.len().min(q.len());
            for slot in buf.iter_mut().take(n) {
                *slot = q.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn try_clone(&self) -> std::result::Result<Box<dyn Link>, transport::TransportError> {
            Ok(Box::new(Loopback {
                written: self.written.clone(),
                incoming: Arc::clone(&self.incoming),
            }))
        }

        fn reopen(&mut self) -> std::result::Result<(), transport::TransportError> {
            Ok(())
        }

        fn path(&self) -> &str {
            "loopback"
        }
    }

    type Harness = (Arc<TransportChannel>, mpsc::Receiver<Vec<u8>>, Arc<Mutex<VecDeque<u8>>>);

    fn open() -> Harness {
        open_with(Duration::from_millis(250))
    }

    fn open_with(late_reply_grace: Duration) -> Harness {
        let (tx, rx) = mpsc::channel();
        let incoming = Arc::new(Mutex::new(VecDeque::new()));
        let link = Loopback {
            written: tx,
            incoming: Arc::clone(&incoming),
        };
        let options = ChannelOptions {
            settle: Duration::ZERO,
            late_reply_grace,
            ..Default::default()
        };
        let channel = TransportChannel::with_link(Box::new(link), options).unwrap();
        // header setup frames
        rx.recv().unwrap();
        rx.recv().unwrap();
        (channel, rx, incoming)
    }

    fn respond(incoming: &Mutex<VecDeque<u8>>, cmd: u8, lid: u8, data: &[u8]) {
        let header = ResponseHeader {
            command: cmd,
            logical_id: lid,
            data_len: data.len() as u8,
            ..Default::default()
        };
        incoming.lock().extend(encode_response(header, data).iter());
    }

    #[test]
    fn test_open_enables_response_header() {
        let (tx, rx) = mpsc::channel();
        let link = Loopback {
            written: tx,
            incoming: Arc::new(Mutex::new(VecDeque::new())),
        };
        let options = ChannelOptions {
            settle: Duration::ZERO,
            ..Default::default()
        };
        let _channel = TransportChannel::with_link(Box::new(link), options).unwrap();
        assert_eq!(rx.recv().unwrap(), vec![0xF9, 0xDD, 0, 0, 0, 0x57, 0x34]);
        assert_eq!(rx.recv().unwrap()[1], 0xDB);
    }

    #[test]
    fn test_response_completes_pending() {
        let (channel, written, incoming) = open();
        let pending = channel.send(Addressing::Wired, 0xED, &[]).unwrap();
        assert_eq!(written.recv().unwrap(), vec![0xF9, 0xED, 0xED]);
        respond(&incoming, 0xED, 0xFE, &[0x12, 0x34, 0x56, 0x78]);
        let resp = pending.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(&resp.data[..], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(resp.header.command, 0xED);
    }

    #[test]
    fn test_timeout_withdraws_pending_and_late_reply_is_stale() {
        let (channel, _written, incoming) = open();
        let pending = channel.send(Addressing::Wired, 0x01, &[]).unwrap();
        assert!(matches!(
            pending.wait(Duration::from_millis(20)),
            Err(Error::Timeout(20))
        ));

        let next = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        respond(&incoming, 0x01, 0xFE, &[0; 12]);
        respond(&incoming, 0x00, 0xFE, &[0; 16]);
        let resp = next.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(resp.header.command, 0x00);
        assert_eq!(channel.stale_responses(), 1);
    }

    #[test]
    fn test_late_reply_is_not_handed_to_next_identical_command() {
        let (channel, _written, incoming) = open();
        let timed_out = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        assert!(timed_out.wait(Duration::from_millis(20)).is_err());

        let next = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        respond(&incoming, 0x00, 0xFE, &[0x41, 0x10, 0, 0]);
        respond(&incoming, 0x00, 0xFE, &[0x3F, 0x80, 0, 0]);

        let resp = next.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(&resp.data[..], &[0x3F, 0x80, 0, 0]);
        assert_eq!(channel.stale_responses(), 1);
    }

    #[test]
    fn test_claimed_reply_does_not_cascade() {
        let (channel, _written, incoming) = open();
        let first = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        assert!(first.wait(Duration::from_millis(20)).is_err());

        // the only reply is taken as the late one, so this call times out
        let second = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        respond(&incoming, 0x00, 0xFE, &[1, 2, 3, 4]);
        assert!(matches!(
            second.wait(Duration::from_millis(50)),
            Err(Error::Timeout(50))
        ));

        // but leaves nothing behind to claim the next reply
        let third = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        respond(&incoming, 0x00, 0xFE, &[5, 6, 7, 8]);
        let resp = third.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(&resp.data[..], &[5, 6, 7, 8]);
    }

    #[test]
    fn test_abandoned_command_expires_after_grace() {
        let (channel, _written, incoming) = open_with(Duration::from_millis(10));
        let timed_out = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        assert!(timed_out.wait(Duration::from_millis(5)).is_err());
        thread::sleep(Duration::from_millis(30));

        let next = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        respond(&incoming, 0x00, 0xFE, &[9, 9, 9, 9]);
        assert_eq!(&next.wait(Duration::from_secs(1)).unwrap().data[..], &[9, 9, 9, 9]);
        assert_eq!(channel.stale_responses(), 0);
    }

    #[test]
    fn test_close_fails_pending_and_blocks_writes() {
        let (channel, _written, _incoming) = open();
        let pending = channel.send(Addressing::Wired, 0x00, &[]).unwrap();
        channel.close();
        assert!(matches!(pending.wait(Duration::from_secs(1)), Err(Error::Read(_))));
        assert!(matches!(
            channel.send(Addressing::Wired, 0x00, &[]),
            Err(Error::Write(_))
        ));
        assert!(!channel.is_alive(false));
        assert!(channel.is_alive(true));
        assert_eq!(channel.generation(), 1);
    }
}
