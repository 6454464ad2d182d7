//! Virtual 3-Space devices
//!
//! An in-memory sensor or dongle that speaks the wire protocol behind the
//! [`Link`] trait, so the whole engine can run without hardware. Command
//! frames are decoded as they are written; responses and stream batches are
//! queued for the next read. Stream batches are produced lazily on read, on
//! the schedule the host configured.
//!
//! [`VirtualDevice`] is the control handle; [`VirtualDevice::link`] hands out
//! the link to give to a channel or registry.

use super::capability::{CapabilityRegistry, CapabilitySet};
use super::device::{DeviceKind, FirmwareTier};
use super::protocol::codec::{self, Field, FieldType};
use super::protocol::commands::{self, code, LegacyPolicy};
use super::protocol::framing::{
    self, Addressing, ParsedCommand, ResponseHeader, STREAM_ECHO, WIRED_LOGICAL_ID,
};
use super::stream::INFINITE_DURATION;
use super::transport::{Link, TransportError};
use super::wireless::WIRELESS_SLOTS;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Firmware string of a current build
pub const CURRENT_FIRMWARE: &str = "25Apr2013A00";
/// Firmware string of a pre-2012 build
pub const LEGACY_FIRMWARE: &str = "15Jun2011A00";

const FIRMWARE_LEN: usize = 12;
const HARDWARE_LEN: usize = 32;
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Custom command hook; `Some(data)` answers the command successfully
pub type CommandHandler = Arc<dyn Fn(&ParsedCommand) -> Option<Vec<u8>> + Send + Sync>;

/// Identity of a simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorProfile {
    pub serial: u32,
    pub firmware: String,
    pub hardware: String,
}

impl SensorProfile {
    fn new(serial: u32, hardware: &str) -> Self {
        Self {
            serial,
            firmware: CURRENT_FIRMWARE.to_string(),
            hardware: hardware.to_string(),
        }
    }

    pub fn usb(serial: u32) -> Self {
        Self::new(serial, "TSS-USB")
    }

    pub fn embedded(serial: u32) -> Self {
        Self::new(serial, "TSS-EM")
    }

    pub fn wireless(serial: u32) -> Self {
        Self::new(serial, "TSS-WL")
    }

    pub fn dongle(serial: u32) -> Self {
        Self::new(serial, "TSS-DNG")
    }

    pub fn with_firmware(mut self, firmware: &str) -> Self {
        self.firmware = firmware.to_string();
        self
    }

    /// Same device on pre-2012 firmware
    pub fn legacy(self) -> Self {
        self.with_firmware(LEGACY_FIRMWARE)
    }
}

#[derive(Debug, Clone, Copy)]
struct StreamRun {
    next_due: Instant,
    end: Option<Instant>,
    interval: Duration,
}

/// Setter to getter pairs backed by a single-field register
const SETTING_REGISTERS: &[(u8, u8)] = &[
    (code::SET_AXIS_DIRECTIONS, code::GET_AXIS_DIRECTIONS),
    (code::SET_FILTER_MODE, code::GET_FILTER_MODE),
    (code::SET_GYRO_ENABLED, code::GET_GYRO_ENABLED),
    (code::SET_ACCEL_ENABLED, code::GET_ACCEL_ENABLED),
    (code::SET_COMPASS_ENABLED, code::GET_COMPASS_ENABLED),
    (code::SET_ACCEL_RANGE, code::GET_ACCEL_RANGE),
    (code::SET_COMPASS_RANGE, code::GET_COMPASS_RANGE),
    (code::SET_RUNNING_AVG_MODE, code::GET_RUNNING_AVG_MODE),
    (code::SET_REFERENCE_VECTOR_MODE, code::GET_REFERENCE_VECTOR_MODE),
    (code::SET_LED_MODE, code::GET_LED_MODE),
];

fn default_registers() -> HashMap<u8, Field> {
    HashMap::from([
        (code::GET_AXIS_DIRECTIONS, Field::U8(0)),
        (code::GET_FILTER_MODE, Field::U8(1)),
        (code::GET_GYRO_ENABLED, Field::Bool(true)),
        (code::GET_ACCEL_ENABLED, Field::Bool(true)),
        (code::GET_COMPASS_ENABLED, Field::Bool(true)),
        (code::GET_ACCEL_RANGE, Field::U8(0)),
        (code::GET_COMPASS_RANGE, Field::U8(0)),
        (code::GET_RUNNING_AVG_MODE, Field::U8(0)),
        (code::GET_REFERENCE_VECTOR_MODE, Field::U8(1)),
        (code::GET_LED_MODE, Field::U8(0)),
        (code::GET_DESIRED_UPDATE_RATE, Field::U32(10_000)),
    ])
}

/// Volatile state of one simulated device
struct Model {
    profile: SensorProfile,
    kind: DeviceKind,
    caps: CapabilitySet,
    legacy: bool,
    epoch: Instant,
    ts_offset: u32,
    tare: [f32; 4],
    led: [f32; 3],
    buttons: u8,
    slots: [u8; 8],
    timing: [u32; 3],
    run: Option<StreamRun>,
    pan_id: u16,
    channel: u8,
    hw_retries: u8,
    table: [u32; WIRELESS_SLOTS],
    registers: HashMap<u8, Field>,
}

impl Model {
    fn new(profile: SensorProfile) -> Self {
        let kind = DeviceKind::from_hardware_version(&profile.hardware).unwrap_or(DeviceKind::Usb);
        let legacy = FirmwareTier::from_version(&profile.firmware) == Some(FirmwareTier::Legacy);
        Self {
            caps: CapabilityRegistry::for_kind(kind),
            kind,
            legacy,
            profile,
            epoch: Instant::now(),
            ts_offset: 0,
            tare: [0.0, 0.0, 0.0, 1.0],
            led: [0.0, 0.0, 1.0],
            buttons: 0,
            slots: [code::NULL_SLOT; 8],
            timing: [0, INFINITE_DURATION, 0],
            run: None,
            pan_id: 1,
            channel: 26,
            hw_retries: 3,
            table: [0; WIRELESS_SLOTS],
            registers: default_registers(),
        }
    }

    fn timestamp(&self, at: Instant) -> u32 {
        let elapsed = at.saturating_duration_since(self.epoch).as_micros() as u32;
        elapsed.wrapping_add(self.ts_offset)
    }

    fn orientation(&self, at: Instant) -> [f32; 4] {
        let t = at.saturating_duration_since(self.epoch).as_secs_f32();
        let half = 0.25 * t;
        [0.0, half.sin(), 0.0, half.cos()]
    }

    fn accepts(&self, command: u8) -> bool {
        let Some(spec) = commands::lookup(command) else {
            return false;
        };
        if !self.caps.supports(spec.capability) {
            return false;
        }
        !(self.legacy && spec.legacy != LegacyPolicy::Native)
    }

    fn string_fields(s: &str, len: usize) -> Vec<Field> {
        let mut bytes: Vec<u8> = s.bytes().take(len).collect();
        bytes.resize(len, b' ');
        bytes.into_iter().map(Field::Char).collect()
    }

    /// Output fields of a read command at time `at`
    fn read(&self, command: u8, payload: &[u8], at: Instant) -> Vec<Field> {
        fn floats(v: &[f32]) -> Vec<Field> {
            v.iter().copied().map(Field::F32).collect()
        }
        if let Some(field) = self.registers.get(&command) {
            return vec![*field];
        }
        let t = at.saturating_duration_since(self.epoch).as_secs_f32();
        match command {
            code::TARED_QUATERNION
            | code::UNTARED_QUATERNION
            | code::DIFFERENCE_QUATERNION => floats(&self.orientation(at)),
            code::GET_TARE_QUATERNION => floats(&self.tare),
            code::GET_LED_COLOR => floats(&self.led),
            code::TEMPERATURE_C => floats(&[24.5]),
            code::TEMPERATURE_F => floats(&[76.1]),
            code::CONFIDENCE => floats(&[0.98]),
            code::BATTERY_VOLTAGE => floats(&[3.9]),
            code::BATTERY_PERCENT => vec![Field::U8(87)],
            code::BATTERY_STATUS => vec![Field::U8(1)],
            code::BUTTON_STATE => vec![Field::U8(self.buttons)],
            code::GET_CHANNEL => vec![Field::U8(self.channel)],
            code::GET_PAN_ID => vec![Field::U16(self.pan_id)],
            code::GET_WIRELESS_RETRIES => vec![Field::U8(self.hw_retries)],
            code::OPEN_SLOTS => vec![Field::U8(WIRELESS_SLOTS as u8)],
            code::SIGNAL_STRENGTH => vec![Field::U8(200)],
            code::GET_STREAM_SLOTS => self.slots.iter().copied().map(Field::U8).collect(),
            code::GET_STREAM_TIMING => self.timing.iter().copied().map(Field::U32).collect(),
            code::GET_TIMESTAMP => vec![Field::U32(self.timestamp(at))],
            code::SERIAL_NUMBER => vec![Field::U32(self.profile.serial)],
            code::FIRMWARE_VERSION => Self::string_fields(&self.profile.firmware, FIRMWARE_LEN),
            code::HARDWARE_VERSION => Self::string_fields(&self.profile.hardware, HARDWARE_LEN),
            code::GET_SERIAL_AT_LOGICAL_ID => {
                let idx = payload.first().copied().map(usize::from).unwrap_or(usize::MAX);
                vec![Field::U32(self.table.get(idx).copied().unwrap_or(0))]
            }
            other => {
                // smooth, distinct per command and axis
                let n = commands::lookup(other)
                    .map(|s| s.output.iter().filter(|t| **t == FieldType::F32).count())
                    .unwrap_or(0);
                (0..n)
                    .map(|i| Field::F32((t + f32::from(other) * 0.01 + i as f32 * 0.5).sin()))
                    .collect()
            }
        }
    }

    /// Apply a command; `None` means the device rejects it
    fn execute(&mut self, command: u8, payload: &[u8], at: Instant) -> Option<Bytes> {
        if !self.accepts(command) {
            return None;
        }
        let spec = commands::lookup(command)?;
        let input = codec::decode(spec.input, payload).ok()?;
        let u32_at = |i: usize| input.get(i).and_then(Field::as_u32);
        let f32s: Vec<f32> = codec::floats(&input);

        match command {
            code::TARE_CURRENT => self.tare = self.orientation(at),
            code::TARE_QUATERNION => self.tare = f32s.try_into().ok()?,
            code::SET_LED_COLOR => self.led = f32s.try_into().ok()?,
            code::SET_PAN_ID => self.pan_id = u16::try_from(u32_at(0)?).ok()?,
            code::SET_CHANNEL => self.channel = input.first()?.as_u8()?,
            code::SET_WIRELESS_RETRIES => self.hw_retries = input.first()?.as_u8()?,
            code::SET_SERIAL_AT_LOGICAL_ID => {
                let idx = usize::from(input.first()?.as_u8()?);
                *self.table.get_mut(idx)? = u32_at(1)?;
            }
            code::SET_STREAM_SLOTS => {
                for (slot, field) in self.slots.iter_mut().zip(&input) {
                    *slot = field.as_u8()?;
                }
            }
            code::SET_STREAM_TIMING => {
                for (i, t) in self.timing.iter_mut().enumerate() {
                    *t = u32_at(i)?;
                }
            }
            code::START_STREAMING => self.start_stream(at)?,
            code::STOP_STREAMING | code::SOFTWARE_RESET => self.run = None,
            code::UPDATE_TIMESTAMP => {
                let elapsed = self.timestamp(at).wrapping_sub(self.ts_offset);
                self.ts_offset = u32_at(0)?.wrapping_sub(elapsed);
            }
            code::RESTORE_FACTORY => {
                self.tare = [0.0, 0.0, 0.0, 1.0];
                self.led = [0.0, 0.0, 1.0];
                self.registers = default_registers();
            }
            _ => {
                if let Some(&(_, get)) = SETTING_REGISTERS.iter().find(|(set, _)| *set == command) {
                    self.registers.insert(get, *input.first()?);
                }
            }
        }

        let fields = self.read(command, payload, at);
        codec::encode(spec.output, &fields).ok()
    }

    fn start_stream(&mut self, at: Instant) -> Option<()> {
        if self.slots.iter().all(|&s| s == code::NULL_SLOT) {
            return None;
        }
        let [interval, duration, delay] = self.timing;
        let start = at + Duration::from_micros(u64::from(delay));
        self.run = Some(StreamRun {
            next_due: start,
            end: (duration != INFINITE_DURATION)
                .then(|| start + Duration::from_micros(u64::from(duration))),
            interval: Duration::from_micros(u64::from(interval)).max(MIN_INTERVAL),
        });
        Some(())
    }

    fn batch(&self, at: Instant) -> Bytes {
        let mut data = Vec::new();
        for &slot in self.slots.iter().filter(|&&s| s != code::NULL_SLOT) {
            if let Some(spec) = commands::lookup(slot) {
                let fields = self.read(slot, &[], at);
                if let Ok(bytes) = codec::encode(spec.output, &fields) {
                    data.extend_from_slice(&bytes);
                }
            }
        }
        Bytes::from(data)
    }

    /// Emit every batch due by `now`; returns when the next one is due
    fn poll_stream(&mut self, now: Instant, logical_id: u8, out: &mut VecDeque<u8>) -> Option<Instant> {
        let mut run = self.run?;
        while run.next_due <= now {
            if run.end.is_some_and(|end| run.next_due >= end) {
                self.run = None;
                return None;
            }
            let data = self.batch(run.next_due);
            let header = ResponseHeader {
                status: 0,
                timestamp: self.timestamp(run.next_due),
                command: STREAM_ECHO,
                logical_id,
                data_len: data.len() as u8,
            };
            out.extend(framing::encode_response(header, &data).iter());
            run.next_due += run.interval;
        }
        if run.end.is_some_and(|end| run.next_due >= end) {
            self.run = None;
            return None;
        }
        self.run = Some(run);
        Some(run.next_due)
    }
}

struct SimState {
    connected: bool,
    header: bool,
    silent: bool,
    outgoing: VecDeque<u8>,
    device: Model,
    /// Wireless sensors in radio range of a dongle, by serial
    wireless: HashMap<u32, Model>,
    log: Vec<ParsedCommand>,
    handler: Option<CommandHandler>,
}

impl SimState {
    fn respond(&mut self, status: u8, timestamp: u32, command: u8, logical_id: u8, data: &[u8]) {
        if !self.header {
            self.outgoing.extend(data);
            return;
        }
        let header = ResponseHeader {
            status,
            timestamp,
            command,
            logical_id,
            data_len: data.len() as u8,
        };
        self.outgoing
            .extend(framing::encode_response(header, data).iter());
    }

    fn handle(&mut self, frame: ParsedCommand, now: Instant) {
        trace!(cmd = frame.command, "Simulator received");
        self.log.push(frame.clone());

        if matches!(frame.command, code::SET_WIRED_HEADER | code::SET_WIRELESS_HEADER) {
            self.header = true;
            return;
        }
        if self.silent {
            return;
        }

        let logical_id = frame.addressing.logical_id();
        if let Some(handler) = self.handler.clone() {
            if let Some(data) = handler(&frame) {
                let ts = self.device.timestamp(now);
                self.respond(0, ts, frame.command, logical_id, &data);
                return;
            }
        }

        match frame.addressing {
            Addressing::Wired => {
                let ts = self.device.timestamp(now);
                match self.device.execute(frame.command, &frame.payload, now) {
                    Some(data) => self.respond(0, ts, frame.command, logical_id, &data),
                    None => self.respond(1, ts, frame.command, logical_id, &[]),
                }
            }
            Addressing::Wireless(lid) => {
                if self.device.kind != DeviceKind::Dongle {
                    debug!(lid, "Wireless frame sent to a wired sensor, ignored");
                    return;
                }
                let serial = self.device.table.get(usize::from(lid)).copied().unwrap_or(0);
                let reply = self
                    .wireless
                    .get_mut(&serial)
                    .filter(|_| serial != 0)
                    .map(|m| (m.timestamp(now), m.execute(frame.command, &frame.payload, now)));
                match reply {
                    Some((ts, Some(data))) => self.respond(0, ts, frame.command, lid, &data),
                    // unreachable or rejected: the dongle reports failure after its own retries
                    Some((ts, None)) => self.respond(1, ts, frame.command, lid, &[]),
                    None => self.respond(1, 0, frame.command, lid, &[]),
                }
            }
        }
    }

    /// Queue due stream batches; returns the earliest next due time
    fn poll_streams(&mut self, now: Instant) -> Option<Instant> {
        let mut next = self.device.poll_stream(now, WIRED_LOGICAL_ID, &mut self.outgoing);
        for (lid, &serial) in self.device.table.iter().enumerate() {
            if serial == 0 {
                continue;
            }
            if let Some(model) = self.wireless.get_mut(&serial) {
                let due = model.poll_stream(now, lid as u8, &mut self.outgoing);
                next = match (next, due) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        next
    }

    fn power_cycle(&mut self) {
        self.header = false;
        self.outgoing.clear();
        self.device.run = None;
        for model in self.wireless.values_mut() {
            model.run = None;
        }
    }
}

struct Shared {
    state: Mutex<SimState>,
    ready: Condvar,
}

/// Control handle of a simulated device
#[derive(Clone)]
pub struct VirtualDevice {
    shared: Arc<Shared>,
    path: Arc<str>,
}

impl VirtualDevice {
    pub fn new(path: &str, profile: SensorProfile) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    connected: true,
                    header: false,
                    silent: false,
                    outgoing: VecDeque::new(),
                    device: Model::new(profile),
                    wireless: HashMap::new(),
                    log: Vec::new(),
                    handler: None,
                }),
                ready: Condvar::new(),
            }),
            path: Arc::from(path),
        }
    }

    /// USB sensor on current firmware
    pub fn usb(path: &str) -> Self {
        Self::new(path, SensorProfile::usb(0x1000_0001))
    }

    /// Wireless dongle with an empty table
    pub fn dongle(path: &str) -> Self {
        Self::new(path, SensorProfile::dongle(0x2000_0001))
    }

    /// A fresh link to this device
    pub fn link(&self) -> Box<dyn Link> {
        Box::new(VirtualLink {
            shared: Arc::clone(&self.shared),
            path: Arc::clone(&self.path),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bring a wireless sensor into the dongle's radio range
    pub fn add_wireless_sensor(&self, profile: SensorProfile) {
        let mut state = self.shared.state.lock();
        state.wireless.insert(profile.serial, Model::new(profile));
    }

    /// Write the dongle's logical id table directly
    pub fn pair(&self, logical_id: u8, serial: u32) {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.device.table.get_mut(usize::from(logical_id)) {
            *slot = serial;
        }
    }

    /// Stop answering commands (stream batches continue)
    pub fn set_silent(&self, silent: bool) {
        self.shared.state.lock().silent = silent;
    }

    /// Answer commands through `handler` before the built-in behavior
    pub fn set_handler(&self, handler: Option<CommandHandler>) {
        self.shared.state.lock().handler = handler;
    }

    /// Set the simulated button bitmask
    pub fn press_buttons(&self, mask: u8) {
        self.shared.state.lock().device.buttons = mask;
    }

    /// Simulate a cable pull; reads and writes fail until [`replug`](Self::replug)
    pub fn unplug(&self) {
        self.shared.state.lock().connected = false;
        self.shared.ready.notify_all();
    }

    pub fn replug(&self) {
        let mut state = self.shared.state.lock();
        state.connected = true;
        state.power_cycle();
    }

    /// Queue raw bytes for the host to read
    pub fn inject(&self, bytes: &[u8]) {
        self.shared.state.lock().outgoing.extend(bytes);
        self.shared.ready.notify_all();
    }

    /// Every command frame received so far
    pub fn commands(&self) -> Vec<ParsedCommand> {
        self.shared.state.lock().log.clone()
    }

    /// Frames received carrying `command`
    pub fn count(&self, command: u8) -> usize {
        self.shared
            .state
            .lock()
            .log
            .iter()
            .filter(|f| f.command == command)
            .count()
    }

    /// Total frames received
    pub fn frames_received(&self) -> usize {
        self.shared.state.lock().log.len()
    }

    /// Whether the device at `logical_id` (0xFE for the wired device) is streaming
    pub fn is_streaming(&self, logical_id: u8) -> bool {
        let state = self.shared.state.lock();
        if logical_id == WIRED_LOGICAL_ID {
            return state.device.run.is_some();
        }
        state
            .device
            .table
            .get(usize::from(logical_id))
            .and_then(|serial| state.wireless.get(serial))
            .is_some_and(|m| m.run.is_some())
    }
}

/// [`Link`] end of a [`VirtualDevice`]
pub struct VirtualLink {
    shared: Arc<Shared>,
    path: Arc<str>,
}

impl Link for VirtualLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        match framing::decode_command(data) {
            Ok(frame) => state.handle(frame, Instant::now()),
            Err(e) => debug!(path = %self.path, "Simulator ignored bytes: {e}"),
        }
        self.shared.ready.notify_all();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            let now = Instant::now();
            let next_batch = state.poll_streams(now);
            if !state.outgoing.is_empty() {
                let n = buf.len().min(state.outgoing.len());
                for (dst, src) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if now >= deadline {
                return Ok(0);
            }
            let wake = next_batch.map_or(deadline, |due| due.min(deadline));
            self.shared.ready.wait_until(&mut state, wake);
        }
    }

    fn try_clone(&self) -> Result<Box<dyn Link>, TransportError> {
        Ok(Box::new(VirtualLink {
            shared: Arc::clone(&self.shared),
            path: Arc::clone(&self.path),
        }))
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !state.connected {
            return Err(TransportError::PortNotFound(self.path.to_string()));
        }
        state.power_cycle();
        Ok(())
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn describe(&self) -> String {
        format!("virtual device at {}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{read_exact, ReadOutcome};

    fn enable_headers(link: &mut dyn Link) {
        let frame = framing::encode_command(Addressing::Wired, code::SET_WIRED_HEADER, &[0, 0, 0, 0x57]);
        link.write_all(&frame).unwrap();
    }

    fn response(link: &mut dyn Link) -> (ResponseHeader, Bytes) {
        let header = match read_exact(link, 8, Duration::from_millis(200)).unwrap() {
            ReadOutcome::Complete(b) => ResponseHeader::parse(&b).unwrap(),
            other => panic!("no header: {other:?}"),
        };
        let data = match read_exact(link, usize::from(header.data_len), Duration::from_millis(200)).unwrap() {
            ReadOutcome::Complete(b) => b,
            ReadOutcome::Idle => Bytes::new(),
            other => panic!("short data: {other:?}"),
        };
        (header, data)
    }

    #[test]
    fn test_answers_serial_number() {
        let device = VirtualDevice::usb("sim0");
        let mut link = device.link();
        enable_headers(link.as_mut());
        link.write_all(&framing::encode_command(Addressing::Wired, code::SERIAL_NUMBER, &[]))
            .unwrap();
        let (header, data) = response(link.as_mut());
        assert_eq!(header.command, code::SERIAL_NUMBER);
        assert_eq!(header.logical_id, WIRED_LOGICAL_ID);
        assert!(header.is_ok());
        assert_eq!(&data[..], &0x1000_0001u32.to_be_bytes());
    }

    #[test]
    fn test_legacy_firmware_rejects_new_commands() {
        let device = VirtualDevice::new("sim1", SensorProfile::usb(7).legacy());
        let mut link = device.link();
        enable_headers(link.as_mut());
        link.write_all(&framing::encode_command(Addressing::Wired, code::CORRECTED_ACCEL, &[]))
            .unwrap();
        let (header, data) = response(link.as_mut());
        assert_eq!(header.status, 1);
        assert!(data.is_empty());
    }

    #[test]
    fn test_dongle_routes_to_paired_sensor() {
        let device = VirtualDevice::dongle("sim2");
        device.add_wireless_sensor(SensorProfile::wireless(0xABCD));
        device.pair(4, 0xABCD);
        let mut link = device.link();
        enable_headers(link.as_mut());

        link.write_all(&framing::encode_command(Addressing::Wireless(4), code::SERIAL_NUMBER, &[]))
            .unwrap();
        let (header, data) = response(link.as_mut());
        assert_eq!(header.logical_id, 4);
        assert_eq!(&data[..], &0xABCDu32.to_be_bytes());

        link.write_all(&framing::encode_command(Addressing::Wireless(5), code::SERIAL_NUMBER, &[]))
            .unwrap();
        let (header, _) = response(link.as_mut());
        assert_eq!(header.logical_id, 5);
        assert_ne!(header.status, 0);
    }

    #[test]
    fn test_streams_on_schedule_until_duration() {
        let device = VirtualDevice::usb("sim3");
        let mut link = device.link();
        enable_headers(link.as_mut());
        let slots = [code::TARED_QUATERNION, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut timing = Vec::new();
        for v in [5_000u32, 30_000, 0] {
            timing.extend_from_slice(&v.to_be_bytes());
        }
        for (cmd, payload) in [
            (code::SET_STREAM_SLOTS, &slots[..]),
            (code::SET_STREAM_TIMING, &timing[..]),
            (code::START_STREAMING, &[][..]),
        ] {
            link.write_all(&framing::encode_command(Addressing::Wired, cmd, payload))
                .unwrap();
            assert!(response(link.as_mut()).0.is_ok());
        }

        let mut batches = 0;
        while let Ok(ReadOutcome::Complete(b)) = read_exact(link.as_mut(), 8, Duration::from_millis(60)) {
            let header = ResponseHeader::parse(&b).unwrap();
            assert!(header.is_stream());
            assert_eq!(header.data_len, 16);
            let _ = read_exact(link.as_mut(), 16, Duration::from_millis(60)).unwrap();
            batches += 1;
        }
        assert_eq!(batches, 6);
        assert!(!device.is_streaming(WIRED_LOGICAL_ID));
    }

    #[test]
    fn test_unplugged_link_fails_and_reopen_needs_replug() {
        let device = VirtualDevice::usb("sim4");
        let mut link = device.link();
        device.unplug();
        assert!(matches!(
            link.read(&mut [0u8; 4], Duration::from_millis(1)),
            Err(TransportError::Disconnected)
        ));
        assert!(link.reopen().is_err());
        device.replug();
        assert!(link.reopen().is_ok());
    }
}
