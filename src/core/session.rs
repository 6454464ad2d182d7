//! Device sessions
//!
//! A [`DeviceSession`] is one addressable device: a directly attached sensor
//! or dongle on its own channel, or a wireless sensor reached through a
//! dongle's [`WirelessMux`]. Sessions move `Created -> Active -> Closed`;
//! identification is the only way into `Active`, and every command on a
//! closed session fails with `InvalidId`.

use super::capability::{CapabilityRegistry, CapabilitySet};
use super::channel::{Pending, RawResponse, TransportChannel};
use super::device::{
    AxisDirections, DeviceId, DeviceInfo, DeviceKind, FirmwareTier, Reading, TimestampMode,
};
use super::error::{Error, Result};
use super::protocol::codec::{self, CommandFrame, Field, FieldType, ResponseFrame};
use super::protocol::commands::{self, code, CommandSpec, LegacyPolicy};
use super::protocol::framing::{Addressing, WIRED_LOGICAL_ID};
use super::stream::{
    SlotPlan, StreamBatch, StreamCallback, StreamCounters, StreamState, StreamStatus, StreamTiming,
};
use super::wireless::{WirelessMux, WirelessPending, MAX_HARDWARE_RETRIES};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Link is up, identity not yet confirmed
    Created,
    /// Identified and usable
    Active,
    /// Terminal
    Closed,
}

/// Lifecycle events, broadcast by the registry and its sessions
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Session identified and registered
    Opened { id: DeviceId, kind: DeviceKind },
    /// Session closed
    Closed { id: DeviceId },
    /// Channel reopened; transient state was reset
    Reconnected { id: DeviceId },
    StreamStarted { id: DeviceId },
    StreamStopped { id: DeviceId },
    /// A command ran as an older substitute
    Emulated { id: DeviceId, command: u8 },
}

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Response bound for wired commands
    pub command_timeout: Duration,
    /// Response bound for each wireless attempt
    pub wireless_timeout: Duration,
    pub timestamp_mode: TimestampMode,
    /// Capacity of each stream subscription
    pub subscriber_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(1000),
            wireless_timeout: Duration::from_millis(200),
            timestamp_mode: TimestampMode::Sensor,
            subscriber_capacity: 256,
        }
    }
}

/// How commands reach the device
#[derive(Clone)]
pub enum Route {
    /// Directly attached
    Wired(Arc<TransportChannel>),
    /// Through a dongle
    Wireless {
        mux: Arc<WirelessMux>,
        logical_id: u8,
    },
}

impl Route {
    fn channel(&self) -> &Arc<TransportChannel> {
        match self {
            Self::Wired(channel) => channel,
            Self::Wireless { mux, .. } => mux.channel(),
        }
    }

    fn logical_id(&self) -> u8 {
        match self {
            Self::Wired(_) => WIRED_LOGICAL_ID,
            Self::Wireless { logical_id, .. } => *logical_id,
        }
    }
}

enum InFlight {
    Wired(Pending),
    Wireless(WirelessPending),
}

/// A submitted command awaiting its response
pub struct PendingCommand {
    inflight: InFlight,
    command: u8,
    output: Option<&'static [FieldType]>,
    response_len: usize,
    emulated: bool,
    mode: TimestampMode,
    kind: DeviceKind,
    last_timestamp: Arc<Mutex<Option<u32>>>,
}

impl PendingCommand {
    /// Wait for and decode the response
    pub fn wait(self, timeout: Duration) -> Result<ResponseFrame> {
        let raw: RawResponse = match self.inflight {
            InFlight::Wired(pending) => {
                let raw = pending.wait(timeout)?;
                if !raw.header.is_ok() {
                    return Err(Error::InvalidCommand {
                        code: self.command,
                        kind: self.kind.to_string(),
                    });
                }
                raw
            }
            InFlight::Wireless(pending) => pending.wait(timeout)?,
        };

        if raw.data.len() != self.response_len {
            return Err(Error::Read(format!(
                "command 0x{:02x}: expected {} data bytes, got {}",
                self.command,
                self.response_len,
                raw.data.len()
            )));
        }

        let fields = match self.output {
            Some(schema) => codec::decode(schema, &raw.data)?,
            None => Vec::new(),
        };

        let timestamp = match self.mode {
            TimestampMode::None => None,
            TimestampMode::Sensor => Some(raw.header.timestamp),
            TimestampMode::System => Some(raw.host_time_us),
        };
        if let Some(ts) = timestamp {
            *self.last_timestamp.lock() = Some(ts);
        }

        Ok(ResponseFrame {
            fields,
            raw: raw.data,
            timestamp,
            emulated: self.emulated,
        })
    }
}

/// One addressable device
pub struct DeviceSession {
    id: RwLock<DeviceId>,
    kind: RwLock<DeviceKind>,
    capabilities: RwLock<CapabilitySet>,
    route: Route,
    state: RwLock<SessionState>,
    info: RwLock<DeviceInfo>,
    mode: RwLock<TimestampMode>,
    last_timestamp: Arc<Mutex<Option<u32>>>,
    last_activity: Mutex<Option<Instant>>,
    stream: Arc<StreamState>,
    mux: Option<Arc<WirelessMux>>,
    options: SessionOptions,
    events: Option<broadcast::Sender<DeviceEvent>>,
}

impl DeviceSession {
    /// Session over `route`, in `Created`
    pub fn new(
        route: Route,
        kind: DeviceKind,
        options: SessionOptions,
        events: Option<broadcast::Sender<DeviceEvent>>,
    ) -> Arc<Self> {
        Self::build(route, kind, None, options, events)
    }

    /// Dongle session owning the multiplexer for its wireless sensors
    pub fn new_dongle(
        channel: Arc<TransportChannel>,
        retries: u8,
        options: SessionOptions,
        events: Option<broadcast::Sender<DeviceEvent>>,
    ) -> Arc<Self> {
        let mux = WirelessMux::new(Arc::clone(&channel), retries);
        Self::build(Route::Wired(channel), DeviceKind::Dongle, Some(mux), options, events)
    }

    fn build(
        route: Route,
        kind: DeviceKind,
        mux: Option<Arc<WirelessMux>>,
        options: SessionOptions,
        events: Option<broadcast::Sender<DeviceEvent>>,
    ) -> Arc<Self> {
        let stream = Arc::new(StreamState::new(
            route.logical_id(),
            options.timestamp_mode,
            options.subscriber_capacity,
        ));
        route.channel().register_stream(Arc::clone(&stream));

        Arc::new(Self {
            id: RwLock::new(DeviceId::NONE),
            kind: RwLock::new(kind),
            capabilities: RwLock::new(CapabilityRegistry::for_kind(kind)),
            mode: RwLock::new(options.timestamp_mode),
            route,
            state: RwLock::new(SessionState::Created),
            info: RwLock::new(DeviceInfo::default()),
            last_timestamp: Arc::new(Mutex::new(None)),
            last_activity: Mutex::new(None),
            stream,
            mux,
            options,
            events,
        })
    }

    pub fn id(&self) -> DeviceId {
        *self.id.read()
    }

    pub fn kind(&self) -> DeviceKind {
        *self.kind.read()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.read().clone()
    }

    /// Firmware tier, known after identification
    pub fn firmware_tier(&self) -> Option<FirmwareTier> {
        self.info.read().tier
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn channel(&self) -> &Arc<TransportChannel> {
        self.route.channel()
    }

    /// The multiplexer, for dongle sessions
    pub fn mux(&self) -> Option<&Arc<WirelessMux>> {
        self.mux.as_ref()
    }

    /// Logical id on the dongle, for wireless sessions
    pub fn logical_id(&self) -> Option<u8> {
        match self.route {
            Route::Wired(_) => None,
            Route::Wireless { logical_id, .. } => Some(logical_id),
        }
    }

    pub fn is_wireless(&self) -> bool {
        matches!(self.route, Route::Wireless { .. })
    }

    /// Time of the most recent successful command
    pub fn last_activity(&self) -> Option<Instant> {
        *self.last_activity.lock()
    }

    /// Timestamp of the most recent response
    pub fn last_timestamp(&self) -> Option<u32> {
        *self.last_timestamp.lock()
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        *self.mode.read()
    }

    pub fn set_timestamp_mode(&self, mode: TimestampMode) {
        *self.mode.write() = mode;
        self.stream.set_timestamp_mode(mode);
    }

    /// Assign the registry identifier and final kind
    pub(crate) fn bind(&self, id: DeviceId, kind: DeviceKind) {
        *self.id.write() = id;
        if *self.kind.read() != kind {
            *self.kind.write() = kind;
            *self.capabilities.write() = CapabilityRegistry::for_kind(kind);
        }
    }

    fn emit(&self, event: DeviceEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.read() == SessionState::Closed {
            return Err(Error::InvalidId(self.id().0));
        }
        Ok(())
    }

    fn check_capability(&self, spec: &CommandSpec) -> Result<()> {
        if self.capabilities.read().supports(spec.capability) {
            Ok(())
        } else {
            Err(Error::InvalidCommand {
                code: spec.code,
                kind: self.kind().to_string(),
            })
        }
    }

    fn resolve(&self, spec: &'static CommandSpec) -> Result<(&'static CommandSpec, bool)> {
        if self.firmware_tier() != Some(FirmwareTier::Legacy) {
            return Ok((spec, false));
        }
        match spec.legacy {
            LegacyPolicy::Native => Ok((spec, false)),
            LegacyPolicy::Unsupported => Err(Error::FirmwareIncompatible(spec.code)),
            LegacyPolicy::Substitute(alt) => {
                let alt_spec = commands::lookup(alt).ok_or(Error::FirmwareIncompatible(spec.code))?;
                warn!(
                    id = %self.id(),
                    command = spec.name,
                    substitute = alt_spec.name,
                    "Legacy firmware, emulating command"
                );
                self.emit(DeviceEvent::Emulated {
                    id: self.id(),
                    command: spec.code,
                });
                Ok((alt_spec, true))
            }
        }
    }

    fn dispatch(
        &self,
        frame: CommandFrame,
        output: Option<&'static [FieldType]>,
        emulated: bool,
    ) -> Result<PendingCommand> {
        let inflight = match &self.route {
            Route::Wired(channel) => {
                InFlight::Wired(channel.send(Addressing::Wired, frame.command, &frame.payload)?)
            }
            Route::Wireless { mux, logical_id } => {
                InFlight::Wireless(mux.submit(*logical_id, frame.command, frame.payload.clone())?)
            }
        };
        Ok(PendingCommand {
            inflight,
            command: frame.command,
            output,
            response_len: frame.response_len,
            emulated,
            mode: self.timestamp_mode(),
            kind: self.kind(),
            last_timestamp: Arc::clone(&self.last_timestamp),
        })
    }

    fn timeout(&self) -> Duration {
        if self.is_wireless() {
            self.options.wireless_timeout
        } else {
            self.options.command_timeout
        }
    }

    /// Encode and send a formatted command without waiting
    pub fn submit(&self, command: u8, fields: &[Field]) -> Result<PendingCommand> {
        self.ensure_open()?;
        let spec = commands::lookup(command).ok_or_else(|| Error::InvalidCommand {
            code: command,
            kind: self.kind().to_string(),
        })?;
        self.check_capability(spec)?;
        let (spec, emulated) = self.resolve(spec)?;
        let frame = CommandFrame::formatted(spec.code, spec.input, fields, spec.output)?;
        self.dispatch(frame, Some(spec.output), emulated)
    }

    /// Send a formatted command and wait for its decoded response
    pub fn command(&self, command: u8, fields: &[Field]) -> Result<ResponseFrame> {
        let response = self.submit(command, fields)?.wait(self.timeout())?;
        *self.last_activity.lock() = Some(Instant::now());
        Ok(response)
    }

    /// Byte-exact command with no schema and no endian conversion
    pub fn raw_command(
        &self,
        command: u8,
        payload: &[u8],
        response_len: usize,
    ) -> Result<ResponseFrame> {
        self.ensure_open()?;
        let frame = CommandFrame::raw(command, payload, response_len);
        let response = self.dispatch(frame, None, false)?.wait(self.timeout())?;
        *self.last_activity.lock() = Some(Instant::now());
        Ok(response)
    }

    /// Query serial, firmware and hardware version; `Created -> Active`
    pub fn identify(&self) -> Result<DeviceInfo> {
        self.ensure_open()?;
        let serial = self.read_u32(code::SERIAL_NUMBER)?.value;
        let firmware_version = self.read_string(code::FIRMWARE_VERSION)?;
        let hardware_version = self.read_string(code::HARDWARE_VERSION)?;

        let tier = FirmwareTier::from_version(&firmware_version).unwrap_or_else(|| {
            warn!(firmware = %firmware_version, "Unrecognised firmware version, assuming current");
            FirmwareTier::Current
        });

        let info = DeviceInfo {
            serial,
            kind: DeviceKind::from_hardware_version(&hardware_version),
            firmware_version,
            hardware_version,
            tier: Some(tier),
        };
        *self.info.write() = info.clone();
        *self.state.write() = SessionState::Active;
        info!(
            serial = %info.serial_hex(),
            firmware = %info.firmware_version,
            hardware = %info.hardware_version,
            ?tier,
            "Device identified"
        );
        Ok(info)
    }

    /// Check the link, optionally reopening it; `Closed` sessions are never there
    pub fn is_alive(&self, reconnect: bool) -> bool {
        if self.state() == SessionState::Closed {
            return false;
        }
        let channel = self.channel();
        let before = channel.generation();
        let alive = channel.is_alive(reconnect);
        if alive && channel.generation() != before {
            self.emit(DeviceEvent::Reconnected { id: self.id() });
        }
        alive
    }

    /// `-> Closed`. Stops streaming best-effort; wired sessions close their channel.
    pub fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        if self.stream.status() == StreamStatus::Streaming {
            if let Err(e) = self.write_only(code::STOP_STREAMING, &[]) {
                debug!(id = %self.id(), "Stop on close failed: {e}");
            }
        }
        {
            let mut state = self.state.write();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.stream.end();
        self.channel().unregister_stream(self.route.logical_id());
        if let Route::Wired(channel) = &self.route {
            channel.close();
        }
        debug!(id = %self.id(), "Session closed");
        self.emit(DeviceEvent::Closed { id: self.id() });
    }

    // ---- typed reads -------------------------------------------------------

    fn read_floats<const N: usize>(&self, command: u8) -> Result<Reading<[f32; N]>> {
        let resp = self.command(command, &[])?;
        let floats = codec::floats(&resp.fields);
        let value: [f32; N] = floats.try_into().map_err(|v: Vec<f32>| {
            Error::Read(format!("command 0x{command:02x}: expected {N} floats, got {}", v.len()))
        })?;
        Ok(Reading {
            value,
            timestamp: resp.timestamp,
            emulated: resp.emulated,
        })
    }

    fn read_scalar(&self, command: u8) -> Result<Reading<Field>> {
        let resp = self.command(command, &[])?;
        let value = resp
            .fields
            .first()
            .copied()
            .ok_or_else(|| Error::Read(format!("command 0x{command:02x}: empty response")))?;
        Ok(Reading {
            value,
            timestamp: resp.timestamp,
            emulated: resp.emulated,
        })
    }

    fn read_u32(&self, command: u8) -> Result<Reading<u32>> {
        let r = self.read_scalar(command)?;
        let v = r
            .value
            .as_u32()
            .ok_or_else(|| Error::Read(format!("command 0x{command:02x}: not an integer")))?;
        Ok(r.map(|_| v))
    }

    fn read_u8(&self, command: u8) -> Result<Reading<u8>> {
        let r = self.read_scalar(command)?;
        let v = r
            .value
            .as_u8()
            .ok_or_else(|| Error::Read(format!("command 0x{command:02x}: not a byte")))?;
        Ok(r.map(|_| v))
    }

    fn read_bool(&self, command: u8) -> Result<bool> {
        self.read_scalar(command)?
            .value
            .as_bool()
            .ok_or_else(|| Error::Read(format!("command 0x{command:02x}: not a flag")))
    }

    fn read_string(&self, command: u8) -> Result<String> {
        let resp = self.command(command, &[])?;
        Ok(codec::chars_to_string(&resp.fields))
    }

    fn write_only(&self, command: u8, fields: &[Field]) -> Result<()> {
        self.command(command, fields).map(|_| ())
    }

    pub fn tared_quaternion(&self) -> Result<Reading<[f32; 4]>> {
        self.read_floats(code::TARED_QUATERNION)
    }

    pub fn untared_quaternion(&self) -> Result<Reading<[f32; 4]>> {
        self.read_floats(code::UNTARED_QUATERNION)
    }

    /// Tared euler angles (pitch, yaw, roll) in radians
    pub fn tared_euler(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::TARED_EULER)
    }

    pub fn untared_euler(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::UNTARED_EULER)
    }

    /// Row-major 3x3 rotation matrix
    pub fn tared_matrix(&self) -> Result<Reading<[f32; 9]>> {
        self.read_floats(code::TARED_MATRIX)
    }

    /// Axis (x, y, z) followed by angle in radians
    pub fn tared_axis_angle(&self) -> Result<Reading<[f32; 4]>> {
        self.read_floats(code::TARED_AXIS_ANGLE)
    }

    /// Gyro, accel and compass, normalized
    pub fn all_normalized(&self) -> Result<Reading<[f32; 9]>> {
        self.read_floats(code::ALL_NORMALIZED)
    }

    pub fn normalized_gyro(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::NORMALIZED_GYRO)
    }

    pub fn normalized_accel(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::NORMALIZED_ACCEL)
    }

    pub fn normalized_compass(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::NORMALIZED_COMPASS)
    }

    /// Emulated from the raw reading on legacy firmware
    pub fn corrected_accel(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::CORRECTED_ACCEL)
    }

    /// Emulated from the raw reading on legacy firmware
    pub fn corrected_compass(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::CORRECTED_COMPASS)
    }

    pub fn all_raw(&self) -> Result<Reading<[f32; 9]>> {
        self.read_floats(code::ALL_RAW)
    }

    pub fn raw_gyro(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::RAW_GYRO)
    }

    pub fn raw_accel(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::RAW_ACCEL)
    }

    pub fn raw_compass(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::RAW_COMPASS)
    }

    pub fn temperature_c(&self) -> Result<Reading<f32>> {
        Ok(self.read_floats::<1>(code::TEMPERATURE_C)?.map(|[t]| t))
    }

    pub fn temperature_f(&self) -> Result<Reading<f32>> {
        Ok(self.read_floats::<1>(code::TEMPERATURE_F)?.map(|[t]| t))
    }

    pub fn confidence(&self) -> Result<Reading<f32>> {
        Ok(self.read_floats::<1>(code::CONFIDENCE)?.map(|[c]| c))
    }

    pub fn tare_current_orientation(&self) -> Result<()> {
        self.write_only(code::TARE_CURRENT, &[])
    }

    pub fn tare_with_quaternion(&self, q: [f32; 4]) -> Result<()> {
        self.write_only(code::TARE_QUATERNION, &q.map(Field::F32))
    }

    pub fn tare_quaternion(&self) -> Result<Reading<[f32; 4]>> {
        self.read_floats(code::GET_TARE_QUATERNION)
    }

    /// LED color as RGB in 0.0..=1.0
    pub fn led_color(&self) -> Result<Reading<[f32; 3]>> {
        self.read_floats(code::GET_LED_COLOR)
    }

    pub fn set_led_color(&self, rgb: [f32; 3]) -> Result<()> {
        self.write_only(code::SET_LED_COLOR, &rgb.map(Field::F32))
    }

    /// Button bitmask
    pub fn button_state(&self) -> Result<Reading<u8>> {
        self.read_u8(code::BUTTON_STATE)
    }

    pub fn battery_voltage(&self) -> Result<Reading<f32>> {
        Ok(self.read_floats::<1>(code::BATTERY_VOLTAGE)?.map(|[v]| v))
    }

    /// Charge remaining, percent
    pub fn battery_percent(&self) -> Result<Reading<u8>> {
        self.read_u8(code::BATTERY_PERCENT)
    }

    pub fn battery_status(&self) -> Result<Reading<u8>> {
        self.read_u8(code::BATTERY_STATUS)
    }

    pub fn serial_number(&self) -> Result<u32> {
        Ok(self.read_u32(code::SERIAL_NUMBER)?.value)
    }

    pub fn firmware_version(&self) -> Result<String> {
        self.read_string(code::FIRMWARE_VERSION)
    }

    pub fn hardware_version(&self) -> Result<String> {
        self.read_string(code::HARDWARE_VERSION)
    }

    /// Device clock, microseconds
    pub fn current_timestamp(&self) -> Result<u32> {
        Ok(self.read_u32(code::GET_TIMESTAMP)?.value)
    }

    pub fn update_current_timestamp(&self, timestamp: u32) -> Result<()> {
        self.write_only(code::UPDATE_TIMESTAMP, &[Field::U32(timestamp)])
    }

    pub fn commit_settings(&self) -> Result<()> {
        self.write_only(code::COMMIT_SETTINGS, &[])
    }

    pub fn restore_factory_settings(&self) -> Result<()> {
        self.write_only(code::RESTORE_FACTORY, &[])
    }

    pub fn software_reset(&self) -> Result<()> {
        self.write_only(code::SOFTWARE_RESET, &[])
    }

    // ---- sensor settings ---------------------------------------------------

    pub fn axis_directions(&self) -> Result<AxisDirections> {
        let b = self.read_u8(code::GET_AXIS_DIRECTIONS)?.value;
        AxisDirections::from_byte(b)
            .ok_or_else(|| Error::Read(format!("axis directions 0x{b:02x}: bad order")))
    }

    pub fn set_axis_directions(&self, dirs: AxisDirections) -> Result<()> {
        self.write_only(code::SET_AXIS_DIRECTIONS, &[Field::U8(dirs.to_byte())])
    }

    /// Orientation filter: 0 IMU, 1 Kalman, 2 alternating Kalman, 3 complementary, 4 QGRAD
    pub fn filter_mode(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_FILTER_MODE)?.value)
    }

    pub fn set_filter_mode(&self, mode: u8) -> Result<()> {
        self.write_only(code::SET_FILTER_MODE, &[Field::U8(mode)])
    }

    pub fn gyro_enabled(&self) -> Result<bool> {
        self.read_bool(code::GET_GYRO_ENABLED)
    }

    pub fn set_gyro_enabled(&self, enabled: bool) -> Result<()> {
        self.write_only(code::SET_GYRO_ENABLED, &[Field::Bool(enabled)])
    }

    pub fn accel_enabled(&self) -> Result<bool> {
        self.read_bool(code::GET_ACCEL_ENABLED)
    }

    pub fn set_accel_enabled(&self, enabled: bool) -> Result<()> {
        self.write_only(code::SET_ACCEL_ENABLED, &[Field::Bool(enabled)])
    }

    pub fn compass_enabled(&self) -> Result<bool> {
        self.read_bool(code::GET_COMPASS_ENABLED)
    }

    pub fn set_compass_enabled(&self, enabled: bool) -> Result<()> {
        self.write_only(code::SET_COMPASS_ENABLED, &[Field::Bool(enabled)])
    }

    /// Accelerometer range index: 0 is 2g, 1 is 4g, 2 is 8g
    pub fn accel_range(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_ACCEL_RANGE)?.value)
    }

    pub fn set_accel_range(&self, range: u8) -> Result<()> {
        self.write_only(code::SET_ACCEL_RANGE, &[Field::U8(range)])
    }

    pub fn compass_range(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_COMPASS_RANGE)?.value)
    }

    pub fn set_compass_range(&self, range: u8) -> Result<()> {
        self.write_only(code::SET_COMPASS_RANGE, &[Field::U8(range)])
    }

    pub fn running_avg_mode(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_RUNNING_AVG_MODE)?.value)
    }

    pub fn set_running_avg_mode(&self, mode: u8) -> Result<()> {
        self.write_only(code::SET_RUNNING_AVG_MODE, &[Field::U8(mode)])
    }

    pub fn reference_vector_mode(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_REFERENCE_VECTOR_MODE)?.value)
    }

    pub fn set_reference_vector_mode(&self, mode: u8) -> Result<()> {
        self.write_only(code::SET_REFERENCE_VECTOR_MODE, &[Field::U8(mode)])
    }

    /// Filter update rate the device is aiming for, microseconds
    pub fn desired_update_rate(&self) -> Result<u32> {
        Ok(self.read_u32(code::GET_DESIRED_UPDATE_RATE)?.value)
    }

    pub fn led_mode(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_LED_MODE)?.value)
    }

    pub fn set_led_mode(&self, mode: u8) -> Result<()> {
        self.write_only(code::SET_LED_MODE, &[Field::U8(mode)])
    }

    // ---- wireless settings (dongles and wireless sensors) ------------------

    pub fn pan_id(&self) -> Result<u16> {
        let v = self.read_u32(code::GET_PAN_ID)?.value;
        u16::try_from(v).map_err(|_| Error::Read(format!("pan id {v} out of range")))
    }

    pub fn set_pan_id(&self, pan_id: u16) -> Result<()> {
        self.write_only(code::SET_PAN_ID, &[Field::U16(pan_id)])
    }

    pub fn wireless_channel(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_CHANNEL)?.value)
    }

    pub fn set_wireless_channel(&self, channel: u8) -> Result<()> {
        self.write_only(code::SET_CHANNEL, &[Field::U8(channel)])
    }

    pub fn commit_wireless_settings(&self) -> Result<()> {
        self.write_only(code::COMMIT_WIRELESS, &[])
    }

    // ---- dongle only -------------------------------------------------------

    /// Serial stored at a logical id on the dongle (0 = empty)
    pub fn wireless_table_entry(&self, idx: u8) -> Result<u32> {
        if usize::from(idx) >= super::wireless::WIRELESS_SLOTS {
            return Err(Error::InvalidIndex(idx));
        }
        let resp = self.command(code::GET_SERIAL_AT_LOGICAL_ID, &[Field::U8(idx)])?;
        let serial = resp
            .fields
            .first()
            .and_then(Field::as_u32)
            .ok_or_else(|| Error::Read("missing serial".into()))?;
        if let Some(mux) = &self.mux {
            mux.set_table_entry(idx, serial)?;
        }
        Ok(serial)
    }

    pub fn set_wireless_table_entry(&self, idx: u8, serial: u32) -> Result<()> {
        if usize::from(idx) >= super::wireless::WIRELESS_SLOTS {
            return Err(Error::InvalidIndex(idx));
        }
        self.write_only(
            code::SET_SERIAL_AT_LOGICAL_ID,
            &[Field::U8(idx), Field::U32(serial)],
        )?;
        if let Some(mux) = &self.mux {
            mux.set_table_entry(idx, serial)?;
        }
        Ok(())
    }

    /// Dongle's own per-command retry count
    pub fn wireless_hardware_retries(&self) -> Result<u8> {
        Ok(self.read_u8(code::GET_WIRELESS_RETRIES)?.value)
    }

    pub fn set_wireless_hardware_retries(&self, retries: u8) -> Result<()> {
        if retries > MAX_HARDWARE_RETRIES {
            return Err(Error::Parameter(format!(
                "hardware retries {retries} exceeds maximum {MAX_HARDWARE_RETRIES}"
            )));
        }
        self.write_only(code::SET_WIRELESS_RETRIES, &[Field::U8(retries)])
    }

    /// Free command slots as reported by the dongle
    pub fn open_slots(&self) -> Result<u8> {
        Ok(self.read_u8(code::OPEN_SLOTS)?.value)
    }

    /// Reception strength of the last wireless packet
    pub fn signal_strength(&self) -> Result<u8> {
        Ok(self.read_u8(code::SIGNAL_STRENGTH)?.value)
    }

    /// Host-side resend count for wireless commands through this dongle
    pub fn software_retries(&self) -> Result<u8> {
        self.dongle_mux().map(|m| m.software_retries())
    }

    pub fn set_software_retries(&self, retries: u8) -> Result<()> {
        self.dongle_mux()?.set_software_retries(retries)
    }

    fn dongle_mux(&self) -> Result<&Arc<WirelessMux>> {
        self.mux.as_ref().ok_or_else(|| Error::InvalidCommand {
            code: code::GET_WIRELESS_RETRIES,
            kind: self.kind().to_string(),
        })
    }

    // ---- streaming ---------------------------------------------------------

    fn check_slot_capabilities(&self, plan: &SlotPlan) -> Result<()> {
        for &slot in plan.commands() {
            if let Some(spec) = commands::lookup(slot) {
                self.check_capability(spec)?;
            }
        }
        Ok(())
    }

    /// Select up to 8 streamed commands; `Idle -> Configured` once timing is also set
    pub fn set_stream_slots(&self, slots: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let plan = SlotPlan::new(slots)?;
        self.check_slot_capabilities(&plan)?;
        self.stream.check_reconfigure()?;
        self.write_only(code::SET_STREAM_SLOTS, &plan.to_fields())?;
        self.stream.apply_slots(plan)
    }

    pub fn set_stream_timing(&self, timing: StreamTiming) -> Result<()> {
        self.ensure_open()?;
        self.stream.check_reconfigure()?;
        self.write_only(code::SET_STREAM_TIMING, &timing.to_fields())?;
        self.stream.apply_timing(timing)
    }

    /// `Configured -> Streaming`; a zero duration goes straight back to `Idle`
    pub fn start_streaming(&self) -> Result<()> {
        self.ensure_open()?;
        self.stream.check_start()?;
        if !self.stream.begin(Instant::now())? {
            debug!(id = %self.id(), "Zero stream duration, stopping immediately");
            return self.write_only(code::STOP_STREAMING, &[]);
        }
        if let Err(e) = self.write_only(code::START_STREAMING, &[]) {
            self.stream.end();
            return Err(e);
        }
        self.emit(DeviceEvent::StreamStarted { id: self.id() });
        Ok(())
    }

    /// `Streaming -> Idle`; configuration and cache are cleared.
    ///
    /// The device is told to stop in every state, but an idle or configured
    /// stream keeps its local configuration.
    pub fn stop_streaming(&self) -> Result<()> {
        self.ensure_open()?;
        let result = self.write_only(code::STOP_STREAMING, &[]);
        if self.stream.stop() {
            self.emit(DeviceEvent::StreamStopped { id: self.id() });
        }
        result
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.stream.status()
    }

    /// Most recent batch, without waiting
    pub fn last_stream_batch(&self) -> Result<StreamBatch> {
        self.ensure_open()?;
        self.stream.last()
    }

    /// Block until the next batch arrives
    pub fn next_stream_batch(&self, timeout: Duration) -> Result<StreamBatch> {
        self.ensure_open()?;
        self.stream.wait_next(timeout)
    }

    /// Run `callback` on the dispatcher thread for every batch
    pub fn set_stream_callback(&self, callback: Option<StreamCallback>) -> Result<()> {
        self.ensure_open()?;
        self.stream.set_callback(callback);
        Ok(())
    }

    /// Bounded receiver of every subsequent batch
    pub fn subscribe_stream(&self) -> Result<Receiver<StreamBatch>> {
        self.ensure_open()?;
        Ok(self.stream.subscribe())
    }

    pub fn stream_counters(&self) -> StreamCounters {
        self.stream.counters()
    }

    /// Timing and slots as the device reports them
    pub fn device_stream_config(&self) -> Result<(Vec<u8>, StreamTiming)> {
        let slots = self
            .command(code::GET_STREAM_SLOTS, &[])?
            .fields
            .iter()
            .filter_map(Field::as_u8)
            .filter(|&s| s != code::NULL_SLOT)
            .collect();
        let t = self.command(code::GET_STREAM_TIMING, &[])?;
        let us: Vec<u32> = t.fields.iter().filter_map(Field::as_u32).collect();
        match us.as_slice() {
            [interval, duration, delay] => {
                Ok((slots, StreamTiming::from_micros(*interval, *duration, *delay)))
            }
            _ => Err(Error::Read("malformed stream timing".into())),
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("port", &self.channel().path())
            .finish()
    }
}
