//! Device registry
//!
//! Owns every live [`DeviceSession`] and hands out [`DeviceId`]s. Creation and
//! removal serialize on one lock so two sessions can never claim the same
//! identifier; lookups only take a read lock. Slots are recycled once a
//! session has fully closed.

use super::capture::TrafficLog;
use super::channel::{ChannelOptions, TransportChannel};
use super::device::{DeviceId, DeviceInfo, DeviceKind};
use super::error::{Error, Result};
use super::protocol::codec::{Field, ResponseFrame};
use super::session::{DeviceEvent, DeviceSession, Route, SessionOptions, SessionState};
use super::stream::StreamStatus;
use super::transport::{Link, TransportError};
use super::wireless::WIRELESS_SLOTS;
use crate::config::EngineConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;
const MAX_SLOT: u32 = 0x007f_ffff;

/// Recycles registry slots, lowest first
#[derive(Debug, Default)]
struct SlotAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

impl SlotAllocator {
    fn allocate(&mut self) -> Result<u32> {
        if let Some(slot) = self.free.pop_first() {
            return Ok(slot);
        }
        if self.next > MAX_SLOT {
            return Err(Error::Memory("device slots exhausted".into()));
        }
        let slot = self.next;
        self.next += 1;
        Ok(slot)
    }

    fn release(&mut self, slot: u32) {
        self.free.insert(slot);
    }

    fn clear(&mut self) {
        self.next = 0;
        self.free.clear();
    }
}

struct Entry {
    session: Arc<DeviceSession>,
    /// Port path for wired sessions
    path: Option<String>,
    /// Owning dongle and logical id for wireless sessions
    parent: Option<(DeviceId, u8)>,
}

/// Process-level table of device sessions
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Entry>>,
    slots: Mutex<SlotAllocator>,
    creation: Mutex<()>,
    config: EngineConfig,
    events: broadcast::Sender<DeviceEvent>,
    capture: RwLock<Option<Arc<TrafficLog>>>,
}

impl DeviceRegistry {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            slots: Mutex::new(SlotAllocator::default()),
            creation: Mutex::new(()),
            config,
            events,
            capture: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Record traffic of channels opened from now on
    pub fn set_capture(&self, log: Option<Arc<TrafficLog>>) {
        *self.capture.write() = log;
    }

    fn channel_options(&self) -> ChannelOptions {
        self.config.channel_options()
    }

    fn session_options(&self) -> SessionOptions {
        self.config.session_options()
    }

    fn path_in_use(&self, path: &str) -> bool {
        self.devices
            .read()
            .values()
            .any(|e| e.path.as_deref() == Some(path))
    }

    /// Open a serial port and register the device behind it
    pub fn create_device(&self, path: &str, kind_hint: Option<DeviceKind>) -> Result<DeviceId> {
        let _guard = self.creation.lock();
        if self.path_in_use(path) {
            return Err(TransportError::PortInUse(path.to_string()).into());
        }
        let channel =
            TransportChannel::open(path, self.config.serial.baud_rate, self.channel_options())?;
        self.register_wired(channel, kind_hint)
    }

    /// Register the device behind an already open link
    pub fn create_device_with(
        &self,
        link: Box<dyn Link>,
        kind_hint: Option<DeviceKind>,
    ) -> Result<DeviceId> {
        let _guard = self.creation.lock();
        if self.path_in_use(link.path()) {
            return Err(TransportError::PortInUse(link.path().to_string()).into());
        }
        let channel = TransportChannel::with_link(link, self.channel_options())?;
        self.register_wired(channel, kind_hint)
    }

    fn wired_session(&self, channel: &Arc<TransportChannel>, kind: DeviceKind) -> Arc<DeviceSession> {
        let events = Some(self.events.clone());
        if kind == DeviceKind::Dongle {
            DeviceSession::new_dongle(
                Arc::clone(channel),
                self.config.commands.software_retries,
                self.session_options(),
                events,
            )
        } else {
            DeviceSession::new(
                Route::Wired(Arc::clone(channel)),
                kind,
                self.session_options(),
                events,
            )
        }
    }

    /// Identify and insert; caller holds the creation lock
    fn register_wired(
        &self,
        channel: Arc<TransportChannel>,
        kind_hint: Option<DeviceKind>,
    ) -> Result<DeviceId> {
        if let Some(log) = self.capture.read().clone() {
            channel.set_capture(Some(log));
        }

        let mut session = self.wired_session(&channel, kind_hint.unwrap_or(DeviceKind::Usb));
        let mut info = match session.identify() {
            Ok(info) => info,
            Err(e) => {
                session.close();
                return Err(Error::UsbConnection(format!("{}: {e}", channel.path())));
            }
        };
        let kind = resolve_kind(kind_hint, &info, DeviceKind::Usb);

        // an unannounced dongle needs its multiplexer
        if kind == DeviceKind::Dongle && session.mux().is_none() {
            session = self.wired_session(&channel, DeviceKind::Dongle);
            info = match session.identify() {
                Ok(info) => info,
                Err(e) => {
                    session.close();
                    return Err(Error::UsbConnection(format!("{}: {e}", channel.path())));
                }
            };
        }
        debug!(serial = %info.serial_hex(), %kind, "Wired device identified");

        let path = channel.path().to_string();
        self.insert(session, kind, Some(path), None)
    }

    fn insert(
        &self,
        session: Arc<DeviceSession>,
        kind: DeviceKind,
        path: Option<String>,
        parent: Option<(DeviceId, u8)>,
    ) -> Result<DeviceId> {
        let slot = match self.slots.lock().allocate() {
            Ok(slot) => slot,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };
        let id = DeviceId::new(slot, kind);
        session.bind(id, kind);
        self.devices.write().insert(
            id,
            Entry {
                session,
                path,
                parent,
            },
        );
        info!(%id, %kind, "Device registered");
        let _ = self.events.send(DeviceEvent::Opened { id, kind });
        Ok(id)
    }

    /// The session behind `id`
    pub fn get(&self, id: DeviceId) -> Result<Arc<DeviceSession>> {
        self.devices
            .read()
            .get(&id)
            .filter(|e| e.session.state() != SessionState::Closed)
            .map(|e| Arc::clone(&e.session))
            .ok_or(Error::InvalidId(id.0))
    }

    /// Formatted command by identifier
    pub fn command(&self, id: DeviceId, command: u8, fields: &[Field]) -> Result<ResponseFrame> {
        self.get(id)?.command(command, fields)
    }

    /// Identity gathered when `id` was created
    pub fn info(&self, id: DeviceId) -> Result<DeviceInfo> {
        Ok(self.get(id)?.info())
    }

    /// Every registered identifier, in slot order
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.read().keys().copied().collect();
        ids.sort_by_key(|id| id.slot());
        ids
    }

    /// Identifiers whose kind matches `mask`
    pub fn find(&self, mask: u32) -> Vec<DeviceId> {
        self.device_ids()
            .into_iter()
            .filter(|id| id.matches(mask))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Whether `id` is registered and its link answers; optionally reopen it
    pub fn is_device_there(&self, id: DeviceId, reconnect: bool) -> bool {
        match self.get(id) {
            Ok(session) => session.is_alive(reconnect),
            Err(_) => false,
        }
    }

    /// Close and unregister `id`. Closing a dongle also closes its wireless sensors.
    pub fn close_device(&self, id: DeviceId) -> Result<()> {
        let _guard = self.creation.lock();
        let children: Vec<DeviceId> = self
            .devices
            .read()
            .iter()
            .filter(|(_, e)| matches!(e.parent, Some((p, _)) if p == id))
            .map(|(child, _)| *child)
            .collect();
        for child in children {
            self.remove(child);
        }
        if self.remove(id) {
            Ok(())
        } else {
            Err(Error::InvalidId(id.0))
        }
    }

    fn remove(&self, id: DeviceId) -> bool {
        let entry = self.devices.write().remove(&id);
        match entry {
            Some(entry) => {
                entry.session.close();
                self.slots.lock().release(id.slot());
                debug!(%id, "Device unregistered");
                true
            }
            None => false,
        }
    }

    fn dongle(&self, id: DeviceId) -> Result<Arc<DeviceSession>> {
        let session = self.get(id)?;
        if session.mux().is_none() {
            return Err(Error::InvalidCommand {
                code: super::protocol::commands::code::SET_SERIAL_AT_LOGICAL_ID,
                kind: session.kind().to_string(),
            });
        }
        Ok(session)
    }

    /// Store `serial` at `idx` in the dongle's table and register the sensor
    pub fn add_sensor_to_dongle(&self, dongle: DeviceId, idx: u8, serial: u32) -> Result<DeviceId> {
        if usize::from(idx) >= WIRELESS_SLOTS {
            return Err(Error::InvalidIndex(idx));
        }
        let session = self.dongle(dongle)?;
        session.set_wireless_table_entry(idx, serial)?;
        self.sensor_from_dongle(dongle, idx)
    }

    /// Register the wireless sensor at `idx` of the dongle's table.
    ///
    /// Returns the existing identifier when that sensor is already registered.
    pub fn sensor_from_dongle(&self, dongle: DeviceId, idx: u8) -> Result<DeviceId> {
        if usize::from(idx) >= WIRELESS_SLOTS {
            return Err(Error::InvalidIndex(idx));
        }
        let dongle_session = self.dongle(dongle)?;
        let _guard = self.creation.lock();

        if let Some(existing) = self
            .devices
            .read()
            .iter()
            .find(|(_, e)| e.parent == Some((dongle, idx)))
            .map(|(id, _)| *id)
        {
            return Ok(existing);
        }

        let serial = dongle_session.wireless_table_entry(idx)?;
        if serial == 0 {
            return Err(Error::InvalidIndex(idx));
        }
        let mux = match dongle_session.mux() {
            Some(mux) => Arc::clone(mux),
            None => return Err(Error::WirelessConnection("not a dongle".into())),
        };

        let session = DeviceSession::new(
            Route::Wireless {
                mux,
                logical_id: idx,
            },
            DeviceKind::WirelessWireless,
            self.session_options(),
            Some(self.events.clone()),
        );
        let info = match session.identify() {
            Ok(info) => info,
            Err(e) => {
                session.close();
                return Err(Error::WirelessConnection(format!(
                    "logical id {idx} on {dongle}: {e}"
                )));
            }
        };
        if info.serial != serial {
            warn!(
                expected = format!("{serial:08X}"),
                got = %info.serial_hex(),
                "Wireless sensor serial differs from dongle table"
            );
        }
        self.insert(
            session,
            DeviceKind::WirelessWireless,
            None,
            Some((dongle, idx)),
        )
    }

    /// Stop every streaming device; returns how many were stopped
    pub fn stop_all_streaming(&self) -> usize {
        let sessions: Vec<Arc<DeviceSession>> = self
            .devices
            .read()
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect();
        let mut stopped = 0;
        for session in sessions {
            if session.stream_status() != StreamStatus::Streaming {
                continue;
            }
            match session.stop_streaming() {
                Ok(()) => stopped += 1,
                Err(e) => warn!(id = %session.id(), "Stop streaming failed: {e}"),
            }
        }
        stopped
    }

    /// Close every session; all identifiers issued so far become invalid
    pub fn reset(&self) {
        let _guard = self.creation.lock();
        let entries: Vec<(DeviceId, Entry)> = self.devices.write().drain().collect();
        // wireless sensors before the dongles that carry them
        let (wireless, wired): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(_, e)| e.parent.is_some());
        for (_, entry) in wireless.into_iter().chain(wired) {
            entry.session.close();
        }
        self.slots.lock().clear();
        info!("Registry reset");
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Kind reported by the device wins over the caller's hint
fn resolve_kind(hint: Option<DeviceKind>, info: &DeviceInfo, fallback: DeviceKind) -> DeviceKind {
    match (hint, info.kind) {
        (Some(hint), Some(reported)) if hint != reported => {
            warn!(%hint, %reported, "Device kind differs from hint, using reported kind");
            reported
        }
        (_, Some(reported)) => reported,
        (Some(hint), None) => hint,
        (None, None) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_recycle_lowest_first() {
        let mut slots = SlotAllocator::default();
        assert_eq!(slots.allocate().unwrap(), 0);
        assert_eq!(slots.allocate().unwrap(), 1);
        assert_eq!(slots.allocate().unwrap(), 2);
        slots.release(1);
        slots.release(0);
        assert_eq!(slots.allocate().unwrap(), 0);
        assert_eq!(slots.allocate().unwrap(), 1);
        assert_eq!(slots.allocate().unwrap(), 3);
        slots.clear();
        assert_eq!(slots.allocate().unwrap(), 0);
    }

    #[test]
    fn test_reported_kind_wins() {
        let info = DeviceInfo {
            kind: Some(DeviceKind::Embedded),
            ..Default::default()
        };
        assert_eq!(
            resolve_kind(Some(DeviceKind::Usb), &info, DeviceKind::Usb),
            DeviceKind::Embedded
        );
        let unknown = DeviceInfo::default();
        assert_eq!(
            resolve_kind(Some(DeviceKind::Bluetooth), &unknown, DeviceKind::Usb),
            DeviceKind::Bluetooth
        );
        assert_eq!(resolve_kind(None, &unknown, DeviceKind::Usb), DeviceKind::Usb);
    }

    #[test]
    fn test_unknown_id_is_invalid() {
        let registry = DeviceRegistry::new(EngineConfig::default());
        let id = DeviceId::new(3, DeviceKind::Usb);
        assert!(matches!(registry.get(id), Err(Error::InvalidId(_))));
        assert!(!registry.is_device_there(id, false));
        assert!(matches!(registry.close_device(id), Err(Error::InvalidId(_))));
        assert!(registry.is_empty());
    }
}
