//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use threespace_core::core::simulator::{SensorProfile, VirtualDevice};
use threespace_core::{DeviceId, DeviceRegistry, EngineConfig};

pub const WIRELESS_SERIAL: u32 = 0x0000_ABCD;

/// Window after a timeout in which a same-command reply counts as late
pub const LATE_REPLY_GRACE: Duration = Duration::from_millis(50);

/// Registry tuned for the in-memory device: short settle, short timeouts
pub fn registry() -> Arc<DeviceRegistry> {
    let mut config = EngineConfig::default();
    config.serial.settle_ms = 5;
    config.commands.timeout_ms = 500;
    config.commands.wireless_timeout_ms = 100;
    config.commands.late_reply_grace_ms = LATE_REPLY_GRACE.as_millis() as u64;
    Arc::new(DeviceRegistry::new(config))
}

pub fn open(registry: &DeviceRegistry, device: &VirtualDevice) -> DeviceId {
    registry
        .create_device_with(device.link(), None)
        .expect("virtual device registers")
}

pub fn usb(registry: &DeviceRegistry, path: &str) -> (VirtualDevice, DeviceId) {
    let device = VirtualDevice::usb(path);
    let id = open(registry, &device);
    (device, id)
}

/// Dongle with one wireless sensor paired at logical id 0, both registered
pub fn dongle_with_sensor(
    registry: &DeviceRegistry,
    path: &str,
) -> (VirtualDevice, DeviceId, DeviceId) {
    let device = VirtualDevice::dongle(path);
    device.add_wireless_sensor(SensorProfile::wireless(WIRELESS_SERIAL));
    device.pair(0, WIRELESS_SERIAL);
    let dongle = open(registry, &device);
    let sensor = registry
        .sensor_from_dongle(dongle, 0)
        .expect("paired sensor registers");
    (device, dongle, sensor)
}

/// Poll `f` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}
