//! Registry lifecycle, reset and reconnect

mod common;

use std::time::Duration;
use threespace_core::core::simulator::VirtualDevice;
use threespace_core::{
    code, DeviceEvent, DeviceId, Error, ReconnectConfig, ReconnectEvent, Reconnector, SessionState,
    TransportError,
};

#[test]
fn test_same_port_cannot_open_twice() {
    let registry = common::registry();
    let (device, _id) = common::usb(&registry, "sim-dup");

    let again = registry.create_device_with(device.link(), None);
    assert!(matches!(
        again,
        Err(Error::Transport(TransportError::PortInUse(_)))
    ));
}

#[test]
fn test_silent_port_fails_creation() {
    let registry = common::registry();
    let device = VirtualDevice::usb("sim-mute");
    device.set_silent(true);

    let result = registry.create_device_with(device.link(), None);
    assert!(matches!(result, Err(Error::UsbConnection(_))));
    assert!(registry.is_empty());
}

#[test]
fn test_closed_device_id_is_invalid() {
    let registry = common::registry();
    let (_device, id) = common::usb(&registry, "sim-close-one");
    let session = registry.get(id).unwrap();

    registry.close_device(id).unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(registry.get(id), Err(Error::InvalidId(_))));
    assert!(matches!(session.tared_quaternion(), Err(Error::InvalidId(_))));
    assert!(matches!(registry.close_device(id), Err(Error::InvalidId(_))));
}

#[test]
fn test_reset_invalidates_every_id() {
    let registry = common::registry();
    let (_a, usb) = common::usb(&registry, "sim-reset-a");
    let (_b, dongle, wireless) = common::dongle_with_sensor(&registry, "sim-reset-b");
    let sessions: Vec<_> = [usb, dongle, wireless]
        .iter()
        .map(|id| registry.get(*id).unwrap())
        .collect();

    registry.reset();

    assert!(registry.is_empty());
    for id in [usb, dongle, wireless] {
        assert!(matches!(
            registry.command(id, code::SERIAL_NUMBER, &[]),
            Err(Error::InvalidId(_))
        ));
    }
    for session in &sessions {
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.serial_number(), Err(Error::InvalidId(_))));
    }
}

#[test]
fn test_slots_are_recycled_after_close() {
    let registry = common::registry();
    let (_a, first) = common::usb(&registry, "sim-slot-a");
    registry.close_device(first).unwrap();

    let (_b, second) = common::usb(&registry, "sim-slot-b");
    assert_eq!(second.slot(), first.slot());
    assert!(registry.get(second).is_ok());
}

#[test]
fn test_find_by_kind_mask() {
    let registry = common::registry();
    let (_a, usb) = common::usb(&registry, "sim-find-a");
    let (_b, dongle, wireless) = common::dongle_with_sensor(&registry, "sim-find-b");

    assert_eq!(registry.find(DeviceId::USB), vec![usb]);
    assert_eq!(registry.find(DeviceId::NO_DONGLE), vec![usb, wireless]);
    assert_eq!(registry.find(DeviceId::ALL_SENSORS).len(), 3);
    assert_eq!(registry.find(DeviceId::DONGLE), vec![dongle]);
}

#[test]
fn test_reconnect_keeps_id_and_resets_stream() {
    let registry = common::registry();
    let mut events = registry.subscribe();
    let (device, id) = common::usb(&registry, "sim-reconnect");
    let sensor = registry.get(id).unwrap();

    sensor.set_stream_slots(&[code::TARED_QUATERNION]).unwrap();
    sensor
        .set_stream_timing(threespace_core::StreamTiming::new(
            Duration::from_millis(5),
            threespace_core::StreamDuration::Infinite,
        ))
        .unwrap();
    sensor.start_streaming().unwrap();

    device.unplug();
    assert!(common::wait_until(Duration::from_secs(1), || {
        !registry.is_device_there(id, false)
    }));
    assert!(sensor.tared_quaternion().is_err());
    assert!(!registry.is_device_there(id, true));

    device.replug();
    assert!(registry.is_device_there(id, true));
    assert_eq!(registry.get(id).unwrap().id(), id);
    assert_eq!(
        sensor.stream_status(),
        threespace_core::StreamStatus::Idle
    );
    assert!(sensor.tared_quaternion().is_ok());

    let mut reconnected = false;
    while let Ok(event) = events.try_recv() {
        reconnected |= event == DeviceEvent::Reconnected { id };
    }
    assert!(reconnected);
}

#[test]
fn test_reconnector_recovers_link() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-supervised");
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut supervisor = Reconnector::new(
        ReconnectConfig {
            delay: Duration::from_millis(20),
            max_attempts: 0,
        },
        registry.clone(),
        id,
        tx,
    );
    supervisor.start().unwrap();

    device.unplug();
    std::thread::sleep(Duration::from_millis(100));
    device.replug();

    let recovered = std::iter::from_fn(|| rx.recv_timeout(Duration::from_secs(2)).ok())
        .any(|e| e == ReconnectEvent::Reconnected { id });
    assert!(recovered);
    assert_eq!(supervisor.reconnects(), 1);
    assert!(!supervisor.is_reconnecting());
    supervisor.stop();

    assert_eq!(registry.get(id).unwrap().serial_number().unwrap(), 0x1000_0001);
}

#[test]
fn test_reconnector_gives_up() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-gives-up");
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut supervisor = Reconnector::new(
        ReconnectConfig {
            delay: Duration::from_millis(10),
            max_attempts: 2,
        },
        registry.clone(),
        id,
        tx,
    );
    supervisor.start().unwrap();
    device.unplug();

    let gave_up = std::iter::from_fn(|| rx.recv_timeout(Duration::from_secs(2)).ok())
        .any(|e| e == ReconnectEvent::GaveUp { id });
    assert!(gave_up);
    supervisor.stop();
}
