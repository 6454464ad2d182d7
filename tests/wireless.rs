//! Wireless routing through a virtual dongle

mod common;

use bytes::Bytes;
use threespace_core::core::simulator::SensorProfile;
use threespace_core::{code, DeviceId, DeviceKind, Error};

#[test]
fn test_dongle_and_wireless_sensor_register() {
    let registry = common::registry();
    let (_device, dongle, sensor) = common::dongle_with_sensor(&registry, "sim-dng");

    assert_eq!(dongle.kind(), Some(DeviceKind::Dongle));
    assert_eq!(sensor.kind(), Some(DeviceKind::WirelessWireless));
    assert_eq!(registry.find(DeviceId::WIRELESS), vec![sensor]);
    assert_eq!(registry.find(DeviceId::DONGLE), vec![dongle]);

    let session = registry.get(sensor).unwrap();
    assert!(session.is_wireless());
    assert_eq!(session.logical_id(), Some(0));
    assert_eq!(session.serial_number().unwrap(), common::WIRELESS_SERIAL);
    assert_eq!(session.battery_percent().unwrap().value, 87);

    // asking again returns the same identifier
    assert_eq!(registry.sensor_from_dongle(dongle, 0).unwrap(), sensor);
}

#[test]
fn test_wireless_table_round_trip() {
    let registry = common::registry();
    let (device, dongle, _) = common::dongle_with_sensor(&registry, "sim-table");
    let session = registry.get(dongle).unwrap();

    assert_eq!(session.wireless_table_entry(0).unwrap(), common::WIRELESS_SERIAL);
    assert_eq!(session.wireless_table_entry(3).unwrap(), 0);
    assert!(matches!(session.wireless_table_entry(15), Err(Error::InvalidIndex(15))));

    device.add_wireless_sensor(SensorProfile::wireless(0x77));
    let id = registry.add_sensor_to_dongle(dongle, 3, 0x77).unwrap();
    assert_eq!(registry.get(id).unwrap().serial_number().unwrap(), 0x77);
    assert_eq!(session.mux().unwrap().table().find(0x77), Some(3));

    // empty entry
    assert!(matches!(registry.sensor_from_dongle(dongle, 5), Err(Error::InvalidIndex(5))));
}

#[test]
fn test_unreachable_sensor_fails_wireless_connection() {
    let registry = common::registry();
    let (_device, dongle, _) = common::dongle_with_sensor(&registry, "sim-unreach");

    // serial in the table but no such sensor in range
    let result = registry.add_sensor_to_dongle(dongle, 2, 0xDEAD);
    assert!(matches!(result, Err(Error::WirelessConnection(_))));
}

#[test]
fn test_sixteenth_outstanding_command_is_refused() {
    let registry = common::registry();
    let (device, dongle, _) = common::dongle_with_sensor(&registry, "sim-backpressure");
    let mux = registry.get(dongle).unwrap().mux().cloned().unwrap();

    device.set_silent(true);
    let before = device.frames_received();
    let pending: Vec<_> = (0..15)
        .map(|_| mux.submit(0, code::TARED_QUATERNION, Bytes::new()).unwrap())
        .collect();
    assert_eq!(mux.outstanding(), 15);

    let refused = mux.submit(0, code::TARED_QUATERNION, Bytes::new());
    assert!(matches!(refused, Err(Error::StreamSlotsFull(15))));
    // nothing was written for the refused command
    assert_eq!(device.frames_received() - before, 15);

    drop(pending);
    assert_eq!(mux.outstanding(), 0);
    device.set_silent(false);
    assert!(mux.submit(0, code::TARED_QUATERNION, Bytes::new()).is_ok());
}

#[test]
fn test_software_retries_are_bounded() {
    let registry = common::registry();
    let (device, dongle, sensor) = common::dongle_with_sensor(&registry, "sim-retry");
    let dongle_session = registry.get(dongle).unwrap();
    let session = registry.get(sensor).unwrap();
    assert_eq!(dongle_session.software_retries().unwrap(), 3);

    // the sensor drops out of range: the dongle reports failure for every attempt
    device.pair(0, 0);

    let before = device.count(code::TARED_QUATERNION);
    assert!(matches!(session.tared_quaternion(), Err(Error::Timeout(_))));
    assert_eq!(device.count(code::TARED_QUATERNION) - before, 4);

    dongle_session.set_software_retries(1).unwrap();
    let before = device.count(code::TARED_QUATERNION);
    assert!(session.tared_quaternion().is_err());
    assert_eq!(device.count(code::TARED_QUATERNION) - before, 2);

    assert!(matches!(
        dongle_session.set_software_retries(11),
        Err(Error::Parameter(_))
    ));

    // back in range, the next command succeeds on the first attempt
    device.pair(0, common::WIRELESS_SERIAL);
    let before = device.count(code::TARED_QUATERNION);
    assert!(session.tared_quaternion().is_ok());
    assert_eq!(device.count(code::TARED_QUATERNION) - before, 1);
}

#[test]
fn test_silent_dongle_is_tried_retries_plus_one_times() {
    let registry = common::registry();
    let (device, dongle, sensor) = common::dongle_with_sensor(&registry, "sim-retry-silent");
    let dongle_session = registry.get(dongle).unwrap();
    let session = registry.get(sensor).unwrap();

    device.set_silent(true);
    for retries in [3u8, 0, 2] {
        dongle_session.set_software_retries(retries).unwrap();
        let before = device.count(code::TARED_QUATERNION);
        assert!(matches!(session.tared_quaternion(), Err(Error::Timeout(_))));
        assert_eq!(
            device.count(code::TARED_QUATERNION) - before,
            usize::from(retries) + 1
        );
    }
    // every attempt released its slot
    assert_eq!(dongle_session.mux().unwrap().outstanding(), 0);
}

#[test]
fn test_hardware_retry_bound() {
    let registry = common::registry();
    let (_device, dongle, _) = common::dongle_with_sensor(&registry, "sim-hw-retry");
    let session = registry.get(dongle).unwrap();

    session.set_wireless_hardware_retries(2).unwrap();
    assert_eq!(session.wireless_hardware_retries().unwrap(), 2);
    assert!(matches!(
        session.set_wireless_hardware_retries(4),
        Err(Error::Parameter(_))
    ));
    assert_eq!(session.open_slots().unwrap(), 15);
}

#[test]
fn test_closing_dongle_closes_its_sensors() {
    let registry = common::registry();
    let (_device, dongle, sensor) = common::dongle_with_sensor(&registry, "sim-close");

    registry.close_device(dongle).unwrap();
    assert!(matches!(registry.get(sensor), Err(Error::InvalidId(_))));
    assert!(matches!(registry.get(dongle), Err(Error::InvalidId(_))));
    assert!(registry.is_empty());
}
