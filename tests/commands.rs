//! Command round-trips against the virtual device

mod common;

use std::sync::Arc;
use std::thread;
use threespace_core::core::protocol::framing::{
    encode_response, ParsedCommand, ResponseHeader, WIRED_LOGICAL_ID,
};
use threespace_core::core::simulator::{SensorProfile, VirtualDevice, LEGACY_FIRMWARE};
use threespace_core::{
    code, AxisDirections, AxisOrder, DeviceEvent, DeviceKind, Error, Field, FirmwareTier,
};

const ECHO_CMD: u8 = 0xB0;

#[test]
fn test_identify_classifies_usb_sensor() {
    let registry = common::registry();
    let (_device, id) = common::usb(&registry, "sim-identify");

    assert_eq!(id.kind(), Some(DeviceKind::Usb));
    let info = registry.info(id).unwrap();
    assert_eq!(info.serial, 0x1000_0001);
    assert_eq!(info.firmware_version, "25Apr2013A00");
    assert_eq!(info.hardware_version, "TSS-USB");
    assert_eq!(info.tier, Some(FirmwareTier::Current));
}

#[test]
fn test_typed_reads_round_trip() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-reads");
    let sensor = registry.get(id).unwrap();

    let q = sensor.tared_quaternion().unwrap();
    let norm: f32 = q.value.iter().map(|v| v * v).sum();
    assert!((norm - 1.0).abs() < 1e-4);
    assert!(!q.emulated);

    assert_eq!(sensor.serial_number().unwrap(), 0x1000_0001);
    assert!((sensor.temperature_c().unwrap().value - 24.5).abs() < 1e-6);

    sensor.set_led_color([1.0, 0.5, 0.0]).unwrap();
    assert_eq!(sensor.led_color().unwrap().value, [1.0, 0.5, 0.0]);

    device.press_buttons(0b10);
    assert_eq!(sensor.button_state().unwrap().value, 0b10);

    sensor.tare_with_quaternion([0.0, 0.0, 0.0, 1.0]).unwrap();
    assert_eq!(sensor.tare_quaternion().unwrap().value, [0.0, 0.0, 0.0, 1.0]);
}

#[test]
fn test_sensor_settings_round_trip() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-settings");
    let sensor = registry.get(id).unwrap();

    assert_eq!(sensor.axis_directions().unwrap(), AxisDirections::default());
    let dirs = AxisDirections {
        order: AxisOrder::Zxy,
        negate_x: false,
        negate_y: true,
        negate_z: false,
    };
    sensor.set_axis_directions(dirs).unwrap();
    assert_eq!(sensor.axis_directions().unwrap(), dirs);
    assert_eq!(
        device.commands().last().map(|c| c.command),
        Some(code::GET_AXIS_DIRECTIONS)
    );

    assert!(sensor.gyro_enabled().unwrap());
    sensor.set_gyro_enabled(false).unwrap();
    assert!(!sensor.gyro_enabled().unwrap());
    assert!(sensor.accel_enabled().unwrap());
    sensor.set_compass_enabled(false).unwrap();
    assert!(!sensor.compass_enabled().unwrap());

    sensor.set_filter_mode(3).unwrap();
    assert_eq!(sensor.filter_mode().unwrap(), 3);
    sensor.set_accel_range(2).unwrap();
    assert_eq!(sensor.accel_range().unwrap(), 2);
    sensor.set_compass_range(5).unwrap();
    assert_eq!(sensor.compass_range().unwrap(), 5);
    sensor.set_running_avg_mode(1).unwrap();
    assert_eq!(sensor.running_avg_mode().unwrap(), 1);
    sensor.set_reference_vector_mode(0).unwrap();
    assert_eq!(sensor.reference_vector_mode().unwrap(), 0);
    sensor.set_led_mode(1).unwrap();
    assert_eq!(sensor.led_mode().unwrap(), 1);
    assert_eq!(sensor.desired_update_rate().unwrap(), 10_000);

    sensor.restore_factory_settings().unwrap();
    assert_eq!(sensor.filter_mode().unwrap(), 1);
    assert!(sensor.gyro_enabled().unwrap());
}

#[test]
fn test_dongle_rejects_sensor_settings() {
    let registry = common::registry();
    let (device, dongle, sensor) = common::dongle_with_sensor(&registry, "sim-settings-dongle");
    let dongle_session = registry.get(dongle).unwrap();

    let before = device.frames_received();
    assert!(matches!(
        dongle_session.set_filter_mode(0),
        Err(Error::InvalidCommand { .. })
    ));
    assert!(matches!(
        dongle_session.axis_directions(),
        Err(Error::InvalidCommand { .. })
    ));
    assert_eq!(device.frames_received(), before);

    // LED mode belongs to the LED group, which dongles have
    dongle_session.set_led_mode(1).unwrap();
    assert_eq!(dongle_session.led_mode().unwrap(), 1);

    // the wireless sensor behind it takes them
    let wireless = registry.get(sensor).unwrap();
    wireless.set_accel_range(1).unwrap();
    assert_eq!(wireless.accel_range().unwrap(), 1);
}

#[test]
fn test_formatted_command_by_id() {
    let registry = common::registry();
    let (_device, id) = common::usb(&registry, "sim-by-id");

    let resp = registry.command(id, code::SERIAL_NUMBER, &[]).unwrap();
    assert_eq!(resp.fields, vec![Field::U32(0x1000_0001)]);
    assert_eq!(&resp.raw[..], &0x1000_0001u32.to_be_bytes());
}

#[test]
fn test_sensor_timestamps_follow_update() {
    let registry = common::registry();
    let (_device, id) = common::usb(&registry, "sim-ts");
    let sensor = registry.get(id).unwrap();

    sensor.update_current_timestamp(1_000_000).unwrap();
    let ts = sensor.current_timestamp().unwrap();
    assert!(ts >= 1_000_000 && ts < 2_000_000, "timestamp {ts}");
    assert!(sensor.last_timestamp().is_some());
}

#[test]
fn test_unsupported_command_rejected_before_send() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-caps");
    let sensor = registry.get(id).unwrap();

    assert!(matches!(sensor.battery_percent(), Err(Error::InvalidCommand { .. })));
    assert_eq!(device.count(code::BATTERY_PERCENT), 0);

    assert!(matches!(
        sensor.set_wireless_table_entry(0, 1),
        Err(Error::InvalidCommand { .. })
    ));
}

#[test]
fn test_parameter_mismatch_is_reported() {
    let registry = common::registry();
    let (_device, id) = common::usb(&registry, "sim-params");
    let sensor = registry.get(id).unwrap();

    let result = sensor.command(code::SET_LED_COLOR, &[Field::U8(1)]);
    assert!(matches!(result, Err(Error::Parameter(_))));
}

#[test]
fn test_raw_command_is_byte_exact() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-raw");
    device.set_handler(Some(Arc::new(|frame: &ParsedCommand| {
        (frame.command == ECHO_CMD).then(|| frame.payload.iter().rev().copied().collect::<Vec<u8>>())
    })));
    let sensor = registry.get(id).unwrap();

    let resp = sensor.raw_command(ECHO_CMD, &[1, 2, 3], 3).unwrap();
    assert_eq!(&resp.raw[..], &[3, 2, 1]);
    assert!(resp.fields.is_empty());

    // length disagreement surfaces as a read error
    assert!(matches!(sensor.raw_command(ECHO_CMD, &[1, 2], 3), Err(Error::Read(_))));
}

#[test]
fn test_responses_match_their_commands_across_threads() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-echo");
    device.set_handler(Some(Arc::new(|frame: &ParsedCommand| {
        (frame.command == ECHO_CMD).then(|| frame.payload.to_vec())
    })));
    let sensor = registry.get(id).unwrap();

    let workers: Vec<_> = (0..4u8)
        .map(|t| {
            let sensor = Arc::clone(&sensor);
            thread::spawn(move || {
                for i in 0..25u8 {
                    let resp = sensor.raw_command(ECHO_CMD, &[t, i], 2).unwrap();
                    assert_eq!(&resp.raw[..], &[t, i]);
                    // interleave a formatted command with a different echo byte
                    assert_eq!(sensor.serial_number().unwrap(), 0x1000_0001);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(device.count(ECHO_CMD), 100);
}

#[test]
fn test_unsolicited_response_is_discarded() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-stale");
    let sensor = registry.get(id).unwrap();

    let header = ResponseHeader {
        status: 0,
        timestamp: 0,
        command: code::TEMPERATURE_C,
        logical_id: WIRED_LOGICAL_ID,
        data_len: 4,
    };
    device.inject(&encode_response(header, &[0x41, 0x20, 0, 0]));

    assert!(common::wait_until(std::time::Duration::from_secs(1), || {
        sensor.channel().stale_responses() == 1
    }));
    assert_eq!(sensor.serial_number().unwrap(), 0x1000_0001);
}

#[test]
fn test_silent_device_times_out() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-silent");
    let sensor = registry.get(id).unwrap();

    device.set_silent(true);
    assert!(matches!(sensor.tared_quaternion(), Err(Error::Timeout(500))));
    // a wired timeout is not retried
    assert_eq!(device.count(code::TARED_QUATERNION), 1);

    // a matching reply inside the grace window would be taken as the late one
    std::thread::sleep(common::LATE_REPLY_GRACE * 2);
    device.set_silent(false);
    assert!(sensor.tared_quaternion().is_ok());
}

#[test]
fn test_late_reply_does_not_answer_the_next_poll() {
    let registry = common::registry();
    let (device, id) = common::usb(&registry, "sim-late");
    let sensor = registry.get(id).unwrap();

    device.set_silent(true);
    assert!(matches!(sensor.tared_quaternion(), Err(Error::Timeout(_))));

    let poll = sensor.submit(code::TARED_QUATERNION, &[]).unwrap();
    let header = ResponseHeader {
        status: 0,
        timestamp: 0,
        command: code::TARED_QUATERNION,
        logical_id: WIRED_LOGICAL_ID,
        data_len: 16,
    };
    let late: Vec<u8> = std::iter::repeat(9.0f32.to_be_bytes()).take(4).flatten().collect();
    device.inject(&encode_response(header, &late));

    assert!(matches!(
        poll.wait(std::time::Duration::from_millis(200)),
        Err(Error::Timeout(200))
    ));
    assert_eq!(sensor.channel().stale_responses(), 1);

    std::thread::sleep(common::LATE_REPLY_GRACE * 2);
    device.set_silent(false);
    let q = sensor.tared_quaternion().unwrap();
    assert!(q.value.iter().all(|v| *v != 9.0));
}

#[test]
fn test_legacy_firmware_substitutes_commands() {
    let registry = common::registry();
    let mut events = registry.subscribe();
    let device = VirtualDevice::new("sim-legacy", SensorProfile::usb(7).legacy());
    let id = common::open(&registry, &device);
    let sensor = registry.get(id).unwrap();

    assert_eq!(sensor.info().firmware_version, LEGACY_FIRMWARE);
    assert_eq!(sensor.firmware_tier(), Some(FirmwareTier::Legacy));

    let accel = sensor.corrected_accel().unwrap();
    assert!(accel.emulated);
    assert_eq!(device.count(code::CORRECTED_ACCEL), 0);
    assert_eq!(device.count(code::RAW_ACCEL), 1);

    let mut emulated = false;
    while let Ok(event) = events.try_recv() {
        if event == (DeviceEvent::Emulated { id, command: code::CORRECTED_ACCEL }) {
            emulated = true;
        }
    }
    assert!(emulated);

    // native commands go through untouched
    assert!(!sensor.tared_quaternion().unwrap().emulated);
}

#[test]
fn test_legacy_firmware_refuses_newer_commands() {
    let registry = common::registry();
    let device = VirtualDevice::new("sim-legacy-2", SensorProfile::usb(8).legacy());
    let id = common::open(&registry, &device);
    let sensor = registry.get(id).unwrap();

    assert!(matches!(
        sensor.confidence(),
        Err(Error::FirmwareIncompatible(code::CONFIDENCE))
    ));
    assert!(matches!(
        sensor.set_stream_slots(&[code::TARED_QUATERNION]),
        Err(Error::FirmwareIncompatible(code::SET_STREAM_SLOTS))
    ));
    assert_eq!(device.count(code::CONFIDENCE), 0);
    assert_eq!(device.count(code::SET_STREAM_SLOTS), 0);
}

#[test]
fn test_capture_records_traffic() {
    let registry = common::registry();
    let log = Arc::new(threespace_core::TrafficLog::new(256));
    registry.set_capture(Some(Arc::clone(&log)));
    let (_device, id) = common::usb(&registry, "sim-capture");

    let before = log.frames();
    registry.get(id).unwrap().serial_number().unwrap();
    assert_eq!(log.frames(), before + 2);
}
