//! 3-Space command table
//!
//! Static description of every command the engine knows how to format:
//! input/output schemas, the capability a device needs to accept it, how it
//! behaves on legacy firmware, and whether it may occupy a streaming slot.

use super::codec::FieldType;
use crate::core::capability::Capability;

/// Command byte constants
pub mod code {
    pub const TARED_QUATERNION: u8 = 0x00;
    pub const TARED_EULER: u8 = 0x01;
    pub const TARED_MATRIX: u8 = 0x02;
    pub const TARED_AXIS_ANGLE: u8 = 0x03;
    pub const TARED_TWO_VECTOR: u8 = 0x04;
    pub const DIFFERENCE_QUATERNION: u8 = 0x05;
    pub const UNTARED_QUATERNION: u8 = 0x06;
    pub const UNTARED_EULER: u8 = 0x07;
    pub const UNTARED_MATRIX: u8 = 0x08;
    pub const UNTARED_AXIS_ANGLE: u8 = 0x09;
    pub const UNTARED_TWO_VECTOR: u8 = 0x0A;
    pub const TARED_TWO_VECTOR_SENSOR_FRAME: u8 = 0x0B;
    pub const UNTARED_TWO_VECTOR_SENSOR_FRAME: u8 = 0x0C;

    pub const ALL_NORMALIZED: u8 = 0x20;
    pub const NORMALIZED_GYRO: u8 = 0x21;
    pub const NORMALIZED_ACCEL: u8 = 0x22;
    pub const NORMALIZED_COMPASS: u8 = 0x23;
    pub const ALL_CORRECTED: u8 = 0x25;
    pub const CORRECTED_GYRO: u8 = 0x26;
    pub const CORRECTED_ACCEL: u8 = 0x27;
    pub const CORRECTED_COMPASS: u8 = 0x28;
    pub const LINEAR_ACCEL_GLOBAL: u8 = 0x29;
    pub const TEMPERATURE_C: u8 = 0x2B;
    pub const TEMPERATURE_F: u8 = 0x2C;
    pub const CONFIDENCE: u8 = 0x2D;

    pub const ALL_RAW: u8 = 0x40;
    pub const RAW_GYRO: u8 = 0x41;
    pub const RAW_ACCEL: u8 = 0x42;
    pub const RAW_COMPASS: u8 = 0x43;

    pub const SET_STREAM_SLOTS: u8 = 0x50;
    pub const GET_STREAM_SLOTS: u8 = 0x51;
    pub const SET_STREAM_TIMING: u8 = 0x52;
    pub const GET_STREAM_TIMING: u8 = 0x53;
    pub const START_STREAMING: u8 = 0x55;
    pub const STOP_STREAMING: u8 = 0x56;
    pub const GET_TIMESTAMP: u8 = 0x5E;
    pub const UPDATE_TIMESTAMP: u8 = 0x5F;

    pub const TARE_CURRENT: u8 = 0x60;
    pub const TARE_QUATERNION: u8 = 0x61;
    pub const SET_REFERENCE_VECTOR_MODE: u8 = 0x69;
    pub const SET_GYRO_ENABLED: u8 = 0x6B;
    pub const SET_ACCEL_ENABLED: u8 = 0x6C;
    pub const SET_COMPASS_ENABLED: u8 = 0x6D;
    pub const SET_AXIS_DIRECTIONS: u8 = 0x74;
    pub const SET_ACCEL_RANGE: u8 = 0x79;
    pub const SET_FILTER_MODE: u8 = 0x7B;
    pub const SET_RUNNING_AVG_MODE: u8 = 0x7C;
    pub const SET_COMPASS_RANGE: u8 = 0x7E;

    pub const GET_TARE_QUATERNION: u8 = 0x80;
    pub const GET_REFERENCE_VECTOR_MODE: u8 = 0x87;
    pub const GET_GYRO_ENABLED: u8 = 0x8C;
    pub const GET_ACCEL_ENABLED: u8 = 0x8D;
    pub const GET_COMPASS_ENABLED: u8 = 0x8E;
    pub const GET_AXIS_DIRECTIONS: u8 = 0x8F;
    pub const GET_ACCEL_RANGE: u8 = 0x94;
    pub const GET_COMPASS_RANGE: u8 = 0x97;
    pub const GET_FILTER_MODE: u8 = 0x98;
    pub const GET_RUNNING_AVG_MODE: u8 = 0x99;
    pub const GET_DESIRED_UPDATE_RATE: u8 = 0x9A;

    pub const GET_PAN_ID: u8 = 0xC0;
    pub const SET_PAN_ID: u8 = 0xC1;
    pub const GET_CHANNEL: u8 = 0xC2;
    pub const SET_CHANNEL: u8 = 0xC3;
    pub const SET_LED_MODE: u8 = 0xC4;
    pub const COMMIT_WIRELESS: u8 = 0xC5;
    pub const GET_LED_MODE: u8 = 0xC8;
    pub const BATTERY_VOLTAGE: u8 = 0xC9;
    pub const BATTERY_PERCENT: u8 = 0xCA;
    pub const BATTERY_STATUS: u8 = 0xCB;
    pub const GET_SERIAL_AT_LOGICAL_ID: u8 = 0xD0;
    pub const SET_SERIAL_AT_LOGICAL_ID: u8 = 0xD1;
    pub const GET_WIRELESS_RETRIES: u8 = 0xD3;
    pub const SET_WIRELESS_RETRIES: u8 = 0xD4;
    pub const OPEN_SLOTS: u8 = 0xD5;
    pub const SIGNAL_STRENGTH: u8 = 0xD6;
    pub const SET_WIRELESS_HEADER: u8 = 0xDB;
    pub const SET_WIRED_HEADER: u8 = 0xDD;
    pub const FIRMWARE_VERSION: u8 = 0xDF;
    pub const RESTORE_FACTORY: u8 = 0xE0;
    pub const COMMIT_SETTINGS: u8 = 0xE1;
    pub const SOFTWARE_RESET: u8 = 0xE2;
    pub const HARDWARE_VERSION: u8 = 0xE6;
    pub const SERIAL_NUMBER: u8 = 0xED;
    pub const SET_LED_COLOR: u8 = 0xEE;
    pub const GET_LED_COLOR: u8 = 0xEF;
    pub const BUTTON_STATE: u8 = 0xFA;

    /// Empty streaming slot marker
    pub const NULL_SLOT: u8 = 0xFF;
}

/// How a command behaves on legacy firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyPolicy {
    /// Sent unchanged
    Native,
    /// Replaced by an older command with the same output schema
    Substitute(u8),
    /// Not available; upgrade required
    Unsupported,
}

/// Static command description
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub code: u8,
    pub name: &'static str,
    pub input: &'static [FieldType],
    pub output: &'static [FieldType],
    pub capability: Capability,
    pub legacy: LegacyPolicy,
    /// May be placed in a streaming slot
    pub streamable: bool,
}

use FieldType::{Bool, Char, F32, U16, U32, U8};

const NONE: &[FieldType] = &[];
const F1: &[FieldType] = &[F32];
const F3: &[FieldType] = &[F32; 3];
const F4: &[FieldType] = &[F32; 4];
const F6: &[FieldType] = &[F32; 6];
const F9: &[FieldType] = &[F32; 9];
const B1: &[FieldType] = &[U8];
const FLAG: &[FieldType] = &[Bool];
const W1: &[FieldType] = &[U16];
const L1: &[FieldType] = &[U32];
const SLOTS: &[FieldType] = &[U8; 8];
const TIMING: &[FieldType] = &[U32; 3];
const TABLE_GET_IN: &[FieldType] = &[U8];
const TABLE_SET_IN: &[FieldType] = &[U8, U32];
const FIRMWARE_STR: &[FieldType] = &[Char; 12];
const HARDWARE_STR: &[FieldType] = &[Char; 32];

macro_rules! cmd {
    ($code:expr, $name:literal, $input:expr, $output:expr, $cap:ident) => {
        cmd!($code, $name, $input, $output, $cap, LegacyPolicy::Native, false)
    };
    ($code:expr, $name:literal, $input:expr, $output:expr, $cap:ident, stream) => {
        cmd!($code, $name, $input, $output, $cap, LegacyPolicy::Native, true)
    };
    ($code:expr, $name:literal, $input:expr, $output:expr, $cap:ident, $legacy:expr, $stream:expr) => {
        CommandSpec {
            code: $code,
            name: $name,
            input: $input,
            output: $output,
            capability: Capability::$cap,
            legacy: $legacy,
            streamable: $stream,
        }
    };
}

/// Every formatted command the engine knows
pub static COMMANDS: &[CommandSpec] = &[
    cmd!(code::TARED_QUATERNION, "tared_quaternion", NONE, F4, Orientation, stream),
    cmd!(code::TARED_EULER, "tared_euler", NONE, F3, Orientation, stream),
    cmd!(code::TARED_MATRIX, "tared_matrix", NONE, F9, Orientation, stream),
    cmd!(code::TARED_AXIS_ANGLE, "tared_axis_angle", NONE, F4, Orientation, stream),
    cmd!(code::TARED_TWO_VECTOR, "tared_two_vector", NONE, F6, Orientation, stream),
    cmd!(code::DIFFERENCE_QUATERNION, "difference_quaternion", NONE, F4, Orientation, stream),
    cmd!(code::UNTARED_QUATERNION, "untared_quaternion", NONE, F4, Orientation, stream),
    cmd!(code::UNTARED_EULER, "untared_euler", NONE, F3, Orientation, stream),
    cmd!(code::UNTARED_MATRIX, "untared_matrix", NONE, F9, Orientation, stream),
    cmd!(code::UNTARED_AXIS_ANGLE, "untared_axis_angle", NONE, F4, Orientation, stream),
    cmd!(code::UNTARED_TWO_VECTOR, "untared_two_vector", NONE, F6, Orientation, stream),
    cmd!(code::TARED_TWO_VECTOR_SENSOR_FRAME, "tared_two_vector_sensor_frame", NONE, F6, Orientation, stream),
    cmd!(code::UNTARED_TWO_VECTOR_SENSOR_FRAME, "untared_two_vector_sensor_frame", NONE, F6, Orientation, stream),
    cmd!(code::ALL_NORMALIZED, "all_normalized", NONE, F9, Sensors, stream),
    cmd!(code::NORMALIZED_GYRO, "normalized_gyro", NONE, F3, Sensors, stream),
    cmd!(code::NORMALIZED_ACCEL, "normalized_accel", NONE, F3, Sensors, stream),
    cmd!(code::NORMALIZED_COMPASS, "normalized_compass", NONE, F3, Sensors, stream),
    cmd!(code::ALL_CORRECTED, "all_corrected", NONE, F9, Sensors, stream),
    cmd!(code::CORRECTED_GYRO, "corrected_gyro", NONE, F3, Sensors, stream),
    cmd!(
        code::CORRECTED_ACCEL,
        "corrected_accel",
        NONE,
        F3,
        Sensors,
        LegacyPolicy::Substitute(code::RAW_ACCEL),
        true
    ),
    cmd!(
        code::CORRECTED_COMPASS,
        "corrected_compass",
        NONE,
        F3,
        Sensors,
        LegacyPolicy::Substitute(code::RAW_COMPASS),
        true
    ),
    cmd!(code::LINEAR_ACCEL_GLOBAL, "linear_accel_global", NONE, F3, Sensors, stream),
    cmd!(code::TEMPERATURE_C, "temperature_c", NONE, F1, Sensors, stream),
    cmd!(code::TEMPERATURE_F, "temperature_f", NONE, F1, Sensors, stream),
    cmd!(
        code::CONFIDENCE,
        "confidence",
        NONE,
        F1,
        Sensors,
        LegacyPolicy::Unsupported,
        true
    ),
    cmd!(code::ALL_RAW, "all_raw", NONE, F9, RawSensors, stream),
    cmd!(code::RAW_GYRO, "raw_gyro", NONE, F3, RawSensors, stream),
    cmd!(code::RAW_ACCEL, "raw_accel", NONE, F3, RawSensors, stream),
    cmd!(code::RAW_COMPASS, "raw_compass", NONE, F3, RawSensors, stream),
    cmd!(
        code::SET_STREAM_SLOTS,
        "set_stream_slots",
        SLOTS,
        NONE,
        Streaming,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(
        code::GET_STREAM_SLOTS,
        "get_stream_slots",
        NONE,
        SLOTS,
        Streaming,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(
        code::SET_STREAM_TIMING,
        "set_stream_timing",
        TIMING,
        NONE,
        Streaming,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(
        code::GET_STREAM_TIMING,
        "get_stream_timing",
        NONE,
        TIMING,
        Streaming,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(
        code::START_STREAMING,
        "start_streaming",
        NONE,
        NONE,
        Streaming,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(
        code::STOP_STREAMING,
        "stop_streaming",
        NONE,
        NONE,
        Streaming,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(
        code::GET_TIMESTAMP,
        "get_timestamp",
        NONE,
        L1,
        Timestamp,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(
        code::UPDATE_TIMESTAMP,
        "update_timestamp",
        L1,
        NONE,
        Timestamp,
        LegacyPolicy::Unsupported,
        false
    ),
    cmd!(code::TARE_CURRENT, "tare_current", NONE, NONE, Settings),
    cmd!(code::TARE_QUATERNION, "tare_quaternion", F4, NONE, Settings),
    cmd!(code::GET_TARE_QUATERNION, "get_tare_quaternion", NONE, F4, Settings),
    cmd!(code::SET_REFERENCE_VECTOR_MODE, "set_reference_vector_mode", B1, NONE, SensorSettings),
    cmd!(code::GET_REFERENCE_VECTOR_MODE, "get_reference_vector_mode", NONE, B1, SensorSettings),
    cmd!(code::SET_GYRO_ENABLED, "set_gyro_enabled", FLAG, NONE, SensorSettings),
    cmd!(code::GET_GYRO_ENABLED, "get_gyro_enabled", NONE, FLAG, SensorSettings),
    cmd!(code::SET_ACCEL_ENABLED, "set_accel_enabled", FLAG, NONE, SensorSettings),
    cmd!(code::GET_ACCEL_ENABLED, "get_accel_enabled", NONE, FLAG, SensorSettings),
    cmd!(code::SET_COMPASS_ENABLED, "set_compass_enabled", FLAG, NONE, SensorSettings),
    cmd!(code::GET_COMPASS_ENABLED, "get_compass_enabled", NONE, FLAG, SensorSettings),
    cmd!(code::SET_AXIS_DIRECTIONS, "set_axis_directions", B1, NONE, SensorSettings),
    cmd!(code::GET_AXIS_DIRECTIONS, "get_axis_directions", NONE, B1, SensorSettings),
    cmd!(code::SET_ACCEL_RANGE, "set_accel_range", B1, NONE, SensorSettings),
    cmd!(code::GET_ACCEL_RANGE, "get_accel_range", NONE, B1, SensorSettings),
    cmd!(code::SET_COMPASS_RANGE, "set_compass_range", B1, NONE, SensorSettings),
    cmd!(code::GET_COMPASS_RANGE, "get_compass_range", NONE, B1, SensorSettings),
    cmd!(code::SET_FILTER_MODE, "set_filter_mode", B1, NONE, SensorSettings),
    cmd!(code::GET_FILTER_MODE, "get_filter_mode", NONE, B1, SensorSettings),
    cmd!(code::SET_RUNNING_AVG_MODE, "set_running_avg_mode", B1, NONE, SensorSettings),
    cmd!(code::GET_RUNNING_AVG_MODE, "get_running_avg_mode", NONE, B1, SensorSettings),
    cmd!(code::GET_DESIRED_UPDATE_RATE, "get_desired_update_rate", NONE, L1, SensorSettings),
    cmd!(code::GET_PAN_ID, "get_pan_id", NONE, W1, Wireless),
    cmd!(code::SET_PAN_ID, "set_pan_id", W1, NONE, Wireless),
    cmd!(code::GET_CHANNEL, "get_channel", NONE, B1, Wireless),
    cmd!(code::SET_CHANNEL, "set_channel", B1, NONE, Wireless),
    cmd!(code::SET_LED_MODE, "set_led_mode", B1, NONE, Led),
    cmd!(code::COMMIT_WIRELESS, "commit_wireless", NONE, NONE, Wireless),
    cmd!(code::GET_LED_MODE, "get_led_mode", NONE, B1, Led),
    cmd!(code::BATTERY_VOLTAGE, "battery_voltage", NONE, F1, Battery, stream),
    cmd!(code::BATTERY_PERCENT, "battery_percent", NONE, B1, Battery, stream),
    cmd!(code::BATTERY_STATUS, "battery_status", NONE, B1, Battery, stream),
    cmd!(code::GET_SERIAL_AT_LOGICAL_ID, "get_serial_at_logical_id", TABLE_GET_IN, L1, Dongle),
    cmd!(code::SET_SERIAL_AT_LOGICAL_ID, "set_serial_at_logical_id", TABLE_SET_IN, NONE, Dongle),
    cmd!(code::GET_WIRELESS_RETRIES, "get_wireless_retries", NONE, B1, Dongle),
    cmd!(code::SET_WIRELESS_RETRIES, "set_wireless_retries", B1, NONE, Dongle),
    cmd!(code::OPEN_SLOTS, "open_slots", NONE, B1, Dongle),
    cmd!(code::SIGNAL_STRENGTH, "signal_strength", NONE, B1, Dongle),
    cmd!(code::SET_WIRELESS_HEADER, "set_wireless_header", L1, NONE, Dongle),
    cmd!(code::SET_WIRED_HEADER, "set_wired_header", L1, NONE, System),
    cmd!(code::FIRMWARE_VERSION, "firmware_version", NONE, FIRMWARE_STR, System),
    cmd!(code::RESTORE_FACTORY, "restore_factory", NONE, NONE, Settings),
    cmd!(code::COMMIT_SETTINGS, "commit_settings", NONE, NONE, Settings),
    cmd!(code::SOFTWARE_RESET, "software_reset", NONE, NONE, System),
    cmd!(code::HARDWARE_VERSION, "hardware_version", NONE, HARDWARE_STR, System),
    cmd!(code::SERIAL_NUMBER, "serial_number", NONE, L1, System),
    cmd!(code::SET_LED_COLOR, "set_led_color", F3, NONE, Led),
    cmd!(code::GET_LED_COLOR, "get_led_color", NONE, F3, Led),
    cmd!(code::BUTTON_STATE, "button_state", NONE, B1, Button, stream),
];

/// Look up a command by byte
pub fn lookup(code: u8) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.code == code)
}

/// Look up a command by its snake_case name
pub fn by_name(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::codec::schema_len;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<u8> = COMMANDS.iter().map(|c| c.code).collect();
        assert_eq!(codes.len(), COMMANDS.len());
    }

    #[test]
    fn test_substitutes_share_output_schema() {
        for spec in COMMANDS {
            if let LegacyPolicy::Substitute(alt) = spec.legacy {
                let alt_spec = lookup(alt).expect("substitute must exist");
                assert_eq!(spec.output, alt_spec.output, "{}", spec.name);
                assert_eq!(alt_spec.legacy, LegacyPolicy::Native);
            }
        }
    }

    #[test]
    fn test_streamable_commands_take_no_input() {
        for spec in COMMANDS.iter().filter(|c| c.streamable) {
            assert!(spec.input.is_empty(), "{}", spec.name);
            assert!(!spec.output.is_empty(), "{}", spec.name);
        }
    }

    #[test]
    fn test_lookup_schemas() {
        assert_eq!(schema_len(lookup(code::TARED_QUATERNION).unwrap().output), 16);
        assert_eq!(schema_len(lookup(code::SET_STREAM_TIMING).unwrap().input), 12);
        assert_eq!(schema_len(lookup(code::HARDWARE_VERSION).unwrap().output), 32);
        assert_eq!(by_name("raw_gyro").unwrap().code, code::RAW_GYRO);
        assert!(lookup(0xB0).is_none());
    }

    #[test]
    fn test_sensor_settings_pairs() {
        let pairs = [
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
        for (set, get) in pairs {
            let set = lookup(set).unwrap();
            let get = lookup(get).unwrap();
            assert_eq!(set.input, get.output, "{}", set.name);
            assert!(set.output.is_empty() && get.input.is_empty(), "{}", get.name);
            assert_eq!(set.capability, get.capability);
            assert_eq!(set.legacy, LegacyPolicy::Native);
            assert!(!set.streamable && !get.streamable);
        }
        assert_eq!(lookup(code::GET_GYRO_ENABLED).unwrap().output, &[FieldType::Bool]);
        assert_eq!(lookup(code::GET_LED_MODE).unwrap().capability, Capability::Led);
        assert_eq!(
            by_name("get_desired_update_rate").unwrap().output,
            &[FieldType::U32]
        );
    }
}
