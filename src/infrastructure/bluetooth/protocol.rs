//! DOT Sensor Protocol
//!
//! Characteristic UUIDs, the measurement protocol table and the control
//! frames used to start and stop measurement notifications.

use crate::domain::models::{Channel, DeviceStatus, PayloadType};
use uuid::Uuid;

/// All DOT characteristics share the base `1517xxxx-4947-11e9-8646-d663bd873d93`
const fn dot_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x1517_0000_4947_11e9_8646_d663_bd87_3d93 | ((short as u128) << 96))
}

/// Device information (MAC, firmware, serial, product code) - read
pub const DEVICE_INFO_UUID: Uuid = dot_uuid(0x1001);
/// Device control (tag, output rate, filter profile) - read/write
pub const DEVICE_CONTROL_UUID: Uuid = dot_uuid(0x1002);
/// Device report (status codes, button callback) - notify
pub const DEVICE_REPORT_UUID: Uuid = dot_uuid(0x1004);
/// Measurement control - write
pub const MEASUREMENT_CONTROL_UUID: Uuid = dot_uuid(0x2001);
/// Long payload channel - notify
pub const LONG_PAYLOAD_UUID: Uuid = dot_uuid(0x2002);
/// Medium payload channel - notify
pub const MEDIUM_PAYLOAD_UUID: Uuid = dot_uuid(0x2003);
/// Short payload channel - notify
pub const SHORT_PAYLOAD_UUID: Uuid = dot_uuid(0x2004);
/// Battery level and charging state - read/notify
pub const BATTERY_UUID: Uuid = dot_uuid(0x3001);

/// Command group byte for measurement control frames
pub const MEASUREMENT_COMMAND: u8 = 0x01;

/// Device report byte that carries a timestamp
pub const BUTTON_CALLBACK_CODE: u8 = 0x34;
/// Offset of the button callback timestamp in a device report
pub const BUTTON_CALLBACK_TIMESTAMP_OFFSET: usize = 2;

/// Start/stop byte of a measurement control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Stop,
    Start,
}

impl ControlAction {
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Stop => 0x00,
            Self::Start => 0x01,
        }
    }
}

/// Build the 3-byte measurement control frame
pub fn control_frame(payload: PayloadType, action: ControlAction) -> [u8; 3] {
    [
        MEASUREMENT_COMMAND,
        action.as_byte(),
        protocol_entry(payload).code,
    ]
}

/// A field of a measurement frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// u32 milliseconds
    Timestamp,
    Quaternion,
    Euler,
    FreeAcceleration,
    Acceleration,
    AngularVelocity,
    Dq,
    Dv,
    /// three i16 in 1/4096 units
    MagneticField,
    /// u16 status word
    Status,
    ClipCountAcc,
    ClipCountGyr,
}

impl Field {
    /// Encoded size in bytes
    pub const fn size(&self) -> usize {
        match self {
            Self::Timestamp => 4,
            Self::Quaternion | Self::Dq => 16,
            Self::Euler
            | Self::FreeAcceleration
            | Self::Acceleration
            | Self::AngularVelocity
            | Self::Dv => 12,
            Self::MagneticField => 6,
            Self::Status => 2,
            Self::ClipCountAcc | Self::ClipCountGyr => 1,
        }
    }
}

/// Protocol table row for one payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEntry {
    pub payload: PayloadType,
    /// Payload byte of the control frame
    pub code: u8,
    pub channel: Channel,
    /// Fields and their byte offsets, in wire order
    pub layout: &'static [(Field, usize)],
}

impl ProtocolEntry {
    /// Number of bytes a notification must carry to decode this payload
    pub fn frame_len(&self) -> usize {
        self.layout
            .iter()
            .map(|(field, offset)| offset + field.size())
            .max()
            .unwrap_or(0)
    }
}

/// Protocol table lookup.
///
/// # Payload table
///
/// ```text
/// payload                 code  channel  bytes
/// extendedQuaternion         2  medium   36
/// completeQuaternion         3  medium   32
/// extendedEuler              4  medium   32
/// orientationQuaternion      5  short    20
/// orientationEuler           6  short    16
/// freeAcceleration           7  short    16
/// completeEuler             16  medium   28
/// deltaQuantitiesWithMag    18  medium   38
/// deltaQuantities           19  medium   32
/// rateQuantitiesWithMag     20  medium   34
/// rateQuantities            21  medium   28
/// customMode1               22  medium   40
/// customMode2               23  medium   34
/// customMode3               24  medium   32
/// customMode5               26  long     44
/// ```
pub fn protocol_entry(payload: PayloadType) -> ProtocolEntry {
    use Field::*;

    let (code, channel, layout): (u8, Channel, &'static [(Field, usize)]) = match payload {
        PayloadType::ExtendedQuaternion => (
            2,
            Channel::Medium,
            &[
                (Timestamp, 0),
                (Quaternion, 4),
                (FreeAcceleration, 20),
                (Status, 32),
                (ClipCountAcc, 34),
                (ClipCountGyr, 35),
            ],
        ),
        PayloadType::CompleteQuaternion => (
            3,
            Channel::Medium,
            &[(Timestamp, 0), (Quaternion, 4), (FreeAcceleration, 20)],
        ),
        PayloadType::ExtendedEuler => (
            4,
            Channel::Medium,
            &[
                (Timestamp, 0),
                (Euler, 4),
                (FreeAcceleration, 16),
                (Status, 28),
                (ClipCountAcc, 30),
                (ClipCountGyr, 31),
            ],
        ),
        PayloadType::CompleteEuler => (
            16,
            Channel::Medium,
            &[(Timestamp, 0), (Euler, 4), (FreeAcceleration, 16)],
        ),
        PayloadType::OrientationQuaternion => {
            (5, Channel::Short, &[(Timestamp, 0), (Quaternion, 4)])
        }
        PayloadType::OrientationEuler => (6, Channel::Short, &[(Timestamp, 0), (Euler, 4)]),
        PayloadType::FreeAcceleration => {
            (7, Channel::Short, &[(Timestamp, 0), (FreeAcceleration, 4)])
        }
        PayloadType::DeltaQuantitiesWithMag => (
            18,
            Channel::Medium,
            &[(Timestamp, 0), (Dq, 4), (Dv, 20), (MagneticField, 32)],
        ),
        PayloadType::DeltaQuantities => {
            (19, Channel::Medium, &[(Timestamp, 0), (Dq, 4), (Dv, 20)])
        }
        PayloadType::RateQuantitiesWithMag => (
            20,
            Channel::Medium,
            &[
                (Timestamp, 0),
                (Acceleration, 4),
                (AngularVelocity, 16),
                (MagneticField, 28),
            ],
        ),
        PayloadType::RateQuantities => (
            21,
            Channel::Medium,
            &[(Timestamp, 0), (Acceleration, 4), (AngularVelocity, 16)],
        ),
        PayloadType::CustomMode1 => (
            22,
            Channel::Medium,
            &[
                (Timestamp, 0),
                (Euler, 4),
                (FreeAcceleration, 16),
                (AngularVelocity, 28),
            ],
        ),
        PayloadType::CustomMode2 => (
            23,
            Channel::Medium,
            &[
                (Timestamp, 0),
                (Euler, 4),
                (FreeAcceleration, 16),
                (MagneticField, 28),
            ],
        ),
        PayloadType::CustomMode3 => (
            24,
            Channel::Medium,
            &[(Timestamp, 0), (Quaternion, 4), (AngularVelocity, 20)],
        ),
        PayloadType::CustomMode5 => (
            26,
            Channel::Long,
            &[
                (Timestamp, 0),
                (Quaternion, 4),
                (Acceleration, 20),
                (AngularVelocity, 32),
            ],
        ),
    };

    ProtocolEntry {
        payload,
        code,
        channel,
        layout,
    }
}

/// Reverse lookup of a control frame payload byte
pub fn payload_from_code(code: u8) -> Option<PayloadType> {
    PayloadType::ALL
        .iter()
        .copied()
        .find(|payload| protocol_entry(*payload).code == code)
}

/// Notification characteristic carrying a channel
pub fn channel_uuid(channel: Channel) -> Uuid {
    match channel {
        Channel::Short => SHORT_PAYLOAD_UUID,
        Channel::Medium => MEDIUM_PAYLOAD_UUID,
        Channel::Long => LONG_PAYLOAD_UUID,
    }
}

/// Device report status byte lookup
pub fn status_from_code(code: u8) -> Option<DeviceStatus> {
    match code {
        0x00 => Some(DeviceStatus::Successful),
        0x01 => Some(DeviceStatus::PowerOff),
        0x02 => Some(DeviceStatus::DeviceBusy),
        0x03 => Some(DeviceStatus::IllegalCommand),
        0x04 => Some(DeviceStatus::PowerSaving),
        BUTTON_CALLBACK_CODE => Some(DeviceStatus::ButtonCallback),
        _ => None,
    }
}

/// Human readable name for log lines and errors
pub fn characteristic_name(uuid: &Uuid) -> &'static str {
    match *uuid {
        DEVICE_INFO_UUID => "device information",
        DEVICE_CONTROL_UUID => "device control",
        DEVICE_REPORT_UUID => "device report",
        MEASUREMENT_CONTROL_UUID => "measurement control",
        LONG_PAYLOAD_UUID => "long payload",
        MEDIUM_PAYLOAD_UUID => "medium payload",
        SHORT_PAYLOAD_UUID => "short payload",
        BATTERY_UUID => "battery",
        _ => "unknown",
    }
}
