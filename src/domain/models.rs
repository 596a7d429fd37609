use crate::error::{DotError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Process-unique handle for a discovered sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Notification characteristic a payload type is streamed on, by frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Short,
    Medium,
    Long,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
        };
        f.write_str(name)
    }
}

/// Measurement output formats selectable through the control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadType {
    ExtendedQuaternion,
    CompleteQuaternion,
    ExtendedEuler,
    CompleteEuler,
    OrientationQuaternion,
    OrientationEuler,
    FreeAcceleration,
    DeltaQuantitiesWithMag,
    DeltaQuantities,
    RateQuantitiesWithMag,
    RateQuantities,
    CustomMode1,
    CustomMode2,
    CustomMode3,
    CustomMode5,
}

impl PayloadType {
    pub const ALL: [PayloadType; 15] = [
        Self::ExtendedQuaternion,
        Self::CompleteQuaternion,
        Self::ExtendedEuler,
        Self::CompleteEuler,
        Self::OrientationQuaternion,
        Self::OrientationEuler,
        Self::FreeAcceleration,
        Self::DeltaQuantitiesWithMag,
        Self::DeltaQuantities,
        Self::RateQuantitiesWithMag,
        Self::RateQuantities,
        Self::CustomMode1,
        Self::CustomMode2,
        Self::CustomMode3,
        Self::CustomMode5,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExtendedQuaternion => "extendedQuaternion",
            Self::CompleteQuaternion => "completeQuaternion",
            Self::ExtendedEuler => "extendedEuler",
            Self::CompleteEuler => "completeEuler",
            Self::OrientationQuaternion => "orientationQuaternion",
            Self::OrientationEuler => "orientationEuler",
            Self::FreeAcceleration => "freeAcceleration",
            Self::DeltaQuantitiesWithMag => "deltaQuantitiesWithMag",
            Self::DeltaQuantities => "deltaQuantities",
            Self::RateQuantitiesWithMag => "rateQuantitiesWithMag",
            Self::RateQuantities => "rateQuantities",
            Self::CustomMode1 => "customMode1",
            Self::CustomMode2 => "customMode2",
            Self::CustomMode3 => "customMode3",
            Self::CustomMode5 => "customMode5",
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PayloadType {
    type Err = DotError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|payload| payload.name().eq_ignore_ascii_case(value))
            .ok_or_else(|| DotError::UnknownPayloadType(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One decoded measurement notification.
///
/// Field sets follow the payload layout selected at subscribe time. Status
/// words are kept as `(raw & 0x1FF) << 8`, which needs more than 16 bits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "payload", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MeasurementFrame {
    ExtendedQuaternion {
        timestamp: u32,
        quaternion: Quaternion,
        free_acceleration: Vector3,
        status: u32,
        clip_count_acc: i8,
        clip_count_gyr: i8,
    },
    CompleteQuaternion {
        timestamp: u32,
        quaternion: Quaternion,
        free_acceleration: Vector3,
    },
    ExtendedEuler {
        timestamp: u32,
        euler: Vector3,
        free_acceleration: Vector3,
        status: u32,
        clip_count_acc: i8,
        clip_count_gyr: i8,
    },
    CompleteEuler {
        timestamp: u32,
        euler: Vector3,
        free_acceleration: Vector3,
    },
    OrientationQuaternion {
        timestamp: u32,
        quaternion: Quaternion,
    },
    OrientationEuler {
        timestamp: u32,
        euler: Vector3,
    },
    FreeAcceleration {
        timestamp: u32,
        free_acceleration: Vector3,
    },
    DeltaQuantitiesWithMag {
        timestamp: u32,
        dq: Quaternion,
        dv: Vector3,
        magnetic_field: Vector3,
    },
    DeltaQuantities {
        timestamp: u32,
        dq: Quaternion,
        dv: Vector3,
    },
    RateQuantitiesWithMag {
        timestamp: u32,
        acceleration: Vector3,
        angular_velocity: Vector3,
        magnetic_field: Vector3,
    },
    RateQuantities {
        timestamp: u32,
        acceleration: Vector3,
        angular_velocity: Vector3,
    },
    CustomMode1 {
        timestamp: u32,
        euler: Vector3,
        free_acceleration: Vector3,
        angular_velocity: Vector3,
    },
    CustomMode2 {
        timestamp: u32,
        euler: Vector3,
        free_acceleration: Vector3,
        magnetic_field: Vector3,
    },
    CustomMode3 {
        timestamp: u32,
        quaternion: Quaternion,
        angular_velocity: Vector3,
    },
    CustomMode5 {
        timestamp: u32,
        quaternion: Quaternion,
        acceleration: Vector3,
        angular_velocity: Vector3,
    },
}

impl MeasurementFrame {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::ExtendedQuaternion { .. } => PayloadType::ExtendedQuaternion,
            Self::CompleteQuaternion { .. } => PayloadType::CompleteQuaternion,
            Self::ExtendedEuler { .. } => PayloadType::ExtendedEuler,
            Self::CompleteEuler { .. } => PayloadType::CompleteEuler,
            Self::OrientationQuaternion { .. } => PayloadType::OrientationQuaternion,
            Self::OrientationEuler { .. } => PayloadType::OrientationEuler,
            Self::FreeAcceleration { .. } => PayloadType::FreeAcceleration,
            Self::DeltaQuantitiesWithMag { .. } => PayloadType::DeltaQuantitiesWithMag,
            Self::DeltaQuantities { .. } => PayloadType::DeltaQuantities,
            Self::RateQuantitiesWithMag { .. } => PayloadType::RateQuantitiesWithMag,
            Self::RateQuantities { .. } => PayloadType::RateQuantities,
            Self::CustomMode1 { .. } => PayloadType::CustomMode1,
            Self::CustomMode2 { .. } => PayloadType::CustomMode2,
            Self::CustomMode3 { .. } => PayloadType::CustomMode3,
            Self::CustomMode5 { .. } => PayloadType::CustomMode5,
        }
    }

    /// Device timestamp in milliseconds
    pub fn timestamp(&self) -> u32 {
        match self {
            Self::ExtendedQuaternion { timestamp, .. }
            | Self::CompleteQuaternion { timestamp, .. }
            | Self::ExtendedEuler { timestamp, .. }
            | Self::CompleteEuler { timestamp, .. }
            | Self::OrientationQuaternion { timestamp, .. }
            | Self::OrientationEuler { timestamp, .. }
            | Self::FreeAcceleration { timestamp, .. }
            | Self::DeltaQuantitiesWithMag { timestamp, .. }
            | Self::DeltaQuantities { timestamp, .. }
            | Self::RateQuantitiesWithMag { timestamp, .. }
            | Self::RateQuantities { timestamp, .. }
            | Self::CustomMode1 { timestamp, .. }
            | Self::CustomMode2 { timestamp, .. }
            | Self::CustomMode3 { timestamp, .. }
            | Self::CustomMode5 { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryEvent {
    /// Battery level in percent
    pub level: u8,
    pub charging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceStatus {
    Successful,
    PowerOff,
    DeviceBusy,
    IllegalCommand,
    PowerSaving,
    ButtonCallback,
}

/// Device report notification. Only button callbacks carry a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: DeviceStatus,
    pub timestamp: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareDate {
    pub year: i16,
    pub month: i8,
    pub day: i8,
    pub hour: i8,
    pub minute: i8,
    pub second: i8,
}

impl fmt::Display for FirmwareDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// "major.minor.patch"
    pub version: String,
    pub date: FirmwareDate,
}

/// Static device configuration read from the information and control
/// characteristics after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub tag: String,
    pub output_rate: u8,
    pub filter_index: u8,
    pub mac_address: String,
    pub firmware: FirmwareInfo,
    pub softdevice_version: u32,
    pub serial_number: u64,
    pub product_code: String,
}

impl Configuration {
    /// Serial number rendered the way the device labels it (lower-case hex)
    pub fn serial_hex(&self) -> String {
        format!("{:x}", self.serial_number)
    }
}

/// What a subscription is bound to on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    Battery,
    Status,
    Measurement(PayloadType),
}

/// Events published by a single device session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum DeviceEvent {
    ConnectionChanged(ConnectionState),
    Battery(BatteryEvent),
    Status(StatusEvent),
    Measurement(MeasurementFrame),
    Error(DotError),
}

/// Events published by the fleet registry, tagged with the originating device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FleetEvent {
    Discovered {
        id: DeviceId,
        local_name: Option<String>,
    },
    ConnectionChanged {
        id: DeviceId,
        state: ConnectionState,
    },
    Battery {
        id: DeviceId,
        battery: BatteryEvent,
    },
    Status {
        id: DeviceId,
        status: StatusEvent,
    },
    Measurement {
        id: DeviceId,
        frame: MeasurementFrame,
    },
    Error {
        id: Option<DeviceId>,
        error: DotError,
    },
}

impl FleetEvent {
    pub fn tagged(id: DeviceId, event: DeviceEvent) -> Self {
        match event {
            DeviceEvent::ConnectionChanged(state) => Self::ConnectionChanged { id, state },
            DeviceEvent::Battery(battery) => Self::Battery { id, battery },
            DeviceEvent::Status(status) => Self::Status { id, status },
            DeviceEvent::Measurement(frame) => Self::Measurement { id, frame },
            DeviceEvent::Error(error) => Self::Error {
                id: Some(id),
                error,
            },
        }
    }

    /// Device the event originated from, if any
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Self::Discovered { id, .. }
            | Self::ConnectionChanged { id, .. }
            | Self::Battery { id, .. }
            | Self::Status { id, .. }
            | Self::Measurement { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
        }
    }
}
