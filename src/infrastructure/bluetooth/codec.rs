//! Binary decoders for DOT notifications and configuration reads.
//!
//! All multi-byte values are little-endian. Every decoder checks the buffer
//! length up front and fails with [`DotError::Decode`] instead of reading
//! past the end.

use crate::domain::models::{
    BatteryEvent, Configuration, DeviceStatus, FirmwareDate, FirmwareInfo, MeasurementFrame,
    PayloadType, Quaternion, StatusEvent, Vector3,
};
use crate::error::{DotError, Result};
use crate::infrastructure::bluetooth::protocol::{
    self, BUTTON_CALLBACK_TIMESTAMP_OFFSET,
};

/// Magnetic field values are fixed point with 12 fractional bits
const MAG_SCALE: f32 = 4096.0;
/// Bits of the status word that carry information
const STATUS_MASK: u16 = 0x1FF;

/// Minimum device information buffer
pub const DEVICE_INFO_LEN: usize = 34;
/// Minimum device control buffer
pub const DEVICE_CONTROL_LEN: usize = 27;
pub const BATTERY_LEN: usize = 2;

const TAG_OFFSET: usize = 8;
const TAG_LEN: usize = 16;

/// Bounds-checked little-endian reads over a notification buffer
struct FrameReader<'a> {
    data: &'a [u8],
    context: &'a str,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8], context: &'a str) -> Self {
        Self { data, context }
    }

    fn require(&self, len: usize) -> Result<()> {
        if self.data.len() < len {
            return Err(DotError::short_buffer(self.context, len, self.data.len()));
        }
        Ok(())
    }

    fn bytes<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        self.data
            .get(offset..offset + N)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| DotError::short_buffer(self.context, offset + N, self.data.len()))
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.data
            .get(offset..offset + len)
            .ok_or_else(|| DotError::short_buffer(self.context, offset + len, self.data.len()))
    }

    fn u8(&self, offset: usize) -> Result<u8> {
        Ok(u8::from_le_bytes(self.bytes(offset)?))
    }

    fn i8(&self, offset: usize) -> Result<i8> {
        Ok(i8::from_le_bytes(self.bytes(offset)?))
    }

    fn i16(&self, offset: usize) -> Result<i16> {
        Ok(i16::from_le_bytes(self.bytes(offset)?))
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(offset)?))
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(offset)?))
    }

    fn u64(&self, offset: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(offset)?))
    }

    fn f32(&self, offset: usize) -> Result<f32> {
        Ok(f32::from_le_bytes(self.bytes(offset)?))
    }

    fn quaternion(&self, offset: usize) -> Result<Quaternion> {
        Ok(Quaternion {
            w: self.f32(offset)?,
            x: self.f32(offset + 4)?,
            y: self.f32(offset + 8)?,
            z: self.f32(offset + 12)?,
        })
    }

    fn vector(&self, offset: usize) -> Result<Vector3> {
        Ok(Vector3 {
            x: self.f32(offset)?,
            y: self.f32(offset + 4)?,
            z: self.f32(offset + 8)?,
        })
    }

    fn magnetic_field(&self, offset: usize) -> Result<Vector3> {
        Ok(Vector3 {
            x: self.i16(offset)? as f32 / MAG_SCALE,
            y: self.i16(offset + 2)? as f32 / MAG_SCALE,
            z: self.i16(offset + 4)? as f32 / MAG_SCALE,
        })
    }

    fn status(&self, offset: usize) -> Result<u32> {
        let raw = self.u16(offset)?;
        Ok(((raw & STATUS_MASK) as u32) << 8)
    }
}

/// Decode a measurement notification for the payload type it was subscribed with
pub fn decode_measurement(payload: PayloadType, data: &[u8]) -> Result<MeasurementFrame> {
    let reader = FrameReader::new(data, payload.name());
    reader.require(protocol::protocol_entry(payload).frame_len())?;

    let timestamp = reader.u32(0)?;

    let frame = match payload {
        PayloadType::ExtendedQuaternion => MeasurementFrame::ExtendedQuaternion {
            timestamp,
            quaternion: reader.quaternion(4)?,
            free_acceleration: reader.vector(20)?,
            status: reader.status(32)?,
            clip_count_acc: reader.i8(34)?,
            clip_count_gyr: reader.i8(35)?,
        },
        PayloadType::CompleteQuaternion => MeasurementFrame::CompleteQuaternion {
            timestamp,
            quaternion: reader.quaternion(4)?,
            free_acceleration: reader.vector(20)?,
        },
        PayloadType::ExtendedEuler => MeasurementFrame::ExtendedEuler {
            timestamp,
            euler: reader.vector(4)?,
            free_acceleration: reader.vector(16)?,
            status: reader.status(28)?,
            clip_count_acc: reader.i8(30)?,
            clip_count_gyr: reader.i8(31)?,
        },
        PayloadType::CompleteEuler => MeasurementFrame::CompleteEuler {
            timestamp,
            euler: reader.vector(4)?,
            free_acceleration: reader.vector(16)?,
        },
        PayloadType::OrientationQuaternion => MeasurementFrame::OrientationQuaternion {
            timestamp,
            quaternion: reader.quaternion(4)?,
        },
        PayloadType::OrientationEuler => MeasurementFrame::OrientationEuler {
            timestamp,
            euler: reader.vector(4)?,
        },
        PayloadType::FreeAcceleration => MeasurementFrame::FreeAcceleration {
            timestamp,
            free_acceleration: reader.vector(4)?,
        },
        PayloadType::DeltaQuantitiesWithMag => MeasurementFrame::DeltaQuantitiesWithMag {
            timestamp,
            dq: reader.quaternion(4)?,
            dv: reader.vector(20)?,
            magnetic_field: reader.magnetic_field(32)?,
        },
        PayloadType::DeltaQuantities => MeasurementFrame::DeltaQuantities {
            timestamp,
            dq: reader.quaternion(4)?,
            dv: reader.vector(20)?,
        },
        PayloadType::RateQuantitiesWithMag => MeasurementFrame::RateQuantitiesWithMag {
            timestamp,
            acceleration: reader.vector(4)?,
            angular_velocity: reader.vector(16)?,
            magnetic_field: reader.magnetic_field(28)?,
        },
        PayloadType::RateQuantities => MeasurementFrame::RateQuantities {
            timestamp,
            acceleration: reader.vector(4)?,
            angular_velocity: reader.vector(16)?,
        },
        PayloadType::CustomMode1 => MeasurementFrame::CustomMode1 {
            timestamp,
            euler: reader.vector(4)?,
            free_acceleration: reader.vector(16)?,
            angular_velocity: reader.vector(28)?,
        },
        PayloadType::CustomMode2 => MeasurementFrame::CustomMode2 {
            timestamp,
            euler: reader.vector(4)?,
            free_acceleration: reader.vector(16)?,
            magnetic_field: reader.magnetic_field(28)?,
        },
        PayloadType::CustomMode3 => MeasurementFrame::CustomMode3 {
            timestamp,
            quaternion: reader.quaternion(4)?,
            angular_velocity: reader.vector(20)?,
        },
        PayloadType::CustomMode5 => MeasurementFrame::CustomMode5 {
            timestamp,
            quaternion: reader.quaternion(4)?,
            acceleration: reader.vector(20)?,
            angular_velocity: reader.vector(32)?,
        },
    };

    Ok(frame)
}

/// Battery notification: `[level %, charging]`
pub fn decode_battery(data: &[u8]) -> Result<BatteryEvent> {
    let reader = FrameReader::new(data, "battery");
    reader.require(BATTERY_LEN)?;
    Ok(BatteryEvent {
        level: reader.u8(0)?,
        charging: reader.u8(1)? != 0,
    })
}

/// Device report notification: status code, plus a timestamp for button callbacks
pub fn decode_status(data: &[u8]) -> Result<StatusEvent> {
    let reader = FrameReader::new(data, "device report");
    reader.require(1)?;

    let code = reader.u8(0)?;
    let status = protocol::status_from_code(code).ok_or_else(|| DotError::Decode {
        context: "device report".to_string(),
        reason: format!("unknown status code {:#04x}", code),
    })?;

    let timestamp = match status {
        DeviceStatus::ButtonCallback => reader.u32(BUTTON_CALLBACK_TIMESTAMP_OFFSET).ok(),
        _ => None,
    };

    Ok(StatusEvent { status, timestamp })
}

/// Decode the device information and device control reads into a configuration
///
/// # Device information (34 bytes)
///
/// ```text
/// [0-5]   : MAC address, least significant byte first
/// [6-8]   : Firmware version major, minor, patch
/// [9-15]  : Firmware build date (i16 year, month, day, hour, minute, second)
/// [16-19] : SoftDevice version (u32)
/// [20-27] : Serial number (u64)
/// [28-33] : Product code (ASCII)
/// ```
///
/// # Device control (27 bytes)
///
/// ```text
/// [8-23]  : Tag (UTF-8, NUL padded)
/// [24]    : Output rate (Hz)
/// [26]    : Filter profile index
/// ```
pub fn decode_configuration(information: &[u8], control: &[u8]) -> Result<Configuration> {
    let info = FrameReader::new(information, "device information");
    info.require(DEVICE_INFO_LEN)?;
    let ctrl = FrameReader::new(control, "device control");
    ctrl.require(DEVICE_CONTROL_LEN)?;

    Ok(Configuration {
        tag: read_tag(&ctrl)?,
        output_rate: ctrl.u8(24)?,
        filter_index: ctrl.u8(26)?,
        mac_address: format_mac(&info.bytes::<6>(0)?),
        firmware: FirmwareInfo {
            version: format!("{}.{}.{}", info.u8(6)?, info.u8(7)?, info.u8(8)?),
            date: FirmwareDate {
                year: info.i16(9)?,
                month: info.i8(11)?,
                day: info.i8(12)?,
                hour: info.i8(13)?,
                minute: info.i8(14)?,
                second: info.i8(15)?,
            },
        },
        softdevice_version: info.u32(16)?,
        serial_number: info.u64(20)?,
        product_code: String::from_utf8_lossy(info.slice(28, 6)?)
            .trim_end_matches('\0')
            .to_string(),
    })
}

/// Render a MAC address received least significant byte first
pub fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .rev()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn read_tag(reader: &FrameReader<'_>) -> Result<String> {
    let raw = reader.slice(TAG_OFFSET, TAG_LEN)?;
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::protocol_entry;
    use crate::infrastructure::bluetooth::sim::{self, SyntheticSample};

    fn vec3(x: f32, y: f32, z: f32) -> Vector3 {
        Vector3 { x, y, z }
    }

    fn sample() -> SyntheticSample {
        SyntheticSample {
            timestamp: 123_456,
            quaternion: Quaternion {
                w: 1.0,
                x: 0.25,
                y: -0.5,
                z: 0.75,
            },
            euler: vec3(10.0, -20.0, 30.0),
            free_acceleration: vec3(0.5, -0.25, 0.125),
            acceleration: vec3(1.5, -2.5, 9.81),
            angular_velocity: vec3(-45.0, 90.0, 180.0),
            dv: vec3(0.01, 0.02, -0.03),
            magnetic_raw: [4096, -4096, 2048],
            status_raw: 0x03FF,
            clip_count_acc: -3,
            clip_count_gyr: 7,
        }
    }

    /// Frame the decoder must produce for `sample()`
    fn expected_frame(payload: PayloadType) -> MeasurementFrame {
        let s = sample();
        let timestamp = s.timestamp;
        let magnetic_field = vec3(1.0, -1.0, 0.5);
        let status = (0x03FF & 0x1FF) << 8;
        match payload {
            PayloadType::ExtendedQuaternion => MeasurementFrame::ExtendedQuaternion {
                timestamp,
                quaternion: s.quaternion,
                free_acceleration: s.free_acceleration,
                status,
                clip_count_acc: -3,
                clip_count_gyr: 7,
            },
            PayloadType::CompleteQuaternion => MeasurementFrame::CompleteQuaternion {
                timestamp,
                quaternion: s.quaternion,
                free_acceleration: s.free_acceleration,
            },
            PayloadType::ExtendedEuler => MeasurementFrame::ExtendedEuler {
                timestamp,
                euler: s.euler,
                free_acceleration: s.free_acceleration,
                status,
                clip_count_acc: -3,
                clip_count_gyr: 7,
            },
            PayloadType::CompleteEuler => MeasurementFrame::CompleteEuler {
                timestamp,
                euler: s.euler,
                free_acceleration: s.free_acceleration,
            },
            PayloadType::OrientationQuaternion => MeasurementFrame::OrientationQuaternion {
                timestamp,
                quaternion: s.quaternion,
            },
            PayloadType::OrientationEuler => MeasurementFrame::OrientationEuler {
                timestamp,
                euler: s.euler,
            },
            PayloadType::FreeAcceleration => MeasurementFrame::FreeAcceleration {
                timestamp,
                free_acceleration: s.free_acceleration,
            },
            PayloadType::DeltaQuantitiesWithMag => MeasurementFrame::DeltaQuantitiesWithMag {
                timestamp,
                dq: s.quaternion,
                dv: s.dv,
                magnetic_field,
            },
            PayloadType::DeltaQuantities => MeasurementFrame::DeltaQuantities {
                timestamp,
                dq: s.quaternion,
                dv: s.dv,
            },
            PayloadType::RateQuantitiesWithMag => MeasurementFrame::RateQuantitiesWithMag {
                timestamp,
                acceleration: s.acceleration,
                angular_velocity: s.angular_velocity,
                magnetic_field,
            },
            PayloadType::RateQuantities => MeasurementFrame::RateQuantities {
                timestamp,
                acceleration: s.acceleration,
                angular_velocity: s.angular_velocity,
            },
            PayloadType::CustomMode1 => MeasurementFrame::CustomMode1 {
                timestamp,
                euler: s.euler,
                free_acceleration: s.free_acceleration,
                angular_velocity: s.angular_velocity,
            },
            PayloadType::CustomMode2 => MeasurementFrame::CustomMode2 {
                timestamp,
                euler: s.euler,
                free_acceleration: s.free_acceleration,
                magnetic_field,
            },
            PayloadType::CustomMode3 => MeasurementFrame::CustomMode3 {
                timestamp,
                quaternion: s.quaternion,
                angular_velocity: s.angular_velocity,
            },
            PayloadType::CustomMode5 => MeasurementFrame::CustomMode5 {
                timestamp,
                quaternion: s.quaternion,
                acceleration: s.acceleration,
                angular_velocity: s.angular_velocity,
            },
        }
    }

    #[test]
    fn test_every_payload_decodes_every_field() {
        let sample = sample();
        for payload in PayloadType::ALL {
            let data = sim::encode_frame(payload, &sample);
            assert_eq!(data.len(), protocol_entry(payload).frame_len(), "{}", payload);

            let frame = decode_measurement(payload, &data).unwrap();
            assert_eq!(frame, expected_frame(payload), "{}", payload);
        }
    }

    #[test]
    fn test_field_offsets_match_layout_table() {
        // hand-built frame, independent of the encoder
        let mut data = vec![0u8; 40];
        data[0..4].copy_from_slice(&77u32.to_le_bytes());
        for (i, v) in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0].iter().enumerate() {
            let at = 4 + i * 4;
            data[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            decode_measurement(PayloadType::CustomMode1, &data).unwrap(),
            MeasurementFrame::CustomMode1 {
                timestamp: 77,
                euler: vec3(1.0, 2.0, 3.0),
                free_acceleration: vec3(4.0, 5.0, 6.0),
                angular_velocity: vec3(7.0, 8.0, 9.0),
            }
        );
    }

    #[test]
    fn test_every_payload_rejects_short_buffer() {
        let sample = sample();
        for payload in PayloadType::ALL {
            let data = sim::encode_frame(payload, &sample);
            let err = decode_measurement(payload, &data[..data.len() - 1]).unwrap_err();
            assert!(matches!(err, DotError::Decode { .. }), "{}", payload);
        }
        assert!(decode_measurement(PayloadType::FreeAcceleration, &[]).is_err());
    }

    #[test]
    fn test_longer_buffer_is_accepted() {
        let mut data = sim::encode_frame(PayloadType::OrientationEuler, &sample());
        data.extend_from_slice(&[0xAA; 4]);
        assert!(decode_measurement(PayloadType::OrientationEuler, &data).is_ok());
    }

    #[test]
    fn test_magnetic_field_fixed_point() {
        let data = sim::encode_frame(PayloadType::RateQuantitiesWithMag, &sample());
        match decode_measurement(PayloadType::RateQuantitiesWithMag, &data).unwrap() {
            MeasurementFrame::RateQuantitiesWithMag { magnetic_field, .. } => {
                assert_eq!(magnetic_field.x, 1.0);
                assert_eq!(magnetic_field.y, -1.0);
                assert_eq!(magnetic_field.z, 0.5);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_status_word_mask_and_shift() {
        let mut data = vec![0u8; 32];
        data[28..30].copy_from_slice(&0x03FFu16.to_le_bytes());
        match decode_measurement(PayloadType::ExtendedEuler, &data).unwrap() {
            MeasurementFrame::ExtendedEuler { status, .. } => {
                assert_eq!(status, (0x03FF & 0x1FF) << 8);
                assert_eq!(status, 0x1FF00);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_mac_address_is_reversed() {
        assert_eq!(
            format_mac(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
            "06:05:04:03:02:01"
        );
        assert_eq!(format_mac(&[0xd4, 0x22, 0xcd, 0x00, 0x0a, 0xff]), "ff:0a:00:cd:22:d4");
    }

    #[test]
    fn test_configuration_decode() {
        let information = sim::device_information([0x01, 0x02, 0x03, 0x04, 0x05, 0x06], 0xd422cd00_1a2b);
        let control = sim::device_control("left wrist", 60, 1);

        let config = decode_configuration(&information, &control).unwrap();
        assert_eq!(config.tag, "left wrist");
        assert_eq!(config.output_rate, 60);
        assert_eq!(config.filter_index, 1);
        assert_eq!(config.mac_address, "06:05:04:03:02:01");
        assert_eq!(config.firmware.version, "2.0.0");
        assert_eq!(config.firmware.date.to_string(), "2021-06-15T10:30:00");
        assert_eq!(config.softdevice_version, 7_002_000);
        assert_eq!(config.serial_hex(), "d422cd001a2b");
        assert_eq!(config.product_code, "XS-T01");
    }

    #[test]
    fn test_configuration_full_length_tag() {
        let information = sim::device_information([0; 6], 1);
        let control = sim::device_control("0123456789abcdef", 30, 0);
        let config = decode_configuration(&information, &control).unwrap();
        assert_eq!(config.tag, "0123456789abcdef");
    }

    #[test]
    fn test_configuration_short_buffers() {
        let information = sim::device_information([0; 6], 1);
        let control = sim::device_control("tag", 60, 0);
        assert!(matches!(
            decode_configuration(&information[..33], &control),
            Err(DotError::Decode { .. })
        ));
        assert!(matches!(
            decode_configuration(&information, &control[..26]),
            Err(DotError::Decode { .. })
        ));
    }

    #[test]
    fn test_battery_decode() {
        assert_eq!(
            decode_battery(&[87, 1]).unwrap(),
            BatteryEvent {
                level: 87,
                charging: true
            }
        );
        assert_eq!(
            decode_battery(&[12, 0]).unwrap(),
            BatteryEvent {
                level: 12,
                charging: false
            }
        );
        assert!(decode_battery(&[50]).is_err());
    }

    #[test]
    fn test_status_decode() {
        assert_eq!(
            decode_status(&[0x01]).unwrap(),
            StatusEvent {
                status: DeviceStatus::PowerOff,
                timestamp: None
            }
        );

        let mut button = vec![0x34, 0x04];
        button.extend_from_slice(&5_000u32.to_le_bytes());
        assert_eq!(
            decode_status(&button).unwrap(),
            StatusEvent {
                status: DeviceStatus::ButtonCallback,
                timestamp: Some(5_000)
            }
        );

        // button callback without a timestamp still decodes
        assert_eq!(decode_status(&[0x34]).unwrap().timestamp, None);

        assert!(decode_status(&[0x7F]).is_err());
        assert!(decode_status(&[]).is_err());
    }
}
