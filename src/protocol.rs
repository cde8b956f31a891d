use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::{Result, RigError},
    types::{ControlCommand, TelemetryField, TelemetrySample},
};

/// Encodes control commands and decodes telemetry notifications
///
/// The session only moves opaque bytes; implementations own the wire format.
pub trait ControlCodec: Send + Sync {
    /// Bytes written once after the link comes up, if the peripheral needs them
    fn control_preamble(&self) -> Option<Bytes> {
        None
    }

    /// Encode a command for the control point
    ///
    /// # Errors
    ///
    /// Returns [`RigError::OutOfRange`] if the value cannot be represented.
    fn encode(&self, command: &ControlCommand) -> Result<Bytes>;

    /// Decode one notification into a telemetry sample
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Protocol`] if the payload is malformed.
    fn decode(&self, notification: &[u8]) -> Result<TelemetrySample>;
}

/// Fitness Machine control point op codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Ask the machine for control; required before any other write
    RequestControl = 0x00,
    /// Reset the machine's targets
    Reset = 0x01,
    /// Target resistance level
    SetTargetResistance = 0x04,
    /// Target power in watts
    SetTargetPower = 0x05,
    /// Start or resume the session
    StartOrResume = 0x07,
    /// Stop or pause the session
    StopOrPause = 0x08,
    /// Wind speed, grade, rolling and wind resistance coefficients
    SetIndoorBikeSimulation = 0x11,
    /// Prefix of every control point response
    ResponseCode = 0x80,
}

impl OpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x04 => Some(Self::SetTargetResistance),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x11 => Some(Self::SetIndoorBikeSimulation),
            0x80 => Some(Self::ResponseCode),
            _ => None,
        }
    }
}

/// Result codes carried in a control point response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// Request accepted
    Success = 0x01,
    /// Op code not supported by the machine
    NotSupported = 0x02,
    /// Parameter out of the machine's range
    InvalidParameter = 0x03,
    /// Machine could not execute the request
    OperationFailed = 0x04,
    /// Control was not granted
    ControlNotPermitted = 0x05,
}

impl ResultCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Success),
            0x02 => Some(Self::NotSupported),
            0x03 => Some(Self::InvalidParameter),
            0x04 => Some(Self::OperationFailed),
            0x05 => Some(Self::ControlNotPermitted),
            _ => None,
        }
    }
}

/// Rolling resistance coefficient sent with simulation commands (x 0.0001)
const SIMULATION_CRR: u8 = 40;
/// Wind resistance coefficient sent with simulation commands (x 0.01 kg/m)
const SIMULATION_CW: u8 = 51;

// Indoor Bike Data flag bits
const FLAG_MORE_DATA: u16 = 1 << 0;
const FLAG_AVERAGE_SPEED: u16 = 1 << 1;
const FLAG_CADENCE: u16 = 1 << 2;
const FLAG_AVERAGE_CADENCE: u16 = 1 << 3;
const FLAG_TOTAL_DISTANCE: u16 = 1 << 4;
const FLAG_RESISTANCE: u16 = 1 << 5;
const FLAG_POWER: u16 = 1 << 6;
const FLAG_AVERAGE_POWER: u16 = 1 << 7;
const FLAG_ENERGY: u16 = 1 << 8;
const FLAG_HEART_RATE: u16 = 1 << 9;
const FLAG_METABOLIC_EQUIVALENT: u16 = 1 << 10;
const FLAG_ELAPSED_TIME: u16 = 1 << 11;

/// Codec for the Bluetooth Fitness Machine Service (indoor bike)
#[derive(Debug, Clone, Copy, Default)]
pub struct FtmsCodec;

impl ControlCodec for FtmsCodec {
    fn control_preamble(&self) -> Option<Bytes> {
        Some(Bytes::from_static(&[OpCode::RequestControl as u8]))
    }

    fn encode(&self, command: &ControlCommand) -> Result<Bytes> {
        command.validate()?;

        let mut buf = BytesMut::with_capacity(7);
        match *command {
            ControlCommand::Percentage(level) => {
                buf.put_u8(OpCode::SetTargetResistance as u8);
                buf.put_u8(level);
            }
            ControlCommand::PowerWatts(watts) => {
                buf.put_u8(OpCode::SetTargetPower as u8);
                buf.put_i16_le(to_i16(i64::from(watts))?);
            }
            ControlCommand::SimulationGrade(grade) => {
                buf.put_u8(OpCode::SetIndoorBikeSimulation as u8);
                buf.put_i16_le(0);
                buf.put_i16_le(to_i16(i64::from(grade) * 100)?);
                buf.put_u8(SIMULATION_CRR);
                buf.put_u8(SIMULATION_CW);
            }
        }
        Ok(buf.freeze())
    }

    fn decode(&self, notification: &[u8]) -> Result<TelemetrySample> {
        decode_indoor_bike_data(notification)
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_i16(value: i64) -> Result<i16> {
    i16::try_from(value).map_err(|_| RigError::OutOfRange {
        value: value as f64,
        min: f64::from(i16::MIN),
        max: f64::from(i16::MAX),
    })
}

fn take<'a>(buf: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    if buf.remaining() < len {
        return Err(RigError::Protocol(format!(
            "Indoor bike data truncated at {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Parse an Indoor Bike Data notification.
///
/// Only fields flagged as present end up in the sample.
///
/// # Errors
///
/// Returns [`RigError::Protocol`] if the payload is shorter than its flags
/// announce.
pub fn decode_indoor_bike_data(data: &[u8]) -> Result<TelemetrySample> {
    let mut buf = data;
    let flags = take(&mut buf, 2, "flags")?.get_u16_le();
    let mut sample = TelemetrySample::new();

    // bit 0 inverted: instantaneous speed is present when "more data" is clear
    if flags & FLAG_MORE_DATA == 0 {
        let speed = take(&mut buf, 2, "speed")?.get_u16_le();
        sample.set(TelemetryField::Speed, f64::from(speed) * 0.01);
    }
    if flags & FLAG_AVERAGE_SPEED != 0 {
        take(&mut buf, 2, "average speed")?;
    }
    if flags & FLAG_CADENCE != 0 {
        let cadence = take(&mut buf, 2, "cadence")?.get_u16_le();
        sample.set(TelemetryField::Cadence, f64::from(cadence) * 0.5);
    }
    if flags & FLAG_AVERAGE_CADENCE != 0 {
        take(&mut buf, 2, "average cadence")?;
    }
    if flags & FLAG_TOTAL_DISTANCE != 0 {
        let distance = take(&mut buf, 3, "total distance")?.get_uint_le(3);
        #[allow(clippy::cast_precision_loss)]
        sample.set(TelemetryField::TotalDistance, distance as f64);
    }
    if flags & FLAG_RESISTANCE != 0 {
        let resistance = take(&mut buf, 2, "resistance")?.get_i16_le();
        sample.set(TelemetryField::Resistance, f64::from(resistance));
    }
    if flags & FLAG_POWER != 0 {
        let power = take(&mut buf, 2, "power")?.get_i16_le();
        sample.set(TelemetryField::Power, f64::from(power));
    }
    if flags & FLAG_AVERAGE_POWER != 0 {
        take(&mut buf, 2, "average power")?;
    }
    if flags & FLAG_ENERGY != 0 {
        let mut energy = take(&mut buf, 5, "expended energy")?;
        sample.set(TelemetryField::TotalEnergy, f64::from(energy.get_u16_le()));
    }
    if flags & FLAG_HEART_RATE != 0 {
        let heart_rate = take(&mut buf, 1, "heart rate")?.get_u8();
        sample.set(TelemetryField::HeartRate, f64::from(heart_rate));
    }
    if flags & FLAG_METABOLIC_EQUIVALENT != 0 {
        take(&mut buf, 1, "metabolic equivalent")?;
    }
    if flags & FLAG_ELAPSED_TIME != 0 {
        let elapsed = take(&mut buf, 2, "elapsed time")?.get_u16_le();
        sample.set(TelemetryField::ElapsedTime, f64::from(elapsed));
    }

    Ok(sample)
}

/// Check a control point response (`0x80`, request op code, result code).
///
/// # Errors
///
/// Returns [`RigError::Protocol`] for a malformed response and
/// [`RigError::DeviceRejected`] when the machine reports anything but success.
pub fn parse_control_response(data: &[u8]) -> Result<OpCode> {
    let [response, request, result, ..] = *data else {
        return Err(RigError::Protocol(format!(
            "Control point response too short: {data:02X?}"
        )));
    };

    if OpCode::from_u8(response) != Some(OpCode::ResponseCode) {
        return Err(RigError::Protocol(format!(
            "Not a control point response: {response:02X}"
        )));
    }

    let request = OpCode::from_u8(request)
        .ok_or_else(|| RigError::Protocol(format!("Unknown request op code {request:02X}")))?;

    match ResultCode::from_u8(result) {
        Some(ResultCode::Success) => Ok(request),
        Some(code) => Err(RigError::DeviceRejected {
            reason: format!("{request:?} answered {code:?}"),
        }),
        None => Err(RigError::DeviceRejected {
            reason: format!("{request:?} answered unknown result {result:02X}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resistance_encoding() {
        let bytes = FtmsCodec.encode(&ControlCommand::Percentage(150)).unwrap();
        assert_eq!(bytes.as_ref(), &[0x04, 150]);
    }

    #[test]
    fn test_power_encoding() {
        let bytes = FtmsCodec.encode(&ControlCommand::PowerWatts(250)).unwrap();
        assert_eq!(bytes.as_ref(), &[0x05, 0xFA, 0x00]);
    }

    #[test]
    fn test_simulation_encoding() {
        let bytes = FtmsCodec
            .encode(&ControlCommand::SimulationGrade(-3))
            .unwrap();
        // grade -300 (0.01 %) little endian
        assert_eq!(bytes.as_ref(), &[0x11, 0x00, 0x00, 0xD4, 0xFE, 40, 51]);
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        assert!(matches!(
            FtmsCodec.encode(&ControlCommand::Percentage(220)),
            Err(RigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_preamble_requests_control() {
        assert_eq!(FtmsCodec.control_preamble().unwrap().as_ref(), &[0x00]);
    }

    #[test]
    fn test_decode_speed_cadence_power() {
        // flags: cadence + power; speed present because bit 0 is clear
        let data = [0x44, 0x00, 0xC4, 0x09, 0xA0, 0x00, 0xC8, 0x00];
        let sample = decode_indoor_bike_data(&data).unwrap();

        assert!((sample.get(TelemetryField::Speed).unwrap() - 25.0).abs() < 1e-9);
        assert!((sample.get(TelemetryField::Cadence).unwrap() - 80.0).abs() < 1e-9);
        assert!((sample.get(TelemetryField::Power).unwrap() - 200.0).abs() < 1e-9);
        assert_eq!(sample.get(TelemetryField::Resistance), None);
        assert_eq!(sample.get(TelemetryField::ElapsedTime), None);
    }

    #[test]
    fn test_decode_distance_resistance_elapsed() {
        // more data set (no speed), distance + resistance + elapsed time
        let flags: u16 = FLAG_MORE_DATA | FLAG_TOTAL_DISTANCE | FLAG_RESISTANCE | FLAG_ELAPSED_TIME;
        let mut data = flags.to_le_bytes().to_vec();
        data.extend_from_slice(&[0x10, 0x27, 0x00]); // 10000 m
        data.extend_from_slice(&[0x32, 0x00]); // resistance 50
        data.extend_from_slice(&[0x2C, 0x01]); // 300 s

        let sample = decode_indoor_bike_data(&data).unwrap();
        assert_eq!(sample.get(TelemetryField::Speed), None);
        assert_eq!(sample.get(TelemetryField::TotalDistance), Some(10_000.0));
        assert_eq!(sample.get(TelemetryField::Resistance), Some(50.0));
        assert_eq!(sample.get(TelemetryField::ElapsedTime), Some(300.0));
    }

    #[test]
    fn test_decode_truncated() {
        let data = [0x40, 0x00, 0x10];
        assert!(matches!(
            decode_indoor_bike_data(&data),
            Err(RigError::Protocol(_))
        ));
        assert!(decode_indoor_bike_data(&[0x00]).is_err());
    }

    #[test]
    fn test_control_response() {
        assert_eq!(
            parse_control_response(&[0x80, 0x05, 0x01]).unwrap(),
            OpCode::SetTargetPower
        );
        assert!(matches!(
            parse_control_response(&[0x80, 0x04, 0x05]),
            Err(RigError::DeviceRejected { .. })
        ));
        assert!(matches!(
            parse_control_response(&[0x80]),
            Err(RigError::Protocol(_))
        ));
        assert!(matches!(
            parse_control_response(&[0x12, 0x04, 0x01]),
            Err(RigError::Protocol(_))
        ));
    }
}
