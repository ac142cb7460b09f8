use crate::error::{ProtocolError, ScopeError};
use crate::types::{Axis, ExecutionStatus, HomeOrZero, IlluminationSource};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

// Protocol constants
pub const MSG_LENGTH: usize = 24;
pub const CMD_LENGTH: usize = 8;
pub const N_BYTES_POS: usize = 4;

pub const BIT_POS_JOYSTICK_BUTTON: u8 = 0;
pub const BIT_POS_SWITCH: u8 = 1;

/// Command codes as understood by the controller firmware.
pub mod cmd {
    pub const MOVE_X: u8 = 0;
    pub const MOVE_Y: u8 = 1;
    pub const MOVE_Z: u8 = 2;
    pub const MOVE_THETA: u8 = 3;
    pub const HOME_OR_ZERO: u8 = 5;
    pub const MOVETO_X: u8 = 6;
    pub const MOVETO_Y: u8 = 7;
    pub const MOVETO_Z: u8 = 8;
    pub const TURN_ON_ILLUMINATION: u8 = 10;
    pub const TURN_OFF_ILLUMINATION: u8 = 11;
    pub const SET_ILLUMINATION: u8 = 12;
    pub const SET_ILLUMINATION_LED_MATRIX: u8 = 13;
    pub const ACK_JOYSTICK_BUTTON_PRESSED: u8 = 14;
}

/// Illumination level as the 16-bit DAC value sent to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IlluminationIntensity(u16);

impl IlluminationIntensity {
    pub const MAX_PERCENT: f64 = 100.0;

    /// Intensity in percent of full scale, 0 to 100 inclusive
    pub fn from_percent(percent: f64) -> Result<Self, ScopeError> {
        if !(0.0..=Self::MAX_PERCENT).contains(&percent) {
            return Err(ScopeError::InvalidPayload(format!(
                "illumination intensity must be within 0..=100 %, got {percent}"
            )));
        }
        Ok(Self((percent / Self::MAX_PERCENT * u16::MAX as f64).round() as u16))
    }

    pub fn from_level(level: u16) -> Self {
        Self(level)
    }

    pub fn level(self) -> u16 {
        self.0
    }

    pub fn percent(self) -> f64 {
        self.0 as f64 / u16::MAX as f64 * Self::MAX_PERCENT
    }
}

/// Per-color drive of the LED matrix, 0 to 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RgbWeights {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbWeights {
    /// Scale color factors (0..=1) by an intensity percentage
    pub fn from_factors(percent: f64, factors: [f64; 3]) -> Result<Self, ScopeError> {
        if !(0.0..=IlluminationIntensity::MAX_PERCENT).contains(&percent) {
            return Err(ScopeError::InvalidPayload(format!(
                "illumination intensity must be within 0..=100 %, got {percent}"
            )));
        }
        let scale = |factor: f64| -> u8 {
            (percent / 100.0 * factor * 255.0).round().clamp(0.0, 255.0) as u8
        };
        Ok(Self {
            r: scale(factors[0]),
            g: scale(factors[1]),
            b: scale(factors[2]),
        })
    }
}

/// A request to the microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    MoveRelative { axis: Axis, steps: i32 },
    MoveAbsolute { axis: Axis, target: i32 },
    HomeOrZero { axis: Axis, mode: HomeOrZero },
    SetIllumination {
        source: IlluminationSource,
        intensity: IlluminationIntensity,
    },
    SetIlluminationLedMatrix {
        source: IlluminationSource,
        rgb: RgbWeights,
    },
    TurnOnIllumination,
    TurnOffIllumination,
    AckJoystickButton,
}

impl Command {
    /// Axis addressed by the command, if any
    pub fn axis(&self) -> Option<Axis> {
        match self {
            Command::MoveRelative { axis, .. }
            | Command::MoveAbsolute { axis, .. }
            | Command::HomeOrZero { axis, .. } => Some(*axis),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Command::MoveRelative { axis, .. } => match axis {
                Axis::X => cmd::MOVE_X,
                Axis::Y => cmd::MOVE_Y,
                Axis::Z => cmd::MOVE_Z,
                // rejected by validate()
                Axis::Theta | Axis::Xy => cmd::MOVE_THETA,
            },
            Command::MoveAbsolute { axis, .. } => match axis {
                Axis::X => cmd::MOVETO_X,
                Axis::Y => cmd::MOVETO_Y,
                _ => cmd::MOVETO_Z,
            },
            Command::HomeOrZero { .. } => cmd::HOME_OR_ZERO,
            Command::SetIllumination { .. } => cmd::SET_ILLUMINATION,
            Command::SetIlluminationLedMatrix { .. } => cmd::SET_ILLUMINATION_LED_MATRIX,
            Command::TurnOnIllumination => cmd::TURN_ON_ILLUMINATION,
            Command::TurnOffIllumination => cmd::TURN_OFF_ILLUMINATION,
            Command::AckJoystickButton => cmd::ACK_JOYSTICK_BUTTON_PRESSED,
        }
    }

    /// Reject payloads the wire format cannot carry
    pub fn validate(&self) -> Result<(), ScopeError> {
        match self {
            Command::MoveRelative { axis: Axis::Xy, .. } => Err(ScopeError::InvalidPayload(
                "relative moves address a single axis".to_string(),
            )),
            Command::MoveAbsolute { axis, .. } if !matches!(axis, Axis::X | Axis::Y | Axis::Z) => {
                Err(ScopeError::InvalidPayload(format!(
                    "absolute moves are not supported on axis {axis}"
                )))
            }
            Command::HomeOrZero { axis: Axis::Theta, .. } => Err(ScopeError::InvalidPayload(
                "home/zero is not supported on axis Theta".to_string(),
            )),
            Command::SetIlluminationLedMatrix { source, .. } if !source.is_led_matrix() => {
                Err(ScopeError::InvalidPayload(format!(
                    "{source:?} is not an LED matrix pattern"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Wrapping byte sum used as frame checksum
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn verify_frame(frame: &[u8], expected_len: usize) -> Result<&[u8], ProtocolError> {
    if frame.len() < expected_len {
        return Err(ProtocolError::ShortMessage {
            expected: expected_len,
            actual: frame.len(),
        });
    }
    let frame = &frame[..expected_len];
    let (body, tail) = frame.split_at(expected_len - 1);
    let computed = checksum(body);
    if tail[0] != computed {
        return Err(ProtocolError::ChecksumMismatch {
            received: tail[0],
            computed,
        });
    }
    Ok(body)
}

/// Encode a command into a request frame
pub fn encode(command: &Command) -> Result<[u8; CMD_LENGTH], ScopeError> {
    command.validate()?;

    let mut frame = [0u8; CMD_LENGTH];
    frame[0] = command.code();
    {
        let mut payload = Cursor::new(&mut frame[1..CMD_LENGTH - 1]);
        match command {
            Command::MoveRelative { steps: value, .. }
            | Command::MoveAbsolute { target: value, .. } => {
                payload.write_i32::<BigEndian>(*value)?;
            }
            Command::HomeOrZero { axis, mode } => {
                payload.write_u8(axis.code())?;
                payload.write_u8(mode.code())?;
            }
            Command::SetIllumination { source, intensity } => {
                payload.write_u8(source.code())?;
                payload.write_u16::<BigEndian>(intensity.level())?;
            }
            Command::SetIlluminationLedMatrix { source, rgb } => {
                payload.write_u8(source.code())?;
                payload.write_u8(rgb.r)?;
                payload.write_u8(rgb.g)?;
                payload.write_u8(rgb.b)?;
            }
            Command::TurnOnIllumination
            | Command::TurnOffIllumination
            | Command::AckJoystickButton => {}
        }
    }
    frame[CMD_LENGTH - 1] = checksum(&frame[..CMD_LENGTH - 1]);
    Ok(frame)
}

fn short_payload(_: std::io::Error) -> ProtocolError {
    ProtocolError::ShortMessage {
        expected: CMD_LENGTH,
        actual: 0,
    }
}

/// Decode a request frame back into a command
pub fn decode_command(frame: &[u8]) -> Result<Command, ProtocolError> {
    let body = verify_frame(frame, CMD_LENGTH)?;
    let code = body[0];
    let mut payload = Cursor::new(&body[1..]);

    let move_axis = |code: u8| match code {
        cmd::MOVE_X | cmd::MOVETO_X => Axis::X,
        cmd::MOVE_Y | cmd::MOVETO_Y => Axis::Y,
        cmd::MOVE_Z | cmd::MOVETO_Z => Axis::Z,
        _ => Axis::Theta,
    };

    let command = match code {
        cmd::MOVE_X | cmd::MOVE_Y | cmd::MOVE_Z | cmd::MOVE_THETA => Command::MoveRelative {
            axis: move_axis(code),
            steps: payload.read_i32::<BigEndian>().map_err(short_payload)?,
        },
        cmd::MOVETO_X | cmd::MOVETO_Y | cmd::MOVETO_Z => Command::MoveAbsolute {
            axis: move_axis(code),
            target: payload.read_i32::<BigEndian>().map_err(short_payload)?,
        },
        cmd::HOME_OR_ZERO => {
            let axis_code = payload.read_u8().map_err(short_payload)?;
            let mode_code = payload.read_u8().map_err(short_payload)?;
            Command::HomeOrZero {
                axis: Axis::from_code(axis_code).ok_or(ProtocolError::UnknownCommandCode(code))?,
                mode: HomeOrZero::from_code(mode_code)
                    .ok_or(ProtocolError::UnknownCommandCode(code))?,
            }
        }
        cmd::SET_ILLUMINATION => {
            let source = payload.read_u8().map_err(short_payload)?;
            Command::SetIllumination {
                source: IlluminationSource::from_code(source)
                    .ok_or(ProtocolError::UnknownCommandCode(code))?,
                intensity: IlluminationIntensity::from_level(
                    payload.read_u16::<BigEndian>().map_err(short_payload)?,
                ),
            }
        }
        cmd::SET_ILLUMINATION_LED_MATRIX => {
            let source = payload.read_u8().map_err(short_payload)?;
            Command::SetIlluminationLedMatrix {
                source: IlluminationSource::from_code(source)
                    .ok_or(ProtocolError::UnknownCommandCode(code))?,
                rgb: RgbWeights {
                    r: payload.read_u8().map_err(short_payload)?,
                    g: payload.read_u8().map_err(short_payload)?,
                    b: payload.read_u8().map_err(short_payload)?,
                },
            }
        }
        cmd::TURN_ON_ILLUMINATION => Command::TurnOnIllumination,
        cmd::TURN_OFF_ILLUMINATION => Command::TurnOffIllumination,
        cmd::ACK_JOYSTICK_BUTTON_PRESSED => Command::AckJoystickButton,
        other => return Err(ProtocolError::UnknownCommandCode(other)),
    };
    Ok(command)
}

/// Status frame sent by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Code of the command the status refers to
    pub command_code: u8,
    pub status: ExecutionStatus,
    /// Raw X, Y, Z, Theta positions (microsteps or encoder ticks)
    pub positions: [i32; 4],
    pub joystick_button_pressed: bool,
    pub switch_active: bool,
}

impl ExecutionReport {
    pub fn new(command_code: u8, status: ExecutionStatus, positions: [i32; 4]) -> Self {
        Self {
            command_code,
            status,
            positions,
            joystick_button_pressed: false,
            switch_active: false,
        }
    }

    pub fn encode(&self) -> [u8; MSG_LENGTH] {
        let mut frame = [0u8; MSG_LENGTH];
        frame[0] = self.command_code;
        frame[1] = self.status.code();
        for (i, pos) in self.positions.iter().enumerate() {
            let start = 2 + i * N_BYTES_POS;
            frame[start..start + N_BYTES_POS].copy_from_slice(&pos.to_be_bytes());
        }
        let mut flags = 0u8;
        if self.joystick_button_pressed {
            flags |= 1 << BIT_POS_JOYSTICK_BUTTON;
        }
        if self.switch_active {
            flags |= 1 << BIT_POS_SWITCH;
        }
        frame[2 + 4 * N_BYTES_POS] = flags;
        frame[MSG_LENGTH - 1] = checksum(&frame[..MSG_LENGTH - 1]);
        frame
    }
}

/// Decode a status frame
pub fn decode(frame: &[u8]) -> Result<ExecutionReport, ProtocolError> {
    let body = verify_frame(frame, MSG_LENGTH)?;
    let status = ExecutionStatus::from_code(body[1])
        .ok_or(ProtocolError::UnknownStatusCode(body[1]))?;

    let mut cursor = Cursor::new(&body[2..]);
    let mut positions = [0i32; 4];
    for pos in positions.iter_mut() {
        *pos = cursor
            .read_i32::<BigEndian>()
            .map_err(|_| ProtocolError::ShortMessage {
                expected: MSG_LENGTH,
                actual: frame.len(),
            })?;
    }
    let flags = body[2 + 4 * N_BYTES_POS];

    Ok(ExecutionReport {
        command_code: body[0],
        status,
        positions,
        joystick_button_pressed: flags & (1 << BIT_POS_JOYSTICK_BUTTON) != 0,
        switch_active: flags & (1 << BIT_POS_SWITCH) != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commands() -> Vec<Command> {
        vec![
            Command::MoveRelative { axis: Axis::X, steps: -1600 },
            Command::MoveRelative { axis: Axis::Theta, steps: i32::MAX },
            Command::MoveAbsolute { axis: Axis::Z, target: i32::MIN },
            Command::MoveAbsolute { axis: Axis::Y, target: 42 },
            Command::HomeOrZero { axis: Axis::Xy, mode: HomeOrZero::HomeNegative },
            Command::HomeOrZero { axis: Axis::Z, mode: HomeOrZero::Zero },
            Command::SetIllumination {
                source: IlluminationSource::Laser488nm,
                intensity: IlluminationIntensity::from_percent(37.5).unwrap(),
            },
            Command::SetIlluminationLedMatrix {
                source: IlluminationSource::LedArrayLeftBlueRightRed,
                rgb: RgbWeights { r: 255, g: 0, b: 17 },
            },
            Command::TurnOnIllumination,
            Command::TurnOffIllumination,
            Command::AckJoystickButton,
        ]
    }

    #[test]
    fn test_command_round_trip() {
        for command in sample_commands() {
            let frame = encode(&command).unwrap();
            assert_eq!(frame[CMD_LENGTH - 1], checksum(&frame[..CMD_LENGTH - 1]));
            assert_eq!(decode_command(&frame).unwrap(), command);
        }
    }

    #[test]
    fn test_move_frame_layout() {
        let frame = encode(&Command::MoveRelative { axis: Axis::Y, steps: -2 }).unwrap();
        assert_eq!(frame[..7], [cmd::MOVE_Y, 0xFF, 0xFF, 0xFF, 0xFE, 0, 0]);
        assert_eq!(frame[7], (cmd::MOVE_Y as u32 + 0xFF * 3 + 0xFE) as u8);
    }

    #[test]
    fn test_invalid_payload_rejected_before_encoding() {
        let theta_move_to = Command::MoveAbsolute { axis: Axis::Theta, target: 1 };
        assert!(matches!(encode(&theta_move_to), Err(ScopeError::InvalidPayload(_))));
        let laser_matrix = Command::SetIlluminationLedMatrix {
            source: IlluminationSource::Laser405nm,
            rgb: RgbWeights::default(),
        };
        assert!(matches!(encode(&laser_matrix), Err(ScopeError::InvalidPayload(_))));
        assert!(IlluminationIntensity::from_percent(100.5).is_err());
        assert!(IlluminationIntensity::from_percent(-1.0).is_err());
    }

    #[test]
    fn test_intensity_scale() {
        assert_eq!(IlluminationIntensity::from_percent(100.0).unwrap().level(), u16::MAX);
        assert_eq!(IlluminationIntensity::from_percent(0.0).unwrap().level(), 0);
        let half = IlluminationIntensity::from_percent(50.0).unwrap();
        assert!((half.percent() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_rgb_from_factors() {
        let rgb = RgbWeights::from_factors(50.0, [0.0, 0.0, 1.0]).unwrap();
        assert_eq!(rgb, RgbWeights { r: 0, g: 0, b: 128 });
    }

    #[test]
    fn test_report_round_trip() {
        let mut report = ExecutionReport::new(
            cmd::MOVETO_X,
            ExecutionStatus::InProgress,
            [1600, -3, 0, i32::MIN],
        );
        report.joystick_button_pressed = true;
        let frame = report.encode();
        assert_eq!(frame.len(), MSG_LENGTH);
        assert_eq!(decode(&frame).unwrap(), report);
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let mut frame =
            ExecutionReport::new(0, ExecutionStatus::CompletedWithoutErrors, [0; 4]).encode();
        frame[MSG_LENGTH - 1] ^= 0xFF;
        assert!(matches!(decode(&frame), Err(ProtocolError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_short_and_unknown_status() {
        let frame =
            ExecutionReport::new(0, ExecutionStatus::CompletedWithoutErrors, [0; 4]).encode();
        assert_eq!(
            decode(&frame[..10]),
            Err(ProtocolError::ShortMessage { expected: MSG_LENGTH, actual: 10 })
        );

        let mut bad = frame;
        bad[1] = 9;
        bad[MSG_LENGTH - 1] = checksum(&bad[..MSG_LENGTH - 1]);
        assert_eq!(decode(&bad), Err(ProtocolError::UnknownStatusCode(9)));
    }

    #[test]
    fn test_unknown_command_code() {
        let mut frame = [0u8; CMD_LENGTH];
        frame[0] = 4;
        frame[CMD_LENGTH - 1] = checksum(&frame[..CMD_LENGTH - 1]);
        assert_eq!(decode_command(&frame), Err(ProtocolError::UnknownCommandCode(4)));
    }
}
