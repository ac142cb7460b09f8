use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage axis as addressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    Theta,
    /// Combined X and Y, only meaningful for homing and zeroing
    Xy,
}

impl Axis {
    /// Single axes, in wire order
    pub const SINGLE: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::Theta];

    pub fn code(self) -> u8 {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::Theta => 3,
            Axis::Xy => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Axis::X),
            1 => Some(Axis::Y),
            2 => Some(Axis::Z),
            3 => Some(Axis::Theta),
            4 => Some(Axis::Xy),
            _ => None,
        }
    }

    /// Index into per-axis arrays; `None` for the combined axis
    pub fn index(self) -> Option<usize> {
        match self {
            Axis::X => Some(0),
            Axis::Y => Some(1),
            Axis::Z => Some(2),
            Axis::Theta => Some(3),
            Axis::Xy => None,
        }
    }

    /// The single axes this axis stands for
    pub fn components(self) -> &'static [Axis] {
        match self {
            Axis::X => &[Axis::X],
            Axis::Y => &[Axis::Y],
            Axis::Z => &[Axis::Z],
            Axis::Theta => &[Axis::Theta],
            Axis::Xy => &[Axis::X, Axis::Y],
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::Theta => "Theta",
            Axis::Xy => "XY",
        };
        write!(f, "{name}")
    }
}

/// Direction the axis travels when seeking its home switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HomingPolarity {
    #[default]
    Negative,
    Positive,
}

/// Payload of the home-or-zero command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomeOrZero {
    /// Drive toward the home switch along the negative direction (MCU coordinates)
    HomeNegative,
    /// Drive toward the home switch along the positive direction (MCU coordinates)
    HomePositive,
    /// Redefine the current position as the origin without moving
    Zero,
}

impl HomeOrZero {
    pub fn code(self) -> u8 {
        match self {
            HomeOrZero::HomePositive => 0,
            HomeOrZero::HomeNegative => 1,
            HomeOrZero::Zero => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(HomeOrZero::HomePositive),
            1 => Some(HomeOrZero::HomeNegative),
            2 => Some(HomeOrZero::Zero),
            _ => None,
        }
    }
}

impl From<HomingPolarity> for HomeOrZero {
    fn from(polarity: HomingPolarity) -> Self {
        match polarity {
            HomingPolarity::Negative => HomeOrZero::HomeNegative,
            HomingPolarity::Positive => HomeOrZero::HomePositive,
        }
    }
}

/// Illumination channel codes understood by the controller firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IlluminationSource {
    LedArrayFull,
    LedArrayLeftHalf,
    LedArrayRightHalf,
    LedArrayLeftBlueRightRed,
    LedExternalFet,
    Laser405nm,
    Laser488nm,
    Laser561nm,
    Laser638nm,
}

impl IlluminationSource {
    pub fn code(self) -> u8 {
        match self {
            IlluminationSource::LedArrayFull => 0,
            IlluminationSource::LedArrayLeftHalf => 1,
            IlluminationSource::LedArrayRightHalf => 2,
            IlluminationSource::LedArrayLeftBlueRightRed => 3,
            IlluminationSource::Laser405nm => 11,
            IlluminationSource::Laser488nm => 12,
            IlluminationSource::Laser638nm => 13,
            IlluminationSource::Laser561nm => 14,
            IlluminationSource::LedExternalFet => 20,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(IlluminationSource::LedArrayFull),
            1 => Some(IlluminationSource::LedArrayLeftHalf),
            2 => Some(IlluminationSource::LedArrayRightHalf),
            3 => Some(IlluminationSource::LedArrayLeftBlueRightRed),
            11 => Some(IlluminationSource::Laser405nm),
            12 => Some(IlluminationSource::Laser488nm),
            13 => Some(IlluminationSource::Laser638nm),
            14 => Some(IlluminationSource::Laser561nm),
            20 => Some(IlluminationSource::LedExternalFet),
            _ => None,
        }
    }

    /// LED matrix patterns accept RGB weighting
    pub fn is_led_matrix(self) -> bool {
        matches!(
            self,
            IlluminationSource::LedArrayFull
                | IlluminationSource::LedArrayLeftHalf
                | IlluminationSource::LedArrayRightHalf
                | IlluminationSource::LedArrayLeftBlueRightRed
        )
    }
}

/// Execution status reported by the controller for the last command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    CompletedWithoutErrors,
    InProgress,
    ChecksumError,
    CmdInvalid,
    ExecutionError,
    FluidicLineError,
}

impl ExecutionStatus {
    pub fn code(self) -> u8 {
        match self {
            ExecutionStatus::CompletedWithoutErrors => 0,
            ExecutionStatus::InProgress => 1,
            ExecutionStatus::ChecksumError => 2,
            ExecutionStatus::CmdInvalid => 3,
            ExecutionStatus::ExecutionError => 4,
            ExecutionStatus::FluidicLineError => 100,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ExecutionStatus::CompletedWithoutErrors),
            1 => Some(ExecutionStatus::InProgress),
            2 => Some(ExecutionStatus::ChecksumError),
            3 => Some(ExecutionStatus::CmdInvalid),
            4 => Some(ExecutionStatus::ExecutionError),
            100 => Some(ExecutionStatus::FluidicLineError),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::InProgress)
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != ExecutionStatus::CompletedWithoutErrors
    }
}

/// Physical stage position (mm for X/Y/Z, calibration units for Theta).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub theta: f64,
}

impl StagePosition {
    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => Some(self.x),
            Axis::Y => Some(self.y),
            Axis::Z => Some(self.z),
            Axis::Theta => Some(self.theta),
            Axis::Xy => None,
        }
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X {:.4} mm, Y {:.4} mm, Z {:.4} mm, Theta {:.3}",
            self.x, self.y, self.z, self.theta
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_codes_match_wire() {
        for axis in [Axis::X, Axis::Y, Axis::Z, Axis::Theta, Axis::Xy] {
            assert_eq!(Axis::from_code(axis.code()), Some(axis));
        }
        assert_eq!(Axis::Xy.code(), 4);
        assert_eq!(Axis::Xy.components(), &[Axis::X, Axis::Y]);
    }

    #[test]
    fn test_illumination_codes_are_stable() {
        assert_eq!(IlluminationSource::LedExternalFet.code(), 20);
        assert_eq!(IlluminationSource::Laser638nm.code(), 13);
        assert_eq!(IlluminationSource::Laser561nm.code(), 14);
        assert_eq!(IlluminationSource::from_code(5), None);
        assert!(IlluminationSource::LedArrayLeftHalf.is_led_matrix());
        assert!(!IlluminationSource::Laser405nm.is_led_matrix());
    }

    #[test]
    fn test_execution_status_classification() {
        assert!(!ExecutionStatus::InProgress.is_terminal());
        assert!(!ExecutionStatus::CompletedWithoutErrors.is_failure());
        assert!(ExecutionStatus::FluidicLineError.is_failure());
        assert_eq!(ExecutionStatus::from_code(100), Some(ExecutionStatus::FluidicLineError));
        assert_eq!(ExecutionStatus::from_code(7), None);
    }

    #[test]
    fn test_home_polarity_codes() {
        assert_eq!(HomeOrZero::from(HomingPolarity::Negative).code(), 1);
        assert_eq!(HomeOrZero::from(HomingPolarity::Positive).code(), 0);
        assert_eq!(HomeOrZero::Zero.code(), 2);
    }
}
