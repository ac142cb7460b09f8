//! Conversion between physical stage coordinates and controller units.
//!
//! Physical values are millimeters for the linear axes and calibration units
//! (degrees by default) for Theta. Device values are microsteps, or encoder
//! ticks for axes whose position is read back from an encoder.
//!
//! All physical-to-step conversions round half to even. Requests are snapped
//! to the step grid, so the value shown to the user should come from
//! [`AxisCalibration::snap`], not from the raw request.

use crate::error::ScopeError;
use crate::types::{Axis, HomingPolarity};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Calibration and conventions of a single stage axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisCalibration {
    /// Sign applied to relative motion requests (+1 or -1)
    pub movement_sign: i8,
    /// Sign applied when converting device positions to physical positions
    pub position_sign: i8,
    pub use_encoder: bool,
    pub encoder_sign: i8,
    /// Physical distance per encoder tick
    pub encoder_step_size: f64,
    pub fullsteps_per_rev: u32,
    /// Physical distance per screw revolution
    pub screw_pitch: f64,
    pub microstepping: u32,
    pub homing_enabled: bool,
    pub homing_polarity: HomingPolarity,
    /// Settling time after a scan move on this axis
    pub stabilization_ms: u64,
}

impl AxisCalibration {
    fn linear(movement_sign: i8, screw_pitch: f64, stabilization_ms: u64, homing: bool) -> Self {
        Self {
            movement_sign,
            position_sign: movement_sign,
            use_encoder: false,
            encoder_sign: 1,
            encoder_step_size: 100e-6,
            fullsteps_per_rev: 200,
            screw_pitch,
            microstepping: 8,
            homing_enabled: homing,
            homing_polarity: HomingPolarity::Negative,
            stabilization_ms,
        }
    }

    pub fn default_x() -> Self {
        Self::linear(-1, 1.0, 160, true)
    }

    pub fn default_y() -> Self {
        Self::linear(1, 1.0, 160, true)
    }

    pub fn default_z() -> Self {
        Self::linear(1, 0.012 * 25.4, 20, false)
    }

    pub fn default_theta() -> Self {
        Self {
            encoder_step_size: 1.0,
            ..Self::linear(1, 360.0, 0, false)
        }
    }

    /// Microsteps per physical unit
    pub fn steps_per_unit(&self) -> f64 {
        (self.microstepping as f64 * self.fullsteps_per_rev as f64) / self.screw_pitch
    }

    /// Physical distance covered by one microstep
    pub fn mm_per_step(&self) -> f64 {
        self.screw_pitch / (self.microstepping as f64 * self.fullsteps_per_rev as f64)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    /// Absolute physical coordinate to device microsteps.
    ///
    /// Exact inverse of [`Self::to_physical`]: `to_device_steps(to_physical(n)) == n`.
    pub fn to_device_steps(&self, physical: f64) -> i32 {
        clamp_steps((physical * self.position_sign as f64 * self.steps_per_unit()).round_ties_even())
    }

    /// Relative motion request to the microstep delta sent with a move command
    pub fn motion_steps(&self, delta: f64) -> i32 {
        clamp_steps((delta * self.movement_sign as f64 * self.steps_per_unit()).round_ties_even())
    }

    /// Device microsteps to physical coordinate
    pub fn to_physical(&self, steps: i32) -> f64 {
        steps as f64 / self.steps_per_unit() * self.position_sign as f64
    }

    /// Nearest physical value the axis can actually reach in whole microsteps
    pub fn snap(&self, physical: f64) -> f64 {
        (physical * self.steps_per_unit()).round_ties_even() / self.steps_per_unit()
    }

    pub fn encoder_to_physical(&self, ticks: i32) -> f64 {
        ticks as f64 * self.encoder_step_size * self.encoder_sign as f64
    }

    /// Raw position as reported by the controller (microsteps or encoder ticks)
    pub fn raw_to_physical(&self, raw: i32) -> f64 {
        if self.use_encoder {
            self.encoder_to_physical(raw)
        } else {
            self.to_physical(raw)
        }
    }

    pub fn validate(&self, axis: Axis) -> Result<(), ScopeError> {
        for (name, sign) in [
            ("movement_sign", self.movement_sign),
            ("position_sign", self.position_sign),
            ("encoder_sign", self.encoder_sign),
        ] {
            if sign != 1 && sign != -1 {
                return Err(ScopeError::Configuration(format!(
                    "{axis}: {name} must be +1 or -1, got {sign}"
                )));
            }
        }
        if !(self.screw_pitch.is_finite() && self.screw_pitch > 0.0) {
            return Err(ScopeError::Configuration(format!(
                "{axis}: screw_pitch must be positive, got {}",
                self.screw_pitch
            )));
        }
        if self.fullsteps_per_rev == 0 || self.microstepping == 0 {
            return Err(ScopeError::Configuration(format!(
                "{axis}: fullsteps_per_rev and microstepping must be non-zero"
            )));
        }
        if self.use_encoder && !(self.encoder_step_size.is_finite() && self.encoder_step_size > 0.0) {
            return Err(ScopeError::Configuration(format!(
                "{axis}: encoder_step_size must be positive when the encoder is used"
            )));
        }
        Ok(())
    }
}

fn clamp_steps(value: f64) -> i32 {
    value.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Calibration of every single axis of the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCalibration {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
    pub z: AxisCalibration,
    pub theta: AxisCalibration,
}

impl Default for StageCalibration {
    fn default() -> Self {
        Self {
            x: AxisCalibration::default_x(),
            y: AxisCalibration::default_y(),
            z: AxisCalibration::default_z(),
            theta: AxisCalibration::default_theta(),
        }
    }
}

impl StageCalibration {
    /// Calibration of a single axis. The combined XY axis has none.
    pub fn axis(&self, axis: Axis) -> Result<&AxisCalibration, ScopeError> {
        match axis {
            Axis::X => Ok(&self.x),
            Axis::Y => Ok(&self.y),
            Axis::Z => Ok(&self.z),
            Axis::Theta => Ok(&self.theta),
            Axis::Xy => Err(ScopeError::InvalidPayload(
                "combined XY axis has no calibration of its own".to_string(),
            )),
        }
    }

    pub fn homing_enabled(&self, axis: Axis) -> bool {
        axis.components()
            .iter()
            .all(|a| self.axis(*a).map(|c| c.homing_enabled).unwrap_or(false))
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        for axis in Axis::SINGLE {
            self.axis(axis)?.validate(axis)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_axis() -> AxisCalibration {
        // 1024 microsteps per mm: every step boundary is exactly representable
        AxisCalibration {
            fullsteps_per_rev: 256,
            microstepping: 4,
            screw_pitch: 1.0,
            ..AxisCalibration::default_y()
        }
    }

    #[test]
    fn test_default_x_resolution() {
        let x = AxisCalibration::default_x();
        assert!((x.mm_per_step() - 1.0 / 1600.0).abs() < 1e-15);
        assert_eq!(x.motion_steps(1.0), -1600);
        assert_eq!(x.to_device_steps(1.0), -1600);
        assert!((x.to_physical(-1600) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_round_trip_on_device_side() {
        let calibrations = StageCalibration::default();
        let samples = [
            0,
            1,
            -1,
            7,
            1599,
            -1601,
            123_456,
            -987_654,
            i32::MAX / 3,
            i32::MIN / 3,
            i32::MAX,
            i32::MIN,
        ];
        for axis in Axis::SINGLE {
            let cal = calibrations.axis(axis).unwrap();
            for n in samples {
                assert_eq!(cal.to_device_steps(cal.to_physical(n)), n, "{axis} n={n}");
            }
        }
    }

    #[test]
    fn test_half_step_rounds_to_even() {
        let cal = binary_axis();
        let step = cal.mm_per_step();
        assert_eq!(cal.motion_steps(0.5 * step), 0);
        assert_eq!(cal.motion_steps(1.5 * step), 2);
        assert_eq!(cal.motion_steps(2.5 * step), 2);
        assert_eq!(cal.motion_steps(-0.5 * step), 0);
        assert_eq!(cal.motion_steps(-1.5 * step), -2);
        assert_eq!(cal.motion_steps(0.5000001 * step), 1);
    }

    #[test]
    fn test_snap_returns_achievable_value() {
        let cal = binary_axis();
        let step = cal.mm_per_step();
        assert_eq!(cal.snap(3.4 * step), 3.0 * step);
        assert_eq!(cal.snap(2.5 * step), 2.0 * step);
        assert_eq!(cal.snap(0.25), 0.25);
    }

    #[test]
    fn test_sign_conventions() {
        let mut cal = AxisCalibration::default_y();
        cal.movement_sign = -1;
        cal.position_sign = 1;
        assert_eq!(cal.motion_steps(0.5), -800);
        assert_eq!(cal.to_device_steps(0.5), 800);
    }

    #[test]
    fn test_encoder_conversion() {
        let mut cal = AxisCalibration::default_x();
        cal.use_encoder = true;
        cal.encoder_sign = -1;
        assert!((cal.raw_to_physical(1000) + 0.1).abs() < 1e-12);
        cal.use_encoder = false;
        assert!((cal.raw_to_physical(1600) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_validation_rejects_bad_sign() {
        let mut cal = StageCalibration::default();
        cal.z.movement_sign = 0;
        assert!(matches!(cal.validate(), Err(ScopeError::Configuration(_))));
    }

    #[test]
    fn test_combined_axis_homing() {
        let mut cal = StageCalibration::default();
        assert!(cal.homing_enabled(Axis::Xy));
        assert!(!cal.homing_enabled(Axis::Z));
        cal.y.homing_enabled = false;
        assert!(!cal.homing_enabled(Axis::Xy));
    }
}
