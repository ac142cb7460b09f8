//! Last known stage position.
//!
//! The [`PositionTracker`] is the only writer. It is owned by whoever owns the
//! device link, so updates are serialized with command completion. Other
//! threads observe the position through cloned [`PositionReader`] handles.

use crate::protocol::{Command, ExecutionReport};
use crate::types::{Axis, StagePosition};
use crate::units::StageCalibration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where position updates come from after a command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    /// Positions carried in the status frame are authoritative
    #[default]
    DeviceReport,
    /// Apply the commanded delta or target locally
    CommandEcho,
}

#[derive(Debug, Clone, Default)]
struct TrackerState {
    /// X, Y, Z, Theta in device units
    raw: [i32; 4],
    joystick_button_pressed: bool,
    switch_active: bool,
}

/// Single-writer position state.
#[derive(Debug)]
pub struct PositionTracker {
    state: Arc<RwLock<TrackerState>>,
    calibration: Arc<StageCalibration>,
    source: PositionSource,
}

impl PositionTracker {
    pub fn new(calibration: StageCalibration, source: PositionSource) -> Self {
        Self {
            state: Arc::new(RwLock::new(TrackerState::default())),
            calibration: Arc::new(calibration),
            source,
        }
    }

    pub fn calibration(&self) -> &StageCalibration {
        &self.calibration
    }

    pub fn source(&self) -> PositionSource {
        self.source
    }

    /// Read-only handle for other threads
    pub fn reader(&self) -> PositionReader {
        PositionReader {
            state: Arc::clone(&self.state),
            calibration: Arc::clone(&self.calibration),
        }
    }

    /// Record an acknowledged command and its status frame
    pub fn record(&mut self, command: &Command, report: &ExecutionReport) {
        let mut state = self.state.write();
        state.joystick_button_pressed = report.joystick_button_pressed;
        state.switch_active = report.switch_active;

        match self.source {
            PositionSource::DeviceReport => state.raw = report.positions,
            PositionSource::CommandEcho => Self::echo(&mut state.raw, command),
        }
    }

    fn echo(raw: &mut [i32; 4], command: &Command) {
        match *command {
            Command::MoveRelative { axis, steps } => {
                if let Some(i) = axis.index() {
                    raw[i] = raw[i].saturating_add(steps);
                }
            }
            Command::MoveAbsolute { axis, target } => {
                if let Some(i) = axis.index() {
                    raw[i] = target;
                }
            }
            // the firmware zeroes the counter at the home switch as well
            Command::HomeOrZero { axis, .. } => {
                for a in axis.components() {
                    if let Some(i) = a.index() {
                        raw[i] = 0;
                    }
                }
            }
            _ => {}
        }
    }

    pub fn raw(&self) -> [i32; 4] {
        self.state.read().raw
    }

    pub fn snapshot(&self) -> StagePosition {
        to_physical(&self.state.read().raw, &self.calibration)
    }
}

/// Cloneable read handle onto a [`PositionTracker`].
#[derive(Debug, Clone)]
pub struct PositionReader {
    state: Arc<RwLock<TrackerState>>,
    calibration: Arc<StageCalibration>,
}

impl PositionReader {
    pub fn snapshot(&self) -> StagePosition {
        to_physical(&self.state.read().raw, &self.calibration)
    }

    pub fn raw(&self, axis: Axis) -> Option<i32> {
        axis.index().map(|i| self.state.read().raw[i])
    }

    pub fn joystick_button_pressed(&self) -> bool {
        self.state.read().joystick_button_pressed
    }

    pub fn switch_active(&self) -> bool {
        self.state.read().switch_active
    }
}

fn to_physical(raw: &[i32; 4], calibration: &StageCalibration) -> StagePosition {
    StagePosition {
        x: calibration.x.raw_to_physical(raw[0]),
        y: calibration.y.raw_to_physical(raw[1]),
        z: calibration.z.raw_to_physical(raw[2]),
        theta: calibration.theta.raw_to_physical(raw[3]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStatus, HomeOrZero};

    fn report(positions: [i32; 4]) -> ExecutionReport {
        ExecutionReport::new(0, ExecutionStatus::CompletedWithoutErrors, positions)
    }

    #[test]
    fn test_device_report_is_authoritative() {
        let mut tracker = PositionTracker::new(StageCalibration::default(), PositionSource::DeviceReport);
        let command = Command::MoveRelative { axis: Axis::Y, steps: 1600 };
        tracker.record(&command, &report([-1600, 3200, 0, 0]));

        let position = tracker.snapshot();
        assert!((position.x - 1.0).abs() < 1e-12);
        assert!((position.y - 2.0).abs() < 1e-12);
        assert_eq!(tracker.raw(), [-1600, 3200, 0, 0]);
    }

    #[test]
    fn test_command_echo_accumulates() {
        let mut tracker = PositionTracker::new(StageCalibration::default(), PositionSource::CommandEcho);
        let ignored = report([9, 9, 9, 9]);
        tracker.record(&Command::MoveRelative { axis: Axis::Y, steps: 100 }, &ignored);
        tracker.record(&Command::MoveRelative { axis: Axis::Y, steps: 60 }, &ignored);
        tracker.record(&Command::MoveAbsolute { axis: Axis::Z, target: -5 }, &ignored);
        assert_eq!(tracker.raw(), [0, 160, -5, 0]);

        tracker.record(
            &Command::HomeOrZero { axis: Axis::Xy, mode: HomeOrZero::Zero },
            &ignored,
        );
        assert_eq!(tracker.raw(), [0, 0, -5, 0]);
    }

    #[test]
    fn test_reader_sees_updates_from_other_thread() {
        let mut tracker = PositionTracker::new(StageCalibration::default(), PositionSource::DeviceReport);
        let reader = tracker.reader();

        let handle = std::thread::spawn(move || {
            tracker.record(&Command::TurnOnIllumination, &report([0, 0, 1000, 0]));
            tracker
        });
        let _tracker = handle.join().unwrap();

        assert_eq!(reader.raw(Axis::Z), Some(1000));
        assert_eq!(reader.raw(Axis::Xy), None);
    }

    #[test]
    fn test_flags_follow_latest_report() {
        let mut tracker = PositionTracker::new(StageCalibration::default(), PositionSource::DeviceReport);
        let reader = tracker.reader();
        let mut pressed = report([0; 4]);
        pressed.joystick_button_pressed = true;
        tracker.record(&Command::TurnOffIllumination, &pressed);
        assert!(reader.joystick_button_pressed());

        tracker.record(&Command::AckJoystickButton, &report([0; 4]));
        assert!(!reader.joystick_button_pressed());
        assert!(!reader.switch_active());
    }
}
