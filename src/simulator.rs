//! In-process stand-in for the stage microcontroller.
//!
//! The simulator decodes request frames, applies them to its own stage state
//! and queues status frames the same way the firmware does. Faults can be
//! injected to exercise the device link: corrupted status frames, rejected
//! commands, long-running commands and silence.

use crate::error::ScopeError;
use crate::protocol::{self, Command, ExecutionReport, IlluminationIntensity, RgbWeights};
use crate::transport::Transport;
use crate::types::{Axis, ExecutionStatus, HomeOrZero, IlluminationSource};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Observable state of the simulated controller.
#[derive(Debug, Clone, Default)]
pub struct SimulatorState {
    /// X, Y, Z, Theta in microsteps
    pub positions: [i32; 4],
    pub illumination_on: bool,
    pub illumination_source: Option<IlluminationSource>,
    pub illumination_intensity: Option<IlluminationIntensity>,
    pub led_matrix_rgb: Option<RgbWeights>,
    pub joystick_button_pressed: bool,
    /// Every command decoded so far, in arrival order
    pub received: Vec<Command>,
    /// Raw frames that failed to decode
    pub rejected_frames: usize,
}

#[derive(Debug, Default)]
struct Faults {
    in_progress_polls: u32,
    corrupt_next: usize,
    reject_next: Option<ExecutionStatus>,
    silent: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: SimulatorState,
    faults: Faults,
    outbox: VecDeque<Vec<u8>>,
}

/// Simulated controller. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct SimulatedController {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SimulatorState {
        self.inner.lock().state.clone()
    }

    /// Report `polls` in-progress frames before each terminal status
    pub fn set_in_progress_polls(&self, polls: u32) {
        self.inner.lock().faults.in_progress_polls = polls;
    }

    /// Flip the checksum of the next `count` status frames
    pub fn corrupt_next_responses(&self, count: usize) {
        self.inner.lock().faults.corrupt_next = count;
    }

    /// Answer the next command with a failure status instead of executing it
    pub fn reject_next_command(&self, status: ExecutionStatus) {
        self.inner.lock().faults.reject_next = Some(status);
    }

    /// Stop answering altogether
    pub fn set_silent(&self, silent: bool) {
        self.inner.lock().faults.silent = silent;
    }

    pub fn press_joystick_button(&self) {
        self.inner.lock().state.joystick_button_pressed = true;
    }

    fn apply(state: &mut SimulatorState, command: &Command) {
        match *command {
            Command::MoveRelative { axis, steps } => {
                if let Some(i) = axis.index() {
                    state.positions[i] = state.positions[i].saturating_add(steps);
                }
            }
            Command::MoveAbsolute { axis, target } => {
                if let Some(i) = axis.index() {
                    state.positions[i] = target;
                }
            }
            Command::HomeOrZero { axis, mode } => {
                for a in axis.components() {
                    if let Some(i) = a.index() {
                        state.positions[i] = 0;
                    }
                }
                debug!("Simulator: {mode:?} on {axis}");
            }
            Command::SetIllumination { source, intensity } => {
                state.illumination_source = Some(source);
                state.illumination_intensity = Some(intensity);
            }
            Command::SetIlluminationLedMatrix { source, rgb } => {
                state.illumination_source = Some(source);
                state.led_matrix_rgb = Some(rgb);
            }
            Command::TurnOnIllumination => state.illumination_on = true,
            Command::TurnOffIllumination => state.illumination_on = false,
            Command::AckJoystickButton => state.joystick_button_pressed = false,
        }
    }

    fn queue_report(inner: &mut Inner, code: u8, status: ExecutionStatus) {
        let mut report = ExecutionReport::new(code, status, inner.state.positions);
        report.joystick_button_pressed = inner.state.joystick_button_pressed;
        let mut frame = report.encode();
        if inner.faults.corrupt_next > 0 {
            inner.faults.corrupt_next -= 1;
            frame[protocol::MSG_LENGTH - 1] ^= 0xFF;
        }
        inner.outbox.push_back(frame.to_vec());
    }
}

impl Transport for SimulatedController {
    fn send(&mut self, frame: &[u8]) -> Result<(), ScopeError> {
        let mut inner = self.inner.lock();

        let command = match protocol::decode_command(frame) {
            Ok(command) => command,
            Err(e) => {
                debug!("Simulator rejected frame {frame:02x?}: {e}");
                inner.state.rejected_frames += 1;
                let code = frame.first().copied().unwrap_or_default();
                let status = match e {
                    crate::error::ProtocolError::ChecksumMismatch { .. } => {
                        ExecutionStatus::ChecksumError
                    }
                    _ => ExecutionStatus::CmdInvalid,
                };
                Self::queue_report(&mut inner, code, status);
                return Ok(());
            }
        };

        inner.state.received.push(command);
        let code = command.code();

        for _ in 0..inner.faults.in_progress_polls {
            Self::queue_report(&mut inner, code, ExecutionStatus::InProgress);
        }

        if let Some(status) = inner.faults.reject_next.take() {
            Self::queue_report(&mut inner, code, status);
            return Ok(());
        }

        Self::apply(&mut inner.state, &command);
        Self::queue_report(&mut inner, code, ExecutionStatus::CompletedWithoutErrors);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, ScopeError> {
        let mut inner = self.inner.lock();
        if inner.faults.silent {
            return Ok(None);
        }
        Ok(inner.outbox.pop_front())
    }
}
