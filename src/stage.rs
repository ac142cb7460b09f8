use crate::error::ScopeError;
use crate::link::DeviceLink;
use crate::protocol::{Command, ExecutionReport, IlluminationIntensity, RgbWeights};
use crate::tracker::{PositionReader, PositionSource, PositionTracker};
use crate::types::{Axis, HomeOrZero, IlluminationSource, StagePosition};
use crate::units::StageCalibration;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Stage section of the application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub calibration: StageCalibration,
    pub position_source: PositionSource,
    /// R, G, B factors applied to LED matrix intensity
    pub led_matrix_factors: [f64; 3],
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            calibration: StageCalibration::default(),
            position_source: PositionSource::DeviceReport,
            led_matrix_factors: [0.0, 0.0, 1.0],
        }
    }
}

impl StageConfig {
    pub fn validate(&self) -> Result<(), ScopeError> {
        self.calibration.validate()?;
        if self.led_matrix_factors.iter().any(|f| !(0.0..=1.0).contains(f)) {
            return Err(ScopeError::Configuration(format!(
                "led_matrix_factors must be within 0..=1, got {:?}",
                self.led_matrix_factors
            )));
        }
        Ok(())
    }
}

/// Per-command notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    CommandCompleted {
        command: Command,
        position: StagePosition,
    },
    CommandFailed {
        command: Command,
        message: String,
    },
}

/// Navigation facade over the device link and the position tracker.
///
/// Every motion request is converted to device units, sent through the link,
/// and recorded in the tracker once the controller acknowledges it.
pub struct StageController {
    link: DeviceLink,
    tracker: PositionTracker,
    led_matrix_factors: [f64; 3],
    event_sender: Option<Sender<StageEvent>>,
    /// Axes homed since connecting, in wire order
    homed: [bool; 4],
}

impl StageController {
    pub fn new(link: DeviceLink, config: &StageConfig) -> Self {
        Self {
            link,
            tracker: PositionTracker::new(config.calibration.clone(), config.position_source),
            led_matrix_factors: config.led_matrix_factors,
            event_sender: None,
            homed: [false; 4],
        }
    }

    /// Set a channel to send per-command notifications to
    pub fn set_event_sender(&mut self, sender: Sender<StageEvent>) {
        self.event_sender = Some(sender);
    }

    pub fn calibration(&self) -> &StageCalibration {
        self.tracker.calibration()
    }

    pub fn position(&self) -> StagePosition {
        self.tracker.snapshot()
    }

    pub fn reader(&self) -> PositionReader {
        self.tracker.reader()
    }

    /// Whether every component of `axis` has been homed on this connection
    pub fn is_homed(&self, axis: Axis) -> bool {
        axis.components()
            .iter()
            .all(|a| a.index().is_some_and(|i| self.homed[i]))
    }

    pub fn joystick_button_pressed(&self) -> bool {
        self.reader().joystick_button_pressed()
    }

    /// Execute a raw command and record the acknowledged result
    pub fn execute(&mut self, command: Command) -> Result<ExecutionReport, ScopeError> {
        let timeout = match command {
            Command::HomeOrZero { mode, .. } if mode != HomeOrZero::Zero => {
                self.link.config().homing_timeout()
            }
            _ => self.link.config().command_timeout(),
        };

        match self.link.execute(command, timeout) {
            Ok(report) => {
                self.tracker.record(&command, &report);
                self.send_event(StageEvent::CommandCompleted {
                    command,
                    position: self.tracker.snapshot(),
                });
                Ok(report)
            }
            Err(e) => {
                self.send_event(StageEvent::CommandFailed {
                    command,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Relative move by a physical distance
    pub fn move_relative(&mut self, axis: Axis, delta: f64) -> Result<StagePosition, ScopeError> {
        let steps = self.tracker.calibration().axis(axis)?.motion_steps(delta);
        debug!("Move {axis} by {delta} ({steps} usteps)");
        self.move_relative_steps(axis, steps)
    }

    pub fn move_relative_steps(&mut self, axis: Axis, steps: i32) -> Result<StagePosition, ScopeError> {
        if steps == 0 {
            debug!("Move on {axis} rounds to zero microsteps, skipped");
            return Ok(self.position());
        }
        self.execute(Command::MoveRelative { axis, steps })?;
        Ok(self.position())
    }

    /// Absolute move to a physical coordinate (X, Y, Z only)
    pub fn move_to(&mut self, axis: Axis, target: f64) -> Result<StagePosition, ScopeError> {
        let steps = self.tracker.calibration().axis(axis)?.to_device_steps(target);
        debug!("Move {axis} to {target} ({steps} usteps)");
        self.execute(Command::MoveAbsolute { axis, target: steps })?;
        Ok(self.position())
    }

    pub fn home(&mut self, axis: Axis) -> Result<StagePosition, ScopeError> {
        if !self.tracker.calibration().homing_enabled(axis) {
            return Err(ScopeError::Configuration(format!(
                "homing is disabled for axis {axis}"
            )));
        }
        let calibration = self.tracker.calibration();
        let polarities = axis
            .components()
            .iter()
            .map(|a| calibration.axis(*a).map(|c| c.homing_polarity))
            .collect::<Result<Vec<_>, _>>()?;
        if polarities.windows(2).any(|w| w[0] != w[1]) {
            // one command carries one direction
            info!("{axis} components home in opposite directions, homing them one by one");
            for component in axis.components() {
                self.home(*component)?;
            }
            return Ok(self.position());
        }
        let polarity = polarities.first().copied().unwrap_or_default();
        let mode = HomeOrZero::from(polarity);
        info!("Homing {axis} ({mode:?})");
        self.execute(Command::HomeOrZero { axis, mode })?;
        for component in axis.components() {
            if let Some(i) = component.index() {
                self.homed[i] = true;
            }
        }
        Ok(self.position())
    }

    /// Declare the current position of `axis` as zero
    pub fn zero(&mut self, axis: Axis) -> Result<StagePosition, ScopeError> {
        info!("Zeroing {axis}");
        self.execute(Command::HomeOrZero { axis, mode: HomeOrZero::Zero })?;
        Ok(self.position())
    }

    /// Select an illumination source and intensity in percent.
    ///
    /// LED matrix sources are driven through the LED matrix command using the
    /// configured color factors.
    pub fn set_illumination(&mut self, source: IlluminationSource, percent: f64) -> Result<(), ScopeError> {
        if source.is_led_matrix() {
            return self.set_illumination_led_matrix(source, percent);
        }
        let intensity = IlluminationIntensity::from_percent(percent)?;
        self.execute(Command::SetIllumination { source, intensity })?;
        Ok(())
    }

    pub fn set_illumination_led_matrix(
        &mut self,
        source: IlluminationSource,
        percent: f64,
    ) -> Result<(), ScopeError> {
        let rgb = RgbWeights::from_factors(percent, self.led_matrix_factors)?;
        self.execute(Command::SetIlluminationLedMatrix { source, rgb })?;
        Ok(())
    }

    pub fn turn_on_illumination(&mut self) -> Result<(), ScopeError> {
        self.execute(Command::TurnOnIllumination).map(|_| ())
    }

    pub fn turn_off_illumination(&mut self) -> Result<(), ScopeError> {
        self.execute(Command::TurnOffIllumination).map(|_| ())
    }

    pub fn acknowledge_joystick_button(&mut self) -> Result<(), ScopeError> {
        self.execute(Command::AckJoystickButton).map(|_| ())
    }

    fn send_event(&self, event: StageEvent) {
        if let Some(sender) = &self.event_sender {
            if sender.try_send(event).is_err() {
                warn!("Stage event dropped: receiver gone or full");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::simulator::SimulatedController;
    use crate::types::{ExecutionStatus, HomingPolarity};

    fn stage_with(config: StageConfig) -> (StageController, SimulatedController) {
        let sim = SimulatedController::new();
        let link = DeviceLink::new(
            Box::new(sim.clone()),
            LinkConfig {
                poll_interval_ms: 1,
                command_timeout_ms: 500,
                homing_timeout_ms: 500,
                ..LinkConfig::default()
            },
        );
        (StageController::new(link, &config), sim)
    }

    fn stage() -> (StageController, SimulatedController) {
        stage_with(StageConfig::default())
    }

    #[test]
    fn test_move_relative_applies_movement_sign() {
        let (mut stage, sim) = stage();
        let position = stage.move_relative(Axis::X, 1.0).unwrap();
        assert_eq!(sim.state().positions[0], -1600);
        assert!((position.x - 1.0).abs() < 1e-12);

        stage.move_relative(Axis::Y, -0.5).unwrap();
        assert_eq!(sim.state().positions[1], -800);
    }

    #[test]
    fn test_move_to_round_trips_through_device() {
        let (mut stage, _sim) = stage();
        let target = stage.calibration().z.snap(0.123);
        let position = stage.move_to(Axis::Z, target).unwrap();
        assert!((position.z - target).abs() < 1e-9);
    }

    #[test]
    fn test_move_to_theta_rejected() {
        let (mut stage, sim) = stage();
        let err = stage.move_to(Axis::Theta, 10.0).unwrap_err();
        assert!(matches!(err, ScopeError::InvalidPayload(_)));
        assert!(sim.state().received.is_empty());
    }

    #[test]
    fn test_home_requires_enabled_axis() {
        let (mut stage, sim) = stage();
        let err = stage.home(Axis::Z).unwrap_err();
        assert!(matches!(err, ScopeError::Configuration(_)));
        assert!(sim.state().received.is_empty());

        stage.move_relative(Axis::X, 2.0).unwrap();
        assert!(!stage.is_homed(Axis::X));
        stage.home(Axis::Xy).unwrap();
        assert!(stage.is_homed(Axis::Xy));
        assert!(!stage.is_homed(Axis::Z));
        assert_eq!(
            sim.state().received.last(),
            Some(&Command::HomeOrZero { axis: Axis::Xy, mode: HomeOrZero::HomeNegative })
        );
        assert_eq!(stage.position(), StagePosition::default());
    }

    #[test]
    fn test_xy_with_opposite_polarities_homes_each_axis() {
        let mut config = StageConfig::default();
        config.calibration.y.homing_polarity = HomingPolarity::Positive;
        let (mut stage, sim) = stage_with(config);

        stage.move_relative(Axis::Y, 1.0).unwrap();
        stage.home(Axis::Xy).unwrap();
        let received = sim.state().received;
        assert_eq!(
            received[1..],
            [
                Command::HomeOrZero { axis: Axis::X, mode: HomeOrZero::HomeNegative },
                Command::HomeOrZero { axis: Axis::Y, mode: HomeOrZero::HomePositive },
            ]
        );
        assert_eq!(stage.position(), StagePosition::default());
        assert!(stage.is_homed(Axis::Xy));
    }

    #[test]
    fn test_zero_on_any_axis() {
        let (mut stage, sim) = stage();
        stage.move_relative(Axis::Z, 0.3048).unwrap();
        stage.zero(Axis::Z).unwrap();
        assert_eq!(sim.state().positions[2], 0);
        assert!(!stage.is_homed(Axis::Z));
    }

    #[test]
    fn test_led_matrix_uses_factors() {
        let (mut stage, sim) = stage();
        stage.set_illumination(IlluminationSource::LedArrayFull, 100.0).unwrap();
        assert_eq!(
            sim.state().led_matrix_rgb,
            Some(RgbWeights { r: 0, g: 0, b: 255 })
        );

        stage.set_illumination(IlluminationSource::Laser488nm, 50.0).unwrap();
        let state = sim.state();
        assert_eq!(state.illumination_source, Some(IlluminationSource::Laser488nm));
        assert_eq!(state.illumination_intensity.map(|i| i.level()), Some(32768));
    }

    #[test]
    fn test_failure_emits_event_and_keeps_position() {
        let (mut stage, sim) = stage();
        let (tx, rx) = crossbeam_channel::unbounded();
        stage.set_event_sender(tx);

        stage.move_relative(Axis::Y, 1.0).unwrap();
        sim.reject_next_command(ExecutionStatus::ExecutionError);
        let err = stage.move_relative(Axis::Y, 1.0).unwrap_err();
        assert!(err.is_device_fault());
        assert!((stage.position().y - 1.0).abs() < 1e-12);

        let events: Vec<StageEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StageEvent::CommandCompleted { .. }));
        assert!(matches!(events[1], StageEvent::CommandFailed { .. }));
    }

    #[test]
    fn test_joystick_acknowledgment() {
        let (mut stage, sim) = stage();
        sim.press_joystick_button();
        stage.turn_on_illumination().unwrap();
        assert!(stage.joystick_button_pressed());
        stage.acknowledge_joystick_button().unwrap();
        assert!(!stage.joystick_button_pressed());
    }

    #[test]
    fn test_invalid_led_factors_rejected() {
        let config = StageConfig {
            led_matrix_factors: [1.5, 0.0, 0.0],
            ..StageConfig::default()
        };
        assert!(matches!(config.validate(), Err(ScopeError::Configuration(_))));
    }
}
