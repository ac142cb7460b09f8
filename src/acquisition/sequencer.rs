use super::collaborators::{expose_frame, Autofocus, Clock, ImageCapture, SystemClock};
use super::plan::{AcquisitionPlan, AcquisitionPoint, FrameTag};
use super::{
    spawn_worker, AbortHandle, AbortReason, AcquisitionEvent, AcquisitionHandle, AcquisitionOutcome,
    AcquisitionState,
};
use crate::channels::{ChannelConfiguration, ChannelRegistry};
use crate::error::ScopeError;
use crate::job::Job;
use crate::stage::StageController;
use crate::types::{Axis, StagePosition};
use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest uninterrupted sleep between timepoints; abort is checked in between
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Result of one acquisition run. Points acquired before an abort are kept.
#[derive(Debug)]
pub struct AcquisitionReport {
    pub state: AcquisitionState,
    pub abort_reason: Option<AbortReason>,
    pub experiment_dir: PathBuf,
    /// Stage position the grid offsets were applied to
    pub origin: StagePosition,
    pub completed_points: Vec<AcquisitionPoint>,
    pub frames_captured: u64,
    pub autofocus_runs: u64,
    pub autofocus_failures: u64,
}

impl AcquisitionReport {
    pub fn is_completed(&self) -> bool {
        self.state == AcquisitionState::Completed
    }

    pub fn points_completed(&self) -> u64 {
        self.completed_points.len() as u64
    }
}

#[derive(Debug, Default)]
struct Progress {
    completed_points: Vec<AcquisitionPoint>,
    frames_captured: u64,
    autofocus_runs: u64,
    autofocus_failures: u64,
}

/// Walks the acquisition grid.
///
/// Traversal order is t, then z, then y, then x (x varies fastest). At every
/// point the selected channels are imaged in plan order. The sequencer owns
/// the stage for the duration of the run.
pub struct Sequencer {
    stage: StageController,
    plan: AcquisitionPlan,
    channels: Vec<ChannelConfiguration>,
    capture: Box<dyn ImageCapture>,
    autofocus: Option<Box<dyn Autofocus>>,
    clock: Box<dyn Clock>,
    abort: AbortHandle,
    event_sender: Option<Sender<AcquisitionEvent>>,
    state: AcquisitionState,
    experiment_dir: PathBuf,
}

impl Sequencer {
    /// Validate the plan against the stage and channel set.
    ///
    /// Grid spacing is snapped to whole microsteps first, so the plan the
    /// sequencer runs may differ slightly from the one passed in.
    pub fn new(
        stage: StageController,
        plan: AcquisitionPlan,
        channels: &ChannelRegistry,
        capture: Box<dyn ImageCapture>,
    ) -> Result<Self, ScopeError> {
        let plan = plan.snapped(stage.calibration());
        let channels = plan.validate(channels, stage.calibration())?;
        let experiment_dir = plan.experiment_dir(&Local::now());

        Ok(Self {
            stage,
            plan,
            channels,
            capture,
            autofocus: None,
            clock: Box::new(SystemClock::default()),
            abort: AbortHandle::new(),
            event_sender: None,
            state: AcquisitionState::Configured,
            experiment_dir,
        })
    }

    pub fn with_autofocus(mut self, autofocus: Box<dyn Autofocus>) -> Self {
        self.autofocus = Some(autofocus);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    /// Set a channel to send progress events to
    pub fn set_event_sender(&mut self, sender: Sender<AcquisitionEvent>) {
        self.event_sender = Some(sender);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.experiment_dir
    }

    pub fn stage(&self) -> &StageController {
        &self.stage
    }

    pub fn into_stage(self) -> StageController {
        self.stage
    }

    /// Run on a worker thread.
    ///
    /// Replaces any attached event sender with a fresh channel whose receiver
    /// is returned in the handle. The channel closes when the run ends.
    pub fn spawn(mut self, timeout: Duration) -> AcquisitionHandle {
        let (sender, events) = unbounded();
        self.event_sender = Some(sender);
        let abort = self.abort.clone();

        spawn_worker(events, abort, move || {
            let report = self.run(timeout);
            AcquisitionOutcome {
                report,
                stage: self.into_stage(),
            }
        })
    }

    fn send_event(&self, event: AcquisitionEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.try_send(event);
        }
    }

    fn check_boundary(&self, started: Duration, timeout: Duration) -> Option<AbortReason> {
        if self.abort.is_aborted() {
            return Some(AbortReason::Requested);
        }
        if self.clock.now().saturating_sub(started) >= timeout {
            return Some(AbortReason::TimedOut);
        }
        None
    }

    fn home_axes(&mut self) -> Result<(), ScopeError> {
        for axis in self.plan.home_axes.clone() {
            self.stage.home(axis)?;
        }
        Ok(())
    }

    fn move_axis(&mut self, axis: Axis, target: f64) -> Result<(), ScopeError> {
        self.stage.move_to(axis, target)?;
        let settle = self.stage.calibration().axis(axis)?.stabilization();
        self.clock.sleep(settle);
        Ok(())
    }

    fn traverse(
        &mut self,
        origin: StagePosition,
        started: Duration,
        timeout: Duration,
        progress: &mut Progress,
    ) -> Result<Option<AbortReason>, ScopeError> {
        let plan = self.plan.clone();
        let channels = self.channels.clone();
        let total = plan.total_points();

        // Z of plane 0; autofocus moves it
        let mut z_base = origin.z;
        let (mut at_x, mut at_y, mut at_z) = (origin.x, origin.y, origin.z);

        for t in 0..plan.nt {
            let timepoint_started = self.clock.now();

            for z in 0..plan.nz {
                let mut field: u64 = 0;
                for y in 0..plan.ny {
                    for x in 0..plan.nx {
                        if let Some(reason) = self.check_boundary(started, timeout) {
                            return Ok(Some(reason));
                        }
                        let point = AcquisitionPoint { t, z, y, x };

                        let target_z = z_base + z as f64 * plan.dz_mm;
                        if target_z != at_z {
                            self.move_axis(Axis::Z, target_z)?;
                            at_z = target_z;
                        }
                        let target_y = origin.y + y as f64 * plan.dy_mm;
                        if target_y != at_y {
                            self.move_axis(Axis::Y, target_y)?;
                            at_y = target_y;
                        }
                        let target_x = origin.x + x as f64 * plan.dx_mm;
                        if target_x != at_x {
                            self.move_axis(Axis::X, target_x)?;
                            at_x = target_x;
                        }

                        self.send_event(AcquisitionEvent::PointStarted {
                            point,
                            position: self.stage.position(),
                        });

                        if plan.with_autofocus && plan.autofocus.applies(field) {
                            if let Some(focused) = self.autofocus_at(point, progress)? {
                                z_base = focused - z as f64 * plan.dz_mm;
                                at_z = z_base + z as f64 * plan.dz_mm;
                            }
                        }

                        for channel in &channels {
                            self.image_channel(point, channel)?;
                            progress.frames_captured += 1;
                        }

                        progress.completed_points.push(point);
                        self.send_event(AcquisitionEvent::PointCompleted {
                            point,
                            completed: progress.completed_points.len() as u64,
                            total,
                        });
                        field += 1;
                    }
                }
            }

            let elapsed = self.clock.now().saturating_sub(timepoint_started);
            let wait = if t + 1 < plan.nt {
                plan.interval().saturating_sub(elapsed)
            } else {
                Duration::ZERO
            };
            info!("Timepoint {}/{} done in {:?}, next in {:?}", t + 1, plan.nt, elapsed, wait);
            self.send_event(AcquisitionEvent::TimepointCompleted {
                t,
                elapsed_ms: elapsed.as_millis() as u64,
                wait_ms: wait.as_millis() as u64,
            });

            if let Some(reason) = self.wait_interval(wait, started, timeout) {
                return Ok(Some(reason));
            }
        }

        Ok(None)
    }

    /// Sleep between timepoints, stopping early on abort or job timeout
    fn wait_interval(&self, wait: Duration, started: Duration, timeout: Duration) -> Option<AbortReason> {
        let mut remaining = wait;
        while !remaining.is_zero() {
            if let Some(reason) = self.check_boundary(started, timeout) {
                return Some(reason);
            }
            let slice = remaining.min(WAIT_SLICE);
            self.clock.sleep(slice);
            remaining -= slice;
        }
        None
    }

    /// Focused Z on success. Failures other than device faults are reported
    /// and the point is imaged at the current focus.
    fn autofocus_at(
        &mut self,
        point: AcquisitionPoint,
        progress: &mut Progress,
    ) -> Result<Option<f64>, ScopeError> {
        let timeout = self.plan.autofocus_timeout();
        let Some(autofocus) = self.autofocus.as_mut() else {
            return Ok(None);
        };
        progress.autofocus_runs += 1;

        match autofocus.run(&mut self.stage, timeout) {
            Ok(z_mm) => {
                debug!("Autofocus at {point}: Z {z_mm:.4} mm");
                self.send_event(AcquisitionEvent::AutofocusCompleted { point, z_mm });
                Ok(Some(z_mm))
            }
            Err(e) if e.is_device_fault() => Err(e),
            Err(e) => {
                warn!("Autofocus failed at {point}, keeping current focus: {e}");
                progress.autofocus_failures += 1;
                self.send_event(AcquisitionEvent::AutofocusFailed {
                    point,
                    message: e.to_string(),
                });
                Ok(None)
            }
        }
    }

    fn image_channel(&mut self, point: AcquisitionPoint, channel: &ChannelConfiguration) -> Result<(), ScopeError> {
        let tag = FrameTag::new(&self.experiment_dir, point, channel);
        expose_frame(
            &mut self.stage,
            self.capture.as_mut(),
            self.clock.as_ref(),
            channel,
            &tag,
        )?;
        self.send_event(AcquisitionEvent::FrameCaptured {
            site: tag.site,
            channel: channel.name.clone(),
            stem: tag.stem(),
        });
        Ok(())
    }

    fn return_to(&mut self, origin: StagePosition) -> Result<(), ScopeError> {
        info!("Returning to origin {origin}");
        self.stage.move_to(Axis::Z, origin.z)?;
        self.stage.move_to(Axis::Y, origin.y)?;
        self.stage.move_to(Axis::X, origin.x)?;
        Ok(())
    }
}

impl Job for Sequencer {
    type Output = AcquisitionReport;

    /// Run the acquisition to completion or abort.
    ///
    /// Configuration problems are returned as errors before any motion. A
    /// device fault during traversal ends the run with an `Aborted` report
    /// carrying the error.
    fn run(&mut self, timeout: Duration) -> Result<AcquisitionReport, ScopeError> {
        if self.state != AcquisitionState::Configured {
            return Err(ScopeError::Configuration(
                "this acquisition has already been run".to_string(),
            ));
        }
        if self.plan.with_autofocus && self.autofocus.is_none() {
            return Err(ScopeError::Configuration(
                "plan requests autofocus but no autofocus is attached".to_string(),
            ));
        }

        self.state = AcquisitionState::Running;
        let total = self.plan.total_points();
        info!(
            "Starting acquisition of {} points x {} channels into {:?}",
            total,
            self.channels.len(),
            self.experiment_dir
        );
        self.send_event(AcquisitionEvent::Started {
            experiment_dir: self.experiment_dir.clone(),
            total_points: total,
        });

        let started = self.clock.now();
        let mut progress = Progress::default();
        let mut origin = self.stage.position();

        let mut abort_reason = match self.home_axes() {
            Ok(()) => {
                origin = self.stage.position();
                match self.traverse(origin, started, timeout, &mut progress) {
                    Ok(reason) => reason,
                    Err(e) => Some(AbortReason::Failed(e)),
                }
            }
            Err(e) => Some(AbortReason::Failed(e)),
        };

        if abort_reason.is_none() && self.plan.return_to_origin {
            if let Err(e) = self.return_to(origin) {
                abort_reason = Some(AbortReason::Failed(e));
            }
        }

        if let Some(AbortReason::Failed(_)) = abort_reason {
            if let Err(e) = self.stage.turn_off_illumination() {
                warn!("Could not switch illumination off after failure: {e}");
            }
        }

        let points_completed = progress.completed_points.len() as u64;
        match &abort_reason {
            None => {
                self.state = AcquisitionState::Completed;
                info!(
                    "Acquisition finished: {} points, {} frames",
                    points_completed, progress.frames_captured
                );
                self.send_event(AcquisitionEvent::Finished {
                    points_completed,
                    frames_captured: progress.frames_captured,
                });
            }
            Some(reason) => {
                self.state = AcquisitionState::Aborted;
                match reason {
                    AbortReason::Failed(_) => error!("Acquisition aborted: {reason}"),
                    _ => warn!("Acquisition aborted: {reason}"),
                }
                self.send_event(AcquisitionEvent::Aborted {
                    reason: reason.to_string(),
                    points_completed,
                });
            }
        }

        Ok(AcquisitionReport {
            state: self.state,
            abort_reason,
            experiment_dir: self.experiment_dir.clone(),
            origin,
            completed_points: progress.completed_points,
            frames_captured: progress.frames_captured,
            autofocus_runs: progress.autofocus_runs,
            autofocus_failures: progress.autofocus_failures,
        })
    }
}
