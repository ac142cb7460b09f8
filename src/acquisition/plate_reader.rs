//! Plate reading: every row of the selected plate columns, imaged in each
//! selected channel.

use super::collaborators::{expose_frame, Clock, ImageCapture, SystemClock};
use super::plan::{experiment_folder, FrameSite, FrameTag};
use super::{
    spawn_worker, AbortHandle, AbortReason, AcquisitionEvent, AcquisitionHandle, AcquisitionOutcome,
    AcquisitionState,
};
use crate::channels::{ChannelConfiguration, ChannelRegistry};
use crate::error::ScopeError;
use crate::job::Job;
use crate::plate::{Well, WellPlate};
use crate::stage::StageController;
use crate::types::Axis;
use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Plate reading request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateReadPlan {
    /// Plate columns as printed on the plate (1-based), read in this order
    pub columns: Vec<u8>,
    /// Channel configuration ids, imaged in this order in every well
    pub channel_ids: Vec<u32>,
    pub base_path: PathBuf,
    pub experiment_id: String,
}

impl Default for PlateReadPlan {
    fn default() -> Self {
        Self {
            columns: vec![1],
            channel_ids: vec![1],
            base_path: PathBuf::from("acquisitions"),
            experiment_id: "plate".to_string(),
        }
    }
}

impl PlateReadPlan {
    /// Check the plan against the plate and resolve its channels
    pub fn validate(
        &self,
        plate: &WellPlate,
        channels: &ChannelRegistry,
    ) -> Result<Vec<ChannelConfiguration>, ScopeError> {
        plate.validate()?;
        if self.columns.is_empty() {
            return Err(ScopeError::Configuration(
                "plate reading selects no column".to_string(),
            ));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if *column == 0 || *column > plate.columns {
                return Err(ScopeError::Configuration(format!(
                    "column {column} is not on the {}-column plate",
                    plate.columns
                )));
            }
            if self.columns[..i].contains(column) {
                return Err(ScopeError::Configuration(format!(
                    "column {column} selected twice"
                )));
            }
        }
        if self.channel_ids.is_empty() {
            return Err(ScopeError::Configuration(
                "plate reading selects no channel configuration".to_string(),
            ));
        }
        channels.select(&self.channel_ids)
    }

    /// Wells in visiting order: column by column, rows A downward
    pub fn wells(&self, plate: &WellPlate) -> Vec<Well> {
        self.columns
            .iter()
            .flat_map(|column| {
                (0..plate.rows).map(move |row| Well {
                    row,
                    column: column.saturating_sub(1),
                })
            })
            .collect()
    }
}

/// Result of one plate read. Wells read before an abort are kept.
#[derive(Debug)]
pub struct PlateReadReport {
    pub state: AcquisitionState,
    pub abort_reason: Option<AbortReason>,
    pub experiment_dir: PathBuf,
    pub completed_wells: Vec<Well>,
    pub frames_captured: u64,
}

impl PlateReadReport {
    pub fn is_completed(&self) -> bool {
        self.state == AcquisitionState::Completed
    }
}

/// Visits the wells of a [`PlateReadPlan`] and images them.
///
/// X and Y must have been homed on the stage before the run starts, since
/// well centers are absolute stage coordinates.
pub struct PlateReader {
    stage: StageController,
    plate: WellPlate,
    wells: Vec<Well>,
    channels: Vec<ChannelConfiguration>,
    capture: Box<dyn ImageCapture>,
    clock: Box<dyn Clock>,
    abort: AbortHandle,
    event_sender: Option<Sender<AcquisitionEvent>>,
    state: AcquisitionState,
    experiment_dir: PathBuf,
}

impl PlateReader {
    pub fn new(
        stage: StageController,
        plate: WellPlate,
        plan: &PlateReadPlan,
        channels: &ChannelRegistry,
        capture: Box<dyn ImageCapture>,
    ) -> Result<Self, ScopeError> {
        let channels = plan.validate(&plate, channels)?;
        let wells = plan.wells(&plate);
        let experiment_dir = experiment_folder(&plan.base_path, &plan.experiment_id, &Local::now());

        Ok(Self {
            stage,
            plate,
            wells,
            channels,
            capture,
            clock: Box::new(SystemClock::default()),
            abort: AbortHandle::new(),
            event_sender: None,
            state: AcquisitionState::Configured,
            experiment_dir,
        })
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn set_event_sender(&mut self, sender: Sender<AcquisitionEvent>) {
        self.event_sender = Some(sender);
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
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

    /// Run on a worker thread; events arrive on the handle's channel
    pub fn spawn(mut self, timeout: Duration) -> AcquisitionHandle<PlateReadReport> {
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

    fn read_well(&mut self, well: Well, frames: &mut u64) -> Result<(), ScopeError> {
        self.plate.move_to_well(&mut self.stage, well)?;
        let calibration = self.stage.calibration();
        let settle = calibration.x.stabilization().max(calibration.y.stabilization());
        self.clock.sleep(settle);
        self.send_event(AcquisitionEvent::WellStarted {
            well,
            position: self.stage.position(),
        });

        for channel in self.channels.clone() {
            let tag = FrameTag::for_well(&self.experiment_dir, well, &channel);
            expose_frame(
                &mut self.stage,
                self.capture.as_mut(),
                self.clock.as_ref(),
                &channel,
                &tag,
            )?;
            *frames += 1;
            self.send_event(AcquisitionEvent::FrameCaptured {
                site: FrameSite::Well(well),
                channel: channel.name.clone(),
                stem: tag.stem(),
            });
        }
        Ok(())
    }
}

impl Job for PlateReader {
    type Output = PlateReadReport;

    fn run(&mut self, timeout: Duration) -> Result<PlateReadReport, ScopeError> {
        if self.state != AcquisitionState::Configured {
            return Err(ScopeError::Configuration(
                "this plate read has already been run".to_string(),
            ));
        }
        if !self.stage.is_homed(Axis::Xy) {
            return Err(ScopeError::Configuration(
                "home X and Y before reading a plate".to_string(),
            ));
        }

        self.state = AcquisitionState::Running;
        let total = self.wells.len() as u64;
        info!(
            "Reading {} wells x {} channels into {:?}",
            total,
            self.channels.len(),
            self.experiment_dir
        );
        self.send_event(AcquisitionEvent::Started {
            experiment_dir: self.experiment_dir.clone(),
            total_points: total,
        });

        let started = self.clock.now();
        let mut completed_wells = Vec::new();
        let mut frames_captured = 0u64;
        let mut abort_reason = None;

        for well in self.wells.clone() {
            if self.abort.is_aborted() {
                abort_reason = Some(AbortReason::Requested);
                break;
            }
            if self.clock.now().saturating_sub(started) >= timeout {
                abort_reason = Some(AbortReason::TimedOut);
                break;
            }
            if let Err(e) = self.read_well(well, &mut frames_captured) {
                abort_reason = Some(AbortReason::Failed(e));
                break;
            }
            completed_wells.push(well);
            self.send_event(AcquisitionEvent::WellCompleted {
                well,
                completed: completed_wells.len() as u64,
                total,
            });
        }

        let wells_completed = completed_wells.len() as u64;
        match &abort_reason {
            None => {
                self.state = AcquisitionState::Completed;
                info!("Plate read finished: {wells_completed} wells, {frames_captured} frames");
                self.send_event(AcquisitionEvent::Finished {
                    points_completed: wells_completed,
                    frames_captured,
                });
            }
            Some(reason) => {
                self.state = AcquisitionState::Aborted;
                if let AbortReason::Failed(_) = reason {
                    error!("Plate read aborted: {reason}");
                    if let Err(e) = self.stage.turn_off_illumination() {
                        warn!("Could not switch illumination off after failure: {e}");
                    }
                } else {
                    warn!("Plate read aborted: {reason}");
                }
                self.send_event(AcquisitionEvent::Aborted {
                    reason: reason.to_string(),
                    points_completed: wells_completed,
                });
            }
        }

        Ok(PlateReadReport {
            state: self.state,
            abort_reason,
            experiment_dir: self.experiment_dir.clone(),
            completed_wells,
            frames_captured,
        })
    }
}
