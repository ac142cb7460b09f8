//! Multi-dimensional acquisition and plate reading: plans, collaborators
//! and the jobs that drive the stage.

mod collaborators;
mod plan;
mod plate_reader;
mod sequencer;

pub use collaborators::{Autofocus, Clock, ImageCapture, ManualClock, SystemClock};
pub use plan::{
    AcquisitionPlan, AcquisitionPoint, AutofocusSchedule, FrameSite, FrameTag, MAX_AXIAL_STEP_MM,
    MAX_FIELDS_PER_AXIS, MAX_INTERVAL_S, MAX_LATERAL_STEP_MM, MAX_TIMEPOINTS, MAX_Z_PLANES,
};
pub use plate_reader::{PlateReadPlan, PlateReadReport, PlateReader};
pub use sequencer::{AcquisitionReport, Sequencer};

use crate::error::ScopeError;
use crate::plate::Well;
use crate::stage::StageController;
use crate::types::StagePosition;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    Configured,
    Running,
    Completed,
    Aborted,
}

/// Why a run ended before visiting every point.
#[derive(Debug)]
pub enum AbortReason {
    Requested,
    TimedOut,
    Failed(ScopeError),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Requested => write!(f, "abort requested"),
            AbortReason::TimedOut => write!(f, "acquisition timed out"),
            AbortReason::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Progress notification sent from the acquisition worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AcquisitionEvent {
    Started {
        experiment_dir: PathBuf,
        total_points: u64,
    },
    PointStarted {
        point: AcquisitionPoint,
        position: StagePosition,
    },
    AutofocusCompleted {
        point: AcquisitionPoint,
        z_mm: f64,
    },
    AutofocusFailed {
        point: AcquisitionPoint,
        message: String,
    },
    FrameCaptured {
        site: FrameSite,
        channel: String,
        stem: String,
    },
    PointCompleted {
        point: AcquisitionPoint,
        completed: u64,
        total: u64,
    },
    WellStarted {
        well: Well,
        position: StagePosition,
    },
    WellCompleted {
        well: Well,
        completed: u64,
        total: u64,
    },
    TimepointCompleted {
        t: u32,
        elapsed_ms: u64,
        wait_ms: u64,
    },
    Finished {
        points_completed: u64,
        frames_captured: u64,
    },
    Aborted {
        reason: String,
        points_completed: u64,
    },
}

/// Shared abort flag, observed at loop boundaries.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag, e.g. one set by a Ctrl+C handler
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a worker thread hands back: the report and the stage it borrowed.
pub struct AcquisitionOutcome<R = AcquisitionReport> {
    pub report: Result<R, ScopeError>,
    pub stage: StageController,
}

/// Control handle of a job running on a worker thread.
///
/// The event channel closes when the job ends.
pub struct AcquisitionHandle<R = AcquisitionReport> {
    join: JoinHandle<AcquisitionOutcome<R>>,
    events: Receiver<AcquisitionEvent>,
    abort: AbortHandle,
}

impl<R> AcquisitionHandle<R> {
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn events(&self) -> &Receiver<AcquisitionEvent> {
        &self.events
    }

    pub fn join(self) -> Result<AcquisitionOutcome<R>, ScopeError> {
        self.join
            .join()
            .map_err(|_| ScopeError::Collaborator("acquisition worker panicked".to_string()))
    }
}

fn spawn_worker<R, F>(events: Receiver<AcquisitionEvent>, abort: AbortHandle, work: F) -> AcquisitionHandle<R>
where
    R: Send + 'static,
    F: FnOnce() -> AcquisitionOutcome<R> + Send + 'static,
{
    AcquisitionHandle {
        join: thread::spawn(work),
        events,
        abort,
    }
}
