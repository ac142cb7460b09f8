use crate::channels::{ChannelConfiguration, ChannelRegistry};
use crate::error::ScopeError;
use crate::plate::Well;
use crate::types::Axis;
use crate::units::StageCalibration;
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_FIELDS_PER_AXIS: u32 = 50;
pub const MAX_Z_PLANES: u32 = 100;
pub const MAX_TIMEPOINTS: u32 = 50_000;
pub const MAX_LATERAL_STEP_MM: f64 = 5.0;
pub const MAX_AXIAL_STEP_MM: f64 = 1.0;
pub const MAX_INTERVAL_S: f64 = 12.0 * 3600.0;

/// Which fields of a z/t pass get autofocused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutofocusSchedule {
    /// The first `count` fields of every z/t pass
    FirstFields { count: u32 },
    /// Every `n`th field of every z/t pass, starting with the first
    EveryNth { n: u32 },
}

impl Default for AutofocusSchedule {
    fn default() -> Self {
        AutofocusSchedule::FirstFields { count: 3 }
    }
}

impl AutofocusSchedule {
    /// `field` is the zero-based index of the field within its z/t pass
    pub fn applies(&self, field: u64) -> bool {
        match *self {
            AutofocusSchedule::FirstFields { count } => field < count as u64,
            AutofocusSchedule::EveryNth { n } => n > 0 && field % n as u64 == 0,
        }
    }
}

/// Grid indices of one field of view at one timepoint.
///
/// Field order makes the derived ordering match traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AcquisitionPoint {
    pub t: u32,
    pub z: u32,
    pub y: u32,
    pub x: u32,
}

impl fmt::Display for AcquisitionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{} z{} y{} x{}", self.t, self.z, self.y, self.x)
    }
}

/// Multi-dimensional acquisition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionPlan {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub nt: u32,
    pub dx_mm: f64,
    pub dy_mm: f64,
    pub dz_mm: f64,
    /// Interval between timepoint starts
    pub dt_s: f64,
    /// Channel configuration ids, imaged in this order at every field
    pub channel_ids: Vec<u32>,
    pub with_autofocus: bool,
    pub autofocus: AutofocusSchedule,
    pub autofocus_timeout_ms: u64,
    /// Axes homed before traversal starts
    pub home_axes: Vec<Axis>,
    pub return_to_origin: bool,
    pub base_path: PathBuf,
    pub experiment_id: String,
}

impl Default for AcquisitionPlan {
    fn default() -> Self {
        Self {
            nx: 1,
            ny: 1,
            nz: 1,
            nt: 1,
            dx_mm: 0.0,
            dy_mm: 0.0,
            dz_mm: 0.0,
            dt_s: 0.0,
            channel_ids: vec![1],
            with_autofocus: false,
            autofocus: AutofocusSchedule::default(),
            autofocus_timeout_ms: 30_000,
            home_axes: Vec::new(),
            return_to_origin: true,
            base_path: PathBuf::from("acquisitions"),
            experiment_id: "experiment".to_string(),
        }
    }
}

impl AcquisitionPlan {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.dt_s.max(0.0))
    }

    pub fn autofocus_timeout(&self) -> Duration {
        Duration::from_millis(self.autofocus_timeout_ms)
    }

    pub fn fields_per_pass(&self) -> u64 {
        self.nx as u64 * self.ny as u64
    }

    pub fn total_points(&self) -> u64 {
        self.fields_per_pass() * self.nz as u64 * self.nt as u64
    }

    /// Copy of the plan with grid spacing snapped to whole microsteps
    pub fn snapped(&self, calibration: &StageCalibration) -> Self {
        Self {
            dx_mm: calibration.x.snap(self.dx_mm),
            dy_mm: calibration.y.snap(self.dy_mm),
            dz_mm: calibration.z.snap(self.dz_mm),
            ..self.clone()
        }
    }

    /// Check the plan against the machine and resolve its channels
    pub fn validate(
        &self,
        channels: &ChannelRegistry,
        calibration: &StageCalibration,
    ) -> Result<Vec<ChannelConfiguration>, ScopeError> {
        check_count("nx", self.nx, MAX_FIELDS_PER_AXIS)?;
        check_count("ny", self.ny, MAX_FIELDS_PER_AXIS)?;
        check_count("nz", self.nz, MAX_Z_PLANES)?;
        check_count("nt", self.nt, MAX_TIMEPOINTS)?;
        check_range("dx_mm", self.dx_mm, MAX_LATERAL_STEP_MM)?;
        check_range("dy_mm", self.dy_mm, MAX_LATERAL_STEP_MM)?;
        check_range("dz_mm", self.dz_mm, MAX_AXIAL_STEP_MM)?;
        check_range("dt_s", self.dt_s, MAX_INTERVAL_S)?;

        if self.with_autofocus {
            match self.autofocus {
                AutofocusSchedule::EveryNth { n: 0 } => {
                    return Err(ScopeError::Configuration(
                        "autofocus schedule every_nth needs n >= 1".to_string(),
                    ));
                }
                _ if self.autofocus_timeout_ms == 0 => {
                    return Err(ScopeError::Configuration(
                        "autofocus_timeout_ms must be positive".to_string(),
                    ));
                }
                _ => {}
            }
        }

        for axis in &self.home_axes {
            if !calibration.homing_enabled(*axis) {
                return Err(ScopeError::Configuration(format!(
                    "plan homes axis {axis} but homing is disabled for it"
                )));
            }
        }

        if self.channel_ids.is_empty() {
            return Err(ScopeError::Configuration(
                "plan selects no channel configuration".to_string(),
            ));
        }
        channels.select(&self.channel_ids)
    }

    /// `<base>/<experiment_id>_<YYYY-MM-DD_HH-MM-SS>`
    pub fn experiment_dir<Tz>(&self, started: &DateTime<Tz>) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        experiment_folder(&self.base_path, &self.experiment_id, started)
    }
}

/// Timestamped experiment folder under `base`; the id is left out when empty
pub(crate) fn experiment_folder<Tz>(base: &Path, experiment_id: &str, started: &DateTime<Tz>) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let stamp = started.format("%Y-%m-%d_%H-%M-%S");
    let name = if experiment_id.is_empty() {
        stamp.to_string()
    } else {
        format!("{experiment_id}_{stamp}")
    };
    base.join(name)
}

fn check_count(name: &str, value: u32, max: u32) -> Result<(), ScopeError> {
    if value == 0 || value > max {
        return Err(ScopeError::Configuration(format!(
            "{name} must be within 1..={max}, got {value}"
        )));
    }
    Ok(())
}

fn check_range(name: &str, value: f64, max: f64) -> Result<(), ScopeError> {
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(ScopeError::Configuration(format!(
            "{name} must be within 0..={max}, got {value}"
        )));
    }
    Ok(())
}

/// Where on the sample a frame was taken.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSite {
    Grid(AcquisitionPoint),
    Well(Well),
}

/// Identifies one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTag {
    pub site: FrameSite,
    pub channel: String,
    /// Folder the frame belongs in
    pub directory: PathBuf,
}

impl FrameTag {
    /// Grid frame, stored in the folder of its timepoint
    pub fn new(experiment_dir: &Path, point: AcquisitionPoint, channel: &ChannelConfiguration) -> Self {
        Self {
            site: FrameSite::Grid(point),
            channel: channel.file_tag(),
            directory: experiment_dir.join(point.t.to_string()),
        }
    }

    /// Plate frame, stored directly in the experiment folder
    pub fn for_well(experiment_dir: &Path, well: Well, channel: &ChannelConfiguration) -> Self {
        Self {
            site: FrameSite::Well(well),
            channel: channel.file_tag(),
            directory: experiment_dir.to_path_buf(),
        }
    }

    /// `y_x_z_<channel>` for grid frames, `<well>_<channel>` for plate frames
    pub fn stem(&self) -> String {
        match self.site {
            FrameSite::Grid(p) => format!("{}_{}_{}_{}", p.y, p.x, p.z, self.channel),
            FrameSite::Well(well) => format!("{}_{}", well, self.channel),
        }
    }

    pub fn path(&self, extension: &str) -> PathBuf {
        self.directory.join(format!("{}.{}", self.stem(), extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_autofocus_schedules() {
        let first = AutofocusSchedule::default();
        let hits: Vec<u64> = (0..10).filter(|f| first.applies(*f)).collect();
        assert_eq!(hits, vec![0, 1, 2]);

        let nth = AutofocusSchedule::EveryNth { n: 4 };
        let hits: Vec<u64> = (0..10).filter(|f| nth.applies(*f)).collect();
        assert_eq!(hits, vec![0, 4, 8]);
    }

    #[test]
    fn test_validate_rejects_homing_disabled_axis() {
        let plan = AcquisitionPlan { home_axes: vec![Axis::Z], ..Default::default() };
        let err = plan
            .validate(&ChannelRegistry::default(), &StageCalibration::default())
            .unwrap_err();
        assert!(matches!(err, ScopeError::Configuration(_)));

        let plan = AcquisitionPlan { home_axes: vec![Axis::Xy], ..Default::default() };
        assert!(plan.validate(&ChannelRegistry::default(), &StageCalibration::default()).is_ok());
    }

    #[test]
    fn test_validate_limits_and_channels() {
        let registry = ChannelRegistry::default();
        let calibration = StageCalibration::default();
        let bad = [
            AcquisitionPlan { nx: 0, ..Default::default() },
            AcquisitionPlan { nz: 101, ..Default::default() },
            AcquisitionPlan { dx_mm: -0.1, ..Default::default() },
            AcquisitionPlan { dt_s: f64::NAN, ..Default::default() },
            AcquisitionPlan { channel_ids: vec![], ..Default::default() },
            AcquisitionPlan { channel_ids: vec![99], ..Default::default() },
            AcquisitionPlan {
                with_autofocus: true,
                autofocus: AutofocusSchedule::EveryNth { n: 0 },
                ..Default::default()
            },
        ];
        for plan in bad {
            assert!(plan.validate(&registry, &calibration).is_err(), "{plan:?}");
        }

        let plan = AcquisitionPlan { channel_ids: vec![5, 1], ..Default::default() };
        let channels = plan.validate(&registry, &calibration).unwrap();
        assert_eq!(channels.iter().map(|c| c.id).collect::<Vec<_>>(), vec![5, 1]);
    }

    #[test]
    fn test_snapped_spacing() {
        let plan = AcquisitionPlan { dx_mm: 0.10003, dz_mm: 0.0015, ..Default::default() };
        let snapped = plan.snapped(&StageCalibration::default());
        assert_eq!(snapped.dx_mm, 160.0 / 1600.0);
        let z_step = 0.3048 / 1600.0;
        assert!((snapped.dz_mm / z_step - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_experiment_dir_and_frame_names() {
        let plan = AcquisitionPlan {
            base_path: PathBuf::from("/data"),
            experiment_id: "blood_smear".to_string(),
            ..Default::default()
        };
        let started = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let dir = plan.experiment_dir(&started);
        assert_eq!(dir, PathBuf::from("/data/blood_smear_2024-03-05_14-07-09"));

        let channel = ChannelRegistry::default().get(6).cloned().unwrap();
        let tag = FrameTag::new(&dir, AcquisitionPoint { t: 2, z: 1, y: 3, x: 4 }, &channel);
        assert_eq!(tag.stem(), "3_4_1_Fluorescence_488_nm_Ex");
        assert_eq!(
            tag.path("bmp"),
            PathBuf::from("/data/blood_smear_2024-03-05_14-07-09/2/3_4_1_Fluorescence_488_nm_Ex.bmp")
        );

        let tag = FrameTag::for_well(&dir, Well { row: 1, column: 2 }, &channel);
        assert_eq!(
            tag.path("bmp"),
            PathBuf::from("/data/blood_smear_2024-03-05_14-07-09/B3_Fluorescence_488_nm_Ex.bmp")
        );
    }
}
