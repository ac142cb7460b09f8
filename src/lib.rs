pub mod acquisition;
pub mod channels;
pub mod config;
pub mod error;
pub mod job;
pub mod link;
pub mod logger;
pub mod plate;
pub mod protocol;
pub mod simulator;
pub mod stage;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod units;
pub mod utils;

pub use acquisition::{
    AbortHandle, AbortReason, AcquisitionEvent, AcquisitionHandle, AcquisitionOutcome,
    AcquisitionPlan, AcquisitionPoint, AcquisitionReport, AcquisitionState, Autofocus,
    AutofocusSchedule, Clock, FrameSite, FrameTag, ImageCapture, ManualClock, PlateReadPlan,
    PlateReadReport, PlateReader, Sequencer, SystemClock,
};
pub use channels::{ChannelConfiguration, ChannelRegistry};
pub use config::{load_config, load_config_or_default, AppConfig};
pub use error::{ProtocolError, ScopeError};
pub use job::Job;
pub use link::{DeviceLink, LinkConfig, LinkState};
pub use logger::EventLogger;
pub use plate::{Well, WellPlate};
pub use protocol::{Command, ExecutionReport, IlluminationIntensity, RgbWeights};
pub use simulator::SimulatedController;
pub use stage::{StageConfig, StageController, StageEvent};
pub use tracker::{PositionReader, PositionSource, PositionTracker};
pub use transport::{SerialConfig, SerialTransport, Transport};
pub use types::{
    Axis, ExecutionStatus, HomeOrZero, HomingPolarity, IlluminationSource, StagePosition,
};
pub use units::{AxisCalibration, StageCalibration};
