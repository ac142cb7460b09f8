mod capture;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, unbounded, Receiver};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use scope_motion::{
    load_config_or_default, AbortHandle, AcquisitionEvent, AcquisitionHandle, AcquisitionOutcome,
    AppConfig, Axis, DeviceLink, EventLogger, PlateReadPlan, PlateReader, Sequencer,
    SerialTransport, SimulatedController, StageController, StageEvent, Transport, Well,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::capture::MetadataCapture;

/// Microscope stage control and acquisition tool
#[derive(Parser, Debug)]
#[command(name = "scope-acq")]
#[command(about = "Stage control and multi-dimensional acquisition", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Talk to the built-in simulated controller instead of the serial port
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,
    /// Home an axis against its limit switch
    Home {
        #[arg(short, long, default_value = "xy")]
        axis: String,
    },
    /// Declare the current position of an axis as zero
    Zero {
        #[arg(short, long)]
        axis: String,
    },
    /// Move an axis by or to a position in mm
    Move {
        #[arg(short, long)]
        axis: String,
        /// Relative distance
        #[arg(long, conflicts_with = "to", allow_hyphen_values = true)]
        by: Option<f64>,
        /// Absolute target
        #[arg(long, allow_hyphen_values = true)]
        to: Option<f64>,
    },
    /// Move over the center of a well, e.g. B3
    Well { name: String },
    /// Run the acquisition configured in the [acquisition] section
    Acquire {
        #[arg(long)]
        nx: Option<u32>,
        #[arg(long)]
        ny: Option<u32>,
        #[arg(long)]
        nz: Option<u32>,
        #[arg(long)]
        nt: Option<u32>,
        #[arg(long)]
        dx_mm: Option<f64>,
        #[arg(long)]
        dy_mm: Option<f64>,
        #[arg(long)]
        dz_mm: Option<f64>,
        #[arg(long)]
        dt_s: Option<f64>,
        /// Comma separated channel configuration ids
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<u32>>,
        #[arg(long)]
        experiment_id: Option<String>,
        #[arg(long, value_name = "DIR")]
        base_path: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 24 * 3600)]
        timeout_s: u64,
    },
    /// Image every well of the selected plate columns
    Plate {
        /// Comma separated plate columns, numbered as printed on the plate
        #[arg(long, value_delimiter = ',', default_value = "1")]
        columns: Vec<u8>,
        /// Comma separated channel configuration ids
        #[arg(long, value_delimiter = ',', default_value = "1")]
        channels: Vec<u32>,
        #[arg(long, default_value = "plate")]
        experiment_id: String,
        #[arg(long, value_name = "DIR", default_value = "acquisitions")]
        base_path: PathBuf,
        /// Home X and Y before reading
        #[arg(long)]
        home: bool,
        #[arg(long, default_value_t = 24 * 3600)]
        timeout_s: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
enum EventRecord {
    Acquisition(AcquisitionEvent),
    Stage(StageEvent),
}

#[derive(Debug, Serialize, Deserialize)]
struct LoggedEvent {
    timestamp: DateTime<Utc>,
    record: EventRecord,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level);
    log_startup_info(&config, &args);

    if let Commands::Ports = args.command {
        for port in SerialTransport::available_ports()? {
            println!("{port}");
        }
        return Ok(());
    }

    let mut stage = connect_stage(&config, args.simulate)?;

    match args.command {
        Commands::Ports => {}
        Commands::Home { axis } => {
            let position = stage.home(parse_axis(&axis)?)?;
            info!("Homed: {position}");
        }
        Commands::Zero { axis } => {
            let position = stage.zero(parse_axis(&axis)?)?;
            info!("Zeroed: {position}");
        }
        Commands::Move { axis, by, to } => {
            let axis = parse_axis(&axis)?;
            let position = match (by, to) {
                (Some(delta), None) => stage.move_relative(axis, delta)?,
                (None, Some(target)) => stage.move_to(axis, target)?,
                _ => return Err("pass exactly one of --by or --to".into()),
            };
            info!("Now at {position}");
        }
        Commands::Well { name } => {
            let well: Well = name.parse()?;
            let position = config.plate.move_to_well(&mut stage, well)?;
            info!("Over well {well}: {position}");
        }
        Commands::Acquire {
            nx,
            ny,
            nz,
            nt,
            dx_mm,
            dy_mm,
            dz_mm,
            dt_s,
            channels,
            experiment_id,
            base_path,
            timeout_s,
        } => {
            let mut plan = config.acquisition.clone();
            plan.nx = nx.unwrap_or(plan.nx);
            plan.ny = ny.unwrap_or(plan.ny);
            plan.nz = nz.unwrap_or(plan.nz);
            plan.nt = nt.unwrap_or(plan.nt);
            plan.dx_mm = dx_mm.unwrap_or(plan.dx_mm);
            plan.dy_mm = dy_mm.unwrap_or(plan.dy_mm);
            plan.dz_mm = dz_mm.unwrap_or(plan.dz_mm);
            plan.dt_s = dt_s.unwrap_or(plan.dt_s);
            if let Some(ids) = channels {
                plan.channel_ids = ids;
            }
            if let Some(id) = experiment_id {
                plan.experiment_id = id;
            }
            if let Some(path) = base_path {
                plan.base_path = path;
            }
            if plan.with_autofocus {
                warn!("No autofocus is available in this tool, running without it");
                plan.with_autofocus = false;
            }

            let (stage_tx, stage_rx) = unbounded();
            stage.set_event_sender(stage_tx);
            run_acquisition(&config, stage, plan, stage_rx, Duration::from_secs(timeout_s))?;
        }
        Commands::Plate {
            columns,
            channels,
            experiment_id,
            base_path,
            home,
            timeout_s,
        } => {
            if home {
                let position = stage.home(Axis::Xy)?;
                info!("Homed: {position}");
            }
            let plan = PlateReadPlan {
                columns,
                channel_ids: channels,
                base_path,
                experiment_id,
            };
            let (stage_tx, stage_rx) = unbounded();
            stage.set_event_sender(stage_tx);
            run_plate_read(&config, stage, plan, stage_rx, Duration::from_secs(timeout_s))?;
        }
    }

    Ok(())
}

fn connect_stage(
    config: &AppConfig,
    simulate: bool,
) -> Result<StageController, Box<dyn std::error::Error>> {
    let transport: Box<dyn Transport> = if simulate {
        info!("Using simulated controller");
        Box::new(SimulatedController::new())
    } else {
        Box::new(SerialTransport::open(&config.serial)?)
    };
    let link = DeviceLink::new(transport, config.link.clone());
    Ok(StageController::new(link, &config.stage))
}

fn run_acquisition(
    config: &AppConfig,
    stage: StageController,
    plan: scope_motion::AcquisitionPlan,
    stage_events: Receiver<StageEvent>,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let capture = MetadataCapture::new(stage.reader());
    let shutdown_flag = setup_shutdown_handler()?;

    let sequencer = Sequencer::new(stage, plan, &config.channels, Box::new(capture))?
        .with_abort_handle(AbortHandle::from_flag(shutdown_flag.clone()));

    let experiment_dir = sequencer.experiment_dir().to_path_buf();
    let mut event_log = open_event_log(config, &experiment_dir)?;
    let outcome = drive(sequencer.spawn(timeout), &stage_events, &mut event_log)?;

    let report = outcome.report?;
    if report.is_completed() {
        info!(
            "Acquisition completed: {} points, {} frames",
            report.points_completed(),
            report.frames_captured
        );
        Ok(())
    } else if shutdown_flag.load(Ordering::SeqCst) {
        info!(
            "Acquisition stopped by user after {} points",
            report.points_completed()
        );
        Ok(())
    } else {
        let reason = report
            .abort_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        error!("Acquisition aborted: {reason}");
        Err(reason.into())
    }
}

fn run_plate_read(
    config: &AppConfig,
    stage: StageController,
    plan: PlateReadPlan,
    stage_events: Receiver<StageEvent>,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let capture = MetadataCapture::new(stage.reader());
    let shutdown_flag = setup_shutdown_handler()?;

    let reader = PlateReader::new(
        stage,
        config.plate.clone(),
        &plan,
        &config.channels,
        Box::new(capture),
    )?
    .with_abort_handle(AbortHandle::from_flag(shutdown_flag.clone()));

    let experiment_dir = reader.experiment_dir().to_path_buf();
    let mut event_log = open_event_log(config, &experiment_dir)?;
    let outcome = drive(reader.spawn(timeout), &stage_events, &mut event_log)?;

    let report = outcome.report?;
    let wells = report.completed_wells.len();
    if report.is_completed() {
        info!("Plate read completed: {wells} wells, {} frames", report.frames_captured);
        Ok(())
    } else if shutdown_flag.load(Ordering::SeqCst) {
        info!("Plate read stopped by user after {wells} wells");
        Ok(())
    } else {
        let reason = report
            .abort_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        error!("Plate read aborted: {reason}");
        Err(reason.into())
    }
}

fn open_event_log(
    config: &AppConfig,
    experiment_dir: &Path,
) -> Result<Option<EventLogger<LoggedEvent>>, Box<dyn std::error::Error>> {
    fs::create_dir_all(experiment_dir)?;
    info!("Saving to {}", experiment_dir.display());
    Ok(config.logging.event_log.then(|| {
        EventLogger::<LoggedEvent>::new(
            experiment_dir.join("events"),
            config.logging.event_log_buffer,
            true,
        )
    }))
}

/// Forward worker and stage events to the log until the worker finishes
fn drive<R>(
    handle: AcquisitionHandle<R>,
    stage_events: &Receiver<StageEvent>,
    event_log: &mut Option<EventLogger<LoggedEvent>>,
) -> Result<AcquisitionOutcome<R>, Box<dyn std::error::Error>> {
    loop {
        select! {
            recv(handle.events()) -> event => match event {
                Ok(event) => {
                    report_event(&event);
                    record(event_log, EventRecord::Acquisition(event))?;
                }
                Err(_) => break,
            },
            recv(stage_events) -> event => {
                if let Ok(event) = event {
                    record(event_log, EventRecord::Stage(event))?;
                }
            },
        }
    }

    let outcome = handle.join()?;
    for event in stage_events.try_iter() {
        record(event_log, EventRecord::Stage(event))?;
    }
    if let Some(log) = event_log.as_mut() {
        log.finalize_as_json()?;
    }
    Ok(outcome)
}

fn record(
    log: &mut Option<EventLogger<LoggedEvent>>,
    record: EventRecord,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(log) = log.as_mut() {
        log.add(LoggedEvent {
            timestamp: Utc::now(),
            record,
        })?;
    }
    Ok(())
}

fn report_event(event: &AcquisitionEvent) {
    match event {
        AcquisitionEvent::PointCompleted { point, completed, total } => {
            info!("[{completed}/{total}] {point}");
        }
        AcquisitionEvent::AutofocusFailed { point, message } => {
            warn!("Autofocus failed at {point}: {message}");
        }
        AcquisitionEvent::TimepointCompleted { t, wait_ms, .. } => {
            info!("Timepoint {t} done, waiting {wait_ms} ms");
        }
        AcquisitionEvent::WellCompleted { well, completed, total } => {
            info!("[{completed}/{total}] well {well}");
        }
        other => log::debug!("{other:?}"),
    }
}

fn parse_axis(name: &str) -> Result<Axis, Box<dyn std::error::Error>> {
    match name.to_lowercase().as_str() {
        "x" => Ok(Axis::X),
        "y" => Ok(Axis::Y),
        "z" => Ok(Axis::Z),
        "theta" => Ok(Axis::Theta),
        "xy" => Ok(Axis::Xy),
        other => Err(format!("unknown axis '{other}'").into()),
    }
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping at the next field...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

fn log_startup_info(config: &AppConfig, args: &Args) {
    info!("=== scope-acq ===");
    match &args.config {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    if args.simulate {
        info!("Controller: simulated");
    } else {
        info!(
            "Controller: {} @ {} baud",
            config.serial.port, config.serial.baud_rate
        );
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
