use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::acquisition::AcquisitionPlan;
use crate::channels::ChannelRegistry;
use crate::error::ScopeError;
use crate::link::LinkConfig;
use crate::plate::WellPlate;
use crate::stage::StageConfig;
use crate::transport::SerialConfig;

/// Machine configuration: built-in defaults, overlaid by an optional TOML
/// file, overlaid by `SCOPE__SECTION__KEY` environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub link: LinkConfig,
    pub stage: StageConfig,
    /// Defaults for `scope-acq acquire`
    pub acquisition: AcquisitionPlan,
    pub channels: ChannelRegistry,
    pub plate: WellPlate,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Write acquisition and stage events to a JSON log in the experiment folder
    pub event_log: bool,
    pub event_log_buffer: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            event_log: true,
            event_log_buffer: 50,
        }
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |section: &str, e: ScopeError| ConfigError::Message(format!("Invalid {section}: {e}"));

        self.stage.validate().map_err(|e| invalid("stage", e))?;
        self.channels.validate().map_err(|e| invalid("channels", e))?;
        self.plate.validate().map_err(|e| invalid("plate", e))?;

        if self.link.max_protocol_retries == 0 {
            return Err(ConfigError::Message(
                "Invalid link: max_protocol_retries must be at least 1".to_string(),
            ));
        }
        if self.link.command_timeout_ms == 0 || self.link.homing_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Invalid link: timeouts must be positive".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Message(
                "Invalid serial: baud_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    } else if let Some(path) = ["scope_config.toml", "config.toml"]
        .iter()
        .find(|p| Path::new(p).exists())
    {
        builder = builder.add_source(File::with_name(path));
    }

    builder = builder.add_source(
        Environment::with_prefix("SCOPE")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults when it cannot be read
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IlluminationSource;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.link.max_protocol_retries, 3);
        assert_eq!(config.stage.calibration.x.movement_sign, -1);
        assert_eq!(config.plate.rows, 8);
    }

    #[test]
    fn test_file_overrides_selected_keys() {
        let file = write_config(
            r#"
[serial]
port = "/dev/ttyUSB3"

[stage]
position_source = "command_echo"

[stage.calibration.z]
screw_pitch = 0.5
stabilization_ms = 40

[acquisition]
nx = 4
dx_mm = 0.9

[acquisition.autofocus]
kind = "every_nth"
n = 5
"#,
        );
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB3");
        assert_eq!(config.serial.baud_rate, 2_000_000);
        assert_eq!(config.stage.calibration.z.screw_pitch, 0.5);
        assert_eq!(config.stage.calibration.z.stabilization_ms, 40);
        assert_eq!(config.stage.calibration.z.microstepping, 8);
        assert_eq!(
            config.stage.position_source,
            crate::tracker::PositionSource::CommandEcho
        );
        assert_eq!(config.acquisition.nx, 4);
        assert_eq!(
            config.acquisition.autofocus,
            crate::acquisition::AutofocusSchedule::EveryNth { n: 5 }
        );
        assert_eq!(
            config.channels.get(1).map(|c| c.illumination_source),
            Some(IlluminationSource::LedArrayFull)
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config(
            r#"
[stage]
led_matrix_factors = [0.0, 2.0, 1.0]
"#,
        );
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let missing = Path::new("/nonexistent/scope_config.toml");
        assert!(load_config(Some(missing)).is_err());
        assert_eq!(load_config_or_default(Some(missing)), AppConfig::default());
    }
}
