use scope_motion::{ChannelConfiguration, FrameTag, ImageCapture, PositionReader, ScopeError};
use serde::Serialize;
use std::fs;

#[derive(Serialize)]
struct FrameRecord<'a> {
    stem: String,
    channel: &'a str,
    exposure_ms: f64,
    analog_gain: f64,
    intensity: f64,
    x_mm: f64,
    y_mm: f64,
    z_mm: f64,
}

/// Stand-in camera: records what would have been captured as a JSON sidecar
/// per frame, in the folder the image would go to.
pub struct MetadataCapture {
    reader: PositionReader,
    channel: Option<ChannelConfiguration>,
}

impl MetadataCapture {
    pub fn new(reader: PositionReader) -> Self {
        Self { reader, channel: None }
    }
}

impl ImageCapture for MetadataCapture {
    fn apply_settings(&mut self, channel: &ChannelConfiguration) -> Result<(), ScopeError> {
        log::debug!(
            "Camera: exposure {} ms, gain {}",
            channel.exposure_ms,
            channel.analog_gain
        );
        self.channel = Some(channel.clone());
        Ok(())
    }

    fn capture(&mut self, tag: &FrameTag) -> Result<(), ScopeError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| ScopeError::Collaborator("capture before camera settings".to_string()))?;
        let position = self.reader.snapshot();

        fs::create_dir_all(&tag.directory).map_err(|source| ScopeError::Io {
            source,
            context: format!("Could not create {:?}", tag.directory),
        })?;
        let record = FrameRecord {
            stem: tag.stem(),
            channel: &channel.name,
            exposure_ms: channel.exposure_ms,
            analog_gain: channel.analog_gain,
            intensity: channel.intensity,
            x_mm: position.x,
            y_mm: position.y,
            z_mm: position.z,
        };
        let path = tag.path("json");
        fs::write(&path, serde_json::to_vec_pretty(&record)?).map_err(|source| ScopeError::Io {
            source,
            context: format!("Could not write {path:?}"),
        })
    }
}
