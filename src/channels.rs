use crate::error::ScopeError;
use crate::types::IlluminationSource;
use serde::{Deserialize, Serialize};

/// Camera and illumination settings used to image one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfiguration {
    pub id: u32,
    pub name: String,
    pub exposure_ms: f64,
    pub analog_gain: f64,
    pub illumination_source: IlluminationSource,
    /// Percent, 0 to 100
    pub intensity: f64,
    /// Wait between turning the illumination on and triggering the camera
    #[serde(default)]
    pub settle_ms: u64,
}

impl ChannelConfiguration {
    pub fn new(id: u32, name: &str, illumination_source: IlluminationSource) -> Self {
        Self {
            id,
            name: name.to_string(),
            exposure_ms: 20.0,
            analog_gain: 0.0,
            illumination_source,
            intensity: 50.0,
            settle_ms: 0,
        }
    }

    pub fn with_exposure(mut self, exposure_ms: f64) -> Self {
        self.exposure_ms = exposure_ms;
        self
    }

    pub fn with_intensity(mut self, intensity: f64) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_settle_ms(mut self, settle_ms: u64) -> Self {
        self.settle_ms = settle_ms;
        self
    }

    /// Name safe for use in file names
    pub fn file_tag(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        if !(0.0..=100.0).contains(&self.intensity) {
            return Err(ScopeError::Configuration(format!(
                "channel '{}': intensity must be within 0..=100, got {}",
                self.name, self.intensity
            )));
        }
        if !(self.exposure_ms.is_finite() && self.exposure_ms > 0.0) {
            return Err(ScopeError::Configuration(format!(
                "channel '{}': exposure must be positive, got {} ms",
                self.name, self.exposure_ms
            )));
        }
        if !(self.analog_gain.is_finite() && self.analog_gain >= 0.0) {
            return Err(ScopeError::Configuration(format!(
                "channel '{}': analog gain must be non-negative",
                self.name
            )));
        }
        Ok(())
    }
}

/// Named set of channel configurations, looked up by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRegistry {
    channels: Vec<ChannelConfiguration>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelConfiguration::new(1, "BF LED matrix full", IlluminationSource::LedArrayFull),
                ChannelConfiguration::new(2, "BF LED matrix left half", IlluminationSource::LedArrayLeftHalf),
                ChannelConfiguration::new(3, "BF LED matrix right half", IlluminationSource::LedArrayRightHalf),
                ChannelConfiguration::new(4, "BF LED matrix color PDPC", IlluminationSource::LedArrayLeftBlueRightRed),
                ChannelConfiguration::new(5, "Fluorescence 405 nm Ex", IlluminationSource::Laser405nm)
                    .with_exposure(100.0)
                    .with_intensity(100.0),
                ChannelConfiguration::new(6, "Fluorescence 488 nm Ex", IlluminationSource::Laser488nm)
                    .with_exposure(100.0)
                    .with_intensity(100.0),
                ChannelConfiguration::new(7, "Fluorescence 561 nm Ex", IlluminationSource::Laser561nm)
                    .with_exposure(100.0)
                    .with_intensity(100.0),
                ChannelConfiguration::new(8, "Fluorescence 638 nm Ex", IlluminationSource::Laser638nm)
                    .with_exposure(100.0)
                    .with_intensity(100.0),
            ],
        }
    }
}

impl ChannelRegistry {
    pub fn new(channels: Vec<ChannelConfiguration>) -> Result<Self, ScopeError> {
        let registry = Self { channels };
        registry.validate()?;
        Ok(registry)
    }

    pub fn all(&self) -> &[ChannelConfiguration] {
        &self.channels
    }

    pub fn get(&self, id: u32) -> Option<&ChannelConfiguration> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ChannelConfiguration> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Resolve a selection of ids, preserving the requested order
    pub fn select(&self, ids: &[u32]) -> Result<Vec<ChannelConfiguration>, ScopeError> {
        ids.iter()
            .map(|id| {
                self.get(*id).cloned().ok_or_else(|| {
                    ScopeError::Configuration(format!("unknown channel configuration id {id}"))
                })
            })
            .collect()
    }

    /// Replace the settings of an existing configuration
    pub fn update(&mut self, channel: ChannelConfiguration) -> Result<(), ScopeError> {
        channel.validate()?;
        let slot = self
            .channels
            .iter_mut()
            .find(|c| c.id == channel.id)
            .ok_or_else(|| {
                ScopeError::Configuration(format!("unknown channel configuration id {}", channel.id))
            })?;
        *slot = channel;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        for (i, channel) in self.channels.iter().enumerate() {
            channel.validate()?;
            if self.channels[..i].iter().any(|c| c.id == channel.id) {
                return Err(ScopeError::Configuration(format!(
                    "duplicate channel configuration id {}",
                    channel.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_preserves_order() {
        let registry = ChannelRegistry::default();
        let selected = registry.select(&[6, 1]).unwrap();
        assert_eq!(selected[0].illumination_source, IlluminationSource::Laser488nm);
        assert_eq!(selected[1].illumination_source, IlluminationSource::LedArrayFull);
    }

    #[test]
    fn test_select_unknown_id() {
        let registry = ChannelRegistry::default();
        assert!(matches!(registry.select(&[1, 42]), Err(ScopeError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let a = ChannelConfiguration::new(1, "a", IlluminationSource::LedArrayFull);
        let b = ChannelConfiguration::new(1, "b", IlluminationSource::Laser405nm);
        assert!(ChannelRegistry::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_update_validates_intensity() {
        let mut registry = ChannelRegistry::default();
        let mut channel = registry.get(5).cloned().unwrap();
        channel.intensity = 120.0;
        assert!(registry.update(channel.clone()).is_err());

        channel.intensity = 30.0;
        registry.update(channel).unwrap();
        assert_eq!(registry.get(5).map(|c| c.intensity), Some(30.0));
    }

    #[test]
    fn test_file_tag() {
        let registry = ChannelRegistry::default();
        assert_eq!(
            registry.by_name("Fluorescence 405 nm Ex").map(|c| c.file_tag()),
            Some("Fluorescence_405_nm_Ex".to_string())
        );
    }
}
