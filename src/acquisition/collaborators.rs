//! Interfaces the sequencer drives but does not implement.

use super::plan::FrameTag;
use crate::channels::ChannelConfiguration;
use crate::error::ScopeError;
use crate::stage::StageController;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Camera side of an acquisition.
pub trait ImageCapture: Send {
    /// Apply exposure and gain of a channel before its frame is captured
    fn apply_settings(&mut self, channel: &ChannelConfiguration) -> Result<(), ScopeError>;

    /// Trigger, read out and hand off one frame
    fn capture(&mut self, tag: &FrameTag) -> Result<(), ScopeError>;
}

/// Focus search at the current field.
pub trait Autofocus: Send {
    /// Move Z to best focus and return the focused Z in mm
    fn run(&mut self, stage: &mut StageController, timeout: Duration) -> Result<f64, ScopeError>;
}

/// Time source for waits and interval bookkeeping.
pub trait Clock: Send {
    /// Time elapsed since the clock was created
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Image one channel at the current stage position.
///
/// Sets the source and intensity, applies the camera settings, then switches
/// the illumination on for the settle time and the capture. Illumination is
/// switched off again even when the capture fails.
pub(crate) fn expose_frame(
    stage: &mut StageController,
    capture: &mut dyn ImageCapture,
    clock: &dyn Clock,
    channel: &ChannelConfiguration,
    tag: &FrameTag,
) -> Result<(), ScopeError> {
    stage.set_illumination(channel.illumination_source, channel.intensity)?;
    capture.apply_settings(channel)?;
    stage.turn_on_illumination()?;
    clock.sleep(Duration::from_millis(channel.settle_ms));

    let captured = capture.capture(tag);
    let switched_off = stage.turn_off_illumination();
    captured?;
    switched_off
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Clock that only moves when slept on or advanced. Clones share time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let time pass without a sleep, e.g. to model slow work
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }

    /// Every sleep requested so far
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shares_time() {
        let clock = ManualClock::new();
        let observer = clock.clone();
        clock.sleep(Duration::from_millis(160));
        clock.advance(Duration::from_secs(2));
        assert_eq!(observer.now(), Duration::from_millis(2160));
        assert_eq!(observer.sleeps(), vec![Duration::from_millis(160)]);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::default();
        let before = clock.now();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.now() >= before + Duration::from_millis(2));
    }
}
