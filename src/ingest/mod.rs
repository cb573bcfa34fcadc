//! Frame ingestion sources.
//!
//! This module provides interchangeable sources behind one capability contract:
//! - Live streams (RTSP cameras) read on a dedicated capture thread with automatic reconnect
//! - Synthetic generator (no camera configured, and tests)
//!
//! All sources hand out `Frame` instances in capture order. The live source buffers
//! at most `queue_capacity` frames and drops the oldest under backpressure.

pub mod live;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use crate::frame::{Frame, DEFAULT_QUEUE_CAPACITY};

pub use live::{Capture, CaptureOpener, ConnectionState, LiveSettings, LiveSource};
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::GstreamerOpener;
pub use synthetic::SyntheticSource;

/// Capability contract shared by every frame source.
pub trait FrameSource: Send {
    /// Source identifier used in logs.
    fn name(&self) -> &'static str;

    /// Open the source. On failure nothing is spawned and the caller decides whether to retry.
    fn start(&mut self) -> Result<()>;

    /// Stop producing frames and release the underlying handle. Idempotent.
    fn stop(&mut self);

    /// Next frame in capture order, waiting at most `timeout`. `None` on timeout or after stop.
    fn get_frame(&mut self, timeout: Duration) -> Option<Frame>;

    /// Negotiated resolution, `(0, 0)` when no handle is open.
    fn resolution(&self) -> (u32, u32);

    fn is_connected(&self) -> bool;

    /// True for generated frames rather than a real camera.
    fn is_simulated(&self) -> bool {
        false
    }

    fn stats(&self) -> SourceStats;
}

/// Statistics reported by a frame source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceStats {
    pub frames_captured: u64,
    /// Frames per second measured over the last one-second window.
    pub fps: f64,
    pub frames_dropped: u64,
    pub connection_errors: u64,
    pub reconnect_attempts: u64,
    pub state: ConnectionState,
}

/// Settings consumed by `create_source`.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Stream URL. `None` selects the synthetic generator.
    pub url: Option<String>,
    /// Force the synthetic generator even when a URL is configured.
    pub use_simulation: bool,
    pub sim_width: u32,
    pub sim_height: u32,
    pub sim_fps: u32,
    pub queue_capacity: usize,
    pub reconnect_delay: Duration,
    pub stop_timeout: Duration,
    /// Prefer the Rockchip MPP hardware decoder when building GStreamer pipelines.
    pub hardware_decode: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: None,
            use_simulation: true,
            sim_width: 640,
            sim_height: 480,
            sim_fps: 15,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            hardware_decode: true,
        }
    }
}

impl SourceSettings {
    /// True when the synthetic generator will be used.
    pub fn simulated(&self) -> bool {
        self.use_simulation
            || self
                .url
                .as_deref()
                .map(|url| url.trim().is_empty() || url.starts_with("stub://"))
                .unwrap_or(true)
    }

    pub fn live_settings(&self) -> LiveSettings {
        LiveSettings {
            queue_capacity: self.queue_capacity,
            reconnect_delay: self.reconnect_delay,
            stop_timeout: self.stop_timeout,
        }
    }
}

/// Build the configured frame source.
///
/// Simulation is chosen when requested or when no URL is configured (`stub://` URLs too).
/// Network URLs need a compiled capture backend; a missing one is a construction error.
pub fn create_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    if settings.simulated() {
        log::info!(
            "using synthetic source {}x{}@{}fps",
            settings.sim_width,
            settings.sim_height,
            settings.sim_fps
        );
        return Ok(Box::new(SyntheticSource::new(
            settings.sim_width,
            settings.sim_height,
            settings.sim_fps,
        )?));
    }

    let raw = settings
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("live source requires a URL"))?;
    let url = Url::parse(raw).with_context(|| format!("parse source url {}", raw))?;
    match url.scheme() {
        "rtsp" | "rtsps" => live_rtsp_source(raw, settings),
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected rtsp(s) or stub",
            other
        )),
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn live_rtsp_source(url: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let opener = GstreamerOpener::new(settings.hardware_decode)?;
    Ok(Box::new(LiveSource::new(
        url,
        Box::new(opener),
        settings.live_settings(),
    )?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn live_rtsp_source(url: &str, _settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "RTSP source {} requires the rtsp-gstreamer feature",
        url
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_url_selects_synthetic() -> Result<()> {
        let settings = SourceSettings {
            url: None,
            use_simulation: false,
            sim_width: 320,
            sim_height: 240,
            ..SourceSettings::default()
        };
        let source = create_source(&settings)?;
        assert_eq!(source.name(), "synthetic");
        assert_eq!(source.resolution(), (320, 240));
        Ok(())
    }

    #[test]
    fn simulation_flag_overrides_url() -> Result<()> {
        let settings = SourceSettings {
            url: Some("rtsp://192.168.1.100:554/stream".to_string()),
            use_simulation: true,
            ..SourceSettings::default()
        };
        assert!(settings.simulated());
        assert_eq!(create_source(&settings)?.name(), "synthetic");
        Ok(())
    }

    #[test]
    fn stub_scheme_is_synthetic() {
        let settings = SourceSettings {
            url: Some("stub://front".to_string()),
            use_simulation: false,
            ..SourceSettings::default()
        };
        assert!(settings.simulated());
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let settings = SourceSettings {
            url: Some("ftp://camera/stream".to_string()),
            use_simulation: false,
            ..SourceSettings::default()
        };
        let err = create_source(&settings).err().expect("should fail");
        assert!(format!("{err}").contains("unsupported source scheme"));
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_without_backend_fails_at_construction() {
        let settings = SourceSettings {
            url: Some("rtsp://test.invalid/stream".to_string()),
            use_simulation: false,
            ..SourceSettings::default()
        };
        let err = create_source(&settings).err().expect("should fail");
        assert!(format!("{err}").contains("rtsp-gstreamer"));
    }
}
