//! GStreamer-backed RTSP capture.
//!
//! Pipeline: rtspsrc ! depay/parse ! decoder ! videoconvert ! BGR appsink.
//!
//! With `hardware_decode` the Rockchip MPP decoder (`mppvideodec`) is tried first;
//! if that pipeline cannot be built or does not preroll, a generic `decodebin`
//! pipeline is used instead.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::live::{Capture, CaptureOpener};
use crate::frame::{Frame, CHANNELS};

/// How long a freshly opened pipeline may take to produce its first frame.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A read that stalls longer than this is treated as a stream failure.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GstreamerOpener {
    hardware_decode: bool,
}

impl GstreamerOpener {
    pub fn new(hardware_decode: bool) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self { hardware_decode })
    }

    fn pipeline_descriptions(&self, url: &str) -> Vec<(&'static str, String)> {
        let mut candidates = Vec::with_capacity(2);
        if self.hardware_decode {
            candidates.push((
                "mpp",
                format!(
                    "rtspsrc location={} latency=0 ! rtph264depay ! h264parse ! mppvideodec ! \
                     videoconvert ! video/x-raw,format=BGR ! \
                     appsink name=appsink sync=false max-buffers=1 drop=true",
                    url
                ),
            ));
        }
        candidates.push((
            "decodebin",
            format!(
                "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=BGR ! \
                 appsink name=appsink sync=false max-buffers=1 drop=true",
                url
            ),
        ));
        candidates
    }
}

impl CaptureOpener for GstreamerOpener {
    fn open(&self, url: &str) -> Result<Box<dyn Capture>> {
        let mut last_err = None;
        for (decoder, description) in self.pipeline_descriptions(url) {
            match GstreamerCapture::open(&description) {
                Ok(capture) => {
                    log::debug!("RTSP pipeline for {} uses {} decoder", url, decoder);
                    return Ok(Box::new(capture));
                }
                Err(e) => {
                    log::warn!("RTSP {} pipeline for {} failed: {:#}", decoder, url, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no RTSP pipeline candidates")))
    }
}

struct GstreamerCapture {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    width: u32,
    height: u32,
    /// First frame pulled while connecting; returned by the first `read`.
    pending: Option<Frame>,
    open: bool,
}

impl GstreamerCapture {
    fn open(description: &str) -> Result<Self> {
        let pipeline = gstreamer::parse_launch(description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "BGR")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;

        let mut capture = Self {
            pipeline,
            appsink,
            width: 0,
            height: 0,
            pending: None,
            open: true,
        };
        match capture.pull(CONNECT_TIMEOUT) {
            Ok(frame) => {
                (capture.width, capture.height) = frame.resolution();
                capture.pending = Some(frame);
                Ok(capture)
            }
            Err(e) => {
                capture.release();
                Err(e.context("waiting for first RTSP frame"))
            }
        }
    }

    fn pull(&mut self, timeout: Duration) -> Result<Frame> {
        self.poll_bus()?;
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::new(pixels, width, height, 0)
    }

    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Capture for GstreamerCapture {
    fn read(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.pull(READ_TIMEOUT)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.pending = None;
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop RTSP pipeline: {}", e);
        }
    }
}

impl Drop for GstreamerCapture {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * CHANNELS;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("RTSP buffer shorter than frame")?
            .to_vec();
        return Ok((pixels, width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
