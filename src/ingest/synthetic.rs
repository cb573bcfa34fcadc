//! Synthetic frame generator.
//!
//! Produces paced frames with a fixed scene layout: a dark background with a small
//! per-frame brightness jitter and two "worker" silhouettes (body block, head disc,
//! torso panel). Used when no camera is configured and as a test double.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use super::{ConnectionState, FrameSource, SourceStats};
use crate::frame::{Frame, CHANNELS};

/// Layout reference resolution; regions are scaled to the configured size.
const LAYOUT_WIDTH: f32 = 640.0;
const LAYOUT_HEIGHT: f32 = 480.0;

/// Worker regions (x1, y1, x2, y2) in layout coordinates.
const PERSON_REGIONS: [(i32, i32, i32, i32); 2] = [(100, 80, 250, 380), (350, 100, 500, 400)];

const BACKGROUND_BGR: [u8; 3] = [40, 40, 50];
const BACKGROUND_JITTER: i16 = 5;
const HEAD_BGR: [u8; 3] = [180, 160, 140];
const TORSO_BGR: [u8; 3] = [150, 140, 130];
const HEAD_RADIUS: f32 = 25.0;

pub struct SyntheticSource {
    width: u32,
    height: u32,
    fps: u32,
    frame_delay: Duration,
    running: bool,
    last_frame: Option<Instant>,
    frame_count: u64,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Result<Self> {
        Self::with_rng(width, height, fps, StdRng::from_entropy())
    }

    /// Deterministic background jitter, for tests.
    pub fn with_seed(width: u32, height: u32, fps: u32, seed: u64) -> Result<Self> {
        Self::with_rng(width, height, fps, StdRng::seed_from_u64(seed))
    }

    fn with_rng(width: u32, height: u32, fps: u32, rng: StdRng) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("synthetic source dimensions must be non-zero"));
        }
        if fps == 0 {
            return Err(anyhow!("synthetic source fps must be at least 1"));
        }
        Ok(Self {
            width,
            height,
            fps,
            frame_delay: Duration::from_secs_f64(1.0 / fps as f64),
            running: false,
            last_frame: None,
            frame_count: 0,
            rng,
        })
    }

    pub fn target_fps(&self) -> u32 {
        self.fps
    }

    fn render(&mut self) -> Result<Frame> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * CHANNELS];

        let mut background = BACKGROUND_BGR;
        for channel in background.iter_mut() {
            let delta = self.rng.gen_range(-BACKGROUND_JITTER..BACKGROUND_JITTER);
            *channel = (*channel as i16 + delta).clamp(0, 255) as u8;
        }
        for px in data.chunks_exact_mut(CHANNELS) {
            px.copy_from_slice(&background);
        }

        let sx = self.width as f32 / LAYOUT_WIDTH;
        let sy = self.height as f32 / LAYOUT_HEIGHT;
        let scale = |x: i32, y: i32| ((x as f32 * sx) as i32, (y as f32 * sy) as i32);

        for (i, &(x1, y1, x2, y2)) in PERSON_REGIONS.iter().enumerate() {
            let i = i as u8;
            let body = [100 + i * 30, 120 + i * 20, 140 + i * 10];
            let (bx1, by1) = scale(x1, y1);
            let (bx2, by2) = scale(x2, y2);
            fill_rect(&mut data, w, h, (bx1, by1, bx2, by2), body);

            let (hx, hy) = scale((x1 + x2) / 2, y1 + 30);
            let radius = HEAD_RADIUS * sx.min(sy);
            fill_circle(&mut data, w, h, (hx, hy), radius, HEAD_BGR);

            let (tx1, ty1) = scale(x1 + 20, y1 + 60);
            let (tx2, ty2) = scale(x2 - 20, y1 + 200);
            fill_rect(&mut data, w, h, (tx1, ty1, tx2, ty2), TORSO_BGR);
        }

        Frame::new(data, self.width, self.height, self.frame_count)
    }
}

fn fill_rect(data: &mut [u8], w: usize, h: usize, rect: (i32, i32, i32, i32), bgr: [u8; 3]) {
    let (x1, y1, x2, y2) = rect;
    let x1 = x1.clamp(0, w as i32) as usize;
    let x2 = x2.clamp(0, w as i32) as usize;
    let y1 = y1.clamp(0, h as i32) as usize;
    let y2 = y2.clamp(0, h as i32) as usize;
    for y in y1..y2 {
        for x in x1..x2 {
            let idx = (y * w + x) * CHANNELS;
            data[idx..idx + CHANNELS].copy_from_slice(&bgr);
        }
    }
}

fn fill_circle(
    data: &mut [u8],
    w: usize,
    h: usize,
    center: (i32, i32),
    radius: f32,
    bgr: [u8; 3],
) {
    let r = radius.ceil() as i32;
    let (cx, cy) = center;
    for y in (cy - r).max(0)..(cy + r + 1).min(h as i32) {
        for x in (cx - r).max(0)..(cx + r + 1).min(w as i32) {
            let (dx, dy) = ((x - cx) as f32, (y - cy) as f32);
            if dx * dx + dy * dy <= radius * radius {
                let idx = (y as usize * w + x as usize) * CHANNELS;
                data[idx..idx + CHANNELS].copy_from_slice(&bgr);
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        self.last_frame = None;
        log::info!(
            "SyntheticSource: started ({}x{}@{}fps)",
            self.width,
            self.height,
            self.fps
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            log::info!("SyntheticSource: stopped after {} frames", self.frame_count);
        }
    }

    fn get_frame(&mut self, timeout: Duration) -> Option<Frame> {
        if !self.running {
            return None;
        }
        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.frame_delay {
                let wait = self.frame_delay - elapsed;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return None;
                }
                std::thread::sleep(wait);
            }
        }
        self.last_frame = Some(Instant::now());
        self.frame_count += 1;
        match self.render() {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::error!("SyntheticSource: render failed: {:#}", e);
                None
            }
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_connected(&self) -> bool {
        self.running
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            fps: if self.running { self.fps as f64 } else { 0.0 },
            state: if self.running {
                ConnectionState::Streaming
            } else {
                ConnectionState::Disconnected
            },
            ..SourceStats::default()
        }
    }
}
