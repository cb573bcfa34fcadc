use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::annotate::{self, LabelFont};
use super::backend::Accelerator;
use super::catalog::ClassCatalog;
use super::postprocess::{self, PostprocessSettings};
use super::preprocess::preprocess;
use super::result::Detection;
use super::simulate::Simulator;
use crate::frame::Frame;

/// How detections are produced. Chosen at construction and never upgraded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Accelerated,
    Simulated,
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    /// Skip the accelerator even when a model is configured.
    pub use_simulation: bool,
    /// Sleep per simulated inference, so latency figures stay meaningful.
    pub simulated_latency: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            input_width: 640,
            input_height: 640,
            conf_threshold: 0.5,
            nms_threshold: 0.45,
            use_simulation: false,
            simulated_latency: Duration::from_millis(20),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.input_width == 0 || self.input_height == 0 {
            return Err(anyhow!("model input size must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.conf_threshold) {
            return Err(anyhow!(
                "conf_threshold must be within [0, 1), got {}",
                self.conf_threshold
            ));
        }
        if !(self.nms_threshold > 0.0 && self.nms_threshold <= 1.0) {
            return Err(anyhow!(
                "nms_threshold must be within (0, 1], got {}",
                self.nms_threshold
            ));
        }
        Ok(())
    }

    fn postprocess(&self) -> PostprocessSettings {
        PostprocessSettings {
            input_width: self.input_width,
            input_height: self.input_height,
            conf_threshold: self.conf_threshold,
            nms_threshold: self.nms_threshold,
        }
    }
}

/// Snapshot returned by `DetectionEngine::stats`.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub model_path: Option<String>,
    pub input_size: (u32, u32),
    pub conf_threshold: f32,
    pub mode: EngineMode,
    /// Why the engine runs simulated although a model was configured.
    pub fallback_reason: Option<String>,
    pub total_inferences: u64,
    pub last_inference_ms: f64,
    pub average_inference_ms: f64,
    pub average_fps: f64,
}

/// Detection engine: preprocess, infer (or simulate), postprocess.
pub struct DetectionEngine {
    settings: EngineSettings,
    catalog: ClassCatalog,
    mode: EngineMode,
    accelerator: Option<Box<dyn Accelerator>>,
    simulator: Simulator,
    fallback_reason: Option<String>,
    total_inferences: u64,
    last_latency: Duration,
    total_latency: Duration,
}

impl DetectionEngine {
    /// Build the engine and load the model.
    ///
    /// Invalid settings are an error. A model that cannot be loaded is not: the engine
    /// downgrades to simulation for its whole lifetime and reports why in `stats()`.
    pub fn new(
        settings: EngineSettings,
        catalog: ClassCatalog,
        accelerator: Option<Box<dyn Accelerator>>,
    ) -> Result<Self> {
        settings.validate()?;
        let simulator = Simulator::new(&catalog);
        let mut engine = Self {
            settings,
            catalog,
            mode: EngineMode::Simulated,
            accelerator: None,
            simulator,
            fallback_reason: None,
            total_inferences: 0,
            last_latency: Duration::ZERO,
            total_latency: Duration::ZERO,
        };
        engine.select_mode(accelerator);
        Ok(engine)
    }

    fn select_mode(&mut self, accelerator: Option<Box<dyn Accelerator>>) {
        if self.settings.use_simulation {
            log::info!("DetectionEngine: running in simulation mode");
            return;
        }
        let Some(model_path) = self.settings.model_path.clone() else {
            log::info!("DetectionEngine: no model configured, running in simulation mode");
            return;
        };
        let Some(mut accelerator) = accelerator else {
            self.downgrade("no accelerator backend compiled into this build".to_string());
            return;
        };

        log::info!(
            "DetectionEngine: loading model {} on {}",
            model_path.display(),
            accelerator.name()
        );
        match accelerator.load(&model_path) {
            Ok(()) => {
                log::info!(
                    "DetectionEngine: model loaded (input {}x{}, conf {})",
                    self.settings.input_width,
                    self.settings.input_height,
                    self.settings.conf_threshold
                );
                self.accelerator = Some(accelerator);
                self.mode = EngineMode::Accelerated;
            }
            Err(e) => {
                accelerator.release();
                self.downgrade(format!("{:#}", e));
            }
        }
    }

    fn downgrade(&mut self, reason: String) {
        log::warn!(
            "DetectionEngine: model unavailable ({}); switching to simulation mode",
            reason
        );
        self.fallback_reason = Some(reason);
        self.mode = EngineMode::Simulated;
    }

    /// Replace the simulator's randomness with a fixed seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.simulator = Simulator::seeded(&self.catalog, seed);
        self
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Detect objects on one frame.
    ///
    /// Never fails: a frame whose preprocessing, inference or postprocessing
    /// errors yields no detections.
    pub fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        let start = Instant::now();
        let detections = match self.mode {
            EngineMode::Accelerated => self.detect_accelerated(frame).unwrap_or_else(|e| {
                log::warn!(
                    "DetectionEngine: frame {} dropped from detection: {:#}",
                    frame.sequence,
                    e
                );
                Vec::new()
            }),
            EngineMode::Simulated => self.detect_simulated(frame),
        };
        self.last_latency = start.elapsed();
        self.total_latency += self.last_latency;
        self.total_inferences += 1;
        detections
    }

    fn detect_accelerated(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = preprocess(frame, self.settings.input_width, self.settings.input_height)?;
        let accelerator = self
            .accelerator
            .as_mut()
            .ok_or_else(|| anyhow!("accelerator was released"))?;
        let raw = accelerator.run(&input)?;
        postprocess::postprocess(
            &raw,
            &self.settings.postprocess(),
            &self.catalog,
            frame.width,
            frame.height,
        )
    }

    /// No pixel work happens here; `simulated_latency` stands in for the model.
    fn detect_simulated(&mut self, frame: &Frame) -> Vec<Detection> {
        if !self.settings.simulated_latency.is_zero() {
            std::thread::sleep(self.settings.simulated_latency);
        }
        self.simulator
            .generate(&self.catalog, frame.width, frame.height)
    }

    /// Draw detections on a copy of the frame. Labels need a font.
    pub fn annotate(
        &self,
        frame: &Frame,
        detections: &[Detection],
        font: Option<&LabelFont>,
    ) -> Result<Frame> {
        annotate::annotate(frame, detections, &self.catalog, font)
    }

    pub fn stats(&self) -> EngineStats {
        let last_ms = self.last_latency.as_secs_f64() * 1000.0;
        let average_ms = if self.total_inferences == 0 {
            0.0
        } else {
            self.total_latency.as_secs_f64() * 1000.0 / self.total_inferences as f64
        };
        EngineStats {
            model_path: self
                .settings
                .model_path
                .as_ref()
                .map(|p| p.display().to_string()),
            input_size: (self.settings.input_width, self.settings.input_height),
            conf_threshold: self.settings.conf_threshold,
            mode: self.mode,
            fallback_reason: self.fallback_reason.clone(),
            total_inferences: self.total_inferences,
            last_inference_ms: round2(last_ms),
            average_inference_ms: round2(average_ms),
            average_fps: if average_ms > 0.0 {
                (10_000.0 / average_ms).round() / 10.0
            } else {
                0.0
            },
        }
    }

    /// Release accelerator resources. Later calls to `detect` yield nothing in accelerated mode.
    pub fn release(&mut self) {
        if let Some(mut accelerator) = self.accelerator.take() {
            accelerator.release();
            log::info!("DetectionEngine: model released");
        }
    }
}

impl Drop for DetectionEngine {
    fn drop(&mut self) {
        self.release();
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
