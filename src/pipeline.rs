//! The capture → detect → alert loop.
//!
//! `Pipeline` owns one frame source, one detection engine, the alert coordinator,
//! a notifier and an optional evidence sink. Each `step` waits for at most one
//! frame, runs detection on it, publishes accepted violations and emits the
//! periodic status snapshot. Nothing that happens after a frame is read is fatal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::alert::{AcceptedAlert, AlertCoordinator};
use crate::config::SentinelConfig;
use crate::detect::{encode_jpeg, DetectionEngine, EngineMode, LabelFont};
use crate::evidence::{store_evidence, EvidenceSink};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::notify::{
    publish_json, AlertMessage, Notifier, RunState, StatusConfig, StatusSnapshot, StatusStats,
    Topics,
};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub device_id: String,
    pub frame_timeout: Duration,
    pub cooldown: Duration,
    pub status_interval: Duration,
    /// Progress log cadence in processed frames; 0 disables it.
    pub log_interval_frames: u64,
    pub jpeg_quality: u8,
    /// Font for evidence labels.
    pub label_font: Option<PathBuf>,
    /// Wait between attempts to start the source.
    pub start_retry_delay: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &SentinelConfig) -> Self {
        Self {
            device_id: cfg.device_id.clone(),
            frame_timeout: cfg.frame_timeout,
            cooldown: cfg.alerts.cooldown,
            status_interval: cfg.alerts.status_interval,
            log_interval_frames: cfg.alerts.log_interval_frames,
            jpeg_quality: cfg.evidence.jpeg_quality,
            label_font: cfg.evidence.label_font.clone(),
            start_retry_delay: cfg.source.reconnect_delay,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&SentinelConfig::default())
    }
}

/// Outcome of one `Pipeline::step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// No frame arrived within the frame timeout.
    Idle,
    Processed { detections: usize, alerts: usize },
}

/// Totals reported once the pipeline shuts down.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub frames_processed: u64,
    pub detections_total: u64,
    pub violations_total: u64,
    pub alerts_published: u64,
    pub uptime: Duration,
}

pub struct Pipeline {
    settings: PipelineSettings,
    topics: Topics,
    source: Box<dyn FrameSource>,
    engine: DetectionEngine,
    coordinator: AlertCoordinator,
    notifier: Box<dyn Notifier>,
    evidence: Option<Box<dyn EvidenceSink>>,
    label_font: Option<LabelFont>,
    frames_processed: u64,
    detections_total: u64,
    alerts_published: u64,
    source_started: bool,
    started_at: Instant,
    last_status: Instant,
    summary: Option<SessionSummary>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        source: Box<dyn FrameSource>,
        engine: DetectionEngine,
        notifier: Box<dyn Notifier>,
        evidence: Option<Box<dyn EvidenceSink>>,
    ) -> Self {
        let now = Instant::now();
        let label_font = match (&settings.label_font, &evidence) {
            (Some(path), Some(_)) => LabelFont::load(path)
                .map_err(|e| log::warn!("evidence labels disabled: {:#}", e))
                .ok(),
            _ => None,
        };
        Self {
            topics: Topics::for_device(&settings.device_id),
            coordinator: AlertCoordinator::new(settings.cooldown),
            settings,
            source,
            engine,
            notifier,
            evidence,
            label_font,
            frames_processed: 0,
            detections_total: 0,
            alerts_published: 0,
            source_started: false,
            started_at: now,
            last_status: now,
            summary: None,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn engine(&self) -> &DetectionEngine {
        &self.engine
    }

    pub fn source(&self) -> &dyn FrameSource {
        self.source.as_ref()
    }

    pub fn coordinator(&self) -> &AlertCoordinator {
        &self.coordinator
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn detections_total(&self) -> u64 {
        self.detections_total
    }

    pub fn alerts_published(&self) -> u64 {
        self.alerts_published
    }

    /// Start the source once. Failures are returned and the caller may retry.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.source_started {
            return Ok(());
        }
        self.source.start()?;
        self.source_started = true;
        self.started_at = Instant::now();
        self.last_status = self.started_at;
        log::info!(
            "pipeline started: source={} detector={:?} notifier={} evidence={}",
            self.source.name(),
            self.engine.mode(),
            self.notifier.name(),
            self.evidence.as_ref().map(|e| e.name()).unwrap_or("none")
        );
        Ok(())
    }

    /// Keep trying to start the source until it succeeds or `stop` is raised.
    pub fn start_with_retry(&mut self, stop: &AtomicBool) -> bool {
        while !stop.load(Ordering::SeqCst) {
            match self.start() {
                Ok(()) => return true,
                Err(e) => {
                    log::warn!(
                        "failed to start {} source: {:#}; retrying in {}s",
                        self.source.name(),
                        e,
                        self.settings.start_retry_delay.as_secs()
                    );
                    sleep_unless_stopped(self.settings.start_retry_delay, stop);
                }
            }
        }
        false
    }

    /// Wait for one frame and process it, then emit status if due.
    pub fn step(&mut self) -> Step {
        let outcome = match self.source.get_frame(self.settings.frame_timeout) {
            Some(frame) => {
                let (detections, alerts) = self.process_frame(&frame);
                Step::Processed { detections, alerts }
            }
            None => Step::Idle,
        };
        if self.last_status.elapsed() >= self.settings.status_interval {
            self.publish_status(RunState::Running);
            self.last_status = Instant::now();
        }
        outcome
    }

    /// Detect on one frame and publish accepted violations.
    /// Returns the number of detections and of accepted alerts.
    pub fn process_frame(&mut self, frame: &Frame) -> (usize, usize) {
        let detections = self.engine.detect(frame);
        self.frames_processed += 1;
        self.detections_total += detections.len() as u64;

        let accepted = self.coordinator.evaluate(&detections, frame.captured_at);
        for alert in &accepted {
            self.send_alert(frame, alert);
        }

        let every = self.settings.log_interval_frames;
        if every > 0 && self.frames_processed % every == 0 {
            self.log_progress();
        }
        (detections.len(), accepted.len())
    }

    fn send_alert(&mut self, frame: &Frame, alert: &AcceptedAlert) {
        let image_url = self.evidence_for(frame, alert);
        let message = AlertMessage::new(
            &self.settings.device_id,
            alert,
            image_url,
            self.frames_processed,
        );
        if publish_json(self.notifier.as_mut(), &self.topics.alerts, &message) {
            self.alerts_published += 1;
        }
    }

    fn evidence_for(&mut self, frame: &Frame, alert: &AcceptedAlert) -> Option<String> {
        let sink = self.evidence.as_deref_mut()?;
        let jpeg = self
            .engine
            .annotate(
                frame,
                std::slice::from_ref(&alert.detection),
                self.label_font.as_ref(),
            )
            .and_then(|annotated| encode_jpeg(&annotated, self.settings.jpeg_quality));
        match jpeg {
            Ok(jpeg) => store_evidence(
                Some(sink),
                &jpeg,
                &self.settings.device_id,
                alert.timestamp,
                &alert.detection.class_name,
            ),
            Err(e) => {
                log::warn!("failed to render evidence for frame {}: {:#}", frame.sequence, e);
                None
            }
        }
    }

    fn log_progress(&self) {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.frames_processed as f64 / elapsed
        } else {
            0.0
        };
        let source = self.source.stats();
        log::info!(
            "frames={} detections={} violations={} fps={:.1} inference={:.1}ms source_state={:?} dropped={}",
            self.frames_processed,
            self.detections_total,
            self.coordinator.total_violations(),
            fps,
            self.engine.stats().last_inference_ms,
            source.state,
            source.frames_dropped
        );
    }

    pub fn status_snapshot(&self, status: RunState) -> StatusSnapshot {
        StatusSnapshot {
            device_id: self.settings.device_id.clone(),
            timestamp: Utc::now(),
            status,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            stats: StatusStats {
                frames_processed: self.frames_processed,
                detections_total: self.detections_total,
                violations_total: self.coordinator.total_violations(),
                last_violation: self.coordinator.last_violation(),
                inference_time_ms: self.engine.stats().last_inference_ms,
            },
            config: StatusConfig {
                simulation_mode: self.source.is_simulated()
                    || self.engine.mode() == EngineMode::Simulated,
                camera_resolution: self.source.resolution(),
            },
        }
    }

    fn publish_status(&mut self, status: RunState) -> bool {
        let snapshot = self.status_snapshot(status);
        publish_json(self.notifier.as_mut(), &self.topics.status, &snapshot)
    }

    /// Step until `stop` is raised, then shut down.
    pub fn run(&mut self, stop: &AtomicBool) -> SessionSummary {
        if self.start_with_retry(stop) {
            log::info!("entering main loop");
            while !stop.load(Ordering::SeqCst) {
                self.step();
            }
            log::info!("stop requested");
        }
        self.shutdown()
    }

    /// Publish the final status, stop the source, release the model and close the
    /// notifier. Later calls return the same summary.
    pub fn shutdown(&mut self) -> SessionSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        self.publish_status(RunState::Stopped);
        self.source.stop();
        self.engine.release();
        self.notifier.close();

        let summary = SessionSummary {
            frames_processed: self.frames_processed,
            detections_total: self.detections_total,
            violations_total: self.coordinator.total_violations(),
            alerts_published: self.alerts_published,
            uptime: if self.source_started {
                self.started_at.elapsed()
            } else {
                Duration::ZERO
            },
        };
        log::info!(
            "session summary: frames={} detections={} violations={} alerts_published={} uptime={:.1}s",
            summary.frames_processed,
            summary.detections_total,
            summary.violations_total,
            summary.alerts_published,
            summary.uptime.as_secs_f64()
        );
        self.summary = Some(summary.clone());
        summary
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep for `total` in short slices, returning early once `stop` is raised.
pub(crate) fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Accelerator, ClassCatalog, EngineSettings, InputTensor, RawOutput};
    use crate::ingest::SourceStats;
    use anyhow::{anyhow, Result};
    use chrono::{TimeDelta, TimeZone};
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    type Published = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    struct Recording {
        published: Published,
        closed: Arc<AtomicBool>,
    }

    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn publish(&mut self, topic: &str, message: &serde_json::Value) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), message.clone()));
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Scripted {
        frames: VecDeque<Frame>,
        fail_starts: usize,
        stopped: Arc<AtomicBool>,
    }

    impl FrameSource for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn start(&mut self) -> Result<()> {
            if self.fail_starts > 0 {
                self.fail_starts -= 1;
                return Err(anyhow!("camera unreachable"));
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn get_frame(&mut self, _timeout: Duration) -> Option<Frame> {
            self.frames.pop_front()
        }

        fn resolution(&self) -> (u32, u32) {
            (64, 48)
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats::default()
        }
    }

    /// Always reports one `no_hardhat` box covering the middle of the frame.
    struct NoHardhat;

    impl Accelerator for NoHardhat {
        fn name(&self) -> &'static str {
            "no-hardhat"
        }

        fn load(&mut self, _model_path: &Path) -> Result<()> {
            Ok(())
        }

        fn run(&mut self, _input: &InputTensor) -> Result<RawOutput> {
            let mut row = vec![32.0, 32.0, 20.0, 20.0, 0.9];
            let mut classes = vec![0.0; 9];
            classes[2] = 1.0;
            row.extend(classes);
            RawOutput::from_rows(&[row])
        }

        fn release(&mut self) {}
    }

    /// Reports disjoint `no_hardhat` and `no_mask` boxes.
    struct TwoViolations;

    impl Accelerator for TwoViolations {
        fn name(&self) -> &'static str {
            "two-violations"
        }

        fn load(&mut self, _model_path: &Path) -> Result<()> {
            Ok(())
        }

        fn run(&mut self, _input: &InputTensor) -> Result<RawOutput> {
            let row = |cx: f32, cy: f32, class_id: usize| {
                let mut row = vec![cx, cy, 16.0, 16.0, 0.9];
                let mut classes = vec![0.0; 9];
                classes[class_id] = 1.0;
                row.extend(classes);
                row
            };
            RawOutput::from_rows(&[row(16.0, 16.0, 2), row(48.0, 48.0, 6)])
        }

        fn release(&mut self) {}
    }

    fn t0() -> crate::Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn frames(offsets_secs: &[i64]) -> VecDeque<Frame> {
        offsets_secs
            .iter()
            .enumerate()
            .map(|(i, secs)| {
                let mut frame = Frame::filled(64, 48, [0, 0, 0], i as u64 + 1).unwrap();
                frame.captured_at = t0() + TimeDelta::seconds(*secs);
                frame
            })
            .collect()
    }

    fn engine() -> DetectionEngine {
        engine_with(Box::new(NoHardhat))
    }

    fn engine_with(accelerator: Box<dyn Accelerator>) -> DetectionEngine {
        let settings = EngineSettings {
            model_path: Some("model.onnx".into()),
            input_width: 64,
            input_height: 64,
            ..EngineSettings::default()
        };
        DetectionEngine::new(settings, ClassCatalog::ppe(), Some(accelerator)).unwrap()
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            device_id: "dev-1".to_string(),
            frame_timeout: Duration::from_millis(10),
            cooldown: Duration::from_secs(30),
            status_interval: Duration::from_secs(3600),
            log_interval_frames: 2,
            jpeg_quality: 80,
            label_font: None,
            start_retry_delay: Duration::from_millis(10),
        }
    }

    struct Harness {
        pipeline: Pipeline,
        published: Published,
        closed: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    fn harness(offsets_secs: &[i64], fail_starts: usize) -> Harness {
        let published = Published::default();
        let closed = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let source = Scripted {
            frames: frames(offsets_secs),
            fail_starts,
            stopped: stopped.clone(),
        };
        let notifier = Recording {
            published: published.clone(),
            closed: closed.clone(),
        };
        let pipeline = Pipeline::new(
            settings(),
            Box::new(source),
            engine(),
            Box::new(notifier),
            None,
        );
        Harness {
            pipeline,
            published,
            closed,
            stopped,
        }
    }

    #[test]
    fn repeated_violation_alerts_once_per_window() {
        let mut h = harness(&[0, 5, 31], 0);
        h.pipeline.start().unwrap();
        let steps: Vec<Step> = (0..4).map(|_| h.pipeline.step()).collect();
        assert_eq!(
            steps,
            vec![
                Step::Processed { detections: 1, alerts: 1 },
                Step::Processed { detections: 1, alerts: 0 },
                Step::Processed { detections: 1, alerts: 1 },
                Step::Idle,
            ]
        );

        let published = h.published.lock().unwrap();
        let alerts: Vec<_> = published
            .iter()
            .filter(|(topic, _)| topic == "dev-1/alerts/ppe")
            .collect();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].1["violation"]["class_name"], "no_hardhat");
        assert_eq!(alerts[1].1["stats"]["total_violations"], 2);
        assert_eq!(alerts[1].1["stats"]["frames_processed"], 3);
        assert!(alerts[0].1["image_url"].is_null());
    }

    #[test]
    fn shutdown_publishes_stopped_status_once() {
        let mut h = harness(&[0], 0);
        h.pipeline.start().unwrap();
        h.pipeline.step();
        let summary = h.pipeline.shutdown();
        let again = h.pipeline.shutdown();
        assert_eq!(summary, again);
        assert_eq!(summary.frames_processed, 1);
        assert_eq!(summary.violations_total, 1);
        assert_eq!(summary.alerts_published, 1);

        assert!(h.closed.load(Ordering::SeqCst));
        assert!(h.stopped.load(Ordering::SeqCst));
        let published = h.published.lock().unwrap();
        let statuses: Vec<_> = published
            .iter()
            .filter(|(topic, _)| topic == "dev-1/status/ppe")
            .collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1["status"], "stopped");
        assert_eq!(statuses[0].1["config"]["simulation_mode"], false);
    }

    #[test]
    fn status_is_emitted_without_frames() {
        let mut h = harness(&[], 0);
        h.pipeline.settings.status_interval = Duration::ZERO;
        h.pipeline.start().unwrap();
        assert_eq!(h.pipeline.step(), Step::Idle);
        let published = h.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "dev-1/status/ppe");
        assert_eq!(published[0].1["status"], "running");
    }

    #[test]
    fn start_is_retried_until_the_source_opens() {
        let mut h = harness(&[0], 2);
        let stop = AtomicBool::new(false);
        assert!(h.pipeline.start_with_retry(&stop));
        assert!(matches!(h.pipeline.step(), Step::Processed { .. }));
    }

    #[test]
    fn raised_stop_flag_skips_the_loop() {
        let mut h = harness(&[0], 5);
        let stop = AtomicBool::new(true);
        let summary = h.pipeline.run(&stop);
        assert_eq!(summary.frames_processed, 0);
        assert_eq!(summary.uptime, Duration::ZERO);
    }

    #[test]
    fn evidence_url_is_attached_to_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&[0], 0);
        h.pipeline.evidence = Some(Box::new(
            crate::evidence::FsEvidenceSink::new(dir.path()).unwrap(),
        ));
        h.pipeline.start().unwrap();
        h.pipeline.step();

        let published = h.published.lock().unwrap();
        let url = published[0].1["image_url"].as_str().unwrap().to_string();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("violations/dev-1/2024/05/01/080000_000000_no_hardhat.jpg"));
        let stored = dir
            .path()
            .join("violations/dev-1/2024/05/01/080000_000000_no_hardhat.jpg");
        let bytes = std::fs::read(stored).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn each_alert_on_one_frame_gets_its_own_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&[0], 0);
        h.pipeline.engine = engine_with(Box::new(TwoViolations));
        h.pipeline.evidence = Some(Box::new(
            crate::evidence::FsEvidenceSink::new(dir.path()).unwrap(),
        ));
        h.pipeline.start().unwrap();
        assert_eq!(
            h.pipeline.step(),
            Step::Processed {
                detections: 2,
                alerts: 2
            }
        );

        let published = h.published.lock().unwrap();
        let urls: Vec<(String, String)> = published
            .iter()
            .filter(|(topic, _)| topic == "dev-1/alerts/ppe")
            .map(|(_, m)| {
                (
                    m["violation"]["class_name"].as_str().unwrap().to_string(),
                    m["image_url"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(urls.len(), 2);
        assert_ne!(urls[0].1, urls[1].1);
        for (class_name, url) in &urls {
            assert!(url.ends_with(&format!("080000_000000_{}.jpg", class_name)), "{}", url);
        }

        let day = dir.path().join("violations/dev-1/2024/05/01");
        assert_eq!(std::fs::read_dir(&day).unwrap().count(), 2);
        // Each image carries only its own box.
        let hardhat = image::load_from_memory(
            &std::fs::read(day.join("080000_000000_no_hardhat.jpg")).unwrap(),
        )
        .unwrap()
        .to_rgb8();
        let mask = image::load_from_memory(
            &std::fs::read(day.join("080000_000000_no_mask.jpg")).unwrap(),
        )
        .unwrap()
        .to_rgb8();
        assert_ne!(hardhat.as_raw(), mask.as_raw());
    }
}
