//! PPE Sentinel
//!
//! Edge pipeline that watches a camera feed for missing personal protective
//! equipment and raises deduplicated alerts.
//!
//! # Module Structure
//!
//! - `frame`: BGR frames and the bounded drop-oldest frame queue
//! - `ingest`: Frame sources (RTSP via GStreamer, synthetic generator)
//! - `detect`: Preprocess, accelerator seam, postprocess (NMS), simulator, annotation
//! - `alert`: Per-class cooldown and violation counters
//! - `notify`: Alert and status messages over MQTT or the log
//! - `evidence`: Storage for annotated violation snapshots
//! - `pipeline`: The capture → detect → alert loop
//! - `config`: Defaults, config file and environment overrides
//! - `ui`: Startup stage reporting

pub mod alert;
pub mod config;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod ui;

/// Wall-clock instant used for alerts, evidence keys and status messages.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

pub use alert::{AcceptedAlert, AlertCoordinator};
pub use config::SentinelConfig;
pub use detect::{
    BBox, ClassCatalog, Detection, DetectionEngine, EngineMode, EngineSettings, EngineStats,
};
pub use evidence::{EvidenceSink, FsEvidenceSink};
pub use frame::{Frame, FrameQueue};
pub use ingest::{create_source, FrameSource, SourceSettings, SourceStats};
pub use notify::{LogNotifier, Notifier, Topics};
pub use pipeline::{Pipeline, PipelineSettings, SessionSummary};
