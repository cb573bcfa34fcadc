//! PPE detection.
//!
//! `DetectionEngine` turns a frame into typed detections:
//! preprocess -> accelerator (or simulator) -> postprocess.

pub mod annotate;
mod backend;
pub mod backends;
mod catalog;
mod engine;
pub mod postprocess;
pub mod preprocess;
mod result;
pub mod simulate;

pub use annotate::{annotate, encode_jpeg, LabelFont};
pub use backend::{Accelerator, InputTensor, RawOutput};
pub use backends::default_accelerator;
pub use catalog::{ClassCatalog, PPE_CLASSES, PPE_VIOLATIONS, UNKNOWN_CLASS};
pub use engine::{DetectionEngine, EngineMode, EngineSettings, EngineStats};
pub use postprocess::PostprocessSettings;
pub use result::{BBox, Detection};
pub use simulate::Simulator;
