//! Stand-in detector for runs without a model.
//!
//! Generates 1 to 3 plausible detections per frame without looking at pixels.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::catalog::ClassCatalog;
use super::result::{BBox, Detection};

/// Probability that a simulated detection is drawn from the violation set.
pub const VIOLATION_PROBABILITY: f64 = 0.3;

/// Classes drawn for compliant simulated detections.
const BENIGN_POOL: [&str; 4] = ["person", "hardhat", "safety_vest", "mask"];

const MIN_CONFIDENCE: f32 = 0.6;
const MAX_CONFIDENCE: f32 = 0.95;

pub struct Simulator {
    rng: StdRng,
    violations: Vec<usize>,
    benign: Vec<usize>,
}

impl Simulator {
    pub fn new(catalog: &ClassCatalog) -> Self {
        Self::with_rng(catalog, StdRng::from_entropy())
    }

    pub fn seeded(catalog: &ClassCatalog, seed: u64) -> Self {
        Self::with_rng(catalog, StdRng::seed_from_u64(seed))
    }

    fn with_rng(catalog: &ClassCatalog, rng: StdRng) -> Self {
        let violations: Vec<usize> = catalog
            .violation_names()
            .filter_map(|name| catalog.id(name))
            .collect();
        let mut benign: Vec<usize> = BENIGN_POOL
            .iter()
            .filter_map(|name| catalog.id(name))
            .filter(|id| !violations.contains(id))
            .collect();
        if benign.is_empty() {
            benign = (0..catalog.len())
                .filter(|id| !violations.contains(id))
                .collect();
        }
        Self {
            rng,
            violations,
            benign,
        }
    }

    /// Random detections for a `width x height` frame. Boxes always lie inside the frame.
    pub fn generate(&mut self, catalog: &ClassCatalog, width: u32, height: u32) -> Vec<Detection> {
        if width == 0 || height == 0 {
            return Vec::new();
        }
        let count = self.rng.gen_range(1..=3);
        (0..count)
            .filter_map(|_| {
                let class_id = self.pick_class()?;
                let confidence = self.rng.gen_range(MIN_CONFIDENCE..=MAX_CONFIDENCE);
                let (x1, x2) = self.span(width, 50, 80, 200);
                let (y1, y2) = self.span(height, 50, 100, 300);
                Some(catalog.detection(class_id, confidence, BBox::new(x1, y1, x2, y2)))
            })
            .collect()
    }

    fn pick_class(&mut self) -> Option<usize> {
        let violation = !self.violations.is_empty() && self.rng.gen_bool(VIOLATION_PROBABILITY);
        let pool = if violation || self.benign.is_empty() {
            &self.violations
        } else {
            &self.benign
        };
        pool.choose(&mut self.rng).copied()
    }

    /// Start in `[margin, extent / 2]` and length in `[min_len, max_len]`, both shrunk to fit.
    fn span(&mut self, extent: u32, margin: u32, min_len: u32, max_len: u32) -> (i32, i32) {
        let hi = extent / 2;
        let lo = margin.min(hi);
        let start = self.rng.gen_range(lo..=hi);
        let room = extent - start;
        let len_hi = max_len.min(room).max(1);
        let len_lo = min_len.min(len_hi);
        let len = self.rng.gen_range(len_lo..=len_hi);
        (start as i32, (start + len).min(extent) as i32)
    }
}
