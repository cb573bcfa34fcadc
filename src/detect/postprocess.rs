//! Raw model output to typed detections.
//!
//! 1. score = objectness x class score, argmax over classes (ties go to the lowest id)
//! 2. drop candidates with score <= conf_threshold
//! 3. center form to corner form
//! 4. greedy class-agnostic NMS
//! 5. rescale from model input space to frame space, clamp to the frame

use anyhow::{anyhow, Result};

use super::backend::{RawOutput, ROW_PREFIX};
use super::catalog::ClassCatalog;
use super::result::{BBox, Detection};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostprocessSettings {
    pub input_width: u32,
    pub input_height: u32,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
}

/// A scored box in model input space, corner form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Candidate {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn intersection_area(&self, other: &Candidate) -> f32 {
        let l = self.x1.max(other.x1);
        let r = self.x2.min(other.x2);
        let t = self.y1.max(other.y1);
        let b = self.y2.min(other.y2);
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    /// Intersection over union; 0 when the union is empty.
    pub fn iou(&self, other: &Candidate) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// `(cx, cy, w, h)` to `(x1, y1, x2, y2)`.
pub fn xywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// Score every row and keep those strictly above `conf_threshold`.
pub fn score_candidates(raw: &RawOutput, conf_threshold: f32) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for row in raw.rows() {
        let objectness = row[4];
        let mut class_id = 0;
        let mut confidence = f32::NEG_INFINITY;
        for (id, class_score) in row[ROW_PREFIX..].iter().enumerate() {
            let score = objectness * class_score;
            // Strict comparison keeps the lowest id on ties.
            if score > confidence {
                class_id = id;
                confidence = score;
            }
        }
        if confidence.is_nan() || confidence <= conf_threshold {
            continue;
        }
        let [x1, y1, x2, y2] = xywh_to_xyxy(row[0], row[1], row[2], row[3]);
        candidates.push(Candidate {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        });
    }
    candidates
}

/// Greedy non-maximum suppression.
///
/// Sorts by confidence (descending, stable) and keeps a box unless its IoU with an
/// already-kept box exceeds `iou_threshold`.
pub fn non_max_suppression(candidates: &mut Vec<Candidate>, iou_threshold: f32) {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..candidates.len() {
        let suppressed = (0..kept).any(|prev| candidates[prev].iou(&candidates[index]) > iou_threshold);
        if !suppressed {
            candidates.swap(kept, index);
            kept += 1;
        }
    }
    candidates.truncate(kept);
}

/// Full postprocess of one raw output for a frame of `frame_width x frame_height`.
pub fn postprocess(
    raw: &RawOutput,
    settings: &PostprocessSettings,
    catalog: &ClassCatalog,
    frame_width: u32,
    frame_height: u32,
) -> Result<Vec<Detection>> {
    if settings.input_width == 0 || settings.input_height == 0 {
        return Err(anyhow!("model input size must be non-zero"));
    }
    if frame_width == 0 || frame_height == 0 {
        return Err(anyhow!("frame size must be non-zero"));
    }

    let mut candidates = score_candidates(raw, settings.conf_threshold);
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    non_max_suppression(&mut candidates, settings.nms_threshold);

    let scale_x = frame_width as f32 / settings.input_width as f32;
    let scale_y = frame_height as f32 / settings.input_height as f32;
    let (fw, fh) = (frame_width as f32, frame_height as f32);

    let detections = candidates
        .iter()
        .filter_map(|c| {
            let bbox = BBox::new(
                (c.x1 * scale_x).clamp(0.0, fw) as i32,
                (c.y1 * scale_y).clamp(0.0, fh) as i32,
                (c.x2 * scale_x).clamp(0.0, fw) as i32,
                (c.y2 * scale_y).clamp(0.0, fh) as i32,
            );
            if !bbox.is_valid() {
                log::debug!("dropping degenerate box {:?} for class {}", bbox, c.class_id);
                return None;
            }
            Some(catalog.detection(c.class_id, c.confidence.min(1.0), bbox))
        })
        .collect();
    Ok(detections)
}
