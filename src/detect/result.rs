use serde::{Serialize, Serializer};

/// Axis-aligned box in frame pixel coordinates, corner form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// True when the box has positive area.
    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    /// True when the box lies within `[0, width] x [0, height]`.
    pub fn within(&self, width: u32, height: u32) -> bool {
        self.x1 >= 0 && self.y1 >= 0 && self.x2 <= width as i32 && self.y2 <= height as i32
    }
}

/// A classified, localized object on one frame.
///
/// Only `ClassCatalog::detection` builds one outside this crate, so
/// `is_violation` always agrees with the catalog's violation set:
///
/// ```compile_fail
/// use ppe_sentinel::detect::{BBox, Detection};
///
/// let forged = Detection {
///     class_id: 2,
///     class_name: "no_hardhat".to_string(),
///     confidence: 0.9,
///     bbox: BBox::new(0, 0, 10, 10),
///     is_violation: false,
/// };
/// ```
///
/// ```
/// use ppe_sentinel::detect::{BBox, ClassCatalog};
///
/// let det = ClassCatalog::ppe().detection(2, 0.9, BBox::new(0, 0, 10, 10));
/// assert!(det.is_violation);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize)]
#[non_exhaustive]
pub struct Detection {
    pub class_id: usize,
    pub class_name: String,
    #[serde(serialize_with = "round_confidence")]
    pub confidence: f32,
    pub bbox: BBox,
    pub is_violation: bool,
}

fn round_confidence<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    let rounded = (*value as f64 * 10_000.0).round() / 10_000.0;
    serializer.serialize_f64(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ClassCatalog;

    #[test]
    fn detection_json_shape() {
        let det = ClassCatalog::ppe().detection(2, 0.876_543_2, BBox::new(10, 20, 110, 220));
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["class_id"], 2);
        assert_eq!(json["class_name"], "no_hardhat");
        assert_eq!(json["confidence"], 0.8765);
        assert_eq!(json["bbox"]["x1"], 10);
        assert_eq!(json["bbox"]["y2"], 220);
        assert_eq!(json["is_violation"], true);
    }

    #[test]
    fn bbox_bounds() {
        let b = BBox::new(0, 0, 640, 480);
        assert!(b.is_valid());
        assert!(b.within(640, 480));
        assert!(!b.within(639, 480));
        assert!(!BBox::new(5, 5, 5, 9).is_valid());
        assert_eq!((b.width(), b.height()), (640, 480));
    }
}
