use anyhow::{anyhow, Result};

use super::result::{BBox, Detection};

/// Class names of the PPE model, in model output order.
pub const PPE_CLASSES: [&str; 9] = [
    "person",
    "hardhat",
    "no_hardhat",
    "safety_vest",
    "no_safety_vest",
    "mask",
    "no_mask",
    "safety_glasses",
    "gloves",
];

/// Classes whose presence means a worker is out of compliance.
pub const PPE_VIOLATIONS: [&str; 3] = ["no_hardhat", "no_safety_vest", "no_mask"];

/// Name reported for class ids the catalog does not know.
pub const UNKNOWN_CLASS: &str = "unknown";

const VIOLATION_BGR: [u8; 3] = [0, 0, 255];
const COMPLIANT_BGR: [u8; 3] = [0, 200, 0];
const PERSON_BGR: [u8; 3] = [255, 255, 255];

/// Fixed, ordered class list with a derived violation subset.
///
/// Ids are dense and 0-based: a class id is its index in `names`.
#[derive(Clone, Debug)]
pub struct ClassCatalog {
    names: Vec<String>,
    violations: Vec<bool>,
}

impl ClassCatalog {
    /// Build a catalog. Every violation name must be one of `names`, and names must be unique.
    pub fn new<S: AsRef<str>>(names: &[S], violations: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Err(anyhow!("class catalog must contain at least one class"));
        }
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() || name == UNKNOWN_CLASS {
                return Err(anyhow!("invalid class name '{}'", name));
            }
            if names[..i].contains(name) {
                return Err(anyhow!("duplicate class name '{}'", name));
            }
        }
        let mut flags = vec![false; names.len()];
        for violation in violations {
            let violation = violation.as_ref();
            let id = names
                .iter()
                .position(|n| n == violation)
                .ok_or_else(|| anyhow!("violation class '{}' is not in the catalog", violation))?;
            flags[id] = true;
        }
        Ok(Self {
            names,
            violations: flags,
        })
    }

    /// The nine-class PPE catalog.
    pub fn ppe() -> Self {
        Self {
            names: PPE_CLASSES.iter().map(|n| n.to_string()).collect(),
            violations: PPE_CLASSES
                .iter()
                .map(|n| PPE_VIOLATIONS.contains(n))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Class name for an id, `unknown` when out of range.
    pub fn name(&self, class_id: usize) -> &str {
        self.names
            .get(class_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_CLASS)
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn is_violation(&self, name: &str) -> bool {
        self.id(name).is_some_and(|id| self.violations[id])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn violation_names(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .zip(&self.violations)
            .filter(|(_, v)| **v)
            .map(|(n, _)| n.as_str())
    }

    /// Outline color (BGR) used when drawing a class.
    pub fn color(&self, name: &str) -> [u8; 3] {
        if self.is_violation(name) {
            VIOLATION_BGR
        } else if name == "person" || self.id(name).is_none() {
            PERSON_BGR
        } else {
            COMPLIANT_BGR
        }
    }

    /// Build a detection whose name and violation flag come from this catalog.
    pub fn detection(&self, class_id: usize, confidence: f32, bbox: BBox) -> Detection {
        let class_name = self.name(class_id).to_string();
        let is_violation = self.is_violation(&class_name);
        Detection {
            class_id,
            class_name,
            confidence,
            bbox,
            is_violation,
        }
    }
}

impl Default for ClassCatalog {
    fn default() -> Self {
        Self::ppe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppe_catalog_ids_are_stable() {
        let catalog = ClassCatalog::ppe();
        assert_eq!(catalog.len(), 9);
        assert_eq!(catalog.name(0), "person");
        assert_eq!(catalog.name(2), "no_hardhat");
        assert_eq!(catalog.id("gloves"), Some(8));
        assert_eq!(
            catalog.violation_names().collect::<Vec<_>>(),
            vec!["no_hardhat", "no_safety_vest", "no_mask"]
        );
    }

    #[test]
    fn out_of_range_ids_are_unknown_and_benign() {
        let catalog = ClassCatalog::ppe();
        let det = catalog.detection(42, 0.9, BBox::new(0, 0, 10, 10));
        assert_eq!(det.class_name, UNKNOWN_CLASS);
        assert!(!det.is_violation);
    }

    #[test]
    fn detection_violation_flag_follows_catalog() {
        let catalog = ClassCatalog::ppe();
        for id in 0..catalog.len() {
            let det = catalog.detection(id, 0.7, BBox::new(1, 1, 5, 5));
            assert_eq!(det.is_violation, catalog.is_violation(&det.class_name));
        }
    }

    #[test]
    fn custom_catalog_validation() {
        assert!(ClassCatalog::new(&["a", "b"], &["c"]).is_err());
        assert!(ClassCatalog::new(&["a", "a"], &[]).is_err());
        assert!(ClassCatalog::new::<&str>(&[], &[]).is_err());
        let catalog = ClassCatalog::new(&["ok", "bad"], &["bad"]).unwrap();
        assert!(catalog.is_violation("bad"));
        assert!(!catalog.is_violation("ok"));
    }

    #[test]
    fn colors_mark_violations_red() {
        let catalog = ClassCatalog::ppe();
        assert_eq!(catalog.color("no_mask"), [0, 0, 255]);
        assert_eq!(catalog.color("hardhat"), [0, 200, 0]);
        assert_eq!(catalog.color("person"), [255, 255, 255]);
    }
}
