use std::time::Duration;

use ppe_sentinel::detect::postprocess::postprocess;
use ppe_sentinel::detect::{
    ClassCatalog, DetectionEngine, EngineMode, EngineSettings, PostprocessSettings, RawOutput,
};
use ppe_sentinel::ingest::{FrameSource, SyntheticSource};

fn row(cx: f32, cy: f32, w: f32, h: f32, objectness: f32, class_id: usize) -> Vec<f32> {
    let mut row = vec![cx, cy, w, h, objectness];
    let mut scores = vec![0.0; ClassCatalog::ppe().len()];
    scores[class_id] = 1.0;
    row.extend(scores);
    row
}

#[test]
fn simulated_detector_on_synthetic_frames() {
    let catalog = ClassCatalog::ppe();
    let settings = EngineSettings {
        use_simulation: true,
        simulated_latency: Duration::ZERO,
        conf_threshold: 0.5,
        ..EngineSettings::default()
    };
    let mut engine = DetectionEngine::new(settings, catalog.clone(), None)
        .unwrap()
        .with_seed(11);
    assert_eq!(engine.mode(), EngineMode::Simulated);
    assert!(engine.stats().fallback_reason.is_none());

    let mut source = SyntheticSource::with_seed(640, 480, 200, 3).unwrap();
    source.start().unwrap();
    for _ in 0..25 {
        let frame = source.get_frame(Duration::from_secs(1)).unwrap();
        let detections = engine.detect(&frame);
        assert!((1..=3).contains(&detections.len()), "{}", detections.len());
        for det in &detections {
            assert!(det.bbox.is_valid());
            assert!(det.bbox.within(640, 480), "{:?}", det.bbox);
            assert!((0.6..=0.95).contains(&det.confidence));
            assert_eq!(det.is_violation, catalog.is_violation(&det.class_name));
        }
    }
    assert_eq!(engine.stats().total_inferences, 25);
}

#[test]
fn overlapping_boxes_keep_the_most_confident() {
    let catalog = ClassCatalog::ppe();
    let settings = PostprocessSettings {
        input_width: 640,
        input_height: 640,
        conf_threshold: 0.5,
        nms_threshold: 0.45,
    };
    // Same class, shifted 5px: IoU 95/105.
    let raw = RawOutput::from_rows(&[
        row(100.0, 100.0, 100.0, 100.0, 0.6, 2),
        row(105.0, 100.0, 100.0, 100.0, 0.8, 2),
    ])
    .unwrap();

    let detections = postprocess(&raw, &settings, &catalog, 640, 640).unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].class_name, "no_hardhat");
    assert!((detections[0].confidence - 0.8).abs() < 1e-6);
    assert_eq!(
        (detections[0].bbox.x1, detections[0].bbox.x2),
        (55, 155)
    );
}

#[test]
fn disjoint_boxes_both_survive_and_are_rescaled() {
    let catalog = ClassCatalog::ppe();
    let settings = PostprocessSettings {
        input_width: 640,
        input_height: 640,
        conf_threshold: 0.5,
        nms_threshold: 0.45,
    };
    let raw = RawOutput::from_rows(&[
        row(100.0, 100.0, 100.0, 100.0, 0.9, 0),
        row(500.0, 500.0, 100.0, 100.0, 0.7, 4),
    ])
    .unwrap();

    let detections = postprocess(&raw, &settings, &catalog, 1280, 720).unwrap();
    assert_eq!(detections.len(), 2);
    for det in &detections {
        assert!(det.bbox.within(1280, 720));
    }
    let vest = detections
        .iter()
        .find(|d| d.class_name == "no_safety_vest")
        .unwrap();
    assert!(vest.is_violation);
    assert_eq!((vest.bbox.x1, vest.bbox.y1), (900, 506));
}
