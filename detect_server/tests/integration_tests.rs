use std::{path::PathBuf, sync::Arc};

use detect_server::{
    detector::Detector,
    draw::BoxPainter,
    error::DetectError,
    model::{self, ModelSource},
    orchestrator::{DetectionOrchestrator, RunState},
    session::SessionState,
};
use image::{Rgb, RgbImage};

/// Path of a YOLOv8 ONNX export with its `.names` file next to it, if one is available.
fn model_under_test() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os("DETECT_MODEL")?);
    if path.is_file() {
        Some(path)
    } else {
        println!("DETECT_MODEL={} does not exist", path.display());
        None
    }
}

#[test]
fn test_loading_missing_model_fails() {
    let source = ModelSource::new("weights/does-not-exist.onnx");
    assert!(matches!(
        model::load(&source),
        Err(DetectError::ModelLoad { .. })
    ));
}

#[test]
fn test_yolov8_runs_through_orchestrator() -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = model_under_test() else {
        println!("Skipping, set DETECT_MODEL to a YOLOv8 ONNX export to run");
        return Ok(());
    };

    let model = model::load(&ModelSource::new(path))?;
    let detector = Detector::new(model, BoxPainter::without_labels());
    let orchestrator = DetectionOrchestrator::new(Some(Arc::new(detector)));
    let mut session = SessionState::new();

    // Plain grey frame, nothing a waste model should be confident about
    let image = RgbImage::from_pixel(320, 240, Rgb([114, 114, 114]));

    for threshold in [0.25, 0.8] {
        let report = orchestrator.run(Some(&image), threshold, &mut session);
        assert_eq!(report.state(), RunState::Completed);

        let summary = report.outcome?;
        assert_eq!(summary.rendered_image.dimensions(), (320, 240));
        assert!(summary.elapsed.as_nanos() > 0);
        assert!(summary.detections.iter().all(|d| d.confidence >= threshold));
        assert_eq!(session.recent_labels(), summary.labels.as_slice());
    }

    Ok(())
}
