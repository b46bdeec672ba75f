//! Inference adapter.
//!
//! Normalizes whatever the backend returns into one [`DetectionResult`]: boxes above the
//! threshold with resolved class names, the annotated frame and the time spent in the model.
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use image::{ImageFormat, RgbImage};
use serde::Serialize;

use crate::{
    draw::BoxPainter,
    error::DetectError,
    model::{ModelHandle, RawDetection},
};

/// Image encodings accepted from users.
pub const SUPPORTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Bmp,
    ImageFormat::WebP,
];

/// Shortest duration reported for a model call.
const MIN_ELAPSED: Duration = Duration::from_nanos(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionBox {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    /// `[x_min, y_min, x_max, y_max]` in pixels of the input image.
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Boxes in model output order.
    pub boxes: Vec<DetectionBox>,
    /// Input image with all boxes drawn, RGB, same dimensions as the input.
    pub rendered_image: RgbImage,
    /// Wall time of the model call alone.
    pub elapsed: Duration,
}

impl DetectionResult {
    pub fn labels(&self) -> Vec<String> {
        self.boxes.iter().map(|b| b.class_name.clone()).collect()
    }
}

pub struct Detector {
    model: ModelHandle,
    painter: BoxPainter,
}

impl Detector {
    pub fn new(model: ModelHandle, painter: BoxPainter) -> Self {
        Self { model, painter }
    }

    /// Load with the label font at `font_path`, or any system font.
    pub fn with_font(model: ModelHandle, font_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self::new(model, BoxPainter::new(font_path)))
    }

    pub fn class_names(&self) -> &[String] {
        self.model.class_names()
    }

    /// Detect objects with a confidence of at least `confidence_threshold`.
    pub fn infer(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<DetectionResult, DetectError> {
        let threshold = validate_threshold(confidence_threshold)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectError::validation("image is empty"));
        }

        let start = Instant::now();
        let raw = self
            .model
            .predict(image, threshold)
            .map_err(DetectError::inference)?;
        let elapsed = start.elapsed().max(MIN_ELAPSED);

        let boxes = self.resolve(raw, threshold)?;
        log::debug!(
            "{} detections at threshold {:.2} in {:.2?}",
            boxes.len(),
            threshold,
            elapsed
        );

        let rendered_image = self.painter.paint(image.clone(), &boxes);

        Ok(DetectionResult {
            boxes,
            rendered_image,
            elapsed,
        })
    }

    /// Drop anything below the threshold and attach class names.
    fn resolve(
        &self,
        raw: Vec<RawDetection>,
        threshold: f32,
    ) -> Result<Vec<DetectionBox>, DetectError> {
        let class_names = self.model.class_names();

        raw.into_iter()
            .filter(|d| d.confidence >= threshold)
            .map(|d| {
                let class_name =
                    class_names
                        .get(d.class_id)
                        .ok_or(DetectError::ClassResolution {
                            class_id: d.class_id,
                            table_len: class_names.len(),
                        })?;
                Ok(DetectionBox {
                    class_id: d.class_id,
                    class_name: class_name.clone(),
                    confidence: d.confidence,
                    bbox: d.bbox,
                })
            })
            .collect()
    }
}

/// Thresholds must lie strictly between 0 and 1.
pub fn validate_threshold(threshold: f32) -> Result<f32, DetectError> {
    if threshold > 0.0 && threshold < 1.0 {
        Ok(threshold)
    } else {
        Err(DetectError::validation(format!(
            "confidence threshold must be between 0 and 1, got {threshold}"
        )))
    }
}

/// Decode an uploaded image into an RGB raster.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DetectError> {
    let format = image::guess_format(bytes)
        .map_err(|_| DetectError::validation("unrecognized image format"))?;
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(DetectError::validation(format!(
            "unsupported image format {format:?}, use JPEG, PNG, BMP or WEBP"
        )));
    }

    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| DetectError::validation(format!("image could not be decoded: {e}")))?;

    Ok(image.to_rgb8())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::ScriptedModel;

    fn detector(model: ScriptedModel) -> Detector {
        Detector::new(Arc::new(model), BoxPainter::without_labels())
    }

    #[test]
    fn test_infer_resolves_class_names() -> Result<(), DetectError> {
        let model = ScriptedModel::new(&["plastic", "glass"])
            .detect(1, 0.9)
            .detect(0, 0.7);
        let detector = detector(model);

        let result = detector.infer(&RgbImage::new(32, 32), 0.5)?;

        assert_eq!(result.labels(), vec!["glass", "plastic"]);
        assert_eq!(result.rendered_image.dimensions(), (32, 32));
        assert!(result.elapsed > Duration::ZERO);
        Ok(())
    }

    #[test]
    fn test_infer_never_leaks_low_confidence_boxes() -> Result<(), DetectError> {
        for threshold in [0.05, 0.3, 0.5, 0.75, 0.95] {
            let model = ScriptedModel::new(&["plastic"])
                .detect(0, 0.1)
                .detect(0, 0.5)
                .detect(0, 0.8)
                .ignoring_threshold();
            let result = detector(model).infer(&RgbImage::new(8, 8), threshold)?;

            assert!(result.boxes.iter().all(|b| b.confidence >= threshold));
        }
        Ok(())
    }

    #[test]
    fn test_unknown_class_id_is_resolution_error() {
        let model = ScriptedModel::new(&["plastic"]).detect(3, 0.9);

        match detector(model).infer(&RgbImage::new(8, 8), 0.5) {
            Err(DetectError::ClassResolution {
                class_id,
                table_len,
            }) => {
                assert_eq!(class_id, 3);
                assert_eq!(table_len, 1);
            }
            other => panic!("expected class resolution error, got {other:?}"),
        }
    }

    #[test]
    fn test_backend_fault_is_inference_error() {
        let model = ScriptedModel::new(&["plastic"]).failing("tensor shape mismatch");

        let err = detector(model).infer(&RgbImage::new(8, 8), 0.5).unwrap_err();

        assert_eq!(err.kind(), "inference");
        assert!(err.to_string().contains("tensor shape mismatch"));
    }

    #[test]
    fn test_invalid_thresholds_are_rejected() {
        let model = ScriptedModel::new(&["plastic"]);
        let detector = detector(model);

        for threshold in [0.0, 1.0, -0.2, 1.5, f32::NAN] {
            let err = detector
                .infer(&RgbImage::new(8, 8), threshold)
                .unwrap_err();
            assert_eq!(err.kind(), "validation");
        }
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let model = ScriptedModel::new(&["plastic"]);
        let calls = model.calls();

        let err = detector(model).infer(&RgbImage::new(0, 0), 0.5).unwrap_err();

        assert_eq!(err.kind(), "validation");
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_repeated_inference_is_deterministic() -> Result<(), DetectError> {
        let model = ScriptedModel::new(&["plastic", "glass", "metal"])
            .detect(2, 0.6)
            .detect(0, 0.9);
        let detector = detector(model);
        let image = RgbImage::new(16, 16);

        let first = detector.infer(&image, 0.5)?;
        let second = detector.infer(&image, 0.5)?;

        let ids = |r: &DetectionResult| r.boxes.iter().map(|b| b.class_id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert!(first.elapsed > Duration::ZERO && second.elapsed > Duration::ZERO);
        Ok(())
    }

    #[test]
    fn test_decode_png_upload() -> Result<(), Box<dyn std::error::Error>> {
        let mut png = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(RgbImage::new(5, 3))
            .write_to(&mut png, ImageFormat::Png)?;

        let image = decode_image(png.get_ref())?;

        assert_eq!(image.dimensions(), (5, 3));
        Ok(())
    }

    #[test]
    fn test_decode_rejects_unknown_bytes() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
