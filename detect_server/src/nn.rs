//! YOLOv8 detection backend on tract.
//!
//! The exported network takes one `[1, 3, S, S]` RGB tensor scaled to `[0, 1]` and returns one
//! `[1, 4 + C, N]` tensor: for each of the `N` anchors the box center, width and height in input
//! pixels followed by one score per class.
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::{ArrayView3, Ix3};
use smallvec::SmallVec;
use tract_onnx::prelude::*;

use crate::model::{DetectionModel, RawDetection};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;
type NnOut = SmallVec<[TValue; 4]>;

pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// Overlap above which the less confident of two boxes is suppressed.
pub const DEFAULT_MAX_IOU: f32 = 0.7;

/// Upper bound on boxes returned for one image.
pub const MAX_DETECTIONS: usize = 300;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Grey used to pad letterboxed images.
const LETTERBOX_FILL: u8 = 114;

pub struct YoloModel {
    model: NnModel,
    input_size: u32,
    class_names: Vec<String>,
    max_iou: f32,
}

impl YoloModel {
    pub fn load(path: &Path, class_names: Vec<String>, input_size: u32) -> Result<Self> {
        if input_size == 0 {
            bail!("input size must be at least 1 pixel");
        }
        let input_fact = InferenceFact::dt_shape(
            f32::datum_type(),
            tvec!(1, 3, input_size as usize, input_size as usize),
        );
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("{} is not a readable ONNX model", path.display()))?
            .with_input_fact(0, input_fact)?
            .into_optimized()?;

        check_output_shape(&model, class_names.len())?;

        Ok(Self {
            model: model.into_runnable()?,
            input_size,
            class_names,
            max_iou: DEFAULT_MAX_IOU,
        })
    }

    fn preproc(&self, input: &RgbImage) -> (Tensor, Letterbox) {
        let size = self.input_size;
        let letterbox = Letterbox::fit(input.width(), input.height(), size);

        let resized: RgbImage = image::imageops::resize(
            input,
            letterbox.width,
            letterbox.height,
            FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
        image::imageops::replace(
            &mut canvas,
            &resized,
            letterbox.pad_x as i64,
            letterbox.pad_y as i64,
        );

        let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| canvas[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into();

        (tensor, letterbox)
    }

    fn postproc(
        &self,
        raw_nn_out: NnOut,
        letterbox: &Letterbox,
        image_size: (u32, u32),
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>> {
        let output = raw_nn_out
            .first()
            .context("model produced no output")?
            .to_array_view::<f32>()?
            .into_dimensionality::<Ix3>()?;

        let candidates = decode_candidates(
            output,
            self.class_names.len(),
            min_confidence,
            letterbox,
            image_size,
        )?;

        Ok(non_maximum_suppression(
            candidates,
            self.max_iou,
            MAX_DETECTIONS,
        ))
    }
}

impl DetectionModel for YoloModel {
    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn predict(&self, image: &RgbImage, min_confidence: f32) -> Result<Vec<RawDetection>> {
        let (tensor, letterbox) = self.preproc(image);
        let raw_nn_out = self.model.run(tvec!(tensor.into()))?;
        self.postproc(raw_nn_out, &letterbox, image.dimensions(), min_confidence)
    }
}

fn check_output_shape(model: &TypedModel, num_classes: usize) -> Result<()> {
    let fact = model.output_fact(0)?;
    match fact.shape.as_concrete() {
        Some([1, features, _anchors]) if *features == 4 + num_classes => Ok(()),
        Some(shape) => bail!(
            "output shape {:?} does not match a YOLOv8 detector with {} classes",
            shape,
            num_classes
        ),
        None => bail!("output shape of the model is not fixed"),
    }
}

/// Mapping between image pixels and the square network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    /// Fit an image of `width` x `height` into a `size` x `size` square, keeping aspect ratio.
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = f32::min(size as f32 / width as f32, size as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, size);

        Self {
            scale,
            pad_x: (size - scaled_width) / 2,
            pad_y: (size - scaled_height) / 2,
            width: scaled_width,
            height: scaled_height,
        }
    }

    /// Map a point of the network input back onto the original image.
    pub fn to_image(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Turn the raw `[1, 4 + C, N]` output into candidates scoring at least `min_confidence`.
///
/// Each anchor keeps its best class only. Boxes are mapped back through the letterbox and
/// clipped to the image.
pub fn decode_candidates(
    output: ArrayView3<f32>,
    num_classes: usize,
    min_confidence: f32,
    letterbox: &Letterbox,
    (width, height): (u32, u32),
) -> Result<Vec<RawDetection>> {
    let (_, features, anchors) = output.dim();
    if features != 4 + num_classes {
        bail!(
            "expected {} features per anchor, got {}",
            4 + num_classes,
            features
        );
    }

    let (width, height) = (width as f32, height as f32);
    let mut candidates = Vec::new();

    for anchor in 0..anchors {
        let (class_id, confidence) = (0..num_classes)
            .map(|c| (c, output[[0, 4 + c, anchor]]))
            .fold((0, f32::MIN), |best, current| {
                if current.1 > best.1 {
                    current
                } else {
                    best
                }
            });

        if confidence < min_confidence {
            continue;
        }

        let cx = output[[0, 0, anchor]];
        let cy = output[[0, 1, anchor]];
        let half_w = output[[0, 2, anchor]] / 2.0;
        let half_h = output[[0, 3, anchor]] / 2.0;

        let (x_tl, y_tl) = letterbox.to_image(cx - half_w, cy - half_h);
        let (x_br, y_br) = letterbox.to_image(cx + half_w, cy + half_h);

        candidates.push(RawDetection {
            class_id,
            confidence,
            bbox: [
                x_tl.clamp(0.0, width),
                y_tl.clamp(0.0, height),
                x_br.clamp(0.0, width),
                y_br.clamp(0.0, height),
            ],
        });
    }

    Ok(candidates)
}

/// Run per-class non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident box and walk the others in order of sinking confidence,
/// keeping only those whose IoU with every kept box of the same class is at most `max_iou`.
/// Boxes of different classes never suppress each other. Stop once `max_detections` boxes
/// are kept.
pub fn non_maximum_suppression(
    mut candidates: Vec<RawDetection>,
    max_iou: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<RawDetection> = vec![];
    'candidates: while selected.len() < max_detections {
        // Most confident remaining candidate sits at the back
        match candidates.pop() {
            Some(candidate) => {
                for kept in selected.iter().filter(|k| k.class_id == candidate.class_id) {
                    if iou(&candidate.bbox, &kept.bbox) > max_iou {
                        continue 'candidates;
                    }
                }
                selected.push(candidate);
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // For disjoint boxes the overlap corners cross over and the area is zero
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Area enclosed by `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`, zero when the
/// corners are crossed.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

#[cfg(test)]
mod test {
    use ndarray::Array3;

    use super::*;

    fn det(confidence: f32, bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            class_id: 0,
            confidence,
            bbox,
        }
    }

    /// Two classes, three anchors in a 640 input for a 640x640 image.
    fn synthetic_output() -> Array3<f32> {
        let mut out = Array3::<f32>::zeros((1, 6, 3));
        let anchors = [
            // cx, cy, w, h, score class 0, score class 1
            [100.0, 100.0, 40.0, 20.0, 0.9, 0.1],
            [300.0, 200.0, 10.0, 10.0, 0.2, 0.6],
            [500.0, 500.0, 50.0, 50.0, 0.1, 0.3],
        ];
        for (a, values) in anchors.iter().enumerate() {
            for (f, v) in values.iter().enumerate() {
                out[[0, f, a]] = *v;
            }
        }
        out
    }

    #[test]
    fn test_decode_keeps_best_class_above_threshold() -> Result<()> {
        let output = synthetic_output();
        let letterbox = Letterbox::fit(640, 640, 640);

        let candidates = decode_candidates(output.view(), 2, 0.5, &letterbox, (640, 640))?;

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].class_id, 0);
        assert_eq!(candidates[0].bbox, [80.0, 90.0, 120.0, 110.0]);
        assert_eq!(candidates[1].class_id, 1);
        assert!(candidates.iter().all(|c| c.confidence >= 0.5));
        Ok(())
    }

    #[test]
    fn test_decode_threshold_is_inclusive() -> Result<()> {
        let output = synthetic_output();
        let letterbox = Letterbox::fit(640, 640, 640);

        let candidates = decode_candidates(output.view(), 2, 0.6, &letterbox, (640, 640))?;

        assert_eq!(candidates.len(), 2);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_wrong_class_count() {
        let output = synthetic_output();
        let letterbox = Letterbox::fit(640, 640, 640);

        assert!(decode_candidates(output.view(), 80, 0.5, &letterbox, (640, 640)).is_err());
    }

    #[test]
    fn test_letterbox_maps_back_to_image() {
        // 1280x640 image: scale 0.5, 160 px padding above and below
        let letterbox = Letterbox::fit(1280, 640, 640);

        assert_eq!(letterbox.to_image(0.0, 160.0), (0.0, 0.0));
        assert_eq!(letterbox.to_image(640.0, 480.0), (1280.0, 640.0));
    }

    #[test]
    fn test_nms_suppresses_overlapping_boxes() {
        let candidates = vec![
            det(0.6, [0.0, 0.0, 10.0, 10.0]),
            det(0.9, [1.0, 1.0, 11.0, 11.0]),
            det(0.7, [50.0, 50.0, 60.0, 60.0]),
        ];

        let selected = non_maximum_suppression(candidates, 0.5, MAX_DETECTIONS);

        let confidences: Vec<f32> = selected.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_other_classes() {
        let candidates = vec![
            RawDetection {
                class_id: 0,
                confidence: 0.9,
                bbox: [0.0, 0.0, 100.0, 100.0],
            },
            RawDetection {
                class_id: 1,
                confidence: 0.8,
                bbox: [2.0, 2.0, 100.0, 100.0],
            },
            RawDetection {
                class_id: 0,
                confidence: 0.7,
                bbox: [1.0, 1.0, 100.0, 100.0],
            },
        ];

        let selected = non_maximum_suppression(candidates, DEFAULT_MAX_IOU, MAX_DETECTIONS);

        let classes: Vec<usize> = selected.iter().map(|d| d.class_id).collect();
        assert_eq!(classes, vec![0, 1]);
    }

    #[test]
    fn test_nms_caps_detections() {
        let candidates = (0..10)
            .map(|i| {
                let offset = i as f32 * 20.0;
                det(0.5, [offset, 0.0, offset + 10.0, 10.0])
            })
            .collect();

        assert_eq!(non_maximum_suppression(candidates, 0.5, 4).len(), 4);
    }

    #[test]
    fn test_iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[5.0, 5.0, 6.0, 6.0]), 0.0);
        assert!(iou(&[0.0, 0.0, 4.0, 4.0], &[0.0, 0.0, 4.0, 4.0]) > 0.99);
    }
}
