//! Model loading.
//!
//! A model is loaded once per process and shared read-only afterwards. Everything downstream
//! talks to it through the [`DetectionModel`] trait, so the orchestrators never see the
//! backend's native output shapes.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use image::RgbImage;

use crate::{error::DetectError, nn::YoloModel};

/// Candidate produced by a backend, before class names are resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    /// `[x_min, y_min, x_max, y_max]` in pixels of the input image.
    pub bbox: [f32; 4],
}

/// A loaded detection model.
///
/// `predict` takes `&self` and must not mutate the model, several sessions call it
/// concurrently.
pub trait DetectionModel: Send + Sync {
    /// Fixed class-name table, indexed by class id.
    fn class_names(&self) -> &[String];

    /// Detect objects scoring at least `min_confidence`, in the backend's output order.
    fn predict(&self, image: &RgbImage, min_confidence: f32) -> anyhow::Result<Vec<RawDetection>>;
}

/// Shared handle to the process-wide model.
pub type ModelHandle = Arc<dyn DetectionModel>;

/// Where to find the model artifact and its class table.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
}

impl ModelSource {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            labels_path: None,
            input_size: crate::nn::DEFAULT_INPUT_SIZE,
        }
    }

    pub fn with_labels(mut self, labels_path: Option<PathBuf>) -> Self {
        self.labels_path = labels_path;
        self
    }

    pub fn with_input_size(mut self, input_size: u32) -> Self {
        self.input_size = input_size;
        self
    }

    /// Labels file, defaulting to `<model stem>.names` next to the model.
    pub fn labels_path(&self) -> PathBuf {
        self.labels_path
            .clone()
            .unwrap_or_else(|| self.model_path.with_extension("names"))
    }
}

/// Load the YOLOv8 model and its class table.
pub fn load(source: &ModelSource) -> Result<ModelHandle, DetectError> {
    let model_path = &source.model_path;
    if source.input_size == 0 {
        return Err(DetectError::model_load(
            model_path,
            "input size must be at least 1 pixel",
        ));
    }
    if !model_path.is_file() {
        return Err(DetectError::model_load(
            model_path,
            "model file does not exist",
        ));
    }

    let class_names = read_class_names(&source.labels_path())?;

    log::info!(
        "Loading model {} ({} classes, input {}x{})",
        model_path.display(),
        class_names.len(),
        source.input_size,
        source.input_size
    );

    let model = YoloModel::load(model_path, class_names, source.input_size)
        .map_err(|e| DetectError::model_load(model_path, e))?;

    log::info!("Model ready");

    Ok(Arc::new(model))
}

/// Read a class table with one name per line. Blank lines are skipped.
pub fn read_class_names(path: &Path) -> Result<Vec<String>, DetectError> {
    let content = fs::read_to_string(path).map_err(|e| DetectError::model_load(path, e))?;
    let names = parse_class_names(&content);

    if names.is_empty() {
        return Err(DetectError::model_load(path, "class table is empty"));
    }

    Ok(names)
}

fn parse_class_names(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}
