//! Scripted model for unit tests.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use image::RgbImage;

use crate::model::{DetectionModel, RawDetection};

/// Number of `predict` calls a [`ScriptedModel`] has served.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returns the same detections for every image.
pub struct ScriptedModel {
    class_names: Vec<String>,
    detections: Vec<RawDetection>,
    ignore_threshold: bool,
    error: Option<String>,
    delay: Duration,
    calls: CallCounter,
}

impl ScriptedModel {
    pub fn new(class_names: &[&str]) -> Self {
        Self {
            class_names: class_names.iter().map(|&n| n.to_owned()).collect(),
            detections: Vec::new(),
            ignore_threshold: false,
            error: None,
            delay: Duration::ZERO,
            calls: CallCounter::default(),
        }
    }

    pub fn detect(mut self, class_id: usize, confidence: f32) -> Self {
        let offset = self.detections.len() as f32;
        self.detections.push(RawDetection {
            class_id,
            confidence,
            bbox: [offset, offset, offset + 4.0, offset + 4.0],
        });
        self
    }

    /// Return every scripted detection, whatever the threshold.
    pub fn ignoring_threshold(mut self) -> Self {
        self.ignore_threshold = true;
        self
    }

    pub fn failing(mut self, msg: &str) -> Self {
        self.error = Some(msg.to_owned());
        self
    }

    /// Block every `predict` call for `delay`.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl DetectionModel for ScriptedModel {
    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn predict(&self, _image: &RgbImage, min_confidence: f32) -> anyhow::Result<Vec<RawDetection>> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(msg) = &self.error {
            return Err(anyhow!("{msg}"));
        }

        Ok(self
            .detections
            .iter()
            .filter(|d| self.ignore_threshold || d.confidence >= min_confidence)
            .copied()
            .collect())
    }
}
