//! Detection orchestrator.
//!
//! A run walks `Idle -> Validating -> Running -> Completed`, or ends early in `Rejected`.
//! Running the model and touching the session are split into [`DetectionOrchestrator::execute`]
//! and [`PendingRun::commit`], so callers can do the slow part without holding the session.
use std::{sync::Arc, time::Duration};

use image::RgbImage;
use itertools::Itertools;
use serde::Serialize;

use crate::{
    detector::{DetectionBox, DetectionResult, Detector},
    error::DetectError,
    session::SessionState,
};

const NO_IMAGE_MSG: &str = "Please upload an image first.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Validating,
    Running,
    Completed,
    Rejected,
}

/// Render-ready outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub rendered_image: RgbImage,
    pub labels: Vec<String>,
    pub detections: Vec<DetectionBox>,
    pub total_detections: usize,
    pub unique_classes: usize,
    pub elapsed: Duration,
    /// Set when nothing was detected.
    pub suggest_lower_threshold: bool,
}

impl RunSummary {
    fn from_result(result: DetectionResult) -> Self {
        let labels = result.labels();
        let unique_classes = labels.iter().unique().count();

        Self {
            total_detections: result.boxes.len(),
            unique_classes,
            suggest_lower_threshold: result.boxes.is_empty(),
            labels,
            detections: result.boxes,
            rendered_image: result.rendered_image,
            elapsed: result.elapsed,
        }
    }

    pub fn message(&self) -> String {
        if self.suggest_lower_threshold {
            "No objects detected. Try reducing the confidence threshold.".to_owned()
        } else {
            format!("Detected: {}", self.labels.join(", "))
        }
    }
}

/// Terminal state of a run and the path it took there.
#[derive(Debug)]
pub struct RunReport {
    pub trail: Vec<RunState>,
    pub outcome: Result<RunSummary, DetectError>,
}

impl RunReport {
    pub fn state(&self) -> RunState {
        self.trail.last().copied().unwrap_or(RunState::Idle)
    }
}

/// A run that has finished inference but not yet updated any session.
#[derive(Debug)]
pub struct PendingRun {
    trail: Vec<RunState>,
    outcome: Result<DetectionResult, DetectError>,
}

impl PendingRun {
    fn new() -> Self {
        Self {
            trail: vec![RunState::Idle],
            outcome: Err(DetectError::ModelUnavailable),
        }
    }

    fn enter(&mut self, state: RunState) {
        if let Some(prev) = self.trail.last() {
            log::debug!("Run {:?} -> {:?}", prev, state);
        }
        self.trail.push(state);
    }

    fn reject(mut self, err: DetectError) -> Self {
        log::warn!("Run rejected: {err}");
        self.enter(RunState::Rejected);
        self.outcome = Err(err);
        self
    }

    /// Apply a successful run to `session` and summarize it. Rejected runs leave it untouched.
    pub fn commit(self, session: &mut SessionState) -> RunReport {
        let PendingRun { mut trail, outcome } = self;

        let outcome = outcome.map(|result| {
            let summary = RunSummary::from_result(result);
            session.record_run(summary.labels.clone());
            log::debug!("Run {:?} -> {:?}", RunState::Running, RunState::Completed);
            trail.push(RunState::Completed);
            summary
        });

        RunReport { trail, outcome }
    }
}

#[derive(Clone)]
pub struct DetectionOrchestrator {
    detector: Option<Arc<Detector>>,
}

impl DetectionOrchestrator {
    /// `None` when the model failed to load, every run is then rejected.
    pub fn new(detector: Option<Arc<Detector>>) -> Self {
        Self { detector }
    }

    pub fn is_online(&self) -> bool {
        self.detector.is_some()
    }

    pub fn class_names(&self) -> &[String] {
        self.detector
            .as_ref()
            .map(|detector| detector.class_names())
            .unwrap_or_default()
    }

    /// Validate the trigger and run inference.
    pub fn execute(&self, image: Option<&RgbImage>, confidence_threshold: f32) -> PendingRun {
        let mut run = PendingRun::new();
        run.enter(RunState::Validating);

        let Some(image) = image else {
            return run.reject(DetectError::validation(NO_IMAGE_MSG));
        };
        let Some(detector) = &self.detector else {
            return run.reject(DetectError::ModelUnavailable);
        };

        run.enter(RunState::Running);
        match detector.infer(image, confidence_threshold) {
            Ok(result) => {
                run.outcome = Ok(result);
                run
            }
            Err(err) => run.reject(err),
        }
    }

    /// One complete run against `session`.
    pub fn run(
        &self,
        image: Option<&RgbImage>,
        confidence_threshold: f32,
        session: &mut SessionState,
    ) -> RunReport {
        self.execute(image, confidence_threshold).commit(session)
    }
}
