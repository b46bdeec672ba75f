//! Error taxonomy of the detection loop.
use std::path::PathBuf;

use thiserror::Error;

/// Boxed cause attached to model and backend failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DetectError {
    /// No detection capability for the whole process, surfaced once at startup.
    #[error("failed to load model from {}: {source}", .path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("model unavailable, check the weights path in the settings")]
    ModelUnavailable,

    #[error("{0}")]
    Validation(String),

    #[error("inference failed: {source}")]
    Inference {
        #[source]
        source: BoxError,
    },

    /// The model and its class table do not belong together.
    #[error("class id {class_id} is outside the class table of {table_len} names")]
    ClassResolution { class_id: usize, table_len: usize },
}

impl DetectError {
    pub fn model_load(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        DetectError::ModelLoad {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DetectError::Validation(msg.into())
    }

    pub fn inference(source: impl Into<BoxError>) -> Self {
        DetectError::Inference {
            source: source.into(),
        }
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectError::ModelLoad { .. } => "model_load",
            DetectError::ModelUnavailable => "model_unavailable",
            DetectError::Validation(_) => "validation",
            DetectError::Inference { .. } => "inference",
            DetectError::ClassResolution { .. } => "class_resolution",
        }
    }

    /// Message shown to the user when a run fails.
    pub fn user_message(&self) -> String {
        match self {
            DetectError::Validation(msg) => msg.clone(),
            DetectError::Inference { .. } | DetectError::ClassResolution { .. } => {
                format!("Detection failed: {self}")
            }
            DetectError::ModelLoad { .. } | DetectError::ModelUnavailable => self.to_string(),
        }
    }

    /// Whether re-triggering the run can succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DetectError::Validation(_) | DetectError::Inference { .. }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_inference_error_keeps_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "device lost");
        let err = DetectError::inference(cause);

        assert_eq!(err.to_string(), "inference failed: device lost");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("device lost"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_model_load_names_path() {
        let err = DetectError::model_load("weights/best.onnx", "no such file");

        assert_eq!(err.kind(), "model_load");
        assert!(err.to_string().contains("weights/best.onnx"));
        assert!(!err.is_recoverable());
    }
}
