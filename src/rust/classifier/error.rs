use ort::Error as OrtError;

use crate::model_manager::ModelError;

/// Represents the different types of errors that can occur in the image classifier.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifierError {
    /// The pixel buffer is malformed (zero-sized, wrong channel count or length)
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    /// An operation that needs the feature extractor was attempted before it finished loading
    #[error("Model not ready: the feature extractor is still loading")]
    ModelNotReady,
    /// The feature extractor failed to load; every pending and later prediction receives this
    #[error("Model load failed: {0}")]
    ModelLoad(String),
    /// Error occurred while running the feature extractor or the classifier head
    #[error("Model error: {0}")]
    ModelError(String),
    /// Training was requested without any accumulated examples
    #[error("Cannot train: no examples have been added")]
    EmptyDataset,
    /// A label outside `[0, num_classes)` was supplied
    #[error("Invalid label {label}: expected a class id in [0, {num_classes})")]
    InvalidLabel { label: usize, num_classes: usize },
    /// `floor(dataset_len * batch_fraction)` evaluated to zero
    #[error("Degenerate batch size: {examples} examples with batch fraction {fraction} gives a batch size of 0")]
    DegenerateBatchSize { examples: usize, fraction: f64 },
    /// A top-K count of zero was requested
    #[error("Invalid top-k {0}: k must be at least 1")]
    InvalidTopK(usize),
    /// An embedding does not match the width of the previously accumulated rows
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Construction options failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Error occurred during the build phase
    #[error("Build error: {0}")]
    BuildError(String),
    /// A second training session was started while one is still running
    #[error("A training session is already in progress")]
    TrainingInProgress,
    /// Training was cancelled between mini-batches
    #[error("Training cancelled after {batches} batches")]
    Cancelled { batches: usize },
    /// The live frame source was requested but none was bound at construction
    #[error("No frame source was supplied at construction")]
    NoFrameSource,
}

impl From<OrtError> for ClassifierError {
    fn from(err: OrtError) -> Self {
        ClassifierError::ModelError(err.to_string())
    }
}

impl From<ModelError> for ClassifierError {
    fn from(err: ModelError) -> Self {
        ClassifierError::ModelLoad(err.to_string())
    }
}

impl From<image::ImageError> for ClassifierError {
    fn from(err: image::ImageError) -> Self {
        ClassifierError::InvalidImage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ClassifierError::InvalidLabel { label: 3, num_classes: 2 };
        assert_eq!(err.to_string(), "Invalid label 3: expected a class id in [0, 2)");

        let err = ClassifierError::DegenerateBatchSize { examples: 1, fraction: 0.4 };
        assert!(err.to_string().contains("1 examples"));
    }

    #[test]
    fn test_model_error_conversion() {
        let err: ClassifierError = ModelError::VerificationFailed.into();
        assert!(matches!(err, ClassifierError::ModelLoad(_)));
    }
}
