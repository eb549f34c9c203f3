mod error;
mod input;
mod pipeline;
mod extractor;
mod dataset;
mod optim;
mod head;
mod lifecycle;
mod options;
mod utils;
#[allow(clippy::module_inception)]
mod classifier;
pub mod builder;

pub use error::ClassifierError;
pub use input::{FrameSource, Image, PredictInput};
pub use pipeline::{FeaturePipeline, Normalization, PipelineConfig, TensorLayout};
pub use extractor::{Embedding, ExtractorConfig, ExtractorLoader, FeatureExtractor, OnnxExtractor, OnnxLoader};
pub use dataset::Dataset;
pub use head::{batch_size_for, ClassifierHead, TrainingConfig, TrainingSummary};
pub use lifecycle::{LifecycleState, ReadyCallback};
pub use options::ClassifierOptions;
pub use utils::{top_k, RankedPrediction};
pub use classifier::{Classifier, PendingPrediction};
pub use builder::ClassifierBuilder;

/// Snapshot of a classifier's configuration and accumulated examples
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierInfo {
    /// Load state of the feature extractor
    pub state: LifecycleState,
    /// Number of classes the head is trained on
    pub num_classes: usize,
    /// Display names of the classes, by class id
    pub class_names: Vec<String>,
    /// Number of examples added so far
    pub num_examples: usize,
    /// Examples added per class id
    pub examples_per_class: Vec<usize>,
    /// Shape of one embedding, once the first example is added
    pub embedding_shape: Option<Vec<usize>>,
    /// Whether a head has been trained
    pub trained: bool,
}
