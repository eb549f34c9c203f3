//! An on-device transfer-learning image classifier.
//!
//! A pretrained network turns images into embeddings, a small head is trained
//! on examples you add at runtime, and predictions come back as ranked
//! top-K classes. The network loads in the background; predictions requested
//! before it is ready are queued and served in order.
//!
//! # Basic Usage
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use glimpse::{BuiltinModel, Classifier, Image};
//!
//! let classifier = Classifier::builder()
//!     .with_model(BuiltinModel::MobileNetV2)?
//!     .build()?;
//!
//! // Queued until the model has loaded
//! let ranked = classifier.predict(Image::open("cat.jpg")?, Some(5)).await?;
//! for prediction in ranked {
//!     println!("{}: {:.3}", prediction.class_name, prediction.probability);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Transfer Learning
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use glimpse::{BuiltinModel, Classifier, ClassifierOptions, Image};
//!
//! let classifier = Classifier::builder()
//!     .with_options(ClassifierOptions {
//!         num_classes: 2,
//!         class_names: Some(vec!["mug".into(), "plant".into()]),
//!         ..Default::default()
//!     })
//!     .with_model(BuiltinModel::MobileNetV2)?
//!     .build()?;
//! classifier.wait_ready().await?;
//!
//! classifier.add_image(0, Image::open("mug.jpg")?)?;
//! classifier.add_image(1, Image::open("plant.jpg")?)?;
//! classifier.train(|loss| println!("loss: {}", loss)).await?;
//!
//! let ranked = classifier.predict(Image::open("desk.jpg")?, None).await?;
//! println!("{:?}", ranked);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
mod runtime;
pub mod labels;
pub mod model_manager;
pub mod models;
pub mod onnx_graph;

pub use classifier::{
    Classifier, ClassifierBuilder, ClassifierError, ClassifierInfo, ClassifierOptions, Embedding,
    ExtractorConfig, ExtractorLoader, FeatureExtractor, FeaturePipeline, FrameSource, Image,
    LifecycleState, Normalization, PipelineConfig, PredictInput, RankedPrediction, TensorLayout,
    TrainingSummary,
};
pub use runtime::{create_session_builder, OptimizationLevel, RuntimeConfig};
pub use model_manager::{ModelManager, ModelError};
pub use models::{BuiltinModel, ModelCharacteristics, ModelInfo};

pub fn init_logger() {
    env_logger::init();
}
