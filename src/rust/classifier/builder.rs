use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tokio::runtime::Handle;

use super::classifier::Classifier;
use super::error::ClassifierError;
use super::extractor::{ExtractorConfig, ExtractorLoader, OnnxLoader};
use super::input::FrameSource;
use super::lifecycle::ReadyCallback;
use super::options::ClassifierOptions;
use crate::{BuiltinModel, ModelManager, RuntimeConfig};

enum ExtractorSource {
    Builtin(BuiltinModel),
    Custom { path: PathBuf, config: ExtractorConfig },
    Loader(Box<dyn ExtractorLoader>),
}

/// A builder for constructing a Classifier with a fluent interface.
pub struct ClassifierBuilder {
    options: ClassifierOptions,
    frame_source: Option<Arc<dyn FrameSource>>,
    extractor: Option<ExtractorSource>,
    model_manager: Option<ModelManager>,
    runtime_config: RuntimeConfig,
    on_ready: Option<ReadyCallback>,
}

impl Default for ClassifierBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierBuilder {
    /// Creates a new empty ClassifierBuilder instance with default configuration
    ///
    /// # Example
    /// ```
    /// use glimpse::ClassifierBuilder;
    ///
    /// let builder = ClassifierBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self {
            options: ClassifierOptions::default(),
            frame_source: None,
            extractor: None,
            model_manager: None,
            runtime_config: RuntimeConfig::default(),
            on_ready: None,
        }
    }

    /// Replaces the classifier options
    pub fn with_options(mut self, options: ClassifierOptions) -> Self {
        self.options = options;
        self
    }

    /// Binds the live frame source used by `PredictInput::Live` and the warm-up inference
    pub fn with_frame_source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.frame_source = Some(source);
        self
    }

    /// Sets the runtime configuration for ONNX model execution
    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    /// Uses `manager` instead of the default cache location for built-in models
    pub fn with_model_manager(mut self, manager: ModelManager) -> Self {
        self.model_manager = Some(manager);
        self
    }

    /// Registers a callback invoked once the extractor is ready and queued
    /// predictions have been served
    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_ready = Some(Box::new(callback));
        self
    }

    fn set_extractor(mut self, source: ExtractorSource) -> Result<Self, ClassifierError> {
        if self.extractor.is_some() {
            return Err(ClassifierError::BuildError("A feature extractor is already set".to_string()));
        }
        self.extractor = Some(source);
        Ok(self)
    }

    /// Uses a built-in model, downloaded on first use.
    ///
    /// The pipeline's input size and layout are set to what the model expects.
    pub fn with_model(self, model: BuiltinModel) -> Result<Self, ClassifierError> {
        self.set_extractor(ExtractorSource::Builtin(model))
    }

    /// Uses an ONNX model from disk.
    ///
    /// # Errors
    /// - `BuildError` if the path is empty or an extractor is already set
    pub fn with_custom_model(self, model_path: &str, config: ExtractorConfig) -> Result<Self, ClassifierError> {
        if model_path.is_empty() {
            return Err(ClassifierError::BuildError("Model path cannot be empty".to_string()));
        }
        self.set_extractor(ExtractorSource::Custom {
            path: PathBuf::from(model_path),
            config,
        })
    }

    /// Uses any [`ExtractorLoader`], for example an in-memory extractor.
    pub fn with_loader<L: ExtractorLoader>(self, loader: L) -> Result<Self, ClassifierError> {
        self.set_extractor(ExtractorSource::Loader(Box::new(loader)))
    }

    /// Validates the options and starts loading the extractor.
    ///
    /// # Errors
    /// - `InvalidConfig` if the options fail validation
    /// - `BuildError` if no extractor was configured or no tokio runtime is running
    pub fn build(mut self) -> Result<Classifier, ClassifierError> {
        self.options.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            ClassifierError::BuildError("Classifier must be built from within a tokio runtime".to_string())
        })?;

        let loader: Box<dyn ExtractorLoader> = match self.extractor.take() {
            None => {
                return Err(ClassifierError::BuildError(
                    "No feature extractor configured; use with_model, with_custom_model or with_loader".to_string(),
                ))
            }
            Some(ExtractorSource::Builtin(model)) => {
                let manager = match self.model_manager.take() {
                    Some(manager) => manager,
                    None => ModelManager::new_default().map_err(|e| {
                        ClassifierError::BuildError(format!("Failed to create model manager: {}", e))
                    })?,
                };
                let characteristics = model.characteristics();
                self.options.pipeline.input_size = characteristics.input_size;
                self.options.pipeline.layout = characteristics.layout;
                info!("Using built-in model {:?} ({}MB)", model, characteristics.model_size_mb);
                Box::new(OnnxLoader::builtin(model, manager, self.runtime_config.clone()))
            }
            Some(ExtractorSource::Custom { path, config }) => {
                info!("Using custom model {:?}", path);
                Box::new(OnnxLoader::from_file(path, config, self.runtime_config.clone()))
            }
            Some(ExtractorSource::Loader(loader)) => loader,
        };

        Ok(Classifier::start(
            self.options,
            self.frame_source,
            loader,
            self.on_ready,
            &runtime,
        ))
    }
}
