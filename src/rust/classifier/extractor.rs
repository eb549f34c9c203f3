use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use ndarray::{Array1, Array4, ArrayD, Axis};
use ort::session::Session;
use ort::value::Tensor;

use super::error::ClassifierError;
use super::utils::{looks_like_distribution, softmax};
use crate::models::BuiltinModel;
use crate::onnx_graph::{expose_output, ModelGraph};
use crate::runtime::{create_session_builder, RuntimeConfig};
use crate::ModelManager;

/// A per-image embedding with the batch dimension removed.
pub type Embedding = ArrayD<f32>;

/// The pretrained network behind the classifier.
///
/// Implementations are shared read-only across every call, so they must be
/// `Send + Sync`. Inputs are the batched tensors produced by the
/// [`FeaturePipeline`](super::FeaturePipeline).
pub trait FeatureExtractor: Send + Sync {
    /// Activation of the truncated network for one image.
    fn embed(&self, input: &Array4<f32>) -> Result<Embedding, ClassifierError>;

    /// Class probabilities of the full network, indexed like the label vocabulary.
    fn classify(&self, input: &Array4<f32>) -> Result<Array1<f32>, ClassifierError>;
}

/// Produces a feature extractor, typically by fetching and parsing weights.
#[async_trait]
pub trait ExtractorLoader: Send + Sync + 'static {
    async fn load(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError>;
}

/// Which session outputs hold the embedding and the class scores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractorConfig {
    /// Name of the intermediate output exposing embeddings
    pub embedding_output: Option<String>,
    /// Op type (for example `GlobalAveragePool`) whose last node in the graph
    /// provides the embedding. Its output is added to the model's outputs at
    /// load time. Ignored when `embedding_output` is set; with neither, the
    /// class scores double as the embedding.
    pub embedding_op: Option<String>,
    /// Name of the class-score output, defaults to the first output
    pub logits_output: Option<String>,
    /// Whether the class-score output is already softmaxed
    pub outputs_probabilities: bool,
}

/// Feature extractor backed by an ONNX Runtime session.
pub struct OnnxExtractor {
    session: Session,
    input_name: String,
    logits_output: String,
    embedding_output: Option<String>,
    outputs_probabilities: bool,
}

impl fmt::Debug for OnnxExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxExtractor")
            .field("input_name", &self.input_name)
            .field("logits_output", &self.logits_output)
            .field("embedding_output", &self.embedding_output)
            .finish()
    }
}

impl OnnxExtractor {
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        config: &ExtractorConfig,
        runtime: &RuntimeConfig,
    ) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ClassifierError::ModelLoad(format!("Model file not found: {}", path.display())));
        }
        let load_error = |e: ort::Error| ClassifierError::ModelLoad(format!("Failed to load {}: {}", path.display(), e));

        let (session, config) = match (&config.embedding_output, &config.embedding_op) {
            (None, Some(op_type)) => {
                let model = fs::read(path)
                    .map_err(|e| ClassifierError::ModelLoad(format!("Failed to read {}: {}", path.display(), e)))?;
                let tensor = ModelGraph::parse(&model)?
                    .last_output_of(op_type)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ClassifierError::ModelLoad(format!("{} has no {} node to embed from", path.display(), op_type))
                    })?;
                debug!("Exposing '{}' ({}) as the embedding output", tensor, op_type);
                let patched = expose_output(&model, &tensor)?;
                let session = create_session_builder(runtime)?
                    .commit_from_memory(&patched)
                    .map_err(load_error)?;
                let config = ExtractorConfig {
                    embedding_output: Some(tensor),
                    ..config.clone()
                };
                (session, config)
            }
            _ => {
                let session = create_session_builder(runtime)?
                    .commit_from_file(path)
                    .map_err(load_error)?;
                (session, config.clone())
            }
        };
        Self::from_session(session, &config)
    }

    /// Validates that the session exposes the configured outputs.
    pub fn from_session(session: Session, config: &ExtractorConfig) -> Result<Self, ClassifierError> {
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| ClassifierError::ModelLoad("Model has no inputs".into()))?;

        let output_names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
        let logits_output = match &config.logits_output {
            Some(name) => name.clone(),
            None => output_names
                .first()
                .map(|name| name.to_string())
                .ok_or_else(|| ClassifierError::ModelLoad("Model has no outputs".into()))?,
        };
        for name in std::iter::once(&logits_output).chain(config.embedding_output.as_ref()) {
            if !output_names.contains(&name.as_str()) {
                return Err(ClassifierError::ModelLoad(format!(
                    "Model has no output named '{}' (available: {:?})",
                    name, output_names
                )));
            }
        }

        info!(
            "ONNX extractor ready: input '{}', scores '{}', embedding '{}'",
            input_name,
            logits_output,
            config.embedding_output.as_deref().unwrap_or(&logits_output)
        );

        Ok(Self {
            session,
            input_name,
            logits_output,
            embedding_output: config.embedding_output.clone(),
            outputs_probabilities: config.outputs_probabilities,
        })
    }

    fn run_output(&self, input: &Array4<f32>, output: &str) -> Result<ArrayD<f32>, ClassifierError> {
        let tensor = Tensor::from_array(input.clone().into_dyn())
            .map_err(|e| ClassifierError::ModelError(format!("Failed to create input tensor: {}", e)))?;
        let mut input_tensors = HashMap::new();
        input_tensors.insert(self.input_name.as_str(), tensor);

        let outputs = self.session.run(input_tensors)
            .map_err(|e| ClassifierError::ModelError(format!("Failed to run model: {}", e)))?;
        let view = outputs[output].try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::ModelError(format!("Failed to extract '{}': {}", output, e)))?;

        Ok(strip_batch(view.to_owned()))
    }
}

/// Drops a leading batch dimension of one.
fn strip_batch(array: ArrayD<f32>) -> ArrayD<f32> {
    if array.ndim() > 1 && array.shape()[0] == 1 {
        array.index_axis_move(Axis(0), 0)
    } else {
        array
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn embed(&self, input: &Array4<f32>) -> Result<Embedding, ClassifierError> {
        let output = self.embedding_output.as_deref().unwrap_or(&self.logits_output);
        self.run_output(input, output)
    }

    fn classify(&self, input: &Array4<f32>) -> Result<Array1<f32>, ClassifierError> {
        let scores = self.run_output(input, &self.logits_output)?;
        let scores = Array1::from_iter(scores.iter().copied());
        if self.outputs_probabilities || looks_like_distribution(&scores) {
            Ok(scores)
        } else {
            Ok(softmax(&scores))
        }
    }
}

#[derive(Debug, Clone)]
enum ModelSource {
    Builtin { model: BuiltinModel, manager: ModelManager },
    File(PathBuf),
}

/// Loads an [`OnnxExtractor`], downloading built-in weights on first use.
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    source: ModelSource,
    config: ExtractorConfig,
    runtime: RuntimeConfig,
}

impl OnnxLoader {
    pub fn builtin(model: BuiltinModel, manager: ModelManager, runtime: RuntimeConfig) -> Self {
        Self {
            source: ModelSource::Builtin { model, manager },
            config: model.extractor_config(),
            runtime,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, config: ExtractorConfig, runtime: RuntimeConfig) -> Self {
        Self {
            source: ModelSource::File(path.as_ref().to_path_buf()),
            config,
            runtime,
        }
    }
}

#[async_trait]
impl ExtractorLoader for OnnxLoader {
    async fn load(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
        let path = match &self.source {
            ModelSource::Builtin { model, manager } => {
                let info = model.get_model_info();
                manager.ensure_model_downloaded(&info).await?
            }
            ModelSource::File(path) => path.clone(),
        };

        info!("Loading feature extractor from {:?}", path);
        let config = self.config.clone();
        let runtime = self.runtime.clone();
        let extractor = tokio::task::spawn_blocking(move || OnnxExtractor::from_file(&path, &config, &runtime))
            .await
            .map_err(|e| ClassifierError::ModelLoad(format!("Model loading task failed: {}", e)))??;

        Ok(Arc::new(extractor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_strip_batch() {
        let batched = ArrayD::<f32>::zeros(IxDyn(&[1, 7, 7, 256]));
        assert_eq!(strip_batch(batched).shape(), &[7, 7, 256]);

        let flat = ArrayD::<f32>::zeros(IxDyn(&[1000]));
        assert_eq!(strip_batch(flat).shape(), &[1000]);
    }

    #[tokio::test]
    async fn test_missing_model_file() {
        let loader = OnnxLoader::from_file(
            "/nonexistent/glimpse/model.onnx",
            ExtractorConfig::default(),
            RuntimeConfig::default(),
        );
        let result = loader.load().await;
        assert!(matches!(result, Err(ClassifierError::ModelLoad(_))));
    }

    #[test]
    fn test_embedding_op_must_exist_in_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.onnx");
        // A model whose graph field is present but empty
        std::fs::write(&path, [0x3a, 0x00]).unwrap();

        let config = ExtractorConfig {
            embedding_op: Some("GlobalAveragePool".into()),
            ..ExtractorConfig::default()
        };
        let err = OnnxExtractor::from_file(&path, &config, &RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelLoad(ref msg) if msg.contains("GlobalAveragePool")));
    }
}
