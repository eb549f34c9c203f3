use crate::classifier::{ExtractorConfig, TensorLayout};

/// Represents the available built-in feature extractors in the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinModel {
    /// MobileNetV2 image classifier from the ONNX model zoo
    ///
    /// Characteristics:
    /// - Input: 1x3x224x224 (NCHW)
    /// - Output: 1000 ImageNet logits
    /// - Embedding: the 1280-channel global-average-pooled features that
    ///   feed the final classifier layer
    /// - Size: ~14MB
    MobileNetV2,
}

/// Characteristics of a model including its capabilities and requirements
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCharacteristics {
    /// Side length of the square network input
    pub input_size: u32,
    /// Channel layout the network expects
    pub layout: TensorLayout,
    /// Number of values in one embedding
    pub embedding_size: usize,
    /// Number of classes in the network's own output
    pub num_outputs: usize,
    /// Approximate size of the model in memory
    pub model_size_mb: usize,
}

/// Download location and checksum of a model file
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Directory name used inside the model cache
    pub name: String,
    pub model_url: String,
    /// Expected sha256 of the model file, if published
    pub model_hash: Option<String>,
}

impl BuiltinModel {
    pub fn characteristics(&self) -> ModelCharacteristics {
        match self {
            Self::MobileNetV2 => ModelCharacteristics {
                input_size: 224,
                layout: TensorLayout::Nchw,
                embedding_size: 1280,
                num_outputs: 1000,
                model_size_mb: 14,
            },
        }
    }

    pub fn get_model_info(&self) -> ModelInfo {
        match self {
            Self::MobileNetV2 => ModelInfo {
                name: "mobilenetv2".to_string(),
                model_url: "https://github.com/onnx/models/raw/main/validated/vision/classification/mobilenet/model/mobilenetv2-12.onnx".to_string(),
                model_hash: None,
            },
        }
    }

    /// How the extractor reads embeddings and class scores out of this model
    pub fn extractor_config(&self) -> ExtractorConfig {
        match self {
            Self::MobileNetV2 => ExtractorConfig {
                embedding_output: None,
                embedding_op: Some("GlobalAveragePool".to_string()),
                logits_output: None,
                outputs_probabilities: false,
            },
        }
    }
}
