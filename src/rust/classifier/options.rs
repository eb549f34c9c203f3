use serde::Deserialize;

use super::error::ClassifierError;
use super::head::TrainingConfig;
use super::pipeline::PipelineConfig;

/// Construction-time configuration of a [`Classifier`](super::Classifier).
///
/// Every field has a default, so options can be partially deserialized:
///
/// ```
/// use glimpse::ClassifierOptions;
///
/// let options = ClassifierOptions {
///     num_classes: 3,
///     epochs: 40,
///     ..ClassifierOptions::default()
/// };
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClassifierOptions {
    /// Adam step size
    pub learning_rate: f32,
    /// Width of the head's hidden layer
    pub hidden_units: usize,
    pub epochs: usize,
    /// Output width of the head and width of the one-hot labels
    pub num_classes: usize,
    /// Mini-batch size as a fraction of the dataset, in `(0, 1]`
    pub batch_size: f64,
    /// Seed for head initialisation and shuffling
    pub seed: u64,
    /// Number of predictions returned when `predict` is given no `k`
    pub top_k: usize,
    /// Display names for the trained classes; ids are used when absent
    pub class_names: Option<Vec<String>>,
    pub pipeline: PipelineConfig,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            hidden_units: 100,
            epochs: 20,
            num_classes: 2,
            batch_size: 0.4,
            seed: 42,
            top_k: 10,
            class_names: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ClassifierOptions {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let invalid = |msg: String| Err(ClassifierError::InvalidConfig(msg));

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if self.hidden_units == 0 {
            return invalid("hidden_units must be at least 1".into());
        }
        if self.epochs == 0 {
            return invalid("epochs must be at least 1".into());
        }
        if self.num_classes == 0 {
            return invalid("num_classes must be at least 1".into());
        }
        if !(self.batch_size > 0.0 && self.batch_size <= 1.0) {
            return invalid(format!("batch_size must be a fraction in (0, 1], got {}", self.batch_size));
        }
        if self.top_k == 0 {
            return invalid("top_k must be at least 1".into());
        }
        if let Some(names) = &self.class_names {
            if names.len() != self.num_classes {
                return invalid(format!(
                    "class_names has {} entries but num_classes is {}",
                    names.len(),
                    self.num_classes
                ));
            }
        }
        if self.pipeline.input_size == 0 {
            return invalid("pipeline.input_size must be non-zero".into());
        }
        Ok(())
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            learning_rate: self.learning_rate,
            hidden_units: self.hidden_units,
            epochs: self.epochs,
            batch_fraction: self.batch_size,
            seed: self.seed,
        }
    }

    /// Display name of a trained class id.
    pub fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .as_ref()
            .and_then(|names| names.get(class_id).cloned())
            .unwrap_or_else(|| class_id.to_string())
    }
}
