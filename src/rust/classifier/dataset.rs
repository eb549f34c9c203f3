use ndarray::{concatenate, Array2, ArrayView2, Axis};

use super::error::ClassifierError;
use super::extractor::Embedding;

/// Append-only store of training examples.
///
/// Rows of `features` are flattened embeddings, rows of `labels` are the
/// matching one-hot vectors. Both tensors grow together by concatenation;
/// existing rows are never modified in place.
#[derive(Debug, Clone)]
pub struct Dataset {
    num_classes: usize,
    embedding_shape: Option<Vec<usize>>,
    features: Option<Array2<f32>>,
    labels: Option<Array2<f32>>,
}

impl Dataset {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            embedding_shape: None,
            features: None,
            labels: None,
        }
    }

    /// Adds one example.
    ///
    /// # Errors
    /// - `InvalidLabel` if `label >= num_classes`
    /// - `ShapeMismatch` if the embedding differs in shape from earlier ones
    pub fn append(&mut self, embedding: &Embedding, label: usize) -> Result<(), ClassifierError> {
        if label >= self.num_classes {
            return Err(ClassifierError::InvalidLabel {
                label,
                num_classes: self.num_classes,
            });
        }
        if let Some(shape) = &self.embedding_shape {
            if shape.as_slice() != embedding.shape() {
                return Err(ClassifierError::ShapeMismatch(format!(
                    "embedding shape {:?} does not match dataset shape {:?}",
                    embedding.shape(),
                    shape
                )));
            }
        }

        let width = embedding.len();
        let row = Array2::from_shape_vec((1, width), embedding.iter().copied().collect())
            .map_err(|e| ClassifierError::ShapeMismatch(e.to_string()))?;
        let mut one_hot = Array2::zeros((1, self.num_classes));
        one_hot[[0, label]] = 1.0;

        let (features, labels) = match (&self.features, &self.labels) {
            (Some(features), Some(labels)) => {
                let features = concatenate(Axis(0), &[features.view(), row.view()])
                    .map_err(|e| ClassifierError::ShapeMismatch(e.to_string()))?;
                let labels = concatenate(Axis(0), &[labels.view(), one_hot.view()])
                    .map_err(|e| ClassifierError::ShapeMismatch(e.to_string()))?;
                (features, labels)
            }
            _ => (row, one_hot),
        };

        // Replacing the options drops the previous tensors.
        self.embedding_shape = Some(embedding.shape().to_vec());
        self.features = Some(features);
        self.labels = Some(labels);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.as_ref().map_or(0, |f| f.nrows())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Shape of one embedding, known once the first example is added.
    pub fn embedding_shape(&self) -> Option<&[usize]> {
        self.embedding_shape.as_deref()
    }

    /// Flattened embedding width.
    pub fn feature_width(&self) -> usize {
        self.features.as_ref().map_or(0, |f| f.ncols())
    }

    /// `N x D` feature matrix, `None` while empty.
    pub fn features(&self) -> Option<ArrayView2<'_, f32>> {
        self.features.as_ref().map(|f| f.view())
    }

    /// `N x num_classes` one-hot label matrix, `None` while empty.
    pub fn labels(&self) -> Option<ArrayView2<'_, f32>> {
        self.labels.as_ref().map(|l| l.view())
    }

    /// Number of examples per class id.
    pub fn class_counts(&self) -> Vec<usize> {
        match &self.labels {
            Some(labels) => labels
                .sum_axis(Axis(0))
                .iter()
                .map(|&count| count as usize)
                .collect(),
            None => vec![0; self.num_classes],
        }
    }

    /// Drops every example.
    pub fn clear(&mut self) {
        self.embedding_shape = None;
        self.features = None;
        self.labels = None;
    }
}
