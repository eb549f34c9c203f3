use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis, Ix1, Ix2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use super::dataset::Dataset;
use super::error::ClassifierError;
use super::extractor::Embedding;
use super::optim::{Adam, Moments};

/// Floor for probabilities inside the logarithm of the loss
const LOG_EPSILON: f32 = 1e-7;

/// Hyperparameters for one `fit` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    pub hidden_units: usize,
    pub epochs: usize,
    /// Mini-batch size as a fraction of the dataset, in `(0, 1]`
    pub batch_fraction: f64,
    /// Seeds weight initialisation and per-epoch shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            hidden_units: 100,
            epochs: 20,
            batch_fraction: 0.4,
            seed: 42,
        }
    }
}

/// What a finished training session did.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub examples: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub batches: usize,
    /// Loss of the last mini-batch, rounded to 5 decimals
    pub final_loss: f32,
}

/// `floor(examples * fraction)`, rejecting a result of zero.
pub fn batch_size_for(examples: usize, fraction: f64) -> Result<usize, ClassifierError> {
    let size = (examples as f64 * fraction).floor() as usize;
    if size == 0 {
        return Err(ClassifierError::DegenerateBatchSize { examples, fraction });
    }
    Ok(size)
}

fn round_loss(loss: f32) -> f32 {
    (loss * 1e5).round() / 1e5
}

fn softmax_rows(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    logits
}

fn cross_entropy(probs: &Array2<f32>, targets: &Array2<f32>) -> f32 {
    let n = probs.nrows().max(1) as f32;
    let log_probs = probs.mapv(|p| p.max(LOG_EPSILON).ln());
    -(targets * &log_probs).sum() / n
}

struct HeadMoments {
    w1: Moments<Ix2>,
    b1: Moments<Ix1>,
    w2: Moments<Ix2>,
}

/// Two-layer network mapping flattened embeddings to class probabilities.
///
/// `dense(hidden, relu, bias) -> dense(num_classes, no bias) -> softmax`
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
}

impl ClassifierHead {
    /// Glorot-uniform weights, zero bias.
    fn init(input: usize, hidden: usize, classes: usize, rng: &mut StdRng) -> Self {
        let mut glorot = |fan_in: usize, fan_out: usize| {
            let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
            Array2::from_shape_simple_fn((fan_in, fan_out), || rng.gen_range(-limit..limit))
        };
        let w1 = glorot(input, hidden);
        let w2 = glorot(hidden, classes);
        Self {
            w1,
            b1: Array1::zeros(hidden),
            w2,
        }
    }

    /// Flattened embedding width the head accepts.
    pub fn input_width(&self) -> usize {
        self.w1.nrows()
    }

    pub fn hidden_units(&self) -> usize {
        self.w1.ncols()
    }

    pub fn num_classes(&self) -> usize {
        self.w2.ncols()
    }

    fn hidden(&self, x: &ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        let z1 = x.dot(&self.w1) + &self.b1;
        let a1 = z1.mapv(|v| v.max(0.0));
        (z1, a1)
    }

    /// Class probabilities for each row of `x`.
    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let (_, a1) = self.hidden(x);
        softmax_rows(a1.dot(&self.w2))
    }

    /// Class probabilities for a single embedding.
    pub fn predict(&self, embedding: &Embedding) -> Result<Array1<f32>, ClassifierError> {
        if embedding.len() != self.input_width() {
            return Err(ClassifierError::ShapeMismatch(format!(
                "embedding has {} values, head expects {}",
                embedding.len(),
                self.input_width()
            )));
        }
        let row = Array2::from_shape_vec((1, embedding.len()), embedding.iter().copied().collect())
            .map_err(|e| ClassifierError::ShapeMismatch(e.to_string()))?;
        Ok(self.forward(&row.view()).row(0).to_owned())
    }

    /// One Adam step on a mini-batch; returns the batch loss before the update.
    fn train_step(&mut self, x: &Array2<f32>, y: &Array2<f32>, adam: &mut Adam, moments: &mut HeadMoments) -> f32 {
        let n = x.nrows() as f32;
        let (z1, a1) = self.hidden(&x.view());
        let probs = softmax_rows(a1.dot(&self.w2));
        let loss = cross_entropy(&probs, y);

        let dz2 = (&probs - y) / n;
        let dw2 = a1.t().dot(&dz2);
        let da1 = dz2.dot(&self.w2.t());
        let dz1 = da1 * z1.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let dw1 = x.t().dot(&dz1);
        let db1 = dz1.sum_axis(Axis(0));

        adam.begin_step();
        adam.update(&mut self.w1, &dw1, &mut moments.w1);
        adam.update(&mut self.b1, &db1, &mut moments.b1);
        adam.update(&mut self.w2, &dw2, &mut moments.w2);
        loss
    }

    /// Trains a fresh head on `dataset`.
    ///
    /// `on_progress` receives the loss of every mini-batch, rounded to 5
    /// decimals. The loop yields to the scheduler after each batch and
    /// checks `cancel` before starting the next one.
    ///
    /// # Errors
    /// - `EmptyDataset` if there are no examples
    /// - `DegenerateBatchSize` if the batch size floors to zero
    /// - `Cancelled` if `cancel` fires mid-training
    pub async fn fit<F>(
        dataset: &Dataset,
        config: &TrainingConfig,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<(Self, TrainingSummary), ClassifierError>
    where
        F: FnMut(f32) + Send,
    {
        let (features, labels) = match (dataset.features(), dataset.labels()) {
            (Some(features), Some(labels)) => (features, labels),
            _ => return Err(ClassifierError::EmptyDataset),
        };
        let examples = features.nrows();
        let batch_size = batch_size_for(examples, config.batch_fraction)?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut head = Self::init(features.ncols(), config.hidden_units, dataset.num_classes(), &mut rng);
        let mut moments = HeadMoments {
            w1: Moments::zeros_like(&head.w1),
            b1: Moments::zeros_like(&head.b1),
            w2: Moments::zeros_like(&head.w2),
        };
        let mut adam = Adam::new(config.learning_rate);

        info!(
            "Training head on {} examples ({} features, batch size {}, {} epochs)",
            examples,
            features.ncols(),
            batch_size,
            config.epochs
        );

        let mut order: Vec<usize> = (0..examples).collect();
        let mut batches = 0;
        let mut final_loss = 0.0;
        for epoch in 0..config.epochs {
            order.shuffle(&mut rng);
            for chunk in order.chunks(batch_size) {
                if cancel.is_cancelled() {
                    info!("Training cancelled after {} batches", batches);
                    return Err(ClassifierError::Cancelled { batches });
                }
                let x = features.select(Axis(0), chunk);
                let y = labels.select(Axis(0), chunk);
                final_loss = round_loss(head.train_step(&x, &y, &mut adam, &mut moments));
                batches += 1;
                debug!("epoch {} batch {}: loss {}", epoch + 1, batches, final_loss);
                on_progress(final_loss);
                tokio::task::yield_now().await;
            }
        }

        info!("Training finished after {} batches, final loss {}", batches, final_loss);
        Ok((
            head,
            TrainingSummary {
                examples,
                batch_size,
                epochs: config.epochs,
                batches,
                final_loss,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn separable_dataset(per_class: usize) -> Dataset {
        let mut dataset = Dataset::new(2);
        for i in 0..per_class {
            let jitter = i as f32 * 0.01;
            let a = ArrayD::from_shape_vec(IxDyn(&[4]), vec![1.0 + jitter, 0.9, -1.0, -0.8]).unwrap();
            let b = ArrayD::from_shape_vec(IxDyn(&[4]), vec![-1.0, -0.9 + jitter, 1.0, 0.8]).unwrap();
            dataset.append(&a, 0).unwrap();
            dataset.append(&b, 1).unwrap();
        }
        dataset
    }

    fn fast_config() -> TrainingConfig {
        TrainingConfig {
            learning_rate: 0.01,
            hidden_units: 16,
            epochs: 30,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_batch_size_derivation() {
        assert_eq!(batch_size_for(10, 0.4).unwrap(), 4);
        assert_eq!(batch_size_for(10, 0.7).unwrap(), 7);
        assert_eq!(batch_size_for(3, 1.0).unwrap(), 3);
        assert_eq!(
            batch_size_for(1, 0.4),
            Err(ClassifierError::DegenerateBatchSize { examples: 1, fraction: 0.4 })
        );
    }

    #[test]
    fn test_round_loss() {
        assert_eq!(round_loss(0.123456789), 0.12346);
    }

    #[tokio::test]
    async fn test_fit_empty_dataset() {
        let dataset = Dataset::new(2);
        let result = ClassifierHead::fit(&dataset, &fast_config(), |_| {}, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ClassifierError::EmptyDataset)));
    }

    #[tokio::test]
    async fn test_fit_learns_separable_classes() {
        let dataset = separable_dataset(5);
        let mut losses = Vec::new();
        let (head, summary) = ClassifierHead::fit(&dataset, &fast_config(), |loss| losses.push(loss), &CancellationToken::new())
            .await
            .unwrap();

        // 10 examples at 0.4 gives batches of 4, 4 and 2
        assert_eq!(summary.batch_size, 4);
        assert_eq!(summary.batches, 30 * 3);
        assert_eq!(losses.len(), summary.batches);
        assert!(losses.last().unwrap() < losses.first().unwrap());

        let query = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0.95, 0.85, -0.9, -0.85]).unwrap();
        let probs = head.predict(&query).unwrap();
        assert!((probs.sum() - 1.0).abs() < 1e-5);
        assert!(probs[0] > probs[1]);
    }

    #[tokio::test]
    async fn test_fit_is_reproducible() {
        let dataset = separable_dataset(3);
        let config = fast_config();
        let token = CancellationToken::new();
        let (_, first) = ClassifierHead::fit(&dataset, &config, |_| {}, &token).await.unwrap();
        let (_, second) = ClassifierHead::fit(&dataset, &config, |_| {}, &token).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_fit_cancelled_between_batches() {
        let dataset = separable_dataset(5);
        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut seen = 0;
        let result = ClassifierHead::fit(
            &dataset,
            &fast_config(),
            |_| {
                seen += 1;
                if seen == 2 {
                    trigger.cancel();
                }
            },
            &token,
        )
        .await;
        assert_eq!(result.unwrap_err(), ClassifierError::Cancelled { batches: 2 });
    }

    #[test]
    fn test_predict_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = ClassifierHead::init(4, 3, 2, &mut rng);
        let wrong = ArrayD::zeros(IxDyn(&[5]));
        assert!(matches!(head.predict(&wrong), Err(ClassifierError::ShapeMismatch(_))));
    }
}
