use ndarray::Array1;

use super::error::ClassifierError;

/// A class name with its probability, as returned by `predict`.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPrediction {
    pub class_name: String,
    pub probability: f32,
}

pub(crate) fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|x| (x - max).exp());
    let sum = exp.sum();
    if sum > 0.0 && sum.is_finite() {
        exp / sum
    } else {
        Array1::from_elem(logits.len(), 1.0 / logits.len().max(1) as f32)
    }
}

/// True when every value is in `[0, 1]` and they sum to one.
pub(crate) fn looks_like_distribution(values: &Array1<f32>) -> bool {
    !values.is_empty()
        && values.iter().all(|&v| (0.0..=1.0).contains(&v))
        && (values.sum() - 1.0).abs() < 1e-3
}

/// Ranks `probabilities` and keeps the `k` most likely classes.
///
/// Equal probabilities keep ascending index order. A `k` larger than the
/// number of classes is clamped.
pub fn top_k<F>(probabilities: &Array1<f32>, k: usize, class_name: F) -> Result<Vec<RankedPrediction>, ClassifierError>
where
    F: Fn(usize) -> String,
{
    if k == 0 {
        return Err(ClassifierError::InvalidTopK(k));
    }

    let mut indexed: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    // sort_by is stable, so ties stay in index order; total_cmp keeps NaN from
    // breaking the ordering
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    Ok(indexed
        .into_iter()
        .take(k)
        .map(|(index, probability)| RankedPrediction {
            class_name: class_name(index),
            probability,
        })
        .collect())
}
