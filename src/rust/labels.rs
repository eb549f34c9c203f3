//! The ImageNet label vocabulary used when the extractor acts as a stock classifier.

use lazy_static::lazy_static;

/// Number of classes in the static vocabulary
pub const VOCABULARY_SIZE: usize = 1000;

const RAW_LABELS: &str = include_str!("../../assets/imagenet_labels.txt");

lazy_static! {
    static ref IMAGENET_LABELS: Vec<&'static str> = RAW_LABELS
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
}

/// All class names, indexed by class id.
pub fn imagenet_labels() -> &'static [&'static str] {
    &IMAGENET_LABELS
}

pub fn label_for(index: usize) -> Option<&'static str> {
    IMAGENET_LABELS.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_size() {
        assert_eq!(imagenet_labels().len(), VOCABULARY_SIZE);
    }

    #[test]
    fn test_known_indices() {
        assert_eq!(label_for(0), Some("tench"));
        assert_eq!(label_for(281), Some("tabby"));
        assert_eq!(label_for(999), Some("toilet tissue"));
        assert_eq!(label_for(VOCABULARY_SIZE), None);
    }
}
