use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::Deserialize;

use super::error::ClassifierError;
use super::input::Image;

/// Mean pixel value used by the centered normalization
const PIXEL_MEAN: f32 = 127.5;

/// How pixel values in `[0, 255]` are mapped into the network's input range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `(x - 127.5) / 127.5`, exactly `[-1, 1]`
    #[default]
    Centered,
    /// `x / 127 - 1`, roughly `[-1, 1.008]`
    Offset,
}

impl Normalization {
    #[inline]
    fn apply(self, value: u8) -> f32 {
        let x = value as f32;
        match self {
            Self::Centered => (x - PIXEL_MEAN) / PIXEL_MEAN,
            Self::Offset => x / 127.0 - 1.0,
        }
    }
}

/// Memory layout of the batched input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, height, width, 3]`
    #[default]
    Nhwc,
    /// `[1, 3, height, width]`
    Nchw,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Side length of the square network input
    pub input_size: u32,
    pub normalization: Normalization,
    pub layout: TensorLayout,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            normalization: Normalization::Centered,
            layout: TensorLayout::Nhwc,
        }
    }
}

/// Turns a raw image into the tensor the feature extractor consumes.
///
/// The same pipeline instance serves training and inference, so both see
/// identical crop, resize and normalization.
#[derive(Debug, Clone)]
pub struct FeaturePipeline {
    config: PipelineConfig,
}

impl FeaturePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Center-crops, resizes and normalizes `image` into a batch of one.
    ///
    /// # Errors
    /// - `InvalidImage` if a dimension is zero, the channel count is not 3,
    ///   or the buffer length disagrees with the dimensions
    pub fn transform(&self, image: &Image) -> Result<Array4<f32>, ClassifierError> {
        let rgb = Self::to_rgb(image)?;
        let square = Self::center_crop(&rgb);
        let size = self.config.input_size;
        let resized = if square.width() == size {
            square
        } else {
            imageops::resize(&square, size, size, FilterType::Triangle)
        };
        Ok(self.to_tensor(&resized))
    }

    fn to_rgb(image: &Image) -> Result<RgbImage, ClassifierError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(ClassifierError::InvalidImage(format!(
                "image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        if image.channels() != 3 {
            return Err(ClassifierError::InvalidImage(format!(
                "expected 3 channels (RGB), got {}",
                image.channels()
            )));
        }
        let expected = width as usize * height as usize * 3;
        if image.as_bytes().len() != expected {
            return Err(ClassifierError::InvalidImage(format!(
                "buffer holds {} bytes, expected {} for {}x{}x3",
                image.as_bytes().len(),
                expected,
                width,
                height
            )));
        }
        RgbImage::from_raw(width, height, image.as_bytes().to_vec())
            .ok_or_else(|| ClassifierError::InvalidImage("pixel buffer is too small".into()))
    }

    fn center_crop(rgb: &RgbImage) -> RgbImage {
        let (width, height) = rgb.dimensions();
        let side = width.min(height);
        let x = (width - side) / 2;
        let y = (height - side) / 2;
        imageops::crop_imm(rgb, x, y, side, side).to_image()
    }

    fn to_tensor(&self, img: &RgbImage) -> Array4<f32> {
        let size = img.width() as usize;
        let normalization = self.config.normalization;
        let mut tensor = match self.config.layout {
            TensorLayout::Nhwc => Array4::zeros((1, size, size, 3)),
            TensorLayout::Nchw => Array4::zeros((1, 3, size, size)),
        };
        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for (c, &value) in pixel.0.iter().enumerate() {
                let index = match self.config.layout {
                    TensorLayout::Nhwc => [0, y, x, c],
                    TensorLayout::Nchw => [0, c, y, x],
                };
                tensor[index] = normalization.apply(value);
            }
        }
        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Image {
        let data = (0..width * height)
            .flat_map(|i| {
                let v = (i % 256) as u8;
                [v, 255 - v, v / 2]
            })
            .collect();
        Image::from_rgb(width, height, data)
    }

    fn small_pipeline(layout: TensorLayout) -> FeaturePipeline {
        FeaturePipeline::new(PipelineConfig {
            input_size: 8,
            normalization: Normalization::Centered,
            layout,
        })
    }

    #[test]
    fn test_transform_is_deterministic() {
        let pipeline = FeaturePipeline::new(PipelineConfig::default());
        let image = gradient(320, 240);
        let first = pipeline.transform(&image).unwrap();
        let second = pipeline.transform(&image.clone()).unwrap();
        assert_eq!(first.shape(), &[1, 224, 224, 3]);
        assert!(first
            .iter()
            .zip(second.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn test_layouts() {
        let image = gradient(10, 10);
        let nhwc = small_pipeline(TensorLayout::Nhwc).transform(&image).unwrap();
        let nchw = small_pipeline(TensorLayout::Nchw).transform(&image).unwrap();
        assert_eq!(nhwc.shape(), &[1, 8, 8, 3]);
        assert_eq!(nchw.shape(), &[1, 3, 8, 8]);
        assert_eq!(nhwc[[0, 2, 5, 1]], nchw[[0, 1, 2, 5]]);
    }

    #[test]
    fn test_center_crop_uses_middle_square() {
        // 3x1 image: left red, middle green, right blue
        let image = Image::from_rgb(3, 1, vec![255, 0, 0, 0, 255, 0, 0, 0, 255]);
        let pipeline = FeaturePipeline::new(PipelineConfig {
            input_size: 1,
            ..PipelineConfig::default()
        });
        let tensor = pipeline.transform(&image).unwrap();
        assert_eq!(tensor[[0, 0, 0, 0]], -1.0);
        assert_eq!(tensor[[0, 0, 0, 1]], 1.0);
        assert_eq!(tensor[[0, 0, 0, 2]], -1.0);
    }

    #[test]
    fn test_normalization_ranges() {
        assert_eq!(Normalization::Centered.apply(0), -1.0);
        assert_eq!(Normalization::Centered.apply(255), 1.0);
        assert_eq!(Normalization::Offset.apply(0), -1.0);
        assert!((Normalization::Offset.apply(127)).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_images() {
        let pipeline = FeaturePipeline::new(PipelineConfig::default());
        let zero = Image::from_rgb(0, 10, vec![]);
        assert!(matches!(pipeline.transform(&zero), Err(ClassifierError::InvalidImage(_))));

        let gray = Image::new(2, 2, 1, vec![0; 4]);
        assert!(matches!(pipeline.transform(&gray), Err(ClassifierError::InvalidImage(_))));

        let short = Image::from_rgb(2, 2, vec![0; 5]);
        assert!(matches!(pipeline.transform(&short), Err(ClassifierError::InvalidImage(_))));
    }
}
