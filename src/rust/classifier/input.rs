use std::fmt;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, RgbImage};

use super::error::ClassifierError;

/// An immutable raw pixel buffer, row-major and interleaved.
///
/// Construction never fails; malformed buffers are rejected by the
/// [`FeaturePipeline`](super::FeaturePipeline) with `InvalidImage`.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    channels: u8,
    data: Arc<[u8]>,
}

impl Image {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            data: data.into(),
        }
    }

    /// Wraps an RGB buffer of `width * height * 3` bytes.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self::new(width, height, 3, data)
    }

    /// Decodes an image file and converts it to RGB.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ClassifierError> {
        Ok(image::open(path)?.into())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl From<RgbImage> for Image {
    fn from(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self::from_rgb(width, height, img.into_raw())
    }
}

impl From<DynamicImage> for Image {
    fn from(img: DynamicImage) -> Self {
        img.to_rgb8().into()
    }
}

/// A live source of frames, such as a camera.
pub trait FrameSource: Send + Sync {
    /// Grabs the current frame.
    fn capture(&self) -> Result<Image, ClassifierError>;
}

/// What a prediction or training example is computed from.
#[derive(Clone)]
pub enum PredictInput {
    /// An explicit still image
    Image(Image),
    /// An explicit frame source, sampled when the request is served
    Frame(Arc<dyn FrameSource>),
    /// The frame source bound at construction
    Live,
}

impl fmt::Debug for PredictInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(image) => f.debug_tuple("Image").field(image).finish(),
            Self::Frame(_) => f.write_str("Frame(..)"),
            Self::Live => f.write_str("Live"),
        }
    }
}

impl From<Image> for PredictInput {
    fn from(image: Image) -> Self {
        Self::Image(image)
    }
}

impl From<Arc<dyn FrameSource>> for PredictInput {
    fn from(source: Arc<dyn FrameSource>) -> Self {
        Self::Frame(source)
    }
}
