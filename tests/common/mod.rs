#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use async_trait::async_trait;
use glimpse::{
    ClassifierError, ClassifierOptions, Embedding, ExtractorLoader, FeatureExtractor, FrameSource, Image,
    PipelineConfig,
};
use ndarray::{Array1, Array4, Axis};
use tokio::sync::Notify;

/// Side length of the images used across the tests; matches the pipeline so
/// no resizing happens.
pub const SIZE: u32 = 8;

pub fn solid(r: u8, g: u8, b: u8) -> Image {
    let pixels = (SIZE * SIZE) as usize;
    let data = [r, g, b].iter().copied().cycle().take(pixels * 3).collect();
    Image::from_rgb(SIZE, SIZE, data)
}

pub fn red() -> Image {
    solid(255, 0, 0)
}

pub fn blue() -> Image {
    solid(0, 0, 255)
}

pub fn gray(level: u8) -> Image {
    solid(level, level, level)
}

pub fn options(num_classes: usize) -> ClassifierOptions {
    ClassifierOptions {
        num_classes,
        pipeline: PipelineConfig {
            input_size: SIZE,
            ..PipelineConfig::default()
        },
        ..ClassifierOptions::default()
    }
}

/// Embeds an image as its per-channel means; classifies it by putting half
/// of the mass on `peak` and spreading the rest evenly over 1000 classes.
pub struct StubExtractor {
    pub peak: usize,
    /// Red channel of each classified image, in call order
    pub classified: Arc<Mutex<Vec<u8>>>,
}

impl StubExtractor {
    pub fn new(peak: usize) -> Self {
        Self {
            peak,
            classified: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn denormalize(value: f32) -> u8 {
    (value * 127.5 + 127.5).round() as u8
}

impl FeatureExtractor for StubExtractor {
    fn embed(&self, input: &Array4<f32>) -> Result<Embedding, ClassifierError> {
        let means = input
            .mean_axis(Axis(0))
            .and_then(|a| a.mean_axis(Axis(0)))
            .and_then(|a| a.mean_axis(Axis(0)))
            .ok_or_else(|| ClassifierError::ModelError("empty input".into()))?;
        Ok(means.into_dyn())
    }

    fn classify(&self, input: &Array4<f32>) -> Result<Array1<f32>, ClassifierError> {
        self.classified.lock().unwrap().push(denormalize(input[[0, 0, 0, 0]]));
        let mut probabilities = Array1::from_elem(1000, 0.5 / 1000.0);
        probabilities[self.peak] += 0.5;
        Ok(probabilities)
    }
}

/// Wraps [`StubExtractor`]; once armed, the next `embed` call parks until
/// `release` is called.
pub struct HeldExtractor {
    inner: StubExtractor,
    armed: AtomicBool,
    released: Mutex<bool>,
    wake: Condvar,
    /// Notified when an armed `embed` has started waiting
    pub entered: Notify,
}

impl HeldExtractor {
    pub fn new(inner: StubExtractor) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            released: Mutex::new(false),
            wake: Condvar::new(),
            entered: Notify::new(),
        }
    }

    pub fn arm(&self) {
        *self.released.lock().unwrap() = false;
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.wake.notify_all();
    }
}

impl FeatureExtractor for HeldExtractor {
    fn embed(&self, input: &Array4<f32>) -> Result<Embedding, ClassifierError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            let mut released = self.released.lock().unwrap();
            while !*released {
                released = self.wake.wait(released).unwrap();
            }
        }
        self.inner.embed(input)
    }

    fn classify(&self, input: &Array4<f32>) -> Result<Array1<f32>, ClassifierError> {
        self.inner.classify(input)
    }
}

/// Hands out a shared extractor, optionally holding it back until released.
pub struct StubLoader {
    extractor: Arc<dyn FeatureExtractor>,
    gate: Option<Arc<Notify>>,
}

impl StubLoader {
    pub fn shared(extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self { extractor, gate: None }
    }

    pub fn ready(extractor: StubExtractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
            gate: None,
        }
    }

    /// A loader that finishes only after `gate.notify_one()`.
    pub fn gated(extractor: StubExtractor, gate: Arc<Notify>) -> Self {
        Self {
            extractor: Arc::new(extractor),
            gate: Some(gate),
        }
    }
}

#[async_trait]
impl ExtractorLoader for StubLoader {
    async fn load(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.extractor.clone())
    }
}

pub struct FailingLoader {
    pub gate: Arc<Notify>,
}

#[async_trait]
impl ExtractorLoader for FailingLoader {
    async fn load(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
        self.gate.notified().await;
        Err(ClassifierError::ModelLoad("weights unavailable".into()))
    }
}

/// Always returns the same frame and counts how often it was asked.
pub struct StaticFrames {
    pub frame: Image,
    pub captures: AtomicUsize,
}

impl StaticFrames {
    pub fn new(frame: Image) -> Self {
        Self {
            frame,
            captures: AtomicUsize::new(0),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl FrameSource for StaticFrames {
    fn capture(&self) -> Result<Image, ClassifierError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(self.frame.clone())
    }
}
