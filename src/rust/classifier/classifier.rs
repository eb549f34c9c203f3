use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::task::{Context, Poll};

use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::dataset::Dataset;
use super::error::ClassifierError;
use super::extractor::{Embedding, ExtractorLoader, FeatureExtractor};
use super::head::{ClassifierHead, TrainingSummary};
use super::input::{FrameSource, Image, PredictInput};
use super::lifecycle::{LifecycleState, ModelLifecycle, PredictionRequest, ReadyCallback};
use super::options::ClassifierOptions;
use super::pipeline::FeaturePipeline;
use super::utils::{top_k, RankedPrediction};
use crate::labels;

/// State shared between the facade and the prediction worker.
pub(crate) struct Engine {
    options: ClassifierOptions,
    pipeline: FeaturePipeline,
    frame_source: Option<Arc<dyn FrameSource>>,
    extractor: OnceLock<Arc<dyn FeatureExtractor>>,
    head: RwLock<Option<Arc<ClassifierHead>>>,
}

impl Engine {
    fn new(options: ClassifierOptions, frame_source: Option<Arc<dyn FrameSource>>) -> Self {
        Self {
            pipeline: FeaturePipeline::new(options.pipeline.clone()),
            options,
            frame_source,
            extractor: OnceLock::new(),
            head: RwLock::new(None),
        }
    }

    pub(crate) fn set_extractor(&self, extractor: Arc<dyn FeatureExtractor>) {
        if self.extractor.set(extractor).is_err() {
            warn!("Feature extractor was already set, keeping the first one");
        }
    }

    fn extractor(&self) -> Option<Arc<dyn FeatureExtractor>> {
        self.extractor.get().cloned()
    }

    fn current_head(&self) -> Option<Arc<ClassifierHead>> {
        self.head.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace_head(&self, head: ClassifierHead) {
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(head));
    }

    fn resolve_input(&self, input: &PredictInput) -> Result<Image, ClassifierError> {
        match input {
            PredictInput::Image(image) => Ok(image.clone()),
            PredictInput::Frame(source) => source.capture(),
            PredictInput::Live => self
                .frame_source
                .as_ref()
                .ok_or(ClassifierError::NoFrameSource)?
                .capture(),
        }
    }

    fn embed(&self, extractor: &dyn FeatureExtractor, input: &PredictInput) -> Result<Embedding, ClassifierError> {
        let image = self.resolve_input(input)?;
        let tensor = self.pipeline.transform(&image)?;
        extractor.embed(&tensor)
    }

    /// Runs one throwaway inference on the live source, if there is one.
    pub(crate) fn warm_up(&self, extractor: &dyn FeatureExtractor) -> Result<(), ClassifierError> {
        if self.frame_source.is_none() {
            return Ok(());
        }
        self.embed(extractor, &PredictInput::Live)
            .map_err(|e| ClassifierError::ModelLoad(format!("warm-up inference failed: {}", e)))?;
        debug!("Warm-up inference complete");
        Ok(())
    }

    /// The full predict path. The head is captured once, so a concurrent
    /// `train` cannot swap it out halfway through.
    pub(crate) fn predict_with(
        &self,
        extractor: &dyn FeatureExtractor,
        input: &PredictInput,
        k: usize,
    ) -> Result<Vec<RankedPrediction>, ClassifierError> {
        match self.current_head() {
            Some(head) => {
                let embedding = self.embed(extractor, input)?;
                let probabilities = head.predict(&embedding)?;
                top_k(&probabilities, k, |i| self.options.class_name(i))
            }
            None => {
                let image = self.resolve_input(input)?;
                let tensor = self.pipeline.transform(&image)?;
                let probabilities = extractor.classify(&tensor)?;
                top_k(&probabilities, k, |i| {
                    labels::label_for(i).map_or_else(|| i.to_string(), str::to_string)
                })
            }
        }
    }
}

/// A prediction that has been queued. Resolves to the ranked classes.
///
/// The request is enqueued when `predict` is called, not when this future is
/// first polled, so call order is submission order.
#[must_use = "the prediction result is discarded unless awaited"]
pub struct PendingPrediction {
    state: PendingState,
}

enum PendingState {
    Queued(oneshot::Receiver<Result<Vec<RankedPrediction>, ClassifierError>>),
    Rejected(Option<ClassifierError>),
}

impl PendingPrediction {
    fn rejected(err: ClassifierError) -> Self {
        Self {
            state: PendingState::Rejected(Some(err)),
        }
    }
}

impl Future for PendingPrediction {
    type Output = Result<Vec<RankedPrediction>, ClassifierError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Queued(reply) => Pin::new(reply).poll(cx).map(|result| {
                result.unwrap_or_else(|_| {
                    Err(ClassifierError::ModelError("prediction worker dropped the request".into()))
                })
            }),
            PendingState::Rejected(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| ClassifierError::ModelError("prediction already resolved".into())))),
        }
    }
}

/// A transfer-learning image classifier.
///
/// Construction starts loading the feature extractor in the background.
/// Predictions may be requested immediately; they are queued and served in
/// order once the extractor is ready. Adding examples and training need the
/// extractor and fail with `ModelNotReady` until then.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use glimpse::{BuiltinModel, Classifier, ClassifierOptions, Image};
///
/// let classifier = Classifier::builder()
///     .with_options(ClassifierOptions { num_classes: 2, ..Default::default() })
///     .with_model(BuiltinModel::MobileNetV2)?
///     .build()?;
/// classifier.wait_ready().await?;
///
/// classifier.add_image(0, Image::open("cat.jpg")?)?;
/// classifier.add_image(1, Image::open("dog.jpg")?)?;
/// classifier.train(|loss| println!("loss {}", loss)).await?;
///
/// for prediction in classifier.predict(Image::open("query.jpg")?, Some(2)).await? {
///     println!("{}: {:.3}", prediction.class_name, prediction.probability);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Classifier {
    engine: Arc<Engine>,
    lifecycle: ModelLifecycle,
    dataset: Mutex<Dataset>,
    training: tokio::sync::Mutex<()>,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<Classifier>();
    }
};

impl Classifier {
    /// Creates a new ClassifierBuilder for fluent construction
    pub fn builder() -> super::builder::ClassifierBuilder {
        super::builder::ClassifierBuilder::new()
    }

    /// Constructs a classifier and starts loading its extractor through `loader`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<L: ExtractorLoader>(
        frame_source: Option<Arc<dyn FrameSource>>,
        options: ClassifierOptions,
        loader: L,
        on_ready: Option<ReadyCallback>,
    ) -> Result<Self, ClassifierError> {
        let mut builder = Self::builder().with_options(options).with_loader(loader)?;
        if let Some(source) = frame_source {
            builder = builder.with_frame_source(source);
        }
        if let Some(on_ready) = on_ready {
            builder = builder.on_ready(on_ready);
        }
        builder.build()
    }

    pub(crate) fn start(
        options: ClassifierOptions,
        frame_source: Option<Arc<dyn FrameSource>>,
        loader: Box<dyn ExtractorLoader>,
        on_ready: Option<ReadyCallback>,
        runtime: &Handle,
    ) -> Self {
        let dataset = Dataset::new(options.num_classes);
        let engine = Arc::new(Engine::new(options, frame_source));
        let lifecycle = ModelLifecycle::start(Arc::clone(&engine), loader, on_ready, runtime);
        Self {
            engine,
            lifecycle,
            dataset: Mutex::new(dataset),
            training: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Waits for the extractor to finish loading.
    ///
    /// # Errors
    /// - `ModelLoad` if loading failed
    pub async fn wait_ready(&self) -> Result<(), ClassifierError> {
        self.lifecycle.wait_ready().await
    }

    pub fn options(&self) -> &ClassifierOptions {
        &self.engine.options
    }

    /// Returns information about the classifier's current state
    pub fn info(&self) -> super::ClassifierInfo {
        let dataset = self.lock_dataset();
        super::ClassifierInfo {
            state: self.state(),
            num_classes: self.engine.options.num_classes,
            class_names: (0..self.engine.options.num_classes)
                .map(|i| self.engine.options.class_name(i))
                .collect(),
            num_examples: dataset.len(),
            examples_per_class: dataset.class_counts(),
            embedding_shape: dataset.embedding_shape().map(<[usize]>::to_vec),
            trained: self.is_trained(),
        }
    }

    fn lock_dataset(&self) -> MutexGuard<'_, Dataset> {
        self.dataset.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_extractor(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
        match self.state() {
            LifecycleState::Failed(reason) => Err(ClassifierError::ModelLoad(reason)),
            _ => self.engine.extractor().ok_or(ClassifierError::ModelNotReady),
        }
    }

    /// Embeds `input` and stores it as an example of class `label`.
    ///
    /// # Errors
    /// - `ModelNotReady` if the extractor is still loading
    /// - `InvalidLabel` if `label >= num_classes`
    /// - `InvalidImage` if the pixel buffer is malformed
    pub fn add_image(&self, label: usize, input: impl Into<PredictInput>) -> Result<(), ClassifierError> {
        let extractor = self.ready_extractor()?;
        let num_classes = self.engine.options.num_classes;
        if label >= num_classes {
            return Err(ClassifierError::InvalidLabel { label, num_classes });
        }
        let embedding = self.engine.embed(extractor.as_ref(), &input.into())?;
        let mut dataset = self.lock_dataset();
        dataset.append(&embedding, label)?;
        debug!("Added example for class {} ({} total)", label, dataset.len());
        Ok(())
    }

    /// Trains a new head on every example added so far.
    ///
    /// `on_progress` receives the loss after each mini-batch. On success the
    /// new head replaces the previous one; on failure the previous head stays.
    pub async fn train<F>(&self, on_progress: F) -> Result<TrainingSummary, ClassifierError>
    where
        F: FnMut(f32) + Send,
    {
        self.train_with_cancel(on_progress, CancellationToken::new()).await
    }

    /// Like [`train`](Self::train), stopping between mini-batches once `cancel` fires.
    pub async fn train_with_cancel<F>(
        &self,
        on_progress: F,
        cancel: CancellationToken,
    ) -> Result<TrainingSummary, ClassifierError>
    where
        F: FnMut(f32) + Send,
    {
        self.ready_extractor()?;
        let _session = self
            .training
            .try_lock()
            .map_err(|_| ClassifierError::TrainingInProgress)?;

        let snapshot = self.lock_dataset().clone();
        if snapshot.is_empty() {
            return Err(ClassifierError::EmptyDataset);
        }

        let config = self.engine.options.training_config();
        let (head, summary) = ClassifierHead::fit(&snapshot, &config, on_progress, &cancel).await?;
        self.engine.replace_head(head);
        info!("Classifier head replaced ({} examples)", summary.examples);
        Ok(summary)
    }

    /// Queues a prediction and returns a future resolving to at most `k`
    /// ranked classes (`k` defaults to `options.top_k`).
    ///
    /// Argument errors such as `k == 0` resolve immediately without queueing.
    pub fn predict(&self, input: impl Into<PredictInput>, k: Option<usize>) -> PendingPrediction {
        let k = k.unwrap_or(self.engine.options.top_k);
        if k == 0 {
            return PendingPrediction::rejected(ClassifierError::InvalidTopK(k));
        }
        let input = input.into();
        if matches!(input, PredictInput::Live) && self.engine.frame_source.is_none() {
            return PendingPrediction::rejected(ClassifierError::NoFrameSource);
        }

        let (reply, receiver) = oneshot::channel();
        match self.lifecycle.submit(PredictionRequest { input, k, reply }) {
            Ok(()) => PendingPrediction {
                state: PendingState::Queued(receiver),
            },
            Err(err) => PendingPrediction::rejected(err),
        }
    }

    pub fn num_examples(&self) -> usize {
        self.lock_dataset().len()
    }

    pub fn is_trained(&self) -> bool {
        self.engine.current_head().is_some()
    }

    /// Forgets every example; the trained head, if any, is kept.
    pub fn clear_examples(&self) {
        self.lock_dataset().clear();
    }

    /// Class names used when no head has been trained.
    pub fn vocabulary(&self) -> &'static [&'static str] {
        labels::imagenet_labels()
    }
}
