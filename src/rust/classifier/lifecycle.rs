use std::fmt;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use super::classifier::Engine;
use super::error::ClassifierError;
use super::extractor::{ExtractorLoader, FeatureExtractor};
use super::input::PredictInput;
use super::utils::RankedPrediction;

/// Invoked once the extractor is ready and queued predictions have drained.
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) type PredictionReply = oneshot::Sender<Result<Vec<RankedPrediction>, ClassifierError>>;

/// Load state of the feature extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Ready,
    /// The loader failed; carries its error message
    Failed(String),
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => f.write_str("unloaded"),
            Self::Loading => f.write_str("loading"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// One `predict` call waiting to be served.
pub(crate) struct PredictionRequest {
    pub(crate) input: PredictInput,
    pub(crate) k: usize,
    pub(crate) reply: PredictionReply,
}

/// Owns the mailbox of prediction requests and the task that serves it.
///
/// Every request goes through a single FIFO channel consumed by one task.
/// While the extractor loads, requests simply accumulate; once it is ready
/// the backlog is served in submission order before anything sent later.
pub(crate) struct ModelLifecycle {
    state: watch::Receiver<LifecycleState>,
    requests: mpsc::UnboundedSender<PredictionRequest>,
}

impl ModelLifecycle {
    pub(crate) fn start(
        engine: Arc<Engine>,
        loader: Box<dyn ExtractorLoader>,
        on_ready: Option<ReadyCallback>,
        runtime: &Handle,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(LifecycleState::Unloaded);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        state_tx.send_replace(LifecycleState::Loading);
        info!("Feature extractor loading");
        runtime.spawn(run(engine, loader, requests_rx, state_tx, on_ready));

        Self {
            state: state_rx,
            requests: requests_tx,
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    pub(crate) fn submit(&self, request: PredictionRequest) -> Result<(), ClassifierError> {
        self.requests
            .send(request)
            .map_err(|_| ClassifierError::ModelError("prediction worker has stopped".into()))
    }

    /// Resolves once loading has finished, successfully or not.
    pub(crate) async fn wait_ready(&self) -> Result<(), ClassifierError> {
        let mut state = self.state.clone();
        let state = state
            .wait_for(LifecycleState::is_terminal)
            .await
            .map_err(|_| ClassifierError::ModelLoad("lifecycle task stopped before loading finished".into()))?;
        match &*state {
            LifecycleState::Ready => Ok(()),
            LifecycleState::Failed(reason) => Err(ClassifierError::ModelLoad(reason.clone())),
            _ => Err(ClassifierError::ModelNotReady),
        }
    }
}

/// Runs one request on the blocking pool so inference never stalls the
/// runtime, then replies. Requests are awaited one at a time, which keeps
/// them in mailbox order.
async fn serve(engine: &Arc<Engine>, extractor: &Arc<dyn FeatureExtractor>, request: PredictionRequest) {
    let PredictionRequest { input, k, reply } = request;
    let engine = Arc::clone(engine);
    let extractor = Arc::clone(extractor);
    let result = tokio::task::spawn_blocking(move || engine.predict_with(extractor.as_ref(), &input, k))
        .await
        .unwrap_or_else(|e| Err(ClassifierError::ModelError(format!("prediction task failed: {}", e))));
    if reply.send(result).is_err() {
        debug!("Prediction caller went away before the result was delivered");
    }
}

/// Loads the extractor and runs the warm-up inference; either failing fails the load.
async fn prepare(engine: &Engine, loader: &dyn ExtractorLoader) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
    let extractor = loader.load().await?;
    engine.warm_up(extractor.as_ref())?;
    Ok(extractor)
}

async fn run(
    engine: Arc<Engine>,
    loader: Box<dyn ExtractorLoader>,
    mut requests: mpsc::UnboundedReceiver<PredictionRequest>,
    state: watch::Sender<LifecycleState>,
    on_ready: Option<ReadyCallback>,
) {
    let prepared = prepare(&engine, loader.as_ref()).await;
    drop(loader);
    let extractor = match prepared {
        Ok(extractor) => extractor,
        Err(err) => {
            let reason = err.to_string();
            error!("Feature extractor failed to load: {}", reason);
            state.send_replace(LifecycleState::Failed(reason.clone()));
            while let Some(request) = requests.recv().await {
                let _ = request.reply.send(Err(ClassifierError::ModelLoad(reason.clone())));
            }
            return;
        }
    };

    engine.set_extractor(Arc::clone(&extractor));
    state.send_replace(LifecycleState::Ready);

    let mut replayed = 0;
    while let Ok(request) = requests.try_recv() {
        serve(&engine, &extractor, request).await;
        replayed += 1;
    }
    info!("Feature extractor ready, replayed {} queued predictions", replayed);

    if let Some(on_ready) = on_ready {
        on_ready();
    }

    while let Some(request) = requests.recv().await {
        serve(&engine, &extractor, request).await;
    }
    debug!("Prediction mailbox closed");
}
