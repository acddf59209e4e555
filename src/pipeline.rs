//! Multi-stage pipeline runner.
//!
//! A pipeline is a linear chain of stages joined by bounded queues; a slow
//! stage throttles everything upstream of it. Executor-backed stages
//! (transform, filter, tap, flat-map, batch-transform) each wrap a
//! [`ParallelExecutor`] with their own options; batch, buffer, and throttle
//! are pure coordination stages. Stage tasks start as soon as they are
//! attached and make progress up to the capacity of their queues; the sink
//! methods drive the final stage and assemble a [`PipelineResult`].
//!
//! Cancellation propagates to every stage through one shared token. The
//! first stage failure wins, cancels the rest of the pipeline, and is
//! reported in the terminal [`PipelineError`].

use crate::context::TaskContext;
use crate::error::{BoxError, ExecError};
use crate::executor::ParallelExecutor;
use crate::options::ExecOptions;
use crate::rate_limit::{Acquire, RateLimitConfig, TokenBucket};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Live counters for one stage.
#[derive(Debug)]
pub struct StageMetrics {
    name: String,
    items_in: AtomicU64,
    items_out: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    started: Instant,
    finished: Mutex<Option<Duration>>,
}

impl StageMetrics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items_in: AtomicU64::new(0),
            items_out: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            started: Instant::now(),
            finished: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn bump_in(&self) {
        self.items_in.fetch_add(1, Ordering::AcqRel);
    }

    fn bump_out(&self) {
        self.items_out.fetch_add(1, Ordering::AcqRel);
    }

    fn bump_failed(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    fn add_retries(&self, n: u32) {
        self.retries.fetch_add(n as u64, Ordering::AcqRel);
    }

    fn finish(&self) {
        let mut finished = self.finished.lock().unwrap_or_else(|p| p.into_inner());
        if finished.is_none() {
            *finished = Some(self.started.elapsed());
        }
    }

    pub fn summary(&self) -> StageSummary {
        let finished = *self.finished.lock().unwrap_or_else(|p| p.into_inner());
        StageSummary {
            name: self.name.clone(),
            items_in: self.items_in.load(Ordering::Acquire),
            items_out: self.items_out.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            retries: self.retries.load(Ordering::Acquire),
            elapsed: finished.unwrap_or_else(|| self.started.elapsed()),
        }
    }
}

/// Frozen view of one stage's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSummary {
    pub name: String,
    pub items_in: u64,
    pub items_out: u64,
    pub failed: u64,
    pub retries: u64,
    pub elapsed: Duration,
}

/// Aggregate emitted once at pipeline termination.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    /// Items the first stage pulled from the source.
    pub items_in: u64,
    /// Items delivered to the sink.
    pub completed: u64,
    /// Failed items summed across stages.
    pub failed: u64,
    pub elapsed: Duration,
    pub stages: Vec<StageSummary>,
}

/// Successful pipeline run: sink items plus the aggregate result.
#[derive(Debug)]
pub struct PipelineOutput<T> {
    pub items: Vec<T>,
    pub result: PipelineResult,
}

#[derive(Debug)]
pub enum PipelineError {
    Canceled { result: PipelineResult },
    Stage { stage: String, error: BoxError, result: PipelineResult },
}

impl PipelineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    pub fn result(&self) -> &PipelineResult {
        match self {
            Self::Canceled { result } | Self::Stage { result, .. } => result,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Canceled { .. } => write!(f, "pipeline canceled"),
            Self::Stage { stage, error, .. } => {
                write!(f, "stage '{}' failed: {}", stage, error)
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stage { error, .. } => Some(error.as_ref()),
            Self::Canceled { .. } => None,
        }
    }
}

/// Context handed to a [`PipelineStage`] implementation.
pub struct StageContext {
    cancel: CancellationToken,
    metrics: Arc<StageMetrics>,
}

impl StageContext {
    /// Cancels when the pipeline is canceled or a stage fails.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }
}

/// A user-provided stage.
///
/// The stage consumes the upstream item stream and returns its output
/// stream; the runner still interposes a bounded queue after it.
pub trait PipelineStage<I, O>: Send + 'static {
    fn name(&self) -> &str;
    fn run(self: Box<Self>, input: BoxStream<'static, I>, ctx: StageContext)
        -> BoxStream<'static, O>;
}

#[derive(Clone, Default)]
struct PipelineHooks {
    start: Option<Arc<dyn Fn() + Send + Sync>>,
    stage_start: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    stage_complete: Option<Arc<dyn Fn(&StageSummary) + Send + Sync>>,
    stage_error: Option<Arc<dyn Fn(&str, &(dyn std::error::Error + 'static)) + Send + Sync>>,
    complete: Option<Arc<dyn Fn(&PipelineResult) + Send + Sync>>,
}

#[derive(Clone)]
struct StageHandle {
    metrics: Arc<StageMetrics>,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<(String, BoxError)>>>,
    stage_error: Option<Arc<dyn Fn(&str, &(dyn std::error::Error + 'static)) + Send + Sync>>,
}

impl StageHandle {
    /// First failure wins and cancels the whole pipeline.
    fn record_failure(&self, error: BoxError) {
        tracing::warn!(stage = self.metrics.name(), error = %error, "stage failed");
        if let Some(hook) = &self.stage_error {
            hook(self.metrics.name(), error.as_ref());
        }
        let mut slot = self.failure.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some((self.metrics.name().to_string(), error));
        }
        drop(slot);
        self.cancel.cancel();
    }
}

struct PipelineCore {
    cancel: CancellationToken,
    default_capacity: usize,
    stages: Vec<Arc<StageMetrics>>,
    failure: Arc<Mutex<Option<(String, BoxError)>>>,
    hooks: PipelineHooks,
    tasks: JoinSet<()>,
    started: Instant,
}

/// A linear pipeline with a current element type `T`.
pub struct Pipeline<T> {
    stream: BoxStream<'static, T>,
    core: PipelineCore,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn from_stream<S>(source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self {
            stream: source.boxed(),
            core: PipelineCore {
                cancel: CancellationToken::new(),
                default_capacity: DEFAULT_QUEUE_CAPACITY,
                stages: Vec::new(),
                failure: Arc::new(Mutex::new(None)),
                hooks: PipelineHooks::default(),
                tasks: JoinSet::new(),
                started: Instant::now(),
            },
        }
    }

    pub fn from_iter<I>(source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(futures::stream::iter(source))
    }

    /// Cancel this pipeline when `parent` cancels. Call before attaching
    /// stages; already-attached stages keep the previous token.
    pub fn with_cancel(mut self, parent: CancellationToken) -> Self {
        self.core.cancel = parent.child_token();
        self
    }

    /// Token that cancels every stage of this pipeline.
    pub fn cancel_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    /// Default inter-stage queue capacity. Set before attaching stages.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.core.default_capacity = capacity.max(1);
        self
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.hooks.start = Some(Arc::new(hook));
        self
    }

    pub fn on_stage_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.core.hooks.stage_start = Some(Arc::new(hook));
        self
    }

    pub fn on_stage_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StageSummary) + Send + Sync + 'static,
    {
        self.core.hooks.stage_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_stage_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &(dyn std::error::Error + 'static)) + Send + Sync + 'static,
    {
        self.core.hooks.stage_error = Some(Arc::new(hook));
        self
    }

    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PipelineResult) + Send + Sync + 'static,
    {
        self.core.hooks.complete = Some(Arc::new(hook));
        self
    }

    /// Spawn one stage task reading `self.stream` and writing to a fresh
    /// bounded queue, which becomes the next stage's input.
    fn attach<U, B, Fut>(mut self, name: &str, capacity: Option<usize>, body: B) -> Pipeline<U>
    where
        U: Send + 'static,
        B: FnOnce(BoxStream<'static, T>, mpsc::Sender<U>, StageHandle) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let metrics = Arc::new(StageMetrics::new(name));
        self.core.stages.push(metrics.clone());
        if let Some(hook) = &self.core.hooks.stage_start {
            hook(name);
        }
        tracing::debug!(stage = name, "stage attached");

        let (tx, rx) = mpsc::channel(capacity.unwrap_or(self.core.default_capacity));
        let handle = StageHandle {
            metrics,
            cancel: self.core.cancel.clone(),
            failure: self.core.failure.clone(),
            stage_error: self.core.hooks.stage_error.clone(),
        };
        let done = handle.clone();
        let stage_complete = self.core.hooks.stage_complete.clone();
        let fut = body(self.stream, tx, handle);
        self.core.tasks.spawn(async move {
            fut.await;
            done.metrics.finish();
            let summary = done.metrics.summary();
            tracing::debug!(
                stage = summary.name.as_str(),
                items_in = summary.items_in,
                items_out = summary.items_out,
                failed = summary.failed,
                "stage complete"
            );
            if let Some(hook) = &stage_complete {
                hook(&summary);
            }
        });

        Pipeline { stream: ReceiverStream::new(rx).boxed(), core: self.core }
    }

    /// Executor-backed stage whose user function yields zero or more outputs
    /// per input. All executor-backed stage types reduce to this.
    fn exec_stage<U, E, F, Fut>(
        self,
        name: &str,
        options: ExecOptions<E>,
        f: F,
    ) -> Pipeline<U>
    where
        T: Clone,
        U: Send + 'static,
        E: std::error::Error + Clone + Send + Sync + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<U>, E>> + Send + 'static,
    {
        let capacity = Some(options.channel_capacity());
        self.attach(name, capacity, move |input, tx, handle| async move {
            let intake = handle.metrics.clone();
            let counted = input.inspect(move |_| intake.bump_in());
            let executor = ParallelExecutor::new(options).with_cancel(handle.cancel.clone());
            let mut outcomes = executor.map(counted, f);
            'forward: while let Some(outcome) = outcomes.next().await {
                handle.metrics.add_retries(outcome.retries);
                match outcome.result {
                    Ok(values) => {
                        for value in values {
                            if tx.send(value).await.is_err() {
                                break 'forward;
                            }
                            handle.metrics.bump_out();
                        }
                    }
                    Err(error) => {
                        if !error.is_canceled() {
                            handle.metrics.bump_failed();
                        }
                    }
                }
            }
            drop(tx);
            match outcomes.finish().await {
                Ok(_) => {}
                Err(ExecError::Canceled) => {}
                Err(error) => handle.record_failure(Box::new(error)),
            }
        })
    }

    /// Map each item to one output through a [`ParallelExecutor`].
    pub fn transform<U, E, F, Fut>(self, name: &str, options: ExecOptions<E>, f: F) -> Pipeline<U>
    where
        T: Clone,
        U: Send + 'static,
        E: std::error::Error + Clone + Send + Sync + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.exec_stage(name, options, move |item, ctx| {
            let f = f.clone();
            async move { f(item, ctx).await.map(|value| vec![value]) }
        })
    }

    /// Keep only items the predicate accepts.
    pub fn filter<E, P, Fut>(self, name: &str, options: ExecOptions<E>, predicate: P) -> Pipeline<T>
    where
        T: Clone,
        E: std::error::Error + Clone + Send + Sync + 'static,
        P: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, E>> + Send + 'static,
    {
        let predicate = Arc::new(predicate);
        self.exec_stage(name, options, move |item: T, ctx| {
            let predicate = predicate.clone();
            async move {
                let keep = predicate(item.clone(), ctx).await?;
                Ok(if keep { vec![item] } else { Vec::new() })
            }
        })
    }

    /// Run a side effect and forward the item unchanged.
    pub fn tap<E, F, Fut>(self, name: &str, options: ExecOptions<E>, side: F) -> Pipeline<T>
    where
        T: Clone,
        E: std::error::Error + Clone + Send + Sync + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let side = Arc::new(side);
        self.exec_stage(name, options, move |item: T, ctx| {
            let side = side.clone();
            async move {
                side(item.clone(), ctx).await?;
                Ok(vec![item])
            }
        })
    }

    /// Expand each item into zero or more outputs, flattened downstream.
    pub fn flat_map<U, E, F, Fut>(self, name: &str, options: ExecOptions<E>, f: F) -> Pipeline<U>
    where
        T: Clone,
        U: Send + 'static,
        E: std::error::Error + Clone + Send + Sync + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<U>, E>> + Send + 'static,
    {
        self.exec_stage(name, options, f)
    }

    /// Group items into chunks of `size`. With a timeout, a partial chunk
    /// flushes once its oldest item has waited that long. The final partial
    /// chunk always flushes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn batch(self, size: usize, timeout: Option<Duration>) -> Pipeline<Vec<T>> {
        assert!(size >= 1, "batch size must be >= 1");
        self.attach("batch", None, move |mut input, tx, handle| async move {
            let mut pending: Vec<T> = Vec::with_capacity(size);
            let mut deadline: Option<tokio::time::Instant> = None;
            loop {
                let flush_due = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => futures::future::pending().await,
                    }
                };
                tokio::select! {
                    item = input.next() => match item {
                        Some(item) => {
                            handle.metrics.bump_in();
                            if pending.is_empty() {
                                deadline = timeout.map(|t| tokio::time::Instant::now() + t);
                            }
                            pending.push(item);
                            if pending.len() >= size {
                                deadline = None;
                                if tx.send(std::mem::take(&mut pending)).await.is_err() {
                                    return;
                                }
                                handle.metrics.bump_out();
                            }
                        }
                        None => break,
                    },
                    _ = flush_due => {
                        deadline = None;
                        if !pending.is_empty() {
                            if tx.send(std::mem::take(&mut pending)).await.is_err() {
                                return;
                            }
                            handle.metrics.bump_out();
                        }
                    }
                    _ = handle.cancel.cancelled() => return,
                }
            }
            if !pending.is_empty() {
                if tx.send(pending).await.is_ok() {
                    handle.metrics.bump_out();
                }
            }
        })
    }

    /// [`Pipeline::batch`] followed by a transform over each chunk.
    pub fn batch_transform<U, E, F, Fut>(
        self,
        name: &str,
        size: usize,
        timeout: Option<Duration>,
        options: ExecOptions<E>,
        f: F,
    ) -> Pipeline<U>
    where
        T: Clone,
        U: Send + 'static,
        E: std::error::Error + Clone + Send + Sync + 'static,
        F: Fn(Vec<T>, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        self.batch(size, timeout).transform(name, options, f)
    }

    /// Pure decoupling queue of the given capacity.
    pub fn buffer(self, capacity: usize) -> Pipeline<T> {
        self.attach("buffer", Some(capacity.max(1)), |mut input, tx, handle| async move {
            loop {
                tokio::select! {
                    item = input.next() => match item {
                        Some(item) => {
                            handle.metrics.bump_in();
                            if tx.send(item).await.is_err() {
                                return;
                            }
                            handle.metrics.bump_out();
                        }
                        None => return,
                    },
                    _ = handle.cancel.cancelled() => return,
                }
            }
        })
    }

    /// Token-bucket gate in front of the next stage.
    pub fn throttle(self, config: RateLimitConfig) -> Pipeline<T> {
        self.attach("throttle", None, move |mut input, tx, handle| async move {
            let bucket = match TokenBucket::new(&config) {
                Ok(bucket) => bucket,
                Err(error) => {
                    handle.record_failure(Box::new(error));
                    return;
                }
            };
            loop {
                tokio::select! {
                    item = input.next() => match item {
                        Some(item) => {
                            handle.metrics.bump_in();
                            if bucket.acquire(&handle.cancel).await == Acquire::Canceled {
                                return;
                            }
                            if tx.send(item).await.is_err() {
                                return;
                            }
                            handle.metrics.bump_out();
                        }
                        None => return,
                    },
                    _ = handle.cancel.cancelled() => return,
                }
            }
        })
    }

    /// Attach a user-provided stage.
    pub fn stage<U, S>(self, stage: S) -> Pipeline<U>
    where
        U: Send + 'static,
        S: PipelineStage<T, U>,
    {
        let name = stage.name().to_string();
        self.attach(&name, None, move |input, tx, handle| async move {
            let intake = handle.metrics.clone();
            let counted = input.inspect(move |_| intake.bump_in()).boxed();
            let ctx = StageContext {
                cancel: handle.cancel.clone(),
                metrics: handle.metrics.clone(),
            };
            let mut output = Box::new(stage).run(counted, ctx);
            loop {
                tokio::select! {
                    item = output.next() => match item {
                        Some(item) => {
                            if tx.send(item).await.is_err() {
                                return;
                            }
                            handle.metrics.bump_out();
                        }
                        None => return,
                    },
                    _ = handle.cancel.cancelled() => return,
                }
            }
        })
    }

    /// Drive the pipeline to completion, collecting sink items.
    pub async fn run_collect(self) -> Result<PipelineOutput<T>, PipelineError> {
        let (items, result, failure, canceled) = self.drive(true).await;
        match failure {
            Some((stage, error)) => Err(PipelineError::Stage { stage, error, result }),
            None if canceled => Err(PipelineError::Canceled { result }),
            None => Ok(PipelineOutput { items, result }),
        }
    }

    /// Drive the pipeline to completion, dropping sink items.
    pub async fn run_drain(self) -> Result<PipelineResult, PipelineError> {
        let (_, result, failure, canceled) = self.drive(false).await;
        match failure {
            Some((stage, error)) => Err(PipelineError::Stage { stage, error, result }),
            None if canceled => Err(PipelineError::Canceled { result }),
            None => Ok(result),
        }
    }

    async fn drive(
        mut self,
        keep: bool,
    ) -> (Vec<T>, PipelineResult, Option<(String, BoxError)>, bool) {
        if let Some(hook) = &self.core.hooks.start {
            hook();
        }
        tracing::debug!(stages = self.core.stages.len(), "pipeline running");

        let mut items = Vec::new();
        let mut completed: u64 = 0;
        while let Some(item) = self.stream.next().await {
            completed += 1;
            if keep {
                items.push(item);
            }
        }
        while self.core.tasks.join_next().await.is_some() {}

        let stages: Vec<StageSummary> = self.core.stages.iter().map(|m| m.summary()).collect();
        let result = PipelineResult {
            items_in: stages.first().map(|s| s.items_in).unwrap_or(completed),
            completed,
            failed: stages.iter().map(|s| s.failed).sum(),
            elapsed: self.core.started.elapsed(),
            stages,
        };
        tracing::info!(
            items_in = result.items_in,
            completed = result.completed,
            failed = result.failed,
            "pipeline finished"
        );
        if let Some(hook) = &self.core.hooks.complete {
            hook(&result);
        }

        let failure = self.core.failure.lock().unwrap_or_else(|p| p.into_inner()).take();
        let canceled = self.core.cancel.is_cancelled();
        (items, result, failure, canceled)
    }
}
