//! Bounded parallel executor.
//!
//! One producer task pulls the source and assigns indices; a pool of worker
//! tasks runs each item through admission (token bucket, circuit breaker) and
//! the retry engine; outcomes flow to the consumer through a bounded output
//! channel, optionally passing a reorder buffer that releases them in input
//! order. Every channel is bounded, so a slow consumer throttles the
//! producer.
//!
//! Workers are indexed `0..ceiling` and a worker may only pull new work while
//! its index is below the live concurrency limit published by the adaptive
//! controller (or a fixed limit). Limit changes apply at the next admission
//! decision; running items are never preempted.

use crate::adaptive::AdaptiveConcurrency;
use crate::breaker::{Admission, CircuitBreaker};
use crate::error::{BoxError, ExecError, WorkError};
use crate::observe::{Counters, MetricsConfig, ProgressConfig};
use crate::options::{ErrorMode, ExecOptions, ItemHook};
use crate::rate_limit::{Acquire, TokenBucket};
use crate::retry::RetryPolicy;
use crate::context::TaskContext;
use futures::stream::{Stream, StreamExt};
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Final disposition of one work item.
#[derive(Debug)]
pub struct ItemOutcome<U, E> {
    /// Zero-based input index.
    pub index: u64,
    /// Retries performed for this item.
    pub retries: u32,
    pub result: Result<U, WorkError<E>>,
}

impl<U, E> ItemOutcome<U, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_value(self) -> Option<U> {
        self.result.ok()
    }
}

/// Aggregate view of a finished execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSummary {
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub timeouts: u64,
    /// Peak simultaneously running user calls observed.
    pub max_in_flight: usize,
    pub elapsed: Duration,
}

enum Fatal<E> {
    Source(BoxError),
    Item { index: u64, error: WorkError<E> },
}

struct ExecState<E> {
    counters: Counters,
    started: Instant,
    total: Option<u64>,
    error_mode: ErrorMode,
    cancel_external: CancellationToken,
    cancel_work: CancellationToken,
    fatal: Mutex<Option<Fatal<E>>>,
    collected: Mutex<Vec<(u64, WorkError<E>)>>,
    breaker: Option<Arc<CircuitBreaker>>,
    bucket: Option<Arc<TokenBucket>>,
    adaptive: Option<Arc<AdaptiveConcurrency>>,
    limit_seed: watch::Receiver<usize>,
    // Keeps the fixed-limit channel alive when no adaptive controller owns it.
    _fixed_limit: Option<watch::Sender<usize>>,
}

impl<E> ExecState<E> {
    fn current_concurrency(&self) -> usize {
        *self.limit_seed.borrow()
    }
}

/// Runs executions configured by one [`ExecOptions`].
#[derive(Debug, Clone)]
pub struct ParallelExecutor<E> {
    options: ExecOptions<E>,
    parent_cancel: Option<CancellationToken>,
}

impl<E> ParallelExecutor<E>
where
    E: Clone + Send + 'static,
{
    pub fn new(options: ExecOptions<E>) -> Self {
        Self { options, parent_cancel: None }
    }

    /// Link executions to an external cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.parent_cancel = Some(token);
        self
    }

    pub fn options(&self) -> &ExecOptions<E> {
        &self.options
    }

    /// Run `f` over every item of `source`, yielding outcomes as configured.
    pub fn map<S, T, U, F, Fut>(&self, source: S, f: F) -> OutcomeStream<U, E>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        self.run(source.map(Ok).boxed(), None, f)
    }

    /// [`ParallelExecutor::map`] over an iterator. Exact-sized iterators make
    /// the total visible to progress snapshots.
    pub fn map_iter<I, T, U, F, Fut>(&self, source: I, f: F) -> OutcomeStream<U, E>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        let iter = source.into_iter();
        let (lower, upper) = iter.size_hint();
        let total = (upper == Some(lower)).then_some(lower as u64);
        self.run(futures::stream::iter(iter).map(Ok).boxed(), total, f)
    }

    /// Like [`ParallelExecutor::map`] for fallible sources. A source error is
    /// always fatal for the execution.
    pub fn try_map<S, T, U, F, Fut>(&self, source: S, f: F) -> OutcomeStream<U, E>
    where
        S: Stream<Item = Result<T, BoxError>> + Send + 'static,
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        self.run(source.boxed(), None, f)
    }

    /// Materialize all successful results. Input order when `ordered` is set,
    /// completion order otherwise. Error semantics follow the error mode.
    pub async fn collect<S, T, U, F, Fut>(&self, source: S, f: F) -> Result<Vec<U>, ExecError<E>>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        let mut stream = self.map(source, f);
        let mut values = Vec::new();
        while let Some(outcome) = stream.next().await {
            if let Ok(value) = outcome.result {
                values.push(value);
            }
        }
        stream.finish().await.map(|_| values)
    }

    /// [`ParallelExecutor::collect`] over an iterator.
    pub async fn collect_iter<I, T, U, F, Fut>(&self, source: I, f: F) -> Result<Vec<U>, ExecError<E>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        let mut stream = self.map_iter(source, f);
        let mut values = Vec::new();
        while let Some(outcome) = stream.next().await {
            if let Ok(value) = outcome.result {
                values.push(value);
            }
        }
        stream.finish().await.map(|_| values)
    }

    /// Run `f` for its side effects, dropping results.
    pub async fn for_each<S, T, F, Fut>(&self, source: S, f: F) -> Result<ExecSummary, ExecError<E>>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Clone + Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.map(source, f).finish().await
    }

    /// Group the source into chunks of `batch_size` (the last may be short)
    /// and run each chunk through the executor as one work item.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is zero.
    pub async fn batched<S, T, U, F, Fut>(
        &self,
        source: S,
        batch_size: usize,
        f: F,
    ) -> Result<Vec<U>, ExecError<E>>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(Vec<T>, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        assert!(batch_size >= 1, "batch_size must be >= 1");
        self.collect(source.chunks(batch_size), f).await
    }

    fn run<T, U, F, Fut>(
        &self,
        source: Pin<Box<dyn Stream<Item = Result<T, BoxError>> + Send>>,
        total: Option<u64>,
        f: F,
    ) -> OutcomeStream<U, E>
    where
        T: Clone + Send + 'static,
        U: Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        let options = &self.options;
        let cancel_external =
            self.parent_cancel.as_ref().map(|t| t.child_token()).unwrap_or_default();
        let cancel_work = cancel_external.child_token();

        let (adaptive, fixed_limit, limit_rx) = match &options.adaptive {
            Some(config) => {
                let controller = Arc::new(
                    AdaptiveConcurrency::new(config.clone())
                        .expect("adaptive config validated at build time"),
                );
                let rx = controller.subscribe();
                (Some(controller), None, rx)
            }
            None => {
                let (tx, rx) = watch::channel(options.max_concurrency);
                (None, Some(tx), rx)
            }
        };
        let breaker = options.breaker.as_ref().map(|config| {
            Arc::new(
                CircuitBreaker::new(config.clone())
                    .expect("breaker config validated at build time"),
            )
        });
        let bucket = options.rate_limit.as_ref().map(|config| {
            Arc::new(TokenBucket::new(config).expect("rate limit validated at build time"))
        });

        let state = Arc::new(ExecState {
            counters: Counters::default(),
            started: Instant::now(),
            total,
            error_mode: options.error_mode,
            cancel_external: cancel_external.clone(),
            cancel_work: cancel_work.clone(),
            fatal: Mutex::new(None),
            collected: Mutex::new(Vec::new()),
            breaker,
            bucket,
            adaptive,
            limit_seed: limit_rx.clone(),
            _fixed_limit: fixed_limit,
        });

        let (in_tx, in_rx) = mpsc::channel(options.channel_capacity);
        let (out_tx, out_rx) = mpsc::channel(options.channel_capacity);

        tokio::spawn(producer(source, in_tx, state.clone()));

        let worker_tx = if options.ordered {
            let (done_tx, done_rx) = mpsc::channel(options.channel_capacity);
            tokio::spawn(reorder_emitter(done_rx, out_tx));
            done_tx
        } else {
            out_tx
        };

        let input = Arc::new(tokio::sync::Mutex::new(in_rx));
        let work = Arc::new(f);
        let retry = RetryPolicy::from_options(options);
        let on_complete = options.on_complete_item.clone();

        let mut workers = JoinSet::new();
        for id in 0..options.worker_ceiling() {
            workers.spawn(worker(
                id,
                state.clone(),
                input.clone(),
                worker_tx.clone(),
                retry.clone(),
                work.clone(),
                on_complete.clone(),
                limit_rx.clone(),
            ));
        }
        drop(worker_tx);

        let sampler_done = CancellationToken::new();
        if let Some(config) = &options.progress {
            tokio::spawn(progress_sampler(state.clone(), config.clone(), sampler_done.clone()));
        }
        if let Some(config) = &options.metrics {
            tokio::spawn(metrics_sampler(state.clone(), config.clone(), sampler_done.clone()));
        }

        tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
            sampler_done.cancel();
            tracing::debug!("execution drained");
        });

        OutcomeStream { rx: out_rx, state }
    }
}

/// Stream of item outcomes plus the terminal result of the execution.
pub struct OutcomeStream<U, E> {
    rx: mpsc::Receiver<ItemOutcome<U, E>>,
    state: Arc<ExecState<E>>,
}

impl<U, E> Stream for OutcomeStream<U, E> {
    type Item = ItemOutcome<U, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<U, E> OutcomeStream<U, E> {
    /// Cancel this execution. Terminal result becomes `ExecError::Canceled`.
    pub fn cancel(&self) {
        self.state.cancel_external.cancel();
    }

    /// Token that cancels with this execution; hand it to cooperating code.
    pub fn cancel_token(&self) -> CancellationToken {
        self.state.cancel_external.clone()
    }

    /// Drain any remaining outcomes and return the terminal result.
    pub async fn finish(mut self) -> Result<ExecSummary, ExecError<E>> {
        while self.rx.recv().await.is_some() {}

        let state = &self.state;
        if state.cancel_external.is_cancelled() {
            return Err(ExecError::Canceled);
        }
        if let Some(fatal) = state.fatal.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return Err(match fatal {
                Fatal::Source(error) => ExecError::Source(error),
                Fatal::Item { index, error } => ExecError::Item { index, error },
            });
        }
        let collected =
            std::mem::take(&mut *state.collected.lock().unwrap_or_else(|p| p.into_inner()));
        if state.error_mode == ErrorMode::CollectAndContinue && !collected.is_empty() {
            return Err(ExecError::Aggregate { errors: collected });
        }

        let counters = &state.counters;
        Ok(ExecSummary {
            completed: counters.completed.load(Ordering::Acquire),
            failed: counters.failed.load(Ordering::Acquire),
            retries: counters.retries.load(Ordering::Acquire),
            timeouts: counters.timeouts.load(Ordering::Acquire),
            max_in_flight: counters.high_water(),
            elapsed: state.started.elapsed(),
        })
    }
}

async fn producer<T, E>(
    mut source: Pin<Box<dyn Stream<Item = Result<T, BoxError>> + Send>>,
    tx: mpsc::Sender<(u64, T)>,
    state: Arc<ExecState<E>>,
) {
    let mut index: u64 = 0;
    loop {
        let next = tokio::select! {
            item = source.next() => item,
            _ = state.cancel_work.cancelled() => break,
        };
        match next {
            Some(Ok(item)) => {
                state.counters.pulled.fetch_add(1, Ordering::AcqRel);
                let sent = tokio::select! {
                    sent = tx.send((index, item)) => sent.is_ok(),
                    _ = state.cancel_work.cancelled() => false,
                };
                if !sent {
                    break;
                }
                index += 1;
            }
            Some(Err(error)) => {
                tracing::error!(error = %error, "input sequence failed");
                let mut fatal = state.fatal.lock().unwrap_or_else(|p| p.into_inner());
                if fatal.is_none() {
                    *fatal = Some(Fatal::Source(error));
                }
                drop(fatal);
                state.cancel_work.cancel();
                break;
            }
            None => break,
        }
    }
}

/// Block until this worker's index is under the live limit. False on cancel.
async fn wait_for_slot(
    id: usize,
    limit: &mut watch::Receiver<usize>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        if *limit.borrow_and_update() > id {
            return true;
        }
        tokio::select! {
            changed = limit.changed() => {
                if changed.is_err() {
                    return *limit.borrow() > id;
                }
            }
            _ = cancel.cancelled() => return false,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker<T, U, F, Fut, E>(
    id: usize,
    state: Arc<ExecState<E>>,
    input: Arc<tokio::sync::Mutex<mpsc::Receiver<(u64, T)>>>,
    outcome_tx: mpsc::Sender<ItemOutcome<U, E>>,
    retry: RetryPolicy<E>,
    f: Arc<F>,
    on_complete: Option<ItemHook<E>>,
    mut limit: watch::Receiver<usize>,
) where
    T: Clone + Send + 'static,
    U: Send + 'static,
    E: Clone + Send + 'static,
    F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
{
    loop {
        if !wait_for_slot(id, &mut limit, &state.cancel_work).await {
            return;
        }

        let next = {
            let mut rx = tokio::select! {
                guard = input.lock() => guard,
                _ = state.cancel_work.cancelled() => return,
            };
            tokio::select! {
                item = rx.recv() => item,
                _ = state.cancel_work.cancelled() => return,
            }
        };
        let Some((index, payload)) = next else { return };

        if let Some(bucket) = &state.bucket {
            if bucket.acquire(&state.cancel_work).await == Acquire::Canceled {
                let _ = outcome_tx.try_send(ItemOutcome {
                    index,
                    retries: 0,
                    result: Err(WorkError::Canceled),
                });
                return;
            }
        }

        let admission = state.breaker.as_ref().map(|b| b.admit());
        if let Some(Admission::Rejected { window_failures }) = admission {
            state.counters.breaker_rejections.fetch_add(1, Ordering::AcqRel);
            let outcome = ItemOutcome {
                index,
                retries: 0,
                result: Err(WorkError::BreakerOpen { window_failures }),
            };
            if !settle(&state, &on_complete, &outcome_tx, outcome).await {
                return;
            }
            continue;
        }
        let probe = matches!(admission, Some(Admission::Allowed { probe: true }));

        state.counters.item_started();
        let item_started = Instant::now();
        let run = retry.run(index, payload, &state.cancel_work, f.as_ref()).await;
        let latency = item_started.elapsed();
        state.counters.item_finished();
        state.counters.retries.fetch_add(run.retries as u64, Ordering::AcqRel);
        state.counters.timeouts.fetch_add(run.timeouts as u64, Ordering::AcqRel);

        let success = run.result.is_ok();
        if let Some(breaker) = &state.breaker {
            match &run.result {
                Err(WorkError::Canceled) => breaker.release(probe),
                _ => breaker.record(probe, success),
            }
        }
        if let Some(adaptive) = &state.adaptive {
            adaptive.record(latency, success);
        }

        let outcome = ItemOutcome { index, retries: run.retries, result: run.result };
        if !settle(&state, &on_complete, &outcome_tx, outcome).await {
            return;
        }
    }
}

/// Apply error-mode bookkeeping and emit the outcome. False stops the worker.
async fn settle<U, E>(
    state: &Arc<ExecState<E>>,
    on_complete: &Option<ItemHook<E>>,
    outcome_tx: &mpsc::Sender<ItemOutcome<U, E>>,
    outcome: ItemOutcome<U, E>,
) -> bool
where
    E: Clone,
{
    let index = outcome.index;
    let retries = outcome.retries;
    match outcome.result {
        Ok(value) => {
            state.counters.completed.fetch_add(1, Ordering::AcqRel);
            if let Some(hook) = on_complete {
                hook(index, retries, None);
            }
            emit(state, outcome_tx, ItemOutcome { index, retries, result: Ok(value) }).await
        }
        Err(error) => {
            if error.is_canceled() {
                if let Some(hook) = on_complete {
                    hook(index, retries, Some(&error));
                }
                let _ = outcome_tx.try_send(ItemOutcome { index, retries, result: Err(error) });
                return false;
            }

            state.counters.failed.fetch_add(1, Ordering::AcqRel);
            if let Some(hook) = on_complete {
                hook(index, retries, Some(&error));
            }
            match state.error_mode {
                ErrorMode::FailFast => {
                    let mut fatal = state.fatal.lock().unwrap_or_else(|p| p.into_inner());
                    if fatal.is_none() {
                        *fatal = Some(Fatal::Item { index, error });
                    }
                    drop(fatal);
                    state.cancel_work.cancel();
                    false
                }
                ErrorMode::CollectAndContinue => {
                    state
                        .collected
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push((index, error.clone()));
                    emit(state, outcome_tx, ItemOutcome { index, retries, result: Err(error) })
                        .await
                }
                ErrorMode::BestEffort => {
                    emit(state, outcome_tx, ItemOutcome { index, retries, result: Err(error) })
                        .await
                }
            }
        }
    }
}

async fn emit<U, E>(
    state: &Arc<ExecState<E>>,
    outcome_tx: &mpsc::Sender<ItemOutcome<U, E>>,
    outcome: ItemOutcome<U, E>,
) -> bool {
    tokio::select! {
        sent = outcome_tx.send(outcome) => sent.is_ok(),
        _ = state.cancel_work.cancelled() => false,
    }
}

/// Min-heap wrapper ordering outcomes by ascending index.
struct ByIndex<U, E>(ItemOutcome<U, E>);

impl<U, E> PartialEq for ByIndex<U, E> {
    fn eq(&self, other: &Self) -> bool {
        self.0.index == other.0.index
    }
}

impl<U, E> Eq for ByIndex<U, E> {}

impl<U, E> PartialOrd for ByIndex<U, E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<U, E> Ord for ByIndex<U, E> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.index.cmp(&self.0.index)
    }
}

/// Releases outcomes in strictly ascending index order. Backpressure comes
/// from the bounded channels on both sides; after the completion channel
/// closes, any buffered outcomes flush in index order (gaps can exist only
/// when the execution is already terminating).
async fn reorder_emitter<U, E>(
    mut rx: mpsc::Receiver<ItemOutcome<U, E>>,
    out: mpsc::Sender<ItemOutcome<U, E>>,
) {
    let mut heap: BinaryHeap<ByIndex<U, E>> = BinaryHeap::new();
    let mut next: u64 = 0;
    while let Some(outcome) = rx.recv().await {
        heap.push(ByIndex(outcome));
        while heap.peek().map_or(false, |pending| pending.0.index == next) {
            let ready = heap.pop().expect("peeked entry exists").0;
            next += 1;
            if out.send(ready).await.is_err() {
                return;
            }
        }
    }
    while let Some(pending) = heap.pop() {
        if out.send(pending.0).await.is_err() {
            return;
        }
    }
}

async fn progress_sampler<E>(
    state: Arc<ExecState<E>>,
    config: ProgressConfig,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.report_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                (config.on_progress)(state.counters.progress(state.total, state.started.elapsed()));
            }
            _ = done.cancelled() => {
                // Final flush so observers see the completed totals.
                (config.on_progress)(state.counters.progress(state.total, state.started.elapsed()));
                return;
            }
        }
    }
}

async fn metrics_sampler<E>(
    state: Arc<ExecState<E>>,
    config: MetricsConfig,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.sample_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        let snapshot = || {
            state.counters.metrics(
                state.current_concurrency(),
                state.breaker.as_ref().map(|b| b.state()),
                state.started.elapsed(),
            )
        };
        tokio::select! {
            _ = ticker.tick() => (config.on_sample)(snapshot()),
            _ = done.cancelled() => {
                (config.on_sample)(snapshot());
                return;
            }
        }
    }
}
