use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weir::{
    Backoff, ErrorMode, ExecError, ExecOptions, ParallelExecutor, WorkError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError(String);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

fn options() -> weir::ExecOptionsBuilder<TestError> {
    ExecOptions::builder()
}

#[tokio::test]
async fn squares_in_input_order() {
    let exec = ParallelExecutor::new(
        options().max_concurrency(5).ordered(true).build().unwrap(),
    );
    let squares = exec
        .collect_iter(1u64..=20, |x, _ctx| async move { Ok::<_, TestError>(x * x) })
        .await
        .unwrap();
    let expected: Vec<u64> = (1..=20).map(|x| x * x).collect();
    assert_eq!(squares, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_limit() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let exec = ParallelExecutor::new(options().max_concurrency(5).build().unwrap());

    let run = running.clone();
    let high = peak.clone();
    let summary = exec
        .map_iter(0u32..50, move |_x, _ctx| {
            let run = run.clone();
            let high = high.clone();
            async move {
                let now = run.fetch_add(1, Ordering::SeqCst) + 1;
                high.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                run.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            }
        })
        .finish()
        .await
        .unwrap();

    assert_eq!(summary.completed, 50);
    let observed = peak.load(Ordering::SeqCst);
    assert!(observed <= 5, "peak concurrency {} exceeded limit", observed);
    assert!(summary.max_in_flight <= 5);
}

#[tokio::test]
async fn fail_fast_surfaces_first_permanent_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let exec = ParallelExecutor::new(
        options().max_concurrency(5).error_mode(ErrorMode::FailFast).build().unwrap(),
    );

    let seen = calls.clone();
    let result = exec
        .collect_iter(1u32..=20, move |x, _ctx| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if x == 10 {
                    Err(TestError("invalid operation".into()))
                } else {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(x)
                }
            }
        })
        .await;

    match result.unwrap_err() {
        ExecError::Item { index, error } => {
            assert_eq!(index, 9);
            assert_eq!(error.as_app().unwrap().0, "invalid operation");
        }
        other => panic!("expected Item error, got {:?}", other),
    }
}

#[tokio::test]
async fn collect_and_continue_retries_transients_to_success() {
    let first_calls: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
    let retries_by_index = Arc::new(Mutex::new(Vec::new()));

    let sink = retries_by_index.clone();
    let exec = ParallelExecutor::new(
        options()
            .max_concurrency(4)
            .max_retries(3)
            .backoff(Backoff::fixed(Duration::from_millis(1)))
            .transient(|e: &TestError| e.0 == "transient")
            .error_mode(ErrorMode::CollectAndContinue)
            .on_complete_item(move |index, retries, error| {
                assert!(error.is_none());
                sink.lock().unwrap().push((index, retries));
            })
            .build()
            .unwrap(),
    );

    let state = first_calls.clone();
    let values = exec
        .collect_iter(1u32..=10, move |x, _ctx| {
            let state = state.clone();
            async move {
                if x % 3 == 0 && state.lock().unwrap().insert(x) {
                    Err(TestError("transient".into()))
                } else {
                    Ok(x)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(values.len(), 10);
    let recorded = retries_by_index.lock().unwrap();
    let retried: Vec<u64> =
        recorded.iter().filter(|(_, r)| *r == 1).map(|(i, _)| *i).collect();
    // Inputs 3, 6, 9 sit at indices 2, 5, 8.
    assert_eq!(retried.len(), 3);
    for index in [2u64, 5, 8] {
        assert!(retried.contains(&index), "index {} should have one retry", index);
    }
}

#[tokio::test]
async fn collect_and_continue_aggregates_permanent_errors() {
    let exec = ParallelExecutor::new(
        options()
            .max_concurrency(3)
            .error_mode(ErrorMode::CollectAndContinue)
            .build()
            .unwrap(),
    );

    let result = exec
        .collect_iter(0u32..10, |x, _ctx| async move {
            if x % 4 == 0 {
                Err(TestError(format!("bad {}", x)))
            } else {
                Ok(x)
            }
        })
        .await;

    match result.unwrap_err() {
        ExecError::Aggregate { errors } => {
            let mut indices: Vec<u64> = errors.iter().map(|(i, _)| *i).collect();
            indices.sort_unstable();
            assert_eq!(indices, vec![0, 4, 8]);
            for (_, error) in &errors {
                assert!(error.as_app().unwrap().0.starts_with("bad"));
            }
        }
        other => panic!("expected Aggregate, got {:?}", other),
    }
}

#[tokio::test]
async fn best_effort_never_fails_the_execution() {
    let exec = ParallelExecutor::new(
        options().max_concurrency(3).error_mode(ErrorMode::BestEffort).build().unwrap(),
    );

    let values = exec
        .collect_iter(0u32..10, |x, _ctx| async move {
            if x % 2 == 0 {
                Err(TestError("drop".into()))
            } else {
                Ok(x)
            }
        })
        .await
        .unwrap();

    let mut sorted = values.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 3, 5, 7, 9]);
}

#[tokio::test]
async fn every_index_settles_exactly_once() {
    let exec = ParallelExecutor::new(
        options().max_concurrency(8).error_mode(ErrorMode::BestEffort).build().unwrap(),
    );

    let mut stream = exec.map_iter(0u32..100, |x, _ctx| async move {
        if x % 7 == 0 {
            Err(TestError("skip".into()))
        } else {
            Ok(x)
        }
    });

    let mut seen = HashSet::new();
    while let Some(outcome) = stream.next().await {
        assert!(seen.insert(outcome.index), "duplicate outcome for {}", outcome.index);
    }
    assert_eq!(seen.len(), 100);
    stream.finish().await.unwrap();
}

#[tokio::test]
async fn attempts_never_exceed_retry_budget() {
    let exec = ParallelExecutor::new(
        options()
            .max_retries(3)
            .transient(|_| true)
            .error_mode(ErrorMode::BestEffort)
            .build()
            .unwrap(),
    );

    let mut stream =
        exec.map_iter(0u32..10, |_x, _ctx| async move { Err::<u32, _>(TestError("always".into())) });
    while let Some(outcome) = stream.next().await {
        assert!(outcome.retries <= 3);
        match outcome.result.unwrap_err() {
            WorkError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }
    stream.finish().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_terminates_promptly() {
    let exec = ParallelExecutor::new(options().max_concurrency(4).build().unwrap());
    let stream = exec.map_iter(0u32.., |_x, ctx: weir::TaskContext| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok::<_, TestError>(()),
            _ = ctx.canceled() => Err(TestError("canceled".into())),
        }
    });

    let cancel = stream.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let result = stream.finish().await;
    assert!(matches!(result, Err(ExecError::Canceled)));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn source_failure_is_always_fatal() {
    let source = futures::stream::iter(vec![
        Ok(1u32),
        Ok(2),
        Err::<u32, weir::BoxError>("source broke".into()),
    ]);
    let exec = ParallelExecutor::new(
        options().error_mode(ErrorMode::BestEffort).build().unwrap(),
    );

    let result = exec
        .try_map(source, |x, _ctx| async move { Ok::<_, TestError>(x) })
        .finish()
        .await;
    match result.unwrap_err() {
        ExecError::Source(error) => assert!(error.to_string().contains("source broke")),
        other => panic!("expected Source, got {:?}", other),
    }
}

#[tokio::test]
async fn user_panic_is_permanent_for_that_item_only() {
    let exec = ParallelExecutor::new(
        options().error_mode(ErrorMode::BestEffort).build().unwrap(),
    );

    let mut stream = exec.map_iter(0u32..5, |x, _ctx| async move {
        if x == 2 {
            panic!("worker blew up");
        }
        Ok::<_, TestError>(x)
    });

    let mut panicked = 0;
    let mut succeeded = 0;
    while let Some(outcome) = stream.next().await {
        match outcome.result {
            Ok(_) => succeeded += 1,
            Err(WorkError::Panicked { detail }) => {
                assert!(detail.contains("worker blew up"));
                panicked += 1;
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(panicked, 1);
    assert_eq!(succeeded, 4);
    stream.finish().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn per_item_timeout_abandons_the_attempt() {
    let exec = ParallelExecutor::new(
        options()
            .per_item_timeout(Duration::from_millis(50))
            .retry_timeouts(false)
            .error_mode(ErrorMode::BestEffort)
            .build()
            .unwrap(),
    );

    let mut stream = exec.map_iter(0u32..3, |x, _ctx| async move {
        if x == 1 {
            // Not cancellation-cooperative; the engine drops it at the deadline.
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok::<_, TestError>(x)
    });

    let mut timed_out = 0;
    while let Some(outcome) = stream.next().await {
        if let Err(error) = &outcome.result {
            assert!(error.is_timeout());
            timed_out += 1;
        }
    }
    assert_eq!(timed_out, 1);
    let summary = stream.finish().await.unwrap();
    assert_eq!(summary.timeouts, 1);
    assert_eq!(summary.completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backpressure_bounds_pulled_but_unemitted_items() {
    let settled = Arc::new(AtomicUsize::new(0));
    let sink = settled.clone();
    let exec = ParallelExecutor::new(
        options()
            .max_concurrency(2)
            .channel_capacity(2)
            .on_complete_item(move |_, _, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap(),
    );

    let mut stream =
        exec.map_iter(0u32..100, |x, _ctx| async move { Ok::<_, TestError>(x) });

    // Do not consume the output yet; the engine must stall on its bounded
    // channels instead of racing ahead.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stalled_at = settled.load(Ordering::SeqCst);
    assert!(
        stalled_at <= 10,
        "expected the engine to stall, but {} items settled",
        stalled_at
    );

    let mut count = 0;
    while stream.next().await.is_some() {
        count += 1;
    }
    assert_eq!(count, 100);
    stream.finish().await.unwrap();
}

#[tokio::test]
async fn ordered_output_survives_uneven_latencies() {
    let exec = ParallelExecutor::new(
        options().max_concurrency(8).ordered(true).build().unwrap(),
    );

    let mut stream = exec.map_iter(0u64..50, |x, _ctx| async move {
        tokio::time::sleep(Duration::from_millis((x * 7) % 13)).await;
        Ok::<_, TestError>(x)
    });

    let mut previous = None;
    while let Some(outcome) = stream.next().await {
        if let Some(prev) = previous {
            assert!(outcome.index > prev, "index {} after {}", outcome.index, prev);
        }
        assert_eq!(outcome.result.unwrap(), outcome.index);
        previous = Some(outcome.index);
    }
    assert_eq!(previous, Some(49));
    stream.finish().await.unwrap();
}

#[tokio::test]
async fn batched_processes_chunks_as_single_items() {
    let exec = ParallelExecutor::new(options().ordered(true).build().unwrap());
    let sums = exec
        .batched(futures::stream::iter(1u64..=10), 4, |chunk, _ctx| async move {
            Ok::<_, TestError>(chunk.iter().sum::<u64>())
        })
        .await
        .unwrap();
    // Chunks are [1..4], [5..8], [9, 10].
    assert_eq!(sums, vec![10, 26, 19]);
}
