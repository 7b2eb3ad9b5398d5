use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use blockgate::config::ResilienceConfig;
use blockgate::metrics::Counters;
use blockgate::resilience::{CircuitState, ExecutionError, ResilientExecutor};

fn executor() -> (ResilientExecutor, Arc<Counters>) {
    let metrics = Arc::new(Counters::new());
    (ResilientExecutor::new(ResilienceConfig::default(), metrics.clone()), metrics)
}

async fn fail(name: &'static str) -> Result<(), String> {
    Err(format!("{name} unavailable"))
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_then_probes_after_the_reset_timeout() {
    let (executor, metrics) = executor();
    executor.configure_breaker("world.setBlock", 3, Duration::from_secs(60));

    for _ in 0..3 {
        let result = executor.execute("world.setBlock", || fail("world")).await;
        assert!(matches!(result, Err(ExecutionError::Underlying { .. })));
    }
    assert_eq!(executor.state("world.setBlock"), Some(CircuitState::Open));

    let calls = AtomicU32::new(0);
    let rejected = executor
        .execute("world.setBlock", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        })
        .await;
    assert!(matches!(rejected, Err(ExecutionError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "an open breaker must not invoke the operation");
    assert_eq!(executor.open_count(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let probed = executor
        .execute("world.setBlock", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(7) }
        })
        .await;
    assert_eq!(probed.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.state("world.setBlock"), Some(CircuitState::Closed));
    assert_eq!(metrics.get("breaker.rejected"), 1);
    assert_eq!(metrics.get("breaker.half_open"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_the_breaker() {
    let (executor, _) = executor();
    executor.configure_breaker("world.getBlock", 1, Duration::from_secs(5));
    assert!(executor.execute("world.getBlock", || fail("world")).await.is_err());
    assert_eq!(executor.state("world.getBlock"), Some(CircuitState::Open));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(matches!(
        executor.execute("world.getBlock", || fail("world")).await,
        Err(ExecutionError::Underlying { .. })
    ));
    assert_eq!(executor.state("world.getBlock"), Some(CircuitState::Open));
    assert!(matches!(
        executor.execute("world.getBlock", || fail("world")).await,
        Err(ExecutionError::CircuitOpen { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn breakers_are_independent_per_name() {
    let (executor, _) = executor();
    executor.configure_breaker("a", 1, Duration::from_secs(60));
    assert!(executor.execute("a", || fail("a")).await.is_err());
    assert_eq!(executor.state("a"), Some(CircuitState::Open));
    assert!(executor.execute("b", || async { Ok::<_, String>(()) }).await.is_ok());
    assert_eq!(executor.state("b"), Some(CircuitState::Closed));

    executor.reset_all();
    assert_eq!(executor.open_count(), 0);
    let names: Vec<_> = executor.statuses().into_iter().map(|s| s.name).collect();
    assert_eq!(names, ["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_on_the_third_attempt_with_linear_backoff() {
    let (executor, metrics) = executor();
    let calls = AtomicU32::new(0);
    let started = Instant::now();
    let result = executor
        .execute_with_retry(
            "world.getBlock",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("attempt {n} failed"))
                    } else {
                        Ok("stone")
                    }
                }
            },
            3,
            Duration::from_millis(10),
        )
        .await;
    assert_eq!(result.unwrap(), "stone");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 10ms before the second attempt, 20ms before the third
    assert_eq!(started.elapsed(), Duration::from_millis(30));
    assert_eq!(metrics.get("retry.attempt"), 2);
    assert_eq!(metrics.get("retry.exhausted"), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_returns_the_last_error_when_exhausted() {
    let (executor, metrics) = executor();
    let calls = AtomicU32::new(0);
    let result = executor
        .execute_with_retry(
            "flaky",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err::<(), _>(format!("failure {n}")) }
            },
            2,
            Duration::from_millis(10),
        )
        .await;
    let err = result.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.root_source().unwrap().to_string(), "failure 3");
    assert_eq!(metrics.get("retry.exhausted"), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_operations_time_out_and_are_abandoned() {
    let (executor, metrics) = executor();
    let finished = Arc::new(AtomicU32::new(0));
    let started = Instant::now();
    let result = executor
        .execute_with_timeout(
            "slow",
            {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
            Duration::from_millis(100),
        )
        .await;
    assert!(matches!(
        result,
        Err(ExecutionError::Timeout { after, .. }) if after == Duration::from_millis(100)
    ));
    assert_eq!(started.elapsed(), Duration::from_millis(100));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0, "the timed out task was not aborted");
    assert_eq!(metrics.get("timeout"), 1);
}

#[tokio::test(start_paused = true)]
async fn timeouts_count_against_the_breaker() {
    let (executor, _) = executor();
    executor.configure_breaker("world.setBlock", 2, Duration::from_secs(60));
    for _ in 0..2 {
        let err = executor
            .execute("world.setBlock", || {
                executor.execute_with_timeout(
                    "world.setBlock",
                    async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, String>(())
                    },
                    Duration::from_millis(50),
                )
            })
            .await
            .unwrap_err();
        assert!(matches!(err.innermost(), ExecutionError::Timeout { .. }));
    }
    assert_eq!(executor.state("world.setBlock"), Some(CircuitState::Open));
}
