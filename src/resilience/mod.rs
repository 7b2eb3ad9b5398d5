//! Resilient execution: circuit breaking, retry with linear backoff, timeouts, and
//! per-operation recovery hooks around caller-supplied async operations.
//!
//! Breakers are keyed by operation name, created on first use from the configured
//! defaults (or a per-name override), and live as long as the executor.

use crate::prelude::*;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceConfig;

mod breaker;
mod error;

pub use breaker::{CircuitBreaker, CircuitState};
pub use error::{BoxError, ExecutionError, ExecutionResult};
use breaker::Admit;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type Recovery = Arc<dyn Fn(String) -> BoxFuture<Result<(), BoxError>> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

pub struct ResilientExecutor {
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
    recoveries: DashMap<String, Recovery>,
    metrics: Arc<dyn Metrics>,
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    // the state machine never panics mid-transition, so a poisoned lock still holds valid state
    breaker.lock().unwrap_or_else(|e| e.into_inner())
}

/// Admission through a breaker. Dropping it unsettled gives up a half-open probe slot.
struct Permit<'a> {
    executor: &'a ResilientExecutor,
    name: &'a str,
    breaker: Arc<Mutex<CircuitBreaker>>,
    probe: bool,
    settled: bool,
}
impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        if lock(&self.breaker).on_success(self.probe) {
            log::info!("circuit breaker for {} closed", self.name);
            self.executor.metrics.increment("breaker.closed", 1);
        }
    }
    fn fail(mut self) {
        self.settled = true;
        let mut breaker = lock(&self.breaker);
        if breaker.on_failure(self.probe, Instant::now()) {
            let failures = breaker.consecutive_failures();
            drop(breaker);
            log::warn!(
                "circuit breaker for {} opened after {failures} consecutive failures",
                self.name
            );
            self.executor.metrics.increment("breaker.opened", 1);
        }
    }
}
impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            lock(&self.breaker).release_probe();
        }
    }
}

impl ResilientExecutor {
    pub fn new(config: ResilienceConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            recoveries: DashMap::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    fn breaker(&self, name: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }
        let entry = self.breakers.entry(name.to_owned()).or_insert_with(|| {
            let overrides = self.config.breakers.get(name);
            let threshold = overrides
                .and_then(|o| o.failure_threshold)
                .unwrap_or(self.config.failure_threshold);
            let reset = overrides
                .and_then(|o| o.reset_timeout_ms)
                .map_or(self.config.reset_timeout(), Duration::from_millis);
            log::debug!("new circuit breaker for {name} (threshold {threshold}, reset {reset:?})");
            Arc::new(Mutex::new(CircuitBreaker::new(threshold, reset)))
        });
        Arc::clone(entry.value())
    }

    pub fn configure_breaker(&self, name: &str, failure_threshold: u32, reset_timeout: Duration) {
        lock(&self.breaker(name)).configure(failure_threshold, reset_timeout);
    }

    /// Registers an action run after `name` fails. If it succeeds, the operation is tried
    /// once more.
    pub fn register_recovery<F, Fut>(&self, name: &str, recovery: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let recovery: Recovery = Arc::new(move |name: String| -> BoxFuture<Result<(), BoxError>> {
            Box::pin(recovery(name))
        });
        self.recoveries.insert(name.to_owned(), recovery);
    }

    fn admit<'a>(&'a self, name: &'a str) -> ExecutionResult<Permit<'a>> {
        let breaker = self.breaker(name);
        let admitted = {
            let mut state = lock(&breaker);
            let before = state.state();
            let admitted = state.try_acquire(Instant::now());
            if admitted == Admit::Probe && before == CircuitState::Open {
                log::info!("circuit breaker for {name} half-open, letting a probe through");
                self.metrics.increment("breaker.half_open", 1);
            }
            admitted
        };
        match admitted {
            Admit::Reject => {
                log::debug!("rejecting {name}: circuit open");
                self.metrics.increment("breaker.rejected", 1);
                Err(ExecutionError::CircuitOpen {
                    operation: name.to_owned(),
                })
            }
            admitted => Ok(Permit {
                executor: self,
                name,
                breaker,
                probe: admitted == Admit::Probe,
                settled: false,
            }),
        }
    }

    async fn attempt<T, E, F, Fut>(&self, name: &str, op: &mut F) -> ExecutionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let permit = self.admit(name)?;
        match op().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                permit.fail();
                Err(ExecutionError::Underlying {
                    operation: name.to_owned(),
                    source: e.into(),
                })
            }
        }
    }

    /// Runs `op` through the breaker for `name`.
    ///
    /// An underlying failure triggers the registered recovery (if any). When recovery
    /// succeeds the operation is invoked once more, bypassing the breaker even if that
    /// first failure opened it. A success then closes the breaker; a failure returns the
    /// original error.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, mut op: F) -> ExecutionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let result = self.attempt(name, &mut op).await;
        let Err(ExecutionError::Underlying { source, .. }) = &result else {
            return result;
        };
        let Some(recovery) = self.recoveries.get(name).map(|r| Arc::clone(r.value())) else {
            return result;
        };
        log::info!("attempting recovery for {name} after: {source}");
        match recovery(name.to_owned()).await {
            Ok(()) => {
                self.metrics.increment("recovery.success", 1);
                log::info!("recovery for {name} succeeded, retrying");
                match op().await {
                    Ok(value) => {
                        if lock(&self.breaker(name)).on_recovered() {
                            log::info!("circuit breaker for {name} closed after recovery");
                            self.metrics.increment("breaker.closed", 1);
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        let e: BoxError = e.into();
                        log::warn!("{name} failed again after recovery: {e}");
                        result
                    }
                }
            }
            Err(e) => {
                self.metrics.increment("recovery.failed", 1);
                log::warn!("recovery for {name} failed: {e}");
                result
            }
        }
    }

    /// Up to `1 + max_retries` calls of [`execute`](Self::execute), sleeping `base_delay * n`
    /// before retry `n`. Returns the first success or the last error.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        name: &str,
        mut op: F,
        max_retries: u32,
        base_delay: Duration,
    ) -> ExecutionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut result = self.execute(name, &mut op).await;
        for attempt in 1..=max_retries {
            let Err(e) = &result else { break };
            log::warn!("{name} failed (attempt {attempt}/{}): {e}", max_retries + 1);
            self.metrics.increment("retry.attempt", 1);
            tokio::time::sleep(base_delay * attempt).await;
            result = self.execute(name, &mut op).await;
        }
        if let Err(e) = &result {
            self.metrics.increment("retry.exhausted", 1);
            log::warn!("{name} failed after {} attempts: {e}", max_retries + 1);
        }
        result
    }

    /// Runs `op` as its own task and aborts it if it outlives `limit`.
    /// Does not consult the breaker; wrap it in [`execute`](Self::execute) for that.
    pub async fn execute_with_timeout<T, E, Fut>(
        &self,
        name: &str,
        op: Fut,
        limit: Duration,
    ) -> ExecutionResult<T>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut task = tokio::spawn(op);
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(ExecutionError::Underlying {
                operation: name.to_owned(),
                source: e.into(),
            }),
            Ok(Err(join)) => Err(ExecutionError::Underlying {
                operation: name.to_owned(),
                source: Box::new(join),
            }),
            Err(_) => {
                task.abort();
                self.metrics.increment("timeout", 1);
                log::warn!("{name} timed out after {limit:?}");
                Err(ExecutionError::Timeout {
                    operation: name.to_owned(),
                    after: limit,
                })
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.breakers.get(name).map(|b| lock(b.value()).state())
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| {
                let breaker = lock(entry.value());
                BreakerStatus {
                    name: entry.key().clone(),
                    state: breaker.state(),
                    consecutive_failures: breaker.consecutive_failures(),
                    failure_threshold: breaker.failure_threshold(),
                    reset_timeout_ms: breaker.reset_timeout().as_millis() as u64,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| lock(entry.value()).state() != CircuitState::Closed)
            .count()
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            lock(entry.value()).reset();
        }
        log::info!("all circuit breakers reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Counters;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(threshold: u32) -> (ResilientExecutor, Arc<Counters>) {
        let metrics = Arc::new(Counters::new());
        let config = ResilienceConfig {
            failure_threshold: threshold,
            ..ResilienceConfig::default()
        };
        (ResilientExecutor::new(config, metrics.clone()), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_runs_then_retries_once() {
        let (executor, metrics) = executor(5);
        let recovered = Arc::new(AtomicU32::new(0));
        let hook = recovered.clone();
        executor.register_recovery("flaky", move |_| {
            let hook = hook.clone();
            async move {
                hook.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let calls = AtomicU32::new(0);
        let result = executor
            .execute("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("first call fails")
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.get("recovery.success"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_retries_even_when_the_failure_opened_the_breaker() {
        let (executor, metrics) = executor(1);
        executor.register_recovery("op", |_| async { Ok(()) });
        let calls = AtomicU32::new(0);
        let result = executor
            .execute("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("first call fails")
                    } else {
                        Ok(1)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.state("op"), Some(CircuitState::Closed));
        assert_eq!(metrics.get("breaker.opened"), 1);
        assert_eq!(metrics.get("breaker.closed"), 1);

        // a second failure after recovery reports the first cause and leaves the circuit open
        let calls = AtomicU32::new(0);
        let result: ExecutionResult<()> = executor
            .execute("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(if n == 0 { "first" } else { "second" }) }
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(
            &err,
            ExecutionError::Underlying { source, .. } if source.to_string() == "first"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.state("op"), Some(CircuitState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_keeps_the_original_error() {
        let (executor, metrics) = executor(5);
        executor.register_recovery("broken", |_| async { Err::<(), BoxError>("no luck".into()) });
        let calls = AtomicU32::new(0);
        let result: ExecutionResult<()> = executor
            .execute("broken", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(
            &err,
            ExecutionError::Underlying { source, .. } if source.to_string() == "boom"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.get("recovery.failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overrides_and_reconfiguration_apply_per_name() {
        let metrics = Arc::new(Counters::new());
        let mut config = ResilienceConfig::default();
        config.breakers.insert(
            "fragile".into(),
            crate::config::BreakerOverride {
                failure_threshold: Some(1),
                reset_timeout_ms: None,
            },
        );
        let executor = ResilientExecutor::new(config, metrics);
        let _ = executor.execute("fragile", || async { Err::<(), _>("x") }).await;
        assert_eq!(executor.state("fragile"), Some(CircuitState::Open));

        executor.configure_breaker("sturdy", 2, Duration::from_secs(1));
        let _ = executor.execute("sturdy", || async { Err::<(), _>("x") }).await;
        assert_eq!(executor.state("sturdy"), Some(CircuitState::Closed));
        let _ = executor.execute("sturdy", || async { Err::<(), _>("x") }).await;
        assert_eq!(executor.state("sturdy"), Some(CircuitState::Open));

        let statuses = executor.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].name, "fragile");
        assert_eq!(statuses[1].failure_threshold, 2);
        assert_eq!(executor.open_count(), 2);
        executor.reset_all();
        assert_eq!(executor.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_probe_lets_the_next_caller_probe() {
        let (executor, _) = executor(1);
        let _ = executor.execute("slow", || async { Err::<(), _>("x") }).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let probe = executor.execute("slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, BoxError>(())
        });
        // give up on the probe before it finishes
        assert!(tokio::time::timeout(Duration::from_secs(1), probe).await.is_err());
        assert_eq!(executor.state("slow"), Some(CircuitState::HalfOpen));

        let result = executor.execute("slow", || async { Ok::<_, BoxError>(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(executor.state("slow"), Some(CircuitState::Closed));
    }
}
