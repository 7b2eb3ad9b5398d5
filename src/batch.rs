//! Batched block mutations.
//!
//! Mutations are queued, then applied by a run on the blocking pool. A run sorts what it
//! drained by chunk column and position, applies it in fixed-size chunks, and tells the
//! world which regions changed every `flush_threshold` applied mutations and once at the end.
//! Only one run applies mutations at a time.

use crate::prelude::*;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::BatchConfig;
use crate::world::{MutationSpec, World};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingMutation {
    pub target: BlockPos,
    pub payload: MutationSpec,
}
impl PendingMutation {
    pub fn new(target: BlockPos, payload: MutationSpec) -> Self {
        Self { target, payload }
    }
    fn order_key(&self) -> (RegionKey, i32, i32, i32, MutationSpec) {
        let V3 { x, y, z } = self.target;
        (self.target.region(), y, x, z, self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchRunResult {
    pub total_requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}
impl BatchRunResult {
    fn empty() -> Self {
        Self {
            total_requested: 0,
            succeeded: 0,
            failed: 0,
            elapsed: Duration::ZERO,
        }
    }
    /// Fraction of requested mutations that landed. An empty run counts as a full success.
    pub fn success_rate(&self) -> f64 {
        if self.total_requested == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total_requested as f64
        }
    }
    pub fn is_full_success(&self) -> bool {
        self.failed == 0
    }
    pub fn mutations_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.succeeded as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch run did not finish within {after:?}")]
    TimedOut { after: Duration },
    #[error("batch worker failed: {0}")]
    Worker(String),
}

/// Handle to a spawned run. Dropping it leaves the run going.
#[derive(Debug)]
pub struct BatchRun {
    handle: JoinHandle<Result<BatchRunResult, BatchError>>,
    cancel: CancellationToken,
}
impl BatchRun {
    /// Stops the run at the next chunk boundary. Whatever was not applied yet counts as failed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
    pub async fn wait(self) -> Result<BatchRunResult, BatchError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(BatchError::Worker(e.to_string())),
        }
    }
    /// Waits up to `limit`, cancelling the run if it is still going by then.
    pub async fn wait_for(mut self, limit: Duration) -> Result<BatchRunResult, BatchError> {
        match tokio::time::timeout(limit, &mut self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BatchError::Worker(e.to_string())),
            Err(_) => {
                self.cancel.cancel();
                log::warn!("batch run still going after {limit:?}, cancelling");
                Err(BatchError::TimedOut { after: limit })
            }
        }
    }
}

pub struct BatchEngine {
    world: Arc<dyn World>,
    config: BatchConfig,
    metrics: Arc<dyn Metrics>,
    queue: Mutex<VecDeque<PendingMutation>>,
    run_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl BatchEngine {
    pub fn new(world: Arc<dyn World>, config: BatchConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            world,
            config,
            metrics,
            queue: Mutex::new(VecDeque::new()),
            run_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingMutation>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, mutation: PendingMutation) -> usize {
        let mut queue = self.queue();
        queue.push_back(mutation);
        queue.len()
    }

    pub fn enqueue_many(&self, mutations: impl IntoIterator<Item = PendingMutation>) -> usize {
        let mut queue = self.queue();
        queue.extend(mutations);
        queue.len()
    }

    /// Drops everything queued, returning how many mutations were discarded.
    pub fn clear(&self) -> usize {
        let cleared = std::mem::take(&mut *self.queue()).len();
        if cleared > 0 {
            log::info!("cleared {cleared} queued mutations");
        }
        cleared
    }

    pub fn queue_size(&self) -> usize {
        self.queue().len()
    }

    /// Drains the shared queue and applies it. Waits for any run already in progress first.
    pub fn run_batch(self: &Arc<Self>) -> BatchRun {
        self.spawn_run(None)
    }

    /// Applies `payload` at every position as its own run, leaving the shared queue alone.
    pub fn place_pattern(
        self: &Arc<Self>,
        positions: impl IntoIterator<Item = BlockPos>,
        payload: MutationSpec,
    ) -> BatchRun {
        let mutations = positions
            .into_iter()
            .map(|target| PendingMutation::new(target, payload))
            .collect();
        self.spawn_run(Some(mutations))
    }

    fn spawn_run(self: &Arc<Self>, mutations: Option<Vec<PendingMutation>>) -> BatchRun {
        let cancel = self.shutdown.child_token();
        let engine = Arc::clone(self);
        let token = cancel.clone();
        let handle = self.tasks.spawn(async move {
            let _running = engine.run_lock.lock().await;
            let mutations = match mutations {
                Some(mutations) => mutations,
                None => engine.queue().drain(..).collect(),
            };
            if mutations.is_empty() {
                return Ok(BatchRunResult::empty());
            }
            let worker = Arc::clone(&engine);
            tokio::task::spawn_blocking(move || worker.apply(mutations, &token))
                .await
                .map_err(|e| BatchError::Worker(e.to_string()))
        });
        BatchRun { handle, cancel }
    }

    fn apply(
        &self,
        mut mutations: Vec<PendingMutation>,
        cancel: &CancellationToken,
    ) -> BatchRunResult {
        let started = std::time::Instant::now();
        let total_requested = mutations.len();
        let (mut succeeded, mut failed) = (0, 0);
        let mut affected = BTreeSet::new();
        let mut since_flush = 0;

        mutations.sort_unstable_by_key(PendingMutation::order_key);
        for (i, chunk) in mutations.chunks(self.config.chunk_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                let skipped = total_requested - i * self.config.chunk_size.max(1);
                log::warn!("batch run cancelled with {skipped} mutations unapplied");
                failed += skipped;
                break;
            }
            for mutation in chunk {
                match self.world.apply_mutation(mutation.target, &mutation.payload) {
                    Ok(()) => {
                        succeeded += 1;
                        affected.insert(mutation.target.region());
                        since_flush += 1;
                        if since_flush >= self.config.flush_threshold {
                            self.flush(&mut affected);
                            since_flush = 0;
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        log::warn!("mutation at {} failed: {e}", mutation.target);
                    }
                }
            }
        }
        self.flush(&mut affected);

        let result = BatchRunResult {
            total_requested,
            succeeded,
            failed,
            elapsed: started.elapsed(),
        };
        self.metrics.increment("batch.runs", 1);
        self.metrics.increment("batch.succeeded", succeeded as u64);
        self.metrics.increment("batch.failed", failed as u64);
        log::info!(
            "batch of {total_requested} done in {:?}: {succeeded} applied, {failed} failed \
             ({:.0} blocks/s)",
            result.elapsed,
            result.mutations_per_second()
        );
        result
    }

    fn flush(&self, affected: &mut BTreeSet<RegionKey>) {
        if affected.is_empty() {
            return;
        }
        log::debug!("refreshing {} regions", affected.len());
        for region in std::mem::take(affected) {
            self.world.notify_region_changed(region);
        }
    }

    /// Cancels in-flight runs and waits up to `grace` for them to stop.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            log::warn!("batch runs did not stop within {grace:?}");
        }
        let dropped = self.queue_size();
        if dropped > 0 {
            log::warn!("{dropped} queued mutations dropped at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Counters;
    use crate::world::WorldError;

    #[derive(Default)]
    struct Recording {
        applied: Mutex<Vec<BlockPos>>,
        notified: Mutex<Vec<RegionKey>>,
        reject_x: Option<i32>,
    }
    impl World for Recording {
        fn apply_mutation(&self, target: BlockPos, _: &MutationSpec) -> Result<(), WorldError> {
            if Some(target.x) == self.reject_x {
                return Err(WorldError::Rejected {
                    pos: target,
                    reason: "protected".into(),
                });
            }
            self.applied.lock().unwrap().push(target);
            Ok(())
        }
        fn notify_region_changed(&self, region: RegionKey) {
            self.notified.lock().unwrap().push(region);
        }
        fn block_at(&self, _: BlockPos) -> Result<Block, WorldError> {
            Ok(Block::AIR)
        }
    }

    fn engine(world: Arc<Recording>, config: BatchConfig) -> (Arc<BatchEngine>, Arc<Counters>) {
        let metrics = Arc::new(Counters::new());
        (Arc::new(BatchEngine::new(world, config, metrics.clone())), metrics)
    }

    fn set(x: i32, y: i32, z: i32) -> PendingMutation {
        PendingMutation::new(V3(x, y, z), MutationSpec::Set(Block::STONE))
    }

    #[tokio::test]
    async fn empty_queue_finishes_immediately() {
        let (engine, _) = engine(Arc::default(), BatchConfig::default());
        let result = engine.run_batch().wait().await.unwrap();
        assert_eq!(result.total_requested, 0);
        assert_eq!(result.succeeded + result.failed, 0);
        assert!(result.is_full_success());
        assert_eq!(result.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn applies_in_region_then_height_order() {
        let world = Arc::new(Recording::default());
        let (engine, metrics) = engine(world.clone(), BatchConfig::default());
        engine.enqueue_many([
            set(17, 5, 0),
            set(3, 9, 0),
            set(2, 9, 0),
            set(-1, 0, 0),
            set(3, 1, 0),
        ]);
        assert_eq!(engine.queue_size(), 5);

        let result = engine.run_batch().wait().await.unwrap();
        assert_eq!(result.succeeded, 5);
        assert_eq!(engine.queue_size(), 0);
        assert_eq!(
            *world.applied.lock().unwrap(),
            vec![V3(-1, 0, 0), V3(3, 1, 0), V3(2, 9, 0), V3(3, 9, 0), V3(17, 5, 0)]
        );
        assert_eq!(metrics.get("batch.succeeded"), 5);
        assert_eq!(metrics.get("batch.runs"), 1);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let world = Arc::new(Recording {
            reject_x: Some(4),
            ..Recording::default()
        });
        let (engine, metrics) = engine(world.clone(), BatchConfig::default());
        let positions = (0..10).map(|x| V3(x, 64, 0));
        let result = engine
            .place_pattern(positions, MutationSpec::Set(Block::GLASS))
            .wait()
            .await
            .unwrap();
        assert_eq!(result.total_requested, 10);
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 9);
        assert!(!result.is_full_success());
        assert!((result.success_rate() - 0.9).abs() < 1e-9);
        assert_eq!(metrics.get("batch.failed"), 1);
    }

    #[tokio::test]
    async fn regions_flush_at_threshold_and_at_end() {
        let world = Arc::new(Recording::default());
        let config = BatchConfig {
            chunk_size: 2,
            flush_threshold: 3,
            ..BatchConfig::default()
        };
        let (engine, _) = engine(world.clone(), config);
        engine.enqueue_many((0..4).map(|y| set(0, y, 0)));
        engine.enqueue(set(32, 0, 0));
        engine.run_batch().wait().await.unwrap();
        let region = V3(0, 0, 0).region();
        assert_eq!(
            *world.notified.lock().unwrap(),
            vec![region, region, V3(32, 0, 0).region()]
        );
    }

    #[tokio::test]
    async fn pattern_runs_leave_the_queue_alone() {
        let world = Arc::new(Recording::default());
        let (engine, _) = engine(world.clone(), BatchConfig::default());
        engine.enqueue(set(1, 1, 1));
        engine
            .place_pattern([V3(5, 5, 5)], MutationSpec::Clear)
            .wait()
            .await
            .unwrap();
        assert_eq!(engine.queue_size(), 1);
        assert_eq!(engine.clear(), 1);
        assert_eq!(engine.queue_size(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_counts_the_rest_as_failed() {
        let world = Arc::new(Recording::default());
        let (engine, _) = engine(world.clone(), BatchConfig::default());
        engine.enqueue_many((0..5).map(|x| set(x, 0, 0)));

        let held = engine.run_lock.lock().await;
        let run = engine.run_batch();
        run.cancel();
        drop(held);

        let result = run.wait().await.unwrap();
        assert_eq!(result.total_requested, 5);
        assert_eq!(result.failed, 5);
        assert_eq!(result.succeeded, 0);
        assert!(world.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_run_drains_what_is_left() {
        let world = Arc::new(Recording::default());
        let (engine, _) = engine(world.clone(), BatchConfig::default());
        engine.enqueue_many((0..3).map(|x| set(x, 0, 0)));
        let first = engine.run_batch();
        let second = engine.run_batch();
        let (first, second) = (first.wait().await.unwrap(), second.wait().await.unwrap());
        assert_eq!(first.total_requested + second.total_requested, 3);
        assert_eq!(world.applied.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_runs() {
        let world = Arc::new(Recording::default());
        let (engine, _) = engine(world.clone(), BatchConfig::default());
        engine.enqueue(set(0, 0, 0));
        let held = engine.run_lock.lock().await;
        let run = engine.run_batch();
        drop(held);
        engine.shutdown(Duration::from_secs(1)).await;
        let result = run.wait().await.unwrap();
        assert_eq!(result.failed, 1);
    }
}
