//! Fixed-window admission control keyed by client identity.
//!
//! Windows live in a sharded map, so identities on different shards never
//! contend and a single identity is always updated under its entry lock.

use crate::prelude::*;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AdmissionConfig;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}
impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_seen: now,
        }
    }
}

pub struct AdmissionController {
    config: AdmissionConfig,
    windows: DashMap<String, RateWindow>,
    metrics: Arc<dyn Metrics>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, metrics: Arc<dyn Metrics>) -> Self {
        log::info!(
            "admission control: {} requests per {:?} per client",
            config.limit,
            config.window()
        );
        Self {
            config,
            windows: DashMap::new(),
            metrics,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn allow(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut window = match self.windows.get_mut(identity) {
            Some(window) => window,
            None => self
                .windows
                .entry(identity.to_owned())
                .or_insert_with(|| RateWindow::new(now)),
        };
        if now.duration_since(window.window_start) >= self.config.window() {
            window.count = 0;
            window.window_start = now;
        }
        window.last_seen = now;
        if window.count >= self.config.limit {
            drop(window);
            log::warn!(
                "rate limit exceeded for {identity} ({}+ requests per {:?})",
                self.config.limit,
                self.config.window()
            );
            self.metrics.increment("admission.rejected", 1);
            return false;
        }
        window.count += 1;
        drop(window);
        self.metrics.increment("admission.allowed", 1);
        true
    }

    /// Requests admitted in the identity's current window. Reading never resets anything.
    pub fn current_count(&self, identity: &str) -> u32 {
        let Some(window) = self.windows.get(identity) else {
            return 0;
        };
        if Instant::now().duration_since(window.window_start) >= self.config.window() {
            0
        } else {
            window.count
        }
    }

    pub fn reset(&self, identity: &str) {
        if let Some(mut window) = self.windows.get_mut(identity) {
            let now = Instant::now();
            window.count = 0;
            window.window_start = now;
            log::info!("rate window reset for {identity}");
        }
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Drops identities idle for longer than the eviction threshold. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_eviction();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.duration_since(window.last_seen) <= idle);
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            log::debug!("evicted {evicted} idle rate windows");
        }
        evicted
    }

    /// Starts the periodic idle sweep. Calling it again while a sweep task is alive is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let controller = Arc::clone(self);
        let period = self.config.sweep_interval();
        let cancel = self.shutdown.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        controller.sweep();
                    }
                }
            }
            log::debug!("admission sweep stopped");
        }));
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let task = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if tokio::time::timeout(grace, task).await.is_err() {
                log::warn!("admission sweep did not stop within {grace:?}");
            }
        }
    }
}
