use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Sink for operational counters. The core calls into it but never owns where the numbers go.
pub trait Metrics: Send + Sync {
    fn increment(&self, name: &str, by: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;
impl Metrics for NoopMetrics {
    fn increment(&self, _name: &str, _by: u64) {}
}

/// In-process counters, readable back for status replies and tests.
#[derive(Debug, Default)]
pub struct Counters {
    counters: DashMap<String, AtomicU64>,
}
impl Counters {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}
impl Metrics for Counters {
    fn increment(&self, name: &str, by: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(by, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_owned())
            .or_default()
            .fetch_add(by, Ordering::Relaxed);
    }
}
