//! In-process metrics.
//!
//! Counters and per-operation timings are plain atomics grouped in a
//! [`MetricsRegistry`]. A [`MetricsSnapshot`] serializes the whole registry
//! so it can be logged or exposed by the host process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Value that can go up and down.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Call count, error count, item count and latency of one operation.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    calls: Counter,
    errors: Counter,
    items: Counter,
    total_micros: Counter,
    max_micros: AtomicU64,
}

impl OperationMetrics {
    /// Record one completed call.
    ///
    /// `items` is the number of records the call touched (for example the
    /// number of rows reset); single-record calls pass 1.
    pub fn observe(&self, elapsed: Duration, items: u64, failed: bool) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.calls.inc();
        self.items.add(items);
        self.total_micros.add(micros);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        if failed {
            self.errors.inc();
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.get()
    }

    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    pub fn items(&self) -> u64 {
        self.items.get()
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let calls = self.calls.get();
        let total = self.total_micros.get();
        OperationSnapshot {
            calls,
            errors: self.errors.get(),
            items: self.items.get(),
            mean_micros: if calls == 0 { 0 } else { total / calls },
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationSnapshot {
    pub calls: u64,
    pub errors: u64,
    pub items: u64,
    pub mean_micros: u64,
    pub max_micros: u64,
}

/// Named metrics, created on first use and shared by `Arc`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    operations: RwLock<BTreeMap<String, Arc<OperationMetrics>>>,
    counters: RwLock<BTreeMap<String, Arc<Counter>>>,
    gauges: RwLock<BTreeMap<String, Arc<Gauge>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(&self, name: &str) -> Arc<OperationMetrics> {
        get_or_insert(&self.operations, name)
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        get_or_insert(&self.counters, name)
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        get_or_insert(&self.gauges, name)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: read(&self.operations)
                .iter()
                .map(|(name, op)| (name.clone(), op.snapshot()))
                .collect(),
            counters: read(&self.counters)
                .iter()
                .map(|(name, c)| (name.clone(), c.get()))
                .collect(),
            gauges: read(&self.gauges)
                .iter()
                .map(|(name, g)| (name.clone(), g.get()))
                .collect(),
        }
    }
}

/// Point-in-time copy of every registered metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationSnapshot>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn get_or_insert<T: Default>(map: &RwLock<BTreeMap<String, Arc<T>>>, name: &str) -> Arc<T> {
    if let Some(existing) = read(map).get(name) {
        return existing.clone();
    }
    map.write()
        .unwrap_or_else(|e| e.into_inner())
        .entry(name.to_string())
        .or_default()
        .clone()
}
