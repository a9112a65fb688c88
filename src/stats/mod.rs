//! Metrics core: per-action latency distributions, success/failure counters,
//! active-user gauges, and the periodic snapshot pipeline feeding dashboards
//! and the final report.

pub mod csv;
pub mod html;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ActionError;

/// Point-in-time per-action metrics record. Field names are stable for JSON
/// transport to SSE/REST consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetricsSnapshot {
    pub action_name: String,
    pub active_count: usize,
    pub max_size: usize,
    pub waiting_count: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub average_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub requests_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

/// Mean, percentiles, and max for one action's latency distribution, in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

pub type SnapshotListener = Box<dyn Fn(&[PoolMetricsSnapshot]) + Send + Sync>;

/// Recording and snapshotting surface consumed by the runtime. Substitute a
/// custom implementation through `LoadTest::builder().metrics_collector(..)`.
///
/// All recording operations must be O(1) and safe to call from any thread.
pub trait MetricsCollector: Send + Sync {
    /// Observe a successful execution.
    fn record_success(&self, action_name: &str, duration: Duration);

    /// Observe a failed execution. The duration is still recorded.
    fn record_failure(&self, action_name: &str, duration: Duration, error: &ActionError);

    /// Latest-wins gauge of users currently active in an action's pool.
    fn record_active_users(&self, action_name: &str, count: usize);

    /// Produce one snapshot per action observed so far. Empty if nothing has
    /// been recorded.
    fn snapshot(&self) -> Vec<PoolMetricsSnapshot>;

    /// Register a sink that receives every periodic snapshot list, in order
    /// of production.
    fn on_snapshot(&self, listener: SnapshotListener);

    /// Begin periodic collection: one snapshot every `interval`, starting one
    /// `interval` after this call.
    fn start(&self, interval: Duration);

    /// End periodic collection. Idempotent; safe before any `start`.
    fn stop(&self);

    /// Every snapshot taken by the periodic collector, oldest first.
    fn historical_snapshots(&self) -> Vec<PoolMetricsSnapshot>;
}

struct ActionRecorder {
    histogram: Mutex<Histogram<u64>>,
    total_micros: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    active: AtomicUsize,
}

impl ActionRecorder {
    fn new() -> Self {
        ActionRecorder {
            histogram: Mutex::new(
                Histogram::<u64>::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2).unwrap(),
            ),
            total_micros: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let micros = (duration.as_micros() as u64).max(1);
        let _ = self.histogram.lock().record(micros);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Clone)]
struct CollectorCore {
    actions: Arc<RwLock<HashMap<String, Arc<ActionRecorder>>>>,
    listeners: Arc<RwLock<Vec<SnapshotListener>>>,
    history: Arc<RwLock<Vec<PoolMetricsSnapshot>>>,
}

impl CollectorCore {
    fn recorder(&self, action_name: &str) -> Arc<ActionRecorder> {
        if let Some(recorder) = self.actions.read().get(action_name) {
            return recorder.clone();
        }
        self.actions
            .write()
            .entry(action_name.to_string())
            .or_insert_with(|| Arc::new(ActionRecorder::new()))
            .clone()
    }

    fn snapshot(&self) -> Vec<PoolMetricsSnapshot> {
        let now = Utc::now();
        let actions = self.actions.read();
        let mut names: Vec<&String> = actions.keys().collect();
        names.sort();

        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            let recorder = &actions[name];
            let histogram = recorder.histogram.lock();
            let count = histogram.len();
            let avg_ms = if count > 0 { histogram.mean() / 1000.0 } else { 0.0 };
            let p99_ms = histogram.value_at_quantile(0.99) as f64 / 1000.0;
            drop(histogram);

            let total_seconds = recorder.total_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let rps = if count > 0 {
                count as f64 / total_seconds.max(1.0)
            } else {
                0.0
            };

            snapshots.push(PoolMetricsSnapshot {
                action_name: name.clone(),
                active_count: recorder.active.load(Ordering::Relaxed),
                max_size: 0,
                waiting_count: 0,
                completed_count: recorder.success.load(Ordering::Relaxed),
                failed_count: recorder.failure.load(Ordering::Relaxed),
                average_response_time_ms: avg_ms,
                p99_response_time_ms: p99_ms,
                requests_per_second: rps,
                timestamp: now,
            });
        }
        snapshots
    }

    /// Take one snapshot, append it to history, and fan it out. One cycle's
    /// dispatches complete before the next begins, and a panicking subscriber
    /// cannot block the others.
    fn collect(&self) {
        let snapshots = self.snapshot();
        self.history.write().extend_from_slice(&snapshots);
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshots))).is_err() {
                warn!("snapshot subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}

/// Default [`MetricsCollector`] backed by HDR histograms and atomic counters.
pub struct HistogramMetricsCollector {
    core: CollectorCore,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HistogramMetricsCollector {
    pub fn new() -> Self {
        HistogramMetricsCollector {
            core: CollectorCore {
                actions: Arc::new(RwLock::new(HashMap::new())),
                listeners: Arc::new(RwLock::new(Vec::new())),
                history: Arc::new(RwLock::new(Vec::new())),
            },
            ticker: Mutex::new(None),
        }
    }

    /// Latency summary for one action, if it has been observed.
    pub fn latency_summary(&self, action_name: &str) -> Option<LatencySummary> {
        let actions = self.core.actions.read();
        let recorder = actions.get(action_name)?;
        let histogram = recorder.histogram.lock();
        if histogram.len() == 0 {
            return None;
        }
        Some(LatencySummary {
            mean_ms: histogram.mean() / 1000.0,
            p50_ms: histogram.value_at_quantile(0.50) as f64 / 1000.0,
            p75_ms: histogram.value_at_quantile(0.75) as f64 / 1000.0,
            p95_ms: histogram.value_at_quantile(0.95) as f64 / 1000.0,
            p99_ms: histogram.value_at_quantile(0.99) as f64 / 1000.0,
            max_ms: histogram.max() as f64 / 1000.0,
        })
    }

    pub fn success_count(&self, action_name: &str) -> u64 {
        self.core
            .actions
            .read()
            .get(action_name)
            .map(|r| r.success.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn failure_count(&self, action_name: &str) -> u64 {
        self.core
            .actions
            .read()
            .get(action_name)
            .map(|r| r.failure.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for HistogramMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector for HistogramMetricsCollector {
    fn record_success(&self, action_name: &str, duration: Duration) {
        let recorder = self.core.recorder(action_name);
        recorder.observe(duration);
        recorder.success.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, action_name: &str, duration: Duration, _error: &ActionError) {
        let recorder = self.core.recorder(action_name);
        recorder.observe(duration);
        recorder.failure.fetch_add(1, Ordering::Relaxed);
    }

    fn record_active_users(&self, action_name: &str, count: usize) {
        self.core
            .recorder(action_name)
            .active
            .store(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<PoolMetricsSnapshot> {
        self.core.snapshot()
    }

    fn on_snapshot(&self, listener: SnapshotListener) {
        self.core.listeners.write().push(listener);
    }

    fn start(&self, interval: Duration) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let core = self.core.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tick.tick().await;
                core.collect();
            }
        }));
        debug!("metrics collection started with interval {:?}", interval);
    }

    fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
            debug!("metrics collection stopped");
        }
    }

    fn historical_snapshots(&self) -> Vec<PoolMetricsSnapshot> {
        self.core.history.read().clone()
    }
}
