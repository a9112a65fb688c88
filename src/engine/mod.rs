//! The runtime engine: ramps virtual users to the configured target, keeps
//! every user looping through the action chain under steady load, and drives
//! the stop/completion lifecycle.
//!
//! Users are not parked on a worker for the whole chain; each completed step
//! re-dispatches the user to the next action's pool, so one slow pool never
//! starves another.

pub mod result;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::action::ActionChain;
use crate::config::RuntimeConfig;
use crate::engine::result::{build_result, TestResult};
use crate::error::RuntimeError;
use crate::pool::manager::PoolManager;
use crate::session::Session;
use crate::stats::{MetricsCollector, PoolMetricsSnapshot};

const RAMP_TICK: Duration = Duration::from_millis(200);
const GAUGE_INITIAL_DELAY: Duration = Duration::from_millis(500);
const GAUGE_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of a run. `Stopping` is reachable from both ramp-up and steady
/// state; `Failed` is terminal and only entered on unrecoverable engine
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TestState {
    RampingUp = 0,
    Running = 1,
    Stopping = 2,
    Completed = 3,
    Failed = 4,
}

impl TestState {
    fn from_u8(value: u8) -> TestState {
        match value {
            0 => TestState::RampingUp,
            1 => TestState::Running,
            2 => TestState::Stopping,
            3 => TestState::Completed,
            _ => TestState::Failed,
        }
    }
}

/// Handle to a running load test: monitor progress, stop it, await the
/// result. Cloning shares the same run.
#[derive(Clone)]
pub struct LoadTestRuntime {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for LoadTestRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTestRuntime").finish_non_exhaustive()
    }
}

struct EngineInner {
    config: RuntimeConfig,
    chain: ActionChain,
    pools: PoolManager,
    metrics: Arc<dyn MetricsCollector>,
    state: AtomicU8,
    active_users: AtomicUsize,
    spawned_users: AtomicUsize,
    all_snapshots: Arc<RwLock<Vec<PoolMetricsSnapshot>>>,
    started_at: Instant,
    start_wall: chrono::DateTime<Utc>,
    result_tx: watch::Sender<Option<Result<TestResult, RuntimeError>>>,
}

impl LoadTestRuntime {
    /// Start executing the load test. Must be called from within a
    /// multi-threaded tokio runtime; the engine's periodic tasks and pools
    /// run on it.
    pub fn start(
        config: RuntimeConfig,
        chain: ActionChain,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<LoadTestRuntime, RuntimeError> {
        let pools = PoolManager::initialize(&chain, &config)?;
        let (result_tx, _) = watch::channel(None);

        info!(
            "starting load test: {} users, ramp-up: {:?}, duration: {:?}, actions: {}",
            config.number_of_users(),
            config.ramp_up_time(),
            config.test_duration(),
            chain.len()
        );

        let inner = Arc::new(EngineInner {
            config,
            chain,
            pools,
            metrics,
            state: AtomicU8::new(TestState::RampingUp as u8),
            active_users: AtomicUsize::new(0),
            spawned_users: AtomicUsize::new(0),
            all_snapshots: Arc::new(RwLock::new(Vec::new())),
            started_at: Instant::now(),
            start_wall: Utc::now(),
            result_tx,
        });

        // Accumulate every periodic snapshot for the final result.
        let sink = inner.all_snapshots.clone();
        inner.metrics.on_snapshot(Box::new(move |snapshots| {
            sink.write().extend_from_slice(snapshots);
        }));
        inner.metrics.start(inner.config.metrics_interval());

        EngineInner::spawn_scheduler(&inner);
        Ok(LoadTestRuntime { inner })
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn state(&self) -> TestState {
        self.inner.state()
    }

    /// Logically live users: spawned minus permanently exited. Pool-level
    /// active counts are reported separately through the metrics gauges.
    pub fn active_users(&self) -> usize {
        self.inner.active_users.load(Ordering::SeqCst)
    }

    /// Monotonic count of users ever spawned.
    pub fn spawned_users(&self) -> usize {
        self.inner.spawned_users.load(Ordering::SeqCst)
    }

    /// Stop the test gracefully. Idempotent; concurrent calls beyond the
    /// first are no-ops that return once the state has moved on.
    pub async fn stop(&self) {
        EngineInner::stop(&self.inner).await;
    }

    /// Wait for the run to finish and return its result. Resolves with an
    /// error only if the engine failed unrecoverably.
    pub async fn result(&self) -> Result<TestResult, RuntimeError> {
        let mut rx = self.inner.result_tx.subscribe();
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(RuntimeError::Failed(
                    "runtime dropped before completion".to_string(),
                ));
            }
        }
    }
}

impl EngineInner {
    fn state(&self) -> TestState {
        TestState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), TestState::RampingUp | TestState::Running)
    }

    fn transition(&self, from: TestState, to: TestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn spawn_scheduler(engine: &Arc<EngineInner>) {
        // Ramp controller: every tick, compute the linear target and spawn
        // the deficit against the monotonic spawn counter. Spawning the
        // deficit is idempotent across tick jitter and never over-spawns.
        let ramp_engine = Arc::clone(engine);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RAMP_TICK);
            loop {
                tick.tick().await;
                if !ramp_engine.is_running() {
                    return;
                }
                let total = ramp_engine.config.number_of_users();
                let ramp = ramp_engine.config.ramp_up_time();
                let elapsed = ramp_engine.started_at.elapsed();

                let target = if ramp.is_zero() || elapsed >= ramp {
                    ramp_engine.transition(TestState::RampingUp, TestState::Running);
                    total
                } else {
                    let progress = elapsed.as_secs_f64() / ramp.as_secs_f64();
                    (((total as f64) * progress).ceil() as usize).min(total)
                };

                while ramp_engine.spawned_users.load(Ordering::SeqCst) < target {
                    if !ramp_engine.is_running() {
                        return;
                    }
                    ramp_engine.spawned_users.fetch_add(1, Ordering::SeqCst);
                    EngineInner::spawn_user(&ramp_engine);
                }
            }
        });

        // Gauge updater: copy each pool's live count into the metrics gauge.
        let gauge_engine = Arc::clone(engine);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(
                tokio::time::Instant::now() + GAUGE_INITIAL_DELAY,
                GAUGE_INTERVAL,
            );
            loop {
                tick.tick().await;
                if !gauge_engine.is_running() {
                    return;
                }
                for pool in gauge_engine.pools.all_pools() {
                    gauge_engine
                        .metrics
                        .record_active_users(pool.action_name(), pool.active_count());
                }
            }
        });

        // Deadline: one-shot stop at the configured test duration.
        let deadline_engine = Arc::clone(engine);
        tokio::spawn(async move {
            tokio::time::sleep(deadline_engine.config.test_duration()).await;
            if deadline_engine.is_running() {
                info!("test duration reached, stopping");
            }
            EngineInner::stop(&deadline_engine).await;
        });
    }

    fn spawn_user(engine: &Arc<EngineInner>) {
        engine.active_users.fetch_add(1, Ordering::SeqCst);
        EngineInner::dispatch(engine, Session::new(), 0);
    }

    fn user_exited(&self) {
        self.active_users.fetch_sub(1, Ordering::SeqCst);
    }

    /// Move a user to the chain entry at `index`. Completing the chain loops
    /// back to index 0 with a fresh session (continuous load); once the run
    /// leaves the running states the user exits instead.
    fn dispatch(engine: &Arc<EngineInner>, session: Session, index: usize) {
        if index >= engine.chain.len() {
            if engine.is_running() {
                EngineInner::dispatch(engine, Session::new(), 0);
            } else {
                engine.user_exited();
            }
            return;
        }
        if !engine.is_running() {
            engine.user_exited();
            return;
        }

        let def = match engine.chain.get(index) {
            Some(def) => def.clone(),
            None => {
                engine.user_exited();
                return;
            }
        };
        let pool = match engine.pools.pool(def.name()) {
            Ok(pool) => pool,
            Err(err) => {
                if engine.is_running() && !engine.pools.is_empty() {
                    // A chain action without a pool cannot make progress.
                    error!("dispatch failed: {}", err);
                    EngineInner::fail(engine, err.to_string());
                } else {
                    debug!("dispatch after shutdown: {}", err);
                }
                engine.user_exited();
                return;
            }
        };

        let engine_ref = Arc::clone(engine);
        let guard = UserGuard::new(Arc::clone(engine));
        pool.submit(async move {
            let start = Instant::now();
            let outcome = def.action().execute(session.clone()).await;
            let elapsed = start.elapsed();
            match outcome {
                Ok(()) => {
                    engine_ref.metrics.record_success(def.name(), elapsed);
                    guard.disarm();
                    EngineInner::dispatch(&engine_ref, session, index + 1);
                    Ok(())
                }
                Err(err) => {
                    engine_ref.metrics.record_failure(def.name(), elapsed, &err);
                    if !err.is_exit() {
                        debug!(
                            "action `{}` failed for session {}: {}",
                            def.name(),
                            session.id(),
                            err
                        );
                    }
                    // Failure restarts the chain with a fresh session.
                    guard.disarm();
                    EngineInner::dispatch(&engine_ref, Session::new(), 0);
                    Err(err)
                }
            }
        });
    }

    async fn stop(engine: &Arc<EngineInner>) {
        let stopping = engine.transition(TestState::RampingUp, TestState::Stopping)
            || engine.transition(TestState::Running, TestState::Stopping);
        if !stopping {
            return;
        }

        info!("stopping load test");
        engine.pools.shutdown().await;
        engine.metrics.stop();

        let end_wall = Utc::now();
        let snapshots = engine.all_snapshots.read().clone();
        let result = build_result(
            engine.start_wall,
            end_wall,
            engine.config.number_of_users(),
            snapshots,
        );

        if let Some(path) = engine.config.report_path() {
            generate_reports(&result, path);
        }

        engine.state.store(TestState::Completed as u8, Ordering::SeqCst);
        engine.result_tx.send_replace(Some(Ok(result)));
        info!(
            "load test completed, duration: {:?}",
            engine.started_at.elapsed()
        );
    }

    /// Unrecoverable engine failure: terminal state, result resolves
    /// exceptionally, best-effort cleanup in the background.
    fn fail(engine: &Arc<EngineInner>, message: String) {
        loop {
            let current = engine.state();
            if matches!(current, TestState::Completed | TestState::Failed) {
                return;
            }
            if engine.transition(current, TestState::Failed) {
                break;
            }
        }
        error!("load test failed: {}", message);
        engine
            .result_tx
            .send_replace(Some(Err(RuntimeError::Failed(message))));
        let cleanup = Arc::clone(engine);
        tokio::spawn(async move {
            cleanup.pools.shutdown().await;
            cleanup.metrics.stop();
        });
    }
}

/// Keeps the active-user count honest when a dispatched step never runs:
/// dropped without being disarmed (pool refused the job, permit acquisition
/// cancelled, task aborted), the user counts as permanently exited.
struct UserGuard {
    engine: Arc<EngineInner>,
    disarmed: bool,
}

impl UserGuard {
    fn new(engine: Arc<EngineInner>) -> Self {
        UserGuard {
            engine,
            disarmed: false,
        }
    }

    fn disarm(mut self) {
        self.disarmed = true;
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        if !self.disarmed {
            self.engine.user_exited();
        }
    }
}

fn generate_reports(result: &TestResult, path: &Path) {
    info!("generating load test reports");
    let html_path = if path.extension().map_or(false, |ext| ext == "html") {
        path.to_path_buf()
    } else {
        let mut with_ext = path.as_os_str().to_owned();
        with_ext.push(".html");
        PathBuf::from(with_ext)
    };
    if let Err(err) = crate::stats::html::write_html_report(result, &html_path) {
        error!("failed to write HTML report: {}", err);
    }
    let csv_path = html_path.with_extension("csv");
    if let Err(err) = crate::stats::csv::write_csv_report(result, &csv_path) {
        error!("failed to write CSV report: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::error::ActionError;
    use crate::stats::HistogramMetricsCollector;
    use std::sync::atomic::AtomicU64;

    fn noop() -> impl Action {
        |_s: Session| async move { Ok::<(), ActionError>(()) }
    }

    fn config(users: usize, ramp: Duration, duration: Duration) -> RuntimeConfig {
        RuntimeConfig::builder()
            .number_of_users(users)
            .ramp_up_time(ramp)
            .test_duration(duration)
            .connection_pool_size(20)
            .metrics_interval(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    fn start(
        config: RuntimeConfig,
        chain: ActionChain,
    ) -> (LoadTestRuntime, Arc<HistogramMetricsCollector>) {
        let collector = Arc::new(HistogramMetricsCollector::new());
        let runtime = LoadTestRuntime::start(config, chain, collector.clone()).unwrap();
        (runtime, collector)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_user_immediate_start_loops_continuously() {
        let chain = ActionChain::builder().then("noop", noop()).build().unwrap();
        let (runtime, collector) = start(
            config(1, Duration::ZERO, Duration::from_millis(600)),
            chain,
        );

        let result = runtime.result().await.unwrap();
        assert_eq!(runtime.state(), TestState::Completed);
        assert_eq!(runtime.spawned_users(), 1);
        assert_eq!(runtime.active_users(), 0);
        // One user looping through an instant action completes many times.
        assert!(collector.success_count("noop") > 10);
        assert_eq!(result.configured_users, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_linear_ramp_spawns_deficit() {
        let chain = ActionChain::builder().then("noop", noop()).build().unwrap();
        let (runtime, collector) = start(
            config(100, Duration::from_secs(1), Duration::from_secs(2)),
            chain,
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        let mid = runtime.spawned_users();
        assert!(
            (30..=75).contains(&mid),
            "at half ramp expected roughly 50 spawned, got {mid}"
        );
        assert!(runtime.active_users() <= runtime.spawned_users());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(runtime.spawned_users(), 100);
        assert_eq!(runtime.state(), TestState::Running);

        runtime.result().await.unwrap();
        assert_eq!(runtime.active_users(), 0);
        assert!(collector.success_count("noop") >= 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_session_state_flows_between_steps() {
        let chain = ActionChain::builder()
            .then("step1", |session: Session| async move {
                session.put("token", "abc");
                Ok::<(), ActionError>(())
            })
            .then("step2", |session: Session| async move {
                if session.get_str("token").as_deref() == Some("abc") {
                    Ok(())
                } else {
                    Err(ActionError::failed("token missing from session"))
                }
            })
            .build()
            .unwrap();

        let (runtime, collector) = start(
            config(3, Duration::ZERO, Duration::from_millis(700)),
            chain,
        );
        runtime.result().await.unwrap();

        assert_eq!(collector.failure_count("step2"), 0);
        assert!(collector.success_count("step2") > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_action_restarts_user() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let chain = ActionChain::builder()
            .then("flaky", move |_s: Session| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                        Err(ActionError::failed("every second call fails"))
                    } else {
                        Ok(())
                    }
                }
            })
            .build()
            .unwrap();

        let (runtime, collector) = start(
            config(5, Duration::ZERO, Duration::from_millis(700)),
            chain,
        );
        runtime.result().await.unwrap();

        assert_eq!(runtime.state(), TestState::Completed);
        assert!(collector.success_count("flaky") > 0);
        assert!(collector.failure_count("flaky") > 0);
        assert_eq!(runtime.active_users(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exit_sentinel_restarts_without_reaching_later_steps() {
        let chain = ActionChain::builder()
            .then("seed-error", |session: Session| async move {
                session.put("error", true);
                Ok::<(), ActionError>(())
            })
            .then("exit-check", |session: Session| async move {
                if session.get("error").is_some() {
                    Err(ActionError::exit("error flag set"))
                } else {
                    Ok(())
                }
            })
            .then("never", noop())
            .build()
            .unwrap();

        let (runtime, collector) = start(
            config(1, Duration::ZERO, Duration::from_millis(600)),
            chain,
        );
        runtime.result().await.unwrap();

        assert_eq!(collector.success_count("never"), 0);
        assert_eq!(collector.failure_count("never"), 0);
        // The sentinel is counted as a failure on the raising step.
        assert!(collector.failure_count("exit-check") > 0);
        assert_eq!(collector.success_count("exit-check"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_is_idempotent_and_result_stable() {
        let chain = ActionChain::builder().then("noop", noop()).build().unwrap();
        let (runtime, _collector) = start(
            config(2, Duration::ZERO, Duration::from_secs(30)),
            chain,
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        runtime.stop().await;
        let first = runtime.result().await.unwrap();
        assert_eq!(runtime.state(), TestState::Completed);

        runtime.stop().await;
        let second = runtime.result().await.unwrap();
        assert_eq!(first.end_time, second.end_time);
        assert_eq!(
            first.time_series_snapshots.len(),
            second.time_series_snapshots.len()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_during_ramp_spawns_no_further_users() {
        let chain = ActionChain::builder().then("noop", noop()).build().unwrap();
        let (runtime, _collector) = start(
            config(50, Duration::from_secs(10), Duration::from_secs(30)),
            chain,
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runtime.state(), TestState::RampingUp);
        runtime.stop().await;

        let spawned_at_stop = runtime.spawned_users();
        assert!(spawned_at_stop < 50);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runtime.spawned_users(), spawned_at_stop);
        assert_eq!(runtime.state(), TestState::Completed);
        assert_eq!(runtime.active_users(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deadline_shorter_than_ramp_still_completes() {
        let chain = ActionChain::builder().then("noop", noop()).build().unwrap();
        let (runtime, _collector) = start(
            config(40, Duration::from_secs(10), Duration::from_millis(500)),
            chain,
        );

        let result = runtime.result().await.unwrap();
        assert_eq!(runtime.state(), TestState::Completed);
        assert!(runtime.spawned_users() < 40);
        assert_eq!(runtime.active_users(), 0);
        assert!(result.total_duration >= Duration::from_millis(400));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshots_accumulate_into_result() {
        let chain = ActionChain::builder().then("noop", noop()).build().unwrap();
        let (runtime, _collector) = start(
            config(2, Duration::ZERO, Duration::from_millis(650)),
            chain,
        );
        let result = runtime.result().await.unwrap();

        // ~6 collection cycles at a 100ms interval.
        assert!(
            result.time_series_snapshots.len() >= 3,
            "expected several snapshots, got {}",
            result.time_series_snapshots.len()
        );
        let summary = result
            .action_summaries
            .iter()
            .find(|s| s.action_name == "noop")
            .unwrap();
        assert!(summary.total_requests > 0);
        assert_eq!(
            summary.total_requests,
            summary.success_count + summary.failure_count
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reports_written_when_path_configured() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run-report");
        let chain = ActionChain::builder().then("noop", noop()).build().unwrap();
        let config = RuntimeConfig::builder()
            .number_of_users(2)
            .ramp_up_time(Duration::ZERO)
            .test_duration(Duration::from_millis(400))
            .metrics_interval(Duration::from_millis(100))
            .report_path(&base)
            .build()
            .unwrap();

        let (runtime, _collector) = start(config, chain);
        runtime.result().await.unwrap();

        assert!(dir.path().join("run-report.html").exists());
        assert!(dir.path().join("run-report.csv").exists());
    }
}
