//! Per-action bounded worker pools.
//!
//! Each action name in the chain gets its own pool, so users move from one
//! pool to the next as they progress. A counting semaphore of `max_size`
//! permits bounds concurrency regardless of worker mode.

pub mod manager;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::WorkerMode;
use crate::error::ActionError;

type Job = BoxFuture<'static, ()>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const IDLE_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Bounded concurrency gate plus worker execution for one action.
///
/// `submit` increments the waiting count and hands the job to a worker; the
/// worker decrements it, acquires a permit (possibly blocking), bumps the
/// active count, runs the job, and records completed or failed. The permit is
/// always released and the active count always drops back, whatever the
/// outcome.
pub struct ActionPool {
    name: String,
    max_size: usize,
    mode: WorkerMode,
    handle: Handle,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    shutdown: AtomicBool,
    threads: Option<BoundedThreads>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ActionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionPool")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

/// State for `WorkerMode::BoundedThreads`: a fixed pool with `max_size / 2`
/// core threads, growth to `max_size`, a bounded queue of `2 * max_size`
/// jobs, caller-runs on overflow, and 60 s idle reaping of non-core threads.
struct BoundedThreads {
    tx: Mutex<Option<Sender<Job>>>,
    rx: Receiver<Job>,
    live: Arc<AtomicUsize>,
    core: usize,
}

impl ActionPool {
    pub fn new(name: impl Into<String>, max_size: usize, mode: WorkerMode, handle: Handle) -> Self {
        let name = name.into();
        let threads = match mode {
            WorkerMode::Tasks => None,
            WorkerMode::BoundedThreads => {
                let (tx, rx) = bounded(max_size * 2);
                Some(BoundedThreads {
                    tx: Mutex::new(Some(tx)),
                    rx,
                    live: Arc::new(AtomicUsize::new(0)),
                    core: (max_size / 2).max(1),
                })
            }
        };
        debug!("created {:?} pool for action `{}` with max {} users", mode, name, max_size);
        ActionPool {
            name,
            max_size,
            mode,
            handle,
            semaphore: Arc::new(Semaphore::new(max_size)),
            active: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            shutdown: AtomicBool::new(false),
            threads,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn action_name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Submit a job. Refused (and counted failed) after shutdown.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        if self.is_shutdown() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let run = self.gated(Box::pin(job));
        match self.mode {
            WorkerMode::Tasks => {
                let handle = self.handle.spawn(run);
                self.track(handle);
            }
            WorkerMode::BoundedThreads => self.dispatch_to_threads(Box::pin(run)),
        }
    }

    /// Wrap a job with the semaphore gate and outcome counters.
    fn gated(
        &self,
        job: BoxFuture<'static, Result<(), ActionError>>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let semaphore = self.semaphore.clone();
        let waiting = self.waiting.clone();
        let active = self.active.clone();
        let completed = self.completed.clone();
        let failed = self.failed.clone();
        let name = self.name.clone();
        async move {
            waiting.fetch_sub(1, Ordering::SeqCst);
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                // Pool closed while blocked on the permit: the job is
                // cancelled and counted as failed.
                Err(_) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            active.fetch_add(1, Ordering::SeqCst);
            match job.await {
                Ok(()) => {
                    completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    if !err.is_exit() {
                        debug!("task failed in pool `{}`: {}", name, err);
                    }
                }
            }
            active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }
    }

    fn track(&self, handle: tokio::task::JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= 1024 {
            tasks.retain(|h| !h.is_finished());
        }
        tasks.push(handle);
    }

    fn dispatch_to_threads(&self, run: Job) {
        let threads = self.threads.as_ref().expect("bounded-threads pool state");
        self.ensure_worker(threads);
        let guard = threads.tx.lock();
        let Some(tx) = guard.as_ref() else {
            // Shutdown raced the submission.
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            self.failed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(run) {
            Ok(()) => {}
            // Queue full: the submitter runs the job itself, which throttles
            // producers to the pool's pace.
            Err(TrySendError::Full(run)) => {
                drop(guard);
                futures::executor::block_on(run);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Grow the thread pool: core threads are permanent, extra threads up to
    /// `max_size` are started while the queue is non-empty and reaped after
    /// 60 s idle.
    fn ensure_worker(&self, threads: &BoundedThreads) {
        loop {
            let live = threads.live.load(Ordering::SeqCst);
            let keep_alive = if live < threads.core {
                None
            } else if live < self.max_size && !threads.rx.is_empty() {
                Some(IDLE_KEEP_ALIVE)
            } else {
                return;
            };
            if threads
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.spawn_worker(threads, keep_alive);
                return;
            }
        }
    }

    fn spawn_worker(&self, threads: &BoundedThreads, keep_alive: Option<Duration>) {
        let rx = threads.rx.clone();
        let live = threads.live.clone();
        let handle = self.handle.clone();
        std::thread::Builder::new()
            .name(format!("stampede-pool-{}", self.name))
            .spawn(move || {
                loop {
                    let job = match keep_alive {
                        Some(idle) => match rx.recv_timeout(idle) {
                            Ok(job) => job,
                            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        },
                    };
                    handle.block_on(job);
                }
                live.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("failed to spawn pool worker thread");
    }

    /// Refuse new submissions, wait up to 10 s for in-flight work, then force
    /// the rest. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake anything blocked on a permit; those jobs count as failed.
        self.semaphore.close();
        if let Some(threads) = &self.threads {
            threads.tx.lock().take();
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while (self.active_count() > 0 || self.waiting_count() > 0) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if self.active_count() > 0 || self.waiting_count() > 0 {
            warn!(
                "pool `{}` did not drain within {:?}; aborting {} in-flight tasks",
                self.name,
                SHUTDOWN_GRACE,
                self.active_count()
            );
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            self.active.store(0, Ordering::SeqCst);
            self.waiting.store(0, Ordering::SeqCst);
        } else {
            self.tasks.lock().clear();
        }

        info!(
            "pool `{}` shut down, completed: {}, failed: {}",
            self.name,
            self.completed_count(),
            self.failed_count()
        );
    }
}
