use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// How a pool runs its submitted work.
///
/// `Tasks` puts every submission on its own tokio task; cheap user-space
/// concurrency that suits actions which suspend on I/O. `BoundedThreads`
/// drives submissions from a fixed OS-thread pool sized to the pool's
/// `max_size`, which suits CPU-bound or non-async client libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    #[default]
    Tasks,
    BoundedThreads,
}

/// Configuration for one load-test run.
///
/// ```
/// use std::time::Duration;
/// use stampede::RuntimeConfig;
///
/// let config = RuntimeConfig::builder()
///     .number_of_users(100)
///     .ramp_up_time(Duration::from_secs(10))
///     .test_duration(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// assert_eq!(config.number_of_users(), 100);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    number_of_users: usize,
    ramp_up_time: Duration,
    test_duration: Duration,
    connection_pool_size: usize,
    metrics_interval: Duration,
    worker_mode: WorkerMode,
    report_path: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    pub fn number_of_users(&self) -> usize {
        self.number_of_users
    }

    pub fn ramp_up_time(&self) -> Duration {
        self.ramp_up_time
    }

    pub fn test_duration(&self) -> Duration {
        self.test_duration
    }

    pub fn connection_pool_size(&self) -> usize {
        self.connection_pool_size
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn worker_mode(&self) -> WorkerMode {
        self.worker_mode
    }

    pub fn report_path(&self) -> Option<&PathBuf> {
        self.report_path.as_ref()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfigBuilder::default().build().expect("defaults are valid")
    }
}

pub struct RuntimeConfigBuilder {
    number_of_users: usize,
    ramp_up_time: Duration,
    test_duration: Duration,
    connection_pool_size: usize,
    metrics_interval: Duration,
    worker_mode: WorkerMode,
    report_path: Option<PathBuf>,
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        RuntimeConfigBuilder {
            number_of_users: 10,
            ramp_up_time: Duration::from_secs(10),
            test_duration: Duration::from_secs(60),
            connection_pool_size: 50,
            metrics_interval: Duration::from_secs(1),
            worker_mode: WorkerMode::Tasks,
            report_path: None,
        }
    }
}

impl RuntimeConfigBuilder {
    /// Target number of concurrent virtual users.
    pub fn number_of_users(mut self, users: usize) -> Self {
        self.number_of_users = users;
        self
    }

    /// Time over which the user target grows linearly from 0 to the full
    /// count. Zero means all users start immediately.
    pub fn ramp_up_time(mut self, ramp_up: Duration) -> Self {
        self.ramp_up_time = ramp_up;
        self
    }

    /// Total run time, measured from start. The run stops at the deadline
    /// whether or not ramp-up has finished.
    pub fn test_duration(mut self, duration: Duration) -> Self {
        self.test_duration = duration;
        self
    }

    /// Maximum concurrent executions per action; each action's pool gets this
    /// many permits.
    pub fn connection_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = size;
        self
    }

    /// How often metric snapshots are taken and published to subscribers.
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn worker_mode(mut self, mode: WorkerMode) -> Self {
        self.worker_mode = mode;
        self
    }

    /// Base path for the generated HTML/CSV reports. No reports are written
    /// when unset.
    pub fn report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        if self.number_of_users == 0 {
            return Err(ConfigError::NonPositiveUsers);
        }
        if self.connection_pool_size == 0 {
            return Err(ConfigError::NonPositivePoolSize);
        }
        Ok(RuntimeConfig {
            number_of_users: self.number_of_users,
            ramp_up_time: self.ramp_up_time,
            test_duration: self.test_duration,
            connection_pool_size: self.connection_pool_size,
            metrics_interval: self.metrics_interval,
            worker_mode: self.worker_mode,
            report_path: self.report_path,
        })
    }
}
