//! stampede — a load generator that sustains a target population of
//! concurrent virtual users, each looping through a user-defined chain of
//! named actions, and publishes per-action latency/throughput snapshots.
//!
//! ```no_run
//! use std::time::Duration;
//! use stampede::{ActionError, LoadTest, RuntimeConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let run = LoadTest::builder()
//!         .action("login", |session: Session| async move {
//!             session.put("token", "abc");
//!             Ok::<(), ActionError>(())
//!         })
//!         .action("browse", |_session: Session| async move {
//!             Ok::<(), ActionError>(())
//!         })
//!         .config(
//!             RuntimeConfig::builder()
//!                 .number_of_users(100)
//!                 .ramp_up_time(Duration::from_secs(10))
//!                 .test_duration(Duration::from_secs(60))
//!                 .build()?,
//!         )
//!         .start()?;
//!
//!     let result = run.result().await?;
//!     println!("{} actions summarized", result.action_summaries.len());
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod feeder;
pub mod pool;
pub mod scenario;
pub mod session;
pub mod stats;

pub use action::{Action, ActionChain, ActionDefinition};
pub use config::{RuntimeConfig, WorkerMode};
pub use engine::result::{ActionSummary, TestResult};
pub use engine::{LoadTestRuntime, TestState};
pub use error::{ActionError, ConfigError, PoolError, RuntimeError};
pub use feeder::{Feeder, FeederError, FeederRow};
pub use scenario::{PauseStrategy, Scenario, ScenarioBuilder, ScenarioStep};
pub use session::Session;
pub use stats::{
    HistogramMetricsCollector, LatencySummary, MetricsCollector, PoolMetricsSnapshot,
};

use std::sync::Arc;

/// Entry point: register a raw action sequence or a scenario, configure the
/// run, and start it.
pub struct LoadTest;

impl LoadTest {
    pub fn builder() -> LoadTestBuilder {
        LoadTestBuilder {
            config: RuntimeConfig::default(),
            actions: Vec::new(),
            chain: None,
            scenario: None,
            collector: None,
        }
    }
}

pub struct LoadTestBuilder {
    config: RuntimeConfig,
    actions: Vec<(String, Arc<dyn Action>)>,
    chain: Option<ActionChain>,
    scenario: Option<Scenario>,
    collector: Option<Arc<dyn MetricsCollector>>,
}

impl LoadTestBuilder {
    /// Append a named action to the raw chain. Ignored if an explicit chain
    /// or scenario is set.
    pub fn action(mut self, name: impl Into<String>, action: impl Action) -> Self {
        self.actions.push((name.into(), Arc::new(action)));
        self
    }

    /// Use a prebuilt action chain.
    pub fn chain(mut self, chain: ActionChain) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Use a scenario; it is compiled into a chain at start.
    pub fn scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = Some(scenario);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Substitute a custom metrics collector.
    pub fn metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Validate the setup and start the run. Must be called from within a
    /// multi-threaded tokio runtime.
    pub fn start(self) -> Result<LoadTestRuntime, RuntimeError> {
        let chain = if let Some(scenario) = &self.scenario {
            scenario::compiler::compile(scenario)?
        } else if let Some(chain) = self.chain {
            chain
        } else {
            let mut builder = ActionChain::builder();
            for (name, action) in self.actions {
                builder = builder.then_shared(name, action);
            }
            builder.build()?
        };

        let collector = self
            .collector
            .unwrap_or_else(|| Arc::new(HistogramMetricsCollector::new()));

        LoadTestRuntime::start(self.config, chain, collector)
    }
}
