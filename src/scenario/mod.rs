//! Scenario DSL: a composable step tree that compiles down to a flat action
//! chain (see [`compiler`]). The runtime itself only ever sees the chain.
//!
//! ```
//! use std::time::Duration;
//! use stampede::{ActionError, Scenario, Session};
//!
//! let scenario = Scenario::named("checkout")
//!     .execute("login", |s: Session| async move {
//!         s.put("token", "abc");
//!         Ok::<(), ActionError>(())
//!     })
//!     .pause_between(Duration::from_millis(200), Duration::from_millis(800))
//!     .repeat(3, "page", |steps| {
//!         steps.execute("browse", |_s: Session| async move {
//!             Ok::<(), ActionError>(())
//!         })
//!     })
//!     .exit_if(|s| s.contains("error"))
//!     .build()
//!     .unwrap();
//! assert_eq!(scenario.name(), "checkout");
//! ```

pub mod compiler;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::action::Action;
use crate::error::ConfigError;
use crate::feeder::Feeder;
use crate::session::Session;

/// Session predicate used by conditional steps.
pub type Predicate = Arc<dyn Fn(&Session) -> bool + Send + Sync>;

/// How a virtual user pauses between actions (think time). Without pauses,
/// users loop at maximum speed, which does not resemble real traffic.
#[derive(Clone, Debug)]
pub enum PauseStrategy {
    /// Always pause for the same duration.
    Fixed(Duration),
    /// Pause for a duration drawn uniformly from `[min, max]` milliseconds,
    /// inclusive, on every invocation.
    Uniform { min: Duration, max: Duration },
    /// No pause.
    None,
}

impl PauseStrategy {
    /// Build a uniform strategy, rejecting `min > max`.
    pub fn uniform(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidPauseRange {
                min_ms: min.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            });
        }
        Ok(PauseStrategy::Uniform { min, max })
    }

    /// Sample the pause duration for one invocation.
    pub fn duration(&self) -> Duration {
        match self {
            PauseStrategy::Fixed(d) => *d,
            PauseStrategy::Uniform { min, max } => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
            }
            PauseStrategy::None => Duration::ZERO,
        }
    }
}

/// One weighted branch of a random switch. Weights are relative; they do not
/// need to sum to 100.
#[derive(Clone)]
pub struct WeightedBranch {
    pub weight: f64,
    pub steps: Vec<ScenarioStep>,
}

/// A single step in a scenario tree.
#[derive(Clone)]
pub enum ScenarioStep {
    /// Run a named action.
    Execute { name: String, action: Arc<dyn Action> },
    /// Think time between actions.
    Pause { strategy: PauseStrategy },
    /// Merge one feeder row into the session.
    Feed { feeder: Arc<dyn Feeder> },
    /// Run the inner steps `times` times; the 0-based iteration index is
    /// stored in the session under `counter_key` before each iteration.
    Repeat {
        times: usize,
        counter_key: String,
        steps: Vec<ScenarioStep>,
    },
    /// Run the inner steps while the condition holds.
    RepeatWhile {
        condition: Predicate,
        label: String,
        steps: Vec<ScenarioStep>,
    },
    /// Run `then_steps` or `else_steps` depending on the condition.
    IfCondition {
        condition: Predicate,
        label: String,
        then_steps: Vec<ScenarioStep>,
        else_steps: Vec<ScenarioStep>,
    },
    /// Abort the remainder of the chain iteration when the condition holds.
    ExitIf { condition: Predicate },
    /// Run one branch chosen randomly by weight.
    RandomSwitch { branches: Vec<WeightedBranch> },
    /// Namespace the inner steps under `name.` for metrics.
    Group {
        name: String,
        steps: Vec<ScenarioStep>,
    },
}

/// A named, non-empty tree of steps. Compile it with
/// [`compiler::compile`] or hand it to `LoadTest::builder().scenario(..)`.
#[derive(Clone)]
pub struct Scenario {
    name: String,
    steps: Vec<ScenarioStep>,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("steps_len", &self.steps.len())
            .finish()
    }
}

impl Scenario {
    /// Start building a named scenario.
    pub fn named(name: impl Into<String>) -> ScenarioBuilder {
        ScenarioBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[ScenarioStep] {
        &self.steps
    }
}

/// Fluent builder for scenarios. Nested constructs take a closure that
/// receives a fresh builder for the inner steps.
pub struct ScenarioBuilder {
    name: String,
    steps: Vec<ScenarioStep>,
}

impl ScenarioBuilder {
    fn sub(&self) -> ScenarioBuilder {
        ScenarioBuilder {
            name: self.name.clone(),
            steps: Vec::new(),
        }
    }

    /// Execute an action with a name.
    pub fn execute(mut self, name: impl Into<String>, action: impl Action) -> Self {
        self.steps.push(ScenarioStep::Execute {
            name: name.into(),
            action: Arc::new(action),
        });
        self
    }

    /// Pause for a fixed duration.
    pub fn pause(mut self, duration: Duration) -> Self {
        self.steps.push(ScenarioStep::Pause {
            strategy: PauseStrategy::Fixed(duration),
        });
        self
    }

    /// Pause for a random duration between `min` and `max` (validated at
    /// build time).
    pub fn pause_between(mut self, min: Duration, max: Duration) -> Self {
        self.steps.push(ScenarioStep::Pause {
            strategy: PauseStrategy::Uniform { min, max },
        });
        self
    }

    /// Pause with a custom strategy.
    pub fn pause_with(mut self, strategy: PauseStrategy) -> Self {
        self.steps.push(ScenarioStep::Pause { strategy });
        self
    }

    /// Inject one feeder row into the session per chain iteration.
    pub fn feed(mut self, feeder: Arc<dyn Feeder>) -> Self {
        self.steps.push(ScenarioStep::Feed { feeder });
        self
    }

    /// Repeat a group of steps N times. The current iteration index
    /// (0-based) is stored in the session under `counter_key`.
    pub fn repeat(
        mut self,
        times: usize,
        counter_key: impl Into<String>,
        steps: impl FnOnce(ScenarioBuilder) -> ScenarioBuilder,
    ) -> Self {
        let inner = steps(self.sub());
        self.steps.push(ScenarioStep::Repeat {
            times,
            counter_key: counter_key.into(),
            steps: inner.steps,
        });
        self
    }

    /// Repeat a group of steps while a condition holds. The iteration count
    /// is stored under `"{label}.iteration"`.
    pub fn repeat_while(
        mut self,
        condition: impl Fn(&Session) -> bool + Send + Sync + 'static,
        label: impl Into<String>,
        steps: impl FnOnce(ScenarioBuilder) -> ScenarioBuilder,
    ) -> Self {
        let inner = steps(self.sub());
        self.steps.push(ScenarioStep::RepeatWhile {
            condition: Arc::new(condition),
            label: label.into(),
            steps: inner.steps,
        });
        self
    }

    /// Conditionally execute steps if a predicate is true.
    pub fn do_if(
        mut self,
        condition: impl Fn(&Session) -> bool + Send + Sync + 'static,
        label: impl Into<String>,
        then_steps: impl FnOnce(ScenarioBuilder) -> ScenarioBuilder,
    ) -> Self {
        let inner = then_steps(self.sub());
        self.steps.push(ScenarioStep::IfCondition {
            condition: Arc::new(condition),
            label: label.into(),
            then_steps: inner.steps,
            else_steps: Vec::new(),
        });
        self
    }

    /// Conditionally execute steps with an else branch.
    pub fn do_if_else(
        mut self,
        condition: impl Fn(&Session) -> bool + Send + Sync + 'static,
        label: impl Into<String>,
        then_steps: impl FnOnce(ScenarioBuilder) -> ScenarioBuilder,
        else_steps: impl FnOnce(ScenarioBuilder) -> ScenarioBuilder,
    ) -> Self {
        let then_inner = then_steps(self.sub());
        let else_inner = else_steps(self.sub());
        self.steps.push(ScenarioStep::IfCondition {
            condition: Arc::new(condition),
            label: label.into(),
            then_steps: then_inner.steps,
            else_steps: else_inner.steps,
        });
        self
    }

    /// Exit the current chain iteration if the condition is true. The user
    /// restarts from the beginning with a fresh session.
    pub fn exit_if(
        mut self,
        condition: impl Fn(&Session) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.steps.push(ScenarioStep::ExitIf {
            condition: Arc::new(condition),
        });
        self
    }

    /// Randomly choose one of several branches based on weight.
    pub fn random_switch(
        mut self,
        branches: impl FnOnce(RandomSwitchBuilder) -> RandomSwitchBuilder,
    ) -> Self {
        let builder = branches(RandomSwitchBuilder {
            parent: self.sub(),
            branches: Vec::new(),
        });
        self.steps.push(ScenarioStep::RandomSwitch {
            branches: builder.branches,
        });
        self
    }

    /// Group steps under a logical name: an `execute("x", ..)` inside a
    /// group named `G` produces an action named `G.x`. Groups compose.
    pub fn group(
        mut self,
        name: impl Into<String>,
        steps: impl FnOnce(ScenarioBuilder) -> ScenarioBuilder,
    ) -> Self {
        let inner = steps(self.sub());
        self.steps.push(ScenarioStep::Group {
            name: name.into(),
            steps: inner.steps,
        });
        self
    }

    /// Validate and build the scenario.
    pub fn build(self) -> Result<Scenario, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::BlankScenarioName);
        }
        if self.steps.is_empty() {
            return Err(ConfigError::EmptyScenario);
        }
        validate_steps(&self.steps)?;
        Ok(Scenario {
            name: self.name,
            steps: self.steps,
        })
    }
}

/// Builder for the weighted branches of a random switch.
pub struct RandomSwitchBuilder {
    parent: ScenarioBuilder,
    branches: Vec<WeightedBranch>,
}

impl RandomSwitchBuilder {
    /// Add a branch with a relative weight.
    pub fn branch(
        mut self,
        weight: f64,
        steps: impl FnOnce(ScenarioBuilder) -> ScenarioBuilder,
    ) -> Self {
        let inner = steps(self.parent.sub());
        self.branches.push(WeightedBranch {
            weight,
            steps: inner.steps,
        });
        self
    }
}

fn validate_steps(steps: &[ScenarioStep]) -> Result<(), ConfigError> {
    for step in steps {
        match step {
            ScenarioStep::Execute { name, .. } => {
                if name.trim().is_empty() {
                    return Err(ConfigError::BlankActionName);
                }
            }
            ScenarioStep::Pause { strategy } => {
                if let PauseStrategy::Uniform { min, max } = strategy {
                    if min > max {
                        return Err(ConfigError::InvalidPauseRange {
                            min_ms: min.as_millis() as u64,
                            max_ms: max.as_millis() as u64,
                        });
                    }
                }
            }
            ScenarioStep::Feed { .. } | ScenarioStep::ExitIf { .. } => {}
            ScenarioStep::Repeat { steps, .. }
            | ScenarioStep::RepeatWhile { steps, .. }
            | ScenarioStep::Group { steps, .. } => validate_steps(steps)?,
            ScenarioStep::IfCondition {
                then_steps,
                else_steps,
                ..
            } => {
                validate_steps(then_steps)?;
                validate_steps(else_steps)?;
            }
            ScenarioStep::RandomSwitch { branches } => {
                if branches.is_empty() {
                    return Err(ConfigError::EmptyRandomSwitch);
                }
                for branch in branches {
                    if !branch.weight.is_finite() || branch.weight < 0.0 {
                        return Err(ConfigError::InvalidSwitchWeight(branch.weight));
                    }
                    validate_steps(&branch.steps)?;
                }
            }
        }
    }
    Ok(())
}
