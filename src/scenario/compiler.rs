//! Lowers a scenario tree into the flat, ordered chain the runtime executes.
//!
//! Compilation strategy:
//! - `Execute` becomes a chain entry under its (prefixed) name.
//! - `Pause` and `Feed` become small wrapper actions.
//! - `Repeat` is unrolled at compile time into N copies of its inner steps,
//!   each preceded by a counter step that stores the iteration index.
//! - `RepeatWhile`, `IfCondition`, `ExitIf`, and `RandomSwitch` each become a
//!   single action that interprets its inner steps inline; their iteration
//!   targets depend on the session at runtime, so unrolling would be wrong or
//!   unbounded.
//! - `Group` emits no action of its own; it only extends the name prefix.
//!
//! Compilation is pure and deterministic; randomness happens at execution.

use futures::future::BoxFuture;
use rand::Rng;

use crate::action::{ActionChain, ActionChainBuilder};
use crate::error::{ActionError, ConfigError};
use crate::scenario::{Scenario, ScenarioStep, WeightedBranch};
use crate::session::Session;

/// Compile a scenario into an action chain.
pub fn compile(scenario: &Scenario) -> Result<ActionChain, ConfigError> {
    let builder = compile_steps(scenario.steps(), ActionChain::builder(), "");
    builder.build()
}

fn compile_steps(
    steps: &[ScenarioStep],
    mut builder: ActionChainBuilder,
    prefix: &str,
) -> ActionChainBuilder {
    for step in steps {
        match step {
            ScenarioStep::Execute { name, action } => {
                builder = builder.then_shared(format!("{prefix}{name}"), action.clone());
            }

            ScenarioStep::Pause { strategy } => {
                let strategy = strategy.clone();
                builder = builder.then(format!("{prefix}_pause"), move |_session: Session| {
                    let strategy = strategy.clone();
                    async move {
                        let pause = strategy.duration();
                        if !pause.is_zero() {
                            tokio::time::sleep(pause).await;
                        }
                        Ok::<(), ActionError>(())
                    }
                });
            }

            ScenarioStep::Feed { feeder } => {
                let name = format!("{prefix}_feed:{}", feeder.name());
                let feeder = feeder.clone();
                builder = builder.then(name, move |session: Session| {
                    let feeder = feeder.clone();
                    async move {
                        if !feeder.has_next() {
                            return Err(ActionError::exit(format!(
                                "feeder `{}` exhausted",
                                feeder.name()
                            )));
                        }
                        match feeder.next_row() {
                            Some(row) => {
                                for (key, value) in row {
                                    session.put(key, value);
                                }
                                Ok(())
                            }
                            // A concurrent user drained the feeder between
                            // has_next and next_row.
                            None => Err(ActionError::exit(format!(
                                "feeder `{}` exhausted",
                                feeder.name()
                            ))),
                        }
                    }
                });
            }

            ScenarioStep::Repeat {
                times,
                counter_key,
                steps,
            } => {
                for i in 0..*times {
                    let key = counter_key.clone();
                    builder = builder.then(
                        format!("{prefix}{counter_key}[{i}]._counter"),
                        move |session: Session| {
                            let key = key.clone();
                            async move {
                                session.put(key, i as i64);
                                Ok::<(), ActionError>(())
                            }
                        },
                    );
                    let inner_prefix = format!("{prefix}{counter_key}[{i}].");
                    builder = compile_steps(steps, builder, &inner_prefix);
                }
            }

            ScenarioStep::RepeatWhile {
                condition,
                label,
                steps,
            } => {
                let condition = condition.clone();
                let label = label.clone();
                let steps = steps.to_vec();
                builder = builder.then(
                    format!("{prefix}repeatWhile:{label}"),
                    move |session: Session| {
                        let condition = condition.clone();
                        let label = label.clone();
                        let steps = steps.clone();
                        async move {
                            let mut iteration: i64 = 0;
                            while condition(&session) {
                                session.put(format!("{label}.iteration"), iteration);
                                for step in &steps {
                                    run_step_inline(step.clone(), session.clone()).await?;
                                }
                                iteration += 1;
                            }
                            Ok::<(), ActionError>(())
                        }
                    },
                );
            }

            ScenarioStep::IfCondition {
                condition,
                label,
                then_steps,
                else_steps,
            } => {
                let condition = condition.clone();
                let then_steps = then_steps.to_vec();
                let else_steps = else_steps.to_vec();
                builder = builder.then(format!("{prefix}if:{label}"), move |session: Session| {
                    let condition = condition.clone();
                    let then_steps = then_steps.clone();
                    let else_steps = else_steps.clone();
                    async move {
                        let branch = if condition(&session) {
                            then_steps
                        } else {
                            else_steps
                        };
                        for step in branch {
                            run_step_inline(step, session.clone()).await?;
                        }
                        Ok::<(), ActionError>(())
                    }
                });
            }

            ScenarioStep::ExitIf { condition } => {
                let condition = condition.clone();
                builder = builder.then(format!("{prefix}_exitIf"), move |session: Session| {
                    let condition = condition.clone();
                    async move {
                        if condition(&session) {
                            Err(ActionError::exit("exit condition met"))
                        } else {
                            Ok(())
                        }
                    }
                });
            }

            ScenarioStep::RandomSwitch { branches } => {
                let branches = branches.to_vec();
                builder = builder.then(
                    format!("{prefix}_randomSwitch"),
                    move |session: Session| {
                        let chosen = choose_branch(&branches);
                        async move {
                            for step in chosen {
                                run_step_inline(step, session.clone()).await?;
                            }
                            Ok::<(), ActionError>(())
                        }
                    },
                );
            }

            ScenarioStep::Group { name, steps } => {
                let inner_prefix = format!("{prefix}{name}.");
                builder = compile_steps(steps, builder, &inner_prefix);
            }
        }
    }
    builder
}

/// Draw a branch by weight: `r` is uniform over `[0, total)` and the first
/// branch whose cumulative weight exceeds `r` wins. Falls back to the last
/// branch when the total weight is zero.
fn choose_branch(branches: &[WeightedBranch]) -> Vec<ScenarioStep> {
    let total: f64 = branches.iter().map(|b| b.weight).sum();
    let mut chosen = &branches[branches.len() - 1].steps;
    if total > 0.0 {
        let roll = rand::thread_rng().gen_range(0.0..total);
        let mut cumulative = 0.0;
        for branch in branches {
            cumulative += branch.weight;
            if roll < cumulative {
                chosen = &branch.steps;
                break;
            }
        }
    }
    chosen.clone()
}

/// Execute a step inline, inside the action that encloses it, rather than as
/// its own chain entry. Inner actions therefore share the latency envelope
/// and pool of the enclosing action, but otherwise behave exactly as their
/// compiled form.
fn run_step_inline(
    step: ScenarioStep,
    session: Session,
) -> BoxFuture<'static, Result<(), ActionError>> {
    Box::pin(async move {
        match step {
            ScenarioStep::Execute { action, .. } => action.execute(session).await,

            ScenarioStep::Pause { strategy } => {
                let pause = strategy.duration();
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                Ok(())
            }

            ScenarioStep::Feed { feeder } => {
                if !feeder.has_next() {
                    return Err(ActionError::exit(format!(
                        "feeder `{}` exhausted",
                        feeder.name()
                    )));
                }
                match feeder.next_row() {
                    Some(row) => {
                        for (key, value) in row {
                            session.put(key, value);
                        }
                        Ok(())
                    }
                    None => Err(ActionError::exit(format!(
                        "feeder `{}` exhausted",
                        feeder.name()
                    ))),
                }
            }

            ScenarioStep::Repeat {
                times,
                counter_key,
                steps,
            } => {
                for i in 0..times {
                    session.put(counter_key.clone(), i as i64);
                    for step in &steps {
                        run_step_inline(step.clone(), session.clone()).await?;
                    }
                }
                Ok(())
            }

            ScenarioStep::RepeatWhile {
                condition,
                label,
                steps,
            } => {
                let mut iteration: i64 = 0;
                while condition(&session) {
                    session.put(format!("{label}.iteration"), iteration);
                    for step in &steps {
                        run_step_inline(step.clone(), session.clone()).await?;
                    }
                    iteration += 1;
                }
                Ok(())
            }

            ScenarioStep::IfCondition {
                condition,
                then_steps,
                else_steps,
                ..
            } => {
                let branch = if condition(&session) {
                    then_steps
                } else {
                    else_steps
                };
                for step in branch {
                    run_step_inline(step, session.clone()).await?;
                }
                Ok(())
            }

            ScenarioStep::ExitIf { condition } => {
                if condition(&session) {
                    Err(ActionError::exit("exit condition met"))
                } else {
                    Ok(())
                }
            }

            ScenarioStep::RandomSwitch { branches } => {
                let chosen = choose_branch(&branches);
                for step in chosen {
                    run_step_inline(step, session.clone()).await?;
                }
                Ok(())
            }

            ScenarioStep::Group { steps, .. } => {
                for step in steps {
                    run_step_inline(step, session.clone()).await?;
                }
                Ok(())
            }
        }
    })
}
