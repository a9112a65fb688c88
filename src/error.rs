use thiserror::Error;

/// Errors raised while validating a configuration, scenario, or chain.
/// These are surfaced synchronously at construction; a runtime is never
/// started with an invalid setup.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("number of users must be positive")]
    NonPositiveUsers,

    #[error("connection pool size must be positive")]
    NonPositivePoolSize,

    #[error("action name must not be blank")]
    BlankActionName,

    #[error("action chain must contain at least one action")]
    EmptyChain,

    #[error("scenario name must not be blank")]
    BlankScenarioName,

    #[error("scenario must contain at least one step")]
    EmptyScenario,

    #[error("uniform pause requires min <= max ({min_ms}ms > {max_ms}ms)")]
    InvalidPauseRange { min_ms: u64, max_ms: u64 },

    #[error("random switch must have at least one branch")]
    EmptyRandomSwitch,

    #[error("random switch weight must be finite and non-negative (got {0})")]
    InvalidSwitchWeight(f64),
}

/// Errors from the per-action pool layer.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no pool for action `{0}`")]
    UnknownAction(String),

    #[error("pool initialization requires a running tokio runtime")]
    NoRuntime,
}

/// Outcome of a single action execution.
///
/// `Exit` is the control-flow sentinel raised by `exit_if` steps and
/// exhausted finite feeders. It is counted as a failure but is not an
/// application error, so the runtime restarts the user quietly instead of
/// logging it.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("scenario exit: {0}")]
    Exit(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ActionError {
    /// Build the exit sentinel.
    pub fn exit(reason: impl Into<String>) -> Self {
        ActionError::Exit(reason.into())
    }

    /// Build a genuine failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(anyhow::anyhow!(message.into()))
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, ActionError::Exit(_))
    }
}

/// Errors surfaced through the runtime handle.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("load test failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_sentinel_is_distinguishable() {
        let exit = ActionError::exit("feeder exhausted");
        let failed = ActionError::failed("connection refused");
        assert!(exit.is_exit());
        assert!(!failed.is_exit());
    }

    #[test]
    fn test_anyhow_converts_to_failure() {
        let err: ActionError = anyhow::anyhow!("boom").into();
        assert!(!err.is_exit());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::InvalidPauseRange {
            min_ms: 500,
            max_ms: 100,
        };
        assert!(err.to_string().contains("500ms > 100ms"));
        assert_eq!(
            PoolError::UnknownAction("login".into()).to_string(),
            "no pool for action `login`"
        );
    }
}
