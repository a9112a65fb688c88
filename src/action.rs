use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{ActionError, ConfigError};
use crate::session::Session;

/// A named unit of user-defined work executed against a session.
///
/// Implemented automatically for async closures, so most callers never write
/// the trait by hand:
///
/// ```
/// use stampede::{ActionError, Session};
///
/// let login = |session: Session| async move {
///     session.put("token", "abc");
///     Ok::<(), ActionError>(())
/// };
/// ```
///
/// Returning `Err` marks the execution as a failure; the runtime records it
/// and restarts the user with a fresh session.
pub trait Action: Send + Sync + 'static {
    fn execute(&self, session: Session) -> BoxFuture<'static, Result<(), ActionError>>;
}

impl<F, Fut> Action for F
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
{
    fn execute(&self, session: Session) -> BoxFuture<'static, Result<(), ActionError>> {
        Box::pin(self(session))
    }
}

/// One entry in an action chain: a name, the executable body, and the entry's
/// position. Immutable once inserted.
#[derive(Clone)]
pub struct ActionDefinition {
    name: String,
    action: Arc<dyn Action>,
    index: usize,
}

impl ActionDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish()
    }
}

/// An ordered, immutable chain of named actions forming one iteration of a
/// virtual user's work. When the action at index `i` completes, the action at
/// `i + 1` starts; after the last action the user loops back to index 0 with
/// a fresh session.
#[derive(Clone)]
pub struct ActionChain {
    actions: Arc<Vec<ActionDefinition>>,
}

impl ActionChain {
    pub fn builder() -> ActionChainBuilder {
        ActionChainBuilder { actions: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ActionDefinition> {
        self.actions.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ActionDefinition> {
        self.actions.iter()
    }

    /// Names in chain order (duplicates preserved).
    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name()).collect()
    }
}

impl std::fmt::Debug for ActionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.actions.iter()).finish()
    }
}

pub struct ActionChainBuilder {
    actions: Vec<ActionDefinition>,
}

impl ActionChainBuilder {
    /// Append a named action to the chain.
    pub fn then(self, name: impl Into<String>, action: impl Action) -> Self {
        self.then_shared(name, Arc::new(action))
    }

    pub(crate) fn then_shared(mut self, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        let index = self.actions.len();
        self.actions.push(ActionDefinition {
            name: name.into(),
            action,
            index,
        });
        self
    }

    pub fn build(self) -> Result<ActionChain, ConfigError> {
        if self.actions.is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        if self.actions.iter().any(|a| a.name.trim().is_empty()) {
            return Err(ConfigError::BlankActionName);
        }
        Ok(ActionChain {
            actions: Arc::new(self.actions),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> impl Action {
        |_session: Session| async move { Ok::<(), ActionError>(()) }
    }

    #[test]
    fn test_builder_assigns_indices_in_order() {
        let chain = ActionChain::builder()
            .then("login", noop())
            .then("browse", noop())
            .then("logout", noop())
            .build()
            .unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.action_names(), vec!["login", "browse", "logout"]);
        for (i, def) in chain.iter().enumerate() {
            assert_eq!(def.index(), i);
        }
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert_eq!(
            ActionChain::builder().build().unwrap_err(),
            ConfigError::EmptyChain
        );
    }

    #[test]
    fn test_blank_name_rejected() {
        let err = ActionChain::builder()
            .then("  ", noop())
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::BlankActionName);
    }

    #[tokio::test]
    async fn test_closure_action_runs_against_session() {
        let chain = ActionChain::builder()
            .then("set-token", |session: Session| async move {
                session.put("token", "abc");
                Ok::<(), ActionError>(())
            })
            .build()
            .unwrap();

        let session = Session::new();
        chain
            .get(0)
            .unwrap()
            .action()
            .execute(session.clone())
            .await
            .unwrap();
        assert_eq!(session.get_str("token").as_deref(), Some("abc"));
    }
}
