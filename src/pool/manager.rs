use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::info;

use crate::action::ActionChain;
use crate::config::RuntimeConfig;
use crate::error::PoolError;
use crate::pool::ActionPool;

/// Owns one [`ActionPool`] per distinct action name in the chain.
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<ActionPool>>>,
}

impl PoolManager {
    /// Create a pool for every distinct action name, each sized to the
    /// configured connection pool size. Must run inside a tokio runtime; the
    /// pools capture its handle for dispatching work.
    pub fn initialize(chain: &ActionChain, config: &RuntimeConfig) -> Result<Self, PoolError> {
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let mut pools: HashMap<String, Arc<ActionPool>> = HashMap::new();
        for def in chain.iter() {
            pools.entry(def.name().to_string()).or_insert_with(|| {
                Arc::new(ActionPool::new(
                    def.name(),
                    config.connection_pool_size(),
                    config.worker_mode(),
                    handle.clone(),
                ))
            });
        }
        info!(
            "initialized {} action pools (size {} each)",
            pools.len(),
            config.connection_pool_size()
        );
        Ok(PoolManager {
            pools: RwLock::new(pools),
        })
    }

    /// Look up the pool for an action.
    pub fn pool(&self, action_name: &str) -> Result<Arc<ActionPool>, PoolError> {
        self.pools
            .read()
            .get(action_name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownAction(action_name.to_string()))
    }

    /// All pools, for metrics collection.
    pub fn all_pools(&self) -> Vec<Arc<ActionPool>> {
        self.pools.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Shut down all pools and clear the registry. Idempotent.
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<ActionPool>> = {
            let mut map = self.pools.write();
            map.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::error::ActionError;
    use crate::session::Session;

    fn noop() -> impl Action {
        |_s: Session| async move { Ok::<(), ActionError>(()) }
    }

    fn chain() -> ActionChain {
        ActionChain::builder()
            .then("login", noop())
            .then("browse", noop())
            .then("login", noop()) // duplicate name shares a pool
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_one_pool_per_distinct_name() {
        let config = RuntimeConfig::builder().connection_pool_size(7).build().unwrap();
        let manager = PoolManager::initialize(&chain(), &config).unwrap();
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.pool("login").unwrap().max_size(), 7);
        assert_eq!(manager.pool("browse").unwrap().max_size(), 7);
    }

    #[tokio::test]
    async fn test_unknown_action_is_descriptive_error() {
        let config = RuntimeConfig::default();
        let manager = PoolManager::initialize(&chain(), &config).unwrap();
        let err = manager.pool("missing").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry_and_is_idempotent() {
        let config = RuntimeConfig::default();
        let manager = PoolManager::initialize(&chain(), &config).unwrap();
        let login = manager.pool("login").unwrap();
        manager.shutdown().await;
        assert!(manager.is_empty());
        assert!(login.is_shutdown());
        assert!(manager.pool("login").is_err());
        manager.shutdown().await;
        assert!(manager.is_empty());
    }
}
