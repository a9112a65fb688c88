use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

/// Per-virtual-user attribute store passed through the action chain.
///
/// A session is owned by exactly one virtual user at a time and lives for one
/// chain iteration: the runtime mints a fresh one whenever a user restarts the
/// chain, after completion or failure alike. The handle is cheap to clone so a
/// user's session can follow it from pool to pool; clones share the same
/// underlying store.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    attributes: Mutex<HashMap<String, Value>>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4().to_string(),
                attributes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Unique identifier for this virtual-user session.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Store a value for use by subsequent actions.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.attributes.lock().insert(key.into(), value.into());
    }

    /// Retrieve a value previously stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.attributes.lock().get(key).cloned()
    }

    /// Retrieve a string attribute, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Retrieve an integer attribute, if present and an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.attributes.lock().contains_key(key)
    }

    /// Snapshot of all attributes.
    pub fn attributes(&self) -> HashMap<String, Value> {
        self.inner.attributes.lock().clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("attributes", &*self.inner.attributes.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get() {
        let session = Session::new();
        session.put("token", "abc");
        session.put("count", 3);
        assert_eq!(session.get("token"), Some(json!("abc")));
        assert_eq!(session.get_str("token").as_deref(), Some("abc"));
        assert_eq!(session.get_i64("count"), Some(3));
        assert_eq!(session.get("missing"), None);
    }

    #[test]
    fn test_clones_share_state() {
        let session = Session::new();
        let clone = session.clone();
        clone.put("key", json!({"nested": true}));
        assert!(session.contains("key"));
        assert_eq!(session.id(), clone.id());
    }

    #[test]
    fn test_fresh_sessions_are_distinct() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id(), b.id());
        a.put("only-in-a", 1);
        assert!(!b.contains("only-in-a"));
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let session = Session::new();
        session.put("k", 1);
        session.put("k", 2);
        assert_eq!(session.get_i64("k"), Some(2));
        assert_eq!(session.attributes().len(), 1);
    }
}
