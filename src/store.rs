//! Key-value storage contract used for durable state.
//!
//! The clustered implementation lives outside this crate; the core only
//! depends on this narrow interface. [`MemoryStore`] backs tests and
//! single-node runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Narrow storage contract: string keys to string values, prefix scans and
/// prefix watching.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// All entries whose key starts with `prefix`.
    fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    fn put(&self, key: &str, value: &str) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// A watch stream delivering the full prefix map after each change.
    fn sync_prefix(&self, prefix: &str) -> Result<watch::Receiver<BTreeMap<String, String>>>;
}

struct MemoryInner {
    data: BTreeMap<String, String>,
    watchers: Vec<(String, watch::Sender<BTreeMap<String, String>>)>,
}

/// In-memory [`Storage`] implementation.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                data: BTreeMap::new(),
                watchers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::storage("memory store lock poisoned"))
    }
}

fn prefix_map(data: &BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    data.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl MemoryInner {
    fn notify(&mut self, changed_key: &str) {
        self.watchers.retain(|(prefix, tx)| {
            if !changed_key.starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            tx.send(prefix_map(&self.data, prefix)).is_ok()
        });
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.data.get(key).cloned())
    }

    fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        Ok(prefix_map(&self.lock()?.data, prefix))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.data.insert(key.to_string(), value.to_string());
        inner.notify(key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.data.remove(key);
        inner.notify(key);
        Ok(())
    }

    fn sync_prefix(&self, prefix: &str) -> Result<watch::Receiver<BTreeMap<String, String>>> {
        let mut inner = self.lock()?;
        let (tx, rx) = watch::channel(prefix_map(&inner.data, prefix));
        inner.watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("/a/1", "x").unwrap();
        assert_eq!(store.get("/a/1").unwrap().as_deref(), Some("x"));
        store.delete("/a/1").unwrap();
        assert_eq!(store.get("/a/1").unwrap(), None);
    }

    #[test]
    fn test_get_prefix() {
        let store = MemoryStore::new();
        store.put("/mqtt/topicMgr/topic/a", "1").unwrap();
        store.put("/mqtt/topicMgr/topic/b", "2").unwrap();
        store.put("/mqtt/sessionMgr/clientID/c1", "3").unwrap();
        let map = store.get_prefix("/mqtt/topicMgr/").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("/mqtt/topicMgr/topic/a").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_sync_prefix_sees_changes() {
        let store = MemoryStore::new();
        let mut rx = store.sync_prefix("/t/").unwrap();
        assert!(rx.borrow().is_empty());

        store.put("/t/one", "1").unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);

        store.put("/other", "x").unwrap();
        store.put("/t/two", "2").unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 2);
    }
}
