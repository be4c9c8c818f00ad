//! Topic wildcard matching and the broker-wide subscription index.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::store::Storage;

use super::topic_store_key;

/// Standard `/`-segmented MQTT matching: `+` matches one segment, a
/// trailing `#` matches the rest.
pub fn topic_match(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');
    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some("#"), _) => return filter_segments.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            _ => return false,
        }
    }
}

/// Subscription index: topic filter -> clientId -> qos. Persisted per
/// filter under the topic manager prefix so that publishes from any source
/// reach every matching subscriber across the fleet.
pub struct TopicManager {
    storage: Arc<dyn Storage>,
    index: RwLock<HashMap<String, BTreeMap<String, u8>>>,
}

impl TopicManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, filter: &str, client_id: &str, qos: u8) -> Result<()> {
        let snapshot = {
            let mut index = self.index.write().expect("topic index lock poisoned");
            let entry = index.entry(filter.to_string()).or_default();
            entry.insert(client_id.to_string(), qos);
            entry.clone()
        };
        self.persist(filter, &snapshot)
    }

    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> Result<()> {
        let snapshot = {
            let mut index = self.index.write().expect("topic index lock poisoned");
            let Some(entry) = index.get_mut(filter) else {
                return Ok(());
            };
            entry.remove(client_id);
            if entry.is_empty() {
                index.remove(filter);
                None
            } else {
                Some(entry.clone())
            }
        };
        match snapshot {
            Some(snapshot) => self.persist(filter, &snapshot),
            None => self.storage.delete(&topic_store_key(filter)),
        }
    }

    /// Drop every subscription of one client.
    pub fn remove_client(&self, client_id: &str) -> Result<()> {
        let filters: Vec<String> = {
            let index = self.index.read().expect("topic index lock poisoned");
            index
                .iter()
                .filter(|(_, subs)| subs.contains_key(client_id))
                .map(|(filter, _)| filter.clone())
                .collect()
        };
        for filter in filters {
            self.unsubscribe(&filter, client_id)?;
        }
        Ok(())
    }

    /// All `(clientId, qos)` pairs whose filter matches `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<(String, u8)> {
        let index = self.index.read().expect("topic index lock poisoned");
        let mut result = Vec::new();
        for (filter, subs) in index.iter() {
            if topic_match(filter, topic) {
                for (client, qos) in subs {
                    result.push((client.clone(), *qos));
                }
            }
        }
        result
    }

    fn persist(&self, filter: &str, subs: &BTreeMap<String, u8>) -> Result<()> {
        let value = serde_yaml::to_string(subs)
            .map_err(|e| crate::error::Error::storage(e.to_string()))?;
        self.storage.put(&topic_store_key(filter), &value)
    }
}
