//! Topic registry: subscribed topic ⇄ owning point
//!
//! Rebuilt from scratch on every successful connect and cleared on every
//! disconnect, because broker subscriptions do not survive a reconnect.

use std::collections::HashMap;
use tracing::debug;

use crate::error::BridgeError;
use crate::point::PointId;

#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    by_topic: HashMap<String, PointId>,
    by_point: HashMap<PointId, String>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `topic` for `point`; an existing entry is never overwritten.
    pub fn register(&mut self, topic: &str, point: PointId) -> Result<(), BridgeError> {
        if let Some(existing) = self.by_topic.get(topic) {
            return Err(BridgeError::DuplicateTopic {
                topic: topic.to_string(),
                existing: *existing,
            });
        }
        if let Some(old_topic) = self.by_point.insert(point, topic.to_string()) {
            self.by_topic.remove(&old_topic);
        }
        self.by_topic.insert(topic.to_string(), point);
        Ok(())
    }

    pub fn resolve(&self, topic: &str) -> Option<PointId> {
        self.by_topic.get(topic).copied()
    }

    pub fn topic_of(&self, point: PointId) -> Option<&str> {
        self.by_point.get(&point).map(String::as_str)
    }

    pub fn clear(&mut self) {
        if !self.by_topic.is_empty() {
            debug!("Dereferencing {} topics", self.by_topic.len());
        }
        self.by_topic.clear();
        self.by_point.clear();
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    /// Entries sorted by topic
    pub fn snapshot(&self) -> Vec<(String, PointId)> {
        let mut entries: Vec<_> = self
            .by_topic
            .iter()
            .map(|(topic, point)| (topic.clone(), *point))
            .collect();
        entries.sort();
        entries
    }
}
