use crate::mqtt::config::QosLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::kind::{PointKind, PointValue, Quality};
use super::PointId;

/// Host-side configuration of one MQTT point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub id: PointId,
    #[serde(default)]
    pub name: String,
    /// Name of the broker this point is scanned by
    pub broker: String,
    pub kind: PointKind,
    /// Topic the point subscribes to
    pub topic: String,
    /// Topic used for controls; blank reuses `topic`
    #[serde(default)]
    pub control_topic: String,
    #[serde(default)]
    pub qos: QosLevel,
}

impl PointConfig {
    pub fn new(id: u32, broker: &str, kind: PointKind, topic: &str) -> Self {
        Self {
            id: PointId(id),
            name: format!("point-{}", id),
            broker: broker.to_string(),
            kind,
            topic: topic.to_string(),
            control_topic: String::new(),
            qos: QosLevel::default(),
        }
    }

    pub fn with_control_topic(mut self, topic: &str) -> Self {
        self.control_topic = topic.to_string();
        self
    }

    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    /// Control topic override, falling back to the subscription topic
    pub fn publish_topic(&self) -> &str {
        if self.control_topic.is_empty() {
            &self.topic
        } else {
            &self.control_topic
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.topic
        } else {
            &self.name
        }
    }
}

/// The bridge's view of a host point: its configuration plus the last value
/// and quality written for it.
#[derive(Debug, Clone, PartialEq)]
pub struct PointEntry {
    pub config: PointConfig,
    pub value: Option<PointValue>,
    pub quality: Quality,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PointEntry {
    pub fn new(config: PointConfig) -> Self {
        Self {
            config,
            value: None,
            quality: Quality::Unknown,
            updated_at: None,
        }
    }

    pub fn id(&self) -> PointId {
        self.config.id
    }

    pub fn kind(&self) -> PointKind {
        self.config.kind
    }

    /// Whether `value`/`quality` differ from the cached pair
    pub fn value_changed(&self, value: &PointValue, quality: Quality) -> bool {
        match &self.value {
            Some(current) => !(current.same_as(value) && self.quality == quality),
            None => true,
        }
    }

    pub fn set_value(&mut self, value: PointValue, quality: Quality) {
        self.value = Some(value);
        self.quality = quality;
        self.updated_at = Some(Utc::now());
    }
}

/// Points owned by one broker session, keyed by id
#[derive(Debug, Clone, Default)]
pub struct PointTable {
    entries: HashMap<PointId, PointEntry>,
}

impl PointTable {
    pub fn from_configs(configs: impl IntoIterator<Item = PointConfig>) -> Self {
        let entries = configs
            .into_iter()
            .map(|config| (config.id, PointEntry::new(config)))
            .collect();
        Self { entries }
    }

    pub fn get(&self, id: PointId) -> Option<&PointEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: PointId) -> Option<&mut PointEntry> {
        self.entries.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Topic subscriptions in ascending point id order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .entries
            .values()
            .map(|entry| Subscription {
                point: entry.id(),
                topic: entry.config.topic.clone(),
                qos: entry.config.qos,
            })
            .collect();
        subs.sort_by_key(|sub| sub.point);
        subs
    }
}

/// One topic filter to subscribe on behalf of a point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub point: PointId,
    pub topic: String,
    pub qos: QosLevel,
}
