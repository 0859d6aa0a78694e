//! Bidirectional feature ⇄ topic table
//!
//! A device owns two pools: `i_chans` for the topics it publishes on and
//! `o_chans` for the topics it subscribes to. Inbound deliveries are resolved
//! through the reverse index, outbound pushes through the forward one.

use std::collections::HashMap;

use crate::error::PoolError;

/// Feature id reserved for the built-in control channel
pub const CTRL: &str = "ctrl";

/// Mapping between feature ids and transport topics
///
/// Both directions are updated together. A topic belongs to at most one
/// feature and a feature holds at most one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelPool {
    topics: HashMap<String, String>,
    features: HashMap<String, String>,
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `feature → topic`, replacing any previous mapping of either side
    pub fn set(&mut self, feature: impl Into<String>, topic: impl Into<String>) {
        let feature = feature.into();
        let topic = topic.into();

        if let Some(old_topic) = self.topics.remove(&feature) {
            self.features.remove(&old_topic);
        }
        if let Some(previous_owner) = self.features.remove(&topic) {
            self.topics.remove(&previous_owner);
        }

        self.features.insert(topic.clone(), feature.clone());
        self.topics.insert(feature, topic);
    }

    /// Removes a feature and its topic, returning the topic
    pub fn remove(&mut self, feature: &str) -> Result<String, PoolError> {
        let topic = self
            .topics
            .remove(feature)
            .ok_or_else(|| PoolError::NotFound(feature.to_string()))?;
        self.features.remove(&topic);
        Ok(topic)
    }

    pub fn topic_of(&self, feature: &str) -> Option<&str> {
        self.topics.get(feature).map(String::as_str)
    }

    pub fn feature_of(&self, topic: &str) -> Option<&str> {
        self.features.get(topic).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.topics.iter().map(|(f, t)| (f.as_str(), t.as_str()))
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.features.clear();
    }
}
