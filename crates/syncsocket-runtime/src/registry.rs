//! Topic registry
//!
//! Each topic holds exactly one prepare callback and one fire callback.
//! Lookup is by exact topic first, then the wildcard; registration order
//! plays no part.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use syncsocket_wire::TopicFilter;

/// Callback receiving an envelope's data
pub type TopicCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callbacks registered for one topic
#[derive(Clone)]
pub struct Subscription {
    pub prepare: TopicCallback,
    pub fire: TopicCallback,
}

impl Subscription {
    pub fn new<P, F>(prepare: P, fire: F) -> Self
    where
        P: Fn(&Value) + Send + Sync + 'static,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Subscription {
            prepare: Arc::new(prepare),
            fire: Arc::new(fire),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

/// Per-channel topic -> callbacks mapping
#[derive(Debug, Default)]
pub struct TopicRegistry {
    exact: HashMap<String, Subscription>,
    wildcard: Option<Subscription>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        TopicRegistry::default()
    }

    /// Register callbacks; returns true if an existing subscription was replaced
    pub fn subscribe(&mut self, filter: TopicFilter, subscription: Subscription) -> bool {
        match filter {
            TopicFilter::Any => self.wildcard.replace(subscription).is_some(),
            TopicFilter::Exact(topic) => self.exact.insert(topic, subscription).is_some(),
        }
    }

    /// Remove a subscription; returns true if one existed
    pub fn unsubscribe(&mut self, filter: &TopicFilter) -> bool {
        match filter {
            TopicFilter::Any => self.wildcard.take().is_some(),
            TopicFilter::Exact(topic) => self.exact.remove(topic).is_some(),
        }
    }

    /// Is `topic` covered by an exact or wildcard subscription?
    pub fn accepts(&self, topic: &str) -> bool {
        self.resolve(topic).is_some()
    }

    /// Subscription for `topic`: exact match first, then wildcard
    pub fn resolve(&self, topic: &str) -> Option<&Subscription> {
        self.exact.get(topic).or(self.wildcard.as_ref())
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + usize::from(self.wildcard.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
