//! Topic matching and subscription management
//!
//! Implements topic name/filter validation and a topic trie for efficient
//! subscription matching.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_filter_with_max_levels,
    validate_topic_name, validate_topic_name_with_max_levels, TopicLevel,
};

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Client ID
    pub client_id: Arc<str>,
    /// Subscription QoS
    pub qos: QoS,
}

/// Thread-safe subscription store using topic trie
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add a subscription
    pub fn subscribe(&self, filter: &str, subscription: Subscription) {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            subs.retain(|s| s.client_id != subscription.client_id);
            subs.push(subscription);
        } else {
            trie.insert(filter, vec![subscription]);
        }
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        let removed = if let Some(subs) = trie.get_mut(filter) {
            let len_before = subs.len();
            subs.retain(|s| s.client_id.as_ref() != client_id);
            let removed = subs.len() != len_before;
            if subs.is_empty() {
                trie.remove(filter);
            }
            removed
        } else {
            false
        };
        removed
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Find all matching subscriptions for a topic
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        trie.matches(topic, |subs| {
            result.extend(subs.iter().cloned());
        });
        result
    }

    /// Find all matching subscriptions using a callback to avoid allocation
    pub fn matches_with_callback<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Subscription),
    {
        let trie = self.trie.read();
        trie.matches(topic, |subs| {
            for sub in subs {
                callback(sub);
            }
        });
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
