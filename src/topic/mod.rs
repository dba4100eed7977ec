//! Topic matching and subscription management
//!
//! Topic name/filter validation plus a trie-backed subscription store used by
//! the delivery engine to find the recipients of a publication.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_name, TopicError,
};

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribing client
    pub client_id: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
}

/// Thread-safe subscription store backed by the topic trie.
/// Each trie node holds the subscriptions registered for that exact filter.
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add a subscription. A second SUBSCRIBE from the same client to the
    /// same filter replaces the previous entry [MQTT-3.8.4-3].
    pub fn subscribe(&self, filter: &str, subscription: Subscription) {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            subs.retain(|s| s.client_id != subscription.client_id);
            subs.push(subscription);
        } else {
            trie.insert(filter, vec![subscription]);
        }
    }

    /// Remove a client's subscription to a filter.
    /// Returns whether anything was removed.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            let len_before = subs.len();
            subs.retain(|s| s.client_id.as_ref() != client_id);
            let removed = subs.len() != len_before;
            if subs.is_empty() {
                trie.remove(filter);
            }
            removed
        } else {
            false
        }
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Find all subscriptions matching a topic name.
    /// A client subscribed to several overlapping filters appears once per
    /// matching filter; overlap policy is applied by the caller.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        trie.matches(topic, |subs| {
            result.extend(subs.iter().cloned());
        });
        result
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
