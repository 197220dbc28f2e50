//! Per-connection subscription and observation bookkeeping.
//!
//! A server connection holds two independent instances of [`SubscriptionSet`]:
//! one for event subscriptions and one for property observations. Both map a
//! thing id to either "all affordances" or an explicit set of names.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Wildcard that matches any thing id or affordance name.
pub const WILDCARD: &str = "+";

#[derive(Debug, Clone)]
enum Scope {
    /// All affordances of the thing, set by the subscribe-all operations
    All,
    /// Specific affordance names
    Names(HashSet<String>),
}

/// Which `(thing_id, name)` pairs one connection wants delivered.
///
/// Created empty on connect, mutated only by the (un)subscribe/(un)observe
/// operations of that connection, destroyed on disconnect.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    by_thing: RwLock<HashMap<String, Scope>>,
}

impl SubscriptionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single affordance, or to all of them when `name` is
    /// empty or the wildcard.
    pub fn subscribe(&self, thing_id: &str, name: &str) {
        if name.is_empty() || name == WILDCARD {
            self.subscribe_all(thing_id);
            return;
        }
        let mut map = self.by_thing.write();
        match map.entry(thing_id.to_string()).or_insert_with(|| Scope::Names(HashSet::new())) {
            // subscribe-all already supersedes individual names
            Scope::All => {}
            Scope::Names(names) => {
                names.insert(name.to_string());
            }
        }
    }

    /// Subscribe to every affordance of `thing_id` (empty or "+" for all
    /// things). Supersedes previously subscribed individual names.
    pub fn subscribe_all(&self, thing_id: &str) {
        self.by_thing.write().insert(thing_id.to_string(), Scope::All);
    }

    /// Remove one affordance subscription. Unsubscribing something unknown is
    /// a no-op.
    pub fn unsubscribe(&self, thing_id: &str, name: &str) {
        if name.is_empty() || name == WILDCARD {
            self.unsubscribe_all(thing_id);
            return;
        }
        let mut map = self.by_thing.write();
        if let Some(Scope::Names(names)) = map.get_mut(thing_id) {
            names.remove(name);
            if names.is_empty() {
                map.remove(thing_id);
            }
        }
    }

    /// Remove the subscription entry of `thing_id` entirely.
    pub fn unsubscribe_all(&self, thing_id: &str) {
        self.by_thing.write().remove(thing_id);
    }

    /// Whether a notification for `(thing_id, name)` should be delivered.
    ///
    /// The wildcard "+" in either argument matches any value. Calling with
    /// both arguments empty reports whether any subscription exists at all.
    pub fn is_subscribed(&self, thing_id: &str, name: &str) -> bool {
        let map = self.by_thing.read();
        if thing_id.is_empty() && name.is_empty() {
            return !map.is_empty();
        }
        for (subscribed_thing, scope) in map.iter() {
            let thing_matches = subscribed_thing.is_empty()
                || subscribed_thing == WILDCARD
                || thing_id == WILDCARD
                || subscribed_thing == thing_id;
            if !thing_matches {
                continue;
            }
            match scope {
                Scope::All => return true,
                Scope::Names(names) => {
                    if name == WILDCARD || names.contains(name) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Thing ids with at least one active subscription. Used by the MQTT
    /// adapter to re-subscribe its topics after a reconnect.
    pub fn thing_ids(&self) -> Vec<String> {
        self.by_thing.read().keys().cloned().collect()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.by_thing.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_match() {
        let set = SubscriptionSet::new();
        set.subscribe("thing1", "event1");
        assert!(set.is_subscribed("thing1", "event1"));
        assert!(!set.is_subscribed("thing1", "event2"));
        assert!(!set.is_subscribed("thing2", "event1"));
    }

    #[test]
    fn subscribe_all_supersedes_names() {
        let set = SubscriptionSet::new();
        set.subscribe("thing1", "event1");
        set.subscribe_all("thing1");
        assert!(set.is_subscribed("thing1", "anything"));
    }

    #[test]
    fn empty_thing_means_all_things() {
        let set = SubscriptionSet::new();
        set.subscribe_all("");
        assert!(set.is_subscribed("thing1", "event1"));
        assert!(set.is_subscribed("thing2", "other"));
    }

    #[test]
    fn wildcard_matches() {
        let set = SubscriptionSet::new();
        set.subscribe("thing1", "event1");
        assert!(set.is_subscribed("+", "event1"));
        assert!(set.is_subscribed("thing1", "+"));
    }

    #[test]
    fn any_subscription_probe() {
        let set = SubscriptionSet::new();
        assert!(!set.is_subscribed("", ""));
        set.subscribe("thing1", "event1");
        assert!(set.is_subscribed("", ""));
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let set = SubscriptionSet::new();
        set.unsubscribe("ghost", "nothing");
        set.unsubscribe_all("ghost");
        assert!(!set.is_subscribed("", ""));
    }

    #[test]
    fn unsubscribe_all_clears_thing() {
        let set = SubscriptionSet::new();
        set.subscribe_all("thing1");
        set.unsubscribe_all("thing1");
        assert!(!set.is_subscribed("thing1", "event1"));
    }
}
