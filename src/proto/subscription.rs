//! Registry of producer and name prefix subscriptions

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::name::Name;

/// Handle returned when subscribing, used to unsubscribe again.
///
/// Handles are allocated from a counter and never reused.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("#{_0}")]
pub struct SubscriptionHandle(u32);

impl SubscriptionHandle {
    /// The raw handle value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// What a subscription matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Matches every object of producers whose identity starts with `prefix`.
    Producer {
        /// Producer identity prefix.
        prefix: Name,
        /// Also fetch the sequence number after each reported range.
        prefetch: bool,
    },
    /// Matches objects whose name starts with `prefix`, regardless of the producer.
    ///
    /// Matching requires the object name, so these subscriptions need mapping resolution.
    Name {
        /// Object name prefix.
        prefix: Name,
    },
}

impl Scope {
    /// The prefix this scope matches with.
    pub fn prefix(&self) -> &Name {
        match self {
            Scope::Producer { prefix, .. } => prefix,
            Scope::Name { prefix } => prefix,
        }
    }
}

/// A registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Handle of the subscription.
    pub handle: SubscriptionHandle,
    /// What it matches on.
    pub scope: Scope,
}

impl Subscription {
    /// Whether this subscription wants the objects of `producer`.
    ///
    /// Always `false` for name scoped subscriptions.
    pub fn matches_producer(&self, producer: &Name) -> bool {
        matches!(&self.scope, Scope::Producer { prefix, .. } if prefix.is_prefix_of(producer))
    }

    /// Whether this subscription wants an object named `name`.
    ///
    /// Always `false` for producer scoped subscriptions.
    pub fn matches_name(&self, name: &Name) -> bool {
        matches!(&self.scope, Scope::Name { prefix } if prefix.is_prefix_of(name))
    }

    /// Whether the subscription asked for prefetching.
    pub fn prefetch(&self) -> bool {
        matches!(self.scope, Scope::Producer { prefetch: true, .. })
    }
}

/// The two subscription tables, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    last_handle: u32,
    producer: Vec<Subscription>,
    name: Vec<Subscription>,
}

impl Registry {
    /// Subscribe to all objects of producers matching `prefix`.
    pub fn subscribe_to_producer(&mut self, prefix: Name, prefetch: bool) -> SubscriptionHandle {
        let handle = self.next_handle();
        self.producer.push(Subscription {
            handle,
            scope: Scope::Producer { prefix, prefetch },
        });
        handle
    }

    /// Subscribe to all objects whose name matches `prefix`.
    pub fn subscribe_to_prefix(&mut self, prefix: Name) -> SubscriptionHandle {
        let handle = self.next_handle();
        self.name.push(Subscription {
            handle,
            scope: Scope::Name { prefix },
        });
        handle
    }

    /// Remove a subscription.
    ///
    /// Returns `false` if no subscription with this handle exists. The order of the remaining
    /// subscriptions is preserved.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        for table in [&mut self.producer, &mut self.name] {
            if let Some(pos) = table.iter().position(|sub| sub.handle == handle) {
                table.remove(pos);
                return true;
            }
        }
        false
    }

    /// Get a subscription by handle.
    pub fn get(&self, handle: SubscriptionHandle) -> Option<&Subscription> {
        self.producer
            .iter()
            .chain(self.name.iter())
            .find(|sub| sub.handle == handle)
    }

    /// Producer scoped subscriptions, in registration order.
    pub fn producer_subscriptions(&self) -> &[Subscription] {
        &self.producer
    }

    /// Name scoped subscriptions, in registration order.
    pub fn name_subscriptions(&self) -> &[Subscription] {
        &self.name
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.producer.len() + self.name.len()
    }

    /// Whether there are no subscriptions at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_handle(&mut self) -> SubscriptionHandle {
        self.last_handle = self.last_handle.wrapping_add(1);
        SubscriptionHandle(self.last_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_monotonic_across_tables() {
        let mut registry = Registry::default();
        let a = registry.subscribe_to_producer("/p".into(), false);
        let b = registry.subscribe_to_prefix("/a".into());
        let c = registry.subscribe_to_producer("/q".into(), true);
        assert!(a < b && b < c);
        assert!(registry.unsubscribe(b));
        let d = registry.subscribe_to_prefix("/a".into());
        assert!(d > c);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let mut registry = Registry::default();
        let a = registry.subscribe_to_producer("/p".into(), false);
        let b = registry.subscribe_to_producer("/q".into(), false);
        let c = registry.subscribe_to_producer("/r".into(), false);
        assert!(!registry.unsubscribe(SubscriptionHandle(99)));
        assert_eq!(registry.len(), 3);

        assert!(registry.unsubscribe(b));
        assert!(!registry.unsubscribe(b));
        let handles: Vec<_> = registry
            .producer_subscriptions()
            .iter()
            .map(|sub| sub.handle)
            .collect();
        assert_eq!(handles, vec![a, c]);
        assert!(registry.get(b).is_none());
        assert!(registry.get(c).is_some());
    }

    #[test]
    fn matching() {
        let mut registry = Registry::default();
        let p = registry.subscribe_to_producer("/ndn/alice".into(), true);
        let n = registry.subscribe_to_prefix("/chat".into());
        let p = registry.get(p).unwrap();
        let n = registry.get(n).unwrap();
        assert!(p.matches_producer(&"/ndn/alice/laptop".into()));
        assert!(!p.matches_producer(&"/ndn/bob".into()));
        assert!(!p.matches_name(&"/ndn/alice".into()));
        assert!(p.prefetch());
        assert!(n.matches_name(&"/chat/room/1".into()));
        assert!(!n.matches_producer(&"/chat".into()));
        assert!(!n.prefetch());
    }
}
