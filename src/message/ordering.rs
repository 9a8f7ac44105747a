//! Delivery ordering policy
//!
//! Pending references are ordered by priority (highest first), then
//! enqueue timestamp (oldest first), then sequence number. Sequence
//! numbers are unique, so the order is total. Queue browsing, rollback
//! redelivery and dead-letter candidate selection all use this order.

use super::{MessageId, MessageRef};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Sort key under the delivery ordering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    priority: Reverse<u8>,
    timestamp: i64,
    sequence: u64,
}

impl OrderKey {
    pub fn new(priority: u8, timestamp: i64, sequence: u64) -> Self {
        Self {
            priority: Reverse(priority),
            timestamp,
            sequence,
        }
    }

    pub fn of(msg: &MessageRef) -> Self {
        Self::new(msg.priority, msg.timestamp, msg.sequence)
    }
}

/// A set of references kept in delivery order
///
/// Inserting the same message twice keeps the latest copy.
#[derive(Debug, Clone, Default)]
pub struct OrderedRefs {
    refs: BTreeMap<OrderKey, MessageRef>,
}

impl OrderedRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, msg: MessageRef) {
        self.remove(msg.id);
        self.refs.insert(msg.order_key(), msg);
    }

    /// Remove a message by id, returning it if present
    pub fn remove(&mut self, id: MessageId) -> Option<MessageRef> {
        let key = self
            .refs
            .iter()
            .find(|(_, m)| m.id == id)
            .map(|(k, _)| *k)?;
        self.refs.remove(&key)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.refs.values().any(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageRef> {
        self.refs.values()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.refs.values().map(|m| m.id).collect()
    }

    pub fn into_vec(self) -> Vec<MessageRef> {
        self.refs.into_values().collect()
    }
}

impl FromIterator<MessageRef> for OrderedRefs {
    fn from_iter<I: IntoIterator<Item = MessageRef>>(iter: I) -> Self {
        let mut set = OrderedRefs::new();
        for msg in iter {
            set.insert(msg);
        }
        set
    }
}

impl Extend<MessageRef> for OrderedRefs {
    fn extend<I: IntoIterator<Item = MessageRef>>(&mut self, iter: I) {
        for msg in iter {
            self.insert(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DestinationId;
    use proptest::prelude::*;
    use std::cmp::Ordering;

    fn compare(a: &MessageRef, b: &MessageRef) -> Ordering {
        a.order_key().cmp(&b.order_key())
    }

    fn msg(id: u64, priority: u8, ts: i64, seq: u64) -> MessageRef {
        MessageRef::new(MessageId(id), DestinationId::queue("q"))
            .with_priority(priority)
            .with_timestamp(ts)
            .with_sequence(seq)
    }

    #[test]
    fn test_priority_then_timestamp_then_sequence() {
        let set: OrderedRefs = vec![msg(1, 5, 100, 1), msg(2, 5, 100, 2), msg(3, 9, 50, 3)]
            .into_iter()
            .collect();
        assert_eq!(set.ids(), vec![MessageId(3), MessageId(1), MessageId(2)]);
    }

    #[test]
    fn test_older_first_within_priority() {
        let set: OrderedRefs = vec![msg(1, 4, 300, 1), msg(2, 4, 100, 2), msg(3, 4, 200, 3)]
            .into_iter()
            .collect();
        assert_eq!(set.ids(), vec![MessageId(2), MessageId(3), MessageId(1)]);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut set: OrderedRefs = vec![msg(1, 1, 0, 1), msg(2, 8, 0, 2)].into_iter().collect();
        assert_eq!(set.iter().next().map(|m| m.id), Some(MessageId(2)));
        assert!(set.remove(MessageId(2)).is_some());
        assert!(!set.contains(MessageId(2)));
        assert_eq!(set.len(), 1);
        assert!(set.remove(MessageId(99)).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_order_is_total_and_consistent(
            entries in prop::collection::vec((0u8..10, 0i64..1000), 1..40)
        ) {
            let refs: Vec<MessageRef> = entries
                .iter()
                .enumerate()
                .map(|(i, (p, ts))| msg(i as u64, *p, *ts, i as u64))
                .collect();

            for a in &refs {
                for b in &refs {
                    let ab = compare(a, b);
                    prop_assert_eq!(ab, compare(b, a).reverse());
                    if a.id != b.id {
                        prop_assert_ne!(ab, Ordering::Equal);
                    }
                }
            }

            let set: OrderedRefs = refs.iter().cloned().collect();
            prop_assert_eq!(set.len(), refs.len());
            let ordered = set.into_vec();
            for pair in ordered.windows(2) {
                prop_assert!(pair[0].priority >= pair[1].priority);
                if pair[0].priority == pair[1].priority {
                    prop_assert!(pair[0].timestamp <= pair[1].timestamp);
                }
            }
        }
    }
}
