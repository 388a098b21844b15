//! Topic keys and the topic → connection index

use std::collections::HashSet;
use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::{ChannelId, ThreadId, UserId};

use super::stats::TopicCounts;

/// Broadcast key a connection can be indexed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKey {
    Channel(ChannelId),
    Dm(ThreadId),
    User(UserId),
}

impl TopicKey {
    pub fn kind(&self) -> &'static str {
        match self {
            TopicKey::Channel(_) => "channel",
            TopicKey::Dm(_) => "dm",
            TopicKey::User(_) => "user",
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKey::Channel(id) => write!(f, "channel:{}", id),
            TopicKey::Dm(id) => write!(f, "dm:{}", id),
            TopicKey::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// Topic key → set of connection ids.
///
/// Sets are created on first add and dropped as soon as they become empty,
/// so short-lived topics (one-off DM threads) do not accumulate keys.
#[derive(Default)]
pub struct SubscriptionIndex {
    topics: DashMap<TopicKey, HashSet<Uuid>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the connection was not yet under `key`
    pub fn add(&self, key: TopicKey, conn: Uuid) -> bool {
        self.add_observed(key, conn, |_| {})
    }

    /// Returns true if the connection was under `key`
    pub fn remove(&self, key: &TopicKey, conn: Uuid) -> bool {
        self.remove_observed(key, conn, |_| {})
    }

    /// Like [`add`](Self::add), calling `on_size` with the resulting set size
    /// while the topic is still locked. Only called when the set changed.
    pub fn add_observed(&self, key: TopicKey, conn: Uuid, on_size: impl FnOnce(usize)) -> bool {
        let mut set = self.topics.entry(key).or_default();
        let inserted = set.insert(conn);
        if inserted {
            on_size(set.len());
        }
        inserted
    }

    /// Like [`remove`](Self::remove), calling `on_size` with the remaining set
    /// size while the topic is still locked. Only called when the set changed.
    pub fn remove_observed(&self, key: &TopicKey, conn: Uuid, on_size: impl FnOnce(usize)) -> bool {
        match self.topics.entry(*key) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&conn);
                let remaining = entry.get().len();
                if remaining == 0 {
                    entry.remove();
                }
                if removed {
                    on_size(remaining);
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn members(&self, key: &TopicKey) -> Vec<Uuid> {
        self.topics
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &TopicKey, conn: Uuid) -> bool {
        self.topics
            .get(key)
            .map(|set| set.contains(&conn))
            .unwrap_or(false)
    }

    pub fn count(&self, key: &TopicKey) -> usize {
        self.topics.get(key).map(|set| set.len()).unwrap_or(0)
    }

    pub fn has_topic(&self, key: &TopicKey) -> bool {
        self.topics.contains_key(key)
    }

    pub fn counts(&self) -> TopicCounts {
        let mut counts = TopicCounts::default();
        for entry in self.topics.iter() {
            match entry.key() {
                TopicKey::Channel(_) => counts.channels += 1,
                TopicKey::Dm(_) => counts.dm_threads += 1,
                TopicKey::User(_) => counts.users += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_key_display() {
        assert_eq!(TopicKey::Channel(5).to_string(), "channel:5");
        assert_eq!(TopicKey::Dm(9).to_string(), "dm:9");
        assert_eq!(TopicKey::User(1).to_string(), "user:1");
    }

    #[test]
    fn test_set_created_lazily_and_dropped_when_empty() {
        let index = SubscriptionIndex::new();
        let key = TopicKey::Dm(77);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(!index.has_topic(&key));
        assert!(index.add(key, a));
        assert!(!index.add(key, a));
        assert!(index.add(key, b));
        assert_eq!(index.count(&key), 2);

        assert!(index.remove(&key, a));
        assert!(index.has_topic(&key));
        assert!(index.remove(&key, b));
        assert!(!index.has_topic(&key));

        assert!(!index.remove(&key, b));
    }

    #[test]
    fn test_observed_sizes() {
        let index = SubscriptionIndex::new();
        let key = TopicKey::User(3);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut sizes = Vec::new();

        index.add_observed(key, a, |n| sizes.push(n));
        index.add_observed(key, b, |n| sizes.push(n));
        index.add_observed(key, b, |n| sizes.push(n));
        index.remove_observed(&key, a, |n| sizes.push(n));
        index.remove_observed(&key, b, |n| sizes.push(n));
        index.remove_observed(&key, b, |n| sizes.push(n));

        assert_eq!(sizes, vec![1, 2, 1, 0]);
    }

    #[test]
    fn test_counts_by_kind() {
        let index = SubscriptionIndex::new();
        let conn = Uuid::new_v4();
        index.add(TopicKey::Channel(1), conn);
        index.add(TopicKey::Channel(2), conn);
        index.add(TopicKey::Dm(1), conn);
        index.add(TopicKey::User(1), conn);

        let counts = index.counts();
        assert_eq!(counts.channels, 2);
        assert_eq!(counts.dm_threads, 1);
        assert_eq!(counts.users, 1);
    }
}
