//! Concurrent session tables keyed by tunnel identity.

use dashmap::{DashMap, mapref::entry::Entry};
use std::hash::Hash;
use std::net::SocketAddr;

/// ConnectionKey identifies one relayed TCP session: the tunnel/client
/// it arrived on plus the request id that client assigned to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub connect_id: u64,
    pub request_id: u32,
}

/// ConnectionKeyUdp identifies one UDP mapping: the tunnel/client plus
/// the source endpoint the datagrams originate from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKeyUdp {
    pub connect_id: u64,
    pub source: SocketAddr,
}

/// Registry is a thread-safe map from session identity to live session
/// state. Values are expected to be cheap handles (usually `Arc`s) so
/// lookups clone them out instead of holding a shard lock.
#[derive(Debug)]
pub struct Registry<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// add inserts `value` only if `key` is vacant; an existing entry is
    /// never overwritten. Returns whether the insert happened.
    pub fn add(&self, key: K, value: V) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn try_get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// remove_if removes the entry only when `predicate` still holds
    /// under the shard lock
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value)
    }

    /// snapshot copies the current entries out so callers can act on them
    /// without holding any lock
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_does_not_overwrite() {
        let registry = Registry::new();
        let key = ConnectionKey {
            connect_id: 7,
            request_id: 1,
        };

        assert!(registry.add(key, "first"));
        assert!(!registry.add(key, "second"));
        assert_eq!(registry.try_get(&key), Some("first"));
    }

    #[test]
    fn keys_differ_by_every_field() {
        let registry = Registry::new();
        registry.add(ConnectionKey { connect_id: 1, request_id: 1 }, 1);
        registry.add(ConnectionKey { connect_id: 1, request_id: 2 }, 2);
        registry.add(ConnectionKey { connect_id: 2, request_id: 1 }, 3);
        assert_eq!(registry.len(), 3);

        let source: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let udp = Registry::new();
        udp.add(ConnectionKeyUdp { connect_id: 1, source }, ());
        assert!(udp.contains(&ConnectionKeyUdp { connect_id: 1, source }));
        assert!(!udp.contains(&ConnectionKeyUdp { connect_id: 2, source }));
    }

    #[test]
    fn remove_if_respects_predicate() {
        let registry = Registry::new();
        registry.add(1u32, 10u32);

        assert_eq!(registry.remove_if(&1, |v| *v > 10), None);
        assert!(registry.contains(&1));
        assert_eq!(registry.remove_if(&1, |v| *v == 10), Some(10));
        assert!(registry.is_empty());
        assert_eq!(registry.remove(&1), None);
    }

    #[test]
    fn concurrent_adds_keep_one_value_per_key() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..100u32).filter(|k| registry.add(*k, i)).count()
                })
            })
            .collect();

        let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(inserted, 100);
        assert_eq!(registry.len(), 100);
    }
}
