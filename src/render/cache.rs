use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use crate::clock::Clock;

struct Entry<V> {
    value: V,
    inserted_at: i64,
}

/// Size-bounded map that evicts the least recently inserted entry, with an
/// optional time-to-live measured from insertion.
pub struct BoundedCache<K, V> {
    capacity: usize,
    ttl_ms: Option<i64>,
    entries: HashMap<K, Entry<V>>,
    order: VecDeque<K>,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    pub fn new(capacity: usize, ttl_ms: Option<i64>, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_ms,
            entries: HashMap::new(),
            order: VecDeque::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = match (self.entries.get(key), self.ttl_ms) {
            (None, _) => return None,
            (Some(entry), Some(ttl)) => self.clock.now_ms() - entry.inserted_at >= ttl,
            (Some(_), None) => false,
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        while self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
        let inserted_at = self.clock.now_ms();
        self.order.push_back(key.clone());
        self.entries.insert(key, Entry { value, inserted_at });
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn evicts_oldest_insert_first() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cache = BoundedCache::new(2, None, clock);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Reading does not refresh position.
        assert_eq!(cache.get(&"a"), Some(&1));
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), Some(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_moves_key_to_back() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cache = BoundedCache::new(2, None, clock);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), Some(&10));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cache = BoundedCache::new(4, Some(100), clock.clone());
        cache.insert("k", "v");
        clock.advance(99);
        assert_eq!(cache.get(&"k"), Some(&"v"));
        clock.advance(1);
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }
}
