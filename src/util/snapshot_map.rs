use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A copy-on-write hash map: reads clone out an immutable `Arc` snapshot, writers build a
///  modified copy under the write lock and swap it in. A snapshot stays valid for as long
///  as the caller holds it, regardless of concurrent updates, and readers only ever hold
///  the lock for the duration of an `Arc` clone.
///
/// This fits tables that are read on every datagram but written only per in-flight message
///  (pending acks, seen acks): iteration works on a snapshot without blocking writers.
pub struct SnapshotMap<K, V> {
    current: RwLock<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for SnapshotMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> SnapshotMap<K, V> {
    pub fn new() -> SnapshotMap<K, V> {
        SnapshotMap {
            current: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    /// Returns the current snapshot. The snapshot is immutable - concurrent updates replace
    ///  the map as a whole and do not affect snapshots already taken.
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        self.current.read().unwrap().clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.current.read().unwrap().get(key).cloned()
    }

    /// Applies `f` to a copy of the map and swaps it in. Writers are serialized; readers
    ///  keep their snapshots.
    pub fn update(&self, f: impl FnOnce(&mut FxHashMap<K, V>)) {
        let mut guard = self.current.write().unwrap();
        let mut copy = (**guard).clone();
        f(&mut copy);
        *guard = Arc::new(copy);
    }

    /// Removes a key, returning its value iff this call was the one that removed it. With
    ///  several racing paths trying to retire the same entry, exactly one caller gets
    ///  `Some` and can act on it.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.current.write().unwrap();
        if !guard.contains_key(key) {
            return None;
        }
        let mut copy = (**guard).clone();
        let removed = copy.remove(key);
        *guard = Arc::new(copy);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_update() {
        let map = SnapshotMap::<u32, u32>::new();
        assert_eq!(None, map.get(&1));

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));

        map.update(|m| {
            m.remove(&1);
        });
        assert_eq!(None, map.get(&1));
    }

    #[test]
    fn test_load_snapshot_isolation() {
        let map = SnapshotMap::<u32, u32>::new();
        map.update(|m| {
            m.insert(1, 2);
        });

        let snapshot = map.load();
        map.update(|m| {
            m.insert(1, 99);
        });

        assert_eq!(Some(&2), snapshot.get(&1));
        assert_eq!(Some(99), map.get(&1));
    }

    #[test]
    fn test_remove_has_exactly_one_winner() {
        let map = SnapshotMap::<u32, u32>::new();
        map.update(|m| {
            m.insert(1, 2);
        });

        assert_eq!(Some(2), map.remove(&1));
        assert_eq!(None, map.remove(&1));
        assert_eq!(None, map.get(&1));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let map = Arc::new(SnapshotMap::<u32, u32>::new());

        let mut threads = Vec::new();
        for t in 0..4u32 {
            let map = map.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    let key = t * 1000 + (i % 50);
                    map.update(|m| {
                        m.insert(key, i);
                    });
                    if i % 2 == 0 {
                        map.remove(&key);
                    }
                }
            }));
        }
        for t in 0..4u32 {
            let map = map.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..2000u32 {
                    let _ = map.get(&(i % 4000));
                    let snapshot = map.load();
                    // the snapshot must stay readable while writers churn
                    for (_, v) in snapshot.iter() {
                        assert!(*v < 500, "t{}: snapshot value out of range", t);
                    }
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }
    }
}
