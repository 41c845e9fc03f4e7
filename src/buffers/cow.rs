use std::hash::Hash;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

/// A copy-on-write list: mutation clones the current contents, applies the
///  change, and swaps in the fresh immutable snapshot under a short-lived lock.
///  Readers clone out the `Arc` and iterate without holding any lock, so they
///  never observe a partially mutated list.
pub struct CowList<T> {
    items: Mutex<Arc<Vec<T>>>,
}

impl<T: Clone + Send + Sync> Default for CowList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> CowList<T> {
    pub fn new() -> CowList<T> {
        CowList {
            items: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.items.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Vec<T>)) {
        let mut guard = self.items.lock().unwrap();
        let mut items = guard.as_ref().clone();
        f(&mut items);
        *guard = Arc::new(items);
    }
}

/// The map counterpart of [CowList], keyed lookups against an immutable
///  snapshot with copy-on-write mutation.
pub struct CowMap<K, V> {
    map: Mutex<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone + Send + Sync, V: Clone + Send + Sync> Default for CowMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Send + Sync, V: Clone + Send + Sync> CowMap<K, V> {
    pub fn new() -> CowMap<K, V> {
        CowMap {
            map: Mutex::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.update(|m| {
            m.insert(key.clone(), value.clone());
        });
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.map.lock().unwrap();
        if !guard.contains_key(key) {
            return None;
        }
        let mut map = guard.as_ref().clone();
        let prev = map.remove(key);
        *guard = Arc::new(map);
        prev
    }

    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        self.map.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        let mut guard = self.map.lock().unwrap();
        let mut map = guard.as_ref().clone();
        f(&mut map);
        *guard = Arc::new(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_update() {
        let list = CowList::<u32>::new();

        list.update(|items| items.push(1));
        list.update(|items| items.insert(0, 2));

        assert_eq!(*list.snapshot(), vec![2, 1]);
    }

    #[test]
    fn test_list_snapshot_isolation() {
        let list = CowList::<u32>::new();
        list.update(|items| items.push(1));

        let snapshot = list.snapshot();
        list.update(|items| items.push(2));

        assert_eq!(*snapshot, vec![1]);
        assert_eq!(*list.snapshot(), vec![1, 2]);
    }

    #[test]
    fn test_map_insert_get() {
        let map = CowMap::<u32, u32>::new();

        map.insert(1, 2);
        assert_eq!(Some(2), map.get(&1));
        assert_eq!(None, map.get(&2));
    }

    #[test]
    fn test_map_remove() {
        let map = CowMap::<u32, &str>::new();
        map.insert(1, "one");

        assert_eq!(Some("one"), map.remove(&1));
        assert_eq!(None, map.remove(&1));
        assert_eq!(None, map.get(&1));
    }
}
