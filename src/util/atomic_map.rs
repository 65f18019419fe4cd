use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;


/// A map optimized for wait-free reads at the price of expensive modifications, for maps that
///  are read often and pretty much never modified.
///
/// Readers get a consistent snapshot without any locking. Writers clone the entire map, apply
///  their change to the copy and swap it in atomically, retrying if another writer swapped in
///  the meantime.
pub struct AtomicMap<K, V> {
    map: ArcSwap<FxHashMap<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        AtomicMap {
            map: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.load().get(key).cloned()
    }

    /// a consistent snapshot of the whole map, for iteration
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        self.map.load_full()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    /// Applies an arbitrary modification to the map, copy-on-write style. The closure can be
    ///  called more than once if concurrent updates race, so it must not have side effects.
    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        let mut cur = self.map.load();
        loop {
            let mut modified = (**cur).clone();
            f(&mut modified);

            let prev = self.map.compare_and_swap(&*cur, Arc::new(modified));
            if Arc::ptr_eq(&prev, &cur) {
                return;
            }
            cur = prev;
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Default for AtomicMap<K, V> {
    fn default() -> Self {
        AtomicMap::new()
    }
}
