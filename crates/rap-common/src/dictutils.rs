//! Dictionary merging.

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

/// A key-value mapping that can be overlaid with another mapping of the same type.
pub trait Mapping: Clone {
    /// Insert every entry of `other` into `self`, replacing values of colliding keys.
    fn update(&mut self, other: &Self);
}

impl<K, V, S> Mapping for HashMap<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn update(&mut self, other: &Self) {
        self.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

impl<K, V> Mapping for BTreeMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn update(&mut self, other: &Self) {
        self.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

impl Mapping for serde_json::Map<String, serde_json::Value> {
    fn update(&mut self, other: &Self) {
        for (k, v) in other {
            self.insert(k.clone(), v.clone());
        }
    }
}

/// Merges two mappings into a new one. Keys of `b` win on collision; neither input is touched.
pub fn merge<M: Mapping>(a: &M, b: &M) -> M {
    let mut result = a.clone();
    result.update(b);
    result
}
