use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{cmp::Ordering, fmt::Debug, ops::Index};

/// A map that maintains entries in sorted key order, optimized for small
/// collections.
///
/// `SortedVecMap` uses a sorted `SmallVec` internally, which is the right
/// shape for the per-entity maps the ledger carries: publisher feed maps and
/// per-account listings rarely exceed a few dozen entries. Global indices use
/// `BTreeMap` instead.
///
/// # Type Parameters
///
/// - `N`: Inline capacity (default: 8). Number of entries stored on the stack
///   before heap allocation.
///
/// # Ordering Guarantees
///
/// - Keys are always maintained in sorted order by their `Ord` implementation
/// - Iteration order is deterministic and corresponds to key sort order
/// - Duplicate keys are deduplicated (last write wins)
///
/// Deterministic iteration is load-bearing here: median aggregation and
/// listing checks walk these maps, and their results are consensus-visible.
///
/// # Examples
///
/// ```rust
/// # use tidepool::sorted_vec_map::SortedVecMap;
/// let mut map = SortedVecMap::new();
/// map.insert("zebra", 3);
/// map.insert("apple", 1);
/// map.insert("mango", 2);
///
/// // Iteration is in sorted key order
/// let keys: Vec<_> = map.keys().copied().collect();
/// assert_eq!(keys, vec!["apple", "mango", "zebra"]);
///
/// assert_eq!(map.get(&"apple"), Some(&1));
/// assert_eq!(map.remove(&"mango"), Some(2));
/// assert!(!map.contains_key(&"mango"));
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SortedVecMap<K, V, const N: usize = 8> {
    inner: SmallVec<[(K, V); N]>,
}

impl<K: Ord, V> SortedVecMap<K, V> {
    /// Creates an empty `SortedVecMap`.
    pub const fn new() -> Self {
        Self {
            inner: SmallVec::new_const(),
        }
    }

    /// Creates a `SortedVecMap` that holds at least `capacity` elements
    /// without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SmallVec::with_capacity(capacity),
        }
    }

    /// Returns the number of elements in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the map contains no elements.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Clears the map, removing all elements.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Returns `true` if the map contains a value for the specified key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns a reference to the value corresponding to the key.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Returns a mutable reference to the value corresponding to the key.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Inserts a key-value pair into the map, keeping entries sorted.
    ///
    /// Returns the previous value if the key was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        for (i, (k, v)) in self.inner.iter_mut().enumerate() {
            match key.cmp(k) {
                Ordering::Less => {
                    self.inner.insert(i, (key, value));
                    return None;
                }
                Ordering::Equal => {
                    return Some(std::mem::replace(v, value));
                }
                Ordering::Greater => continue,
            }
        }
        // Key is greater than all existing keys
        self.inner.push((key, value));
        None
    }

    /// Removes a key from the map, returning the value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner
            .iter()
            .position(|(k, _)| k == key)
            .map(|pos| self.inner.remove(pos).1)
    }

    /// Retains only the elements specified by the predicate.
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.retain_mut(|(k, v)| f(k, v));
    }

    /// An iterator over the keys of the map, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.iter().map(|(k, _)| k)
    }

    /// An iterator over the values of the map, in key-sorted order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.iter().map(|(_, v)| v)
    }

    /// An iterator over key-value pairs, in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().map(|(k, v)| (k, v))
    }

    /// An iterator over key-value pairs with mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.inner.iter_mut().map(|(k, v)| (&*k, v))
    }
}

impl<K: Ord, V> Extend<(K, V)> for SortedVecMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<K, V, const N: usize> IntoIterator for SortedVecMap<K, V, N> {
    type Item = (K, V);
    type IntoIter = smallvec::IntoIter<[(K, V); N]>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a, K, V> IntoIterator for &'a SortedVecMap<K, V> {
    type Item = &'a (K, V);
    type IntoIter = std::slice::Iter<'a, (K, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for SortedVecMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for SortedVecMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<K: Eq, V: Eq> Eq for SortedVecMap<K, V> {}

impl<K: Ord, V> From<Vec<(K, V)>> for SortedVecMap<K, V> {
    fn from(vec: Vec<(K, V)>) -> Self {
        vec.into_iter().collect()
    }
}

impl<K: Ord, V> Index<&K> for SortedVecMap<K, V> {
    type Output = V;

    fn index(&self, key: &K) -> &Self::Output {
        self.get(key).expect("no entry found for key")
    }
}
