use std::hash::BuildHasher;
use std::hash::Hash;

use crate::hash_table::AllocError;
use crate::hash_table::HashTable;
use crate::reducer::DiscardReducer;
use crate::reducer::PlusReducer;
use crate::reducer::Reducer;

/// A key-value map implemented on the offset-indexed Robin Hood
/// [`HashTable`].
///
/// `HashMap<K, V, S, R>` hashes keys with the [`BuildHasher`] `S` and
/// combines the values of colliding inserts through the reducer policy `R`
/// (default: keep the existing value). Keys and values must be `Copy`; the
/// underlying table relocates entries with block memory moves.
///
/// Single-key operations mirror the standard map surface. The batch
/// operations (`insert_batch`, `count_batch`, `find_batch`, `erase_batch`,
/// `update_batch`) run the table's prefetch pipelines and are the intended
/// interface for streaming workloads: a batch insert hashes its input once,
/// sketches it, and presizes the table before moving a single entry.
#[derive(Clone)]
pub struct HashMap<K, V, S, R = DiscardReducer> {
    table: HashTable<K, V, R>,
    hash_builder: S,
}

/// A counting map: colliding inserts sum their values. Inserting every
/// occurrence of a k-mer with value 1 yields per-k-mer multiplicities.
pub type CountMap<K, C, S> = HashMap<K, C, S, PlusReducer>;

impl<K, V, S, R> std::fmt::Debug for HashMap<K, V, S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashMap")
            .field("len", &self.table.len())
            .field("buckets", &self.table.buckets())
            .finish()
    }
}

impl<K, V, S, R> HashMap<K, V, S, R> {
    /// Creates an empty map with the given hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::hash_map::RandomState;
    ///
    /// use rho_map::HashMap;
    ///
    /// let map: HashMap<u64, u32, _> = HashMap::with_hasher(RandomState::new());
    /// assert!(map.is_empty());
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            table: HashTable::new(),
            hash_builder,
        }
    }

    /// Creates an empty map presized for `capacity` entries.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self {
            table: HashTable::with_capacity(capacity),
            hash_builder,
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns how many entries fit before the next capacity doubling.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Removes all entries, keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Bias-corrected estimate of the distinct keys offered to
    /// [`insert_batch`](HashMap::insert_batch) so far.
    pub fn cardinality_estimate(&self) -> f64 {
        self.table.cardinality_estimate()
    }

    /// Sets the load factor below which removals shrink the map.
    pub fn set_min_load_factor(&mut self, factor: f64) {
        self.table.set_min_load_factor(factor);
    }

    /// Sets the load factor at which inserts grow the map.
    pub fn set_max_load_factor(&mut self, factor: f64) {
        self.table.set_max_load_factor(factor);
    }

    /// Sets the look-ahead distance of the batch insert pipeline.
    pub fn set_insert_lookahead(&mut self, lookahead: usize) {
        self.table.set_insert_lookahead(lookahead);
    }

    /// Sets the look-ahead distance of the batch query pipelines (rounded up
    /// to a power of two).
    pub fn set_query_lookahead(&mut self, lookahead: usize) {
        self.table.set_query_lookahead(lookahead);
    }

    /// Occupancy and resize statistics of the underlying table.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> crate::hash_table::TableStats {
        self.table.stats()
    }

    /// Returns an iterator over the entries in payload order.
    ///
    /// The order is neither insertion order nor key order, and is not stable
    /// across mutations.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.table.iter().map(|(key, value)| (key, value))
    }
}

impl<K, V, S, R> HashMap<K, V, S, R>
where
    K: Copy + Eq + Hash,
    V: Copy,
    S: BuildHasher,
    R: Reducer<V>,
{
    /// Ensures capacity for at least `entries` entries without further
    /// resizing.
    pub fn reserve(&mut self, entries: usize) -> Result<(), AllocError> {
        let hash_builder = &self.hash_builder;
        self.table
            .reserve(entries, |key| hash_builder.hash_one(key))
    }

    /// Inserts `(key, value)`. When the key is already present, the reducer
    /// decides what happens to the stored value and the map length does not
    /// change. Returns whether the key was newly inserted.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::hash_map::RandomState;
    ///
    /// use rho_map::HashMap;
    /// use rho_map::ReplaceReducer;
    ///
    /// let mut map: HashMap<u64, u32, _, ReplaceReducer> =
    ///     HashMap::with_hasher(RandomState::new());
    /// assert!(map.insert(1, 10).unwrap());
    /// assert!(!map.insert(1, 20).unwrap());
    /// assert_eq!(map.get(&1), Some(&20));
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, AllocError> {
        let hash = self.hash_builder.hash_one(&key);
        let hash_builder = &self.hash_builder;
        self.table
            .insert(hash, key, value, |key| hash_builder.hash_one(key))
    }

    /// Bulk insert with cardinality presizing and prefetch pipelining.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::hash_map::RandomState;
    ///
    /// use rho_map::CountMap;
    ///
    /// let mut counts: CountMap<u64, u32, _> = CountMap::with_hasher(RandomState::new());
    /// counts.insert_batch(&[(7, 1), (9, 1), (7, 1)]).unwrap();
    /// assert_eq!(counts.get(&7), Some(&2));
    /// ```
    pub fn insert_batch(&mut self, items: &[(K, V)]) -> Result<(), AllocError> {
        let hash_builder = &self.hash_builder;
        self.table
            .insert_batch(items, |key| hash_builder.hash_one(key))
    }

    /// Returns a reference to the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = self.hash_builder.hash_one(key);
        self.table.find(hash, key).map(|(_, value)| value)
    }

    /// Returns a mutable reference to the value stored for `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let hash = self.hash_builder.hash_one(key);
        self.table.find_value_mut(hash, key)
    }

    /// Returns whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hash_builder.hash_one(key);
        self.table.contains(hash, key)
    }

    /// Returns 1 if `key` is present and 0 otherwise.
    pub fn count(&self, key: &K) -> u8 {
        let hash = self.hash_builder.hash_one(key);
        self.table.count(hash, key)
    }

    /// Presence of each key in `keys`, as 0/1, in input order.
    pub fn count_batch(&self, keys: &[K]) -> Vec<u8> {
        let hash_builder = &self.hash_builder;
        self.table
            .count_batch(keys, |key| hash_builder.hash_one(key))
    }

    /// Returns the entries found for `keys`, in probe order.
    pub fn find_batch(&self, keys: &[K]) -> Vec<(K, V)> {
        let mut out = Vec::new();
        self.find_batch_into(keys, &mut out);
        out
    }

    /// Appends the entry of every present key in `keys` to `out`, returning
    /// how many were found.
    pub fn find_batch_into(&self, keys: &[K], out: &mut Vec<(K, V)>) -> usize {
        let hash_builder = &self.hash_builder;
        self.table
            .find_batch_into(keys, |key| hash_builder.hash_one(key), out)
    }

    /// Applies the reducer to the existing value for `key` without inserting
    /// on a miss. Returns whether the key was present.
    pub fn update(&mut self, key: K, value: V) -> bool {
        let hash = self.hash_builder.hash_one(&key);
        self.table.update(hash, &key, value)
    }

    /// Batch [`update`](HashMap::update); returns how many keys were
    /// present.
    pub fn update_batch(&mut self, items: &[(K, V)]) -> usize {
        let hash_builder = &self.hash_builder;
        self.table
            .update_batch(items, |key| hash_builder.hash_one(key))
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = self.hash_builder.hash_one(key);
        let hash_builder = &self.hash_builder;
        self.table
            .erase(hash, key, |key| hash_builder.hash_one(key))
    }

    /// Batch removal; returns the number of entries removed.
    pub fn remove_batch(&mut self, keys: &[K]) -> usize {
        let hash_builder = &self.hash_builder;
        self.table
            .erase_batch(keys, |key| hash_builder.hash_one(key))
    }

    /// Copies the entries out in payload order. This is the record stream
    /// consumed by the benchmarking harness: serializing it little-endian
    /// and headerless reproduces the table's persisted layout.
    pub fn to_vec(&self) -> Vec<(K, V)> {
        self.table.to_vec()
    }

    /// Copies the keys out in payload order.
    pub fn keys(&self) -> Vec<K> {
        self.table.keys()
    }
}
