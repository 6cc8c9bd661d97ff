use crate::raw;
use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

/// The initial capacity is `2^DEFAULT_EXPONENT` slots.
const DEFAULT_EXPONENT: u32 = 5;

/// A table allocates its successor once it is half full.
const DEFAULT_MAX_LOAD_RATIO: f64 = 0.5;

/// The error returned by [`HashMap::at`] for a key without a live binding.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("key not found")]
pub struct NotFound;

/// A concurrent unordered map.
///
/// Many threads may insert, look up, and erase entries in parallel without
/// external locking. The map grows by online, cooperative resizing: when a
/// table passes its load threshold, writers incrementally migrate its
/// entries into a doubled-capacity successor while normal traffic continues.
/// Readers and writers never block on a resize.
///
/// Most operations require a [`Guard`], acquired through [`HashMap::guard`]
/// or the [`HashMap::pin`] API. The guard must come from this map's
/// collector.
///
/// # Examples
///
/// ```rust
/// use cmap::HashMap;
///
/// let map = HashMap::new();
///
/// let guard = map.guard();
/// map.insert(10, 10, &guard);
/// assert_eq!(map.get(&10, &guard), Some(&10));
///
/// map.remove(&10, &guard);
/// assert!(map.at(&10, &guard).is_err());
/// ```
pub struct HashMap<K, V, S = RandomState> {
    raw: raw::HashMap<K, V, S>,
}

// Safety: the map hands out `&V` through shared references and moves keys
// and values across threads when entries are migrated or reclaimed; it
// never exposes owned or mutable references.
unsafe impl<K, V, S> Send for HashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Send,
{
}

unsafe impl<K, V, S> Sync for HashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
}

/// A builder for a [`HashMap`].
///
/// # Examples
///
/// ```rust
/// use cmap::HashMap;
/// use seize::Collector;
/// use std::collections::hash_map::RandomState;
///
/// let map: HashMap<i32, i32> = HashMap::builder()
///     // Start with 2^9 slots.
///     .initial_exponent(9)
///     // Grow once 3/4 full.
///     .max_load_ratio(0.75)
///     // Set the hasher.
///     .hasher(RandomState::new())
///     // Set a custom garbage collector.
///     .collector(Collector::new().batch_size(128))
///     // Construct the hash map.
///     .build();
/// ```
pub struct HashMapBuilder<K, V, S = RandomState> {
    exponent: u32,
    max_load_ratio: f64,
    hasher: S,
    collector: Collector,
    _kv: PhantomData<(K, V)>,
}

impl<K, V> HashMapBuilder<K, V> {
    /// Set the hash builder used to hash keys.
    ///
    /// Warning: `hasher` is normally randomly generated, and is designed to
    /// be resistant to attacks that cause many collisions and very poor
    /// performance. Setting it manually using this function can expose a
    /// DoS attack vector.
    pub fn hasher<S>(self, hasher: S) -> HashMapBuilder<K, V, S> {
        HashMapBuilder {
            hasher,
            exponent: self.exponent,
            max_load_ratio: self.max_load_ratio,
            collector: self.collector,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> HashMapBuilder<K, V, S> {
    /// Set the initial capacity of the map to `2^exponent` slots.
    pub fn initial_exponent(self, exponent: u32) -> Self {
        HashMapBuilder { exponent, ..self }
    }

    /// Set the load ratio at which a table allocates its successor.
    ///
    /// A table grows once its live entry count reaches
    /// `capacity * max_load_ratio`. Must be in `(0, 1]`; `build` panics
    /// otherwise.
    pub fn max_load_ratio(self, max_load_ratio: f64) -> Self {
        HashMapBuilder {
            max_load_ratio,
            ..self
        }
    }

    /// Set the [`seize::Collector`] used for garbage collection.
    ///
    /// Note that all `Guard` references used to access the map must be
    /// produced by the provided `collector`.
    pub fn collector(self, collector: Collector) -> Self {
        HashMapBuilder { collector, ..self }
    }

    /// Construct a [`HashMap`] from the builder, using the configured
    /// options.
    pub fn build(self) -> HashMap<K, V, S> {
        HashMap {
            raw: raw::HashMap::new(
                self.exponent,
                self.max_load_ratio,
                self.hasher,
                self.collector,
            ),
        }
    }
}

impl<K, V, S> fmt::Debug for HashMapBuilder<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMapBuilder")
            .field("exponent", &self.exponent)
            .field("max_load_ratio", &self.max_load_ratio)
            .field("collector", &self.collector)
            .finish()
    }
}

impl<K, V> HashMap<K, V> {
    /// Creates an empty map with the default configuration: 32 slots and a
    /// load ratio of one half.
    ///
    /// # Examples
    ///
    /// ```
    /// use cmap::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// ```
    pub fn new() -> HashMap<K, V> {
        HashMap::builder().build()
    }

    /// Returns a builder for a `HashMap`, for more complex configuration.
    pub fn builder() -> HashMapBuilder<K, V> {
        HashMapBuilder {
            exponent: DEFAULT_EXPONENT,
            max_load_ratio: DEFAULT_MAX_LOAD_RATIO,
            hasher: RandomState::default(),
            collector: Collector::new(),
            _kv: PhantomData,
        }
    }
}

impl<K, V, S: BuildHasher + Default> Default for HashMap<K, V, S> {
    fn default() -> HashMap<K, V, S> {
        HashMap {
            raw: raw::HashMap::new(
                DEFAULT_EXPONENT,
                DEFAULT_MAX_LOAD_RATIO,
                S::default(),
                Collector::new(),
            ),
        }
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Returns a guard for use with this map.
    ///
    /// Note that holding on to a guard prevents garbage collection.
    pub fn guard(&self) -> LocalGuard<'_> {
        self.raw.guard()
    }

    /// Returns an owned guard for use with this map.
    ///
    /// Owned guards implement `Send` and `Sync`, which is useful when the
    /// guard has to be held across an `.await` point or moved between
    /// threads.
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.raw.owned_guard()
    }

    /// Returns a pinned reference to the map that performs operations with
    /// an internal guard.
    pub fn pin(&self) -> HashMapRef<'_, K, V, S> {
        HashMapRef {
            guard: self.raw.guard(),
            map: self,
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: PartialEq,
    S: BuildHasher,
{
    /// Inserts a key-value pair into the map, returning a reference to the
    /// value now associated with the key.
    ///
    /// If the map already had this key with an equal value, the existing
    /// value is kept and returned. An unequal value overwrites the old one,
    /// which is reclaimed once no thread can observe it.
    ///
    /// # Examples
    ///
    /// ```
    /// use cmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.insert(37, "a", &map.guard()), &"a");
    /// assert_eq!(map.insert(37, "b", &map.guard()), &"b");
    /// ```
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g impl Guard) -> &'g V {
        self.raw.insert(key, value, guard)
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form *must* match those for the key type.
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.get(key, guard)
    }

    /// Returns a reference to the value corresponding to the key, or
    /// [`NotFound`] when the key has no live binding.
    ///
    /// # Examples
    ///
    /// ```
    /// use cmap::{HashMap, NotFound};
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(1, "one", &guard);
    /// assert_eq!(map.at(&1, &guard), Ok(&"one"));
    /// assert_eq!(map.at(&2, &guard), Err(NotFound));
    /// ```
    pub fn at<'g, Q>(&'g self, key: &Q, guard: &'g impl Guard) -> Result<&'g V, NotFound>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.get(key, guard).ok_or(NotFound)
    }

    /// Returns `true` if the map contains a live binding for the key.
    pub fn contains_key<Q>(&self, key: &Q, guard: &impl Guard) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key, guard).is_some()
    }

    /// Removes the binding for a key from the map; a no-op when the key is
    /// absent.
    pub fn remove<Q>(&self, key: &Q, guard: &impl Guard)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.remove(key, guard)
    }

    /// Returns the number of live entries in the map.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map contains no live entries.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns the number of slots in the newest table of the map.
    ///
    /// Always a power of two, and non-decreasing over the lifetime of the
    /// map.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Returns the number of tables behind the newest one that still hold
    /// entries to migrate.
    ///
    /// Zero when no resize is in flight. Under continued traffic an
    /// in-progress migration drains and the depth returns to zero.
    pub fn depth(&self) -> usize {
        self.raw.depth()
    }
}

impl<K, V, S, S2> PartialEq<std::collections::HashMap<K, V, S2>> for HashMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: PartialEq,
    S: BuildHasher,
    S2: BuildHasher,
{
    fn eq(&self, other: &std::collections::HashMap<K, V, S2>) -> bool {
        if self.len() != other.len() {
            return false;
        }

        let guard = self.guard();
        other
            .iter()
            .all(|(key, value)| self.get(key, &guard) == Some(value))
    }
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: PartialEq,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

/// A pinned reference to a [`HashMap`].
///
/// Operations on a pinned map run under a guard created when the reference
/// was acquired with [`HashMap::pin`].
pub struct HashMapRef<'map, K, V, S> {
    map: &'map HashMap<K, V, S>,
    guard: LocalGuard<'map>,
}

impl<K, V, S> HashMapRef<'_, K, V, S>
where
    K: Hash + Eq + Clone,
    V: PartialEq,
    S: BuildHasher,
{
    /// Returns a reference to the underlying map.
    pub fn map(&self) -> &HashMap<K, V, S> {
        self.map
    }

    /// Inserts a key-value pair. See [`HashMap::insert`].
    pub fn insert(&self, key: K, value: V) -> &V {
        self.map.raw.insert(key, value, &self.guard)
    }

    /// Returns a reference to the value for this key. See [`HashMap::get`].
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.raw.get(key, &self.guard)
    }

    /// Returns the value for this key or [`NotFound`]. See [`HashMap::at`].
    pub fn at<Q>(&self, key: &Q) -> Result<&V, NotFound>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.raw.get(key, &self.guard).ok_or(NotFound)
    }

    /// Returns `true` if this key has a live binding.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Removes the binding for this key. See [`HashMap::remove`].
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.raw.remove(key, &self.guard)
    }

    /// Returns the number of live entries in the map.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the map contains no live entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the number of slots in the newest table of the map. See
    /// [`HashMap::capacity`].
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Returns the number of tables still holding entries to migrate. See
    /// [`HashMap::depth`].
    pub fn depth(&self) -> usize {
        self.map.depth()
    }
}
