mod kvs;
mod slot;

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicPtr, Ordering};

use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use self::kvs::{Kvs, KvsRef};
use self::slot::Record;

/// A lock-free hash map that grows through a chain of tables.
///
/// The head points at the entry table of the chain. While a migration is in
/// progress the chain is more than one table long and operations follow the
/// successor pointers transparently; once the head table is fully copied and
/// quiescent, the head swings forward and the old table is retired.
pub struct HashMap<K, V, S> {
    /// Collector for safe memory reclamation.
    collector: Collector,

    /// The entry point of the table chain. Only ever advances forward
    /// along successor pointers.
    head: AtomicPtr<Kvs<K, V>>,

    /// The hasher shared by every table in the chain.
    build_hasher: S,
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates a map with an initial capacity of `2^exponent` and the given
    /// load ratio.
    ///
    /// Panics when the load ratio is outside `(0, 1]`: the trigger would
    /// either fire constantly or never, which is a configuration bug.
    pub fn new(exponent: u32, max_load_ratio: f64, build_hasher: S, collector: Collector) -> Self {
        assert!(
            max_load_ratio > 0.0 && max_load_ratio <= 1.0,
            "max load ratio must be in (0, 1]"
        );
        assert!(exponent < usize::BITS, "initial exponent too large");

        let head = Kvs::alloc(1 << exponent, max_load_ratio);

        HashMap {
            collector,
            head: AtomicPtr::new(head),
            build_hasher,
        }
    }

    /// Returns a guard for operating on this map.
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Returns an owned guard for operating on this map.
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.collector.enter_owned()
    }

    /// Returns a reference to the collector.
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Asserts that a guard was created from this map's collector.
    #[inline]
    fn verify(&self, guard: &impl Guard) {
        assert_eq!(
            *guard.collector(),
            self.collector,
            "attempted to access the map with a guard from a different collector"
        );
    }

    /// Returns a reference to the current head table.
    #[inline]
    fn head<'g>(&self, guard: &'g impl Guard) -> &'g Kvs<K, V> {
        let head = guard.protect(&self.head, Ordering::SeqCst);

        // Safety: the head is never null, and a retired head outlives every
        // guard that could still reach it.
        unsafe { &*head }
    }

    #[inline]
    fn as_ref<'g>(&'g self, kvs: &'g Kvs<K, V>) -> KvsRef<'g, K, V, S> {
        KvsRef {
            kvs,
            build_hasher: &self.build_hasher,
        }
    }

    /// Swings the head past a fully-migrated table and retires it.
    ///
    /// The head moves only when the successor exists, every slot has been
    /// finalized, and no reader is inside the table. At most one thread wins
    /// the swing; everyone else returns without changes.
    fn try_advance_head(&self, guard: &impl Guard) {
        let head = guard.protect(&self.head, Ordering::SeqCst);

        // Safety: the head is never null.
        let kvs = unsafe { &*head };

        let Some(next) = kvs.next(guard) else {
            return;
        };

        if !kvs.is_copied() || kvs.readers() != 0 {
            return;
        }

        let next = next as *const Kvs<K, V> as *mut Kvs<K, V>;

        if self
            .head
            .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Safety: the old head is no longer reachable through the map;
            // in-flight operations hold guards.
            unsafe { guard.defer_retire(head, seize::reclaim::boxed) };
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: PartialEq,
    S: BuildHasher,
{
    /// Inserts a key-value pair, returning a reference to the value now
    /// associated with the key.
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g impl Guard) -> &'g V {
        self.verify(guard);
        self.try_advance_head(guard);

        let head = self.as_ref(self.head(guard));
        let hash = head.hash(&key);

        let record = head.insert(Record::boxed(key), Record::boxed(value), false, hash, guard);

        match record {
            // Safety: a committed record is valid for reads under the guard.
            Some(record) => unsafe { &(*record).data },

            // normal inserts always commit somewhere in the chain
            None => unreachable!(),
        }
    }

    /// Returns a reference to the value associated with the key.
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.verify(guard);
        self.try_advance_head(guard);

        let head = self.as_ref(self.head(guard));
        let hash = head.hash(key);

        head.get(key, hash, guard)
            // Safety: a live record is valid for reads under the guard.
            .map(|record| unsafe { &(*record).data })
    }

    /// Removes the binding for the key, if one exists.
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g impl Guard)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.verify(guard);
        self.try_advance_head(guard);

        let head = self.as_ref(self.head(guard));
        let hash = head.hash(key);

        head.erase(key, hash, guard);
    }

    /// The number of live bindings, summed down the chain.
    pub fn len(&self) -> usize {
        let guard = self.collector.enter();
        self.try_advance_head(&guard);

        let mut len = 0;
        let mut kvs = Some(self.head(&guard));

        while let Some(table) = kvs {
            len += table.live();
            kvs = table.next(&guard);
        }

        len
    }

    /// Whether the map holds no live bindings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The slot count of the deepest table in the chain.
    pub fn capacity(&self) -> usize {
        let guard = self.collector.enter();
        self.try_advance_head(&guard);

        let mut kvs = self.head(&guard);
        while let Some(next) = kvs.next(&guard) {
            kvs = next;
        }

        kvs.capacity()
    }

    /// The number of successor links between the head and the deepest
    /// table; zero once all migration work has concluded and the head has
    /// been swung.
    pub fn depth(&self) -> usize {
        let guard = self.collector.enter();
        self.try_advance_head(&guard);

        let mut depth = 0;
        let mut kvs = self.head(&guard);

        while let Some(next) = kvs.next(&guard) {
            depth += 1;
            kvs = next;
        }

        depth
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        let mut raw = *self.head.get_mut();

        while !raw.is_null() {
            // Safety: drop has exclusive access, and every table in the
            // chain is owned exactly once by its predecessor's successor
            // pointer or by the head.
            let mut kvs = unsafe { Box::from_raw(raw) };
            raw = kvs.take_next();
        }
    }
}
