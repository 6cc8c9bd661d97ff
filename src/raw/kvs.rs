use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::{hint, mem};

use seize::Guard;

use super::slot::{KeyState, Record, Slot, Tag, ValueState};

/// The number of slots a single writer forwards per pass through an
/// in-progress migration.
const COPY_BATCH: usize = 8;

/// One open-addressed table of power-of-two capacity, together with its
/// migration machinery.
///
/// A table performs single-key operations on its own slot array, publishes
/// a doubled-capacity successor exactly once when it grows too full, and
/// cooperatively forwards its contents into that successor while normal
/// traffic continues.
pub struct Kvs<K, V> {
    /// The slot array; its length is a power of two.
    slots: Box<[Slot<K, V>]>,

    /// The successor table. Written once via CAS and never changed.
    next: AtomicPtr<Kvs<K, V>>,

    /// The migration cursor, advanced monotonically in batches.
    copy_idx: AtomicUsize,

    /// Set once every slot in this table has been finalized.
    copied: AtomicBool,

    /// Live values in this table alone, not the successor chain.
    ///
    /// Transiently negative when an erase settles before the insert it
    /// displaced finishes its bookkeeping, hence signed.
    live: AtomicIsize,

    /// Readers currently probing this table; gates the head swing.
    readers: AtomicUsize,

    /// Live count at which the successor is allocated.
    resize_at: usize,

    /// The configured load ratio, inherited by successors.
    max_load_ratio: f64,
}

impl<K, V> Kvs<K, V> {
    /// Allocates a table with the given capacity, returning an owned pointer.
    pub fn alloc(capacity: usize, max_load_ratio: f64) -> *mut Kvs<K, V> {
        assert!(capacity.is_power_of_two());
        assert!(
            capacity <= isize::MAX as usize / mem::size_of::<Slot<K, V>>(),
            "`HashMap` exceeded maximum capacity"
        );

        let slots = (0..capacity).map(|_| Slot::default()).collect();

        Box::into_raw(Box::new(Kvs {
            slots,
            next: AtomicPtr::new(ptr::null_mut()),
            copy_idx: AtomicUsize::new(0),
            copied: AtomicBool::new(false),
            live: AtomicIsize::new(0),
            readers: AtomicUsize::new(0),
            resize_at: (capacity as f64 * max_load_ratio).ceil() as usize,
            max_load_ratio,
        }))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    fn slot(&self, i: usize) -> &Slot<K, V> {
        &self.slots[i]
    }

    /// The number of live values in this table alone, saturating at zero.
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst).max(0) as usize
    }

    #[inline]
    fn incr_live(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn decr_live(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether this table is at or above its load threshold.
    #[inline]
    pub fn resize_required(&self) -> bool {
        self.live() >= self.resize_at
    }

    /// Whether every slot in this table has been finalized.
    #[inline]
    pub fn is_copied(&self) -> bool {
        self.copied.load(Ordering::SeqCst)
    }

    /// The number of readers currently inside this table.
    #[inline]
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    /// Registers a reader; the returned guard deregisters on every exit path.
    #[inline]
    fn enter_reader(&self) -> ReaderGuard<'_, K, V> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        ReaderGuard { kvs: self }
    }

    /// Takes the raw successor pointer out of the table during teardown.
    #[inline]
    pub fn take_next(&mut self) -> *mut Kvs<K, V> {
        std::mem::replace(self.next.get_mut(), ptr::null_mut())
    }

    /// Returns the successor table, if one has been published.
    #[inline]
    pub fn next<'g>(&self, guard: &'g impl Guard) -> Option<&'g Kvs<K, V>> {
        let next = guard.protect(&self.next, Ordering::SeqCst);

        // Safety: tables in the chain are retired only after the head has
        // been swung past them, and the guard keeps retired tables live.
        unsafe { next.as_ref() }
    }

    /// Returns the successor table, publishing a doubled-capacity table if
    /// none exists yet.
    ///
    /// At most one installation wins; losers deallocate their speculative
    /// table.
    pub fn get_or_alloc_next<'g>(&self, guard: &'g impl Guard) -> &'g Kvs<K, V> {
        if let Some(next) = self.next(guard) {
            return next;
        }

        let new = Kvs::alloc(self.capacity() << 1, self.max_load_ratio);

        match self
            .next
            .compare_exchange(ptr::null_mut(), new, Ordering::SeqCst, Ordering::SeqCst)
        {
            // Safety: we just installed the allocation into the chain.
            Ok(_) => unsafe { &*new },

            // lost the race; ours was never shared
            Err(found) => unsafe {
                drop(Box::from_raw(new));
                &*found
            },
        }
    }

    /// Claims the next batch of slots to migrate.
    ///
    /// A single CAS attempt per caller: losing the race means another
    /// writer owns the batch, and the caller moves on to its own work.
    fn claim_copy_batch(&self) -> Option<Range<usize>> {
        let start = self.copy_idx.load(Ordering::SeqCst);
        if start >= self.capacity() {
            return None;
        }

        if self
            .copy_idx
            .compare_exchange(
                start,
                start + COPY_BATCH,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return None;
        }

        Some(start..(start + COPY_BATCH).min(self.capacity()))
    }
}

/// Decrements a table's reader count exactly once when dropped.
struct ReaderGuard<'a, K, V> {
    kvs: &'a Kvs<K, V>,
}

impl<K, V> Drop for ReaderGuard<'_, K, V> {
    fn drop(&mut self) {
        self.kvs.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The outcome of claiming a key slot.
enum Claim<'g, K, V> {
    /// A key slot was secured; `true` if the caller's record was installed.
    Slot(&'g Slot<K, V>, bool),

    /// The table cannot host the key: the probe hit a forwarded marker or
    /// exhausted the table. The insert must continue in the successor.
    Moved,
}

/// The outcome of installing a value into a held slot.
enum Install<V> {
    /// The record whose payload is now associated with the key.
    Current(*mut Record<V>),

    /// The slot was finalized by a migrator mid-install; retry in the
    /// successor.
    Retry,

    /// The migrated write was superseded by a newer writer and dropped.
    Dropped,
}

/// A reference to one table in the chain, bundled with the map's hasher so
/// operations can recurse into successors.
pub struct KvsRef<'g, K, V, S> {
    pub kvs: &'g Kvs<K, V>,
    pub build_hasher: &'g S,
}

impl<'g, K, V, S> KvsRef<'g, K, V, S> {
    /// Rebinds this reference to another table in the chain.
    #[inline]
    fn with(&self, kvs: &'g Kvs<K, V>) -> KvsRef<'g, K, V, S> {
        KvsRef {
            kvs,
            build_hasher: self.build_hasher,
        }
    }
}

impl<'g, K, V, S> KvsRef<'g, K, V, S>
where
    K: Hash + Eq + Clone,
    V: PartialEq,
    S: BuildHasher,
{
    #[inline]
    pub fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    /// Inserts a key and value record into this table or a successor.
    ///
    /// `migrated` marks a write coming from the migration path: it may only
    /// land on an empty or migrated value cell, and is dropped when a newer
    /// writer has already superseded it. Normal inserts always commit and
    /// return the record now associated with the key; migrated inserts
    /// return `None` when dropped.
    ///
    /// Ownership: `key_rec` and `value` are owned by the caller until a
    /// successful CAS installs them.
    pub fn insert(
        &self,
        mut key_rec: *mut Record<K>,
        value: *mut Record<V>,
        migrated: bool,
        hash: u64,
        guard: &'g impl Guard,
    ) -> Option<*mut Record<V>> {
        let mut kvs = self.kvs;

        loop {
            // grow when at or above the load threshold
            if kvs.resize_required() {
                kvs.get_or_alloc_next(guard);
            }

            // a successor exists: contribute one batch of migration work,
            // then continue the insert there
            if let Some(next) = kvs.next(guard) {
                self.copy_batch(kvs, next, guard);
                kvs = next;
                continue;
            }

            match self.claim_slot(kvs, key_rec, hash, guard) {
                Claim::Moved => {
                    // the probe wrapped or hit a forwarded marker. ensure a
                    // successor exists so the restart routes into it.
                    kvs.get_or_alloc_next(guard);
                    continue;
                }

                Claim::Slot(slot, installed) => {
                    if installed {
                        key_rec = ptr::null_mut();
                    }

                    match self.install_value(kvs, slot, value, migrated, guard) {
                        Install::Current(record) => {
                            release_spare(key_rec);
                            return Some(record);
                        }

                        Install::Dropped => {
                            release_spare(key_rec);
                            return None;
                        }

                        Install::Retry => {
                            // the slot was forwarded mid-install; follow it
                            // into the successor with a fresh key record
                            if key_rec.is_null() {
                                let KeyState::Live(key) = slot.key(guard) else {
                                    // installed keys never leave the slot
                                    unreachable!()
                                };

                                // Safety: live key records are immutable and
                                // outlive the table they are installed in.
                                key_rec = Record::boxed(unsafe { (*key.ptr).data.clone() });
                            }

                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Probes for a key slot to install into or reuse.
    ///
    /// Probing starts at `hash & (capacity - 1)` and advances linearly with
    /// wrap-around. A lost CAS re-reads the same slot rather than advancing:
    /// the winner may have installed this very key.
    fn claim_slot(
        &self,
        kvs: &'g Kvs<K, V>,
        key_rec: *mut Record<K>,
        hash: u64,
        guard: &'g impl Guard,
    ) -> Claim<'g, K, V> {
        // Safety: the caller owns `key_rec`; installed records are immutable.
        let key = unsafe { &(*key_rec).data };

        let mask = kvs.mask();
        let mut i = hash as usize & mask;
        let mut probes = 0;

        loop {
            let slot = kvs.slot(i);

            match slot.key(guard) {
                KeyState::Empty => match slot.cas_key(ptr::null_mut(), key_rec) {
                    Ok(_) => return Claim::Slot(slot, true),

                    // lost the race; re-evaluate this slot, it may now hold
                    // our key
                    Err(_) => continue,
                },

                // a migrator poisoned this slot; the key, if present
                // anywhere, lives in the successor
                KeyState::Copied => return Claim::Moved,

                KeyState::Live(found) => {
                    // Safety: live key records are immutable while the table
                    // is reachable.
                    if unsafe { (*found.ptr).data == *key } {
                        return Claim::Slot(slot, false);
                    }

                    // give up on a crowded table rather than probing it to
                    // exhaustion while a resize is due
                    probes += 1;
                    if probes == kvs.capacity() || kvs.resize_required() {
                        return Claim::Moved;
                    }

                    i = (i + 1) & mask;
                }
            }
        }
    }

    /// Publishes a value into a held key slot.
    fn install_value(
        &self,
        kvs: &Kvs<K, V>,
        slot: &Slot<K, V>,
        value: *mut Record<V>,
        migrated: bool,
        guard: &'g impl Guard,
    ) -> Install<V> {
        let new = if migrated {
            value.map_addr(|addr| addr | Tag::MIGRATED)
        } else {
            value
        };

        loop {
            match slot.value(guard) {
                ValueState::Empty => {
                    if slot.cas_value(ptr::null_mut(), new).is_ok() {
                        kvs.incr_live();
                        return Install::Current(value);
                    }
                }

                ValueState::Tombstone => {
                    if migrated {
                        return self.drop_migrated(value, guard);
                    }

                    if slot.cas_value(Tag::tombstone(), new).is_ok() {
                        kvs.incr_live();
                        return Install::Current(value);
                    }
                }

                // a migrator finalized this slot under us
                ValueState::Copied => {
                    if migrated {
                        return self.drop_migrated(value, guard);
                    }

                    return Install::Retry;
                }

                ValueState::Live(current) => {
                    if migrated {
                        // a newer writer has already superseded this copy
                        return self.drop_migrated(value, guard);
                    }

                    // Safety: live records are valid for reads under the guard.
                    if unsafe { (*current.ptr).data == (*value).data } {
                        // equal payloads commit without a CAS; ours was
                        // never shared
                        unsafe { drop(Box::from_raw(value)) }
                        return Install::Current(current.ptr);
                    }

                    if slot.cas_value(current.raw, new).is_ok() {
                        // Safety: the CAS made `current` unreachable from
                        // this slot, and we displaced it.
                        unsafe { guard.defer_retire(current.ptr, seize::reclaim::boxed) };
                        return Install::Current(value);
                    }
                }

                ValueState::Migrated(current) => {
                    // a migrated value may be replaced by either path

                    // Safety: live records are valid for reads under the guard.
                    if unsafe { (*current.ptr).data == (*value).data } {
                        // equal payloads commit without a CAS
                        if migrated {
                            // Safety: ours was displaced from the predecessor
                            // by this thread; readers there may still hold it.
                            unsafe { guard.defer_retire(value, seize::reclaim::boxed) };
                        } else {
                            // ours was never shared
                            unsafe { drop(Box::from_raw(value)) }
                        }
                        return Install::Current(current.ptr);
                    }

                    if slot.cas_value(current.raw, new).is_ok() {
                        // Safety: displaced by the CAS above.
                        unsafe { guard.defer_retire(current.ptr, seize::reclaim::boxed) };
                        return Install::Current(value);
                    }
                }
            }

            // lost a race; reload and re-evaluate
        }
    }

    /// Drops a migration write that lost to a newer writer.
    #[cold]
    fn drop_migrated(&self, value: *mut Record<V>, guard: &'g impl Guard) -> Install<V> {
        // Safety: the record was displaced from the predecessor table by
        // this thread, but readers there may still hold references to it.
        unsafe { guard.defer_retire(value, seize::reclaim::boxed) };
        Install::Dropped
    }

    /// Looks up a key in this table or its successors.
    ///
    /// Linearizes at the load of the winning value cell.
    pub fn get<Q>(&self, key: &Q, hash: u64, guard: &'g impl Guard) -> Option<*mut Record<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let kvs = self.kvs;

        // a fully-copied table no longer answers reads
        if kvs.is_copied() {
            let next = kvs.next(guard);
            debug_assert!(next.is_some(), "a copied table must have a successor");
            return self.with(next?).get(key, hash, guard);
        }

        let _reader = kvs.enter_reader();

        let mask = kvs.mask();
        let mut i = hash as usize & mask;
        let mut probes = 0;

        loop {
            let slot = kvs.slot(i);

            match slot.key(guard) {
                // Safety: live key records are immutable under the guard.
                KeyState::Live(found) if unsafe { (*found.ptr).data.borrow() == key } => loop {
                    match slot.value(guard) {
                        ValueState::Live(value) | ValueState::Migrated(value) => {
                            return Some(value.ptr);
                        }

                        // the key is installed but the value is not visible
                        // yet; the writer is obligated to publish next
                        ValueState::Empty => hint::spin_loop(),

                        // dead here; the binding, if any, is in the successor
                        ValueState::Tombstone | ValueState::Copied => {
                            return match kvs.next(guard) {
                                Some(next) => self.with(next).get(key, hash, guard),
                                None => None,
                            };
                        }
                    }
                },

                KeyState::Live(_) => {
                    // bounded probe: a full table defers to the successor
                    probes += 1;
                    if probes == kvs.capacity() {
                        return match kvs.next(guard) {
                            Some(next) => self.with(next).get(key, hash, guard),
                            None => None,
                        };
                    }

                    i = (i + 1) & mask;
                }

                // a terminator: the key is not in this table
                KeyState::Empty | KeyState::Copied => {
                    return match kvs.next(guard) {
                        Some(next) => self.with(next).get(key, hash, guard),
                        None => None,
                    };
                }
            }
        }
    }

    /// Erases a key from this table or its successors by installing a
    /// tombstone. A no-op when the key has no live binding.
    ///
    /// Linearizes at the successful CAS.
    pub fn erase<Q>(&self, key: &Q, hash: u64, guard: &'g impl Guard)
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let kvs = self.kvs;

        let mask = kvs.mask();
        let mut i = hash as usize & mask;
        let mut probes = 0;

        loop {
            let slot = kvs.slot(i);

            match slot.key(guard) {
                // Safety: live key records are immutable under the guard.
                KeyState::Live(found) if unsafe { (*found.ptr).data.borrow() == key } => loop {
                    match slot.value(guard) {
                        // someone already erased it
                        ValueState::Tombstone => return,

                        // the binding migrated; erase it in the successor
                        ValueState::Copied => {
                            let Some(next) = kvs.next(guard) else {
                                // forwarded cells imply a successor
                                unreachable!()
                            };
                            return self.with(next).erase(key, hash, guard);
                        }

                        // an in-flight insert has not published its value;
                        // order this erase before it
                        ValueState::Empty => return,

                        ValueState::Live(value) | ValueState::Migrated(value) => {
                            if slot.cas_value(value.raw, Tag::tombstone()).is_ok() {
                                kvs.decr_live();

                                // Safety: displaced by the CAS above.
                                unsafe {
                                    guard.defer_retire(value.ptr, seize::reclaim::boxed)
                                };
                                return;
                            }

                            // lost a race; re-evaluate
                        }
                    }
                },

                KeyState::Live(_) => {
                    probes += 1;
                    if probes == kvs.capacity() {
                        if let Some(next) = kvs.next(guard) {
                            return self.with(next).erase(key, hash, guard);
                        }
                        return;
                    }

                    i = (i + 1) & mask;
                }

                // a terminator: not in this table, but possibly beyond it
                KeyState::Empty | KeyState::Copied => {
                    if let Some(next) = kvs.next(guard) {
                        return self.with(next).erase(key, hash, guard);
                    }
                    return;
                }
            }
        }
    }

    /// Claims and forwards one batch of slots from `kvs` into `next`.
    ///
    /// The claimant of the final batch sets the table's copied flag.
    pub fn copy_batch(&self, kvs: &'g Kvs<K, V>, next: &'g Kvs<K, V>, guard: &'g impl Guard) {
        let Some(batch) = kvs.claim_copy_batch() else {
            return;
        };

        let end = batch.end;
        debug_assert!(end <= kvs.capacity());

        for i in batch {
            self.copy_slot(kvs, next, i, guard);
        }

        if end == kvs.capacity() {
            kvs.copied.store(true, Ordering::SeqCst);
        }
    }

    /// Finalizes one slot: poisons it if empty, otherwise forwards its live
    /// value into the successor.
    fn copy_slot(&self, kvs: &'g Kvs<K, V>, next: &'g Kvs<K, V>, i: usize, guard: &'g impl Guard) {
        let slot = kvs.slot(i);

        // an empty slot is finalized by poisoning its key cell
        if let KeyState::Empty = slot.key(guard) {
            if slot.cas_key(ptr::null_mut(), Tag::copied()).is_ok() {
                return;
            }

            // a key landed between the read and the CAS; forward its value
        }

        let key = match slot.key(guard) {
            KeyState::Live(key) => key,

            // slots are claimed for migration exactly once
            KeyState::Empty | KeyState::Copied => unreachable!(),
        };

        loop {
            match slot.value(guard) {
                // the in-flight insert that installed the key is obligated
                // to publish the value next
                ValueState::Empty => hint::spin_loop(),

                // another path already finalized the slot
                ValueState::Copied => return,

                ValueState::Tombstone => {
                    if slot.cas_value(Tag::tombstone(), Tag::copied()).is_ok() {
                        return;
                    }
                }

                ValueState::Live(value) | ValueState::Migrated(value) => {
                    if slot.cas_value(value.raw, Tag::copied()).is_ok() {
                        kvs.decr_live();

                        // Safety: live key records are immutable while their
                        // table is reachable.
                        let data = unsafe { &(*key.ptr).data };
                        let key_rec = Record::boxed(data.clone());

                        // the record moves to the successor; a newer write
                        // there supersedes it and drops the copy
                        self.with(next)
                            .insert(key_rec, value.ptr, true, self.hash(data), guard);
                        return;
                    }
                }
            }
        }
    }
}

/// Frees a key record that was never installed.
#[inline]
fn release_spare<K>(key_rec: *mut Record<K>) {
    if !key_rec.is_null() {
        // Safety: a record that lost or skipped its CAS was never shared.
        unsafe { drop(Box::from_raw(key_rec)) }
    }
}
