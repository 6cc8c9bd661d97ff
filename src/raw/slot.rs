use std::sync::atomic::{AtomicPtr, Ordering};

use seize::Guard;

/// An immutable payload record referenced by a slot cell.
///
/// Records are heap-allocated and shared through tagged pointers; the
/// alignment guarantees the low bits of any record pointer are zero,
/// leaving room for the cell tag bits.
#[repr(align(8))]
pub struct Record<T> {
    pub data: T,
}

impl<T> Record<T> {
    /// Allocates a record for the given payload, returning an owned pointer.
    #[inline]
    pub fn boxed(data: T) -> *mut Record<T> {
        Box::into_raw(Box::new(Record { data }))
    }
}

/// Cell tag bits, stored in the low bits of a record pointer.
pub struct Tag;

impl Tag {
    /// The value was logically deleted.
    pub const TOMBSTONE: usize = 0b001;

    /// The cell's contents were forwarded to the successor table.
    ///
    /// On a key cell this bit only ever poisons a never-used slot; on a
    /// value cell it marks the end of the slot's life in this table. No
    /// transition leaves this state.
    pub const COPIED: usize = 0b010;

    /// The value was installed by the migration path and may be freely
    /// overwritten by a normal writer in this table.
    pub const MIGRATED: usize = 0b100;

    /// Mask for the record pointer, ignoring any tag bits.
    pub const MASK: usize = !(Tag::TOMBSTONE | Tag::COPIED | Tag::MIGRATED);

    /// The canonical sentinel for a deleted value cell.
    #[inline]
    pub fn tombstone<T>() -> *mut Record<T> {
        Tag::TOMBSTONE as _
    }

    /// The canonical sentinel for a forwarded cell.
    #[inline]
    pub fn copied<T>() -> *mut Record<T> {
        Tag::COPIED as _
    }
}

/// An unpacked tagged pointer.
pub struct Tagged<T> {
    /// The raw tagged pointer, used as the expected value for a CAS.
    pub raw: *mut T,

    /// The untagged pointer.
    pub ptr: *mut T,
}

impl<T> Tagged<T> {
    /// Returns the tag portion of this pointer.
    #[inline]
    pub fn tag(self) -> usize {
        self.raw.addr() & !Tag::MASK
    }
}

impl<T> Copy for Tagged<T> {}

impl<T> Clone for Tagged<T> {
    fn clone(&self) -> Self {
        *self
    }
}

/// Unpacks a tagged record pointer.
#[inline]
pub fn unpack<T>(raw: *mut Record<T>) -> Tagged<Record<T>> {
    Tagged {
        raw,
        ptr: raw.map_addr(|addr| addr & Tag::MASK),
    }
}

/// The decoded state of a key cell.
///
/// Key cells are write-once: `EMPTY` moves to `LIVE` under any writer, or
/// to the forwarded marker under a migrator that finalizes an empty slot.
pub enum KeyState<T> {
    /// Never written.
    Empty,

    /// Poisoned by a migrator; a probe terminator.
    Copied,

    /// An installed key. The payload never changes for the slot's lifetime.
    Live(Tagged<Record<T>>),
}

impl<T> From<Tagged<Record<T>>> for KeyState<T> {
    #[inline]
    fn from(entry: Tagged<Record<T>>) -> KeyState<T> {
        if !entry.ptr.is_null() {
            KeyState::Live(entry)
        } else if entry.tag() & Tag::COPIED != 0 {
            KeyState::Copied
        } else {
            KeyState::Empty
        }
    }
}

/// The decoded state of a value cell.
pub enum ValueState<T> {
    /// The key has been claimed but the value is not visible yet; the
    /// writer that installed the key is obligated to publish next.
    Empty,

    /// Logically deleted.
    Tombstone,

    /// Forwarded to the successor table; dead here.
    Copied,

    /// A live value written by a normal insert.
    Live(Tagged<Record<T>>),

    /// A live value carried over from the predecessor table.
    Migrated(Tagged<Record<T>>),
}

impl<T> From<Tagged<Record<T>>> for ValueState<T> {
    #[inline]
    fn from(entry: Tagged<Record<T>>) -> ValueState<T> {
        if !entry.ptr.is_null() {
            if entry.tag() & Tag::MIGRATED != 0 {
                ValueState::Migrated(entry)
            } else {
                ValueState::Live(entry)
            }
        } else if entry.tag() & Tag::COPIED != 0 {
            ValueState::Copied
        } else if entry.tag() & Tag::TOMBSTONE != 0 {
            ValueState::Tombstone
        } else {
            ValueState::Empty
        }
    }
}

/// One slot: a pair of independently-atomic cells referencing immutable
/// records. A successful CAS is the commit point for the containing
/// operation and transfers ownership of the displaced record to the caller.
pub struct Slot<K, V> {
    key: AtomicPtr<Record<K>>,
    value: AtomicPtr<Record<V>>,
}

impl<K, V> Default for Slot<K, V> {
    fn default() -> Slot<K, V> {
        Slot {
            key: AtomicPtr::default(),
            value: AtomicPtr::default(),
        }
    }
}

impl<K, V> Slot<K, V> {
    /// Wait-free load of the key cell.
    #[inline]
    pub fn key(&self, guard: &impl Guard) -> KeyState<K> {
        unpack(guard.protect(&self.key, Ordering::SeqCst)).into()
    }

    /// Wait-free load of the value cell.
    #[inline]
    pub fn value(&self, guard: &impl Guard) -> ValueState<V> {
        unpack(guard.protect(&self.value, Ordering::SeqCst)).into()
    }

    /// Attempts to swing the key cell from `current` to `new`.
    ///
    /// On success the slot takes ownership of `new` and the caller takes
    /// responsibility for the displaced record. A failed CAS modifies
    /// nothing.
    #[inline]
    pub fn cas_key(
        &self,
        current: *mut Record<K>,
        new: *mut Record<K>,
    ) -> Result<*mut Record<K>, *mut Record<K>> {
        self.key
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Attempts to swing the value cell from `current` to `new`, with the
    /// same ownership contract as [`Slot::cas_key`].
    #[inline]
    pub fn cas_value(
        &self,
        current: *mut Record<V>,
        new: *mut Record<V>,
    ) -> Result<*mut Record<V>, *mut Record<V>> {
        self.value
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }
}

impl<K, V> Drop for Slot<K, V> {
    fn drop(&mut self) {
        // any record still installed in a cell is owned by that cell.
        // forwarded records were moved to the successor and the cell
        // holds only a marker, so there is no double free.
        let key = unpack(*self.key.get_mut());
        if !key.ptr.is_null() {
            unsafe { drop(Box::from_raw(key.ptr)) }
        }

        let value = unpack(*self.value.get_mut());
        if !value.ptr.is_null() {
            unsafe { drop(Box::from_raw(value.ptr)) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        let record = Record::boxed(7_u64);
        let tagged = unpack(record.map_addr(|addr| addr | Tag::MIGRATED));

        assert_eq!(tagged.ptr, record);
        assert_eq!(tagged.tag(), Tag::MIGRATED);
        assert!(matches!(
            ValueState::from(tagged),
            ValueState::Migrated(found) if found.ptr == record
        ));

        unsafe { drop(Box::from_raw(record)) }
    }

    #[test]
    fn sentinels_decode() {
        assert!(matches!(
            ValueState::from(unpack(Tag::tombstone::<u64>())),
            ValueState::Tombstone
        ));
        assert!(matches!(
            ValueState::from(unpack(Tag::copied::<u64>())),
            ValueState::Copied
        ));
        assert!(matches!(
            KeyState::from(unpack(Tag::copied::<u64>())),
            KeyState::Copied
        ));
        assert!(matches!(
            KeyState::<u64>::from(unpack(std::ptr::null_mut())),
            KeyState::Empty
        ));
    }
}
