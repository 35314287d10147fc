//! Per-class resource tables.
//!
//! There is one [`ClassTable`] per [`ObjectType`]: a fixed array of
//! [`CommonRecord`]s, a mutex serializing every mutation of the class, and
//! a condition variable used both for the exclusive-delete wait and to
//! announce slot publication.
//!
//! The *published ID* of each slot is additionally mirrored in an atomic
//! cell that may be read without the class lock. The only consumer of that
//! relaxation is hot-path validation - most importantly the timebase helper
//! thread's deletion self-check, which runs under the per-timebase tick
//! gate and must not take a class lock there. A lock-free reader learns
//! nothing about the rest of the record; the class lock plus an ID compare
//! remains the only way to read a record consistently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use arrayvec::ArrayString;
use bitflags::bitflags;

use crate::config::MAX_NAME_LEN;
use crate::id::{self, ObjectId, ObjectType};

/// A fixed-capacity object name, stored inline in the record.
pub type ObjectName = ArrayString<MAX_NAME_LEN>;

bitflags! {
    /// Flag bits of a [`CommonRecord`].
    #[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
    pub struct RecordFlags: u16 {
        /// An exclusive operation is waiting for this slot's refcount to
        /// drain. Set and cleared on the same code path inside the
        /// exclusive acquisition.
        const EXCL_REQ = 0x0001;
    }
}

/// The bookkeeping common to every object, one per slot per class.
#[derive(Debug)]
pub struct CommonRecord {
    name: Option<ObjectName>,
    creator: ObjectId,
    refcount: u16,
    flags: RecordFlags,
    /// Last serial number issued for this slot.
    serial: u32,
}

impl CommonRecord {
    fn new(index: usize) -> Self {
        Self {
            name: None,
            creator: ObjectId::UNDEFINED,
            refcount: 0,
            flags: RecordFlags::empty(),
            serial: index as u32,
        }
    }

    /// The object's name, while the slot is live.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The task that created this object, or `UNDEFINED` if the creating
    /// thread was not registered.
    #[inline]
    pub fn creator(&self) -> ObjectId {
        self.creator
    }

    /// Outstanding shared references held through the `RefCount` lock mode.
    #[inline]
    pub fn refcount(&self) -> u16 {
        self.refcount
    }
}

/// One class's slice of the global resource table.
pub(crate) struct ClassTable {
    ty: ObjectType,
    records: Mutex<Box<[CommonRecord]>>,
    /// Wakes exclusive waiters on refcount drain, and slot-publication
    /// waiters on `finalize_new`/`finalize_delete`.
    cond: Condvar,
    /// Mirror of each slot's published ID, readable without the lock.
    /// Written only while the lock is held.
    active: Box<[AtomicU32]>,
}

impl ClassTable {
    pub(crate) fn new(ty: ObjectType) -> Self {
        let cap = ty.capacity();
        Self {
            ty,
            records: Mutex::new((0..cap).map(CommonRecord::new).collect()),
            cond: Condvar::new(),
            active: (0..cap).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub(crate) fn ty(&self) -> ObjectType {
        self.ty
    }

    /// Lock the class.
    ///
    /// A panic while the lock is held (only possible through a library bug,
    /// never through application callbacks, which run lockless) poisons the
    /// mutex; the tables stay usable for teardown, so the poison is
    /// discarded.
    pub(crate) fn lock(&self) -> TableGuard<'_> {
        TableGuard {
            records: self.records.lock().unwrap_or_else(PoisonError::into_inner),
            table: self,
        }
    }

    /// The published ID of a slot, read without the class lock.
    #[inline]
    pub(crate) fn active_id(&self, index: usize) -> ObjectId {
        ObjectId::from_raw(self.active[index].load(Ordering::Acquire))
    }
}

/// Exclusive access to one class table. Dropping the guard unlocks it.
pub(crate) struct TableGuard<'a> {
    table: &'a ClassTable,
    records: MutexGuard<'a, Box<[CommonRecord]>>,
}

impl<'a> TableGuard<'a> {
    #[inline]
    pub(crate) fn ty(&self) -> ObjectType {
        self.table.ty
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub(crate) fn record(&self, index: usize) -> &CommonRecord {
        &self.records[index]
    }

    /// The published ID of a slot. Equivalent to
    /// [`ClassTable::active_id`], but a read under the lock is also
    /// consistent with the rest of the record.
    #[inline]
    pub(crate) fn active(&self, index: usize) -> ObjectId {
        self.table.active_id(index)
    }

    /// Publish a slot's ID. Holding the guard is what makes this sound.
    pub(crate) fn set_active(&mut self, index: usize, id: ObjectId) {
        self.table.active[index].store(id.as_raw(), Ordering::Release);
    }

    /// Issue a fresh serial for a slot, advancing its generation.
    pub(crate) fn advance_serial(&mut self, index: usize) -> u32 {
        let next = id::advance_serial(self.table.ty, index, self.records[index].serial);
        self.records[index].serial = next;
        next
    }

    pub(crate) fn set_name(&mut self, index: usize, name: Option<ObjectName>) {
        self.records[index].name = name;
    }

    pub(crate) fn set_creator(&mut self, index: usize, creator: ObjectId) {
        self.records[index].creator = creator;
    }

    pub(crate) fn refcount_incr(&mut self, index: usize) {
        let rc = &mut self.records[index].refcount;
        *rc = rc.saturating_add(1);
    }

    /// Decrement a slot's refcount, saturating at zero. Returns the new
    /// count.
    pub(crate) fn refcount_decr(&mut self, index: usize) -> u16 {
        let rc = &mut self.records[index].refcount;
        *rc = rc.saturating_sub(1);
        *rc
    }

    pub(crate) fn flags(&self, index: usize) -> RecordFlags {
        self.records[index].flags
    }

    pub(crate) fn set_flag(&mut self, index: usize, flag: RecordFlags, on: bool) {
        self.records[index].flags.set(flag, on);
    }

    /// Reset a slot to its free state. The serial counter is deliberately
    /// preserved - it is what makes the next occupant's ID fresh.
    pub(crate) fn clear_record(&mut self, index: usize) {
        let serial = self.records[index].serial;
        self.records[index] = CommonRecord {
            serial,
            ..CommonRecord::new(index)
        };
        self.set_active(index, ObjectId::UNDEFINED);
    }

    /// Find the live slot carrying `name`, if any.
    pub(crate) fn find_by_name(&self, name: &str) -> Option<usize> {
        (0..self.capacity()).find(|&i| {
            let id = self.active(i);
            id.is_defined() && id != ObjectId::RESERVED && self.record(i).name() == Some(name)
        })
    }

    /// Find a free slot.
    pub(crate) fn find_free(&self) -> Option<usize> {
        (0..self.capacity()).find(|&i| !self.active(i).is_defined())
    }

    /// Block on the class condition variable, releasing the lock while
    /// waiting. Spurious wakeups are possible; callers loop.
    pub(crate) fn wait(self) -> Self {
        let Self { table, records } = self;
        let records = table
            .cond
            .wait(records)
            .unwrap_or_else(PoisonError::into_inner);
        Self { table, records }
    }

    /// Wake every waiter on the class condition variable.
    pub(crate) fn notify_all(&self) {
        self.table.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_all_free() {
        let table = ClassTable::new(ObjectType::Queue);
        let guard = table.lock();
        assert_eq!(guard.capacity(), ObjectType::Queue.capacity());
        for i in 0..guard.capacity() {
            assert_eq!(guard.active(i), ObjectId::UNDEFINED);
            assert_eq!(guard.record(i).name(), None);
            assert_eq!(guard.record(i).refcount(), 0);
        }
        assert_eq!(guard.find_free(), Some(0));
        assert_eq!(guard.find_by_name("anything"), None);
    }

    #[test]
    fn publication_is_visible_without_lock() {
        let table = ClassTable::new(ObjectType::Mutex);
        let id = ObjectId::compose(ObjectType::Mutex, 7);
        {
            let mut guard = table.lock();
            guard.set_active(7, id);
        }
        assert_eq!(table.active_id(7), id);
        assert_eq!(table.active_id(6), ObjectId::UNDEFINED);
    }

    #[test]
    fn clear_preserves_serial() {
        let table = ClassTable::new(ObjectType::Mutex);
        let mut guard = table.lock();
        let first = guard.advance_serial(2);
        guard.set_name(2, Some(ObjectName::from("m").unwrap()));
        guard.clear_record(2);
        assert_eq!(guard.record(2).name(), None);
        let second = guard.advance_serial(2);
        assert_ne!(first, second);
        assert_eq!(
            first as usize % ObjectType::Mutex.capacity(),
            second as usize % ObjectType::Mutex.capacity()
        );
    }
}
