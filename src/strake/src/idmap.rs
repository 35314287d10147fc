//! The object identifier manager.
//!
//! This module implements the allocation, lookup, and teardown protocol
//! shared by every object class. The pattern every create path follows is:
//!
//! ```text
//! allocate_new ──(class stays locked)──▶ populate the class-specific
//!     entry ──▶ call the host kernel ──▶ finalize_new (unlocks)
//! ```
//!
//! and every delete path:
//!
//! ```text
//! get_object(Exclusive) ──▶ call the host kernel ──▶ finalize_delete
//! ```
//!
//! Holding the class lock from allocation through finalization is what
//! makes a half-created object invisible: until `finalize_new` publishes
//! the real ID, the slot holds [`ObjectId::RESERVED`] and no lookup can
//! match it. If the host kernel call fails in between, `finalize_new`
//! returns the slot to the free state and nothing was ever observable.
//!
//! No caller may hold a class lock across a blocking operation, with one
//! exception: the exclusive-delete wait built into
//! [`LockMode::Exclusive`], which parks on the class condition variable
//! until the slot's refcount drains.

use crate::config;
use crate::error::{ErrorCode, OsResult};
use crate::id::{ObjectId, ObjectType};
use crate::table::{CommonRecord, ObjectName, RecordFlags, TableGuard};
use crate::Osal;

/// What a lookup should do with the class lock on success.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockMode {
    /// Validate, then unlock. The caller gets no protection against a
    /// concurrent delete; suitable only for reads that the underlying host
    /// primitive synchronizes itself.
    None,
    /// Leave the class locked. The caller must drop the returned guard
    /// promptly and must not block while holding it.
    Global,
    /// Like [`Global`](Self::Global), but waits until the slot's refcount
    /// reaches zero first. This is the delete-side handshake.
    Exclusive,
    /// Increment the slot's refcount and unlock. The object cannot be
    /// deleted until a matching [`Osal::refcount_decr`] runs.
    RefCount,
}

/// A slot reserved by [`Osal::allocate_new`], with its class still locked.
///
/// This value is the lock: the allocation is completed (or abandoned) by
/// passing it to [`Osal::finalize_new`].
pub struct NewSlot<'a> {
    guard: TableGuard<'a>,
    index: usize,
    name: ObjectName,
}

impl NewSlot<'_> {
    /// The slot index within the class table, for populating the
    /// class-specific entry and addressing the host kernel.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// The result of a successful lookup.
///
/// For [`LockMode::Global`] and [`LockMode::Exclusive`] this value holds
/// the class lock; dropping it unlocks. For the other modes it is just the
/// resolved slot.
pub struct Acquired<'a> {
    id: ObjectId,
    index: usize,
    guard: Option<TableGuard<'a>>,
}

impl Acquired<'_> {
    /// The ID that was validated.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The slot index within the class table.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The common record, readable while the class lock is held. `None`
    /// for the lock modes that release the lock before returning.
    pub fn record(&self) -> Option<&CommonRecord> {
        self.guard.as_ref().map(|g| g.record(self.index))
    }

    /// Release the class lock (a no-op for the unlocked modes).
    pub fn unlock(self) {}
}

fn validate_name(name: &str) -> OsResult<ObjectName> {
    if name.is_empty() {
        // The degenerate analog of a null name pointer
        return Err(ErrorCode::InvalidPointer);
    }
    if name.len() >= config::MAX_NAME_LEN {
        return Err(ErrorCode::NameTooLong);
    }
    ObjectName::from(name).map_err(|_| ErrorCode::NameTooLong)
}

/// Escalate a validated slot according to `mode`. On entry the class is
/// locked and `guard.active(index) == id` has been established.
fn convert_lock<'a>(
    mut guard: TableGuard<'a>,
    mode: LockMode,
    index: usize,
    id: ObjectId,
) -> OsResult<Acquired<'a>> {
    match mode {
        LockMode::None => Ok(Acquired {
            id,
            index,
            guard: None,
        }),
        LockMode::Global => Ok(Acquired {
            id,
            index,
            guard: Some(guard),
        }),
        LockMode::Exclusive => {
            while guard.record(index).refcount() > 0 {
                guard.set_flag(index, RecordFlags::EXCL_REQ, true);
                guard = guard.wait();
                // The object may be gone by the time we are signalled
                if guard.active(index) != id {
                    return Err(ErrorCode::InvalidId);
                }
            }
            guard.set_flag(index, RecordFlags::EXCL_REQ, false);
            Ok(Acquired {
                id,
                index,
                guard: Some(guard),
            })
        }
        LockMode::RefCount => {
            guard.refcount_incr(index);
            Ok(Acquired {
                id,
                index,
                guard: None,
            })
        }
    }
}

impl Osal {
    /// Reserve a slot in `ty`'s table under `name`.
    ///
    /// On success the class is left locked; the caller populates its
    /// class-specific entry, performs the host kernel create, and completes
    /// with [`finalize_new`](Self::finalize_new). Fails with
    /// [`ErrorCode::NameTaken`] if a live object of the class already
    /// carries the name, or [`ErrorCode::NoFreeIds`] if the class is full.
    pub fn allocate_new(&self, ty: ObjectType, name: &str) -> OsResult<NewSlot<'_>> {
        let name = validate_name(name)?;
        let mut guard = self.table(ty).lock();
        if guard.find_by_name(&name).is_some() {
            return Err(ErrorCode::NameTaken);
        }
        let index = guard.find_free().ok_or(ErrorCode::NoFreeIds)?;
        guard.set_active(index, ObjectId::RESERVED);
        guard.set_creator(index, self.current_task_id());
        Ok(NewSlot { guard, index, name })
    }

    /// Complete (or abandon) an allocation started by
    /// [`allocate_new`](Self::allocate_new), unlocking the class.
    ///
    /// If `op_status` is `Ok`, a fresh serial is issued for the slot - the
    /// generation advance that makes the previous occupant's ID stale -
    /// the name is installed, and the new ID is published and returned.
    /// Otherwise the slot is returned to the free state and `op_status`'s
    /// error is passed through.
    pub fn finalize_new(&self, slot: NewSlot<'_>, op_status: OsResult<()>) -> OsResult<ObjectId> {
        let NewSlot {
            mut guard,
            index,
            name,
        } = slot;
        let result = match op_status {
            Ok(()) => {
                let serial = guard.advance_serial(index);
                let id = ObjectId::compose(guard.ty(), serial);
                guard.set_name(index, Some(name));
                guard.set_active(index, id);
                log::trace!("created {id:?} ({:?})", name.as_str());
                Ok(id)
            }
            Err(e) => {
                guard.clear_record(index);
                Err(e)
            }
        };
        // Either way the slot's state is now settled; wake anyone waiting
        // on the publication (e.g. a freshly spawned timebase helper).
        guard.notify_all();
        result
    }

    /// Complete a delete started with [`LockMode::Exclusive`], unlocking
    /// the class.
    ///
    /// If `op_status` is `Ok` the slot is freed: the published ID becomes
    /// `UNDEFINED` (which is what in-flight lookups and the timebase
    /// helper's self-check observe), and the name, creator, and flags are
    /// cleared. On error the object stays live. The lock is released
    /// unconditionally and `op_status` is passed through.
    pub fn finalize_delete(&self, acquired: Acquired<'_>, op_status: OsResult<()>) -> OsResult<()> {
        let Acquired { id, index, guard } = acquired;
        let Some(mut guard) = guard else {
            // Only an exclusively locked acquisition can finalize a delete
            debug_assert!(false, "finalize_delete without the class lock");
            return Err(ErrorCode::Error);
        };
        if op_status.is_ok() {
            debug_assert_eq!(guard.record(index).refcount(), 0);
            guard.clear_record(index);
            log::trace!("deleted {id:?}");
        }
        guard.notify_all();
        op_status
    }

    /// Look up an object by ID.
    ///
    /// The class tag and the full serial are both checked, so a stale ID -
    /// one whose slot has since been freed or reused - fails with
    /// [`ErrorCode::InvalidId`] and has no side effects. On success the
    /// class lock is handled according to `mode`.
    pub fn get_object(&self, mode: LockMode, ty: ObjectType, id: ObjectId) -> OsResult<Acquired<'_>> {
        let index = id.array_index(ty)?;
        let guard = self.table(ty).lock();
        if guard.active(index) != id {
            return Err(ErrorCode::InvalidId);
        }
        convert_lock(guard, mode, index, id)
    }

    /// Look up an object by name, with the same lock-mode escalation as
    /// [`get_object`](Self::get_object).
    pub fn get_by_name(&self, mode: LockMode, ty: ObjectType, name: &str) -> OsResult<Acquired<'_>> {
        self.get_by_search(mode, ty, |_, record| record.name() == Some(name))
    }

    /// Resolve a name to an ID without retaining any lock.
    pub fn find_by_name(&self, ty: ObjectType, name: &str) -> OsResult<ObjectId> {
        Ok(self.get_by_name(LockMode::None, ty, name)?.id())
    }

    /// Look up an object by arbitrary predicate.
    ///
    /// Live slots are offered to `matches` in index order, under the class
    /// lock; the first match is escalated according to `mode`. Fails with
    /// [`ErrorCode::NameNotFound`] if nothing matches.
    pub fn get_by_search(
        &self,
        mode: LockMode,
        ty: ObjectType,
        mut matches: impl FnMut(ObjectId, &CommonRecord) -> bool,
    ) -> OsResult<Acquired<'_>> {
        let guard = self.table(ty).lock();
        for index in 0..guard.capacity() {
            let id = guard.active(index);
            if !id.is_defined() || id == ObjectId::RESERVED {
                continue;
            }
            if matches(id, guard.record(index)) {
                return convert_lock(guard, mode, index, id);
            }
        }
        Err(ErrorCode::NameNotFound)
    }

    /// Release a reference taken with [`LockMode::RefCount`].
    ///
    /// When the last reference drains and an exclusive operation is
    /// waiting, it is woken here.
    pub fn refcount_decr(&self, ty: ObjectType, id: ObjectId) -> OsResult<()> {
        let index = id.array_index(ty)?;
        let mut guard = self.table(ty).lock();
        if guard.active(index) != id {
            return Err(ErrorCode::InvalidId);
        }
        let remaining = guard.refcount_decr(index);
        if remaining == 0 && guard.flags(index).contains(RecordFlags::EXCL_REQ) {
            guard.notify_all();
        }
        Ok(())
    }

    /// Call `f` with the ID of every live object matching the filters.
    ///
    /// `ty` restricts the sweep to one class; `creator` to objects created
    /// by one task. Each class is locked only long enough to snapshot its
    /// IDs, so `f` is free to re-enter the identifier manager - including
    /// deleting the object it was handed.
    pub fn for_each_object(
        &self,
        creator: Option<ObjectId>,
        ty: Option<ObjectType>,
        mut f: impl FnMut(ObjectId),
    ) {
        let classes: &[ObjectType] = match ty {
            Some(ref one) => core::slice::from_ref(one),
            None => &ObjectType::ALL,
        };
        for &class in classes {
            let ids: Vec<ObjectId> = {
                let guard = self.table(class).lock();
                (0..guard.capacity())
                    .filter_map(|i| {
                        let id = guard.active(i);
                        if !id.is_defined() || id == ObjectId::RESERVED {
                            return None;
                        }
                        if let Some(c) = creator {
                            if guard.record(i).creator() != c {
                                return None;
                            }
                        }
                        Some(id)
                    })
                    .collect()
            };
            for id in ids {
                f(id);
            }
        }
    }

    /// The number of live objects, over all classes or one.
    pub fn object_count(&self, ty: Option<ObjectType>) -> usize {
        let mut count = 0;
        self.for_each_object(None, ty, |_| count += 1);
        count
    }

    /// Delete one object of any class, routing through the class's delete
    /// operation where one exists.
    fn delete_object(&self, id: ObjectId) -> OsResult<()> {
        match id.object_type() {
            Some(ObjectType::TimerCb) => self.timer_delete(id),
            Some(ObjectType::TimeBase) => self.timebase_delete(id),
            Some(ty) => {
                // Classes whose primitives live entirely in the host
                // kernel: freeing the slot is the whole delete.
                let acquired = self.get_object(LockMode::Exclusive, ty, id)?;
                self.finalize_delete(acquired, Ok(()))
            }
            None => Err(ErrorCode::InvalidId),
        }
    }

    /// Best-effort teardown of every live object.
    ///
    /// Objects hold references on one another (a timer callback pins its
    /// timebase), so a single sweep may leave survivors whose dependents
    /// were deleted later in the same pass. The sweep is repeated, timer
    /// callbacks first, up to five times with a short delay in between.
    /// If objects still remain they are leaked rather than deadlocked on:
    /// the count is logged and [`ErrorCode::Error`] returned.
    pub fn delete_all_objects(&self) -> OsResult<()> {
        // Dependents before their dependencies
        const SWEEP_ORDER: [ObjectType; 12] = [
            ObjectType::TimerCb,
            ObjectType::TimeBase,
            ObjectType::Task,
            ObjectType::Queue,
            ObjectType::BinSem,
            ObjectType::CountSem,
            ObjectType::Mutex,
            ObjectType::Stream,
            ObjectType::Dir,
            ObjectType::Module,
            ObjectType::FileSys,
            ObjectType::Console,
        ];

        let mut try_count = 0;
        loop {
            for ty in SWEEP_ORDER {
                self.for_each_object(None, Some(ty), |id| {
                    // Failures are retried on the next pass
                    let _ = self.delete_object(id);
                });
            }
            let remaining = self.object_count(None);
            if remaining == 0 {
                return Ok(());
            }
            try_count += 1;
            if try_count >= config::TEARDOWN_MAX_PASSES {
                log::warn!("teardown gave up with {remaining} objects outstanding");
                return Err(ErrorCode::Error);
            }
            self.port().task_delay(config::TEARDOWN_RETRY_DELAY_MS);
        }
    }
}
