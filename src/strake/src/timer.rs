//! Timer callbacks.
//!
//! A timer callback is an application function subscribed to a timebase,
//! described by a signed countdown (`wait_time`), a signed re-arm period
//! (`interval_time`, zero for one-shot operation), and its position in the
//! owning timebase's circular ring. The ring is encoded over the timer
//! callback table itself: `next_ref` is the slot index of the ring
//! successor, and the timebase's `first_cb` anchors the walk, so
//! subscribing a timer allocates nothing.
//!
//! All counter and ring mutation happens under the owning timebase's tick
//! gate; a timer callback therefore holds a `RefCount` reference on its
//! timebase from `timer_add` to `timer_delete`, which is what makes
//! `timebase_delete` block until the last subscriber is gone.

use std::sync::{Arc, MutexGuard, PoisonError};

use bitflags::bitflags;

use crate::error::{ErrorCode, OsResult};
use crate::id::{ObjectId, ObjectType};
use crate::idmap::LockMode;
use crate::table::ObjectName;
use crate::Osal;

/// An application timer callback.
///
/// Invoked on the helper thread with the timer callback's own public ID.
/// The closure owns whatever context it needs (the classic
/// function-pointer-plus-argument pair, folded together). It runs with the
/// owning timebase's tick gate held: it may operate on timers of that
/// same timebase - including deleting itself - but not on other
/// timebases' timers, and not on the timebase API at all.
pub type TimerCallback = Arc<dyn Fn(ObjectId) + Send + Sync>;

bitflags! {
    /// Flag bits of a timer callback record.
    #[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
    pub(crate) struct TimerFlags: u32 {
        /// The owning timebase exists solely for this timer and is
        /// deleted along with it.
        const DEDICATED_TIMEBASE = 0x1;
    }
}

/// One timer callback slot.
pub(crate) struct TimerCbRecord {
    /// Slot index of the owning timebase.
    pub(crate) owner_index: usize,
    /// Public ID of the owning timebase.
    pub(crate) owner_id: ObjectId,
    pub(crate) flags: TimerFlags,
    /// Ticks until the next delivery; goes non-positive when due and may
    /// rest below zero (bounded by one interval) after a backlog clamp.
    pub(crate) wait_time: i32,
    /// Re-arm period in ticks; zero or negative means one-shot.
    pub(crate) interval_time: i32,
    /// How many times the backlog clamp had to discard accumulated lag.
    pub(crate) backlog_resets: u32,
    pub(crate) callback: Option<TimerCallback>,
    /// Ring successor (slot index); self-referential for a singleton ring.
    pub(crate) next_ref: usize,
}

impl Default for TimerCbRecord {
    fn default() -> Self {
        Self {
            owner_index: 0,
            owner_id: ObjectId::UNDEFINED,
            flags: TimerFlags::empty(),
            wait_time: 0,
            interval_time: 0,
            backlog_resets: 0,
            callback: None,
            next_ref: 0,
        }
    }
}

impl TimerCbRecord {
    /// Account for `tick` elapsed ticks and return how many deliveries are
    /// owed.
    ///
    /// Deliveries happen only when the countdown was still positive before
    /// this tick (`saved > 0`): that is what makes a one-shot timer fire
    /// exactly once per arming, however many ticks arrive afterwards. A
    /// periodic timer that fell at most one interval behind re-arms and
    /// catches up delivery by delivery; one that fell further behind has
    /// its lag clamped to a single interval, the clamp counted, and gets
    /// exactly one delivery - unbounded catch-up bursts after a stall help
    /// nobody.
    pub(crate) fn advance(&mut self, tick: i32) -> u32 {
        let saved = self.wait_time;
        self.wait_time = self.wait_time.saturating_sub(tick);
        let mut fires = 0;
        while self.wait_time <= 0 {
            if self.interval_time > 0 && saved > 0 && self.wait_time < -self.interval_time {
                self.backlog_resets = self.backlog_resets.saturating_add(1);
                self.wait_time = -self.interval_time;
                fires += 1;
                break;
            }
            self.wait_time = self.wait_time.saturating_add(self.interval_time);
            if saved > 0 {
                fires += 1;
            }
            if self.interval_time <= 0 {
                break;
            }
        }
        fires
    }
}

/// A property snapshot of a timer callback.
#[derive(Clone, Debug)]
pub struct TimerInfo {
    pub name: ObjectName,
    pub creator: ObjectId,
    /// The timebase this timer is subscribed to.
    pub owner_timebase: ObjectId,
    pub wait_time: i32,
    pub interval_time: i32,
    pub backlog_resets: u32,
    /// Whether the owning timebase is dedicated to this timer.
    pub dedicated: bool,
}

impl Osal {
    pub(crate) fn lock_timecbs(&self) -> MutexGuard<'_, Box<[TimerCbRecord]>> {
        self.timecbs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Owner lookup used by the timer operations before they take the tick
    /// gate. Returns `(timebase slot, timebase id, dedicated)`.
    fn timer_owner(&self, timer_id: ObjectId) -> OsResult<(usize, ObjectId, bool)> {
        let acquired = self.get_object(LockMode::None, ObjectType::TimerCb, timer_id)?;
        let cbs = self.lock_timecbs();
        let cb = &cbs[acquired.index()];
        Ok((
            cb.owner_index,
            cb.owner_id,
            cb.flags.contains(TimerFlags::DEDICATED_TIMEBASE),
        ))
    }

    /// Subscribe a callback to a timebase.
    ///
    /// The timer first becomes due after `initial_wait_ticks` of the
    /// timebase's ticks, then re-arms every `interval_ticks`; an interval
    /// of zero makes it one-shot. Both values must be below 10^9. The
    /// timer holds a reference on the timebase until it is deleted.
    pub fn timer_add(
        &self,
        name: &str,
        timebase_id: ObjectId,
        interval_ticks: u32,
        initial_wait_ticks: u32,
        callback: TimerCallback,
    ) -> OsResult<ObjectId> {
        self.timer_add_internal(
            name,
            timebase_id,
            interval_ticks,
            initial_wait_ticks,
            callback,
            TimerFlags::empty(),
        )
    }

    fn timer_add_internal(
        &self,
        name: &str,
        timebase_id: ObjectId,
        interval_ticks: u32,
        initial_wait_ticks: u32,
        callback: TimerCallback,
        flags: TimerFlags,
    ) -> OsResult<ObjectId> {
        if interval_ticks >= 1_000_000_000 || initial_wait_ticks >= 1_000_000_000 {
            return Err(ErrorCode::TimerInvalidArgs);
        }
        // Pin the owning timebase for this timer's whole lifetime
        let tb = self.get_object(LockMode::RefCount, ObjectType::TimeBase, timebase_id)?;
        let tb_index = tb.index();

        let result = (|| {
            let gate = self.timebases[tb_index].gate.enter();
            let slot = self.allocate_new(ObjectType::TimerCb, name)?;
            let index = slot.index();
            {
                let mut cbs = self.lock_timecbs();
                cbs[index] = TimerCbRecord {
                    owner_index: tb_index,
                    owner_id: timebase_id,
                    flags,
                    wait_time: initial_wait_ticks as i32,
                    interval_time: interval_ticks as i32,
                    backlog_resets: 0,
                    callback: Some(callback),
                    next_ref: index,
                };
                // Splice into the ring: first subscriber anchors it,
                // later ones go in right after the anchor
                let mut data = self.timebases[tb_index].lock_data();
                match data.first_cb {
                    None => data.first_cb = Some(index),
                    Some(first) => {
                        let succ = cbs[first].next_ref;
                        cbs[index].next_ref = succ;
                        cbs[first].next_ref = index;
                    }
                }
            }
            let id = self.finalize_new(slot, Ok(()))?;
            drop(gate);
            Ok(id)
        })();

        if result.is_err() {
            let _ = self.refcount_decr(ObjectType::TimeBase, timebase_id);
        }
        result
    }

    /// Re-arm a timer callback.
    ///
    /// The countdown restarts at `start_ticks` (or at `interval_ticks`
    /// when the start is zero) and the period becomes `interval_ticks`;
    /// zero interval arms a one-shot. At least one of the two must be
    /// nonzero and both must be below 10^9. For a timer created through
    /// [`timer_create`](Self::timer_create) this reprograms the dedicated
    /// timebase instead.
    pub fn timer_set(&self, timer_id: ObjectId, start_ticks: u32, interval_ticks: u32) -> OsResult<()> {
        if start_ticks >= 1_000_000_000 || interval_ticks >= 1_000_000_000 {
            return Err(ErrorCode::TimerInvalidArgs);
        }
        if start_ticks == 0 && interval_ticks == 0 {
            return Err(ErrorCode::TimerInvalidArgs);
        }
        let (tb_index, tb_id, dedicated) = self.timer_owner(timer_id)?;

        if dedicated {
            // The dedicated tick source carries the schedule; the callback
            // then rides every tick it produces
            self.timebase_set(tb_id, start_ticks, interval_ticks)?;
        }
        let gate = self.timebases[tb_index].gate.enter();
        // Revalidate now that we own the tick domain
        let acquired = self.get_object(LockMode::None, ObjectType::TimerCb, timer_id)?;
        let mut cbs = self.lock_timecbs();
        let cb = &mut cbs[acquired.index()];
        if dedicated {
            cb.wait_time = 1;
            cb.interval_time = if interval_ticks > 0 { 1 } else { 0 };
        } else {
            cb.wait_time = if start_ticks > 0 {
                start_ticks as i32
            } else {
                interval_ticks as i32
            };
            cb.interval_time = interval_ticks as i32;
        }
        drop(cbs);
        drop(gate);
        Ok(())
    }

    /// Unsubscribe and delete a timer callback.
    ///
    /// Safe to call from any context, including from a timer callback
    /// deleting itself: the dispatcher saves the ring successor before
    /// every invocation. Deleting a [`timer_create`](Self::timer_create)d
    /// timer also deletes its dedicated timebase (which is not possible
    /// from callback context).
    pub fn timer_delete(&self, timer_id: ObjectId) -> OsResult<()> {
        let (tb_index, tb_id, dedicated) = self.timer_owner(timer_id)?;
        let gate = self.timebases[tb_index].gate.enter();
        let acquired = self.get_object(LockMode::Exclusive, ObjectType::TimerCb, timer_id)?;
        let index = acquired.index();
        {
            let mut cbs = self.lock_timecbs();
            let next = cbs[index].next_ref;
            // Single links: walk the ring for the predecessor
            let mut prev = index;
            while cbs[prev].next_ref != index {
                prev = cbs[prev].next_ref;
            }
            let mut data = self.timebases[tb_index].lock_data();
            if prev == index {
                data.first_cb = None;
            } else {
                cbs[prev].next_ref = next;
                if data.first_cb == Some(index) {
                    data.first_cb = Some(next);
                }
            }
            cbs[index] = TimerCbRecord::default();
        }
        self.finalize_delete(acquired, Ok(()))?;
        drop(gate);
        let _ = self.refcount_decr(ObjectType::TimeBase, tb_id);
        if dedicated {
            self.timebase_delete(tb_id)?;
        }
        Ok(())
    }

    /// Create a timer with a dedicated internal timebase.
    ///
    /// Convenience for the common case of one periodic callback that does
    /// not share a tick source: creates a timebase named after the timer,
    /// subscribes `callback` to it, and marks the pair so that deleting
    /// the timer tears both down. Returns the timer ID and the achievable
    /// accuracy in microseconds. The schedule is programmed afterwards
    /// with [`timer_set`](Self::timer_set). Not callable from a timebase
    /// helper context.
    pub fn timer_create(
        self: &Arc<Self>,
        name: &str,
        callback: TimerCallback,
    ) -> OsResult<(ObjectId, u32)> {
        self.reject_helper_context()?;
        let tb_id = self.timebase_create(name, None)?;
        match self.timer_add_internal(
            name,
            tb_id,
            0,
            0,
            callback,
            TimerFlags::DEDICATED_TIMEBASE,
        ) {
            Ok(id) => Ok((id, self.tick_rate().micro_sec_per_tick())),
            Err(e) => {
                let _ = self.timebase_delete(tb_id);
                Err(e)
            }
        }
    }

    /// Resolve a timer name to its ID.
    pub fn timer_get_id_by_name(&self, name: &str) -> OsResult<ObjectId> {
        self.find_by_name(ObjectType::TimerCb, name)
    }

    /// Snapshot a timer callback's properties.
    pub fn timer_get_info(&self, timer_id: ObjectId) -> OsResult<TimerInfo> {
        let acquired = self.get_object(LockMode::Global, ObjectType::TimerCb, timer_id)?;
        let record = acquired.record().expect("Global mode retains the lock");
        let name = ObjectName::from(record.name().unwrap_or("")).unwrap_or_default();
        let creator = record.creator();
        let cbs = self.lock_timecbs();
        let cb = &cbs[acquired.index()];
        Ok(TimerInfo {
            name,
            creator,
            owner_timebase: cb.owner_id,
            wait_time: cb.wait_time,
            interval_time: cb.interval_time,
            backlog_resets: cb.backlog_resets,
            dedicated: cb.flags.contains(TimerFlags::DEDICATED_TIMEBASE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::new_osal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, Weak};

    /// A callback that appends a label to a shared journal.
    fn journal_callback(journal: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> TimerCallback {
        let journal = Arc::clone(journal);
        Arc::new(move |_| journal.lock().unwrap().push(label))
    }

    fn service(osal: &Osal, tb: ObjectId, tick: u32) {
        let index = tb.array_index(ObjectType::TimeBase).unwrap();
        let gate = osal.timebases[index].gate.enter();
        osal.service_ticks(index, tick);
        drop(gate);
    }

    #[test]
    fn argument_validation() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let noop: TimerCallback = Arc::new(|_| {});
        assert_eq!(
            osal.timer_add("t", tb, 1_000_000_000, 1, Arc::clone(&noop)).err(),
            Some(ErrorCode::TimerInvalidArgs)
        );
        assert_eq!(
            osal.timer_add("t", tb, 1, 1_000_000_000, Arc::clone(&noop)).err(),
            Some(ErrorCode::TimerInvalidArgs)
        );
        // A stale timebase ID is caught before anything is allocated
        assert_eq!(
            osal.timer_add("t", ObjectId::UNDEFINED, 1, 1, noop).err(),
            Some(ErrorCode::InvalidId)
        );

        let t = osal
            .timer_add("t", tb, 1, 1, Arc::new(|_| {}))
            .unwrap();
        assert_eq!(
            osal.timer_set(t, 0, 0).err(),
            Some(ErrorCode::TimerInvalidArgs)
        );
    }

    #[test]
    fn ring_dispatch_order_is_anchor_then_insertions() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            osal.timer_add(label, tb, 1, 1, journal_callback(&journal, label))
                .unwrap();
        }
        service(&osal, tb, 1);
        // Insertion goes right after the anchor, so later subscribers run
        // earlier
        assert_eq!(*journal.lock().unwrap(), ["a", "c", "b"]);
    }

    #[test]
    fn delete_relinks_the_ring() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for label in ["a", "b", "c"] {
            ids.push(
                osal.timer_add(label, tb, 1, 1, journal_callback(&journal, label))
                    .unwrap(),
            );
        }
        // Ring: a → c → b; drop the middle of the dispatch order
        osal.timer_delete(ids[2]).unwrap();
        service(&osal, tb, 1);
        assert_eq!(*journal.lock().unwrap(), ["a", "b"]);

        journal.lock().unwrap().clear();
        // Drop the anchor; the ring must survive losing first_cb
        osal.timer_delete(ids[0]).unwrap();
        service(&osal, tb, 1);
        assert_eq!(*journal.lock().unwrap(), ["b"]);

        journal.lock().unwrap().clear();
        osal.timer_delete(ids[1]).unwrap();
        service(&osal, tb, 1);
        assert!(journal.lock().unwrap().is_empty());
    }

    #[test]
    fn callback_may_delete_itself() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let journal = Arc::new(Mutex::new(Vec::new()));

        osal.timer_add("a", tb, 1, 1, journal_callback(&journal, "a"))
            .unwrap();
        // "kamikaze" deletes itself on first delivery
        let weak: Weak<Osal> = Arc::downgrade(&osal);
        let j2 = Arc::clone(&journal);
        osal.timer_add(
            "kamikaze",
            tb,
            1,
            1,
            Arc::new(move |id| {
                j2.lock().unwrap().push("kamikaze");
                weak.upgrade().unwrap().timer_delete(id).unwrap();
            }),
        )
        .unwrap();
        osal.timer_add("b", tb, 1, 1, journal_callback(&journal, "b"))
            .unwrap();

        // Ring: a → b → kamikaze; the walk must reach every node once and
        // keep going past the deleted one
        service(&osal, tb, 1);
        assert_eq!(*journal.lock().unwrap(), ["a", "b", "kamikaze"]);

        journal.lock().unwrap().clear();
        service(&osal, tb, 1);
        assert_eq!(*journal.lock().unwrap(), ["a", "b"]);
        assert_eq!(osal.object_count(Some(ObjectType::TimerCb)), 2);
    }

    #[test]
    fn timer_set_rearms_a_one_shot() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let t = osal
            .timer_add("t", tb, 0, 3, Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        for _ in 0..6 {
            service(&osal, tb, 1);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Each arming buys exactly one more delivery
        osal.timer_set(t, 2, 0).unwrap();
        for _ in 0..6 {
            service(&osal, tb, 1);
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timer_set_switches_to_periodic() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let t = osal
            .timer_add("t", tb, 0, 1, Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        service(&osal, tb, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // start_ticks of zero starts the period from the next interval
        osal.timer_set(t, 0, 2).unwrap();
        for _ in 0..8 {
            service(&osal, tb, 1);
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(osal.timer_get_info(t).unwrap().interval_time, 2);
    }

    #[test]
    fn timebase_outlives_its_timers() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let t = osal.timer_add("t", tb, 1, 1, Arc::new(|_| {})).unwrap();

        // The subscription pins the timebase: a delete would block, which
        // the record's refcount makes visible
        let acq = osal
            .get_object(LockMode::Global, ObjectType::TimeBase, tb)
            .unwrap();
        assert_eq!(acq.record().unwrap().refcount(), 1);
        acq.unlock();

        osal.timer_delete(t).unwrap();
        osal.timebase_delete(tb).unwrap();
        assert_eq!(osal.object_count(None), 0);
    }

    #[test]
    fn dedicated_timer_lifecycle() {
        let osal = new_osal();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let (t, accuracy) = osal
            .timer_create("dedicated", Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(accuracy, osal.tick_rate().micro_sec_per_tick());

        let info = osal.timer_get_info(t).unwrap();
        assert!(info.dedicated);
        let tb = info.owner_timebase;
        assert_eq!(osal.timebase_get_id_by_name("dedicated").unwrap(), tb);

        // Unprogrammed: ticks do nothing
        service(&osal, tb, 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Programmed: every produced tick is a delivery
        osal.timer_set(t, 4, 4).unwrap();
        let tb_info = osal.timebase_get_info(tb).unwrap();
        assert_eq!(tb_info.nominal_start_time, 4);
        assert_eq!(tb_info.nominal_interval_time, 4);
        service(&osal, tb, 1);
        service(&osal, tb, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // Deleting the timer takes the dedicated timebase with it
        osal.timer_delete(t).unwrap();
        assert_eq!(osal.object_count(None), 0);
    }

    #[test]
    fn info_and_name_lookup() {
        let osal = new_osal();
        let tb = osal.timebase_create("tb", None).unwrap();
        let t = osal.timer_add("mine", tb, 7, 3, Arc::new(|_| {})).unwrap();
        assert_eq!(osal.timer_get_id_by_name("mine").unwrap(), t);
        let info = osal.timer_get_info(t).unwrap();
        assert_eq!(info.name.as_str(), "mine");
        assert_eq!(info.owner_timebase, tb);
        assert_eq!(info.wait_time, 3);
        assert_eq!(info.interval_time, 7);
        assert_eq!(info.backlog_resets, 0);
        assert!(!info.dedicated);
    }
}
