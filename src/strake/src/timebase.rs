//! Timebases.
//!
//! A timebase is a tick source: either the host kernel's interval timer or
//! a user-supplied external synchronization routine. Each timebase owns a
//! dedicated high-priority *helper thread* which blocks on the tick
//! source and, on every wake, advances the freerun counter and services
//! the ring of timer callbacks subscribed to the timebase (see
//! [`crate::timer`]).
//!
//! # The tick gate
//!
//! All tick-domain state of a timebase - its freerun counter, its
//! callback ring, and every subscribed callback's counters - is owned by
//! the timebase's [`TickGate`]. The gate is an ownership lock, not a data
//! lock: it can be held across a user callback invocation and re-entered
//! from that callback, which is what lets a callback delete a timer
//! (including itself) without deadlocking. Actual field access happens
//! under short-lived leaf mutexes inside the gate.
//!
//! Lock ordering: a gate is acquired with no class lock held (operations
//! that need both validate first, enter the gate, then revalidate); class
//! locks nest inside the gate; leaf data mutexes are innermost and never
//! held across any other acquisition (or a callback).
//!
//! # Deletion handshake
//!
//! The helper blocks in the sync function with no locks held, so a delete
//! can land while it sleeps. Deletion flips the slot's published ID, and
//! the helper re-checks that ID (a lock-free atomic read) every time it
//! takes the gate, before touching any timebase state. That check is the
//! only cancellation mechanism a helper has.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::config;
use crate::error::{ErrorCode, OsResult};
use crate::id::{ObjectId, ObjectType};
use crate::idmap::LockMode;
use crate::table::ObjectName;
use crate::Osal;

/// An external tick synchronization routine.
///
/// Called by the helper thread with the timebase's slot index; blocks
/// until the time reference advances and returns the number of elapsed
/// ticks. A return of zero means "no information, try again" (the analog
/// of an interrupted wait) and is subject to the helper's spin limit.
pub type SyncFn = Box<dyn FnMut(usize) -> u32 + Send>;

/// Tick-domain state of one timebase slot.
#[derive(Default)]
pub(crate) struct TimeBaseData {
    pub(crate) nominal_start_time: u32,
    pub(crate) nominal_interval_time: u32,
    pub(crate) accuracy_usec: u32,
    /// Total ticks ever serviced. Monotonic on a live timebase; 32-bit
    /// wrap-around is expected and fine.
    pub(crate) freerun_time: u32,
    /// Anchor of the callback ring: the slot index of one subscribed
    /// timer callback, or `None` if the ring is empty.
    pub(crate) first_cb: Option<usize>,
    /// Present until the helper thread claims it at startup.
    pub(crate) external_sync: Option<SyncFn>,
}

/// One timebase slot: the tick gate plus the guarded data.
pub(crate) struct TimeBaseEntry {
    pub(crate) gate: TickGate,
    pub(crate) data: Mutex<TimeBaseData>,
    /// Startup handshake: the creator deposits the outcome of the
    /// allocation here once it is published, and the helper collects it.
    start: Mutex<Option<Option<ObjectId>>>,
    start_cond: Condvar,
}

impl TimeBaseEntry {
    pub(crate) fn new() -> Self {
        Self {
            gate: TickGate::new(),
            data: Mutex::new(TimeBaseData::default()),
            start: Mutex::new(None),
            start_cond: Condvar::new(),
        }
    }

    pub(crate) fn lock_data(&self) -> MutexGuard<'_, TimeBaseData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post_start(&self, outcome: Option<ObjectId>) {
        *self.start.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.start_cond.notify_all();
    }

    fn wait_start(&self) -> Option<ObjectId> {
        let mut slot = self.start.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self
                .start_cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Re-entrant ownership gate over a timebase's tick domain.
///
/// Unlike a plain mutex this may be acquired again by the thread that
/// already holds it, which is how a timer callback (running on the helper
/// thread, under the gate) can call back into timer operations.
pub(crate) struct TickGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    owner: Option<thread::ThreadId>,
    depth: u32,
}

impl TickGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Acquire the gate, blocking while another thread owns it.
    pub(crate) fn enter(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.owner == Some(me) {
            state.depth += 1;
        } else {
            while state.owner.is_some() {
                state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            state.owner = Some(me);
            state.depth = 1;
        }
        GateGuard { gate: self }
    }
}

/// Holds the tick gate; dropping releases one level of ownership.
pub(crate) struct GateGuard<'a> {
    gate: &'a TickGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .gate
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.gate.cond.notify_one();
        }
    }
}

/// A property snapshot of a timebase.
#[derive(Clone, Debug)]
pub struct TimeBaseInfo {
    pub name: ObjectName,
    pub creator: ObjectId,
    pub nominal_start_time: u32,
    pub nominal_interval_time: u32,
    pub freerun_time: u32,
    /// Tick granularity in microseconds: the host tick length for an
    /// internally synced timebase, zero for an externally synced one.
    pub accuracy_usec: u32,
}

/// The work order for a timebase helper thread.
///
/// Built by the core during [`Osal::timebase_create`] and handed to the
/// host port, which spawns a (typically elevated-priority) thread and
/// calls [`run`](Self::run) on it. Everything the loop does - tick
/// collection, spin limiting, the deletion self-check, callback service -
/// is core logic; the port only contributes the thread itself.
pub struct HelperTask {
    osal: Arc<Osal>,
    index: usize,
}

impl HelperTask {
    /// The timebase slot this helper serves.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The helper thread body. Returns when the timebase is deleted (or
    /// was never successfully created).
    pub fn run(self) {
        let Self { osal, index } = self;
        let entry = &osal.timebases[index];

        // The creator publishes our ID once `finalize_new` settles; if the
        // host create failed there is nothing to serve.
        let Some(timebase_id) = entry.wait_start() else {
            return;
        };

        // Register as a timebase context so that application callbacks
        // dispatched from this thread cannot re-enter the timebase API.
        osal.port().task_register(timebase_id);
        log::trace!("helper for {timebase_id:?} running");

        let mut sync = entry.lock_data().external_sync.take();
        let mut spin_cycles: u32 = 0;

        loop {
            // Pend on the tick source; no locks are held here.
            let tick_time = match &mut sync {
                Some(f) => f(index),
                None => osal.port().timebase_wait(index),
            };

            // A zero return carries no tick information. Tolerate a few in
            // a row (an interrupted wait produces them legitimately), but
            // this thread usually runs at high priority, so once the limit
            // is hit start yielding between attempts.
            if tick_time != 0 {
                spin_cycles = 0;
            } else if spin_cycles < config::TIMEBASE_SPIN_LIMIT {
                spin_cycles += 1;
            } else {
                osal.port().task_delay(config::SPIN_RECOVERY_DELAY_MS);
                if spin_cycles == config::TIMEBASE_SPIN_LIMIT {
                    spin_cycles += 1;
                    log::warn!("timebase {timebase_id:?}: sync spin loop detected");
                }
            }

            let gate = entry.gate.enter();

            // The timebase may have been deleted while we were blocked
            if osal.table(ObjectType::TimeBase).active_id(index) != timebase_id {
                drop(gate);
                break;
            }

            osal.service_ticks(index, tick_time);
            drop(gate);
        }
        log::trace!("helper for {timebase_id:?} exiting");
    }
}

impl Osal {
    /// Create a timebase.
    ///
    /// With `external_sync` the timebase is paced by the supplied routine
    /// and reports an accuracy of zero; without it the host kernel's
    /// interval timer paces it at the configured tick rate. Either way a
    /// helper thread is spawned to serve it. Not callable from a timebase
    /// helper context.
    pub fn timebase_create(
        self: &Arc<Self>,
        name: &str,
        external_sync: Option<SyncFn>,
    ) -> OsResult<ObjectId> {
        self.reject_helper_context()?;
        let accuracy = if external_sync.is_none() {
            self.tick_rate().micro_sec_per_tick()
        } else {
            0
        };

        let slot = self.allocate_new(ObjectType::TimeBase, name)?;
        let index = slot.index();
        {
            let mut data = self.timebases[index].lock_data();
            *data = TimeBaseData {
                accuracy_usec: accuracy,
                external_sync,
                ..TimeBaseData::default()
            };
        }
        // Discard any unconsumed handshake from a previous occupant
        *self.timebases[index]
            .start
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let status = self.port().timebase_create(HelperTask {
            osal: Arc::clone(self),
            index,
        });
        let result = self.finalize_new(slot, status);

        // Hand the outcome to the helper (if one was spawned)
        self.timebases[index].post_start(result.as_ref().ok().copied());
        result
    }

    /// Program a timebase's tick schedule.
    ///
    /// `start_time` is the delay until the first tick and `interval_time`
    /// the period between subsequent ticks, both in timebase tick units
    /// (their wall-clock meaning belongs to the tick source). Both must be
    /// below 10^9. Not callable from a timebase helper context.
    pub fn timebase_set(&self, id: ObjectId, start_time: u32, interval_time: u32) -> OsResult<()> {
        if start_time >= 1_000_000_000 || interval_time >= 1_000_000_000 {
            return Err(ErrorCode::TimerInvalidArgs);
        }
        self.reject_helper_context()?;

        let index = self
            .get_object(LockMode::None, ObjectType::TimeBase, id)?
            .index();
        // Take the tick gate so no tick is mid-service while the schedule
        // changes under it. No class lock may be held while blocking here;
        // revalidate once we own the tick domain instead.
        let gate = self.timebases[index].gate.enter();
        self.get_object(LockMode::None, ObjectType::TimeBase, id)?;
        let status = self.port().timebase_set(index, start_time, interval_time);
        if status.is_ok() {
            let mut data = self.timebases[index].lock_data();
            data.nominal_start_time = start_time;
            data.nominal_interval_time = interval_time;
        }
        drop(gate);
        status
    }

    /// Delete a timebase.
    ///
    /// Blocks until every outstanding reference drains - in particular, a
    /// timebase with subscribed timer callbacks cannot be deleted until
    /// they are. The actual teardown happens under the tick gate, so a
    /// delete is mutually exclusive with an in-flight `timebase_set` and
    /// with a service pass: once the gate is ours and the ID still
    /// matches, nobody can reprogram or service the slot while we free
    /// it. The helper thread notices the deletion at its next wake and
    /// exits before servicing any further callback. Not callable from a
    /// timebase helper context.
    pub fn timebase_delete(&self, id: ObjectId) -> OsResult<()> {
        self.reject_helper_context()?;
        let index = id.array_index(ObjectType::TimeBase)?;
        loop {
            // Drain references before taking the gate: releasing one
            // (timer deletion) itself needs the gate, so waiting for the
            // drain while holding it would never finish.
            self.get_object(LockMode::Exclusive, ObjectType::TimeBase, id)?
                .unlock();

            let gate = self.timebases[index].gate.enter();
            let acquired = self.get_object(LockMode::Global, ObjectType::TimeBase, id)?;
            if acquired.record().is_some_and(|r| r.refcount() > 0) {
                // A new subscriber slipped in between the drain and the
                // gate; drop everything and drain again
                acquired.unlock();
                drop(gate);
                continue;
            }
            let status = self.port().timebase_delete(index);
            let result = self.finalize_delete(acquired, status);
            drop(gate);
            return result;
        }
    }

    /// Resolve a timebase name to its ID.
    pub fn timebase_get_id_by_name(&self, name: &str) -> OsResult<ObjectId> {
        self.reject_helper_context()?;
        self.find_by_name(ObjectType::TimeBase, name)
    }

    /// Snapshot a timebase's properties.
    pub fn timebase_get_info(&self, id: ObjectId) -> OsResult<TimeBaseInfo> {
        self.reject_helper_context()?;
        let acquired = self.get_object(LockMode::Global, ObjectType::TimeBase, id)?;
        let record = acquired.record().expect("Global mode retains the lock");
        let name = ObjectName::from(record.name().unwrap_or("")).unwrap_or_default();
        let creator = record.creator();
        let data = self.timebases[acquired.index()].lock_data();
        Ok(TimeBaseInfo {
            name,
            creator,
            nominal_start_time: data.nominal_start_time,
            nominal_interval_time: data.nominal_interval_time,
            freerun_time: data.freerun_time,
            accuracy_usec: data.accuracy_usec,
        })
    }

    /// Read a timebase's freerun tick counter.
    ///
    /// This is a hot-path read: the ID is validated but no lock is
    /// retained, so the value may race a concurrent delete. The counter
    /// itself is monotonic (modulo 32-bit wrap) on a live timebase.
    pub fn timebase_get_freerun(&self, id: ObjectId) -> OsResult<u32> {
        let acquired = self.get_object(LockMode::None, ObjectType::TimeBase, id)?;
        Ok(self.timebases[acquired.index()].lock_data().freerun_time)
    }

    /// Advance a timebase by `tick_time` ticks and service its callback
    /// ring. The caller holds the timebase's tick gate.
    pub(crate) fn service_ticks(&self, index: usize, tick_time: u32) {
        if tick_time == 0 {
            // A zero return carries no tick information; servicing the
            // ring with it would silently erase recorded backlog
            return;
        }
        let first = {
            let mut data = self.timebases[index].lock_data();
            data.freerun_time = data.freerun_time.wrapping_add(tick_time);
            data.first_cb
        };
        let Some(first) = first else { return };
        let tick = i32::try_from(tick_time).unwrap_or(i32::MAX);

        let mut curr = first;
        // A callback may unlink nodes (even the anchor) mid-walk; the ring
        // can never legitimately be longer than the table, so bound the
        // traversal instead of trusting it to close.
        for _ in 0..config::MAX_TIMECBS {
            let step = {
                let mut cbs = self.lock_timecbs();
                let public_id = self.table(ObjectType::TimerCb).active_id(curr);
                let cb = &mut cbs[curr];
                if !public_id.is_defined()
                    || public_id == ObjectId::RESERVED
                    || cb.owner_index != index
                {
                    // The node was unlinked while we were dispatching its
                    // predecessor; the walk cannot continue safely.
                    None
                } else {
                    let fires = cb.advance(tick);
                    Some((fires, public_id, cb.callback.clone(), cb.next_ref))
                }
            };
            // `next_ref` was saved before the dispatch on purpose: the
            // callback is free to delete its own node.
            let Some((fires, public_id, callback, next)) = step else {
                break;
            };
            if fires > 0 {
                if let Some(callback) = &callback {
                    for _ in 0..fires {
                        callback(public_id);
                    }
                }
            }
            if next == first {
                break;
            }
            curr = next;
        }
    }
}
