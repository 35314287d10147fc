//! Strake host port for std targets.
//!
//! This crate binds the [`strake`] core to a plain `std` host: timebase
//! helpers are `std::thread`s, the internal tick source is a monotonic
//! [`Instant`] deadline serviced through a condition variable, and task
//! identity is a thread-local cell. It fills the same role for the
//! abstraction layer that a soft real-time simulator port fills for an
//! RTOS: everything runs on a workstation, with host-grade (not
//! flight-grade) timing accuracy.
//!
//! The tick source deliberately reports *every* elapsed interval when a
//! helper gets scheduled late - a wait that overslept three periods
//! returns 3 - so the core's backlog accounting sees the same kind of
//! input it would see on real hardware under load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use strake::{ErrorCode, HelperTask, KernelPort, ObjectId, OsResult, Osal, TickRate};

/// One timebase slot's tick program.
#[derive(Default)]
struct ProgramState {
    /// When the next tick is due; `None` while unprogrammed.
    next_due: Option<Instant>,
    /// Tick period; zero for a one-shot program.
    interval: Duration,
    /// Bumped by every reprogram/teardown so a blocked wait can tell that
    /// its program is gone.
    epoch: u64,
    /// Set on teardown. A dead program stops blocking and keeps reporting
    /// "no information", so the helper drains out through its own
    /// deletion check instead of sleeping on a program nobody will ever
    /// rearm.
    dead: bool,
}

struct TickProgram {
    state: Mutex<ProgramState>,
    cond: Condvar,
}

impl TickProgram {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProgramState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgramState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The std host binding.
///
/// Construct one per [`Osal`] instance with the same [`TickRate`] the
/// instance is given, or use the process-wide [`instance`].
pub struct StdPort {
    tick_len: Duration,
    programs: Box<[TickProgram]>,
    /// Set once a helper thread could not be spawned; makes the failure
    /// visible to tests and diagnostics.
    spawn_failed: AtomicBool,
}

thread_local! {
    static SELF_ID: std::cell::Cell<ObjectId> = const { std::cell::Cell::new(ObjectId::UNDEFINED) };
}

impl StdPort {
    pub fn new(tick_rate: TickRate) -> Self {
        Self {
            tick_len: Duration::from_micros(tick_rate.micro_sec_per_tick().into()),
            programs: (0..strake::MAX_TIMEBASES)
                .map(|_| TickProgram::new())
                .collect(),
            spawn_failed: AtomicBool::new(false),
        }
    }

    /// Whether any helper thread failed to spawn over the port's lifetime.
    pub fn spawn_failed(&self) -> bool {
        self.spawn_failed.load(Ordering::Relaxed)
    }
}

impl KernelPort for StdPort {
    fn task_self_id(&self) -> ObjectId {
        SELF_ID.with(|c| c.get())
    }

    fn task_register(&self, id: ObjectId) {
        SELF_ID.with(|c| c.set(id));
    }

    fn task_delay(&self, millis: u32) {
        thread::sleep(Duration::from_millis(millis.into()));
    }

    fn timebase_create(&self, helper: HelperTask) -> OsResult<()> {
        let index = helper.index();
        {
            // Evict any stale program (and waiter) left by a previous
            // occupant of the slot
            let program = &self.programs[index];
            let mut state = program.lock();
            *state = ProgramState {
                epoch: state.epoch + 1,
                ..ProgramState::default()
            };
            program.cond.notify_all();
        }
        log::trace!("spawning helper thread for timebase slot {index}");
        thread::Builder::new()
            .name(format!("strake-tb-{index}"))
            .spawn(move || helper.run())
            .map_err(|e| {
                log::warn!("helper spawn failed: {e}");
                self.spawn_failed.store(true, Ordering::Relaxed);
                ErrorCode::Error
            })?;
        Ok(())
    }

    fn timebase_set(&self, local_index: usize, start_ticks: u32, interval_ticks: u32) -> OsResult<()> {
        let program = &self.programs[local_index];
        let mut state = program.lock();
        state.epoch += 1;
        state.interval = self.tick_len * interval_ticks;
        let first_delay = if start_ticks > 0 {
            Some(self.tick_len * start_ticks)
        } else if interval_ticks > 0 {
            Some(state.interval)
        } else {
            None
        };
        state.next_due = first_delay.map(|d| Instant::now() + d);
        program.cond.notify_all();
        Ok(())
    }

    fn timebase_delete(&self, local_index: usize) -> OsResult<()> {
        let program = &self.programs[local_index];
        let mut state = program.lock();
        state.epoch += 1;
        state.next_due = None;
        state.interval = Duration::ZERO;
        state.dead = true;
        program.cond.notify_all();
        Ok(())
    }

    fn timebase_wait(&self, local_index: usize) -> u32 {
        let program = &self.programs[local_index];
        let mut state = program.lock();
        let epoch = state.epoch;
        loop {
            if state.dead || state.epoch != epoch {
                // Reprogrammed or torn down under us; report "no
                // information" and let the helper re-enter
                return 0;
            }
            match state.next_due {
                None => {
                    state = program
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(due) => {
                    let now = Instant::now();
                    if now >= due {
                        if state.interval.is_zero() {
                            state.next_due = None;
                            return 1;
                        }
                        // Report every interval that elapsed while this
                        // thread was off-CPU
                        let missed =
                            (now.duration_since(due).as_nanos() / state.interval.as_nanos()) as u64;
                        let ticks = missed + 1;
                        state.next_due = Some(due + state.interval * ticks as u32);
                        return ticks.min(u64::from(u32::MAX)) as u32;
                    }
                    let (guard, _timeout) = program
                        .cond
                        .wait_timeout(state, due - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }
}

static INSTANCE: OnceLock<Arc<Osal>> = OnceLock::new();

/// The process-wide [`Osal`] instance, bound to a [`StdPort`] at the
/// default tick rate (one millisecond per tick). Created on first use.
pub fn instance() -> &'static Arc<Osal> {
    INSTANCE.get_or_init(|| {
        let tick_rate = TickRate::default();
        Osal::new(Box::new(StdPort::new(tick_rate)), tick_rate)
    })
}
