//! A portable abstraction core for flight and embedded software.
//!
//! This crate is the kernel-independent half of an OS abstraction layer:
//! it owns the process-wide table of kernel objects - tasks, queues,
//! semaphores, mutexes, file handles, timebases, timer callbacks, and the
//! rest of the closed class set - and the timebase/timer machinery built
//! on that table. The kernel-*dependent* half is a [`KernelPort`]
//! implementation such as `strake_port_std`, which binds the core to a
//! concrete host.
//!
//! # Object identity
//!
//! Applications hold [`ObjectId`]s: opaque 32-bit handles that encode the
//! object's class and a generation-advancing serial number. A deleted
//! object's ID stays permanently invalid - lookups compare the full ID
//! against the slot's published ID, so a reused slot cannot be reached
//! through a stale handle. Lookups choose what happens to the class lock
//! through a [`LockMode`].
//!
//! # Timebases and timers
//!
//! A [timebase](Osal::timebase_create) pairs a tick source with a helper
//! thread; [timer callbacks](Osal::timer_add) subscribe to it and are
//! dispatched from the helper with one-shot semantics, bounded backlog
//! catch-up, and deletion-safe ring traversal.
//!
//! # Instances
//!
//! The tables live in an [`Osal`] instance rather than module-level
//! statics. Production processes create exactly one (a port crate
//! typically exposes it as a singleton); tests create as many isolated
//! universes as they like.

mod config;
mod error;
mod id;
mod idmap;
mod port;
mod table;
mod timebase;
mod timer;

use std::sync::{Arc, Mutex};

pub use crate::config::{
    TickRate, MAX_BIN_SEMAPHORES, MAX_CONSOLES, MAX_COUNT_SEMAPHORES, MAX_DIRS, MAX_FILESYS,
    MAX_MODULES, MAX_MUTEXES, MAX_NAME_LEN, MAX_QUEUES, MAX_STREAMS, MAX_TASKS, MAX_TIMEBASES,
    MAX_TIMECBS,
};
pub use crate::error::{ErrorCode, OsResult, ResultCode};
pub use crate::id::{ObjectId, ObjectType};
pub use crate::idmap::{Acquired, LockMode, NewSlot};
pub use crate::port::KernelPort;
pub use crate::table::{CommonRecord, ObjectName, RecordFlags};
pub use crate::timebase::{HelperTask, SyncFn, TimeBaseInfo};
pub use crate::timer::{TimerCallback, TimerInfo};

use crate::table::ClassTable;
use crate::timebase::TimeBaseEntry;
use crate::timer::TimerCbRecord;

/// One universe of kernel objects: the per-class tables, the timebase and
/// timer state, and the host port they are bound to.
pub struct Osal {
    tables: [ClassTable; ObjectType::ALL.len()],
    pub(crate) timebases: Box<[TimeBaseEntry]>,
    pub(crate) timecbs: Mutex<Box<[TimerCbRecord]>>,
    port: Box<dyn KernelPort>,
    tick_rate: TickRate,
}

impl Osal {
    /// Construct an instance bound to `port`, ticking at `tick_rate`.
    pub fn new(port: Box<dyn KernelPort>, tick_rate: TickRate) -> Arc<Self> {
        Arc::new(Self {
            tables: ObjectType::ALL.map(ClassTable::new),
            timebases: (0..config::MAX_TIMEBASES)
                .map(|_| TimeBaseEntry::new())
                .collect(),
            timecbs: Mutex::new(
                (0..config::MAX_TIMECBS)
                    .map(|_| TimerCbRecord::default())
                    .collect(),
            ),
            port,
            tick_rate,
        })
    }

    /// The host port this instance is bound to.
    #[inline]
    pub fn port(&self) -> &dyn KernelPort {
        &*self.port
    }

    /// The tick rate this instance was configured with.
    #[inline]
    pub fn tick_rate(&self) -> TickRate {
        self.tick_rate
    }

    /// The identity of the calling thread, as reported by the port.
    #[inline]
    pub fn current_task_id(&self) -> ObjectId {
        self.port.task_self_id()
    }

    pub(crate) fn table(&self, ty: ObjectType) -> &ClassTable {
        &self.tables[ty.tag() as usize - 1]
    }

    /// Fail with [`ErrorCode::IncorrectObjState`] when called on a
    /// timebase helper thread. Configuring timers from timer callback
    /// context is how deadlocks are made.
    pub(crate) fn reject_helper_context(&self) -> OsResult<()> {
        if self.current_task_id().object_type() == Some(ObjectType::TimeBase) {
            Err(ErrorCode::IncorrectObjState)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! A loopback port for exercising the core without a host kernel.

    use super::*;
    use std::cell::Cell;

    thread_local! {
        static SELF_ID: Cell<ObjectId> = const { Cell::new(ObjectId::UNDEFINED) };
    }

    /// A port whose tick sources never fire on their own. With
    /// `spawn_helpers` the helper threads are real; without it timebases
    /// are serviced by driving `service_ticks` directly.
    pub(crate) struct LoopbackPort {
        spawn_helpers: bool,
    }

    impl KernelPort for LoopbackPort {
        fn task_self_id(&self) -> ObjectId {
            SELF_ID.with(|c| c.get())
        }

        fn task_register(&self, id: ObjectId) {
            SELF_ID.with(|c| c.set(id));
        }

        fn task_delay(&self, millis: u32) {
            std::thread::sleep(std::time::Duration::from_millis(millis.into()));
        }

        fn timebase_create(&self, helper: HelperTask) -> OsResult<()> {
            if self.spawn_helpers {
                std::thread::Builder::new()
                    .name(format!("tb-helper-{}", helper.index()))
                    .spawn(move || helper.run())
                    .map_err(|_| ErrorCode::Error)?;
            }
            Ok(())
        }

        fn timebase_set(&self, _local_index: usize, _start: u32, _interval: u32) -> OsResult<()> {
            Ok(())
        }

        fn timebase_delete(&self, _local_index: usize) -> OsResult<()> {
            Ok(())
        }

        fn timebase_wait(&self, _local_index: usize) -> u32 {
            // No internal tick source; behave like an interrupted wait
            std::thread::sleep(std::time::Duration::from_millis(1));
            0
        }
    }

    pub(crate) fn new_osal() -> Arc<Osal> {
        Osal::new(
            Box::new(LoopbackPort {
                spawn_helpers: false,
            }),
            TickRate::default(),
        )
    }

    pub(crate) fn new_osal_spawning() -> Arc<Osal> {
        Osal::new(
            Box::new(LoopbackPort {
                spawn_helpers: true,
            }),
            TickRate::default(),
        )
    }
}
