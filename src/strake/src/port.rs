//! The host kernel port interface.
//!
//! Everything the core needs from the underlying kernel funnels through
//! [`KernelPort`]. The contract mirrors the create/delete handoff of the
//! identifier manager: `timebase_create` and `timebase_delete` are invoked
//! while the class lock is held (between `allocate_new` and
//! `finalize_new`, or between the exclusive acquisition and
//! `finalize_delete`), so a port must not call back into the identifier
//! manager from them. Every other operation is called with no core locks
//! held.

use crate::error::OsResult;
use crate::id::ObjectId;
use crate::timebase::HelperTask;

/// The operations a host kernel binding provides to the core.
///
/// Implementations are shared across every thread of the process.
pub trait KernelPort: Send + Sync + 'static {
    /// The identity of the calling thread, or [`ObjectId::UNDEFINED`] for
    /// a thread never registered with the layer.
    fn task_self_id(&self) -> ObjectId;

    /// Bind an identity to the calling thread. Timebase helpers register
    /// their timebase's ID, which is how calls made from callback context
    /// are recognized and rejected.
    fn task_register(&self, id: ObjectId);

    /// Put the calling thread to sleep.
    fn task_delay(&self, millis: u32);

    /// Spawn the helper thread for a new timebase and install its internal
    /// tick source. The helper thread must call [`HelperTask::run`], which
    /// carries the entire loop; it is safe to start immediately - the run
    /// body waits for the creator to publish the outcome.
    fn timebase_create(&self, helper: HelperTask) -> OsResult<()>;

    /// Program the internal tick source of a timebase: first tick after
    /// `start_ticks`, subsequent ticks every `interval_ticks` (zero for
    /// one-shot). Not called for externally synced timebases.
    fn timebase_set(&self, local_index: usize, start_ticks: u32, interval_ticks: u32)
        -> OsResult<()>;

    /// Tear down the internal tick source. The helper thread is *not*
    /// stopped here - it observes the deletion itself at its next wake.
    fn timebase_delete(&self, local_index: usize) -> OsResult<()>;

    /// Block until the internal tick source of `local_index` fires and
    /// return the number of elapsed ticks, or zero if the wait was
    /// interrupted without tick information.
    fn timebase_wait(&self, local_index: usize) -> u32;
}
