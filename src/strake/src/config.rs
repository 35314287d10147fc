//! Static configuration.
//!
//! Table capacities are compile-time constants: the tables never grow, and
//! a capacity of zero is a configuration error caught at build time. The
//! tick rate, by contrast, is a property of the host kernel binding and is
//! validated when an [`Osal`](crate::Osal) instance is constructed.

use crate::error::{ErrorCode, OsResult};

/// The number of task slots.
pub const MAX_TASKS: usize = 64;
/// The number of message queue slots.
pub const MAX_QUEUES: usize = 64;
/// The number of binary semaphore slots.
pub const MAX_BIN_SEMAPHORES: usize = 20;
/// The number of counting semaphore slots.
pub const MAX_COUNT_SEMAPHORES: usize = 20;
/// The number of mutex slots.
pub const MAX_MUTEXES: usize = 20;
/// The number of open stream (file handle) slots.
pub const MAX_STREAMS: usize = 50;
/// The number of open directory slots.
pub const MAX_DIRS: usize = 4;
/// The number of timebase slots.
pub const MAX_TIMEBASES: usize = 8;
/// The number of timer callback slots.
pub const MAX_TIMECBS: usize = 16;
/// The number of loadable module slots.
pub const MAX_MODULES: usize = 20;
/// The number of mounted file system slots.
pub const MAX_FILESYS: usize = 14;
/// The number of console device slots.
pub const MAX_CONSOLES: usize = 1;

/// The maximum length of an object name, in bytes. Longer names are
/// rejected rather than truncated; a truncated name could collide with
/// another object's name.
pub const MAX_NAME_LEN: usize = 20;

/// How many times in a row a timebase helper may observe a zero-tick sync
/// return before it starts yielding the CPU between attempts.
pub(crate) const TIMEBASE_SPIN_LIMIT: u32 = 4;

/// How long the helper yields once the spin limit is hit, in milliseconds.
pub(crate) const SPIN_RECOVERY_DELAY_MS: u32 = 10;

/// How many full sweeps [`Osal::delete_all_objects`](crate::Osal::delete_all_objects)
/// makes before giving up on objects that will not delete.
pub(crate) const TEARDOWN_MAX_PASSES: u32 = 5;

/// Delay between teardown sweeps, giving dependent objects a chance to
/// release their references, in milliseconds.
pub(crate) const TEARDOWN_RETRY_DELAY_MS: u32 = 5;

// A zero capacity is a configuration error, not a runtime condition.
const _: () = {
    assert!(MAX_TASKS > 0);
    assert!(MAX_QUEUES > 0);
    assert!(MAX_BIN_SEMAPHORES > 0);
    assert!(MAX_COUNT_SEMAPHORES > 0);
    assert!(MAX_MUTEXES > 0);
    assert!(MAX_STREAMS > 0);
    assert!(MAX_DIRS > 0);
    assert!(MAX_TIMEBASES > 0);
    assert!(MAX_TIMECBS > 0);
    assert!(MAX_MODULES > 0);
    assert!(MAX_FILESYS > 0);
    assert!(MAX_CONSOLES > 0);
    assert!(MAX_NAME_LEN > 0);
};

/// The tick rate of a host binding: how long one timebase tick lasts.
///
/// The two fields are redundant on purpose - both appear throughout host
/// kernel APIs - and the constructor insists that they agree exactly.
/// Conversions always go through 64-bit intermediates so that no operand
/// range produces silent truncation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TickRate {
    micro_sec_per_tick: u32,
    ticks_per_second: u32,
}

impl TickRate {
    /// Construct a tick rate from its two conventional expressions.
    ///
    /// Returns [`ErrorCode::TimerInvalidArgs`] unless
    /// `micro_sec_per_tick * ticks_per_second` is exactly 1,000,000. A
    /// configuration that only approximately satisfies this makes every
    /// tick↔time conversion drift, so it is rejected outright instead of
    /// warned about.
    pub fn new(micro_sec_per_tick: u32, ticks_per_second: u32) -> OsResult<Self> {
        let product = u64::from(micro_sec_per_tick) * u64::from(ticks_per_second);
        if product != 1_000_000 {
            return Err(ErrorCode::TimerInvalidArgs);
        }
        Ok(Self {
            micro_sec_per_tick,
            ticks_per_second,
        })
    }

    /// Microseconds per timebase tick.
    #[inline]
    pub fn micro_sec_per_tick(self) -> u32 {
        self.micro_sec_per_tick
    }

    /// Timebase ticks per second.
    #[inline]
    pub fn ticks_per_second(self) -> u32 {
        self.ticks_per_second
    }

    /// Convert a millisecond count to ticks, rounding up.
    ///
    /// Returns [`ErrorCode::Error`] if the result does not fit the signed
    /// 32-bit range some host kernels impose on tick counts.
    pub fn millis_to_ticks(self, milli_seconds: u32) -> OsResult<i32> {
        let num_of_ticks =
            (u64::from(milli_seconds) * u64::from(self.ticks_per_second) + 999) / 1000;
        if num_of_ticks <= i32::MAX as u64 {
            Ok(num_of_ticks as i32)
        } else {
            Err(ErrorCode::Error)
        }
    }
}

impl Default for TickRate {
    /// One millisecond per tick.
    fn default() -> Self {
        Self {
            micro_sec_per_tick: 1000,
            ticks_per_second: 1000,
        }
    }
}
