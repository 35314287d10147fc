//! Object identifiers.
//!
//! Every kernel object is referred to by an [`ObjectId`]: an opaque 32-bit
//! value whose top 8 bits carry the object's class and whose low 24 bits
//! carry a *serial number*. The serial is constructed so that
//! `serial % capacity` recovers the object's slot in its class table while
//! the full serial changes every time a slot is reused. A caller holding an
//! ID for a deleted object therefore cannot accidentally address the slot's
//! new occupant - the table compares the full ID, not the slot index.
//!
//! Two sentinel values exist and are never issued as real IDs:
//! [`ObjectId::UNDEFINED`] (all zero bits) marks a free slot or an absent
//! reference, and [`ObjectId::RESERVED`] (all one bits) marks a slot whose
//! allocation is still in progress.

use core::fmt;

use crate::config;
use crate::error::{ErrorCode, OsResult};

/// Number of bits the class tag is shifted by within a raw ID.
const TYPE_SHIFT: u32 = 24;

/// Mask selecting the serial-number bits of a raw ID.
pub(crate) const SERIAL_MASK: u32 = (1 << TYPE_SHIFT) - 1;

/// The closed set of resource classes.
///
/// Each class has an independent table, capacity, and lock. The
/// discriminants are the class tags embedded in [`ObjectId`]s; tag zero is
/// deliberately unused so that no real ID can ever equal
/// [`ObjectId::UNDEFINED`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum ObjectType {
    /// Tasks (threads of execution).
    Task = 1,
    /// Message queues.
    Queue,
    /// Binary semaphores.
    BinSem,
    /// Counting semaphores.
    CountSem,
    /// Mutual-exclusion semaphores.
    Mutex,
    /// Open file handles.
    Stream,
    /// Open directory handles.
    Dir,
    /// Timebases (tick sources with a helper thread).
    TimeBase,
    /// Timer callbacks subscribed to a timebase.
    TimerCb,
    /// Loadable modules.
    Module,
    /// Mounted file systems.
    FileSys,
    /// Console devices.
    Console,
}

impl ObjectType {
    /// All classes, in table order.
    pub const ALL: [ObjectType; 12] = [
        Self::Task,
        Self::Queue,
        Self::BinSem,
        Self::CountSem,
        Self::Mutex,
        Self::Stream,
        Self::Dir,
        Self::TimeBase,
        Self::TimerCb,
        Self::Module,
        Self::FileSys,
        Self::Console,
    ];

    /// The class tag embedded in IDs of this class.
    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Recover a class from its tag, if the tag is valid.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Task),
            2 => Some(Self::Queue),
            3 => Some(Self::BinSem),
            4 => Some(Self::CountSem),
            5 => Some(Self::Mutex),
            6 => Some(Self::Stream),
            7 => Some(Self::Dir),
            8 => Some(Self::TimeBase),
            9 => Some(Self::TimerCb),
            10 => Some(Self::Module),
            11 => Some(Self::FileSys),
            12 => Some(Self::Console),
            _ => None,
        }
    }

    /// The compile-time capacity of this class's table.
    pub const fn capacity(self) -> usize {
        match self {
            Self::Task => config::MAX_TASKS,
            Self::Queue => config::MAX_QUEUES,
            Self::BinSem => config::MAX_BIN_SEMAPHORES,
            Self::CountSem => config::MAX_COUNT_SEMAPHORES,
            Self::Mutex => config::MAX_MUTEXES,
            Self::Stream => config::MAX_STREAMS,
            Self::Dir => config::MAX_DIRS,
            Self::TimeBase => config::MAX_TIMEBASES,
            Self::TimerCb => config::MAX_TIMECBS,
            Self::Module => config::MAX_MODULES,
            Self::FileSys => config::MAX_FILESYS,
            Self::Console => config::MAX_CONSOLES,
        }
    }
}

// Every capacity must leave room for at least two generations per slot in
// the 24-bit serial space.
const _: () = {
    let mut i = 0;
    while i < ObjectType::ALL.len() {
        assert!(ObjectType::ALL[i].capacity() * 2 <= SERIAL_MASK as usize);
        i += 1;
    }
};

/// An opaque object identifier.
///
/// IDs are compared bitwise; there is no ordering between IDs of different
/// objects that means anything. The raw value is accessible for transport
/// across an ABI boundary ([`as_raw`](Self::as_raw) /
/// [`from_raw`](Self::from_raw)), but applications should treat it as a
/// black box.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    /// The "no object" sentinel. Marks free table slots and absent
    /// references; never a valid argument to a lookup.
    pub const UNDEFINED: Self = Self(0);

    /// The "allocation in progress" sentinel. Visible in a slot only
    /// between `allocate_new` and `finalize_new`; never issued to a caller.
    pub const RESERVED: Self = Self(u32::MAX);

    /// Reconstitute an ID from its raw transport value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw transport value of this ID.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Whether this ID refers to *some* object, i.e. is not
    /// [`UNDEFINED`](Self::UNDEFINED).
    #[inline]
    pub const fn is_defined(self) -> bool {
        self.0 != 0
    }

    /// Build the ID for a given class and serial number.
    #[inline]
    pub(crate) const fn compose(ty: ObjectType, serial: u32) -> Self {
        Self(((ty.tag() as u32) << TYPE_SHIFT) | (serial & SERIAL_MASK))
    }

    /// The class this ID claims to belong to, if its tag is valid.
    ///
    /// The sentinels have no class: `UNDEFINED` carries tag 0 and
    /// `RESERVED` carries tag 255, neither of which maps to a class.
    #[inline]
    pub fn object_type(self) -> Option<ObjectType> {
        ObjectType::from_tag((self.0 >> TYPE_SHIFT) as u8)
    }

    /// The serial-number component of this ID.
    #[inline]
    pub fn serial(self) -> u32 {
        self.0 & SERIAL_MASK
    }

    /// Resolve this ID to a slot index, checking it against the class the
    /// call site expects.
    ///
    /// This is the stale-ID defense: an ID of the wrong class - including
    /// both sentinels - is rejected here with [`ErrorCode::InvalidId`]
    /// before any table is touched.
    pub fn array_index(self, expected: ObjectType) -> OsResult<usize> {
        if self.object_type() != Some(expected) {
            return Err(ErrorCode::InvalidId);
        }
        Ok(self.serial() as usize % expected.capacity())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == Self::UNDEFINED {
            f.write_str("ObjectId(UNDEFINED)")
        } else if *self == Self::RESERVED {
            f.write_str("ObjectId(RESERVED)")
        } else if let Some(ty) = self.object_type() {
            write!(f, "ObjectId({:?}/{})", ty, self.serial())
        } else {
            write!(f, "ObjectId({:#010x})", self.0)
        }
    }
}

/// Advance a slot's serial number for reuse.
///
/// Adds the class capacity so that `serial % capacity` is unchanged. When
/// the 24-bit space is exhausted the sequence restarts at the slot index
/// (wrap-around is permitted); any value that would compose to a sentinel
/// is skipped.
pub(crate) fn advance_serial(ty: ObjectType, index: usize, prev: u32) -> u32 {
    let cap = ty.capacity() as u32;
    let mut next = prev + cap;
    loop {
        if next > SERIAL_MASK {
            next = index as u32;
        }
        let composed = ObjectId::compose(ty, next);
        if composed != ObjectId::UNDEFINED && composed != ObjectId::RESERVED {
            return next;
        }
        next += cap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn arbitrary_type(tag_seed: u8) -> ObjectType {
        ObjectType::ALL[tag_seed as usize % ObjectType::ALL.len()]
    }

    #[quickcheck]
    fn compose_round_trips(tag_seed: u8, serial: u32) -> bool {
        let ty = arbitrary_type(tag_seed);
        let serial = serial & SERIAL_MASK;
        let id = ObjectId::compose(ty, serial);
        id.object_type() == Some(ty) && id.serial() == serial
    }

    #[quickcheck]
    fn array_index_is_stable_across_generations(tag_seed: u8, reuses: u8) -> bool {
        let ty = arbitrary_type(tag_seed);
        let index = ty.capacity() - 1;
        let mut serial = index as u32;
        let mut ok = true;
        for _ in 0..reuses {
            serial = advance_serial(ty, index, serial);
            let id = ObjectId::compose(ty, serial);
            ok &= id.array_index(ty) == Ok(index);
            ok &= id != ObjectId::UNDEFINED && id != ObjectId::RESERVED;
        }
        ok
    }

    #[quickcheck]
    fn wrong_class_is_rejected(tag_seed: u8, other_seed: u8, serial: u32) -> bool {
        let ty = arbitrary_type(tag_seed);
        let other = arbitrary_type(other_seed);
        if ty == other {
            return true;
        }
        let id = ObjectId::compose(ty, serial & SERIAL_MASK);
        id.array_index(other) == Err(ErrorCode::InvalidId)
    }

    #[test]
    fn sentinels_have_no_class() {
        assert_eq!(ObjectId::UNDEFINED.object_type(), None);
        assert_eq!(ObjectId::RESERVED.object_type(), None);
        assert!(!ObjectId::UNDEFINED.is_defined());
        assert!(ObjectId::RESERVED.is_defined());
        for ty in ObjectType::ALL {
            assert_eq!(
                ObjectId::UNDEFINED.array_index(ty),
                Err(ErrorCode::InvalidId)
            );
            assert_eq!(
                ObjectId::RESERVED.array_index(ty),
                Err(ErrorCode::InvalidId)
            );
        }
    }

    #[test]
    fn serial_wraps_back_to_slot_index() {
        let ty = ObjectType::Queue;
        let cap = ty.capacity() as u32;
        // The last representable serial for slot 3
        let last = {
            let mut s = 3;
            while s + cap <= SERIAL_MASK {
                s += cap;
            }
            s
        };
        assert_eq!(advance_serial(ty, 3, last), 3);
    }

    #[test]
    fn debug_formats() {
        let id = ObjectId::compose(ObjectType::TimeBase, 42);
        assert_eq!(format!("{id:?}"), "ObjectId(TimeBase/42)");
        assert_eq!(format!("{:?}", ObjectId::UNDEFINED), "ObjectId(UNDEFINED)");
        assert_eq!(format!("{:?}", ObjectId::RESERVED), "ObjectId(RESERVED)");
    }
}
