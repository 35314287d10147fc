//! Status and error codes.
//!
//! Every fallible operation in this crate reports its outcome as one of a
//! closed set of signed status codes. [`ResultCode`] covers the full set,
//! including [`Success`], and is what crosses the application boundary (it
//! converts losslessly to/from an `i32`). [`ErrorCode`] is the failure
//! subset, used as the `Err` type of [`OsResult`] so that callers can use
//! `?` without ever seeing a "successful error".
//!
//! The discriminant values are part of the external contract and must not
//! be renumbered.
//!
//! [`Success`]: ResultCode::Success

use core::fmt;

/// The macro to define [`ResultCode`] and [`ErrorCode`] in lockstep.
///
/// Both enums share discriminants so the conversion between them is a
/// cost-free `transmute`-shaped match.
macro_rules! define_status_codes {
    (
        $( #[$rmeta:meta] )*
        pub enum ResultCode {
            $( #[$smeta:meta] )*
            Success = 0,
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$rmeta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum ResultCode {
            $( #[$smeta] )*
            Success = 0,
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        /// The failure subset of [`ResultCode`], used as the `Err` type of
        /// every fallible operation.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum ErrorCode {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use strake::ResultCode;
            /// assert_eq!(ResultCode::NameTaken.as_str(), "NameTaken");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    Self::Success => "Success",
                    $( Self::$vname => stringify!($vname), )*
                }
            }
        }

        impl From<ErrorCode> for ResultCode {
            #[inline]
            fn from(x: ErrorCode) -> Self {
                match x {
                    $( ErrorCode::$vname => Self::$vname, )*
                }
            }
        }

    };
}

define_status_codes! {
    /// All status codes (including success) that can cross the application
    /// boundary.
    ///
    /// Failure codes have negative values; the numbering follows
    /// long-standing flight-software convention, so a code observed in a
    /// log can be matched against existing operator documentation.
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// Failed in a way not covered by a more specific code.
        Error = -1,
        /// A required reference argument was absent or degenerate.
        InvalidPointer = -2,
        /// The underlying semaphore primitive failed.
        SemFailure = -6,
        /// A semaphore wait timed out.
        SemTimeout = -7,
        /// A non-blocking queue receive found no message.
        QueueEmpty = -8,
        /// A queue send found the queue at capacity.
        QueueFull = -9,
        /// A queue receive timed out.
        QueueTimeout = -10,
        /// A queue message exceeded the configured maximum size.
        QueueInvalidSize = -11,
        /// An object name was too long to store.
        NameTooLong = -13,
        /// Every slot of the requested class is in use.
        NoFreeIds = -14,
        /// Another live object of the same class already has this name.
        NameTaken = -15,
        /// The identifier is stale, of the wrong class, or was never issued.
        InvalidId = -16,
        /// No live object of the class has the requested name.
        NameNotFound = -17,
        /// A numeric timer argument was out of range.
        TimerInvalidArgs = -29,
        /// The object (or the calling context) is in a state that disallows
        /// the operation, e.g. calling a timebase API from a timebase
        /// helper thread.
        IncorrectObjState = -35,
    }
}

/// The `Result` type of every fallible operation in this crate.
pub type OsResult<T> = Result<T, ErrorCode>;

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i32) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }

    /// The raw signed value of the code.
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl ErrorCode {
    /// Get the short name of the error code.
    pub fn as_str(self) -> &'static str {
        ResultCode::from(self).as_str()
    }

    /// The raw signed value of the code.
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<OsResult<()>> for ResultCode {
    #[inline]
    fn from(x: OsResult<()>) -> Self {
        match x {
            Ok(()) => Self::Success,
            Err(e) => Self::from(e),
        }
    }
}

impl fmt::Debug for ResultCode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ErrorCode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
