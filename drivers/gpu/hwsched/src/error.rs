//! # Scheduler Error Handling
//!
//! Errors returned by the submission API and used internally to steer the
//! dispatch worker.
//!
//! Some variants never reach a submitter: `Again` (dependency pending),
//! `NoSpace` (firmware queue full) and `Busy` (halted or faulted device) are
//! scheduling state that the worker consumes by deferring or requeueing.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Scheduler result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Scheduler error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Submission Errors (surfaced to callers)
    // =========================================================================
    /// Malformed submission (bad count, too many IBs, foreign context)
    InvalidArgument,
    /// Caller-supplied timestamp is not greater than the last one issued
    TimestampRange,
    /// Context has been detached
    ContextDetached,
    /// Context has been invalidated and accepts no more work
    ContextInvalid,
    /// Submission was queued but the context faulted in the meantime
    ContextFaulted,
    /// Device is unusable and the operation must not be retried
    Deadlock,
    /// A bounded wait expired
    Timeout,
    /// Allocation failure
    OutOfMemory,

    // =========================================================================
    // Scheduling State (consumed by the worker)
    // =========================================================================
    /// Firmware dispatch queue is full, retry later
    NoSpace,
    /// Dependency still pending
    Again,
    /// Device halted or fault pending
    Busy,
}

// Linux errno values used by the kernel submission ABI
const EINVAL: i32 = 22;
const ERANGE: i32 = 34;
const ENOENT: i32 = 2;
const ENOSPC: i32 = 28;
const EAGAIN: i32 = 11;
const EPROTO: i32 = 71;
const EDEADLK: i32 = 35;
const ETIMEDOUT: i32 = 110;
const EBUSY: i32 = 16;
const ENOMEM: i32 = 12;

impl Error {
    /// Negative errno reported through the submission ioctl
    pub fn errno(self) -> i32 {
        -match self {
            Self::InvalidArgument => EINVAL,
            Self::TimestampRange => ERANGE,
            Self::ContextDetached => ENOENT,
            Self::ContextInvalid | Self::Deadlock => EDEADLK,
            Self::ContextFaulted => EPROTO,
            Self::Timeout => ETIMEDOUT,
            Self::OutOfMemory => ENOMEM,
            Self::NoSpace => ENOSPC,
            Self::Again => EAGAIN,
            Self::Busy => EBUSY,
        }
    }

    /// Whether the worker should keep the context on its retry list
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NoSpace | Self::Again | Self::Busy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid submission"),
            Self::TimestampRange => write!(f, "timestamp not monotonic"),
            Self::ContextDetached => write!(f, "context detached"),
            Self::ContextInvalid => write!(f, "context invalidated"),
            Self::ContextFaulted => write!(f, "context faulted during submission"),
            Self::Deadlock => write!(f, "device unusable"),
            Self::Timeout => write!(f, "wait timed out"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NoSpace => write!(f, "dispatch queue full"),
            Self::Again => write!(f, "dependency pending"),
            Self::Busy => write!(f, "device busy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::InvalidArgument.errno(), -22);
        assert_eq!(Error::TimestampRange.errno(), -34);
        assert_eq!(Error::ContextDetached.errno(), -2);
        assert_eq!(Error::ContextInvalid.errno(), -35);
        assert_eq!(Error::ContextFaulted.errno(), -71);
        assert_eq!(Error::Timeout.errno(), -110);
        assert_eq!(Error::NoSpace.errno(), -28);
    }

    #[test]
    fn test_transient() {
        assert!(Error::NoSpace.is_transient());
        assert!(Error::Again.is_transient());
        assert!(!Error::ContextDetached.is_transient());
        assert!(!Error::Deadlock.is_transient());
    }
}
