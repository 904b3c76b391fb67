/// Possible errors returned by kernel calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Malformed arguments: priority out of range, stack too small, zero
    /// capacity or element size, or an element of the wrong length.
    InvalidParam,
    /// The handle does not name a live object or thread.
    InvalidHandle,
    /// A bounded wait expired without being satisfied.
    Timeout,
    /// The object was deleted while the caller was waiting on it.
    Deleted,
    /// The call would have to block, but blocking was not allowed.
    WouldBlock,
    /// The fixed-size table for this kind of object is exhausted.
    NoMemorySlots,
    /// A semaphore count would exceed its maximum.
    Overflow,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::Timeout => write!(f, "timed out"),
            Self::Deleted => write!(f, "object deleted while waiting"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NoMemorySlots => write!(f, "no free kernel object slots"),
            Self::Overflow => write!(f, "counter overflow"),
        }
    }
}

impl core::error::Error for Error {}
