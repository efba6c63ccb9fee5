//! Public IPC ABI
//!
//! Constants and status codes shared with user space. Everything in this
//! module is part of the stable syscall ABI: changing a value here breaks
//! every compiled user program.
//!
//! # Message Limits
//! - `CHANNEL_MAX_MSG_BYTES`: largest payload a single message may carry
//! - `CHANNEL_MAX_MSG_HANDLES`: largest number of handles a message may carry
//!
//! # Status Codes
//! Errors use negative errno-style values so they can be returned directly
//! in x0 by the syscall layer.

use core::fmt;

/// Maximum payload size of a channel message, in bytes.
pub const CHANNEL_MAX_MSG_BYTES: u32 = 65536;

/// Maximum number of handles carried by a channel message.
pub const CHANNEL_MAX_MSG_HANDLES: u32 = 64;

/// Transaction id used to pair a call with its reply.
///
/// Stored in the leading bytes of the payload in native byte order.
pub type Txid = u32;

/// Size of a transaction id on the wire.
pub const TXID_BYTES: usize = core::mem::size_of::<Txid>();

/// Raw handle value as seen by user space.
pub type RawHandle = u32;

/// Status codes returned by IPC operations.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handle value does not name a live handle
    Ebadf = -9,
    /// Nothing to read yet
    Eagain = -11,
    /// Packet allocation failed
    Enomem = -12,
    /// Handle lacks the rights for the operation
    Eacces = -13,
    /// Bad address (invalid user pointer)
    Efault = -14,
    /// Invalid argument
    Einval = -22,
    /// Receiver handle table is full
    Emfile = -24,
    /// Caller buffer too small for the pending message
    Emsgsize = -90,
}

impl Status {
    /// Raw value placed in the return register.
    #[inline]
    pub const fn into_raw(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ebadf => write!(f, "bad handle"),
            Self::Eagain => write!(f, "no message pending"),
            Self::Enomem => write!(f, "out of memory"),
            Self::Eacces => write!(f, "access denied"),
            Self::Efault => write!(f, "bad user address"),
            Self::Einval => write!(f, "invalid argument"),
            Self::Emfile => write!(f, "handle table full"),
            Self::Emsgsize => write!(f, "buffer too small"),
        }
    }
}

/// Encode a syscall outcome for the return register.
///
/// Successful results must fit in the positive half of an `i64`.
pub fn syscall_return(result: Result<u64, Status>) -> i64 {
    match result {
        Ok(value) => i64::try_from(value).unwrap_or(Status::Einval.into_raw()),
        Err(status) => status.into_raw(),
    }
}
