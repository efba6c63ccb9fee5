//! System Call Interface
//!
//! The user-facing side of message passing: validated user memory access
//! and the message read/write calls built on top of it.
//!
//! # Security Model
//! - All parameters are validated before use
//! - Invalid inputs return errors, never panic
//! - User memory is copied, never referenced after the call returns
//!
//! # Message Calls
//! - `sys_msg_write`: user bytes + handles → packet → queue
//! - `sys_msg_read`: queue → packet → user bytes + handles
//! - `sys_msg_cancel`: drop everything still queued

pub mod msg;
pub mod validate;

pub use msg::{
    sys_msg_cancel, sys_msg_read, sys_msg_write, MsgReadArgs, MsgReadResult, MsgWriteArgs,
};
pub use validate::{DirectMapped, UserMemory, UserPtr, UserPtrMut, UserRegion};
