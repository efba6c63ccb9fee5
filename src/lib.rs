//! PantherOS IPC - Message Packets
//!
//! The message unit of PantherOS channels: a byte payload and a bounded set
//! of handles, held in one allocation and moved between processes.
//!
//! # Components
//! - [`packet`]: `MessagePacket` layout, creation, handle ownership and
//!   payload copy-out
//! - [`queue`]: `PacketQueue`, an allocation-free FIFO linked through the
//!   packets
//! - [`cap`]: handles, rights and per-process handle tables
//! - [`heap`]: allocators packets are carved from
//! - [`syscall`]: user memory validation and the message syscalls
//! - [`abi`]: limits and status codes shared with user space
//!
//! # Security Features
//! - Message limits are part of the ABI and checked at compile time
//! - Handles are owned values: a capability is either in a table, in a
//!   packet, or released, and never in two places at once
//! - All user memory is validated before it is touched
//!
//! # Target
//! `no_std` + `alloc`; the kernel image provides the global allocator and
//! the `log` backend.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod abi;
pub mod cap;
pub mod heap;
pub mod packet;
pub mod queue;
pub mod syscall;

pub use abi::{Status, Txid, CHANNEL_MAX_MSG_BYTES, CHANNEL_MAX_MSG_HANDLES};
pub use cap::{Handle, HandleTable, HandleValue, KernelObject, Rights};
pub use heap::{PacketAlloc, PacketPool, KERNEL_HEAP};
pub use packet::{HandleOwnership, MessagePacket};
pub use queue::PacketQueue;
