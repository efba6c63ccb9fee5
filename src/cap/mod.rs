//! Handle-Based Capability System
//!
//! The part of the capability model that message packets interact with:
//! owned handles and the per-process table they live in while not in flight.
//!
//! # Security Properties
//! - Handles cannot be copied, only moved or explicitly duplicated
//! - Rights can only be reduced, never increased
//! - Releasing a handle is tied to dropping its value, so a handle is
//!   released exactly once

pub mod handle;
pub mod table;

pub use handle::{Handle, KernelObject, Koid, ObjectType, Rights};
pub use table::{HandleTable, HandleTableError, HandleValue, HANDLE_TABLE_SIZE};
