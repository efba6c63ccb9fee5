//! Per-Process Handle Table
//!
//! Holds the handles a process can name from user space. User space only
//! ever sees [`HandleValue`]s; the handles themselves stay in the kernel.
//!
//! # Design
//! - Fixed-size array of handle slots
//! - Slot 0 is never handed out so that a zero value is always invalid
//! - Operations: install, insert, get, remove, free_values

use core::fmt;

use super::handle::Handle;
use crate::abi::{RawHandle, Status};

/// Number of slots in a handle table.
///
/// Large enough to receive several maximum-size messages.
pub const HANDLE_TABLE_SIZE: usize = 256;

/// A handle value: the index user space uses to name a handle.
///
/// This is a newtype to prevent using arbitrary integers as table indices.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct HandleValue(u32);

impl HandleValue {
    /// The invalid handle value.
    pub const INVALID: Self = Self(0);

    /// Validate a raw value coming from user space.
    ///
    /// Returns None if the value is out of range or the invalid value.
    #[inline]
    pub const fn from_raw(raw: RawHandle) -> Option<Self> {
        if raw != 0 && (raw as usize) < HANDLE_TABLE_SIZE {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Get the raw value handed to user space.
    #[inline]
    pub const fn raw(self) -> RawHandle {
        self.0
    }

    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Error type for handle table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleTableError {
    /// The slot is already occupied.
    SlotOccupied,
    /// The slot is empty.
    SlotEmpty,
    /// No free slot left.
    TableFull,
}

impl fmt::Display for HandleTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotOccupied => write!(f, "slot already occupied"),
            Self::SlotEmpty => write!(f, "slot is empty"),
            Self::TableFull => write!(f, "handle table full"),
        }
    }
}

impl From<HandleTableError> for Status {
    fn from(err: HandleTableError) -> Self {
        match err {
            HandleTableError::SlotOccupied => Status::Einval,
            HandleTableError::SlotEmpty => Status::Ebadf,
            HandleTableError::TableFull => Status::Emfile,
        }
    }
}

/// Handle table for a process.
#[derive(Debug)]
pub struct HandleTable {
    slots: [Option<Handle>; HANDLE_TABLE_SIZE],
    len: usize,
}

impl HandleTable {
    /// Create a new empty table.
    pub const fn new() -> Self {
        const EMPTY: Option<Handle> = None;
        Self {
            slots: [EMPTY; HANDLE_TABLE_SIZE],
            len: 0,
        }
    }

    /// Number of live handles.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the table holds no handles.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of handles that can still be installed.
    #[inline]
    pub fn free_slots(&self) -> usize {
        HANDLE_TABLE_SIZE - 1 - self.len
    }

    /// Look up a handle.
    #[inline]
    pub fn get(&self, value: HandleValue) -> Result<&Handle, HandleTableError> {
        self.slots[value.index()]
            .as_ref()
            .ok_or(HandleTableError::SlotEmpty)
    }

    /// Insert a handle at a specific value.
    ///
    /// Fails if the slot is already occupied; the handle is handed back.
    pub fn insert(
        &mut self,
        value: HandleValue,
        handle: Handle,
    ) -> Result<(), (HandleTableError, Handle)> {
        let slot = &mut self.slots[value.index()];
        if slot.is_some() {
            return Err((HandleTableError::SlotOccupied, handle));
        }
        *slot = Some(handle);
        self.len += 1;
        Ok(())
    }

    /// Install a handle in the first free slot and return its value.
    ///
    /// If the table is full the handle is released.
    pub fn install(&mut self, handle: Handle) -> Result<HandleValue, HandleTableError> {
        let Some(index) = (1..HANDLE_TABLE_SIZE).find(|&i| self.slots[i].is_none()) else {
            return Err(HandleTableError::TableFull);
        };
        self.slots[index] = Some(handle);
        self.len += 1;
        Ok(HandleValue(index as u32))
    }

    /// Free handle values, lowest first, in the order `install` would use them.
    pub fn free_values(&self) -> impl Iterator<Item = HandleValue> + '_ {
        (1..HANDLE_TABLE_SIZE)
            .filter(|&i| self.slots[i].is_none())
            .map(|i| HandleValue(i as u32))
    }

    /// Remove a handle, transferring ownership to the caller.
    pub fn remove(&mut self, value: HandleValue) -> Result<Handle, HandleTableError> {
        let handle = self.slots[value.index()]
            .take()
            .ok_or(HandleTableError::SlotEmpty)?;
        self.len -= 1;
        Ok(handle)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::handle::tests::{handle_to, TestEvent};
    use alloc::sync::Arc;

    #[test]
    fn test_invalid_values() {
        assert!(HandleValue::from_raw(0).is_none());
        assert!(HandleValue::from_raw(HANDLE_TABLE_SIZE as u32).is_none());
        assert!(HandleValue::from_raw(1).is_some());
    }

    #[test]
    fn test_install_and_remove() {
        let event = TestEvent::new();
        let mut table = HandleTable::new();

        let value = table.install(handle_to(&event)).unwrap();
        assert_ne!(value, HandleValue::INVALID);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(value).unwrap().koid(), handle_to(&event).koid());

        let handle = table.remove(value).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.remove(value).unwrap_err(), HandleTableError::SlotEmpty);
        drop(handle);
        assert_eq!(Arc::strong_count(&event), 1);
    }

    #[test]
    fn test_insert_occupied() {
        let event = TestEvent::new();
        let mut table = HandleTable::new();
        let value = HandleValue::from_raw(5).unwrap();

        table.insert(value, handle_to(&event)).unwrap();
        let (err, rejected) = table.insert(value, handle_to(&event)).unwrap_err();
        assert_eq!(err, HandleTableError::SlotOccupied);
        drop(rejected);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_full() {
        let event = TestEvent::new();
        let mut table = HandleTable::new();
        for _ in 0..table.free_slots() {
            table.install(handle_to(&event)).unwrap();
        }
        assert_eq!(table.free_slots(), 0);
        assert_eq!(
            table.install(handle_to(&event)).unwrap_err(),
            HandleTableError::TableFull
        );
        // The rejected handle was released, the installed ones are still held.
        assert_eq!(Arc::strong_count(&event), 1 + HANDLE_TABLE_SIZE - 1);
    }

    #[test]
    fn test_free_values_match_install() {
        let event = TestEvent::new();
        let mut table = HandleTable::new();
        table.insert(HandleValue::from_raw(2).unwrap(), handle_to(&event)).unwrap();

        let free: alloc::vec::Vec<u32> =
            table.free_values().take(3).map(HandleValue::raw).collect();
        assert_eq!(free, [1, 3, 4]);
        assert_eq!(table.install(handle_to(&event)).unwrap().raw(), 1);
        assert_eq!(table.free_values().count(), table.free_slots());
    }

    #[test]
    fn test_error_status() {
        assert_eq!(Status::from(HandleTableError::SlotEmpty), Status::Ebadf);
        assert_eq!(Status::from(HandleTableError::TableFull), Status::Emfile);
    }
}
