//! Handles and Rights
//!
//! A handle is the kernel's owned reference to a kernel object. It is the
//! unit that message packets carry between processes.
//!
//! # Handle Structure
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Handle                            │
//! ├──────────────────────────────────────────────────────────┤
//! │  object: Arc<dyn KernelObject> - Referenced object       │
//! │  rights: Rights                - Permitted operations    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership
//! - A `Handle` is not `Clone`: there is exactly one owner at a time
//! - Moving the value moves the capability (table → packet → table)
//! - Dropping the value releases it; the object is told through
//!   [`KernelObject::on_handle_closed`] and loses one reference

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::trace;

use crate::abi::Status;

bitflags! {
    /// Rights that can be granted by a handle.
    ///
    /// When duplicating a handle, rights can only be reduced, never increased.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    pub struct Rights: u32 {
        /// Read from the object.
        const READ = 1 << 0;
        /// Write to the object.
        const WRITE = 1 << 1;
        /// Create a second handle to the object.
        const DUPLICATE = 1 << 2;
        /// Move the handle to another process.
        const TRANSFER = 1 << 3;
    }
}

impl Rights {
    /// Default rights for a freshly created object.
    pub const DEFAULT: Self = Self::all();
}

/// Types of kernel objects that can be referenced by handles.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjectType {
    /// Channel endpoint.
    Channel = 1,
    /// Event object for signaling.
    Event = 2,
    /// Memory object.
    Vmo = 3,
    /// Thread.
    Thread = 4,
    /// Process.
    Process = 5,
}

/// Kernel object id. Unique for the lifetime of the kernel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Koid(u64);

impl Koid {
    /// Allocate the next object id.
    pub fn generate() -> Self {
        static NEXT_KOID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_KOID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// An object that handles can refer to.
pub trait KernelObject: Send + Sync {
    /// Object type.
    fn object_type(&self) -> ObjectType;

    /// Object id.
    fn koid(&self) -> Koid;

    /// Called every time a handle to this object is released.
    fn on_handle_closed(&self) {}
}

/// An owned reference to a kernel object.
pub struct Handle {
    object: Arc<dyn KernelObject>,
    rights: Rights,
}

impl Handle {
    /// Create a handle to `object` with the given rights.
    pub fn new(object: Arc<dyn KernelObject>, rights: Rights) -> Self {
        Self { object, rights }
    }

    /// Get the rights granted by this handle.
    #[inline]
    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// Check if this handle has all of the specified rights.
    #[inline]
    pub fn has_rights(&self, required: Rights) -> bool {
        self.rights.contains(required)
    }

    /// Get the type of the referenced object.
    #[inline]
    pub fn object_type(&self) -> ObjectType {
        self.object.object_type()
    }

    /// Get the id of the referenced object.
    #[inline]
    pub fn koid(&self) -> Koid {
        self.object.koid()
    }

    /// Get the referenced object.
    #[inline]
    pub fn object(&self) -> &Arc<dyn KernelObject> {
        &self.object
    }

    /// Create a second handle to the same object with reduced rights.
    ///
    /// # Errors
    /// - `Eacces` if this handle lacks `DUPLICATE`
    /// - `Einval` if `rights` is not a subset of this handle's rights
    pub fn duplicate(&self, rights: Rights) -> Result<Self, Status> {
        if !self.has_rights(Rights::DUPLICATE) {
            return Err(Status::Eacces);
        }
        if !self.rights.contains(rights) {
            return Err(Status::Einval);
        }
        Ok(Self {
            object: Arc::clone(&self.object),
            rights,
        })
    }

    /// Release this handle.
    ///
    /// Equivalent to dropping it; spelled out where the release is the point.
    #[inline]
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        trace!(
            "handle: release {:?} koid={}",
            self.object.object_type(),
            self.object.koid().raw()
        );
        self.object.on_handle_closed();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle({:?}, koid={}, rights={:?})",
            self.object_type(),
            self.koid().raw(),
            self.rights
        )
    }
}
