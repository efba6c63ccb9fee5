//! User Memory Access
//!
//! The copy primitive message packets use to cross the user/kernel
//! boundary.
//!
//! # Security Principles
//! - Validate every user range before touching it
//! - Fail-secure: an invalid range is `Efault`, never a partial copy
//! - Copy into kernel memory instead of keeping user pointers (TOCTOU)
//! - Null pointers and wrapping ranges are rejected explicitly

use core::fmt;

use log::debug;

use crate::abi::Status;

/// A user-space address to read from.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct UserPtr(usize);

impl UserPtr {
    /// Wrap a raw user address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// A user-space address to write to.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct UserPtrMut(usize);

impl UserPtrMut {
    /// Wrap a raw user address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for UserPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserPtr({:#018x})", self.0)
    }
}

impl fmt::Debug for UserPtrMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserPtrMut({:#018x})", self.0)
    }
}

/// Copy primitive for one user address space.
///
/// Copies may fault and block; callers must not hold queue locks across
/// them.
pub trait UserMemory {
    /// Fill `dst` from user memory at `src`.
    fn copy_from_user(&self, src: UserPtr, dst: &mut [u8]) -> Result<(), Status>;

    /// Write `src` to user memory at `dst`.
    fn copy_to_user(&self, dst: UserPtrMut, src: &[u8]) -> Result<(), Status>;
}

/// The user-accessible part of an address space: `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserRegion {
    start: usize,
    end: usize,
}

impl UserRegion {
    /// Region of `len` bytes starting at `start`.
    ///
    /// Returns None if the region would wrap the address space.
    pub const fn new(start: usize, len: usize) -> Option<Self> {
        match start.checked_add(len) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    /// First user address.
    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last user address.
    #[inline]
    pub const fn end(&self) -> usize {
        self.end
    }
}

/// A validated user-space buffer
///
/// This type guarantees that:
/// - The buffer is within the user region
/// - The length doesn't overflow
#[derive(Debug)]
pub struct UserBuffer {
    ptr: *const u8,
    len: usize,
}

impl UserBuffer {
    /// Get the buffer as a byte slice
    ///
    /// # Safety
    /// The region the buffer was validated against must be mapped and
    /// readable for the lifetime of the returned slice. The contents may
    /// change underneath us, so copy them out before acting on them.
    pub unsafe fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY:
        // - Pointer and length were validated against the user region
        // - Caller guarantees the region is mapped
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// A validated mutable user-space buffer
#[derive(Debug)]
pub struct UserBufferMut {
    ptr: *mut u8,
    len: usize,
}

impl UserBufferMut {
    /// Get the buffer as a mutable byte slice
    ///
    /// # Safety
    /// Same considerations as [`UserBuffer::as_bytes`], plus the region
    /// must be writable.
    pub unsafe fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: Same as UserBuffer::as_bytes
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Validate a user-space read buffer
///
/// # Security Checks
/// 1. Pointer is not null
/// 2. Pointer is within the user region
/// 3. Pointer + length doesn't overflow
/// 4. End address is within the user region
pub fn validate_user_read(
    region: &UserRegion,
    ptr: usize,
    len: usize,
) -> Result<UserBuffer, Status> {
    // Zero-length reads are valid
    if len == 0 {
        return Ok(UserBuffer {
            ptr: ptr as *const u8,
            len: 0,
        });
    }

    if ptr == 0 {
        return Err(Status::Efault);
    }

    if ptr < region.start || ptr >= region.end {
        return Err(Status::Efault);
    }

    let end = ptr.checked_add(len).ok_or(Status::Efault)?;
    if end > region.end {
        return Err(Status::Efault);
    }

    Ok(UserBuffer {
        ptr: ptr as *const u8,
        len,
    })
}

/// Validate a user-space write buffer
///
/// Same as read validation, but the buffer will be written to.
pub fn validate_user_write(
    region: &UserRegion,
    ptr: usize,
    len: usize,
) -> Result<UserBufferMut, Status> {
    let read_buf = validate_user_read(region, ptr, len)?;

    Ok(UserBufferMut {
        ptr: read_buf.ptr as *mut u8,
        len: read_buf.len,
    })
}

/// User memory that is mapped into the kernel's address space.
///
/// The whole region is accessed directly once a range has been validated.
#[derive(Debug, Clone, Copy)]
pub struct DirectMapped {
    region: UserRegion,
}

impl DirectMapped {
    /// Access `region` directly.
    ///
    /// # Safety
    /// `region` must stay mapped, readable and writable for as long as this
    /// value is used, and must not overlap kernel data.
    pub const unsafe fn new(region: UserRegion) -> Self {
        Self { region }
    }

    /// The region this address space exposes.
    #[inline]
    pub const fn region(&self) -> &UserRegion {
        &self.region
    }
}

impl UserMemory for DirectMapped {
    fn copy_from_user(&self, src: UserPtr, dst: &mut [u8]) -> Result<(), Status> {
        let buf = validate_user_read(&self.region, src.addr(), dst.len()).map_err(|err| {
            debug!("usercopy: bad read {:?} len={}", src, dst.len());
            err
        })?;
        // SAFETY: the region is mapped per DirectMapped::new's contract
        dst.copy_from_slice(unsafe { buf.as_bytes() });
        Ok(())
    }

    fn copy_to_user(&self, dst: UserPtrMut, src: &[u8]) -> Result<(), Status> {
        let mut buf = validate_user_write(&self.region, dst.addr(), src.len()).map_err(|err| {
            debug!("usercopy: bad write {:?} len={}", dst, src.len());
            err
        })?;
        // SAFETY: the region is mapped per DirectMapped::new's contract
        unsafe { buf.as_bytes_mut() }.copy_from_slice(src);
        Ok(())
    }
}
