//! Message Packets
//!
//! A message packet is the unit a channel queues: a byte payload plus a
//! bounded set of handles, held in a single allocation.
//!
//! # Memory Layout
//! ```text
//! ┌────────────────────┬──────────────────────────────┬──────────────────┐
//! │ PacketHeader       │ handles: [Option<Handle>; n] │ payload: [u8; m] │
//! │ (link, sizes, ...) │                              │                  │
//! └────────────────────┴──────────────────────────────┴──────────────────┘
//!                      ^ handles_offset               ^ handles_offset + n * HANDLE_SLOT_SIZE
//! ```
//!
//! # Handle Ownership
//! - A new packet owns its (empty) handle slots
//! - The sender fills every slot before the packet is queued
//! - The receiver calls [`MessagePacket::transfer_handles`] to move the
//!   handles into its own table; the packet then owns nothing
//! - Dropping a packet releases whatever handles it still holds, so a
//!   cancelled message never leaks a capability and a delivered one is
//!   never released twice
//!
//! # Concurrency
//! Packets carry no lock. The sender has exclusive access until the packet
//! is queued, the queue's owner serialises queue access, and the receiver
//! has exclusive access after dequeue.

use alloc::vec::Vec;
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use log::{debug, trace};
use static_assertions::const_assert_eq;

use crate::abi::{Status, Txid, CHANNEL_MAX_MSG_BYTES, CHANNEL_MAX_MSG_HANDLES, TXID_BYTES};
use crate::cap::Handle;
use crate::heap::{PacketAlloc, KERNEL_HEAP};
use crate::queue::Link;
use crate::syscall::validate::{UserMemory, UserPtr, UserPtrMut};

/// Largest payload a packet can hold.
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Largest number of handles a packet can hold.
pub const MAX_MESSAGE_HANDLES: u32 = 64;

// The packet limits are user-visible through the channel syscalls.
const_assert_eq!(MAX_MESSAGE_SIZE, CHANNEL_MAX_MSG_BYTES);
const_assert_eq!(MAX_MESSAGE_HANDLES, CHANNEL_MAX_MSG_HANDLES);

/// Size of one handle slot in the packet buffer.
pub const HANDLE_SLOT_SIZE: usize = size_of::<Option<Handle>>();

/// Who is responsible for the handles in a packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandleOwnership {
    /// The packet releases its handles when destroyed.
    Owned,
    /// The handles were moved out to a receiver.
    Transferred,
}

/// Bookkeeping at the start of every packet allocation.
struct PacketHeader {
    link: Link,
    heap: &'static dyn PacketAlloc,
    layout: Layout,
    handles_offset: usize,
    data_size: u32,
    num_handles: u32,
    ownership: HandleOwnership,
}

/// Shape of a packet allocation.
struct PacketLayout {
    layout: Layout,
    handles_offset: usize,
    data_offset: usize,
}

impl PacketLayout {
    fn new(data_size: usize, num_handles: usize) -> Result<Self, Status> {
        let slots = Layout::array::<Option<Handle>>(num_handles).map_err(|_| Status::Einval)?;
        let payload = Layout::array::<u8>(data_size).map_err(|_| Status::Einval)?;
        let (layout, handles_offset) = Layout::new::<PacketHeader>()
            .extend(slots)
            .map_err(|_| Status::Einval)?;
        let (layout, data_offset) = layout.extend(payload).map_err(|_| Status::Einval)?;
        debug_assert_eq!(data_offset, handles_offset + num_handles * HANDLE_SLOT_SIZE);
        Ok(Self {
            layout,
            handles_offset,
            data_offset,
        })
    }
}

/// Initial payload contents.
enum Payload<'a> {
    Copy(&'a [u8]),
    Zeroed(usize),
}

/// A queued message: payload bytes plus the handles travelling with them.
pub struct MessagePacket {
    header: NonNull<PacketHeader>,
    _owned: PhantomData<PacketHeader>,
}

// SAFETY: a packet exclusively owns its allocation. Its contents (handles,
// bytes and a `Sync` allocator reference) are all safe to move to and share
// between threads.
unsafe impl Send for MessagePacket {}
// SAFETY: shared access only reads; all mutation needs `&mut self`.
unsafe impl Sync for MessagePacket {}

fn check_limits(data_size: usize, num_handles: u32) -> Result<(), Status> {
    if data_size > MAX_MESSAGE_SIZE as usize || num_handles > MAX_MESSAGE_HANDLES {
        debug!("packet: rejected size={data_size} handles={num_handles}");
        return Err(Status::Einval);
    }
    Ok(())
}

/// Read the transaction id from the leading payload bytes.
///
/// The id is stored in native byte order: it never leaves the machine, it
/// only pairs a call with its reply. Payloads shorter than a `Txid` have
/// id 0.
fn leading_txid(payload: &[u8]) -> Txid {
    match payload.get(..TXID_BYTES) {
        Some(leading) => {
            let mut raw = [0u8; TXID_BYTES];
            raw.copy_from_slice(leading);
            Txid::from_ne_bytes(raw)
        }
        None => 0,
    }
}

impl MessagePacket {
    /// Create a packet holding `data_size` bytes copied from user memory and
    /// room for `num_handles` handles.
    ///
    /// The handle slots start empty and must all be filled through
    /// [`handles_mut`](Self::handles_mut) before the packet is queued.
    ///
    /// # Errors
    /// - `Einval` if either limit is exceeded (checked before allocating)
    /// - `Enomem` if the packet cannot be allocated
    /// - `Efault` if the user range is invalid; no packet is produced
    pub fn create_from_user(
        space: &dyn UserMemory,
        data: UserPtr,
        data_size: u32,
        num_handles: u32,
    ) -> Result<Self, Status> {
        Self::create_from_user_in(&KERNEL_HEAP, space, data, data_size, num_handles)
    }

    /// [`create_from_user`](Self::create_from_user), allocating from `heap`.
    pub fn create_from_user_in(
        heap: &'static dyn PacketAlloc,
        space: &dyn UserMemory,
        data: UserPtr,
        data_size: u32,
        num_handles: u32,
    ) -> Result<Self, Status> {
        check_limits(data_size as usize, num_handles)?;
        let mut packet = Self::allocate(heap, num_handles, Payload::Zeroed(data_size as usize))?;
        space.copy_from_user(data, packet.data_mut())?;
        Ok(packet)
    }

    /// Create a packet from kernel-resident bytes with room for
    /// `num_handles` handles.
    ///
    /// # Errors
    /// - `Einval` if either limit is exceeded
    /// - `Enomem` if the packet cannot be allocated
    pub fn create(data: &[u8], num_handles: u32) -> Result<Self, Status> {
        Self::create_in(&KERNEL_HEAP, data, num_handles)
    }

    /// [`create`](Self::create), allocating from `heap`.
    pub fn create_in(
        heap: &'static dyn PacketAlloc,
        data: &[u8],
        num_handles: u32,
    ) -> Result<Self, Status> {
        check_limits(data.len(), num_handles)?;
        Self::allocate(heap, num_handles, Payload::Copy(data))
    }

    fn allocate(
        heap: &'static dyn PacketAlloc,
        num_handles: u32,
        payload: Payload<'_>,
    ) -> Result<Self, Status> {
        let data_size = match payload {
            Payload::Copy(bytes) => bytes.len(),
            Payload::Zeroed(len) => len,
        };
        let shape = PacketLayout::new(data_size, num_handles as usize)?;

        let Some(base) = heap.allocate(shape.layout) else {
            debug!("packet: out of memory ({} bytes)", shape.layout.size());
            return Err(Status::Enomem);
        };
        let header = base.cast::<PacketHeader>();

        // SAFETY:
        // - base is a fresh allocation of shape.layout, aligned for the header
        //   and the slots, and large enough for header + slots + payload
        // - every slot and every payload byte is written before the packet
        //   is handed out
        unsafe {
            header.as_ptr().write(PacketHeader {
                link: Link::new(),
                heap,
                layout: shape.layout,
                handles_offset: shape.handles_offset,
                data_size: data_size as u32,
                num_handles,
                ownership: HandleOwnership::Owned,
            });

            let slots = base.as_ptr().add(shape.handles_offset).cast::<Option<Handle>>();
            for i in 0..num_handles as usize {
                slots.add(i).write(None);
            }

            let data = base.as_ptr().add(shape.data_offset);
            match payload {
                Payload::Copy(bytes) => ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len()),
                Payload::Zeroed(len) => ptr::write_bytes(data, 0, len),
            }
        }

        trace!(
            "packet: create size={} handles={} alloc={}",
            data_size,
            num_handles,
            shape.layout.size()
        );
        Ok(Self {
            header,
            _owned: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &PacketHeader {
        // SAFETY: the header is initialised at creation and lives as long as self
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut PacketHeader {
        // SAFETY: as above, and &mut self gives exclusive access
        unsafe { self.header.as_mut() }
    }

    #[inline]
    fn slots_ptr(&self) -> *mut Option<Handle> {
        let offset = self.header().handles_offset;
        // SAFETY: handles_offset is inside the allocation
        unsafe { self.header.as_ptr().cast::<u8>().add(offset).cast() }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the payload starts right after the last slot
        unsafe { self.slots_ptr().add(self.num_handles() as usize).cast() }
    }

    /// Payload length in bytes.
    #[inline]
    pub fn data_size(&self) -> u32 {
        self.header().data_size
    }

    /// Number of handle slots.
    #[inline]
    pub fn num_handles(&self) -> u32 {
        self.header().num_handles
    }

    /// The handle slots.
    #[inline]
    pub fn handles(&self) -> &[Option<Handle>] {
        // SAFETY: num_handles slots were initialised at creation
        unsafe { core::slice::from_raw_parts(self.slots_ptr(), self.num_handles() as usize) }
    }

    /// The handle slots, for filling before the packet is queued or for
    /// taking handles out one by one during delivery.
    #[inline]
    pub fn handles_mut(&mut self) -> &mut [Option<Handle>] {
        // SAFETY: as in handles(), and &mut self gives exclusive access
        unsafe { core::slice::from_raw_parts_mut(self.slots_ptr(), self.num_handles() as usize) }
    }

    /// Check that every handle slot has been filled.
    pub fn is_populated(&self) -> bool {
        self.handles().iter().all(Option::is_some)
    }

    /// Current ownership of the handle slots.
    #[inline]
    pub fn ownership(&self) -> HandleOwnership {
        self.header().ownership
    }

    /// Whether destroying this packet would release its handles.
    #[inline]
    pub fn owns_handles(&self) -> bool {
        self.ownership() == HandleOwnership::Owned
    }

    /// Move every handle out of the packet and give up ownership of them.
    ///
    /// Used by the receiver to install the handles in its own table. After
    /// this, dropping the packet releases nothing.
    pub fn transfer_handles(&mut self) -> Vec<Handle> {
        let handles: Vec<Handle> = self.handles_mut().iter_mut().filter_map(Option::take).collect();
        self.header_mut().ownership = HandleOwnership::Transferred;
        handles
    }

    /// Copy the whole payload to user memory at `dst`.
    ///
    /// The packet is left unchanged whether or not the copy succeeds.
    ///
    /// # Errors
    /// - `Efault` if the destination range is not writable
    pub fn copy_data_to(&self, space: &dyn UserMemory, dst: UserPtrMut) -> Result<(), Status> {
        space.copy_to_user(dst, self.data())
    }

    /// Transaction id carried in the leading payload bytes, or 0 if the
    /// payload is shorter than a [`Txid`].
    #[inline]
    pub fn txid(&self) -> Txid {
        leading_txid(self.data())
    }

    /// Whether the packet is currently linked into a queue.
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.header().link.is_linked()
    }

    #[inline]
    pub(crate) fn data(&self) -> &[u8] {
        // SAFETY: data_size payload bytes were initialised at creation
        unsafe { core::slice::from_raw_parts(self.data_ptr(), self.data_size() as usize) }
    }

    #[inline]
    fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in data(), and &mut self gives exclusive access
        unsafe { core::slice::from_raw_parts_mut(self.data_ptr(), self.data_size() as usize) }
    }

    #[inline]
    pub(crate) fn link_mut(&mut self) -> &mut Link {
        &mut self.header_mut().link
    }

    #[inline]
    pub(crate) fn link(&self) -> &Link {
        &self.header().link
    }

    /// Stable address of this packet's link, valid while the packet lives.
    #[inline]
    pub(crate) fn link_ptr(&self) -> NonNull<Link> {
        // SAFETY: the header pointer is non-null, so is a field inside it
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*self.header.as_ptr()).link)) }
    }
}

impl Drop for MessagePacket {
    fn drop(&mut self) {
        debug_assert!(!self.is_queued(), "message packet dropped while queued");

        let released = self.handles().iter().filter(|slot| slot.is_some()).count();
        trace!(
            "packet: destroy size={} ownership={:?} released={}",
            self.data_size(),
            self.ownership(),
            released
        );

        let slots = ptr::slice_from_raw_parts_mut(self.slots_ptr(), self.num_handles() as usize);
        let heap = self.header().heap;
        let layout = self.header().layout;

        // SAFETY:
        // - slots and header were initialised at creation and are dropped once
        // - the block came from `heap` with `layout`
        // - nothing touches the packet after this
        unsafe {
            ptr::drop_in_place(slots);
            ptr::drop_in_place(self.header.as_ptr());
            heap.deallocate(self.header.cast(), layout);
        }
    }
}

impl fmt::Debug for MessagePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePacket")
            .field("data_size", &self.data_size())
            .field("num_handles", &self.num_handles())
            .field("ownership", &self.ownership())
            .field("txid", &self.txid())
            .finish()
    }
}
