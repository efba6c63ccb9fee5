//! Packet Allocators
//!
//! Message packets are single allocations sized at runtime. Every packet
//! remembers the allocator it came from and is freed through it.
//!
//! # Allocators
//! - [`KernelHeap`]: the global kernel heap (the kernel image registers a
//!   `linked_list_allocator::LockedHeap` as `#[global_allocator]`)
//! - [`PacketPool`]: a dedicated, bounded message pool carved out of a
//!   static memory region, so that a flood of messages cannot exhaust the
//!   general kernel heap
//!
//! # Security Considerations
//! - Allocation failure is reported, never turned into a panic
//! - The pool region is handed over once and never touched directly again

use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::LockedHeap;

/// Source of packet buffers.
pub trait PacketAlloc: Sync {
    /// Allocate a block for `layout`. `layout` always has a non-zero size.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Free a block.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global kernel heap.
#[derive(Debug)]
pub struct KernelHeap;

/// Allocator used by the packet constructors that don't take one.
pub static KERNEL_HEAP: KernelHeap = KernelHeap;

impl PacketAlloc for KernelHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        // SAFETY: layout has a non-zero size (packet header is never empty)
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr/layout came from `allocate`
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// A bounded pool of packet memory.
pub struct PacketPool {
    heap: LockedHeap,
}

impl PacketPool {
    /// Create a pool managing `memory`.
    ///
    /// The region is owned by the pool from now on.
    pub fn new(memory: &'static mut [u8]) -> Self {
        let pool = Self {
            heap: LockedHeap::empty(),
        };
        // SAFETY:
        // - memory is a valid, exclusively borrowed static region
        // - the mutable borrow is consumed here, so nothing else can reach it
        unsafe {
            pool.heap.lock().init(memory.as_mut_ptr(), memory.len());
        }
        pool
    }

    /// Total bytes managed by the pool.
    pub fn size(&self) -> usize {
        self.heap.lock().size()
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.heap.lock().used()
    }

    /// Bytes still available.
    pub fn free(&self) -> usize {
        self.heap.lock().free()
    }
}

impl PacketAlloc for PacketPool {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.heap.lock().allocate_first_fit(layout).ok()
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr/layout came from this pool
        unsafe { self.heap.lock().deallocate(ptr, layout) }
    }
}

impl core::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let heap = self.heap.lock();
        write!(f, "PacketPool(used={}, size={})", heap.used(), heap.size())
    }
}
