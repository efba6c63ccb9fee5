//! Packet Queues
//!
//! FIFO of message packets, linked through the packets themselves so that
//! queueing never allocates.
//!
//! # Structure
//! ```text
//! PacketQueue
//!   head ──owns──▶ [P1] ──owns──▶ [P2] ──owns──▶ [P3]
//!                   ▲ ◀──prev────── ▲ ◀──prev────── ▲
//!   tail ───────────────────────────────────────────┘
//! ```
//! Each packet owns the next one, so the queue owns everything linked into
//! it. `prev` and `tail` are plain pointers into packets the queue owns.
//!
//! # Rules
//! - A packet is in at most one queue at a time
//! - Dequeuing hands exclusive ownership back to the caller
//! - Clearing or dropping a queue destroys the pending packets, which
//!   releases the handles they hold

use core::fmt;
use core::ptr::NonNull;

use log::{debug, trace};

use crate::packet::MessagePacket;

/// Queue linkage embedded in every packet.
pub(crate) struct Link {
    next: Option<MessagePacket>,
    prev: Option<NonNull<Link>>,
    linked: bool,
}

impl Link {
    pub(crate) const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
        }
    }

    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.linked
    }
}

/// A FIFO of message packets.
pub struct PacketQueue {
    head: Option<MessagePacket>,
    tail: Option<NonNull<Link>>,
    len: usize,
}

// SAFETY: the queue owns every packet reachable from it; `tail` and the
// `prev` links only point into those packets.
unsafe impl Send for PacketQueue {}
// SAFETY: shared access only reads through owned packets.
unsafe impl Sync for PacketQueue {}

impl PacketQueue {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of queued packets.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// The oldest packet, if any.
    #[inline]
    pub fn front(&self) -> Option<&MessagePacket> {
        self.head.as_ref()
    }

    /// Append a packet.
    pub fn push_back(&mut self, mut packet: MessagePacket) {
        debug_assert!(!packet.is_queued(), "packet is already queued");
        debug_assert!(packet.is_populated(), "packet queued with empty handle slots");

        let link_ptr = packet.link_ptr();
        {
            let link = packet.link_mut();
            link.prev = self.tail;
            link.linked = true;
        }

        match self.tail {
            // SAFETY: tail is the link of the last packet, which this queue
            // owns; &mut self rules out any other access to it
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(packet) },
            None => self.head = Some(packet),
        }
        self.tail = Some(link_ptr);
        self.len += 1;
        trace!("queue: push_back len={}", self.len);
    }

    /// Put a packet back at the front, ahead of everything queued.
    pub fn push_front(&mut self, mut packet: MessagePacket) {
        debug_assert!(!packet.is_queued(), "packet is already queued");
        debug_assert!(packet.is_populated(), "packet queued with empty handle slots");

        let link_ptr = packet.link_ptr();
        match self.head.take() {
            Some(mut old) => {
                old.link_mut().prev = Some(link_ptr);
                packet.link_mut().next = Some(old);
            }
            None => self.tail = Some(link_ptr),
        }
        packet.link_mut().linked = true;
        self.head = Some(packet);
        self.len += 1;
        trace!("queue: push_front len={}", self.len);
    }

    /// Remove the oldest packet.
    pub fn pop_front(&mut self) -> Option<MessagePacket> {
        let mut packet = self.head.take()?;
        let link = packet.link_mut();
        self.head = link.next.take();
        link.prev = None;
        link.linked = false;

        match self.head.as_mut() {
            Some(next) => next.link_mut().prev = None,
            None => self.tail = None,
        }
        self.len -= 1;
        trace!("queue: pop_front len={}", self.len);
        Some(packet)
    }

    /// Remove the oldest packet matching `pred`.
    pub fn remove_first<F>(&mut self, mut pred: F) -> Option<MessagePacket>
    where
        F: FnMut(&MessagePacket) -> bool,
    {
        let index = self.iter().position(|packet| pred(packet))?;
        if index == 0 {
            return self.pop_front();
        }

        let mut cursor = &mut self.head;
        for _ in 0..index {
            cursor = &mut cursor.as_mut()?.link_mut().next;
        }

        let mut packet = cursor.take()?;
        let link = packet.link_mut();
        let prev = link.prev.take();
        let next = link.next.take();
        link.linked = false;

        *cursor = next;
        match cursor.as_mut() {
            Some(next) => next.link_mut().prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        Some(packet)
    }

    /// Iterate over the queued packets, oldest first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_ref(),
            remaining: self.len,
        }
    }

    /// Destroy every queued packet, releasing the handles they carry.
    ///
    /// Returns the number of packets destroyed.
    pub fn clear(&mut self) -> usize {
        let mut count = 0;
        while let Some(packet) = self.pop_front() {
            drop(packet);
            count += 1;
        }
        if count > 0 {
            debug!("queue: cancelled {} pending packets", count);
        }
        count
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PacketQueue {
    fn drop(&mut self) {
        // Iteratively, so a long queue can't overflow the stack.
        self.clear();
    }
}

impl fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over a [`PacketQueue`].
pub struct Iter<'a> {
    next: Option<&'a MessagePacket>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a MessagePacket;

    fn next(&mut self) -> Option<Self::Item> {
        let packet = self.next?;
        self.next = packet.link().next.as_ref();
        self.remaining -= 1;
        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a PacketQueue {
    type Item = &'a MessagePacket;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
