//! Message System Calls
//!
//! Moves messages between a process and a packet queue.
//!
//! # Security Considerations
//! - Message limits are checked before anything is allocated or copied
//! - Every handle value is validated before any handle leaves the
//!   sender's table, so a bad value never strands half a message
//! - User copies run outside the queue lock
//! - A read that cannot complete leaves the message queued

use log::{debug, trace, warn};
use spin::Mutex;

use super::validate::{UserMemory, UserPtr, UserPtrMut};
use crate::abi::{RawHandle, Status, Txid};
use crate::cap::{HandleTable, HandleValue};
use crate::packet::{MessagePacket, MAX_MESSAGE_HANDLES};
use crate::queue::PacketQueue;

const RAW_HANDLE_BYTES: usize = core::mem::size_of::<RawHandle>();
const MAX_HANDLE_BYTES: usize = MAX_MESSAGE_HANDLES as usize * RAW_HANDLE_BYTES;

/// Arguments of a message write.
#[derive(Debug, Clone, Copy)]
pub struct MsgWriteArgs {
    /// Payload in the writer's memory
    pub bytes: UserPtr,
    /// Payload length
    pub num_bytes: u32,
    /// Array of handle values to send
    pub handles: UserPtr,
    /// Number of handle values
    pub num_handles: u32,
}

/// Arguments of a message read.
#[derive(Debug, Clone, Copy)]
pub struct MsgReadArgs {
    /// Payload destination
    pub bytes: UserPtrMut,
    /// Payload buffer capacity
    pub bytes_capacity: u32,
    /// Destination for the received handle values
    pub handles: UserPtrMut,
    /// Handle buffer capacity, in handles
    pub handles_capacity: u32,
}

/// What a successful read delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgReadResult {
    /// Payload bytes written
    pub num_bytes: u32,
    /// Handle values written
    pub num_handles: u32,
    /// Transaction id of the message
    pub txid: Txid,
}

/// Write a message from user memory into `queue`.
///
/// The handles named by `args.handles` move from `table` into the message.
///
/// # Errors
/// - `Einval` if a limit is exceeded or a handle value is repeated
/// - `Enomem` if the packet cannot be allocated
/// - `Efault` if a user range is invalid
/// - `Ebadf` if a handle value does not name a live handle
pub fn sys_msg_write(
    space: &dyn UserMemory,
    table: &mut HandleTable,
    queue: &Mutex<PacketQueue>,
    args: &MsgWriteArgs,
) -> Result<(), Status> {
    let mut packet =
        MessagePacket::create_from_user(space, args.bytes, args.num_bytes, args.num_handles)?;

    let count = args.num_handles as usize;
    let mut raw = [0u8; MAX_HANDLE_BYTES];
    let raw = &mut raw[..count * RAW_HANDLE_BYTES];
    space.copy_from_user(args.handles, raw)?;

    let mut values = [HandleValue::INVALID; MAX_MESSAGE_HANDLES as usize];
    for (value, chunk) in values.iter_mut().zip(raw.chunks_exact(RAW_HANDLE_BYTES)) {
        let mut bytes = [0u8; RAW_HANDLE_BYTES];
        bytes.copy_from_slice(chunk);
        *value = HandleValue::from_raw(RawHandle::from_ne_bytes(bytes)).ok_or(Status::Ebadf)?;
    }
    let values = &values[..count];

    for (i, &value) in values.iter().enumerate() {
        table.get(value)?;
        if values[..i].contains(&value) {
            debug!("msg_write: handle {} sent twice", value.raw());
            return Err(Status::Einval);
        }
    }

    for (slot, &value) in packet.handles_mut().iter_mut().zip(values) {
        *slot = Some(table.remove(value)?);
    }

    trace!(
        "msg_write: {} bytes, {} handles, txid={:#x}",
        args.num_bytes,
        args.num_handles,
        packet.txid()
    );
    queue.lock().push_back(packet);
    Ok(())
}

/// Read the oldest message in `queue` into user memory.
///
/// The message's handles are installed in `table` and their new values
/// written to `args.handles`.
///
/// # Errors
/// - `Eagain` if the queue is empty
/// - `Emsgsize` if either buffer is too small; the message stays queued
/// - `Emfile` if `table` cannot take the handles; the message stays queued
/// - `Efault` if a user range is invalid; the message stays queued
pub fn sys_msg_read(
    space: &dyn UserMemory,
    table: &mut HandleTable,
    queue: &Mutex<PacketQueue>,
    args: &MsgReadArgs,
) -> Result<MsgReadResult, Status> {
    let mut packet = {
        let mut pending = queue.lock();
        let front = pending.front().ok_or(Status::Eagain)?;
        if front.data_size() > args.bytes_capacity || front.num_handles() > args.handles_capacity {
            debug!(
                "msg_read: message {}/{} exceeds buffers {}/{}",
                front.data_size(),
                front.num_handles(),
                args.bytes_capacity,
                args.handles_capacity
            );
            return Err(Status::Emsgsize);
        }
        if (front.num_handles() as usize) > table.free_slots() {
            return Err(Status::Emfile);
        }
        pending.pop_front().ok_or(Status::Eagain)?
    };

    let count = packet.num_handles() as usize;
    let mut values = [HandleValue::INVALID; MAX_MESSAGE_HANDLES as usize];
    let mut raw = [0u8; MAX_HANDLE_BYTES];
    let raw = &mut raw[..count * RAW_HANDLE_BYTES];
    let slots = values.iter_mut().zip(raw.chunks_exact_mut(RAW_HANDLE_BYTES));
    for ((value, chunk), free) in slots.zip(table.free_values()) {
        *value = free;
        chunk.copy_from_slice(&free.raw().to_ne_bytes());
    }
    let values = &values[..count];

    // Handles stay in the packet until every copy-out has landed.
    let copied = space
        .copy_to_user(args.handles, raw)
        .and_then(|()| packet.copy_data_to(space, args.bytes));
    if let Err(err) = copied {
        warn!("msg_read: copy-out failed ({}), message requeued", err);
        queue.lock().push_front(packet);
        return Err(err);
    }

    for (&value, handle) in values.iter().zip(packet.transfer_handles()) {
        table.insert(value, handle).map_err(|(err, _)| Status::from(err))?;
    }

    let result = MsgReadResult {
        num_bytes: packet.data_size(),
        num_handles: packet.num_handles(),
        txid: packet.txid(),
    };
    trace!("msg_read: {:?}", result);
    Ok(result)
}

/// Destroy every message still pending in `queue`.
///
/// Used when the reading side goes away; handles in the dropped messages
/// are released. Returns the number of messages destroyed.
pub fn sys_msg_cancel(queue: &Mutex<PacketQueue>) -> usize {
    // Take the packets out first so they are destroyed outside the lock.
    let mut pending = core::mem::take(&mut *queue.lock());
    pending.clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::handle::tests::{handle_to, TestEvent};
    use crate::syscall::validate::tests::leak_user_space;
    use crate::syscall::validate::DirectMapped;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::cell::Cell;

    const BYTES_AT: usize = 0;
    const HANDLES_AT: usize = 1024;
    const OUT_BYTES_AT: usize = 2048;
    const OUT_HANDLES_AT: usize = 3072;

    struct Process {
        space: DirectMapped,
        table: HandleTable,
    }

    impl Process {
        fn new() -> Self {
            Self {
                space: leak_user_space(4096),
                table: HandleTable::new(),
            }
        }

        fn at(&self, offset: usize) -> usize {
            self.space.region().start() + offset
        }

        fn write(
            &mut self,
            queue: &Mutex<PacketQueue>,
            bytes: &[u8],
            values: &[HandleValue],
        ) -> Result<(), Status> {
            self.space.copy_to_user(UserPtrMut::new(self.at(BYTES_AT)), bytes).unwrap();
            let raw: Vec<u8> = values.iter().flat_map(|v| v.raw().to_ne_bytes()).collect();
            self.space.copy_to_user(UserPtrMut::new(self.at(HANDLES_AT)), &raw).unwrap();
            let args = MsgWriteArgs {
                bytes: UserPtr::new(self.at(BYTES_AT)),
                num_bytes: bytes.len() as u32,
                handles: UserPtr::new(self.at(HANDLES_AT)),
                num_handles: values.len() as u32,
            };
            sys_msg_write(&self.space, &mut self.table, queue, &args)
        }

        fn read_args(&self, bytes_capacity: u32, handles_capacity: u32) -> MsgReadArgs {
            MsgReadArgs {
                bytes: UserPtrMut::new(self.at(OUT_BYTES_AT)),
                bytes_capacity,
                handles: UserPtrMut::new(self.at(OUT_HANDLES_AT)),
                handles_capacity,
            }
        }

        fn read(&mut self, queue: &Mutex<PacketQueue>) -> Result<MsgReadResult, Status> {
            let args = self.read_args(1024, 64);
            sys_msg_read(&self.space, &mut self.table, queue, &args)
        }

        fn received_bytes(&self, len: usize) -> Vec<u8> {
            let mut out = alloc::vec![0u8; len];
            self.space.copy_from_user(UserPtr::new(self.at(OUT_BYTES_AT)), &mut out).unwrap();
            out
        }

        fn received_handles(&self, count: usize) -> Vec<HandleValue> {
            let mut raw = alloc::vec![0u8; count * RAW_HANDLE_BYTES];
            self.space.copy_from_user(UserPtr::new(self.at(OUT_HANDLES_AT)), &mut raw).unwrap();
            raw.chunks_exact(RAW_HANDLE_BYTES)
                .map(|c| RawHandle::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .map(|raw| HandleValue::from_raw(raw).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_handles_move_from_sender_to_receiver() {
        let event = TestEvent::new();
        let queue = Mutex::new(PacketQueue::new());
        let mut sender = Process::new();
        let mut receiver = Process::new();

        let a = sender.table.install(handle_to(&event)).unwrap();
        let b = sender.table.install(handle_to(&event)).unwrap();

        let mut message = 0x1234u32.to_ne_bytes().to_vec();
        message.extend_from_slice(b"hello");
        sender.write(&queue, &message, &[a, b]).unwrap();
        assert!(sender.table.is_empty());

        let result = receiver.read(&queue).unwrap();
        assert_eq!(
            result,
            MsgReadResult {
                num_bytes: message.len() as u32,
                num_handles: 2,
                txid: 0x1234,
            }
        );
        assert_eq!(receiver.received_bytes(message.len()), message);

        let values = receiver.received_handles(2);
        for value in &values {
            assert_eq!(receiver.table.get(*value).unwrap().koid(), event.koid);
        }
        assert_eq!(event.closed(), 0);
        assert_eq!(Arc::strong_count(&event), 3);
        assert!(queue.lock().is_empty());
    }

    #[test]
    fn test_empty_queue() {
        let queue = Mutex::new(PacketQueue::new());
        let mut receiver = Process::new();
        assert_eq!(receiver.read(&queue).unwrap_err(), Status::Eagain);
    }

    #[test]
    fn test_bad_handle_keeps_sender_table() {
        let event = TestEvent::new();
        let queue = Mutex::new(PacketQueue::new());
        let mut sender = Process::new();
        let a = sender.table.install(handle_to(&event)).unwrap();
        let missing = HandleValue::from_raw(200).unwrap();

        assert_eq!(sender.write(&queue, b"x", &[a, missing]).unwrap_err(), Status::Ebadf);
        assert_eq!(sender.write(&queue, b"x", &[a, a]).unwrap_err(), Status::Einval);
        assert_eq!(sender.table.len(), 1);
        assert!(queue.lock().is_empty());
        assert_eq!(event.closed(), 0);
    }

    #[test]
    fn test_small_buffer_keeps_message() {
        let queue = Mutex::new(PacketQueue::new());
        let mut sender = Process::new();
        let mut receiver = Process::new();
        sender.write(&queue, b"0123456789", &[]).unwrap();

        let args = receiver.read_args(4, 0);
        assert_eq!(
            sys_msg_read(&receiver.space, &mut receiver.table, &queue, &args).unwrap_err(),
            Status::Emsgsize
        );
        assert_eq!(queue.lock().len(), 1);
        assert_eq!(receiver.read(&queue).unwrap().num_bytes, 10);
    }

    #[test]
    fn test_bad_destination_requeues() {
        let event = TestEvent::new();
        let queue = Mutex::new(PacketQueue::new());
        let mut sender = Process::new();
        let mut receiver = Process::new();
        let a = sender.table.install(handle_to(&event)).unwrap();
        sender.write(&queue, b"first", &[a]).unwrap();
        sender.write(&queue, b"second", &[]).unwrap();

        let mut args = receiver.read_args(64, 1);
        args.bytes = UserPtrMut::new(receiver.space.region().end() - 2);
        assert_eq!(
            sys_msg_read(&receiver.space, &mut receiver.table, &queue, &args).unwrap_err(),
            Status::Efault
        );
        assert!(receiver.table.is_empty());
        assert_eq!(event.closed(), 0);

        // Still first in line.
        let result = receiver.read(&queue).unwrap();
        assert_eq!(result.num_handles, 1);
        assert_eq!(receiver.received_bytes(5), b"first");
    }

    /// Address space whose writes to one address start faulting after a
    /// number of successful writes.
    struct FlakyHandleDest<'a> {
        inner: &'a DirectMapped,
        dest: usize,
        writes_left: Cell<usize>,
    }

    impl UserMemory for FlakyHandleDest<'_> {
        fn copy_from_user(&self, src: UserPtr, dst: &mut [u8]) -> Result<(), Status> {
            self.inner.copy_from_user(src, dst)
        }

        fn copy_to_user(&self, dst: UserPtrMut, src: &[u8]) -> Result<(), Status> {
            if dst.addr() == self.dest {
                let left = self.writes_left.get();
                if left == 0 {
                    return Err(Status::Efault);
                }
                self.writes_left.set(left - 1);
            }
            self.inner.copy_to_user(dst, src)
        }
    }

    #[test]
    fn test_handle_dest_fault_keeps_message() {
        let event = TestEvent::new();
        let queue = Mutex::new(PacketQueue::new());
        let mut sender = Process::new();
        let mut receiver = Process::new();
        let a = sender.table.install(handle_to(&event)).unwrap();
        let b = sender.table.install(handle_to(&event)).unwrap();
        sender.write(&queue, b"pair", &[a, b]).unwrap();

        let args = receiver.read_args(64, 2);
        let faulting = FlakyHandleDest {
            inner: &receiver.space,
            dest: receiver.at(OUT_HANDLES_AT),
            writes_left: Cell::new(0),
        };
        assert_eq!(
            sys_msg_read(&faulting, &mut receiver.table, &queue, &args).unwrap_err(),
            Status::Efault
        );
        assert_eq!(queue.lock().len(), 1);
        assert!(receiver.table.is_empty());
        assert_eq!(event.closed(), 0);

        // A single write to the handle buffer is all a read needs.
        let once = FlakyHandleDest {
            inner: &receiver.space,
            dest: receiver.at(OUT_HANDLES_AT),
            writes_left: Cell::new(1),
        };
        let result = sys_msg_read(&once, &mut receiver.table, &queue, &args).unwrap();
        assert_eq!(result.num_handles, 2);
        assert!(queue.lock().is_empty());
        for value in receiver.received_handles(2) {
            assert_eq!(receiver.table.get(value).unwrap().koid(), event.koid);
        }
        assert_eq!(receiver.table.len(), 2);
        assert_eq!(event.closed(), 0);
    }

    #[test]
    fn test_cancel_releases_pending_handles() {
        let event = TestEvent::new();
        let queue = Mutex::new(PacketQueue::new());
        let mut sender = Process::new();
        for _ in 0..3 {
            let value = sender.table.install(handle_to(&event)).unwrap();
            sender.write(&queue, b"pending", &[value]).unwrap();
        }

        assert_eq!(sys_msg_cancel(&queue), 3);
        assert!(queue.lock().is_empty());
        assert_eq!(event.closed(), 3);
        assert_eq!(Arc::strong_count(&event), 1);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let queue = Mutex::new(PacketQueue::new());
        let mut sender = Process::new();
        let args = MsgWriteArgs {
            bytes: UserPtr::new(sender.at(BYTES_AT)),
            num_bytes: 65537,
            handles: UserPtr::new(sender.at(HANDLES_AT)),
            num_handles: 0,
        };
        assert_eq!(
            sys_msg_write(&sender.space, &mut sender.table, &queue, &args).unwrap_err(),
            Status::Einval
        );
    }
}
