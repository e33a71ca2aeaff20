//! Circular message buffers: a fixed-capacity FIFO of fixed-size
//! messages.
//!
//! When a receiver is already parked on an empty buffer, an arriving
//! message is copied directly sender-to-receiver without touching the
//! FIFO; symmetrically, a receiver that frees a slot pulls in the message
//! of the longest-waiting sender.
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr;

use crate::{
    error::{CreateError, DeleteError, QueryError, ReceiveError, SendError},
    kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    utils::{Init, ObjectId},
    wait::{self, RecvPtr, SendPtr, WaitPayload, WaitQueue, WaitValue},
    KernelTraits, PortThreading, Timeout,
};

/// *Message-buffer control block*. The caller supplies both the control
/// block and the message storage; `create` initializes them.
pub struct MsgBufCb<Traits: PortThreading> {
    pub(crate) ident: CpuLockCell<Traits, ObjectId>,
    pub(crate) buf: CpuLockCell<Traits, RecvPtr>,
    pub(crate) msg_size: CpuLockCell<Traits, usize>,
    /// Capacity in messages. Zero makes the buffer purely a rendezvous
    /// point.
    pub(crate) capacity: CpuLockCell<Traits, u32>,
    pub(crate) count: CpuLockCell<Traits, u32>,
    /// Index of the next message to read.
    pub(crate) head: CpuLockCell<Traits, u32>,
    /// Index of the next free slot.
    pub(crate) tail: CpuLockCell<Traits, u32>,
    pub(crate) send_queue: WaitQueue<Traits>,
    pub(crate) recv_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for MsgBufCb<Traits> {
    const INIT: Self = Self {
        ident: Init::INIT,
        buf: CpuLockCell::new(RecvPtr(core::ptr::null_mut())),
        msg_size: Init::INIT,
        capacity: Init::INIT,
        count: Init::INIT,
        head: Init::INIT,
        tail: Init::INIT,
        send_queue: Init::INIT,
        recv_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> MsgBufCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for MsgBufCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MsgBufCb")
            .field("self", &(self as *const _))
            .field("msg_size", &self.msg_size)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> MsgBufCb<Traits> {
    /// Initialize the buffer over `storage` with messages of `msg_size`
    /// bytes. The capacity is `storage.len() / msg_size` messages; zero
    /// capacity is legal and makes every transfer a direct rendezvous.
    pub fn create(
        &'static self,
        storage: &'static mut [MaybeUninit<u8>],
        msg_size: usize,
    ) -> Result<(), CreateError> {
        kernel::expect_thread_context::<Traits>()?;
        if msg_size == 0 {
            return Err(CreateError::WrongParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::INVALID {
            return Err(CreateError::WrongParam);
        }

        self.buf
            .replace(&mut *lock, RecvPtr(storage.as_mut_ptr() as *mut u8));
        self.msg_size.replace(&mut *lock, msg_size);
        self.capacity
            .replace(&mut *lock, (storage.len() / msg_size) as u32);
        self.count.replace(&mut *lock, 0);
        self.head.replace(&mut *lock, 0);
        self.tail.replace(&mut *lock, 0);
        self.ident.replace(&mut *lock, ObjectId::MSG_BUFFER);
        Ok(())
    }

    fn fifo_write(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        msg: *const u8,
        to_front: bool,
    ) {
        let msg_size = self.msg_size.get(&*lock);
        let capacity = self.capacity.get(&*lock);
        let base = self.buf.get(&*lock).0;

        let slot = if to_front {
            let head = (self.head.get(&*lock) + capacity - 1) % capacity;
            self.head.replace(&mut *lock, head);
            head
        } else {
            let tail = self.tail.get(&*lock);
            self.tail.replace(&mut *lock, (tail + 1) % capacity);
            tail
        };

        // Safety: `slot < capacity`, and the storage holds
        // `capacity * msg_size` bytes
        unsafe {
            ptr::copy_nonoverlapping(msg, base.add(slot as usize * msg_size), msg_size);
        }
        self.count.replace_with(&mut *lock, |n| *n + 1);
    }

    fn fifo_read(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, out: *mut u8) {
        let msg_size = self.msg_size.get(&*lock);
        let capacity = self.capacity.get(&*lock);
        let base = self.buf.get(&*lock).0;

        let head = self.head.get(&*lock);
        self.head.replace(&mut *lock, (head + 1) % capacity);

        // Safety: same bounds argument as `fifo_write`
        unsafe {
            ptr::copy_nonoverlapping(base.add(head as usize * msg_size), out, msg_size);
        }
        self.count.replace_with(&mut *lock, |n| *n - 1);
    }

    fn send_core(
        &'static self,
        msg: &[u8],
        to_front: bool,
        timeout: Timeout,
    ) -> Result<(), SendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MSG_BUFFER {
            return Err(SendError::NoExist);
        }
        if msg.len() != self.msg_size.get(&*lock) {
            return Err(SendError::WrongParam);
        }
        if !timeout.is_poll() {
            kernel::expect_waitable_context::<Traits>(lock.borrow_mut())?;
        }

        // A parked receiver implies the FIFO is empty; copy directly.
        if let Some(receiver) = self.recv_queue.front(lock.borrow_mut()) {
            if let WaitPayload::MsgReceive { buf } = receiver.0.wait.payload.get(&*lock) {
                // Safety: the receiver's buffer is `msg_size` bytes and
                // stays live while it is parked
                unsafe { ptr::copy_nonoverlapping(msg.as_ptr(), buf.0, msg.len()) };
            } else {
                unreachable!()
            }
            wait::exit_wait(lock.borrow_mut(), receiver, Ok(WaitValue::None));
            return Ok(());
        }

        if self.count.get(&*lock) < self.capacity.get(&*lock) {
            self.fifo_write(lock.borrow_mut(), msg.as_ptr(), to_front);
            return Ok(());
        }

        if timeout.is_poll() {
            return Err(SendError::Timeout);
        }

        wait::enter_wait(
            lock.borrow_mut(),
            Some(&self.send_queue),
            WaitPayload::MsgSend {
                msg: SendPtr(msg.as_ptr()),
                to_front,
            },
            timeout,
        );
        drop(lock);

        wait::finish::<Traits>().map(|_| ()).map_err(Into::into)
    }

    /// Append a message, waiting up to `timeout` while the buffer is full.
    ///
    /// `msg.len()` must equal the buffer's message size. With
    /// `Timeout::Poll` this is legal from interrupt context.
    pub fn send(&'static self, msg: &[u8], timeout: Timeout) -> Result<(), SendError> {
        self.send_core(msg, false, timeout)
    }

    /// Push a message at the head of the FIFO so it is received first.
    pub fn send_front(&'static self, msg: &[u8], timeout: Timeout) -> Result<(), SendError> {
        self.send_core(msg, true, timeout)
    }

    /// Take the oldest message into `buf`, waiting up to `timeout` while
    /// the buffer is empty.
    ///
    /// `buf.len()` must equal the buffer's message size. With
    /// `Timeout::Poll` this is legal from interrupt context.
    pub fn receive(&'static self, buf: &mut [u8], timeout: Timeout) -> Result<(), ReceiveError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MSG_BUFFER {
            return Err(ReceiveError::NoExist);
        }
        if buf.len() != self.msg_size.get(&*lock) {
            return Err(ReceiveError::WrongParam);
        }
        if !timeout.is_poll() {
            kernel::expect_waitable_context::<Traits>(lock.borrow_mut())?;
        }

        if self.count.get(&*lock) > 0 {
            self.fifo_read(lock.borrow_mut(), buf.as_mut_ptr());

            // A slot opened up; pull in the longest-waiting sender.
            if let Some(sender) = self.send_queue.front(lock.borrow_mut()) {
                if let WaitPayload::MsgSend { msg, to_front } = sender.0.wait.payload.get(&*lock) {
                    self.fifo_write(lock.borrow_mut(), msg.0, to_front);
                } else {
                    unreachable!()
                }
                wait::exit_wait(lock.borrow_mut(), sender, Ok(WaitValue::None));
            }
            return Ok(());
        }

        // Empty FIFO with a parked sender: zero-capacity rendezvous.
        if let Some(sender) = self.send_queue.front(lock.borrow_mut()) {
            if let WaitPayload::MsgSend { msg, .. } = sender.0.wait.payload.get(&*lock) {
                // Safety: the sender's message is `msg_size` bytes and
                // stays live while it is parked
                unsafe { ptr::copy_nonoverlapping(msg.0, buf.as_mut_ptr(), buf.len()) };
            } else {
                unreachable!()
            }
            wait::exit_wait(lock.borrow_mut(), sender, Ok(WaitValue::None));
            return Ok(());
        }

        if timeout.is_poll() {
            return Err(ReceiveError::Timeout);
        }

        wait::enter_wait(
            lock.borrow_mut(),
            Some(&self.recv_queue),
            WaitPayload::MsgReceive {
                buf: RecvPtr(buf.as_mut_ptr()),
            },
            timeout,
        );
        drop(lock);

        wait::finish::<Traits>().map(|_| ()).map_err(Into::into)
    }

    /// Drop every buffered message. Parked senders stay parked.
    pub fn flush(&'static self) -> Result<(), QueryError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MSG_BUFFER {
            return Err(QueryError::NoExist);
        }

        self.count.replace(&mut *lock, 0);
        self.head.replace(&mut *lock, 0);
        self.tail.replace(&mut *lock, 0);
        Ok(())
    }

    /// Is the buffer empty?
    pub fn is_empty(&'static self) -> Result<bool, QueryError> {
        Ok(self.message_count()? == 0)
    }

    /// Is the buffer full?
    pub fn is_full(&'static self) -> Result<bool, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MSG_BUFFER {
            return Err(QueryError::NoExist);
        }
        Ok(self.count.get(&*lock) == self.capacity.get(&*lock))
    }

    /// Get the number of buffered messages.
    pub fn message_count(&'static self) -> Result<u32, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MSG_BUFFER {
            return Err(QueryError::NoExist);
        }
        Ok(self.count.get(&*lock))
    }

    /// Delete the buffer, waking every parked sender and receiver with a
    /// *deleted* result.
    pub fn delete(&'static self) -> Result<(), DeleteError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MSG_BUFFER {
            return Err(DeleteError::NoExist);
        }

        self.send_queue.wake_all_deleted(lock.borrow_mut());
        self.recv_queue.wake_all_deleted(lock.borrow_mut());
        self.ident.replace(&mut *lock, ObjectId::INVALID);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WaitError;
    use crate::test_port::{self, define_test_kernel};
    use crate::thread::{self, ThreadCb, ThreadOptions, ThreadState};

    fn buf_storage(bytes: usize) -> &'static mut [MaybeUninit<u8>] {
        Box::leak(vec![MaybeUninit::new(0u8); bytes].into_boxed_slice())
    }

    fn spawn<Traits: KernelTraits>(
        t: &'static ThreadCb<Traits>,
        name: &'static str,
        priority: crate::Priority,
    ) {
        thread::create::<Traits>(
            t,
            Some(name),
            test_port::noop_entry,
            0,
            test_port::test_stack(),
            priority,
            ThreadOptions::START_ON_CREATE,
        )
        .unwrap();
    }

    #[test]
    fn fifo_round_trip() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(12), 4).unwrap();

        for msg in [[1u8, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]] {
            BUF.send(&msg, Timeout::Poll).unwrap();
        }
        assert!(BUF.is_full().unwrap());
        assert_eq!(BUF.message_count().unwrap(), 3);
        assert_eq!(
            BUF.send(&[0; 4], Timeout::Poll),
            Err(SendError::Timeout)
        );

        let mut out = [0u8; 4];
        for expected in [[1u8, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]] {
            BUF.receive(&mut out, Timeout::Poll).unwrap();
            assert_eq!(out, expected);
        }
        assert!(BUF.is_empty().unwrap());
        assert_eq!(
            BUF.receive(&mut out, Timeout::Poll),
            Err(ReceiveError::Timeout)
        );
    }

    #[test]
    fn send_front_is_received_first() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(12), 4).unwrap();

        BUF.send(&[1; 4], Timeout::Poll).unwrap();
        BUF.send_front(&[2; 4], Timeout::Poll).unwrap();

        let mut out = [0u8; 4];
        BUF.receive(&mut out, Timeout::Poll).unwrap();
        assert_eq!(out, [2; 4]);
        BUF.receive(&mut out, Timeout::Poll).unwrap();
        assert_eq!(out, [1; 4]);
    }

    #[test]
    fn message_size_is_enforced() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(8), 4).unwrap();

        assert_eq!(BUF.send(&[0; 3], Timeout::Poll), Err(SendError::WrongParam));
        let mut short = [0u8; 2];
        assert_eq!(
            BUF.receive(&mut short, Timeout::Poll),
            Err(ReceiveError::WrongParam)
        );
    }

    /// A receiver freeing a slot pulls in the message of the waiting
    /// sender, preserving FIFO order.
    #[test]
    fn receiver_backfills_from_waiting_sender() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        static S: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(8), 4).unwrap();
        spawn(&S, "s", 5);
        test_port::park_timer_thread::<Sys>();

        BUF.send(&[1; 4], Timeout::Poll).unwrap();
        BUF.send(&[2; 4], Timeout::Poll).unwrap();

        // S blocks trying to push a third message
        let msg3: &'static [u8] = Box::leak(Box::new([3u8; 4]));
        let _ = BUF.send(msg3, Timeout::Forever);
        test_port::commit_switch::<Sys>();
        assert_eq!(thread::state::<Sys>(&S).unwrap(), ThreadState::BLOCKED);

        let mut out = [0u8; 4];
        BUF.receive(&mut out, Timeout::Poll).unwrap();
        assert_eq!(out, [1; 4]);
        // The sender completed and its message is in the FIFO
        assert!(thread::state::<Sys>(&S).unwrap().intersects(ThreadState::READY | ThreadState::RUNNING));
        assert_eq!(BUF.message_count().unwrap(), 2);

        BUF.receive(&mut out, Timeout::Poll).unwrap();
        assert_eq!(out, [2; 4]);
        BUF.receive(&mut out, Timeout::Poll).unwrap();
        assert_eq!(out, [3; 4]);
    }

    /// A message sent while a receiver waits is copied directly
    /// receiver-to-sender without touching the buffer.
    #[test]
    fn rendezvous_with_waiting_receiver() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        static R: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(8), 4).unwrap();
        spawn(&R, "r", 5);
        test_port::park_timer_thread::<Sys>();

        // R blocks on the empty buffer
        let out: &'static mut [u8] = Box::leak(Box::new([0u8; 4]));
        let out_raw = out.as_mut_ptr();
        let _ = BUF.receive(out, Timeout::Forever);
        test_port::commit_switch::<Sys>();
        assert_eq!(thread::state::<Sys>(&R).unwrap(), ThreadState::BLOCKED);

        BUF.send(&[7; 4], Timeout::Poll).unwrap();
        assert!(thread::state::<Sys>(&R).unwrap().intersects(ThreadState::READY | ThreadState::RUNNING));
        // Copied straight into the receiver's buffer
        assert_eq!(BUF.message_count().unwrap(), 0);
        let delivered = unsafe { core::slice::from_raw_parts(out_raw, 4) };
        assert_eq!(delivered, &[7; 4]);
    }

    /// With no storage at all, every transfer is a sender-receiver
    /// rendezvous.
    #[test]
    fn zero_capacity_rendezvous() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        static S: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(0), 4).unwrap();
        spawn(&S, "s", 5);
        test_port::park_timer_thread::<Sys>();

        let msg: &'static [u8] = Box::leak(Box::new([9u8; 4]));
        let _ = BUF.send(msg, Timeout::Forever);
        test_port::commit_switch::<Sys>();
        assert_eq!(thread::state::<Sys>(&S).unwrap(), ThreadState::BLOCKED);

        let mut out = [0u8; 4];
        BUF.receive(&mut out, Timeout::Poll).unwrap();
        assert_eq!(out, [9; 4]);
        assert!(thread::state::<Sys>(&S).unwrap().intersects(ThreadState::READY | ThreadState::RUNNING));
    }

    #[test]
    fn flush_resets_the_fifo() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(8), 4).unwrap();

        BUF.send(&[1; 4], Timeout::Poll).unwrap();
        BUF.flush().unwrap();
        assert!(BUF.is_empty().unwrap());
        let mut out = [0u8; 4];
        assert_eq!(
            BUF.receive(&mut out, Timeout::Poll),
            Err(ReceiveError::Timeout)
        );
    }

    #[test]
    fn delete_wakes_both_sides() {
        define_test_kernel!(Sys);
        static BUF: MsgBufCb<Sys> = MsgBufCb::new();
        static R: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        BUF.create(buf_storage(4), 4).unwrap();
        spawn(&R, "r", 5);
        test_port::park_timer_thread::<Sys>();

        let out: &'static mut [u8; 4] = Box::leak(Box::new([0u8; 4]));
        let _ = BUF.receive(out, Timeout::Forever);
        test_port::commit_switch::<Sys>();

        BUF.delete().unwrap();
        assert_eq!(test_port::wait_result::<Sys>(&R), Err(WaitError::Deleted));
        assert_eq!(BUF.flush(), Err(QueryError::NoExist));
    }
}
