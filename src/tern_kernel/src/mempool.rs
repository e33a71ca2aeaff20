//! Fixed-size memory pools.
use core::fmt;
use core::mem::{size_of, MaybeUninit};
use core::ptr::NonNull;

use crate::{
    error::{AcquireError, CreateError, DeleteError, QueryError, ReleaseError},
    kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    utils::{Init, ObjectId},
    wait::{self, BlockPtr, WaitPayload, WaitQueue, WaitValue},
    KernelTraits, PortThreading, Timeout,
};

/// *Memory-pool control block*: equally-sized blocks carved out of
/// caller-supplied storage, free blocks kept on a LIFO list threaded
/// through the blocks themselves.
pub struct MemoryPoolCb<Traits: PortThreading> {
    pub(crate) ident: CpuLockCell<Traits, ObjectId>,
    /// Block size in bytes, rounded up to a word multiple.
    pub(crate) block_size: CpuLockCell<Traits, usize>,
    pub(crate) capacity: CpuLockCell<Traits, u32>,
    pub(crate) free_count: CpuLockCell<Traits, u32>,
    pub(crate) free_head: CpuLockCell<Traits, Option<BlockPtr>>,
    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for MemoryPoolCb<Traits> {
    const INIT: Self = Self {
        ident: Init::INIT,
        block_size: Init::INIT,
        capacity: Init::INIT,
        free_count: Init::INIT,
        free_head: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> MemoryPoolCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for MemoryPoolCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryPoolCb")
            .field("self", &(self as *const _))
            .field("block_size", &self.block_size)
            .field("free_count", &self.free_count)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> MemoryPoolCb<Traits> {
    /// Initialize the pool over `storage`, splitting it into blocks of
    /// `block_size` bytes (rounded up to a word multiple). Returns the
    /// number of blocks.
    pub fn create(
        &'static self,
        storage: &'static mut [MaybeUninit<usize>],
        block_size: usize,
    ) -> Result<u32, CreateError> {
        kernel::expect_thread_context::<Traits>()?;
        if block_size == 0 {
            return Err(CreateError::WrongParam);
        }
        let words_per_block = (block_size + size_of::<usize>() - 1) / size_of::<usize>();
        let capacity = storage.len() / words_per_block;
        if capacity == 0 {
            return Err(CreateError::WrongParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::INVALID {
            return Err(CreateError::WrongParam);
        }

        // Build the free list, first block at the head.
        let base = storage.as_mut_ptr() as *mut usize;
        let mut head: *mut usize = core::ptr::null_mut();
        for i in (0..capacity).rev() {
            // Safety: `i * words_per_block` stays within `storage`
            let block = unsafe { base.add(i * words_per_block) };
            unsafe { block.write(head as usize) };
            head = block;
        }

        self.block_size
            .replace(&mut *lock, words_per_block * size_of::<usize>());
        self.capacity.replace(&mut *lock, capacity as u32);
        self.free_count.replace(&mut *lock, capacity as u32);
        self.free_head
            .replace(&mut *lock, Some(BlockPtr(head as *mut u8)));
        self.ident.replace(&mut *lock, ObjectId::MEMORY_POOL);

        Ok(capacity as u32)
    }

    fn pop_free(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<NonNull<u8>> {
        let head = self.free_head.get(&*lock)?;
        // Safety: free blocks store the address of their successor in
        // their first word
        let next = unsafe { (head.0 as *mut usize).read() } as *mut u8;
        self.free_head
            .replace(&mut *lock, NonNull::new(next).map(|p| BlockPtr(p.as_ptr())));
        self.free_count.replace_with(&mut *lock, |n| *n - 1);
        NonNull::new(head.0)
    }

    fn push_free(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, block: NonNull<u8>) {
        let head = self.free_head.get(&*lock);
        let next = head.map_or(core::ptr::null_mut(), |b| b.0);
        // Safety: the block belongs to the pool's storage
        unsafe { (block.as_ptr() as *mut usize).write(next as usize) };
        self.free_head
            .replace(&mut *lock, Some(BlockPtr(block.as_ptr())));
        self.free_count.replace_with(&mut *lock, |n| *n + 1);
    }

    /// Take one block, waiting up to `timeout` when the pool is empty.
    ///
    /// With `Timeout::Poll` this is legal from interrupt context.
    pub fn get(&'static self, timeout: Timeout) -> Result<NonNull<u8>, AcquireError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MEMORY_POOL {
            return Err(AcquireError::NoExist);
        }
        if !timeout.is_poll() {
            kernel::expect_waitable_context::<Traits>(lock.borrow_mut())?;
        }

        if let Some(block) = self.pop_free(lock.borrow_mut()) {
            return Ok(block);
        }

        if timeout.is_poll() {
            return Err(AcquireError::Timeout);
        }

        wait::enter_wait(
            lock.borrow_mut(),
            Some(&self.wait_queue),
            WaitPayload::PoolGet,
            timeout,
        );
        drop(lock);

        match wait::finish::<Traits>() {
            // The releaser handed its block directly to us.
            Ok(WaitValue::Block(b)) => Ok(NonNull::new(b.0).unwrap()),
            Ok(_) => unreachable!(),
            Err(e) => Err(e.into()),
        }
    }

    /// Return one block: hand it directly to the longest-waiting thread if
    /// any, otherwise push it onto the free list. Legal from interrupt
    /// context.
    pub fn release(&'static self, block: NonNull<u8>) -> Result<(), ReleaseError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MEMORY_POOL {
            return Err(ReleaseError::NoExist);
        }

        if let Some(w) = self.wait_queue.front(lock.borrow_mut()) {
            wait::exit_wait(
                lock.borrow_mut(),
                w,
                Ok(WaitValue::Block(BlockPtr(block.as_ptr()))),
            );
            return Ok(());
        }

        if self.free_count.get(&*lock) >= self.capacity.get(&*lock) {
            return Err(ReleaseError::Overflow);
        }
        self.push_free(lock.borrow_mut(), block);
        Ok(())
    }

    /// Get the total number of blocks.
    pub fn capacity(&'static self) -> Result<u32, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MEMORY_POOL {
            return Err(QueryError::NoExist);
        }
        Ok(self.capacity.get(&*lock))
    }

    /// Get the block size, in bytes.
    pub fn block_size(&'static self) -> Result<usize, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MEMORY_POOL {
            return Err(QueryError::NoExist);
        }
        Ok(self.block_size.get(&*lock))
    }

    /// Get the number of free blocks.
    pub fn free_count(&'static self) -> Result<u32, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MEMORY_POOL {
            return Err(QueryError::NoExist);
        }
        Ok(self.free_count.get(&*lock))
    }

    /// Delete the pool, waking every waiter with a *deleted* result.
    pub fn delete(&'static self) -> Result<(), DeleteError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MEMORY_POOL {
            return Err(DeleteError::NoExist);
        }

        self.wait_queue.wake_all_deleted(lock.borrow_mut());
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
    use crate::wait::WaitValue;

    fn pool_storage(words: usize) -> &'static mut [MaybeUninit<usize>] {
        Box::leak(vec![MaybeUninit::new(0usize); words].into_boxed_slice())
    }

    #[test]
    fn create_computes_capacity() {
        define_test_kernel!(Sys);
        static POOL: MemoryPoolCb<Sys> = MemoryPoolCb::new();
        test_port::boot::<Sys>();

        // 10-byte blocks round up to a whole number of words
        let words_per_block =
            (10 + core::mem::size_of::<usize>() - 1) / core::mem::size_of::<usize>();
        let capacity = POOL.create(pool_storage(16), 10).unwrap();
        assert_eq!(capacity as usize, 16 / words_per_block);
        assert_eq!(POOL.capacity().unwrap(), capacity);
        assert_eq!(POOL.free_count().unwrap(), capacity);
        assert_eq!(POOL.block_size().unwrap() % core::mem::size_of::<usize>(), 0);
    }

    #[test]
    fn get_and_release_round_trip() {
        define_test_kernel!(Sys);
        static POOL: MemoryPoolCb<Sys> = MemoryPoolCb::new();
        test_port::boot::<Sys>();
        POOL.create(pool_storage(8), 8).unwrap();
        let free = POOL.free_count().unwrap();

        let block = POOL.get(Timeout::Poll).unwrap();
        assert_eq!(POOL.free_count().unwrap(), free - 1);
        POOL.release(block).unwrap();
        assert_eq!(POOL.free_count().unwrap(), free);

        // LIFO reuse: the block just released comes back first
        assert_eq!(POOL.get(Timeout::Poll).unwrap(), block);
        POOL.release(block).unwrap();
    }

    #[test]
    fn exhaustion_and_overflow() {
        define_test_kernel!(Sys);
        static POOL: MemoryPoolCb<Sys> = MemoryPoolCb::new();
        test_port::boot::<Sys>();
        POOL.create(pool_storage(2), 8).unwrap();
        assert_eq!(POOL.capacity().unwrap(), 2);

        let a = POOL.get(Timeout::Poll).unwrap();
        let b = POOL.get(Timeout::Poll).unwrap();
        assert_eq!(POOL.get(Timeout::Poll), Err(AcquireError::Timeout));

        POOL.release(a).unwrap();
        POOL.release(b).unwrap();
        assert_eq!(POOL.release(a), Err(ReleaseError::Overflow));
    }

    /// A released block bypasses the free list and goes straight to the
    /// head waiter.
    #[test]
    fn release_hands_block_to_waiter() {
        define_test_kernel!(Sys);
        static POOL: MemoryPoolCb<Sys> = MemoryPoolCb::new();
        static A: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        POOL.create(pool_storage(1), 8).unwrap();
        thread::create::<Sys>(
            &A,
            Some("a"),
            test_port::noop_entry,
            0,
            test_port::test_stack(),
            5,
            ThreadOptions::START_ON_CREATE,
        )
        .unwrap();
        test_port::park_timer_thread::<Sys>();

        let block = POOL.get(Timeout::Poll).unwrap();

        // A (current) blocks on the empty pool
        let _ = POOL.get(Timeout::Forever);
        test_port::commit_switch::<Sys>();
        assert_eq!(thread::state::<Sys>(&A).unwrap(), ThreadState::BLOCKED);

        POOL.release(block).unwrap();
        assert!(thread::state::<Sys>(&A).unwrap().intersects(ThreadState::READY | ThreadState::RUNNING));
        match test_port::wait_result::<Sys>(&A) {
            Ok(WaitValue::Block(b)) => assert_eq!(b.0, block.as_ptr()),
            other => panic!("unexpected wait result: {other:?}"),
        }
        // The handoff never touched the free list
        assert_eq!(POOL.free_count().unwrap(), 0);
    }

    #[test]
    fn delete_wakes_waiters() {
        define_test_kernel!(Sys);
        static POOL: MemoryPoolCb<Sys> = MemoryPoolCb::new();
        static A: ThreadCb<Sys> = ThreadCb::new();
        test_port::boot::<Sys>();
        POOL.create(pool_storage(1), 8).unwrap();
        thread::create::<Sys>(
            &A,
            Some("a"),
            test_port::noop_entry,
            0,
            test_port::test_stack(),
            5,
            ThreadOptions::START_ON_CREATE,
        )
        .unwrap();
        test_port::park_timer_thread::<Sys>();

        let _block = POOL.get(Timeout::Poll).unwrap();
        let _ = POOL.get(Timeout::Forever);
        test_port::commit_switch::<Sys>();

        POOL.delete().unwrap();
        assert_eq!(test_port::wait_result::<Sys>(&A), Err(WaitError::Deleted));
        assert_eq!(POOL.get(Timeout::Poll), Err(AcquireError::NoExist));
    }
}
