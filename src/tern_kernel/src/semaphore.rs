//! Counting semaphores.
use core::fmt;

use crate::{
    error::{AcquireError, CreateError, DeleteError, QueryError, ReleaseError},
    kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    utils::{Init, ObjectId},
    wait::{self, WaitPayload, WaitQueue, WaitValue},
    KernelTraits, PortThreading, Timeout,
};

/// *Semaphore control block* - the state data of a counting semaphore. The
/// caller supplies the storage; `create` initializes it.
pub struct SemaphoreCb<Traits: PortThreading> {
    pub(crate) ident: CpuLockCell<Traits, ObjectId>,
    pub(crate) count: CpuLockCell<Traits, u32>,
    pub(crate) max: CpuLockCell<Traits, u32>,
    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for SemaphoreCb<Traits> {
    const INIT: Self = Self {
        ident: Init::INIT,
        count: Init::INIT,
        max: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> SemaphoreCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    pub(crate) fn initialize(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        initial: u32,
        max: u32,
    ) {
        self.count.replace(&mut *lock, initial);
        self.max.replace(&mut *lock, max);
        self.ident.replace(&mut *lock, ObjectId::SEMAPHORE);
    }

    /// Initialize the semaphore in the caller-supplied control block.
    pub fn create(&'static self, initial: u32, max: u32) -> Result<(), CreateError> {
        kernel::expect_thread_context::<Traits>()?;
        if max == 0 || initial > max {
            return Err(CreateError::WrongParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::INVALID {
            return Err(CreateError::WrongParam);
        }

        self.initialize(lock.borrow_mut(), initial, max);
        Ok(())
    }

    /// Acquire one permit, waiting up to `timeout` when none is available.
    ///
    /// With `Timeout::Poll` this is legal from interrupt context.
    pub fn acquire(&'static self, timeout: Timeout) -> Result<(), AcquireError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::SEMAPHORE {
            return Err(AcquireError::NoExist);
        }
        if !timeout.is_poll() {
            kernel::expect_waitable_context::<Traits>(lock.borrow_mut())?;
        }

        let count = self.count.get(&*lock);
        if count > 0 {
            self.count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        if timeout.is_poll() {
            return Err(AcquireError::Timeout);
        }

        wait::enter_wait(
            lock.borrow_mut(),
            Some(&self.wait_queue),
            WaitPayload::Semaphore,
            timeout,
        );
        drop(lock);

        wait::finish::<Traits>().map(|_| ()).map_err(Into::into)
    }

    /// Release one permit: wake the longest-waiting thread if any,
    /// otherwise increment the count. Legal from interrupt context.
    pub fn release(&'static self) -> Result<(), ReleaseError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::SEMAPHORE {
            return Err(ReleaseError::NoExist);
        }

        if let Some(w) = self.wait_queue.front(lock.borrow_mut()) {
            wait::exit_wait(lock.borrow_mut(), w, Ok(WaitValue::None));
            return Ok(());
        }

        let count = self.count.get(&*lock);
        if count >= self.max.get(&*lock) {
            return Err(ReleaseError::Overflow);
        }
        self.count.replace(&mut *lock, count + 1);
        Ok(())
    }

    /// Release from the tick handler, never failing: an extra release
    /// beyond `max` is simply dropped.
    pub(crate) fn release_from_tick(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        if let Some(w) = self.wait_queue.front(lock.borrow_mut()) {
            wait::exit_wait(lock, w, Ok(WaitValue::None));
            return;
        }
        let count = self.count.get(&*lock);
        if count < self.max.get(&*lock) {
            self.count.replace(&mut *lock, count + 1);
        }
    }

    /// Get the current count.
    pub fn count(&'static self) -> Result<u32, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::SEMAPHORE {
            return Err(QueryError::NoExist);
        }
        Ok(self.count.get(&*lock))
    }

    /// Delete the semaphore, waking every waiter with a *deleted* result.
    pub fn delete(&'static self) -> Result<(), DeleteError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::SEMAPHORE {
            return Err(DeleteError::NoExist);
        }

        self.wait_queue.wake_all_deleted(lock.borrow_mut());
        self.ident.replace(&mut *lock, ObjectId::INVALID);
        Ok(())
    }
}
