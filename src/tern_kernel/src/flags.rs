//! Event flags.
use core::fmt;

use crate::{
    error::{CreateError, DeleteError, FlagsUpdateError, FlagsWaitError, QueryError},
    kernel,
    klock::{self, CpuLockCell},
    utils::{Init, ObjectId},
    wait::{self, WaitPayload, WaitQueue, WaitValue},
    KernelTraits, PortThreading, Timeout,
};

bitflags::bitflags! {
    /// How a flag pattern satisfies a wait.
    pub struct FlagsWaitOptions: u8 {
        /// All bits of the pattern must be set (default: any bit).
        const ALL = 1 << 0;
        /// Consume the pattern bits when the wait is satisfied.
        const CLEAR = 1 << 1;
    }
}

/// *Event-flags control block*. The caller supplies the storage; `create`
/// initializes it.
pub struct EventFlagsCb<Traits: PortThreading> {
    pub(crate) ident: CpuLockCell<Traits, ObjectId>,
    pub(crate) bits: CpuLockCell<Traits, u32>,
    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for EventFlagsCb<Traits> {
    const INIT: Self = Self {
        ident: Init::INIT,
        bits: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> EventFlagsCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for EventFlagsCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventFlagsCb")
            .field("self", &(self as *const _))
            .field("bits", &self.bits)
            .finish_non_exhaustive()
    }
}

/// Given a wait condition `(pattern, options)`, check if `value` satisfies
/// it. On success, consume the pattern bits when requested and return the
/// value as observed at the moment of satisfaction.
fn poll_core(value: &mut u32, pattern: u32, options: FlagsWaitOptions) -> Option<u32> {
    let satisfied = if options.contains(FlagsWaitOptions::ALL) {
        (*value & pattern) == pattern
    } else {
        (*value & pattern) != 0
    };

    if satisfied {
        let original = *value;
        if options.contains(FlagsWaitOptions::CLEAR) {
            *value &= !pattern;
        }
        Some(original)
    } else {
        None
    }
}

impl<Traits: KernelTraits> EventFlagsCb<Traits> {
    /// Initialize the event flags in the caller-supplied control block.
    pub fn create(&'static self, initial: u32) -> Result<(), CreateError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::INVALID {
            return Err(CreateError::WrongParam);
        }

        self.bits.replace(&mut *lock, initial);
        self.ident.replace(&mut *lock, ObjectId::FLAGS);
        Ok(())
    }

    /// Set the given bits, then complete every waiter whose condition the
    /// new value satisfies (in queue order; a consuming waiter may thereby
    /// hide the bits from those behind it). Returns the value after all
    /// wakeups. Legal from interrupt context.
    pub fn set(&'static self, bits: u32) -> Result<u32, FlagsUpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::FLAGS {
            return Err(FlagsUpdateError::NoExist);
        }

        let mut value = self.bits.get(&*lock) | bits;

        let mut cursor = self.wait_queue.front(lock.borrow_mut());
        while let Some(t) = cursor {
            // Find the successor before a wakeup unlinks `t`.
            cursor = self.wait_queue.next(lock.borrow_mut(), t);

            if let WaitPayload::Flags { pattern, options } = t.0.wait.payload.get(&*lock) {
                if let Some(original) = poll_core(&mut value, pattern, options) {
                    wait::exit_wait(lock.borrow_mut(), t, Ok(WaitValue::Flags(original)));
                }
            }
        }

        self.bits.replace(&mut *lock, value);
        Ok(value)
    }

    /// Clear the given bits. Returns the value before clearing. Legal from
    /// interrupt context.
    pub fn clear(&'static self, bits: u32) -> Result<u32, FlagsUpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::FLAGS {
            return Err(FlagsUpdateError::NoExist);
        }

        let previous = self.bits.get(&*lock);
        self.bits.replace(&mut *lock, previous & !bits);
        Ok(previous)
    }

    /// Get the current value.
    pub fn get(&'static self) -> Result<u32, QueryError> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::FLAGS {
            return Err(QueryError::NoExist);
        }
        Ok(self.bits.get(&*lock))
    }

    /// Wait until the flags satisfy `(pattern, options)`. Returns the
    /// value as observed at the moment of satisfaction.
    pub fn wait(
        &'static self,
        pattern: u32,
        options: FlagsWaitOptions,
        timeout: Timeout,
    ) -> Result<u32, FlagsWaitError> {
        if pattern == 0 {
            return Err(FlagsWaitError::WrongParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::FLAGS {
            return Err(FlagsWaitError::NoExist);
        }
        if !timeout.is_poll() {
            kernel::expect_waitable_context::<Traits>(lock.borrow_mut())?;
        }

        if let Some(original) = poll_core(self.bits.write(&mut *lock), pattern, options) {
            return Ok(original);
        }

        if timeout.is_poll() {
            return Err(FlagsWaitError::Timeout);
        }

        wait::enter_wait(
            lock.borrow_mut(),
            Some(&self.wait_queue),
            WaitPayload::Flags { pattern, options },
            timeout,
        );
        drop(lock);

        match wait::finish::<Traits>() {
            Ok(WaitValue::Flags(original)) => Ok(original),
            Ok(_) => unreachable!(),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the event flags, waking every waiter with a *deleted*
    /// result.
    pub fn delete(&'static self) -> Result<(), DeleteError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::FLAGS {
            return Err(DeleteError::NoExist);
        }

        self.wait_queue.wake_all_deleted(lock.borrow_mut());
        self.ident.replace(&mut *lock, ObjectId::INVALID);
        Ok(())
    }
}
