//! Mutexes with priority inheritance.
//!
//! The owner of a contended mutex is boosted to the urgency of its most
//! urgent waiter, transitively along the chain of owners blocked on other
//! inheritance mutexes, and restored when the boost's cause goes away.
//! This bounds priority inversion to the critical sections themselves.
use core::fmt;

use crate::{
    error::{CreateError, DeleteError, LockError, UnlockError},
    kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    thread::{self, ThreadRef},
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticLink},
        Init, ObjectId,
    },
    wait::{self, WaitPayload, WaitQueue, WaitValue},
    KernelTraits, PortThreading, Priority, Timeout,
};

/// Get a `ListAccessorCell` used to access a thread's held-mutex list.
macro_rules! held_list {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |m: &MutexCb<_>| &m.held_link, $key)
    };
}

pub(crate) type MutexRef<Traits> = Ident<&'static MutexCb<Traits>>;

/// Recursion attribute of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexAttr {
    /// Re-locking by the owner fails with `Overflow`.
    NonRecursive,
    /// The owner may re-lock; the mutex is released when the recursion
    /// count returns to zero.
    Recursive,
}

impl Init for MutexAttr {
    const INIT: Self = Self::NonRecursive;
}

/// *Mutex control block*. The caller supplies the storage; `create`
/// initializes it.
pub struct MutexCb<Traits: PortThreading> {
    pub(crate) ident: CpuLockCell<Traits, ObjectId>,
    pub(crate) attr: CpuLockCell<Traits, MutexAttr>,
    pub(crate) owner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    pub(crate) recursion: CpuLockCell<Traits, u32>,
    pub(crate) wait_queue: WaitQueue<Traits>,

    /// Link in the owner's held-mutex list.
    pub(crate) held_link: CpuLockCell<Traits, Option<StaticLink<MutexCb<Traits>>>>,
}

impl<Traits: PortThreading> Init for MutexCb<Traits> {
    const INIT: Self = Self {
        ident: Init::INIT,
        attr: Init::INIT,
        owner: Init::INIT,
        recursion: Init::INIT,
        wait_queue: Init::INIT,
        held_link: Init::INIT,
    };
}

impl<Traits: PortThreading> MutexCb<Traits> {
    /// Construct the constant initial value for a `static`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("recursion", &self.recursion)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    pub(crate) fn owner(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ThreadRef<Traits>> {
        self.owner.get(&*lock)
    }

    /// Initialize the mutex in the caller-supplied control block.
    pub fn create(&'static self, attr: MutexAttr) -> Result<(), CreateError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::INVALID {
            return Err(CreateError::WrongParam);
        }

        self.attr.replace(&mut *lock, attr);
        self.owner.replace(&mut *lock, None);
        self.recursion.replace(&mut *lock, 0);
        self.ident.replace(&mut *lock, ObjectId::MUTEX);
        Ok(())
    }

    /// Acquire the mutex, waiting up to `timeout` while another thread
    /// owns it. Waiters queue FIFO; while any thread waits, the owner is
    /// boosted per the inheritance protocol.
    pub fn lock(&'static self, timeout: Timeout) -> Result<(), LockError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MUTEX {
            return Err(LockError::NoExist);
        }

        let curr = match Traits::state().run.get(&*lock).current {
            Some(t) => t,
            None => return Err(LockError::IllegalContext),
        };

        match self.owner.get(&*lock) {
            None => {
                grant(lock.borrow_mut(), self, curr);
                Ok(())
            }
            Some(owner) if owner == curr => {
                if self.attr.get(&*lock) == MutexAttr::Recursive {
                    self.recursion
                        .replace_with(&mut *lock, |n| n.wrapping_add(1));
                    Ok(())
                } else {
                    Err(LockError::Overflow)
                }
            }
            Some(_) => {
                if timeout.is_poll() {
                    return Err(LockError::Timeout);
                }
                kernel::expect_waitable_context::<Traits>(lock.borrow_mut())?;

                wait::enter_wait(
                    lock.borrow_mut(),
                    Some(&self.wait_queue),
                    WaitPayload::Mutex(self),
                    timeout,
                );
                // The new waiter may raise the owner's effective priority,
                // transitively along the ownership chain.
                reevaluate_owner_priority(lock.borrow_mut(), self);
                drop(lock);

                wait::finish::<Traits>().map(|_| ()).map_err(Into::into)
            }
        }
    }

    /// Release the mutex. Ownership passes to the longest-waiting thread,
    /// if any; the caller's effective priority is restored.
    pub fn unlock(&'static self) -> Result<(), UnlockError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MUTEX {
            return Err(UnlockError::NoExist);
        }

        let curr = match Traits::state().run.get(&*lock).current {
            Some(t) => t,
            None => return Err(UnlockError::IllegalContext),
        };

        if self.owner.get(&*lock) != Some(curr) {
            return Err(UnlockError::IllegalUse);
        }

        let recursion = self.recursion.get(&*lock) - 1;
        self.recursion.replace(&mut *lock, recursion);
        if recursion > 0 {
            return Ok(());
        }

        held_list!(&curr.0.held_mutexes, lock.borrow_mut()).remove(Ident(self));

        // Restore the caller's effective priority now that this mutex no
        // longer contributes waiters.
        let effective = effective_priority(lock.borrow_mut(), curr);
        thread::apply_priority(lock.borrow_mut(), curr, effective);

        transfer_or_clear(lock.borrow_mut(), self);
        Ok(())
    }

    /// Delete the mutex, waking every waiter with a *deleted* result. If
    /// owned, the owner's held list and effective priority are fixed up.
    pub fn delete(&'static self) -> Result<(), DeleteError> {
        kernel::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        if self.ident.get(&*lock) != ObjectId::MUTEX {
            return Err(DeleteError::NoExist);
        }

        self.wait_queue.wake_all_deleted(lock.borrow_mut());

        if let Some(owner) = self.owner.get(&*lock) {
            held_list!(&owner.0.held_mutexes, lock.borrow_mut()).remove(Ident(self));
            self.owner.replace(&mut *lock, None);
            self.recursion.replace(&mut *lock, 0);

            let effective = effective_priority(lock.borrow_mut(), owner);
            thread::apply_priority(lock.borrow_mut(), owner, effective);
        }

        self.ident.replace(&mut *lock, ObjectId::INVALID);
        Ok(())
    }
}

/// Give the ownership of the mutex to `t` and link the mutex onto `t`'s
/// held list.
fn grant<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    m: &'static MutexCb<Traits>,
    t: ThreadRef<Traits>,
) {
    m.owner.replace(&mut *lock, Some(t));
    m.recursion.replace(&mut *lock, 1);
    held_list!(&t.0.held_mutexes, lock.borrow_mut()).push_back(Ident(m));
}

/// Pass the ownership to the head waiter, or clear it when no one waits.
fn transfer_or_clear<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    m: &'static MutexCb<Traits>,
) {
    if let Some(w) = m.wait_queue.front(lock.borrow_mut()) {
        // The new owner is recorded before the wakeup so that the waiter
        // unlink logic recognizes the transfer.
        grant(lock.borrow_mut(), m, w);
        wait::exit_wait(lock, w, Ok(WaitValue::None));
    } else {
        m.owner.replace(&mut *lock, None);
        m.recursion.replace(&mut *lock, 0);
    }
}

/// The effective priority of `t` under the inheritance protocol: the
/// maximum urgency among its base priority and every waiter of every mutex
/// it holds.
pub(crate) fn effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
) -> Priority {
    let mut priority = t.0.base_priority.get(&*lock);

    // Walk the circular held list manually; the wait-queue scans below
    // need the token for their own accessors.
    let head = t.0.held_mutexes.get(&*lock);
    if let Some(first) = head.first {
        let mut cursor = first;
        loop {
            if let Some(p) = cursor.0.wait_queue.min_waiter_priority(lock.borrow_mut()) {
                priority = priority.min(p);
            }
            let link = cursor.0.held_link.get(&*lock).unwrap();
            if link.next == first {
                break;
            }
            cursor = link.next;
        }
    }

    priority
}

/// Recompute and apply the owner's effective priority after its set of
/// waiters changed. Propagates along the ownership chain through
/// `thread::apply_priority`.
pub(crate) fn reevaluate_owner_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    m: &'static MutexCb<Traits>,
) {
    if let Some(owner) = m.owner.get(&*lock) {
        let effective = effective_priority(lock.borrow_mut(), owner);
        thread::apply_priority(lock, owner, effective);
    }
}

/// Release every mutex held by a terminating thread, most recently
/// acquired first. Waiters are woken with an `Ok` result and become the
/// new owners.
pub(crate) fn release_all_held<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    t: ThreadRef<Traits>,
) {
    loop {
        let m = held_list!(&t.0.held_mutexes, lock.borrow_mut()).pop_back();
        let m = match m {
            Some(m) => m,
            None => break,
        };
        transfer_or_clear(lock.borrow_mut(), m.0);
    }
}
